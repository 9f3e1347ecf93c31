//! Static memory for requests that arrive while `dlsym` is running.
//!
//! `dlsym` may call `calloc`/`malloc` behind the scenes. If the very
//! primitive being resolved is asked for memory, there is no true
//! implementation to forward to yet, and resolving again would recurse
//! forever. Such requests are carved out of a fixed buffer instead. The
//! buffer is bump-allocated and never recycled: its blocks are few, and
//! they are released only when the process exits.

use crate::ffi::*;
use std::cell::UnsafeCell;
use std::ptr;
use std::sync::atomic::{AtomicUsize, Ordering};

pub const ARENA_BYTES: usize = 8192;
const ALIGN: usize = 16;
// Each block is preceded by one aligned header word holding its size.
const HEADER: usize = ALIGN;

#[repr(C, align(16))]
pub struct Arena {
    buf:  UnsafeCell<[u8; ARENA_BYTES]>,
    next: AtomicUsize,
}

// Disjoint ranges are handed out through `next`.
unsafe impl Sync for Arena {}

impl Arena {
    pub const fn new() -> Self {
        Self {
            buf:  UnsafeCell::new([0; ARENA_BYTES]),
            next: AtomicUsize::new(0),
        }
    }

    fn base(&self) -> *mut u8 {
        self.buf.get() as *mut u8
    }

    /// Returns a zeroed block of `size` bytes aligned to `align` (at least
    /// 16), or null when the arena cannot fit it.
    pub fn alloc(&self, size: size_t, align: size_t) -> *mut void {
        let align = align.max(ALIGN);
        if !align.is_power_of_two() {
            return ptr::null_mut();
        }
        let base = self.base() as usize;
        let mut cur = self.next.load(Ordering::Relaxed);
        loop {
            // Alignment is about the absolute address, not the offset.
            let start = match (base + cur + HEADER).checked_next_multiple_of(align) {
                Some(s) => s - base,
                None => return ptr::null_mut(),
            };
            let end = match start.checked_add(size) {
                Some(e) if e <= ARENA_BYTES => e,
                _ => return ptr::null_mut(),
            };
            // Keep every block start 16-aligned for the next header.
            let next = end.next_multiple_of(ALIGN).min(ARENA_BYTES);
            match self.next.compare_exchange_weak(cur, next, Ordering::AcqRel, Ordering::Relaxed) {
                Ok(_) => unsafe {
                    let block = self.base().add(start);
                    (block.sub(HEADER) as *mut usize).write(size);
                    ptr::write_bytes(block, 0, size);
                    return block as *mut void;
                },
                Err(seen) => cur = seen,
            }
        }
    }

    pub fn owns(&self, p: *const void) -> bool {
        let base = self.base() as usize;
        let p = p as usize;
        p >= base && p < base + ARENA_BYTES
    }

    /// Size requested for a block handed out by this arena.
    ///
    /// # Safety
    ///
    /// `p` must have been returned by [`Arena::alloc`] on `self`.
    pub unsafe fn block_size(&self, p: *const void) -> usize {
        ((p as *const u8).sub(HEADER) as *const usize).read()
    }

    /// Moves an arena block into memory obtained from `alloc`. The old
    /// block stays where it is.
    ///
    /// # Safety
    ///
    /// `p` must have been returned by [`Arena::alloc`] on `self`.
    pub unsafe fn relocate<A>(&self, p: *mut void, size: size_t, alloc: A) -> *mut void
    where
        A: FnOnce(size_t) -> *mut void,
    {
        let fresh = alloc(size);
        if !fresh.is_null() {
            let keep = self.block_size(p).min(size);
            ptr::copy_nonoverlapping(p as *const u8, fresh as *mut u8, keep);
        }

        fresh
    }

    #[cfg(test)]
    pub fn used(&self) -> usize {
        self.next.load(Ordering::Acquire)
    }
}

pub static ARENA: Arena = Arena::new();
