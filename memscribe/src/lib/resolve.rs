//! Lazily bound addresses of the true allocator functions.
//!
//! One [`Slot`] per interposed primitive. A slot is written at most once
//! with a meaningful value, but the check-then-set is not serialized:
//! two threads racing on first use may both look the symbol up. That is
//! harmless since the dynamic linker hands out the same address both
//! times; the only requirement is that a published value never changes.

use crate::error::TraceError;
use crate::ffi::*;
use std::cell::Cell;
use std::ffi::CStr;
use std::marker::PhantomData;
use std::mem;
use std::ptr;
use std::sync::atomic::{AtomicPtr, Ordering};

thread_local! {
    // Set while this thread sits inside `dlsym`.
    static IN_DLSYM: Cell<bool> = const { Cell::new(false) };
}

/// A lazily-initialized, benign-race-tolerant function pointer cell.
/// `F` must be an `unsafe extern "C" fn` type.
pub struct Slot<F> {
    symbol: &'static CStr,
    addr:   AtomicPtr<void>,
    _f:     PhantomData<F>,
}

impl<F: Copy> Slot<F> {
    pub const fn new(symbol: &'static CStr) -> Self {
        assert!(mem::size_of::<F>() == mem::size_of::<*mut void>());
        Self {
            symbol,
            addr: AtomicPtr::new(ptr::null_mut()),
            _f:   PhantomData,
        }
    }

    pub fn name(&self) -> &'static str {
        self.symbol.to_str().unwrap_or("?")
    }

    #[inline(always)]
    pub fn get(&self) -> Option<F> {
        let addr = self.addr.load(Ordering::Acquire);
        if addr.is_null() {
            None
        } else {
            // SAFETY: only code addresses of type `F` are ever stored,
            // and `F` is pointer-sized (checked in `new`).
            Some(unsafe { mem::transmute_copy::<*mut void, F>(&addr) })
        }
    }

    /// Looks the symbol up through `lookup` unless it is already known.
    /// Concurrent callers may both run `lookup`; whichever stores first
    /// wins and everybody returns the published value.
    pub fn resolve_with<L>(&self, lookup: L) -> Result<F, TraceError>
    where
        L: FnOnce(&'static CStr) -> *mut void,
    {
        if let Some(f) = self.get() {
            return Ok(f);
        }
        let found = lookup(self.symbol);
        if found.is_null() {
            return Err(TraceError::Unresolved { symbol: self.name() });
        }
        // A racing thread may have published first; keep its value.
        let _ = self.addr.compare_exchange(
            ptr::null_mut(),
            found,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
        self.get().ok_or(TraceError::Unresolved { symbol: self.name() })
    }
}

/// Looks `symbol` up in the objects loaded after this one, so that the
/// interposer never finds itself.
pub fn dlsym_next(symbol: &'static CStr) -> *mut void {
    let found = inside_dlsym(|| unsafe { dlsym(RTLD_NEXT, symbol.as_ptr()) });
    if found.is_null() {
        // `dlerror` is thread-safe!
        // [source: https://man7.org/linux/man-pages/man3/dlerror.3.html#ATTRIBUTES]
        unsafe { report_dlerror() };
    }

    found
}

/// Runs `f` with the calling thread marked as inside `dlsym`.
pub fn inside_dlsym<R>(f: impl FnOnce() -> R) -> R {
    struct InDlsym;
    impl Drop for InDlsym {
        fn drop(&mut self) {
            IN_DLSYM.with(|f| f.set(false));
        }
    }

    IN_DLSYM.with(|f| f.set(true));
    let _mark = InDlsym;
    f()
}

/// True while the calling thread is inside [`dlsym_next`]. Allocations
/// requested by the dynamic linker during that window cannot be routed
/// to a primitive that is still unresolved.
#[inline(always)]
pub fn in_dlsym() -> bool {
    IN_DLSYM.with(|f| f.get())
}

/// Process-wide table of the true implementations.
pub struct RealAllocator {
    pub malloc:         Slot<CMalloc>,
    pub free:           Slot<CFree>,
    pub realloc:        Slot<CRealloc>,
    pub calloc:         Slot<CCalloc>,
    pub memalign:       Slot<CMemalign>,
    pub posix_memalign: Slot<CPosixMemalign>,
    pub valloc:         Slot<CValloc>,
    pub aligned_alloc:  Slot<CAlignedAlloc>,
}

impl RealAllocator {
    pub const fn new() -> Self {
        Self {
            malloc:         Slot::new(c"malloc"),
            free:           Slot::new(c"free"),
            realloc:        Slot::new(c"realloc"),
            calloc:         Slot::new(c"calloc"),
            memalign:       Slot::new(c"memalign"),
            posix_memalign: Slot::new(c"posix_memalign"),
            valloc:         Slot::new(c"valloc"),
            aligned_alloc:  Slot::new(c"aligned_alloc"),
        }
    }
}

pub static REAL: RealAllocator = RealAllocator::new();
