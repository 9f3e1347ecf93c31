#![cfg_attr(test, allow(dead_code))]

use crate::bootstrap::ARENA;
use crate::config::Config;
use crate::error::TraceError;
use crate::ffi::*;
use crate::resolve::REAL;
use crate::sink::{Journal, Sink};
use crate::stack::Backtracer;
use crate::tracer::Tracer;
use std::fs::File;
use std::io::BufWriter;
use std::ptr;

type LogFile = BufWriter<File>;

pub static TRACER: Tracer<LogFile, Backtracer> = Tracer::new(Sink::new(Backtracer, &open_log));

fn open_log() -> Result<Journal<LogFile>, TraceError> {
    //! Creates the trace file (or opens and truncates it).
    //! Also enhances writing with a buffer.
    let cfg = Config::get();
    let file = File::create(cfg.log_path)
        .map_err(|source| TraceError::LogUnavailable { path: cfg.log_path, source })?;

    Ok(Journal { out: BufWriter::new(file), skip: cfg.skip })
}

fn page_size() -> usize {
    match unsafe { libc::sysconf(libc::_SC_PAGESIZE) } {
        n if n > 0  => n as usize,
        _           => 4096,
    }
}

#[cfg_attr(not(test), no_mangle)]
/// Function interposition is used to catch all dynamic memory
/// allocation functions.
///
/// Every entry point binds the true implementation on first use, forwards
/// the request to it unchanged, and logs it unless the request comes from
/// the tracer itself. Requests the dynamic linker makes while a primitive
/// is being bound are served from the bootstrap arena.
///
/// This logic holds across all 8 supported functions.
pub unsafe extern "C"
fn malloc(size: size_t) -> *mut void {
    match TRACER.bind(&REAL.malloc) {
        Some(real)  => TRACER.malloc(real, size),
        None        => ARENA.alloc(size, 0),
    }
}

#[cfg_attr(not(test), no_mangle)]
pub unsafe extern "C"
fn free(p: *mut void) {
    if ARENA.owns(p) {
        // Arena blocks are never reused.
        return;
    }
    if let Some(real) = TRACER.bind(&REAL.free) {
        TRACER.free(real, p);
    }
    // Otherwise the block is released from inside `dlsym` before `free`
    // could be bound; leaking it is the only safe option.
}

#[cfg_attr(not(test), no_mangle)]
pub unsafe extern "C"
fn realloc(p: *mut void, size: size_t) -> *mut void {
    if ARENA.owns(p) {
        // Not an application block: move it out silently.
        return ARENA.relocate(p, size, |n| match TRACER.bind(&REAL.malloc) {
            Some(real)  => real(n),
            None        => ARENA.alloc(n, 0),
        });
    }
    match TRACER.bind(&REAL.realloc) {
        Some(real)  => TRACER.realloc(real, p, size),
        None if p.is_null() => ARENA.alloc(size, 0),
        // A foreign block cannot be resized without the true `realloc`.
        None        => ptr::null_mut(),
    }
}

#[cfg_attr(not(test), no_mangle)]
pub unsafe extern "C"
fn calloc(nobj: size_t, size: size_t) -> *mut void {
    match TRACER.bind(&REAL.calloc) {
        Some(real)  => TRACER.calloc(real, nobj, size),
        // `dlsym` calls `calloc` internally--avoid infinite recursion.
        None        => match nobj.checked_mul(size) {
            Some(total) => ARENA.alloc(total, 0),
            None        => ptr::null_mut(),
        },
    }
}

#[cfg_attr(not(test), no_mangle)]
pub unsafe extern "C"
fn memalign(alignment: size_t, size: size_t) -> *mut void {
    match TRACER.bind(&REAL.memalign) {
        Some(real)  => TRACER.memalign(real, alignment, size),
        None        => ARENA.alloc(size, alignment),
    }
}

#[cfg_attr(not(test), no_mangle)]
pub unsafe extern "C"
fn posix_memalign(memptr: *mut *mut void, alignment: size_t, size: size_t) -> int {
    match TRACER.bind(&REAL.posix_memalign) {
        Some(real)  => TRACER.posix_memalign(real, memptr, alignment, size),
        None        => {
            let p = ARENA.alloc(size, alignment);
            if p.is_null() {
                return libc::ENOMEM;
            }
            *memptr = p;
            0
        },
    }
}

#[cfg_attr(not(test), no_mangle)]
pub unsafe extern "C"
fn valloc(size: size_t) -> *mut void {
    match TRACER.bind(&REAL.valloc) {
        Some(real)  => TRACER.valloc(real, size),
        None        => ARENA.alloc(size, page_size()),
    }
}

#[cfg_attr(not(test), no_mangle)]
pub unsafe extern "C"
fn aligned_alloc(alignment: size_t, size: size_t) -> *mut void {
    match TRACER.bind(&REAL.aligned_alloc) {
        Some(real)  => TRACER.aligned_alloc(real, alignment, size),
        None        => ARENA.alloc(size, alignment),
    }
}
