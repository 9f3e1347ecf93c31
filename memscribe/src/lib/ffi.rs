// C-reminiscent types.
pub type size_t     = libc::size_t;
pub type void       = libc::c_void;
pub type int        = libc::c_int;
type char           = libc::c_char;

// Linux utils.
pub use libc::{
    RTLD_NEXT,
    EXIT_FAILURE,
    dlsym,
    dlerror,
    fputs,
    exit,
};

// Type aliases for the several interposed functions.
pub type CMalloc        = unsafe extern "C" fn(size: size_t)                        -> *mut void;
pub type CFree          = unsafe extern "C" fn(p: *mut void);
pub type CCalloc        = unsafe extern "C" fn(nobj: size_t, size: size_t)          -> *mut void;
pub type CRealloc       = unsafe extern "C" fn(p: *mut void, size: size_t)          -> *mut void;
pub type CMemalign      = unsafe extern "C" fn(align: size_t, size: size_t)         -> *mut void;
pub type CPosixMemalign = unsafe extern "C" fn( memptr: *mut *mut void,
                                                align:  size_t,
                                                size:   size_t)                     -> int;
pub type CValloc        = unsafe extern "C" fn(size: size_t)                        -> *mut void;
pub type CAlignedAlloc  = unsafe extern "C" fn(alignment: size_t, size: size_t)     -> *mut void;

pub fn graceful_exit(err_msg: impl std::fmt::Display) -> ! {
    //! Prints some error message on stderr, then
    //! exits with non-zero code.
    //!
    //! `exit` runs the finalize hook, so callers must
    //! not hold the sink lock when reaching this point.
    //! Formatting goes straight to stderr, no allocation.

    eprintln!("memscribe: {}", err_msg);
    unsafe { exit(EXIT_FAILURE) }
}

pub unsafe fn report_dlerror() {
    //! Forwards the pending `dlsym` diagnostic, if any,
    //! to the C stderr stream.
    use libc_stdhandle::stderr;

    let eptr: *mut char = dlerror();
    if !eptr.is_null() {
        fputs(eptr as *const char, stderr());
        fputs(c"\n".as_ptr(), stderr());
    }
}
