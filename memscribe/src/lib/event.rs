use crate::ffi::*;
use std::fmt;

/// Every request type that ends up in the log.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Op {
    Malloc,
    Free,
    Realloc,
    Calloc,
    MemAlign,
    PosixMemAlign,
    Valloc,
    AlignedAlloc,
}

impl Op {
    pub fn name(&self) -> &'static str {
        match self {
            Op::Malloc          => "malloc",
            Op::Free            => "free",
            Op::Realloc         => "realloc",
            Op::Calloc          => "calloc",
            Op::MemAlign        => "memalign",
            Op::PosixMemAlign   => "posix_memalign",
            Op::Valloc          => "valloc",
            Op::AlignedAlloc    => "aligned_alloc",
        }
    }
}

/// One observed allocation or de-allocation. Lives only until it
/// has been written out.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Event {
    pub op:     Op,
    pub size:   usize,
    pub ptr:    usize,
}

impl Event {
    #[inline(always)]
    pub fn new(op: Op, size: size_t, ptr: *const void) -> Self {
        Self { op, size, ptr: ptr as usize }
    }

    #[inline(always)]
    pub fn free(ptr: *const void) -> Self {
        Self::new(Op::Free, 0, ptr)
    }
}

impl fmt::Display for Event {
    /// The data line of a record: `<op> <size>B <ptr as signed decimal>`.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}B {}", self.op.name(), self.size, self.ptr as isize)
    }
}

/// Processor time consumed by the process so far, in seconds.
pub fn timestamp() -> f64 {
    let mut ts: libc::timespec = unsafe { std::mem::zeroed() };
    // Cannot fail for this clock id; a zeroed value is printed otherwise.
    unsafe { libc::clock_gettime(libc::CLOCK_PROCESS_CPUTIME_ID, &mut ts) };
    ts.tv_sec as f64 + ts.tv_nsec as f64 / 1e9
}
