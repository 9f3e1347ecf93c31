//! What every interposed function does around the true one.
//!
//! The real call always happens first, with the caller's arguments,
//! and its result is handed back untouched. Only successful requests
//! issued by the application itself (not by the tracer's own book-keeping)
//! are logged.

use crate::error::TraceError;
use crate::event::{Event, Op};
use crate::ffi::*;
use crate::guard::Reentrancy;
use crate::resolve::{self, Slot};
use crate::sink::{Durable, Sink};
use crate::stack::StackCapture;
use std::ffi::CStr;

pub struct Tracer<W: 'static, S> {
    sink: Sink<W, S>,
}

impl<W: 'static, S> Tracer<W, S> {
    pub const fn new(sink: Sink<W, S>) -> Self {
        Self { sink }
    }

    #[cfg(test)]
    pub fn sink(&self) -> &Sink<W, S> {
        &self.sink
    }
}

impl<W: Durable + 'static, S: StackCapture> Tracer<W, S> {
    /// Returns the true implementation behind `slot`, binding it on first
    /// use and creating the trace file along the way. `None` means the
    /// request came from inside `dlsym` for a primitive that is itself
    /// still unbound, so nothing can be forwarded.
    #[inline(always)]
    pub fn bind<F: Copy>(&self, slot: &Slot<F>) -> Option<F> {
        self.bind_with(slot, resolve::dlsym_next)
    }

    #[inline(always)]
    pub fn bind_with<F, L>(&self, slot: &Slot<F>, lookup: L) -> Option<F>
    where
        F: Copy,
        L: FnOnce(&'static CStr) -> *mut void,
    {
        if let Some(f) = slot.get() {
            return Some(f);
        }
        if resolve::in_dlsym() {
            return None;
        }
        // Both `dlsym` and file creation allocate.
        let guard = Reentrancy::enter();
        let bound = slot.resolve_with(lookup).and_then(|f| {
            // A nested caller may be running inside the sink already.
            if !guard.is_nested() {
                self.sink.ensure_open()?;
            }
            Ok(f)
        });
        match bound {
            Ok(f)   => Some(f),
            Err(e)  => fatal(e),
        }
    }

    #[inline(always)]
    fn log(&self, events: &[Event]) {
        let guard = Reentrancy::enter();
        if guard.is_nested() {
            return;
        }
        if let Err(e) = self.sink.write_events(events) {
            fatal(e);
        }
    }

    #[inline(always)]
    pub unsafe fn malloc(&self, real: CMalloc, size: size_t) -> *mut void {
        let p = real(size);
        if !p.is_null() {
            self.log(&[Event::new(Op::Malloc, size, p)]);
        }
        p
    }

    #[inline(always)]
    pub unsafe fn free(&self, real: CFree, p: *mut void) {
        real(p);
        self.log(&[Event::free(p)]);
    }

    /// A successful `realloc` is logged as the new block followed by the
    /// release of the old one, in that order, as one unit.
    #[inline(always)]
    pub unsafe fn realloc(&self, real: CRealloc, p: *mut void, size: size_t) -> *mut void {
        let np = real(p, size);
        if !np.is_null() {
            self.log(&[Event::new(Op::Realloc, size, np), Event::free(p)]);
        }
        np
    }

    #[inline(always)]
    pub unsafe fn calloc(&self, real: CCalloc, nobj: size_t, size: size_t) -> *mut void {
        let p = real(nobj, size);
        if !p.is_null() {
            // Success implies the product fits.
            self.log(&[Event::new(Op::Calloc, nobj.saturating_mul(size), p)]);
        }
        p
    }

    #[inline(always)]
    pub unsafe fn memalign(&self, real: CMemalign, align: size_t, size: size_t) -> *mut void {
        let p = real(align, size);
        if !p.is_null() {
            self.log(&[Event::new(Op::MemAlign, size, p)]);
        }
        p
    }

    #[inline(always)]
    pub unsafe fn posix_memalign(
        &self,
        real:   CPosixMemalign,
        memptr: *mut *mut void,
        align:  size_t,
        size:   size_t,
    ) -> int {
        let ret = real(memptr, align, size);
        if ret == 0 {
            self.log(&[Event::new(Op::PosixMemAlign, size, *memptr)]);
        }
        ret
    }

    #[inline(always)]
    pub unsafe fn valloc(&self, real: CValloc, size: size_t) -> *mut void {
        let p = real(size);
        if !p.is_null() {
            self.log(&[Event::new(Op::Valloc, size, p)]);
        }
        p
    }

    #[inline(always)]
    pub unsafe fn aligned_alloc(&self, real: CAlignedAlloc, align: size_t, size: size_t) -> *mut void {
        let p = real(align, size);
        if !p.is_null() {
            self.log(&[Event::new(Op::AlignedAlloc, size, p)]);
        }
        p
    }

    /// Exit hook body: marker, sync, close.
    pub fn finalize(&self) {
        let guard = Reentrancy::enter();
        // A nested exit comes from `fatal` and this thread may still hold
        // the sink lock.
        let closed = if guard.is_nested() {
            self.sink.try_finish()
        } else {
            self.sink.finish()
        };
        if let Err(e) = closed {
            // Already exiting; all that is left is to complain.
            eprintln!("memscribe: {}", e);
        }
    }
}

#[cold]
fn fatal(e: TraceError) -> ! {
    graceful_exit(e)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bootstrap::ARENA;
    use crate::guard;
    use crate::sink::tests::{shared_opener, FakeStack, SharedBuf};
    use rand::Rng;
    use std::io::Write;
    use std::ptr;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Barrier};

    type TestTracer = Tracer<SharedBuf, FakeStack>;

    fn tracer() -> (TestTracer, SharedBuf, Arc<AtomicUsize>) {
        let buf = SharedBuf::default();
        let opened = Arc::new(AtomicUsize::new(0));
        let t = Tracer::new(Sink::new(FakeStack, shared_opener(&buf, opened.clone())));
        (t, buf, opened)
    }

    /// Data lines of all records, in file order.
    fn data_lines(buf: &SharedBuf) -> Vec<String> {
        buf.text()
            .lines()
            .filter(|l| !l.is_empty() && !l.starts_with("time ") && !l.starts_with("frame_"))
            .map(str::to_owned)
            .collect()
    }

    unsafe extern "C" fn null_malloc(_size: size_t) -> *mut void {
        ptr::null_mut()
    }

    unsafe extern "C" fn null_realloc(_p: *mut void, _size: size_t) -> *mut void {
        ptr::null_mut()
    }

    unsafe extern "C" fn failing_posix_memalign(_m: *mut *mut void, _a: size_t, _s: size_t) -> int {
        libc::ENOMEM
    }

    #[link(name = "c")]
    extern "C" {
        fn memalign(align: size_t, size: size_t) -> *mut void;
        fn valloc(size: size_t) -> *mut void;
        fn aligned_alloc(alignment: size_t, size: size_t) -> *mut void;
        fn malloc_usable_size(p: *mut void) -> size_t;
    }

    // Symbolizing a stack allocates. This one routes such an allocation
    // back through the very tracer that is writing the record, the way
    // the interposed `malloc` would.
    struct AllocatingStack;

    thread_local! {
        static SELF_BUF: SharedBuf = SharedBuf::default();
        static SELF_TRACER: Tracer<SharedBuf, AllocatingStack> = Tracer::new(Sink::new(
            AllocatingStack,
            shared_opener(&SELF_BUF.with(|b| b.clone()), Arc::default()),
        ));
    }

    impl StackCapture for AllocatingStack {
        fn write_stack(&self, out: &mut dyn Write, skip: crate::stack::SkipLevel) -> std::io::Result<()> {
            unsafe {
                let p = SELF_TRACER.with(|t| t.malloc(libc::malloc, 128));
                SELF_TRACER.with(|t| t.free(libc::free, p));
            }
            FakeStack.write_stack(out, skip)
        }
    }

    #[test]
    fn malloc_then_free() {
        let (t, buf, opened) = tracer();
        unsafe {
            let p = t.malloc(libc::malloc, 16);
            assert!(!p.is_null());
            t.free(libc::free, p);
            let addr = p as isize;
            assert_eq!(data_lines(&buf), [format!("malloc 16B {}", addr), format!("free 0B {}", addr)]);
        }
        t.finalize();
        let text = buf.text();
        assert!(text.lines().last().unwrap().starts_with("EXIT "));
        assert_eq!(text.matches("time ").count(), 2);
        assert_eq!(opened.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn failed_requests_are_silent() {
        let (t, buf, _) = tracer();
        unsafe {
            assert!(t.malloc(null_malloc, 64).is_null());
            let mut out = 0x1234 as *mut void;
            assert_eq!(t.posix_memalign(failing_posix_memalign, &mut out, 64, 64), libc::ENOMEM);
            assert_eq!(out, 0x1234 as *mut void);
            let keep = libc::malloc(8);
            assert!(t.realloc(null_realloc, keep, 1 << 20).is_null());
            libc::free(keep);
        }
        assert!(data_lines(&buf).is_empty());
        t.finalize();
        // Nothing observed, so no file and no marker.
        assert!(buf.text().is_empty());
    }

    #[test]
    fn realloc_logs_new_block_then_old_release() {
        let (t, buf, _) = tracer();
        unsafe {
            let p = libc::malloc(8);
            let np = t.realloc(libc::realloc, p, 1 << 16);
            assert!(!np.is_null());
            let same = t.realloc(libc::realloc, np, 1 << 16);
            assert_eq!(same, np);
            libc::free(same);
            assert_eq!(data_lines(&buf), [
                format!("realloc 65536B {}", np as isize),
                format!("free 0B {}", p as isize),
                format!("realloc 65536B {}", np as isize),
                format!("free 0B {}", np as isize),
            ]);
        }
    }

    #[test]
    fn realloc_of_null_still_pairs() {
        let (t, buf, _) = tracer();
        unsafe {
            let p = t.realloc(libc::realloc, ptr::null_mut(), 24);
            assert!(!p.is_null());
            libc::free(p);
            assert_eq!(data_lines(&buf), [format!("realloc 24B {}", p as isize), "free 0B 0".to_owned()]);
        }
    }

    #[test]
    fn every_primitive_is_logged_with_its_size() {
        let (t, buf, _) = tracer();
        unsafe {
            let c = t.calloc(libc::calloc, 4, 12);
            let m = t.memalign(memalign, 64, 100);
            let mut pm = ptr::null_mut();
            assert_eq!(t.posix_memalign(libc::posix_memalign, &mut pm, 32, 40), 0);
            let v = t.valloc(valloc, 10);
            let a = t.aligned_alloc(aligned_alloc, 128, 256);
            assert_eq!(m as usize % 64, 0);
            assert_eq!(pm as usize % 32, 0);
            assert_eq!(a as usize % 128, 0);
            let zeroed = std::slice::from_raw_parts(c as *const u8, 48);
            assert!(zeroed.iter().all(|b| *b == 0));
            assert_eq!(data_lines(&buf), [
                format!("calloc 48B {}", c as isize),
                format!("memalign 100B {}", m as isize),
                format!("posix_memalign 40B {}", pm as isize),
                format!("valloc 10B {}", v as isize),
                format!("aligned_alloc 256B {}", a as isize),
            ]);
            for p in [c, m, pm, v, a] {
                libc::free(p);
            }
        }
    }

    #[test]
    fn free_of_null_is_recorded() {
        let (t, buf, _) = tracer();
        unsafe { t.free(libc::free, ptr::null_mut()) };
        assert_eq!(data_lines(&buf), ["free 0B 0"]);
    }

    #[test]
    fn results_are_passed_through_untouched() {
        let (t, _buf, _) = tracer();
        let mut rng = rand::thread_rng();
        unsafe {
            for _ in 0..64 {
                let size: usize = rng.gen_range(1..8192);
                let p = t.malloc(libc::malloc, size);
                assert!(!p.is_null());
                ptr::write_bytes(p as *mut u8, 0xab, size);
                let grown = size + rng.gen_range(1..8192);
                let np = t.realloc(libc::realloc, p, grown);
                let kept = std::slice::from_raw_parts(np as *const u8, size);
                assert!(kept.iter().all(|b| *b == 0xab));
                assert!(malloc_usable_size(np) >= grown);
                t.free(libc::free, np);
            }
        }
    }

    #[test]
    fn nested_requests_are_not_logged() {
        let outer = guard::Reentrancy::enter();
        let (t, buf, opened) = tracer();
        unsafe {
            let p = t.malloc(libc::malloc, 32);
            t.free(libc::free, p);
        }
        drop(outer);
        assert!(data_lines(&buf).is_empty());
        assert_eq!(opened.load(Ordering::SeqCst), 0);
        assert_eq!(guard::depth(), 0);
    }

    #[test]
    fn allocation_inside_the_log_path_is_not_logged() {
        unsafe {
            let p = SELF_TRACER.with(|t| t.malloc(libc::malloc, 16));
            SELF_TRACER.with(|t| t.free(libc::free, p));
        }
        // Two records, neither of the 128-byte blocks made while writing them.
        let lines = SELF_BUF.with(data_lines);
        assert_eq!(lines.len(), 2);
        assert!(lines[0].starts_with("malloc 16B "));
        assert!(lines[1].starts_with("free 0B "));
        assert!(!lines.iter().any(|l| l.contains("128B")));
        assert_eq!(guard::depth(), 0);
    }

    #[test]
    fn bind_resolves_once_and_opens_the_log() {
        let (t, buf, opened) = tracer();
        let slot: Slot<CMalloc> = Slot::new(c"malloc");
        let lookups = AtomicUsize::new(0);
        let lookup = |name: &'static CStr| {
            lookups.fetch_add(1, Ordering::SeqCst);
            resolve::dlsym_next(name)
        };
        let a = t.bind_with(&slot, lookup).unwrap();
        let b = t.bind_with(&slot, lookup).unwrap();
        assert_eq!(a as usize, b as usize);
        assert_eq!(lookups.load(Ordering::SeqCst), 1);
        assert_eq!(opened.load(Ordering::SeqCst), 1);
        assert!(t.sink().is_open());
        // The file exists but nothing was logged yet.
        assert!(buf.text().is_empty());
        assert_eq!(guard::depth(), 0);
    }

    #[test]
    fn requests_made_by_the_lookup_fall_back_to_the_arena() {
        let (t, buf, opened) = tracer();
        let slot: Slot<CMalloc> = Slot::new(c"malloc");
        let mut served = ptr::null_mut();
        let real = t.bind_with(&slot, |_| {
            resolve::inside_dlsym(|| {
                // The dynamic linker allocating while `malloc` is unbound.
                served = match t.bind_with(&slot, |_| ptr::null_mut()) {
                    Some(real)  => unsafe { t.malloc(real, 24) },
                    None        => ARENA.alloc(24, 0),
                };
                assert_eq!(guard::depth(), 1);
            });
            libc::malloc as CMalloc as *mut void
        });
        assert_eq!(real.map(|f| f as usize), Some(libc::malloc as CMalloc as usize));
        assert!(!served.is_null());
        assert!(ARENA.owns(served));
        assert!(!resolve::in_dlsym());
        assert_eq!(guard::depth(), 0);
        // Once bound, the log exists but holds no record of the arena block.
        assert_eq!(opened.load(Ordering::SeqCst), 1);
        assert!(data_lines(&buf).is_empty());
        unsafe { crate::interpose::free(served) };
    }

    #[test]
    fn nested_finalize_still_closes_an_idle_log() {
        let (t, buf, _) = tracer();
        unsafe {
            let p = t.malloc(libc::malloc, 8);
            libc::free(p);
        }
        let outer = guard::Reentrancy::enter();
        t.finalize();
        drop(outer);
        assert!(buf.text().lines().last().unwrap().starts_with("EXIT "));
        assert!(!t.sink().is_open());
    }

    #[test]
    fn bind_from_nested_context_leaves_the_log_alone() {
        let (t, _buf, opened) = tracer();
        let slot: Slot<CFree> = Slot::new(c"free");
        let outer = guard::Reentrancy::enter();
        assert!(t.bind(&slot).is_some());
        drop(outer);
        assert_eq!(opened.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn concurrent_records_do_not_interleave() {
        const THREADS: usize = 8;
        let (t, buf, opened) = tracer();
        let t = Arc::new(t);
        let start = Arc::new(Barrier::new(THREADS));
        let handles: Vec<_> = (0..THREADS)
            .map(|i| {
                let t = Arc::clone(&t);
                let start = Arc::clone(&start);
                std::thread::spawn(move || unsafe {
                    start.wait();
                    let p = t.malloc(libc::malloc, 100 + i);
                    // Keep the block alive so that addresses stay unique.
                    let addr = p as isize;
                    std::thread::yield_now();
                    (addr, p as usize)
                })
            })
            .collect();
        let blocks: Vec<(isize, usize)> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        for (_, p) in &blocks {
            unsafe { t.free(libc::free, *p as *mut void) };
        }

        // Every record is exactly: time line, data line, two frames, blank.
        let text = buf.text();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 2 * THREADS * 5);
        for rec in lines.chunks(5) {
            assert!(rec[0].starts_with("time "));
            assert!(rec[1].starts_with("malloc ") || rec[1].starts_with("free 0B "));
            assert_eq!(rec[2], "frame_a [0x1]");
            assert_eq!(rec[3], "frame_b [0x2]");
            assert_eq!(rec[4], "");
        }
        for (i, (addr, _)) in blocks.iter().enumerate() {
            let size = 100 + i;
            let m = format!("malloc {}B {}", size, addr);
            let f = format!("free 0B {}", addr);
            assert_eq!(lines.iter().filter(|l| **l == m).count(), 1, "{}", m);
            assert_eq!(lines.iter().filter(|l| **l == f).count(), 1, "{}", f);
        }
        assert_eq!(opened.load(Ordering::SeqCst), 1);
    }
}
