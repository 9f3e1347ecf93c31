//! Per-thread reentrancy accounting.
//!
//! The tracer will at times need to allocate its own memory dynamically
//! (resolving symbols, creating the trace file, formatting records,
//! symbolizing stacks). Those requests re-enter the interposed functions
//! and must not be logged. Each thread owns a depth counter that only it
//! ever touches; a non-zero depth on entry means "we are already inside
//! the tracer".
//!
//! The counter is atomic even though it is thread-local, so that a signal
//! handler running on the same thread observes a consistent value.

use std::sync::atomic::{AtomicUsize, Ordering};

thread_local! {
    // Const-initialized and without a destructor: accessible from the
    // very first allocation of a thread until its very last one.
    static DEPTH: AtomicUsize = const { AtomicUsize::new(0) };
}

/// Scoped marker for "this thread is running tracer code". Dropping it
/// undoes the matching `enter`, so every exit path releases it.
#[must_use]
pub struct Reentrancy {
    outer: usize,
}

impl Reentrancy {
    #[inline(always)]
    pub fn enter() -> Self {
        let outer = DEPTH.with(|d| d.fetch_add(1, Ordering::AcqRel));
        Self { outer }
    }

    /// True when some caller up the stack of this thread had already
    /// entered, i.e. the current request originates from the tracer.
    #[inline(always)]
    pub fn is_nested(&self) -> bool {
        self.outer != 0
    }
}

impl Drop for Reentrancy {
    #[inline(always)]
    fn drop(&mut self) {
        DEPTH.with(|d| d.fetch_sub(1, Ordering::AcqRel));
    }
}

/// Current depth of the calling thread.
#[cfg(test)]
pub fn depth() -> usize {
    DEPTH.with(|d| d.load(Ordering::Acquire))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn outermost_entry_is_not_nested() {
        assert_eq!(depth(), 0);
        let g = Reentrancy::enter();
        assert!(!g.is_nested());
        assert_eq!(depth(), 1);
        drop(g);
        assert_eq!(depth(), 0);
    }

    #[test]
    fn inner_entries_are_nested_and_unwind() {
        let outer = Reentrancy::enter();
        {
            let inner = Reentrancy::enter();
            assert!(inner.is_nested());
            let innermost = Reentrancy::enter();
            assert!(innermost.is_nested());
            assert_eq!(depth(), 3);
        }
        assert_eq!(depth(), 1);
        assert!(!outer.is_nested());
        drop(outer);
        assert_eq!(depth(), 0);
    }

    #[test]
    fn early_return_releases() {
        fn bail(fail: bool) -> Option<()> {
            let _g = Reentrancy::enter();
            if fail {
                return None;
            }
            Some(())
        }
        assert!(bail(true).is_none());
        assert!(bail(false).is_some());
        assert_eq!(depth(), 0);
    }

    #[test]
    fn depth_is_per_thread() {
        let _g = Reentrancy::enter();
        std::thread::spawn(|| {
            let other = Reentrancy::enter();
            assert!(!other.is_nested());
        })
        .join()
        .unwrap();
        assert_eq!(depth(), 1);
    }
}
