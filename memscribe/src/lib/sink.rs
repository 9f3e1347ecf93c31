//! The single trace file of the process.
//!
//! Writing to files is thread-safe; writing whole records without
//! interleaving them is not. Every access goes through one mutex, which
//! has nothing to do with the per-thread reentrancy counter: the latter
//! keeps a thread from tracing itself, the former keeps threads from
//! stepping on each other.

use crate::error::TraceError;
use crate::event::{timestamp, Event};
use crate::stack::{SkipLevel, StackCapture};
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::mem;
use std::sync::{Mutex, MutexGuard, TryLockError};

/// An open trace file along with how its stacks should be printed.
pub struct Journal<W> {
    pub out:    W,
    pub skip:   SkipLevel,
}

/// Creates the journal. Runs at most once per sink.
pub type Opener<W> = &'static (dyn Fn() -> Result<Journal<W>, TraceError> + Sync);

/// Trace output that can be pushed down to stable storage on exit.
pub trait Durable: Write {
    fn sync(&mut self) -> io::Result<()> {
        self.flush()
    }
}

impl Durable for BufWriter<File> {
    fn sync(&mut self) -> io::Result<()> {
        self.flush()?;
        self.get_ref().sync_all()
    }
}

enum State<W> {
    Unopened,
    Open(Journal<W>),
    // Finalized. Never reopened, so late requests cannot truncate the log.
    Closed,
}

impl<W: 'static> State<W> {
    fn journal(&mut self, open: Opener<W>) -> Result<Option<&mut Journal<W>>, TraceError> {
        if let State::Unopened = self {
            *self = State::Open(open()?);
        }
        match self {
            State::Open(j)  => Ok(Some(j)),
            _               => Ok(None),
        }
    }
}

pub struct Sink<W: 'static, S> {
    state:  Mutex<State<W>>,
    stack:  S,
    open:   Opener<W>,
}

impl<W: 'static, S> Sink<W, S> {
    pub const fn new(stack: S, open: Opener<W>) -> Self {
        Self { state: Mutex::new(State::Unopened), stack, open }
    }
}

impl<W: Durable + 'static, S: StackCapture> Sink<W, S> {
    fn lock(&self) -> Result<MutexGuard<'_, State<W>>, TraceError> {
        // Do not tolerate poisoned threads.
        self.state.lock().map_err(|_| TraceError::Poisoned)
    }

    /// Creates the trace file unless that already happened.
    pub fn ensure_open(&self) -> Result<(), TraceError> {
        self.lock()?.journal(self.open).map(|_| ())
    }

    #[cfg(test)]
    pub fn is_open(&self) -> bool {
        matches!(self.lock().as_deref(), Ok(State::Open(_)))
    }

    /// Appends one record per event, all under a single critical section,
    /// so events of the same request stay adjacent. Everything is flushed
    /// before the lock is released.
    #[inline(never)]
    pub fn write_events(&self, events: &[Event]) -> Result<(), TraceError> {
        let mut state = self.lock()?;
        let Some(j) = state.journal(self.open)? else {
            return Ok(());
        };
        for e in events {
            write!(j.out, "time {:.6}s\n{}\n", timestamp(), e)?;
            self.stack.write_stack(&mut j.out, j.skip)?;
            j.out.write_all(b"\n")?;
        }
        j.out.flush()?;

        Ok(())
    }

    /// Writes the exit marker and closes the file. Returns whether there
    /// was a file to close; the sink is closed for good either way.
    pub fn finish(&self) -> Result<bool, TraceError> {
        Self::close(self.lock()?)
    }

    /// Like [`finish`](Self::finish), but gives up instead of waiting when
    /// the lock is taken, possibly by the calling thread itself.
    pub fn try_finish(&self) -> Result<bool, TraceError> {
        match self.state.try_lock() {
            Ok(state)                       => Self::close(state),
            Err(TryLockError::WouldBlock)   => Ok(false),
            Err(TryLockError::Poisoned(_))  => Err(TraceError::Poisoned),
        }
    }

    fn close(mut state: MutexGuard<'_, State<W>>) -> Result<bool, TraceError> {
        match mem::replace(&mut *state, State::Closed) {
            State::Open(mut j) => {
                writeln!(j.out, "EXIT {:.6}s", timestamp())?;
                j.out.sync()?;
                Ok(true)
            },
            _ => Ok(false),
        }
    }
}
