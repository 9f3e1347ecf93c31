//! Call stack capture for trace records.
//!
//! The sink asks a [`StackCapture`] to append the stack of the current
//! request right after the record's data line, one frame per line, no
//! trailing blank line.

use std::ffi::c_void;
use std::io::{self, Write};

/// How many innermost frames to leave out of the printed stack.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum SkipLevel {
    /// Full raw stack, capture machinery included.
    Full        = 0,
    /// Starts at the caller of the logging entry point.
    #[default]
    OmitLogger  = 1,
    /// Additionally leaves out the interposed allocator function.
    OmitShim    = 2,
}

impl SkipLevel {
    pub fn parse(raw: &[u8]) -> Option<Self> {
        match raw {
            b"0" => Some(Self::Full),
            b"1" => Some(Self::OmitLogger),
            b"2" => Some(Self::OmitShim),
            _    => None,
        }
    }

    fn frames(self) -> usize {
        self as usize
    }
}

pub trait StackCapture {
    fn write_stack(&self, out: &mut dyn Write, skip: SkipLevel) -> io::Result<()>;
}

/// Upper bound on frames printed per record.
pub const MAX_FRAMES: usize = 64;
// Raw frames walked, capture machinery included.
const MAX_RAW_FRAMES: usize = MAX_FRAMES * 2;

/// Walks and symbolizes the stack with the `backtrace` crate.
#[derive(Clone, Copy, Debug, Default)]
pub struct Backtracer;

impl StackCapture for Backtracer {
    #[inline(never)]
    fn write_stack(&self, out: &mut dyn Write, skip: SkipLevel) -> io::Result<()> {
        type WriteStack = fn(&Backtracer, &mut dyn Write, SkipLevel) -> io::Result<()>;
        let anchor = <Backtracer as StackCapture>::write_stack as WriteStack as usize;
        // Return address and enclosing function start of every frame.
        let mut frames = [(0usize, 0usize); MAX_RAW_FRAMES];
        let mut len = 0;
        let mut anchor_at = None;
        backtrace::trace(|frame| {
            let start = frame.symbol_address() as usize;
            if anchor_at.is_none() && start == anchor {
                anchor_at = Some(len);
            }
            frames[len] = (frame.ip() as usize, start);
            len += 1;
            len < MAX_RAW_FRAMES
        });

        // Past this very function come the logging entry point, then the
        // interposed function.
        let start = match (skip, anchor_at) {
            (SkipLevel::Full, _)    => 0,
            (_, Some(at))           => at + 1 + skip.frames(),
            (_, None)               => skip.frames(),
        };
        let end = len.min(start.saturating_add(MAX_FRAMES));
        for &(ip, func) in frames.get(start..end).unwrap_or(&[]) {
            write_frame(out, ip, func)?;
        }

        Ok(())
    }
}

fn write_frame(out: &mut dyn Write, ip: usize, func: usize) -> io::Result<()> {
    // Inlined frames resolve innermost first; the last one owns the code.
    let mut name = None;
    backtrace::resolve(ip as *mut c_void, |sym| {
        if let Some(n) = sym.name() {
            name = Some(n.to_string());
        }
    });

    match name {
        Some(name) if func != 0 && func <= ip => {
            writeln!(out, "{}+{:#x} [{:#x}]", name, ip - func, ip)
        },
        Some(name)  => writeln!(out, "{} [{:#x}]", name, ip),
        None        => writeln!(out, "?? [{:#x}]", ip),
    }
}
