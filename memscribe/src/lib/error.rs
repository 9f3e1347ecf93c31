use std::io;
use thiserror::Error;

/// Everything that can go wrong inside the instrumentation itself.
/// None of these ever reach the traced program: the entry points
/// turn them into a diagnostic plus process termination.
#[derive(Error, Debug)]
pub enum TraceError {
    #[error("error: dlsym() {symbol}")]
    Unresolved { symbol: &'static str },
    #[error("cannot create trace file {path}: {source}")]
    LogUnavailable {
        path:   &'static str,
        #[source]
        source: io::Error,
    },
    #[error("failed to write trace record: {0}")]
    Write(#[from] io::Error),
    #[error("poisoned mutex around the trace file")]
    Poisoned,
}
