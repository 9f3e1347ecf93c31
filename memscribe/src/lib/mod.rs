#[allow(non_camel_case_types)]
/// Crate is targeting Linux user-space processes which
/// invoke `malloc` and friends. We're doing it via
/// [*function interposition*](https://stackoverflow.com/questions/426230/what-is-the-ld-preload-trick).
/// We thus need the corresponding set of signatures for the
/// functions that are to be interposed.
///
/// This module defines said signatures, along with some assistant
/// type aliases (e.g. `void` instead of `c_void`).
mod ffi;

mod error;

/// Per-thread "inside the tracer" accounting.
mod guard;

/// Lazily bound true implementations.
mod resolve;

mod bootstrap;

mod config;

mod event;

mod stack;

/// The trace file.
mod sink;

mod tracer;

/// Contains actual interposing code.
mod interpose;

mod lifecycle;
