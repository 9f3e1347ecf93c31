//! Process exit hook.
//!
//! The entry is placed in `.fini_array`, so the dynamic linker runs it when
//! the library is unloaded on graceful exit, before the C library it
//! depends on goes away. A crash skips it: records already written are
//! flushed, only the `EXIT` marker is lost.

#![cfg_attr(test, allow(dead_code))]

use crate::interpose::TRACER;

extern "C" fn finalize() {
    TRACER.finalize();
}

#[cfg(not(test))]
#[used]
#[link_section = ".fini_array"]
static FINALIZE: extern "C" fn() = finalize;
