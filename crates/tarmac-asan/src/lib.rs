//! AddressSanitizer instrumentation.
//!
//! An IR-to-IR pass that runs before lowering: wraps globals and constant
//! allocas in 32-byte redzones, substitutes allocator calls, and inserts
//! `__asan_check` calls before loads and stores. The pass is shared by all
//! worker threads; per-function state stays with the walk.
//!
//! For the pass to find allocator calls, the input must not have had its
//! symbols stripped.

mod func;
mod globals;

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Condvar, Mutex};

use tarmac_ir::GlobalContext;

pub(crate) const RZ_SIZE: u32 = 32;
pub(crate) const RZ_PREFIX: &str = "__$rz";
pub(crate) const RZ_ARRAY_NAME: &str = "__$rz_array";
pub(crate) const RZ_SIZES_NAME: &str = "__$rz_sizes";

/// Allocator entry points and their instrumented replacements.
pub(crate) const FUNC_SUBSTITUTIONS: [(&str, &str); 2] =
    [("malloc", "__asan_malloc"), ("free", "__asan_free")];

pub struct AsanInstrumentation {
    pub(crate) ctx: Arc<GlobalContext>,
    /// One-shot latch: functions wait on this before referencing the
    /// redzone bookkeeping globals.
    pub(crate) did_process_globals: Mutex<bool>,
    pub(crate) globals_done: Condvar,
    pub(crate) rz_num: AtomicU32,
    pub(crate) rz_globals_num: AtomicU32,
}

impl AsanInstrumentation {
    pub fn new(ctx: Arc<GlobalContext>) -> AsanInstrumentation {
        AsanInstrumentation {
            ctx,
            did_process_globals: Mutex::new(false),
            globals_done: Condvar::new(),
            rz_num: AtomicU32::new(0),
            rz_globals_num: AtomicU32::new(0),
        }
    }

    /// Monotonic redzone names: `__$rz0`, `__$rz1`, ...
    pub(crate) fn next_rz_name(&self) -> String {
        let n = self.rz_num.fetch_add(1, Ordering::SeqCst);
        format!("{RZ_PREFIX}{n}")
    }

    /// Number of global redzones, valid once `instrument_globals` ran.
    pub fn rz_globals_num(&self) -> u32 {
        self.rz_globals_num.load(Ordering::SeqCst)
    }
}
