//! Parallel function translation.
//!
//! Worker threads pull functions off a shared queue; each worker owns its
//! function and its own lowering context for the duration. The globals
//! list is instrumented exactly once before workers start; functions block
//! on the instrumentation gate before referencing the redzone globals.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use tracing::debug;

use tarmac_arm32::{translate_func, ArmInst};
use tarmac_asan::AsanInstrumentation;
use tarmac_ir::{Func, GlobalContext};

pub struct Translator {
    ctx: Arc<GlobalContext>,
}

impl Translator {
    pub fn new(ctx: Arc<GlobalContext>) -> Translator {
        Translator { ctx }
    }

    pub fn ctx(&self) -> &GlobalContext {
        &self.ctx
    }

    /// Translate every function, preserving input order. Per-function
    /// errors are sticky on the function; callers inspect `has_error`.
    pub fn translate_all(&self, funcs: Vec<Func<ArmInst>>) -> Vec<Func<ArmInst>> {
        let asan = self
            .ctx
            .flags()
            .enable_asan
            .then(|| AsanInstrumentation::new(self.ctx.clone()));
        if let Some(asan) = &asan {
            asan.instrument_globals();
        }

        let workers = match self.ctx.flags().num_workers {
            0 => std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1),
            n => n,
        };
        let n = funcs.len();
        let queue: Mutex<VecDeque<(usize, Func<ArmInst>)>> =
            Mutex::new(funcs.into_iter().enumerate().collect());
        let results: Mutex<Vec<Option<Func<ArmInst>>>> = Mutex::new((0..n).map(|_| None).collect());
        let ctx: &GlobalContext = &self.ctx;
        let asan_ref = asan.as_ref();

        std::thread::scope(|s| {
            for _ in 0..workers.min(n.max(1)) {
                s.spawn(|| loop {
                    let item = queue.lock().unwrap().pop_front();
                    let Some((idx, mut func)) = item else { break };
                    if let Some(asan) = asan_ref {
                        asan.instrument_func(&mut func);
                    }
                    translate_func(&mut func, ctx);
                    if let Some(err) = func.error() {
                        debug!(func = %func.name, error = %err, "function failed");
                    }
                    results.lock().unwrap()[idx] = Some(func);
                });
            }
        });

        results
            .into_inner()
            .unwrap()
            .into_iter()
            .map(|f| f.expect("worker dropped a function"))
            .collect()
    }
}
