//! Process-wide translation context.
//!
//! Shared between worker threads: the flags, the single globals list, the
//! output stream, and the coarse-grained stat counters. Counters are only
//! mutated through the context methods so a single lock serializes them.

use std::io::{self, Write};
use std::sync::{Mutex, MutexGuard};

use crate::flags::Flags;
use crate::globals::GlobalList;

/// Translation statistics.
#[derive(Clone, Copy, Debug, Default)]
pub struct Stats {
    /// Loads generated to fill register-allocated values from stack slots.
    pub fills: u64,
    /// Total frame bytes reserved across functions.
    pub frame_bytes: u64,
    /// Callee-saved registers pushed across functions.
    pub registers_saved: u64,
}

pub struct GlobalContext {
    flags: Flags,
    globals: Mutex<GlobalList>,
    stats: Mutex<Stats>,
    out: Mutex<Box<dyn Write + Send>>,
}

impl GlobalContext {
    pub fn new(flags: Flags) -> GlobalContext {
        GlobalContext::with_output(flags, Box::new(io::stdout()))
    }

    pub fn with_output(flags: Flags, out: Box<dyn Write + Send>) -> GlobalContext {
        GlobalContext {
            flags,
            globals: Mutex::new(GlobalList::new()),
            stats: Mutex::new(Stats::default()),
            out: Mutex::new(out),
        }
    }

    pub fn flags(&self) -> &Flags {
        &self.flags
    }

    /// Exclusive access to the globals list.
    pub fn globals(&self) -> MutexGuard<'_, GlobalList> {
        self.globals.lock().unwrap()
    }

    /// Lock the shared output stream for the scope of a dump.
    pub fn lock_out(&self) -> MutexGuard<'_, Box<dyn Write + Send>> {
        self.out.lock().unwrap()
    }

    pub fn stats(&self) -> Stats {
        *self.stats.lock().unwrap()
    }

    pub fn stats_update_fills(&self, n: u64) {
        self.stats.lock().unwrap().fills += n;
    }

    pub fn stats_update_frame_bytes(&self, n: u64) {
        self.stats.lock().unwrap().frame_bytes += n;
    }

    pub fn stats_update_registers_saved(&self, n: u64) {
        self.stats.lock().unwrap().registers_saved += n;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stats_serialize() {
        let ctx = GlobalContext::with_output(Flags::default(), Box::new(io::sink()));
        ctx.stats_update_fills(2);
        ctx.stats_update_frame_bytes(64);
        ctx.stats_update_registers_saved(3);
        let stats = ctx.stats();
        assert_eq!(stats.fills, 2);
        assert_eq!(stats.frame_bytes, 64);
        assert_eq!(stats.registers_saved, 3);
    }
}
