//! Translator configuration.

/// Optimization pipeline selector.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub enum OptLevel {
    /// Optimized pipeline with full liveness and global register allocation.
    #[default]
    O2,
    /// Debug pipeline: minimal passes, registers only where mandatory.
    Om1,
}

/// Process-wide translation flags, read-only for library code.
#[derive(Clone, Debug)]
pub struct Flags {
    pub opt_level: OptLevel,
    /// Emit sandboxed (bundle-locked, masked) return sequences.
    pub use_sandboxing: bool,
    /// Run the AddressSanitizer instrumentation pass before lowering.
    pub enable_asan: bool,
    /// Split critical edges and use advanced phi lowering.
    pub phi_edge_split: bool,
    /// Randomized nop insertion after branch optimization.
    pub nop_insertion: bool,
    /// Silently skip unimplemented lowerings instead of aborting. The
    /// resulting object is partial but linkable.
    pub skip_unimplemented: bool,
    /// Worker threads for function translation. Zero means one per core.
    pub num_workers: usize,
}

impl Default for Flags {
    fn default() -> Flags {
        Flags {
            opt_level: OptLevel::O2,
            use_sandboxing: false,
            enable_asan: false,
            phi_edge_split: false,
            nop_insertion: false,
            skip_unimplemented: false,
            num_workers: 0,
        }
    }
}
