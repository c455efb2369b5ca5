//! ARM32 (ARMv7-A) target lowering for the tarmac code generator.
//!
//! Lowers the typed three-address IR of `tarmac-ir` to ARM32 machine IR:
//! operand legalization against the flexible-second-operand model, i64
//! splitting into lo/hi register pairs, per-opcode lowering, frame
//! construction with AAPCS-style argument passing, and the O2/Om1
//! translation pipelines, including the sandboxed return sequence.

pub mod cond;
mod frame;
pub mod header;
mod inst;
mod lower;
mod pipeline;
pub mod registers;
mod target;

pub use inst::*;
pub use pipeline::*;
pub use target::*;
