//! tarmac - ahead-of-time ARM32 code generator.
//!
//! Translates a portable, typed, three-address IR into ARMv7-A machine IR:
//! operand legalization, i64 split lowering, AAPCS-style argument passing,
//! frame construction and sandboxed returns, with an optional
//! AddressSanitizer instrumentation pass ahead of lowering.
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use tarmac::{
//!     ArithOp, ArmInst, Flags, FuncBuilder, GlobalContext, InstKind, Operand, Translator, Type,
//! };
//!
//! let mut b = FuncBuilder::<ArmInst>::new("sum", Type::I32);
//! let entry = b.entry();
//! let a = b.arg(Type::I32);
//! let c = b.arg(Type::I32);
//! let d = b.var(Type::I32);
//! b.push(entry, InstKind::Arithmetic {
//!     op: ArithOp::Add,
//!     dest: d,
//!     src0: Operand::Var(a),
//!     src1: Operand::Var(c),
//! });
//! b.ret(entry, Some(Operand::Var(d)));
//!
//! let ctx = Arc::new(GlobalContext::new(Flags::default()));
//! let funcs = Translator::new(ctx).translate_all(vec![b.build()]);
//! assert!(!funcs[0].has_error());
//! ```

// Re-export from sub-crates.
pub use tarmac_arm32::{
    cond, ends_in_fallthrough, header, registers, translate_func, AluOp, ArmBr, ArmInst,
    TargetArm32,
};
pub use tarmac_asan::AsanInstrumentation;
pub use tarmac_ir::*;

mod error;
mod translator;

pub use error::*;
pub use translator::*;
