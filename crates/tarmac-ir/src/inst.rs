//! Instructions.
//!
//! One list holds both the high-level opcodes and, after code generation,
//! the target instructions that replace them. Replaced instructions stay in
//! the list with their `deleted` flag set; every pass skips deleted entries.

use crate::operand::{Operand, VarId};

/// Basic-block index within a function.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct NodeId(pub u32);

/// Arithmetic opcodes.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ArithOp {
    Add,
    And,
    Or,
    Xor,
    Sub,
    Mul,
    Shl,
    Lshr,
    Ashr,
    Udiv,
    Sdiv,
    Urem,
    Srem,
    Fadd,
    Fsub,
    Fmul,
    Fdiv,
    Frem,
}

impl ArithOp {
    pub fn is_float(self) -> bool {
        matches!(
            self,
            ArithOp::Fadd | ArithOp::Fsub | ArithOp::Fmul | ArithOp::Fdiv | ArithOp::Frem
        )
    }
}

/// Cast opcodes.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum CastKind {
    Sext,
    Zext,
    Trunc,
    Fptrunc,
    Fpext,
    Fptosi,
    Fptoui,
    Sitofp,
    Uitofp,
    Bitcast,
}

/// Integer comparison conditions.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum IcmpCond {
    Eq,
    Ne,
    Ugt,
    Uge,
    Ult,
    Ule,
    Sgt,
    Sge,
    Slt,
    Sle,
}

/// Recognized intrinsics.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Intrinsic {
    Memcpy,
    Memmove,
    Memset,
    Setjmp,
    Longjmp,
    ReadTp,
    Unknown,
}

/// Branch shape of the high-level `Br`.
#[derive(Clone, Debug)]
pub enum BrKind {
    Uncond {
        target: NodeId,
    },
    Cond {
        cond: Operand,
        on_true: NodeId,
        on_false: NodeId,
    },
}

/// Lowered machine instructions the generic framework needs to see through.
pub trait TargetInst: std::fmt::Debug + Clone {
    /// Variables this instruction defines.
    fn dests(&self, out: &mut Vec<VarId>);
    /// Variables this instruction reads.
    fn srcs(&self, out: &mut Vec<VarId>);
    /// Ends its basic block.
    fn is_terminator(&self) -> bool;
    /// Control-flow successors, if any.
    fn branch_targets(&self, out: &mut Vec<NodeId>);
    /// The target of an unconditional branch, for node contraction.
    fn uncond_target(&self) -> Option<NodeId> {
        None
    }
    /// Redirect branch edges from `from` to `to`. Returns true on change.
    fn retarget(&mut self, from: NodeId, to: NodeId) -> bool;
    /// Render for dumps; register and variable names come from the function.
    fn write_text(&self, func: &crate::func::Func<Self>, w: &mut String);
}

/// Instruction payload.
#[derive(Clone, Debug)]
pub enum InstKind<T> {
    Alloca {
        dest: VarId,
        size: Operand,
        align: u32,
    },
    Arithmetic {
        op: ArithOp,
        dest: VarId,
        src0: Operand,
        src1: Operand,
    },
    Assign {
        dest: VarId,
        src: Operand,
    },
    Br(BrKind),
    Call {
        dest: Option<VarId>,
        target: Operand,
        args: Vec<Operand>,
        tail: bool,
        side_effects: bool,
    },
    Cast {
        kind: CastKind,
        dest: VarId,
        src: Operand,
    },
    Icmp {
        cond: IcmpCond,
        dest: VarId,
        src0: Operand,
        src1: Operand,
    },
    IntrinsicCall {
        id: Intrinsic,
        dest: Option<VarId>,
        args: Vec<Operand>,
    },
    Load {
        dest: VarId,
        addr: Operand,
    },
    Phi {
        dest: VarId,
        incoming: Vec<(Operand, NodeId)>,
    },
    Ret {
        value: Option<Operand>,
    },
    Store {
        value: Operand,
        addr: Operand,
    },
    Unreachable,
    /// Pseudo: marks `dest` as defined without emitting code.
    FakeDef {
        dest: VarId,
        src: Option<VarId>,
    },
    /// Pseudo: keeps `var` live without emitting code.
    FakeUse {
        var: VarId,
    },
    /// Pseudo: redefines the listed (caller-save) physical registers,
    /// placed immediately after calls.
    FakeKill {
        killed: Vec<VarId>,
    },
    Target(T),
}

/// An instruction plus its bookkeeping flags.
#[derive(Clone, Debug)]
pub struct Inst<T> {
    pub kind: InstKind<T>,
    pub deleted: bool,
    pub number: u32,
}

impl<T: TargetInst> Inst<T> {
    pub fn new(kind: InstKind<T>) -> Inst<T> {
        Inst {
            kind,
            deleted: false,
            number: 0,
        }
    }

    pub fn target(inst: T) -> Inst<T> {
        Inst::new(InstKind::Target(inst))
    }

    pub fn set_deleted(&mut self) {
        self.deleted = true;
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted
    }
}

impl<T: TargetInst> InstKind<T> {
    /// Variables defined by this instruction.
    pub fn dests(&self, out: &mut Vec<VarId>) {
        match self {
            InstKind::Alloca { dest, .. }
            | InstKind::Arithmetic { dest, .. }
            | InstKind::Assign { dest, .. }
            | InstKind::Cast { dest, .. }
            | InstKind::Icmp { dest, .. }
            | InstKind::Load { dest, .. }
            | InstKind::Phi { dest, .. } => out.push(*dest),
            InstKind::Call { dest, .. } | InstKind::IntrinsicCall { dest, .. } => {
                if let Some(d) = dest {
                    out.push(*d);
                }
            }
            InstKind::FakeDef { dest, .. } => out.push(*dest),
            InstKind::FakeKill { killed } => out.extend_from_slice(killed),
            InstKind::Target(t) => t.dests(out),
            InstKind::Br(_)
            | InstKind::Ret { .. }
            | InstKind::Store { .. }
            | InstKind::Unreachable
            | InstKind::FakeUse { .. } => {}
        }
    }

    /// Variables read by this instruction.
    pub fn srcs(&self, out: &mut Vec<VarId>) {
        match self {
            InstKind::Alloca { size, .. } => size.collect_vars(out),
            InstKind::Arithmetic { src0, src1, .. } | InstKind::Icmp { src0, src1, .. } => {
                src0.collect_vars(out);
                src1.collect_vars(out);
            }
            InstKind::Assign { src, .. } => src.collect_vars(out),
            InstKind::Br(BrKind::Cond { cond, .. }) => cond.collect_vars(out),
            InstKind::Br(BrKind::Uncond { .. }) => {}
            InstKind::Call { target, args, .. } => {
                target.collect_vars(out);
                for a in args {
                    a.collect_vars(out);
                }
            }
            InstKind::IntrinsicCall { args, .. } => {
                for a in args {
                    a.collect_vars(out);
                }
            }
            InstKind::Cast { src, .. } => src.collect_vars(out),
            InstKind::Load { addr, .. } => addr.collect_vars(out),
            InstKind::Phi { incoming, .. } => {
                for (op, _) in incoming {
                    op.collect_vars(out);
                }
            }
            InstKind::Ret { value } => {
                if let Some(v) = value {
                    v.collect_vars(out);
                }
            }
            InstKind::Store { value, addr } => {
                value.collect_vars(out);
                addr.collect_vars(out);
            }
            InstKind::FakeDef { src, .. } => {
                if let Some(s) = src {
                    out.push(*s);
                }
            }
            InstKind::FakeUse { var } => out.push(*var),
            InstKind::Target(t) => t.srcs(out),
            InstKind::Unreachable | InstKind::FakeKill { .. } => {}
        }
    }

    pub fn is_terminator(&self) -> bool {
        match self {
            InstKind::Br(_) | InstKind::Ret { .. } | InstKind::Unreachable => true,
            InstKind::Target(t) => t.is_terminator(),
            _ => false,
        }
    }

    pub fn branch_targets(&self, out: &mut Vec<NodeId>) {
        match self {
            InstKind::Br(BrKind::Uncond { target }) => out.push(*target),
            InstKind::Br(BrKind::Cond {
                on_true, on_false, ..
            }) => {
                out.push(*on_true);
                out.push(*on_false);
            }
            InstKind::Target(t) => t.branch_targets(out),
            _ => {}
        }
    }

    pub fn is_target(&self) -> bool {
        matches!(self, InstKind::Target(_))
    }
}

/// Uninhabited target for functions that have not been lowered yet. Passes
/// that run before code generation (instrumentation, phi placement) can use
/// `Func<NoTarget>` to state that no machine instructions exist.
#[derive(Clone, Debug)]
pub enum NoTarget {}

impl TargetInst for NoTarget {
    fn dests(&self, _out: &mut Vec<VarId>) {
        match *self {}
    }

    fn srcs(&self, _out: &mut Vec<VarId>) {
        match *self {}
    }

    fn is_terminator(&self) -> bool {
        match *self {}
    }

    fn branch_targets(&self, _out: &mut Vec<NodeId>) {
        match *self {}
    }

    fn retarget(&mut self, _from: NodeId, _to: NodeId) -> bool {
        match *self {}
    }

    fn write_text(&self, _func: &crate::func::Func<Self>, _w: &mut String) {
        match *self {}
    }
}
