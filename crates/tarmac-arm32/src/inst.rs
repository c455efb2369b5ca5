//! ARM32 machine IR.
//!
//! The instruction inventory is exactly what lowering and the frame builder
//! produce. Instructions hold legalized operands: a flexible second operand
//! where ARM accepts one, plain registers elsewhere. `mov` doubles as the
//! spill/fill pseudo until register allocation resolves its operands.

use std::fmt::Write as _;

use tarmac_ir::{
    Func, MemIndex, MemOperand, NodeId, Operand, ShiftAmt, ShiftOp, TargetInst, VarId,
};

use crate::cond::Cond;
use crate::registers::reg_name;

/// Three-operand data-processing opcodes.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum AluOp {
    Adc,
    Add,
    And,
    Asr,
    Bic,
    Eor,
    Lsl,
    Lsr,
    Mul,
    Orr,
    Rsb,
    Sbc,
    Sub,
}

impl AluOp {
    pub fn mnemonic(self) -> &'static str {
        match self {
            AluOp::Adc => "adc",
            AluOp::Add => "add",
            AluOp::And => "and",
            AluOp::Asr => "asr",
            AluOp::Bic => "bic",
            AluOp::Eor => "eor",
            AluOp::Lsl => "lsl",
            AluOp::Lsr => "lsr",
            AluOp::Mul => "mul",
            AluOp::Orr => "orr",
            AluOp::Rsb => "rsb",
            AluOp::Sbc => "sbc",
            AluOp::Sub => "sub",
        }
    }
}

/// Branch shapes. `on_false: None` means fall-through to the next node in
/// layout order (produced by branch optimization).
#[derive(Clone, Debug)]
pub enum ArmBr {
    Uncond {
        target: NodeId,
    },
    Cond {
        cond: Cond,
        on_true: NodeId,
        on_false: Option<NodeId>,
    },
}

/// One ARM32 instruction.
#[derive(Clone, Debug)]
pub enum ArmInst {
    Alu {
        op: AluOp,
        set_flags: bool,
        pred: Cond,
        dest: VarId,
        src0: VarId,
        src1: Operand,
    },
    Mla {
        dest: VarId,
        src0: VarId,
        src1: VarId,
        acc: VarId,
    },
    Umull {
        dest_lo: VarId,
        dest_hi: VarId,
        src0: VarId,
        src1: VarId,
    },
    /// Register move, memory load/store pseudo, or conditional move. A
    /// `nonkillable` move leaves the previous value live (the conditional
    /// second move of the icmp idiom).
    Mov {
        dest: VarId,
        src: Operand,
        pred: Cond,
        nonkillable: bool,
    },
    Mvn {
        dest: VarId,
        src: Operand,
    },
    Movw {
        dest: VarId,
        src: Operand,
    },
    Movt {
        dest: VarId,
        src: Operand,
    },
    /// Sign-extend byte/halfword, width taken from the source type.
    Sxt {
        dest: VarId,
        src: VarId,
    },
    Uxt {
        dest: VarId,
        src: VarId,
    },
    Cmp {
        src0: VarId,
        src1: Operand,
        pred: Cond,
    },
    Ldr {
        dest: VarId,
        mem: MemOperand,
    },
    Str {
        value: VarId,
        mem: MemOperand,
    },
    Push {
        regs: Vec<VarId>,
    },
    Pop {
        regs: Vec<VarId>,
    },
    /// Direct (relocatable target) or indirect (register target) call.
    Call {
        dest: Option<VarId>,
        target: Operand,
    },
    Br(ArmBr),
    /// Return through `lr`; `value` rides along for liveness only.
    Ret {
        lr: VarId,
        value: Option<VarId>,
    },
    /// Permanently undefined encoding; faults if ever executed.
    Trap,
    BundleLock,
    BundleUnlock,
}

impl ArmInst {
    /// Whether the instruction only conditionally writes its dest, which
    /// keeps the previous value live.
    fn conditional_def(&self) -> bool {
        match self {
            ArmInst::Alu { pred, .. } => *pred != Cond::Al,
            ArmInst::Mov {
                pred, nonkillable, ..
            } => *nonkillable || *pred != Cond::Al,
            // movt writes only the top half.
            ArmInst::Movt { .. } => true,
            _ => false,
        }
    }

    /// Fall-through-aware branch optimization. Returns true if anything
    /// changed; sets `delete` when the instruction became redundant.
    pub fn optimize_branch(&mut self, next: Option<NodeId>, delete: &mut bool) -> bool {
        let Some(next) = next else {
            return false;
        };
        match self {
            ArmInst::Br(ArmBr::Uncond { target }) => {
                if *target == next {
                    *delete = true;
                    return true;
                }
                false
            }
            ArmInst::Br(ArmBr::Cond {
                cond,
                on_true,
                on_false,
            }) => {
                let Some(false_target) = *on_false else {
                    return false;
                };
                if false_target == next {
                    *on_false = None;
                    return true;
                }
                if *on_true == next {
                    *cond = cond.invert();
                    *on_true = false_target;
                    *on_false = None;
                    return true;
                }
                false
            }
            _ => false,
        }
    }
}

fn mem_srcs(mem: &MemOperand, out: &mut Vec<VarId>) {
    out.push(mem.base);
    if let MemIndex::RegReg { index, .. } = mem.index {
        out.push(index);
    }
}

impl TargetInst for ArmInst {
    fn dests(&self, out: &mut Vec<VarId>) {
        match self {
            ArmInst::Alu { dest, .. }
            | ArmInst::Mla { dest, .. }
            | ArmInst::Mov { dest, .. }
            | ArmInst::Mvn { dest, .. }
            | ArmInst::Movw { dest, .. }
            | ArmInst::Movt { dest, .. }
            | ArmInst::Sxt { dest, .. }
            | ArmInst::Uxt { dest, .. }
            | ArmInst::Ldr { dest, .. } => out.push(*dest),
            ArmInst::Umull { dest_lo, dest_hi, .. } => {
                out.push(*dest_lo);
                out.push(*dest_hi);
            }
            ArmInst::Pop { regs } => out.extend_from_slice(regs),
            ArmInst::Call { dest, .. } => {
                if let Some(d) = dest {
                    out.push(*d);
                }
            }
            ArmInst::Cmp { .. }
            | ArmInst::Str { .. }
            | ArmInst::Push { .. }
            | ArmInst::Br(_)
            | ArmInst::Ret { .. }
            | ArmInst::Trap
            | ArmInst::BundleLock
            | ArmInst::BundleUnlock => {}
        }
    }

    fn srcs(&self, out: &mut Vec<VarId>) {
        if self.conditional_def() {
            // A conditional write reads the previous value.
            let mut dests = Vec::new();
            self.dests(&mut dests);
            out.extend(dests);
        }
        match self {
            ArmInst::Alu { src0, src1, .. } => {
                out.push(*src0);
                src1.collect_vars(out);
            }
            ArmInst::Mla {
                src0, src1, acc, ..
            } => {
                out.push(*src0);
                out.push(*src1);
                out.push(*acc);
            }
            ArmInst::Umull { src0, src1, .. } => {
                out.push(*src0);
                out.push(*src1);
            }
            ArmInst::Mov { src, .. }
            | ArmInst::Mvn { src, .. }
            | ArmInst::Movw { src, .. }
            | ArmInst::Movt { src, .. } => src.collect_vars(out),
            ArmInst::Sxt { src, .. } | ArmInst::Uxt { src, .. } => out.push(*src),
            ArmInst::Cmp { src0, src1, .. } => {
                out.push(*src0);
                src1.collect_vars(out);
            }
            ArmInst::Ldr { mem, .. } => mem_srcs(mem, out),
            ArmInst::Str { value, mem } => {
                out.push(*value);
                mem_srcs(mem, out);
            }
            ArmInst::Push { regs } => out.extend_from_slice(regs),
            ArmInst::Call { target, .. } => target.collect_vars(out),
            ArmInst::Ret { lr, value } => {
                out.push(*lr);
                if let Some(v) = value {
                    out.push(*v);
                }
            }
            ArmInst::Pop { .. }
            | ArmInst::Br(_)
            | ArmInst::Trap
            | ArmInst::BundleLock
            | ArmInst::BundleUnlock => {}
        }
    }

    fn is_terminator(&self) -> bool {
        matches!(
            self,
            ArmInst::Br(_) | ArmInst::Ret { .. } | ArmInst::Trap
        )
    }

    fn branch_targets(&self, out: &mut Vec<NodeId>) {
        match self {
            ArmInst::Br(ArmBr::Uncond { target }) => out.push(*target),
            ArmInst::Br(ArmBr::Cond {
                on_true, on_false, ..
            }) => {
                out.push(*on_true);
                if let Some(f) = on_false {
                    out.push(*f);
                }
            }
            _ => {}
        }
    }

    fn uncond_target(&self) -> Option<NodeId> {
        match self {
            ArmInst::Br(ArmBr::Uncond { target }) => Some(*target),
            _ => None,
        }
    }

    fn retarget(&mut self, from: NodeId, to: NodeId) -> bool {
        match self {
            ArmInst::Br(ArmBr::Uncond { target }) => {
                if *target == from {
                    *target = to;
                    return true;
                }
                false
            }
            ArmInst::Br(ArmBr::Cond {
                on_true, on_false, ..
            }) => {
                let mut changed = false;
                if *on_true == from {
                    *on_true = to;
                    changed = true;
                }
                if *on_false == Some(from) {
                    *on_false = Some(to);
                    changed = true;
                }
                changed
            }
            _ => false,
        }
    }

    fn write_text(&self, func: &Func<ArmInst>, w: &mut String) {
        write_inst(self, func, w);
    }
}

fn vtext(func: &Func<ArmInst>, v: VarId) -> String {
    match func.var(v).reg {
        Some(reg) => reg_name(reg).to_string(),
        None => func.var_text(v),
    }
}

fn otext(func: &Func<ArmInst>, op: &Operand) -> String {
    match op {
        Operand::Var(v) => vtext(func, *v),
        Operand::Const32 { value, .. } => format!("#{value}"),
        Operand::FlexImm { imm, .. } => format!("#{}", imm.value() as i32),
        Operand::FlexReg(fr) => {
            let mut s = vtext(func, fr.reg);
            if fr.shift != ShiftOp::None {
                match fr.amt {
                    ShiftAmt::Imm(amt) => {
                        let _ = write!(s, ", {} #{amt}", fr.shift.mnemonic());
                    }
                    ShiftAmt::Reg(r) => {
                        let _ = write!(s, ", {} {}", fr.shift.mnemonic(), vtext(func, r));
                    }
                }
            }
            s
        }
        Operand::Mem(mem) => mtext(func, mem),
        Operand::Reloc { name, offset } => {
            if *offset == 0 {
                name.clone()
            } else {
                format!("{name}+{offset}")
            }
        }
        _ => func.operand_text(op),
    }
}

fn mtext(func: &Func<ArmInst>, mem: &MemOperand) -> String {
    let mut s = format!("[{}", vtext(func, mem.base));
    match mem.index {
        MemIndex::Imm(0) => {}
        MemIndex::Imm(off) => {
            let _ = write!(s, ", #{off}");
        }
        MemIndex::RegReg { index, shift, amt } => {
            let _ = write!(s, ", {}", vtext(func, index));
            if shift != ShiftOp::None {
                let _ = write!(s, ", {} #{amt}", shift.mnemonic());
            }
        }
    }
    s.push(']');
    s
}

/// Load/store width suffix for a memory access type.
fn width_suffix(mem: &MemOperand, signed: bool) -> &'static str {
    match (mem.ty.bytes(), signed) {
        (1, false) => "b",
        (1, true) => "sb",
        (2, false) => "h",
        (2, true) => "sh",
        _ => "",
    }
}

fn write_inst(inst: &ArmInst, func: &Func<ArmInst>, w: &mut String) {
    match inst {
        ArmInst::Alu {
            op,
            set_flags,
            pred,
            dest,
            src0,
            src1,
        } => {
            let s = if *set_flags { "s" } else { "" };
            let _ = write!(
                w,
                "{}{}{}\t{}, {}, {}",
                op.mnemonic(),
                s,
                pred.suffix(),
                vtext(func, *dest),
                vtext(func, *src0),
                otext(func, src1)
            );
        }
        ArmInst::Mla {
            dest,
            src0,
            src1,
            acc,
        } => {
            let _ = write!(
                w,
                "mla\t{}, {}, {}, {}",
                vtext(func, *dest),
                vtext(func, *src0),
                vtext(func, *src1),
                vtext(func, *acc)
            );
        }
        ArmInst::Umull {
            dest_lo,
            dest_hi,
            src0,
            src1,
        } => {
            let _ = write!(
                w,
                "umull\t{}, {}, {}, {}",
                vtext(func, *dest_lo),
                vtext(func, *dest_hi),
                vtext(func, *src0),
                vtext(func, *src1)
            );
        }
        ArmInst::Mov { dest, src, pred, .. } => {
            // ldr/str forms of the pseudo resolve by operand shape.
            match src {
                Operand::Mem(mem) => {
                    let _ = write!(
                        w,
                        "ldr{}{}\t{}, {}",
                        width_suffix(mem, false),
                        pred.suffix(),
                        vtext(func, *dest),
                        mtext(func, mem)
                    );
                }
                _ => {
                    let _ = write!(
                        w,
                        "mov{}\t{}, {}",
                        pred.suffix(),
                        vtext(func, *dest),
                        otext(func, src)
                    );
                }
            }
        }
        ArmInst::Mvn { dest, src } => {
            let _ = write!(w, "mvn\t{}, {}", vtext(func, *dest), otext(func, src));
        }
        ArmInst::Movw { dest, src } => match src {
            Operand::Reloc { name, .. } => {
                let _ = write!(w, "movw\t{}, #:lower16:{}", vtext(func, *dest), name);
            }
            _ => {
                let _ = write!(w, "movw\t{}, {}", vtext(func, *dest), otext(func, src));
            }
        },
        ArmInst::Movt { dest, src } => match src {
            Operand::Reloc { name, .. } => {
                let _ = write!(w, "movt\t{}, #:upper16:{}", vtext(func, *dest), name);
            }
            _ => {
                let _ = write!(w, "movt\t{}, {}", vtext(func, *dest), otext(func, src));
            }
        },
        ArmInst::Sxt { dest, src } => {
            let mn = match func.var(*src).ty.bytes() {
                1 => "sxtb",
                _ => "sxth",
            };
            let _ = write!(w, "{}\t{}, {}", mn, vtext(func, *dest), vtext(func, *src));
        }
        ArmInst::Uxt { dest, src } => {
            let mn = match func.var(*src).ty.bytes() {
                1 => "uxtb",
                _ => "uxth",
            };
            let _ = write!(w, "{}\t{}, {}", mn, vtext(func, *dest), vtext(func, *src));
        }
        ArmInst::Cmp { src0, src1, pred } => {
            let _ = write!(
                w,
                "cmp{}\t{}, {}",
                pred.suffix(),
                vtext(func, *src0),
                otext(func, src1)
            );
        }
        ArmInst::Ldr { dest, mem } => {
            let _ = write!(
                w,
                "ldr{}\t{}, {}",
                width_suffix(mem, false),
                vtext(func, *dest),
                mtext(func, mem)
            );
        }
        ArmInst::Str { value, mem } => {
            let _ = write!(
                w,
                "str{}\t{}, {}",
                width_suffix(mem, false),
                vtext(func, *value),
                mtext(func, mem)
            );
        }
        ArmInst::Push { regs } => {
            let list: Vec<&str> = regs
                .iter()
                .filter_map(|r| func.var(*r).reg.map(reg_name))
                .collect();
            let _ = write!(w, "push\t{{{}}}", list.join(", "));
        }
        ArmInst::Pop { regs } => {
            let list: Vec<&str> = regs
                .iter()
                .filter_map(|r| func.var(*r).reg.map(reg_name))
                .collect();
            let _ = write!(w, "pop\t{{{}}}", list.join(", "));
        }
        ArmInst::Call { dest, target } => {
            match target {
                Operand::Reloc { name, .. } => {
                    let _ = write!(w, "bl\t{name}");
                }
                _ => {
                    let _ = write!(w, "blx\t{}", otext(func, target));
                }
            }
            if let Some(d) = dest {
                let _ = write!(w, "\t@ -> {}", vtext(func, *d));
            }
        }
        ArmInst::Br(ArmBr::Uncond { target }) => {
            let _ = write!(w, "b\tL{}", target.0);
        }
        ArmInst::Br(ArmBr::Cond {
            cond,
            on_true,
            on_false,
        }) => {
            let _ = write!(w, "b{}\tL{}", cond.suffix(), on_true.0);
            if let Some(f) = on_false {
                let _ = write!(w, "\n  b\tL{}", f.0);
            }
        }
        ArmInst::Ret { .. } => {
            let _ = write!(w, "bx\tlr");
        }
        ArmInst::Trap => {
            // The encoding both ARM and Thumb treat as permanently
            // undefined.
            let _ = write!(w, ".word\t0xe7fedef0");
        }
        ArmInst::BundleLock => {
            let _ = write!(w, ".bundle_lock");
        }
        ArmInst::BundleUnlock => {
            let _ = write!(w, ".bundle_unlock");
        }
    }
}
