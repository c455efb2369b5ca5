//! ARM32 lowering context.
//!
//! `TargetArm32` wraps the function under translation together with the
//! per-function frame state and the buffer that collects lowered
//! instructions. The operand legalizer and the i64 splitter live here; the
//! per-opcode lowering is in `lower`, frame construction in `frame`.

use std::collections::HashMap;

use tracing::warn;

use tarmac_ir::{
    FlexImm, Func, GlobalContext, Inst, InstKind, MemIndex, MemOperand, Operand, RegNum, ShiftOp,
    Type, VarId, Weight,
};

use crate::cond::Cond;
use crate::inst::{AluOp, ArmInst};
use crate::registers::{self, register_set, RegSetMask, NUM_REGS};

/// Legal operand forms, combined as a bitmask.
pub const LEGAL_REG: u8 = 1 << 0;
pub const LEGAL_FLEX: u8 = 1 << 1;
pub const LEGAL_MEM: u8 = 1 << 2;
pub const LEGAL_ALL: u8 = LEGAL_REG | LEGAL_FLEX | LEGAL_MEM;

pub struct TargetArm32<'a> {
    pub(crate) func: &'a mut Func<ArmInst>,
    pub(crate) ctx: &'a GlobalContext,
    /// Buffer receiving lowered instructions for the current position.
    pub(crate) cur: Vec<Inst<ArmInst>>,
    phys_regs: HashMap<(RegNum, Type), VarId>,
    pub(crate) uses_frame_pointer: bool,
    pub(crate) needs_stack_alignment: bool,
    pub(crate) maybe_leaf_func: bool,
    pub(crate) spill_area_size_bytes: u32,
    pub(crate) regs_used: Vec<bool>,
}

impl<'a> TargetArm32<'a> {
    pub fn new(func: &'a mut Func<ArmInst>, ctx: &'a GlobalContext) -> TargetArm32<'a> {
        TargetArm32 {
            func,
            ctx,
            cur: Vec::new(),
            phys_regs: HashMap::new(),
            uses_frame_pointer: false,
            needs_stack_alignment: false,
            maybe_leaf_func: true,
            spill_area_size_bytes: 0,
            regs_used: vec![false; NUM_REGS],
        }
    }

    // ------------------------------------------------------------------
    // Emission into the current buffer
    // ------------------------------------------------------------------

    pub(crate) fn emit(&mut self, inst: ArmInst) {
        self.cur.push(Inst::target(inst));
    }

    pub(crate) fn emit_kind(&mut self, kind: InstKind<ArmInst>) {
        self.cur.push(Inst::new(kind));
    }

    pub(crate) fn take_cur(&mut self) -> Vec<Inst<ArmInst>> {
        std::mem::take(&mut self.cur)
    }

    pub(crate) fn alu(&mut self, op: AluOp, dest: VarId, src0: VarId, src1: Operand) {
        self.emit(ArmInst::Alu {
            op,
            set_flags: false,
            pred: Cond::Al,
            dest,
            src0,
            src1,
        });
    }

    pub(crate) fn alu_flags(&mut self, op: AluOp, dest: VarId, src0: VarId, src1: Operand) {
        self.emit(ArmInst::Alu {
            op,
            set_flags: true,
            pred: Cond::Al,
            dest,
            src0,
            src1,
        });
    }

    pub(crate) fn alu_pred(
        &mut self,
        op: AluOp,
        pred: Cond,
        dest: VarId,
        src0: VarId,
        src1: Operand,
    ) {
        self.emit(ArmInst::Alu {
            op,
            set_flags: false,
            pred,
            dest,
            src0,
            src1,
        });
    }

    pub(crate) fn mov(&mut self, dest: VarId, src: Operand) {
        self.mov_pred(dest, src, Cond::Al);
    }

    pub(crate) fn mov_pred(&mut self, dest: VarId, src: Operand, pred: Cond) {
        self.emit(ArmInst::Mov {
            dest,
            src,
            pred,
            nonkillable: false,
        });
    }

    pub(crate) fn mov_nonkillable(&mut self, dest: VarId, src: Operand, pred: Cond) {
        self.emit(ArmInst::Mov {
            dest,
            src,
            pred,
            nonkillable: true,
        });
    }

    pub(crate) fn fake_use(&mut self, var: VarId) {
        self.emit_kind(InstKind::FakeUse { var });
    }

    pub(crate) fn fake_def(&mut self, dest: VarId) {
        self.emit_kind(InstKind::FakeDef { dest, src: None });
    }

    /// Kill pseudo for the caller-save set, placed after calls.
    pub(crate) fn fake_kill_scratch(&mut self) {
        let caller_save = register_set(RegSetMask::CALLER_SAVE, RegSetMask::NONE);
        let killed: Vec<VarId> = (0..NUM_REGS as RegNum)
            .filter(|&r| caller_save[r as usize])
            .map(|r| self.get_physical_register(r, Type::I32))
            .collect();
        self.emit_kind(InstKind::FakeKill { killed });
    }

    /// The single choke point for lowerings this target does not provide.
    /// Honors the compile-skip flag: skip silently (the object stays
    /// linkable but partial) or abort.
    pub(crate) fn unimplemented(&mut self) {
        if self.ctx.flags().skip_unimplemented {
            warn!(func = %self.func.name, "skipping unimplemented lowering");
        } else {
            panic!("not yet implemented");
        }
    }

    // ------------------------------------------------------------------
    // Variables and registers
    // ------------------------------------------------------------------

    /// Fresh register-class variable. Without a fixed register it gets
    /// infinite weight so allocation cannot spill it.
    pub(crate) fn make_reg(&mut self, ty: Type, reg: Option<RegNum>) -> VarId {
        // There are no 64-bit GPRs; i64 values must be split first.
        debug_assert!(ty != Type::I64);
        let v = self.func.make_variable(ty);
        match reg {
            None => self.func.var_mut(v).weight = Weight::Inf,
            Some(r) => self.func.var_mut(v).reg = Some(r),
        }
        v
    }

    /// Cached per-(register, type) physical register variable. SP and LR
    /// are live on entry and ignored by liveness.
    pub(crate) fn get_physical_register(&mut self, reg: RegNum, ty: Type) -> VarId {
        let ty = if ty == Type::Void { Type::I32 } else { ty };
        if let Some(&v) = self.phys_regs.get(&(reg, ty)) {
            return v;
        }
        let v = self.func.make_named_variable(ty, registers::reg_name(reg));
        {
            let var = self.func.var_mut(v);
            var.reg = Some(reg);
            if reg == registers::SP || reg == registers::LR {
                var.ignore_liveness = true;
            }
        }
        self.phys_regs.insert((reg, ty), v);
        v
    }

    // ------------------------------------------------------------------
    // i64 splitting
    // ------------------------------------------------------------------

    /// Install the lo/hi i32 halves of an i64 variable. Idempotent.
    pub(crate) fn split64(&mut self, var: VarId) {
        debug_assert_eq!(self.func.var(var).ty, Type::I64);
        if self.func.var(var).lo.is_some() {
            debug_assert!(self.func.var(var).hi.is_some());
            return;
        }
        debug_assert!(self.func.var(var).hi.is_none());
        let is_arg = self.func.var(var).is_arg;
        let base = self.func.var(var).name.clone();
        let (lo, hi) = match base {
            Some(n) => (
                self.func
                    .make_named_variable(Type::I32, format!("{n}__lo")),
                self.func
                    .make_named_variable(Type::I32, format!("{n}__hi")),
            ),
            None => (
                self.func.make_variable(Type::I32),
                self.func.make_variable(Type::I32),
            ),
        };
        self.func.var_mut(var).set_lo_hi(lo, hi);
        if is_arg {
            self.func.var_mut(lo).is_arg = true;
            self.func.var_mut(hi).is_arg = true;
        }
    }

    pub(crate) fn lo_operand(&mut self, op: &Operand) -> Operand {
        debug_assert_eq!(self.func.operand_type(op), Type::I64);
        match op {
            Operand::Var(v) => {
                self.split64(*v);
                Operand::Var(self.func.var(*v).lo.unwrap())
            }
            Operand::Const64(k) => Operand::i32(*k as i32),
            Operand::Mem(mem) => {
                // Writeback modes must not be duplicated across the halves.
                debug_assert!(mem.mode.is_plain());
                Operand::Mem(MemOperand {
                    ty: Type::I32,
                    ..*mem
                })
            }
            _ => unreachable!("unsupported operand for i64 split"),
        }
    }

    pub(crate) fn hi_operand(&mut self, op: &Operand) -> Operand {
        debug_assert_eq!(self.func.operand_type(op), Type::I64);
        match op {
            Operand::Var(v) => {
                self.split64(*v);
                Operand::Var(self.func.var(*v).hi.unwrap())
            }
            Operand::Const64(k) => Operand::i32((*k >> 32) as i32),
            Operand::Mem(mem) => {
                debug_assert!(mem.mode.is_plain());
                let mem = *mem;
                match mem.index {
                    MemIndex::RegReg { .. } => {
                        // The index may be shifted, so always bump the base.
                        let new_base = self.func.make_variable(Type::I32);
                        self.lower_arithmetic(
                            tarmac_ir::ArithOp::Add,
                            new_base,
                            &Operand::Var(mem.base),
                            &Operand::i32(4),
                        );
                        Operand::Mem(MemOperand {
                            ty: Type::I32,
                            base: new_base,
                            ..mem
                        })
                    }
                    MemIndex::Imm(offset) => {
                        let next = offset + 4;
                        if MemOperand::can_hold_offset(Type::I32, false, next) {
                            Operand::Mem(MemOperand {
                                ty: Type::I32,
                                index: MemIndex::Imm(next),
                                ..mem
                            })
                        } else {
                            // Bump the base and keep the old offset rather
                            // than converting to a RegReg form.
                            let new_base = self.func.make_variable(Type::I32);
                            self.lower_arithmetic(
                                tarmac_ir::ArithOp::Add,
                                new_base,
                                &Operand::Var(mem.base),
                                &Operand::i32(4),
                            );
                            Operand::Mem(MemOperand {
                                ty: Type::I32,
                                base: new_base,
                                ..mem
                            })
                        }
                    }
                }
            }
            _ => unreachable!("unsupported operand for i64 split"),
        }
    }

    // ------------------------------------------------------------------
    // Legalization
    // ------------------------------------------------------------------

    /// Copy `src` into a fresh register (honoring `reg_hint`).
    pub(crate) fn copy_to_reg(&mut self, src: &Operand, reg_hint: Option<RegNum>) -> VarId {
        let ty = self.func.operand_type(src);
        if ty.is_vector() {
            self.unimplemented();
        }
        let reg = self.make_reg(ty, reg_hint);
        self.mov(reg, src.clone());
        reg
    }

    /// Convert `from` into one of the `allowed` forms, emitting
    /// materialization code as needed. A register is always allowed.
    pub(crate) fn legalize(
        &mut self,
        from: &Operand,
        allowed: u8,
        reg_hint: Option<RegNum>,
    ) -> Operand {
        assert!(allowed & LEGAL_REG != 0);
        match from {
            Operand::Mem(mem) => {
                let mem = *mem;
                // Base and index must be in physical registers first.
                let reg_base = self.legalize_to_var(&Operand::Var(mem.base), None);
                let index = match mem.index {
                    MemIndex::RegReg { index, shift, amt } => {
                        let reg_index = self.legalize_to_var(&Operand::Var(index), None);
                        MemIndex::RegReg {
                            index: reg_index,
                            shift,
                            amt,
                        }
                    }
                    imm @ MemIndex::Imm(_) => imm,
                };
                let mem = MemOperand {
                    base: reg_base,
                    index,
                    ..mem
                };
                if allowed & LEGAL_MEM == 0 {
                    let reg = self.make_reg(mem.ty, reg_hint);
                    self.emit(ArmInst::Ldr { dest: reg, mem });
                    Operand::Var(reg)
                } else {
                    Operand::Mem(mem)
                }
            }
            Operand::FlexImm { .. } => {
                if allowed & LEGAL_FLEX != 0 {
                    from.clone()
                } else {
                    Operand::Var(self.copy_to_reg(from, reg_hint))
                }
            }
            Operand::FlexReg(fr) => {
                if allowed & LEGAL_FLEX != 0 {
                    from.clone()
                } else if fr.shift == ShiftOp::None {
                    // Collapse to the underlying variable and re-evaluate.
                    self.legalize(&Operand::Var(fr.reg), allowed, reg_hint)
                } else {
                    Operand::Var(self.copy_to_reg(from, reg_hint))
                }
            }
            Operand::Undef(ty) => {
                // Lower undef to a typed zero; an uninitialized register
                // would make the output unpredictable.
                let ty = *ty;
                if ty.is_vector() {
                    self.unimplemented();
                }
                self.legalize(&Operand::zero(ty), allowed, reg_hint)
            }
            Operand::Const32 { ty, value } => {
                let ty = *ty;
                let value = *value as u32;
                let can_be_flex = allowed & LEGAL_FLEX != 0;
                if can_be_flex {
                    if let Some(imm) = FlexImm::try_new(value) {
                        return Operand::FlexImm { ty, imm };
                    }
                    if let Some(imm) = FlexImm::try_new(!value) {
                        let reg = self.make_reg(ty, reg_hint);
                        self.emit(ArmInst::Mvn {
                            dest: reg,
                            src: Operand::FlexImm { ty, imm },
                        });
                        return Operand::Var(reg);
                    }
                }
                // movw, plus movt when the upper half is nonzero.
                let reg = self.make_reg(ty, reg_hint);
                let upper = (value >> 16) & 0xFFFF;
                let lower = value & 0xFFFF;
                self.emit(ArmInst::Movw {
                    dest: reg,
                    src: Operand::Const32 {
                        ty: Type::I32,
                        value: lower as i32,
                    },
                });
                if upper != 0 {
                    self.emit(ArmInst::Movt {
                        dest: reg,
                        src: Operand::Const32 {
                            ty: Type::I32,
                            value: upper as i32,
                        },
                    });
                }
                Operand::Var(reg)
            }
            Operand::Reloc { .. } => {
                // The symbol's value is not known here, so no flex check:
                // movw/movt of the low/high halves.
                let reg = self.make_reg(Type::I32, reg_hint);
                self.emit(ArmInst::Movw {
                    dest: reg,
                    src: from.clone(),
                });
                self.emit(ArmInst::Movt {
                    dest: reg,
                    src: from.clone(),
                });
                Operand::Var(reg)
            }
            Operand::ConstF32(_) | Operand::ConstF64(_) | Operand::Const64(_) => {
                // Literal-pool loads are not implemented.
                self.unimplemented();
                Operand::Var(self.copy_to_reg(from, reg_hint))
            }
            Operand::Var(v) => {
                let v = *v;
                let (must_have_reg, cur_reg) = {
                    let var = self.func.var(v);
                    (var.must_have_reg(), var.reg)
                };
                // Copy when memory is not allowed and the variable may be
                // spilled, or when a specific register is required.
                let hint_mismatch = reg_hint.is_some() && reg_hint != cur_reg;
                if (allowed & LEGAL_MEM == 0 && !must_have_reg) || hint_mismatch {
                    Operand::Var(self.copy_to_reg(from, reg_hint))
                } else {
                    from.clone()
                }
            }
        }
    }

    pub(crate) fn legalize_to_var(&mut self, from: &Operand, reg_hint: Option<RegNum>) -> VarId {
        match self.legalize(from, LEGAL_REG, reg_hint) {
            Operand::Var(v) => v,
            _ => unreachable!("legalize(Reg) must produce a variable"),
        }
    }

    /// Canonical memory operand for a load/store address.
    pub(crate) fn form_memory_operand(&mut self, addr: &Operand, ty: Type) -> MemOperand {
        if matches!(addr, Operand::Mem(_)) {
            // Address-mode optimization may already have built one; it only
            // needs its components legalized.
            match self.legalize(addr, LEGAL_ALL, None) {
                Operand::Mem(mem) => return mem,
                _ => unreachable!(),
            }
        }
        let base = self.legalize_to_var(addr, None);
        MemOperand::with_offset(ty, base, 0)
    }

    /// Round a register down to a power-of-two alignment. BIC with the
    /// small mask when it encodes, otherwise AND with the negated mask.
    pub(crate) fn align_register_pow2(&mut self, reg: VarId, align: u32) {
        debug_assert!(align.is_power_of_two());
        if FlexImm::try_new(align - 1).is_some() {
            let mask = self.legalize(
                &Operand::i32((align - 1) as i32),
                LEGAL_REG | LEGAL_FLEX,
                None,
            );
            self.alu(AluOp::Bic, reg, reg, mask);
        } else {
            let mask = self.legalize(&Operand::i32(-(align as i32)), LEGAL_REG | LEGAL_FLEX, None);
            self.alu(AluOp::And, reg, reg, mask);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tarmac_ir::Flags;

    fn with_target<R>(f: impl FnOnce(&mut TargetArm32) -> R) -> R {
        let ctx = GlobalContext::with_output(Flags::default(), Box::new(std::io::sink()));
        let mut func = Func::<ArmInst>::new("t", Type::Void);
        func.add_node();
        let mut target = TargetArm32::new(&mut func, &ctx);
        f(&mut target)
    }

    fn arm(inst: &Inst<ArmInst>) -> &ArmInst {
        match &inst.kind {
            InstKind::Target(t) => t,
            other => panic!("expected target inst, got {other:?}"),
        }
    }

    #[test]
    fn test_legalize_flex_constant() {
        with_target(|t| {
            let out = t.legalize(&Operand::i32(255), LEGAL_REG | LEGAL_FLEX, None);
            assert!(matches!(out, Operand::FlexImm { .. }));
            assert!(t.cur.is_empty());
        });
    }

    #[test]
    fn test_legalize_inverted_constant_uses_mvn() {
        with_target(|t| {
            // !0xFFFFFF00 == 0xFF, so this materializes via mvn.
            let out = t.legalize(&Operand::i32(-256), LEGAL_REG | LEGAL_FLEX, None);
            assert!(matches!(out, Operand::Var(_)));
            assert_eq!(t.cur.len(), 1);
            assert!(matches!(arm(&t.cur[0]), ArmInst::Mvn { .. }));
        });
    }

    #[test]
    fn test_legalize_large_constant_movw_movt() {
        with_target(|t| {
            let out = t.legalize(&Operand::i32(0x12345678), LEGAL_REG | LEGAL_FLEX, None);
            assert!(matches!(out, Operand::Var(_)));
            assert_eq!(t.cur.len(), 2);
            match (arm(&t.cur[0]), arm(&t.cur[1])) {
                (ArmInst::Movw { src: w, .. }, ArmInst::Movt { src: u, .. }) => {
                    assert!(matches!(w, Operand::Const32 { value: 0x5678, .. }));
                    assert!(matches!(u, Operand::Const32 { value: 0x1234, .. }));
                }
                other => panic!("unexpected sequence: {other:?}"),
            }
        });
    }

    #[test]
    fn test_legalize_low_constant_single_movw() {
        with_target(|t| {
            // Not flex-encodable, upper half zero: movw alone.
            let out = t.legalize(&Operand::i32(0x1234), LEGAL_REG, None);
            assert!(matches!(out, Operand::Var(_)));
            // Flex not allowed, so even an encodable value goes to a reg;
            // 0x1234 is not flex-encodable anyway.
            assert_eq!(t.cur.len(), 1);
            assert!(matches!(arm(&t.cur[0]), ArmInst::Movw { .. }));
        });
    }

    #[test]
    fn test_legalize_undef_becomes_zero() {
        with_target(|t| {
            let out = t.legalize(&Operand::Undef(Type::I32), LEGAL_REG | LEGAL_FLEX, None);
            match out {
                Operand::FlexImm { imm, .. } => assert_eq!(imm.value(), 0),
                other => panic!("expected flex zero, got {other:?}"),
            }
        });
    }

    #[test]
    fn test_split64_idempotent() {
        with_target(|t| {
            let v = t.func.make_variable(Type::I64);
            t.split64(v);
            let (lo, hi) = (t.func.var(v).lo.unwrap(), t.func.var(v).hi.unwrap());
            t.split64(v);
            assert_eq!(t.func.var(v).lo.unwrap(), lo);
            assert_eq!(t.func.var(v).hi.unwrap(), hi);
            assert_ne!(lo, hi);
        });
    }

    #[test]
    fn test_i64_constant_halves() {
        with_target(|t| {
            let k = Operand::Const64(0x0102_0304_0506_0708);
            let lo = t.lo_operand(&k);
            let hi = t.hi_operand(&k);
            assert!(matches!(lo, Operand::Const32 { value: 0x0506_0708, .. }));
            assert!(matches!(hi, Operand::Const32 { value: 0x0102_0304, .. }));
        });
    }

    #[test]
    fn test_i64_mem_halves() {
        with_target(|t| {
            let base = t.func.make_variable(Type::I32);
            let mem = Operand::Mem(MemOperand::with_offset(Type::I64, base, 8));
            let lo = t.lo_operand(&mem);
            let hi = t.hi_operand(&mem);
            match (lo, hi) {
                (Operand::Mem(lo), Operand::Mem(hi)) => {
                    assert_eq!(lo.ty, Type::I32);
                    assert_eq!(lo.offset(), 8);
                    assert_eq!(hi.offset(), 12);
                    assert_eq!(lo.base, hi.base);
                }
                other => panic!("expected mem halves, got {other:?}"),
            }
        });
    }
}
