//! Per-opcode lowering from high-level IR to ARM32 IR.

use tarmac_ir::{
    ArithOp, BrKind, CastKind, FlexReg, IcmpCond, InstKind, Intrinsic, Operand, ShiftAmt, ShiftOp,
    Type, VarId,
};

use crate::cond::{icmp32_cond, icmp64_entry, Cond};
use crate::inst::{AluOp, ArmBr, ArmInst};
use crate::registers::{LR, R0, R1, SP, STACK_ALIGNMENT_BYTES};
use crate::target::{TargetArm32, LEGAL_ALL, LEGAL_FLEX, LEGAL_REG};

impl TargetArm32<'_> {
    /// Lower one high-level instruction into the current buffer.
    pub(crate) fn lower_inst(&mut self, kind: &InstKind<ArmInst>) {
        match kind {
            InstKind::Alloca { dest, size, align } => self.lower_alloca(*dest, size, *align),
            InstKind::Arithmetic {
                op,
                dest,
                src0,
                src1,
            } => self.lower_arithmetic(*op, *dest, src0, src1),
            InstKind::Assign { dest, src } => self.lower_assign(*dest, src),
            InstKind::Br(kind) => self.lower_br(kind),
            InstKind::Call {
                dest,
                target,
                args,
                side_effects,
                ..
            } => self.lower_call(*dest, target, args, *side_effects),
            InstKind::Cast { kind, dest, src } => self.lower_cast(*kind, *dest, src),
            InstKind::Icmp {
                cond,
                dest,
                src0,
                src1,
            } => self.lower_icmp(*cond, *dest, src0, src1),
            InstKind::IntrinsicCall { id, dest, args } => {
                self.lower_intrinsic_call(*id, *dest, args)
            }
            InstKind::Load { dest, addr } => self.lower_load(*dest, addr),
            InstKind::Phi { .. } => {
                self.func.set_error("Phi found in regular instruction list");
            }
            InstKind::Ret { value } => self.lower_ret(value.as_ref()),
            InstKind::Store { value, addr } => self.lower_store(value, addr),
            InstKind::Unreachable => self.lower_unreachable(),
            InstKind::FakeDef { .. }
            | InstKind::FakeUse { .. }
            | InstKind::FakeKill { .. }
            | InstKind::Target(_) => {
                unreachable!("pseudo and target instructions are not lowered")
            }
        }
    }

    fn flex_const(&mut self, value: i32) -> Operand {
        self.legalize(&Operand::i32(value), LEGAL_REG | LEGAL_FLEX, None)
    }

    fn lower_alloca(&mut self, dest: VarId, size: &Operand, align: u32) {
        self.uses_frame_pointer = true;
        // The adjustments below assume an aligned stack and keep it so.
        self.needs_stack_alignment = true;

        let sp = self.get_physical_register(SP, Type::I32);
        let align = align.max(1);
        debug_assert!(align.is_power_of_two());
        let alignment = align.max(STACK_ALIGNMENT_BYTES);
        if alignment > STACK_ALIGNMENT_BYTES {
            self.align_register_pow2(sp, alignment);
        }
        match size {
            Operand::Const32 { value, .. } => {
                let total = tarmac_ir::apply_alignment(*value as u32, alignment);
                let sub_amount = self.legalize(&Operand::i32(total as i32), LEGAL_ALL, None);
                self.alu(AluOp::Sub, sp, sp, sub_amount);
            }
            _ => {
                // Dynamic sizes round up to the alignment at runtime.
                let total = self.legalize(size, LEGAL_ALL, None);
                let t = self.make_reg(Type::I32, None);
                self.mov(t, total);
                let add_amount = self.legalize(&Operand::i32(alignment as i32 - 1), LEGAL_ALL, None);
                self.alu(AluOp::Add, t, t, add_amount);
                self.align_register_pow2(t, alignment);
                self.alu(AluOp::Sub, sp, sp, Operand::Var(t));
            }
        }
        self.mov(dest, Operand::Var(sp));
    }

    pub(crate) fn lower_arithmetic(
        &mut self,
        op: ArithOp,
        dest: VarId,
        src0: &Operand,
        src1: &Operand,
    ) {
        let dest_ty = self.func.var(dest).ty;
        if dest_ty == Type::I64 {
            self.lower_arithmetic64(op, dest, src0, src1);
        } else if dest_ty.is_vector() {
            self.unimplemented();
        } else {
            let src0_r = self.legalize_to_var(src0, None);
            let src1_rf = self.legalize(src1, LEGAL_REG | LEGAL_FLEX, None);
            let t = self.make_reg(dest_ty, None);
            let alu_op = match op {
                ArithOp::Add => AluOp::Add,
                ArithOp::And => AluOp::And,
                ArithOp::Or => AluOp::Orr,
                ArithOp::Xor => AluOp::Eor,
                ArithOp::Sub => AluOp::Sub,
                ArithOp::Shl => AluOp::Lsl,
                ArithOp::Lshr => AluOp::Lsr,
                ArithOp::Ashr => AluOp::Asr,
                ArithOp::Mul => {
                    // mul takes registers only.
                    let src1_r = self.legalize_to_var(&src1_rf, None);
                    self.alu(AluOp::Mul, t, src0_r, Operand::Var(src1_r));
                    self.mov(dest, Operand::Var(t));
                    return;
                }
                ArithOp::Udiv
                | ArithOp::Sdiv
                | ArithOp::Urem
                | ArithOp::Srem
                | ArithOp::Fadd
                | ArithOp::Fsub
                | ArithOp::Fmul
                | ArithOp::Fdiv
                | ArithOp::Frem => {
                    self.unimplemented();
                    return;
                }
            };
            self.alu(alu_op, t, src0_r, src1_rf);
            self.mov(dest, Operand::Var(t));
        }
    }

    fn lower_arithmetic64(&mut self, op: ArithOp, dest: VarId, src0: &Operand, src1: &Operand) {
        self.split64(dest);
        let dest_lo = self.func.var(dest).lo.unwrap();
        let dest_hi = self.func.var(dest).hi.unwrap();
        let src0_lo_op = self.lo_operand(src0);
        let src0_hi_op = self.hi_operand(src0);
        let src0_r_lo = self.legalize_to_var(&src0_lo_op, None);
        let src0_r_hi = self.legalize_to_var(&src0_hi_op, None);
        let src1_lo_op = self.lo_operand(src1);
        let src1_hi_op = self.hi_operand(src1);
        let src1_lo = self.legalize(&src1_lo_op, LEGAL_REG | LEGAL_FLEX, None);
        let src1_hi = self.legalize(&src1_hi_op, LEGAL_REG | LEGAL_FLEX, None);
        let t_lo = self.make_reg(Type::I32, None);
        let t_hi = self.make_reg(Type::I32, None);
        match op {
            ArithOp::Add => {
                self.alu_flags(AluOp::Add, t_lo, src0_r_lo, src1_lo);
                self.mov(dest_lo, Operand::Var(t_lo));
                self.alu(AluOp::Adc, t_hi, src0_r_hi, src1_hi);
                self.mov(dest_hi, Operand::Var(t_hi));
            }
            ArithOp::And => {
                self.alu(AluOp::And, t_lo, src0_r_lo, src1_lo);
                self.mov(dest_lo, Operand::Var(t_lo));
                self.alu(AluOp::And, t_hi, src0_r_hi, src1_hi);
                self.mov(dest_hi, Operand::Var(t_hi));
            }
            ArithOp::Or => {
                self.alu(AluOp::Orr, t_lo, src0_r_lo, src1_lo);
                self.mov(dest_lo, Operand::Var(t_lo));
                self.alu(AluOp::Orr, t_hi, src0_r_hi, src1_hi);
                self.mov(dest_hi, Operand::Var(t_hi));
            }
            ArithOp::Xor => {
                self.alu(AluOp::Eor, t_lo, src0_r_lo, src1_lo);
                self.mov(dest_lo, Operand::Var(t_lo));
                self.alu(AluOp::Eor, t_hi, src0_r_hi, src1_hi);
                self.mov(dest_hi, Operand::Var(t_hi));
            }
            ArithOp::Sub => {
                self.alu_flags(AluOp::Sub, t_lo, src0_r_lo, src1_lo);
                self.mov(dest_lo, Operand::Var(t_lo));
                self.alu(AluOp::Sbc, t_hi, src0_r_hi, src1_hi);
                self.mov(dest_hi, Operand::Var(t_hi));
            }
            ArithOp::Mul => {
                // t_acc  = b.lo * c.hi
                // t_acc1 = c.lo * b.hi + t_acc
                // t.hi1:t.lo = b.lo * c.lo
                // t.hi = t.hi1 + t_acc1
                // Delaying the two-dest umull keeps c.hi's range short.
                let t_acc = self.make_reg(Type::I32, None);
                let t_acc1 = self.make_reg(Type::I32, None);
                let t_hi1 = self.make_reg(Type::I32, None);
                let src1_r_lo = self.legalize_to_var(&src1_lo, None);
                let src1_r_hi = self.legalize_to_var(&src1_hi, None);
                self.alu(AluOp::Mul, t_acc, src0_r_lo, Operand::Var(src1_r_hi));
                self.emit(ArmInst::Mla {
                    dest: t_acc1,
                    src0: src1_r_lo,
                    src1: src0_r_hi,
                    acc: t_acc,
                });
                self.emit(ArmInst::Umull {
                    dest_lo: t_lo,
                    dest_hi: t_hi1,
                    src0: src0_r_lo,
                    src1: src1_r_lo,
                });
                self.alu(AluOp::Add, t_hi, t_hi1, Operand::Var(t_acc1));
                self.mov(dest_lo, Operand::Var(t_lo));
                self.mov(dest_hi, Operand::Var(t_hi));
            }
            ArithOp::Shl => {
                // sub t_c1, c.lo, #32
                // lsl t_hi, b.hi, c.lo
                // orr t_hi, t_hi, b.lo, lsl t_c1
                // rsb t_c2, c.lo, #32
                // orr t_hi, t_hi, b.lo, lsr t_c2
                // lsl t_lo, b.lo, c.lo
                // One of t_c1/t_c2 is negative; ARM register shifts saturate
                // at 32, which is exactly what makes this correct.
                let src1_r_lo = self.legalize_to_var(&src1_lo, None);
                let thirty_two = self.flex_const(32);
                let t_c1 = self.make_reg(Type::I32, None);
                let t_c2 = self.make_reg(Type::I32, None);
                self.alu(AluOp::Sub, t_c1, src1_r_lo, thirty_two.clone());
                self.alu(AluOp::Lsl, t_hi, src0_r_hi, Operand::Var(src1_r_lo));
                self.alu(
                    AluOp::Orr,
                    t_hi,
                    t_hi,
                    Operand::FlexReg(FlexReg {
                        ty: Type::I32,
                        reg: src0_r_lo,
                        shift: ShiftOp::Lsl,
                        amt: ShiftAmt::Reg(t_c1),
                    }),
                );
                self.alu(AluOp::Rsb, t_c2, src1_r_lo, thirty_two);
                self.alu(
                    AluOp::Orr,
                    t_hi,
                    t_hi,
                    Operand::FlexReg(FlexReg {
                        ty: Type::I32,
                        reg: src0_r_lo,
                        shift: ShiftOp::Lsr,
                        amt: ShiftAmt::Reg(t_c2),
                    }),
                );
                self.mov(dest_hi, Operand::Var(t_hi));
                // mov with a shifted-register operand is the lsl pseudo and
                // tends to get better register preferencing.
                self.mov(
                    t_lo,
                    Operand::FlexReg(FlexReg {
                        ty: Type::I32,
                        reg: src0_r_lo,
                        shift: ShiftOp::Lsl,
                        amt: ShiftAmt::Reg(src1_r_lo),
                    }),
                );
                self.mov(dest_lo, Operand::Var(t_lo));
            }
            ArithOp::Lshr | ArithOp::Ashr => {
                // rsb t_c1, c.lo, #32
                // lsr t_lo, b.lo, c.lo
                // orr t_lo, t_lo, b.hi, lsl t_c1
                // sub t_c2, c.lo, #32        (subs for ashr)
                // orr t_lo, t_lo, b.hi, lsr t_c2   (asr, predicated pl, for ashr)
                // lsr t_hi, b.hi, c.lo       (asr for ashr)
                let is_ashr = op == ArithOp::Ashr;
                let src1_r_lo = self.legalize_to_var(&src1_lo, None);
                let thirty_two = self.flex_const(32);
                let t_c1 = self.make_reg(Type::I32, None);
                let t_c2 = self.make_reg(Type::I32, None);
                self.alu(AluOp::Rsb, t_c1, src1_r_lo, thirty_two.clone());
                self.alu(AluOp::Lsr, t_lo, src0_r_lo, Operand::Var(src1_r_lo));
                self.alu(
                    AluOp::Orr,
                    t_lo,
                    t_lo,
                    Operand::FlexReg(FlexReg {
                        ty: Type::I32,
                        reg: src0_r_hi,
                        shift: ShiftOp::Lsl,
                        amt: ShiftAmt::Reg(t_c1),
                    }),
                );
                let (rshift, pred) = if is_ashr {
                    self.alu_flags(AluOp::Sub, t_c2, src1_r_lo, thirty_two);
                    (ShiftOp::Asr, Cond::Pl)
                } else {
                    self.alu(AluOp::Sub, t_c2, src1_r_lo, thirty_two);
                    (ShiftOp::Lsr, Cond::Al)
                };
                self.alu_pred(
                    AluOp::Orr,
                    pred,
                    t_lo,
                    t_lo,
                    Operand::FlexReg(FlexReg {
                        ty: Type::I32,
                        reg: src0_r_hi,
                        shift: rshift,
                        amt: ShiftAmt::Reg(t_c2),
                    }),
                );
                self.mov(dest_lo, Operand::Var(t_lo));
                self.mov(
                    t_hi,
                    Operand::FlexReg(FlexReg {
                        ty: Type::I32,
                        reg: src0_r_hi,
                        shift: rshift,
                        amt: ShiftAmt::Reg(src1_r_lo),
                    }),
                );
                self.mov(dest_hi, Operand::Var(t_hi));
            }
            ArithOp::Udiv | ArithOp::Sdiv | ArithOp::Urem | ArithOp::Srem => {
                self.unimplemented();
            }
            ArithOp::Fadd | ArithOp::Fsub | ArithOp::Fmul | ArithOp::Fdiv | ArithOp::Frem => {
                panic!("FP instruction with i64 type");
            }
        }
    }

    fn lower_assign(&mut self, dest: VarId, src: &Operand) {
        let dest_ty = self.func.var(dest).ty;
        debug_assert_eq!(dest_ty, self.func.operand_type(src));
        if dest_ty == Type::I64 {
            let src = self.legalize(src, LEGAL_ALL, None);
            let src_lo = self.lo_operand(&src);
            let src_hi = self.hi_operand(&src);
            self.split64(dest);
            let dest_lo = self.func.var(dest).lo.unwrap();
            let dest_hi = self.func.var(dest).hi.unwrap();
            // Fresh temporaries keep the copies SSA-shaped for liveness.
            let t_lo = self.make_reg(Type::I32, None);
            self.mov(t_lo, src_lo);
            self.mov(dest_lo, Operand::Var(t_lo));
            let t_hi = self.make_reg(Type::I32, None);
            self.mov(t_hi, src_hi);
            self.mov(dest_hi, Operand::Var(t_hi));
        } else if dest_ty.is_vector() {
            self.unimplemented();
        } else {
            let dest_reg = self.func.var(dest).reg;
            // A pre-colored dest constrains the source to the same register;
            // a possibly-spilled dest needs the source in some register.
            let src_r = self.legalize(src, LEGAL_REG, dest_reg);
            self.mov(dest, src_r);
        }
    }

    fn lower_br(&mut self, kind: &BrKind) {
        match kind {
            BrKind::Uncond { target } => {
                self.emit(ArmInst::Br(ArmBr::Uncond { target: *target }));
            }
            BrKind::Cond {
                cond,
                on_true,
                on_false,
            } => {
                let src0_r = self.legalize_to_var(cond, None);
                let zero = self.flex_const(0);
                self.emit(ArmInst::Cmp {
                    src0: src0_r,
                    src1: zero,
                    pred: Cond::Al,
                });
                self.emit(ArmInst::Br(ArmBr::Cond {
                    cond: Cond::Ne,
                    on_true: *on_true,
                    on_false: Some(*on_false),
                }));
            }
        }
    }

    pub(crate) fn lower_call(
        &mut self,
        dest: Option<VarId>,
        target: &Operand,
        args: &[Operand],
        side_effects: bool,
    ) {
        self.maybe_leaf_func = false;

        // Outgoing argument assignment is not implemented yet.
        if !args.is_empty() {
            self.unimplemented();
        }

        // The result lands in r0 (and r1 for the i64 high half).
        let mut return_reg = None;
        let mut return_reg_hi = None;
        if let Some(d) = dest {
            match self.func.var(d).ty {
                Type::Void => {}
                Type::I1 | Type::I8 | Type::I16 | Type::I32 => {
                    let ty = self.func.var(d).ty;
                    return_reg = Some(self.make_reg(ty, Some(R0)));
                }
                Type::I64 => {
                    return_reg = Some(self.make_reg(Type::I32, Some(R0)));
                    return_reg_hi = Some(self.make_reg(Type::I32, Some(R1)));
                }
                _ => self.unimplemented(),
            }
        }

        // A relocatable stays a direct branch-link target; anything else
        // goes through a register as an indirect call.
        let call_target = match target {
            Operand::Reloc { .. } => target.clone(),
            _ => Operand::Var(self.legalize_to_var(target, None)),
        };
        self.emit(ArmInst::Call {
            dest: return_reg,
            target: call_target,
        });
        if let Some(hi) = return_reg_hi {
            self.fake_def(hi);
        }
        self.fake_kill_scratch();

        // Keep the result register live when the call must not be elided.
        if side_effects {
            if let Some(r) = return_reg {
                self.fake_use(r);
            }
        }

        let Some(d) = dest else { return };
        let Some(r) = return_reg else { return };
        if let Some(hi) = return_reg_hi {
            debug_assert_eq!(self.func.var(d).ty, Type::I64);
            self.split64(d);
            let dest_lo = self.func.var(d).lo.unwrap();
            let dest_hi = self.func.var(d).hi.unwrap();
            self.mov(dest_lo, Operand::Var(r));
            self.mov(dest_hi, Operand::Var(hi));
        } else {
            self.mov(d, Operand::Var(r));
        }
    }

    fn lower_cast(&mut self, kind: CastKind, dest: VarId, src: &Operand) {
        let dest_ty = self.func.var(dest).ty;
        let src_ty = self.func.operand_type(src);
        match kind {
            CastKind::Sext => {
                if dest_ty.is_vector() {
                    self.unimplemented();
                } else if dest_ty == Type::I64 {
                    // Sign-extend into lo, then copy the sign into hi.
                    let thirty_one = self.flex_const(31);
                    self.split64(dest);
                    let dest_lo = self.func.var(dest).lo.unwrap();
                    let dest_hi = self.func.var(dest).hi.unwrap();
                    let t_lo = self.make_reg(Type::I32, None);
                    if src_ty == Type::I32 {
                        let src_rf = self.legalize(src, LEGAL_REG | LEGAL_FLEX, None);
                        self.mov(t_lo, src_rf);
                    } else if src_ty == Type::I1 {
                        let src_r = self.legalize_to_var(src, None);
                        self.alu(AluOp::Lsl, t_lo, src_r, thirty_one.clone());
                        self.alu(AluOp::Asr, t_lo, t_lo, thirty_one.clone());
                    } else {
                        let src_r = self.legalize_to_var(src, None);
                        self.emit(ArmInst::Sxt {
                            dest: t_lo,
                            src: src_r,
                        });
                    }
                    self.mov(dest_lo, Operand::Var(t_lo));
                    let t_hi = self.make_reg(Type::I32, None);
                    if src_ty != Type::I1 {
                        self.mov(
                            t_hi,
                            Operand::FlexReg(FlexReg {
                                ty: Type::I32,
                                reg: t_lo,
                                shift: ShiftOp::Asr,
                                amt: ShiftAmt::Imm(31),
                            }),
                        );
                    } else {
                        // For i1 the asr above already smeared the sign.
                        self.mov(t_hi, Operand::Var(t_lo));
                    }
                    self.mov(dest_hi, Operand::Var(t_hi));
                } else if src_ty == Type::I1 {
                    // GPRs are 32-bit, so shift by 31 regardless of dest.
                    let src_r = self.legalize_to_var(src, None);
                    let thirty_one = self.flex_const(31);
                    let t = self.make_reg(dest_ty, None);
                    self.alu(AluOp::Lsl, t, src_r, thirty_one.clone());
                    self.alu(AluOp::Asr, t, t, thirty_one);
                    self.mov(dest, Operand::Var(t));
                } else {
                    let src_r = self.legalize_to_var(src, None);
                    let t = self.make_reg(dest_ty, None);
                    self.emit(ArmInst::Sxt { dest: t, src: src_r });
                    self.mov(dest, Operand::Var(t));
                }
            }
            CastKind::Zext => {
                if dest_ty.is_vector() {
                    self.unimplemented();
                } else if dest_ty == Type::I64 {
                    let zero = self.flex_const(0);
                    self.split64(dest);
                    let dest_lo = self.func.var(dest).lo.unwrap();
                    let dest_hi = self.func.var(dest).hi.unwrap();
                    let t_lo = self.make_reg(Type::I32, None);
                    // i32 takes the whole register; i1 gets masked below.
                    if src_ty == Type::I32 || src_ty == Type::I1 {
                        let src_rf = self.legalize(src, LEGAL_REG | LEGAL_FLEX, None);
                        self.mov(t_lo, src_rf);
                    } else {
                        let src_r = self.legalize_to_var(src, None);
                        self.emit(ArmInst::Uxt {
                            dest: t_lo,
                            src: src_r,
                        });
                    }
                    if src_ty == Type::I1 {
                        let one = self.flex_const(1);
                        self.alu(AluOp::And, t_lo, t_lo, one);
                    }
                    self.mov(dest_lo, Operand::Var(t_lo));
                    let t_hi = self.make_reg(Type::I32, None);
                    self.mov(t_hi, zero);
                    self.mov(dest_hi, Operand::Var(t_hi));
                } else if src_ty == Type::I1 {
                    // mov rather than uxt: uxt would force the source into a
                    // register and the mask does the work anyway.
                    let src_rf = self.legalize(src, LEGAL_REG | LEGAL_FLEX, None);
                    let one = self.flex_const(1);
                    let t = self.make_reg(dest_ty, None);
                    self.mov(t, src_rf);
                    self.alu(AluOp::And, t, t, one);
                    self.mov(dest, Operand::Var(t));
                } else {
                    let src_r = self.legalize_to_var(src, None);
                    let t = self.make_reg(dest_ty, None);
                    self.emit(ArmInst::Uxt { dest: t, src: src_r });
                    self.mov(dest, Operand::Var(t));
                }
            }
            CastKind::Trunc => {
                if dest_ty.is_vector() {
                    self.unimplemented();
                } else {
                    let mut src_op = src.clone();
                    if src_ty == Type::I64 {
                        src_op = self.lo_operand(&src_op);
                    }
                    let src_rf = self.legalize(&src_op, LEGAL_REG | LEGAL_FLEX, None);
                    let t = self.make_reg(dest_ty, None);
                    self.mov(t, src_rf);
                    if dest_ty == Type::I1 {
                        let one = self.flex_const(1);
                        self.alu(AluOp::And, t, t, one);
                    }
                    self.mov(dest, Operand::Var(t));
                }
            }
            CastKind::Bitcast => {
                if dest_ty == src_ty {
                    self.lower_assign(dest, src);
                } else {
                    self.unimplemented();
                }
            }
            CastKind::Fptrunc
            | CastKind::Fpext
            | CastKind::Fptosi
            | CastKind::Fptoui
            | CastKind::Sitofp
            | CastKind::Uitofp => {
                self.unimplemented();
            }
        }
    }

    fn lower_icmp(&mut self, cond: IcmpCond, dest: VarId, src0: &Operand, src1: &Operand) {
        if self.func.var(dest).ty.is_vector() {
            self.unimplemented();
            return;
        }
        let src_ty = self.func.operand_type(src0);

        if src_ty == Type::I64 {
            // cmp   b.lo, c.lo        or    cmp      b.hi, c.hi
            // sbcs  t, b.hi, c.hi           cmp.eq   b.lo, c.lo
            // (signed)                      (unsigned)
            // mov.<C1> t, #1
            // mov.<C2> t, #0
            let entry = icmp64_entry(cond);
            let (a, b) = if entry.swapped {
                (src1, src0)
            } else {
                (src0, src1)
            };
            let a_lo = self.lo_operand(a);
            let a_hi = self.hi_operand(a);
            let b_lo = self.lo_operand(b);
            let b_hi = self.hi_operand(b);
            let src0_lo = self.legalize_to_var(&a_lo, None);
            let src0_hi = self.legalize_to_var(&a_hi, None);
            let src1_lo_rf = self.legalize(&b_lo, LEGAL_REG | LEGAL_FLEX, None);
            let src1_hi_rf = self.legalize(&b_hi, LEGAL_REG | LEGAL_FLEX, None);
            let t = self.make_reg(Type::I32, None);
            if entry.is_signed {
                let scratch = self.make_reg(Type::I32, None);
                self.emit(ArmInst::Cmp {
                    src0: src0_lo,
                    src1: src1_lo_rf,
                    pred: Cond::Al,
                });
                self.emit(ArmInst::Alu {
                    op: AluOp::Sbc,
                    set_flags: true,
                    pred: Cond::Al,
                    dest: scratch,
                    src0: src0_hi,
                    src1: src1_hi_rf,
                });
                // Only the flags of the sbcs matter.
                self.fake_use(scratch);
            } else {
                self.emit(ArmInst::Cmp {
                    src0: src0_hi,
                    src1: src1_hi_rf,
                    pred: Cond::Al,
                });
                self.emit(ArmInst::Cmp {
                    src0: src0_lo,
                    src1: src1_lo_rf,
                    pred: Cond::Eq,
                });
            }
            let one = self.flex_const(1);
            let zero = self.flex_const(0);
            self.mov_pred(t, one, entry.c1);
            self.mov_nonkillable(t, zero, entry.c2);
            self.mov(dest, Operand::Var(t));
            return;
        }

        // lsl     tb, b, #N
        // mov     t, #0
        // cmp     tb, c, lsl #N
        // mov.<C> t, #1
        // Shifting both sides left by 32-width keeps narrow types' garbage
        // bits out of the comparison.
        let shift_amt = 32 - src_ty.bit_width();
        let src0_r = if shift_amt > 0 {
            let shift = self.flex_const(shift_amt as i32);
            let r = self.make_reg(Type::I32, None);
            let s0 = self.legalize_to_var(src0, None);
            self.alu(AluOp::Lsl, r, s0, shift);
            r
        } else {
            self.legalize_to_var(src0, None)
        };
        let t = self.make_reg(Type::I32, None);
        let zero = self.flex_const(0);
        self.mov(t, zero);
        if shift_amt > 0 {
            let src1_r = self.legalize_to_var(src1, None);
            self.emit(ArmInst::Cmp {
                src0: src0_r,
                src1: Operand::FlexReg(FlexReg {
                    ty: Type::I32,
                    reg: src1_r,
                    shift: ShiftOp::Lsl,
                    amt: ShiftAmt::Imm(shift_amt),
                }),
                pred: Cond::Al,
            });
        } else {
            let src1_rf = self.legalize(src1, LEGAL_REG | LEGAL_FLEX, None);
            self.emit(ArmInst::Cmp {
                src0: src0_r,
                src1: src1_rf,
                pred: Cond::Al,
            });
        }
        let one = self.flex_const(1);
        self.mov_nonkillable(t, one, icmp32_cond(cond));
        self.mov(dest, Operand::Var(t));
    }

    fn lower_intrinsic_call(&mut self, id: Intrinsic, dest: Option<VarId>, args: &[Operand]) {
        match id {
            Intrinsic::Memcpy => {
                self.lower_call(None, &Operand::reloc("memcpy"), &args[0..3], true);
            }
            Intrinsic::Memmove => {
                self.lower_call(None, &Operand::reloc("memmove"), &args[0..3], true);
            }
            Intrinsic::Memset => {
                // The fill byte widens to i32: argument slots are at least
                // 32 bits wide.
                let val = &args[1];
                debug_assert_eq!(self.func.operand_type(val), Type::I8);
                let val_ext = self.func.make_variable(Type::I32);
                self.lower_cast(CastKind::Zext, val_ext, &val.clone());
                let call_args = vec![args[0].clone(), Operand::Var(val_ext), args[2].clone()];
                self.lower_call(None, &Operand::reloc("memset"), &call_args, true);
            }
            Intrinsic::Setjmp => {
                self.lower_call(dest, &Operand::reloc("setjmp"), &args[0..1], true);
            }
            Intrinsic::Longjmp => {
                self.lower_call(None, &Operand::reloc("longjmp"), &args[0..2], true);
            }
            Intrinsic::ReadTp => {
                if self.ctx.flags().use_sandboxing {
                    self.unimplemented();
                } else {
                    self.lower_call(dest, &Operand::reloc("__nacl_read_tp"), &[], true);
                }
            }
            Intrinsic::Unknown => {
                self.func.set_error("Should not be lowering UnknownIntrinsic");
            }
        }
    }

    fn lower_load(&mut self, dest: VarId, addr: &Operand) {
        // A load is an assign once the address becomes a memory operand.
        let ty = self.func.var(dest).ty;
        let mem = self.form_memory_operand(addr, ty);
        self.lower_assign(dest, &Operand::Mem(mem));
    }

    fn lower_store(&mut self, value: &Operand, addr: &Operand) {
        let ty = self.func.operand_type(value);
        let mem = self.form_memory_operand(addr, ty);
        if ty == Type::I64 {
            let hi_op = self.hi_operand(value);
            let lo_op = self.lo_operand(value);
            let value_hi = self.legalize_to_var(&hi_op, None);
            let value_lo = self.legalize_to_var(&lo_op, None);
            let addr_op = Operand::Mem(mem);
            let hi_mem = match self.hi_operand(&addr_op) {
                Operand::Mem(m) => m,
                _ => unreachable!(),
            };
            let lo_mem = match self.lo_operand(&addr_op) {
                Operand::Mem(m) => m,
                _ => unreachable!(),
            };
            self.emit(ArmInst::Str {
                value: value_hi,
                mem: hi_mem,
            });
            self.emit(ArmInst::Str {
                value: value_lo,
                mem: lo_mem,
            });
        } else if ty.is_vector() {
            self.unimplemented();
        } else {
            let value_r = self.legalize_to_var(value, None);
            self.emit(ArmInst::Str {
                value: value_r,
                mem,
            });
        }
    }

    fn lower_unreachable(&mut self) {
        self.emit(ArmInst::Trap);
    }

    fn lower_ret(&mut self, value: Option<&Operand>) {
        let mut reg = None;
        if let Some(src) = value {
            let ty = self.func.operand_type(src);
            if ty == Type::I64 {
                let lo = self.lo_operand(src);
                let hi = self.hi_operand(src);
                let r0 = self.legalize_to_var(&lo, Some(R0));
                let r1 = self.legalize_to_var(&hi, Some(R1));
                reg = Some(r0);
                self.fake_use(r1);
            } else if ty.is_float() || ty.is_vector() {
                self.unimplemented();
            } else {
                let src_f = self.legalize(src, LEGAL_REG | LEGAL_FLEX, None);
                let r = self.make_reg(ty, Some(R0));
                self.mov_pred(r, src_f, Cond::Al);
                reg = Some(r);
            }
        }
        // Emit the ret even under sandboxing: the epilog looks for it as
        // the marker for frame removal, then rewrites it.
        let lr = self.get_physical_register(LR, Type::I32);
        self.emit(ArmInst::Ret { lr, value: reg });
        // Keep sp live through the epilog so post-call adjustments are not
        // dead-code eliminated.
        let sp = self.get_physical_register(SP, Type::I32);
        self.fake_use(sp);
    }
}
