//! Prolog and epilog construction.
//!
//! Stack frame layout, SP growing down:
//!
//! ```text
//! +------------------------+
//! | 1. preserved registers |
//! +------------------------+
//! | 2. padding             |
//! +------------------------+
//! | 3. global spill area   |
//! +------------------------+
//! | 4. padding             |
//! +------------------------+
//! | 5. local spill area    |
//! +------------------------+
//! | 6. padding             |
//! +------------------------+
//! | 7. allocas             |
//! +------------------------+
//! ```

use tracing::debug;

use tarmac_ir::{
    align_stack_spill_areas, apply_alignment, assign_var_stack_slots, get_var_stack_slot_params,
    Inst, InstKind, MemOperand, NodeId, Operand, RegNum, Type, VarId,
};

use crate::inst::{AluOp, ArmInst};
use crate::registers::{
    register_set, RegSetMask, FP, IP, LR, MAX_GPR_ARGS, NUM_REGS, R0, SP, STACK_ALIGNMENT_BYTES,
};
use crate::target::{TargetArm32, LEGAL_FLEX, LEGAL_REG};

impl TargetArm32<'_> {
    /// Replace register-eligible arguments with home-register variables and
    /// copy them to their original homes at function entry. i64 arguments
    /// start on an even register, possibly padding one away.
    pub(crate) fn lower_arguments(&mut self) {
        let mut assigns: Vec<Inst<ArmInst>> = Vec::new();
        let mut num_gpr_used: u32 = 0;
        for i in 0..self.func.args.len() {
            let arg = self.func.args[i];
            let ty = self.func.var(arg).ty;
            if ty.is_vector() || ty.is_float() {
                self.unimplemented();
                continue;
            }
            if ty == Type::I64 {
                if num_gpr_used >= MAX_GPR_ARGS {
                    continue;
                }
                if num_gpr_used % 2 != 0 {
                    num_gpr_used += 1;
                }
                let reg_lo = R0 + num_gpr_used as RegNum;
                num_gpr_used += 1;
                let reg_hi = R0 + num_gpr_used as RegNum;
                num_gpr_used += 1;
                // Past the boundary: stack-passed, but the speculatively
                // consumed registers stay consumed.
                if num_gpr_used > MAX_GPR_ARGS {
                    continue;
                }
                let name = self.func.var(arg).name.clone();
                let register_arg = match &name {
                    Some(n) => self
                        .func
                        .make_named_variable(ty, format!("home_reg:{n}")),
                    None => self.func.make_variable(ty),
                };
                let register_lo = self.func.make_variable(Type::I32);
                let register_hi = self.func.make_variable(Type::I32);
                self.func.var_mut(register_lo).reg = Some(reg_lo);
                self.func.var_mut(register_lo).is_arg = true;
                self.func.var_mut(register_hi).reg = Some(reg_hi);
                self.func.var_mut(register_hi).is_arg = true;
                self.func.var_mut(register_arg).set_lo_hi(register_lo, register_hi);
                self.func.var_mut(register_arg).is_arg = true;
                self.func.var_mut(arg).is_arg = false;
                self.func.args[i] = register_arg;
                assigns.push(Inst::new(InstKind::Assign {
                    dest: arg,
                    src: Operand::Var(register_arg),
                }));
            } else {
                if num_gpr_used >= MAX_GPR_ARGS {
                    continue;
                }
                let reg = R0 + num_gpr_used as RegNum;
                num_gpr_used += 1;
                let name = self.func.var(arg).name.clone();
                let register_arg = match &name {
                    Some(n) => self
                        .func
                        .make_named_variable(ty, format!("home_reg:{n}")),
                    None => self.func.make_variable(ty),
                };
                self.func.var_mut(register_arg).reg = Some(reg);
                self.func.var_mut(register_arg).is_arg = true;
                self.func.var_mut(arg).is_arg = false;
                self.func.args[i] = register_arg;
                assigns.push(Inst::new(InstKind::Assign {
                    dest: arg,
                    src: Operand::Var(register_arg),
                }));
            }
        }
        let entry = self.func.entry;
        self.func.node_mut(entry).insts.splice(0..0, assigns);
    }

    /// Set the frame offset of a stack-passed argument, recursing lo-first
    /// through i64 halves (little endian), and fill its register from the
    /// slot when one was allocated.
    fn finish_argument_lowering(
        &mut self,
        arg: VarId,
        frame_ptr: VarId,
        basic_frame_offset: u32,
        in_args_size: &mut u32,
    ) {
        let (lo, hi, ty) = {
            let var = self.func.var(arg);
            (var.lo, var.hi, var.ty)
        };
        if let (Some(lo), Some(hi)) = (lo, hi) {
            if ty == Type::I64 {
                debug_assert!(self.func.var(lo).ty != Type::I64);
                debug_assert!(self.func.var(hi).ty != Type::I64);
                self.finish_argument_lowering(lo, frame_ptr, basic_frame_offset, in_args_size);
                self.finish_argument_lowering(hi, frame_ptr, basic_frame_offset, in_args_size);
                return;
            }
        }
        if ty.is_vector() {
            *in_args_size = apply_alignment(*in_args_size, STACK_ALIGNMENT_BYTES);
        }
        let offset = (basic_frame_offset + *in_args_size) as i32;
        self.func.var_mut(arg).stack_offset = Some(offset);
        *in_args_size += ty.stack_bytes() as u32;
        // Register-allocated argument: fill it from the incoming slot. The
        // explicit memory operand bypasses the usual spill accounting, so
        // count the fill by hand.
        if self.func.var(arg).reg.is_some() {
            debug_assert!(ty != Type::I64);
            if ty.is_vector() {
                self.unimplemented();
            } else {
                let mem = MemOperand::with_offset(ty, frame_ptr, offset);
                self.emit(ArmInst::Ldr { dest: arg, mem });
            }
            self.ctx.stats_update_fills(1);
        }
    }

    pub(crate) fn add_prolog(&mut self) {
        let params = get_var_stack_slot_params(self.func, NUM_REGS);
        self.regs_used = params.regs_used.clone();
        let locals_spill_area_size = params.spill_area_size;
        let mut spill_area_size = params.spill_area_size + params.globals_size;

        // FP and LR join the preserved set as needed.
        let mut callee_saves = register_set(RegSetMask::CALLEE_SAVE, RegSetMask::NONE);
        let mut regs_used = self.regs_used.clone();
        if self.uses_frame_pointer {
            callee_saves[FP as usize] = true;
            regs_used[FP as usize] = true;
        }
        if !self.maybe_leaf_func {
            callee_saves[LR as usize] = true;
            regs_used[LR as usize] = true;
        }
        let mut push_regs: Vec<VarId> = Vec::new();
        let mut preserved_regs_size: u32 = 0;
        for r in 0..NUM_REGS {
            if callee_saves[r] && regs_used[r] {
                preserved_regs_size += 4;
                push_regs.push(self.get_physical_register(r as RegNum, Type::I32));
            }
        }
        self.regs_used = regs_used;
        self.ctx.stats_update_registers_saved(push_regs.len() as u64);

        debug_assert!(self.cur.is_empty());
        if !push_regs.is_empty() {
            self.emit(ArmInst::Push { regs: push_regs });
        }

        if self.uses_frame_pointer {
            let fp = self.get_physical_register(FP, Type::I32);
            let sp = self.get_physical_register(SP, Type::I32);
            self.mov(fp, Operand::Var(sp));
            // Keep FP live for late-stage liveness analyses.
            self.fake_use(fp);
        }

        debug_assert!(params.spill_area_align <= STACK_ALIGNMENT_BYTES);
        debug_assert!(
            params.locals_slots_align <= params.spill_area_align || params.spill_area_align == 0
        );
        let (spill_area_padding, locals_slots_padding) = align_stack_spill_areas(
            preserved_regs_size,
            params.spill_area_align,
            params.globals_size,
            params.locals_slots_align,
        );
        spill_area_size += spill_area_padding + locals_slots_padding;
        let globals_and_subsequent_padding = params.globals_size + locals_slots_padding;

        if self.needs_stack_alignment {
            let stack_offset = preserved_regs_size;
            let stack_size =
                apply_alignment(stack_offset + spill_area_size, STACK_ALIGNMENT_BYTES);
            spill_area_size = stack_size - stack_offset;
        }
        self.spill_area_size_bytes = spill_area_size;

        if spill_area_size > 0 {
            // IP legalizes the amount when it does not fit a flex immediate.
            let sub_amount = self.legalize(
                &Operand::i32(spill_area_size as i32),
                LEGAL_REG | LEGAL_FLEX,
                Some(IP),
            );
            let sp = self.get_physical_register(SP, Type::I32);
            self.alu(AluOp::Sub, sp, sp, sub_amount);
        }
        self.ctx.stats_update_frame_bytes(spill_area_size as u64);

        // Args are pushed right to left: arg 0 sits closest to the frame
        // pointer (FP-based) or to the adjusted SP.
        let frame_reg = if self.uses_frame_pointer { FP } else { SP };
        let frame_ptr = self.get_physical_register(frame_reg, Type::I32);
        let basic_frame_offset = if self.uses_frame_pointer {
            preserved_regs_size
        } else {
            preserved_regs_size + spill_area_size
        };

        let args = self.func.args.clone();
        let mut in_args_size: u32 = 0;
        let mut num_gpr_args: u32 = 0;
        for arg in args {
            let ty = self.func.var(arg).ty;
            if ty.is_vector() || ty.is_float() {
                self.unimplemented();
                continue;
            }
            if ty == Type::I64 && num_gpr_args < MAX_GPR_ARGS {
                if num_gpr_args % 2 == 1 {
                    num_gpr_args += 1;
                }
                num_gpr_args += 2;
                if num_gpr_args <= MAX_GPR_ARGS {
                    continue;
                }
            } else if num_gpr_args < MAX_GPR_ARGS {
                num_gpr_args += 1;
                continue;
            }
            self.finish_argument_lowering(arg, frame_ptr, basic_frame_offset, &mut in_args_size);
        }

        assign_var_stack_slots(
            self.func,
            &params.sorted_spilled,
            spill_area_padding,
            spill_area_size,
            globals_and_subsequent_padding,
            self.uses_frame_pointer,
        );

        let prolog = self.take_cur();
        let entry = self.func.entry;
        self.func.node_mut(entry).insts.splice(0..0, prolog);

        debug!(
            func = %self.func.name,
            in_args = in_args_size,
            preserved = preserved_regs_size,
            spill_padding = spill_area_padding,
            globals = params.globals_size,
            locals = locals_spill_area_size,
            sp_adjustment = spill_area_size,
            fp_based = self.uses_frame_pointer,
            "stack layout"
        );
    }

    pub(crate) fn add_epilog(&mut self, node_id: NodeId) {
        let ret_pos = self.func.node(node_id).insts.iter().rposition(|inst| {
            !inst.deleted && matches!(inst.kind, InstKind::Target(ArmInst::Ret { .. }))
        });
        let Some(ret_pos) = ret_pos else {
            return;
        };

        debug_assert!(self.cur.is_empty());
        let sp = self.get_physical_register(SP, Type::I32);
        if self.uses_frame_pointer {
            let fp = self.get_physical_register(FP, Type::I32);
            // The fake use keeps earlier SP adjustments from being
            // dead-code eliminated before SP is overwritten.
            self.fake_use(sp);
            self.mov(sp, Operand::Var(fp));
        } else if self.spill_area_size_bytes > 0 {
            // IP should not be live here; reuse it for the immediate.
            let add_amount = self.legalize(
                &Operand::i32(self.spill_area_size_bytes as i32),
                LEGAL_REG | LEGAL_FLEX,
                Some(IP),
            );
            self.alu(AluOp::Add, sp, sp, add_amount);
        }

        // Pop in ascending order, same as push.
        let mut callee_saves = register_set(RegSetMask::CALLEE_SAVE, RegSetMask::NONE);
        if self.uses_frame_pointer {
            callee_saves[FP as usize] = true;
        }
        if !self.maybe_leaf_func {
            callee_saves[LR as usize] = true;
        }
        let mut pop_regs: Vec<VarId> = Vec::new();
        for r in 0..NUM_REGS {
            if callee_saves[r] && self.regs_used[r] {
                pop_regs.push(self.get_physical_register(r as RegNum, Type::I32));
            }
        }
        if !pop_regs.is_empty() {
            self.emit(ArmInst::Pop { regs: pop_regs });
        }

        let sandboxed = self.ctx.flags().use_sandboxing;
        if sandboxed {
            // Replace the ret with the bundle-locked masked return. This
            // aligns the jump target to the bundle and restricts it to the
            // lower 1 GiB.
            let ret_value = match &self.func.node(node_id).insts[ret_pos].kind {
                InstKind::Target(ArmInst::Ret { value, .. }) => *value,
                _ => unreachable!(),
            };
            let ret_mask = self.legalize(
                &Operand::i32(0xC000_000Fu32 as i32),
                LEGAL_REG | LEGAL_FLEX,
                None,
            );
            let lr = self.make_reg(Type::I32, Some(LR));
            self.emit(ArmInst::BundleLock);
            self.alu(AluOp::Bic, lr, lr, ret_mask);
            self.emit(ArmInst::Ret {
                lr,
                value: ret_value,
            });
            self.emit(ArmInst::BundleUnlock);
        }

        let epilog = self.take_cur();
        let inserted = epilog.len();
        let node = self.func.node_mut(node_id);
        node.insts.splice(ret_pos..ret_pos, epilog);
        if sandboxed {
            node.insts[ret_pos + inserted].set_deleted();
        }
    }

    pub(crate) fn gen_frame(&mut self) {
        tarmac_ir::compute_var_metadata(self.func);
        self.add_prolog();
        let node_ids: Vec<NodeId> = self.func.nodes.iter().map(|n| n.id).collect();
        for id in node_ids {
            self.add_epilog(id);
        }
    }
}
