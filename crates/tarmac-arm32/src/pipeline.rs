//! Translation pipelines.
//!
//! `translate_o2` is the optimizing pipeline; `translate_om1` the debug
//! pipeline. Every stage checks the function's sticky error flag and
//! returns early once it is set.

use tracing::{debug, trace};

use tarmac_ir::{
    compute_var_metadata, liveness, Func, GlobalContext, InstKind, LivenessMode, OptLevel,
    RegAllocKind, RegAllocParams,
};

use crate::inst::{ArmBr, ArmInst};
use crate::registers::{register_set, RegSetMask, FP, NUM_REGS};
use crate::target::TargetArm32;

/// Translate one function according to the context's optimization level.
pub fn translate_func(func: &mut Func<ArmInst>, ctx: &GlobalContext) {
    let mut target = TargetArm32::new(func, ctx);
    match ctx.flags().opt_level {
        OptLevel::O2 => target.translate_o2(),
        OptLevel::Om1 => target.translate_om1(),
    }
}

macro_rules! bail_on_error {
    ($self:ident) => {
        if $self.func.has_error() {
            return;
        }
    };
}

impl TargetArm32<'_> {
    pub fn translate_o2(&mut self) {
        let flags = self.ctx.flags().clone();

        if !flags.phi_edge_split {
            self.func.place_phi_loads();
            bail_on_error!(self);
            self.func.place_phi_stores();
            bail_on_error!(self);
            self.func.delete_phis();
            bail_on_error!(self);
            self.dump_stage("after phi lowering");
        }

        compute_var_metadata(self.func);
        self.do_address_opt();

        self.lower_arguments();

        // Lowering consults liveness for some decisions; liveness wants
        // numbered instructions.
        self.func.renumber_instructions();
        bail_on_error!(self);
        liveness(self.func, LivenessMode::Basic);
        bail_on_error!(self);
        self.dump_stage("after address mode opt");

        self.gen_code();
        bail_on_error!(self);
        self.dump_stage("after codegen");

        // Register allocation needs renumbering and full intervals.
        self.func.renumber_instructions();
        bail_on_error!(self);
        liveness(self.func, LivenessMode::Intervals);
        bail_on_error!(self);
        compute_var_metadata(self.func);
        self.reg_alloc(RegAllocKind::Global);
        bail_on_error!(self);
        self.dump_stage("after linear scan regalloc");

        if flags.phi_edge_split {
            // Advanced phi lowering for split edges.
            self.unimplemented();
        }

        self.gen_frame();
        bail_on_error!(self);
        self.dump_stage("after stack frame mapping");

        self.func.contract_empty_nodes();
        self.func.reorder_nodes();

        // Last: nothing may insert or reorder nodes after this.
        self.do_branch_opt();
        self.dump_stage("after branch optimization");

        if flags.nop_insertion {
            self.do_nop_insertion();
        }
    }

    pub fn translate_om1(&mut self) {
        let flags = self.ctx.flags().clone();

        self.func.place_phi_loads();
        bail_on_error!(self);
        self.func.place_phi_stores();
        bail_on_error!(self);
        self.func.delete_phis();
        bail_on_error!(self);
        self.dump_stage("after phi lowering");

        self.lower_arguments();

        self.gen_code();
        bail_on_error!(self);
        self.dump_stage("after initial codegen");

        self.reg_alloc(RegAllocKind::InfOnly);
        bail_on_error!(self);
        self.dump_stage("after regalloc of infinite-weight variables");

        self.gen_frame();
        bail_on_error!(self);
        self.dump_stage("after stack frame mapping");

        if flags.nop_insertion {
            self.do_nop_insertion();
        }
    }

    fn dump_stage(&self, stage: &str) {
        if tracing::enabled!(tracing::Level::TRACE) {
            trace!(func = %self.func.name, stage, "\n{}", self.func.dump_text());
        } else {
            debug!(func = %self.func.name, stage);
        }
    }

    /// Lower every high-level instruction in place. Originals stay in the
    /// lists with their deleted flag set; the lowered expansion follows.
    pub(crate) fn gen_code(&mut self) {
        for i in 0..self.func.nodes.len() {
            let insts = std::mem::take(&mut self.func.nodes[i].insts);
            let mut out = Vec::with_capacity(insts.len() * 4);
            for mut inst in insts {
                if inst.deleted || self.func.has_error() {
                    out.push(inst);
                    continue;
                }
                match &inst.kind {
                    InstKind::Target(_)
                    | InstKind::FakeDef { .. }
                    | InstKind::FakeUse { .. }
                    | InstKind::FakeKill { .. } => out.push(inst),
                    _ => {
                        let kind = inst.kind.clone();
                        inst.set_deleted();
                        out.push(inst);
                        debug_assert!(self.cur.is_empty());
                        self.lower_inst(&kind);
                        let mut lowered = self.take_cur();
                        out.append(&mut lowered);
                    }
                }
            }
            self.func.nodes[i].insts = out;
        }
    }

    /// Register-allocation glue: supply the allocatable set (no sp/lr/pc,
    /// no reserved r9, no fp when a frame pointer is in use).
    pub(crate) fn reg_alloc(&mut self, kind: RegAllocKind) {
        if kind == RegAllocKind::InfOnly {
            // The debug pipeline reaches here without intervals.
            self.func.renumber_instructions();
            liveness(self.func, LivenessMode::Intervals);
            compute_var_metadata(self.func);
        }
        let mut available =
            register_set(RegSetMask::CALLER_SAVE | RegSetMask::CALLEE_SAVE, RegSetMask::NONE);
        if self.uses_frame_pointer {
            available[FP as usize] = false;
        }
        let params = RegAllocParams {
            num_regs: NUM_REGS,
            available: available.to_vec(),
        };
        tarmac_ir::reg_alloc(self.func, kind, &params);
    }

    /// Address-mode optimization hooks. Not implemented for this target;
    /// each load/store routes through the unimplemented choke point.
    pub(crate) fn do_address_opt(&mut self) {
        let mut loads = 0usize;
        let mut stores = 0usize;
        for node in &self.func.nodes {
            for inst in &node.insts {
                if inst.deleted {
                    continue;
                }
                match inst.kind {
                    InstKind::Load { .. } => loads += 1,
                    InstKind::Store { .. } => stores += 1,
                    _ => {}
                }
            }
        }
        for _ in 0..loads {
            self.do_address_opt_load();
        }
        for _ in 0..stores {
            self.do_address_opt_store();
        }
    }

    fn do_address_opt_load(&mut self) {
        self.unimplemented();
    }

    fn do_address_opt_store(&mut self) {
        self.unimplemented();
    }

    /// Fall-through branch optimization over the final layout.
    pub(crate) fn do_branch_opt(&mut self) {
        let layout = self.func.layout.clone();
        for &nid in &layout {
            let next = self.func.next_in_layout(nid);
            let node = self.func.node_mut(nid);
            for inst in node.insts.iter_mut() {
                if inst.deleted {
                    continue;
                }
                if let InstKind::Target(t @ ArmInst::Br(_)) = &mut inst.kind {
                    let mut delete = false;
                    if t.optimize_branch(next, &mut delete) && delete {
                        inst.set_deleted();
                    }
                }
            }
        }
    }

    pub(crate) fn do_nop_insertion(&mut self) {
        self.randomly_insert_nop();
    }

    fn randomly_insert_nop(&mut self) {
        self.unimplemented();
    }
}

/// True when the node ends in a branch that falls through (used by tests
/// and diagnostics).
pub fn ends_in_fallthrough(func: &Func<ArmInst>, node: tarmac_ir::NodeId) -> bool {
    func.node(node)
        .insts
        .iter()
        .rev()
        .find(|i| !i.deleted)
        .map(|i| {
            matches!(
                &i.kind,
                InstKind::Target(ArmInst::Br(ArmBr::Cond { on_false: None, .. }))
            )
        })
        .unwrap_or(true)
}
