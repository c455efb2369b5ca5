//! Function builder.
//!
//! Thin construction layer used by front ends and tests: create nodes and
//! variables, push instructions, and finish with the derived CFG state.

use crate::func::Func;
use crate::inst::{BrKind, Inst, InstKind, NodeId, TargetInst};
use crate::operand::{Operand, VarId};
use crate::types::Type;

pub struct FuncBuilder<T: TargetInst> {
    func: Func<T>,
}

impl<T: TargetInst> FuncBuilder<T> {
    /// Start a function. The entry node is created immediately.
    pub fn new(name: impl Into<String>, ret_ty: Type) -> FuncBuilder<T> {
        let mut func = Func::new(name, ret_ty);
        let entry = func.add_node();
        func.entry = entry;
        FuncBuilder { func }
    }

    pub fn arg(&mut self, ty: Type) -> VarId {
        self.func.add_arg(ty)
    }

    pub fn var(&mut self, ty: Type) -> VarId {
        self.func.make_variable(ty)
    }

    pub fn named_var(&mut self, ty: Type, name: &str) -> VarId {
        self.func.make_named_variable(ty, name)
    }

    pub fn node(&mut self) -> NodeId {
        self.func.add_node()
    }

    pub fn entry(&self) -> NodeId {
        self.func.entry
    }

    pub fn push(&mut self, node: NodeId, kind: InstKind<T>) {
        self.func.node_mut(node).insts.push(Inst::new(kind));
    }

    pub fn push_phi(&mut self, node: NodeId, dest: VarId, incoming: Vec<(Operand, NodeId)>) {
        self.func
            .node_mut(node)
            .phis
            .push(Inst::new(InstKind::Phi { dest, incoming }));
    }

    pub fn br(&mut self, node: NodeId, target: NodeId) {
        self.push(node, InstKind::Br(BrKind::Uncond { target }));
    }

    pub fn br_cond(&mut self, node: NodeId, cond: Operand, on_true: NodeId, on_false: NodeId) {
        self.push(
            node,
            InstKind::Br(BrKind::Cond {
                cond,
                on_true,
                on_false,
            }),
        );
    }

    pub fn ret(&mut self, node: NodeId, value: Option<Operand>) {
        self.push(node, InstKind::Ret { value });
    }

    /// Finish construction: computes predecessors and leaves the layout in
    /// creation order.
    pub fn build(mut self) -> Func<T> {
        self.func.compute_predecessors();
        self.func
    }
}
