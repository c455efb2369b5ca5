//! Functions and basic blocks.
//!
//! A function owns its variable arena and its nodes; instructions reference
//! variables by index so the operand graph stays cycle-free. The generic
//! pipeline passes that do not need target knowledge live here: phi
//! placement, renumbering, node contraction and layout.

use std::collections::HashSet;
use std::fmt::Write as _;

use tracing::debug;

use crate::inst::{BrKind, Inst, InstKind, NodeId, TargetInst};
use crate::liveness::{LiveRange, VarMetadata};
use crate::operand::{MemIndex, Operand, ShiftAmt, VarId, Variable};
use crate::types::Type;

/// Basic block.
#[derive(Clone, Debug)]
pub struct Node<T: TargetInst> {
    pub id: NodeId,
    pub phis: Vec<Inst<T>>,
    pub insts: Vec<Inst<T>>,
    pub preds: Vec<NodeId>,
    pub contracted: bool,
    pub live_in: HashSet<VarId>,
    pub live_out: HashSet<VarId>,
}

impl<T: TargetInst> Node<T> {
    fn new(id: NodeId) -> Node<T> {
        Node {
            id,
            phis: Vec::new(),
            insts: Vec::new(),
            preds: Vec::new(),
            contracted: false,
            live_in: HashSet::new(),
            live_out: HashSet::new(),
        }
    }

    /// Control-flow successors, collected from live branch instructions.
    pub fn succs(&self) -> Vec<NodeId> {
        let mut out = Vec::new();
        for inst in &self.insts {
            if inst.deleted {
                continue;
            }
            inst.kind.branch_targets(&mut out);
        }
        out.dedup();
        out
    }

    /// Index of the trailing terminator, if the block has one.
    pub fn terminator_pos(&self) -> Option<usize> {
        self.insts
            .iter()
            .rposition(|inst| !inst.deleted && inst.kind.is_terminator())
    }
}

/// A function under translation.
#[derive(Clone, Debug)]
pub struct Func<T: TargetInst> {
    pub name: String,
    pub ret_ty: Type,
    pub args: Vec<VarId>,
    vars: Vec<Variable>,
    pub nodes: Vec<Node<T>>,
    pub entry: NodeId,
    /// Emission order; maintained by `reorder_nodes`.
    pub layout: Vec<NodeId>,
    error: Option<String>,
    pub metadata: VarMetadata,
    pub live_ranges: Vec<LiveRange>,
}

impl<T: TargetInst> Func<T> {
    pub fn new(name: impl Into<String>, ret_ty: Type) -> Func<T> {
        Func {
            name: name.into(),
            ret_ty,
            args: Vec::new(),
            vars: Vec::new(),
            nodes: Vec::new(),
            entry: NodeId(0),
            layout: Vec::new(),
            error: None,
            metadata: VarMetadata::default(),
            live_ranges: Vec::new(),
        }
    }

    // ------------------------------------------------------------------
    // Variables
    // ------------------------------------------------------------------

    pub fn make_variable(&mut self, ty: Type) -> VarId {
        let id = VarId(self.vars.len() as u32);
        self.vars.push(Variable::new(ty));
        id
    }

    pub fn make_named_variable(&mut self, ty: Type, name: impl Into<String>) -> VarId {
        let id = self.make_variable(ty);
        self.vars[id.0 as usize].name = Some(name.into());
        id
    }

    pub fn add_arg(&mut self, ty: Type) -> VarId {
        let id = self.make_variable(ty);
        self.vars[id.0 as usize].is_arg = true;
        self.args.push(id);
        id
    }

    pub fn var(&self, id: VarId) -> &Variable {
        &self.vars[id.0 as usize]
    }

    pub fn var_mut(&mut self, id: VarId) -> &mut Variable {
        &mut self.vars[id.0 as usize]
    }

    pub fn num_vars(&self) -> usize {
        self.vars.len()
    }

    pub fn var_ids(&self) -> impl Iterator<Item = VarId> {
        (0..self.vars.len() as u32).map(VarId)
    }

    pub fn operand_type(&self, op: &Operand) -> Type {
        match op {
            Operand::Var(v) => self.var(*v).ty,
            Operand::Const32 { ty, .. } => *ty,
            Operand::Const64(_) => Type::I64,
            Operand::ConstF32(_) => Type::F32,
            Operand::ConstF64(_) => Type::F64,
            Operand::Reloc { .. } => Type::I32,
            Operand::Undef(ty) => *ty,
            Operand::Mem(mem) => mem.ty,
            Operand::FlexImm { ty, .. } => *ty,
            Operand::FlexReg(fr) => fr.ty,
        }
    }

    // ------------------------------------------------------------------
    // Nodes
    // ------------------------------------------------------------------

    pub fn add_node(&mut self) -> NodeId {
        let id = NodeId(self.nodes.len() as u32);
        self.nodes.push(Node::new(id));
        self.layout.push(id);
        id
    }

    pub fn node(&self, id: NodeId) -> &Node<T> {
        &self.nodes[id.0 as usize]
    }

    pub fn node_mut(&mut self, id: NodeId) -> &mut Node<T> {
        &mut self.nodes[id.0 as usize]
    }

    pub fn compute_predecessors(&mut self) {
        for node in &mut self.nodes {
            node.preds.clear();
        }
        let mut edges = Vec::new();
        for node in &self.nodes {
            for succ in node.succs() {
                edges.push((node.id, succ));
            }
        }
        for (from, to) in edges {
            let preds = &mut self.nodes[to.0 as usize].preds;
            if !preds.contains(&from) {
                preds.push(from);
            }
        }
    }

    /// The node emitted after `id`, per the current layout.
    pub fn next_in_layout(&self, id: NodeId) -> Option<NodeId> {
        let pos = self.layout.iter().position(|&n| n == id)?;
        self.layout.get(pos + 1).copied()
    }

    // ------------------------------------------------------------------
    // Error state
    // ------------------------------------------------------------------

    pub fn set_error(&mut self, msg: impl Into<String>) {
        let msg = msg.into();
        debug!(func = %self.name, error = %msg, "translation error");
        if self.error.is_none() {
            self.error = Some(msg);
        }
    }

    pub fn has_error(&self) -> bool {
        self.error.is_some()
    }

    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    // ------------------------------------------------------------------
    // Phi pipeline (edge splitting disabled)
    // ------------------------------------------------------------------

    /// For each phi, retarget its dest to a fresh temporary and prepend an
    /// assignment from that temporary to the original dest.
    pub fn place_phi_loads(&mut self) {
        for i in 0..self.nodes.len() {
            let mut assigns: Vec<Inst<T>> = Vec::new();
            for p in 0..self.nodes[i].phis.len() {
                if self.nodes[i].phis[p].deleted {
                    continue;
                }
                let dest = match &self.nodes[i].phis[p].kind {
                    InstKind::Phi { dest, .. } => *dest,
                    _ => continue,
                };
                let ty = self.var(dest).ty;
                let temp = self.make_variable(ty);
                if let InstKind::Phi { dest: d, .. } = &mut self.nodes[i].phis[p].kind {
                    *d = temp;
                }
                assigns.push(Inst::new(InstKind::Assign {
                    dest,
                    src: Operand::Var(temp),
                }));
            }
            self.nodes[i].insts.splice(0..0, assigns);
        }
    }

    /// In every predecessor, assign each phi temporary from the operand
    /// flowing in along that edge, just before the terminator.
    pub fn place_phi_stores(&mut self) {
        let n = self.nodes.len();
        let mut per_node: Vec<Vec<Inst<T>>> = (0..n).map(|_| Vec::new()).collect();
        for node in &self.nodes {
            for phi in &node.phis {
                if phi.deleted {
                    continue;
                }
                if let InstKind::Phi { dest, incoming } = &phi.kind {
                    for (op, pred) in incoming {
                        per_node[pred.0 as usize].push(Inst::new(InstKind::Assign {
                            dest: *dest,
                            src: op.clone(),
                        }));
                    }
                }
            }
        }
        for (i, assigns) in per_node.into_iter().enumerate() {
            if assigns.is_empty() {
                continue;
            }
            let node = &mut self.nodes[i];
            let pos = node.terminator_pos().unwrap_or(node.insts.len());
            node.insts.splice(pos..pos, assigns);
        }
    }

    pub fn delete_phis(&mut self) {
        for node in &mut self.nodes {
            for phi in &mut node.phis {
                phi.set_deleted();
            }
        }
    }

    // ------------------------------------------------------------------
    // Numbering and layout
    // ------------------------------------------------------------------

    pub fn renumber_instructions(&mut self) {
        let mut next = 1u32;
        for &nid in &self.layout.clone() {
            let node = &mut self.nodes[nid.0 as usize];
            for phi in &mut node.phis {
                phi.number = next;
                next += 1;
            }
            for inst in &mut node.insts {
                inst.number = next;
                next += 1;
            }
        }
    }

    /// Remove nodes whose only live instruction is an unconditional branch,
    /// redirecting their incoming edges to the branch target.
    pub fn contract_empty_nodes(&mut self) {
        loop {
            let mut redirect: Option<(NodeId, NodeId)> = None;
            for node in &self.nodes {
                if node.id == self.entry || node.contracted {
                    continue;
                }
                if node.phis.iter().any(|p| !p.deleted) {
                    continue;
                }
                let mut live = node.insts.iter().filter(|i| !i.deleted);
                let (first, rest) = (live.next(), live.next());
                if rest.is_some() {
                    continue;
                }
                let target = first.and_then(|inst| match &inst.kind {
                    InstKind::Br(BrKind::Uncond { target }) => Some(*target),
                    InstKind::Target(t) => t.uncond_target(),
                    _ => None,
                });
                if let Some(target) = target {
                    if target != node.id {
                        redirect = Some((node.id, target));
                        break;
                    }
                }
            }
            let Some((from, to)) = redirect else {
                break;
            };
            for node in &mut self.nodes {
                if node.id == from {
                    continue;
                }
                for inst in &mut node.insts {
                    if inst.deleted {
                        continue;
                    }
                    match &mut inst.kind {
                        InstKind::Br(BrKind::Uncond { target }) => {
                            if *target == from {
                                *target = to;
                            }
                        }
                        InstKind::Br(BrKind::Cond {
                            on_true, on_false, ..
                        }) => {
                            if *on_true == from {
                                *on_true = to;
                            }
                            if *on_false == from {
                                *on_false = to;
                            }
                        }
                        InstKind::Target(t) => {
                            t.retarget(from, to);
                        }
                        _ => {}
                    }
                }
            }
            self.nodes[from.0 as usize].contracted = true;
        }
        self.compute_predecessors();
    }

    /// Rebuild the emission order: entry first, then the remaining live
    /// nodes in index order.
    pub fn reorder_nodes(&mut self) {
        let entry = self.entry;
        self.layout = std::iter::once(entry)
            .chain(
                self.nodes
                    .iter()
                    .filter(|n| n.id != entry && !n.contracted)
                    .map(|n| n.id),
            )
            .collect();
    }

    // ------------------------------------------------------------------
    // Dumping
    // ------------------------------------------------------------------

    pub fn var_text(&self, id: VarId) -> String {
        let var = self.var(id);
        let base = match &var.name {
            Some(name) => format!("%{name}"),
            None => format!("%v{}", id.0),
        };
        match var.reg {
            Some(reg) => format!("{base}@r{reg}"),
            None => base,
        }
    }

    pub fn operand_text(&self, op: &Operand) -> String {
        match op {
            Operand::Var(v) => self.var_text(*v),
            Operand::Const32 { value, .. } => format!("{value}"),
            Operand::Const64(v) => format!("{v}"),
            Operand::ConstF32(v) => format!("{v}"),
            Operand::ConstF64(v) => format!("{v}"),
            Operand::Reloc { name, offset } => {
                if *offset == 0 {
                    format!("@{name}")
                } else {
                    format!("@{name}+{offset}")
                }
            }
            Operand::Undef(_) => "undef".to_string(),
            Operand::Mem(mem) => {
                let mut s = format!("[{}", self.var_text(mem.base));
                match mem.index {
                    MemIndex::Imm(0) => {}
                    MemIndex::Imm(off) => {
                        let _ = write!(s, ", #{off}");
                    }
                    MemIndex::RegReg { index, shift, amt } => {
                        let _ = write!(s, ", {}", self.var_text(index));
                        if shift != crate::operand::ShiftOp::None {
                            let _ = write!(s, ", {} #{amt}", shift.mnemonic());
                        }
                    }
                }
                s.push(']');
                s
            }
            Operand::FlexImm { imm, .. } => format!("#{}", imm.value()),
            Operand::FlexReg(fr) => {
                let mut s = self.var_text(fr.reg);
                if fr.shift != crate::operand::ShiftOp::None {
                    match fr.amt {
                        ShiftAmt::Imm(amt) => {
                            let _ = write!(s, ", {} #{amt}", fr.shift.mnemonic());
                        }
                        ShiftAmt::Reg(r) => {
                            let _ = write!(s, ", {} {}", fr.shift.mnemonic(), self.var_text(r));
                        }
                    }
                }
                s
            }
        }
    }

    /// Render the function for diagnostics. Deleted instructions are
    /// skipped; target instructions render through their own writer.
    pub fn dump_text(&self) -> String {
        let mut s = String::new();
        let _ = writeln!(s, "define {} @{}() {{", self.ret_ty, self.name);
        for &nid in &self.layout {
            let node = self.node(nid);
            if node.contracted {
                continue;
            }
            let _ = writeln!(s, "L{}:", nid.0);
            for inst in node.phis.iter().chain(node.insts.iter()) {
                if inst.deleted {
                    continue;
                }
                s.push_str("  ");
                self.write_inst(&inst.kind, &mut s);
                s.push('\n');
            }
        }
        s.push_str("}\n");
        s
    }

    fn write_inst(&self, kind: &InstKind<T>, s: &mut String) {
        match kind {
            InstKind::Alloca { dest, size, align } => {
                let _ = write!(
                    s,
                    "{} = alloca {}, align {align}",
                    self.var_text(*dest),
                    self.operand_text(size)
                );
            }
            InstKind::Arithmetic {
                op,
                dest,
                src0,
                src1,
            } => {
                let _ = write!(
                    s,
                    "{} = {:?} {}, {}",
                    self.var_text(*dest),
                    op,
                    self.operand_text(src0),
                    self.operand_text(src1)
                );
            }
            InstKind::Assign { dest, src } => {
                let _ = write!(s, "{} = {}", self.var_text(*dest), self.operand_text(src));
            }
            InstKind::Br(BrKind::Uncond { target }) => {
                let _ = write!(s, "br L{}", target.0);
            }
            InstKind::Br(BrKind::Cond {
                cond,
                on_true,
                on_false,
            }) => {
                let _ = write!(
                    s,
                    "br {}, L{}, L{}",
                    self.operand_text(cond),
                    on_true.0,
                    on_false.0
                );
            }
            InstKind::Call { dest, target, args, .. } => {
                if let Some(d) = dest {
                    let _ = write!(s, "{} = ", self.var_text(*d));
                }
                let _ = write!(s, "call {}(", self.operand_text(target));
                for (i, a) in args.iter().enumerate() {
                    if i > 0 {
                        s.push_str(", ");
                    }
                    s.push_str(&self.operand_text(a));
                }
                s.push(')');
            }
            InstKind::Cast { kind, dest, src } => {
                let _ = write!(
                    s,
                    "{} = {:?} {}",
                    self.var_text(*dest),
                    kind,
                    self.operand_text(src)
                );
            }
            InstKind::Icmp {
                cond,
                dest,
                src0,
                src1,
            } => {
                let _ = write!(
                    s,
                    "{} = icmp {:?} {}, {}",
                    self.var_text(*dest),
                    cond,
                    self.operand_text(src0),
                    self.operand_text(src1)
                );
            }
            InstKind::IntrinsicCall { id, dest, args } => {
                if let Some(d) = dest {
                    let _ = write!(s, "{} = ", self.var_text(*d));
                }
                let _ = write!(s, "intrinsic {:?}(", id);
                for (i, a) in args.iter().enumerate() {
                    if i > 0 {
                        s.push_str(", ");
                    }
                    s.push_str(&self.operand_text(a));
                }
                s.push(')');
            }
            InstKind::Load { dest, addr } => {
                let _ = write!(
                    s,
                    "{} = load {}",
                    self.var_text(*dest),
                    self.operand_text(addr)
                );
            }
            InstKind::Phi { dest, incoming } => {
                let _ = write!(s, "{} = phi ", self.var_text(*dest));
                for (i, (op, node)) in incoming.iter().enumerate() {
                    if i > 0 {
                        s.push_str(", ");
                    }
                    let _ = write!(s, "[{}, L{}]", self.operand_text(op), node.0);
                }
            }
            InstKind::Ret { value } => match value {
                Some(v) => {
                    let _ = write!(s, "ret {}", self.operand_text(v));
                }
                None => s.push_str("ret void"),
            },
            InstKind::Store { value, addr } => {
                let _ = write!(
                    s,
                    "store {}, {}",
                    self.operand_text(value),
                    self.operand_text(addr)
                );
            }
            InstKind::Unreachable => s.push_str("unreachable"),
            InstKind::FakeDef { dest, .. } => {
                let _ = write!(s, "fakedef {}", self.var_text(*dest));
            }
            InstKind::FakeUse { var } => {
                let _ = write!(s, "fakeuse {}", self.var_text(*var));
            }
            InstKind::FakeKill { killed } => {
                let _ = write!(s, "fakekill x{}", killed.len());
            }
            InstKind::Target(t) => t.write_text(self, s),
        }
    }
}
