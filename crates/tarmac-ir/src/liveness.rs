//! Liveness analysis and variable metadata.
//!
//! Two precision levels: `Basic` computes per-node live-in/out sets, which
//! is enough for lowering decisions; `Intervals` additionally derives a
//! conservative `[start, end)` instruction range per variable for the
//! linear-scan allocator. Both skip deleted instructions and variables
//! flagged `ignore_liveness`.

use std::collections::HashSet;

use tracing::trace;

use crate::func::Func;
use crate::inst::{NodeId, TargetInst};
use crate::operand::VarId;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum LivenessMode {
    Basic,
    Intervals,
}

/// Instruction-number interval a variable is live over.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub struct LiveRange {
    pub start: u32,
    pub end: u32,
}

impl LiveRange {
    pub fn is_empty(&self) -> bool {
        self.start >= self.end
    }

    pub fn overlaps(&self, other: &LiveRange) -> bool {
        !self.is_empty() && !other.is_empty() && self.start < other.end && other.start < self.end
    }

    fn extend(&mut self, point: u32) {
        if self.is_empty() && self.start == 0 && self.end == 0 {
            self.start = point;
            self.end = point + 1;
        } else {
            self.start = self.start.min(point);
            self.end = self.end.max(point + 1);
        }
    }
}

/// Per-variable usage summary: whether it is referenced at all and whether
/// its lifetime spans more than one node. Single-block variables remember
/// their node so spill slots can be coalesced per block.
#[derive(Clone, Debug, Default)]
pub struct VarMetadata {
    pub referenced: Vec<bool>,
    pub multi_block: Vec<bool>,
    pub local_node: Vec<Option<NodeId>>,
}

impl VarMetadata {
    pub fn is_referenced(&self, v: VarId) -> bool {
        self.referenced.get(v.0 as usize).copied().unwrap_or(false)
    }

    pub fn is_multi_block(&self, v: VarId) -> bool {
        self.multi_block.get(v.0 as usize).copied().unwrap_or(false)
    }

    pub fn local_use_node(&self, v: VarId) -> Option<NodeId> {
        self.local_node.get(v.0 as usize).copied().flatten()
    }
}

/// Recompute variable metadata over the live (non-deleted) instructions.
pub fn compute_var_metadata<T: TargetInst>(func: &mut Func<T>) {
    let n = func.num_vars();
    let mut meta = VarMetadata {
        referenced: vec![false; n],
        multi_block: vec![false; n],
        local_node: vec![None; n],
    };
    let mut scratch = Vec::new();
    for node in &func.nodes {
        for inst in node.phis.iter().chain(node.insts.iter()) {
            if inst.deleted {
                continue;
            }
            scratch.clear();
            inst.kind.dests(&mut scratch);
            inst.kind.srcs(&mut scratch);
            for &v in &scratch {
                let idx = v.0 as usize;
                meta.referenced[idx] = true;
                match meta.local_node[idx] {
                    None => meta.local_node[idx] = Some(node.id),
                    Some(prev) if prev != node.id => meta.multi_block[idx] = true,
                    Some(_) => {}
                }
            }
        }
    }
    // Arguments live across the prolog regardless of where they appear.
    for &arg in &func.args {
        if (arg.0 as usize) < n {
            meta.multi_block[arg.0 as usize] = true;
        }
    }
    func.metadata = meta;
}

/// Run liveness at the requested precision.
pub fn liveness<T: TargetInst>(func: &mut Func<T>, mode: LivenessMode) {
    let num_vars = func.num_vars();
    let num_nodes = func.nodes.len();

    // Per-node gen (upward-exposed uses) and kill (defs).
    let mut gens: Vec<HashSet<VarId>> = Vec::with_capacity(num_nodes);
    let mut kills: Vec<HashSet<VarId>> = Vec::with_capacity(num_nodes);
    let mut dests = Vec::new();
    let mut srcs = Vec::new();
    for node in &func.nodes {
        let mut gen_set = HashSet::new();
        let mut kill: HashSet<VarId> = HashSet::new();
        for inst in node.phis.iter().chain(node.insts.iter()) {
            if inst.deleted {
                continue;
            }
            srcs.clear();
            inst.kind.srcs(&mut srcs);
            for &v in &srcs {
                if !func.var(v).ignore_liveness && !kill.contains(&v) {
                    gen_set.insert(v);
                }
            }
            dests.clear();
            inst.kind.dests(&mut dests);
            for &v in &dests {
                if !func.var(v).ignore_liveness {
                    kill.insert(v);
                }
            }
        }
        gens.push(gen_set);
        kills.push(kill);
    }

    // Backward fixpoint over live-in/out.
    let mut live_in: Vec<HashSet<VarId>> = vec![HashSet::new(); num_nodes];
    let mut live_out: Vec<HashSet<VarId>> = vec![HashSet::new(); num_nodes];
    let succs: Vec<Vec<NodeId>> = func.nodes.iter().map(|n| n.succs()).collect();
    let mut changed = true;
    while changed {
        changed = false;
        for i in (0..num_nodes).rev() {
            let mut out = HashSet::new();
            for &s in &succs[i] {
                out.extend(live_in[s.0 as usize].iter().copied());
            }
            let mut inn: HashSet<VarId> = gens[i].clone();
            for &v in &out {
                if !kills[i].contains(&v) {
                    inn.insert(v);
                }
            }
            if out != live_out[i] || inn != live_in[i] {
                changed = true;
                live_out[i] = out;
                live_in[i] = inn;
            }
        }
    }
    for (i, node) in func.nodes.iter_mut().enumerate() {
        node.live_in = live_in[i].clone();
        node.live_out = live_out[i].clone();
    }
    trace!(func = %func.name, ?mode, "liveness complete");

    if mode != LivenessMode::Intervals {
        return;
    }

    // Conservative single-interval ranges from instruction numbers.
    let mut ranges = vec![LiveRange::default(); num_vars];
    for node in &func.nodes {
        let numbers: Vec<u32> = node
            .phis
            .iter()
            .chain(node.insts.iter())
            .filter(|i| !i.deleted)
            .map(|i| i.number)
            .collect();
        let (Some(&first), Some(&last)) = (numbers.first(), numbers.last()) else {
            continue;
        };
        for inst in node.phis.iter().chain(node.insts.iter()) {
            if inst.deleted {
                continue;
            }
            dests.clear();
            inst.kind.dests(&mut dests);
            srcs.clear();
            inst.kind.srcs(&mut srcs);
            for &v in dests.iter().chain(srcs.iter()) {
                ranges[v.0 as usize].extend(inst.number);
            }
        }
        for &v in &node.live_in {
            ranges[v.0 as usize].extend(first);
        }
        for &v in &node.live_out {
            ranges[v.0 as usize].extend(last);
        }
    }
    func.live_ranges = ranges;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_range_overlap() {
        let a = LiveRange { start: 1, end: 5 };
        let b = LiveRange { start: 4, end: 9 };
        let c = LiveRange { start: 5, end: 6 };
        assert!(a.overlaps(&b));
        assert!(!a.overlaps(&c));
        assert!(!a.overlaps(&LiveRange::default()));
    }

    #[test]
    fn test_range_extend() {
        let mut r = LiveRange::default();
        r.extend(7);
        assert_eq!(r, LiveRange { start: 7, end: 8 });
        r.extend(3);
        assert_eq!(r, LiveRange { start: 3, end: 8 });
    }
}
