//! Register allocation and spill-slot assignment.
//!
//! A linear scan over the intervals produced by `liveness(Intervals)`. The
//! target supplies the available-register set; pre-colored variables keep
//! their registers and block overlapping candidates from taking them.
//! Variables left without a register become spill candidates; the frame
//! builder assigns their slots through the helpers at the bottom of this
//! module, in two bands (multi-block "globals" and per-node "locals").

use std::collections::HashMap;

use tracing::debug;

use crate::func::Func;
use crate::inst::{NodeId, TargetInst};
use crate::liveness::LiveRange;
use crate::operand::{RegNum, VarId, Weight};
use crate::types::apply_alignment;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum RegAllocKind {
    /// Full linear scan over every candidate.
    Global,
    /// Only infinite-weight variables, for the debug pipeline.
    InfOnly,
}

/// Target-supplied allocation parameters.
pub struct RegAllocParams {
    pub num_regs: usize,
    /// Registers the allocator may hand out.
    pub available: Vec<bool>,
}

/// Assign physical registers. Requires instruction numbers and live ranges
/// to be current.
pub fn reg_alloc<T: TargetInst>(func: &mut Func<T>, kind: RegAllocKind, params: &RegAllocParams) {
    let empty = LiveRange::default();
    let range_of = |func: &Func<T>, v: VarId| -> LiveRange {
        func.live_ranges
            .get(v.0 as usize)
            .copied()
            .unwrap_or(empty)
    };

    // Pre-colored variables pin their register over their whole range.
    let mut pinned: HashMap<RegNum, Vec<LiveRange>> = HashMap::new();
    for v in func.var_ids() {
        if let Some(reg) = func.var(v).reg {
            pinned.entry(reg).or_default().push(range_of(func, v));
        }
    }

    let mut candidates: Vec<VarId> = func
        .var_ids()
        .filter(|&v| {
            let var = func.var(v);
            if var.reg.is_some() || var.ignore_liveness {
                return false;
            }
            if !func.metadata.is_referenced(v) {
                return false;
            }
            match kind {
                RegAllocKind::Global => true,
                RegAllocKind::InfOnly => var.weight.is_inf(),
            }
        })
        .collect();
    candidates.sort_by_key(|&v| range_of(func, v).start);

    // Active assignments: register -> end of the holding interval.
    let mut active: Vec<(RegNum, u32)> = Vec::new();
    let mut assigned = 0usize;
    for v in candidates {
        let range = range_of(func, v);
        if range.is_empty() {
            continue;
        }
        active.retain(|&(_, end)| end > range.start);
        let mut chosen = None;
        for reg in 0..params.num_regs as RegNum {
            if !params.available[reg as usize] {
                continue;
            }
            if active.iter().any(|&(r, _)| r == reg) {
                continue;
            }
            let conflict = pinned
                .get(&reg)
                .map(|ranges| ranges.iter().any(|r| r.overlaps(&range)))
                .unwrap_or(false);
            if conflict {
                continue;
            }
            chosen = Some(reg);
            break;
        }
        match chosen {
            Some(reg) => {
                func.var_mut(v).reg = Some(reg);
                active.push((reg, range.end));
                assigned += 1;
            }
            None => {
                // Out of registers: finite-weight variables spill.
                if func.var(v).weight == Weight::Inf {
                    panic!("infinite-weight variable has no register available");
                }
            }
        }
    }
    debug!(func = %func.name, ?kind, assigned, "register allocation");
}

/// Spill-slot summary handed to the frame builder.
#[derive(Debug, Default)]
pub struct StackSlotParams {
    pub sorted_spilled: Vec<VarId>,
    pub regs_used: Vec<bool>,
    pub globals_size: u32,
    /// Locals-only size on input; the frame builder folds in the rest.
    pub spill_area_size: u32,
    pub spill_area_align: u32,
    pub locals_slots_align: u32,
}

/// Collect the spilled variables and the sizes/alignments of the two spill
/// bands. Mirrors the contract the target lowering relies on: registers
/// actually used are reported so the preserved-register push list can be
/// computed.
pub fn get_var_stack_slot_params<T: TargetInst>(func: &Func<T>, num_regs: usize) -> StackSlotParams {
    let mut out = StackSlotParams {
        regs_used: vec![false; num_regs],
        ..Default::default()
    };
    let mut spilled = Vec::new();
    for v in func.var_ids() {
        let var = func.var(v);
        if let Some(reg) = var.reg {
            if (reg as usize) < num_regs {
                out.regs_used[reg as usize] = true;
            }
            continue;
        }
        // Stack-passed arguments get their offsets from the argument walk.
        if var.is_arg {
            continue;
        }
        if !func.metadata.is_referenced(v) {
            continue;
        }
        spilled.push(v);
    }
    // Larger slots first so band interiors stay aligned.
    spilled.sort_by(|&a, &b| {
        func.var(b)
            .ty
            .stack_bytes()
            .cmp(&func.var(a).ty.stack_bytes())
    });

    let mut locals_size: HashMap<NodeId, u32> = HashMap::new();
    let mut max_locals = 0u32;
    for &v in &spilled {
        let increment = func.var(v).ty.stack_bytes() as u32;
        if out.spill_area_align == 0 {
            out.spill_area_align = increment;
        }
        if func.metadata.is_multi_block(v) {
            out.globals_size += increment;
        } else {
            let node = func.metadata.local_use_node(v).unwrap_or(func.entry);
            let size = locals_size.entry(node).or_insert(0);
            *size += increment;
            max_locals = max_locals.max(*size);
            if out.locals_slots_align == 0 {
                out.locals_slots_align = increment;
            }
        }
    }
    out.spill_area_size = max_locals;
    out.sorted_spilled = spilled;
    out
}

/// Compute the padding before the spill area and between the two bands.
pub fn align_stack_spill_areas(
    spill_area_start: u32,
    spill_area_align: u32,
    globals_size: u32,
    locals_slots_align: u32,
) -> (u32, u32) {
    let mut spill_area_padding = 0;
    if spill_area_align > 0 {
        let start = apply_alignment(spill_area_start, spill_area_align);
        spill_area_padding = start - spill_area_start;
    }
    let mut locals_slots_padding = 0;
    if locals_slots_align > 0 {
        let padded = apply_alignment(globals_size, locals_slots_align);
        locals_slots_padding = padded - globals_size;
    }
    (spill_area_padding, locals_slots_padding)
}

/// Hand out stack offsets for the spilled variables. Multi-block variables
/// stack up in the globals band; single-block variables share the locals
/// band per node. Offsets are negative from FP, or positive from SP.
pub fn assign_var_stack_slots<T: TargetInst>(
    func: &mut Func<T>,
    sorted_spilled: &[VarId],
    spill_area_padding: u32,
    spill_area_size: u32,
    globals_and_subsequent_padding: u32,
    uses_frame_pointer: bool,
) {
    let mut globals_space_used = spill_area_padding;
    let mut next_stack_offset = spill_area_padding;
    let mut locals_size: HashMap<NodeId, u32> = HashMap::new();
    for &v in sorted_spilled {
        let increment = func.var(v).ty.stack_bytes() as u32;
        if func.metadata.is_multi_block(v) {
            globals_space_used += increment;
            next_stack_offset = globals_space_used;
        } else {
            let node = func.metadata.local_use_node(v).unwrap_or(func.entry);
            let size = locals_size.entry(node).or_insert(0);
            *size += increment;
            next_stack_offset = spill_area_padding + globals_and_subsequent_padding + *size;
        }
        let offset = if uses_frame_pointer {
            -(next_stack_offset as i32)
        } else {
            spill_area_size as i32 - next_stack_offset as i32
        };
        func.var_mut(v).stack_offset = Some(offset);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_align_stack_spill_areas() {
        // Push list of 3 registers (12 bytes), 8-byte-aligned spills.
        let (pad, locals_pad) = align_stack_spill_areas(12, 8, 20, 4);
        assert_eq!(pad, 4);
        assert_eq!(locals_pad, 0);

        let (pad, locals_pad) = align_stack_spill_areas(16, 8, 6, 4);
        assert_eq!(pad, 0);
        assert_eq!(locals_pad, 2);
    }
}
