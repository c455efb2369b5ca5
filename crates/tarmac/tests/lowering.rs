//! End-to-end lowering tests driving the real pipelines.

use std::sync::Arc;

use tarmac::{
    translate_func, AluOp, ArithOp, ArmBr, ArmInst, CastKind, Flags, Func, FuncBuilder,
    GlobalContext, IcmpCond, InstKind, Operand, OptLevel, ShiftAmt, ShiftOp, Translator, Type,
};
use tarmac::cond::Cond;

fn ctx_with(flags: Flags) -> GlobalContext {
    GlobalContext::with_output(flags, Box::new(std::io::sink()))
}

fn om1_flags() -> Flags {
    Flags {
        opt_level: OptLevel::Om1,
        ..Flags::default()
    }
}

/// All live target instructions in layout order.
fn collect_arm(func: &Func<ArmInst>) -> Vec<ArmInst> {
    let mut out = Vec::new();
    for &nid in &func.layout {
        let node = func.node(nid);
        if node.contracted {
            continue;
        }
        for inst in &node.insts {
            if inst.deleted {
                continue;
            }
            if let InstKind::Target(t) = &inst.kind {
                out.push(t.clone());
            }
        }
    }
    out
}

fn sum64_func() -> Func<ArmInst> {
    let mut b = FuncBuilder::new("sum64", Type::I64);
    let entry = b.entry();
    let a = b.arg(Type::I64);
    let c = b.arg(Type::I64);
    let d = b.var(Type::I64);
    b.push(
        entry,
        InstKind::Arithmetic {
            op: ArithOp::Add,
            dest: d,
            src0: Operand::Var(a),
            src1: Operand::Var(c),
        },
    );
    b.ret(entry, Some(Operand::Var(d)));
    b.build()
}

#[test]
fn test_i64_add_lowering() {
    let ctx = ctx_with(om1_flags());
    let mut func = sum64_func();
    translate_func(&mut func, &ctx);
    assert!(!func.has_error());

    let arm = collect_arm(&func);
    let adds = arm
        .iter()
        .position(|i| {
            matches!(
                i,
                ArmInst::Alu {
                    op: AluOp::Add,
                    set_flags: true,
                    ..
                }
            )
        })
        .expect("adds for the low half");
    // adds t_lo, a.lo, b.lo; mov c.lo, t_lo; adc t_hi, a.hi, b.hi;
    // mov c.hi, t_hi
    assert!(matches!(arm[adds + 1], ArmInst::Mov { .. }));
    assert!(matches!(
        arm[adds + 2],
        ArmInst::Alu {
            op: AluOp::Adc,
            set_flags: false,
            ..
        }
    ));
    assert!(matches!(arm[adds + 3], ArmInst::Mov { .. }));
}

#[test]
fn test_i64_add_through_o2() {
    let ctx = ctx_with(Flags::default());
    let mut func = sum64_func();
    translate_func(&mut func, &ctx);
    assert!(!func.has_error());
    let arm = collect_arm(&func);
    assert!(arm.iter().any(|i| matches!(
        i,
        ArmInst::Alu {
            op: AluOp::Adc,
            ..
        }
    )));
    assert!(arm.iter().any(|i| matches!(i, ArmInst::Ret { .. })));
}

#[test]
fn test_narrow_unsigned_compare() {
    // r = icmp ult i8 a, b:
    //   lsl ta, ra, #24
    //   mov t, #0
    //   cmp ta, rb, lsl #24
    //   movcc t, #1
    //   mov r, t
    let ctx = ctx_with(om1_flags());
    let mut b = FuncBuilder::new("below", Type::I32);
    let entry = b.entry();
    let a = b.arg(Type::I8);
    let lim = b.arg(Type::I8);
    let r = b.var(Type::I1);
    b.push(
        entry,
        InstKind::Icmp {
            cond: IcmpCond::Ult,
            dest: r,
            src0: Operand::Var(a),
            src1: Operand::Var(lim),
        },
    );
    b.ret(entry, None);
    let mut func = b.build();
    translate_func(&mut func, &ctx);
    assert!(!func.has_error());

    let arm = collect_arm(&func);
    let cmp = arm
        .iter()
        .position(|i| {
            matches!(
                i,
                ArmInst::Cmp {
                    src1: Operand::FlexReg(fr),
                    ..
                } if fr.shift == ShiftOp::Lsl && fr.amt == ShiftAmt::Imm(24)
            )
        })
        .expect("shifted compare");
    // Both sides are shifted left by 24, and the result register is zeroed
    // between the shift of the first operand and the compare. (Operand
    // legalization may interleave plain copies.)
    let lsl = arm
        .iter()
        .position(|i| {
            matches!(
                i,
                ArmInst::Alu {
                    op: AluOp::Lsl,
                    src1: Operand::FlexImm { imm, .. },
                    ..
                } if imm.value() == 24
            )
        })
        .expect("shift of the first operand");
    let mov_zero = arm
        .iter()
        .position(|i| {
            matches!(
                i,
                ArmInst::Mov {
                    src: Operand::FlexImm { imm, .. },
                    pred: Cond::Al,
                    nonkillable: false,
                    ..
                } if imm.value() == 0
            )
        })
        .expect("zeroing of the result");
    assert!(lsl < mov_zero && mov_zero < cmp);
    assert!(matches!(
        &arm[cmp + 1],
        ArmInst::Mov {
            src: Operand::FlexImm { imm, .. },
            pred: Cond::Cc,
            nonkillable: true,
            ..
        } if imm.value() == 1
    ));
    assert!(matches!(&arm[cmp + 2], ArmInst::Mov { .. }));
}

#[test]
fn test_sandboxed_return() {
    let ctx = ctx_with(Flags {
        opt_level: OptLevel::Om1,
        use_sandboxing: true,
        ..Flags::default()
    });
    let mut b = FuncBuilder::new("id", Type::I32);
    let entry = b.entry();
    let x = b.arg(Type::I32);
    b.ret(entry, Some(Operand::Var(x)));
    let mut func = b.build();
    translate_func(&mut func, &ctx);
    assert!(!func.has_error());

    let arm = collect_arm(&func);
    let lock = arm
        .iter()
        .position(|i| matches!(i, ArmInst::BundleLock))
        .expect("bundle_lock");
    assert!(matches!(
        &arm[lock + 1],
        ArmInst::Alu {
            op: AluOp::Bic,
            src1: Operand::FlexImm { imm, .. },
            ..
        } if imm.value() == 0xC000_000F
    ));
    assert!(matches!(&arm[lock + 2], ArmInst::Ret { .. }));
    assert!(matches!(&arm[lock + 3], ArmInst::BundleUnlock));
    // The original return was replaced, not duplicated.
    let rets = arm
        .iter()
        .filter(|i| matches!(i, ArmInst::Ret { .. }))
        .count();
    assert_eq!(rets, 1);
}

#[test]
fn test_large_immediate_movw_movt() {
    let ctx = ctx_with(om1_flags());
    let mut b = FuncBuilder::new("konst", Type::I32);
    let entry = b.entry();
    let v = b.var(Type::I32);
    b.push(
        entry,
        InstKind::Assign {
            dest: v,
            src: Operand::i32(0x12345678),
        },
    );
    b.ret(entry, Some(Operand::Var(v)));
    let mut func = b.build();
    translate_func(&mut func, &ctx);
    assert!(!func.has_error());

    let arm = collect_arm(&func);
    let movw = arm
        .iter()
        .position(|i| {
            matches!(
                i,
                ArmInst::Movw {
                    src: Operand::Const32 { value: 0x5678, .. },
                    ..
                }
            )
        })
        .expect("movw of the low half");
    assert!(matches!(
        &arm[movw + 1],
        ArmInst::Movt {
            src: Operand::Const32 { value: 0x1234, .. },
            ..
        }
    ));
}

#[test]
fn test_alloca_keeps_stack_aligned() {
    let ctx = ctx_with(om1_flags());
    let mut b = FuncBuilder::new("locals", Type::Void);
    let entry = b.entry();
    let buf = b.var(Type::I32);
    b.push(
        entry,
        InstKind::Alloca {
            dest: buf,
            size: Operand::i32(40),
            align: 4,
        },
    );
    b.ret(entry, None);
    let mut func = b.build();
    translate_func(&mut func, &ctx);
    assert!(!func.has_error());

    let arm = collect_arm(&func);
    // Alloca forces a frame pointer.
    let push_bytes: u32 = arm
        .iter()
        .find_map(|i| match i {
            ArmInst::Push { regs } => Some(4 * regs.len() as u32),
            _ => None,
        })
        .expect("push of preserved registers");
    let subs: Vec<u32> = arm
        .iter()
        .filter_map(|i| match i {
            ArmInst::Alu {
                op: AluOp::Sub,
                src1: Operand::FlexImm { imm, .. },
                ..
            } => Some(imm.value()),
            _ => None,
        })
        .collect();
    // First sub is the prolog SP adjustment; together with the push list
    // it must leave SP 16-byte aligned.
    assert!(!subs.is_empty());
    assert_eq!((push_bytes + subs[0]) % 16, 0);
    // The alloca itself reserves 40 rounded up to the 16-byte alignment.
    assert!(subs.contains(&48));
}

#[test]
fn test_call_followed_by_register_kill() {
    let ctx = ctx_with(om1_flags());
    let mut b = FuncBuilder::new("caller", Type::I32);
    let entry = b.entry();
    let r = b.var(Type::I32);
    b.push(
        entry,
        InstKind::Call {
            dest: Some(r),
            target: Operand::reloc("leaf"),
            args: vec![],
            tail: false,
            side_effects: true,
        },
    );
    b.ret(entry, Some(Operand::Var(r)));
    let mut func = b.build();
    translate_func(&mut func, &ctx);
    assert!(!func.has_error());

    let entry_insts: Vec<_> = func
        .node(func.entry)
        .insts
        .iter()
        .filter(|i| !i.deleted)
        .collect();
    let call = entry_insts
        .iter()
        .position(|i| matches!(&i.kind, InstKind::Target(ArmInst::Call { .. })))
        .expect("lowered call");
    // The kill pseudo follows the call (with the i64-high fake def absent
    // for an i32 result) and covers the caller-save set.
    match &entry_insts[call + 1].kind {
        InstKind::FakeKill { killed } => assert_eq!(killed.len(), 5),
        other => panic!("expected register kill after call, got {other:?}"),
    }
}

#[test]
fn test_zext_i8_to_i64() {
    let ctx = ctx_with(om1_flags());
    let mut b = FuncBuilder::new("widen", Type::I64);
    let entry = b.entry();
    let a = b.arg(Type::I8);
    let w = b.var(Type::I64);
    b.push(
        entry,
        InstKind::Cast {
            kind: CastKind::Zext,
            dest: w,
            src: Operand::Var(a),
        },
    );
    b.ret(entry, Some(Operand::Var(w)));
    let mut func = b.build();
    translate_func(&mut func, &ctx);
    assert!(!func.has_error());

    let arm = collect_arm(&func);
    assert!(arm.iter().any(|i| matches!(i, ArmInst::Uxt { .. })));
    // The high half is zeroed.
    assert!(arm.iter().any(|i| matches!(
        i,
        ArmInst::Mov {
            src: Operand::FlexImm { imm, .. },
            ..
        } if imm.value() == 0
    )));
}

#[test]
fn test_unreachable_lowers_to_trap() {
    let ctx = ctx_with(om1_flags());
    let mut b = FuncBuilder::new("dead", Type::Void);
    let entry = b.entry();
    b.push(entry, InstKind::Unreachable);
    let mut func = b.build();
    translate_func(&mut func, &ctx);
    assert!(!func.has_error());

    let arm = collect_arm(&func);
    assert!(arm.iter().any(|i| matches!(i, ArmInst::Trap)));
}

#[test]
fn test_branch_to_next_node_removed() {
    let ctx = ctx_with(Flags::default());
    let mut b = FuncBuilder::new("fall", Type::Void);
    let entry = b.entry();
    let next = b.node();
    b.br(entry, next);
    b.ret(next, None);
    let mut func = b.build();
    translate_func(&mut func, &ctx);
    assert!(!func.has_error());

    let arm = collect_arm(&func);
    assert!(
        !arm.iter().any(|i| matches!(i, ArmInst::Br(_))),
        "unconditional branch to the fall-through node should be deleted"
    );
}

#[test]
fn test_conditional_branch_falls_through() {
    let ctx = ctx_with(Flags::default());
    let mut b = FuncBuilder::new("condfall", Type::I32);
    let entry = b.entry();
    let a = b.arg(Type::I32);
    let on_true = b.node();
    let on_false = b.node();
    b.br_cond(entry, Operand::Var(a), on_true, on_false);
    b.ret(on_true, Some(Operand::i32(1)));
    b.ret(on_false, Some(Operand::i32(0)));
    let mut func = b.build();
    translate_func(&mut func, &ctx);
    assert!(!func.has_error());

    // Layout is entry, on_true, on_false: the conditional branch keeps its
    // bne but drops the unconditional part (fall-through to on_true means
    // the condition is inverted or the false edge is elided).
    let arm = collect_arm(&func);
    let branches: Vec<_> = arm
        .iter()
        .filter_map(|i| match i {
            ArmInst::Br(br) => Some(br.clone()),
            _ => None,
        })
        .collect();
    assert_eq!(branches.len(), 1);
    match &branches[0] {
        ArmBr::Cond { on_false, .. } => assert!(on_false.is_none()),
        other => panic!("expected conditional branch, got {other:?}"),
    }
}

#[test]
fn test_asan_pipeline_end_to_end() {
    // Instrumented helper calls carry arguments, which this target only
    // lowers under the compile-skip flag.
    let flags = Flags {
        opt_level: OptLevel::Om1,
        enable_asan: true,
        skip_unimplemented: true,
        ..Flags::default()
    };
    let ctx = Arc::new(GlobalContext::with_output(flags, Box::new(std::io::sink())));

    let mut b = FuncBuilder::new("f", Type::Void);
    let entry = b.entry();
    let buf = b.var(Type::I32);
    b.push(
        entry,
        InstKind::Alloca {
            dest: buf,
            size: Operand::i32(16),
            align: 4,
        },
    );
    let v = b.var(Type::I32);
    b.push(
        entry,
        InstKind::Load {
            dest: v,
            addr: Operand::Var(buf),
        },
    );
    b.ret(entry, None);
    let func = b.build();

    let translator = Translator::new(ctx.clone());
    let funcs = translator.translate_all(vec![func]);
    assert!(!funcs[0].has_error());

    let arm = collect_arm(&funcs[0]);
    let call_names: Vec<&str> = arm
        .iter()
        .filter_map(|i| match i {
            ArmInst::Call {
                target: Operand::Reloc { name, .. },
                ..
            } => Some(name.as_str()),
            _ => None,
        })
        .collect();
    assert!(call_names.contains(&"__asan_init"));
    assert!(call_names.contains(&"__asan_check"));
    assert!(call_names.contains(&"__asan_poison"));
    assert!(call_names.contains(&"__asan_unpoison"));
}
