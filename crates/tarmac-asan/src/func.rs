//! Per-function instrumentation.

use std::sync::atomic::Ordering;

use tracing::trace;

use tarmac_ir::{
    offset_to_alignment, ArithOp, Func, Inst, InstKind, Operand, TargetInst, Type, VarId,
};

use crate::{AsanInstrumentation, FUNC_SUBSTITUTIONS, RZ_ARRAY_NAME, RZ_SIZES_NAME, RZ_SIZE};

/// Pending unpoison calls for the function being walked: redzone address
/// variable and byte size, in emission order.
struct FuncState {
    local_dtors: Vec<(VarId, i32)>,
}

fn helper_call<T: TargetInst>(name: &str, args: Vec<Operand>) -> InstKind<T> {
    InstKind::Call {
        dest: None,
        target: Operand::reloc(name),
        args,
        tail: false,
        side_effects: true,
    }
}

impl AsanInstrumentation {
    /// Instrument one function: alloca redzones at entry, access checks,
    /// allocator substitution, unpoison lists before returns, and the
    /// `__asan_init` start hook (which waits for the globals gate).
    pub fn instrument_func<T: TargetInst>(&self, func: &mut Func<T>) {
        let mut state = FuncState {
            local_dtors: Vec::new(),
        };
        self.instrument_func_start(func, &mut state);
        self.instrument_insts(func, &state);
        self.instrument_start(func);
        self.finish_func(func, &mut state);
    }

    /// Rewrite the run of constant-size allocas at the function entry to
    /// reserve redzone space, and poison the redzones. A final standalone
    /// redzone covers the leftmost local.
    fn instrument_func_start<T: TargetInst>(&self, func: &mut Func<T>, state: &mut FuncState) {
        let entry = func.entry;
        let insts = std::mem::take(&mut func.node_mut(entry).insts);
        let mut out: Vec<Inst<T>> = Vec::with_capacity(insts.len() + 8);
        let mut initializations: Vec<Inst<T>> = Vec::new();
        let mut has_locals = false;

        let mut iter = insts.into_iter().peekable();
        while let Some(inst) = iter.peek() {
            let (dest, var_size) = match &inst.kind {
                InstKind::Alloca {
                    dest,
                    size: Operand::Const32 { value, .. },
                    ..
                } if !inst.deleted => (*dest, *value as u32),
                _ => break,
            };
            has_locals = true;
            let mut original = iter.next().unwrap();

            // The replacement alloca reserves the variable plus its
            // right redzone, at 8-byte alignment.
            let rz_padding = RZ_SIZE + offset_to_alignment(var_size, RZ_SIZE);
            let byte_count = var_size + rz_padding;
            out.push(Inst::new(InstKind::Alloca {
                dest,
                size: Operand::i32(byte_count as i32),
                align: 8,
            }));
            original.set_deleted();
            out.push(original);

            // rz = dest + size, then poison it on entry and remember the
            // matching unpoison.
            let rz_loc = func.make_named_variable(Type::I32, self.next_rz_name());
            initializations.push(Inst::new(InstKind::Arithmetic {
                op: ArithOp::Add,
                dest: rz_loc,
                src0: Operand::Var(dest),
                src1: Operand::i32(var_size as i32),
            }));
            initializations.push(Inst::new(helper_call(
                "__asan_poison",
                vec![Operand::Var(rz_loc), Operand::i32(rz_padding as i32)],
            )));
            state.local_dtors.push((rz_loc, rz_padding as i32));
        }

        // The leftmost redzone is its own alloca below all the locals.
        if has_locals {
            let last_rz = func.make_named_variable(Type::I32, self.next_rz_name());
            out.push(Inst::new(InstKind::Alloca {
                dest: last_rz,
                size: Operand::i32(RZ_SIZE as i32),
                align: 8,
            }));
            out.push(Inst::new(helper_call(
                "__asan_poison",
                vec![Operand::Var(last_rz), Operand::i32(RZ_SIZE as i32)],
            )));
            state.local_dtors.push((last_rz, RZ_SIZE as i32));
        }
        out.append(&mut initializations);
        out.extend(iter);
        func.node_mut(entry).insts = out;
    }

    /// Walk every instruction: checks before loads/stores, allocator
    /// substitution, unpoison lists before returns.
    fn instrument_insts<T: TargetInst>(&self, func: &mut Func<T>, state: &FuncState) {
        enum Action {
            Keep,
            CheckBefore(Operand, usize),
            Substitute(&'static str),
            UnpoisonBefore,
        }

        for i in 0..func.nodes.len() {
            let insts = std::mem::take(&mut func.nodes[i].insts);
            let mut out: Vec<Inst<T>> = Vec::with_capacity(insts.len());
            for mut inst in insts {
                let action = if inst.deleted {
                    Action::Keep
                } else {
                    match &inst.kind {
                        InstKind::Load { dest, addr } => {
                            Action::CheckBefore(addr.clone(), func.var(*dest).ty.bytes())
                        }
                        InstKind::Store { value, addr } => {
                            Action::CheckBefore(addr.clone(), func.operand_type(value).bytes())
                        }
                        InstKind::Call { target, .. } => {
                            let name = match target {
                                Operand::Reloc { name, .. } => Some(name.as_str()),
                                _ => None,
                            };
                            match name.and_then(|n| {
                                FUNC_SUBSTITUTIONS
                                    .iter()
                                    .find(|(from, _)| *from == n)
                                    .map(|(_, to)| *to)
                            }) {
                                Some(to) => Action::Substitute(to),
                                None => Action::Keep,
                            }
                        }
                        InstKind::Ret { .. } => Action::UnpoisonBefore,
                        _ => Action::Keep,
                    }
                };
                match action {
                    Action::Keep => out.push(inst),
                    Action::CheckBefore(addr, width) => {
                        out.push(Inst::new(helper_call(
                            "__asan_check",
                            vec![addr, Operand::i32(width as i32)],
                        )));
                        out.push(inst);
                    }
                    Action::Substitute(to) => {
                        let new_kind = match &inst.kind {
                            InstKind::Call {
                                dest, args, tail, ..
                            } => InstKind::Call {
                                dest: *dest,
                                target: Operand::reloc(to),
                                args: args.clone(),
                                tail: *tail,
                                side_effects: true,
                            },
                            _ => unreachable!(),
                        };
                        out.push(Inst::new(new_kind));
                        inst.set_deleted();
                        out.push(inst);
                    }
                    Action::UnpoisonBefore => {
                        for &(rz, size) in &state.local_dtors {
                            out.push(Inst::new(helper_call(
                                "__asan_unpoison",
                                vec![Operand::Var(rz), Operand::i32(size)],
                            )));
                        }
                        out.push(inst);
                    }
                }
            }
            func.nodes[i].insts = out;
        }
    }

    /// Prepend the shadow-memory init call. Blocks until the globals list
    /// has been instrumented so the redzone count is final.
    fn instrument_start<T: TargetInst>(&self, func: &mut Func<T>) {
        let mut done = self.did_process_globals.lock().unwrap();
        while !*done {
            done = self.globals_done.wait(done).unwrap();
        }
        drop(done);
        let count = self.rz_globals_num.load(Ordering::SeqCst);

        let call = helper_call(
            "__asan_init",
            vec![
                Operand::i32(count as i32),
                Operand::reloc(RZ_ARRAY_NAME),
                Operand::reloc(RZ_SIZES_NAME),
            ],
        );
        let entry = func.entry;
        func.node_mut(entry).insts.insert(0, Inst::new(call));
    }

    fn finish_func<T: TargetInst>(&self, func: &Func<T>, state: &mut FuncState) {
        trace!(func = %func.name, dtors = state.local_dtors.len(), "instrumented");
        state.local_dtors.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tarmac_ir::{Flags, FuncBuilder, GlobalContext, NoTarget};

    fn new_asan() -> AsanInstrumentation {
        let ctx = Arc::new(GlobalContext::with_output(
            Flags::default(),
            Box::new(std::io::sink()),
        ));
        AsanInstrumentation::new(ctx)
    }

    fn call_name<T: TargetInst>(inst: &Inst<T>) -> Option<&str> {
        match &inst.kind {
            InstKind::Call {
                target: Operand::Reloc { name, .. },
                ..
            } if !inst.deleted => Some(name.as_str()),
            _ => None,
        }
    }

    #[test]
    fn test_alloca_redzone_and_unpoison() {
        let asan = new_asan();
        // Globals must be processed before the start hook can run.
        asan.instrument_globals();

        let mut b = FuncBuilder::<NoTarget>::new("f", Type::Void);
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

        asan.instrument_func(&mut func);

        let insts: Vec<_> = func
            .node(func.entry)
            .insts
            .iter()
            .filter(|i| !i.deleted)
            .collect();

        // __asan_init first, then the widened alloca.
        assert_eq!(call_name(insts[0]), Some("__asan_init"));
        match &insts[1].kind {
            InstKind::Alloca { size, align, .. } => {
                // 40 + 32 + pad_to(40, 32) = 96.
                assert!(matches!(size, Operand::Const32 { value: 96, .. }));
                assert_eq!(*align, 8);
            }
            other => panic!("expected widened alloca, got {other:?}"),
        }
        // Leftmost redzone alloca plus its poison, then rz = dest + 40 and
        // its poison.
        assert!(matches!(insts[2].kind, InstKind::Alloca { .. }));
        assert_eq!(call_name(insts[3]), Some("__asan_poison"));
        match &insts[4].kind {
            InstKind::Arithmetic { op, src1, .. } => {
                assert_eq!(*op, ArithOp::Add);
                assert!(matches!(src1, Operand::Const32 { value: 40, .. }));
            }
            other => panic!("expected redzone address arithmetic, got {other:?}"),
        }
        assert_eq!(call_name(insts[5]), Some("__asan_poison"));
        match &insts[5].kind {
            InstKind::Call { args, .. } => {
                assert!(matches!(args[1], Operand::Const32 { value: 56, .. }));
            }
            _ => unreachable!(),
        }

        // One unpoison per constant alloca plus one for the leftmost
        // redzone, all before the return.
        let unpoisons = insts
            .iter()
            .take_while(|i| !matches!(i.kind, InstKind::Ret { .. }))
            .filter(|i| call_name(i) == Some("__asan_unpoison"))
            .count();
        assert_eq!(unpoisons, 2);
    }

    #[test]
    fn test_load_store_checks() {
        let asan = new_asan();
        asan.instrument_globals();

        let mut b = FuncBuilder::<NoTarget>::new("f", Type::Void);
        let entry = b.entry();
        let addr = b.arg(Type::I32);
        let val = b.var(Type::I16);
        b.push(
            entry,
            InstKind::Load {
                dest: val,
                addr: Operand::Var(addr),
            },
        );
        b.push(
            entry,
            InstKind::Store {
                value: Operand::Var(val),
                addr: Operand::Var(addr),
            },
        );
        b.ret(entry, None);
        let mut func = b.build();
        asan.instrument_func(&mut func);

        let insts: Vec<_> = func
            .node(func.entry)
            .insts
            .iter()
            .filter(|i| !i.deleted)
            .collect();
        let checks: Vec<_> = insts
            .iter()
            .enumerate()
            .filter(|(_, i)| call_name(i) == Some("__asan_check"))
            .map(|(pos, _)| pos)
            .collect();
        assert_eq!(checks.len(), 2);
        // Each check immediately precedes its access.
        assert!(matches!(insts[checks[0] + 1].kind, InstKind::Load { .. }));
        assert!(matches!(insts[checks[1] + 1].kind, InstKind::Store { .. }));
        // Both accesses are 2 bytes wide.
        for pos in checks {
            match &insts[pos].kind {
                InstKind::Call { args, .. } => {
                    assert!(matches!(args[1], Operand::Const32 { value: 2, .. }));
                }
                _ => unreachable!(),
            }
        }
    }

    #[test]
    fn test_allocator_substitution() {
        let asan = new_asan();
        asan.instrument_globals();

        let mut b = FuncBuilder::<NoTarget>::new("f", Type::Void);
        let entry = b.entry();
        let p = b.var(Type::I32);
        b.push(
            entry,
            InstKind::Call {
                dest: Some(p),
                target: Operand::reloc("malloc"),
                args: vec![Operand::i32(16)],
                tail: false,
                side_effects: true,
            },
        );
        b.push(
            entry,
            InstKind::Call {
                dest: None,
                target: Operand::reloc("free"),
                args: vec![Operand::Var(p)],
                tail: false,
                side_effects: true,
            },
        );
        b.ret(entry, None);
        let mut func = b.build();
        asan.instrument_func(&mut func);

        let names: Vec<String> = func
            .node(func.entry)
            .insts
            .iter()
            .filter_map(|i| call_name(i).map(str::to_string))
            .collect();
        assert!(names.contains(&"__asan_malloc".to_string()));
        assert!(names.contains(&"__asan_free".to_string()));
        assert!(!names.contains(&"malloc".to_string()));
        assert!(!names.contains(&"free".to_string()));
        // The malloc result still lands in the same variable.
        let malloc_dest = func
            .node(func.entry)
            .insts
            .iter()
            .find_map(|i| match (&i.kind, call_name(i)) {
                (InstKind::Call { dest, .. }, Some("__asan_malloc")) => *dest,
                _ => None,
            });
        assert_eq!(malloc_dest, Some(p));
    }
}
