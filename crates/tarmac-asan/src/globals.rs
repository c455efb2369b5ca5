//! Global redzone insertion.

use std::sync::atomic::Ordering;

use tracing::debug;

use tarmac_ir::{dump_globals, offset_to_alignment, GlobalDecl, Initializer};

use crate::{AsanInstrumentation, RZ_ARRAY_NAME, RZ_SIZES_NAME, RZ_SIZE};

fn size_to_bytes(size: usize) -> Vec<u8> {
    (size as u64).to_le_bytes().to_vec()
}

impl AsanInstrumentation {
    /// Rebuild the globals list with redzones around every global. The
    /// initializer kinds of a redzone match its host global so they are
    /// laid out together. Runs exactly once; later calls return
    /// immediately. Broadcasts the globals gate when done.
    pub fn instrument_globals(&self) {
        let mut done = self.did_process_globals.lock().unwrap();
        if *done {
            return;
        }

        let mut globals = self.ctx.globals();
        let old = std::mem::take(&mut *globals);

        // One global holds pointers to all redzones, another their sizes.
        let mut rz_array = GlobalDecl::new(RZ_ARRAY_NAME);
        let mut rz_sizes = GlobalDecl::new(RZ_SIZES_NAME);
        rz_array.constant = true;
        rz_sizes.constant = true;

        let mut rest: Vec<GlobalDecl> = Vec::with_capacity(old.len() * 3);
        let mut rz_count = 0u32;
        for mut global in old {
            // Redzone alignment is the larger of 32 and the host global's
            // own alignment, so over-aligned globals stay over-aligned.
            let alignment = RZ_SIZE.max(global.align);
            let rz_left_size = alignment as usize;
            let rz_right_size =
                RZ_SIZE as usize + offset_to_alignment(global.num_bytes() as u32, alignment) as usize;

            let mut rz_left = GlobalDecl::new(self.next_rz_name());
            let mut rz_right = GlobalDecl::new(self.next_rz_name());
            if global.has_nonzero_initializer() {
                rz_left
                    .initializers
                    .push(Initializer::Data(vec![b'R'; rz_left_size]));
                rz_right
                    .initializers
                    .push(Initializer::Data(vec![b'R'; rz_right_size]));
            } else {
                rz_left.initializers.push(Initializer::Zero(rz_left_size));
                rz_right.initializers.push(Initializer::Zero(rz_right_size));
            }
            rz_left.constant = global.constant;
            rz_right.constant = global.constant;
            rz_left.align = alignment;
            global.align = alignment;
            rz_right.align = 1;

            rz_array.initializers.push(Initializer::Reloc {
                name: rz_left.name.clone(),
                offset: 0,
            });
            rz_array.initializers.push(Initializer::Reloc {
                name: rz_right.name.clone(),
                offset: 0,
            });
            rz_sizes
                .initializers
                .push(Initializer::Data(size_to_bytes(rz_left_size)));
            rz_sizes
                .initializers
                .push(Initializer::Data(size_to_bytes(rz_right_size)));

            rest.push(rz_left);
            rest.push(global);
            rest.push(rz_right);
            rz_count += 2;
        }

        let mut new_list = Vec::with_capacity(rest.len() + 2);
        new_list.push(rz_array);
        new_list.push(rz_sizes);
        new_list.extend(rest);
        debug!(count = rz_count, "instrumented globals\n{}", dump_globals(&new_list));
        *globals = new_list;
        drop(globals);

        self.rz_globals_num.store(rz_count, Ordering::SeqCst);
        *done = true;
        self.globals_done.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tarmac_ir::{Flags, GlobalContext};

    fn new_asan() -> AsanInstrumentation {
        let ctx = Arc::new(GlobalContext::with_output(
            Flags::default(),
            Box::new(std::io::sink()),
        ));
        AsanInstrumentation::new(ctx)
    }

    #[test]
    fn test_zero_init_global_redzones() {
        let asan = new_asan();
        {
            let mut globals = asan.ctx.globals();
            let mut g = GlobalDecl::new("g");
            g.initializers.push(Initializer::Zero(10));
            globals.push(g);
        }
        asan.instrument_globals();

        let globals = asan.ctx.globals();
        assert_eq!(globals.len(), 5);
        assert_eq!(globals[0].name, RZ_ARRAY_NAME);
        assert_eq!(globals[1].name, RZ_SIZES_NAME);
        let (left, host, right) = (&globals[2], &globals[3], &globals[4]);
        assert_eq!(host.name, "g");
        assert_eq!(host.align, 32);
        assert_eq!(left.num_bytes(), 32);
        assert_eq!(left.align, 32);
        // 32 + pad_to(10, 32) = 32 + 22.
        assert_eq!(right.num_bytes(), 54);
        assert_eq!(right.align, 1);
        assert!(matches!(left.initializers[0], Initializer::Zero(32)));
        assert!(matches!(right.initializers[0], Initializer::Zero(54)));

        // Array entries point at the redzones, sizes are 8-byte LE values.
        assert_eq!(
            globals[0].initializers[0],
            Initializer::Reloc {
                name: left.name.clone(),
                offset: 0
            }
        );
        assert_eq!(
            globals[1].initializers[0],
            Initializer::Data(32u64.to_le_bytes().to_vec())
        );
        assert_eq!(
            globals[1].initializers[1],
            Initializer::Data(54u64.to_le_bytes().to_vec())
        );
        assert_eq!(asan.rz_globals_num(), 2);
    }

    #[test]
    fn test_nonzero_init_gets_r_fill() {
        let asan = new_asan();
        {
            let mut globals = asan.ctx.globals();
            let mut g = GlobalDecl::new("g");
            g.initializers.push(Initializer::Data(vec![1, 2, 3, 4]));
            g.constant = true;
            globals.push(g);
        }
        asan.instrument_globals();
        let globals = asan.ctx.globals();
        let left = &globals[2];
        assert!(left.constant);
        match &left.initializers[0] {
            Initializer::Data(bytes) => {
                assert_eq!(bytes.len(), 32);
                assert!(bytes.iter().all(|&b| b == b'R'));
            }
            other => panic!("expected R fill, got {other:?}"),
        }
    }

    #[test]
    fn test_over_aligned_global_keeps_its_alignment() {
        let asan = new_asan();
        {
            let mut globals = asan.ctx.globals();
            let mut g = GlobalDecl::new("g");
            g.align = 64;
            g.initializers.push(Initializer::Zero(10));
            globals.push(g);
        }
        asan.instrument_globals();

        let globals = asan.ctx.globals();
        let (left, host, right) = (&globals[2], &globals[3], &globals[4]);
        // max(32, 64) = 64 everywhere the alignment matters.
        assert_eq!(host.align, 64);
        assert_eq!(left.align, 64);
        assert_eq!(left.num_bytes(), 64);
        // 32 + pad_to(10, 64) = 32 + 54.
        assert_eq!(right.num_bytes(), 86);
        assert_eq!(right.align, 1);
    }

    #[test]
    fn test_instrument_globals_idempotent() {
        let asan = new_asan();
        {
            let mut globals = asan.ctx.globals();
            let mut g = GlobalDecl::new("g");
            g.initializers.push(Initializer::Zero(8));
            globals.push(g);
        }
        asan.instrument_globals();
        let len = asan.ctx.globals().len();
        asan.instrument_globals();
        assert_eq!(asan.ctx.globals().len(), len);
        assert_eq!(asan.rz_globals_num(), 2);
    }
}
