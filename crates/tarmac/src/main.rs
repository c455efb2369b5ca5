//! tarmac CLI.

use std::io::Write;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use tarmac::{
    header, ArithOp, ArmInst, Error, Flags, Func, FuncBuilder, GlobalContext, GlobalDecl,
    IcmpCond, Initializer, InstKind, OptLevel, Operand, Result, Translator, Type,
};

/// Exit code for failure.
const EXIT_FAILURE: i32 = 1;

#[derive(Parser)]
#[command(name = "tarmac")]
#[command(about = "Typed-IR to ARM32 ahead-of-time code generator")]
#[command(version)]
struct Cli {
    /// Use the debug (Om1) pipeline instead of O2
    #[arg(long, global = true)]
    om1: bool,

    /// Emit sandboxed (bundle-locked, masked) return sequences
    #[arg(long, global = true)]
    sandbox: bool,

    /// Run the AddressSanitizer instrumentation pass
    #[arg(long, global = true)]
    asan: bool,

    /// Skip unimplemented lowerings instead of aborting
    #[arg(long, global = true)]
    skip_unimplemented: bool,

    /// Insert random nops (debug aid)
    #[arg(long, global = true)]
    nop_insertion: bool,

    /// Number of worker threads (0 = one per core)
    #[arg(short = 'j', long, global = true, default_value = "0")]
    threads: usize,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Suppress output (only show errors)
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    silent: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the assembly file header with its EABI attributes
    Header,
    /// Translate a built-in sample module and dump the lowered ARM IR
    Demo,
}

fn main() {
    let cli = Cli::parse();

    let default_filter = if cli.verbose {
        "debug"
    } else if cli.silent {
        "error"
    } else {
        "info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .with_writer(std::io::stderr)
        .init();

    let flags = Flags {
        opt_level: if cli.om1 { OptLevel::Om1 } else { OptLevel::O2 },
        use_sandboxing: cli.sandbox,
        enable_asan: cli.asan,
        phi_edge_split: false,
        nop_insertion: cli.nop_insertion,
        skip_unimplemented: cli.skip_unimplemented,
        num_workers: cli.threads,
    };

    let result = match cli.command {
        Commands::Header => print_header(),
        Commands::Demo => demo(flags),
    };
    if let Err(err) = result {
        error!("{err}");
        std::process::exit(EXIT_FAILURE);
    }
}

fn print_header() -> Result<()> {
    let mut out = std::io::stdout();
    header::lower_header(&mut out)?;
    Ok(())
}

fn demo(flags: Flags) -> Result<()> {
    let ctx = Arc::new(GlobalContext::new(flags));
    {
        let mut globals = ctx.globals();
        let mut counter = GlobalDecl::new("counter");
        counter.align = 4;
        counter.initializers.push(Initializer::Zero(8));
        globals.push(counter);
    }

    let translator = Translator::new(ctx.clone());
    let funcs = translator.translate_all(vec![demo_sum64(), demo_below()]);

    {
        let mut out = ctx.lock_out();
        header::lower_header(&mut **out)?;
        for func in &funcs {
            if let Some(err) = func.error() {
                return Err(Error::Translation {
                    func: func.name.clone(),
                    message: err.to_string(),
                });
            }
            writeln!(out, "\n@ function {}", func.name)?;
            write!(out, "{}", func.dump_text())?;
        }
    }

    let stats = ctx.stats();
    info!(
        fills = stats.fills,
        frame_bytes = stats.frame_bytes,
        registers_saved = stats.registers_saved,
        "translation stats"
    );
    Ok(())
}

/// `sum64(a: i64, b: i64) -> i64 { a + b }` - exercises the i64 split
/// lowering and the r0:r3 argument registers.
fn demo_sum64() -> Func<ArmInst> {
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

/// `below(a: i8, lim: i8) -> i32 { a < lim ? 1 : 0 }` - exercises the
/// narrow unsigned compare and conditional branches.
fn demo_below() -> Func<ArmInst> {
    let mut b = FuncBuilder::new("below", Type::I32);
    let entry = b.entry();
    let a = b.arg(Type::I8);
    let lim = b.arg(Type::I8);
    let r = b.var(Type::I1);
    let on_true = b.node();
    let on_false = b.node();
    b.push(
        entry,
        InstKind::Icmp {
            cond: IcmpCond::Ult,
            dest: r,
            src0: Operand::Var(a),
            src1: Operand::Var(lim),
        },
    );
    b.br_cond(entry, Operand::Var(r), on_true, on_false);
    b.ret(on_true, Some(Operand::i32(1)));
    b.ret(on_false, Some(Operand::i32(0)));
    b.build()
}
