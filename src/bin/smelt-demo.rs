// Small demonstration binary: builds a handful of graphs through the public
// generator API (straight-line arithmetic, a counting loop via block
// re-entry, and a growable switch), calls the generated code and prints the
// results together with the generator statistics. Run with RUST_LOG=trace to
// see the disassembly of every emitted block.

use bumpalo::Bump;
use clap::Parser;
use smelt::{BinaryOp, CompileResult, Generator, SigToken, Value};

#[derive(Parser)]
#[command(name = "smelt-demo", about = "Generate and run a few graphs")]
struct Args {
    /// Argument passed to the generated functions.
    #[arg(short = 'x', long, default_value_t = 37)]
    x: i64,

    /// Loop bound for the accumulation demo.
    #[arg(short = 'n', long, default_value_t = 10)]
    n: i64,

    /// Emit an int3 trap at every graph entry (for debugger use).
    #[arg(long)]
    trap: bool,
}

/// x + 5
fn build_add5(gen: &mut Generator, x: i64) -> CompileResult<i64> {
    let sig = SigToken::new(1);
    let (b, entry, args) = gen.new_graph(sig, "add5")?;
    gen.start_writing(b)?;
    let sum = gen.genop2(b, BinaryOp::Add, args[0], Value::imm(5))?;
    gen.finish_and_return(b, sig, sum)?;
    Ok(unsafe { entry.call1(x) })
}

/// sum of i * (i - 1) for i in 1..n, via a loop label.
fn build_triangle(gen: &mut Generator, n: i64) -> CompileResult<i64> {
    let sig = SigToken::new(1);
    let (b, entry, args) = gen.new_graph(sig, "triangle")?;
    gen.start_writing(b)?;
    let mut state = [Value::imm(1), Value::imm(0), args[0]];
    let head = gen.enter_next_block(b, &mut state)?;
    let [i, acc, bound] = state;

    let done = gen.genop2(b, BinaryOp::Ge, i, bound)?;
    let exit = gen.jump_if_true(b, done, &[acc])?;

    let im1 = gen.genop2(b, BinaryOp::Sub, i, Value::imm(1))?;
    let term = gen.genop2(b, BinaryOp::Mul, i, im1)?;
    let acc2 = gen.genop2(b, BinaryOp::Add, acc, term)?;
    let i2 = gen.genop2(b, BinaryOp::Add, i, Value::imm(1))?;
    gen.finish_and_goto(b, &[i2, acc2, bound], head)?;

    gen.start_writing(exit)?;
    gen.finish_and_return(exit, sig, acc)?;
    Ok(unsafe { entry.call1(n) })
}

/// Dispatch on the argument: 0 -> 100, 1 -> 101, ..., default -> -1.
fn build_switch(gen: &mut Generator, cases: i64, x: i64) -> CompileResult<i64> {
    let sig = SigToken::new(1);
    let (b, entry, args) = gen.new_graph(sig, "dispatch")?;
    gen.start_writing(b)?;
    let (sw, default_b) = gen.flexswitch(b, args[0], &[])?;
    gen.finish_and_return(default_b, sig, Value::imm(-1))?;
    for k in 0..cases {
        let case_b = gen.switch_add_case(sw, k)?;
        gen.finish_and_return(case_b, sig, Value::imm(100 + k))?;
    }
    Ok(unsafe { entry.call1(x) })
}

fn main() -> CompileResult<()> {
    env_logger::init();
    let args = Args::parse();

    let arena = Bump::new();
    let mut gen = Generator::new(&arena);
    gen.set_debug_trap(args.trap);

    println!("add5({}) = {}", args.x, build_add5(&mut gen, args.x)?);
    println!(
        "sum i*(i-1), i in 1..{} = {}",
        args.n,
        build_triangle(&mut gen, args.n)?
    );
    println!(
        "dispatch({}) = {}",
        args.x,
        build_switch(&mut gen, 8, args.x)?
    );

    let stats = gen.stats();
    println!(
        "\n{} graphs, {} blocks, {} bytes of code, {} spills",
        stats.graphs_finished, stats.blocks_closed, stats.code_bytes, stats.spills
    );
    let mut ops: Vec<_> = stats.op_counts.iter().collect();
    ops.sort();
    for (name, count) in ops {
        println!("  {:<12} {}", name, count);
    }
    Ok(())
}
