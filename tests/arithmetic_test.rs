//! End-to-end tests for straight-line integer arithmetic: generated
//! functions are called directly and compared against the same computation
//! done in Rust.

#![cfg(all(target_arch = "x86_64", unix))]

use bumpalo::Bump;
use smelt::{BinaryOp, CompileResult, Cond, Generator, SigToken, UnaryOp, Value};

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Generate a one-argument function from a closure over the builder.
fn gen1(
    gen: &mut Generator,
    body: impl FnOnce(&mut Generator, smelt::BuilderId, Value) -> CompileResult<Value>,
) -> smelt::EntryPoint {
    let sig = SigToken::new(1);
    let (b, entry, args) = gen.new_graph(sig, "test1").unwrap();
    gen.start_writing(b).unwrap();
    let r = body(gen, b, args[0]).unwrap();
    gen.finish_and_return(b, sig, r).unwrap();
    entry
}

fn gen2(
    gen: &mut Generator,
    body: impl FnOnce(&mut Generator, smelt::BuilderId, Value, Value) -> CompileResult<Value>,
) -> smelt::EntryPoint {
    let sig = SigToken::new(2);
    let (b, entry, args) = gen.new_graph(sig, "test2").unwrap();
    gen.start_writing(b).unwrap();
    let r = body(gen, b, args[0], args[1]).unwrap();
    gen.finish_and_return(b, sig, r).unwrap();
    entry
}

#[test]
fn test_add_constant() {
    init_logging();
    let arena = Bump::new();
    let mut gen = Generator::new(&arena);
    let f = gen1(&mut gen, |g, b, x| g.genop2(b, BinaryOp::Add, x, Value::imm(5)));
    assert_eq!(unsafe { f.call1(37) }, 42);
    assert_eq!(unsafe { f.call1(-5) }, 0);
    assert!(gen.check_no_open_blocks());
}

#[test]
fn test_nested_subtraction() {
    init_logging();
    let arena = Bump::new();
    let mut gen = Generator::new(&arena);
    // x - (y - (x - 1))
    let f = gen2(&mut gen, |g, b, x, y| {
        let t1 = g.genop2(b, BinaryOp::Sub, x, Value::imm(1))?;
        let t2 = g.genop2(b, BinaryOp::Sub, y, t1)?;
        g.genop2(b, BinaryOp::Sub, x, t2)
    });
    assert_eq!(unsafe { f.call2(30, 17) }, 42);
    for (x, y) in [(0, 0), (-3, 11), (1000, -999)] {
        assert_eq!(unsafe { f.call2(x, y) }, x - (y - (x - 1)));
    }
}

#[test]
fn test_bitwise_and_unary() {
    init_logging();
    let arena = Bump::new();
    let mut gen = Generator::new(&arena);
    let and = gen2(&mut gen, |g, b, x, y| g.genop2(b, BinaryOp::And, x, y));
    let or = gen2(&mut gen, |g, b, x, y| g.genop2(b, BinaryOp::Or, x, y));
    let xor = gen2(&mut gen, |g, b, x, y| g.genop2(b, BinaryOp::Xor, x, y));
    let neg = gen1(&mut gen, |g, b, x| g.genop1(b, UnaryOp::Neg, x));
    let inv = gen1(&mut gen, |g, b, x| g.genop1(b, UnaryOp::Invert, x));
    for (x, y) in [(0b1100, 0b1010), (-1, 12345), (0, 0), (i64::MAX, i64::MIN)] {
        unsafe {
            assert_eq!(and.call2(x, y), x & y);
            assert_eq!(or.call2(x, y), x | y);
            assert_eq!(xor.call2(x, y), x ^ y);
            assert_eq!(neg.call1(x), x.wrapping_neg());
            assert_eq!(inv.call1(x), !x);
        }
    }
}

#[test]
fn test_abs_branch_free() {
    init_logging();
    let arena = Bump::new();
    let mut gen = Generator::new(&arena);
    let abs = gen1(&mut gen, |g, b, x| g.genop1(b, UnaryOp::Abs, x));
    for x in [0, 1, -1, 42, -42, i64::MAX, i64::MIN + 1] {
        assert_eq!(unsafe { abs.call1(x) }, x.abs());
    }
    // Constant operand folds at compile time.
    let k = gen1(&mut gen, |g, b, _x| g.genop1(b, UnaryOp::Abs, Value::imm(-7)));
    assert_eq!(unsafe { k.call1(0) }, 7);
}

#[test]
fn test_multiply_forms() {
    init_logging();
    let arena = Bump::new();
    let mut gen = Generator::new(&arena);
    let mul = gen2(&mut gen, |g, b, x, y| g.genop2(b, BinaryOp::Mul, x, y));
    // imm8, imm32 and too-wide immediate factors.
    let by10 = gen1(&mut gen, |g, b, x| {
        g.genop2(b, BinaryOp::Mul, x, Value::imm(10))
    });
    let by100k = gen1(&mut gen, |g, b, x| {
        g.genop2(b, BinaryOp::Mul, Value::imm(100_000), x)
    });
    let by_wide = gen1(&mut gen, |g, b, x| {
        g.genop2(b, BinaryOp::Mul, x, Value::imm(1 << 33))
    });
    for (x, y) in [(6, 7), (-3, 9), (0, 5), (1 << 20, 1 << 21)] {
        assert_eq!(unsafe { mul.call2(x, y) }, x.wrapping_mul(y));
    }
    assert_eq!(unsafe { by10.call1(-7) }, -70);
    assert_eq!(unsafe { by100k.call1(3) }, 300_000);
    assert_eq!(unsafe { by_wide.call1(3) }, 3 << 33);
}

#[test]
fn test_comparisons_materialize_to_bool() {
    init_logging();
    let arena = Bump::new();
    let mut gen = Generator::new(&arena);
    let cases: [(BinaryOp, fn(i64, i64) -> bool); 10] = [
        (BinaryOp::Lt, |x, y| x < y),
        (BinaryOp::Le, |x, y| x <= y),
        (BinaryOp::Eq, |x, y| x == y),
        (BinaryOp::Ne, |x, y| x != y),
        (BinaryOp::Gt, |x, y| x > y),
        (BinaryOp::Ge, |x, y| x >= y),
        (BinaryOp::Ult, |x, y| (x as u64) < y as u64),
        (BinaryOp::Ule, |x, y| x as u64 <= y as u64),
        (BinaryOp::Ugt, |x, y| x as u64 > y as u64),
        (BinaryOp::Uge, |x, y| x as u64 >= y as u64),
    ];
    for (op, reference) in cases {
        let f = gen2(&mut gen, |g, b, x, y| g.genop2(b, op, x, y));
        for (x, y) in [(1, 2), (2, 1), (5, 5), (-1, 1), (1, -1), (-4, -4)] {
            assert_eq!(
                unsafe { f.call2(x, y) },
                reference(x, y) as i64,
                "{:?} {} {}",
                op,
                x,
                y
            );
        }
    }
}

#[test]
fn test_is_true_and_bool_not() {
    init_logging();
    let arena = Bump::new();
    let mut gen = Generator::new(&arena);
    let is_true = gen1(&mut gen, |g, b, x| g.genop1(b, UnaryOp::IsTrue, x));
    let bool_not = gen1(&mut gen, |g, b, x| g.genop1(b, UnaryOp::BoolNot, x));
    for x in [0, 1, -1, 42, i64::MIN] {
        assert_eq!(unsafe { is_true.call1(x) }, (x != 0) as i64);
        assert_eq!(unsafe { bool_not.call1(x) }, (x == 0) as i64);
    }
}

#[test]
fn test_fetch_cc_adopts_flags() {
    init_logging();
    let arena = Bump::new();
    let mut gen = Generator::new(&arena);
    // v1 = x < y, v2 = the same flags read as "x >= y": exactly one is set.
    let f = gen2(&mut gen, |g, b, x, y| {
        let v1 = g.genop2(b, BinaryOp::Lt, x, y)?;
        let v2 = g.genop_fetch_cc(b, Cond::Ge)?;
        let v2x2 = g.genop2(b, BinaryOp::Mul, v2, Value::imm(2))?;
        g.genop2(b, BinaryOp::Add, v1, v2x2)
    });
    assert_eq!(unsafe { f.call2(1, 5) }, 1);
    assert_eq!(unsafe { f.call2(5, 1) }, 2);
    assert_eq!(unsafe { f.call2(3, 3) }, 2);
}

#[test]
fn test_same_as_copies_constants() {
    init_logging();
    let arena = Bump::new();
    let mut gen = Generator::new(&arena);
    let f = gen1(&mut gen, |g, b, x| {
        let c = g.genop_same_as(b, Value::imm(40))?;
        g.genop2(b, BinaryOp::Add, c, x)
    });
    assert_eq!(unsafe { f.call1(2) }, 42);
}

#[test]
fn test_pause_and_resume_keeps_values_alive() {
    init_logging();
    let arena = Bump::new();
    let mut gen = Generator::new(&arena);
    let sig = SigToken::new(2);
    let (b, entry, args) = gen.new_graph(sig, "paused").unwrap();
    gen.start_writing(b).unwrap();
    let t = gen.genop2(b, BinaryOp::Mul, args[0], args[1]).unwrap();
    gen.pause_writing(b, &[t, args[0]]).unwrap();
    assert!(gen.check_no_open_blocks());

    gen.start_writing(b).unwrap();
    let r = gen.genop2(b, BinaryOp::Add, t, args[0]).unwrap();
    gen.finish_and_return(b, sig, r).unwrap();
    assert_eq!(unsafe { entry.call2(6, 7) }, 48);
}

#[test]
fn test_register_pressure_spills_and_recovers() {
    init_logging();
    let arena = Bump::new();
    let mut gen = Generator::new(&arena);
    // Build more than fourteen simultaneously live values, then consume
    // them all; the allocator has to spill and reload.
    let sig = SigToken::new(1);
    let (b, entry, args) = gen.new_graph(sig, "pressure").unwrap();
    gen.start_writing(b).unwrap();
    let mut vals = Vec::new();
    for i in 1..=20i64 {
        vals.push(
            gen.genop2(b, BinaryOp::Mul, args[0], Value::imm(i)).unwrap(),
        );
    }
    let mut acc = Value::imm(0);
    for v in vals {
        acc = gen.genop2(b, BinaryOp::Add, acc, v).unwrap();
    }
    gen.finish_and_return(b, sig, acc).unwrap();
    // sum x*i for i in 1..=20 = x * 210
    assert_eq!(unsafe { entry.call1(2) }, 420);
    assert!(gen.stats().spills > 0);
}

#[test]
fn test_stats_track_graphs_and_ops() {
    init_logging();
    let arena = Bump::new();
    let mut gen = Generator::new(&arena);
    let f = gen2(&mut gen, |g, b, x, y| {
        let s = g.genop2(b, BinaryOp::Add, x, y)?;
        g.genop2(b, BinaryOp::Mul, s, s)
    });
    assert_eq!(unsafe { f.call2(3, 4) }, 49);
    let stats = gen.stats();
    assert_eq!(stats.graphs_started, 1);
    assert_eq!(stats.graphs_finished, 1);
    assert_eq!(stats.ops_of("add"), 1);
    assert_eq!(stats.ops_of("mul"), 1);
    assert!(stats.code_bytes > 0);
}

#[test]
fn test_dead_operations_emit_nothing() {
    init_logging();
    let arena = Bump::new();
    let mut gen = Generator::new(&arena);
    // The unused multiply is dropped; only the add survives.
    let f = gen1(&mut gen, |g, b, x| {
        let _dead = g.genop2(b, BinaryOp::Mul, x, Value::imm(1000))?;
        g.genop2(b, BinaryOp::Add, x, Value::imm(1))
    });
    assert_eq!(unsafe { f.call1(41) }, 42);
}
