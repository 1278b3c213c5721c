//! Floor-division and modulo semantics of the generated code.
//!
//! The hardware truncates toward zero; the backend corrects the result so
//! that for all x and nonzero y, `floordiv(x,y)*y + mod(x,y) == x` and the
//! remainder carries the divisor's sign.

#![cfg(all(target_arch = "x86_64", unix))]

use bumpalo::Bump;
use smelt::{BinaryOp, Generator, SigToken, Value};

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn gen_binop(gen: &mut Generator, op: BinaryOp) -> smelt::EntryPoint {
    let sig = SigToken::new(2);
    let (b, entry, args) = gen.new_graph(sig, "divmod").unwrap();
    gen.start_writing(b).unwrap();
    let r = gen.genop2(b, op, args[0], args[1]).unwrap();
    gen.finish_and_return(b, sig, r).unwrap();
    entry
}

fn floor_div(x: i64, y: i64) -> i64 {
    let q = x / y;
    if x % y != 0 && (x < 0) != (y < 0) {
        q - 1
    } else {
        q
    }
}

fn floor_mod(x: i64, y: i64) -> i64 {
    x - floor_div(x, y) * y
}

const XS: [i64; 12] = [-100, -20, -7, -3, -1, 0, 1, 2, 3, 7, 20, 100];
const YS: [i64; 8] = [-17, -3, -2, -1, 1, 2, 3, 17];

#[test]
fn test_floordiv_rounds_toward_negative_infinity() {
    init_logging();
    let arena = Bump::new();
    let mut gen = Generator::new(&arena);
    let f = gen_binop(&mut gen, BinaryOp::FloorDiv);
    for x in XS {
        for y in YS {
            assert_eq!(unsafe { f.call2(x, y) }, floor_div(x, y), "x={} y={}", x, y);
        }
    }
}

#[test]
fn test_division_identity_and_mod_sign() {
    init_logging();
    let arena = Bump::new();
    let mut gen = Generator::new(&arena);
    let fdiv = gen_binop(&mut gen, BinaryOp::FloorDiv);
    let fmod = gen_binop(&mut gen, BinaryOp::Mod);
    for x in XS {
        for y in YS {
            let q = unsafe { fdiv.call2(x, y) };
            let m = unsafe { fmod.call2(x, y) };
            assert_eq!(q * y + m, x, "identity failed for x={} y={}", x, y);
            assert!(
                m == 0 || m.signum() == y.signum(),
                "mod sign wrong: x={} y={} m={}",
                x,
                y,
                m
            );
            assert_eq!(m, floor_mod(x, y), "x={} y={}", x, y);
        }
    }
}

#[test]
fn test_known_quadrants() {
    init_logging();
    let arena = Bump::new();
    let mut gen = Generator::new(&arena);
    let fdiv = gen_binop(&mut gen, BinaryOp::FloorDiv);
    let fmod = gen_binop(&mut gen, BinaryOp::Mod);
    // The table from the correction's derivation.
    let expect = [
        ((20, 3), (6, 2)),
        ((-20, 3), (-7, 1)),
        ((20, -3), (-7, -1)),
        ((-20, -3), (6, -2)),
    ];
    for ((x, y), (q, m)) in expect {
        assert_eq!(unsafe { fdiv.call2(x, y) }, q, "{}/{}", x, y);
        assert_eq!(unsafe { fmod.call2(x, y) }, m, "{}%{}", x, y);
    }
}

#[test]
fn test_unsigned_division() {
    init_logging();
    let arena = Bump::new();
    let mut gen = Generator::new(&arena);
    let udiv = gen_binop(&mut gen, BinaryOp::UDiv);
    let umod = gen_binop(&mut gen, BinaryOp::UMod);
    let xs: [u64; 6] = [0, 1, 20, 1 << 40, u64::MAX, u64::MAX - 1];
    let ys: [u64; 5] = [1, 2, 3, 1 << 33, u64::MAX];
    for x in xs {
        for y in ys {
            assert_eq!(unsafe { udiv.call2(x as i64, y as i64) } as u64, x / y);
            assert_eq!(unsafe { umod.call2(x as i64, y as i64) } as u64, x % y);
        }
    }
}

#[test]
fn test_constant_divisor_goes_through_a_register() {
    init_logging();
    let arena = Bump::new();
    let mut gen = Generator::new(&arena);
    let sig = SigToken::new(1);
    let (b, entry, args) = gen.new_graph(sig, "div_by_3").unwrap();
    gen.start_writing(b).unwrap();
    let r = gen
        .genop2(b, BinaryOp::FloorDiv, args[0], Value::imm(3))
        .unwrap();
    gen.finish_and_return(b, sig, r).unwrap();
    for x in XS {
        assert_eq!(unsafe { entry.call1(x) }, floor_div(x, 3), "x={}", x);
    }
}
