//! Frame places: values forced into known stack slots that host code can
//! read and write from outside the generated function while it is live on
//! the stack.

#![cfg(all(target_arch = "x86_64", unix))]

use std::sync::atomic::{AtomicI64, Ordering};

use bumpalo::Bump;
use smelt::core::buffer::{peek_word, poke_word};
use smelt::{BinaryOp, Generator, SigToken, Value};

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

static PLACE_DISP: AtomicI64 = AtomicI64::new(0);
static OBSERVED: AtomicI64 = AtomicI64::new(0);

/// Called from generated code with the frame base; peeks the place, then
/// overwrites it.
extern "C" fn probe(frame_base: i64) -> i64 {
    let addr = (frame_base + PLACE_DISP.load(Ordering::SeqCst)) as usize;
    OBSERVED.store(unsafe { peek_word(addr) }, Ordering::SeqCst);
    unsafe { poke_word(addr, 4000) };
    0
}

#[test]
fn test_place_visible_and_writable_during_a_call() {
    init_logging();
    let arena = Bump::new();
    let mut gen = Generator::new(&arena);
    let sig = SigToken::new(1);
    let (b, entry, args) = gen.new_graph(sig, "places").unwrap();
    gen.start_writing(b).unwrap();

    // Force x*2 into a frame slot, keep the frame base, and pause so the
    // slot assignment is fixed.
    let doubled = gen.genop2(b, BinaryOp::Mul, args[0], Value::imm(2)).unwrap();
    let place = gen.alloc_frame_place(b, doubled).unwrap();
    let fb = gen.genop_get_frame_base(b).unwrap();
    gen.pause_writing(b, &[fb]).unwrap();
    PLACE_DISP.store(gen.place_offset(place).unwrap() as i64, Ordering::SeqCst);

    // Resume: call out with the frame base, then return the (externally
    // rewritten) place plus the callback result.
    gen.start_writing(b).unwrap();
    let f: extern "C" fn(i64) -> i64 = probe;
    let r = gen
        .genop_call(b, SigToken::new(1), Value::addr(f as usize), &[fb])
        .unwrap();
    let v = gen.genop_absorb_place(place);
    let out = gen.genop2(b, BinaryOp::Add, v, r).unwrap();
    gen.finish_and_return(b, sig, out).unwrap();

    let result = unsafe { entry.call1(21) };
    assert_eq!(OBSERVED.load(Ordering::SeqCst), 42);
    assert_eq!(result, 4000);
}

#[test]
fn test_get_frame_info_mixes_constants_and_places() {
    init_logging();
    let arena = Bump::new();
    let mut gen = Generator::new(&arena);
    let sig = SigToken::new(2);
    let (b, _entry, args) = gen.new_graph(sig, "frame_info").unwrap();
    gen.start_writing(b).unwrap();
    let s = gen.genop2(b, BinaryOp::Add, args[0], args[1]).unwrap();
    let infos = gen
        .get_frame_info(b, &[Value::imm(7), s, args[0]])
        .unwrap();
    gen.pause_writing(b, &[s, args[0]]).unwrap();

    assert_eq!(infos.len(), 3);
    // The constant never needs a slot; the variables got distinct ones.
    let (d1, d2) = match (&infos[0], &infos[1], &infos[2]) {
        (smelt::FrameInfo::Const(7), smelt::FrameInfo::Place(p1), smelt::FrameInfo::Place(p2)) => {
            (
                gen.place_offset(*p1).unwrap(),
                gen.place_offset(*p2).unwrap(),
            )
        }
        other => panic!("unexpected frame info {:?}", other),
    };
    assert_ne!(d1, d2);
    assert!(d1 < 0 && d2 < 0);

    // The offset arithmetic of the external peek/poke helpers, checked
    // against a fake frame laid out in host memory.
    let mut buf = vec![0i64; 64];
    let fake_base = buf.as_mut_ptr() as i64 + 8 * 32;
    let place = match infos[1] {
        smelt::FrameInfo::Place(p) => p,
        _ => unreachable!(),
    };
    unsafe {
        gen.write_frame_place(fake_base, place, 1234).unwrap();
        assert_eq!(gen.read_frame_place(fake_base, place).unwrap(), 1234);
        assert_eq!(
            gen.read_frame_var(fake_base, &infos[0]).unwrap(),
            7,
            "constants read back directly"
        );
        assert_eq!(buf[(32 + d1 / 8) as usize], 1234);
    }
}
