//! Golden-value checks of the instruction encoder, plus a cross-check of a
//! sample of forms against an independent disassembler.

#![cfg(all(target_arch = "x86_64", unix))]

use smelt::core::buffer::{CodePool, CodeWriter};
use smelt::x64::dump::disassemble;
use smelt::x64::encoder::{AluOp, ShiftCount, ShiftKind, Width};
use smelt::x64::{Cond, Mem, Operand, Reg, Scale};

fn emit(f: impl FnOnce(&mut CodeWriter)) -> Vec<u8> {
    let mut pool = CodePool::new();
    let mut w = pool.open().unwrap();
    f(&mut w);
    let bytes = w.emitted().to_vec();
    pool.abandon(w);
    bytes
}

#[test]
fn test_golden_register_register() {
    assert_eq!(
        emit(|w| w.mov_rr(Reg::Rbx, Reg::Rdi).unwrap()),
        [0x48, 0x89, 0xFB]
    );
    assert_eq!(
        emit(|w| w
            .alu(AluOp::Add, &Operand::Reg(Reg::Rax), &Operand::Reg(Reg::Rcx))
            .unwrap()),
        [0x48, 0x01, 0xC8]
    );
    assert_eq!(
        emit(|w| w
            .alu(AluOp::Cmp, &Operand::Reg(Reg::R12), &Operand::Reg(Reg::R13))
            .unwrap()),
        [0x4D, 0x39, 0xEC]
    );
}

#[test]
fn test_golden_register_memory() {
    // Plain base, base forcing SIB, base forcing displacement, full SIB.
    assert_eq!(
        emit(|w| w.mov_load(Reg::Rax, &Mem::base(Reg::Rbx, 0)).unwrap()),
        [0x48, 0x8B, 0x03]
    );
    assert_eq!(
        emit(|w| w.mov_load(Reg::Rax, &Mem::base(Reg::Rsp, 8)).unwrap()),
        [0x48, 0x8B, 0x44, 0x24, 0x08]
    );
    assert_eq!(
        emit(|w| w.mov_load(Reg::Rax, &Mem::base(Reg::Rbp, 0)).unwrap()),
        [0x48, 0x8B, 0x45, 0x00]
    );
    assert_eq!(
        emit(|w| w
            .mov_load(
                Reg::Rdx,
                &Mem::sib(Some(Reg::Rsi), Reg::Rdi, Scale::S4, 0x100)
            )
            .unwrap()),
        [0x48, 0x8B, 0x94, 0xBE, 0x00, 0x01, 0x00, 0x00]
    );
    // Base-less scaled index uses the disp32 SIB form.
    assert_eq!(
        emit(|w| w
            .lea(Reg::Rax, &Mem::sib(None, Reg::Rcx, Scale::S8, 16))
            .unwrap()),
        [0x48, 0x8D, 0x04, 0xCD, 0x10, 0x00, 0x00, 0x00]
    );
}

#[test]
fn test_golden_immediate_to_register() {
    assert_eq!(
        emit(|w| w.mov_ri(Reg::Rdi, 42).unwrap()),
        [0xBF, 0x2A, 0x00, 0x00, 0x00]
    );
    assert_eq!(
        emit(|w| w
            .alu(AluOp::Sub, &Operand::Reg(Reg::Rsp), &Operand::Imm(32))
            .unwrap()),
        [0x48, 0x83, 0xEC, 0x20]
    );
    assert_eq!(
        emit(|w| w
            .alu(AluOp::And, &Operand::Reg(Reg::R9), &Operand::Imm(0x12345))
            .unwrap()),
        [0x49, 0x81, 0xE1, 0x45, 0x23, 0x01, 0x00]
    );
}

#[test]
fn test_golden_relative_call_and_jump() {
    let mut pool = CodePool::new();
    let mut w = pool.open().unwrap();
    let start = w.tell();
    w.call_rel32(start).unwrap();
    w.emit_jump(None, start).unwrap();
    w.emit_jump(Some(Cond::L), start).unwrap();
    let code = w.emitted().to_vec();
    pool.abandon(w);
    assert_eq!(&code[0..5], &[0xE8, 0xFB, 0xFF, 0xFF, 0xFF]);
    assert_eq!(&code[5..10], &[0xE9, 0xF6, 0xFF, 0xFF, 0xFF]);
    assert_eq!(&code[10..16], &[0x0F, 0x8C, 0xF0, 0xFF, 0xFF, 0xFF]);
}

#[test]
fn test_cross_check_against_disassembler() {
    let mut pool = CodePool::new();
    let mut w = pool.open().unwrap();
    let base = w.tell() as u64;
    w.mov_rr(Reg::Rax, Reg::R15).unwrap();
    w.mov_load(Reg::Rcx, &Mem::base(Reg::Rbp, -24)).unwrap();
    w.mov_store(Width::D, &Mem::base(Reg::Rdi, 8), Reg::Rsi).unwrap();
    w.mov_store(Width::B, &Mem::base(Reg::Rdi, 1), Reg::Rsi).unwrap();
    w.mov_ri(Reg::Rdx, -1).unwrap();
    w.alu(AluOp::Xor, &Operand::Reg(Reg::Rdx), &Operand::Reg(Reg::Rdx))
        .unwrap();
    w.imul_rri(Reg::Rbx, &Operand::Reg(Reg::Rbx), 24).unwrap();
    w.shift(ShiftKind::Sar, &Operand::Reg(Reg::Rax), ShiftCount::Imm(63))
        .unwrap();
    w.shift(ShiftKind::Shl, &Operand::Reg(Reg::R8), ShiftCount::Cl)
        .unwrap();
    w.cqo().unwrap();
    w.idiv(&Operand::Reg(Reg::Rsi)).unwrap();
    w.setcc(Cond::Le, Reg::Rcx.low8()).unwrap();
    w.movzx_rr8(Reg::Rcx, Reg::Rcx.low8()).unwrap();
    w.cmovcc(Cond::Ne, Reg::Rax, &Operand::Reg(Reg::Rbx)).unwrap();
    w.test_rr(Reg::R10, Reg::R10).unwrap();
    w.lea(Reg::Rsp, &Mem::base(Reg::Rbp, -0x50)).unwrap();
    w.push(Reg::Rbp).unwrap();
    w.pop(Reg::Rbp).unwrap();
    w.ud2().unwrap();
    w.ret().unwrap();
    let code = w.emitted().to_vec();
    pool.abandon(w);

    let lines = disassemble(&code, base);
    let texts: Vec<&str> = lines
        .iter()
        .map(|l| l.split_once("  ").unwrap().1)
        .collect();
    let expected = [
        "mov rax,r15",
        "mov rcx,[rbp-18h]",
        "mov [rdi+8],esi",
        "mov [rdi+1],sil",
        "mov rdx,0FFFFFFFFFFFFFFFFh",
        "xor rdx,rdx",
        "imul rbx,rbx,18h",
        "sar rax,3Fh",
        "shl r8,cl",
        "cqo",
        "idiv rsi",
        "setle cl",
        "movzx rcx,cl",
        "cmovne rax,rbx",
        "test r10,r10",
        "lea rsp,[rbp-50h]",
        "push rbp",
        "pop rbp",
        "ud2",
        "ret",
    ];
    assert_eq!(texts.len(), expected.len(), "{:?}", texts);
    for (got, want) in texts.iter().zip(expected) {
        assert_eq!(*got, want);
    }
}

#[test]
fn test_unencodable_combinations_are_rejected_cleanly() {
    let mut pool = CodePool::new();
    let mut w = pool.open().unwrap();
    let m = Operand::Mem(Mem::base(Reg::Rbx, 0));
    assert!(w.mov(&m, &m).is_err());
    assert!(w
        .alu(AluOp::Add, &Operand::Imm(1), &Operand::Reg(Reg::Rax))
        .is_err());
    assert!(w
        .alu(
            AluOp::Add,
            &Operand::Reg(Reg::Rax),
            &Operand::Imm(i64::MAX)
        )
        .is_err());
    // A rejection leaves no partial bytes behind.
    assert_eq!(w.emitted().len(), 0);
    pool.abandon(w);
}
