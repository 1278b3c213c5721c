// This module is the binary instruction encoder: given a mnemonic method and
// concrete operands it writes the exact REX/opcode/ModRM/SIB/immediate byte
// sequence into a CodeWriter. Generic entry points (mov, alu, imul forms) take
// Operand values and reject illegal combinations -- two memory operands, an
// immediate destination, a 64-bit immediate in an ALU position -- with the
// distinguished CompileError::Unencodable signal, which the per-operation
// generation rules always handle by moving one operand through a scratch
// register; it never escapes to the frontend. Addressing-mode rules live in
// emit_mem: RSP/R12 bases force a SIB byte, RBP/R13 bases force an explicit
// displacement, base-less operands use the SIB disp32 form (never the
// RIP-relative encoding), and immediates are narrowed to their smallest legal
// form. Relative call/jump displacements are computed from the end of the
// instruction; emit_jump_placeholder writes a zero displacement for targets
// that do not exist yet, to be re-encoded through a patch window later.

//! x86-64 instruction encoding.
//!
//! All encoding methods live on [`CodeWriter`] so generation rules read like
//! an assembler listing. Every method range-checks the buffer and returns
//! [`CompileError::BlockFull`] on exhaustion.

use crate::core::buffer::CodeWriter;
use crate::core::error::{CompileError, CompileResult};
use crate::x64::operand::{Cond, Mem, Operand, Reg, Reg8};

/// Operand width for memory accesses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Width {
    B,
    W,
    D,
    Q,
}

impl Width {
    pub fn from_size(size: u8) -> Option<Width> {
        match size {
            1 => Some(Width::B),
            2 => Some(Width::W),
            4 => Some(Width::D),
            8 => Some(Width::Q),
            _ => None,
        }
    }
}

/// Two-operand ALU family; the discriminant is the /digit in the 0x81/0x83
/// immediate forms and selects the 0x01/0x03-style opcodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum AluOp {
    Add = 0,
    Or = 1,
    Adc = 2,
    Sbb = 3,
    And = 4,
    Sub = 5,
    Xor = 6,
    Cmp = 7,
}

/// Shift family; the discriminant is the ModRM /digit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ShiftKind {
    Shl = 4,
    Shr = 5,
    Sar = 7,
}

/// Shift count operand: a compile-time amount or the CL register.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShiftCount {
    Imm(u8),
    Cl,
}

/// Signed 32-bit displacement from `from_next` (the address just after the
/// displacement) to `target`.
pub fn rel32(from_next: usize, target: usize) -> CompileResult<i32> {
    let diff = (target as i64).wrapping_sub(from_next as i64);
    i32::try_from(diff).map_err(|_| CompileError::BranchRange {
        from: from_next,
        to: target,
    })
}

/// Whether a rel32 branch can reach `target` from `from_next`.
pub fn rel32_fits(from_next: usize, target: usize) -> bool {
    i32::try_from((target as i64).wrapping_sub(from_next as i64)).is_ok()
}

/// Byte length of an unconditional/conditional rel32 jump.
pub fn jump_len(cond: Option<Cond>) -> usize {
    match cond {
        None => 5,
        Some(_) => 6,
    }
}

#[derive(Clone, Copy)]
enum RmRef<'a> {
    Reg { low3: u8, ext: bool },
    Mem(&'a Mem),
}

impl<'a> RmRef<'a> {
    fn reg(r: Reg) -> RmRef<'a> {
        RmRef::Reg {
            low3: r.low3(),
            ext: r.is_extended(),
        }
    }
}

impl CodeWriter {
    /// Emit prefixes, opcode bytes and the ModRM/SIB/displacement tail for
    /// one instruction with a register-or-memory operand.
    fn emit_op(
        &mut self,
        w: bool,
        prefix66: bool,
        opcode: &[u8],
        reg_low3: u8,
        reg_ext: bool,
        force_rex: bool,
        rm: RmRef,
    ) -> CompileResult<()> {
        if prefix66 {
            self.write_u8(0x66)?;
        }
        let (x, b) = match rm {
            RmRef::Reg { ext, .. } => (false, ext),
            RmRef::Mem(m) => (
                m.index.map_or(false, |(r, _)| r.is_extended()),
                m.base.map_or(false, |r| r.is_extended()),
            ),
        };
        let rex = (w as u8) << 3 | (reg_ext as u8) << 2 | (x as u8) << 1 | (b as u8);
        if rex != 0 || force_rex {
            self.write_u8(0x40 | rex)?;
        }
        self.write_bytes(opcode)?;
        match rm {
            RmRef::Reg { low3, .. } => self.write_u8(0xC0 | reg_low3 << 3 | low3),
            RmRef::Mem(m) => self.emit_mem(reg_low3, m),
        }
    }

    /// ModRM/SIB/displacement for a memory operand.
    fn emit_mem(&mut self, reg_low3: u8, m: &Mem) -> CompileResult<()> {
        let need_sib =
            m.index.is_some() || m.base.is_none() || m.base.map_or(false, |b| b.low3() == 4);
        let modbits = match m.base {
            // Base-less: SIB with base 101 under mod 00, disp32 mandatory.
            // (mod 00 rm 101 without SIB would be RIP-relative.)
            None => 0u8,
            Some(b) => {
                if m.disp == 0 && b.low3() != 5 {
                    0
                } else if (-128..=127).contains(&m.disp) {
                    1
                } else {
                    2
                }
            }
        };
        let rm = if need_sib {
            4
        } else {
            m.base.expect("base-less operands use SIB").low3()
        };
        self.write_u8(modbits << 6 | reg_low3 << 3 | rm)?;
        if need_sib {
            let (idx3, scale) = match m.index {
                Some((r, s)) => {
                    debug_assert!(r != Reg::Rsp, "rsp cannot be an index register");
                    (r.low3(), s as u8)
                }
                None => (4, 0),
            };
            let base3 = match m.base {
                Some(b) => b.low3(),
                None => 5,
            };
            self.write_u8(scale << 6 | idx3 << 3 | base3)?;
        }
        match (m.base, modbits) {
            (None, _) => self.write_i32(m.disp),
            (_, 1) => self.write_u8(m.disp as i8 as u8),
            (_, 2) => self.write_i32(m.disp),
            _ => Ok(()),
        }
    }

    // ==== MOV FAMILY ====

    /// mov r64, r64 (0x89 store form).
    pub fn mov_rr(&mut self, dst: Reg, src: Reg) -> CompileResult<()> {
        self.emit_op(
            true,
            false,
            &[0x89],
            src.low3(),
            src.is_extended(),
            false,
            RmRef::reg(dst),
        )
    }

    /// Word-sized load: mov r64, [mem].
    pub fn mov_load(&mut self, dst: Reg, src: &Mem) -> CompileResult<()> {
        self.emit_op(
            true,
            false,
            &[0x8B],
            dst.low3(),
            dst.is_extended(),
            false,
            RmRef::Mem(src),
        )
    }

    /// Zero-extending load of the given width into a full register.
    /// Widths 1/2 use MOVZX, width 4 relies on the implicit zero extension
    /// of 32-bit moves, width 8 is a plain load.
    pub fn load_zx(&mut self, width: Width, dst: Reg, src: &Mem) -> CompileResult<()> {
        let (w, opcode): (bool, &[u8]) = match width {
            Width::B => (true, &[0x0F, 0xB6]),
            Width::W => (true, &[0x0F, 0xB7]),
            Width::D => (false, &[0x8B]),
            Width::Q => (true, &[0x8B]),
        };
        self.emit_op(
            w,
            false,
            opcode,
            dst.low3(),
            dst.is_extended(),
            false,
            RmRef::Mem(src),
        )
    }

    /// Store of the given width from a register's low bits.
    pub fn mov_store(&mut self, width: Width, dst: &Mem, src: Reg) -> CompileResult<()> {
        match width {
            Width::B => {
                let s8 = src.low8();
                self.emit_op(
                    false,
                    false,
                    &[0x88],
                    s8.low3(),
                    s8.is_extended(),
                    s8.needs_rex(),
                    RmRef::Mem(dst),
                )
            }
            Width::W => self.emit_op(
                false,
                true,
                &[0x89],
                src.low3(),
                src.is_extended(),
                false,
                RmRef::Mem(dst),
            ),
            Width::D => self.emit_op(
                false,
                false,
                &[0x89],
                src.low3(),
                src.is_extended(),
                false,
                RmRef::Mem(dst),
            ),
            Width::Q => self.emit_op(
                true,
                false,
                &[0x89],
                src.low3(),
                src.is_extended(),
                false,
                RmRef::Mem(dst),
            ),
        }
    }

    /// Store an immediate of the given width; the value is truncated to the
    /// width like the hardware store itself. Word-sized stores need the
    /// immediate to fit the sign-extended imm32 form.
    pub fn mov_store_imm(&mut self, width: Width, dst: &Mem, imm: i64) -> CompileResult<()> {
        match width {
            Width::B => {
                self.emit_op(false, false, &[0xC6], 0, false, false, RmRef::Mem(dst))?;
                self.write_u8(imm as u8)
            }
            Width::W => {
                self.emit_op(false, true, &[0xC7], 0, false, false, RmRef::Mem(dst))?;
                self.write_bytes(&(imm as u16).to_le_bytes())
            }
            Width::D => {
                self.emit_op(false, false, &[0xC7], 0, false, false, RmRef::Mem(dst))?;
                self.write_i32(imm as i32)
            }
            Width::Q => {
                if i32::try_from(imm).is_err() {
                    return Err(CompileError::Unencodable);
                }
                self.emit_op(true, false, &[0xC7], 0, false, false, RmRef::Mem(dst))?;
                self.write_i32(imm as i32)
            }
        }
    }

    /// mov r64, imm in its smallest form: 32-bit zero-extending mov for
    /// unsigned-32 values, sign-extended imm32 otherwise, full imm64 last.
    pub fn mov_ri(&mut self, dst: Reg, imm: i64) -> CompileResult<()> {
        if imm >= 0 && imm <= u32::MAX as i64 {
            if dst.is_extended() {
                self.write_u8(0x41)?;
            }
            self.write_u8(0xB8 + dst.low3())?;
            self.write_u32(imm as u32)
        } else if i32::try_from(imm).is_ok() {
            self.emit_op(true, false, &[0xC7], 0, false, false, RmRef::reg(dst))?;
            self.write_i32(imm as i32)
        } else {
            self.write_u8(0x48 | dst.is_extended() as u8)?;
            self.write_u8(0xB8 + dst.low3())?;
            self.write_u64(imm as u64)
        }
    }

    /// Generic word-sized mov over operands. Rejects mem,mem and immediate
    /// destinations.
    pub fn mov(&mut self, dst: &Operand, src: &Operand) -> CompileResult<()> {
        match (dst, src) {
            (Operand::Reg(d), Operand::Reg(s)) => self.mov_rr(*d, *s),
            (Operand::Reg(d), Operand::Mem(m)) => self.mov_load(*d, m),
            (Operand::Reg(d), Operand::Imm(i)) => self.mov_ri(*d, *i),
            (Operand::Mem(m), Operand::Reg(s)) => self.mov_store(Width::Q, m, *s),
            (Operand::Mem(m), Operand::Imm(i)) => self.mov_store_imm(Width::Q, m, *i),
            _ => Err(CompileError::Unencodable),
        }
    }

    // ==== ALU FAMILY ====

    /// Generic two-operand ALU instruction (add/sub/and/or/xor/cmp/adc/sbb)
    /// over word-sized operands.
    pub fn alu(&mut self, op: AluOp, dst: &Operand, src: &Operand) -> CompileResult<()> {
        let base = (op as u8) << 3;
        match (dst, src) {
            (Operand::Reg(d), Operand::Reg(s)) => self.emit_op(
                true,
                false,
                &[base + 0x01],
                s.low3(),
                s.is_extended(),
                false,
                RmRef::reg(*d),
            ),
            (Operand::Reg(d), Operand::Mem(m)) => self.emit_op(
                true,
                false,
                &[base + 0x03],
                d.low3(),
                d.is_extended(),
                false,
                RmRef::Mem(m),
            ),
            (Operand::Mem(m), Operand::Reg(s)) => self.emit_op(
                true,
                false,
                &[base + 0x01],
                s.low3(),
                s.is_extended(),
                false,
                RmRef::Mem(m),
            ),
            (Operand::Reg(_) | Operand::Mem(_), Operand::Imm(imm)) => {
                let rm = match dst {
                    Operand::Reg(d) => RmRef::reg(*d),
                    Operand::Mem(m) => RmRef::Mem(m),
                    Operand::Imm(_) => unreachable!(),
                };
                if let Ok(i8v) = i8::try_from(*imm) {
                    self.emit_op(true, false, &[0x83], op as u8, false, false, rm)?;
                    self.write_u8(i8v as u8)
                } else if let Ok(i32v) = i32::try_from(*imm) {
                    self.emit_op(true, false, &[0x81], op as u8, false, false, rm)?;
                    self.write_i32(i32v)
                } else {
                    Err(CompileError::Unencodable)
                }
            }
            _ => Err(CompileError::Unencodable),
        }
    }

    /// test r/m64, r64.
    pub fn test_rr(&mut self, a: Reg, b: Reg) -> CompileResult<()> {
        self.emit_op(
            true,
            false,
            &[0x85],
            b.low3(),
            b.is_extended(),
            false,
            RmRef::reg(a),
        )
    }

    fn group_f7(&mut self, digit: u8, rm: &Operand) -> CompileResult<()> {
        let rm = match rm {
            Operand::Reg(r) => RmRef::reg(*r),
            Operand::Mem(m) => RmRef::Mem(m),
            Operand::Imm(_) => return Err(CompileError::Unencodable),
        };
        self.emit_op(true, false, &[0xF7], digit, false, false, rm)
    }

    /// neg r/m64.
    pub fn neg(&mut self, rm: &Operand) -> CompileResult<()> {
        self.group_f7(3, rm)
    }

    /// not r/m64.
    pub fn not(&mut self, rm: &Operand) -> CompileResult<()> {
        self.group_f7(2, rm)
    }

    /// mul r/m64 (unsigned, RDX:RAX result).
    pub fn mul(&mut self, rm: &Operand) -> CompileResult<()> {
        self.group_f7(4, rm)
    }

    /// div r/m64 (unsigned RDX:RAX / r/m).
    pub fn div(&mut self, rm: &Operand) -> CompileResult<()> {
        self.group_f7(6, rm)
    }

    /// idiv r/m64 (signed RDX:RAX / r/m).
    pub fn idiv(&mut self, rm: &Operand) -> CompileResult<()> {
        self.group_f7(7, rm)
    }

    /// cqo: sign-extend RAX into RDX:RAX.
    pub fn cqo(&mut self) -> CompileResult<()> {
        self.write_bytes(&[0x48, 0x99])
    }

    /// imul r64, r/m64.
    pub fn imul_rr(&mut self, dst: Reg, src: &Operand) -> CompileResult<()> {
        let rm = match src {
            Operand::Reg(r) => RmRef::reg(*r),
            Operand::Mem(m) => RmRef::Mem(m),
            Operand::Imm(_) => return Err(CompileError::Unencodable),
        };
        self.emit_op(
            true,
            false,
            &[0x0F, 0xAF],
            dst.low3(),
            dst.is_extended(),
            false,
            rm,
        )
    }

    /// Three-operand imul r64, r/m64, imm.
    pub fn imul_rri(&mut self, dst: Reg, src: &Operand, imm: i64) -> CompileResult<()> {
        let rm = match src {
            Operand::Reg(r) => RmRef::reg(*r),
            Operand::Mem(m) => RmRef::Mem(m),
            Operand::Imm(_) => return Err(CompileError::Unencodable),
        };
        if let Ok(i8v) = i8::try_from(imm) {
            self.emit_op(
                true,
                false,
                &[0x6B],
                dst.low3(),
                dst.is_extended(),
                false,
                rm,
            )?;
            self.write_u8(i8v as u8)
        } else if let Ok(i32v) = i32::try_from(imm) {
            self.emit_op(
                true,
                false,
                &[0x69],
                dst.low3(),
                dst.is_extended(),
                false,
                rm,
            )?;
            self.write_i32(i32v)
        } else {
            Err(CompileError::Unencodable)
        }
    }

    /// shl/shr/sar r/m64 by an immediate count or CL.
    pub fn shift(
        &mut self,
        kind: ShiftKind,
        dst: &Operand,
        count: ShiftCount,
    ) -> CompileResult<()> {
        let rm = match dst {
            Operand::Reg(r) => RmRef::reg(*r),
            Operand::Mem(m) => RmRef::Mem(m),
            Operand::Imm(_) => return Err(CompileError::Unencodable),
        };
        match count {
            ShiftCount::Imm(n) => {
                self.emit_op(true, false, &[0xC1], kind as u8, false, false, rm)?;
                self.write_u8(n)
            }
            ShiftCount::Cl => self.emit_op(true, false, &[0xD3], kind as u8, false, false, rm),
        }
    }

    /// lea r64, [mem].
    pub fn lea(&mut self, dst: Reg, mem: &Mem) -> CompileResult<()> {
        self.emit_op(
            true,
            false,
            &[0x8D],
            dst.low3(),
            dst.is_extended(),
            false,
            RmRef::Mem(mem),
        )
    }

    /// movzx r64, r8.
    pub fn movzx_rr8(&mut self, dst: Reg, src: Reg8) -> CompileResult<()> {
        self.emit_op(
            true,
            false,
            &[0x0F, 0xB6],
            dst.low3(),
            dst.is_extended(),
            src.needs_rex(),
            RmRef::Reg {
                low3: src.low3(),
                ext: src.is_extended(),
            },
        )
    }

    /// setcc r8.
    pub fn setcc(&mut self, cond: Cond, dst: Reg8) -> CompileResult<()> {
        self.emit_op(
            false,
            false,
            &[0x0F, 0x90 + cond as u8],
            0,
            false,
            dst.needs_rex(),
            RmRef::Reg {
                low3: dst.low3(),
                ext: dst.is_extended(),
            },
        )
    }

    /// cmovcc r64, r/m64.
    pub fn cmovcc(&mut self, cond: Cond, dst: Reg, src: &Operand) -> CompileResult<()> {
        let rm = match src {
            Operand::Reg(r) => RmRef::reg(*r),
            Operand::Mem(m) => RmRef::Mem(m),
            Operand::Imm(_) => return Err(CompileError::Unencodable),
        };
        self.emit_op(
            true,
            false,
            &[0x0F, 0x40 + cond as u8],
            dst.low3(),
            dst.is_extended(),
            false,
            rm,
        )
    }

    // ==== STACK AND CONTROL FLOW ====

    pub fn push(&mut self, r: Reg) -> CompileResult<()> {
        if r.is_extended() {
            self.write_u8(0x41)?;
        }
        self.write_u8(0x50 + r.low3())
    }

    pub fn pop(&mut self, r: Reg) -> CompileResult<()> {
        if r.is_extended() {
            self.write_u8(0x41)?;
        }
        self.write_u8(0x58 + r.low3())
    }

    pub fn ret(&mut self) -> CompileResult<()> {
        self.write_u8(0xC3)
    }

    /// Illegal-instruction guard used to seed flexswitch reservations.
    pub fn ud2(&mut self) -> CompileResult<()> {
        self.write_bytes(&[0x0F, 0x0B])
    }

    /// Debug breakpoint.
    pub fn int3(&mut self) -> CompileResult<()> {
        self.write_u8(0xCC)
    }

    pub fn nop(&mut self) -> CompileResult<()> {
        self.write_u8(0x90)
    }

    /// call rel32 to a known target.
    pub fn call_rel32(&mut self, target: usize) -> CompileResult<()> {
        self.write_u8(0xE8)?;
        let disp = rel32(self.tell() + 4, target)?;
        self.write_i32(disp)
    }

    /// call r/m64.
    pub fn call_rm(&mut self, target: &Operand) -> CompileResult<()> {
        let rm = match target {
            Operand::Reg(r) => RmRef::reg(*r),
            Operand::Mem(m) => RmRef::Mem(m),
            Operand::Imm(_) => return Err(CompileError::Unencodable),
        };
        self.emit_op(false, false, &[0xFF], 2, false, false, rm)
    }

    /// Unconditional or conditional rel32 jump to a known target.
    pub fn emit_jump(&mut self, cond: Option<Cond>, target: usize) -> CompileResult<()> {
        match cond {
            None => {
                self.write_u8(0xE9)?;
                let disp = rel32(self.tell() + 4, target)?;
                self.write_i32(disp)
            }
            Some(c) => {
                self.write_bytes(&[0x0F, 0x80 + c as u8])?;
                let disp = rel32(self.tell() + 4, target)?;
                self.write_i32(disp)
            }
        }
    }

    /// Jump with a zero displacement, to be re-encoded once the target
    /// address is known.
    pub fn emit_jump_placeholder(&mut self, cond: Option<Cond>) -> CompileResult<()> {
        match cond {
            None => self.write_u8(0xE9)?,
            Some(c) => self.write_bytes(&[0x0F, 0x80 + c as u8])?,
        }
        self.write_i32(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::buffer::CodePool;
    use crate::x64::operand::Scale;

    fn emit(f: impl FnOnce(&mut CodeWriter)) -> Vec<u8> {
        let mut pool = CodePool::new();
        let mut w = pool.open().unwrap();
        f(&mut w);
        let bytes = w.emitted().to_vec();
        pool.abandon(w);
        bytes
    }

    #[test]
    fn test_mov_reg_reg() {
        let b = emit(|w| w.mov_rr(Reg::Rax, Reg::Rcx).unwrap());
        assert_eq!(b, vec![0x48, 0x89, 0xC8]);
    }

    #[test]
    fn test_mov_extended_regs() {
        let b = emit(|w| w.mov_rr(Reg::R8, Reg::R15).unwrap());
        // REX.WRB, reg=r15(111), rm=r8(000)
        assert_eq!(b, vec![0x4D, 0x89, 0xF8]);
    }

    #[test]
    fn test_mov_load_rbp_disp8() {
        let b = emit(|w| w.mov_load(Reg::Rax, &Mem::base(Reg::Rbp, -8)).unwrap());
        assert_eq!(b, vec![0x48, 0x8B, 0x45, 0xF8]);
    }

    #[test]
    fn test_mov_store_rsp_needs_sib() {
        let b = emit(|w| {
            w.mov_store(Width::Q, &Mem::base(Reg::Rsp, 16), Reg::Rdx)
                .unwrap()
        });
        assert_eq!(b, vec![0x48, 0x89, 0x54, 0x24, 0x10]);
    }

    #[test]
    fn test_mov_load_sib_scaled() {
        let b = emit(|w| {
            w.mov_load(
                Reg::Rax,
                &Mem::sib(Some(Reg::Rbx), Reg::Rcx, Scale::S8, 0x40),
            )
            .unwrap()
        });
        assert_eq!(b, vec![0x48, 0x8B, 0x44, 0xCB, 0x40]);
    }

    #[test]
    fn test_mov_load_r13_base_forces_disp() {
        // r13 shares low bits with rbp, so a zero displacement still needs
        // the disp8 form.
        let b = emit(|w| w.mov_load(Reg::Rax, &Mem::base(Reg::R13, 0)).unwrap());
        assert_eq!(b, vec![0x49, 0x8B, 0x45, 0x00]);
    }

    #[test]
    fn test_mov_load_absolute_disp32() {
        let b = emit(|w| w.mov_load(Reg::Rcx, &Mem::absolute(0x1000)).unwrap());
        assert_eq!(b, vec![0x48, 0x8B, 0x0C, 0x25, 0x00, 0x10, 0x00, 0x00]);
    }

    #[test]
    fn test_mov_imm_forms() {
        assert_eq!(
            emit(|w| w.mov_ri(Reg::Rax, 5).unwrap()),
            vec![0xB8, 5, 0, 0, 0]
        );
        assert_eq!(
            emit(|w| w.mov_ri(Reg::Rax, -1).unwrap()),
            vec![0x48, 0xC7, 0xC0, 0xFF, 0xFF, 0xFF, 0xFF]
        );
        assert_eq!(
            emit(|w| w.mov_ri(Reg::R8, 0x1122334455667788).unwrap()),
            vec![0x49, 0xB8, 0x88, 0x77, 0x66, 0x55, 0x44, 0x33, 0x22, 0x11]
        );
    }

    #[test]
    fn test_alu_imm_narrowing() {
        assert_eq!(
            emit(|w| w
                .alu(AluOp::Add, &Operand::Reg(Reg::Rax), &Operand::Imm(1))
                .unwrap()),
            vec![0x48, 0x83, 0xC0, 0x01]
        );
        assert_eq!(
            emit(|w| w
                .alu(AluOp::Cmp, &Operand::Reg(Reg::Rdi), &Operand::Imm(1000))
                .unwrap()),
            vec![0x48, 0x81, 0xFF, 0xE8, 0x03, 0x00, 0x00]
        );
    }

    #[test]
    fn test_alu_reg_mem_forms() {
        assert_eq!(
            emit(|w| w
                .alu(
                    AluOp::Sub,
                    &Operand::Reg(Reg::Rax),
                    &Operand::Mem(Mem::base(Reg::Rbp, -16))
                )
                .unwrap()),
            vec![0x48, 0x2B, 0x45, 0xF0]
        );
        assert_eq!(
            emit(|w| w
                .alu(
                    AluOp::Add,
                    &Operand::Mem(Mem::base(Reg::Rbp, -16)),
                    &Operand::Reg(Reg::Rax)
                )
                .unwrap()),
            vec![0x48, 0x01, 0x45, 0xF0]
        );
    }

    #[test]
    fn test_alu_rejects_mem_mem() {
        let mut pool = CodePool::new();
        let mut w = pool.open().unwrap();
        let m = Operand::Mem(Mem::base(Reg::Rbp, -8));
        assert!(matches!(
            w.alu(AluOp::Add, &m, &m),
            Err(CompileError::Unencodable)
        ));
        // Nothing was written by the rejected form.
        assert_eq!(w.emitted().len(), 0);
        pool.abandon(w);
    }

    #[test]
    fn test_div_family() {
        assert_eq!(emit(|w| w.cqo().unwrap()), vec![0x48, 0x99]);
        assert_eq!(
            emit(|w| w.idiv(&Operand::Reg(Reg::Rsi)).unwrap()),
            vec![0x48, 0xF7, 0xFE]
        );
        assert_eq!(
            emit(|w| w.div(&Operand::Reg(Reg::Rcx)).unwrap()),
            vec![0x48, 0xF7, 0xF1]
        );
    }

    #[test]
    fn test_shifts() {
        assert_eq!(
            emit(|w| w
                .shift(ShiftKind::Shl, &Operand::Reg(Reg::Rax), ShiftCount::Cl)
                .unwrap()),
            vec![0x48, 0xD3, 0xE0]
        );
        assert_eq!(
            emit(|w| w
                .shift(ShiftKind::Sar, &Operand::Reg(Reg::Rdx), ShiftCount::Imm(63))
                .unwrap()),
            vec![0x48, 0xC1, 0xFA, 0x3F]
        );
    }

    #[test]
    fn test_lea_frame_slot() {
        let b = emit(|w| w.lea(Reg::Rax, &Mem::base(Reg::Rbp, -48)).unwrap());
        assert_eq!(b, vec![0x48, 0x8D, 0x45, 0xD0]);
    }

    #[test]
    fn test_setcc_and_movzx() {
        assert_eq!(
            emit(|w| w.setcc(Cond::L, Reg::Rax.low8()).unwrap()),
            vec![0x0F, 0x9C, 0xC0]
        );
        // r9b needs REX.B.
        assert_eq!(
            emit(|w| w.setcc(Cond::B, Reg::R9.low8()).unwrap()),
            vec![0x41, 0x0F, 0x92, 0xC1]
        );
        // sil is only reachable with a bare REX prefix.
        assert_eq!(
            emit(|w| w.setcc(Cond::E, Reg::Rsi.low8()).unwrap()),
            vec![0x40, 0x0F, 0x94, 0xC6]
        );
        assert_eq!(
            emit(|w| w.movzx_rr8(Reg::Rax, Reg::Rax.low8()).unwrap()),
            vec![0x48, 0x0F, 0xB6, 0xC0]
        );
    }

    #[test]
    fn test_cmov() {
        assert_eq!(
            emit(|w| w
                .cmovcc(Cond::Be, Reg::Rcx, &Operand::Reg(Reg::Rax))
                .unwrap()),
            vec![0x48, 0x0F, 0x46, 0xC8]
        );
    }

    #[test]
    fn test_push_pop() {
        assert_eq!(emit(|w| w.push(Reg::Rbp).unwrap()), vec![0x55]);
        assert_eq!(emit(|w| w.push(Reg::R12).unwrap()), vec![0x41, 0x54]);
        assert_eq!(emit(|w| w.pop(Reg::R15).unwrap()), vec![0x41, 0x5F]);
    }

    #[test]
    fn test_jumps_relative_to_next_instruction() {
        let mut pool = CodePool::new();
        let mut w = pool.open().unwrap();
        let start = w.tell();
        // Jump to self: displacement is -5.
        w.emit_jump(None, start).unwrap();
        assert_eq!(w.emitted(), &[0xE9, 0xFB, 0xFF, 0xFF, 0xFF]);
        // Conditional jump right past itself: displacement 0.
        let here = w.tell();
        w.emit_jump(Some(Cond::E), here + 6).unwrap();
        assert_eq!(&w.emitted()[5..], &[0x0F, 0x84, 0, 0, 0, 0]);
        pool.abandon(w);
    }

    #[test]
    fn test_call_and_guard() {
        let mut pool = CodePool::new();
        let mut w = pool.open().unwrap();
        let start = w.tell();
        w.call_rel32(start).unwrap();
        assert_eq!(w.emitted(), &[0xE8, 0xFB, 0xFF, 0xFF, 0xFF]);
        pool.abandon(w);
        assert_eq!(emit(|w| w.ud2().unwrap()), vec![0x0F, 0x0B]);
        assert_eq!(
            emit(|w| w.call_rm(&Operand::Reg(Reg::R11)).unwrap()),
            vec![0x41, 0xFF, 0xD3]
        );
    }

    #[test]
    fn test_imul_forms() {
        assert_eq!(
            emit(|w| w.imul_rr(Reg::Rax, &Operand::Reg(Reg::Rcx)).unwrap()),
            vec![0x48, 0x0F, 0xAF, 0xC1]
        );
        assert_eq!(
            emit(|w| w
                .imul_rri(Reg::Rax, &Operand::Reg(Reg::Rcx), 10)
                .unwrap()),
            vec![0x48, 0x6B, 0xC1, 0x0A]
        );
        assert_eq!(
            emit(|w| w
                .imul_rri(Reg::Rax, &Operand::Reg(Reg::Rcx), 1000)
                .unwrap()),
            vec![0x48, 0x69, 0xC1, 0xE8, 0x03, 0x00, 0x00]
        );
    }
}
