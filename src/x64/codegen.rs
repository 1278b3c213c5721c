// This module holds one generation rule per operation kind: given the
// allocator for the open block it obtains operand locations, picks a
// destination (reusing an operand's register when this is its last use),
// emits the instruction sequence and registers the result. Rules recover
// from every Unencodable rejection locally by detouring one operand
// through a scratch register. The irregular x86 idioms live here: signed
// division through CQO/IDIV with a branch-free floor correction, shift
// counts through CL with an explicit out-of-range fixup, the multiply
// immediate form, the branch-free abs sequence, lazy comparison results in
// the condition code, System V call sequences with caller-saved
// evacuation, and array addressing that folds power-of-two item sizes into
// SIB scales and constant indexes into displacements.

//! Per-operation code generation rules.

use crate::core::error::{CompileError, CompileResult};
use crate::core::ir::{ArithKind, DivKind, Op, OpNode, ShiftOpKind, Value, VarId};
use crate::core::token::ArrayToken;
use crate::x64::builder::Generator;
use crate::x64::calling_convention as conv;
use crate::x64::encoder::{rel32_fits, AluOp, ShiftCount, ShiftKind, Width};
use crate::x64::operand::{Cond, Mem, Operand, Reg, RegSet, Scale};
use crate::x64::regalloc::{Loc, RegAllocator};

impl ArithKind {
    fn alu_op(self) -> AluOp {
        match self {
            ArithKind::Add => AluOp::Add,
            ArithKind::Sub => AluOp::Sub,
            ArithKind::And => AluOp::And,
            ArithKind::Or => AluOp::Or,
            ArithKind::Xor => AluOp::Xor,
        }
    }
}

impl ShiftOpKind {
    fn shift_kind(self) -> ShiftKind {
        match self {
            ShiftOpKind::Lshift => ShiftKind::Shl,
            ShiftOpKind::RshiftArith => ShiftKind::Sar,
            ShiftOpKind::RshiftLogic => ShiftKind::Shr,
        }
    }
}

/// Destination register for an in-place rule: when this is the operand's
/// last use and it already sits in a register, the result takes that
/// register over; otherwise the operand is copied into a fresh one.
fn inplace_dest(
    alloc: &mut RegAllocator,
    result: VarId,
    x: Value,
    xo: &Operand,
) -> CompileResult<Reg> {
    if let Operand::Reg(r) = xo {
        if alloc.dies_here(x) {
            alloc.release(x);
            alloc.def_at(result, Loc::Reg(*r));
            return Ok(*r);
        }
    }
    alloc.def_reg(result, Some(xo))
}

fn dies_in_reg(alloc: &RegAllocator, v: Value) -> bool {
    matches!(alloc.loc(v), Some(Loc::Reg(_))) && alloc.dies_here(v)
}

/// ALU with a register destination; an immediate source that does not fit
/// the sign-extended 32-bit form is detoured through a scratch register.
fn alu_rhs(alloc: &mut RegAllocator, op: AluOp, dst: Reg, src: &Operand) -> CompileResult<()> {
    match alloc.mc.alu(op, &Operand::Reg(dst), src) {
        Err(CompileError::Unencodable) => {
            let t = alloc.scratch(Some(src))?;
            alloc.mc.alu(op, &Operand::Reg(dst), &Operand::Reg(t))?;
            alloc.end_scratch(t);
            Ok(())
        }
        other => other,
    }
}

/// cmp over arbitrary operand combinations, normalizing through scratch
/// registers where no direct form exists.
fn emit_cmp(alloc: &mut RegAllocator, xo: &Operand, yo: &Operand) -> CompileResult<()> {
    match alloc.mc.alu(AluOp::Cmp, xo, yo) {
        Err(CompileError::Unencodable) => match xo {
            Operand::Reg(r) => alu_rhs(alloc, AluOp::Cmp, *r, yo),
            _ => {
                let t = alloc.scratch(Some(xo))?;
                let res = alu_rhs(alloc, AluOp::Cmp, t, yo);
                alloc.end_scratch(t);
                res
            }
        },
        other => other,
    }
}

impl<'a> Generator<'a> {
    /// Emit machine code for one operation.
    pub(crate) fn gen_op(
        &mut self,
        alloc: &mut RegAllocator,
        node: &OpNode<'a>,
    ) -> CompileResult<()> {
        let result = node.result;
        match &node.op {
            Op::Neg(x) => {
                let xo = alloc.operand(*x)?;
                if let Operand::Imm(i) = xo {
                    alloc.def_reg(result, Some(&Operand::Imm(i.wrapping_neg())))?;
                } else {
                    let d = inplace_dest(alloc, result, *x, &xo)?;
                    alloc.mc.neg(&Operand::Reg(d))?;
                }
                alloc.release(*x);
            }

            Op::Invert(x) => {
                let xo = alloc.operand(*x)?;
                if let Operand::Imm(i) = xo {
                    alloc.def_reg(result, Some(&Operand::Imm(!i)))?;
                } else {
                    let d = inplace_dest(alloc, result, *x, &xo)?;
                    alloc.mc.not(&Operand::Reg(d))?;
                }
                alloc.release(*x);
            }

            Op::Abs(x) => self.gen_abs(alloc, result, *x)?,

            Op::SameAs(x) => {
                // A dying condition-code value renames in place without
                // touching the flags.
                if let (Some(c), true) = (alloc.cc_of(*x), alloc.dies_here(*x)) {
                    alloc.release(*x);
                    alloc.def_cc(result, c);
                    return Ok(());
                }
                let xo = alloc.operand(*x)?;
                let _ = inplace_dest(alloc, result, *x, &xo)?;
                alloc.release(*x);
            }

            Op::Cmp0 { negated, x } => {
                // Condition-code values are already 0/1, so testing one
                // reduces to renaming (and possibly negating) it.
                if let (Some(c), true) = (alloc.cc_of(*x), alloc.dies_here(*x)) {
                    alloc.release(*x);
                    alloc.def_cc(result, if *negated { c.negate() } else { c });
                    return Ok(());
                }
                // The test below destroys the flags; any unrelated
                // condition-code value (possibly x itself) moves to a
                // register first.
                alloc.clobber_cc()?;
                let xo = alloc.operand(*x)?;
                match xo {
                    Operand::Reg(r) => alloc.mc.test_rr(r, r)?,
                    Operand::Mem(_) => alloc.mc.alu(AluOp::Cmp, &xo, &Operand::Imm(0))?,
                    Operand::Imm(_) => {
                        let t = alloc.scratch(Some(&xo))?;
                        alloc.mc.test_rr(t, t)?;
                        alloc.end_scratch(t);
                    }
                }
                alloc.release(*x);
                alloc.def_cc(result, if *negated { Cond::E } else { Cond::Ne });
            }

            Op::FetchCc(cond) => {
                // Materializing a previous occupant is flag-preserving, so
                // the adopted condition survives it.
                alloc.clobber_cc()?;
                alloc.def_cc(result, *cond);
            }

            Op::Arith(kind, x, y) => {
                let (mut a, mut b) = (*x, *y);
                if kind.commutative() && !dies_in_reg(alloc, a) && dies_in_reg(alloc, b) {
                    std::mem::swap(&mut a, &mut b);
                }
                let ao = alloc.operand(a)?;
                let bo = alloc.operand(b)?;
                let d = inplace_dest(alloc, result, a, &ao)?;
                alu_rhs(alloc, kind.alu_op(), d, &bo)?;
                alloc.release(a);
                alloc.release(b);
            }

            Op::Mul(x, y) => self.gen_mul(alloc, result, *x, *y)?,

            Op::DivRem { kind, x, y } => self.gen_divrem(alloc, result, *kind, *x, *y)?,

            Op::Shift(kind, x, y) => self.gen_shift(alloc, result, *kind, *x, *y)?,

            Op::Cmp { cc, x, y } => {
                let (mut cc, mut a, mut b) = (*cc, *x, *y);
                // An immediate can only appear on the right of a cmp.
                if a.is_const() && !b.is_const() {
                    std::mem::swap(&mut a, &mut b);
                    cc = cc.swap_args();
                }
                let ao = alloc.operand(a)?;
                let bo = alloc.operand(b)?;
                emit_cmp(alloc, &ao, &bo)?;
                alloc.release(a);
                alloc.release(b);
                alloc.def_cc(result, cc);
            }

            Op::Call { func, args, .. } => self.gen_call(alloc, result, *func, args)?,

            Op::ComputeSize { tok, len } => {
                let tok = *tok;
                match *len {
                    Value::Const(n) => {
                        let bytes = tok.items_offset as i64 + n * tok.item_size as i64;
                        alloc.def_reg(result, Some(&Operand::Imm(bytes)))?;
                    }
                    len => {
                        let lr = alloc.ensure_reg(len)?;
                        if let Some(scale) = Scale::for_size(tok.item_size) {
                            let d = alloc.def_reg(result, None)?;
                            alloc
                                .mc
                                .lea(d, &Mem::sib(None, lr, scale, tok.items_offset))?;
                        } else {
                            let d = alloc.def_reg(result, None)?;
                            alloc
                                .mc
                                .imul_rri(d, &Operand::Reg(lr), tok.item_size as i64)?;
                            alu_rhs(alloc, AluOp::Add, d, &Operand::Imm(tok.items_offset as i64))?;
                        }
                        alloc.release(len);
                    }
                }
            }

            Op::GetField { tok, ptr } => {
                let (tok, ptr) = (*tok, *ptr);
                let width =
                    Width::from_size(tok.size).ok_or(CompileError::Unsupported("field width"))?;
                let (mem, t) = mem_at(alloc, ptr, tok.offset as i64)?;
                if let Some(t) = t {
                    alloc.end_scratch(t);
                }
                if let (Some(Loc::Reg(r)), true) = (alloc.loc(ptr), alloc.dies_here(ptr)) {
                    alloc.release(ptr);
                    alloc.def_at(result, Loc::Reg(r));
                    alloc.mc.load_zx(width, r, &mem)?;
                } else {
                    let d = alloc.def_reg(result, None)?;
                    alloc.mc.load_zx(width, d, &mem)?;
                    alloc.release(ptr);
                }
            }

            Op::SetField { tok, ptr, val } => {
                let (tok, ptr, val) = (*tok, *ptr, *val);
                let width =
                    Width::from_size(tok.size).ok_or(CompileError::Unsupported("field width"))?;
                let (mem, t) = mem_at(alloc, ptr, tok.offset as i64)?;
                self.store_at(alloc, width, &mem, val)?;
                if let Some(t) = t {
                    alloc.end_scratch(t);
                }
                alloc.release(ptr);
                alloc.release(val);
            }

            Op::GetArrayItem { tok, arr, index } => {
                let (tok, arr, index) = (*tok, *arr, *index);
                let width = Width::from_size(tok.item_size as u8)
                    .ok_or(CompileError::Unsupported("array item size"))?;
                let (mem, scratches) = array_item_addr(alloc, tok, arr, index)?;
                let d = alloc.def_reg(result, None)?;
                alloc.mc.load_zx(width, d, &mem)?;
                for t in scratches {
                    alloc.end_scratch(t);
                }
                alloc.release(arr);
                alloc.release(index);
            }

            Op::SetArrayItem {
                tok,
                arr,
                index,
                val,
            } => {
                let (tok, arr, index, val) = (*tok, *arr, *index, *val);
                let width = Width::from_size(tok.item_size as u8)
                    .ok_or(CompileError::Unsupported("array item size"))?;
                let (mem, scratches) = array_item_addr(alloc, tok, arr, index)?;
                self.store_at(alloc, width, &mem, val)?;
                for t in scratches {
                    alloc.end_scratch(t);
                }
                alloc.release(arr);
                alloc.release(index);
                alloc.release(val);
            }

            Op::GetArraySub { tok, arr, index } => {
                let (tok, arr, index) = (*tok, *arr, *index);
                let (mem, scratches) = array_item_addr(alloc, tok, arr, index)?;
                let d = alloc.def_reg(result, None)?;
                alloc.mc.lea(d, &mem)?;
                for t in scratches {
                    alloc.end_scratch(t);
                }
                alloc.release(arr);
                alloc.release(index);
            }

            Op::FrameBase => {
                let d = alloc.def_reg(result, None)?;
                alloc.mc.mov_rr(d, Reg::Rbp)?;
            }

            Op::JumpIf {
                cond,
                negate,
                target,
                args,
            } => {
                let (cond, negate, target) = (*cond, *negate, *target);
                let branch_cc = match alloc.cc_of(cond) {
                    Some(c) => c,
                    None => {
                        // The condition is an ordinary 0/1 word; test it,
                        // preserving any unrelated condition-code value by
                        // materializing it first.
                        alloc.clobber_cc()?;
                        let xo = alloc.operand(cond)?;
                        match xo {
                            Operand::Reg(r) => alloc.mc.test_rr(r, r)?,
                            Operand::Mem(_) => {
                                alloc.mc.alu(AluOp::Cmp, &xo, &Operand::Imm(0))?
                            }
                            Operand::Imm(_) => {
                                let t = alloc.scratch(Some(&xo))?;
                                alloc.mc.test_rr(t, t)?;
                                alloc.end_scratch(t);
                            }
                        }
                        Cond::Ne
                    }
                };
                let branch_cc = if negate { branch_cc.negate() } else { branch_cc };
                // The target resumes with the values exactly where they are
                // at the jump.
                let mut locs = Vec::with_capacity(args.len());
                for a in args.iter() {
                    locs.push(
                        alloc
                            .loc(*a)
                            .ok_or(CompileError::UndefinedValue { op: "jump_if" })?,
                    );
                }
                self.set_coming_from(target, &mut alloc.mc, Some(branch_cc))?;
                self.set_builder_input_locs(target, locs);
                alloc.release(cond);
                for a in args.iter() {
                    alloc.release(*a);
                }
            }

            Op::Label { label, args } => {
                let label = *label;
                let addr = alloc.mc.tell();
                let mut locs = Vec::with_capacity(args.len());
                for a in args.iter() {
                    locs.push(
                        alloc
                            .loc(*a)
                            .ok_or(CompileError::UndefinedValue { op: "label" })?,
                    );
                }
                self.fix_label(label, addr, locs);
                alloc.labels_in_block.push(label);
                for a in args.iter() {
                    alloc.release(*a);
                }
            }
        }
        Ok(())
    }

    /// Branch-free absolute value (the Psyco sequence): with dst a copy of
    /// the operand, `shl dst, 1` pushes the sign into the carry,
    /// `sbb dst, src` yields src or src-1, `sbb t, t` builds the sign
    /// mask, and the final xor flips the negative case into -src.
    fn gen_abs(&mut self, alloc: &mut RegAllocator, result: VarId, x: Value) -> CompileResult<()> {
        let xo = alloc.operand(x)?;
        if let Operand::Imm(i) = xo {
            alloc.def_reg(result, Some(&Operand::Imm(i.wrapping_abs())))?;
            alloc.release(x);
            return Ok(());
        }
        // The source is read again after dst changes, so no in-place form.
        let d = alloc.def_reg(result, Some(&xo))?;
        alloc
            .mc
            .shift(ShiftKind::Shl, &Operand::Reg(d), ShiftCount::Imm(1))?;
        alloc.mc.alu(AluOp::Sbb, &Operand::Reg(d), &xo)?;
        alloc.release(x);
        let t = alloc.scratch(None)?;
        alloc
            .mc
            .alu(AluOp::Sbb, &Operand::Reg(t), &Operand::Reg(t))?;
        alloc
            .mc
            .alu(AluOp::Xor, &Operand::Reg(d), &Operand::Reg(t))?;
        alloc.end_scratch(t);
        Ok(())
    }

    fn gen_mul(
        &mut self,
        alloc: &mut RegAllocator,
        result: VarId,
        x: Value,
        y: Value,
    ) -> CompileResult<()> {
        // Pull a constant factor out; multiplication commutes.
        let (v, imm) = match (x, y) {
            (Value::Const(a), Value::Const(b)) => {
                alloc.def_reg(result, Some(&Operand::Imm(a.wrapping_mul(b))))?;
                return Ok(());
            }
            (Value::Const(a), v) | (v, Value::Const(a)) => (v, Some(a)),
            _ => (x, None),
        };
        if let Some(imm) = imm {
            if i32::try_from(imm).is_ok() {
                let vo = alloc.operand(v)?;
                // The three-operand form reads src before writing dst, so
                // a dying register can serve as both.
                let d = if dies_in_reg(alloc, v) {
                    let Some(Loc::Reg(r)) = alloc.loc(v) else {
                        unreachable!()
                    };
                    alloc.release(v);
                    alloc.def_at(result, Loc::Reg(r));
                    r
                } else {
                    alloc.def_reg(result, None)?
                };
                alloc.mc.imul_rri(d, &vo, imm)?;
                alloc.release(v);
                return Ok(());
            }
        }
        let xo = alloc.operand(x)?;
        let yo = alloc.operand(y)?;
        let d = inplace_dest(alloc, result, x, &xo)?;
        match alloc.mc.imul_rr(d, &yo) {
            Err(CompileError::Unencodable) => {
                let t = alloc.scratch(Some(&yo))?;
                alloc.mc.imul_rr(d, &Operand::Reg(t))?;
                alloc.end_scratch(t);
            }
            other => other?,
        }
        alloc.release(x);
        alloc.release(y);
        Ok(())
    }

    /// Division and remainder through RAX/RDX. Signed kinds apply a
    /// branch-free correction after IDIV so that the quotient rounds
    /// toward negative infinity and the remainder carries the divisor's
    /// sign:
    ///
    /// ```text
    ///                 floor     idiv
    ///    20 /   3  =   6,  2     6,  2
    ///  (-20) /  3  =  -7,  1    -6, -2     <- operand signs differ
    ///    20 / (-3) =  -7, -1    -6,  2     <- operand signs differ
    ///  (-20) / (-3) =  6, -2     6, -2
    /// ```
    fn gen_divrem(
        &mut self,
        alloc: &mut RegAllocator,
        result: VarId,
        kind: DivKind,
        x: Value,
        y: Value,
    ) -> CompileResult<()> {
        alloc.clobber_reg(Reg::Rax, RegSet::of(&[Reg::Rdx]))?;
        alloc.clobber_reg(Reg::Rdx, RegSet::of(&[Reg::Rax]))?;
        let xo = alloc.operand(x)?;
        alloc.mc.mov(&Operand::Reg(Reg::Rax), &xo)?;
        let yo = alloc.operand(y)?;
        let (yop, yscratch) = match yo {
            Operand::Imm(_) => {
                let t = alloc.scratch(Some(&yo))?;
                (Operand::Reg(t), Some(t))
            }
            other => (other, None),
        };

        match kind {
            DivKind::FloorDiv | DivKind::Mod => {
                alloc.mc.cqo()?;
                alloc.mc.idiv(&yop)?;
                let t = alloc.scratch(None)?;
                alloc.mc.mov(&Operand::Reg(t), &Operand::Reg(Reg::Rdx))?;
                alloc.mc.alu(AluOp::Xor, &Operand::Reg(t), &yop)?;
                alloc
                    .mc
                    .shift(ShiftKind::Sar, &Operand::Reg(t), ShiftCount::Imm(63))?;
                match kind {
                    DivKind::FloorDiv => {
                        // Zero the mask when the remainder is zero, then
                        // add -1 or 0 to the quotient.
                        alloc.mc.test_rr(Reg::Rdx, Reg::Rdx)?;
                        alloc.mc.cmovcc(Cond::E, t, &Operand::Reg(Reg::Rdx))?;
                        alloc
                            .mc
                            .alu(AluOp::Add, &Operand::Reg(Reg::Rax), &Operand::Reg(t))?;
                    }
                    _ => {
                        // Nonzero iff the signs differ and the remainder
                        // is nonzero; in that case add the divisor.
                        alloc
                            .mc
                            .alu(AluOp::And, &Operand::Reg(t), &Operand::Reg(Reg::Rdx))?;
                        alloc.mc.cmovcc(Cond::Ne, t, &yop)?;
                        alloc
                            .mc
                            .alu(AluOp::Add, &Operand::Reg(Reg::Rdx), &Operand::Reg(t))?;
                    }
                }
                alloc.end_scratch(t);
            }
            DivKind::UDiv | DivKind::UMod => {
                alloc
                    .mc
                    .alu(AluOp::Xor, &Operand::Reg(Reg::Rdx), &Operand::Reg(Reg::Rdx))?;
                alloc.mc.div(&yop)?;
            }
        }

        if let Some(t) = yscratch {
            alloc.end_scratch(t);
        }
        alloc.release(x);
        alloc.release(y);
        let (res, other) = match kind {
            DivKind::FloorDiv | DivKind::UDiv => (Reg::Rax, Reg::Rdx),
            DivKind::Mod | DivKind::UMod => (Reg::Rdx, Reg::Rax),
        };
        alloc.def_fixed(result, res);
        alloc.end_scratch(other);
        Ok(())
    }

    fn gen_shift(
        &mut self,
        alloc: &mut RegAllocator,
        result: VarId,
        kind: ShiftOpKind,
        x: Value,
        y: Value,
    ) -> CompileResult<()> {
        if let Value::Const(n) = y {
            let n = if (0..64).contains(&n) {
                n as u8
            } else if kind == ShiftOpKind::RshiftArith {
                // Equivalent to shifting all the way to the sign bit.
                63
            } else {
                // The result is always zero.
                alloc.release(x);
                let d = alloc.def_reg(result, None)?;
                alloc
                    .mc
                    .alu(AluOp::Xor, &Operand::Reg(d), &Operand::Reg(d))?;
                return Ok(());
            };
            let xo = alloc.operand(x)?;
            if let Operand::Imm(i) = xo {
                let folded = match kind {
                    ShiftOpKind::Lshift => i.wrapping_shl(n as u32),
                    ShiftOpKind::RshiftArith => i >> n,
                    ShiftOpKind::RshiftLogic => ((i as u64) >> n) as i64,
                };
                alloc.def_reg(result, Some(&Operand::Imm(folded)))?;
            } else {
                let d = inplace_dest(alloc, result, x, &xo)?;
                alloc
                    .mc
                    .shift(kind.shift_kind(), &Operand::Reg(d), ShiftCount::Imm(n))?;
            }
            alloc.release(x);
            return Ok(());
        }

        alloc.clobber_reg(Reg::Rcx, RegSet::EMPTY)?;
        let yo = alloc.operand(y)?;
        if kind == ShiftOpKind::RshiftArith {
            // Clamp the count: anything above 63 (including negative
            // counts, which are huge unsigned) behaves like 63.
            alloc.mc.mov_ri(Reg::Rcx, 63)?;
            emit_cmp(alloc, &yo, &Operand::Reg(Reg::Rcx))?;
            alloc.mc.cmovcc(Cond::Be, Reg::Rcx, &yo)?;
        } else {
            alloc.mc.mov(&Operand::Reg(Reg::Rcx), &yo)?;
        }

        let xo = alloc.operand(x)?;
        let d = inplace_dest(alloc, result, x, &xo)?;
        alloc
            .mc
            .shift(kind.shift_kind(), &Operand::Reg(d), ShiftCount::Cl)?;
        if kind != ShiftOpKind::RshiftArith {
            // The hardware masked the count mod 64; fix up the result to
            // zero for counts of 64 and beyond, reusing RCX as the mask.
            alloc
                .mc
                .alu(AluOp::Cmp, &Operand::Reg(Reg::Rcx), &Operand::Imm(64))?;
            alloc
                .mc
                .alu(AluOp::Sbb, &Operand::Reg(Reg::Rcx), &Operand::Reg(Reg::Rcx))?;
            alloc
                .mc
                .alu(AluOp::And, &Operand::Reg(d), &Operand::Reg(Reg::Rcx))?;
        }
        alloc.end_scratch(Reg::Rcx);
        alloc.release(x);
        alloc.release(y);
        Ok(())
    }

    /// System V call sequence: every caller-saved register is evacuated to
    /// callee-saved registers or frame slots, stack arguments are written
    /// into the outgoing area at the frame bottom, register arguments are
    /// loaded (conflict-free, since nothing live remains in a caller-saved
    /// register), and the result is adopted from RAX.
    fn gen_call(
        &mut self,
        alloc: &mut RegAllocator,
        result: VarId,
        func: Value,
        args: &bumpalo::collections::Vec<'a, Value>,
    ) -> CompileResult<()> {
        let n = args.len();
        alloc.reserve_outgoing(conv::outgoing_stack_words(n));
        for r in conv::CALLER_SAVED {
            alloc.clobber_reg(r, conv::caller_saved_set())?;
        }
        for i in conv::ARG_REGS.len()..n {
            let dst = Mem::base(Reg::Rsp, conv::outgoing_stack_offset(i));
            self.store_at(alloc, Width::Q, &dst, args[i])?;
        }
        for (i, arg) in args.iter().enumerate().take(conv::ARG_REGS.len()) {
            let vo = alloc.operand(*arg)?;
            if vo != Operand::Reg(conv::ARG_REGS[i]) {
                alloc.mc.mov(&Operand::Reg(conv::ARG_REGS[i]), &vo)?;
            }
        }
        let fo = alloc.operand(func)?;
        match fo {
            Operand::Imm(addr) if rel32_fits(alloc.mc.tell() + 5, addr as usize) => {
                alloc.mc.call_rel32(addr as usize)?;
            }
            Operand::Imm(addr) => {
                // Too far for rel32; R10 is reserved and carries no live
                // value here.
                alloc.mc.mov_ri(Reg::R10, addr)?;
                alloc.mc.call_rm(&Operand::Reg(Reg::R10))?;
            }
            other => alloc.mc.call_rm(&other)?,
        }
        alloc.release(func);
        for a in args.iter() {
            alloc.release(*a);
        }
        let keep_result = alloc.result_used(result);
        for r in conv::CALLER_SAVED {
            if !(keep_result && r == conv::RET_REG) {
                alloc.end_scratch(r);
            }
        }
        if keep_result {
            alloc.def_fixed(result, conv::RET_REG);
        }
        Ok(())
    }

    /// Store a value of the given width at a memory operand, detouring
    /// through a scratch register for the source forms a store cannot
    /// take directly.
    fn store_at(
        &mut self,
        alloc: &mut RegAllocator,
        width: Width,
        dst: &Mem,
        val: Value,
    ) -> CompileResult<()> {
        let vo = alloc.operand(val)?;
        match vo {
            Operand::Reg(r) => alloc.mc.mov_store(width, dst, r),
            Operand::Imm(i) => match alloc.mc.mov_store_imm(width, dst, i) {
                Err(CompileError::Unencodable) => {
                    let t = alloc.scratch(Some(&vo))?;
                    alloc.mc.mov_store(width, dst, t)?;
                    alloc.end_scratch(t);
                    Ok(())
                }
                other => other,
            },
            Operand::Mem(_) => {
                let t = alloc.scratch(Some(&vo))?;
                alloc.mc.mov_store(width, dst, t)?;
                alloc.end_scratch(t);
                Ok(())
            }
        }
    }
}

/// Memory operand for `ptr + disp`. A constant pointer folds into an
/// absolute displacement when it fits; otherwise it is loaded into a
/// scratch register returned for the caller to release.
fn mem_at(
    alloc: &mut RegAllocator,
    ptr: Value,
    disp: i64,
) -> CompileResult<(Mem, Option<Reg>)> {
    if let Value::Const(base) = ptr {
        let total = base.wrapping_add(disp);
        if let Ok(total) = i32::try_from(total) {
            return Ok((Mem::absolute(total), None));
        }
        let t = alloc.scratch(Some(&Operand::Imm(base)))?;
        let disp = i32::try_from(disp).map_err(|_| CompileError::Unencodable)?;
        return Ok((Mem::base(t, disp), Some(t)));
    }
    let r = alloc.ensure_reg(ptr)?;
    let disp = i32::try_from(disp).map_err(|_| CompileError::Unencodable)?;
    Ok((Mem::base(r, disp), None))
}

/// Memory operand addressing one array item: `arr + items_offset +
/// index * item_size`. Constant indexes fold into the displacement,
/// power-of-two item sizes into the SIB scale, and anything else goes
/// through an explicit multiply into a scratch register.
fn array_item_addr(
    alloc: &mut RegAllocator,
    tok: ArrayToken,
    arr: Value,
    index: Value,
) -> CompileResult<(Mem, Vec<Reg>)> {
    let mut scratches = Vec::new();
    if let Value::Const(i) = index {
        let disp = tok.items_offset as i64 + i * tok.item_size as i64;
        let (mem, t) = mem_at(alloc, arr, disp)?;
        scratches.extend(t);
        return Ok((mem, scratches));
    }
    let ir = alloc.ensure_reg(index)?;
    let (index_reg, scale) = match Scale::for_size(tok.item_size) {
        Some(scale) => (ir, scale),
        None => {
            let t = alloc.scratch(None)?;
            alloc
                .mc
                .imul_rri(t, &Operand::Reg(ir), tok.item_size as i64)?;
            scratches.push(t);
            (t, Scale::S1)
        }
    };
    match arr {
        Value::Const(base) => {
            let disp = base.wrapping_add(tok.items_offset as i64);
            if let Ok(disp) = i32::try_from(disp) {
                Ok((Mem::sib(None, index_reg, scale, disp), scratches))
            } else {
                let t = alloc.scratch(Some(&Operand::Imm(base)))?;
                scratches.push(t);
                Ok((
                    Mem::sib(Some(t), index_reg, scale, tok.items_offset),
                    scratches,
                ))
            }
        }
        _ => {
            let ar = alloc.ensure_reg(arr)?;
            Ok((
                Mem::sib(Some(ar), index_reg, scale, tok.items_offset),
                scratches,
            ))
        }
    }
}
