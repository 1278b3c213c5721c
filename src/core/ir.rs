// This module defines the value and operation model of the backend. A Value
// is either a Variable (the result of exactly one operation, unknown until
// run time) or a Constant that can be folded into instruction immediates.
// Operations form a closed tagged enumeration -- one variant per opcode
// family, matched exhaustively by the code generator -- instead of an open
// class hierarchy with a name-keyed dispatch table. Each operation knows its
// result kind (none, word, or condition code), whether executing it destroys
// a live condition-code value, and whether it has side effects; an operation
// without side effects whose result is never consumed is dropped during the
// liveness pass. Operations are appended to an open block and never mutated
// afterwards; only the location the allocator assigns to their result changes,
// once. Handles for builders, labels, switches and frame places are plain
// indices into arenas owned by the generator.

//! Values, operations and arena handles.

use bumpalo::collections::Vec as BumpVec;

use crate::core::token::{ArrayToken, FieldToken, SigToken};
use crate::x64::operand::Cond;

/// Identity of a variable; each one has exactly one producing operation
/// (or is a graph/block input).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct VarId(pub(crate) u32);

/// An abstract value handled by the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Value {
    Var(VarId),
    Const(i64),
}

impl Value {
    /// A constant word.
    pub fn imm(value: i64) -> Value {
        Value::Const(value)
    }

    /// A constant holding an address.
    pub fn addr(addr: usize) -> Value {
        Value::Const(addr as i64)
    }

    pub fn is_const(&self) -> bool {
        matches!(self, Value::Const(_))
    }
}

/// Handle to a builder (an open or paused basic-block chain).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BuilderId(pub(crate) u32);

/// Handle to a jump target with fixed operand locations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LabelId(pub(crate) u32);

/// Handle to a growable dispatch switch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SwitchId(pub(crate) u32);

/// Handle to a value forced into a known frame slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlaceId(pub(crate) u32);

/// Unary opcodes accepted from the frontend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Neg,
    Abs,
    Invert,
    IsTrue,
    BoolNot,
}

/// Binary opcodes accepted from the frontend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    And,
    Or,
    Xor,
    FloorDiv,
    Mod,
    UDiv,
    UMod,
    Lshift,
    Rshift,
    URshift,
    Lt,
    Le,
    Eq,
    Ne,
    Gt,
    Ge,
    Ult,
    Ule,
    Ugt,
    Uge,
}

/// In-place ALU family.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ArithKind {
    Add,
    Sub,
    And,
    Or,
    Xor,
}

impl ArithKind {
    pub(crate) fn commutative(self) -> bool {
        !matches!(self, ArithKind::Sub)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ShiftOpKind {
    Lshift,
    RshiftArith,
    RshiftLogic,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum DivKind {
    FloorDiv,
    Mod,
    UDiv,
    UMod,
}

/// What an operation produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ResultKind {
    /// Nothing a later operation can consume.
    None,
    /// A word-sized value.
    Word,
    /// A condition-code value, materialized lazily.
    Cc,
}

/// One IR operation. The spanned lifetime is the generator's arena.
#[derive(Debug)]
pub(crate) enum Op<'a> {
    Neg(Value),
    Invert(Value),
    Abs(Value),
    SameAs(Value),
    /// is_true / bool_not: compare against zero, result in the condition
    /// code. `negated` selects the zero case.
    Cmp0 {
        negated: bool,
        x: Value,
    },
    /// Adopt the currently established condition code as a value.
    FetchCc(Cond),
    Arith(ArithKind, Value, Value),
    Mul(Value, Value),
    DivRem {
        kind: DivKind,
        x: Value,
        y: Value,
    },
    Shift(ShiftOpKind, Value, Value),
    /// Comparison; `cc` is the condition that holds when it succeeds.
    Cmp {
        cc: Cond,
        x: Value,
        y: Value,
    },
    Call {
        sig: SigToken,
        func: Value,
        args: BumpVec<'a, Value>,
    },
    /// Byte size of a var-sized allocation, via the array token.
    ComputeSize {
        tok: ArrayToken,
        len: Value,
    },
    GetField {
        tok: FieldToken,
        ptr: Value,
    },
    SetField {
        tok: FieldToken,
        ptr: Value,
        val: Value,
    },
    GetArrayItem {
        tok: ArrayToken,
        arr: Value,
        index: Value,
    },
    /// Address of an array element (LEA form of the same computation).
    GetArraySub {
        tok: ArrayToken,
        arr: Value,
        index: Value,
    },
    SetArrayItem {
        tok: ArrayToken,
        arr: Value,
        index: Value,
        val: Value,
    },
    /// Expose the frame pointer.
    FrameBase,
    /// Conditional fork: branch to `target` when the condition holds
    /// (or fails, with `negate`).
    JumpIf {
        cond: Value,
        negate: bool,
        target: BuilderId,
        args: BumpVec<'a, Value>,
    },
    /// Fix a label's address and operand locations at this point.
    Label {
        label: LabelId,
        args: BumpVec<'a, Value>,
    },
}

/// An operation together with the variable naming its result.
#[derive(Debug)]
pub(crate) struct OpNode<'a> {
    pub result: VarId,
    pub op: Op<'a>,
}

impl<'a> Op<'a> {
    pub(crate) fn result_kind(&self) -> ResultKind {
        match self {
            Op::Cmp0 { .. } | Op::FetchCc(_) | Op::Cmp { .. } => ResultKind::Cc,
            Op::SetField { .. } | Op::SetArrayItem { .. } | Op::JumpIf { .. } | Op::Label { .. } => {
                ResultKind::None
            }
            _ => ResultKind::Word,
        }
    }

    /// Whether emitting this operation can destroy a live condition-code
    /// value. Operations that read or produce the condition code handle it
    /// themselves and are not flagged.
    pub(crate) fn clobbers_cc(&self) -> bool {
        match self {
            Op::SameAs(_) | Op::Cmp0 { .. } | Op::FetchCc(_) | Op::JumpIf { .. } => false,
            // Plain moves at a fixed offset.
            Op::GetField { .. } | Op::SetField { .. } => false,
            Op::FrameBase => false,
            // A label must not hold a value in the condition code: a later
            // jump to it could not reproduce an arbitrary word there.
            Op::Label { .. } => true,
            _ => true,
        }
    }

    pub(crate) fn has_side_effects(&self) -> bool {
        matches!(
            self,
            Op::SetField { .. }
                | Op::SetArrayItem { .. }
                | Op::Call { .. }
                | Op::JumpIf { .. }
                | Op::Label { .. }
        )
    }

    /// Diagnostic name, also used for the per-opcode statistics.
    pub(crate) fn name(&self) -> &'static str {
        match self {
            Op::Neg(_) => "neg",
            Op::Invert(_) => "invert",
            Op::Abs(_) => "abs",
            Op::SameAs(_) => "same_as",
            Op::Cmp0 { negated: false, .. } => "is_true",
            Op::Cmp0 { negated: true, .. } => "bool_not",
            Op::FetchCc(_) => "fetch_cc",
            Op::Arith(ArithKind::Add, ..) => "add",
            Op::Arith(ArithKind::Sub, ..) => "sub",
            Op::Arith(ArithKind::And, ..) => "and",
            Op::Arith(ArithKind::Or, ..) => "or",
            Op::Arith(ArithKind::Xor, ..) => "xor",
            Op::Mul(..) => "mul",
            Op::DivRem {
                kind: DivKind::FloorDiv,
                ..
            } => "floordiv",
            Op::DivRem {
                kind: DivKind::Mod, ..
            } => "mod",
            Op::DivRem {
                kind: DivKind::UDiv,
                ..
            } => "udiv",
            Op::DivRem {
                kind: DivKind::UMod,
                ..
            } => "umod",
            Op::Shift(ShiftOpKind::Lshift, ..) => "lshift",
            Op::Shift(ShiftOpKind::RshiftArith, ..) => "rshift",
            Op::Shift(ShiftOpKind::RshiftLogic, ..) => "urshift",
            Op::Cmp { .. } => "cmp",
            Op::Call { .. } => "call",
            Op::ComputeSize { .. } => "compute_size",
            Op::GetField { .. } => "getfield",
            Op::SetField { .. } => "setfield",
            Op::GetArrayItem { .. } => "getarrayitem",
            Op::GetArraySub { .. } => "getarraysubstruct",
            Op::SetArrayItem { .. } => "setarrayitem",
            Op::FrameBase => "get_frame_base",
            Op::JumpIf { .. } => "jump_if",
            Op::Label { .. } => "label",
        }
    }

    /// Visit every value this operation consumes.
    pub(crate) fn for_each_operand(&self, mut f: impl FnMut(Value)) {
        match self {
            Op::Neg(x) | Op::Invert(x) | Op::Abs(x) | Op::SameAs(x) | Op::Cmp0 { x, .. } => f(*x),
            Op::FetchCc(_) | Op::FrameBase => {}
            Op::Arith(_, x, y)
            | Op::Mul(x, y)
            | Op::DivRem { x, y, .. }
            | Op::Shift(_, x, y)
            | Op::Cmp { x, y, .. } => {
                f(*x);
                f(*y);
            }
            Op::Call { func, args, .. } => {
                f(*func);
                for a in args.iter() {
                    f(*a);
                }
            }
            Op::ComputeSize { len, .. } => f(*len),
            Op::GetField { ptr, .. } => f(*ptr),
            Op::SetField { ptr, val, .. } => {
                f(*ptr);
                f(*val);
            }
            Op::GetArrayItem { arr, index, .. } | Op::GetArraySub { arr, index, .. } => {
                f(*arr);
                f(*index);
            }
            Op::SetArrayItem {
                arr, index, val, ..
            } => {
                f(*arr);
                f(*index);
                f(*val);
            }
            Op::JumpIf { cond, args, .. } => {
                f(*cond);
                for a in args.iter() {
                    f(*a);
                }
            }
            Op::Label { args, .. } => {
                for a in args.iter() {
                    f(*a);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_result_kinds() {
        assert_eq!(
            Op::Cmp {
                cc: Cond::L,
                x: Value::imm(1),
                y: Value::imm(2)
            }
            .result_kind(),
            ResultKind::Cc
        );
        assert_eq!(Op::Neg(Value::imm(1)).result_kind(), ResultKind::Word);
        assert_eq!(
            Op::SetField {
                tok: crate::core::token::FieldToken { offset: 0, size: 8 },
                ptr: Value::imm(0),
                val: Value::imm(0)
            }
            .result_kind(),
            ResultKind::None
        );
    }

    #[test]
    fn test_cc_clobber_flags() {
        assert!(Op::Arith(ArithKind::Add, Value::imm(1), Value::imm(2)).clobbers_cc());
        assert!(!Op::SameAs(Value::imm(1)).clobbers_cc());
        assert!(!Op::GetField {
            tok: crate::core::token::FieldToken { offset: 8, size: 8 },
            ptr: Value::imm(0)
        }
        .clobbers_cc());
        // Comparisons set the condition code but also destroy the previous
        // one, so they are flagged.
        assert!(Op::Cmp {
            cc: Cond::E,
            x: Value::imm(1),
            y: Value::imm(2)
        }
        .clobbers_cc());
    }

    #[test]
    fn test_operand_visit_order() {
        let op = Op::Arith(ArithKind::Sub, Value::Var(VarId(3)), Value::Const(7));
        let mut seen = Vec::new();
        op.for_each_operand(|v| seen.push(v));
        assert_eq!(seen, vec![Value::Var(VarId(3)), Value::Const(7)]);
    }
}
