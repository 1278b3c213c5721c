// smelt is an in-memory x86-64 code-generation backend: a frontend feeds it a
// stream of abstract integer operations (arithmetic, comparisons, memory
// access, calls, control transfers) through a Generator, and receives native
// machine code in executable memory plus a directly callable entry point.
// The crate is organized as a core layer (executable-memory pool, value and
// operation model, type tokens, statistics) and an x64 layer (operand model,
// hand-written instruction encoder, per-block register allocator with
// spilling and a condition-code resource, per-operation generation rules,
// and the graph builder with deferred control-flow patching and growable
// flexswitch dispatch).

//! In-memory x86-64 code generation.
//!
//! A [`Generator`] owns a pool of executable memory chunks and builds one or
//! more graphs (functions) into it. Operations are issued against a builder
//! handle and return opaque [`Value`]s; closing a block runs liveness
//! analysis and register allocation and emits machine code. Completed graphs
//! are called through their [`EntryPoint`].
//!
//! ```no_run
//! use bumpalo::Bump;
//! use smelt::{BinaryOp, Generator, SigToken, Value};
//!
//! # fn main() -> smelt::CompileResult<()> {
//! let arena = Bump::new();
//! let mut gen = Generator::new(&arena);
//! let (b, entry, args) = gen.new_graph(SigToken::new(1), "add5")?;
//! gen.start_writing(b)?;
//! let sum = gen.genop2(b, BinaryOp::Add, args[0], Value::imm(5))?;
//! gen.finish_and_return(b, SigToken::new(1), sum)?;
//! let result = unsafe { entry.call1(37) };
//! assert_eq!(result, 42);
//! # Ok(())
//! # }
//! ```

pub mod core;
pub mod x64;

pub use crate::core::{
    ArrayLayout, ArrayToken, BinaryOp, BuilderId, CompileError, CompileResult, FieldKind,
    FieldToken, GenStats, LabelId, PlaceId, SigToken, StructLayout, SwitchId, TokenCache,
    UnaryOp, Value, VarSizeToken,
};
pub use crate::x64::{Cond, EntryPoint, FrameInfo, Generator};
