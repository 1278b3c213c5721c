// This module gathers the x86-64 backend: the operand model and binary
// instruction encoder, the per-block register allocator, the generation rule
// for each abstract operation, the graph builder with its deferred patching
// and flexswitch machinery, the System V calling-convention tables and the
// trace disassembler.

//! x86-64 code generation backend.

pub mod builder;
pub mod calling_convention;
pub mod codegen;
pub mod dump;
pub mod encoder;
pub mod operand;
pub mod regalloc;

pub use builder::{EntryPoint, FrameInfo, Generator};
pub use operand::{Cond, Mem, Operand, Reg, RegSet, Scale};
