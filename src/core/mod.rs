// This module collects the architecture-independent pieces of the backend:
// error types, the executable-memory pool with its bounded writers, the value
// and operation model, the precomputed type tokens with their layout
// calculators, and generator statistics.

//! Architecture-independent infrastructure.

pub mod buffer;
pub mod error;
pub mod ir;
pub mod session;
pub mod token;

pub use buffer::{CodePool, CodeWriter, CHUNK_SIZE};
pub use error::{CompileError, CompileResult};
pub use ir::{BinaryOp, BuilderId, LabelId, PlaceId, SwitchId, UnaryOp, Value, VarId};
pub use session::GenStats;
pub use token::{
    AllocToken, ArrayLayout, ArrayToken, FieldKind, FieldToken, SigToken, StructLayout,
    TokenCache, VarSizeToken, WORD,
};
