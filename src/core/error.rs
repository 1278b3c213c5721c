// This module defines error types for the smelt backend using the thiserror
// crate for idiomatic Rust error handling. CompileError is the main error enum
// covering the failure scenarios of in-memory code generation: exhaustion of a
// code block mid-emission (the one recoverable condition, caught by flexswitch
// growth and the fresh-chunk retry), register pressure that cannot be relieved
// by spilling, operations on values that were never defined or passed into the
// current block, rel32 branch targets out of range, and misuse of the builder
// protocol. Each variant carries the offending operation name or value so the
// failure can be attributed to a frontend request. The module also provides
// CompileResult<T> as a convenience alias for Result<T, CompileError>.

//! Error types for the smelt backend.
//!
//! Using thiserror for more idiomatic error handling.

use thiserror::Error;

/// Main error type for code generation.
#[derive(Error, Debug)]
pub enum CompileError {
    /// A code block ran out of reserved space mid-emission. Recoverable:
    /// the caller backs out and retries the emission in a fresh block.
    #[error("code block full")]
    BlockFull,

    #[error("executable mapping failed: {reason}")]
    Map { reason: String },

    /// No physical location could be obtained even after attempting a
    /// spill. Indicates too many simultaneously live pinned values.
    #[error("register pressure too high while generating {op}")]
    RegisterPressure { op: &'static str },

    #[error("unsupported operation: {0}")]
    Unsupported(&'static str),

    /// The encoder has no legal form for the requested operand
    /// combination. Generation rules always recover by moving one operand
    /// through a scratch register; this never reaches the frontend.
    #[error("operand combination not encodable")]
    Unencodable,

    /// An operand was neither a constant, a block input, nor the result of
    /// an earlier operation in the open block.
    #[error("value used before definition in {op}")]
    UndefinedValue { op: &'static str },

    #[error("branch target out of rel32 range (from {from:#x} to {to:#x})")]
    BranchRange { from: usize, to: usize },

    /// Cases may only be added to a flexswitch once its default block has
    /// been generated.
    #[error("flexswitch default case has not been generated yet")]
    SwitchDefaultMissing,

    #[error("switch case value {0} does not fit in a comparison immediate")]
    CaseRange(i64),

    #[error("builder is not open for writing")]
    NotWriting,

    #[error("builder is already open for writing")]
    AlreadyWriting,
}

/// Result type alias for code generation operations.
pub type CompileResult<T> = Result<T, CompileError>;
