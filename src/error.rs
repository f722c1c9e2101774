//! Crate-wide error taxonomy. Every core subsystem (tensor, autograd, module tree,
//! layer catalog) surfaces failures through this single enum so callers do not have
//! to match on a different error type per layer.

use crate::shape::ShapeError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CoreError {
    /// Operand shapes are incompatible for the requested operation.
    #[error("shape mismatch: {0}")]
    ShapeMismatch(String),

    /// A slice/gather/scatter index was not in bounds.
    #[error("index out of range: {0}")]
    IndexOutOfRange(String),

    /// Division by a near-zero divisor, or log of a non-positive input.
    #[error("arithmetic error: {0}")]
    Arithmetic(String),

    /// Wrong number of operands passed to an op.
    #[error("arity error: {0}")]
    Arity(String),

    /// A required input was absent (null).
    #[error("null input: {0}")]
    NullInput(String),

    /// A lazy module's inferred dimension changed across forward calls.
    #[error("lazy init failure: {0}")]
    LazyInitFailure(String),

    /// A parameter/buffer/submodule name was already registered.
    #[error("name collision: {0}")]
    NameCollision(String),

    /// Strict-mode state-dict load found a missing, extra, or mismatched entry.
    #[error("state dict mismatch: {0}")]
    StateDictMismatch(String),

    /// A KV-cache write would exceed its configured `max_seq_len`.
    #[error("cache overflow: {0}")]
    CacheOverflow(String),

    /// The operation is not implemented for the requested rank or configuration.
    #[error("unsupported: {0}")]
    Unsupported(String),

    /// I/O failure underneath save/load of a checkpoint.
    #[error("io error: {0}")]
    Io(String),
}

pub type CoreResult<T> = Result<T, CoreError>;

impl From<ShapeError> for CoreError {
    fn from(e: ShapeError) -> Self {
        CoreError::ShapeMismatch(e.0)
    }
}

impl From<std::io::Error> for CoreError {
    fn from(e: std::io::Error) -> Self {
        CoreError::Io(e.to_string())
    }
}

impl From<serde_json::Error> for CoreError {
    fn from(e: serde_json::Error) -> Self {
        CoreError::Io(e.to_string())
    }
}
