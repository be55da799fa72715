//! Error types for matrix and linear-algebra operations.

use thiserror::Error;

/// Result type alias for core numeric operations.
pub type Result<T> = core::result::Result<T, Error>;

/// Core numeric error types.
#[derive(Debug, Error)]
pub enum Error {
    /// Operand shapes are incompatible.
    #[error("shape mismatch: expected {expected:?}, got {got:?}")]
    ShapeMismatch {
        expected: (usize, usize),
        got: (usize, usize),
    },

    /// Buffer length does not match the declared shape.
    #[error("data length {len} does not match shape {rows}x{cols}")]
    DataLength { rows: usize, cols: usize, len: usize },

    /// A linear system could not be solved.
    #[error("singular system while computing {what}")]
    Singular { what: &'static str },

    /// An argument is outside its valid domain.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

impl Error {
    /// Create a shape mismatch error.
    pub fn shape(expected: (usize, usize), got: (usize, usize)) -> Self {
        Error::ShapeMismatch { expected, got }
    }

    /// Create an invalid argument error.
    pub fn invalid(message: impl Into<String>) -> Self {
        Error::InvalidArgument(message.into())
    }
}
