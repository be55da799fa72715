//! Error types for the host-model substrate.

use thiserror::Error;

/// Result type alias for model operations.
pub type Result<T> = core::result::Result<T, Error>;

/// Model error types.
#[derive(Debug, Error)]
pub enum Error {
    /// Weight block shapes disagree with the model configuration.
    #[error("shape mismatch in {what}: expected {expected:?}, got {got:?}")]
    ShapeMismatch {
        what: &'static str,
        expected: (usize, usize),
        got: (usize, usize),
    },

    /// Layer index outside the model.
    #[error("layer {layer} out of range: model has {num_layers} layers")]
    LayerOutOfRange { layer: usize, num_layers: usize },

    /// Expert slot index outside the layer.
    #[error("expert slot {slot} out of range: layer has {num_experts} experts")]
    ExpertOutOfRange { slot: usize, num_experts: usize },

    /// Token id outside the embedding table.
    #[error("token id {token} out of range: vocab size is {vocab_size}")]
    TokenOutOfRange { token: u32, vocab_size: usize },

    /// Calibration batch rows are inconsistent.
    #[error("invalid calibration batch: {0}")]
    InvalidBatch(String),

    /// Numeric failure from the core layer.
    #[error(transparent)]
    Core(#[from] moefold_core::Error),
}

impl Error {
    /// Create a shape mismatch error for a named weight block.
    pub fn shape(what: &'static str, expected: (usize, usize), got: (usize, usize)) -> Self {
        Error::ShapeMismatch {
            what,
            expected,
            got,
        }
    }
}
