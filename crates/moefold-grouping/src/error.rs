//! Error types for grouping and assignment.

use thiserror::Error;

/// Result type alias for grouping operations.
pub type Result<T> = core::result::Result<T, Error>;

/// Grouping error types.
#[derive(Debug, Error)]
pub enum Error {
    /// Invalid configuration combination, raised at construction.
    #[error("invalid grouping config: {0}")]
    Config(String),

    /// A layer cannot satisfy the group capacity limit.
    #[error("layer {layer}: number of groups too small for group limit {group_limit}")]
    GroupTooSmall { layer: usize, group_limit: usize },

    /// Capacity eviction failed to settle.
    #[error("layer {layer}: capacity eviction did not converge")]
    AssignmentDiverged { layer: usize },

    /// Per-layer state requested before it was computed.
    #[error("no grouping state for layer {layer}")]
    MissingState { layer: usize },

    /// An estimator was called without calibration data.
    #[error("calibration stream is empty")]
    EmptyCalibration,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Core(#[from] moefold_core::Error),

    #[error(transparent)]
    Model(#[from] moefold_model::Error),
}

impl Error {
    /// Create a configuration error.
    pub fn config(message: impl Into<String>) -> Self {
        Error::Config(message.into())
    }
}
