//! Error types for expert merging.

use thiserror::Error;

/// Result type alias for merge operations.
pub type Result<T> = core::result::Result<T, Error>;

/// Merge error types.
#[derive(Debug, Error)]
pub enum Error {
    /// Invalid strategy configuration.
    #[error("invalid merge config: {0}")]
    Config(String),

    /// A group resolved to zero members.
    #[error("group {label} has no members")]
    EmptyGroup { label: usize },

    /// An activation-based merge got too few captured rows.
    #[error("not enough routed activations for expert {expert}")]
    NoActivations { expert: usize },

    #[error(transparent)]
    Core(#[from] moefold_core::Error),

    #[error(transparent)]
    Model(#[from] moefold_model::Error),

    #[error(transparent)]
    Grouping(#[from] moefold_grouping::Error),
}

impl Error {
    /// Create a configuration error.
    pub fn config(message: impl Into<String>) -> Self {
        Error::Config(message.into())
    }
}
