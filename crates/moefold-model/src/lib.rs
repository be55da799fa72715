//! Host-model substrate for expert grouping and merging.
//!
//! This crate provides the pieces the compression engine needs from a model:
//! - SwiGLU expert weight blocks and top-k routed MoE layers,
//! - a representative-index table expressing merged (weight-shared) slots,
//! - scoped RAII activation taps on layer inputs,
//! - calibration batches and a forward pass over them,
//! - the masked knowledge pass: forward with per-expert feature masks and a
//!   manual backward producing mask gradients.

mod calib;
mod capture;
mod error;
mod expert;
mod layer;
mod model;

pub use calib::CalibBatch;
pub use capture::CaptureGuard;
pub use error::{Error, Result};
pub use expert::ExpertWeights;
pub use layer::{MoeLayer, Router, Routing};
pub use model::{ForwardOutput, KnowledgePass, ModelConfig, MoeModel};
