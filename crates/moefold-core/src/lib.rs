//! Dense matrix math and numeric primitives shared by the moefold crates.
//!
//! Everything downstream of this crate works in plain f32 on the CPU:
//! expert weight blocks, captured activations, similarity tables and
//! permutation matrices all use the same [`Matrix`] type.

mod error;
mod linalg;
mod matrix;
pub mod ops;

pub use error::{Error, Result};
pub use linalg::{correlation, pinv, solve};
pub use matrix::Matrix;
pub use ops::FP32_EPS;
