//! Gated FFN expert weights.

use crate::error::{Error, Result};
use moefold_core::{ops, Matrix};

/// One expert's feed-forward weights.
///
/// `gate` and `up` are `d_ff x d_model`, `down` is `d_model x d_ff`. The
/// forward map is `down(silu(gate x) * up x)` applied rowwise to token
/// matrices of shape `(tokens, d_model)`.
#[derive(Debug, Clone, PartialEq)]
pub struct ExpertWeights {
    pub gate: Matrix,
    pub down: Matrix,
    pub up: Matrix,
}

impl ExpertWeights {
    pub fn new(gate: Matrix, down: Matrix, up: Matrix) -> Result<Self> {
        let (d_ff, d_model) = gate.shape();
        if up.shape() != (d_ff, d_model) {
            return Err(Error::shape("up", (d_ff, d_model), up.shape()));
        }
        if down.shape() != (d_model, d_ff) {
            return Err(Error::shape("down", (d_model, d_ff), down.shape()));
        }
        Ok(Self { gate, down, up })
    }

    pub fn d_model(&self) -> usize {
        self.gate.cols()
    }

    pub fn d_ff(&self) -> usize {
        self.gate.rows()
    }

    /// Down-projection input, `silu(x gateᵀ) * (x upᵀ)`.
    pub fn hidden(&self, x: &Matrix) -> Result<Matrix> {
        let u = x.matmul_transpose(&self.gate)?;
        let v = x.matmul_transpose(&self.up)?;
        let mut h = u;
        for (hv, &vv) in h.data_mut().iter_mut().zip(v.data()) {
            *hv = ops::silu(*hv) * vv;
        }
        Ok(h)
    }

    /// Full expert forward over token rows.
    pub fn forward(&self, x: &Matrix) -> Result<Matrix> {
        let h = self.hidden(x)?;
        Ok(h.matmul_transpose(&self.down)?)
    }

    /// Forward with a per-feature mask on the down-projection input.
    ///
    /// Returns the output together with the masked hidden activations, which
    /// the knowledge estimator records as the down input.
    pub fn forward_masked(&self, x: &Matrix, mask: &[f32]) -> Result<(Matrix, Matrix)> {
        if mask.len() != self.d_ff() {
            return Err(Error::shape("mask", (1, self.d_ff()), (1, mask.len())));
        }
        let mut a = self.hidden(x)?;
        for r in 0..a.rows() {
            for (av, &m) in a.row_mut(r).iter_mut().zip(mask) {
                *av *= m;
            }
        }
        let out = a.matmul_transpose(&self.down)?;
        Ok((out, a))
    }

    /// Flattened concat of all three blocks, used as a weight fingerprint.
    pub fn flattened(&self) -> Vec<f32> {
        let mut out =
            Vec::with_capacity(self.gate.numel() + self.down.numel() + self.up.numel());
        out.extend_from_slice(self.gate.data());
        out.extend_from_slice(self.down.data());
        out.extend_from_slice(self.up.data());
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tiny_expert() -> ExpertWeights {
        let gate = Matrix::new(3, 2, vec![1.0, 0.0, 0.0, 1.0, 1.0, 1.0]).unwrap();
        let up = Matrix::new(3, 2, vec![0.5, 0.5, 1.0, 0.0, 0.0, 1.0]).unwrap();
        let down = Matrix::new(2, 3, vec![1.0, 0.0, 1.0, 0.0, 1.0, 0.0]).unwrap();
        ExpertWeights::new(gate, down, up).unwrap()
    }

    #[test]
    fn shape_validation() {
        let gate = Matrix::zeros(3, 2);
        let up = Matrix::zeros(3, 2);
        let bad_down = Matrix::zeros(3, 2);
        assert!(ExpertWeights::new(gate, bad_down, up).is_err());
    }

    #[test]
    fn forward_shape_and_masked_consistency() {
        let e = tiny_expert();
        let x = Matrix::new(4, 2, vec![0.1, -0.2, 1.0, 0.5, -1.0, 0.3, 0.0, 0.0]).unwrap();
        let out = e.forward(&x).unwrap();
        assert_eq!(out.shape(), (4, 2));

        let ones = vec![1.0; e.d_ff()];
        let (masked_out, a) = e.forward_masked(&x, &ones).unwrap();
        assert_eq!(masked_out, out);
        assert_eq!(a, e.hidden(&x).unwrap());

        let zeros = vec![0.0; e.d_ff()];
        let (zero_out, _) = e.forward_masked(&x, &zeros).unwrap();
        assert!(zero_out.data().iter().all(|&v| v == 0.0));
    }
}
