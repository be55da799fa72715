//! Calibration capture helpers shared by similarity, clustering and merging.

use std::collections::BTreeMap;

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use tracing::debug;

use crate::error::{Error, Result};
use moefold_core::Matrix;
use moefold_model::{CalibBatch, MoeModel};

/// Concatenated per-layer captures over a whole calibration stream.
pub struct LayerCaptures {
    /// Layer input rows, keyed by layer.
    pub inputs: BTreeMap<usize, Matrix>,
    /// Raw router logits, keyed by layer.
    pub router_logits: BTreeMap<usize, Matrix>,
}

/// Run the calibration stream once and collect the requested captures for
/// `layers`. Inputs come from scoped taps; router logits from the forward
/// output.
pub fn collect_layer_captures(
    model: &MoeModel,
    calib: &[CalibBatch],
    layers: &[usize],
    want_inputs: bool,
    want_logits: bool,
) -> Result<LayerCaptures> {
    if calib.is_empty() {
        return Err(Error::EmptyCalibration);
    }
    let mut guards = Vec::new();
    if want_inputs {
        for &l in layers {
            guards.push(model.tap_layer_input(l)?);
        }
    }
    let mut logits_acc: BTreeMap<usize, Vec<Matrix>> = BTreeMap::new();
    for batch in calib {
        let out = model.forward(batch, want_logits)?;
        if let Some(rl) = out.router_logits {
            for &l in layers {
                logits_acc.entry(l).or_default().push(rl[l].clone());
            }
        }
    }

    let mut inputs = BTreeMap::new();
    for guard in &guards {
        inputs.insert(guard.layer(), guard.take_concat()?);
    }
    let mut router_logits = BTreeMap::new();
    for (l, parts) in logits_acc {
        let refs: Vec<&Matrix> = parts.iter().collect();
        router_logits.insert(l, Matrix::vstack(&refs)?);
    }
    debug!(
        layers = layers.len(),
        batches = calib.len(),
        "collected layer captures"
    );
    Ok(LayerCaptures {
        inputs,
        router_logits,
    })
}

/// Cap a row set with a seeded shuffle; surviving rows keep their order.
pub fn subsample_rows(m: &Matrix, limit: usize, seed: Option<u64>) -> Matrix {
    if m.rows() <= limit {
        return m.clone();
    }
    let mut rng = match seed {
        Some(s) => StdRng::seed_from_u64(s),
        None => StdRng::from_entropy(),
    };
    let mut idx: Vec<usize> = (0..m.rows()).collect();
    idx.shuffle(&mut rng);
    idx.truncate(limit);
    idx.sort_unstable();
    m.take_rows(&idx)
}
