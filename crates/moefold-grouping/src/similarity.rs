//! Pairwise expert similarity per basis.

use tracing::{debug, info};

use crate::collect::{collect_layer_captures, subsample_rows};
use crate::config::{OverlapMetric, SimilarityBasis};
use crate::error::{Error, Result};
use crate::grouper::Grouper;
use moefold_core::{ops, Matrix};
use moefold_model::{CalibBatch, MoeLayer, MoeModel};

/// Flattened weight fingerprint per expert, one row each.
pub(crate) fn expert_weight_matrix(layer: &MoeLayer) -> Matrix {
    let rows: Vec<Vec<f32>> = (0..layer.num_experts())
        .map(|e| layer.expert(e).flattened())
        .collect();
    Matrix::from_rows(&rows).unwrap_or_else(|_| Matrix::zeros(0, 0))
}

/// Router rows per expert.
pub(crate) fn router_weight_matrix(layer: &MoeLayer) -> Matrix {
    layer.router.weight.clone()
}

/// Forward the captured layer input through every expert independently.
pub(crate) fn expert_outputs(layer: &MoeLayer, input: &Matrix) -> Result<Vec<Matrix>> {
    (0..layer.num_experts())
        .map(|e| layer.expert(e).forward(input).map_err(Error::from))
        .collect()
}

fn mean_distribution(output: &Matrix) -> Vec<f32> {
    let mut acc = vec![0.0f32; output.cols()];
    for r in 0..output.rows() {
        let mut row = output.row(r).to_vec();
        ops::softmax(&mut row);
        for (a, v) in acc.iter_mut().zip(row) {
            *a += v;
        }
    }
    if output.rows() > 0 {
        let inv = 1.0 / output.rows() as f32;
        for a in &mut acc {
            *a *= inv;
        }
    }
    acc
}

fn kl_divergence(p: &[f32], q: &[f32]) -> f32 {
    let mut kl = 0.0f32;
    for (&pv, &qv) in p.iter().zip(q) {
        if pv > 0.0 {
            kl += pv * (pv.max(1e-12).ln() - qv.max(1e-12).ln());
        }
    }
    if kl >= 100.0 {
        kl /= 100.0;
    }
    kl
}

fn wasserstein_1d(a: &Matrix, b: &Matrix) -> f32 {
    let mut xs = a.data().to_vec();
    let mut ys = b.data().to_vec();
    xs.sort_by(|x, y| x.partial_cmp(y).unwrap_or(std::cmp::Ordering::Equal));
    ys.sort_by(|x, y| x.partial_cmp(y).unwrap_or(std::cmp::Ordering::Equal));
    let n = xs.len().min(ys.len());
    if n == 0 {
        return 0.0;
    }
    xs.iter()
        .zip(&ys)
        .take(n)
        .map(|(&x, &y)| (x - y).abs())
        .sum::<f32>()
        / n as f32
}

impl Grouper {
    /// Build each eligible layer's symmetric similarity matrix for the
    /// configured basis. Combination bases belong to the clustering
    /// assignment and are rejected here.
    pub fn compute_all_similarities(
        &mut self,
        model: &MoeModel,
        calib: &[CalibBatch],
    ) -> Result<()> {
        let basis = self.config.similarity_basis;
        if basis.is_combination() {
            return Err(Error::config(format!(
                "combination basis {basis:?} is only valid for clustering"
            )));
        }
        if basis.needs_calibration() && calib.is_empty() {
            return Err(Error::EmptyCalibration);
        }
        let layers = self.eligible_layers();
        match basis {
            SimilarityBasis::Weight => {
                for &l in &layers {
                    let vectors = expert_weight_matrix(model.layer(l)?);
                    self.fill_pairwise(l, &vectors)?;
                }
            }
            SimilarityBasis::RouterWeight => {
                for &l in &layers {
                    let vectors = router_weight_matrix(model.layer(l)?);
                    self.fill_pairwise(l, &vectors)?;
                }
            }
            SimilarityBasis::RouterLogits => {
                let caps = collect_layer_captures(model, calib, &layers, false, true)?;
                for &l in &layers {
                    // expert vectors are logit columns across all tokens
                    let columns = caps.router_logits[&l].transpose();
                    self.fill_pairwise(l, &columns)?;
                }
            }
            SimilarityBasis::ExpertOutput => {
                let caps = collect_layer_captures(model, calib, &layers, true, false)?;
                for &l in &layers {
                    let input =
                        subsample_rows(&caps.inputs[&l], self.config.data_limit, self.config.seed);
                    let outputs = expert_outputs(model.layer(l)?, &input)?;
                    self.fill_expert_output(l, &outputs)?;
                }
            }
            other => {
                return Err(Error::config(format!(
                    "basis {other:?} has no pairwise similarity"
                )))
            }
        }
        info!(layers = layers.len(), ?basis, "computed expert similarities");
        Ok(())
    }

    fn fill_pairwise(&mut self, layer: usize, vectors: &Matrix) -> Result<()> {
        let measure = self.config.similarity_measure;
        let n = vectors.rows();
        let state = self.state_mut(layer)?;
        for i in 0..n {
            state.similarity.set(i, i, 1.0);
            for j in i + 1..n {
                let sim = measure.apply(vectors.row(i), vectors.row(j));
                state.similarity.set(i, j, sim);
                state.similarity.set(j, i, sim);
            }
        }
        debug!(layer, "similarity matrix filled");
        Ok(())
    }

    fn fill_expert_output(&mut self, layer: usize, outputs: &[Matrix]) -> Result<()> {
        let metric = self.config.overlap_metric;
        let measure = self.config.similarity_measure;
        let means: Vec<Vec<f32>> = outputs.iter().map(|o| o.col_means()).collect();
        let dists: Vec<Vec<f32>> = match metric {
            OverlapMetric::KlDivergence => outputs.iter().map(mean_distribution).collect(),
            _ => Vec::new(),
        };
        let n = outputs.len();
        let state = self.state_mut(layer)?;
        for i in 0..n {
            state.similarity.set(i, i, 1.0);
            for j in i + 1..n {
                let sim = match metric {
                    OverlapMetric::Cosine => measure.apply(&means[i], &means[j]),
                    OverlapMetric::KlDivergence => kl_divergence(&dists[i], &dists[j]),
                    OverlapMetric::Wasserstein => wasserstein_1d(&outputs[i], &outputs[j]),
                };
                state.similarity.set(i, j, sim);
                state.similarity.set(j, i, sim);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{GrouperConfig, SimilarityMeasure};
    use moefold_model::ModelConfig;

    fn setup(basis: SimilarityBasis) -> (MoeModel, Grouper, Vec<CalibBatch>) {
        let mc = ModelConfig {
            vocab_size: 23,
            d_model: 6,
            d_ff: 8,
            num_experts: 4,
            num_layers: 2,
            top_k: 2,
        };
        let model = MoeModel::synthetic(mc.clone(), Some(13));
        let grouper = Grouper::new(
            mc,
            GrouperConfig {
                similarity_basis: basis,
                similarity_measure: SimilarityMeasure::Cosine,
                seed: Some(1),
                ..GrouperConfig::default()
            },
        )
        .unwrap();
        let calib = vec![CalibBatch::dense(vec![vec![1, 5, 9, 13], vec![2, 6, 10]])];
        (model, grouper, calib)
    }

    fn assert_symmetric_unit_diag(grouper: &Grouper) {
        for layer in grouper.eligible_layers() {
            let sim = &grouper.state(layer).unwrap().similarity;
            for i in 0..sim.rows() {
                assert!((sim.get(i, i) - 1.0).abs() < 1e-6);
                for j in 0..sim.cols() {
                    assert!(
                        (sim.get(i, j) - sim.get(j, i)).abs() < 1e-6,
                        "asymmetry at layer {layer} ({i},{j})"
                    );
                }
            }
        }
    }

    #[test]
    fn weight_basis_is_symmetric_in_unit_range() {
        let (model, mut grouper, _) = setup(SimilarityBasis::Weight);
        grouper.compute_all_similarities(&model, &[]).unwrap();
        assert_symmetric_unit_diag(&grouper);
        let sim = &grouper.state(0).unwrap().similarity;
        for i in 0..4 {
            for j in 0..4 {
                let v = sim.get(i, j);
                assert!((0.0..=1.0).contains(&v), "value {v} out of range");
            }
        }
    }

    #[test]
    fn router_weight_basis_needs_no_calibration() {
        let (model, mut grouper, _) = setup(SimilarityBasis::RouterWeight);
        grouper.compute_all_similarities(&model, &[]).unwrap();
        assert_symmetric_unit_diag(&grouper);
    }

    #[test]
    fn router_logits_basis_requires_calibration() {
        let (model, mut grouper, calib) = setup(SimilarityBasis::RouterLogits);
        assert!(matches!(
            grouper.compute_all_similarities(&model, &[]),
            Err(Error::EmptyCalibration)
        ));
        grouper.compute_all_similarities(&model, &calib).unwrap();
        assert_symmetric_unit_diag(&grouper);
    }

    #[test]
    fn expert_output_basis_fills_all_layers() {
        let (model, mut grouper, calib) = setup(SimilarityBasis::ExpertOutput);
        grouper.compute_all_similarities(&model, &calib).unwrap();
        assert_symmetric_unit_diag(&grouper);
    }

    #[test]
    fn combination_basis_is_rejected() {
        let (model, mut grouper, calib) = setup(SimilarityBasis::RouterLogitsAndWeight);
        assert!(grouper.compute_all_similarities(&model, &calib).is_err());
    }

    #[test]
    fn identical_experts_have_maximal_weight_similarity() {
        let (mut model, mut grouper, _) = setup(SimilarityBasis::Weight);
        let cloned = model.layer(0).unwrap().expert(0).clone();
        model.layer_mut(0).unwrap().set_expert(1, cloned).unwrap();
        grouper.compute_all_similarities(&model, &[]).unwrap();
        let sim = &grouper.state(0).unwrap().similarity;
        assert!((sim.get(0, 1) - 1.0).abs() < 1e-5);
    }
}
