//! Mask-gradient knowledge estimation.
//!
//! Per layer, every expert gets an all-ones multiplicative mask on its down
//! input. One forward+backward per calibration batch accumulates a
//! gradient-sensitivity term and a representation-energy term per feature.
//! The first eligible layer's softened outputs become the distillation
//! target reused by all later layers, so layers must be processed in order.

use tracing::{debug, info};

use crate::config::KnowledgeConfig;
use crate::error::{Error, Result};
use crate::grouper::Grouper;
use moefold_core::Matrix;
use moefold_model::{CalibBatch, MoeModel};

impl Grouper {
    /// Knowledge scores for a single layer, `(num_experts, d_ff)`.
    ///
    /// `kd_labels` carries the per-batch softened targets: empty for the
    /// first eligible layer (it fills them in), reused afterwards.
    pub fn compute_layer_knowledge(
        &mut self,
        model: &MoeModel,
        calib: &[CalibBatch],
        layer: usize,
        kd_labels: &mut Vec<Matrix>,
        cfg: &KnowledgeConfig,
    ) -> Result<Matrix> {
        if calib.is_empty() {
            return Err(Error::EmptyCalibration);
        }
        let e_count = self.model_config.num_experts;
        let d_ff = self.model_config.d_ff;
        let first = self
            .eligible_layers()
            .first()
            .copied()
            .is_some_and(|f| f == layer);
        if !first && kd_labels.len() != calib.len() {
            return Err(Error::config(format!(
                "expected {} cached distillation targets, got {}",
                calib.len(),
                kd_labels.len()
            )));
        }

        let masks = Matrix::full(e_count, d_ff, 1.0);
        let mut pred = Matrix::zeros(e_count, d_ff);
        let mut rep = Matrix::zeros(e_count, d_ff);
        let mut num_samples = 0usize;
        let mut num_tokens = 0usize;

        // mean of squared down weights per feature column
        let down_energy: Vec<Vec<f32>> = (0..e_count)
            .map(|e| {
                let down = &model.layers[layer].expert(e).down;
                let mut cols = vec![0.0f32; down.cols()];
                for r in 0..down.rows() {
                    for (c, &v) in cols.iter_mut().zip(down.row(r)) {
                        *c += v * v;
                    }
                }
                let inv = 1.0 / down.rows() as f32;
                cols.iter().map(|&c| c * inv).collect()
            })
            .collect();

        for (bi, batch) in calib.iter().enumerate() {
            let target = if first { None } else { Some(&kd_labels[bi]) };
            let pass = model.knowledge_pass(layer, &masks, batch, cfg.temperature, target)?;
            if first {
                kd_labels.push(pass.soft_output.clone());
            }
            num_samples += pass.num_sequences;
            num_tokens += pass.num_tokens;
            debug!(layer, batch = bi, kl_div = pass.kl_div, "knowledge batch");

            for e in 0..e_count {
                let grad_row = pass.mask_grad.row(e);
                let pred_row = pred.row_mut(e);
                for (p, &g) in pred_row.iter_mut().zip(grad_row) {
                    *p += g * g * 0.5;
                }
                let features = &pass.expert_inputs[e];
                let rep_row = rep.row_mut(e);
                for r in 0..features.rows() {
                    for (j, &a) in features.row(r).iter().enumerate() {
                        rep_row[j] += a * a * down_energy[e][j];
                    }
                }
            }
        }

        if num_samples == 0 || num_tokens == 0 {
            return Err(Error::EmptyCalibration);
        }
        pred.scale_in_place(1.0 / num_samples as f32);
        rep.scale_in_place(1.0 / num_tokens as f32);
        let mut scores = pred;
        scores.scale_in_place(cfg.lam_pred);
        let mut rep_scaled = rep;
        rep_scaled.scale_in_place(cfg.lam_rep);
        scores.add_assign(&rep_scaled)?;

        self.state_mut(layer)?.knowledge = Some(scores.clone());
        Ok(scores)
    }

    /// Knowledge scores for every eligible layer, in order, with target reuse.
    pub fn compute_all_knowledge(
        &mut self,
        model: &MoeModel,
        calib: &[CalibBatch],
        cfg: &KnowledgeConfig,
    ) -> Result<()> {
        let mut kd_labels = Vec::new();
        let layers = self.eligible_layers();
        for &l in &layers {
            self.compute_layer_knowledge(model, calib, l, &mut kd_labels, cfg)?;
        }
        info!(layers = layers.len(), "computed knowledge scores");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GrouperConfig;
    use moefold_model::ModelConfig;

    fn setup() -> (MoeModel, Grouper, Vec<CalibBatch>) {
        let mc = ModelConfig {
            vocab_size: 21,
            d_model: 6,
            d_ff: 8,
            num_experts: 3,
            num_layers: 2,
            top_k: 2,
        };
        let model = MoeModel::synthetic(mc.clone(), Some(31));
        let grouper = Grouper::new(
            mc,
            GrouperConfig {
                seed: Some(2),
                ..GrouperConfig::default()
            },
        )
        .unwrap();
        let calib = vec![
            CalibBatch::dense(vec![vec![1, 4, 7], vec![2, 5, 8]]),
            CalibBatch::dense(vec![vec![3, 6, 9, 12]]),
        ];
        (model, grouper, calib)
    }

    #[test]
    fn knowledge_scores_are_finite_and_nonnegative() {
        let (model, mut grouper, calib) = setup();
        grouper
            .compute_all_knowledge(&model, &calib, &KnowledgeConfig::default())
            .unwrap();
        for layer in grouper.eligible_layers() {
            let scores = grouper.state(layer).unwrap().knowledge.clone().unwrap();
            assert_eq!(scores.shape(), (3, 8));
            assert!(scores.data().iter().all(|&v| v.is_finite() && v >= 0.0));
        }
    }

    #[test]
    fn first_layer_fills_distillation_targets() {
        let (model, mut grouper, calib) = setup();
        let mut kd_labels = Vec::new();
        grouper
            .compute_layer_knowledge(&model, &calib, 0, &mut kd_labels, &KnowledgeConfig::default())
            .unwrap();
        assert_eq!(kd_labels.len(), calib.len());
        // reuse on the next layer must not grow the cache
        grouper
            .compute_layer_knowledge(&model, &calib, 1, &mut kd_labels, &KnowledgeConfig::default())
            .unwrap();
        assert_eq!(kd_labels.len(), calib.len());
    }

    #[test]
    fn later_layer_without_targets_is_an_error() {
        let (model, mut grouper, calib) = setup();
        let mut empty = Vec::new();
        assert!(grouper
            .compute_layer_knowledge(&model, &calib, 1, &mut empty, &KnowledgeConfig::default())
            .is_err());
    }

    #[test]
    fn knowledge_ranking_is_available_after_estimation() {
        let (model, mut grouper, calib) = setup();
        grouper
            .compute_all_knowledge(&model, &calib, &KnowledgeConfig::default())
            .unwrap();
        let ranked = grouper.rank_by_knowledge(0).unwrap();
        assert_eq!(ranked.len(), 3);
    }
}
