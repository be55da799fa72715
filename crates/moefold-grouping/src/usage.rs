//! Per-expert usage estimation from routing decisions.

use tracing::info;

use crate::config::UsageMode;
use crate::error::{Error, Result};
use crate::grouper::Grouper;
use moefold_core::ops;
use moefold_model::{CalibBatch, MoeModel};

impl Grouper {
    /// Accumulate per-expert usage for every eligible layer.
    ///
    /// Frequency mode counts top-k selections and normalizes each layer to
    /// sum 1; routing-score mode accumulates the per-batch mean softmax mass
    /// without a final renormalization.
    pub fn compute_all_usages(&mut self, model: &MoeModel, calib: &[CalibBatch]) -> Result<()> {
        if calib.is_empty() {
            return Err(Error::EmptyCalibration);
        }
        let layers = self.eligible_layers();
        let top_k = self.model_config.top_k;
        let mode = self.config.usage_mode;
        for &l in &layers {
            self.state_mut(l)?.usage.fill(0.0);
        }

        for batch in calib {
            let out = model.forward(batch, true)?;
            let all_logits = out
                .router_logits
                .ok_or_else(|| Error::config("forward did not produce router logits"))?;
            for &l in &layers {
                let logits = &all_logits[l];
                let usage = &mut self.state_mut(l)?.usage;
                match mode {
                    UsageMode::Frequency => {
                        for t in 0..logits.rows() {
                            for e in ops::top_k(logits.row(t), top_k) {
                                usage[e] += 1.0;
                            }
                        }
                    }
                    UsageMode::RoutingScore => {
                        let tokens = logits.rows();
                        if tokens == 0 {
                            continue;
                        }
                        let mut mass = vec![0.0f32; logits.cols()];
                        for t in 0..tokens {
                            let mut row = logits.row(t).to_vec();
                            ops::softmax(&mut row);
                            for (m, v) in mass.iter_mut().zip(row) {
                                *m += v;
                            }
                        }
                        let inv = 1.0 / tokens as f32;
                        for (u, m) in usage.iter_mut().zip(mass) {
                            *u += m * inv;
                        }
                    }
                }
            }
        }

        if mode == UsageMode::Frequency {
            for &l in &layers {
                let usage = &mut self.state_mut(l)?.usage;
                let total: f32 = usage.iter().sum();
                if total > 0.0 {
                    for u in usage.iter_mut() {
                        *u /= total;
                    }
                } else {
                    let uniform = 1.0 / usage.len() as f32;
                    usage.fill(uniform);
                }
            }
        }
        info!(layers = layers.len(), ?mode, "computed expert usage");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use crate::config::{GrouperConfig, UsageMode};
    use crate::grouper::Grouper;
    use moefold_model::{CalibBatch, ModelConfig, MoeModel};

    fn setup(mode: UsageMode) -> (MoeModel, Grouper, Vec<CalibBatch>) {
        let mc = ModelConfig {
            vocab_size: 19,
            d_model: 6,
            d_ff: 8,
            num_experts: 4,
            num_layers: 2,
            top_k: 2,
        };
        let model = MoeModel::synthetic(mc.clone(), Some(21));
        let grouper = Grouper::new(
            mc,
            GrouperConfig {
                usage_mode: mode,
                seed: Some(0),
                ..GrouperConfig::default()
            },
        )
        .unwrap();
        let calib = vec![
            CalibBatch::dense(vec![vec![1, 4, 7, 10], vec![2, 5, 8]]),
            CalibBatch::dense(vec![vec![3, 6, 9, 12, 15]]),
        ];
        (model, grouper, calib)
    }

    #[test]
    fn frequency_usage_sums_to_one_per_layer() {
        let (model, mut grouper, calib) = setup(UsageMode::Frequency);
        grouper.compute_all_usages(&model, &calib).unwrap();
        for layer in grouper.eligible_layers() {
            let usage = &grouper.state(layer).unwrap().usage;
            let sum: f32 = usage.iter().sum();
            assert!((sum - 1.0).abs() < 1e-5, "layer {layer} sum {sum}");
            assert!(usage.iter().all(|&u| u >= 0.0));
        }
    }

    #[test]
    fn routing_score_accumulates_batch_means() {
        let (model, mut grouper, calib) = setup(UsageMode::RoutingScore);
        grouper.compute_all_usages(&model, &calib).unwrap();
        for layer in grouper.eligible_layers() {
            let usage = &grouper.state(layer).unwrap().usage;
            let sum: f32 = usage.iter().sum();
            // each batch contributes a distribution summing to 1
            assert!((sum - calib.len() as f32).abs() < 1e-4, "layer {layer} sum {sum}");
        }
    }

    #[test]
    fn usage_is_deterministic() {
        let (model, mut g1, calib) = setup(UsageMode::Frequency);
        let (_, mut g2, _) = setup(UsageMode::Frequency);
        g1.compute_all_usages(&model, &calib).unwrap();
        g2.compute_all_usages(&model, &calib).unwrap();
        assert_eq!(g1.state(0).unwrap().usage, g2.state(0).unwrap().usage);
    }
}
