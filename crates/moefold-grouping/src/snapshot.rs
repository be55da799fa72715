//! Snapshot persistence for grouping state.

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{Error, Result};
use crate::grouper::Grouper;

/// Serializable view of one layer's assignment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LayerSnapshot {
    pub layer: usize,
    pub labels: Vec<usize>,
    pub cores: Vec<usize>,
    pub usage: Vec<f32>,
}

/// Serializable view of a whole grouping run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupingSnapshot {
    pub num_experts: usize,
    pub layers: Vec<LayerSnapshot>,
}

impl Grouper {
    /// Snapshot labels, cores and usage for every eligible layer.
    pub fn snapshot(&self) -> Result<GroupingSnapshot> {
        let mut layers = Vec::new();
        for layer in self.eligible_layers() {
            let state = self.state(layer)?;
            layers.push(LayerSnapshot {
                layer,
                labels: state.labels.clone(),
                cores: state.cores.clone(),
                usage: state.usage.clone(),
            });
        }
        Ok(GroupingSnapshot {
            num_experts: self.num_experts(),
            layers,
        })
    }

    /// Restore a snapshot into the matching layer states.
    ///
    /// Similarity matrices and knowledge scores are not persisted; estimators
    /// must be re-run if an assignment engine needs them afterwards.
    pub fn restore(&mut self, snapshot: &GroupingSnapshot) -> Result<()> {
        if snapshot.num_experts != self.num_experts() {
            return Err(Error::config(format!(
                "snapshot has {} experts, model has {}",
                snapshot.num_experts,
                self.num_experts()
            )));
        }
        for layer in &snapshot.layers {
            if layer.labels.len() != self.num_experts() {
                return Err(Error::config(format!(
                    "snapshot layer {} has {} labels",
                    layer.layer,
                    layer.labels.len()
                )));
            }
            let state = self.state_mut(layer.layer)?;
            state.labels = layer.labels.clone();
            state.cores = layer.cores.clone();
            state.usage = layer.usage.clone();
        }
        Ok(())
    }

    pub fn save_snapshot(&self, path: impl AsRef<Path>) -> Result<()> {
        let snapshot = self.snapshot()?;
        let text = serde_json::to_string_pretty(&snapshot)?;
        fs::write(path.as_ref(), text)?;
        info!(path = %path.as_ref().display(), "saved grouping snapshot");
        Ok(())
    }

    pub fn load_snapshot(&mut self, path: impl AsRef<Path>) -> Result<()> {
        let text = fs::read_to_string(path.as_ref())?;
        let snapshot: GroupingSnapshot = serde_json::from_str(&text)?;
        self.restore(&snapshot)?;
        info!(path = %path.as_ref().display(), "restored grouping snapshot");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GrouperConfig;
    use moefold_model::ModelConfig;

    fn grouper() -> Grouper {
        Grouper::new(
            ModelConfig {
                vocab_size: 16,
                d_model: 8,
                d_ff: 16,
                num_experts: 4,
                num_layers: 2,
                top_k: 2,
            },
            GrouperConfig {
                seed: Some(0),
                ..GrouperConfig::default()
            },
        )
        .unwrap()
    }

    #[test]
    fn snapshot_round_trips_through_json() {
        let mut g = grouper();
        for layer in [0, 1] {
            g.state_mut(layer).unwrap().usage = vec![0.4, 0.3, 0.2, 0.1];
        }
        g.group_layerwise_by_usage(2).unwrap();
        let snap = g.snapshot().unwrap();
        let text = serde_json::to_string(&snap).unwrap();
        let back: GroupingSnapshot = serde_json::from_str(&text).unwrap();

        let mut fresh = grouper();
        fresh.restore(&back).unwrap();
        for layer in [0, 1] {
            assert_eq!(
                fresh.state(layer).unwrap().labels,
                g.state(layer).unwrap().labels
            );
            assert_eq!(
                fresh.state(layer).unwrap().cores,
                g.state(layer).unwrap().cores
            );
        }
    }

    #[test]
    fn restore_rejects_mismatched_expert_count() {
        let mut g = grouper();
        let snap = GroupingSnapshot {
            num_experts: 8,
            layers: Vec::new(),
        };
        assert!(g.restore(&snap).is_err());
    }
}
