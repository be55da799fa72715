//! Grouping configuration: bases, measures and the orchestrator config.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use moefold_core::{ops, FP32_EPS};

/// Representation used to compare experts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SimilarityBasis {
    /// Flattened concat of the three weight blocks.
    Weight,
    /// Each expert's row of the router weight matrix.
    RouterWeight,
    /// Each expert's column of captured router logits.
    RouterLogits,
    /// Expert outputs over captured layer inputs.
    ExpertOutput,
    /// Combinations, used by the clustering assignment.
    WeightAndExpertOutput,
    RouterLogitsAndWeight,
    RouterLogitsAndExpertOutput,
    RouterLogitsAndWeightAndExpertOutput,
}

impl SimilarityBasis {
    /// Whether this basis needs a calibration stream.
    pub fn needs_calibration(&self) -> bool {
        !matches!(self, SimilarityBasis::Weight | SimilarityBasis::RouterWeight)
    }

    /// Whether this basis is a multi-representation combination, valid only
    /// for the clustering assignment.
    pub fn is_combination(&self) -> bool {
        matches!(
            self,
            SimilarityBasis::WeightAndExpertOutput
                | SimilarityBasis::RouterLogitsAndWeight
                | SimilarityBasis::RouterLogitsAndExpertOutput
                | SimilarityBasis::RouterLogitsAndWeightAndExpertOutput
        )
    }
}

/// Pointwise similarity function over representation vectors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SimilarityMeasure {
    /// Cosine mapped into [0, 1].
    Cosine,
    /// Bounded transform of the summed squared error.
    Mse,
}

impl SimilarityMeasure {
    pub fn apply(&self, a: &[f32], b: &[f32]) -> f32 {
        match self {
            SimilarityMeasure::Cosine => (ops::cosine(a, b) + 1.0) / 2.0,
            SimilarityMeasure::Mse => {
                let mse = ops::mse_sum(a, b).max(FP32_EPS);
                1.0 / (1.0 + 0.1 * mse.ln())
            }
        }
    }
}

/// Comparison applied to expert-output distributions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OverlapMetric {
    /// Pointwise measure on per-token-averaged outputs.
    Cosine,
    /// KL divergence of mean output distributions.
    KlDivergence,
    /// 1-D Wasserstein distance of output values.
    Wasserstein,
}

/// How per-expert usage is accumulated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum UsageMode {
    /// Top-k selection counts, normalized to sum 1 per layer.
    Frequency,
    /// Accumulated mean softmax mass, no final renormalization.
    RoutingScore,
}

/// Linkage rule for agglomerative clustering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Linkage {
    Single,
    Complete,
    Average,
}

/// Clustering routine for the clustering-based assignment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ClusterMethod {
    KMeans,
    Hierarchical(Linkage),
}

/// Knowledge estimator weights.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KnowledgeConfig {
    pub lam_pred: f32,
    pub lam_rep: f32,
    pub temperature: f32,
}

impl Default for KnowledgeConfig {
    fn default() -> Self {
        Self {
            lam_pred: 1.0,
            lam_rep: 1e-5,
            temperature: 2.0,
        }
    }
}

/// Orchestrator configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GrouperConfig {
    /// First eligible MoE layer; earlier layers are never touched.
    pub start_layer: usize,
    pub similarity_basis: SimilarityBasis,
    pub similarity_measure: SimilarityMeasure,
    pub overlap_metric: OverlapMetric,
    pub usage_mode: UsageMode,
    pub cluster: ClusterMethod,
    /// Maximum members per group, enforced by eviction.
    pub group_limit: usize,
    /// Row cap on captured activations.
    pub data_limit: usize,
    pub seed: Option<u64>,
}

impl Default for GrouperConfig {
    fn default() -> Self {
        Self {
            start_layer: 0,
            similarity_basis: SimilarityBasis::RouterLogits,
            similarity_measure: SimilarityMeasure::Cosine,
            overlap_metric: OverlapMetric::Cosine,
            usage_mode: UsageMode::Frequency,
            cluster: ClusterMethod::KMeans,
            group_limit: 4,
            data_limit: 50_000,
            seed: None,
        }
    }
}

impl GrouperConfig {
    /// Fail-fast validation of configuration combinations.
    pub fn validate(&self) -> Result<()> {
        if self.group_limit == 0 {
            return Err(Error::config("group_limit must be at least 1"));
        }
        if self.data_limit == 0 {
            return Err(Error::config("data_limit must be at least 1"));
        }
        if self.overlap_metric != OverlapMetric::Cosine
            && self.similarity_basis != SimilarityBasis::ExpertOutput
        {
            return Err(Error::config(format!(
                "overlap metric {:?} requires the expert-output basis",
                self.overlap_metric
            )));
        }
        Ok(())
    }
}
