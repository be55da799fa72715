//! Layer-sweep merge drivers and reporting.
//!
//! Activation-based strategies capture layer inputs and router logits in
//! layer partitions, so earlier merges are reflected in the activations
//! collected for later layers and memory stays bounded.

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::average::{
    bind_group, groups_from_labels, merge_layer_average, merge_layer_by_usage, merge_layer_fixed,
    weighted_expert, FixedWeights,
};
use crate::dominant::{dominant_merge_group, DominantRule};
use crate::error::{Error, Result};
use crate::knowledge::{feature_selection_merge_group, knowledge_merge_layer};
use crate::zip::{zip_merge_group, zip_merge_group_recompute, Ingredient, ZipConfig};
use moefold_core::{ops, Matrix, FP32_EPS};
use moefold_grouping::{
    collect_layer_captures, subsample_rows, Grouper, KnowledgeConfig, LayerCaptures,
};
use moefold_model::{CalibBatch, MoeModel};

/// Which merge runs on each group.
#[derive(Debug, Clone, Copy)]
pub enum MergeStrategy {
    /// Usage-frequency-weighted average.
    Frequency,
    /// Uniform average.
    Average,
    /// Fixed core/non-core weights.
    Fixed(FixedWeights),
    /// Greedy correlation merge over hidden units.
    Zip(ZipConfig),
    /// Zip with per-round recomputation.
    ZipRecompute,
    /// Dominant-anchored unit matching.
    Dominant {
        rule: DominantRule,
        ingredient: Ingredient,
    },
    /// Per-feature knowledge weighting.
    Knowledge,
    /// Knowledge-thresholded feature selection.
    FeatureSelection { threshold: f32, weighted: bool },
}

impl MergeStrategy {
    fn needs_captures(&self) -> bool {
        matches!(
            self,
            MergeStrategy::Zip(_) | MergeStrategy::ZipRecompute | MergeStrategy::Dominant { .. }
        )
    }
}

/// Driver options shared by all strategies.
#[derive(Debug, Clone)]
pub struct MergeOptions {
    pub strategy: MergeStrategy,
    /// Layers captured and merged per pass.
    pub partition: usize,
    /// Row cap on each group's routed activations.
    pub data_limit: usize,
    /// Weight members by their captured routing mass.
    pub router_weighted: bool,
    /// Zip the non-core members first, then fold the result onto the core.
    pub dominant_alone: bool,
    pub seed: Option<u64>,
}

impl Default for MergeOptions {
    fn default() -> Self {
        Self {
            strategy: MergeStrategy::Frequency,
            partition: 4,
            data_limit: 50_000,
            router_weighted: false,
            dominant_alone: false,
            seed: None,
        }
    }
}

/// Per-layer outcome of a merge run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LayerReport {
    pub layer: usize,
    pub labels: Vec<usize>,
    pub cores: Vec<usize>,
    pub usage: Vec<f32>,
    pub knowledge_means: Option<Vec<f32>>,
    pub distinct_experts: usize,
}

/// Whole-run merge summary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MergeReport {
    pub layers: Vec<LayerReport>,
}

fn layer_report(model: &MoeModel, grouper: &Grouper, layer: usize) -> Result<LayerReport> {
    let state = grouper.state(layer)?;
    Ok(LayerReport {
        layer,
        labels: state.labels.clone(),
        cores: state.cores.clone(),
        usage: state.usage.clone(),
        knowledge_means: state.knowledge_means(),
        distinct_experts: model.layer(layer)?.distinct_experts(),
    })
}

/// Token rows routed to any group member, plus each member's softmax mass
/// over all captured tokens.
fn group_routed_tokens(
    logits: &Matrix,
    top_k: usize,
    members: &[usize],
) -> (Vec<usize>, Vec<f32>) {
    let mut rows = Vec::new();
    let mut mass = vec![0.0f32; members.len()];
    for t in 0..logits.rows() {
        let mut probs = logits.row(t).to_vec();
        let picks = ops::top_k(&probs, top_k);
        ops::softmax(&mut probs);
        for (mi, &m) in members.iter().enumerate() {
            mass[mi] += probs[m];
        }
        if picks.iter().any(|p| members.contains(p)) {
            rows.push(t);
        }
    }
    (rows, mass)
}

fn normalized(mass: &[f32]) -> Vec<f32> {
    let total: f32 = mass.iter().sum::<f32>() + FP32_EPS;
    mass.iter().map(|&m| m / total).collect()
}

fn merge_activation_layer(
    model: &mut MoeModel,
    grouper: &Grouper,
    layer_idx: usize,
    caps: &LayerCaptures,
    opts: &MergeOptions,
) -> Result<()> {
    let state = grouper.state(layer_idx)?;
    let labels = state.labels.clone();
    let usage = state.usage.clone();
    let cores = state.cores.clone();
    let inputs = &caps.inputs[&layer_idx];
    let logits = &caps.router_logits[&layer_idx];
    let top_k = model.layer(layer_idx)?.top_k;

    for (label, members) in groups_from_labels(&labels).iter().enumerate() {
        if members.is_empty() {
            return Err(Error::EmptyGroup { label });
        }
        if members.len() < 2 {
            continue;
        }
        let (rows, mass) = group_routed_tokens(logits, top_k, members);
        let group_input =
            subsample_rows(&inputs.take_rows(&rows), opts.data_limit, opts.seed);
        let input_weight = opts.router_weighted.then(|| normalized(&mass));
        debug!(
            layer = layer_idx,
            label,
            tokens = group_input.rows(),
            "merging group over routed activations"
        );

        match &opts.strategy {
            MergeStrategy::Zip(cfg) => {
                let core = cores.get(label).copied().unwrap_or(members[0]);
                if opts.dominant_alone && members.contains(&core) {
                    let non_core: Vec<usize> =
                        members.iter().copied().filter(|&m| m != core).collect();
                    let nc_weight = input_weight.as_ref().map(|w| {
                        members
                            .iter()
                            .zip(w)
                            .filter(|(&m, _)| m != core)
                            .map(|(_, &v)| v)
                            .collect::<Vec<f32>>()
                    });
                    let layer = model.layer_mut(layer_idx)?;
                    if non_core.len() >= 2 {
                        zip_merge_group(
                            layer,
                            label,
                            &non_core,
                            &group_input,
                            nc_weight.as_deref(),
                            cfg,
                        )?;
                    }
                    let weights = vec![
                        usage.get(core).copied().unwrap_or(1.0),
                        non_core
                            .iter()
                            .map(|&m| usage.get(m).copied().unwrap_or(1.0))
                            .sum::<f32>(),
                    ];
                    let merged = weighted_expert(layer, &[core, non_core[0]], &weights)?;
                    let mut bound = vec![core];
                    bound.extend(non_core);
                    bind_group(layer, &bound, merged)?;
                } else {
                    zip_merge_group(
                        model.layer_mut(layer_idx)?,
                        label,
                        members,
                        &group_input,
                        input_weight.as_deref(),
                        cfg,
                    )?;
                }
            }
            MergeStrategy::ZipRecompute => {
                zip_merge_group_recompute(model.layer_mut(layer_idx)?, label, members, &group_input)?;
            }
            MergeStrategy::Dominant { rule, ingredient } => {
                let core = cores.get(label).copied().unwrap_or(members[0]);
                dominant_merge_group(
                    model.layer_mut(layer_idx)?,
                    label,
                    core,
                    members,
                    &group_input,
                    input_weight.as_deref(),
                    *ingredient,
                    *rule,
                    1e-4,
                )?;
            }
            other => {
                return Err(Error::config(format!(
                    "strategy {other:?} does not use activations"
                )))
            }
        }
    }
    Ok(())
}

/// Merge every eligible layer according to the grouper's assignment.
///
/// The assignment engines must have run first; states are read as-is.
pub fn merge_by_groups(
    model: &mut MoeModel,
    grouper: &Grouper,
    calib: &[CalibBatch],
    opts: &MergeOptions,
) -> Result<MergeReport> {
    let layers = grouper.eligible_layers();
    let mut reports = Vec::new();
    for chunk in layers.chunks(opts.partition.max(1)) {
        let caps = if opts.strategy.needs_captures() {
            Some(collect_layer_captures(model, calib, chunk, true, true)?)
        } else {
            None
        };
        for &layer_idx in chunk {
            let state = grouper.state(layer_idx)?;
            let labels = state.labels.clone();
            let usage = state.usage.clone();
            let cores = state.cores.clone();
            let knowledge = state.knowledge.clone();
            match &opts.strategy {
                MergeStrategy::Frequency => {
                    merge_layer_by_usage(model.layer_mut(layer_idx)?, &labels, &usage)?;
                }
                MergeStrategy::Average => {
                    merge_layer_average(model.layer_mut(layer_idx)?, &labels)?;
                }
                MergeStrategy::Fixed(weights) => {
                    merge_layer_fixed(model.layer_mut(layer_idx)?, &labels, &cores, *weights)?;
                }
                MergeStrategy::Knowledge => {
                    let scores = knowledge.as_ref().ok_or_else(|| {
                        Error::config(format!("no knowledge scores for layer {layer_idx}"))
                    })?;
                    knowledge_merge_layer(model.layer_mut(layer_idx)?, &labels, scores)?;
                }
                MergeStrategy::FeatureSelection { threshold, weighted } => {
                    let scores = knowledge.as_ref().ok_or_else(|| {
                        Error::config(format!("no knowledge scores for layer {layer_idx}"))
                    })?;
                    for (label, members) in groups_from_labels(&labels).iter().enumerate() {
                        if members.is_empty() {
                            return Err(Error::EmptyGroup { label });
                        }
                        if members.len() < 2 {
                            continue;
                        }
                        let group_scores = scores.take_rows(members);
                        let group_usage: Option<Vec<f32>> = weighted
                            .then(|| members.iter().map(|&m| usage[m]).collect());
                        feature_selection_merge_group(
                            model.layer_mut(layer_idx)?,
                            members,
                            &group_scores,
                            group_usage.as_deref(),
                            *threshold,
                        )?;
                    }
                }
                _ => {
                    let caps = caps.as_ref().ok_or_else(|| {
                        Error::config("activation strategy without captures")
                    })?;
                    merge_activation_layer(model, grouper, layer_idx, caps, opts)?;
                }
            }
            reports.push(layer_report(model, grouper, layer_idx)?);
        }
    }
    info!(layers = reports.len(), "merge sweep complete");
    Ok(MergeReport { layers: reports })
}

/// All-in-one pipeline: estimate usage, similarity and knowledge, apportion
/// cores globally, assign with capacity eviction, then merge each group with
/// knowledge weights.
pub fn knowledge_dominant_pipeline(
    model: &mut MoeModel,
    grouper: &mut Grouper,
    calib: &[CalibBatch],
    num_average_groups: usize,
    knowledge_config: &KnowledgeConfig,
) -> Result<MergeReport> {
    grouper.compute_all_usages(model, calib)?;
    grouper.compute_all_similarities(model, calib)?;
    grouper.compute_all_knowledge(model, calib, knowledge_config)?;
    grouper.group_globally_from_dominant(num_average_groups)?;

    let mut reports = Vec::new();
    for layer_idx in grouper.eligible_layers() {
        let state = grouper.state(layer_idx)?;
        let labels = state.labels.clone();
        let scores = state.knowledge.clone().ok_or_else(|| {
            Error::config(format!("no knowledge scores for layer {layer_idx}"))
        })?;
        knowledge_merge_layer(model.layer_mut(layer_idx)?, &labels, &scores)?;
        reports.push(layer_report(model, grouper, layer_idx)?);
    }
    info!(layers = reports.len(), "knowledge-dominant pipeline complete");
    Ok(MergeReport { layers: reports })
}

/// Usage-frequency merge over every eligible layer's current assignment.
pub fn usage_weighted_merge_all(model: &mut MoeModel, grouper: &Grouper) -> Result<MergeReport> {
    let mut reports = Vec::new();
    for layer_idx in grouper.eligible_layers() {
        let state = grouper.state(layer_idx)?;
        let labels = state.labels.clone();
        let usage = state.usage.clone();
        merge_layer_by_usage(model.layer_mut(layer_idx)?, &labels, &usage)?;
        reports.push(layer_report(model, grouper, layer_idx)?);
    }
    Ok(MergeReport { layers: reports })
}

/// Feature-selection merge over every eligible layer's current assignment.
pub fn feature_selection_merge_all(
    model: &mut MoeModel,
    grouper: &Grouper,
    threshold: f32,
    weighted: bool,
) -> Result<MergeReport> {
    merge_by_groups(
        model,
        grouper,
        &[],
        &MergeOptions {
            strategy: MergeStrategy::FeatureSelection { threshold, weighted },
            ..MergeOptions::default()
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use moefold_grouping::GrouperConfig;
    use moefold_model::ModelConfig;

    fn model_config() -> ModelConfig {
        ModelConfig {
            vocab_size: 31,
            d_model: 6,
            d_ff: 8,
            num_experts: 4,
            num_layers: 2,
            top_k: 2,
        }
    }

    fn calib() -> Vec<CalibBatch> {
        vec![
            CalibBatch::dense(vec![vec![1, 5, 9, 13], vec![2, 6, 10]]),
            CalibBatch::dense(vec![vec![3, 7, 11, 15, 19]]),
        ]
    }

    fn grouper() -> Grouper {
        Grouper::new(
            model_config(),
            GrouperConfig {
                seed: Some(7),
                ..GrouperConfig::default()
            },
        )
        .unwrap()
    }

    fn similarity_rows() -> Matrix {
        Matrix::from_rows(&[
            vec![1.0, 0.5, 0.9, 0.2],
            vec![0.5, 1.0, 0.3, 0.8],
            vec![0.9, 0.3, 1.0, 0.4],
            vec![0.2, 0.8, 0.4, 1.0],
        ])
        .unwrap()
    }

    #[test]
    fn four_expert_two_group_frequency_merge() {
        let mut model = MoeModel::synthetic(model_config(), Some(3));
        let mut g = grouper();
        for layer in [0, 1] {
            let state = g.state_mut(layer).unwrap();
            state.usage = vec![0.4, 0.3, 0.2, 0.1];
            state.similarity = similarity_rows();
            g.assign_layer_with_cores(layer, vec![0, 1]).unwrap();
        }
        let report = merge_by_groups(&mut model, &g, &[], &MergeOptions::default()).unwrap();
        for lr in &report.layers {
            assert_eq!(lr.cores, vec![0, 1]);
            assert_eq!(lr.labels, vec![0, 1, 0, 1]);
            assert_eq!(lr.distinct_experts, 2);
        }
        let out = model.forward(&calib()[0], false).unwrap();
        assert!(out.logits.data().iter().all(|v| v.is_finite()));
    }

    #[test]
    fn zip_strategy_reduces_distinct_experts() {
        let mut model = MoeModel::synthetic(model_config(), Some(11));
        let mut g = grouper();
        g.compute_all_usages(&model, &calib()).unwrap();
        g.compute_all_similarities(&model, &calib()).unwrap();
        g.group_layerwise_by_usage(2).unwrap();
        let opts = MergeOptions {
            strategy: MergeStrategy::Zip(ZipConfig::default()),
            ..MergeOptions::default()
        };
        let report = merge_by_groups(&mut model, &g, &calib(), &opts).unwrap();
        for lr in &report.layers {
            assert!(lr.distinct_experts <= 2, "layer {}", lr.layer);
        }
        let out = model.forward(&calib()[0], false).unwrap();
        assert!(out.logits.data().iter().all(|v| v.is_finite()));
    }

    #[test]
    fn dominant_alone_two_stage_runs() {
        let mut model = MoeModel::synthetic(model_config(), Some(13));
        let mut g = grouper();
        g.compute_all_usages(&model, &calib()).unwrap();
        g.compute_all_similarities(&model, &calib()).unwrap();
        g.group_layerwise_by_usage(2).unwrap();
        let opts = MergeOptions {
            strategy: MergeStrategy::Zip(ZipConfig::default()),
            dominant_alone: true,
            router_weighted: true,
            ..MergeOptions::default()
        };
        let report = merge_by_groups(&mut model, &g, &calib(), &opts).unwrap();
        assert_eq!(report.layers.len(), 2);
        for lr in &report.layers {
            assert!(lr.distinct_experts <= 2);
        }
    }

    #[test]
    fn knowledge_dominant_pipeline_end_to_end() {
        let mut model = MoeModel::synthetic(model_config(), Some(17));
        let mut g = grouper();
        let report = knowledge_dominant_pipeline(
            &mut model,
            &mut g,
            &calib(),
            2,
            &KnowledgeConfig::default(),
        )
        .unwrap();
        assert_eq!(report.layers.len(), 2);
        for lr in &report.layers {
            assert!(lr.distinct_experts <= 4);
            assert!(lr.knowledge_means.is_some());
            assert!(!lr.cores.is_empty());
        }
        let out = model.forward(&calib()[0], false).unwrap();
        assert!(out.logits.data().iter().all(|v| v.is_finite()));
    }

    #[test]
    fn report_round_trips_through_json() {
        let mut model = MoeModel::synthetic(model_config(), Some(19));
        let mut g = grouper();
        for layer in [0, 1] {
            let state = g.state_mut(layer).unwrap();
            state.usage = vec![0.4, 0.3, 0.2, 0.1];
            state.similarity = similarity_rows();
            g.assign_layer_with_cores(layer, vec![0, 1]).unwrap();
        }
        let report = usage_weighted_merge_all(&mut model, &g).unwrap();
        let text = serde_json::to_string(&report).unwrap();
        let back: MergeReport = serde_json::from_str(&text).unwrap();
        assert_eq!(back.layers.len(), report.layers.len());
        assert_eq!(back.layers[0].labels, report.layers[0].labels);
    }
}
