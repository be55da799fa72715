//! Per-layer grouping state and the group assignment engines.

use std::collections::BTreeMap;

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use tracing::{debug, info};

use crate::config::GrouperConfig;
use crate::error::{Error, Result};
use moefold_core::{ops, Matrix};
use moefold_model::ModelConfig;

/// Similarity sentinel written when a member is evicted from a group, so the
/// pair can never be re-selected.
pub const EVICTION_SENTINEL: f32 = -100.0;

/// All grouping state for one MoE layer.
#[derive(Debug, Clone)]
pub struct LayerState {
    /// Group label per expert slot.
    pub labels: Vec<usize>,
    /// Symmetric expert similarity, unit diagonal. Destructively updated by
    /// capacity eviction.
    pub similarity: Matrix,
    /// Per-expert usage scores.
    pub usage: Vec<f32>,
    /// Per-expert per-feature knowledge scores, when computed.
    pub knowledge: Option<Matrix>,
    /// Core (dominant) expert per group, indexed by label.
    pub cores: Vec<usize>,
}

impl LayerState {
    fn new(num_experts: usize) -> Self {
        Self {
            labels: (0..num_experts).collect(),
            similarity: Matrix::eye(num_experts),
            usage: vec![0.0; num_experts],
            knowledge: None,
            cores: Vec::new(),
        }
    }

    /// Per-expert scalar knowledge score: the feature mean.
    pub fn knowledge_means(&self) -> Option<Vec<f32>> {
        let k = self.knowledge.as_ref()?;
        let inv = 1.0 / k.cols() as f32;
        Some((0..k.rows()).map(|e| k.row(e).iter().sum::<f32>() * inv).collect())
    }
}

/// Orchestrator for similarity, usage, knowledge and group assignment.
pub struct Grouper {
    pub config: GrouperConfig,
    pub(crate) model_config: ModelConfig,
    states: BTreeMap<usize, LayerState>,
}

impl Grouper {
    pub fn new(model_config: ModelConfig, config: GrouperConfig) -> Result<Self> {
        config.validate()?;
        if config.start_layer >= model_config.num_layers {
            return Err(Error::config(format!(
                "start_layer {} outside model with {} layers",
                config.start_layer, model_config.num_layers
            )));
        }
        let states = (config.start_layer..model_config.num_layers)
            .map(|l| (l, LayerState::new(model_config.num_experts)))
            .collect();
        Ok(Self {
            config,
            model_config,
            states,
        })
    }

    pub fn num_experts(&self) -> usize {
        self.model_config.num_experts
    }

    /// Layers subject to grouping, in order.
    pub fn eligible_layers(&self) -> Vec<usize> {
        self.states.keys().copied().collect()
    }

    pub fn state(&self, layer: usize) -> Result<&LayerState> {
        self.states.get(&layer).ok_or(Error::MissingState { layer })
    }

    pub fn state_mut(&mut self, layer: usize) -> Result<&mut LayerState> {
        self.states
            .get_mut(&layer)
            .ok_or(Error::MissingState { layer })
    }

    /// Reset every layer to the identity baseline.
    pub fn reset_all(&mut self) {
        let n = self.model_config.num_experts;
        for state in self.states.values_mut() {
            *state = LayerState::new(n);
        }
    }

    pub(crate) fn rng(&self) -> StdRng {
        match self.config.seed {
            Some(s) => StdRng::seed_from_u64(s),
            None => StdRng::from_entropy(),
        }
    }

    /// Group members per label for one layer.
    pub fn groups_of(&self, layer: usize) -> Result<Vec<Vec<usize>>> {
        let state = self.state(layer)?;
        let num_groups = state.labels.iter().copied().max().map_or(0, |m| m + 1);
        let mut groups = vec![Vec::new(); num_groups];
        for (slot, &label) in state.labels.iter().enumerate() {
            groups[label].push(slot);
        }
        Ok(groups)
    }

    /// Expert indices of one layer ranked by descending usage.
    pub fn rank_by_usage(&self, layer: usize) -> Result<Vec<usize>> {
        Ok(ops::argsort_desc(&self.state(layer)?.usage))
    }

    /// Expert indices ranked by descending mean knowledge score.
    pub fn rank_by_knowledge(&self, layer: usize) -> Result<Vec<usize>> {
        let state = self.state(layer)?;
        let means = state
            .knowledge_means()
            .ok_or(Error::MissingState { layer })?;
        Ok(ops::argsort_desc(&means))
    }

    /// Apportion per-layer group counts from a global target average.
    ///
    /// Pools all eligible layers' usage scores, sorts them descending and
    /// takes the value at rank `num_average_groups * num_layers` as the
    /// threshold; each layer keeps one group per score at or above it. When
    /// the target equals the expert count one slot is held back.
    pub fn assign_num_groups_per_layer(
        &self,
        num_average_groups: usize,
    ) -> Result<BTreeMap<usize, usize>> {
        let layers = self.eligible_layers();
        let mut total = num_average_groups * layers.len();
        if num_average_groups == self.num_experts() {
            total = total.saturating_sub(1);
        }
        let mut pooled = Vec::with_capacity(self.num_experts() * layers.len());
        for &l in &layers {
            pooled.extend_from_slice(&self.state(l)?.usage);
        }
        if pooled.is_empty() {
            return Err(Error::config("no eligible layers to apportion"));
        }
        pooled.sort_by(|a, b| b.partial_cmp(a).unwrap_or(std::cmp::Ordering::Equal));
        let threshold = pooled[total.min(pooled.len() - 1)];
        debug!(threshold, "group apportioning threshold");

        let mut counts = BTreeMap::new();
        for &l in &layers {
            let count = self
                .state(l)?
                .usage
                .iter()
                .filter(|&&u| u >= threshold)
                .count()
                .clamp(1, self.num_experts());
            counts.insert(l, count);
        }
        Ok(counts)
    }

    /// Global dominant-anchored assignment.
    ///
    /// Per-layer group counts come from [`assign_num_groups_per_layer`]; each
    /// layer's top experts by usage become cores labeled in rank order, and
    /// every remaining expert joins the core it is most similar to, subject
    /// to the capacity limit. Returns the cores per layer.
    ///
    /// [`assign_num_groups_per_layer`]: Grouper::assign_num_groups_per_layer
    pub fn group_globally_from_dominant(
        &mut self,
        num_average_groups: usize,
    ) -> Result<BTreeMap<usize, Vec<usize>>> {
        let counts = self.assign_num_groups_per_layer(num_average_groups)?;
        let mut all_cores = BTreeMap::new();
        for (layer, num_groups) in counts {
            let ranked = self.rank_by_usage(layer)?;
            let cores: Vec<usize> = ranked[..num_groups].to_vec();
            self.assign_layer_with_cores(layer, cores.clone())?;
            all_cores.insert(layer, cores);
        }
        info!(
            layers = all_cores.len(),
            "globally grouped experts from dominant cores"
        );
        Ok(all_cores)
    }

    /// Per-layer top-`num_groups` by usage as cores; the rest follow argmax
    /// similarity without a capacity limit.
    pub fn group_layerwise_by_usage(
        &mut self,
        num_groups: usize,
    ) -> Result<BTreeMap<usize, Vec<usize>>> {
        let mut all_cores = BTreeMap::new();
        for layer in self.eligible_layers() {
            let ranked = self.rank_by_usage(layer)?;
            let cores: Vec<usize> = ranked[..num_groups.min(ranked.len())].to_vec();
            let state = self.state_mut(layer)?;
            for (g, &c) in cores.iter().enumerate() {
                state.labels[c] = g;
            }
            for i in 0..state.labels.len() {
                if cores.contains(&i) {
                    continue;
                }
                let best = Self::most_similar_core(&state.similarity, i, &cores);
                state.labels[i] = state.labels[cores[best]];
            }
            state.cores = cores.clone();
            all_cores.insert(layer, cores);
        }
        Ok(all_cores)
    }

    /// Seeded random baseline; every group keeps at least one member.
    pub fn group_randomly(&mut self, num_groups: usize) -> Result<()> {
        if num_groups == 0 || num_groups > self.num_experts() {
            return Err(Error::config(format!(
                "cannot split {} experts into {num_groups} random groups",
                self.num_experts()
            )));
        }
        let mut rng = self.rng();
        for layer in self.eligible_layers() {
            let mut labels: Vec<usize> =
                (0..self.num_experts()).map(|i| i % num_groups).collect();
            labels.shuffle(&mut rng);
            let state = self.state_mut(layer)?;
            state.labels = labels;
            state.cores.clear();
        }
        Ok(())
    }

    /// Install `cores` for one layer and assign all other experts by argmax
    /// similarity, evicting on capacity overflow.
    pub fn assign_layer_with_cores(&mut self, layer: usize, cores: Vec<usize>) -> Result<()> {
        let num_experts = self.num_experts();
        let group_limit = self.config.group_limit;
        let state = self.state_mut(layer)?;
        let num_groups = cores.len();
        if num_groups == 0 {
            return Err(Error::config("assignment needs at least one core"));
        }

        let mut member_count = vec![0usize; num_groups];
        let mut members: Vec<Vec<usize>> = vec![Vec::new(); num_groups];
        for (g, &c) in cores.iter().enumerate() {
            state.labels[c] = g;
            member_count[g] += 1;
            members[g].push(c);
        }

        for i in 0..num_experts {
            if cores.contains(&i) {
                continue;
            }
            let best = Self::most_similar_core(&state.similarity, i, &cores);
            let mut label = state.labels[cores[best]];
            state.labels[i] = label;
            member_count[label] += 1;
            members[label].push(i);
            debug!(layer, expert = i, group = label, "assigned to most similar core");

            if member_count[label] > group_limit {
                if num_groups == 1 && group_limit < num_experts {
                    return Err(Error::GroupTooSmall { layer, group_limit });
                }
                let mut rounds = 0usize;
                while member_count[label] > group_limit {
                    rounds += 1;
                    if rounds > num_experts * num_experts {
                        return Err(Error::AssignmentDiverged { layer });
                    }
                    let core = cores[label];
                    let sims: Vec<f32> = members[label]
                        .iter()
                        .map(|&m| state.similarity.get(core, m))
                        .collect();
                    let pos = forced_eviction_index(ops::argmin(&sims));
                    let evicted = members[label][pos];
                    member_count[label] -= 1;
                    members[label].retain(|&m| m != evicted);
                    state.similarity.set(evicted, core, EVICTION_SENTINEL);
                    state.similarity.set(core, evicted, EVICTION_SENTINEL);
                    debug!(layer, expert = evicted, group = label, "evicted over capacity");

                    let next = Self::most_similar_core(&state.similarity, evicted, &cores);
                    label = state.labels[cores[next]];
                    state.labels[evicted] = label;
                    member_count[label] += 1;
                    members[label].push(evicted);
                    debug!(layer, expert = evicted, group = label, "reassigned");
                }
            }
        }
        state.cores = cores;
        Ok(())
    }

    fn most_similar_core(similarity: &Matrix, expert: usize, cores: &[usize]) -> usize {
        let sims: Vec<f32> = cores.iter().map(|&c| similarity.get(expert, c)).collect();
        ops::argmax(&sims)
    }
}

/// Eviction position tie-break: when the least similar member is the
/// group's first entry (the core), the second entry is evicted instead.
/// The core must never leave its own group.
fn forced_eviction_index(pos: usize) -> usize {
    if pos == 0 {
        1
    } else {
        pos
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GrouperConfig;

    fn model_config(num_experts: usize, num_layers: usize) -> ModelConfig {
        ModelConfig {
            vocab_size: 16,
            d_model: 8,
            d_ff: 16,
            num_experts,
            num_layers,
            top_k: 2,
        }
    }

    fn grouper(num_experts: usize, group_limit: usize) -> Grouper {
        let cfg = GrouperConfig {
            group_limit,
            seed: Some(0),
            ..GrouperConfig::default()
        };
        Grouper::new(model_config(num_experts, 1), cfg).unwrap()
    }

    fn set_similarity(g: &mut Grouper, layer: usize, rows: &[&[f32]]) {
        let n = rows.len();
        let m = Matrix::from_rows(&rows.iter().map(|r| r.to_vec()).collect::<Vec<_>>()).unwrap();
        assert_eq!(m.shape(), (n, n));
        g.state_mut(layer).unwrap().similarity = m;
    }

    #[test]
    fn four_expert_dominant_assignment() {
        let mut g = grouper(4, 4);
        g.state_mut(0).unwrap().usage = vec![0.4, 0.3, 0.2, 0.1];
        // expert 2 closer to core 0, expert 3 closer to core 1
        set_similarity(
            &mut g,
            0,
            &[
                &[1.0, 0.5, 0.9, 0.2],
                &[0.5, 1.0, 0.3, 0.8],
                &[0.9, 0.3, 1.0, 0.4],
                &[0.2, 0.8, 0.4, 1.0],
            ],
        );
        let ranked = g.rank_by_usage(0).unwrap();
        let cores: Vec<usize> = ranked[..2].to_vec();
        assert_eq!(cores, vec![0, 1]);
        g.assign_layer_with_cores(0, cores).unwrap();
        let labels = g.state(0).unwrap().labels.clone();
        assert_eq!(labels.len(), 4);
        assert_eq!(labels[0], 0);
        assert_eq!(labels[1], 1);
        assert_eq!(labels[2], 0);
        assert_eq!(labels[3], 1);
        let mut unique = labels;
        unique.sort_unstable();
        unique.dedup();
        assert_eq!(unique.len(), 2);
    }

    #[test]
    fn assignment_is_idempotent() {
        let mut g = grouper(4, 4);
        g.state_mut(0).unwrap().usage = vec![0.4, 0.3, 0.2, 0.1];
        set_similarity(
            &mut g,
            0,
            &[
                &[1.0, 0.5, 0.9, 0.2],
                &[0.5, 1.0, 0.3, 0.8],
                &[0.9, 0.3, 1.0, 0.4],
                &[0.2, 0.8, 0.4, 1.0],
            ],
        );
        g.group_layerwise_by_usage(2).unwrap();
        let first = g.state(0).unwrap().labels.clone();
        g.group_layerwise_by_usage(2).unwrap();
        assert_eq!(first, g.state(0).unwrap().labels);
    }

    #[test]
    fn single_core_with_small_limit_is_fatal() {
        let mut g = grouper(5, 2);
        g.state_mut(0).unwrap().usage = vec![0.6, 0.1, 0.1, 0.1, 0.1];
        let err = g.assign_layer_with_cores(0, vec![0]).unwrap_err();
        assert!(matches!(err, Error::GroupTooSmall { layer: 0, group_limit: 2 }));
    }

    #[test]
    fn eviction_reassigns_and_writes_sentinel() {
        let mut g = grouper(5, 2);
        // cores 0 and 1; experts 2..4 all prefer core 0
        set_similarity(
            &mut g,
            0,
            &[
                &[1.0, 0.1, 0.9, 0.8, 0.7],
                &[0.1, 1.0, 0.2, 0.3, 0.4],
                &[0.9, 0.2, 1.0, 0.0, 0.0],
                &[0.8, 0.3, 0.0, 1.0, 0.0],
                &[0.7, 0.4, 0.0, 0.0, 1.0],
            ],
        );
        g.assign_layer_with_cores(0, vec![0, 1]).unwrap();
        let state = g.state(0).unwrap();
        let mut counts = vec![0usize; 2];
        for &l in &state.labels {
            counts[l] += 1;
        }
        assert!(counts.iter().all(|&c| c <= 2), "counts {counts:?}");
        // someone was evicted from group 0 and carries the sentinel
        let sentinels = (2..5)
            .filter(|&e| state.similarity.get(0, e) == EVICTION_SENTINEL)
            .count();
        assert!(sentinels >= 1);
    }

    #[test]
    fn core_argmin_eviction_skips_the_core() {
        // KL-stored similarities can exceed the core's self-similarity of
        // 1.0, making the core the argmin of its own group
        let mut g = grouper(4, 2);
        set_similarity(
            &mut g,
            0,
            &[
                &[1.0, 2.0, 3.0, 0.2],
                &[2.0, 1.0, 0.0, 0.5],
                &[3.0, 0.0, 1.0, 0.1],
                &[0.2, 0.5, 0.1, 1.0],
            ],
        );
        g.assign_layer_with_cores(0, vec![0, 3]).unwrap();
        let state = g.state(0).unwrap();
        // the second entry (expert 1) is evicted instead of the core
        assert_eq!(state.labels, vec![0, 1, 0, 1]);
        assert_eq!(state.similarity.get(0, 1), EVICTION_SENTINEL);
        assert_eq!(state.similarity.get(1, 0), EVICTION_SENTINEL);
    }

    #[test]
    fn forced_eviction_index_spares_position_zero() {
        assert_eq!(forced_eviction_index(0), 1);
        assert_eq!(forced_eviction_index(2), 2);
    }

    #[test]
    fn apportioning_reserves_one_slot_at_full_average() {
        let cfg = GrouperConfig {
            seed: Some(0),
            ..GrouperConfig::default()
        };
        let mut g = Grouper::new(model_config(4, 2), cfg).unwrap();
        for layer in [0, 1] {
            g.state_mut(layer).unwrap().usage = vec![0.4, 0.3, 0.2, 0.1];
        }
        let counts = g.assign_num_groups_per_layer(4).unwrap();
        let total: usize = counts.values().sum();
        // pooled rank 4*2-1 points at the smallest score, so every expert
        // stays above threshold; the reserve only trims the pooled target
        assert!(total <= 8);
        assert!(counts.values().all(|&c| (1..=4).contains(&c)));
    }

    #[test]
    fn random_groups_are_nonempty_and_seeded() {
        let mut g = grouper(6, 6);
        g.group_randomly(3).unwrap();
        let labels = g.state(0).unwrap().labels.clone();
        for wanted in 0..3 {
            assert!(labels.iter().any(|&l| l == wanted));
        }
        let mut g2 = grouper(6, 6);
        g2.group_randomly(3).unwrap();
        assert_eq!(labels, g2.state(0).unwrap().labels);
    }

    #[test]
    fn reset_restores_identity_baseline() {
        let mut g = grouper(4, 4);
        g.state_mut(0).unwrap().usage = vec![0.4, 0.3, 0.2, 0.1];
        g.group_globally_from_dominant(2).unwrap();
        g.reset_all();
        let state = g.state(0).unwrap();
        assert_eq!(state.labels, vec![0, 1, 2, 3]);
        assert_eq!(state.similarity, Matrix::eye(4));
        assert!(state.cores.is_empty());
    }
}
