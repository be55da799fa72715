//! Weighted-average merges over expert weight blocks.

use tracing::debug;

use crate::error::{Error, Result};
use moefold_core::{Matrix, FP32_EPS};
use moefold_model::{ExpertWeights, MoeLayer};

/// Fixed core/non-core weights for the two-level average.
#[derive(Debug, Clone, Copy)]
pub struct FixedWeights {
    pub core: f32,
    pub non_core: f32,
}

/// Group members per label, lowest slot first.
pub(crate) fn groups_from_labels(labels: &[usize]) -> Vec<Vec<usize>> {
    let num_groups = labels.iter().copied().max().map_or(0, |m| m + 1);
    let mut groups = vec![Vec::new(); num_groups];
    for (slot, &label) in labels.iter().enumerate() {
        groups[label].push(slot);
    }
    groups
}

/// Scalar-weighted sum of the members' weight blocks, denominator
/// epsilon-stabilized.
pub(crate) fn weighted_expert(
    layer: &MoeLayer,
    members: &[usize],
    weights: &[f32],
) -> Result<ExpertWeights> {
    let total: f32 = weights.iter().sum::<f32>() + FP32_EPS;
    let first = layer.expert(members[0]);
    let mut gate = Matrix::zeros(first.d_ff(), first.d_model());
    let mut down = Matrix::zeros(first.d_model(), first.d_ff());
    let mut up = Matrix::zeros(first.d_ff(), first.d_model());
    for (&m, &w) in members.iter().zip(weights) {
        let e = layer.expert(m);
        gate.add_assign(&e.gate.scale(w))?;
        down.add_assign(&e.down.scale(w))?;
        up.add_assign(&e.up.scale(w))?;
    }
    let inv = 1.0 / total;
    gate.scale_in_place(inv);
    down.scale_in_place(inv);
    up.scale_in_place(inv);
    Ok(ExpertWeights::new(gate, down, up)?)
}

/// Install `merged` on the group's first member and alias the rest to it.
pub(crate) fn bind_group(
    layer: &mut MoeLayer,
    members: &[usize],
    merged: ExpertWeights,
) -> Result<()> {
    let owner = members[0];
    layer.set_expert(owner, merged)?;
    for &m in &members[1..] {
        layer.alias(m, owner)?;
    }
    Ok(())
}

fn merge_groups_with(
    layer: &mut MoeLayer,
    labels: &[usize],
    mut weight_of: impl FnMut(usize) -> f32,
) -> Result<()> {
    for (label, members) in groups_from_labels(labels).iter().enumerate() {
        if members.is_empty() {
            return Err(Error::EmptyGroup { label });
        }
        if members.len() == 1 {
            continue;
        }
        let weights: Vec<f32> = members.iter().map(|&m| weight_of(m)).collect();
        let merged = weighted_expert(layer, members, &weights)?;
        bind_group(layer, members, merged)?;
        debug!(label, members = members.len(), "merged group by weighted average");
    }
    Ok(())
}

/// Usage-frequency-weighted merge: each group collapses to
/// `sum(u_e * W_e) / (sum(u_e) + eps)`, singletons untouched.
pub fn merge_layer_by_usage(layer: &mut MoeLayer, labels: &[usize], usage: &[f32]) -> Result<()> {
    if usage.len() != labels.len() {
        return Err(Error::config(format!(
            "{} usage scores for {} experts",
            usage.len(),
            labels.len()
        )));
    }
    merge_groups_with(layer, labels, |m| usage[m])
}

/// Uniform-weight variant of [`merge_layer_by_usage`].
pub fn merge_layer_average(layer: &mut MoeLayer, labels: &[usize]) -> Result<()> {
    merge_groups_with(layer, labels, |_| 1.0)
}

/// Two-level average with fixed core and non-core weights.
pub fn merge_layer_fixed(
    layer: &mut MoeLayer,
    labels: &[usize],
    cores: &[usize],
    weights: FixedWeights,
) -> Result<()> {
    merge_groups_with(layer, labels, |m| {
        if cores.contains(&m) {
            weights.core
        } else {
            weights.non_core
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use moefold_model::Router;

    fn layer(num_experts: usize) -> MoeLayer {
        let d_model = 4;
        let d_ff = 6;
        let router = Router::new(Matrix::from_fn(num_experts, d_model, |r, c| {
            ((r * 3 + c) % 7) as f32 * 0.1 - 0.3
        }));
        let experts = (0..num_experts)
            .map(|e| {
                ExpertWeights::new(
                    Matrix::from_fn(d_ff, d_model, |r, c| (e + r + c) as f32 * 0.1),
                    Matrix::from_fn(d_model, d_ff, |r, c| (e * 2 + r) as f32 * 0.1 - c as f32 * 0.05),
                    Matrix::from_fn(d_ff, d_model, |r, c| (e as f32 - r as f32) * 0.1 + c as f32 * 0.02),
                )
                .unwrap()
            })
            .collect();
        MoeLayer::new(router, experts, 2).unwrap()
    }

    #[test]
    fn singleton_groups_stay_bit_identical() {
        let mut l = layer(3);
        let before: Vec<ExpertWeights> = (0..3).map(|e| l.expert(e).clone()).collect();
        merge_layer_by_usage(&mut l, &[0, 1, 2], &[0.5, 0.3, 0.2]).unwrap();
        for e in 0..3 {
            assert_eq!(l.expert(e), &before[e]);
        }
        assert_eq!(l.distinct_experts(), 3);
    }

    #[test]
    fn equal_weight_pair_is_elementwise_mean() {
        let mut l = layer(2);
        let a = l.expert(0).clone();
        let b = l.expert(1).clone();
        merge_layer_by_usage(&mut l, &[0, 0], &[0.5, 0.5]).unwrap();
        let merged = l.expert(0);
        for (i, &v) in merged.gate.data().iter().enumerate() {
            let want = (a.gate.data()[i] + b.gate.data()[i]) / 2.0;
            assert!((v - want).abs() < 1e-5);
        }
        for (i, &v) in merged.down.data().iter().enumerate() {
            let want = (a.down.data()[i] + b.down.data()[i]) / 2.0;
            assert!((v - want).abs() < 1e-5);
        }
        assert_eq!(l.distinct_experts(), 1);
        assert_eq!(l.expert(1), l.expert(0));
    }

    #[test]
    fn usage_weights_bias_toward_heavy_expert() {
        let mut l = layer(2);
        let a = l.expert(0).clone();
        merge_layer_by_usage(&mut l, &[0, 0], &[1.0, 0.0]).unwrap();
        for (v, w) in l.expert(0).gate.data().iter().zip(a.gate.data()) {
            assert!((v - w).abs() < 1e-4);
        }
    }

    #[test]
    fn fixed_weights_distinguish_core() {
        let mut l = layer(3);
        let core = l.expert(0).clone();
        merge_layer_fixed(
            &mut l,
            &[0, 0, 0],
            &[0],
            FixedWeights {
                core: 1.0,
                non_core: 0.0,
            },
        )
        .unwrap();
        for (v, w) in l.expert(2).up.data().iter().zip(core.up.data()) {
            assert!((v - w).abs() < 1e-4);
        }
        assert_eq!(l.distinct_experts(), 1);
    }

    #[test]
    fn usage_length_mismatch_is_an_error() {
        let mut l = layer(2);
        assert!(merge_layer_by_usage(&mut l, &[0, 0], &[1.0]).is_err());
    }
}
