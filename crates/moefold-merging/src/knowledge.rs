//! Knowledge-guided merges: per-feature score weighting and feature
//! selection.

use tracing::debug;

use crate::average::{bind_group, groups_from_labels};
use crate::error::{Error, Result};
use moefold_core::{Matrix, FP32_EPS};
use moefold_model::{ExpertWeights, MoeLayer};

/// Merge one group with per-feature knowledge weights.
///
/// `scores` holds one row per member, `(members, d_ff)`. Each feature
/// column is normalized to sum 1 across the group, then gate and up rows
/// and down columns are combined feature by feature.
pub fn knowledge_merge_group(
    layer: &mut MoeLayer,
    members: &[usize],
    scores: &Matrix,
) -> Result<()> {
    if members.len() < 2 {
        return Ok(());
    }
    let d_ff = layer.d_ff();
    let d_model = layer.d_model();
    if scores.shape() != (members.len(), d_ff) {
        return Err(Error::config(format!(
            "knowledge scores {:?} for {} members with d_ff {}",
            scores.shape(),
            members.len(),
            d_ff
        )));
    }
    let mut weights = scores.clone();
    for f in 0..d_ff {
        let sum: f32 = (0..members.len()).map(|e| weights.get(e, f)).sum();
        let scale = if sum.abs() < FP32_EPS { 0.0 } else { 1.0 / sum };
        for e in 0..members.len() {
            let v = weights.get(e, f) * scale;
            weights.set(e, f, v);
        }
    }

    let mut gate = Matrix::zeros(d_ff, d_model);
    let mut up = Matrix::zeros(d_ff, d_model);
    let mut down = Matrix::zeros(d_model, d_ff);
    for (mi, &m) in members.iter().enumerate() {
        let e = layer.expert(m);
        for f in 0..d_ff {
            let w = weights.get(mi, f);
            for c in 0..d_model {
                let g = gate.get(f, c) + w * e.gate.get(f, c);
                gate.set(f, c, g);
                let u = up.get(f, c) + w * e.up.get(f, c);
                up.set(f, c, u);
                let d = down.get(c, f) + w * e.down.get(c, f);
                down.set(c, f, d);
            }
        }
    }
    debug!(members = members.len(), "knowledge-weighted merge settled");
    bind_group(layer, members, ExpertWeights::new(gate, down, up)?)?;
    Ok(())
}

/// Merge one group keeping only the features close to the group's best.
///
/// A member contributes feature `f` when `max_s - s_ef <= threshold * max_s`
/// over the group's scores. Contributions are usage-weighted when `usage`
/// is given, uniform otherwise, with an epsilon-stabilized denominator.
pub fn feature_selection_merge_group(
    layer: &mut MoeLayer,
    members: &[usize],
    scores: &Matrix,
    usage: Option<&[f32]>,
    threshold: f32,
) -> Result<()> {
    if members.len() < 2 {
        return Ok(());
    }
    let d_ff = layer.d_ff();
    let d_model = layer.d_model();
    if scores.shape() != (members.len(), d_ff) {
        return Err(Error::config(format!(
            "knowledge scores {:?} for {} members with d_ff {}",
            scores.shape(),
            members.len(),
            d_ff
        )));
    }
    if let Some(u) = usage {
        if u.len() != members.len() {
            return Err(Error::config(format!(
                "{} usage weights for {} members",
                u.len(),
                members.len()
            )));
        }
    }

    let mut gate = Matrix::zeros(d_ff, d_model);
    let mut up = Matrix::zeros(d_ff, d_model);
    let mut down = Matrix::zeros(d_model, d_ff);
    for f in 0..d_ff {
        let max_s = (0..members.len())
            .map(|e| scores.get(e, f))
            .fold(f32::NEG_INFINITY, f32::max);
        let mut total = 0.0f32;
        for (mi, &m) in members.iter().enumerate() {
            if max_s - scores.get(mi, f) > threshold * max_s {
                continue;
            }
            let w = usage.map_or(1.0, |u| u[mi]);
            total += w;
            let e = layer.expert(m);
            for c in 0..d_model {
                let g = gate.get(f, c) + w * e.gate.get(f, c);
                gate.set(f, c, g);
                let u2 = up.get(f, c) + w * e.up.get(f, c);
                up.set(f, c, u2);
                let d = down.get(c, f) + w * e.down.get(c, f);
                down.set(c, f, d);
            }
        }
        let scale = 1.0 / (total + FP32_EPS);
        for c in 0..d_model {
            gate.set(f, c, gate.get(f, c) * scale);
            up.set(f, c, up.get(f, c) * scale);
            down.set(c, f, down.get(c, f) * scale);
        }
    }
    debug!(members = members.len(), threshold, "feature-selection merge settled");
    bind_group(layer, members, ExpertWeights::new(gate, down, up)?)?;
    Ok(())
}

/// Knowledge-weighted merge over a whole layer's labeling.
pub fn knowledge_merge_layer(
    layer: &mut MoeLayer,
    labels: &[usize],
    knowledge: &Matrix,
) -> Result<()> {
    for (label, members) in groups_from_labels(labels).iter().enumerate() {
        if members.is_empty() {
            return Err(Error::EmptyGroup { label });
        }
        if members.len() < 2 {
            continue;
        }
        let group_scores = knowledge.take_rows(members);
        knowledge_merge_group(layer, members, &group_scores)?;
    }
    Ok(())
}
