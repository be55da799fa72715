//! Dominant-anchored merging: the group core's units stay fixed and every
//! other member's units are folded onto them.

use tracing::debug;

use crate::average::bind_group;
use crate::error::{Error, Result};
use crate::zip::{member_activations, member_weight_features, Ingredient};
use moefold_core::{correlation, ops, pinv, Matrix, FP32_EPS};
use moefold_model::{ExpertWeights, MoeLayer};

/// How non-dominant units are matched to the anchor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DominantRule {
    /// Each anchor unit picks its argmax-correlated partner per member.
    Independent,
    /// Every member unit is assigned to its argmax anchor unit.
    SameRule,
    /// Capacity-balanced k-means over unit features.
    Cluster,
}

/// Normalize each row to sum 1, epsilon-stabilized.
fn row_normalize(m: &Matrix) -> Matrix {
    let mut out = m.clone();
    for r in 0..out.rows() {
        let sum: f32 = out.row(r).iter().sum();
        let scale = if sum.abs() < FP32_EPS { 0.0 } else { 1.0 / sum };
        for v in out.row_mut(r).iter_mut() {
            *v *= scale;
        }
    }
    out
}

/// Members reordered so the core comes first, with coefficients to match.
fn order_with_core(
    core: usize,
    members: &[usize],
    input_weight: Option<&[f32]>,
) -> Result<(Vec<usize>, Vec<f32>, bool)> {
    if !members.contains(&core) {
        return Err(Error::config(format!(
            "core {core} is not a member of its group"
        )));
    }
    let mut ordered = vec![core];
    let mut coef = Vec::with_capacity(members.len());
    let weighted = input_weight.is_some();
    match input_weight {
        Some(w) => {
            if w.len() != members.len() {
                return Err(Error::config(format!(
                    "{} input weights for {} members",
                    w.len(),
                    members.len()
                )));
            }
            let core_pos = members.iter().position(|&m| m == core).unwrap_or(0);
            coef.push(w[core_pos]);
            for (&m, &v) in members.iter().zip(w) {
                if m != core {
                    ordered.push(m);
                    coef.push(v);
                }
            }
        }
        None => {
            for &m in members {
                if m != core {
                    ordered.push(m);
                }
            }
            coef = vec![1.0; members.len()];
        }
    }
    Ok((ordered, coef, weighted))
}

fn concat_blocks(layer: &MoeLayer, ordered: &[usize]) -> Result<(Matrix, Matrix, Matrix)> {
    let gates: Vec<&Matrix> = ordered.iter().map(|&m| &layer.expert(m).gate).collect();
    let ups: Vec<&Matrix> = ordered.iter().map(|&m| &layer.expert(m).up).collect();
    let downs: Vec<&Matrix> = ordered.iter().map(|&m| &layer.expert(m).down).collect();
    Ok((
        Matrix::vstack(&gates)?,
        Matrix::vstack(&ups)?,
        Matrix::hstack(&downs)?,
    ))
}

fn hidden_with(input: &Matrix, gate: &Matrix, up: &Matrix) -> Result<Matrix> {
    let u = input.matmul_transpose(gate)?;
    let v = input.matmul_transpose(up)?;
    let mut h = u;
    for (hv, &vv) in h.data_mut().iter_mut().zip(v.data()) {
        *hv = ops::silu(*hv) * vv;
    }
    Ok(h)
}

/// Per-member feature matrices for the same-rule correlation, keyed by
/// ingredient. The pair holds activation and weight features; unused slots
/// stay `None`.
fn member_features(
    layer: &MoeLayer,
    member: usize,
    input: &Matrix,
    ingredient: Ingredient,
) -> Result<(Option<Matrix>, Option<Matrix>)> {
    let act = if ingredient != Ingredient::Weight {
        if input.rows() < 2 {
            return Err(Error::NoActivations { expert: member });
        }
        Some(layer.expert(member).hidden(input)?)
    } else {
        None
    };
    let weight = if ingredient != Ingredient::Activation {
        Some(member_weight_features(layer, &[member]))
    } else {
        None
    };
    Ok((act, weight))
}

fn feature_correlation(
    a: &(Option<Matrix>, Option<Matrix>),
    b: &(Option<Matrix>, Option<Matrix>),
) -> Result<Matrix> {
    let mut corr: Option<Matrix> = None;
    if let (Some(x), Some(y)) = (&a.0, &b.0) {
        corr = Some(correlation(x, y)?);
    }
    if let (Some(x), Some(y)) = (&a.1, &b.1) {
        let c = correlation(x, y)?;
        corr = Some(match corr {
            Some(mut acc) => {
                acc.add_assign(&c)?;
                acc
            }
            None => c,
        });
    }
    corr.ok_or_else(|| Error::config("no features for correlation"))
}

/// Fold every member onto the core with the configured matching rule.
pub fn dominant_merge_group(
    layer: &mut MoeLayer,
    label: usize,
    core: usize,
    members: &[usize],
    input: &Matrix,
    input_weight: Option<&[f32]>,
    ingredient: Ingredient,
    rule: DominantRule,
    ridge: f32,
) -> Result<()> {
    if members.len() < 2 {
        return Ok(());
    }
    let (ordered, coef, weighted) = order_with_core(core, members, input_weight)?;
    let merged = match rule {
        DominantRule::Independent => {
            merge_independent(layer, &ordered, &coef, weighted, input, ridge)?
        }
        DominantRule::SameRule => merge_same_rule(layer, &ordered, &coef, input, ingredient)?,
        DominantRule::Cluster => merge_cluster(layer, &ordered, input)?,
    };
    debug!(label, core, members = members.len(), ?rule, "dominant merge settled");
    let mut bound = vec![core];
    bound.extend(members.iter().copied().filter(|&m| m != core));
    bind_group(layer, &bound, merged)?;
    Ok(())
}

fn merge_independent(
    layer: &MoeLayer,
    ordered: &[usize],
    coef: &[f32],
    weighted: bool,
    input: &Matrix,
    ridge: f32,
) -> Result<ExpertWeights> {
    if input.rows() < 2 {
        return Err(Error::NoActivations { expert: ordered[0] });
    }
    let d_ff = layer.d_ff();
    let d_model = layer.d_model();
    let num = ordered.len();
    let units = num * d_ff;

    // first stage: match anchor units against each member's hidden units
    let h_dom = layer.expert(ordered[0]).hidden(input)?;
    let mut p1 = Matrix::zeros(d_ff, units);
    for i in 0..d_ff {
        p1.set(i, i, coef[0]);
    }
    for (jj, &m) in ordered.iter().enumerate().skip(1) {
        let h_j = layer.expert(m).hidden(input)?;
        let corr = correlation(&h_dom, &h_j)?;
        for i in 0..d_ff {
            let partner = ops::argmax(corr.row(i));
            p1.set(i, jj * d_ff + partner, coef[jj]);
        }
    }
    let p1n = row_normalize(&p1);
    let unmerge1 = if weighted {
        pinv(&p1n, ridge)?.transpose()
    } else {
        p1
    };

    let gates: Vec<&Matrix> = ordered.iter().map(|&m| &layer.expert(m).gate).collect();
    let ups: Vec<&Matrix> = ordered.iter().map(|&m| &layer.expert(m).up).collect();
    let gate_final = p1n.matmul(&Matrix::vstack(&gates)?)?;
    let up_final = p1n.matmul(&Matrix::vstack(&ups)?)?;

    // second stage: match output dimensions over regenerated activations
    let new_h = hidden_with(input, &gate_final, &up_final)?;
    let act_dom = new_h.matmul_transpose(&layer.expert(ordered[0]).down)?;
    let mut p2 = Matrix::zeros(d_model, num * d_model);
    for i in 0..d_model {
        p2.set(i, i, coef[0]);
    }
    for (jj, &m) in ordered.iter().enumerate().skip(1) {
        let act_j = new_h.matmul_transpose(&layer.expert(m).down)?;
        let corr = correlation(&act_dom, &act_j)?;
        for i in 0..d_model {
            let partner = ops::argmax(corr.row(i));
            p2.set(i, jj * d_model + partner, coef[jj]);
        }
    }
    let p2n = row_normalize(&p2);

    let mut down_final = Matrix::zeros(d_model, d_ff);
    for (jj, &m) in ordered.iter().enumerate() {
        let out_block: Vec<usize> = (jj * d_model..(jj + 1) * d_model).collect();
        let ff_block: Vec<usize> = (jj * d_ff..(jj + 1) * d_ff).collect();
        let inner = layer
            .expert(m)
            .down
            .matmul(&unmerge1.take_cols(&ff_block))?;
        down_final.add_assign(&p2n.take_cols(&out_block).matmul(&inner)?)?;
    }
    Ok(ExpertWeights::new(gate_final, down_final, up_final)?)
}

fn merge_same_rule(
    layer: &MoeLayer,
    ordered: &[usize],
    coef: &[f32],
    input: &Matrix,
    ingredient: Ingredient,
) -> Result<ExpertWeights> {
    let d_ff = layer.d_ff();
    let num = ordered.len();
    let units = num * d_ff;

    let feat_dom = member_features(layer, ordered[0], input, ingredient)?;
    let mut p = Matrix::zeros(d_ff, units);
    for i in 0..d_ff {
        p.set(i, i, coef[0]);
    }
    for (jj, &m) in ordered.iter().enumerate().skip(1) {
        let feat_j = member_features(layer, m, input, ingredient)?;
        let corr = feature_correlation(&feat_dom, &feat_j)?;
        for c in 0..d_ff {
            let anchor = ops::argmax(&corr.col(c));
            p.set(anchor, jj * d_ff + c, coef[jj]);
        }
    }
    let pn = row_normalize(&p);
    build_from_row_map(layer, ordered, &pn)
}

fn merge_cluster(layer: &MoeLayer, ordered: &[usize], input: &Matrix) -> Result<ExpertWeights> {
    if input.rows() < 2 {
        return Err(Error::NoActivations { expert: ordered[0] });
    }
    let d_ff = layer.d_ff();
    let num = ordered.len();
    let units = num * d_ff;

    // unit features: each unit's activation trace over the shared input
    let acts = member_activations(layer, ordered, input)?.transpose();
    let mut centers = acts.take_rows(&(0..d_ff).collect::<Vec<_>>());
    let mut assignments = vec![0usize; units];

    for _ in 0..100 {
        for u in 0..units {
            let mut best = (0usize, f32::INFINITY);
            for c in 0..d_ff {
                let d = ops::mse_sum(acts.row(u), centers.row(c));
                if d < best.1 {
                    best = (c, d);
                }
            }
            assignments[u] = best.0;
        }
        // every cluster keeps at least one unit; overfull clusters shed one
        let mut counts = vec![0usize; d_ff];
        for &a in &assignments {
            counts[a] += 1;
        }
        for i in 0..d_ff {
            if counts[i] >= 1 {
                continue;
            }
            for j in 0..d_ff {
                if j != i && counts[j] > num {
                    if let Some(moved) = assignments.iter().position(|&a| a == j) {
                        assignments[moved] = i;
                        counts[j] -= 1;
                        counts[i] += 1;
                        break;
                    }
                }
            }
        }
        let mut new_centers = centers.clone();
        for c in 0..d_ff {
            let members: Vec<usize> =
                (0..units).filter(|&u| assignments[u] == c).collect();
            if members.is_empty() {
                continue;
            }
            let mut mean = vec![0.0f32; acts.cols()];
            for &u in &members {
                for (acc, &v) in mean.iter_mut().zip(acts.row(u)) {
                    *acc += v;
                }
            }
            let inv = 1.0 / members.len() as f32;
            for v in &mut mean {
                *v *= inv;
            }
            new_centers.row_mut(c).copy_from_slice(&mean);
        }
        let max_diff = centers
            .data()
            .iter()
            .zip(new_centers.data())
            .map(|(&a, &b)| (a - b).abs())
            .fold(0.0f32, f32::max);
        centers = new_centers;
        if max_diff < 1e-4 {
            break;
        }
    }

    let mut p = Matrix::zeros(d_ff, units);
    for (u, &c) in assignments.iter().enumerate() {
        p.set(c, u, 1.0);
    }
    let pn = row_normalize(&p);
    build_from_row_map(layer, ordered, &pn)
}

/// Merged weights from a row-space map `(d_ff, units)`: gate and up through
/// the map, down through its transpose.
fn build_from_row_map(layer: &MoeLayer, ordered: &[usize], p: &Matrix) -> Result<ExpertWeights> {
    let (all_gate, all_up, all_down) = concat_blocks(layer, ordered)?;
    let gate = p.matmul(&all_gate)?;
    let up = p.matmul(&all_up)?;
    let down = all_down.matmul(&p.transpose())?;
    Ok(ExpertWeights::new(gate, down, up)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use moefold_model::Router;

    fn layer(num_experts: usize, d_model: usize, d_ff: usize) -> MoeLayer {
        let router = Router::new(Matrix::from_fn(num_experts, d_model, |r, c| {
            ((r * 5 + c * 2) % 7) as f32 * 0.15 - 0.4
        }));
        let experts = (0..num_experts)
            .map(|e| {
                ExpertWeights::new(
                    Matrix::from_fn(d_ff, d_model, |r, c| {
                        ((e * 11 + r * 7 + c * 3) % 11) as f32 * 0.11 - 0.4
                    }),
                    Matrix::from_fn(d_model, d_ff, |r, c| {
                        ((e * 7 + r * 3 + c * 5) % 11) as f32 * 0.13 - 0.45
                    }),
                    Matrix::from_fn(d_ff, d_model, |r, c| {
                        ((e * 13 + r * 5 + c * 4) % 11) as f32 * 0.09 - 0.4
                    }),
                )
                .unwrap()
            })
            .collect();
        MoeLayer::new(router, experts, 2).unwrap()
    }

    fn input(rows: usize, d_model: usize) -> Matrix {
        Matrix::from_fn(rows, d_model, |r, c| {
            ((r * 17 + c * 5) % 13) as f32 * 0.1 - 0.6
        })
    }

    #[test]
    fn independent_rule_preserves_shapes() {
        let mut l = layer(3, 4, 6);
        let x = input(30, 4);
        dominant_merge_group(
            &mut l,
            0,
            1,
            &[0, 1, 2],
            &x,
            None,
            Ingredient::Activation,
            DominantRule::Independent,
            1e-4,
        )
        .unwrap();
        assert_eq!(l.distinct_experts(), 1);
        assert_eq!(l.representative(0), l.representative(1));
        let e = l.expert(2);
        assert_eq!(e.gate.shape(), (6, 4));
        assert_eq!(e.down.shape(), (4, 6));
        let out = l.forward(&x).unwrap();
        assert!(out.data().iter().all(|v| v.is_finite()));
    }

    #[test]
    fn same_rule_merges_under_every_ingredient() {
        for ingredient in [
            Ingredient::Activation,
            Ingredient::Weight,
            Ingredient::ActivationAndWeight,
        ] {
            let mut l = layer(2, 4, 5);
            let x = input(24, 4);
            dominant_merge_group(
                &mut l,
                0,
                0,
                &[0, 1],
                &x,
                None,
                ingredient,
                DominantRule::SameRule,
                1e-4,
            )
            .unwrap();
            assert_eq!(l.distinct_experts(), 1, "{ingredient:?}");
            assert_eq!(l.expert(1).gate.shape(), (5, 4));
        }
    }

    #[test]
    fn identical_members_merge_to_the_anchor() {
        let mut l = layer(2, 4, 5);
        let core_weights = l.expert(0).clone();
        l.set_expert(1, core_weights.clone()).unwrap();
        let x = input(30, 4);
        dominant_merge_group(
            &mut l,
            0,
            0,
            &[0, 1],
            &x,
            None,
            Ingredient::Activation,
            DominantRule::SameRule,
            1e-4,
        )
        .unwrap();
        for (a, b) in l.expert(0).gate.data().iter().zip(core_weights.gate.data()) {
            assert!((a - b).abs() < 1e-4);
        }
    }

    #[test]
    fn cluster_rule_balances_every_unit_cluster() {
        let mut l = layer(2, 4, 6);
        let x = input(20, 4);
        dominant_merge_group(
            &mut l,
            0,
            0,
            &[0, 1],
            &x,
            None,
            Ingredient::Activation,
            DominantRule::Cluster,
            1e-4,
        )
        .unwrap();
        assert_eq!(l.distinct_experts(), 1);
        let out = l.forward(&x).unwrap();
        assert!(out.data().iter().all(|v| v.is_finite()));
    }

    #[test]
    fn input_weights_shift_toward_heavier_members() {
        let mut l = layer(2, 4, 5);
        let x = input(26, 4);
        dominant_merge_group(
            &mut l,
            0,
            0,
            &[0, 1],
            &x,
            Some(&[0.9, 0.1]),
            Ingredient::Activation,
            DominantRule::Independent,
            1e-4,
        )
        .unwrap();
        assert_eq!(l.distinct_experts(), 1);
        assert!(l.expert(0).gate.data().iter().all(|v| v.is_finite()));
    }

    #[test]
    fn core_outside_group_is_an_error() {
        let mut l = layer(3, 4, 5);
        let x = input(12, 4);
        assert!(dominant_merge_group(
            &mut l,
            0,
            2,
            &[0, 1],
            &x,
            None,
            Ingredient::Activation,
            DominantRule::SameRule,
            1e-4,
        )
        .is_err());
    }
}
