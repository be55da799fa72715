//! Greedy correlation ("zip") merging over hidden units.
//!
//! Each member expert contributes `d_ff` hidden units; the group's
//! `members * d_ff` units are greedily merged down to `d_ff` by repeatedly
//! averaging the most correlated pair. Dead units stay in the arena under a
//! live mask, so indices are stable for the whole merge.

use tracing::debug;

use crate::average::bind_group;
use crate::error::{Error, Result};
use moefold_core::{correlation, ops, pinv, Matrix, FP32_EPS};
use moefold_model::{ExpertWeights, MoeLayer};

/// What the unit correlation is computed from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ingredient {
    /// Hidden activations over routed inputs.
    Activation,
    /// Concatenated weight columns (gate row, down column, up row).
    Weight,
    /// Sum of the activation and weight correlation matrices.
    ActivationAndWeight,
}

/// Zip merge configuration.
#[derive(Debug, Clone, Copy)]
pub struct ZipConfig {
    pub ingredient: Ingredient,
    /// Decay applied to a merged unit's correlations.
    pub alpha: f32,
    /// Ridge term for the unmerge pseudo-inverse.
    pub ridge: f32,
    /// Store a per-group unmerge matrix and merge through it.
    pub unmerge: bool,
}

impl Default for ZipConfig {
    fn default() -> Self {
        Self {
            ingredient: Ingredient::Activation,
            alpha: 0.1,
            ridge: 1e-4,
            unmerge: false,
        }
    }
}

/// All units of a group, flat over members, with a live mask instead of
/// physical removal.
struct UnitArena {
    /// Gate rows, `(units, d_model)`.
    gate: Matrix,
    /// Up rows, `(units, d_model)`.
    up: Matrix,
    /// Down columns stored as rows, `(units, d_model)`.
    down: Matrix,
    coef: Vec<f32>,
    live: Vec<bool>,
    num_live: usize,
    /// Coefficient-seeded merge tracker; merging j into i accumulates
    /// column j onto column i, so normalized columns carry each unit's
    /// coefficient share.
    perm: Matrix,
}

impl UnitArena {
    fn from_members(layer: &MoeLayer, members: &[usize], coef: Vec<f32>) -> Self {
        let d_ff = layer.d_ff();
        let d_model = layer.d_model();
        let units = members.len() * d_ff;
        let mut gate = Matrix::zeros(units, d_model);
        let mut up = Matrix::zeros(units, d_model);
        let mut down = Matrix::zeros(units, d_model);
        for (mi, &m) in members.iter().enumerate() {
            let e = layer.expert(m);
            for f in 0..d_ff {
                let u = mi * d_ff + f;
                gate.row_mut(u).copy_from_slice(e.gate.row(f));
                up.row_mut(u).copy_from_slice(e.up.row(f));
                down.row_mut(u).copy_from_slice(&e.down.col(f));
            }
        }
        let mut perm = Matrix::zeros(units, units);
        for (u, &c) in coef.iter().enumerate() {
            perm.set(u, u, c);
        }
        Self {
            gate,
            up,
            down,
            coef,
            live: vec![true; units],
            num_live: units,
            perm,
        }
    }

    /// Coef-weighted average of unit `j` into unit `i`; `j` goes dead.
    fn merge_pair(&mut self, i: usize, j: usize) {
        let (ci, cj) = (self.coef[i], self.coef[j]);
        let denom = ci + cj + FP32_EPS;
        for block in [&mut self.gate, &mut self.up, &mut self.down] {
            let merged: Vec<f32> = block
                .row(i)
                .iter()
                .zip(block.row(j))
                .map(|(&a, &b)| (ci * a + cj * b) / denom)
                .collect();
            block.row_mut(i).copy_from_slice(&merged);
        }
        for r in 0..self.perm.rows() {
            let v = self.perm.get(r, i) + self.perm.get(r, j);
            self.perm.set(r, i, v);
        }
        self.coef[i] += self.coef[j];
        self.live[j] = false;
        self.num_live -= 1;
    }

    /// Live unit indices in ascending original order.
    fn survivors(&self) -> Vec<usize> {
        (0..self.live.len()).filter(|&u| self.live[u]).collect()
    }
}

/// Normalize each column to sum 1, epsilon-stabilized.
pub(crate) fn column_normalize(m: &Matrix) -> Matrix {
    let mut out = m.clone();
    for c in 0..out.cols() {
        let sum: f32 = (0..out.rows()).map(|r| out.get(r, c)).sum();
        let scale = if sum.abs() < FP32_EPS { 0.0 } else { 1.0 / sum };
        for r in 0..out.rows() {
            let v = out.get(r, c) * scale;
            out.set(r, c, v);
        }
    }
    out
}

/// Hidden activations of every member over a shared input, stacked as unit
/// columns, `(tokens, members * d_ff)`.
pub(crate) fn member_activations(layer: &MoeLayer, members: &[usize], input: &Matrix) -> Result<Matrix> {
    let parts: Vec<Matrix> = members
        .iter()
        .map(|&m| layer.expert(m).hidden(input).map_err(Error::from))
        .collect::<Result<_>>()?;
    let refs: Vec<&Matrix> = parts.iter().collect();
    Ok(Matrix::hstack(&refs)?)
}

/// Weight fingerprint per unit: gate row, down column and up row stacked as
/// observations, `(3 * d_model, members * d_ff)`.
pub(crate) fn member_weight_features(layer: &MoeLayer, members: &[usize]) -> Matrix {
    let d_ff = layer.d_ff();
    let d_model = layer.d_model();
    let units = members.len() * d_ff;
    let mut features = Matrix::zeros(3 * d_model, units);
    for (mi, &m) in members.iter().enumerate() {
        let e = layer.expert(m);
        for f in 0..d_ff {
            let u = mi * d_ff + f;
            for r in 0..d_model {
                features.set(r, u, e.gate.get(f, r));
                features.set(d_model + r, u, e.down.get(r, f));
                features.set(2 * d_model + r, u, e.up.get(f, r));
            }
        }
    }
    features
}

/// Unit-by-unit correlation for the configured ingredient.
fn unit_correlation(
    layer: &MoeLayer,
    members: &[usize],
    input: &Matrix,
    ingredient: Ingredient,
) -> Result<Matrix> {
    if ingredient != Ingredient::Weight && input.rows() < 2 {
        return Err(Error::NoActivations { expert: members[0] });
    }
    match ingredient {
        Ingredient::Activation => {
            let acts = member_activations(layer, members, input)?;
            Ok(correlation(&acts, &acts)?)
        }
        Ingredient::Weight => {
            let feats = member_weight_features(layer, members);
            Ok(correlation(&feats, &feats)?)
        }
        Ingredient::ActivationAndWeight => {
            let acts = member_activations(layer, members, input)?;
            let feats = member_weight_features(layer, members);
            let mut corr = correlation(&acts, &acts)?;
            corr.add_assign(&correlation(&feats, &feats)?)?;
            Ok(corr)
        }
    }
}

/// Highest-correlation live pair, `(i, j)` with `i != j`.
fn best_pair(corr: &Matrix, live: &[bool]) -> (usize, usize) {
    let mut best = (0usize, 1usize, f32::NEG_INFINITY);
    for i in 0..corr.rows() {
        if !live[i] {
            continue;
        }
        let row = corr.row(i);
        for (j, &v) in row.iter().enumerate() {
            if i != j && live[j] && v > best.2 {
                best = (i, j, v);
            }
        }
    }
    (best.0, best.1)
}

/// Greedy same-rule zip merge of one group down to `d_ff` units.
///
/// With `cfg.unmerge` the merged weights come from the column-normalized
/// merge matrix and its ridge pseudo-inverse, which is stored on the layer
/// under the group label.
pub fn zip_merge_group(
    layer: &mut MoeLayer,
    label: usize,
    members: &[usize],
    input: &Matrix,
    input_weight: Option<&[f32]>,
    cfg: &ZipConfig,
) -> Result<()> {
    if members.len() < 2 {
        return Ok(());
    }
    let d_ff = layer.d_ff();
    let coef: Vec<f32> = match input_weight {
        Some(w) => {
            if w.len() != members.len() {
                return Err(Error::config(format!(
                    "{} input weights for {} members",
                    w.len(),
                    members.len()
                )));
            }
            w.iter().flat_map(|&v| std::iter::repeat(v).take(d_ff)).collect()
        }
        None => vec![1.0; members.len() * d_ff],
    };

    let mut corr = unit_correlation(layer, members, input, cfg.ingredient)?;
    for u in 0..corr.rows() {
        corr.set(u, u, -1.0);
    }
    let mut arena = UnitArena::from_members(layer, members, coef);

    while arena.num_live > d_ff {
        let (i, j) = best_pair(&corr, &arena.live);
        arena.merge_pair(i, j);
        // both units' correlations decay toward the pairwise minimum
        let decayed: Vec<f32> = (0..corr.cols())
            .map(|k| cfg.alpha * corr.get(i, k).min(corr.get(j, k)))
            .collect();
        for (k, &v) in decayed.iter().enumerate() {
            corr.set(i, k, v);
            corr.set(k, i, v);
        }
        corr.set(i, i, -1.0);
        for k in 0..corr.cols() {
            corr.set(j, k, f32::NEG_INFINITY);
            corr.set(k, j, f32::NEG_INFINITY);
        }
    }

    let survivors = arena.survivors();
    debug!(label, units = survivors.len(), "zip merge settled");
    let merged = if cfg.unmerge {
        let merge_matrix = column_normalize(&arena.perm.take_cols(&survivors));
        let unmerge = pinv(&merge_matrix, cfg.ridge)?;
        let d_model = layer.d_model();
        let mut gate_acc = Matrix::zeros(d_model, d_ff);
        let mut up_acc = Matrix::zeros(d_model, d_ff);
        let mut down_acc = Matrix::zeros(d_model, d_ff);
        for (mi, &m) in members.iter().enumerate() {
            let block: Vec<usize> = (mi * d_ff..(mi + 1) * d_ff).collect();
            let map = merge_matrix
                .take_rows(&block)
                .matmul(&unmerge.take_cols(&block))?;
            let e = layer.expert(m);
            gate_acc.add_assign(&e.gate.transpose().matmul(&map)?)?;
            up_acc.add_assign(&e.up.transpose().matmul(&map)?)?;
            down_acc.add_assign(&e.down.matmul(&map)?)?;
        }
        layer.set_unmerge(label, unmerge);
        ExpertWeights::new(gate_acc.transpose(), down_acc, up_acc.transpose())?
    } else {
        ExpertWeights::new(
            arena.gate.take_rows(&survivors),
            arena.down.take_rows(&survivors).transpose(),
            arena.up.take_rows(&survivors),
        )?
    };
    bind_group(layer, members, merged)?;
    Ok(())
}

/// One round-based greedy merge pass used by the recompute variant.
///
/// Activations are regenerated from the partially merged `weight1`
/// (and `weight3`) at the start of every round. Returns the raw
/// (unnormalized) merge tracker restricted to the survivor columns.
fn zip_rounds(
    weight1: &mut Matrix,
    mut weight3: Option<&mut Matrix>,
    data: &Matrix,
    target: usize,
) -> Result<Matrix> {
    let units = weight1.rows();
    let mut live = vec![true; units];
    let mut num_live = units;
    let mut perm = Matrix::eye(units);

    while num_live > target {
        let round_target = target.max(num_live / 2 + num_live % 2);
        let live_idx: Vec<usize> = (0..units).filter(|&u| live[u]).collect();
        let u = data.matmul_transpose(&weight1.take_rows(&live_idx))?;
        let acts = match weight3.as_deref() {
            Some(w3) => {
                let v = data.matmul_transpose(&w3.take_rows(&live_idx))?;
                let mut h = u;
                for (hv, &vv) in h.data_mut().iter_mut().zip(v.data()) {
                    *hv = ops::silu(*hv) * vv;
                }
                h
            }
            None => u,
        };
        let mut corr = correlation(&acts, &acts)?;
        let n = live_idx.len();
        for k in 0..n {
            corr.set(k, k, -1.0);
        }
        let mut round_live = vec![true; n];
        for _ in 0..num_live - round_target {
            let (a, b) = best_pair(&corr, &round_live);
            let (i, j) = (live_idx[a], live_idx[b]);
            let denom = 2.0 + FP32_EPS;
            let merged: Vec<f32> = weight1
                .row(i)
                .iter()
                .zip(weight1.row(j))
                .map(|(&x, &y)| (x + y) / denom)
                .collect();
            weight1.row_mut(i).copy_from_slice(&merged);
            if let Some(w3) = weight3.as_deref_mut() {
                let merged: Vec<f32> = w3
                    .row(i)
                    .iter()
                    .zip(w3.row(j))
                    .map(|(&x, &y)| (x + y) / denom)
                    .collect();
                w3.row_mut(i).copy_from_slice(&merged);
            }
            for r in 0..units {
                let v = perm.get(r, i) + perm.get(r, j);
                perm.set(r, i, v);
            }
            // freeze the merged unit for the rest of the round
            for k in 0..n {
                corr.set(a, k, FP32_EPS);
                corr.set(k, a, FP32_EPS);
                corr.set(b, k, f32::NEG_INFINITY);
                corr.set(k, b, f32::NEG_INFINITY);
            }
            corr.set(a, a, -1.0);
            live[j] = false;
            round_live[b] = false;
            num_live -= 1;
        }
    }
    let survivors: Vec<usize> = (0..units).filter(|&u| live[u]).collect();
    Ok(perm.take_cols(&survivors))
}

/// Zip merge with per-round recomputation of activations and correlations.
///
/// Gate and up come from the column-normalized first-stage tracker; down is
/// matched in the output space over activations regenerated with the merged
/// gate/up, combined through the raw first-stage tracker as unmerge.
pub fn zip_merge_group_recompute(
    layer: &mut MoeLayer,
    label: usize,
    members: &[usize],
    input: &Matrix,
) -> Result<()> {
    if members.len() < 2 {
        return Ok(());
    }
    if input.rows() < 2 {
        return Err(Error::NoActivations { expert: members[0] });
    }
    let d_ff = layer.d_ff();
    let d_model = layer.d_model();
    let num = members.len();

    let gate_rows: Vec<&Matrix> = members.iter().map(|&m| &layer.expert(m).gate).collect();
    let up_rows: Vec<&Matrix> = members.iter().map(|&m| &layer.expert(m).up).collect();
    let down_rows: Vec<&Matrix> = members.iter().map(|&m| &layer.expert(m).down).collect();
    let all_gate = Matrix::vstack(&gate_rows)?;
    let all_up = Matrix::vstack(&up_rows)?;
    let all_down = Matrix::vstack(&down_rows)?;

    let mut gate_work = all_gate.clone();
    let mut up_work = all_up.clone();
    let first_raw = zip_rounds(&mut gate_work, Some(&mut up_work), input, d_ff)?;
    let first_merge = column_normalize(&first_raw);
    let gate_final = first_merge.transpose().matmul(&all_gate)?;
    let up_final = first_merge.transpose().matmul(&all_up)?;

    let u = input.matmul_transpose(&gate_final)?;
    let v = input.matmul_transpose(&up_final)?;
    let mut new_data = u;
    for (hv, &vv) in new_data.data_mut().iter_mut().zip(v.data()) {
        *hv = ops::silu(*hv) * vv;
    }

    let mut down_work = all_down.clone();
    let second_raw = zip_rounds(&mut down_work, None, &new_data, d_model)?;
    let second_merge = column_normalize(&second_raw);
    let second_t = second_merge.transpose();
    let first_unmerge_t = first_raw.transpose();

    let mut down_final = Matrix::zeros(d_model, d_ff);
    for mi in 0..num {
        let out_block: Vec<usize> = (mi * d_model..(mi + 1) * d_model).collect();
        let ff_block: Vec<usize> = (mi * d_ff..(mi + 1) * d_ff).collect();
        let inner = all_down
            .take_rows(&out_block)
            .matmul(&first_unmerge_t.take_cols(&ff_block))?;
        down_final.add_assign(&second_t.take_cols(&out_block).matmul(&inner)?)?;
    }

    debug!(label, members = num, "zip recompute merge settled");
    let merged = ExpertWeights::new(gate_final, down_final, up_final)?;
    bind_group(layer, members, merged)?;
    Ok(())
}
