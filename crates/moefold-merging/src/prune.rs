//! Expert pruning: keep a reserved set, or search for the cheapest drop set.

use tracing::debug;

use crate::error::{Error, Result};
use moefold_core::Matrix;
use moefold_model::MoeLayer;

/// New layer keeping only `keep` (sorted, deduplicated), router rows sliced
/// to match.
pub fn prune_layer(layer: &MoeLayer, keep: &[usize]) -> Result<MoeLayer> {
    let mut sorted = keep.to_vec();
    sorted.sort_unstable();
    sorted.dedup();
    Ok(layer.retain_experts(&sorted)?)
}

fn combinations(n: usize, k: usize) -> Vec<Vec<usize>> {
    let mut out = Vec::new();
    let mut current = Vec::with_capacity(k);
    fn recurse(start: usize, n: usize, k: usize, current: &mut Vec<usize>, out: &mut Vec<Vec<usize>>) {
        if current.len() == k {
            out.push(current.clone());
            return;
        }
        for i in start..n {
            current.push(i);
            recurse(i + 1, n, k, current, out);
            current.pop();
        }
    }
    recurse(0, n, k, &mut current, &mut out);
    out
}

/// Exhaustive search for the `num_drop` experts whose removal changes the
/// layer output least over `input`, measured by the Frobenius norm of the
/// difference against the unpruned forward.
pub fn enumerate_expert_drops(
    layer: &MoeLayer,
    input: &Matrix,
    num_drop: usize,
) -> Result<Vec<usize>> {
    let n = layer.num_experts();
    if num_drop == 0 || n - num_drop < layer.top_k {
        return Err(Error::config(format!(
            "cannot drop {num_drop} of {n} experts with top_k {}",
            layer.top_k
        )));
    }
    let full = layer.forward(input)?;
    let mut best: Option<(Vec<usize>, f32)> = None;
    for candidate in combinations(n, num_drop) {
        let routing = layer.route_dropped(input, &candidate)?;
        let out = layer.forward_routed(input, &routing)?;
        let err: f32 = out
            .data()
            .iter()
            .zip(full.data())
            .map(|(&a, &b)| (a - b) * (a - b))
            .sum();
        if best.as_ref().map_or(true, |(_, e)| err < *e) {
            best = Some((candidate, err));
        }
    }
    let (dropped, err) = best.ok_or_else(|| Error::config("no drop candidates"))?;
    debug!(?dropped, err, "drop search settled");
    Ok(dropped)
}
