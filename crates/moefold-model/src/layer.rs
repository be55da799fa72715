//! MoE layer: router, top-k dispatch and the representative-index table.

use std::collections::BTreeMap;

use crate::error::{Error, Result};
use crate::expert::ExpertWeights;
use moefold_core::{ops, Matrix};

/// Router weights, one row per expert.
#[derive(Debug, Clone)]
pub struct Router {
    pub weight: Matrix,
}

impl Router {
    pub fn new(weight: Matrix) -> Self {
        Self { weight }
    }

    pub fn num_experts(&self) -> usize {
        self.weight.rows()
    }

    /// Raw routing logits, `(tokens, num_experts)`.
    pub fn logits(&self, x: &Matrix) -> Result<Matrix> {
        Ok(x.matmul_transpose(&self.weight)?)
    }
}

/// Per-token routing decision for one layer.
#[derive(Debug, Clone)]
pub struct Routing {
    /// Raw logits, `(tokens, num_experts)`.
    pub logits: Matrix,
    /// Full softmax over all experts, `(tokens, num_experts)`.
    pub probs: Matrix,
    /// Selected expert slots per token, highest probability first.
    pub selected: Vec<Vec<usize>>,
    /// Selected weights per token, renormalized to sum 1.
    pub weights: Vec<Vec<f32>>,
}

impl Routing {
    /// Token indices routed to expert slot `slot`, in token order.
    pub fn tokens_for(&self, slot: usize) -> Vec<usize> {
        self.selected
            .iter()
            .enumerate()
            .filter(|(_, sel)| sel.contains(&slot))
            .map(|(t, _)| t)
            .collect()
    }

    /// Renormalized routing weight of `slot` for token `token`, 0 when unrouted.
    pub fn weight_of(&self, token: usize, slot: usize) -> f32 {
        self.selected[token]
            .iter()
            .position(|&s| s == slot)
            .map(|p| self.weights[token][p])
            .unwrap_or(0.0)
    }
}

/// One mixture-of-experts layer.
///
/// Merged experts are expressed through `representative`: slot `s` resolves
/// to `experts[representative[s]]`. Routing always works on slots, so a
/// merged layer keeps its routing surface while sharing weights.
#[derive(Debug, Clone)]
pub struct MoeLayer {
    pub router: Router,
    experts: Vec<ExpertWeights>,
    representative: Vec<usize>,
    pub top_k: usize,
    unmerge: BTreeMap<usize, Matrix>,
}

impl MoeLayer {
    pub fn new(router: Router, experts: Vec<ExpertWeights>, top_k: usize) -> Result<Self> {
        let n = experts.len();
        if router.num_experts() != n {
            return Err(Error::shape(
                "router",
                (n, router.weight.cols()),
                router.weight.shape(),
            ));
        }
        if top_k == 0 || top_k > n {
            return Err(Error::InvalidBatch(format!(
                "top_k {top_k} invalid for {n} experts"
            )));
        }
        Ok(Self {
            router,
            representative: (0..n).collect(),
            experts,
            top_k,
            unmerge: BTreeMap::new(),
        })
    }

    pub fn num_experts(&self) -> usize {
        self.experts.len()
    }

    pub fn d_model(&self) -> usize {
        self.router.weight.cols()
    }

    pub fn d_ff(&self) -> usize {
        self.experts[0].d_ff()
    }

    /// Resolve a slot through the representative table.
    pub fn expert(&self, slot: usize) -> &ExpertWeights {
        &self.experts[self.representative[slot]]
    }

    /// Mutable access to the weights owned by a slot's representative.
    pub fn expert_mut(&mut self, slot: usize) -> &mut ExpertWeights {
        &mut self.experts[self.representative[slot]]
    }

    /// Replace the weights owned by `slot`'s representative.
    pub fn set_expert(&mut self, slot: usize, weights: ExpertWeights) -> Result<()> {
        if slot >= self.experts.len() {
            return Err(Error::ExpertOutOfRange {
                slot,
                num_experts: self.experts.len(),
            });
        }
        let owner = self.representative[slot];
        self.experts[owner] = weights;
        Ok(())
    }

    /// Point `slot` at `owner`'s weights.
    pub fn alias(&mut self, slot: usize, owner: usize) -> Result<()> {
        let n = self.experts.len();
        if slot >= n || owner >= n {
            return Err(Error::ExpertOutOfRange {
                slot: slot.max(owner),
                num_experts: n,
            });
        }
        self.representative[slot] = self.representative[owner];
        Ok(())
    }

    pub fn representative(&self, slot: usize) -> usize {
        self.representative[slot]
    }

    pub fn representatives(&self) -> &[usize] {
        &self.representative
    }

    /// Number of distinct weight owners after aliasing.
    pub fn distinct_experts(&self) -> usize {
        let mut owners: Vec<usize> = self.representative.clone();
        owners.sort_unstable();
        owners.dedup();
        owners.len()
    }

    /// Store a per-group unmerge matrix produced by a merge strategy.
    pub fn set_unmerge(&mut self, group: usize, matrix: Matrix) {
        self.unmerge.insert(group, matrix);
    }

    pub fn unmerge(&self, group: usize) -> Option<&Matrix> {
        self.unmerge.get(&group)
    }

    /// Top-k routing over token rows.
    pub fn route(&self, x: &Matrix) -> Result<Routing> {
        let logits = self.router.logits(x)?;
        let mut probs = logits.clone();
        let tokens = probs.rows();
        let mut selected = Vec::with_capacity(tokens);
        let mut weights = Vec::with_capacity(tokens);
        for t in 0..tokens {
            let row = probs.row_mut(t);
            ops::softmax(row);
            let picks = ops::top_k(row, self.top_k);
            let mass: f32 = picks.iter().map(|&e| row[e]).sum();
            let w: Vec<f32> = picks.iter().map(|&e| row[e] / mass).collect();
            selected.push(picks);
            weights.push(w);
        }
        Ok(Routing {
            logits,
            probs,
            selected,
            weights,
        })
    }

    /// Top-k routing with some expert slots excluded from selection.
    pub fn route_dropped(&self, x: &Matrix, dropped: &[usize]) -> Result<Routing> {
        let n = self.num_experts();
        let live = n - dropped.iter().filter(|&&d| d < n).count();
        if live < self.top_k {
            return Err(Error::InvalidBatch(format!(
                "cannot drop to {live} experts with top_k {}",
                self.top_k
            )));
        }
        let mut logits = self.router.logits(x)?;
        for t in 0..logits.rows() {
            let row = logits.row_mut(t);
            for &d in dropped {
                if d < n {
                    row[d] = f32::NEG_INFINITY;
                }
            }
        }
        let mut probs = logits.clone();
        let tokens = probs.rows();
        let mut selected = Vec::with_capacity(tokens);
        let mut weights = Vec::with_capacity(tokens);
        for t in 0..tokens {
            let row = probs.row_mut(t);
            ops::softmax(row);
            let picks = ops::top_k(row, self.top_k);
            let mass: f32 = picks.iter().map(|&e| row[e]).sum();
            let w: Vec<f32> = picks.iter().map(|&e| row[e] / mass).collect();
            selected.push(picks);
            weights.push(w);
        }
        Ok(Routing {
            logits,
            probs,
            selected,
            weights,
        })
    }

    /// New layer keeping only the listed slots, router rows sliced to match.
    pub fn retain_experts(&self, keep: &[usize]) -> Result<MoeLayer> {
        if keep.is_empty() || keep.len() < self.top_k {
            return Err(Error::InvalidBatch(format!(
                "cannot retain {} experts with top_k {}",
                keep.len(),
                self.top_k
            )));
        }
        for &slot in keep {
            if slot >= self.num_experts() {
                return Err(Error::ExpertOutOfRange {
                    slot,
                    num_experts: self.num_experts(),
                });
            }
        }
        let router = Router::new(self.router.weight.take_rows(keep));
        let experts = keep.iter().map(|&s| self.expert(s).clone()).collect();
        MoeLayer::new(router, experts, self.top_k)
    }

    /// Forward with a precomputed routing decision.
    pub fn forward_routed(&self, x: &Matrix, routing: &Routing) -> Result<Matrix> {
        let mut out = Matrix::zeros(x.rows(), x.cols());
        for slot in 0..self.num_experts() {
            let tokens = routing.tokens_for(slot);
            if tokens.is_empty() {
                continue;
            }
            let gathered = x.take_rows(&tokens);
            let expert_out = self.expert(slot).forward(&gathered)?;
            for (local, &t) in tokens.iter().enumerate() {
                let w = routing.weight_of(t, slot);
                let src = expert_out.row(local);
                let dst = out.row_mut(t);
                for (d, &s) in dst.iter_mut().zip(src) {
                    *d += w * s;
                }
            }
        }
        Ok(out)
    }

    /// Route and forward in one call.
    pub fn forward(&self, x: &Matrix) -> Result<Matrix> {
        let routing = self.route(x)?;
        self.forward_routed(x, &routing)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn layer_with(num_experts: usize, d_model: usize, d_ff: usize, top_k: usize) -> MoeLayer {
        let router = Router::new(Matrix::from_fn(num_experts, d_model, |r, c| {
            ((r * 7 + c * 3) % 5) as f32 * 0.2 - 0.4
        }));
        let experts = (0..num_experts)
            .map(|e| {
                ExpertWeights::new(
                    Matrix::from_fn(d_ff, d_model, |r, c| ((e + r + c) % 3) as f32 * 0.3 - 0.2),
                    Matrix::from_fn(d_model, d_ff, |r, c| ((e + 2 * r + c) % 4) as f32 * 0.25 - 0.3),
                    Matrix::from_fn(d_ff, d_model, |r, c| ((2 * e + r + c) % 5) as f32 * 0.1),
                )
                .unwrap()
            })
            .collect();
        MoeLayer::new(router, experts, top_k).unwrap()
    }

    #[test]
    fn routing_weights_sum_to_one() {
        let layer = layer_with(4, 3, 5, 2);
        let x = Matrix::from_fn(6, 3, |r, c| (r as f32 - c as f32) * 0.3);
        let routing = layer.route(&x).unwrap();
        for t in 0..6 {
            assert_eq!(routing.selected[t].len(), 2);
            let sum: f32 = routing.weights[t].iter().sum();
            assert!((sum - 1.0).abs() < 1e-5);
        }
        for t in 0..6 {
            let p: f32 = routing.probs.row(t).iter().sum();
            assert!((p - 1.0).abs() < 1e-5);
        }
    }

    #[test]
    fn aliasing_shares_weights() {
        let mut layer = layer_with(3, 3, 4, 1);
        layer.alias(2, 0).unwrap();
        assert_eq!(layer.distinct_experts(), 2);
        assert_eq!(layer.expert(2).gate, layer.expert(0).gate);
        // aliasing through a chain resolves to the root owner
        layer.alias(1, 2).unwrap();
        assert_eq!(layer.representative(1), 0);
        assert_eq!(layer.distinct_experts(), 1);
    }

    #[test]
    fn forward_is_weighted_sum_of_selected_experts() {
        let layer = layer_with(3, 3, 4, 2);
        let x = Matrix::from_fn(2, 3, |r, c| 0.5 * (r as f32 + 1.0) - 0.2 * c as f32);
        let routing = layer.route(&x).unwrap();
        let out = layer.forward_routed(&x, &routing).unwrap();
        for t in 0..2 {
            let token = x.take_rows(&[t]);
            let mut want = vec![0.0f32; 3];
            for (pos, &e) in routing.selected[t].iter().enumerate() {
                let eo = layer.expert(e).forward(&token).unwrap();
                for (w, &v) in want.iter_mut().zip(eo.row(0)) {
                    *w += routing.weights[t][pos] * v;
                }
            }
            for (a, b) in out.row(t).iter().zip(&want) {
                assert!((a - b).abs() < 1e-5);
            }
        }
    }
}
