//! Stacked MoE model with activation taps and the masked knowledge pass.

use std::cell::RefCell;
use std::rc::Rc;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::calib::CalibBatch;
use crate::capture::{CaptureGuard, TapTable};
use crate::error::{Error, Result};
use crate::expert::ExpertWeights;
use crate::layer::{MoeLayer, Router, Routing};
use moefold_core::{ops, Matrix};

/// Model dimensions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    pub vocab_size: usize,
    pub d_model: usize,
    pub d_ff: usize,
    pub num_experts: usize,
    pub num_layers: usize,
    pub top_k: usize,
}

/// Output of a plain forward pass.
pub struct ForwardOutput {
    /// LM logits, `(tokens, vocab_size)`.
    pub logits: Matrix,
    /// Per-layer raw router logits when requested.
    pub router_logits: Option<Vec<Matrix>>,
}

/// Output of a masked knowledge pass on one layer.
pub struct KnowledgePass {
    /// Temperature-softened output distribution, `(tokens, vocab_size)`.
    pub soft_output: Matrix,
    /// Distillation loss after the large-loss rescale.
    pub kl_div: f32,
    /// Gradient of the loss with respect to the layer's expert masks,
    /// `(num_experts, d_ff)`.
    pub mask_grad: Matrix,
    /// Per expert slot, the masked down-projection inputs of its routed
    /// tokens (possibly zero-row).
    pub expert_inputs: Vec<Matrix>,
    pub num_tokens: usize,
    pub num_sequences: usize,
}

struct ExpertCache {
    tokens: Vec<usize>,
    u: Matrix,
    v: Matrix,
    h: Matrix,
    a: Matrix,
    out: Matrix,
}

struct LayerCache {
    routing: Routing,
    per_expert: Vec<Option<ExpertCache>>,
}

/// Decoder-style MoE model: token embedding, residual MoE layers, LM head.
pub struct MoeModel {
    pub config: ModelConfig,
    embed: Matrix,
    pub layers: Vec<MoeLayer>,
    head: Matrix,
    taps: Rc<RefCell<TapTable>>,
}

impl MoeModel {
    pub fn new(
        config: ModelConfig,
        embed: Matrix,
        layers: Vec<MoeLayer>,
        head: Matrix,
    ) -> Result<Self> {
        if embed.shape() != (config.vocab_size, config.d_model) {
            return Err(Error::shape(
                "embed",
                (config.vocab_size, config.d_model),
                embed.shape(),
            ));
        }
        if head.shape() != (config.vocab_size, config.d_model) {
            return Err(Error::shape(
                "head",
                (config.vocab_size, config.d_model),
                head.shape(),
            ));
        }
        if layers.len() != config.num_layers {
            return Err(Error::LayerOutOfRange {
                layer: layers.len(),
                num_layers: config.num_layers,
            });
        }
        Ok(Self {
            config,
            embed,
            layers,
            head,
            taps: Rc::new(RefCell::new(TapTable::default())),
        })
    }

    /// Seeded random-init model for tests and demos.
    pub fn synthetic(config: ModelConfig, seed: Option<u64>) -> Self {
        let mut rng = match seed {
            Some(s) => StdRng::seed_from_u64(s),
            None => StdRng::from_entropy(),
        };
        let scale = 1.0 / (config.d_model as f32).sqrt();
        let mut rand_matrix = |rows: usize, cols: usize| {
            let data = (0..rows * cols)
                .map(|_| rng.gen_range(-1.0f32..1.0) * scale)
                .collect();
            Matrix::new(rows, cols, data).unwrap_or_else(|_| Matrix::zeros(rows, cols))
        };
        let embed = rand_matrix(config.vocab_size, config.d_model);
        let head = rand_matrix(config.vocab_size, config.d_model);
        let layers = (0..config.num_layers)
            .map(|_| {
                let router = Router::new(rand_matrix(config.num_experts, config.d_model));
                let experts = (0..config.num_experts)
                    .map(|_| ExpertWeights {
                        gate: rand_matrix(config.d_ff, config.d_model),
                        down: rand_matrix(config.d_model, config.d_ff),
                        up: rand_matrix(config.d_ff, config.d_model),
                    })
                    .collect();
                MoeLayer::new(router, experts, config.top_k)
            })
            .collect::<Result<Vec<_>>>();
        // shapes are internally consistent by construction
        let layers = match layers {
            Ok(l) => l,
            Err(_) => Vec::new(),
        };
        Self {
            config,
            embed,
            layers,
            head,
            taps: Rc::new(RefCell::new(TapTable::default())),
        }
    }

    pub fn num_layers(&self) -> usize {
        self.layers.len()
    }

    pub fn layer(&self, layer: usize) -> Result<&MoeLayer> {
        self.layers.get(layer).ok_or(Error::LayerOutOfRange {
            layer,
            num_layers: self.layers.len(),
        })
    }

    pub fn layer_mut(&mut self, layer: usize) -> Result<&mut MoeLayer> {
        let num_layers = self.layers.len();
        self.layers
            .get_mut(layer)
            .ok_or(Error::LayerOutOfRange { layer, num_layers })
    }

    /// Register a scoped tap on `layer`'s input rows.
    pub fn tap_layer_input(&self, layer: usize) -> Result<CaptureGuard> {
        if layer >= self.layers.len() {
            return Err(Error::LayerOutOfRange {
                layer,
                num_layers: self.layers.len(),
            });
        }
        let (id, buf) = self.taps.borrow_mut().register(layer);
        Ok(CaptureGuard::new(id, layer, buf, Rc::clone(&self.taps)))
    }

    fn embed_batch(&self, batch: &CalibBatch) -> Result<Matrix> {
        batch.validate()?;
        let ids = batch.attended_ids();
        let mut data = Vec::with_capacity(ids.len() * self.config.d_model);
        for &id in &ids {
            if id as usize >= self.config.vocab_size {
                return Err(Error::TokenOutOfRange {
                    token: id,
                    vocab_size: self.config.vocab_size,
                });
            }
            data.extend_from_slice(self.embed.row(id as usize));
        }
        Ok(Matrix::new(ids.len(), self.config.d_model, data)?)
    }

    /// Forward over one calibration batch; token rows are the attended
    /// positions only.
    pub fn forward(&self, batch: &CalibBatch, output_router_logits: bool) -> Result<ForwardOutput> {
        let mut x = self.embed_batch(batch)?;
        let mut router_logits = output_router_logits.then(Vec::new);
        for (l, layer) in self.layers.iter().enumerate() {
            self.taps.borrow().record(l, &x);
            let routing = layer.route(&x)?;
            if let Some(acc) = router_logits.as_mut() {
                acc.push(routing.logits.clone());
            }
            let y = layer.forward_routed(&x, &routing)?;
            x.add_assign(&y)?;
        }
        let logits = x.matmul_transpose(&self.head)?;
        Ok(ForwardOutput {
            logits,
            router_logits,
        })
    }

    /// Masked forward plus manual backward for one layer's expert masks.
    ///
    /// `masks` is `(num_experts, d_ff)` and is applied to the down input of
    /// the target layer's experts. The loss is the temperature-scaled KL
    /// divergence of the softened output against `target` (or against the
    /// pass's own softened output when `target` is `None`). The backward walk
    /// covers the layers above the target, including the routing softmax.
    pub fn knowledge_pass(
        &self,
        layer: usize,
        masks: &Matrix,
        batch: &CalibBatch,
        temperature: f32,
        target: Option<&Matrix>,
    ) -> Result<KnowledgePass> {
        let num_layers = self.layers.len();
        if layer >= num_layers {
            return Err(Error::LayerOutOfRange { layer, num_layers });
        }
        let e_count = self.config.num_experts;
        let d_ff = self.config.d_ff;
        if masks.shape() != (e_count, d_ff) {
            return Err(Error::shape("masks", (e_count, d_ff), masks.shape()));
        }
        if temperature <= 0.0 {
            return Err(Error::InvalidBatch(format!(
                "temperature {temperature} must be positive"
            )));
        }

        let mut x = self.embed_batch(batch)?;
        if x.rows() == 0 {
            return Err(Error::InvalidBatch("no attended tokens".into()));
        }
        let num_tokens = x.rows();
        for l in 0..layer {
            let y = self.layers[l].forward(&x)?;
            x.add_assign(&y)?;
        }

        // Cached forward through the target layer and everything above it.
        let mut caches: Vec<LayerCache> = Vec::with_capacity(num_layers - layer);
        for l in layer..num_layers {
            let lyr = &self.layers[l];
            let routing = lyr.route(&x)?;
            let mut per_expert: Vec<Option<ExpertCache>> = (0..e_count).map(|_| None).collect();
            let mut y = Matrix::zeros(x.rows(), x.cols());
            for slot in 0..e_count {
                let tokens = routing.tokens_for(slot);
                if tokens.is_empty() {
                    continue;
                }
                let ew = lyr.expert(slot);
                let gathered = x.take_rows(&tokens);
                let u = gathered.matmul_transpose(&ew.gate)?;
                let v = gathered.matmul_transpose(&ew.up)?;
                let mut h = u.clone();
                for (hv, &vv) in h.data_mut().iter_mut().zip(v.data()) {
                    *hv = ops::silu(*hv) * vv;
                }
                let mut a = h.clone();
                if l == layer {
                    let mrow = masks.row(slot);
                    for r in 0..a.rows() {
                        for (av, &m) in a.row_mut(r).iter_mut().zip(mrow) {
                            *av *= m;
                        }
                    }
                }
                let out = a.matmul_transpose(&ew.down)?;
                for (local, &t) in tokens.iter().enumerate() {
                    let w = routing.weight_of(t, slot);
                    let dst = y.row_mut(t);
                    for (d, &s) in dst.iter_mut().zip(out.row(local)) {
                        *d += w * s;
                    }
                }
                per_expert[slot] = Some(ExpertCache {
                    tokens,
                    u,
                    v,
                    h,
                    a,
                    out,
                });
            }
            caches.push(LayerCache { routing, per_expert });
            x.add_assign(&y)?;
        }
        let logits = x.matmul_transpose(&self.head)?;

        // Softened output and distillation loss.
        let mut soft = logits.scale(1.0 / temperature);
        for r in 0..soft.rows() {
            ops::softmax(soft.row_mut(r));
        }
        let target_owned;
        let target_ref = match target {
            Some(t) => {
                if t.shape() != soft.shape() {
                    return Err(Error::shape("target", soft.shape(), t.shape()));
                }
                t
            }
            None => {
                target_owned = soft.clone();
                &target_owned
            }
        };
        let rows = soft.rows() as f32;
        let mut kl = 0.0f32;
        for r in 0..soft.rows() {
            for (st, &tg) in soft.row(r).iter().zip(target_ref.row(r)) {
                if tg > 0.0 {
                    kl += tg * (tg.max(1e-12).ln() - st.max(1e-12).ln());
                }
            }
        }
        kl *= temperature * temperature / rows;
        let mut loss_scale = 1.0f32;
        if kl >= 100.0 {
            kl /= 100.0;
            loss_scale = 0.01;
        }
        debug!(layer, kl_div = kl, "knowledge pass loss");

        // dL/dlogits = scale * T / N * (soft - target)
        let grad_factor = loss_scale * temperature / rows;
        let mut dlogits = soft.sub(target_ref)?;
        dlogits.scale_in_place(grad_factor);

        // Backward down to the target layer.
        let mut g = dlogits.matmul(&self.head)?;
        let mut mask_grad = Matrix::zeros(e_count, d_ff);
        for l in (layer..num_layers).rev() {
            let cache = &caches[l - layer];
            let lyr = &self.layers[l];
            let mut g_prev = g.clone();
            let mut dsel: Vec<Vec<f32>> = cache
                .routing
                .selected
                .iter()
                .map(|s| vec![0.0f32; s.len()])
                .collect();

            for slot in 0..e_count {
                let Some(ec) = &cache.per_expert[slot] else {
                    continue;
                };
                let ew = lyr.expert(slot);
                let te = ec.tokens.len();
                let mut g_out = Matrix::zeros(te, self.config.d_model);
                for (local, &t) in ec.tokens.iter().enumerate() {
                    let w = cache.routing.weight_of(t, slot);
                    let mut dot = 0.0f32;
                    for (o, gg) in ec.out.row(local).iter().zip(g.row(t)) {
                        dot += o * gg;
                    }
                    if let Some(pos) = cache.routing.selected[t].iter().position(|&s| s == slot) {
                        dsel[t][pos] += dot;
                    }
                    for (d, &s) in g_out.row_mut(local).iter_mut().zip(g.row(t)) {
                        *d = w * s;
                    }
                }
                let d_a = g_out.matmul(&ew.down)?;
                let d_h = if l == layer {
                    let mrow = masks.row(slot);
                    let mut dh = d_a.clone();
                    for local in 0..te {
                        let da_row = d_a.row(local);
                        let h_row = ec.h.row(local);
                        let grad_row = mask_grad.row_mut(slot);
                        for j in 0..d_ff {
                            grad_row[j] += da_row[j] * h_row[j];
                        }
                        for (dv, &m) in dh.row_mut(local).iter_mut().zip(mrow) {
                            *dv *= m;
                        }
                    }
                    dh
                } else {
                    d_a
                };
                let mut du = Matrix::zeros(te, d_ff);
                let mut dv = Matrix::zeros(te, d_ff);
                for local in 0..te {
                    let u_row = ec.u.row(local);
                    let v_row = ec.v.row(local);
                    let dh_row = d_h.row(local);
                    for j in 0..d_ff {
                        du.row_mut(local)[j] = ops::silu_deriv(u_row[j]) * v_row[j] * dh_row[j];
                        dv.row_mut(local)[j] = ops::silu(u_row[j]) * dh_row[j];
                    }
                }
                let mut d_x = du.matmul(&ew.gate)?;
                d_x.add_assign(&dv.matmul(&ew.up)?)?;
                for (local, &t) in ec.tokens.iter().enumerate() {
                    let dst = g_prev.row_mut(t);
                    for (d, &s) in dst.iter_mut().zip(d_x.row(local)) {
                        *d += s;
                    }
                }
            }

            // Routing softmax gradient: through the renormalized top-k
            // weights back to the router logits.
            for t in 0..num_tokens {
                if dsel[t].iter().all(|&v| v == 0.0) {
                    continue;
                }
                let sel = &cache.routing.selected[t];
                let probs = cache.routing.probs.row(t);
                let sigma: f32 = sel.iter().map(|&e| probs[e]).sum();
                let dot_w: f32 = dsel[t]
                    .iter()
                    .zip(&cache.routing.weights[t])
                    .map(|(&d, &w)| d * w)
                    .sum();
                let mut q = vec![0.0f32; e_count];
                for (pos, &e) in sel.iter().enumerate() {
                    q[e] = (dsel[t][pos] - dot_w) / sigma;
                }
                let qp: f32 = q.iter().zip(probs).map(|(&qv, &pv)| qv * pv).sum();
                for k in 0..e_count {
                    let dr = probs[k] * (q[k] - qp);
                    if dr == 0.0 {
                        continue;
                    }
                    let dst = g_prev.row_mut(t);
                    for (d, &rw) in dst.iter_mut().zip(lyr.router.weight.row(k)) {
                        *d += dr * rw;
                    }
                }
            }
            g = g_prev;
        }

        let expert_inputs = caches[0]
            .per_expert
            .iter()
            .map(|ec| match ec {
                Some(c) => c.a.clone(),
                None => Matrix::zeros(0, d_ff),
            })
            .collect();

        Ok(KnowledgePass {
            soft_output: soft,
            kl_div: kl,
            mask_grad,
            expert_inputs,
            num_tokens,
            num_sequences: batch.num_sequences(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_config() -> ModelConfig {
        ModelConfig {
            vocab_size: 17,
            d_model: 6,
            d_ff: 8,
            num_experts: 4,
            num_layers: 3,
            top_k: 2,
        }
    }

    fn batch() -> CalibBatch {
        CalibBatch::dense(vec![vec![1, 5, 9, 13], vec![2, 6, 10]])
    }

    #[test]
    fn synthetic_is_deterministic_per_seed() {
        let a = MoeModel::synthetic(small_config(), Some(7));
        let b = MoeModel::synthetic(small_config(), Some(7));
        let c = MoeModel::synthetic(small_config(), Some(8));
        let la = a.forward(&batch(), false).unwrap();
        let lb = b.forward(&batch(), false).unwrap();
        let lc = c.forward(&batch(), false).unwrap();
        assert_eq!(la.logits, lb.logits);
        assert_ne!(la.logits, lc.logits);
    }

    #[test]
    fn forward_shapes_and_router_logits() {
        let model = MoeModel::synthetic(small_config(), Some(3));
        let out = model.forward(&batch(), true).unwrap();
        assert_eq!(out.logits.shape(), (7, 17));
        let rl = out.router_logits.unwrap();
        assert_eq!(rl.len(), 3);
        for m in &rl {
            assert_eq!(m.shape(), (7, 4));
        }
    }

    #[test]
    fn taps_capture_layer_inputs() {
        let model = MoeModel::synthetic(small_config(), Some(3));
        let guard = model.tap_layer_input(1).unwrap();
        model.forward(&batch(), false).unwrap();
        model.forward(&batch(), false).unwrap();
        assert_eq!(guard.len(), 2);
        let all = guard.take_concat().unwrap();
        assert_eq!(all.shape(), (14, 6));

        drop(guard);
        // no tap registered anymore; forward untouched
        model.forward(&batch(), false).unwrap();
    }

    #[test]
    fn knowledge_pass_with_ones_mask_matches_forward() {
        let model = MoeModel::synthetic(small_config(), Some(11));
        let masks = Matrix::full(4, 8, 1.0);
        let pass = model
            .knowledge_pass(0, &masks, &batch(), 2.0, None)
            .unwrap();
        // self-target KL is zero, so the prediction gradient vanishes
        assert!(pass.kl_div.abs() < 1e-5);
        assert_eq!(pass.mask_grad.shape(), (4, 8));
        assert!(pass.mask_grad.data().iter().all(|&v| v.abs() < 1e-5));
        assert_eq!(pass.expert_inputs.len(), 4);
        let routed: usize = pass.expert_inputs.iter().map(|m| m.rows()).sum();
        // top-2 routing over 7 tokens
        assert_eq!(routed, 14);
    }

    #[test]
    fn mask_grad_matches_finite_difference() {
        let model = MoeModel::synthetic(small_config(), Some(23));
        let b = batch();
        let temperature = 2.0;
        // fixed target from a perturbed pass so the gradient is nonzero
        let mut ref_masks = Matrix::full(4, 8, 1.0);
        ref_masks.set(0, 0, 0.5);
        ref_masks.set(2, 3, 0.25);
        let target = model
            .knowledge_pass(1, &ref_masks, &b, temperature, None)
            .unwrap()
            .soft_output;

        let masks = Matrix::full(4, 8, 1.0);
        let pass = model
            .knowledge_pass(1, &masks, &b, temperature, Some(&target))
            .unwrap();

        let eps = 1e-2f32;
        for &(slot, j) in &[(0usize, 0usize), (1, 4), (3, 7)] {
            let mut plus = masks.clone();
            plus.set(slot, j, 1.0 + eps);
            let mut minus = masks.clone();
            minus.set(slot, j, 1.0 - eps);
            let kp = model
                .knowledge_pass(1, &plus, &b, temperature, Some(&target))
                .unwrap()
                .kl_div;
            let km = model
                .knowledge_pass(1, &minus, &b, temperature, Some(&target))
                .unwrap()
                .kl_div;
            let fd = (kp - km) / (2.0 * eps);
            let an = pass.mask_grad.get(slot, j);
            assert!(
                (fd - an).abs() < 1e-3 + 0.05 * fd.abs().max(an.abs()),
                "slot {slot} unit {j}: fd {fd} vs analytic {an}"
            );
        }
    }
}
