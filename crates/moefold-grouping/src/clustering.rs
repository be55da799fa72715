//! Clustering-based group assignment: k-means, agglomerative, silhouette.

use std::collections::BTreeMap;

use rand::rngs::StdRng;
use rand::Rng;
use tracing::{debug, info};

use crate::collect::{collect_layer_captures, subsample_rows, LayerCaptures};
use crate::config::{ClusterMethod, Linkage, SimilarityBasis};
use crate::error::{Error, Result};
use crate::grouper::Grouper;
use crate::similarity::{expert_outputs, expert_weight_matrix, router_weight_matrix};
use moefold_core::{ops, Matrix};
use moefold_model::{CalibBatch, MoeModel};

fn euclidean_sq(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(&x, &y)| (x - y) * (x - y)).sum()
}

/// Seeded k-means with k-means++ initialization.
///
/// Empty clusters are reseeded with the point farthest from its centroid.
pub(crate) fn kmeans(
    points: &Matrix,
    k: usize,
    rng: &mut StdRng,
    max_iters: usize,
) -> (Vec<usize>, Matrix) {
    let n = points.rows();
    let dim = points.cols();
    let mut centroids = Matrix::zeros(k, dim);

    // k-means++: first centroid uniform, the rest by squared-distance mass
    let first = rng.gen_range(0..n);
    centroids.row_mut(0).copy_from_slice(points.row(first));
    let mut dists: Vec<f32> = (0..n)
        .map(|p| euclidean_sq(points.row(p), centroids.row(0)))
        .collect();
    for c in 1..k {
        let total: f32 = dists.iter().sum();
        let pick = if total <= 0.0 {
            rng.gen_range(0..n)
        } else {
            let mut target = rng.gen_range(0.0..total);
            let mut chosen = n - 1;
            for (p, &d) in dists.iter().enumerate() {
                if target < d {
                    chosen = p;
                    break;
                }
                target -= d;
            }
            chosen
        };
        centroids.row_mut(c).copy_from_slice(points.row(pick));
        for (p, d) in dists.iter_mut().enumerate() {
            *d = d.min(euclidean_sq(points.row(p), centroids.row(c)));
        }
    }

    let mut labels = vec![0usize; n];
    for _ in 0..max_iters {
        let mut changed = false;
        for p in 0..n {
            let best = (0..k)
                .min_by(|&a, &b| {
                    euclidean_sq(points.row(p), centroids.row(a))
                        .partial_cmp(&euclidean_sq(points.row(p), centroids.row(b)))
                        .unwrap_or(std::cmp::Ordering::Equal)
                })
                .unwrap_or(0);
            if labels[p] != best {
                labels[p] = best;
                changed = true;
            }
        }
        let mut counts = vec![0usize; k];
        let mut sums = Matrix::zeros(k, dim);
        for p in 0..n {
            counts[labels[p]] += 1;
            let dst = sums.row_mut(labels[p]);
            for (d, &v) in dst.iter_mut().zip(points.row(p)) {
                *d += v;
            }
        }
        for c in 0..k {
            if counts[c] == 0 {
                // reseed with the point farthest from its own centroid
                let far = (0..n)
                    .max_by(|&a, &b| {
                        euclidean_sq(points.row(a), centroids.row(labels[a]))
                            .partial_cmp(&euclidean_sq(points.row(b), centroids.row(labels[b])))
                            .unwrap_or(std::cmp::Ordering::Equal)
                    })
                    .unwrap_or(0);
                centroids.row_mut(c).copy_from_slice(points.row(far));
                labels[far] = c;
                changed = true;
            } else {
                let inv = 1.0 / counts[c] as f32;
                let src = sums.row(c);
                let dst = centroids.row_mut(c);
                for (d, &s) in dst.iter_mut().zip(src) {
                    *d = s * inv;
                }
            }
        }
        if !changed {
            break;
        }
    }
    (labels, centroids)
}

/// Agglomerative clustering down to `k` clusters under a linkage rule.
pub(crate) fn agglomerative(points: &Matrix, k: usize, linkage: Linkage) -> Vec<usize> {
    let n = points.rows();
    let mut clusters: Vec<Vec<usize>> = (0..n).map(|p| vec![p]).collect();
    let dist = |a: &[usize], b: &[usize]| -> f32 {
        let mut acc: f32 = match linkage {
            Linkage::Single => f32::INFINITY,
            Linkage::Complete => 0.0,
            Linkage::Average => 0.0,
        };
        for &x in a {
            for &y in b {
                let d = euclidean_sq(points.row(x), points.row(y)).sqrt();
                match linkage {
                    Linkage::Single => acc = acc.min(d),
                    Linkage::Complete => acc = acc.max(d),
                    Linkage::Average => acc += d,
                }
            }
        }
        if linkage == Linkage::Average {
            acc /= (a.len() * b.len()) as f32;
        }
        acc
    };
    while clusters.len() > k.max(1) {
        let mut best = (0usize, 1usize, f32::INFINITY);
        for i in 0..clusters.len() {
            for j in i + 1..clusters.len() {
                let d = dist(&clusters[i], &clusters[j]);
                if d < best.2 {
                    best = (i, j, d);
                }
            }
        }
        let merged = clusters.remove(best.1);
        clusters[best.0].extend(merged);
    }
    let mut labels = vec![0usize; n];
    for (c, members) in clusters.iter().enumerate() {
        for &m in members {
            labels[m] = c;
        }
    }
    labels
}

/// Mean silhouette coefficient; singleton clusters score zero.
pub(crate) fn silhouette(points: &Matrix, labels: &[usize]) -> f32 {
    let n = points.rows();
    let k = labels.iter().copied().max().map_or(0, |m| m + 1);
    if n < 2 || k < 2 {
        return 0.0;
    }
    let mut total = 0.0f32;
    for p in 0..n {
        let own = labels[p];
        let mut intra = 0.0f32;
        let mut intra_count = 0usize;
        let mut inter = vec![(0.0f32, 0usize); k];
        for q in 0..n {
            if q == p {
                continue;
            }
            let d = euclidean_sq(points.row(p), points.row(q)).sqrt();
            if labels[q] == own {
                intra += d;
                intra_count += 1;
            } else {
                inter[labels[q]].0 += d;
                inter[labels[q]].1 += 1;
            }
        }
        if intra_count == 0 {
            continue;
        }
        let a = intra / intra_count as f32;
        let b = inter
            .iter()
            .filter(|(_, c)| *c > 0)
            .map(|(s, c)| s / *c as f32)
            .fold(f32::INFINITY, f32::min);
        if b.is_finite() {
            total += (b - a) / a.max(b);
        }
    }
    total / n as f32
}

/// Z-score each representation's columns, then concatenate horizontally.
fn standardize_concat(parts: &[Matrix]) -> Result<Matrix> {
    let mut scaled = Vec::with_capacity(parts.len());
    for p in parts {
        let means = p.col_means();
        let stds = p.col_stds(&means);
        let mut z = p.clone();
        for r in 0..z.rows() {
            for (j, v) in z.row_mut(r).iter_mut().enumerate() {
                let s = if stds[j] > 0.0 { stds[j] } else { 1.0 };
                *v = (*v - means[j]) / s;
            }
        }
        scaled.push(z);
    }
    let refs: Vec<&Matrix> = scaled.iter().collect();
    Ok(Matrix::hstack(&refs)?)
}

impl Grouper {
    fn representations(
        &self,
        model: &MoeModel,
        caps: Option<&LayerCaptures>,
        layer: usize,
    ) -> Result<Vec<Matrix>> {
        let basis = self.config.similarity_basis;
        let moe = model.layer(layer)?;
        let mut parts = Vec::new();
        let wants_logits = matches!(
            basis,
            SimilarityBasis::RouterLogits
                | SimilarityBasis::RouterLogitsAndWeight
                | SimilarityBasis::RouterLogitsAndExpertOutput
                | SimilarityBasis::RouterLogitsAndWeightAndExpertOutput
        );
        let wants_weight = matches!(
            basis,
            SimilarityBasis::Weight
                | SimilarityBasis::WeightAndExpertOutput
                | SimilarityBasis::RouterLogitsAndWeight
                | SimilarityBasis::RouterLogitsAndWeightAndExpertOutput
        );
        let wants_output = matches!(
            basis,
            SimilarityBasis::ExpertOutput
                | SimilarityBasis::WeightAndExpertOutput
                | SimilarityBasis::RouterLogitsAndExpertOutput
                | SimilarityBasis::RouterLogitsAndWeightAndExpertOutput
        );
        if wants_logits {
            let caps = caps.ok_or_else(|| Error::config("basis needs calibration captures"))?;
            // per-expert softmax routing mass across all tokens
            let logits = &caps.router_logits[&layer];
            let mut probs = logits.clone();
            for t in 0..probs.rows() {
                ops::softmax(probs.row_mut(t));
            }
            parts.push(probs.transpose());
        }
        if wants_weight {
            parts.push(expert_weight_matrix(moe));
        }
        if wants_output {
            let caps = caps.ok_or_else(|| Error::config("basis needs calibration captures"))?;
            let input =
                subsample_rows(&caps.inputs[&layer], self.config.data_limit, self.config.seed);
            let outputs = expert_outputs(moe, &input)?;
            let rows: Vec<Vec<f32>> = outputs.iter().map(|o| o.data().to_vec()).collect();
            parts.push(Matrix::from_rows(&rows)?);
        }
        if basis == SimilarityBasis::RouterWeight {
            parts.push(router_weight_matrix(moe));
        }
        if parts.is_empty() {
            return Err(Error::config(format!(
                "basis {basis:?} yields no clustering representation"
            )));
        }
        Ok(parts)
    }

    fn cluster_points(&self, points: &Matrix, k: usize) -> (Vec<usize>, f32) {
        let labels = match self.config.cluster {
            ClusterMethod::KMeans => {
                let mut rng = self.rng();
                kmeans(points, k, &mut rng, 100).0
            }
            ClusterMethod::Hierarchical(linkage) => agglomerative(points, k, linkage),
        };
        let score = silhouette(points, &labels);
        (labels, score)
    }

    /// Cluster each eligible layer's experts on the configured basis.
    ///
    /// With `num_groups: None` the cluster count is chosen per layer by the
    /// best silhouette score. Returns each layer's dominant expert per
    /// cluster (the member closest to its cluster mean).
    pub fn cluster_experts(
        &mut self,
        model: &MoeModel,
        calib: &[CalibBatch],
        num_groups: Option<usize>,
    ) -> Result<BTreeMap<usize, Vec<usize>>> {
        let basis = self.config.similarity_basis;
        let layers = self.eligible_layers();
        let caps = if basis.needs_calibration() {
            Some(collect_layer_captures(model, calib, &layers, true, true)?)
        } else {
            None
        };

        let mut all_cores = BTreeMap::new();
        for &layer in &layers {
            let parts = self.representations(model, caps.as_ref(), layer)?;
            let points = standardize_concat(&parts)?;
            let n = points.rows();
            let (labels, score) = match num_groups {
                Some(k) => {
                    if k == 0 || k > n {
                        return Err(Error::config(format!(
                            "cannot cluster {n} experts into {k} groups"
                        )));
                    }
                    self.cluster_points(&points, k)
                }
                None => {
                    let mut best: Option<(Vec<usize>, f32)> = None;
                    for k in 2..n {
                        let (labels, score) = self.cluster_points(&points, k);
                        if best.as_ref().is_none_or(|(_, s)| score > *s) {
                            best = Some((labels, score));
                        }
                    }
                    best.ok_or_else(|| {
                        Error::config("need at least 3 experts for silhouette selection")
                    })?
                }
            };
            debug!(layer, silhouette = score, "clustered experts");

            let k = labels.iter().copied().max().map_or(0, |m| m + 1);
            let mut cores = vec![0usize; k];
            for c in 0..k {
                let members: Vec<usize> =
                    (0..n).filter(|&p| labels[p] == c).collect();
                let mut mean = vec![0.0f32; points.cols()];
                for &m in &members {
                    for (acc, &v) in mean.iter_mut().zip(points.row(m)) {
                        *acc += v;
                    }
                }
                let inv = 1.0 / members.len() as f32;
                for v in &mut mean {
                    *v *= inv;
                }
                cores[c] = members
                    .iter()
                    .copied()
                    .min_by(|&a, &b| {
                        euclidean_sq(points.row(a), &mean)
                            .partial_cmp(&euclidean_sq(points.row(b), &mean))
                            .unwrap_or(std::cmp::Ordering::Equal)
                    })
                    .unwrap_or(members[0]);
            }

            let state = self.state_mut(layer)?;
            state.labels = labels;
            state.cores = cores.clone();
            all_cores.insert(layer, cores);
        }
        info!(layers = layers.len(), ?basis, "clustering assignment done");
        Ok(all_cores)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GrouperConfig;
    use moefold_model::ModelConfig;
    use rand::SeedableRng;

    fn two_blob_points() -> Matrix {
        Matrix::from_rows(&[
            vec![0.0, 0.0],
            vec![0.1, -0.1],
            vec![0.05, 0.05],
            vec![5.0, 5.0],
            vec![5.1, 4.9],
            vec![4.9, 5.1],
        ])
        .unwrap()
    }

    #[test]
    fn kmeans_separates_blobs() {
        let points = two_blob_points();
        let mut rng = rand::rngs::StdRng::seed_from_u64(3);
        let (labels, centroids) = kmeans(&points, 2, &mut rng, 50);
        assert_eq!(centroids.shape(), (2, 2));
        assert_eq!(labels[0], labels[1]);
        assert_eq!(labels[0], labels[2]);
        assert_eq!(labels[3], labels[4]);
        assert_eq!(labels[3], labels[5]);
        assert_ne!(labels[0], labels[3]);
    }

    #[test]
    fn agglomerative_matches_blobs_for_all_linkages() {
        let points = two_blob_points();
        for linkage in [Linkage::Single, Linkage::Complete, Linkage::Average] {
            let labels = agglomerative(&points, 2, linkage);
            assert_eq!(labels[0], labels[1]);
            assert_eq!(labels[3], labels[4]);
            assert_ne!(labels[0], labels[3], "{linkage:?}");
        }
    }

    #[test]
    fn silhouette_prefers_true_split() {
        let points = two_blob_points();
        let good = silhouette(&points, &[0, 0, 0, 1, 1, 1]);
        let bad = silhouette(&points, &[0, 1, 0, 1, 0, 1]);
        assert!(good > bad);
        assert!(good > 0.8);
    }

    #[test]
    fn cluster_experts_labels_every_expert() {
        let mc = ModelConfig {
            vocab_size: 29,
            d_model: 6,
            d_ff: 8,
            num_experts: 4,
            num_layers: 2,
            top_k: 2,
        };
        let model = MoeModel::synthetic(mc.clone(), Some(17));
        let mut grouper = Grouper::new(
            mc,
            GrouperConfig {
                similarity_basis: SimilarityBasis::Weight,
                seed: Some(4),
                ..GrouperConfig::default()
            },
        )
        .unwrap();
        let cores = grouper.cluster_experts(&model, &[], Some(2)).unwrap();
        for layer in grouper.eligible_layers() {
            let state = grouper.state(layer).unwrap();
            assert_eq!(state.labels.len(), 4);
            let k = state.labels.iter().max().unwrap() + 1;
            assert_eq!(state.cores.len(), k);
            for (label, &core) in cores[&layer].iter().enumerate() {
                assert_eq!(state.labels[core], label);
            }
        }
    }

    #[test]
    fn combination_basis_clusters_with_captures() {
        let mc = ModelConfig {
            vocab_size: 29,
            d_model: 6,
            d_ff: 8,
            num_experts: 4,
            num_layers: 1,
            top_k: 2,
        };
        let model = MoeModel::synthetic(mc.clone(), Some(19));
        let mut grouper = Grouper::new(
            mc,
            GrouperConfig {
                similarity_basis: SimilarityBasis::RouterLogitsAndWeight,
                seed: Some(4),
                ..GrouperConfig::default()
            },
        )
        .unwrap();
        let calib = vec![CalibBatch::dense(vec![vec![1, 5, 9, 13, 17]])];
        let cores = grouper.cluster_experts(&model, &calib, Some(2)).unwrap();
        assert_eq!(cores[&0].len(), 2);
    }
}
