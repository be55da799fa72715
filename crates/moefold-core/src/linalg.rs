//! Correlation and pseudo-inverse primitives used by the merge engine.

use crate::error::{Error, Result};
use crate::matrix::Matrix;
use crate::ops::FP32_EPS;

/// Pearson correlation between the column features of `a` and `b`.
///
/// Rows are observations; the result is `a.cols() x b.cols()`. Constant
/// columns produce zero correlation through the stabilized denominator.
pub fn correlation(a: &Matrix, b: &Matrix) -> Result<Matrix> {
    if a.rows() != b.rows() {
        return Err(Error::shape((a.rows(), b.cols()), b.shape()));
    }
    if a.rows() < 2 {
        return Err(Error::invalid(format!(
            "correlation needs at least 2 observations, got {}",
            a.rows()
        )));
    }
    let n = a.rows();
    let mean_a = a.col_means();
    let mean_b = b.col_means();
    let std_a = a.col_stds(&mean_a);
    let std_b = b.col_stds(&mean_b);

    let mut out = Matrix::zeros(a.cols(), b.cols());
    let inv_n1 = 1.0 / (n as f32 - 1.0);
    for r in 0..n {
        let ra = a.row(r);
        let rb = b.row(r);
        for i in 0..a.cols() {
            let da = ra[i] - mean_a[i];
            if da == 0.0 {
                continue;
            }
            let dst = out.row_mut(i);
            for (j, &vb) in rb.iter().enumerate() {
                dst[j] += da * (vb - mean_b[j]);
            }
        }
    }
    for i in 0..a.cols() {
        for j in 0..b.cols() {
            let denom = std_a[i] * std_b[j] + FP32_EPS;
            let v = out.get(i, j) * inv_n1 / denom;
            out.set(i, j, v);
        }
    }
    Ok(out)
}

/// Solve `A x = B` for square `A` by Gaussian elimination with partial
/// pivoting; `B` may carry multiple right-hand sides as columns.
pub fn solve(a: &Matrix, b: &Matrix) -> Result<Matrix> {
    let n = a.rows();
    if a.cols() != n {
        return Err(Error::shape((n, n), a.shape()));
    }
    if b.rows() != n {
        return Err(Error::shape((n, b.cols()), b.shape()));
    }
    let mut lhs = a.clone();
    let mut rhs = b.clone();
    let k = rhs.cols();

    for col in 0..n {
        let mut pivot = col;
        let mut best = lhs.get(col, col).abs();
        for r in col + 1..n {
            let v = lhs.get(r, col).abs();
            if v > best {
                best = v;
                pivot = r;
            }
        }
        if best < 1e-12 {
            return Err(Error::Singular { what: "solve" });
        }
        if pivot != col {
            for c in 0..n {
                let tmp = lhs.get(col, c);
                lhs.set(col, c, lhs.get(pivot, c));
                lhs.set(pivot, c, tmp);
            }
            for c in 0..k {
                let tmp = rhs.get(col, c);
                rhs.set(col, c, rhs.get(pivot, c));
                rhs.set(pivot, c, tmp);
            }
        }
        let inv_p = 1.0 / lhs.get(col, col);
        for r in col + 1..n {
            let factor = lhs.get(r, col) * inv_p;
            if factor == 0.0 {
                continue;
            }
            for c in col..n {
                let v = lhs.get(r, c) - factor * lhs.get(col, c);
                lhs.set(r, c, v);
            }
            for c in 0..k {
                let v = rhs.get(r, c) - factor * rhs.get(col, c);
                rhs.set(r, c, v);
            }
        }
    }

    let mut x = Matrix::zeros(n, k);
    for col in (0..n).rev() {
        for c in 0..k {
            let mut acc = rhs.get(col, c);
            for j in col + 1..n {
                acc -= lhs.get(col, j) * x.get(j, c);
            }
            x.set(col, c, acc / lhs.get(col, col));
        }
    }
    Ok(x)
}

/// Ridge-regularized pseudo-inverse.
///
/// For `m x n` input with `m >= n` computes `(AᵀA + rI)⁻¹ Aᵀ`, otherwise
/// `Aᵀ (AAᵀ + rI)⁻¹`. The ridge keeps rank-deficient permutation matrices
/// solvable without a full SVD.
pub fn pinv(a: &Matrix, ridge: f32) -> Result<Matrix> {
    let at = a.transpose();
    if a.rows() >= a.cols() {
        let mut gram = at.matmul(a)?;
        for i in 0..gram.rows() {
            let v = gram.get(i, i) + ridge;
            gram.set(i, i, v);
        }
        solve(&gram, &at)
    } else {
        let mut gram = a.matmul(&at)?;
        for i in 0..gram.rows() {
            let v = gram.get(i, i) + ridge;
            gram.set(i, i, v);
        }
        let inv = solve(&gram, &Matrix::eye(gram.rows()))?;
        at.matmul(&inv)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn correlation_of_identical_features_is_one() {
        let a = Matrix::new(4, 2, vec![1.0, 2.0, 2.0, 4.0, 3.0, 6.0, 4.0, 8.0]).unwrap();
        let c = correlation(&a, &a).unwrap();
        assert_eq!(c.shape(), (2, 2));
        for i in 0..2 {
            for j in 0..2 {
                assert!((c.get(i, j) - 1.0).abs() < 1e-4, "corr {i},{j}");
            }
        }
    }

    #[test]
    fn correlation_sign() {
        let a = Matrix::new(4, 1, vec![1.0, 2.0, 3.0, 4.0]).unwrap();
        let b = Matrix::new(4, 1, vec![4.0, 3.0, 2.0, 1.0]).unwrap();
        let c = correlation(&a, &b).unwrap();
        assert!((c.get(0, 0) + 1.0).abs() < 1e-4);
    }

    #[test]
    fn solve_recovers_known_solution() {
        let a = Matrix::new(2, 2, vec![2.0, 1.0, 1.0, 3.0]).unwrap();
        let x_true = Matrix::new(2, 1, vec![1.0, -2.0]).unwrap();
        let b = a.matmul(&x_true).unwrap();
        let x = solve(&a, &b).unwrap();
        assert!((x.get(0, 0) - 1.0).abs() < 1e-5);
        assert!((x.get(1, 0) + 2.0).abs() < 1e-5);
    }

    #[test]
    fn solve_rejects_singular() {
        let a = Matrix::new(2, 2, vec![1.0, 2.0, 2.0, 4.0]).unwrap();
        let b = Matrix::new(2, 1, vec![1.0, 2.0]).unwrap();
        assert!(solve(&a, &b).is_err());
    }

    #[test]
    fn pinv_reconstructs_tall_full_rank() {
        let a = Matrix::new(3, 2, vec![1.0, 0.0, 0.0, 1.0, 1.0, 1.0]).unwrap();
        let p = pinv(&a, 1e-6).unwrap();
        assert_eq!(p.shape(), (2, 3));
        let prod = p.matmul(&a).unwrap();
        for i in 0..2 {
            for j in 0..2 {
                let want = if i == j { 1.0 } else { 0.0 };
                assert!((prod.get(i, j) - want).abs() < 1e-3);
            }
        }
    }

    #[test]
    fn pinv_wide_shape() {
        let a = Matrix::new(2, 4, (0..8).map(|i| i as f32 + 1.0).collect()).unwrap();
        let p = pinv(&a, 1e-4).unwrap();
        assert_eq!(p.shape(), (4, 2));
    }
}
