// SPDX-License-Identifier: MPL-2.0

//! Helper functions on point sets stored one point per row.

use nalgebra::{DMatrix, DVector};

/// Mean of the squared distances between every source and every target point,
/// further divided by the dimension.
///
/// This is the variance of an isotropic Gaussian centered on source points
/// that would explain the target points without any prior alignment.
pub fn mean_squared_norm_all(source: &DMatrix<f64>, target: &DMatrix<f64>) -> f64 {
    let (n, dim) = source.shape();
    let m = target.nrows();
    let target_t = target.transpose();
    let mut total = 0.0;
    for s in source.transpose().column_iter() {
        for t in target_t.column_iter() {
            total += (s - t).norm_squared();
        }
    }
    total / (dim * n * m) as f64
}

/// Gaussian affinity matrix between all pairs of points:
/// `G[i, j] = exp(-|p_i - p_j|^2 / (2 beta^2))`.
///
/// Symmetric, positive semi-definite, with a unit diagonal.
pub fn gaussian_kernel(points: &DMatrix<f64>, beta: f64) -> DMatrix<f64> {
    let n = points.nrows();
    let points_t = points.transpose();
    let inv_2beta2 = 1.0 / (2.0 * beta * beta);
    let mut g = DMatrix::identity(n, n);
    for i in 0..n {
        for j in (i + 1)..n {
            let dist_sqr = (points_t.column(i) - points_t.column(j)).norm_squared();
            let k = (-dist_sqr * inv_2beta2).exp();
            g[(i, j)] = k;
            g[(j, i)] = k;
        }
    }
    g
}

/// Subtract `offset` from every point.
pub fn centered(points: &DMatrix<f64>, offset: &DVector<f64>) -> DMatrix<f64> {
    translated(points, &(-offset))
}

/// Add `offset` to every point.
pub fn translated(points: &DMatrix<f64>, offset: &DVector<f64>) -> DMatrix<f64> {
    assert_eq!(points.ncols(), offset.len(), "offset dimension mismatch");
    let mut moved = points.clone();
    for (mut col, &o) in moved.column_iter_mut().zip(offset.iter()) {
        col.add_scalar_mut(o);
    }
    moved
}

/// `diag(w) * P`, each point multiplied by its weight.
pub fn scaled_rows(points: &DMatrix<f64>, weights: &DVector<f64>) -> DMatrix<f64> {
    assert_eq!(points.nrows(), weights.len(), "one weight per point");
    let mut scaled = points.clone();
    for mut col in scaled.column_iter_mut() {
        col.component_mul_assign(weights);
    }
    scaled
}

/// `trace(P^T * diag(w) * P)`, the weighted sum of squared norms of the points.
pub fn weighted_trace(points: &DMatrix<f64>, weights: &DVector<f64>) -> f64 {
    points
        .row_iter()
        .zip(weights.iter())
        .map(|(p, w)| w * p.norm_squared())
        .sum()
}

/// Check that all coordinates are finite numbers.
pub fn all_finite(points: &DMatrix<f64>) -> bool {
    points.iter().all(|x| x.is_finite())
}
