// SPDX-License-Identifier: MPL-2.0

//! Weighted sums of Gaussian kernels.
//!
//! The expectation step only needs to evaluate, at every query point,
//! the sum over reference points of `w_j * exp(-|q - r_j|^2 / h^2)`.
//! How this sum is computed is left to implementors of [`GaussTransform`]:
//! a direct evaluation is provided, tree-based or fast Gauss transforms
//! can be plugged in instead.

use nalgebra::{DMatrix, DVector};

/// Evaluator of weighted Gaussian sums.
///
/// Point sets have one point per row.
pub trait GaussTransform {
    /// For every query point (row of `query`) and every weight channel
    /// (column of `weights`), sum over the reference points of the weight
    /// times `exp(-|query - reference|^2 / bandwidth^2)`.
    ///
    /// `weights` has one row per reference point, the result has one row
    /// per query point and as many columns as `weights`.
    fn compute(
        &self,
        reference: &DMatrix<f64>,
        bandwidth: f64,
        query: &DMatrix<f64>,
        weights: &DMatrix<f64>,
    ) -> DMatrix<f64>;

    /// Same as [`compute`](GaussTransform::compute) with a unit weight per reference point.
    fn compute_unweighted(
        &self,
        reference: &DMatrix<f64>,
        bandwidth: f64,
        query: &DMatrix<f64>,
    ) -> DVector<f64> {
        let ones = DMatrix::from_element(reference.nrows(), 1, 1.0);
        let sums = self.compute(reference, bandwidth, query, &ones);
        sums.column(0).into_owned()
    }
}

/// Exact evaluation of the sums, in O(query x reference x channels).
#[derive(Debug, Clone, Copy, Default)]
pub struct Direct;

impl GaussTransform for Direct {
    fn compute(
        &self,
        reference: &DMatrix<f64>,
        bandwidth: f64,
        query: &DMatrix<f64>,
        weights: &DMatrix<f64>,
    ) -> DMatrix<f64> {
        assert_eq!(reference.ncols(), query.ncols(), "points dimension mismatch");
        assert_eq!(reference.nrows(), weights.nrows(), "one weight row per reference point");
        let inv_h2 = 1.0 / (bandwidth * bandwidth);
        let channels = weights.ncols();

        // Transposed copies so that each point is a contiguous column.
        let reference_t = reference.transpose();
        let query_t = query.transpose();

        let mut sums = DMatrix::zeros(query.nrows(), channels);
        let mut kernel = vec![0.0; reference.nrows()];
        for (i, q) in query_t.column_iter().enumerate() {
            for (k, r) in kernel.iter_mut().zip(reference_t.column_iter()) {
                let dist_sqr: f64 = q.iter().zip(r.iter()).map(|(a, b)| (a - b) * (a - b)).sum();
                *k = (-dist_sqr * inv_h2).exp();
            }
            for c in 0..channels {
                let w = weights.column(c);
                sums[(i, c)] = kernel.iter().zip(w.iter()).map(|(k, w)| k * w).sum();
            }
        }
        sums
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_kernel_at_one_bandwidth() {
        let reference = DMatrix::from_row_slice(1, 2, &[0.0, 0.0]);
        let query = DMatrix::from_row_slice(2, 2, &[0.0, 0.0, 0.5, 0.0]);
        let sums = Direct.compute_unweighted(&reference, 0.5, &query);
        assert!((sums[0] - 1.0).abs() < 1e-12);
        assert!((sums[1] - (-1.0_f64).exp()).abs() < 1e-12);
    }

    #[test]
    fn weights_are_applied_per_channel() {
        let reference = DMatrix::from_row_slice(2, 1, &[0.0, 10.0]);
        let query = DMatrix::from_row_slice(1, 1, &[0.0]);
        let weights = DMatrix::from_row_slice(2, 2, &[2.0, -1.0, 5.0, 5.0]);
        let sums = Direct.compute(&reference, 1.0, &query, &weights);
        assert_eq!(sums.shape(), (1, 2));
        // The second reference point is 10 bandwidths away and vanishes.
        assert!((sums[(0, 0)] - 2.0).abs() < 1e-12);
        assert!((sums[(0, 1)] + 1.0).abs() < 1e-12);
    }

    #[test]
    fn sums_over_all_reference_points() {
        let reference = DMatrix::from_row_slice(3, 1, &[-1.0, 0.0, 1.0]);
        let query = DMatrix::from_row_slice(1, 1, &[0.0]);
        let sums = Direct.compute_unweighted(&reference, 1.0, &query);
        let expected = 1.0 + 2.0 * (-1.0_f64).exp();
        assert!((sums[0] - expected).abs() < 1e-12);
    }
}
