// SPDX-License-Identifier: MPL-2.0

//! Maximization steps, one per family of transformations.
//!
//! Given the soft correspondences of an expectation step, each strategy
//! computes the transformation parameters and the noise variance maximizing
//! the expected log-likelihood, in closed form (rigid) or through a linear
//! system (affine, non-rigid).

use nalgebra::{DMatrix, DVector};
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::math::{centered, gaussian_kernel, scaled_rows, weighted_trace};
use crate::registration::{EstepResult, MstepResult};
use crate::transformation::Transformation;

/// Lowest variance an M-step may return.
///
/// Noise-free fits drive the residual to zero, or slightly below with rounding.
pub const SIGMA2_FLOOR: f64 = f32::EPSILON as f64;

/// Parameter estimation algorithm of a registration,
/// holding only the state its family of transformations needs.
#[derive(Debug, Clone)]
pub enum MaximizationStrategy {
    /// Rotation, translation and uniform scale (similarity).
    Rigid,
    /// Linear map and translation.
    Affine,
    /// Smooth displacement field regularized by a Gaussian kernel.
    NonRigid {
        /// Gaussian affinity between all pairs of source points.
        kernel: Arc<DMatrix<f64>>,
        /// Width of the Gaussian kernel.
        beta: f64,
        /// Weight of the smoothness regularization.
        lambda: f64,
    },
}

impl MaximizationStrategy {
    /// Non-rigid strategy for the given source points.
    /// The kernel matrix is computed here, once.
    pub fn nonrigid(source: &DMatrix<f64>, beta: f64, lambda: f64) -> Self {
        MaximizationStrategy::NonRigid {
            kernel: Arc::new(gaussian_kernel(source, beta)),
            beta,
            lambda,
        }
    }

    /// The same strategy, rebuilt for a new set of source points.
    pub fn rebuild(&self, source: &DMatrix<f64>) -> Self {
        match self {
            MaximizationStrategy::NonRigid { beta, lambda, .. } => {
                Self::nonrigid(source, *beta, *lambda)
            }
            other => other.clone(),
        }
    }

    /// Transformation leaving the source untouched.
    pub fn identity(&self, dim: usize) -> Transformation {
        match self {
            MaximizationStrategy::Rigid => Transformation::identity_rigid(dim),
            MaximizationStrategy::Affine => Transformation::identity_affine(dim),
            MaximizationStrategy::NonRigid { kernel, .. } => {
                Transformation::identity_nonrigid(Arc::clone(kernel), dim)
            }
        }
    }

    /// Update the transformation and variance from the soft correspondences.
    ///
    /// `sigma2_prev` is the variance of the previous iteration,
    /// only used as regularization scale by the non-rigid strategy.
    pub fn maximization_step(
        &self,
        source: &DMatrix<f64>,
        target: &DMatrix<f64>,
        estep: &EstepResult,
        sigma2_prev: f64,
    ) -> Result<MstepResult> {
        if !(estep.n_p > 0.0 && estep.n_p.is_finite()) {
            return Err(Error::DegenerateResponsibilities(
                "total responsibility mass is not positive",
            ));
        }
        match self {
            MaximizationStrategy::Rigid => rigid(source, target, estep),
            MaximizationStrategy::Affine => affine(source, target, estep),
            MaximizationStrategy::NonRigid { kernel, lambda, .. } => {
                nonrigid(source, target, estep, sigma2_prev, kernel, *lambda)
            }
        }
    }
}

/// Weighted centroids and cross-covariance shared by the rigid and affine steps.
struct Moments {
    mu_x: DVector<f64>,
    mu_y: DVector<f64>,
    target_hat: DMatrix<f64>,
    source_hat: DMatrix<f64>,
    a: DMatrix<f64>,
}

impl Moments {
    fn new(source: &DMatrix<f64>, target: &DMatrix<f64>, estep: &EstepResult) -> Self {
        let EstepResult { p1, px, n_p, .. } = estep;
        let mu_x = px.row_sum().transpose() / *n_p;
        let mu_y = source.transpose() * p1 / *n_p;
        let target_hat = centered(target, &mu_x);
        let source_hat = centered(source, &mu_y);
        let a = px.transpose() * &source_hat - &mu_x * (p1.transpose() * &source_hat);
        Moments {
            mu_x,
            mu_y,
            target_hat,
            source_hat,
            a,
        }
    }
}

/// Weighted Procrustes problem with uniform scale.
fn rigid(source: &DMatrix<f64>, target: &DMatrix<f64>, estep: &EstepResult) -> Result<MstepResult> {
    let EstepResult { pt1, p1, n_p, .. } = estep;
    let dim = source.ncols();
    let Moments {
        mu_x,
        mu_y,
        target_hat,
        source_hat,
        a,
    } = Moments::new(source, target, estep);

    // Closest rotation, forcing a determinant of +1.
    let svd = a.clone().svd(true, true);
    let u = svd.u.ok_or(Error::SvdFailed)?;
    let v_t = svd.v_t.ok_or(Error::SvdFailed)?;
    let mut c = DVector::from_element(dim, 1.0);
    c[dim - 1] = (&u * &v_t).determinant().signum();
    let rotation = &u * DMatrix::from_diagonal(&c) * &v_t;

    let tr_atr = (a.transpose() * &rotation).trace();
    let tr_yp1y = weighted_trace(&source_hat, p1);
    if !(tr_yp1y > 0.0) {
        return Err(Error::DegenerateResponsibilities(
            "source points have no weighted spread",
        ));
    }
    let scale = tr_atr / tr_yp1y;
    let translation = &mu_x - &rotation * &mu_y * scale;

    let tr_xp1x = weighted_trace(&target_hat, pt1);
    let sigma2 = ((tr_xp1x - scale * tr_atr) / (n_p * dim as f64)).max(SIGMA2_FLOOR);
    let q = (tr_xp1x - 2.0 * scale * tr_atr + scale * scale * tr_yp1y) / (2.0 * sigma2)
        + dim as f64 * n_p * 0.5 * sigma2.ln();

    Ok(MstepResult {
        transformation: Transformation::Rigid {
            rotation,
            translation,
            scale,
        },
        sigma2,
        q,
    })
}

/// Weighted linear least squares.
fn affine(source: &DMatrix<f64>, target: &DMatrix<f64>, estep: &EstepResult) -> Result<MstepResult> {
    let EstepResult { pt1, p1, n_p, .. } = estep;
    let dim = source.ncols();
    let Moments {
        mu_x,
        mu_y,
        target_hat,
        source_hat,
        a,
    } = Moments::new(source, target, estep);

    // B = A * YP1Y^-1, through the transposed system YP1Y^T * B^T = A^T.
    let yp1y = source_hat.transpose() * scaled_rows(&source_hat, p1);
    let linear = yp1y
        .transpose()
        .lu()
        .solve(&a.transpose())
        .filter(|b_t| b_t.iter().all(|x| x.is_finite()))
        .ok_or(Error::SingularSystem("affine"))?
        .transpose();
    let translation = &mu_x - &linear * &mu_y;

    let tr_xp1x = weighted_trace(&target_hat, pt1);
    let tr_xpyb = (&a * linear.transpose()).trace();
    let sigma2 = ((tr_xp1x - tr_xpyb) / (n_p * dim as f64)).max(SIGMA2_FLOOR);
    let tr_ab = (&a * linear.transpose()).trace();
    let q = (tr_xp1x - 2.0 * tr_ab + tr_xpyb) / (2.0 * sigma2)
        + dim as f64 * n_p * 0.5 * sigma2.ln();

    Ok(MstepResult {
        transformation: Transformation::Affine {
            linear,
            translation,
        },
        sigma2,
        q,
    })
}

/// Regularized displacement field.
/// The returned objective is the variance itself.
fn nonrigid(
    source: &DMatrix<f64>,
    target: &DMatrix<f64>,
    estep: &EstepResult,
    sigma2_prev: f64,
    kernel: &Arc<DMatrix<f64>>,
    lambda: f64,
) -> Result<MstepResult> {
    let EstepResult { pt1, p1, px, n_p } = estep;
    let dim = source.ncols();

    // diag(1 / p1), with p1 that must be strictly positive.
    let p1_inv = p1.map(|p| 1.0 / p);
    if !p1_inv.iter().all(|x| x.is_finite() && *x > 0.0) {
        return Err(Error::DegenerateResponsibilities(
            "a source point received no responsibility",
        ));
    }

    // (G + lambda * sigma2_prev * diag(1 / p1)) * W = diag(1 / p1) * PX - Y
    let mut system = kernel.as_ref().clone();
    for (i, inv) in p1_inv.iter().enumerate() {
        system[(i, i)] += lambda * sigma2_prev * inv;
    }
    let rhs = scaled_rows(px, &p1_inv) - source;
    let coefficients = system
        .lu()
        .solve(&rhs)
        .filter(|w| w.iter().all(|x| x.is_finite()))
        .ok_or(Error::SingularSystem("non-rigid"))?;

    let t = source + kernel.as_ref() * &coefficients;
    let tr_xp1x = weighted_trace(target, pt1);
    let tr_pxt = px.dot(&t);
    let tr_tp1t = weighted_trace(&t, p1);
    let sigma2 =
        ((tr_xp1x - 2.0 * tr_pxt + tr_tp1t) / (n_p * dim as f64)).max(SIGMA2_FLOOR);

    Ok(MstepResult {
        transformation: Transformation::NonRigid {
            kernel: Arc::clone(kernel),
            coefficients,
        },
        sigma2,
        q: sigma2,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Hard one-to-one correspondences between source row i and target row i.
    fn hard_estep(target: &DMatrix<f64>) -> EstepResult {
        let m = target.nrows();
        EstepResult {
            pt1: DVector::from_element(m, 1.0),
            p1: DVector::from_element(m, 1.0),
            px: target.clone(),
            n_p: m as f64,
        }
    }

    fn square() -> DMatrix<f64> {
        DMatrix::from_row_slice(4, 2, &[0.0, 0.0, 2.0, 0.0, 2.0, 1.0, 0.0, 1.0])
    }

    #[test]
    fn rigid_solves_procrustes_with_hard_correspondences() {
        let source = square();
        let (sin, cos) = 0.3_f64.sin_cos();
        let rotation = DMatrix::from_row_slice(2, 2, &[cos, -sin, sin, cos]);
        let translation = DVector::from_vec(vec![1.0, -2.0]);
        let truth = Transformation::Rigid {
            rotation: rotation.clone(),
            translation: translation.clone(),
            scale: 1.5,
        };
        let target = truth.transform(&source);
        let res = MaximizationStrategy::Rigid
            .maximization_step(&source, &target, &hard_estep(&target), 1.0)
            .unwrap();
        match res.transformation {
            Transformation::Rigid {
                rotation: r,
                translation: t,
                scale,
            } => {
                assert!((r - rotation).norm() < 1e-10);
                assert!((t - translation).norm() < 1e-10);
                assert!((scale - 1.5).abs() < 1e-10);
            }
            other => panic!("unexpected transformation {:?}", other),
        }
        assert_eq!(res.sigma2, SIGMA2_FLOOR);
    }

    #[test]
    fn rigid_never_returns_a_reflection() {
        let source = square();
        // Mirror image along the x axis.
        let target = &source * DMatrix::from_diagonal(&DVector::from_vec(vec![-1.0, 1.0]));
        let res = MaximizationStrategy::Rigid
            .maximization_step(&source, &target, &hard_estep(&target), 1.0)
            .unwrap();
        if let Transformation::Rigid { rotation, .. } = res.transformation {
            assert!((rotation.determinant() - 1.0).abs() < 1e-10);
            let rrt = &rotation * rotation.transpose();
            assert!((rrt - DMatrix::identity(2, 2)).norm() < 1e-10);
        } else {
            panic!("rigid strategy must return a rigid transformation");
        }
        assert!(res.sigma2 > SIGMA2_FLOOR);
    }

    #[test]
    fn affine_solves_least_squares_with_hard_correspondences() {
        let source = square();
        let linear = DMatrix::from_row_slice(2, 2, &[1.2, 0.4, -0.1, 0.8]);
        let truth = Transformation::Affine {
            linear: linear.clone(),
            translation: DVector::from_vec(vec![0.5, 0.5]),
        };
        let target = truth.transform(&source);
        let res = MaximizationStrategy::Affine
            .maximization_step(&source, &target, &hard_estep(&target), 1.0)
            .unwrap();
        assert!((res.transformation.transform(&source) - &target).norm() < 1e-10);
        if let Transformation::Affine { linear: b, .. } = res.transformation {
            assert!((b - linear).norm() < 1e-10);
        }
    }

    #[test]
    fn affine_fails_on_collinear_source() {
        let source = DMatrix::from_row_slice(3, 2, &[0.0, 0.0, 1.0, 0.0, 2.0, 0.0]);
        let target = source.clone();
        let res = MaximizationStrategy::Affine.maximization_step(
            &source,
            &target,
            &hard_estep(&target),
            1.0,
        );
        assert!(matches!(res, Err(Error::SingularSystem("affine"))));
    }

    #[test]
    fn nonrigid_reports_variance_as_objective() {
        let source = square();
        let target = &source + DMatrix::from_element(4, 2, 0.1);
        let strategy = MaximizationStrategy::nonrigid(&source, 2.0, 2.0);
        let res = strategy
            .maximization_step(&source, &target, &hard_estep(&target), 0.5)
            .unwrap();
        assert_eq!(res.q, res.sigma2);
        // Pulled toward the target, but not all the way.
        let before = (&source - &target).norm();
        let after = (res.transformation.transform(&source) - &target).norm();
        assert!(after < before);
        assert!(after > 0.0);
    }

    #[test]
    fn nonrigid_rejects_empty_responsibilities() {
        let source = square();
        let target = source.clone();
        let mut estep = hard_estep(&target);
        estep.p1[2] = 0.0;
        let strategy = MaximizationStrategy::nonrigid(&source, 2.0, 2.0);
        let res = strategy.maximization_step(&source, &target, &estep, 1.0);
        assert!(matches!(res, Err(Error::DegenerateResponsibilities(_))));
    }

    #[test]
    fn every_strategy_rejects_zero_responsibility_mass() {
        let source = square();
        let estep = EstepResult {
            pt1: DVector::zeros(4),
            p1: DVector::zeros(4),
            px: DMatrix::zeros(4, 2),
            n_p: 0.0,
        };
        let strategies = [
            MaximizationStrategy::Rigid,
            MaximizationStrategy::Affine,
            MaximizationStrategy::nonrigid(&source, 2.0, 2.0),
        ];
        for strategy in strategies.iter() {
            let res = strategy.maximization_step(&source, &source, &estep, 1.0);
            assert!(matches!(res, Err(Error::DegenerateResponsibilities(_))));
        }
    }

    #[test]
    fn rebuild_recomputes_the_kernel() {
        let strategy = MaximizationStrategy::nonrigid(&square(), 1.0, 3.0);
        let other = DMatrix::from_row_slice(2, 2, &[0.0, 0.0, 1.0, 0.0]);
        match strategy.rebuild(&other) {
            MaximizationStrategy::NonRigid {
                kernel,
                beta,
                lambda,
            } => {
                assert_eq!(kernel.shape(), (2, 2));
                assert_eq!((beta, lambda), (1.0, 3.0));
            }
            other => panic!("unexpected strategy {:?}", other),
        }
    }
}
