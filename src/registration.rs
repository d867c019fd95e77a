// SPDX-License-Identifier: MPL-2.0

//! Coherent Point Drift registration of two point sets.
//!
//! The source points are the centroids of a Gaussian mixture, all sharing
//! the same isotropic variance, fitted to the target points with
//! Expectation-Maximization. A uniform component absorbs outliers.
//! Each iteration transforms the source with the current estimate,
//! computes soft correspondences (expectation step),
//! then updates the transformation and variance (maximization step),
//! until the objective stops changing or the iteration budget is exhausted.

use nalgebra::{DMatrix, DVector};
use std::f64::consts::PI;
use std::fmt;
use std::str::FromStr;

use crate::error::{Error, Result};
use crate::gauss_transform::{Direct, GaussTransform};
use crate::math::{all_finite, mean_squared_norm_all};
use crate::maximization::{MaximizationStrategy, SIGMA2_FLOOR};
use crate::transformation::Transformation;

/// Value replacing kernel responses that underflow to exactly zero.
pub const KERNEL_RESPONSE_FLOOR: f64 = f32::EPSILON as f64;

/// Outlier weights above this are legal but make the fit very sensitive.
const OUTLIER_WEIGHT_WARNING: f64 = 0.9;

/// Configuration (parameters) of the registration loop.
#[derive(Debug, Clone, Copy)]
pub struct Config {
    /// Prior probability of a target point being an outlier, in [0, 1).
    pub w: f64,
    pub max_iterations: usize,
    /// Stop when the objective changes less than this between two iterations.
    pub tolerance: f64,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            w: 0.0,
            max_iterations: 50,
            tolerance: 1e-3,
        }
    }
}

impl Config {
    fn validate(&self) -> Result<()> {
        if !(0.0..1.0).contains(&self.w) {
            return Err(Error::InvalidParameter {
                name: "w",
                value: self.w,
            });
        }
        if !(self.tolerance >= 0.0) {
            return Err(Error::InvalidParameter {
                name: "tolerance",
                value: self.tolerance,
            });
        }
        if self.w > OUTLIER_WEIGHT_WARNING {
            log::warn!(
                "Outlier weight {} is close to 1, correspondences will be dominated by outliers",
                self.w
            );
        }
        Ok(())
    }
}

/// Parameters specific to non-rigid registration.
#[derive(Debug, Clone, Copy)]
pub struct NonRigidOptions {
    /// Width of the Gaussian kernel coupling neighboring source points.
    pub beta: f64,
    /// Weight of the smoothness regularization of the displacement field.
    pub lambda: f64,
}

impl Default for NonRigidOptions {
    fn default() -> Self {
        NonRigidOptions {
            beta: 2.0,
            lambda: 2.0,
        }
    }
}

impl NonRigidOptions {
    fn validate(&self) -> Result<()> {
        if !(self.beta > 0.0 && self.beta.is_finite()) {
            return Err(Error::InvalidParameter {
                name: "beta",
                value: self.beta,
            });
        }
        if !(self.lambda >= 0.0 && self.lambda.is_finite()) {
            return Err(Error::InvalidParameter {
                name: "lambda",
                value: self.lambda,
            });
        }
        Ok(())
    }
}

/// Family of transformations estimated by a registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransformationType {
    Rigid,
    Affine,
    NonRigid,
}

impl FromStr for TransformationType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "rigid" => Ok(TransformationType::Rigid),
            "affine" => Ok(TransformationType::Affine),
            "nonrigid" => Ok(TransformationType::NonRigid),
            _ => Err(Error::UnknownTransformation(s.to_string())),
        }
    }
}

impl fmt::Display for TransformationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TransformationType::Rigid => "rigid",
            TransformationType::Affine => "affine",
            TransformationType::NonRigid => "nonrigid",
        };
        f.write_str(name)
    }
}

/// Soft correspondences computed by the expectation step.
#[derive(Debug, Clone)]
pub struct EstepResult {
    /// For each target point, its probability of not being an outlier.
    pub pt1: DVector<f64>,
    /// For each source point, the total responsibility it received.
    pub p1: DVector<f64>,
    /// For each source point, the responsibility-weighted sum of target points.
    pub px: DMatrix<f64>,
    /// Total responsibility mass, sum of `p1`.
    pub n_p: f64,
}

/// Estimate produced by a maximization step.
#[derive(Debug, Clone)]
pub struct MstepResult {
    pub transformation: Transformation,
    /// Isotropic noise variance, always positive.
    pub sigma2: f64,
    /// Objective used for the convergence test.
    pub q: f64,
}

/// How the registration loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    /// The objective changed less than the tolerance.
    Converged,
    /// The iteration budget was spent.
    Exhausted,
}

/// Outcome of a registration.
#[derive(Debug, Clone)]
pub struct Registered {
    /// Latest estimate.
    pub result: MstepResult,
    /// Number of EM iterations performed.
    pub iterations: usize,
    pub termination: Termination,
}

/// Expectation step: soft correspondences between transformed source
/// points `t_source` and `target`, for the variance `sigma2` and the outlier weight `w`.
pub fn expectation_step<G: GaussTransform + ?Sized>(
    gauss: &G,
    t_source: &DMatrix<f64>,
    target: &DMatrix<f64>,
    sigma2: f64,
    w: f64,
) -> EstepResult {
    assert_eq!(t_source.ncols(), target.ncols(), "points dimension mismatch");
    let (n, dim) = t_source.shape();
    let m = target.nrows();
    let h = (2.0 * sigma2).sqrt();
    let c = (2.0 * PI * sigma2).powf(dim as f64 * 0.5) * w / (1.0 - w) * n as f64 / m as f64;

    // Density of the mixture (up to normalization) at each target point.
    let mut kt1 = gauss.compute_unweighted(t_source, h, target);
    kt1.apply(|k| {
        if *k == 0.0 {
            *k = KERNEL_RESPONSE_FLOOR
        }
    });
    let a = kt1.map(|k| 1.0 / (k + c));
    let pt1 = a.map(|a| 1.0 - c * a);

    // p1 and px share the same kernel, evaluated once with 1 + dim weight channels.
    let mut weights = DMatrix::zeros(m, dim + 1);
    weights.set_column(0, &a);
    for j in 0..dim {
        weights.set_column(j + 1, &target.column(j).component_mul(&a));
    }
    let sums = gauss.compute(target, h, t_source, &weights);
    let p1 = sums.column(0).into_owned();
    let px = sums.columns(1, dim).into_owned();
    let n_p = p1.sum();

    EstepResult { pt1, p1, px, n_p }
}

/// Coherent Point Drift registrar of a fixed set of source points.
///
/// The Gaussian sums of the expectation step are delegated to `G`,
/// exact evaluation by default.
#[derive(Debug, Clone)]
pub struct Cpd<G = Direct> {
    source: DMatrix<f64>,
    strategy: MaximizationStrategy,
    gauss: G,
}

impl Cpd<Direct> {
    /// Registrar for the given family of transformations.
    /// `options` are only used by the non-rigid family.
    pub fn new(
        source: DMatrix<f64>,
        tf_type: TransformationType,
        options: &NonRigidOptions,
    ) -> Result<Self> {
        check_points(&source, "source")?;
        let strategy = match tf_type {
            TransformationType::Rigid => MaximizationStrategy::Rigid,
            TransformationType::Affine => MaximizationStrategy::Affine,
            TransformationType::NonRigid => {
                options.validate()?;
                MaximizationStrategy::nonrigid(&source, options.beta, options.lambda)
            }
        };
        Ok(Cpd {
            source,
            strategy,
            gauss: Direct,
        })
    }

    /// Rotation, translation and uniform scale.
    pub fn rigid(source: DMatrix<f64>) -> Result<Self> {
        Self::new(source, TransformationType::Rigid, &NonRigidOptions::default())
    }

    /// Linear map and translation.
    pub fn affine(source: DMatrix<f64>) -> Result<Self> {
        Self::new(source, TransformationType::Affine, &NonRigidOptions::default())
    }

    /// Smooth displacement field.
    pub fn nonrigid(source: DMatrix<f64>, options: &NonRigidOptions) -> Result<Self> {
        Self::new(source, TransformationType::NonRigid, options)
    }
}

impl<G: GaussTransform> Cpd<G> {
    /// Replace the evaluator of Gaussian sums.
    pub fn with_gauss_transform<H: GaussTransform>(self, gauss: H) -> Cpd<H> {
        Cpd {
            source: self.source,
            strategy: self.strategy,
            gauss,
        }
    }

    /// Registrar of the same kind for other source points.
    pub fn with_source(self, source: DMatrix<f64>) -> Result<Self> {
        check_points(&source, "source")?;
        let strategy = self.strategy.rebuild(&source);
        Ok(Cpd {
            source,
            strategy,
            gauss: self.gauss,
        })
    }

    pub fn source(&self) -> &DMatrix<f64> {
        &self.source
    }

    pub fn strategy(&self) -> &MaximizationStrategy {
        &self.strategy
    }

    pub fn gauss_transform(&self) -> &G {
        &self.gauss
    }

    /// Initial estimate: identity transformation and the variance
    /// explaining all target points from all source points.
    pub fn initialize(&self, target: &DMatrix<f64>) -> MstepResult {
        let dim = self.source.ncols();
        let sigma2 = mean_squared_norm_all(&self.source, target).max(SIGMA2_FLOOR);
        let q = 1.0 + target.nrows() as f64 * dim as f64 * 0.5 * sigma2.ln();
        log::trace!("Initial sigma2: {}, q: {}", sigma2, q);
        MstepResult {
            transformation: self.strategy.identity(dim),
            sigma2,
            q,
        }
    }

    pub fn expectation_step(
        &self,
        t_source: &DMatrix<f64>,
        target: &DMatrix<f64>,
        sigma2: f64,
        w: f64,
    ) -> EstepResult {
        expectation_step(&self.gauss, t_source, target, sigma2, w)
    }

    pub fn maximization_step(
        &self,
        target: &DMatrix<f64>,
        estep: &EstepResult,
        sigma2_prev: f64,
    ) -> Result<MstepResult> {
        self.strategy
            .maximization_step(&self.source, target, estep, sigma2_prev)
    }

    /// Register the source points onto `target`.
    ///
    /// Running out of iterations is not an error,
    /// the latest estimate is returned with [`Termination::Exhausted`].
    ///
    /// # Errors
    ///
    /// Invalid inputs are rejected before the first iteration.
    /// A maximization step that fails numerically, for example a non-rigid
    /// step where a source point far from every target received no
    /// responsibility, aborts the registration and its error is returned.
    /// The previous estimates are then dropped. The failing iteration is logged,
    /// and callers needing the partial fit can drive the steps themselves
    /// with [`Cpd::initialize`], [`Cpd::expectation_step`] and [`Cpd::maximization_step`].
    pub fn registration(&self, target: &DMatrix<f64>, config: &Config) -> Result<Registered> {
        check_points(target, "target")?;
        if self.source.ncols() != target.ncols() {
            return Err(Error::DimensionMismatch {
                source_dim: self.source.ncols(),
                target_dim: target.ncols(),
            });
        }
        config.validate()?;

        let init = self.initialize(target);
        let mut state = State {
            nb_iter: 0,
            q: init.q,
            estimate: init,
        };

        // Main loop.
        let mut continuation = Continue::Forward;
        while continuation == Continue::Forward && state.nb_iter < config.max_iterations {
            continuation = state.step(self, target, config).map_err(|err| {
                log::error!("Iteration {} failed: {}", state.nb_iter, err);
                err
            })?;
        }

        let termination = match continuation {
            Continue::Stop => Termination::Converged,
            Continue::Forward => Termination::Exhausted,
        };
        match termination {
            Termination::Converged => log::info!("Converged after {} iterations", state.nb_iter),
            Termination::Exhausted => log::info!(
                "Stopped after {} iterations without convergence",
                state.nb_iter
            ),
        }
        Ok(Registered {
            result: state.estimate,
            iterations: state.nb_iter,
            termination,
        })
    }
}

/// Simple enum type to indicate if we should continue to loop.
/// This is to avoid the ambiguity of booleans.
#[derive(PartialEq)]
enum Continue {
    Forward,
    Stop,
}

/// State variables of the loop.
struct State {
    nb_iter: usize,
    q: f64,
    estimate: MstepResult,
}

impl State {
    /// Core iteration step of the algorithm.
    fn step<G: GaussTransform>(
        &mut self,
        cpd: &Cpd<G>,
        target: &DMatrix<f64>,
        config: &Config,
    ) -> Result<Continue> {
        let State {
            nb_iter,
            q,
            estimate,
        } = self;

        let t_source = estimate.transformation.transform(&cpd.source);
        let estep = cpd.expectation_step(&t_source, target, estimate.sigma2, config.w);
        let mstep = cpd.maximization_step(target, &estep, estimate.sigma2)?;

        let delta = (mstep.q - *q).abs();
        log::debug!(
            "Iteration {}: sigma2 = {:e}, q = {}, |dq| = {:e}",
            nb_iter,
            mstep.sigma2,
            mstep.q,
            delta
        );

        // Update state.
        *nb_iter += 1;
        *q = mstep.q;
        *estimate = mstep;

        if delta < config.tolerance {
            Ok(Continue::Stop)
        } else {
            Ok(Continue::Forward)
        }
    }
}

/// Reject point sets the algorithm cannot work with.
fn check_points(points: &DMatrix<f64>, name: &'static str) -> Result<()> {
    if points.nrows() == 0 || points.ncols() == 0 {
        return Err(Error::EmptyPointSet(name));
    }
    if !all_finite(points) {
        return Err(Error::NonFinite(name));
    }
    Ok(())
}

/// Register `source` onto `target` with the transformation family named
/// `tf_type_name`, one of "rigid", "affine" or "nonrigid".
pub fn registration_cpd(
    source: &DMatrix<f64>,
    target: &DMatrix<f64>,
    tf_type_name: &str,
    config: &Config,
    options: &NonRigidOptions,
) -> Result<Registered> {
    let tf_type: TransformationType = tf_type_name.parse()?;
    Cpd::new(source.clone(), tf_type, options)?.registration(target, config)
}
