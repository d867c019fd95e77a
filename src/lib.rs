// SPDX-License-Identifier: MPL-2.0

//! # Coherent Point Drift
//!
//! Probabilistic registration of two point sets.
//! The source points are the centroids of a Gaussian mixture model
//! fitted with Expectation-Maximization to the target points,
//! plus a uniform outlier component.
//! The fitted model yields a rigid, affine or non-rigid transformation
//! mapping the source onto the target, and the residual noise variance.

// #![warn(missing_docs)]

pub mod error;
pub mod gauss_transform;
pub mod math;
pub mod maximization;
pub mod registration;
pub mod transformation;

pub use error::{Error, Result};
pub use registration::{
    registration_cpd, Config, Cpd, NonRigidOptions, Registered, Termination, TransformationType,
};
pub use transformation::Transformation;
