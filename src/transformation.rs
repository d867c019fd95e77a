// SPDX-License-Identifier: MPL-2.0

//! Spatial maps estimated by the registration.

use nalgebra::{DMatrix, DVector};
use std::sync::Arc;

use crate::math::translated;

/// Transformation of a point set, one point per row.
#[derive(Debug, Clone, PartialEq)]
pub enum Transformation {
    /// `x -> scale * rotation * x + translation`,
    /// with `rotation` orthonormal of determinant +1.
    Rigid {
        rotation: DMatrix<f64>,
        translation: DVector<f64>,
        scale: f64,
    },
    /// `x -> linear * x + translation`.
    Affine {
        linear: DMatrix<f64>,
        translation: DVector<f64>,
    },
    /// `Y -> Y + G * W` where `G` is the smoothness kernel of the source
    /// points `Y` and `W` holds one displacement coefficient row per source point.
    NonRigid {
        kernel: Arc<DMatrix<f64>>,
        coefficients: DMatrix<f64>,
    },
}

impl Transformation {
    /// Rigid transformation leaving points untouched.
    pub fn identity_rigid(dim: usize) -> Self {
        Transformation::Rigid {
            rotation: DMatrix::identity(dim, dim),
            translation: DVector::zeros(dim),
            scale: 1.0,
        }
    }

    /// Affine transformation leaving points untouched.
    pub fn identity_affine(dim: usize) -> Self {
        Transformation::Affine {
            linear: DMatrix::identity(dim, dim),
            translation: DVector::zeros(dim),
        }
    }

    /// Non-rigid transformation with a null displacement field.
    pub fn identity_nonrigid(kernel: Arc<DMatrix<f64>>, dim: usize) -> Self {
        let n = kernel.nrows();
        Transformation::NonRigid {
            kernel,
            coefficients: DMatrix::zeros(n, dim),
        }
    }

    /// Apply the transformation to every point (row) of `points`.
    ///
    /// # Panics
    ///
    /// A non-rigid transformation is only defined on the points its kernel
    /// was built from, so `points` must have as many rows as the kernel.
    pub fn transform(&self, points: &DMatrix<f64>) -> DMatrix<f64> {
        match self {
            Transformation::Rigid {
                rotation,
                translation,
                scale,
            } => translated(&(points * rotation.transpose() * *scale), translation),
            Transformation::Affine {
                linear,
                translation,
            } => translated(&(points * linear.transpose()), translation),
            Transformation::NonRigid {
                kernel,
                coefficients,
            } => {
                assert_eq!(
                    points.nrows(),
                    kernel.nrows(),
                    "non-rigid transformation applied to points it was not fitted on"
                );
                points + kernel.as_ref() * coefficients
            }
        }
    }
}
