// SPDX-License-Identifier: MPL-2.0

//! Errors raised by the registration engine.

/// Result type of the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Everything that can go wrong before or during a registration.
///
/// The first group are precondition violations, detected before any iteration.
/// The second group are numerical failures surfaced by the maximization steps.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The named point set has no point, or points with no coordinate.
    #[error("the {0} point set is empty")]
    EmptyPointSet(&'static str),
    /// Source and target points do not live in the same space.
    #[error("source points have {source_dim} dimensions but target points have {target_dim}")]
    DimensionMismatch {
        source_dim: usize,
        target_dim: usize,
    },
    /// A coordinate of the named point set is NaN or infinite.
    #[error("the {0} point set contains non-finite coordinates")]
    NonFinite(&'static str),
    /// The requested transformation is not one of rigid, affine or nonrigid.
    #[error("unknown transformation type {0:?}")]
    UnknownTransformation(String),
    /// A configuration value is outside of its domain.
    #[error("invalid value {value} for parameter {name}")]
    InvalidParameter { name: &'static str, value: f64 },

    /// The SVD of the cross-covariance matrix did not converge.
    #[error("svd of the cross-covariance matrix failed")]
    SvdFailed,
    /// A linear system of a maximization step could not be solved.
    #[error("singular linear system in the {0} maximization step")]
    SingularSystem(&'static str),
    /// The soft correspondences carry no usable mass.
    #[error("degenerate responsibilities: {0}")]
    DegenerateResponsibilities(&'static str),
}
