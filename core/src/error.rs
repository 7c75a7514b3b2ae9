//! Error types for the localization engine.
//!
//! Transient sensing failures (too few features, matches, or inliers) are not errors: the
//! visual odometry recovers from them locally and reports them through
//! [`crate::odometry::MotionStatus`]. Everything in this module is either fatal for the
//! current trial (see [`LocalizationError::aborts_trial_only`]) or fatal for the whole run
//! (configuration and map errors, which surface at setup).
use thiserror::Error;

#[derive(Debug, Error)]
pub enum LocalizationError {
    /// All particle weight mass vanished (or became non-finite) after a weighting pass.
    #[error("weight sum is zero at trial {trial} step {step}")]
    Divergence { trial: usize, step: usize },
    /// The interpolated map descriptor had zero norm and cannot be normalized.
    #[error("degenerate (zero-norm) descriptor at y={y:.3}, x={x:.3}, t={t:.3}")]
    DegenerateDescriptor { y: f64, x: f64, t: f64 },
    #[error("dimension mismatch: expected {expected}, found {found}")]
    DimensionMismatch { expected: usize, found: usize },
    #[error("particle population is empty or carries no weight")]
    EmptyPopulation,
    #[error("missing resource: {0}")]
    MissingResource(String),
    #[error("malformed resource: {0}")]
    MalformedResource(String),
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("localizer used before setup and set_model")]
    NotInitialized,
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Csv(#[from] csv::Error),
    #[error(transparent)]
    Image(#[from] image::ImageError),
    #[error(transparent)]
    Vision(#[from] opencv::Error),
}

impl LocalizationError {
    /// Whether the error ends only the trial it occurred in: a diverged filter, or a frame,
    /// descriptor or image that could not be read or processed.
    pub fn aborts_trial_only(&self) -> bool {
        matches!(
            self,
            LocalizationError::Divergence { .. }
                | LocalizationError::MissingResource(_)
                | LocalizationError::MalformedResource(_)
                | LocalizationError::Io(_)
                | LocalizationError::Csv(_)
                | LocalizationError::Image(_)
                | LocalizationError::Vision(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, LocalizationError>;
