//! Pipeline error type.

use thiserror::Error;

/// Errors produced by the calibration pipeline.
#[derive(Debug, Error)]
pub enum VicalError {
    /// Invalid configuration or inputs that cannot yield a solvable problem.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// A data source could not supply a measurement near the given time.
    #[error("measurement gap at t={t:.6}")]
    MeasurementGap {
        /// Query time in seconds.
        t: f64,
    },

    /// A covariance or linear system was singular or non-finite.
    #[error("numerical singularity: {0}")]
    NumericalSingularity(String),

    /// An internal invariant was violated.
    #[error("internal consistency failure: {0}")]
    InternalConsistency(String),

    /// Filesystem failure during export.
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// CSV serialization failure during export.
    #[error("export failed: {0}")]
    Export(#[from] csv::Error),
}
