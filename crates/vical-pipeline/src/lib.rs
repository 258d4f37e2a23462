//! Calibration pipeline: keyframe management, graph assembly, the outer
//! relinearization loop, and result export.
//!
//! Pipeline steps:
//! 1. build a [`KeyframeCatalog`] and filter it against the IMU coverage,
//! 2. assemble the factor graph over the surviving keyframes,
//! 3. solve with the dense Levenberg-Marquardt backend, relinearizing
//!    `num_loop_relin` extra times,
//! 4. export the trajectory CSV and the calibration report.

/// Graph assembly from keyframes and data sources.
pub mod assemble;
/// Keyframe timestamp catalog.
pub mod catalog;
/// Calibration configuration.
pub mod config;
/// Pipeline error type.
pub mod error;
/// Result export (trajectory CSV and calibration report).
pub mod export;
/// Recorded data sources for offline runs.
pub mod playback;
/// Outer calibration loop.
pub mod solver;

pub use assemble::{build_problem, GraphBuildOutput};
pub use catalog::{Keyframe, KeyframeCatalog};
pub use config::CalibrationConfig;
pub use error::VicalError;
pub use export::{write_info_report, write_states_csv};
pub use playback::{
    RecordedDataset, RecordedImu, RecordedImuSegment, RecordedPoseSample, RecordedPoses,
};
pub use solver::{CalibrationResult, CalibrationSolver};

/// Parameter name of the extrinsic rotation.
pub const PARAM_CALIB_ROT: &str = "calib/rot";
/// Parameter name of the extrinsic translation.
pub const PARAM_CALIB_TRANS: &str = "calib/trans";
/// Parameter name of the gravity vector.
pub const PARAM_GRAVITY: &str = "gravity";
/// Parameter name of the time offset.
pub const PARAM_TOFF: &str = "toff";

/// Parameter name of the navigation state at a keyframe index.
pub fn nav_param_name(index: usize) -> String {
    format!("nav/{index}")
}
