//! Calibration configuration.

use nalgebra::Matrix3;
use serde::{Deserialize, Serialize};

use vical_core::{Mat3, Quat, Real, Vec3};
use vical_optim::SolveOptions;

use crate::error::VicalError;

/// User-facing calibration settings.
///
/// All fields have defaults, so a partial JSON document is enough to
/// override only the entries of interest.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CalibrationConfig {
    /// Initial gravity vector in the mocap world frame.
    pub gravity: [Real; 3],
    /// Initial body-to-imu rotation, row major.
    pub extrinsic_rotation: [[Real; 3]; 3],
    /// Initial body origin expressed in the imu frame.
    pub extrinsic_translation: [Real; 3],
    /// Initial (or fixed) mocap-to-imu time offset in seconds.
    pub time_offset: Real,
    /// Whether the time offset is estimated.
    pub estimate_time_offset: bool,
    /// Whether the gravity norm is pinned to its initial magnitude.
    pub enforce_gravity_magnitude: bool,
    /// Number of extra relinearization rounds after the first solve.
    pub num_loop_relin: usize,
    /// Inner solver options.
    pub solve: SolveOptions,
}

impl Default for CalibrationConfig {
    fn default() -> Self {
        Self {
            gravity: [0.0, 0.0, 9.8],
            extrinsic_rotation: [[1.0, 0.0, 0.0], [0.0, 1.0, 0.0], [0.0, 0.0, 1.0]],
            extrinsic_translation: [0.0, 0.0, 0.0],
            time_offset: 0.0,
            estimate_time_offset: false,
            enforce_gravity_magnitude: false,
            num_loop_relin: 0,
            solve: SolveOptions::default(),
        }
    }
}

impl CalibrationConfig {
    /// Initial gravity as a vector, after a finiteness check.
    pub fn gravity_init(&self) -> Result<Vec3, VicalError> {
        let g = Vec3::new(self.gravity[0], self.gravity[1], self.gravity[2]);
        if !g.iter().all(|v| v.is_finite()) {
            return Err(VicalError::Configuration(
                "initial gravity must be finite".into(),
            ));
        }
        Ok(g)
    }

    /// Initial body-to-imu rotation as a unit quaternion.
    ///
    /// Rejects matrices that are not orthonormal with positive determinant.
    pub fn extrinsic_rotation_init(&self) -> Result<Quat, VicalError> {
        let r = self.extrinsic_rotation;
        let m: Mat3 = Matrix3::new(
            r[0][0], r[0][1], r[0][2], r[1][0], r[1][1], r[1][2], r[2][0], r[2][1], r[2][2],
        );
        if !m.iter().all(|v| v.is_finite()) {
            return Err(VicalError::Configuration(
                "initial extrinsic rotation must be finite".into(),
            ));
        }
        let orth = (m.transpose() * m - Mat3::identity()).norm();
        if orth > 1e-6 || m.determinant() < 0.0 {
            return Err(VicalError::Configuration(format!(
                "initial extrinsic rotation is not a rotation matrix (orthonormality defect {orth:.2e})"
            )));
        }
        Ok(Quat::from_matrix(&m))
    }

    /// Initial extrinsic translation as a vector.
    pub fn extrinsic_translation_init(&self) -> Result<Vec3, VicalError> {
        let p = Vec3::new(
            self.extrinsic_translation[0],
            self.extrinsic_translation[1],
            self.extrinsic_translation[2],
        );
        if !p.iter().all(|v| v.is_finite()) {
            return Err(VicalError::Configuration(
                "initial extrinsic translation must be finite".into(),
            ));
        }
        Ok(p)
    }

    /// Validates every initial value at once.
    pub fn validate(&self) -> Result<(), VicalError> {
        self.gravity_init()?;
        self.extrinsic_rotation_init()?;
        self.extrinsic_translation_init()?;
        if !self.time_offset.is_finite() {
            return Err(VicalError::Configuration(
                "initial time offset must be finite".into(),
            ));
        }
        Ok(())
    }
}
