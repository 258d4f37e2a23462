//! Residual factors of the calibration graph.
//!
//! Every factor evaluates to a whitened residual and one Jacobian per
//! parameter block, taken with respect to the block's tangent space
//! (right perturbation for quaternion-bearing blocks).

pub mod imu_preint;
pub mod mocap_pose;
pub mod priors;

use anyhow::{ensure, Result};
use nalgebra::{DMatrix, DVector};

use crate::ir::{quat_from_storage, FactorKind};
use vical_core::{Quat, Real, Vec3};

/// Navigation state pieces unpacked from the 16-value parameter layout.
pub(crate) struct NavParts {
    pub q_wi: Quat,
    pub bg: Vec3,
    pub v: Vec3,
    pub ba: Vec3,
    pub p: Vec3,
}

pub(crate) fn nav_parts(x: &DVector<Real>) -> NavParts {
    NavParts {
        q_wi: quat_from_storage(x, 0),
        bg: Vec3::new(x[4], x[5], x[6]),
        v: Vec3::new(x[7], x[8], x[9]),
        ba: Vec3::new(x[10], x[11], x[12]),
        p: Vec3::new(x[13], x[14], x[15]),
    }
}

pub(crate) fn vec3_from(x: &DVector<Real>) -> Vec3 {
    Vec3::new(x[0], x[1], x[2])
}

/// Evaluates a factor at the given parameter values.
///
/// `params` must follow the factor's parameter order; the returned
/// Jacobians are `residual_dim x tangent_dim`, one per parameter block.
pub fn evaluate(
    factor: &FactorKind,
    params: &[&DVector<Real>],
) -> Result<(DVector<Real>, Vec<DMatrix<Real>>)> {
    match factor {
        FactorKind::TimeOffsetPrior { center, sigma } => {
            ensure!(params.len() == 1, "time offset prior expects 1 param block");
            Ok(priors::time_offset_prior(*center, *sigma, params[0][0]))
        }
        FactorKind::GravityMagnitudePrior { target, sigma } => {
            ensure!(
                params.len() == 1,
                "gravity magnitude prior expects 1 param block"
            );
            Ok(priors::gravity_magnitude_prior(
                *target,
                *sigma,
                &vec3_from(params[0]),
            ))
        }
        FactorKind::MocapPose {
            q_wb_meas,
            p_b_w_meas,
            sqrt_info,
        } => {
            ensure!(params.len() == 3, "mocap pose factor expects 3 param blocks");
            Ok(mocap_pose::evaluate_fixed(
                q_wb_meas, p_b_w_meas, sqrt_info, params[0], params[1], params[2],
            ))
        }
        FactorKind::MocapPoseTimeOffset { t_nominal, interp } => {
            ensure!(
                params.len() == 4,
                "mocap pose time-offset factor expects 4 param blocks"
            );
            mocap_pose::evaluate_with_offset(
                *t_nominal,
                interp.as_ref(),
                params[0],
                params[1],
                params[2],
                params[3][0],
            )
        }
        FactorKind::ImuPreintegration { pre, sqrt_info } => {
            ensure!(
                params.len() == 3,
                "imu preintegration factor expects 3 param blocks"
            );
            Ok(imu_preint::evaluate(
                pre,
                sqrt_info,
                params[0],
                params[1],
                &vec3_from(params[2]),
            ))
        }
    }
}
