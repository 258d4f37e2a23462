//! Mocap body-pose residuals.
//!
//! The predicted body pose chains the keyframe state with the extrinsic
//! calibration: `R_wb = R_wi * R_ib` and `p_b_w = p_i + R_wi * p_b_i`.
//! The residual is `[Log(R_meas^-1 * R_pred), p_pred - p_meas]`, whitened
//! by the square-root information of the interpolated pose covariance.

use anyhow::{anyhow, Result};
use nalgebra::{DMatrix, DVector};

use vical_core::{
    log_so3, right_jacobian_inv, skew, Mat3, Mat6, PoseInterpolator, Quat, Real, Vec3,
};

use super::{nav_parts, vec3_from};
use crate::ir::quat_from_storage;

/// Step used for the finite-difference time-offset column.
const TOFF_STEP: Real = 1e-4;

/// Square-root information (upper Cholesky of the inverse covariance).
///
/// Returns `None` for non-finite or singular covariances.
pub fn sqrt_information(cov: &Mat6) -> Option<Mat6> {
    if !cov.iter().all(|v| v.is_finite()) {
        return None;
    }
    let info = cov.try_inverse()?;
    let chol = info.cholesky()?;
    Some(chol.l().transpose())
}

fn residual_unwhitened(
    q_wb_meas: &Quat,
    p_b_w_meas: &Vec3,
    q_wi: &Quat,
    p_i: &Vec3,
    q_ib: &Quat,
    p_b_i: &Vec3,
) -> DVector<Real> {
    let r_rot = log_so3(&(q_wb_meas.inverse() * q_wi * q_ib));
    let r_pos = p_i + q_wi * p_b_i - p_b_w_meas;
    DVector::from_vec(vec![r_rot.x, r_rot.y, r_rot.z, r_pos.x, r_pos.y, r_pos.z])
}

#[allow(clippy::too_many_arguments)]
fn residual_and_jacobians(
    q_wb_meas: &Quat,
    p_b_w_meas: &Vec3,
    q_wi: &Quat,
    p_i: &Vec3,
    q_ib: &Quat,
    p_b_i: &Vec3,
) -> (DVector<Real>, DMatrix<Real>, DMatrix<Real>, DMatrix<Real>) {
    let r = residual_unwhitened(q_wb_meas, p_b_w_meas, q_wi, p_i, q_ib, p_b_i);
    let r_rot = Vec3::new(r[0], r[1], r[2]);

    let jr_inv = right_jacobian_inv(&r_rot);
    let rot_ib: Mat3 = *q_ib.to_rotation_matrix().matrix();
    let rot_wi: Mat3 = *q_wi.to_rotation_matrix().matrix();

    // nav tangent ordering: [theta, bg, v, ba, p]
    let mut j_nav = DMatrix::zeros(6, 15);
    set_block(&mut j_nav, 0, 0, &(jr_inv * rot_ib.transpose()));
    set_block(&mut j_nav, 3, 0, &(-rot_wi * skew(p_b_i)));
    set_block(&mut j_nav, 3, 12, &Mat3::identity());

    let mut j_rot = DMatrix::zeros(6, 3);
    set_block(&mut j_rot, 0, 0, &jr_inv);

    let mut j_trans = DMatrix::zeros(6, 3);
    set_block(&mut j_trans, 3, 0, &rot_wi);

    (r, j_nav, j_rot, j_trans)
}

fn set_block(dst: &mut DMatrix<Real>, row: usize, col: usize, src: &Mat3) {
    for i in 0..3 {
        for j in 0..3 {
            dst[(row + i, col + j)] = src[(i, j)];
        }
    }
}

fn dmat6(m: &Mat6) -> DMatrix<Real> {
    DMatrix::from_fn(6, 6, |i, j| m[(i, j)])
}

/// Evaluates the fixed-timestamp variant with a precomputed measurement.
pub fn evaluate_fixed(
    q_wb_meas: &Quat,
    p_b_w_meas: &Vec3,
    sqrt_info: &Mat6,
    nav: &DVector<Real>,
    calib_rot: &DVector<Real>,
    calib_trans: &DVector<Real>,
) -> (DVector<Real>, Vec<DMatrix<Real>>) {
    let state = nav_parts(nav);
    let q_ib = quat_from_storage(calib_rot, 0);
    let p_b_i = vec3_from(calib_trans);

    let (r, j_nav, j_rot, j_trans) = residual_and_jacobians(
        q_wb_meas, p_b_w_meas, &state.q_wi, &state.p, &q_ib, &p_b_i,
    );

    let s = dmat6(sqrt_info);
    (&s * r, vec![&s * j_nav, &s * j_rot, &s * j_trans])
}

/// Evaluates the time-offset variant; the mocap pose is re-interpolated
/// at `t_nominal + toff` on every call.
pub fn evaluate_with_offset(
    t_nominal: Real,
    interp: &dyn PoseInterpolator,
    nav: &DVector<Real>,
    calib_rot: &DVector<Real>,
    calib_trans: &DVector<Real>,
    toff: Real,
) -> Result<(DVector<Real>, Vec<DMatrix<Real>>)> {
    let t = t_nominal + toff;
    let pose = interp
        .pose_at(t)
        .ok_or_else(|| anyhow!("no mocap pose at t={:.6}", t))?;
    let sqrt_info = sqrt_information(&pose.cov)
        .ok_or_else(|| anyhow!("singular mocap covariance at t={:.6}", t))?;

    let state = nav_parts(nav);
    let q_ib = quat_from_storage(calib_rot, 0);
    let p_b_i = vec3_from(calib_trans);

    let (r, j_nav, j_rot, j_trans) = residual_and_jacobians(
        &pose.q_wb, &pose.p_b_w, &state.q_wi, &state.p, &q_ib, &p_b_i,
    );

    // measured pose moves with toff, so the residual derivative comes from
    // a central difference over the interpolated poses
    let pose_p = interp
        .pose_at(t + TOFF_STEP)
        .ok_or_else(|| anyhow!("no mocap pose at t={:.6}", t + TOFF_STEP))?;
    let pose_m = interp
        .pose_at(t - TOFF_STEP)
        .ok_or_else(|| anyhow!("no mocap pose at t={:.6}", t - TOFF_STEP))?;
    let r_p = residual_unwhitened(
        &pose_p.q_wb, &pose_p.p_b_w, &state.q_wi, &state.p, &q_ib, &p_b_i,
    );
    let r_m = residual_unwhitened(
        &pose_m.q_wb, &pose_m.p_b_w, &state.q_wi, &state.p, &q_ib, &p_b_i,
    );
    let dr = (r_p - r_m) / (2.0 * TOFF_STEP);
    let mut j_toff = DMatrix::zeros(6, 1);
    for i in 0..6 {
        j_toff[(i, 0)] = dr[i];
    }

    let s = dmat6(&sqrt_info);
    Ok((
        &s * r,
        vec![&s * j_nav, &s * j_rot, &s * j_trans, &s * j_toff],
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::factors::testutil::check_jacobians;
    use crate::ir::{FactorKind, ManifoldKind};
    use approx::assert_relative_eq;
    use vical_core::{exp_so3, NavState};

    fn nav_vec(q_wi: Quat, p: Vec3) -> DVector<Real> {
        NavState::from_pose(0.0, q_wi, p).to_vec()
    }

    fn quat_vec(q: &Quat) -> DVector<Real> {
        DVector::from_vec(vec![q.coords.x, q.coords.y, q.coords.z, q.coords.w])
    }

    #[test]
    fn residual_is_zero_for_consistent_pose() {
        let q_wi = Quat::from_euler_angles(0.2, -0.1, 0.4);
        let p_i = Vec3::new(1.0, -2.0, 0.5);
        let q_ib = Quat::from_euler_angles(0.05, 0.02, -0.03);
        let p_b_i = Vec3::new(0.1, 0.0, -0.2);

        let q_wb = q_wi * q_ib;
        let p_b_w = p_i + q_wi * p_b_i;

        let (r, _) = evaluate_fixed(
            &q_wb,
            &p_b_w,
            &Mat6::identity(),
            &nav_vec(q_wi, p_i),
            &quat_vec(&q_ib),
            &DVector::from_vec(vec![p_b_i.x, p_b_i.y, p_b_i.z]),
        );
        assert_relative_eq!(r.norm(), 0.0, epsilon = 1e-10);
    }

    #[test]
    fn jacobians_match_finite_differences() {
        let q_wi = Quat::from_euler_angles(0.3, 0.1, -0.2);
        let p_i = Vec3::new(0.5, 1.0, -0.3);
        let q_ib = Quat::from_euler_angles(-0.04, 0.06, 0.02);
        let p_b_i = Vec3::new(0.12, -0.03, 0.2);

        // offset measurement so the residual is non-zero
        let q_wb = q_wi * q_ib * exp_so3(&Vec3::new(0.01, -0.02, 0.015));
        let p_b_w = p_i + q_wi * p_b_i + Vec3::new(0.02, 0.01, -0.015);

        let factor = FactorKind::MocapPose {
            q_wb_meas: q_wb,
            p_b_w_meas: p_b_w,
            sqrt_info: Box::new(Mat6::identity() * 2.0),
        };
        let params = vec![
            nav_vec(q_wi, p_i),
            quat_vec(&q_ib),
            DVector::from_vec(vec![p_b_i.x, p_b_i.y, p_b_i.z]),
        ];
        let manifolds = [
            ManifoldKind::NavState,
            ManifoldKind::SO3,
            ManifoldKind::Euclidean,
        ];
        check_jacobians(&factor, &params, &manifolds, 1e-5);
    }

    #[test]
    fn sqrt_information_rejects_singular_covariance() {
        let mut cov = Mat6::identity();
        cov[(5, 5)] = 0.0;
        assert!(sqrt_information(&cov).is_none());

        cov[(5, 5)] = Real::NAN;
        assert!(sqrt_information(&cov).is_none());
    }

    #[test]
    fn sqrt_information_whitens() {
        let cov = Mat6::identity() * 4.0;
        let s = sqrt_information(&cov).unwrap();
        // information is cov^-1, so S^T S = 0.25 I
        assert_relative_eq!(s.transpose() * s, Mat6::identity() * 0.25, epsilon = 1e-10);
    }
}
