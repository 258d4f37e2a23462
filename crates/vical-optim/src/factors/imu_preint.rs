//! Preintegrated IMU residual between consecutive keyframes.
//!
//! Residual ordering is `[theta, bg, v, ba, p]`, matching the navigation
//! state tangent. The preintegrated deltas are corrected to first order
//! for the deviation of the gyro/accel bias estimates from the values
//! used during integration.

use nalgebra::{DMatrix, DVector};

use vical_core::{
    exp_so3, log_so3, right_jacobian, right_jacobian_inv, skew, Mat15, Mat3, PreintegratedImu,
    Real, Vec3,
};

use super::nav_parts;

/// Square-root information (upper Cholesky of the inverse covariance).
///
/// Returns `None` for non-finite or singular covariances.
pub fn sqrt_information(cov: &Mat15) -> Option<Mat15> {
    if !cov.iter().all(|v| v.is_finite()) {
        return None;
    }
    let info = cov.try_inverse()?;
    let chol = info.cholesky()?;
    Some(chol.l().transpose())
}

/// Evaluates the residual and its Jacobians w.r.t. `[nav_i, nav_j, gravity]`.
pub fn evaluate(
    pre: &PreintegratedImu,
    sqrt_info: &Mat15,
    nav_i: &DVector<Real>,
    nav_j: &DVector<Real>,
    gravity: &Vec3,
) -> (DVector<Real>, Vec<DMatrix<Real>>) {
    let si = nav_parts(nav_i);
    let sj = nav_parts(nav_j);
    let dt = pre.dt;

    let dbg = si.bg - pre.bg_lin;
    let dba = si.ba - pre.ba_lin;

    // bias-corrected deltas
    let phi = pre.j_q_bg * dbg;
    let delta_q_hat = pre.delta_q * exp_so3(&phi);
    let delta_v_hat = pre.delta_v + pre.j_v_bg * dbg + pre.j_v_ba * dba;
    let delta_p_hat = pre.delta_p + pre.j_p_bg * dbg + pre.j_p_ba * dba;

    let rot_i: Mat3 = *si.q_wi.to_rotation_matrix().matrix();
    let rot_i_t = rot_i.transpose();
    let rot_j: Mat3 = *sj.q_wi.to_rotation_matrix().matrix();

    let err_q = delta_q_hat.inverse() * si.q_wi.inverse() * sj.q_wi;
    let r_theta = log_so3(&err_q);
    let r_bg = sj.bg - si.bg;
    let u = sj.v - si.v + gravity * dt;
    let r_v = rot_i_t * u - delta_v_hat;
    let r_ba = sj.ba - si.ba;
    let w = sj.p - si.p - si.v * dt + 0.5 * gravity * dt * dt;
    let r_p = rot_i_t * w - delta_p_hat;

    let mut r = DVector::zeros(15);
    set_seg(&mut r, 0, &r_theta);
    set_seg(&mut r, 3, &r_bg);
    set_seg(&mut r, 6, &r_v);
    set_seg(&mut r, 9, &r_ba);
    set_seg(&mut r, 12, &r_p);

    let jr_inv = right_jacobian_inv(&r_theta);
    let err_rot_t: Mat3 = err_q.to_rotation_matrix().matrix().transpose();
    let identity = Mat3::identity();

    // nav_i columns: [theta_i, bg_i, v_i, ba_i, p_i]
    let mut j_i = DMatrix::zeros(15, 15);
    set_block(&mut j_i, 0, 0, &(-jr_inv * rot_j.transpose() * rot_i));
    set_block(
        &mut j_i,
        0,
        3,
        &(-jr_inv * err_rot_t * right_jacobian(&phi) * pre.j_q_bg),
    );
    set_block(&mut j_i, 3, 3, &(-identity));
    set_block(&mut j_i, 6, 0, &skew(&(rot_i_t * u)));
    set_block(&mut j_i, 6, 3, &(-pre.j_v_bg));
    set_block(&mut j_i, 6, 6, &(-rot_i_t));
    set_block(&mut j_i, 6, 9, &(-pre.j_v_ba));
    set_block(&mut j_i, 9, 9, &(-identity));
    set_block(&mut j_i, 12, 0, &skew(&(rot_i_t * w)));
    set_block(&mut j_i, 12, 3, &(-pre.j_p_bg));
    set_block(&mut j_i, 12, 6, &(-rot_i_t * dt));
    set_block(&mut j_i, 12, 9, &(-pre.j_p_ba));
    set_block(&mut j_i, 12, 12, &(-rot_i_t));

    // nav_j columns
    let mut j_j = DMatrix::zeros(15, 15);
    set_block(&mut j_j, 0, 0, &jr_inv);
    set_block(&mut j_j, 3, 3, &identity);
    set_block(&mut j_j, 6, 6, &rot_i_t);
    set_block(&mut j_j, 9, 9, &identity);
    set_block(&mut j_j, 12, 12, &rot_i_t);

    let mut j_g = DMatrix::zeros(15, 3);
    set_block(&mut j_g, 6, 0, &(rot_i_t * dt));
    set_block(&mut j_g, 12, 0, &(rot_i_t * (0.5 * dt * dt)));

    let s = DMatrix::from_fn(15, 15, |i, j| sqrt_info[(i, j)]);
    (&s * r, vec![&s * j_i, &s * j_j, &s * j_g])
}

fn set_seg(dst: &mut DVector<Real>, row: usize, src: &Vec3) {
    dst[row] = src.x;
    dst[row + 1] = src.y;
    dst[row + 2] = src.z;
}

fn set_block(dst: &mut DMatrix<Real>, row: usize, col: usize, src: &Mat3) {
    for i in 0..3 {
        for j in 0..3 {
            dst[(row + i, col + j)] = src[(i, j)];
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::factors::testutil::check_jacobians;
    use crate::ir::{FactorKind, ManifoldKind};
    use approx::assert_relative_eq;
    use vical_core::{NavState, Quat};

    fn consistent_pair(
        g: &Vec3,
        dt: Real,
        q_i: Quat,
        v_i: Vec3,
        p_i: Vec3,
        q_j: Quat,
        v_j: Vec3,
        p_j: Vec3,
    ) -> (PreintegratedImu, NavState, NavState) {
        let rot_i_t = q_i.to_rotation_matrix().matrix().transpose();
        let pre = PreintegratedImu {
            dt,
            delta_q: q_i.inverse() * q_j,
            delta_v: rot_i_t * (v_j - v_i + g * dt),
            delta_p: rot_i_t * (p_j - p_i - v_i * dt + 0.5 * g * dt * dt),
            j_q_bg: -Mat3::identity() * dt,
            j_v_bg: Mat3::new(0.0, 0.01, 0.0, -0.01, 0.0, 0.0, 0.0, 0.0, 0.02) * dt,
            j_v_ba: -Mat3::identity() * dt,
            j_p_bg: Mat3::identity() * (0.01 * dt * dt),
            j_p_ba: -Mat3::identity() * (0.5 * dt * dt),
            bg_lin: Vec3::zeros(),
            ba_lin: Vec3::zeros(),
            cov: Mat15::identity() * 1e-4,
        };
        let mut si = NavState::from_pose(0.0, q_i, p_i);
        si.v = v_i;
        let mut sj = NavState::from_pose(dt, q_j, p_j);
        sj.v = v_j;
        (pre, si, sj)
    }

    #[test]
    fn residual_is_zero_for_consistent_motion() {
        let g = Vec3::new(0.0, 0.0, 9.8);
        let dt = 0.5;
        let q_i = Quat::from_euler_angles(0.1, 0.0, -0.2);
        let q_j = Quat::from_euler_angles(0.15, 0.05, -0.1);
        let v_i = Vec3::new(0.2, -0.1, 0.3);
        let v_j = Vec3::new(0.1, 0.1, 0.2);
        let p_i = Vec3::new(1.0, 2.0, 0.5);
        let p_j = p_i + v_i * dt + Vec3::new(0.01, 0.0, -0.02);

        let (pre, si, sj) = consistent_pair(&g, dt, q_i, v_i, p_i, q_j, v_j, p_j);
        let sqrt_info = sqrt_information(&pre.cov).unwrap();
        let (r, _) = evaluate(&pre, &sqrt_info, &si.to_vec(), &sj.to_vec(), &g);
        assert_relative_eq!(r.norm(), 0.0, epsilon = 1e-8);
    }

    #[test]
    fn static_imu_deltas_are_consistent() {
        // stationary device: delta_v = R^T g dt, delta_p = R^T g dt^2 / 2
        let g = Vec3::new(0.0, 0.0, 9.8);
        let dt = 0.2;
        let q = Quat::from_euler_angles(0.0, 0.0, 0.3);
        let p = Vec3::new(0.4, -0.2, 1.0);

        let (pre, si, sj) = consistent_pair(&g, dt, q, Vec3::zeros(), p, q, Vec3::zeros(), p);
        let rot_t = q.to_rotation_matrix().matrix().transpose();
        assert_relative_eq!(pre.delta_v, rot_t * g * dt, epsilon = 1e-12);
        assert_relative_eq!(pre.delta_p, rot_t * g * (0.5 * dt * dt), epsilon = 1e-12);

        let sqrt_info = sqrt_information(&pre.cov).unwrap();
        let (r, _) = evaluate(&pre, &sqrt_info, &si.to_vec(), &sj.to_vec(), &g);
        assert_relative_eq!(r.norm(), 0.0, epsilon = 1e-9);
    }

    #[test]
    fn jacobians_match_finite_differences() {
        let g = Vec3::new(0.05, -0.1, 9.75);
        let dt = 0.4;
        let q_i = Quat::from_euler_angles(0.2, -0.1, 0.3);
        let q_j = Quat::from_euler_angles(0.25, 0.0, 0.2);
        let v_i = Vec3::new(0.3, 0.2, -0.1);
        let v_j = Vec3::new(0.2, 0.25, 0.0);
        let p_i = Vec3::new(0.0, 1.0, 2.0);
        let p_j = Vec3::new(0.1, 1.1, 1.9);

        let (mut pre, mut si, mut sj) = consistent_pair(&g, dt, q_i, v_i, p_i, q_j, v_j, p_j);
        // push the evaluation off the zero-residual point, including biases
        pre.delta_v += Vec3::new(0.01, -0.02, 0.005);
        pre.delta_p += Vec3::new(-0.004, 0.006, 0.01);
        pre.bg_lin = Vec3::new(0.002, -0.001, 0.0015);
        si.bg = Vec3::new(0.004, 0.001, -0.002);
        si.ba = Vec3::new(-0.01, 0.02, 0.005);
        sj.bg = Vec3::new(0.003, 0.0, -0.001);
        sj.ba = Vec3::new(-0.008, 0.018, 0.006);

        let sqrt_info = sqrt_information(&pre.cov).unwrap();
        let factor = FactorKind::ImuPreintegration {
            pre: Box::new(pre),
            sqrt_info: Box::new(sqrt_info),
        };
        let params = vec![
            si.to_vec(),
            sj.to_vec(),
            DVector::from_vec(vec![g.x, g.y, g.z]),
        ];
        let manifolds = [
            ManifoldKind::NavState,
            ManifoldKind::NavState,
            ManifoldKind::Euclidean,
        ];
        check_jacobians(&factor, &params, &manifolds, 1e-4);
    }

    #[test]
    fn sqrt_information_rejects_non_finite() {
        let mut cov = Mat15::identity();
        cov[(0, 0)] = Real::INFINITY;
        assert!(sqrt_information(&cov).is_none());
    }
}
