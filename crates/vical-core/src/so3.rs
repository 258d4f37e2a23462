//! SO(3) group utilities used by the manifold retraction and the
//! analytic factor Jacobians.
//!
//! Conventions follow right perturbations, `R' = R * Exp(delta)`, so the
//! right Jacobian `Jr` and its inverse show up in every rotation residual.

use crate::math::{Mat3, Quat, Real, Vec3};

/// Angle below which the closed-form coefficients are replaced by their
/// series expansions.
const SMALL_ANGLE: Real = 1e-6;

/// Skew-symmetric matrix `[v]x` such that `[v]x * u = v x u`.
#[inline]
pub fn skew(v: &Vec3) -> Mat3 {
    Mat3::new(0.0, -v.z, v.y, v.z, 0.0, -v.x, -v.y, v.x, 0.0)
}

/// Exponential map of SO(3) as a unit quaternion.
pub fn exp_so3(phi: &Vec3) -> Quat {
    Quat::from_scaled_axis(*phi)
}

/// Logarithm map of SO(3), returning the rotation vector.
pub fn log_so3(q: &Quat) -> Vec3 {
    q.scaled_axis()
}

/// Right Jacobian `Jr(phi)` of SO(3).
///
/// `Exp(phi + d) ~= Exp(phi) * Exp(Jr(phi) * d)` for small `d`.
pub fn right_jacobian(phi: &Vec3) -> Mat3 {
    let theta = phi.norm();
    if theta < SMALL_ANGLE {
        return Mat3::identity() - 0.5 * skew(phi);
    }

    let theta_sq = theta * theta;
    let s = skew(phi);
    let s_sq = s * s;
    Mat3::identity() - ((1.0 - theta.cos()) / theta_sq) * s
        + ((theta - theta.sin()) / (theta_sq * theta)) * s_sq
}

/// Inverse of the right Jacobian, `Jr(phi)^-1`.
pub fn right_jacobian_inv(phi: &Vec3) -> Mat3 {
    let theta = phi.norm();
    let s = skew(phi);
    if theta < SMALL_ANGLE {
        return Mat3::identity() + 0.5 * s + (1.0 / 12.0) * s * s;
    }

    let theta_sq = theta * theta;
    let coeff = 1.0 / theta_sq - (1.0 + theta.cos()) / (2.0 * theta * theta.sin());
    Mat3::identity() + 0.5 * s + coeff * s * s
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn skew_matches_cross_product() {
        let v = Vec3::new(1.0, 2.0, 3.0);
        let u = Vec3::new(-0.5, 4.0, 0.25);
        assert_relative_eq!(v.cross(&u), skew(&v) * u, epsilon = 1e-12);
    }

    #[test]
    fn exp_log_round_trip() {
        let phi = Vec3::new(0.3, -0.2, 0.5);
        let q = exp_so3(&phi);
        assert_relative_eq!(log_so3(&q), phi, epsilon = 1e-12);
    }

    #[test]
    fn right_jacobian_is_identity_at_zero() {
        assert_relative_eq!(
            right_jacobian(&Vec3::zeros()),
            Mat3::identity(),
            epsilon = 1e-12
        );
        assert_relative_eq!(
            right_jacobian_inv(&Vec3::zeros()),
            Mat3::identity(),
            epsilon = 1e-12
        );
    }

    #[test]
    fn right_jacobian_times_inverse_is_identity() {
        let phi = Vec3::new(0.1, 0.2, -0.3);
        let prod = right_jacobian(&phi) * right_jacobian_inv(&phi);
        assert_relative_eq!(prod, Mat3::identity(), epsilon = 1e-10);
    }

    #[test]
    fn right_jacobian_linearizes_exp() {
        // Exp(phi + d) ~= Exp(phi) * Exp(Jr(phi) d)
        let phi = Vec3::new(0.4, -0.1, 0.2);
        let d = Vec3::new(1e-6, -2e-6, 3e-6);
        let lhs = exp_so3(&(phi + d));
        let rhs = exp_so3(&phi) * exp_so3(&(right_jacobian(&phi) * d));
        assert_relative_eq!(lhs.angle_to(&rhs), 0.0, epsilon = 1e-10);
    }
}
