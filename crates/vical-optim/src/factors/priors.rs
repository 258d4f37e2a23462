//! Scalar prior factors on the time offset and the gravity norm.

use nalgebra::{DMatrix, DVector};

use vical_core::{Real, Vec3};

/// Soft prior `(toff - center) / sigma` keeping the time offset near its
/// estimate from the previous relinearization round.
pub fn time_offset_prior(
    center: Real,
    sigma: Real,
    toff: Real,
) -> (DVector<Real>, Vec<DMatrix<Real>>) {
    let inv_sigma = 1.0 / sigma;
    let r = DVector::from_element(1, (toff - center) * inv_sigma);
    let jac = DMatrix::from_element(1, 1, inv_sigma);
    (r, vec![jac])
}

/// Prior `(|g| - target) / sigma` constraining the gravity norm while
/// leaving its direction free.
pub fn gravity_magnitude_prior(
    target: Real,
    sigma: Real,
    g: &Vec3,
) -> (DVector<Real>, Vec<DMatrix<Real>>) {
    let inv_sigma = 1.0 / sigma;
    let norm = g.norm();
    let r = DVector::from_element(1, (norm - target) * inv_sigma);

    let mut jac = DMatrix::zeros(1, 3);
    if norm > 1e-12 {
        let dir = g / norm;
        jac[(0, 0)] = dir.x * inv_sigma;
        jac[(0, 1)] = dir.y * inv_sigma;
        jac[(0, 2)] = dir.z * inv_sigma;
    }
    (r, vec![jac])
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn time_offset_prior_zero_at_center() {
        let (r, jacs) = time_offset_prior(0.05, 0.02, 0.05);
        assert_relative_eq!(r[0], 0.0, epsilon = 1e-12);
        assert_relative_eq!(jacs[0][(0, 0)], 50.0, epsilon = 1e-12);
    }

    #[test]
    fn gravity_magnitude_prior_residual() {
        let g = Vec3::new(0.0, 0.0, 9.8);
        let (r, jacs) = gravity_magnitude_prior(9.8, 1e-10, &g);
        assert_relative_eq!(r[0], 0.0, epsilon = 1e-6);
        // gradient points along the gravity direction
        assert_relative_eq!(jacs[0][(0, 0)], 0.0, epsilon = 1e-12);
        assert_relative_eq!(jacs[0][(0, 2)], 1.0 / 1e-10, epsilon = 1e-2);
    }

    #[test]
    fn gravity_magnitude_prior_degenerate_at_origin() {
        let (r, jacs) = gravity_magnitude_prior(9.8, 1.0, &Vec3::zeros());
        assert_relative_eq!(r[0], -9.8, epsilon = 1e-12);
        assert_relative_eq!(jacs[0].norm(), 0.0, epsilon = 1e-12);
    }
}
