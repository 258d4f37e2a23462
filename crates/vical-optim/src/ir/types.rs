use anyhow::{ensure, Result};
use nalgebra::DVector;
use std::collections::HashSet;
use std::sync::Arc;

use vical_core::{
    exp_so3, Mat15, Mat6, PoseInterpolator, PreintegratedImu, Quat, Real, Vec3, NAV_STATE_DIM,
    NAV_STATE_TANGENT_DIM,
};

/// Identifier for a parameter block in the IR.
///
/// Stable within a `ProblemIR` instance; residual blocks use it to reference
/// their parameter dependencies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ParamId(pub usize);

/// Supported manifold types for parameter blocks.
///
/// Each variant implies an expected ambient parameter dimension and a
/// tangent dimension used by the solver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManifoldKind {
    /// Standard Euclidean vector space.
    Euclidean,
    /// SO(3) rotation stored as quaternion `[qx, qy, qz, qw]`.
    SO3,
    /// Navigation state stored as `[qx, qy, qz, qw, bg, v, ba, p]`.
    NavState,
}

impl ManifoldKind {
    /// Returns `true` if the given ambient dimension matches the manifold storage.
    pub fn compatible_dim(self, dim: usize) -> bool {
        match self {
            ManifoldKind::Euclidean => true,
            ManifoldKind::SO3 => dim == 4,
            ManifoldKind::NavState => dim == NAV_STATE_DIM,
        }
    }

    /// Tangent dimension for a block of the given ambient dimension.
    pub fn tangent_dim(self, dim: usize) -> usize {
        match self {
            ManifoldKind::Euclidean => dim,
            ManifoldKind::SO3 => 3,
            ManifoldKind::NavState => NAV_STATE_TANGENT_DIM,
        }
    }

    /// Applies a tangent increment to a stored parameter vector.
    ///
    /// Quaternions compose on the right, `q' = q * Exp(delta)`; Euclidean
    /// slices add. `delta` must have the block's tangent dimension.
    pub fn retract(self, x: &DVector<Real>, delta: &[Real]) -> DVector<Real> {
        match self {
            ManifoldKind::Euclidean => {
                let mut out = x.clone();
                for (i, d) in delta.iter().enumerate() {
                    out[i] += d;
                }
                out
            }
            ManifoldKind::SO3 => {
                let q = quat_from_storage(x, 0);
                let dq = exp_so3(&Vec3::new(delta[0], delta[1], delta[2]));
                let mut out = x.clone();
                write_quat_storage(&mut out, 0, &(q * dq));
                out
            }
            ManifoldKind::NavState => {
                let q = quat_from_storage(x, 0);
                let dq = exp_so3(&Vec3::new(delta[0], delta[1], delta[2]));
                let mut out = x.clone();
                write_quat_storage(&mut out, 0, &(q * dq));
                for k in 3..NAV_STATE_TANGENT_DIM {
                    out[k + 1] += delta[k];
                }
                out
            }
        }
    }
}

/// Reads a unit quaternion from `[qx, qy, qz, qw]` storage at `offset`.
pub fn quat_from_storage(x: &DVector<Real>, offset: usize) -> Quat {
    Quat::from_quaternion(nalgebra::Quaternion::new(
        x[offset + 3],
        x[offset],
        x[offset + 1],
        x[offset + 2],
    ))
}

/// Writes a unit quaternion into `[qx, qy, qz, qw]` storage at `offset`.
pub fn write_quat_storage(x: &mut DVector<Real>, offset: usize, q: &Quat) {
    x[offset] = q.coords.x;
    x[offset + 1] = q.coords.y;
    x[offset + 2] = q.coords.z;
    x[offset + 3] = q.coords.w;
}

/// Fixed parameter mask for a block.
///
/// Euclidean blocks support per-index fixing; manifold blocks must be
/// either fully free or fully fixed.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct FixedMask {
    fixed_indices: HashSet<usize>,
}

impl FixedMask {
    /// Creates a mask with no fixed indices.
    pub fn all_free() -> Self {
        Self::default()
    }

    /// Creates a mask with all tangent indices fixed.
    pub fn all_fixed(tangent_dim: usize) -> Self {
        Self {
            fixed_indices: (0..tangent_dim).collect(),
        }
    }

    /// Creates a mask from an explicit list of tangent indices.
    pub fn fix_indices(indices: &[usize]) -> Self {
        Self {
            fixed_indices: indices.iter().copied().collect(),
        }
    }

    /// Returns `true` if the tangent index is fixed.
    pub fn is_fixed(&self, idx: usize) -> bool {
        self.fixed_indices.contains(&idx)
    }

    /// Returns `true` if all indices `[0, tangent_dim)` are fixed.
    pub fn is_all_fixed(&self, tangent_dim: usize) -> bool {
        self.fixed_indices.len() == tangent_dim
    }

    /// Iterates over fixed indices.
    pub fn iter(&self) -> impl Iterator<Item = usize> + '_ {
        self.fixed_indices.iter().copied()
    }

    /// Returns `true` if no indices are fixed.
    pub fn is_empty(&self) -> bool {
        self.fixed_indices.is_empty()
    }
}

/// Backend-agnostic factor kinds.
///
/// Each factor kind implies its parameter layout and residual dimension.
/// Measurement payloads and precomputed square-root information live in the
/// factor itself.
#[derive(Clone)]
pub enum FactorKind {
    /// Soft prior tying the time offset to its current estimate.
    ///
    /// Parameters: \[toff\] (1D Euclidean).
    TimeOffsetPrior { center: Real, sigma: Real },
    /// Prior on the gravity vector norm.
    ///
    /// Parameters: \[gravity\] (3D Euclidean).
    GravityMagnitudePrior { target: Real, sigma: Real },
    /// Mocap body-pose residual at a fixed, pre-interpolated timestamp.
    ///
    /// Parameters: [nav, calib_rot, calib_trans].
    MocapPose {
        q_wb_meas: Quat,
        p_b_w_meas: Vec3,
        sqrt_info: Box<Mat6>,
    },
    /// Mocap body-pose residual with an unknown time offset.
    ///
    /// Parameters: [nav, calib_rot, calib_trans, toff]. The interpolator is
    /// queried at `t_nominal + toff` at evaluation time.
    MocapPoseTimeOffset {
        t_nominal: Real,
        interp: Arc<dyn PoseInterpolator>,
    },
    /// Preintegrated IMU residual between consecutive keyframes.
    ///
    /// Parameters: [nav_i, nav_j, gravity].
    ImuPreintegration {
        pre: Box<PreintegratedImu>,
        sqrt_info: Box<Mat15>,
    },
}

impl std::fmt::Debug for FactorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FactorKind::TimeOffsetPrior { center, sigma } => f
                .debug_struct("TimeOffsetPrior")
                .field("center", center)
                .field("sigma", sigma)
                .finish(),
            FactorKind::GravityMagnitudePrior { target, sigma } => f
                .debug_struct("GravityMagnitudePrior")
                .field("target", target)
                .field("sigma", sigma)
                .finish(),
            FactorKind::MocapPose {
                q_wb_meas,
                p_b_w_meas,
                ..
            } => f
                .debug_struct("MocapPose")
                .field("q_wb_meas", q_wb_meas)
                .field("p_b_w_meas", p_b_w_meas)
                .finish_non_exhaustive(),
            FactorKind::MocapPoseTimeOffset { t_nominal, .. } => f
                .debug_struct("MocapPoseTimeOffset")
                .field("t_nominal", t_nominal)
                .finish_non_exhaustive(),
            FactorKind::ImuPreintegration { pre, .. } => f
                .debug_struct("ImuPreintegration")
                .field("dt", &pre.dt)
                .finish_non_exhaustive(),
        }
    }
}

impl FactorKind {
    /// Residual dimension implied by the factor.
    pub fn residual_dim(&self) -> usize {
        match self {
            FactorKind::TimeOffsetPrior { .. } => 1,
            FactorKind::GravityMagnitudePrior { .. } => 1,
            FactorKind::MocapPose { .. } => 6,
            FactorKind::MocapPoseTimeOffset { .. } => 6,
            FactorKind::ImuPreintegration { .. } => 15,
        }
    }
}

/// Parameter block definition in the IR.
#[derive(Debug, Clone)]
pub struct ParamBlock {
    pub id: ParamId,
    pub name: String,
    pub dim: usize,
    pub manifold: ManifoldKind,
    pub fixed: FixedMask,
}

/// Residual block definition in the IR.
///
/// The order of `params` must match the factor's expected parameter order.
#[derive(Debug, Clone)]
pub struct ResidualBlock {
    pub params: Vec<ParamId>,
    pub factor: FactorKind,
    pub residual_dim: usize,
}

/// Backend-agnostic optimization problem representation.
#[derive(Debug, Default, Clone)]
pub struct ProblemIR {
    pub params: Vec<ParamBlock>,
    pub residuals: Vec<ResidualBlock>,
}

impl ProblemIR {
    /// Creates an empty IR.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a parameter block and returns its `ParamId`.
    pub fn add_param_block(
        &mut self,
        name: impl Into<String>,
        dim: usize,
        manifold: ManifoldKind,
        fixed: FixedMask,
    ) -> ParamId {
        let id = ParamId(self.params.len());
        self.params.push(ParamBlock {
            id,
            name: name.into(),
            dim,
            manifold,
            fixed,
        });
        id
    }

    /// Adds a residual block to the IR.
    pub fn add_residual_block(&mut self, residual: ResidualBlock) {
        self.residuals.push(residual);
    }

    /// Finds a parameter by name.
    pub fn param_by_name(&self, name: &str) -> Option<ParamId> {
        self.params.iter().find(|p| p.name == name).map(|p| p.id)
    }

    /// Validates internal consistency and factor expectations.
    pub fn validate(&self) -> Result<()> {
        for (idx, param) in self.params.iter().enumerate() {
            ensure!(
                param.id.0 == idx,
                "param id mismatch: expected {}, got {:?}",
                idx,
                param.id
            );
            ensure!(
                param.manifold.compatible_dim(param.dim),
                "param {} manifold {:?} incompatible with dim {}",
                param.name,
                param.manifold,
                param.dim
            );
            let tangent = param.manifold.tangent_dim(param.dim);
            for fixed_idx in param.fixed.iter() {
                ensure!(
                    fixed_idx < tangent,
                    "param {} fixed index {} out of range",
                    param.name,
                    fixed_idx
                );
            }
            if param.manifold != ManifoldKind::Euclidean {
                ensure!(
                    param.fixed.is_empty() || param.fixed.is_all_fixed(tangent),
                    "param {} manifold block must be fully free or fully fixed",
                    param.name
                );
            }
        }

        for (r_idx, residual) in self.residuals.iter().enumerate() {
            ensure!(
                residual.residual_dim == residual.factor.residual_dim(),
                "residual {} dim {} does not match factor expectation {}",
                r_idx,
                residual.residual_dim,
                residual.factor.residual_dim()
            );
            for param in &residual.params {
                ensure!(
                    param.0 < self.params.len(),
                    "residual {} references missing param {:?}",
                    r_idx,
                    param
                );
            }

            match &residual.factor {
                FactorKind::TimeOffsetPrior { sigma, .. } => {
                    ensure!(
                        residual.params.len() == 1,
                        "time offset prior requires 1 param"
                    );
                    ensure!(*sigma > 0.0, "time offset prior sigma must be positive");
                    let toff = &self.params[residual.params[0].0];
                    ensure!(
                        toff.dim == 1 && toff.manifold == ManifoldKind::Euclidean,
                        "time offset prior expects a scalar Euclidean param, got dim={} manifold={:?}",
                        toff.dim,
                        toff.manifold
                    );
                }
                FactorKind::GravityMagnitudePrior { sigma, .. } => {
                    ensure!(
                        residual.params.len() == 1,
                        "gravity magnitude prior requires 1 param"
                    );
                    ensure!(*sigma > 0.0, "gravity magnitude prior sigma must be positive");
                    let grav = &self.params[residual.params[0].0];
                    ensure!(
                        grav.dim == 3 && grav.manifold == ManifoldKind::Euclidean,
                        "gravity magnitude prior expects a 3D Euclidean param, got dim={} manifold={:?}",
                        grav.dim,
                        grav.manifold
                    );
                }
                FactorKind::MocapPose { .. } | FactorKind::MocapPoseTimeOffset { .. } => {
                    let with_toff =
                        matches!(residual.factor, FactorKind::MocapPoseTimeOffset { .. });
                    let expected = if with_toff { 4 } else { 3 };
                    ensure!(
                        residual.params.len() == expected,
                        "mocap pose factor requires {} params, got {}",
                        expected,
                        residual.params.len()
                    );
                    let nav = &self.params[residual.params[0].0];
                    let rot = &self.params[residual.params[1].0];
                    let trans = &self.params[residual.params[2].0];
                    ensure!(
                        nav.manifold == ManifoldKind::NavState,
                        "mocap pose factor expects a NavState first param, got {:?}",
                        nav.manifold
                    );
                    ensure!(
                        rot.dim == 4 && rot.manifold == ManifoldKind::SO3,
                        "mocap pose factor expects an SO3 calibration rotation, got dim={} manifold={:?}",
                        rot.dim,
                        rot.manifold
                    );
                    ensure!(
                        trans.dim == 3 && trans.manifold == ManifoldKind::Euclidean,
                        "mocap pose factor expects a 3D calibration translation, got dim={} manifold={:?}",
                        trans.dim,
                        trans.manifold
                    );
                    if with_toff {
                        let toff = &self.params[residual.params[3].0];
                        ensure!(
                            toff.dim == 1 && toff.manifold == ManifoldKind::Euclidean,
                            "mocap pose factor expects a scalar time offset, got dim={} manifold={:?}",
                            toff.dim,
                            toff.manifold
                        );
                    }
                }
                FactorKind::ImuPreintegration { pre, .. } => {
                    ensure!(
                        residual.params.len() == 3,
                        "imu preintegration factor requires 3 params [nav_i, nav_j, gravity]"
                    );
                    ensure!(
                        pre.dt > 0.0,
                        "imu preintegration interval must be positive, got {}",
                        pre.dt
                    );
                    let nav_i = &self.params[residual.params[0].0];
                    let nav_j = &self.params[residual.params[1].0];
                    let grav = &self.params[residual.params[2].0];
                    ensure!(
                        nav_i.manifold == ManifoldKind::NavState
                            && nav_j.manifold == ManifoldKind::NavState,
                        "imu preintegration factor expects NavState endpoints"
                    );
                    ensure!(
                        residual.params[0] != residual.params[1],
                        "imu preintegration factor endpoints must differ"
                    );
                    ensure!(
                        grav.dim == 3 && grav.manifold == ManifoldKind::Euclidean,
                        "imu preintegration factor expects a 3D gravity param, got dim={} manifold={:?}",
                        grav.dim,
                        grav.manifold
                    );
                }
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn retract_zero_is_identity() {
        let x = DVector::from_vec(vec![0.0, 0.0, 0.0, 1.0]);
        let out = ManifoldKind::SO3.retract(&x, &[0.0, 0.0, 0.0]);
        assert_relative_eq!(out, x, epsilon = 1e-12);

        let nav = DVector::from_iterator(16, (0..16).map(|i| if i == 3 { 1.0 } else { 0.1 * i as f64 }));
        let out = ManifoldKind::NavState.retract(&nav, &[0.0; 15]);
        assert_relative_eq!(out, nav, epsilon = 1e-12);
    }

    #[test]
    fn retract_then_inverse_returns_to_start() {
        let x = DVector::from_vec(vec![0.0, 0.0, 0.0, 1.0]);
        let delta = [0.2, -0.1, 0.3];
        let fwd = ManifoldKind::SO3.retract(&x, &delta);
        let back = ManifoldKind::SO3.retract(&fwd, &[-delta[0], -delta[1], -delta[2]]);
        let q0 = quat_from_storage(&x, 0);
        let q1 = quat_from_storage(&back, 0);
        assert_relative_eq!(q0.angle_to(&q1), 0.0, epsilon = 1e-10);
    }

    #[test]
    fn euclidean_retract_adds() {
        let x = DVector::from_vec(vec![1.0, 2.0]);
        let out = ManifoldKind::Euclidean.retract(&x, &[0.5, -1.0]);
        assert_relative_eq!(out[0], 1.5, epsilon = 1e-12);
        assert_relative_eq!(out[1], 1.0, epsilon = 1e-12);
    }

    #[test]
    fn validate_rejects_partially_fixed_manifold_block() {
        let mut ir = ProblemIR::new();
        ir.add_param_block("rot", 4, ManifoldKind::SO3, FixedMask::fix_indices(&[0]));
        assert!(ir.validate().is_err());
    }

    #[test]
    fn validate_checks_prior_layout() {
        let mut ir = ProblemIR::new();
        let toff = ir.add_param_block("toff", 1, ManifoldKind::Euclidean, FixedMask::all_free());
        ir.add_residual_block(ResidualBlock {
            params: vec![toff],
            factor: FactorKind::TimeOffsetPrior {
                center: 0.0,
                sigma: 0.02,
            },
            residual_dim: 1,
        });
        assert!(ir.validate().is_ok());

        let mut bad = ProblemIR::new();
        let grav = bad.add_param_block("gravity", 3, ManifoldKind::Euclidean, FixedMask::all_free());
        bad.add_residual_block(ResidualBlock {
            params: vec![grav],
            factor: FactorKind::TimeOffsetPrior {
                center: 0.0,
                sigma: 0.02,
            },
            residual_dim: 1,
        });
        assert!(bad.validate().is_err());
    }
}
