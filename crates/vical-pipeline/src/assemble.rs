//! Graph assembly from keyframes and data sources.
//!
//! `build_problem` turns the keyframe catalog plus IMU and mocap sources
//! into a `ProblemIR`. Keyframes whose mocap pose cannot be interpolated
//! (or whose pose covariance is singular) are dropped and the IMU chain is
//! bridged across the gap. Other failures abort the build.

use std::collections::HashMap;
use std::sync::Arc;

use log::{debug, warn};
use nalgebra::DVector;

use vical_core::{ImuPropagator, Mat6, MocapPose, NavState, PoseInterpolator, Quat, Real, Vec3};
use vical_optim::factors::{imu_preint, mocap_pose};
use vical_optim::{FactorKind, FixedMask, ManifoldKind, ParamId, ProblemIR, ResidualBlock};

use crate::catalog::KeyframeCatalog;
use crate::config::CalibrationConfig;
use crate::error::VicalError;
use crate::{nav_param_name, PARAM_CALIB_ROT, PARAM_CALIB_TRANS, PARAM_GRAVITY, PARAM_TOFF};

/// Stability prior sigma on the time offset, seconds.
const TOFF_PRIOR_SIGMA: Real = 0.02;
/// Near-hard prior sigma pinning the gravity norm.
const GRAVITY_PRIOR_SIGMA: Real = 1e-10;
/// Probe offset around the corrected time, seconds.
const PROBE_SPAN: Real = 1.0;
/// Tolerance between a preintegration interval and the keyframe spacing.
const DT_TOLERANCE: Real = 1e-6;

/// Result of one graph assembly pass.
#[derive(Debug)]
pub struct GraphBuildOutput {
    /// Assembled and validated problem.
    pub ir: ProblemIR,
    /// Number of keyframes that received a navigation state.
    pub kept: usize,
    /// Dense indices of keyframes dropped during this pass.
    pub dropped: Vec<usize>,
}

/// Assembles the calibration factor graph over the catalog's keyframes.
///
/// On `init`, seeds the calibration, gravity, time-offset, and navigation
/// values into `values`; later passes reuse the stored estimates. The
/// `cancel` closure is polled once per keyframe; when it returns `true`
/// assembly stops early and the partial graph is returned.
pub fn build_problem(
    catalog: &mut KeyframeCatalog,
    imu: &dyn ImuPropagator,
    interp: &Arc<dyn PoseInterpolator>,
    values: &mut HashMap<String, DVector<Real>>,
    config: &CalibrationConfig,
    init: bool,
    cancel: &dyn Fn() -> bool,
) -> Result<GraphBuildOutput, VicalError> {
    let q_ib_init = config.extrinsic_rotation_init()?;
    let p_b_i_init = config.extrinsic_translation_init()?;
    let g_init = config.gravity_init()?;

    if init {
        values.insert(PARAM_CALIB_ROT.into(), quat_storage(&q_ib_init));
        values.insert(
            PARAM_CALIB_TRANS.into(),
            DVector::from_column_slice(p_b_i_init.as_slice()),
        );
        values.insert(
            PARAM_GRAVITY.into(),
            DVector::from_column_slice(g_init.as_slice()),
        );
        if config.estimate_time_offset {
            values.insert(PARAM_TOFF.into(), DVector::from_element(1, config.time_offset));
        }
    }

    let mut ir = ProblemIR::new();
    let rot_id = ir.add_param_block(PARAM_CALIB_ROT, 4, ManifoldKind::SO3, FixedMask::all_free());
    let trans_id = ir.add_param_block(
        PARAM_CALIB_TRANS,
        3,
        ManifoldKind::Euclidean,
        FixedMask::all_free(),
    );
    let gravity_id = ir.add_param_block(
        PARAM_GRAVITY,
        3,
        ManifoldKind::Euclidean,
        FixedMask::all_free(),
    );

    let toff_cur = if config.estimate_time_offset {
        let toff_id =
            ir.add_param_block(PARAM_TOFF, 1, ManifoldKind::Euclidean, FixedMask::all_free());
        let center = values
            .get(PARAM_TOFF)
            .map(|v| v[0])
            .unwrap_or(config.time_offset);
        ir.add_residual_block(ResidualBlock {
            params: vec![toff_id],
            factor: FactorKind::TimeOffsetPrior {
                center,
                sigma: TOFF_PRIOR_SIGMA,
            },
            residual_dim: 1,
        });
        Some((toff_id, center))
    } else {
        None
    };

    if config.enforce_gravity_magnitude {
        ir.add_residual_block(ResidualBlock {
            params: vec![gravity_id],
            factor: FactorKind::GravityMagnitudePrior {
                target: g_init.norm(),
                sigma: GRAVITY_PRIOR_SIGMA,
            },
            residual_dim: 1,
        });
    }

    let toff_value = toff_cur.map(|(_, c)| c).unwrap_or(config.time_offset);

    let frames: Vec<_> = catalog.frames().to_vec();
    let mut dropped: Vec<usize> = Vec::new();
    let mut prev: Option<(ParamId, Real, usize)> = None;
    let mut kept = 0usize;
    let mut cancelled = false;

    for kf in &frames {
        if cancel() {
            warn!("assembly cancelled at keyframe {}, partial graph kept", kf.index);
            cancelled = true;
            break;
        }

        let name = nav_param_name(kf.index);
        let (pose, sqrt_info) = match probe_pose(interp.as_ref(), kf.t + toff_value) {
            Ok(p) => p,
            Err(VicalError::MeasurementGap { t }) => {
                warn!(
                    "dropping keyframe {} (t={:.6}): no usable mocap pose near t={:.6}",
                    kf.index, kf.t, t
                );
                dropped.push(kf.index);
                values.remove(&name);
                continue;
            }
            Err(e) => return Err(e),
        };

        if init {
            let q_wi = pose.q_wb * q_ib_init.inverse();
            let p_i = pose.p_b_w - q_wi * p_b_i_init;
            values.insert(name.clone(), NavState::from_pose(kf.t, q_wi, p_i).to_vec());
        }

        let nav_id = ir.add_param_block(&name, 16, ManifoldKind::NavState, FixedMask::all_free());

        match toff_cur {
            Some((toff_id, _)) => ir.add_residual_block(ResidualBlock {
                params: vec![nav_id, rot_id, trans_id, toff_id],
                factor: FactorKind::MocapPoseTimeOffset {
                    t_nominal: kf.t,
                    interp: Arc::clone(interp),
                },
                residual_dim: 6,
            }),
            None => ir.add_residual_block(ResidualBlock {
                params: vec![nav_id, rot_id, trans_id],
                factor: FactorKind::MocapPose {
                    q_wb_meas: pose.q_wb,
                    p_b_w_meas: pose.p_b_w,
                    sqrt_info: Box::new(sqrt_info),
                },
                residual_dim: 6,
            }),
        }

        if let Some((prev_id, prev_t, prev_index)) = prev {
            let prev_name = nav_param_name(prev_index);
            let prev_vals = values.get(&prev_name).ok_or_else(|| {
                VicalError::InternalConsistency(format!("missing values for {prev_name}"))
            })?;
            let bg = Vec3::new(prev_vals[4], prev_vals[5], prev_vals[6]);
            let ba = Vec3::new(prev_vals[10], prev_vals[11], prev_vals[12]);

            let pre = imu.propagate(prev_t, kf.t, &bg, &ba).ok_or_else(|| {
                VicalError::InternalConsistency(format!(
                    "IMU propagation failed over [{prev_t:.6}, {:.6}] despite coverage",
                    kf.t
                ))
            })?;
            if (pre.dt - (kf.t - prev_t)).abs() > DT_TOLERANCE {
                return Err(VicalError::InternalConsistency(format!(
                    "preintegration interval {:.9} disagrees with keyframe spacing {:.9}",
                    pre.dt,
                    kf.t - prev_t
                )));
            }
            let sqrt_info = imu_preint::sqrt_information(&pre.cov).ok_or_else(|| {
                VicalError::NumericalSingularity(format!(
                    "non-finite or singular preintegration covariance over [{prev_t:.6}, {:.6}]",
                    kf.t
                ))
            })?;
            ir.add_residual_block(ResidualBlock {
                params: vec![prev_id, nav_id, gravity_id],
                factor: FactorKind::ImuPreintegration {
                    pre: Box::new(pre),
                    sqrt_info: Box::new(sqrt_info),
                },
                residual_dim: 15,
            });
        }

        prev = Some((nav_id, kf.t, kf.index));
        kept += 1;
    }

    if !cancelled && kept < 2 {
        return Err(VicalError::Configuration(format!(
            "fewer than 2 usable keyframes after assembly ({kept} kept, {} dropped)",
            dropped.len()
        )));
    }

    debug!(
        "assembled graph: {} params, {} residuals, {} keyframes kept, {} dropped",
        ir.params.len(),
        ir.residuals.len(),
        kept,
        dropped.len()
    );

    catalog.remove_indices(&dropped);
    ir.validate()
        .map_err(|e| VicalError::InternalConsistency(format!("{e:#}")))?;

    Ok(GraphBuildOutput { ir, kept, dropped })
}

/// Interpolates the pose at `t_corr` and checks the corrected time and its
/// one-second neighborhood, so a later time-offset step cannot walk off the
/// recording.
fn probe_pose(
    interp: &dyn PoseInterpolator,
    t_corr: Real,
) -> Result<(MocapPose, Mat6), VicalError> {
    for probe in [t_corr - PROBE_SPAN, t_corr + PROBE_SPAN] {
        if interp.pose_at(probe).is_none() {
            return Err(VicalError::MeasurementGap { t: probe });
        }
    }
    let pose = interp
        .pose_at(t_corr)
        .ok_or(VicalError::MeasurementGap { t: t_corr })?;
    match mocap_pose::sqrt_information(&pose.cov) {
        Some(sqrt_info) => Ok((pose, sqrt_info)),
        None => {
            debug!("pose covariance at t={t_corr:.6} is singular or non-finite");
            Err(VicalError::MeasurementGap { t: t_corr })
        }
    }
}

fn quat_storage(q: &Quat) -> DVector<Real> {
    DVector::from_column_slice(&[q.coords.x, q.coords.y, q.coords.z, q.coords.w])
}

#[cfg(test)]
mod tests {
    use super::*;
    use vical_core::{Mat15, Mat3, PreintegratedImu};

    /// Stationary body at the origin with exactly consistent IMU deltas.
    struct StaticScene {
        g: Vec3,
        t0: Real,
        t1: Real,
        pose_hole: Option<(Real, Real)>,
    }

    impl StaticScene {
        fn new() -> Self {
            Self {
                g: Vec3::new(0.0, 0.0, 9.8),
                t0: -2.0,
                t1: 12.0,
                pose_hole: None,
            }
        }
    }

    impl ImuPropagator for StaticScene {
        fn has_bounding_imu(&self, t: Real) -> bool {
            t >= self.t0 && t <= self.t1
        }

        fn propagate(&self, t0: Real, t1: Real, bg: &Vec3, ba: &Vec3) -> Option<PreintegratedImu> {
            let dt = t1 - t0;
            Some(PreintegratedImu {
                dt,
                delta_q: Quat::identity(),
                delta_v: self.g * dt,
                delta_p: self.g * (0.5 * dt * dt),
                j_q_bg: -Mat3::identity() * dt,
                j_v_bg: Mat3::zeros(),
                j_v_ba: -Mat3::identity() * dt,
                j_p_bg: Mat3::zeros(),
                j_p_ba: -Mat3::identity() * (0.5 * dt * dt),
                bg_lin: *bg,
                ba_lin: *ba,
                cov: Mat15::identity() * 1e-4,
            })
        }
    }

    impl PoseInterpolator for StaticScene {
        fn pose_at(&self, t: Real) -> Option<MocapPose> {
            if let Some((h0, h1)) = self.pose_hole {
                if t >= h0 && t <= h1 {
                    return None;
                }
            }
            if t < self.t0 || t > self.t1 {
                return None;
            }
            Some(MocapPose {
                q_wb: Quat::identity(),
                p_b_w: Vec3::zeros(),
                cov: Mat6::identity() * 1e-6,
            })
        }
    }

    fn build(
        scene: StaticScene,
        times: &[Real],
        config: &CalibrationConfig,
    ) -> (Result<GraphBuildOutput, VicalError>, KeyframeCatalog, HashMap<String, DVector<Real>>)
    {
        let mut catalog = KeyframeCatalog::from_times(times).unwrap();
        catalog.filter_by_imu(&scene).unwrap();
        let mut values = HashMap::new();
        let interp: Arc<dyn PoseInterpolator> = Arc::new(scene);
        let scene_imu = StaticScene::new();
        let out = build_problem(
            &mut catalog,
            &scene_imu,
            &interp,
            &mut values,
            config,
            true,
            &|| false,
        );
        (out, catalog, values)
    }

    #[test]
    fn one_pose_factor_per_keyframe_and_chained_imu() {
        let times = [0.0, 1.0, 2.0, 3.0];
        let (out, _, values) = build(StaticScene::new(), &times, &CalibrationConfig::default());
        let out = out.unwrap();
        assert_eq!(out.kept, 4);
        assert!(out.dropped.is_empty());

        let poses = out
            .ir
            .residuals
            .iter()
            .filter(|r| matches!(r.factor, FactorKind::MocapPose { .. }))
            .count();
        let imus = out
            .ir
            .residuals
            .iter()
            .filter(|r| matches!(r.factor, FactorKind::ImuPreintegration { .. }))
            .count();
        assert_eq!(poses, 4);
        assert_eq!(imus, 3);
        for k in 0..4 {
            assert!(values.contains_key(&nav_param_name(k)));
        }
    }

    #[test]
    fn pose_gap_drops_keyframe_and_bridges_chain() {
        let mut scene = StaticScene::new();
        scene.pose_hole = Some((1.9, 2.1));
        let times = [0.0, 1.0, 2.0, 3.0];
        let (out, catalog, values) = build(scene, &times, &CalibrationConfig::default());
        let out = out.unwrap();
        assert_eq!(out.kept, 3);
        assert_eq!(out.dropped, vec![2]);
        assert!(!values.contains_key(&nav_param_name(2)));
        assert_eq!(catalog.len(), 3);

        // the IMU chain bridges 1 -> 3
        let imus = out
            .ir
            .residuals
            .iter()
            .filter(|r| matches!(r.factor, FactorKind::ImuPreintegration { .. }))
            .count();
        assert_eq!(imus, 2);
    }

    #[test]
    fn probe_span_guards_recording_edges() {
        // the last keyframe sits closer than the probe span to the end
        let times = [0.0, 1.0, 2.0, 11.5];
        let (out, _, _) = build(StaticScene::new(), &times, &CalibrationConfig::default());
        let out = out.unwrap();
        assert_eq!(out.kept, 3);
        assert_eq!(out.dropped, vec![3]);
    }

    #[test]
    fn too_few_keyframes_is_configuration_error() {
        let mut scene = StaticScene::new();
        scene.pose_hole = Some((0.5, 3.5));
        let times = [1.0, 2.0, 3.0];
        let (out, _, _) = build(scene, &times, &CalibrationConfig::default());
        assert!(matches!(out, Err(VicalError::Configuration(_))));
    }

    #[test]
    fn cancellation_keeps_partial_graph() {
        let times = [0.0, 1.0, 2.0, 3.0];
        let mut catalog = KeyframeCatalog::from_times(&times).unwrap();
        let scene = StaticScene::new();
        catalog.filter_by_imu(&scene).unwrap();
        let interp: Arc<dyn PoseInterpolator> = Arc::new(StaticScene::new());
        let mut values = HashMap::new();
        let calls = std::cell::Cell::new(0usize);
        let out = build_problem(
            &mut catalog,
            &scene,
            &interp,
            &mut values,
            &CalibrationConfig::default(),
            true,
            &|| {
                calls.set(calls.get() + 1);
                calls.get() > 2
            },
        )
        .unwrap();
        assert_eq!(out.kept, 2);
    }

    #[test]
    fn time_offset_estimation_adds_prior_and_offset_factors() {
        let config = CalibrationConfig {
            estimate_time_offset: true,
            time_offset: 0.01,
            ..CalibrationConfig::default()
        };
        let times = [0.0, 1.0, 2.0];
        let (out, _, values) = build(StaticScene::new(), &times, &config);
        let out = out.unwrap();

        assert_eq!(values[PARAM_TOFF][0], 0.01);
        let priors = out
            .ir
            .residuals
            .iter()
            .filter(|r| matches!(r.factor, FactorKind::TimeOffsetPrior { .. }))
            .count();
        let offset_poses = out
            .ir
            .residuals
            .iter()
            .filter(|r| matches!(r.factor, FactorKind::MocapPoseTimeOffset { .. }))
            .count();
        assert_eq!(priors, 1);
        assert_eq!(offset_poses, 3);
    }

    #[test]
    fn gravity_prior_present_only_when_enforced() {
        let times = [0.0, 1.0, 2.0];
        let config = CalibrationConfig {
            enforce_gravity_magnitude: true,
            ..CalibrationConfig::default()
        };
        let (out, _, _) = build(StaticScene::new(), &times, &config);
        let count = out
            .unwrap()
            .ir
            .residuals
            .iter()
            .filter(|r| matches!(r.factor, FactorKind::GravityMagnitudePrior { .. }))
            .count();
        assert_eq!(count, 1);

        let (out, _, _) = build(StaticScene::new(), &times, &CalibrationConfig::default());
        let count = out
            .unwrap()
            .ir
            .residuals
            .iter()
            .filter(|r| matches!(r.factor, FactorKind::GravityMagnitudePrior { .. }))
            .count();
        assert_eq!(count, 0);
    }
}
