//! Outer calibration loop.
//!
//! Runs graph assembly and the dense LM backend `num_loop_relin + 1` times.
//! Each round rebuilds the graph at the current estimates, which refreshes
//! the preintegration bias linearization points and recenters the
//! time-offset prior.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use log::info;
use nalgebra::DVector;

use vical_core::{ImuPropagator, Mat3, NavState, PoseInterpolator, Quat, Real, Vec3};
use vical_optim::{DenseLmBackend, OptimBackend};

use crate::assemble::build_problem;
use crate::catalog::KeyframeCatalog;
use crate::config::CalibrationConfig;
use crate::error::VicalError;
use crate::{nav_param_name, PARAM_CALIB_ROT, PARAM_CALIB_TRANS, PARAM_GRAVITY, PARAM_TOFF};

/// Final calibration estimates.
#[derive(Debug, Clone)]
pub struct CalibrationResult {
    /// Body-to-imu rotation matrix.
    pub rotation: Mat3,
    /// Body-to-imu rotation as a unit quaternion.
    pub quaternion: Quat,
    /// Body origin expressed in the imu frame.
    pub translation: Vec3,
    /// Gravity in the mocap world frame.
    pub gravity: Vec3,
    /// Estimated time offset, zero when not estimated.
    pub time_offset: Real,
    /// Navigation states at the surviving keyframes, in time order.
    pub states: Vec<NavState>,
}

/// Drives the calibration from data sources to a `CalibrationResult`.
pub struct CalibrationSolver {
    config: CalibrationConfig,
    catalog: KeyframeCatalog,
    imu: Arc<dyn ImuPropagator>,
    interp: Arc<dyn PoseInterpolator>,
    values: HashMap<String, DVector<Real>>,
    result: Option<CalibrationResult>,
}

impl CalibrationSolver {
    /// Creates a solver over the given keyframe times and data sources.
    pub fn new(
        config: CalibrationConfig,
        times: &[Real],
        imu: Arc<dyn ImuPropagator>,
        interp: Arc<dyn PoseInterpolator>,
    ) -> Result<Self, VicalError> {
        config.validate()?;
        let catalog = KeyframeCatalog::from_times(times)?;
        Ok(Self {
            config,
            catalog,
            imu,
            interp,
            values: HashMap::new(),
            result: None,
        })
    }

    /// Runs the full calibration.
    ///
    /// `cancel` is polled during graph assembly; a cancelled run still
    /// solves whatever partial graph was assembled.
    pub fn run(&mut self, cancel: &dyn Fn() -> bool) -> Result<(), VicalError> {
        let dropped = self.catalog.filter_by_imu(self.imu.as_ref())?;
        if dropped > 0 {
            info!("dropped {dropped} keyframes outside the IMU coverage window");
        }
        if self.catalog.len() < 2 {
            return Err(VicalError::Configuration(format!(
                "need at least 2 keyframes with IMU coverage, have {}",
                self.catalog.len()
            )));
        }

        let backend = DenseLmBackend::default();
        let rounds = self.config.num_loop_relin + 1;
        for round in 0..rounds {
            let build_start = Instant::now();
            let out = build_problem(
                &mut self.catalog,
                self.imu.as_ref(),
                &self.interp,
                &mut self.values,
                &self.config,
                round == 0,
                cancel,
            )?;
            let build_time = build_start.elapsed();

            let solve_start = Instant::now();
            let sol = backend
                .solve(&out.ir, &self.values, &self.config.solve)
                .map_err(|e| VicalError::NumericalSingularity(format!("{e:#}")))?;
            let solve_time = solve_start.elapsed();

            for (name, value) in sol.params {
                self.values.insert(name, value);
            }

            info!(
                "round {}/{}: cost {:.6e} -> {:.6e} in {} iterations ({} keyframes, build {:.3}s, solve {:.3}s)",
                round + 1,
                rounds,
                sol.initial_cost,
                sol.final_cost,
                sol.iterations,
                out.kept,
                build_time.as_secs_f64(),
                solve_time.as_secs_f64()
            );
            if self.config.estimate_time_offset {
                if let Some(toff) = self.values.get(PARAM_TOFF) {
                    info!("round {}/{}: time offset {:.6}s", round + 1, rounds, toff[0]);
                }
            }
        }

        self.result = Some(self.extract_result()?);
        Ok(())
    }

    /// Result of the last successful `run`, if any.
    pub fn result(&self) -> Option<&CalibrationResult> {
        self.result.as_ref()
    }

    fn extract_result(&self) -> Result<CalibrationResult, VicalError> {
        let rot = self.required(PARAM_CALIB_ROT)?;
        if rot.len() != 4 {
            return Err(VicalError::InternalConsistency(
                "calibration rotation has wrong storage size".into(),
            ));
        }
        let quaternion = Quat::from_quaternion(nalgebra::Quaternion::new(
            rot[3], rot[0], rot[1], rot[2],
        ));
        let trans = self.required(PARAM_CALIB_TRANS)?;
        let gravity = self.required(PARAM_GRAVITY)?;
        let time_offset = if self.config.estimate_time_offset {
            self.required(PARAM_TOFF)?[0]
        } else {
            0.0
        };

        let mut states = Vec::with_capacity(self.catalog.len());
        for kf in self.catalog.frames() {
            let vals = self.required(&nav_param_name(kf.index))?;
            let state = NavState::from_vec(kf.t, vals).ok_or_else(|| {
                VicalError::InternalConsistency(format!(
                    "navigation state {} has wrong storage size",
                    kf.index
                ))
            })?;
            states.push(state);
        }

        Ok(CalibrationResult {
            rotation: *quaternion.to_rotation_matrix().matrix(),
            quaternion,
            translation: Vec3::new(trans[0], trans[1], trans[2]),
            gravity: Vec3::new(gravity[0], gravity[1], gravity[2]),
            time_offset,
            states,
        })
    }

    fn required(&self, name: &str) -> Result<&DVector<Real>, VicalError> {
        self.values
            .get(name)
            .ok_or_else(|| VicalError::InternalConsistency(format!("missing solved value {name}")))
    }
}
