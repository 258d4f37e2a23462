//! Recorded data sources for offline runs.
//!
//! A recorded dataset is a single JSON document with keyframe times, mocap
//! pose samples, and preintegrated IMU segments. The pose source answers
//! queries with the nearest sample within a tolerance; the IMU source
//! matches requested intervals against the recorded segments.

use std::path::Path;
use std::sync::Arc;

use nalgebra::Quaternion;
use serde::{Deserialize, Serialize};

use vical_core::{
    ImuPropagator, Mat15, Mat3, Mat6, MocapPose, PoseInterpolator, PreintegratedImu, Quat, Real,
    Vec3,
};

use crate::error::VicalError;

/// Tolerance used when matching recorded IMU segments to requested intervals.
const SEGMENT_TOLERANCE: Real = 1e-6;

/// One recorded mocap pose sample.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordedPoseSample {
    /// Sample time in seconds.
    pub t: Real,
    /// Body orientation in the world frame, scalar first.
    pub q_wxyz: [Real; 4],
    /// Body position in the world frame.
    pub p: [Real; 3],
    /// Diagonal of the 6x6 pose covariance, rotation rows first.
    pub cov_diag: [Real; 6],
}

/// One recorded preintegrated IMU segment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordedImuSegment {
    /// Segment start time in seconds.
    pub t0: Real,
    /// Segment end time in seconds.
    pub t1: Real,
    /// Integrated duration.
    pub dt: Real,
    /// Preintegrated rotation, scalar first.
    pub delta_q_wxyz: [Real; 4],
    /// Preintegrated velocity delta.
    pub delta_v: [Real; 3],
    /// Preintegrated position delta.
    pub delta_p: [Real; 3],
    /// Rotation-wrt-gyro-bias Jacobian, row major.
    pub j_q_bg: [[Real; 3]; 3],
    /// Velocity-wrt-gyro-bias Jacobian, row major.
    pub j_v_bg: [[Real; 3]; 3],
    /// Velocity-wrt-accel-bias Jacobian, row major.
    pub j_v_ba: [[Real; 3]; 3],
    /// Position-wrt-gyro-bias Jacobian, row major.
    pub j_p_bg: [[Real; 3]; 3],
    /// Position-wrt-accel-bias Jacobian, row major.
    pub j_p_ba: [[Real; 3]; 3],
    /// Gyro bias used during integration.
    pub bg_lin: [Real; 3],
    /// Accel bias used during integration.
    pub ba_lin: [Real; 3],
    /// Diagonal of the 15x15 preintegration covariance.
    pub cov_diag: [Real; 15],
}

/// A full recorded calibration dataset.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordedDataset {
    /// Keyframe times in seconds.
    pub keyframes: Vec<Real>,
    /// Mocap pose samples.
    pub poses: Vec<RecordedPoseSample>,
    /// Preintegrated IMU segments.
    pub imu_segments: Vec<RecordedImuSegment>,
    /// Inclusive IMU coverage window `[start, end]`.
    pub imu_range: [Real; 2],
    /// Maximum distance from a query time to the nearest pose sample.
    #[serde(default = "default_pose_tolerance")]
    pub pose_tolerance: Real,
}

fn default_pose_tolerance() -> Real {
    0.5
}

impl RecordedDataset {
    /// Loads a dataset from a JSON file.
    pub fn load(path: &Path) -> Result<Self, VicalError> {
        let file = std::fs::File::open(path)?;
        serde_json::from_reader(std::io::BufReader::new(file)).map_err(|e| {
            VicalError::Configuration(format!("invalid dataset {}: {e}", path.display()))
        })
    }

    /// Splits the dataset into its data sources and keyframe times.
    pub fn into_sources(self) -> (Arc<RecordedImu>, Arc<RecordedPoses>, Vec<Real>) {
        let imu = Arc::new(RecordedImu {
            range: self.imu_range,
            segments: self.imu_segments,
        });
        let mut samples = self.poses;
        samples.sort_by(|a, b| a.t.partial_cmp(&b.t).unwrap_or(std::cmp::Ordering::Equal));
        let poses = Arc::new(RecordedPoses {
            samples,
            tolerance: self.pose_tolerance,
        });
        (imu, poses, self.keyframes)
    }
}

/// IMU source backed by recorded preintegrated segments.
#[derive(Debug)]
pub struct RecordedImu {
    range: [Real; 2],
    segments: Vec<RecordedImuSegment>,
}

impl ImuPropagator for RecordedImu {
    fn has_bounding_imu(&self, t: Real) -> bool {
        t >= self.range[0] && t <= self.range[1]
    }

    fn propagate(&self, t0: Real, t1: Real, bg: &Vec3, ba: &Vec3) -> Option<PreintegratedImu> {
        let seg = self.segments.iter().find(|s| {
            (s.t0 - t0).abs() <= SEGMENT_TOLERANCE && (s.t1 - t1).abs() <= SEGMENT_TOLERANCE
        })?;
        let mut pre = PreintegratedImu {
            dt: seg.dt,
            delta_q: quat_from_wxyz(&seg.delta_q_wxyz),
            delta_v: Vec3::from_row_slice(&seg.delta_v),
            delta_p: Vec3::from_row_slice(&seg.delta_p),
            j_q_bg: mat3_from_rows(&seg.j_q_bg),
            j_v_bg: mat3_from_rows(&seg.j_v_bg),
            j_v_ba: mat3_from_rows(&seg.j_v_ba),
            j_p_bg: mat3_from_rows(&seg.j_p_bg),
            j_p_ba: mat3_from_rows(&seg.j_p_ba),
            bg_lin: Vec3::from_row_slice(&seg.bg_lin),
            ba_lin: Vec3::from_row_slice(&seg.ba_lin),
            cov: Mat15::zeros(),
        };
        for (i, v) in seg.cov_diag.iter().enumerate() {
            pre.cov[(i, i)] = *v;
        }

        // first-order correction for the bias deviation from the recorded
        // linearization point
        let dbg = bg - pre.bg_lin;
        let dba = ba - pre.ba_lin;
        pre.delta_q *= vical_core::exp_so3(&(pre.j_q_bg * dbg));
        pre.delta_v += pre.j_v_bg * dbg + pre.j_v_ba * dba;
        pre.delta_p += pre.j_p_bg * dbg + pre.j_p_ba * dba;
        pre.bg_lin = *bg;
        pre.ba_lin = *ba;

        Some(pre)
    }
}

/// Pose source backed by recorded samples.
#[derive(Debug)]
pub struct RecordedPoses {
    samples: Vec<RecordedPoseSample>,
    tolerance: Real,
}

impl PoseInterpolator for RecordedPoses {
    fn pose_at(&self, t: Real) -> Option<MocapPose> {
        if self.samples.is_empty() || !t.is_finite() {
            return None;
        }
        let idx = self.samples.partition_point(|s| s.t < t);
        let mut best: Option<&RecordedPoseSample> = None;
        for cand in idx.saturating_sub(1)..(idx + 1).min(self.samples.len()) {
            let s = &self.samples[cand];
            match best {
                Some(b) if (b.t - t).abs() <= (s.t - t).abs() => {}
                _ => best = Some(s),
            }
        }
        let s = best?;
        if (s.t - t).abs() > self.tolerance {
            return None;
        }
        let mut cov = Mat6::zeros();
        for (i, v) in s.cov_diag.iter().enumerate() {
            cov[(i, i)] = *v;
        }
        Some(MocapPose {
            q_wb: quat_from_wxyz(&s.q_wxyz),
            p_b_w: Vec3::from_row_slice(&s.p),
            cov,
        })
    }
}

fn quat_from_wxyz(q: &[Real; 4]) -> Quat {
    Quat::from_quaternion(Quaternion::new(q[0], q[1], q[2], q[3]))
}

fn mat3_from_rows(rows: &[[Real; 3]; 3]) -> Mat3 {
    Mat3::new(
        rows[0][0], rows[0][1], rows[0][2], rows[1][0], rows[1][1], rows[1][2], rows[2][0],
        rows[2][1], rows[2][2],
    )
}
