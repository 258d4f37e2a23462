//! Navigation states, measurement payloads, and the trait seams for the
//! external IMU propagator and mocap pose interpolator.

use nalgebra::DVector;

use crate::math::{Mat15, Mat3, Mat6, Quat, Real, Vec3};

/// Storage dimension of a navigation state parameter vector.
pub const NAV_STATE_DIM: usize = 16;
/// Tangent dimension of a navigation state.
pub const NAV_STATE_TANGENT_DIM: usize = 15;

/// Full inertial navigation state at a keyframe.
///
/// Parameter storage is `[qx, qy, qz, qw, bg, v, ba, p]` (16 values); the
/// tangent ordering is `[theta, bg, v, ba, p]` (15 values). The quaternion
/// `q_wi` rotates imu-frame vectors into the world frame.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NavState {
    /// Keyframe timestamp in seconds.
    pub t: Real,
    /// Orientation, world from imu.
    pub q_wi: Quat,
    /// Gyroscope bias.
    pub bg: Vec3,
    /// Velocity in the world frame.
    pub v: Vec3,
    /// Accelerometer bias.
    pub ba: Vec3,
    /// Imu position in the world frame.
    pub p: Vec3,
}

impl NavState {
    /// State at `t` with the given orientation and position, zero velocity
    /// and zero biases.
    pub fn from_pose(t: Real, q_wi: Quat, p: Vec3) -> Self {
        Self {
            t,
            q_wi,
            bg: Vec3::zeros(),
            v: Vec3::zeros(),
            ba: Vec3::zeros(),
            p,
        }
    }

    /// Serializes into the 16-value parameter layout.
    pub fn to_vec(&self) -> DVector<Real> {
        let q = self.q_wi.coords;
        DVector::from_vec(vec![
            q.x, q.y, q.z, q.w, self.bg.x, self.bg.y, self.bg.z, self.v.x, self.v.y, self.v.z,
            self.ba.x, self.ba.y, self.ba.z, self.p.x, self.p.y, self.p.z,
        ])
    }

    /// Reads a state back from the 16-value parameter layout.
    ///
    /// Returns `None` if the vector has the wrong length. The quaternion is
    /// renormalized on read.
    pub fn from_vec(t: Real, v: &DVector<Real>) -> Option<Self> {
        if v.len() != NAV_STATE_DIM {
            return None;
        }
        let q_wi = Quat::from_quaternion(nalgebra::Quaternion::new(v[3], v[0], v[1], v[2]));
        Some(Self {
            t,
            q_wi,
            bg: Vec3::new(v[4], v[5], v[6]),
            v: Vec3::new(v[7], v[8], v[9]),
            ba: Vec3::new(v[10], v[11], v[12]),
            p: Vec3::new(v[13], v[14], v[15]),
        })
    }
}

/// Preintegrated IMU measurement between two keyframes.
///
/// Produced by the external propagator. The delta terms are expressed in
/// the frame of the first keyframe; the `j_*` matrices are first-order
/// corrections for deviations of the bias estimates from `bg_lin`/`ba_lin`.
#[derive(Debug, Clone)]
pub struct PreintegratedImu {
    /// Integration interval in seconds.
    pub dt: Real,
    /// Preintegrated orientation delta.
    pub delta_q: Quat,
    /// Preintegrated velocity delta.
    pub delta_v: Vec3,
    /// Preintegrated position delta.
    pub delta_p: Vec3,
    /// Jacobian of the orientation delta w.r.t. the gyro bias.
    pub j_q_bg: Mat3,
    /// Jacobian of the velocity delta w.r.t. the gyro bias.
    pub j_v_bg: Mat3,
    /// Jacobian of the velocity delta w.r.t. the accel bias.
    pub j_v_ba: Mat3,
    /// Jacobian of the position delta w.r.t. the gyro bias.
    pub j_p_bg: Mat3,
    /// Jacobian of the position delta w.r.t. the accel bias.
    pub j_p_ba: Mat3,
    /// Gyro bias used during integration.
    pub bg_lin: Vec3,
    /// Accel bias used during integration.
    pub ba_lin: Vec3,
    /// 15x15 covariance in the residual ordering `[theta, bg, v, ba, p]`.
    pub cov: Mat15,
}

/// Interpolated mocap body pose with uncertainty.
#[derive(Debug, Clone)]
pub struct MocapPose {
    /// Orientation, world from body.
    pub q_wb: Quat,
    /// Body position in the world frame.
    pub p_b_w: Vec3,
    /// 6x6 covariance, rotation block first, then translation.
    pub cov: Mat6,
}

/// External IMU preintegration source.
pub trait ImuPropagator {
    /// Whether raw IMU data brackets the given timestamp.
    fn has_bounding_imu(&self, t: Real) -> bool;

    /// Preintegrates IMU measurements over `[t0, t1]` with the given bias
    /// linearization point. Returns `None` when the interval cannot be
    /// covered.
    fn propagate(&self, t0: Real, t1: Real, bg: &Vec3, ba: &Vec3) -> Option<PreintegratedImu>;
}

/// External mocap pose source.
pub trait PoseInterpolator {
    /// Interpolated body pose at the given timestamp, or `None` when the
    /// timestamp is not covered by the recording.
    fn pose_at(&self, t: Real) -> Option<MocapPose>;
}
