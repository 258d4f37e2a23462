//! Core math and state primitives for `vical`.
//!
//! This crate contains:
//! - linear algebra type aliases (`Real`, `Vec3`, `Mat3`, ...),
//! - SO(3) utilities (skew, exponential/logarithm maps, right Jacobians),
//! - navigation state and measurement types shared by the optimizer and
//!   the calibration pipeline,
//! - trait seams for the external IMU propagator and pose interpolator.

/// Linear algebra type aliases.
pub mod math;
/// SO(3) group utilities.
pub mod so3;
/// Navigation states, measurements, and data-source traits.
pub mod state;

pub use math::*;
pub use so3::*;
pub use state::*;
