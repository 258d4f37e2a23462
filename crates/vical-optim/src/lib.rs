//! Non-linear optimization for mocap/IMU calibration.
//!
//! This crate contains the backend-independent problem representation,
//! the residual factors (mocap pose, preintegrated IMU, priors), and a
//! dense manifold-aware Levenberg-Marquardt backend that solves the
//! assembled factor graph.

pub mod backend;
pub mod factors;
pub mod ir;

pub use backend::{DenseLmBackend, OptimBackend, SolveOptions, Solution};
pub use ir::{FactorKind, FixedMask, ManifoldKind, ParamBlock, ParamId, ProblemIR, ResidualBlock};
