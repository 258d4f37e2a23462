//! Solver backends for the factor-graph IR.
//!
//! A backend consumes the IR plus named initial values and returns a solved
//! parameter map. The dense Levenberg-Marquardt backend is the only one
//! currently implemented; the trait keeps the pipeline independent of the
//! concrete solver.

mod dense_lm;

pub use dense_lm::DenseLmBackend;

use anyhow::Result;
use nalgebra::DVector;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::ir::ProblemIR;
use vical_core::Real;

/// Backend-agnostic solver options.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SolveOptions {
    /// Maximum number of outer iterations.
    pub max_iters: usize,
    /// Verbosity level; non-zero logs per-iteration progress.
    pub verbosity: usize,
    /// Initial damping factor.
    pub lambda_init: Real,
    /// Damping cap; exceeding it terminates the solve.
    pub lambda_max: Real,
    /// Absolute cost-decrease threshold for early termination.
    pub abs_tol: Real,
    /// Relative cost-decrease threshold for early termination.
    pub rel_tol: Real,
}

impl Default for SolveOptions {
    fn default() -> Self {
        Self {
            max_iters: 20,
            verbosity: 0,
            lambda_init: 1e-5,
            lambda_max: 1e20,
            abs_tol: 1e-30,
            rel_tol: 1e-30,
        }
    }
}

/// Solver output.
///
/// The `params` map uses the IR parameter block names.
#[derive(Debug, Clone)]
pub struct Solution {
    /// Optimized parameter vectors keyed by block name.
    pub params: HashMap<String, DVector<Real>>,
    /// Cost at the initial values.
    pub initial_cost: Real,
    /// Cost at the returned values.
    pub final_cost: Real,
    /// Number of outer iterations performed.
    pub iterations: usize,
}

/// Backend interface implemented by solver adapters.
pub trait OptimBackend {
    /// Solve a validated IR with the provided initial parameters.
    fn solve(
        &self,
        ir: &ProblemIR,
        initial: &HashMap<String, DVector<Real>>,
        opts: &SolveOptions,
    ) -> Result<Solution>;
}
