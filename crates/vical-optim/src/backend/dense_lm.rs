//! Dense manifold-aware Levenberg-Marquardt backend.
//!
//! Builds the normal equations over the concatenated tangent space of all
//! free parameter blocks and applies multiplicative damping on the Hessian
//! diagonal. Steps are applied through each block's manifold retraction,
//! so quaternion-bearing blocks stay on their manifolds throughout.

use anyhow::{anyhow, bail, ensure, Result};
use log::{debug, info};
use nalgebra::{DMatrix, DVector};
use std::collections::HashMap;

use super::{OptimBackend, Solution, SolveOptions};
use crate::factors;
use crate::ir::ProblemIR;
use vical_core::Real;

const LAMBDA_SHRINK: Real = 0.1;
const LAMBDA_GROW: Real = 10.0;
const LAMBDA_MIN: Real = 1e-15;
const DIAG_FLOOR: Real = 1e-12;

/// Dense Levenberg-Marquardt over the IR.
#[derive(Debug, Default)]
pub struct DenseLmBackend;

/// Tangent-space column layout of the free parameters.
struct Layout {
    /// Per block: tangent index to global column, `None` for fixed indices.
    cols: Vec<Vec<Option<usize>>>,
    total: usize,
}

fn build_layout(ir: &ProblemIR) -> Layout {
    let mut cols = Vec::with_capacity(ir.params.len());
    let mut next = 0;
    for block in &ir.params {
        let tangent_dim = block.manifold.tangent_dim(block.dim);
        let mut map = Vec::with_capacity(tangent_dim);
        for k in 0..tangent_dim {
            if block.fixed.is_fixed(k) {
                map.push(None);
            } else {
                map.push(Some(next));
                next += 1;
            }
        }
        cols.push(map);
    }
    Layout { cols, total: next }
}

fn gather_values(
    ir: &ProblemIR,
    initial: &HashMap<String, DVector<Real>>,
) -> Result<Vec<DVector<Real>>> {
    let mut values = Vec::with_capacity(ir.params.len());
    for block in &ir.params {
        let v = initial
            .get(&block.name)
            .ok_or_else(|| anyhow!("missing initial value for param {}", block.name))?;
        ensure!(
            v.len() == block.dim,
            "initial value for param {} has dim {}, expected {}",
            block.name,
            v.len(),
            block.dim
        );
        values.push(v.clone());
    }
    Ok(values)
}

fn total_cost(ir: &ProblemIR, values: &[DVector<Real>]) -> Result<Real> {
    let mut cost = 0.0;
    for residual in &ir.residuals {
        let refs: Vec<&DVector<Real>> =
            residual.params.iter().map(|id| &values[id.0]).collect();
        let (r, _) = factors::evaluate(&residual.factor, &refs)?;
        cost += 0.5 * r.norm_squared();
    }
    Ok(cost)
}

fn linearize(
    ir: &ProblemIR,
    values: &[DVector<Real>],
    layout: &Layout,
) -> Result<(Real, DMatrix<Real>, DVector<Real>)> {
    let mut h = DMatrix::zeros(layout.total, layout.total);
    let mut g = DVector::zeros(layout.total);
    let mut cost = 0.0;

    for residual in &ir.residuals {
        let refs: Vec<&DVector<Real>> =
            residual.params.iter().map(|id| &values[id.0]).collect();
        let (r, jacs) = factors::evaluate(&residual.factor, &refs)?;
        cost += 0.5 * r.norm_squared();

        for (a, pid_a) in residual.params.iter().enumerate() {
            let map_a = &layout.cols[pid_a.0];
            let jt_r = jacs[a].transpose() * &r;
            for (ka, col_a) in map_a.iter().enumerate() {
                if let Some(ca) = col_a {
                    g[*ca] += jt_r[ka];
                }
            }
            for (b, pid_b) in residual.params.iter().enumerate() {
                let map_b = &layout.cols[pid_b.0];
                let jtj = jacs[a].transpose() * &jacs[b];
                for (ka, col_a) in map_a.iter().enumerate() {
                    let Some(ca) = col_a else { continue };
                    for (kb, col_b) in map_b.iter().enumerate() {
                        if let Some(cb) = col_b {
                            h[(*ca, *cb)] += jtj[(ka, kb)];
                        }
                    }
                }
            }
        }
    }
    Ok((cost, h, g))
}

fn apply_step(
    ir: &ProblemIR,
    values: &[DVector<Real>],
    layout: &Layout,
    step: &DVector<Real>,
) -> Vec<DVector<Real>> {
    let mut out = Vec::with_capacity(values.len());
    for (block, value) in ir.params.iter().zip(values) {
        let map = &layout.cols[block.id.0];
        let mut delta = vec![0.0; map.len()];
        for (k, col) in map.iter().enumerate() {
            if let Some(c) = col {
                delta[k] = step[*c];
            }
        }
        out.push(block.manifold.retract(value, &delta));
    }
    out
}

impl OptimBackend for DenseLmBackend {
    fn solve(
        &self,
        ir: &ProblemIR,
        initial: &HashMap<String, DVector<Real>>,
        opts: &SolveOptions,
    ) -> Result<Solution> {
        ir.validate()?;
        let layout = build_layout(ir);
        let mut values = gather_values(ir, initial)?;

        let (mut cost, mut h, mut g) = linearize(ir, &values, &layout)?;
        ensure!(cost.is_finite(), "non-finite cost at initial values");
        let initial_cost = cost;
        let mut iterations = 0;
        let mut lambda = opts.lambda_init;

        if layout.total > 0 && cost > opts.abs_tol {
            'outer: while iterations < opts.max_iters {
                iterations += 1;

                loop {
                    let mut damped = h.clone();
                    for i in 0..layout.total {
                        let d = h[(i, i)].max(DIAG_FLOOR);
                        damped[(i, i)] += lambda * d;
                    }

                    let step = match damped.cholesky() {
                        Some(chol) => {
                            let rhs = -&g;
                            chol.solve(&rhs)
                        }
                        None => {
                            lambda *= LAMBDA_GROW;
                            if lambda > opts.lambda_max {
                                bail!("normal equations remained singular at maximum damping");
                            }
                            continue;
                        }
                    };

                    let candidate = apply_step(ir, &values, &layout, &step);
                    let new_cost = total_cost(ir, &candidate)?;

                    if new_cost.is_finite() && new_cost < cost {
                        let prev = cost;
                        let decrease = cost - new_cost;
                        values = candidate;
                        lambda = (lambda * LAMBDA_SHRINK).max(LAMBDA_MIN);

                        let lin = linearize(ir, &values, &layout)?;
                        cost = lin.0;
                        h = lin.1;
                        g = lin.2;

                        if opts.verbosity > 0 {
                            info!(
                                "lm iter {}: cost {:.6e} -> {:.6e}, lambda {:.1e}",
                                iterations, prev, cost, lambda
                            );
                        } else {
                            debug!(
                                "lm iter {}: cost {:.6e} -> {:.6e}, lambda {:.1e}",
                                iterations, prev, cost, lambda
                            );
                        }

                        if cost <= opts.abs_tol
                            || decrease <= opts.abs_tol
                            || decrease <= opts.rel_tol * prev
                        {
                            break 'outer;
                        }
                        break;
                    }

                    lambda *= LAMBDA_GROW;
                    if lambda > opts.lambda_max {
                        debug!(
                            "lm iter {}: no acceptable step at lambda cap, stopping",
                            iterations
                        );
                        break 'outer;
                    }
                }
            }
        }

        let mut params = HashMap::with_capacity(ir.params.len());
        for (block, value) in ir.params.iter().zip(values) {
            params.insert(block.name.clone(), value);
        }
        Ok(Solution {
            params,
            initial_cost,
            final_cost: cost,
            iterations,
        })
    }
}
