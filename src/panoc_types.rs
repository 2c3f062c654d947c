//! Solver configuration, status, and statistics types.

use std::time::Duration;

/// Parameters of the finite-difference estimate of the initial Lipschitz
/// constant: the probe is h = max(|x|·eps, delta) componentwise, and the
/// first step size is γ₀ = l_gamma_factor / L₀.
#[derive(Debug, Clone)]
pub struct LipschitzParams {
    /// Relative perturbation of the starting point.
    pub eps: f64,
    /// Absolute floor on the perturbation, dominant where x is near zero.
    pub delta: f64,
    /// Fraction of 1/L used as the step size, in (0, 1).
    pub l_gamma_factor: f64,
}

impl Default for LipschitzParams {
    fn default() -> Self {
        Self {
            eps: 1e-6,
            delta: 1e-12,
            l_gamma_factor: 0.95,
        }
    }
}

/// Configuration for one PANOC solve.
#[derive(Debug, Clone)]
pub struct PanocParams {
    /// L-BFGS history depth.
    pub lbfgs_mem: usize,
    /// Iteration cap.
    pub max_iter: usize,
    /// Wall-clock cap.
    pub max_time: Duration,
    /// Smallest line-search parameter τ before falling back to the prox step.
    pub tau_min: f64,
    pub lipschitz: LipschitzParams,
    /// Let L grow inside the line search instead of re-running the outer
    /// backtracking every iteration.
    pub update_lipschitz_in_linesearch: bool,
    /// Use the projection-aware L-BFGS variant.
    pub specialized_lbfgs: bool,
    /// Print a progress row every this many iterations; 0 disables output.
    pub print_interval: usize,
}

impl Default for PanocParams {
    fn default() -> Self {
        Self {
            lbfgs_mem: 10,
            max_iter: 100,
            max_time: Duration::from_secs(60),
            tau_min: 1.0 / 256.0,
            lipschitz: LipschitzParams::default(),
            update_lipschitz_in_linesearch: true,
            specialized_lbfgs: false,
            print_interval: 0,
        }
    }
}

/// Terminal state of a solve.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SolverStatus {
    /// The stopping criterion dropped below the requested tolerance.
    Converged,
    /// Iteration budget exhausted.
    MaxIter,
    /// Wall-clock budget exhausted.
    MaxTime,
    /// A quantity required to pick the next step was NaN or infinite.
    NotFinite,
    /// The caller raised the stop signal.
    Interrupted,
}

/// Outcome of one solve.
#[derive(Debug, Clone)]
pub struct Stats {
    pub status: SolverStatus,
    pub iterations: usize,
    /// Last value of the stopping criterion εₖ.
    pub eps: f64,
    pub elapsed: Duration,
    /// Quasi-Newton steps discarded because they contained NaN.
    pub lbfgs_failures: usize,
    /// Secant pairs rejected by the curvature or finiteness tests.
    pub lbfgs_rejected: usize,
    /// Line searches that fell back to the safe prox step.
    pub linesearch_failures: usize,
}
