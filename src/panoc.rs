//! The PANOC driver: projected gradient steps accelerated by L-BFGS through
//! a line search on the forward-backward envelope.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use nalgebra::DVector;

use crate::bounds::{clipped_step, Rect};
use crate::lbfgs::{Lbfgs, LbfgsVariant, SpecializedLbfgs};
use crate::merit::{
    calc_grad_psi, calc_grad_psi_from_yhat, calc_psi_grad_psi, calc_psi_yhat, calc_zhat,
};
use crate::panoc_types::{PanocParams, SolverStatus, Stats};
use crate::problem::Problem;

// ---------------------------------------------------------------------------
// projected gradient step and stopping criterion
// ---------------------------------------------------------------------------

/// Projected gradient step in displacement form:
/// p = clip(−γ∇ψ(x), C.lower − x, C.upper − x), x̂ = x + p.
///
/// Returns whether the step made progress, ‖p‖/‖x‖ > machine epsilon;
/// callers that retry with other parameters key off this flag.
fn calc_x_hat(
    rect: &Rect,
    gamma: f64,
    x: &DVector<f64>,
    grad: &DVector<f64>,
    x_hat: &mut DVector<f64>,
    p: &mut DVector<f64>,
) -> bool {
    clipped_step(gamma, x, grad, rect, p);
    for i in 0..x.len() {
        x_hat[i] = x[i] + p[i];
    }
    let norm_quot = (p.norm_squared() / x.norm_squared()).sqrt();
    norm_quot > f64::EPSILON
}

/// εₖ = ‖γ⁻¹pₖ + (∇ψ(x̂ₖ) − ∇ψ(xₖ))‖∞.
///
/// The gradient difference is materialized first and γ⁻¹pₖ added to it;
/// this order keeps significance when the step is tiny.
fn calc_error_stop_crit(
    p: &DVector<f64>,
    gamma: f64,
    grad_hat: &DVector<f64>,
    grad: &DVector<f64>,
    work_n: &mut DVector<f64>,
) -> f64 {
    for i in 0..p.len() {
        work_n[i] = grad_hat[i] - grad[i];
    }
    for i in 0..p.len() {
        work_n[i] += p[i] / gamma;
    }
    work_n.amax()
}

// ---------------------------------------------------------------------------
// solver
// ---------------------------------------------------------------------------

/// PANOC inner solver. One instance may run many solves; each solve owns its
/// working vectors and a fresh L-BFGS memory.
pub struct PanocSolver {
    pub params: PanocParams,
    stop_signal: Arc<AtomicBool>,
}

impl PanocSolver {
    /// The stop signal is shared with the caller, who may raise it from any
    /// thread to interrupt a running solve.
    pub fn new(params: PanocParams, stop_signal: Arc<AtomicBool>) -> Self {
        Self {
            params,
            stop_signal,
        }
    }

    pub fn stop_signal(&self) -> Arc<AtomicBool> {
        self.stop_signal.clone()
    }

    #[allow(clippy::too_many_arguments)]
    fn finish(
        &self,
        status: SolverStatus,
        iterations: usize,
        eps: f64,
        start: Instant,
        lbfgs_failures: usize,
        lbfgs_rejected: usize,
        linesearch_failures: usize,
    ) -> Stats {
        let stats = Stats {
            status,
            iterations,
            eps,
            elapsed: start.elapsed(),
            lbfgs_failures,
            lbfgs_rejected,
            linesearch_failures,
        };
        if self.params.print_interval != 0 {
            eprintln!(
                "[panoc] {:?} after {} iterations: ε = {:.6e}, elapsed {:?}",
                stats.status, stats.iterations, stats.eps, stats.elapsed
            );
        }
        stats
    }

    /// Minimizes ψ over the problem's box C down to tolerance `eps_tol`.
    ///
    /// On entry `x` is the initial guess, `y` the outer multiplier estimate
    /// and `sigma` the diagonal penalty Σ. On return (any terminal status)
    /// `x` holds the final iterate, `y` the candidate multiplier ŷ, and
    /// `z`/`err_z` the projected constraint values and their residual for
    /// the outer loop. When the Lipschitz estimate is already non-finite
    /// the solve aborts before the first iteration and only the returned
    /// [`Stats`] are meaningful.
    #[allow(clippy::too_many_arguments)]
    pub fn solve(
        &self,
        problem: &dyn Problem,
        x: &mut DVector<f64>,
        z: &mut DVector<f64>,
        y: &mut DVector<f64>,
        err_z: &mut DVector<f64>,
        sigma: &DVector<f64>,
        eps_tol: f64,
    ) -> Stats {
        let start = Instant::now();
        let params = &self.params;
        let n = problem.n();
        let m = problem.m();

        assert_eq!(x.len(), n, "solve: x must have length n");
        assert_eq!(z.len(), m, "solve: z must have length m");
        assert_eq!(y.len(), m, "solve: y must have length m");
        assert_eq!(err_z.len(), m, "solve: err_z must have length m");
        assert_eq!(sigma.len(), m, "solve: sigma must have length m");
        assert!(
            params.tau_min > 0.0 && params.tau_min < 1.0,
            "solve: tau_min must lie in (0, 1)"
        );
        assert!(
            params.lipschitz.l_gamma_factor > 0.0 && params.lipschitz.l_gamma_factor < 1.0,
            "solve: l_gamma_factor must lie in (0, 1)"
        );
        assert!(params.lipschitz.delta > 0.0, "solve: delta must be positive");
        assert!(params.lipschitz.eps >= 0.0, "solve: eps must be nonnegative");

        let mut lbfgs_failures = 0usize;
        let mut lbfgs_rejected = 0usize;
        let mut linesearch_failures = 0usize;

        let mut qn = if params.specialized_lbfgs {
            LbfgsVariant::Specialized(SpecializedLbfgs::new(n, params.lbfgs_mem))
        } else {
            LbfgsVariant::Generic(Lbfgs::new(n, params.lbfgs_mem))
        };

        // working vectors, owned for the duration of this call
        let mut x_k = x.clone_owned(); // xₖ
        let mut x_hat_k = DVector::zeros(n); // x̂ₖ = xₖ + pₖ
        let mut x_next = DVector::zeros(n); // xₖ₊₁
        let mut x_hat_next = DVector::zeros(n); // x̂ₖ₊₁
        let mut yhat_k = DVector::zeros(m); // ŷ(x̂ₖ)
        let mut yhat_next = DVector::zeros(m); // ŷ(x̂ₖ₊₁)
        let mut p_k = DVector::zeros(n); // pₖ = x̂ₖ − xₖ
        let mut p_next = DVector::zeros(n); // pₖ₊₁
        let mut q_k = DVector::zeros(n); // quasi-Newton step
        let mut grad_k = DVector::zeros(n); // ∇ψ(xₖ)
        let mut grad_hat_k = DVector::zeros(n); // ∇ψ(x̂ₖ)
        let mut grad_next = DVector::zeros(n); // ∇ψ(xₖ₊₁)
        let mut work_n = DVector::zeros(n);
        let mut work_m = DVector::zeros(m);

        // Estimate the Lipschitz constant of ∇ψ by finite differences:
        // h = max(|x|·ε, δ), L₀ = ‖∇ψ(x + h) − ∇ψ(x)‖ / ‖h‖.
        let mut h = DVector::zeros(n);
        for i in 0..n {
            h[i] = (x_k[i] * params.lipschitz.eps).abs().max(params.lipschitz.delta);
            // the caller's x doubles as the probe point
            x[i] = x_k[i] + h[i];
        }
        calc_grad_psi(problem, x, y, sigma, &mut grad_next, &mut work_n, &mut work_m);
        let mut psi_k =
            calc_psi_grad_psi(problem, &x_k, y, sigma, &mut grad_k, &mut work_n, &mut work_m);

        for i in 0..n {
            work_n[i] = grad_next[i] - grad_k[i];
        }
        let mut l_k = work_n.norm() / h.norm();
        if l_k < f64::EPSILON {
            l_k = f64::EPSILON;
        } else if !l_k.is_finite() {
            return self.finish(
                SolverStatus::NotFinite,
                0,
                f64::INFINITY,
                start,
                lbfgs_failures,
                lbfgs_rejected,
                linesearch_failures,
            );
        }

        let mut gamma_k = params.lipschitz.l_gamma_factor / l_k;
        // σ stays positive while γ·L < 1
        let mut sigma_k = gamma_k * (1.0 - gamma_k * l_k) / 2.0;

        // initial prox step; progress is not checked here
        let _ = calc_x_hat(problem.c(), gamma_k, &x_k, &grad_k, &mut x_hat_k, &mut p_k);
        let mut psi_hat_k = calc_psi_yhat(problem, &x_hat_k, y, sigma, &mut yhat_k);

        let mut grad_k_dot_p_k = grad_k.dot(&p_k);
        let mut norm_sq_p_k = p_k.norm_squared();

        // forward-backward envelope φₖ = ψₖ + ½γ⁻¹‖pₖ‖² + ∇ψₖᵀpₖ
        let mut phi_k = psi_k + norm_sq_p_k / (2.0 * gamma_k) + grad_k_dot_p_k;

        for k in 0..=params.max_iter {
            // ---- Lipschitz backtracking: enforce the quadratic upper bound
            //      ψ(x̂ₖ) ≤ ψ(xₖ) + ∇ψₖᵀpₖ + ½L‖pₖ‖² ----
            if k == 0 || !params.update_lipschitz_in_linesearch {
                while psi_hat_k > psi_k + grad_k_dot_p_k + 0.5 * l_k * norm_sq_p_k {
                    l_k *= 2.0;
                    sigma_k /= 2.0;
                    gamma_k /= 2.0;
                    // the generic memory is tied to γ; flush it on a change
                    if k > 0 {
                        if let LbfgsVariant::Generic(l) = &mut qn {
                            l.reset();
                        }
                    }
                    let _ = calc_x_hat(problem.c(), gamma_k, &x_k, &grad_k, &mut x_hat_k, &mut p_k);
                    grad_k_dot_p_k = grad_k.dot(&p_k);
                    norm_sq_p_k = p_k.norm_squared();
                    psi_hat_k = calc_psi_yhat(problem, &x_hat_k, y, sigma, &mut yhat_k);
                }
            }

            if k == 0 {
                if let LbfgsVariant::Specialized(l) = &mut qn {
                    l.initialize(&x_k, &grad_k, &x_hat_k, gamma_k);
                }
            }

            // ∇ψ(x̂ₖ) from the cached ŷ(x̂ₖ)
            calc_grad_psi_from_yhat(problem, &x_hat_k, &yhat_k, &mut grad_hat_k, &mut work_n);

            let eps_k = calc_error_stop_crit(&p_k, gamma_k, &grad_hat_k, &grad_k, &mut work_n);

            if params.print_interval != 0 && k % params.print_interval == 0 {
                println!(
                    "[panoc] {:>6}: ψ = {:13.6e}, ‖∇ψ‖ = {:13.6e}, ‖p‖ = {:13.6e}, γ = {:13.6e}, ε = {:13.6e}",
                    k,
                    psi_k,
                    grad_k.norm(),
                    norm_sq_p_k.sqrt(),
                    gamma_k,
                    eps_k
                );
            }

            let out_of_time = start.elapsed() > params.max_time;
            if eps_k <= eps_tol || k == params.max_iter || out_of_time {
                calc_zhat(problem, &x_hat_k, y, sigma, z, err_z);
                std::mem::swap(x, &mut x_hat_k);
                std::mem::swap(y, &mut yhat_k);
                let status = if eps_k <= eps_tol {
                    SolverStatus::Converged
                } else if k == params.max_iter {
                    SolverStatus::MaxIter
                } else {
                    SolverStatus::MaxTime
                };
                return self.finish(
                    status,
                    k,
                    eps_k,
                    start,
                    lbfgs_failures,
                    lbfgs_rejected,
                    linesearch_failures,
                );
            } else if !eps_k.is_finite() {
                eprintln!("[panoc] non-finite εₖ at iteration {k}");
                calc_zhat(problem, &x_k, y, sigma, z, err_z);
                std::mem::swap(x, &mut x_k);
                std::mem::swap(y, &mut yhat_k);
                return self.finish(
                    SolverStatus::NotFinite,
                    k,
                    eps_k,
                    start,
                    lbfgs_failures,
                    lbfgs_rejected,
                    linesearch_failures,
                );
            } else if self.stop_signal.load(Ordering::Relaxed) {
                calc_zhat(problem, &x_hat_k, y, sigma, z, err_z);
                std::mem::swap(x, &mut x_hat_k);
                std::mem::swap(y, &mut yhat_k);
                return self.finish(
                    SolverStatus::Interrupted,
                    k,
                    eps_k,
                    start,
                    lbfgs_failures,
                    lbfgs_rejected,
                    linesearch_failures,
                );
            }

            // ---- quasi-Newton step qₖ = Hₖ pₖ ----
            let mut tau = if k == 0 { 0.0 } else { 1.0 };
            if k > 0 {
                q_k.copy_from(&p_k);
                qn.apply(&mut q_k);
                if q_k.iter().any(|v| v.is_nan()) {
                    tau = 0.0;
                    lbfgs_failures += 1;
                    qn.reset();
                }
            }

            // ---- line search on the forward-backward envelope ----
            let sigma_norm_inv_gamma_p = sigma_k * norm_sq_p_k / (gamma_k * gamma_k);
            let mut l_next;
            let mut sigma_next;
            let mut gamma_next;
            let mut psi_next;
            let mut psi_hat_next;
            let mut grad_next_dot_p_next;
            let mut norm_sq_p_next;
            let mut phi_next;

            loop {
                l_next = l_k;
                sigma_next = sigma_k;
                gamma_next = gamma_k;

                if tau / 2.0 < params.tau_min {
                    // line search failed; take the safe prox step
                    std::mem::swap(&mut x_next, &mut x_hat_k);
                } else {
                    // averaged step xₖ₊₁ = xₖ + (1−τ)pₖ + τqₖ
                    for i in 0..n {
                        x_next[i] = x_k[i] + (1.0 - tau) * p_k[i] + tau * q_k[i];
                    }
                }

                psi_next = calc_psi_grad_psi(
                    problem,
                    &x_next,
                    y,
                    sigma,
                    &mut grad_next,
                    &mut work_n,
                    &mut work_m,
                );
                let _ = calc_x_hat(
                    problem.c(),
                    gamma_next,
                    &x_next,
                    &grad_next,
                    &mut x_hat_next,
                    &mut p_next,
                );
                psi_hat_next = calc_psi_yhat(problem, &x_hat_next, y, sigma, &mut yhat_next);

                grad_next_dot_p_next = grad_next.dot(&p_next);
                norm_sq_p_next = p_next.norm_squared();

                if params.update_lipschitz_in_linesearch {
                    while psi_hat_next
                        > psi_next + grad_next_dot_p_next + 0.5 * l_next * norm_sq_p_next
                    {
                        l_next *= 2.0;
                        sigma_next /= 2.0;
                        gamma_next /= 2.0;
                        if let LbfgsVariant::Generic(l) = &mut qn {
                            l.reset();
                        }
                        let _ = calc_x_hat(
                            problem.c(),
                            gamma_next,
                            &x_next,
                            &grad_next,
                            &mut x_hat_next,
                            &mut p_next,
                        );
                        grad_next_dot_p_next = grad_next.dot(&p_next);
                        norm_sq_p_next = p_next.norm_squared();
                        psi_hat_next =
                            calc_psi_yhat(problem, &x_hat_next, y, sigma, &mut yhat_next);
                    }
                }

                phi_next = psi_next + norm_sq_p_next / (2.0 * gamma_next) + grad_next_dot_p_next;

                // τ is halved after each trial
                tau /= 2.0;

                // accept when φₖ₊₁ ≤ φₖ − σₖ‖pₖ‖²/γₖ²
                if !(phi_next > phi_k - sigma_norm_inv_gamma_p && tau >= params.tau_min) {
                    break;
                }
            }

            if tau < params.tau_min && k != 0 {
                linesearch_failures += 1;
            }

            // ---- L-BFGS update ----
            let accepted = match &mut qn {
                LbfgsVariant::Generic(l) => {
                    for i in 0..n {
                        work_n[i] = x_next[i] - x_k[i]; // sₖ
                    }
                    for i in 0..n {
                        q_k[i] = p_k[i] - p_next[i]; // dₖ; qₖ is dead after the search
                    }
                    l.update(&work_n, &q_k)
                }
                LbfgsVariant::Specialized(l) => {
                    l.update(&x_next, &grad_next, &x_hat_next, problem.c(), gamma_next)
                }
            };
            if !accepted {
                lbfgs_rejected += 1;
            }

            // ---- advance: promote k+1 to k, rotating buffers ----
            l_k = l_next;
            sigma_k = sigma_next;
            gamma_k = gamma_next;
            psi_k = psi_next;
            psi_hat_k = psi_hat_next;
            phi_k = phi_next;
            std::mem::swap(&mut x_k, &mut x_next);
            std::mem::swap(&mut x_hat_k, &mut x_hat_next);
            std::mem::swap(&mut yhat_k, &mut yhat_next);
            std::mem::swap(&mut p_k, &mut p_next);
            std::mem::swap(&mut grad_k, &mut grad_next);
            grad_k_dot_p_k = grad_next_dot_p_next;
            norm_sq_p_k = norm_sq_p_next;
        }
        unreachable!("panoc: the loop must return through a terminal status");
    }
}
