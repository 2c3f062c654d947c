//! Augmented-Lagrangian merit function kernels.
//!
//! ψ(x) = f(x) + ½·dist²_Σ(g(x) + Σ⁻¹y, D) and its gradient
//! ∇ψ(x) = ∇f(x) + ∇g(x)·ŷ(x), with ŷ = Σ·(ζ − Π(ζ, D)) and
//! ζ = g(x) + Σ⁻¹y. All kernels take caller-provided scratch so the
//! solver's main loop stays allocation-free.

use crate::problem::Problem;
use nalgebra::DVector;

/// Computes ψ(x) and writes ŷ(x) into `yhat` (length m).
///
/// The Σ-weighted inner product dᵀŷ accumulates in the same element loop
/// that writes ŷ, so the constraint residual is traversed exactly once.
pub fn calc_psi_yhat(
    problem: &dyn Problem,
    x: &DVector<f64>,
    y: &DVector<f64>,
    sigma: &DVector<f64>,
    yhat: &mut DVector<f64>,
) -> f64 {
    let m = problem.m();
    assert_eq!(yhat.len(), m, "calc_psi_yhat: dimension mismatch");
    // g(x)
    problem.g(x, yhat);
    let rect = problem.d();
    let mut d_dot_yhat = 0.0;
    for i in 0..m {
        // ζᵢ = gᵢ(x) + yᵢ/Σᵢ
        let zeta = yhat[i] + y[i] / sigma[i];
        // dᵢ = ζᵢ − Π(ζᵢ, D)
        let d = zeta - rect.clamp_component(i, zeta);
        d_dot_yhat += sigma[i] * d * d;
        yhat[i] = sigma[i] * d;
    }
    // ψ(x) = f(x) + ½ dᵀŷ
    problem.f(x) + 0.5 * d_dot_yhat
}

/// ∇ψ(x) = ∇f(x) + ∇g(x)·ŷ, with ŷ already computed by [`calc_psi_yhat`].
pub fn calc_grad_psi_from_yhat(
    problem: &dyn Problem,
    x: &DVector<f64>,
    yhat: &DVector<f64>,
    grad: &mut DVector<f64>,
    work_n: &mut DVector<f64>,
) {
    problem.grad_f(x, grad);
    problem.grad_g_prod(x, yhat, work_n);
    grad.axpy(1.0, work_n, 1.0);
}

/// Computes ψ(x) and ∇ψ(x) together; ŷ lands in `work_m`.
pub fn calc_psi_grad_psi(
    problem: &dyn Problem,
    x: &DVector<f64>,
    y: &DVector<f64>,
    sigma: &DVector<f64>,
    grad: &mut DVector<f64>,
    work_n: &mut DVector<f64>,
    work_m: &mut DVector<f64>,
) -> f64 {
    let psi = calc_psi_yhat(problem, x, y, sigma, work_m);
    calc_grad_psi_from_yhat(problem, x, work_m, grad, work_n);
    psi
}

/// ∇ψ(x) alone, for call sites that do not need ψ (the Lipschitz probe).
pub fn calc_grad_psi(
    problem: &dyn Problem,
    x: &DVector<f64>,
    y: &DVector<f64>,
    sigma: &DVector<f64>,
    grad: &mut DVector<f64>,
    work_n: &mut DVector<f64>,
    work_m: &mut DVector<f64>,
) {
    let m = problem.m();
    problem.g(x, work_m);
    let rect = problem.d();
    for i in 0..m {
        let zeta = work_m[i] + y[i] / sigma[i];
        // ŷᵢ = Σᵢ·(ζᵢ − Π(ζᵢ, D))
        work_m[i] = sigma[i] * (zeta - rect.clamp_component(i, zeta));
    }
    problem.grad_f(x, grad);
    problem.grad_g_prod(x, work_m, work_n);
    grad.axpy(1.0, work_n, 1.0);
}

/// ẑ = Π(g(x̂) + Σ⁻¹y, D) and err_z = g(x̂) − ẑ, evaluated at termination
/// so the outer loop can update its multipliers.
pub fn calc_zhat(
    problem: &dyn Problem,
    x_hat: &DVector<f64>,
    y: &DVector<f64>,
    sigma: &DVector<f64>,
    z: &mut DVector<f64>,
    err_z: &mut DVector<f64>,
) {
    let m = problem.m();
    assert_eq!(z.len(), m, "calc_zhat: dimension mismatch");
    assert_eq!(err_z.len(), m, "calc_zhat: dimension mismatch");
    // g(x̂)
    problem.g(x_hat, err_z);
    let rect = problem.d();
    for i in 0..m {
        let zeta = err_z[i] + y[i] / sigma[i];
        z[i] = rect.clamp_component(i, zeta);
        err_z[i] -= z[i];
    }
}
