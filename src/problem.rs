//! Problem facade consumed by the solver.

use crate::bounds::Rect;
use nalgebra::DVector;

/// Smooth problem data for one PANOC call.
///
/// The solver minimizes ψ(x) = f(x) + ½·dist²_Σ(g(x) + Σ⁻¹y, D) over the
/// box `C`. Implementations must be deterministic in their inputs, must not
/// panic on finite arguments, and must only write the documented `out`
/// parameters. Every call is expected to be allocation-free.
pub trait Problem {
    /// Number of decision variables.
    fn n(&self) -> usize;

    /// Number of constraint values returned by `g`.
    fn m(&self) -> usize;

    /// Bound box on the decision variable, dimension `n`.
    fn c(&self) -> &Rect;

    /// Bound box on the constraint values, dimension `m`.
    fn d(&self) -> &Rect;

    /// Cost f(x).
    fn f(&self, x: &DVector<f64>) -> f64;

    /// Writes ∇f(x) into `grad` (length `n`).
    fn grad_f(&self, x: &DVector<f64>, grad: &mut DVector<f64>);

    /// Writes g(x) into `out` (length `m`).
    fn g(&self, x: &DVector<f64>, out: &mut DVector<f64>);

    /// Writes the adjoint product ∇g(x)·v into `out` (length `n`),
    /// with `v` of length `m`.
    fn grad_g_prod(&self, x: &DVector<f64>, v: &DVector<f64>, out: &mut DVector<f64>);
}
