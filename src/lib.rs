//! PANOC: a proximal averaged Newton-type method for box-constrained
//! nonconvex problems.
//!
//! The solver minimizes ψ(x) = f(x) + ½·dist²_Σ(g(x) + Σ⁻¹y, D) over a box
//! C, the inner problem of an augmented-Lagrangian outer loop. Each
//! iteration blends a projected gradient step with an L-BFGS step through a
//! line search on the forward-backward envelope, with online Lipschitz
//! estimation. The outer loop (multiplier and penalty updates) is the
//! caller's business; it talks to the solver through the [`Problem`] trait
//! and the `z`/`err_z` outputs of [`PanocSolver::solve`].

pub mod bounds;
pub mod lbfgs;
pub mod merit;
pub mod panoc;
pub mod panoc_types;
pub mod problem;

pub use bounds::Rect;
pub use panoc::PanocSolver;
pub use panoc_types::{LipschitzParams, PanocParams, SolverStatus, Stats};
pub use problem::Problem;
