//! Limited-memory quasi-Newton buffers.
//!
//! Two flavors: a generic ring-buffer L-BFGS over caller-supplied secant
//! pairs, and a projection-aware variant whose secant directions are
//! differences of projected gradient displacements. The generic one must be
//! flushed whenever the step size γ changes; the specialized one rebuilds
//! its pairs at the new γ instead.

use crate::bounds::{clipped_step, Rect};
use nalgebra::DVector;

// ---------------------------------------------------------------------------
// generic L-BFGS
// ---------------------------------------------------------------------------

/// Ring buffer of secant pairs (s, d) with cached ρ = 1/sᵀd, applied through
/// the standard two-loop recursion.
pub struct Lbfgs {
    mem: usize,
    /// Next insertion slot; the newest pair sits at `head + mem − 1 (mod mem)`.
    head: usize,
    len: usize,
    s: Vec<DVector<f64>>,
    d: Vec<DVector<f64>>,
    rho: Vec<f64>,
    alpha: Vec<f64>,
}

impl Lbfgs {
    pub fn new(n: usize, mem: usize) -> Self {
        assert!(mem >= 1, "Lbfgs: history depth must be positive");
        Self {
            mem,
            head: 0,
            len: 0,
            s: (0..mem).map(|_| DVector::zeros(n)).collect(),
            d: (0..mem).map(|_| DVector::zeros(n)).collect(),
            rho: vec![0.0; mem],
            alpha: vec![0.0; mem],
        }
    }

    /// Number of retained pairs.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Ring slot of the `j`-th pair counting back from the newest (j = 0).
    #[inline]
    fn slot(&self, j: usize) -> usize {
        (self.head + self.mem - 1 - j) % self.mem
    }

    /// Inserts the pair (s, d), evicting the oldest when full.
    ///
    /// Returns `false` (and stores nothing) when the curvature condition
    /// sᵀd > 0 fails or either vector is non-finite. The scalar tests run
    /// before any copy, so a rejection costs no vector traffic.
    pub fn update(&mut self, s: &DVector<f64>, d: &DVector<f64>) -> bool {
        let sd = s.dot(d);
        if !sd.is_finite() || sd <= 0.0 {
            return false;
        }
        if s.iter().any(|v| !v.is_finite()) || d.iter().any(|v| !v.is_finite()) {
            return false;
        }
        let i = self.head;
        self.s[i].copy_from(s);
        self.d[i].copy_from(d);
        self.rho[i] = 1.0 / sd;
        self.head = (self.head + 1) % self.mem;
        self.len = (self.len + 1).min(self.mem);
        true
    }

    /// Applies the inverse Hessian estimate to `q` in place.
    ///
    /// The initial estimate is H₀ = (sᵀd / dᵀd)·I from the newest pair;
    /// with an empty buffer `q` is left untouched.
    pub fn apply(&mut self, q: &mut DVector<f64>) {
        if self.len == 0 {
            return;
        }
        // first loop, newest pair first: αᵢ = ρᵢ sᵢᵀq, q ← q − αᵢ dᵢ
        for j in 0..self.len {
            let i = self.slot(j);
            let a = self.rho[i] * self.s[i].dot(q);
            self.alpha[i] = a;
            q.axpy(-a, &self.d[i], 1.0);
        }
        // q ← H₀ q, H₀ = (sᵀd / dᵀd)·I from the newest pair
        let newest = self.slot(0);
        let dd = self.d[newest].dot(&self.d[newest]);
        *q *= 1.0 / (self.rho[newest] * dd);
        // second loop, oldest pair first: β = ρᵢ dᵢᵀq, q ← q + (αᵢ − β) sᵢ
        for j in (0..self.len).rev() {
            let i = self.slot(j);
            let beta = self.rho[i] * self.d[i].dot(q);
            q.axpy(self.alpha[i] - beta, &self.s[i], 1.0);
        }
    }

    /// Empties the buffer; the next `apply` is the identity.
    pub fn reset(&mut self) {
        self.head = 0;
        self.len = 0;
    }
}

// ---------------------------------------------------------------------------
// projection-aware L-BFGS
// ---------------------------------------------------------------------------

/// L-BFGS variant whose secant directions are differences of projected
/// gradient displacements, d = p(xₖ) − p(xₖ₊₁) with
/// p(x) = clip(−γ∇ψ(x), C.lower − x, C.upper − x).
///
/// Each retained pair keeps its endpoints' x and ∇ψ so the displacements
/// can be rebuilt when γ changes; a γ change therefore never forces a
/// reset. `initialize` must run before the first `update`.
pub struct SpecializedLbfgs {
    mem: usize,
    head: usize,
    len: usize,
    gamma: f64,
    initialized: bool,
    // last point seen by update (or initialize)
    x_prev: DVector<f64>,
    g_prev: DVector<f64>,
    p_prev: DVector<f64>,
    // per-pair storage: base point, gradients at both endpoints, s, d, ρ
    x: Vec<DVector<f64>>,
    g: Vec<DVector<f64>>,
    g_next: Vec<DVector<f64>>,
    s: Vec<DVector<f64>>,
    d: Vec<DVector<f64>>,
    rho: Vec<f64>,
    alpha: Vec<f64>,
    work: DVector<f64>,
}

impl SpecializedLbfgs {
    pub fn new(n: usize, mem: usize) -> Self {
        assert!(mem >= 1, "SpecializedLbfgs: history depth must be positive");
        Self {
            mem,
            head: 0,
            len: 0,
            gamma: 0.0,
            initialized: false,
            x_prev: DVector::zeros(n),
            g_prev: DVector::zeros(n),
            p_prev: DVector::zeros(n),
            x: (0..mem).map(|_| DVector::zeros(n)).collect(),
            g: (0..mem).map(|_| DVector::zeros(n)).collect(),
            g_next: (0..mem).map(|_| DVector::zeros(n)).collect(),
            s: (0..mem).map(|_| DVector::zeros(n)).collect(),
            d: (0..mem).map(|_| DVector::zeros(n)).collect(),
            rho: vec![0.0; mem],
            alpha: vec![0.0; mem],
            work: DVector::zeros(n),
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[inline]
    fn slot(&self, j: usize) -> usize {
        (self.head + self.mem - 1 - j) % self.mem
    }

    /// Seeds the memory with the starting point; `x_hat` is the projected
    /// gradient point at `x` for the given γ.
    pub fn initialize(
        &mut self,
        x: &DVector<f64>,
        grad: &DVector<f64>,
        x_hat: &DVector<f64>,
        gamma: f64,
    ) {
        self.head = 0;
        self.len = 0;
        self.gamma = gamma;
        self.x_prev.copy_from(x);
        self.g_prev.copy_from(grad);
        for c in 0..x.len() {
            self.p_prev[c] = x_hat[c] - x[c];
        }
        self.initialized = true;
    }

    /// Rebuilds the stored displacements at a new γ, dropping the pairs
    /// whose curvature no longer holds together with everything older.
    fn refresh(&mut self, rect: &Rect, gamma: f64) {
        let n = self.x_prev.len();
        self.gamma = gamma;
        clipped_step(gamma, &self.x_prev, &self.g_prev, rect, &mut self.work);
        self.p_prev.copy_from(&self.work);
        for j in 0..self.len {
            let i = self.slot(j);
            clipped_step(gamma, &self.x[i], &self.g[i], rect, &mut self.work);
            for c in 0..n {
                let x_succ = self.x[i][c] + self.s[i][c];
                let p_succ = (-gamma * self.g_next[i][c])
                    .clamp(rect.lower[c] - x_succ, rect.upper[c] - x_succ);
                self.d[i][c] = self.work[c] - p_succ;
            }
            let sd = self.s[i].dot(&self.d[i]);
            if !sd.is_finite() || sd <= 0.0 {
                // curvature broke at this link; older history is stale too
                self.len = j;
                break;
            }
            self.rho[i] = 1.0 / sd;
        }
    }

    /// Inserts the secant pair from the last point to `x_next`; the last
    /// point advances to `x_next` whether or not the pair was accepted.
    pub fn update(
        &mut self,
        x_next: &DVector<f64>,
        grad_next: &DVector<f64>,
        x_hat_next: &DVector<f64>,
        rect: &Rect,
        gamma_next: f64,
    ) -> bool {
        assert!(
            self.initialized,
            "SpecializedLbfgs: initialize must precede update"
        );
        let n = x_next.len();
        // γ only ever changes by exact halvings, so bitwise comparison holds
        if gamma_next != self.gamma {
            self.refresh(rect, gamma_next);
        }
        // candidate pair: s = xₖ₊₁ − xₖ, d = pₖ − pₖ₊₁
        let mut sd = 0.0;
        let mut finite = true;
        for c in 0..n {
            let s_c = x_next[c] - self.x_prev[c];
            let d_c = self.p_prev[c] - (x_hat_next[c] - x_next[c]);
            finite &= s_c.is_finite() && d_c.is_finite();
            sd += s_c * d_c;
        }
        let accepted = finite && sd.is_finite() && sd > 0.0;
        if accepted {
            let i = self.head;
            for c in 0..n {
                self.s[i][c] = x_next[c] - self.x_prev[c];
                self.d[i][c] = self.p_prev[c] - (x_hat_next[c] - x_next[c]);
            }
            self.x[i].copy_from(&self.x_prev);
            self.g[i].copy_from(&self.g_prev);
            self.g_next[i].copy_from(grad_next);
            self.rho[i] = 1.0 / sd;
            self.head = (self.head + 1) % self.mem;
            self.len = (self.len + 1).min(self.mem);
        }
        self.x_prev.copy_from(x_next);
        self.g_prev.copy_from(grad_next);
        for c in 0..n {
            self.p_prev[c] = x_hat_next[c] - x_next[c];
        }
        accepted
    }

    /// Two-loop recursion, same recursion and H₀ scaling as [`Lbfgs::apply`].
    pub fn apply(&mut self, q: &mut DVector<f64>) {
        if self.len == 0 {
            return;
        }
        for j in 0..self.len {
            let i = self.slot(j);
            let a = self.rho[i] * self.s[i].dot(q);
            self.alpha[i] = a;
            q.axpy(-a, &self.d[i], 1.0);
        }
        let newest = self.slot(0);
        let dd = self.d[newest].dot(&self.d[newest]);
        *q *= 1.0 / (self.rho[newest] * dd);
        for j in (0..self.len).rev() {
            let i = self.slot(j);
            let beta = self.rho[i] * self.d[i].dot(q);
            q.axpy(self.alpha[i] - beta, &self.s[i], 1.0);
        }
    }

    /// Drops the retained pairs; the last point survives so updates can
    /// continue without re-initialization.
    pub fn reset(&mut self) {
        self.head = 0;
        self.len = 0;
    }
}

// ---------------------------------------------------------------------------
// variant dispatch
// ---------------------------------------------------------------------------

/// The solver's quasi-Newton memory, one of the two flavors above.
pub enum LbfgsVariant {
    Generic(Lbfgs),
    Specialized(SpecializedLbfgs),
}

impl LbfgsVariant {
    pub fn apply(&mut self, q: &mut DVector<f64>) {
        match self {
            LbfgsVariant::Generic(l) => l.apply(q),
            LbfgsVariant::Specialized(l) => l.apply(q),
        }
    }

    pub fn reset(&mut self) {
        match self {
            LbfgsVariant::Generic(l) => l.reset(),
            LbfgsVariant::Specialized(l) => l.reset(),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use nalgebra::DVector;

    const TOL: f64 = 1e-12;

    fn approx_eq(a: f64, b: f64) -> bool {
        (a - b).abs() <= TOL
    }

    #[test]
    fn empty_apply_is_identity() {
        let mut lbfgs = Lbfgs::new(3, 5);
        let mut q = DVector::from_vec(vec![1.0, -2.0, 3.0]);
        let before = q.clone();
        lbfgs.apply(&mut q);
        assert_eq!(q, before);
    }

    #[test]
    fn nonpositive_curvature_is_rejected() {
        let mut lbfgs = Lbfgs::new(2, 5);
        let s = DVector::from_vec(vec![1.0, 0.0]);
        let d = DVector::from_vec(vec![-1.0, 0.0]);
        assert!(!lbfgs.update(&s, &d));
        assert!(lbfgs.is_empty());
        // and the buffer still acts as the identity
        let mut q = DVector::from_vec(vec![2.0, 5.0]);
        let before = q.clone();
        lbfgs.apply(&mut q);
        assert_eq!(q, before);
    }

    #[test]
    fn non_finite_pairs_are_rejected() {
        let mut lbfgs = Lbfgs::new(2, 5);
        let s = DVector::from_vec(vec![f64::NAN, 1.0]);
        let d = DVector::from_vec(vec![1.0, 1.0]);
        assert!(!lbfgs.update(&s, &d));
        let s = DVector::from_vec(vec![1.0, 1.0]);
        let d = DVector::from_vec(vec![1.0, f64::INFINITY]);
        assert!(!lbfgs.update(&s, &d));
        assert!(lbfgs.is_empty());
    }

    #[test]
    fn two_pairs_recover_a_diagonal_inverse_hessian() {
        // pairs from f(x) = ½(x₀² + 2x₁²): s along each axis, d = ∇²f·s
        let mut lbfgs = Lbfgs::new(2, 5);
        assert!(lbfgs.update(
            &DVector::from_vec(vec![1.0, 0.0]),
            &DVector::from_vec(vec![1.0, 0.0]),
        ));
        assert!(lbfgs.update(
            &DVector::from_vec(vec![0.0, 1.0]),
            &DVector::from_vec(vec![0.0, 2.0]),
        ));
        let mut q = DVector::from_vec(vec![1.0, 1.0]);
        lbfgs.apply(&mut q);
        // H ≈ diag(1, ½) on this history
        assert!(approx_eq(q[0], 1.0), "q₀ = {}", q[0]);
        assert!(approx_eq(q[1], 0.5), "q₁ = {}", q[1]);
    }

    #[test]
    fn buffer_evicts_oldest_beyond_depth() {
        let mut lbfgs = Lbfgs::new(1, 2);
        for k in 1..=4 {
            let s = DVector::from_vec(vec![k as f64]);
            assert!(lbfgs.update(&s, &s));
            assert!(lbfgs.len() <= 2);
        }
        assert_eq!(lbfgs.len(), 2);
    }

    #[test]
    fn reset_restores_identity() {
        let mut lbfgs = Lbfgs::new(2, 3);
        let s = DVector::from_vec(vec![1.0, 1.0]);
        assert!(lbfgs.update(&s, &s));
        lbfgs.reset();
        let mut q = DVector::from_vec(vec![3.0, -1.0]);
        let before = q.clone();
        lbfgs.apply(&mut q);
        assert_eq!(q, before);
    }

    // ---- specialized variant -------------------------------------------

    /// One-dimensional quadratic ψ(x) = ½x² on an unbounded box: the
    /// displacement is p(x) = −γx, so all quantities are by hand.
    #[test]
    fn specialized_accumulates_prox_secants() {
        let rect = Rect::unbounded(1);
        let mut lbfgs = SpecializedLbfgs::new(1, 4);
        let gamma = 0.1;

        let x0 = DVector::from_vec(vec![1.0]);
        let g0 = x0.clone();
        let xh0 = DVector::from_vec(vec![0.9]);
        lbfgs.initialize(&x0, &g0, &xh0, gamma);

        let x1 = DVector::from_vec(vec![0.9]);
        let g1 = x1.clone();
        let xh1 = DVector::from_vec(vec![0.81]);
        assert!(lbfgs.update(&x1, &g1, &xh1, &rect, gamma));
        assert_eq!(lbfgs.len(), 1);

        // s = −0.1, d = −0.1 − (−0.09) = −0.01, so the two-loop maps
        // q = 1 to (sᵀd/dᵀd)-scaled result 10 = γ⁻¹ for this quadratic
        let mut q = DVector::from_vec(vec![1.0]);
        lbfgs.apply(&mut q);
        assert!(approx_eq(q[0], 10.0), "q = {}", q[0]);
    }

    #[test]
    fn specialized_survives_step_size_change() {
        let rect = Rect::unbounded(1);
        let mut lbfgs = SpecializedLbfgs::new(1, 4);

        let x0 = DVector::from_vec(vec![1.0]);
        let g0 = x0.clone();
        let xh0 = DVector::from_vec(vec![0.9]);
        lbfgs.initialize(&x0, &g0, &xh0, 0.1);

        let x1 = DVector::from_vec(vec![0.9]);
        let g1 = x1.clone();
        let xh1 = DVector::from_vec(vec![0.81]);
        assert!(lbfgs.update(&x1, &g1, &xh1, &rect, 0.1));

        // halve γ: the stored pair is rebuilt, not discarded
        let gamma = 0.05;
        let x2 = DVector::from_vec(vec![0.81]);
        let g2 = x2.clone();
        let xh2 = DVector::from_vec(vec![0.81 * 0.95]);
        assert!(lbfgs.update(&x2, &g2, &xh2, &rect, gamma));
        assert_eq!(lbfgs.len(), 2);

        // the rebuilt memory still maps q onto γ⁻¹q for this quadratic
        let mut q = DVector::from_vec(vec![1.0]);
        lbfgs.apply(&mut q);
        assert!((q[0] - 1.0 / gamma).abs() <= 1e-9, "q = {}", q[0]);
    }

    #[test]
    fn specialized_reset_keeps_last_point() {
        let rect = Rect::unbounded(1);
        let mut lbfgs = SpecializedLbfgs::new(1, 4);
        let x0 = DVector::from_vec(vec![1.0]);
        lbfgs.initialize(&x0, &x0, &DVector::from_vec(vec![0.9]), 0.1);
        let x1 = DVector::from_vec(vec![0.9]);
        assert!(lbfgs.update(&x1, &x1, &DVector::from_vec(vec![0.81]), &rect, 0.1));

        lbfgs.reset();
        assert!(lbfgs.is_empty());
        let mut q = DVector::from_vec(vec![1.0]);
        lbfgs.apply(&mut q);
        assert_eq!(q[0], 1.0);

        // updates keep working against the surviving last point
        let x2 = DVector::from_vec(vec![0.81]);
        assert!(lbfgs.update(&x2, &x2, &DVector::from_vec(vec![0.729]), &rect, 0.1));
        assert_eq!(lbfgs.len(), 1);
    }

    #[test]
    #[should_panic]
    fn specialized_update_requires_initialize() {
        let rect = Rect::unbounded(1);
        let mut lbfgs = SpecializedLbfgs::new(1, 2);
        let x = DVector::from_vec(vec![1.0]);
        lbfgs.update(&x, &x, &x, &rect, 0.1);
    }
}
