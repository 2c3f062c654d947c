//! Rectangular bound sets and their projections.

use nalgebra::DVector;

/// Rectangular set `{ v : lower ≤ v ≤ upper }` with componentwise bounds.
///
/// Bounds may be infinite; `Rect::unbounded` gives the whole space.
pub struct Rect {
    pub lower: DVector<f64>,
    pub upper: DVector<f64>,
}

impl Rect {
    pub fn new(lower: DVector<f64>, upper: DVector<f64>) -> Self {
        assert_eq!(
            lower.len(),
            upper.len(),
            "Rect: lower and upper must have the same length"
        );
        for i in 0..lower.len() {
            assert!(
                lower[i] <= upper[i],
                "Rect: lower exceeds upper at component {i}: {} > {}",
                lower[i],
                upper[i]
            );
        }
        Self { lower, upper }
    }

    /// The whole space: `[-∞, +∞]ⁿ`.
    pub fn unbounded(n: usize) -> Self {
        Self {
            lower: DVector::from_element(n, f64::NEG_INFINITY),
            upper: DVector::from_element(n, f64::INFINITY),
        }
    }

    pub fn len(&self) -> usize {
        self.lower.len()
    }

    /// Clamp a single component into `[lower[i], upper[i]]`.
    #[inline]
    pub fn clamp_component(&self, i: usize, t: f64) -> f64 {
        t.clamp(self.lower[i], self.upper[i])
    }

    /// Π(v) = min(max(v, lower), upper), componentwise.
    pub fn project(&self, v: &DVector<f64>) -> DVector<f64> {
        assert_eq!(v.len(), self.len(), "Rect::project: dimension mismatch");
        DVector::from_fn(v.len(), |i, _| self.clamp_component(i, v[i]))
    }

    /// v − Π(v): the residual of `v` from the set.
    pub fn projecting_difference(&self, v: &DVector<f64>) -> DVector<f64> {
        assert_eq!(
            v.len(),
            self.len(),
            "Rect::projecting_difference: dimension mismatch"
        );
        DVector::from_fn(v.len(), |i, _| v[i] - self.clamp_component(i, v[i]))
    }
}

/// step = clip(−γ·grad, lower − x, upper − x), componentwise.
///
/// This is the displacement form of the projected gradient step: the clip
/// runs against the distances to the bounds, so `x + step` lands inside the
/// box without the cancellation of `Π(x − γ·grad) − x` when `x` is large
/// and the step small.
pub(crate) fn clipped_step(
    gamma: f64,
    x: &DVector<f64>,
    grad: &DVector<f64>,
    rect: &Rect,
    step: &mut DVector<f64>,
) {
    let n = x.len();
    assert_eq!(grad.len(), n, "clipped_step: dimension mismatch");
    assert_eq!(rect.len(), n, "clipped_step: dimension mismatch");
    assert_eq!(step.len(), n, "clipped_step: dimension mismatch");
    for i in 0..n {
        step[i] = (-gamma * grad[i]).clamp(rect.lower[i] - x[i], rect.upper[i] - x[i]);
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use nalgebra::DVector;

    #[test]
    fn projection_is_idempotent() {
        let rect = Rect::new(
            DVector::from_vec(vec![-1.0, 0.0, 2.0]),
            DVector::from_vec(vec![1.0, 0.0, 5.0]),
        );
        let v = DVector::from_vec(vec![-3.0, 7.5, 3.0]);
        let once = rect.project(&v);
        let twice = rect.project(&once);
        assert_eq!(once, twice);
        assert_eq!(once, DVector::from_vec(vec![-1.0, 0.0, 3.0]));
    }

    #[test]
    fn projection_plus_difference_recovers_input() {
        let rect = Rect::new(
            DVector::from_vec(vec![-1.0, -1.0]),
            DVector::from_vec(vec![1.0, 1.0]),
        );
        let v = DVector::from_vec(vec![4.0, -0.25]);
        let sum = rect.project(&v) + rect.projecting_difference(&v);
        assert_eq!(sum, v);
    }

    #[test]
    fn unbounded_projection_is_identity() {
        let rect = Rect::unbounded(3);
        let v = DVector::from_vec(vec![-1e30, 0.0, 42.0]);
        assert_eq!(rect.project(&v), v);
        assert_eq!(
            rect.projecting_difference(&v),
            DVector::from_vec(vec![0.0; 3])
        );
    }

    #[test]
    #[should_panic]
    fn reversed_bounds_are_rejected() {
        Rect::new(
            DVector::from_vec(vec![1.0, 0.0]),
            DVector::from_vec(vec![0.0, 1.0]),
        );
    }

    #[test]
    fn clipped_step_respects_distances_to_bounds() {
        let rect = Rect::new(
            DVector::from_vec(vec![-1.0, -1.0]),
            DVector::from_vec(vec![1.0, 1.0]),
        );
        let x = DVector::from_vec(vec![0.9, -0.9]);
        let grad = DVector::from_vec(vec![-10.0, 10.0]);
        let mut step = DVector::zeros(2);
        clipped_step(1.0, &x, &grad, &rect, &mut step);
        // the raw step (10, -10) is clipped to the remaining room in the box
        assert_eq!(step[0], 1.0 - 0.9);
        assert_eq!(step[1], -1.0 - (-0.9));
    }
}
