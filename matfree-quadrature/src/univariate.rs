//! Quadrature rules for the one-dimensional domain `[-1, 1]`.

use crate::Rule;
use std::f64::consts::PI;

/// Upper bound on Newton iterations for locating the roots of Legendre polynomials.
///
/// Convergence is quadratic from the initial guesses used below, so in practice only a
/// handful of iterations are needed.
const MAX_ROOT_ITERATIONS: usize = 100;

/// Recurrence relation for Legendre polynomials.
///
/// Note: we use a formula for which derivatives are *not* defined at |x| == 1, so it is only
/// suitable for evaluation in the open interval (-1, 1).
#[derive(Debug, Default)]
struct LegendreRecurrence {
    n: usize,
    x: f64,
    // The current value, i.e. p_n(x)
    p1: f64,
    // The previous value in the recurrence, i.e. p_{n - 1}(x)
    p2: f64,
}

impl LegendreRecurrence {
    pub fn evaluate(n: usize, x: f64) -> Self {
        // Use recurrence relation
        //  m P_m(x) = (2m - 1) * x P_{m - 1}(x) - (m - 1) P_{m - 2}(x)
        let mut p1 = 1.0;
        let mut p2 = 0.0;
        let mut p3;
        for m in 1..=n {
            let m = m as f64;
            p3 = p2;
            p2 = p1;
            p1 = ((2.0 * m - 1.0) * x * p2 - (m - 1.0) * p3) / m;
        }

        Self { n, x, p1, p2 }
    }

    fn value(&self) -> f64 {
        self.p1
    }

    fn derivative(&self) -> f64 {
        let Self { n, x, p1, p2 } = &self;
        let n = *n as f64;
        // dp_n/dx (x) = n * (x * p_n(x) - p_{n - 1}(x)) / (x^2 - 1)
        n * (x * p1 - p2) / (x * x - 1.0)
    }

    /// Second derivative obtained from Legendre's differential equation
    ///  (1 - x^2) p_n'' - 2 x p_n' + n (n + 1) p_n = 0
    fn second_derivative(&self) -> f64 {
        let n = self.n as f64;
        let x = self.x;
        (2.0 * x * self.derivative() - n * (n + 1.0) * self.value()) / (1.0 - x * x)
    }

    fn value_and_derivative(&self) -> (f64, f64) {
        (self.value(), self.derivative())
    }
}

/// Gauss quadrature for the reference interval [-1, 1].
///
/// Returns the [Gauss quadrature rule] with the given number of points. Given `n` points,
/// the rule integrates polynomials of order up to `2 n - 1` exactly.
///
/// # Panics
///
/// Panics if zero points are requested.
///
/// [Gauss quadrature rule]: https://en.wikipedia.org/wiki/Gaussian_quadrature
pub fn gauss(num_points: usize) -> Rule<1> {
    let n = num_points;
    assert!(n > 0, "number of points must be positive");

    // Loosely based on the procedure used in
    // Numerical Recipes, The art of Scientific Computing, Third Edition (2007)
    let m = (n + 1) / 2;

    let mut points = Vec::with_capacity(n);
    let mut weights = Vec::with_capacity(n);

    // Only find the first m roots. The remaining roots can be found by symmetry
    for i in 0..m {
        let mut x = (PI * (i as f64 + 0.75) / (n as f64 + 0.5)).cos();
        let (_, mut dp) = LegendreRecurrence::evaluate(n, x).value_and_derivative();

        for _ in 0..MAX_ROOT_ITERATIONS {
            let (p, dp_current) = LegendreRecurrence::evaluate(n, x).value_and_derivative();
            let dx = -p / dp_current;
            x += dx;
            dp = LegendreRecurrence::evaluate(n, x).derivative();
            if dx.abs() <= 1e-15 {
                break;
            }
        }

        // Once a root is known, its corresponding weight is given explicitly by a standard
        // formula
        let w = 2.0 / ((1.0 - x * x) * dp * dp);

        points.push([x]);
        weights.push(w);
    }

    // Recover the remaining points and weights by symmetry
    for i in m..n {
        let mirror_idx = n - i - 1;
        points.push([-points[mirror_idx][0]]);
        weights.push(weights[mirror_idx]);
    }

    assert_eq!(points.len(), n, "Internal error: incorrect number of points produced");

    (weights, points)
}

/// Gauss–Lobatto quadrature for the reference interval [-1, 1].
///
/// The rule contains both end points of the interval, and the points are sorted in
/// ascending order. Given `n` points, the rule integrates polynomials of order up to `2n - 3`
/// exactly.
///
/// Returns `None` if fewer than two points are requested.
pub fn try_gauss_lobatto(num_points: usize) -> Option<Rule<1>> {
    let n = num_points;
    if n < 2 {
        return None;
    }

    // The interior points are the roots of P'_{n - 1}
    let degree = n - 1;
    let endpoint_weight = 2.0 / ((n * degree) as f64);
    let mut points = vec![[0.0]; n];
    let mut weights = vec![0.0; n];
    points[0] = [-1.0];
    points[n - 1] = [1.0];
    weights[0] = endpoint_weight;
    weights[n - 1] = endpoint_weight;

    for i in 1..n - 1 {
        let mirror_idx = n - 1 - i;
        if mirror_idx < i {
            break;
        }

        let x = if mirror_idx == i {
            0.0
        } else {
            // Chebyshev–Gauss–Lobatto points are close to the Legendre–Gauss–Lobatto points
            let mut x = -(PI * i as f64 / degree as f64).cos();
            for _ in 0..MAX_ROOT_ITERATIONS {
                let recurrence = LegendreRecurrence::evaluate(degree, x);
                let dx = -recurrence.derivative() / recurrence.second_derivative();
                x += dx;
                if dx.abs() <= 1e-15 {
                    break;
                }
            }
            x
        };

        let p = LegendreRecurrence::evaluate(degree, x).value();
        let w = endpoint_weight / (p * p);
        points[i] = [x];
        weights[i] = w;
        points[mirror_idx] = [-x];
        weights[mirror_idx] = w;
    }

    Some((weights, points))
}

/// Maps a rule on `[-1, 1]` to the unit interval `[0, 1]`.
///
/// The points of the returned rule are sorted in ascending order, which is the order
/// expected by tensor-product evaluation.
pub fn map_to_unit_interval(rule: &Rule<1>) -> Rule<1> {
    let (weights, points) = rule;
    let mut pairs: Vec<_> = weights.iter().zip(points).map(|(w, [x])| (*w, *x)).collect();
    pairs.sort_by(|(_, a), (_, b)| a.total_cmp(b));
    pairs
        .into_iter()
        .map(|(w, x)| (0.5 * w, [0.5 * (x + 1.0)]))
        .unzip()
}

/// Gauss quadrature with `n` points on the unit interval `[0, 1]`, sorted in ascending order.
pub fn gauss_unit(num_points: usize) -> Rule<1> {
    map_to_unit_interval(&gauss(num_points))
}

/// Gauss–Lobatto quadrature with `n` points on the unit interval `[0, 1]`.
pub fn try_gauss_lobatto_unit(num_points: usize) -> Option<Rule<1>> {
    try_gauss_lobatto(num_points).map(|rule| map_to_unit_interval(&rule))
}
