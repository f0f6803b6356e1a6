//! Quadrature rules for `[0, 1]^D` formed as tensor products of 1D rules.
//!
//! Points are ordered lexicographically with the first coordinate running fastest, which is
//! the ordering assumed by sum-factorization kernels.

use crate::univariate::gauss_unit;
use crate::{Point, Rule};

/// Forms the `D`-dimensional tensor product of a 1D rule.
pub fn tensor_product<const D: usize>(rule_1d: &Rule<1>) -> Rule<D> {
    let (weights_1d, points_1d) = rule_1d;
    let n = weights_1d.len();
    let total = n.pow(D as u32);
    let mut weights = Vec::with_capacity(total);
    let mut points = Vec::with_capacity(total);

    for linear_index in 0..total {
        let mut remainder = linear_index;
        let mut weight = 1.0;
        let mut point: Point<D> = [0.0; D];
        for d in 0..D {
            let i = remainder % n;
            remainder /= n;
            weight *= weights_1d[i];
            point[d] = points_1d[i][0];
        }
        weights.push(weight);
        points.push(point);
    }

    (weights, points)
}

/// A Gauss rule on the unit hypercube `[0, 1]^D` with the given number of points per dimension.
pub fn hypercube_gauss<const D: usize>(num_points_per_dim: usize) -> Rule<D> {
    tensor_product(&gauss_unit(num_points_per_dim))
}
