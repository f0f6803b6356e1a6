//! Quadrature rules on the reference cell `[0, 1]^D`.
//!
//! The rules themselves come from `matfree-quadrature`. This module wraps them with
//! `nalgebra` points and remembers whether a rule is a tensor product, which enables the
//! sum-factorized evaluation paths.
use matfree_quadrature::tensor::tensor_product;
use matfree_quadrature::univariate::{gauss_unit, try_gauss_lobatto_unit};
use matfree_quadrature::Rule;
use nalgebra::Point;

/// Errors returned by quadrature methods.
pub use matfree_quadrature::Error as QuadratureError;

/// A quadrature rule on `[0, 1]^D`.
#[derive(Debug, Clone, PartialEq)]
pub struct Quadrature<const D: usize> {
    weights: Vec<f64>,
    points: Vec<Point<f64, D>>,
    // Set if the rule is the D-fold tensor product of this 1D rule
    tensor_factor: Option<Rule<1>>,
}

impl<const D: usize> Quadrature<D> {
    /// A rule given by arbitrary weights and points.
    pub fn from_weights_and_points(weights: Vec<f64>, points: Vec<Point<f64, D>>) -> Self {
        assert_eq!(weights.len(), points.len(), "weights and points must have the same length");
        Self {
            weights,
            points,
            tensor_factor: None,
        }
    }

    /// The D-fold tensor product of a 1D rule on `[0, 1]`.
    ///
    /// The 1D points must be sorted in ascending order.
    pub fn tensor(rule_1d: Rule<1>) -> Self {
        let (weights, points) = tensor_product::<D>(&rule_1d);
        Self {
            weights,
            points: points.into_iter().map(Point::from).collect(),
            tensor_factor: Some(rule_1d),
        }
    }

    /// Tensor-product Gauss rule with `n` points per direction.
    pub fn gauss(n: usize) -> Self {
        Self::tensor(gauss_unit(n))
    }

    /// Tensor-product Gauss–Lobatto rule with `n` points per direction.
    pub fn gauss_lobatto(n: usize) -> Result<Self, QuadratureError> {
        try_gauss_lobatto_unit(n)
            .map(Self::tensor)
            .ok_or(QuadratureError::NoRuleAvailable)
    }

    pub fn weights(&self) -> &[f64] {
        &self.weights
    }

    pub fn points(&self) -> &[Point<f64, D>] {
        &self.points
    }

    pub fn len(&self) -> usize {
        self.weights.len()
    }

    pub fn is_empty(&self) -> bool {
        self.weights.is_empty()
    }

    /// The 1D factor of the rule, if the rule is a tensor product.
    pub fn tensor_factor(&self) -> Option<&Rule<1>> {
        self.tensor_factor.as_ref()
    }

    /// Approximates the integral of the given function using this quadrature rule.
    pub fn integrate<F>(&self, f: F) -> f64
    where
        F: Fn(&Point<f64, D>) -> f64,
    {
        self.weights
            .iter()
            .zip(&self.points)
            .map(|(w, p)| w * f(p))
            .sum()
    }
}
