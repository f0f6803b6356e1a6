//! Quadrature rules for tensor-product reference cells.
//!
//! The main purpose of this crate is to support the `matfree` library, which needs 1D rules
//! both for integration and for placing the support points of polynomial mappings. The rules
//! are stored as plain arrays so that they may be used independently of `matfree`.
//!
//! Rules in [`univariate`] are defined on `[-1, 1]`. Use [`univariate::map_to_unit_interval`]
//! to obtain the corresponding rule on `[0, 1]`, which is the reference interval used by
//! `matfree`.

use std::fmt;
use std::fmt::{Display, Formatter};

pub mod tensor;
pub mod univariate;

/// Library-wide error type.
#[derive(Debug, Clone, PartialEq)]
#[non_exhaustive]
pub enum Error {
    /// Indicates that a rule satisfying the given requirements is not available.
    NoRuleAvailable,
}

impl Display for Error {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoRuleAvailable => {
                write!(
                    f,
                    "There is no quadrature rule satisfying the requirements available"
                )
            }
        }
    }
}

impl std::error::Error for Error {}

/// A D-dimensional point.
pub type Point<const D: usize> = [f64; D];

/// A D-dimensional rule.
pub type Rule<const D: usize> = (Vec<f64>, Vec<Point<D>>);

/// Approximates the integral of `f` with the given quadrature rule.
pub fn integrate<const D: usize, F>(rule: &Rule<D>, mut f: F) -> f64
where
    F: FnMut(&Point<D>) -> f64,
{
    let (weights, points) = rule;
    assert_eq!(weights.len(), points.len(), "weights and points must have the same length");
    weights
        .iter()
        .zip(points)
        .map(|(w, x)| w * f(x))
        .sum()
}
