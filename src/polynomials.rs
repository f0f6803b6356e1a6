//! One-dimensional Lagrange bases and tensor-product numberings.
//!
//! The polynomial mappings and the matrix-free evaluators are built on tensor products of
//! one-dimensional Lagrange polynomials. The nodes are placed at the Gauss–Lobatto points of
//! the unit interval, which keeps the interpolation well-conditioned for higher degrees.
use matfree_quadrature::univariate::try_gauss_lobatto_unit;

/// The highest derivative order supported by [`LagrangeBasis1d::evaluate_all`].
pub const MAX_DERIVATIVE_ORDER: usize = 4;

/// A Lagrange interpolation basis defined on a set of distinct nodes in one dimension.
#[derive(Debug, Clone, PartialEq)]
pub struct LagrangeBasis1d {
    nodes: Vec<f64>,
    // Product of (x_i - x_j) over j != i for each node i
    denominators: Vec<f64>,
}

impl LagrangeBasis1d {
    /// Constructs the basis associated with the given nodes.
    ///
    /// # Panics
    ///
    /// Panics if the node set is empty or contains duplicate nodes.
    pub fn from_nodes(nodes: Vec<f64>) -> Self {
        assert!(!nodes.is_empty(), "Lagrange basis needs at least one node");
        let denominators: Vec<f64> = nodes
            .iter()
            .enumerate()
            .map(|(i, x_i)| {
                nodes
                    .iter()
                    .enumerate()
                    .filter(|(j, _)| *j != i)
                    .map(|(_, x_j)| x_i - x_j)
                    .product()
            })
            .collect();
        assert!(
            denominators.iter().all(|d| *d != 0.0),
            "Lagrange nodes must be distinct"
        );
        Self { nodes, denominators }
    }

    /// The Lagrange basis of the given degree with nodes at the Gauss–Lobatto points of `[0, 1]`.
    ///
    /// Degree zero gives the constant basis with its node at the midpoint.
    pub fn gauss_lobatto(degree: usize) -> Self {
        match try_gauss_lobatto_unit(degree + 1) {
            Some((_, points)) => Self::from_nodes(points.into_iter().map(|[x]| x).collect()),
            None => Self::from_nodes(vec![0.5]),
        }
    }

    pub fn degree(&self) -> usize {
        self.nodes.len() - 1
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn nodes(&self) -> &[f64] {
        &self.nodes
    }

    /// Evaluates basis function `i` and its derivatives at `x`.
    ///
    /// `derivatives[k]` receives the `k`-th derivative, for `k` in `0 .. derivatives.len()`.
    pub fn evaluate(&self, i: usize, x: f64, derivatives: &mut [f64]) {
        derivatives.fill(0.0);
        if derivatives.is_empty() {
            return;
        }
        derivatives[0] = 1.0;
        let max_order = derivatives.len() - 1;
        // Multiply in one linear factor (x - x_j) at a time. For the product q = (x - x_j) p,
        // the Leibniz rule gives q^(k) = (x - x_j) p^(k) + k p^(k - 1).
        for (j, x_j) in self.nodes.iter().enumerate() {
            if j == i {
                continue;
            }
            let factor = x - x_j;
            for k in (1..=max_order).rev() {
                derivatives[k] = factor * derivatives[k] + (k as f64) * derivatives[k - 1];
            }
            derivatives[0] *= factor;
        }
        let inv_denominator = 1.0 / self.denominators[i];
        for d in derivatives.iter_mut() {
            *d *= inv_denominator;
        }
    }

    /// Evaluates all basis functions and derivatives up to `max_order` at `x`.
    ///
    /// On return, `out[k * n + i]` holds the `k`-th derivative of basis function `i`, where `n`
    /// is the number of basis functions.
    pub fn evaluate_all(&self, x: f64, max_order: usize, out: &mut Vec<f64>) {
        assert!(max_order <= MAX_DERIVATIVE_ORDER, "derivative order {max_order} not supported");
        let n = self.len();
        out.clear();
        out.resize((max_order + 1) * n, 0.0);
        let mut buffer = [0.0; MAX_DERIVATIVE_ORDER + 1];
        for i in 0..n {
            let derivatives = &mut buffer[..=max_order];
            self.evaluate(i, x, derivatives);
            for (k, value) in derivatives.iter().enumerate() {
                out[k * n + i] = *value;
            }
        }
    }
}

/// Returns, for each point of the `(degree + 1)^dim` lattice in hierarchical order, its
/// lexicographic index.
///
/// The hierarchical order lists vertices first, then the interior points of lines, then
/// those of faces (in 3D) and finally the cell interior. Entities of the same dimension are
/// ordered by the set of coordinate directions that run through their interior (as a
/// bitmask, ascending), then by their position, and the points within an entity are listed
/// lexicographically. Vertices come out in lexicographic bit order.
pub fn hierarchic_to_lexicographic_numbering(dim: usize, degree: usize) -> Vec<usize> {
    assert!(dim >= 1 && dim <= 3, "only dimensions 1, 2 and 3 are supported");
    if degree == 0 {
        return vec![0; 1];
    }
    let n = degree + 1;
    let n_points = n.pow(dim as u32);

    let mut keyed: Vec<(usize, usize, usize, usize, usize)> = (0..n_points)
        .map(|lex| {
            let mut remainder = lex;
            let mut interior_mask = 0;
            let mut end_bits = 0;
            let mut n_interior = 0;
            let mut interior_lex = 0;
            let mut interior_stride = 1;
            for d in 0..dim {
                let t = remainder % n;
                remainder /= n;
                if t == 0 || t == degree {
                    if t == degree {
                        end_bits |= 1 << d;
                    }
                } else {
                    interior_mask |= 1 << d;
                    n_interior += 1;
                    interior_lex += (t - 1) * interior_stride;
                    interior_stride *= degree - 1;
                }
            }
            (n_interior, interior_mask, end_bits, interior_lex, lex)
        })
        .collect();
    keyed.sort_unstable();
    keyed.into_iter().map(|(.., lex)| lex).collect()
}

/// The inverse of [`hierarchic_to_lexicographic_numbering`]: for each lexicographic index,
/// the corresponding hierarchical index.
pub fn lexicographic_to_hierarchic_numbering(dim: usize, degree: usize) -> Vec<usize> {
    invert_permutation(&hierarchic_to_lexicographic_numbering(dim, degree))
}

pub(crate) fn invert_permutation(perm: &[usize]) -> Vec<usize> {
    let mut inverse = vec![usize::MAX; perm.len()];
    for (i, &p) in perm.iter().enumerate() {
        inverse[p] = i;
    }
    debug_assert!(inverse.iter().all(|i| *i != usize::MAX), "not a permutation");
    inverse
}

/// Decomposes a lexicographic index into per-direction indices, first direction fastest.
pub(crate) fn unravel_index<const D: usize>(mut index: usize, n: usize) -> [usize; D] {
    let mut multi_index = [0; D];
    for i in multi_index.iter_mut() {
        *i = index % n;
        index /= n;
    }
    multi_index
}
