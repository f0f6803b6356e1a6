use crate::polynomials::LagrangeBasis1d;
use nalgebra::{Point, SMatrix, SVector};

/// Jacobian derivative of order one: `grads[k][(a, j)] = ∂²x_a / ∂ξ_j ∂ξ_k`.
pub type JacobianGrad<const DIM: usize, const SPACEDIM: usize> = [SMatrix<f64, SPACEDIM, DIM>; DIM];
pub type Jacobian2ndDerivative<const DIM: usize, const SPACEDIM: usize> = [[SMatrix<f64, SPACEDIM, DIM>; DIM]; DIM];
pub type Jacobian3rdDerivative<const DIM: usize, const SPACEDIM: usize> =
    [[[SMatrix<f64, SPACEDIM, DIM>; DIM]; DIM]; DIM];

/// Derivatives of the map at a reference point, up to some order.
#[derive(Debug, Clone, PartialEq)]
pub struct ReferenceDerivatives<const DIM: usize, const SPACEDIM: usize> {
    pub value: Point<f64, SPACEDIM>,
    pub jacobian: SMatrix<f64, SPACEDIM, DIM>,
    pub jacobian_grad: JacobianGrad<DIM, SPACEDIM>,
    pub jacobian_2nd_derivative: Jacobian2ndDerivative<DIM, SPACEDIM>,
    pub jacobian_3rd_derivative: Jacobian3rdDerivative<DIM, SPACEDIM>,
}

impl<const DIM: usize, const SPACEDIM: usize> Default for ReferenceDerivatives<DIM, SPACEDIM> {
    fn default() -> Self {
        let zero = SMatrix::zeros();
        Self {
            value: Point::origin(),
            jacobian: zero,
            jacobian_grad: [zero; DIM],
            jacobian_2nd_derivative: [[zero; DIM]; DIM],
            jacobian_3rd_derivative: [[[zero; DIM]; DIM]; DIM],
        }
    }
}

/// The polynomial map of one cell, given by its support points.
#[derive(Debug, Clone)]
pub struct CellMap<'a, const DIM: usize, const SPACEDIM: usize> {
    basis: &'a LagrangeBasis1d,
    // Support points in lexicographic order
    points: Vec<Point<f64, SPACEDIM>>,
}

impl<'a, const DIM: usize, const SPACEDIM: usize> CellMap<'a, DIM, SPACEDIM> {
    /// Constructs the map from support points in hierarchical order.
    pub fn from_hierarchical(
        basis: &'a LagrangeBasis1d,
        support_points: &[Point<f64, SPACEDIM>],
        hierarchic_to_lex: &[usize],
    ) -> Self {
        assert_eq!(
            support_points.len(),
            hierarchic_to_lex.len(),
            "number of support points does not match the mapping degree"
        );
        let mut points = vec![Point::origin(); support_points.len()];
        for (point, &lex) in support_points.iter().zip(hierarchic_to_lex) {
            points[lex] = *point;
        }
        Self { basis, points }
    }

    pub fn degree(&self) -> usize {
        self.basis.degree()
    }

    /// Support points in lexicographic order.
    pub fn lexicographic_points(&self) -> &[Point<f64, SPACEDIM>] {
        &self.points
    }

    pub fn value(&self, xi: &Point<f64, DIM>) -> Point<f64, SPACEDIM> {
        if self.degree() == 1 {
            let mut x = SVector::zeros();
            for (v, vertex) in self.points.iter().enumerate() {
                x += vertex.coords * multilinear_weight::<DIM>(v, xi, None);
            }
            return Point::from(x);
        }
        let tables = self.basis_tables(xi, 0);
        Point::from(self.contract(&tables, &[0; DIM]))
    }

    pub fn jacobian(&self, xi: &Point<f64, DIM>) -> SMatrix<f64, SPACEDIM, DIM> {
        let mut jacobian = SMatrix::<f64, SPACEDIM, DIM>::zeros();
        if self.degree() == 1 {
            for (v, vertex) in self.points.iter().enumerate() {
                for j in 0..DIM {
                    let w = multilinear_weight::<DIM>(v, xi, Some(j));
                    jacobian.column_mut(j).axpy(w, &vertex.coords, 1.0);
                }
            }
            return jacobian;
        }
        let tables = self.basis_tables(xi, 1);
        for j in 0..DIM {
            let mut orders = [0; DIM];
            orders[j] = 1;
            jacobian.set_column(j, &self.contract(&tables, &orders));
        }
        jacobian
    }

    /// Computes the value and the derivatives up to `max_order` (at most 4) of the map.
    ///
    /// Entries of `out` above `max_order` are left untouched.
    pub fn derivatives(&self, xi: &Point<f64, DIM>, max_order: usize, out: &mut ReferenceDerivatives<DIM, SPACEDIM>) {
        let tables = self.basis_tables(xi, max_order);
        out.value = Point::from(self.contract(&tables, &[0; DIM]));
        if max_order >= 1 {
            for j in 0..DIM {
                out.jacobian
                    .set_column(j, &self.contract(&tables, &orders_of(&[j])));
            }
        }
        if max_order >= 2 {
            for k in 0..DIM {
                for j in 0..DIM {
                    out.jacobian_grad[k].set_column(j, &self.contract(&tables, &orders_of(&[j, k])));
                }
            }
        }
        if max_order >= 3 {
            for l in 0..DIM {
                for k in 0..DIM {
                    for j in 0..DIM {
                        let column = self.contract(&tables, &orders_of(&[j, k, l]));
                        out.jacobian_2nd_derivative[l][k].set_column(j, &column);
                    }
                }
            }
        }
        if max_order >= 4 {
            for m in 0..DIM {
                for l in 0..DIM {
                    for k in 0..DIM {
                        for j in 0..DIM {
                            let column = self.contract(&tables, &orders_of(&[j, k, l, m]));
                            out.jacobian_3rd_derivative[m][l][k].set_column(j, &column);
                        }
                    }
                }
            }
        }
    }

    /// 1D basis values and derivatives at each coordinate of `xi`, laid out as in
    /// [`LagrangeBasis1d::evaluate_all`].
    fn basis_tables(&self, xi: &Point<f64, DIM>, max_order: usize) -> [Vec<f64>; DIM] {
        let mut tables: [Vec<f64>; DIM] = std::array::from_fn(|_| Vec::new());
        for (d, table) in tables.iter_mut().enumerate() {
            self.basis.evaluate_all(xi[d], max_order, table);
        }
        tables
    }

    /// Sums the support points against the tensor product of the 1D tables of the given
    /// derivative orders, one direction at a time.
    fn contract(&self, tables: &[Vec<f64>; DIM], orders: &[usize; DIM]) -> SVector<f64, SPACEDIM> {
        let n = self.basis.len();
        let mut current: Vec<SVector<f64, SPACEDIM>> = self.points.iter().map(|p| p.coords).collect();
        for d in 0..DIM {
            let factors = &tables[d][orders[d] * n..(orders[d] + 1) * n];
            current = current
                .chunks_exact(n)
                .map(|line| {
                    line.iter()
                        .zip(factors)
                        .fold(SVector::zeros(), |sum, (x, w)| sum + x * *w)
                })
                .collect();
        }
        debug_assert_eq!(current.len(), 1);
        current[0]
    }
}

fn orders_of<const DIM: usize>(directions: &[usize]) -> [usize; DIM] {
    let mut orders = [0; DIM];
    for d in directions {
        orders[*d] += 1;
    }
    orders
}

/// Weight of vertex `v` in the multilinear interpolation at `xi`, or its derivative in the
/// given direction.
fn multilinear_weight<const DIM: usize>(v: usize, xi: &Point<f64, DIM>, derivative: Option<usize>) -> f64 {
    (0..DIM)
        .map(|d| {
            let upper = (v >> d) & 1 == 1;
            match (derivative == Some(d), upper) {
                (true, true) => 1.0,
                (true, false) => -1.0,
                (false, true) => xi[d],
                (false, false) => 1.0 - xi[d],
            }
        })
        .product()
}

/// Determinant of a small square matrix given with runtime dimension.
fn small_determinant<const N: usize>(m: &SMatrix<f64, N, N>) -> f64 {
    match N {
        1 => m[(0, 0)],
        2 => m[(0, 0)].mul_add(m[(1, 1)], -m[(0, 1)] * m[(1, 0)]),
        3 => {
            m[(0, 0)] * (m[(1, 1)] * m[(2, 2)] - m[(1, 2)] * m[(2, 1)])
                - m[(0, 1)] * (m[(1, 0)] * m[(2, 2)] - m[(1, 2)] * m[(2, 0)])
                + m[(0, 2)] * (m[(1, 0)] * m[(2, 1)] - m[(1, 1)] * m[(2, 0)])
        }
        _ => panic!("determinants are only implemented for dimensions 1 to 3"),
    }
}

/// The volume element of the Jacobian: its determinant if square, otherwise the square root of
/// the Gram determinant.
pub(crate) fn jacobian_determinant<const DIM: usize, const SPACEDIM: usize>(j: &SMatrix<f64, SPACEDIM, DIM>) -> f64 {
    if DIM == SPACEDIM {
        let square = SMatrix::<f64, DIM, DIM>::from_fn(|r, c| j[(r, c)]);
        small_determinant(&square)
    } else {
        small_determinant(&(j.transpose() * j)).max(0.0).sqrt()
    }
}

/// The left inverse `(JᵀJ)⁻¹Jᵀ` of the Jacobian, which is its inverse for square Jacobians.
pub(crate) fn jacobian_inverse<const DIM: usize, const SPACEDIM: usize>(
    j: &SMatrix<f64, SPACEDIM, DIM>,
) -> Option<SMatrix<f64, DIM, SPACEDIM>> {
    let jt = j.transpose();
    (jt * j).try_inverse().map(|gram_inv| gram_inv * jt)
}

/// Contracts the reference indices of a Jacobian gradient with the inverse Jacobian.
pub(crate) fn push_forward_grad<const DIM: usize, const SPACEDIM: usize>(
    grad: &JacobianGrad<DIM, SPACEDIM>,
    inverse: &SMatrix<f64, DIM, SPACEDIM>,
) -> [SMatrix<f64, SPACEDIM, SPACEDIM>; SPACEDIM] {
    let partial: [SMatrix<f64, SPACEDIM, SPACEDIM>; DIM] = std::array::from_fn(|m| grad[m] * inverse);
    std::array::from_fn(|k| (0..DIM).fold(SMatrix::zeros(), |sum, m| sum + partial[m] * inverse[(m, k)]))
}

pub(crate) fn push_forward_2nd_derivative<const DIM: usize, const SPACEDIM: usize>(
    derivative: &Jacobian2ndDerivative<DIM, SPACEDIM>,
    inverse: &SMatrix<f64, DIM, SPACEDIM>,
) -> [[SMatrix<f64, SPACEDIM, SPACEDIM>; SPACEDIM]; SPACEDIM] {
    let partial: [[SMatrix<f64, SPACEDIM, SPACEDIM>; DIM]; DIM] =
        std::array::from_fn(|a| std::array::from_fn(|b| derivative[a][b] * inverse));
    std::array::from_fn(|k| {
        std::array::from_fn(|l| {
            let mut sum = SMatrix::zeros();
            for a in 0..DIM {
                for b in 0..DIM {
                    sum += partial[a][b] * (inverse[(a, k)] * inverse[(b, l)]);
                }
            }
            sum
        })
    })
}

pub(crate) fn push_forward_3rd_derivative<const DIM: usize, const SPACEDIM: usize>(
    derivative: &Jacobian3rdDerivative<DIM, SPACEDIM>,
    inverse: &SMatrix<f64, DIM, SPACEDIM>,
) -> [[[SMatrix<f64, SPACEDIM, SPACEDIM>; SPACEDIM]; SPACEDIM]; SPACEDIM] {
    let partial: [[[SMatrix<f64, SPACEDIM, SPACEDIM>; DIM]; DIM]; DIM] = std::array::from_fn(|a| {
        std::array::from_fn(|b| std::array::from_fn(|c| derivative[a][b][c] * inverse))
    });
    std::array::from_fn(|k| {
        std::array::from_fn(|l| {
            std::array::from_fn(|m| {
                let mut sum = SMatrix::zeros();
                for a in 0..DIM {
                    for b in 0..DIM {
                        for c in 0..DIM {
                            sum += partial[a][b][c] * (inverse[(a, k)] * inverse[(b, l)] * inverse[(c, m)]);
                        }
                    }
                }
                sum
            })
        })
    })
}
