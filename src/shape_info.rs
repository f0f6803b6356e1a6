//! Precomputed one-dimensional shape data for tensor-product evaluation.
use crate::polynomials::{lexicographic_to_hierarchic_numbering, LagrangeBasis1d};
use crate::tensor_product::{n_hessian_components, Operator1d, TensorShapeData};
use matfree_quadrature::Rule;
use ordered_float::OrderedFloat;
use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use std::mem::size_of;
use std::sync::Arc;

/// How the 1D shape values relate to the quadrature.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElementType {
    /// The quadrature points coincide with the nodes, so the value matrix is the identity.
    Collocation,
    General,
}

/// Shape values, gradients and Hessians of a 1D Lagrange basis at the points of a 1D rule,
/// together with the data needed to lift them to `dim` dimensions and several components.
#[derive(Debug, Clone)]
pub struct ShapeInfo {
    pub dim: usize,
    pub degree: usize,
    pub n_components: usize,
    pub n_q_points_1d: usize,
    /// Number of quadrature points of the `dim`-dimensional tensor rule.
    pub n_q_points: usize,
    /// Number of basis functions per component on a cell.
    pub dofs_per_component_on_cell: usize,
    pub element_type: ElementType,
    pub basis: LagrangeBasis1d,
    pub quadrature_1d: Rule<1>,
    /// Row-major `n_q_points_1d x (degree + 1)` matrices.
    pub shape_values: Vec<f64>,
    pub shape_gradients: Vec<f64>,
    pub shape_hessians: Vec<f64>,
    /// Values, first and second derivatives of each basis function at the left (index 0) and
    /// right (index 1) end of the interval, stored as `[values, gradients, hessians]`.
    pub shape_data_on_face: [Vec<f64>; 2],
    /// For each lexicographic index, the corresponding hierarchical index.
    pub lexicographic_numbering: Vec<usize>,
}

impl ShapeInfo {
    pub fn new(dim: usize, degree: usize, n_components: usize, quadrature_1d: &Rule<1>) -> Self {
        assert!(n_components > 0, "shape info needs at least one component");
        let basis = LagrangeBasis1d::gauss_lobatto(degree);
        let n = basis.len();
        let (_, points) = quadrature_1d;
        let n_q = points.len();

        let mut shape_values = vec![0.0; n_q * n];
        let mut shape_gradients = vec![0.0; n_q * n];
        let mut shape_hessians = vec![0.0; n_q * n];
        let mut buffer = Vec::new();
        for (q, [x]) in points.iter().enumerate() {
            basis.evaluate_all(*x, 2, &mut buffer);
            shape_values[q * n..(q + 1) * n].copy_from_slice(&buffer[0..n]);
            shape_gradients[q * n..(q + 1) * n].copy_from_slice(&buffer[n..2 * n]);
            shape_hessians[q * n..(q + 1) * n].copy_from_slice(&buffer[2 * n..3 * n]);
        }

        let shape_data_on_face = [0.0, 1.0].map(|x| {
            basis.evaluate_all(x, 2, &mut buffer);
            buffer.clone()
        });

        let is_collocation = n_q == n
            && points
                .iter()
                .zip(basis.nodes())
                .all(|([x], node)| (x - node).abs() < 1e-14);
        let element_type = if is_collocation {
            ElementType::Collocation
        } else {
            ElementType::General
        };

        Self {
            dim,
            degree,
            n_components,
            n_q_points_1d: n_q,
            n_q_points: n_q.pow(dim as u32),
            dofs_per_component_on_cell: n.pow(dim as u32),
            element_type,
            basis,
            quadrature_1d: quadrature_1d.clone(),
            shape_values,
            shape_gradients,
            shape_hessians,
            shape_data_on_face,
            lexicographic_numbering: lexicographic_to_hierarchic_numbering(dim, degree),
        }
    }

    pub fn n_hessian_components(&self) -> usize {
        n_hessian_components(self.dim)
    }

    /// Borrowed operators for use with the kernels in [`crate::tensor_product`].
    pub fn tensor_data(&self) -> TensorShapeData<'_> {
        let n = self.degree + 1;
        let n_q = self.n_q_points_1d;
        TensorShapeData {
            values: Operator1d::new(&self.shape_values, n_q, n),
            gradients: Operator1d::new(&self.shape_gradients, n_q, n),
            hessians: Operator1d::new(&self.shape_hessians, n_q, n),
        }
    }

    pub fn memory_consumption(&self) -> usize {
        let face_data: usize = self
            .shape_data_on_face
            .iter()
            .map(|v| v.capacity() * size_of::<f64>())
            .sum();
        size_of::<Self>()
            + (self.shape_values.capacity() + self.shape_gradients.capacity() + self.shape_hessians.capacity())
                * size_of::<f64>()
            + face_data
            + self.lexicographic_numbering.capacity() * size_of::<usize>()
            + (self.quadrature_1d.0.capacity() + self.quadrature_1d.1.capacity()) * size_of::<f64>()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct ShapeInfoKey {
    dim: usize,
    degree: usize,
    n_components: usize,
    points: Vec<OrderedFloat<f64>>,
}

/// A cache of [`ShapeInfo`] objects keyed by element and 1D quadrature.
///
/// Entries are immutable once created and shared through [`Arc`], so the cache can be used
/// from several threads at once.
#[derive(Debug, Default)]
pub struct ShapeInfoCache {
    entries: RwLock<FxHashMap<ShapeInfoKey, Arc<ShapeInfo>>>,
}

impl ShapeInfoCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the shape info for the given element and quadrature, creating it if needed.
    pub fn get_or_insert(
        &self,
        dim: usize,
        degree: usize,
        n_components: usize,
        quadrature_1d: &Rule<1>,
    ) -> Arc<ShapeInfo> {
        let key = ShapeInfoKey {
            dim,
            degree,
            n_components,
            points: quadrature_1d.1.iter().map(|[x]| OrderedFloat(*x)).collect(),
        };
        if let Some(info) = self.entries.read().get(&key) {
            return Arc::clone(info);
        }
        let mut entries = self.entries.write();
        let info = entries
            .entry(key)
            .or_insert_with(|| Arc::new(ShapeInfo::new(dim, degree, n_components, quadrature_1d)));
        Arc::clone(info)
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    pub fn memory_consumption(&self) -> usize {
        self.entries
            .read()
            .values()
            .map(|info| info.memory_consumption())
            .sum()
    }
}
