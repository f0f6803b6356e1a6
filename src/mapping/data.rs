use crate::mapping::forward::{
    jacobian_determinant, jacobian_inverse, push_forward_2nd_derivative, push_forward_3rd_derivative,
    push_forward_grad, CellMap, Jacobian2ndDerivative, Jacobian3rdDerivative, JacobianGrad, ReferenceDerivatives,
};
use crate::mapping::{MappingError, UpdateFlags};
use crate::polynomials::LagrangeBasis1d;
use crate::shape_info::ShapeInfo;
use crate::tensor_product::{evaluate, hessian_component_directions, EvaluationFlags, TensorWorkspace};
use matfree_quadrature::tensor::tensor_product;
use matfree_quadrature::Rule;
use nalgebra::{Point, SMatrix, SVector};
use std::sync::Arc;

/// Relationship between the current cell and the previously filled one.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum CellSimilarity {
    None,
    /// The cell is a translation of the previous cell, so all derivative data was reused.
    Translation,
}

/// The evaluation context of a mapping for one quadrature rule.
///
/// Created by [`GeometricMap::get_data`](crate::mapping::GeometricMap::get_data) and filled
/// by [`GeometricMap::fill`](crate::mapping::GeometricMap::fill). Each concurrent caller
/// needs its own instance.
#[derive(Debug, Clone)]
pub struct MappingData<const DIM: usize, const SPACEDIM: usize> {
    update_flags: UpdateFlags,
    reference_points: Vec<Point<f64, DIM>>,
    weights: Vec<f64>,
    face: Option<usize>,
    shape_info: Option<Arc<ShapeInfo>>,
    workspace: TensorWorkspace,
    previous_support_points: Vec<Point<f64, SPACEDIM>>,

    pub quadrature_points: Vec<Point<f64, SPACEDIM>>,
    pub jacobians: Vec<SMatrix<f64, SPACEDIM, DIM>>,
    pub inverse_jacobians: Vec<SMatrix<f64, DIM, SPACEDIM>>,
    /// Jacobian determinants, i.e. the signed volume elements.
    pub volume_elements: Vec<f64>,
    pub jxw: Vec<f64>,
    pub jacobian_grads: Vec<JacobianGrad<DIM, SPACEDIM>>,
    pub jacobian_pushed_forward_grads: Vec<[SMatrix<f64, SPACEDIM, SPACEDIM>; SPACEDIM]>,
    pub jacobian_2nd_derivatives: Vec<Jacobian2ndDerivative<DIM, SPACEDIM>>,
    pub jacobian_pushed_forward_2nd_derivatives: Vec<[[SMatrix<f64, SPACEDIM, SPACEDIM>; SPACEDIM]; SPACEDIM]>,
    pub jacobian_3rd_derivatives: Vec<Jacobian3rdDerivative<DIM, SPACEDIM>>,
    pub jacobian_pushed_forward_3rd_derivatives:
        Vec<[[[SMatrix<f64, SPACEDIM, SPACEDIM>; SPACEDIM]; SPACEDIM]; SPACEDIM]>,
    /// Unit outward normals on faces, or unit normals of codimension-one cells.
    pub normal_vectors: Vec<SVector<f64, SPACEDIM>>,
    /// Normals scaled by the surface element.
    pub boundary_forms: Vec<SVector<f64, SPACEDIM>>,
}

/// The tensor-product quadrature on a face of the reference cell, embedded in the cell.
pub(crate) fn face_quadrature<const DIM: usize>(face: usize, rule_1d: &Rule<1>) -> (Vec<f64>, Vec<Point<f64, DIM>>) {
    let direction = face / 2;
    let side = (face % 2) as f64;
    let embed = |tangential: &[f64]| {
        let mut xi = Point::<f64, DIM>::origin();
        let mut t = tangential.iter();
        for d in 0..DIM {
            xi[d] = if d == direction {
                side
            } else {
                *t.next().expect("one tangential coordinate per direction")
            };
        }
        xi
    };
    match DIM {
        1 => (vec![1.0], vec![embed(&[])]),
        2 => {
            let (weights, points) = tensor_product::<1>(rule_1d);
            (weights, points.iter().map(|p| embed(p)).collect())
        }
        3 => {
            let (weights, points) = tensor_product::<2>(rule_1d);
            (weights, points.iter().map(|p| embed(p)).collect())
        }
        _ => panic!("unsupported dimension {DIM}"),
    }
}

impl<const DIM: usize, const SPACEDIM: usize> MappingData<DIM, SPACEDIM> {
    pub(crate) fn new(
        update_flags: UpdateFlags,
        reference_points: Vec<Point<f64, DIM>>,
        weights: Vec<f64>,
        face: Option<usize>,
        shape_info: Option<Arc<ShapeInfo>>,
    ) -> Self {
        Self {
            update_flags,
            reference_points,
            weights,
            face,
            shape_info,
            workspace: TensorWorkspace::default(),
            previous_support_points: Vec::new(),
            quadrature_points: Vec::new(),
            jacobians: Vec::new(),
            inverse_jacobians: Vec::new(),
            volume_elements: Vec::new(),
            jxw: Vec::new(),
            jacobian_grads: Vec::new(),
            jacobian_pushed_forward_grads: Vec::new(),
            jacobian_2nd_derivatives: Vec::new(),
            jacobian_pushed_forward_2nd_derivatives: Vec::new(),
            jacobian_3rd_derivatives: Vec::new(),
            jacobian_pushed_forward_3rd_derivatives: Vec::new(),
            normal_vectors: Vec::new(),
            boundary_forms: Vec::new(),
        }
    }

    pub fn update_flags(&self) -> UpdateFlags {
        self.update_flags
    }

    pub fn n_quadrature_points(&self) -> usize {
        self.reference_points.len()
    }

    pub fn reference_points(&self) -> &[Point<f64, DIM>] {
        &self.reference_points
    }

    pub fn face(&self) -> Option<usize> {
        self.face
    }

    /// Forgets the previous cell, so that the next fill computes everything from scratch.
    pub fn reset_similarity(&mut self) {
        self.previous_support_points.clear();
    }

    fn detect_translation(&self, support_points: &[Point<f64, SPACEDIM>], degree: usize) -> Option<SVector<f64, SPACEDIM>> {
        // Translation detection is only valid for maps without curvature
        if degree > 1 || self.previous_support_points.len() != support_points.len() || support_points.is_empty() {
            return None;
        }
        let offset = support_points[0] - self.previous_support_points[0];
        let scale = support_points
            .iter()
            .map(|p| (p - support_points[0]).norm())
            .fold(0.0, f64::max);
        let is_translation = support_points
            .iter()
            .zip(&self.previous_support_points)
            .all(|(p, q)| ((p - q) - offset).norm() <= 1e-12 * scale);
        is_translation.then_some(offset)
    }

    pub(crate) fn fill(
        &mut self,
        basis: &LagrangeBasis1d,
        hierarchic_to_lex: &[usize],
        support_points: Vec<Point<f64, SPACEDIM>>,
    ) -> Result<CellSimilarity, MappingError> {
        use UpdateFlags as F;
        let flags = self.update_flags;
        let n_q = self.n_quadrature_points();
        let degree = basis.degree();

        if let Some(offset) = self.detect_translation(&support_points, degree) {
            for x in &mut self.quadrature_points {
                *x += offset;
            }
            self.previous_support_points = support_points;
            return Ok(CellSimilarity::Translation);
        }
        // Stays empty if this fill fails, so that no later cell reuses partial data
        self.previous_support_points.clear();

        let cell_map = CellMap::<DIM, SPACEDIM>::from_hierarchical(basis, &support_points, hierarchic_to_lex);

        let max_order = if flags.intersects(F::JACOBIAN_3RD_DERIVATIVES | F::JACOBIAN_PUSHED_FORWARD_3RD_DERIVATIVES) {
            4
        } else if flags.intersects(F::JACOBIAN_2ND_DERIVATIVES | F::JACOBIAN_PUSHED_FORWARD_2ND_DERIVATIVES) {
            3
        } else if flags.intersects(F::JACOBIAN_GRADS | F::JACOBIAN_PUSHED_FORWARD_GRADS) {
            2
        } else if flags.intersects(F::CONTRAVARIANT_TRANSFORMATION) {
            1
        } else {
            0
        };

        let mut derivatives = vec![ReferenceDerivatives::<DIM, SPACEDIM>::default(); n_q];
        let batched = match &self.shape_info {
            Some(shape_info) if max_order <= 2 && self.face.is_none() => {
                evaluate_tensor_batch(shape_info, &cell_map, max_order, &mut derivatives, &mut self.workspace);
                true
            }
            _ => false,
        };
        if !batched {
            for (xi, d) in self.reference_points.iter().zip(&mut derivatives) {
                cell_map.derivatives(xi, max_order, d);
            }
        }

        if flags.contains(F::QUADRATURE_POINTS) {
            self.quadrature_points.clear();
            self.quadrature_points
                .extend(derivatives.iter().map(|d| d.value));
        }

        if flags.contains(F::CONTRAVARIANT_TRANSFORMATION) {
            self.jacobians.clear();
            self.jacobians.extend(derivatives.iter().map(|d| d.jacobian));

            self.volume_elements.clear();
            for (q, jacobian) in self.jacobians.iter().enumerate() {
                let determinant = jacobian_determinant(jacobian);
                if !(determinant > 0.0) {
                    return Err(MappingError::DegenerateCell {
                        quadrature_point: q,
                        determinant,
                    });
                }
                self.volume_elements.push(determinant);
            }
        }

        if flags.contains(F::COVARIANT_TRANSFORMATION) {
            self.inverse_jacobians.clear();
            for (q, jacobian) in self.jacobians.iter().enumerate() {
                let inverse = jacobian_inverse(jacobian).ok_or(MappingError::DegenerateCell {
                    quadrature_point: q,
                    determinant: 0.0,
                })?;
                self.inverse_jacobians.push(inverse);
            }
        }

        if flags.contains(F::BOUNDARY_FORMS) {
            self.compute_boundary_forms();
        }

        if flags.contains(F::JXW_VALUES) {
            self.jxw.clear();
            if self.face.is_some() {
                let forms = &self.boundary_forms;
                self.jxw
                    .extend(forms.iter().zip(&self.weights).map(|(b, w)| b.norm() * w));
            } else {
                let volume_elements = &self.volume_elements;
                self.jxw
                    .extend(volume_elements.iter().zip(&self.weights).map(|(v, w)| v * w));
            }
        }

        if flags.contains(F::NORMAL_VECTORS) {
            self.normal_vectors.clear();
            self.normal_vectors
                .extend(self.boundary_forms.iter().map(|b| b.normalize()));
        }

        if flags.contains(F::JACOBIAN_GRADS) {
            self.jacobian_grads.clear();
            self.jacobian_grads
                .extend(derivatives.iter().map(|d| d.jacobian_grad));
        }
        if flags.contains(F::JACOBIAN_PUSHED_FORWARD_GRADS) {
            self.jacobian_pushed_forward_grads.clear();
            self.jacobian_pushed_forward_grads.extend(
                derivatives
                    .iter()
                    .zip(&self.inverse_jacobians)
                    .map(|(d, inv)| push_forward_grad(&d.jacobian_grad, inv)),
            );
        }
        if flags.contains(F::JACOBIAN_2ND_DERIVATIVES) {
            self.jacobian_2nd_derivatives.clear();
            self.jacobian_2nd_derivatives
                .extend(derivatives.iter().map(|d| d.jacobian_2nd_derivative));
        }
        if flags.contains(F::JACOBIAN_PUSHED_FORWARD_2ND_DERIVATIVES) {
            self.jacobian_pushed_forward_2nd_derivatives.clear();
            self.jacobian_pushed_forward_2nd_derivatives.extend(
                derivatives
                    .iter()
                    .zip(&self.inverse_jacobians)
                    .map(|(d, inv)| push_forward_2nd_derivative(&d.jacobian_2nd_derivative, inv)),
            );
        }
        if flags.contains(F::JACOBIAN_3RD_DERIVATIVES) {
            self.jacobian_3rd_derivatives.clear();
            self.jacobian_3rd_derivatives
                .extend(derivatives.iter().map(|d| d.jacobian_3rd_derivative));
        }
        if flags.contains(F::JACOBIAN_PUSHED_FORWARD_3RD_DERIVATIVES) {
            self.jacobian_pushed_forward_3rd_derivatives.clear();
            self.jacobian_pushed_forward_3rd_derivatives.extend(
                derivatives
                    .iter()
                    .zip(&self.inverse_jacobians)
                    .map(|(d, inv)| push_forward_3rd_derivative(&d.jacobian_3rd_derivative, inv)),
            );
        }

        self.previous_support_points = support_points;
        Ok(CellSimilarity::None)
    }

    /// Boundary forms on faces, or scaled normals of codimension-one cells.
    fn compute_boundary_forms(&mut self) {
        self.boundary_forms.clear();
        match self.face {
            Some(face) => {
                let direction = face / 2;
                let sign = if face % 2 == 1 { 1.0 } else { -1.0 };
                for (jacobian, volume) in self.jacobians.iter().zip(&self.volume_elements) {
                    // Nanson's formula: n da = det(J) J^-T N dA
                    let form = match jacobian_inverse(jacobian) {
                        Some(inverse) => inverse.row(direction).transpose() * (sign * volume),
                        None => SVector::zeros(),
                    };
                    self.boundary_forms.push(form);
                }
            }
            None if SPACEDIM == DIM + 1 => {
                for jacobian in &self.jacobians {
                    let mut form = SVector::<f64, SPACEDIM>::zeros();
                    if DIM == 1 {
                        form[0] = jacobian[(1, 0)];
                        form[1] = -jacobian[(0, 0)];
                    } else {
                        let a = jacobian.column(0);
                        let b = jacobian.column(1);
                        form[0] = a[1] * b[2] - a[2] * b[1];
                        form[1] = a[2] * b[0] - a[0] * b[2];
                        form[2] = a[0] * b[1] - a[1] * b[0];
                    }
                    self.boundary_forms.push(form);
                }
            }
            None => {}
        }
    }

    pub fn memory_consumption(&self) -> usize {
        use std::mem::size_of;
        size_of::<Self>()
            + self.quadrature_points.capacity() * size_of::<Point<f64, SPACEDIM>>()
            + self.jacobians.capacity() * size_of::<SMatrix<f64, SPACEDIM, DIM>>()
            + self.inverse_jacobians.capacity() * size_of::<SMatrix<f64, DIM, SPACEDIM>>()
            + (self.volume_elements.capacity() + self.jxw.capacity() + self.weights.capacity()) * size_of::<f64>()
            + self.jacobian_grads.capacity() * size_of::<JacobianGrad<DIM, SPACEDIM>>()
            + self.jacobian_2nd_derivatives.capacity() * size_of::<Jacobian2ndDerivative<DIM, SPACEDIM>>()
            + self.jacobian_3rd_derivatives.capacity() * size_of::<Jacobian3rdDerivative<DIM, SPACEDIM>>()
    }
}

/// Computes values, Jacobians and Jacobian gradients at all points of a tensor-product
/// quadrature with sum factorization.
fn evaluate_tensor_batch<const DIM: usize, const SPACEDIM: usize>(
    shape_info: &ShapeInfo,
    cell_map: &CellMap<DIM, SPACEDIM>,
    max_order: usize,
    out: &mut [ReferenceDerivatives<DIM, SPACEDIM>],
    workspace: &mut TensorWorkspace,
) {
    let n_q = out.len();
    debug_assert_eq!(n_q, shape_info.n_q_points);
    let flags = EvaluationFlags {
        values: true,
        gradients: max_order >= 1,
        hessians: max_order >= 2,
    };
    let shape = shape_info.tensor_data();
    let n_hessians = shape_info.n_hessian_components();
    let mut coefficients = vec![0.0; cell_map.lexicographic_points().len()];
    let mut values = vec![0.0; n_q];
    let mut gradients = vec![0.0; DIM * n_q];
    let mut hessians = vec![0.0; n_hessians * n_q];

    for a in 0..SPACEDIM {
        for (c, p) in coefficients.iter_mut().zip(cell_map.lexicographic_points()) {
            *c = p[a];
        }
        evaluate(&shape, DIM, flags, &coefficients, &mut values, &mut gradients, &mut hessians, workspace);
        for (q, d) in out.iter_mut().enumerate() {
            d.value[a] = values[q];
            if flags.gradients {
                for j in 0..DIM {
                    d.jacobian[(a, j)] = gradients[j * n_q + q];
                }
            }
            if flags.hessians {
                for c in 0..n_hessians {
                    let (j, k) = hessian_component_directions(DIM, c);
                    let value = hessians[c * n_q + q];
                    d.jacobian_grad[k][(a, j)] = value;
                    d.jacobian_grad[j][(a, k)] = value;
                }
            }
        }
    }
}
