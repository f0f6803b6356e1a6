//! Evaluation of finite element functions on cell batches.
//!
//! A [`CellEvaluator`] gathers the DoF values of all lanes of a batch (resolving constraints
//! through the shared constraint pool), interpolates them to the quadrature points with
//! sum factorization and performs the transposed operations for integration.
use crate::dof_info::{ConstraintPool, DofRow};
use crate::mapping_info::MappingInfoStorage;
use crate::matrix_free::MatrixFree;
use crate::shape_info::ShapeInfo;
use crate::tensor_product::{evaluate, integrate, EvaluationFlags, TensorWorkspace};
use nalgebra::{Point, SVector};
use std::marker::PhantomData;
use std::sync::Arc;

/// Read and accumulate access to the entries of a vector in local numbering (owned entries
/// followed by ghosts).
pub trait VectorAccess {
    fn get(&self, index: usize) -> f64;
    fn add(&mut self, index: usize, value: f64);
}

impl VectorAccess for [f64] {
    fn get(&self, index: usize) -> f64 {
        self[index]
    }

    fn add(&mut self, index: usize, value: f64) {
        self[index] += value;
    }
}

impl VectorAccess for Vec<f64> {
    fn get(&self, index: usize) -> f64 {
        self[index]
    }

    fn add(&mut self, index: usize, value: f64) {
        self[index] += value;
    }
}

/// Unsynchronized access to a vector shared between the workers of a cell loop.
///
/// Soundness relies on the execution plan: batch ranges that run concurrently never touch the
/// same entry.
#[derive(Debug, Copy, Clone)]
pub struct SharedVectorAccess<'a> {
    ptr: *mut f64,
    len: usize,
    marker: PhantomData<&'a mut [f64]>,
}

unsafe impl<'a> Sync for SharedVectorAccess<'a> {}
unsafe impl<'a> Send for SharedVectorAccess<'a> {}

impl<'a> SharedVectorAccess<'a> {
    pub(crate) fn new(slice: &'a mut [f64]) -> Self {
        Self {
            ptr: slice.as_mut_ptr(),
            len: slice.len(),
            marker: PhantomData,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl<'a> VectorAccess for SharedVectorAccess<'a> {
    fn get(&self, index: usize) -> f64 {
        assert!(index < self.len, "index out of bounds");
        // SAFETY: in bounds, and no concurrent writer touches this entry
        unsafe { *self.ptr.add(index) }
    }

    fn add(&mut self, index: usize, value: f64) {
        assert!(index < self.len, "index out of bounds");
        // SAFETY: in bounds, and no other worker accesses this entry concurrently
        unsafe { *self.ptr.add(index) += value }
    }
}

/// Visits the local DoFs of a compressed row. Each DoF is passed as its position within the
/// row together with the indices and weights it is composed of.
fn visit_row(row: DofRow, pool: &ConstraintPool, mut visitor: impl FnMut(usize, &[usize], Option<&[f64]>)) {
    let mut position = 0;
    let mut cursor = 0;
    for &(n_unconstrained, pool_row) in row.constraint_indicator {
        for _ in 0..n_unconstrained {
            visitor(position, &row.indices[cursor..cursor + 1], None);
            position += 1;
            cursor += 1;
        }
        let weights = pool.row(pool_row);
        visitor(position, &row.indices[cursor..cursor + weights.len()], Some(weights));
        position += 1;
        cursor += weights.len();
    }
    for index in cursor..row.indices.len() {
        visitor(position, &row.indices[index..index + 1], None);
        position += 1;
    }
}

/// Evaluates a (possibly vector-valued) field on one cell batch at a time.
///
/// Buffers are stored per lane and component: DoF value `i` of component `c` on lane `l` is at
/// `(l * n_components + c) * dofs_per_component + i`, values at quadrature point `q` at
/// `(l * n_components + c) * n_q + q`.
#[derive(Debug)]
pub struct CellEvaluator<'a, const DIM: usize> {
    matrix_free: &'a MatrixFree<DIM>,
    dof_handler: usize,
    geometry: &'a MappingInfoStorage<DIM>,
    shape_info: Arc<ShapeInfo>,
    workspace: TensorWorkspace,
    batch: usize,
    n_active_lanes: usize,
    dof_values: Vec<f64>,
    values: Vec<f64>,
    gradients: Vec<f64>,
    reference_gradients: Vec<f64>,
}

impl<'a, const DIM: usize> CellEvaluator<'a, DIM> {
    /// An evaluator for the given DoF numbering and quadrature of `matrix_free`.
    ///
    /// # Panics
    /// If indices or geometry were not initialized.
    pub fn new(matrix_free: &'a MatrixFree<DIM>, dof_handler: usize, quadrature: usize) -> Self {
        assert!(matrix_free.has_indices(), "evaluation requires DoF indices");
        let shape_info = Arc::clone(matrix_free.shape_info(dof_handler, quadrature));
        let geometry = matrix_free.mapping_info().cell_data(quadrature);
        let n_lanes = matrix_free.n_lanes();
        let n_fields = n_lanes * shape_info.n_components;
        let n_q = shape_info.n_q_points;
        Self {
            matrix_free,
            dof_handler,
            geometry,
            workspace: TensorWorkspace::default(),
            batch: 0,
            n_active_lanes: 0,
            dof_values: vec![0.0; n_fields * shape_info.dofs_per_component_on_cell],
            values: vec![0.0; n_fields * n_q],
            gradients: vec![0.0; n_fields * DIM * n_q],
            reference_gradients: vec![0.0; DIM * n_q],
            shape_info,
        }
    }

    pub fn reinit(&mut self, batch: usize) {
        self.batch = batch;
        self.n_active_lanes = self.matrix_free.n_active_entries_per_cell_batch(batch);
    }

    pub fn batch(&self) -> usize {
        self.batch
    }

    pub fn n_active_lanes(&self) -> usize {
        self.n_active_lanes
    }

    pub fn n_q_points(&self) -> usize {
        self.shape_info.n_q_points
    }

    pub fn n_components(&self) -> usize {
        self.shape_info.n_components
    }

    pub fn dofs_per_component(&self) -> usize {
        self.shape_info.dofs_per_component_on_cell
    }

    fn field(&self, lane: usize, component: usize) -> usize {
        lane * self.n_components() + component
    }

    /// Gathers the DoF values of all active lanes from `src`. Constrained DoFs are replaced by
    /// the weighted sum of the DoFs they depend on; padding lanes are set to zero.
    pub fn read_dof_values<V: VectorAccess + ?Sized>(&mut self, src: &V) {
        let matrix_free = self.matrix_free;
        let dof_info = matrix_free.dof_info(self.dof_handler);
        let pool = matrix_free.constraint_pool();
        let n_dofs = self.dofs_per_component();
        self.dof_values.fill(0.0);
        for lane in 0..self.n_active_lanes {
            for component in 0..self.n_components() {
                let offset = self.field(lane, component) * n_dofs;
                let out = &mut self.dof_values[offset..offset + n_dofs];
                visit_row(dof_info.row(self.batch, lane, component), pool, |i, indices, weights| {
                    out[i] = match weights {
                        None => src.get(indices[0]),
                        Some(weights) => indices
                            .iter()
                            .zip(weights)
                            .map(|(&index, w)| w * src.get(index))
                            .sum(),
                    };
                });
            }
        }
    }

    /// Gathers the DoF values without resolving constraints.
    ///
    /// # Panics
    /// If plain indices were not stored during setup.
    pub fn read_dof_values_plain<V: VectorAccess + ?Sized>(&mut self, src: &V) {
        let matrix_free = self.matrix_free;
        let dof_info = matrix_free.dof_info(self.dof_handler);
        assert!(dof_info.has_plain_indices(), "plain indices were not stored");
        self.dof_values.fill(0.0);
        for lane in 0..self.n_active_lanes {
            if let Some(indices) = dof_info.plain_dof_indices(self.batch, lane) {
                let offset = self.field(lane, 0) * self.dofs_per_component();
                for (value, &index) in self.dof_values[offset..offset + indices.len()]
                    .iter_mut()
                    .zip(indices)
                {
                    *value = src.get(index);
                }
            }
        }
    }

    /// Adds the DoF values of all active lanes into `dst`, distributing contributions of
    /// constrained DoFs to the DoFs they depend on.
    pub fn distribute_local_to_global<V: VectorAccess + ?Sized>(&self, dst: &mut V) {
        let matrix_free = self.matrix_free;
        let dof_info = matrix_free.dof_info(self.dof_handler);
        let pool = matrix_free.constraint_pool();
        let n_dofs = self.dofs_per_component();
        for lane in 0..self.n_active_lanes {
            for component in 0..self.n_components() {
                let offset = self.field(lane, component) * n_dofs;
                let local = &self.dof_values[offset..offset + n_dofs];
                visit_row(dof_info.row(self.batch, lane, component), pool, |i, indices, weights| match weights {
                    None => dst.add(indices[0], local[i]),
                    Some(weights) => {
                        for (&index, w) in indices.iter().zip(weights) {
                            dst.add(index, w * local[i]);
                        }
                    }
                });
            }
        }
    }

    pub fn dof_values(&self, lane: usize, component: usize) -> &[f64] {
        let n = self.dofs_per_component();
        let offset = self.field(lane, component) * n;
        &self.dof_values[offset..offset + n]
    }

    pub fn dof_values_mut(&mut self, lane: usize, component: usize) -> &mut [f64] {
        let n = self.dofs_per_component();
        let offset = self.field(lane, component) * n;
        &mut self.dof_values[offset..offset + n]
    }

    /// Computes values and/or real-space gradients at the quadrature points.
    pub fn evaluate(&mut self, flags: EvaluationFlags) {
        assert!(!flags.hessians, "Hessians are not available on cell batches");
        let n_q = self.n_q_points();
        let n_dofs = self.dofs_per_component();
        let shape = self.shape_info.tensor_data();
        for lane in 0..self.n_active_lanes {
            for component in 0..self.n_components() {
                let field = self.field(lane, component);
                evaluate(
                    &shape,
                    DIM,
                    flags,
                    &self.dof_values[field * n_dofs..(field + 1) * n_dofs],
                    &mut self.values[field * n_q..(field + 1) * n_q],
                    &mut self.reference_gradients,
                    &mut [],
                    &mut self.workspace,
                );
                if flags.gradients {
                    let gradients = &mut self.gradients[field * DIM * n_q..(field + 1) * DIM * n_q];
                    for q in 0..n_q {
                        let inverse_jacobian = &self.geometry.inverse_jacobians[self.geometry.index(self.batch, q, lane)];
                        let reference = SVector::<f64, DIM>::from_fn(|e, _| self.reference_gradients[e * n_q + q]);
                        let real = inverse_jacobian.transpose() * reference;
                        for d in 0..DIM {
                            gradients[d * n_q + q] = real[d];
                        }
                    }
                }
            }
        }
    }

    /// Tests the submitted values and/or gradients with all basis functions, overwriting the
    /// DoF values.
    pub fn integrate(&mut self, flags: EvaluationFlags) {
        let n_q = self.n_q_points();
        let n_dofs = self.dofs_per_component();
        let shape = self.shape_info.tensor_data();
        self.dof_values.fill(0.0);
        for lane in 0..self.n_active_lanes {
            for q in 0..n_q {
                let index = self.geometry.index(self.batch, q, lane);
                let jxw = self.geometry.jxw[index];
                let inverse_jacobian = self.geometry.inverse_jacobians[index];
                for component in 0..self.n_components() {
                    let field = self.field(lane, component);
                    if flags.values {
                        self.values[field * n_q + q] *= jxw;
                    }
                    if flags.gradients {
                        let gradients = &mut self.gradients[field * DIM * n_q..(field + 1) * DIM * n_q];
                        let real = SVector::<f64, DIM>::from_fn(|d, _| gradients[d * n_q + q]);
                        let reference = inverse_jacobian * real * jxw;
                        for e in 0..DIM {
                            gradients[e * n_q + q] = reference[e];
                        }
                    }
                }
            }
            for component in 0..self.n_components() {
                let field = self.field(lane, component);
                integrate(
                    &shape,
                    DIM,
                    flags,
                    &self.values[field * n_q..(field + 1) * n_q],
                    &self.gradients[field * DIM * n_q..(field + 1) * DIM * n_q],
                    &mut self.dof_values[field * n_dofs..(field + 1) * n_dofs],
                    &mut self.workspace,
                );
            }
        }
    }

    pub fn get_value(&self, q: usize, lane: usize, component: usize) -> f64 {
        self.values[self.field(lane, component) * self.n_q_points() + q]
    }

    pub fn get_gradient(&self, q: usize, lane: usize, component: usize) -> SVector<f64, DIM> {
        let n_q = self.n_q_points();
        let offset = self.field(lane, component) * DIM * n_q;
        SVector::from_fn(|d, _| self.gradients[offset + d * n_q + q])
    }

    pub fn submit_value(&mut self, value: f64, q: usize, lane: usize, component: usize) {
        let n_q = self.n_q_points();
        let field = self.field(lane, component);
        self.values[field * n_q + q] = value;
    }

    pub fn submit_gradient(&mut self, gradient: SVector<f64, DIM>, q: usize, lane: usize, component: usize) {
        let n_q = self.n_q_points();
        let offset = self.field(lane, component) * DIM * n_q;
        for d in 0..DIM {
            self.gradients[offset + d * n_q + q] = gradient[d];
        }
    }

    pub fn quadrature_point(&self, q: usize, lane: usize) -> Point<f64, DIM> {
        self.geometry.quadrature_points[self.geometry.index(self.batch, q, lane)]
    }

    pub fn jxw(&self, q: usize, lane: usize) -> f64 {
        self.geometry.jxw[self.geometry.index(self.batch, q, lane)]
    }
}
