//! Geometry of cell and face batches at the quadrature points.
//!
//! All per-point quantities are stored lane-interleaved: the value for quadrature point `q` of
//! lane `l` in batch `b` sits at index `(b * n_q_points + q) * n_lanes + l`.
use crate::cell_batch::CellBatches;
use crate::face_batch::FaceBatches;
use crate::mapping::{GeometricMap, MappingData, MappingError, UpdateFlags};
use crate::mesh::{faces_per_cell, MeshView};
use crate::quadrature::Quadrature;
use nalgebra::{Point, SMatrix, SVector};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::cell::RefCell;
use std::mem::size_of;
use thread_local::ThreadLocal;

/// Classification of the Jacobians of a batch.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum GeometryType {
    /// Constant diagonal Jacobian on every lane.
    Cartesian,
    /// Constant Jacobian on every lane.
    Affine,
    General,
}

fn classify<const DIM: usize>(jacobians: &[SMatrix<f64, DIM, DIM>], n_q: usize, n_lanes: usize) -> GeometryType {
    let mut geometry = GeometryType::Cartesian;
    for lane in 0..n_lanes {
        let first = jacobians[lane];
        let tolerance = 1e-12 * first.norm();
        for q in 1..n_q {
            if (jacobians[q * n_lanes + lane] - first).norm() > tolerance {
                return GeometryType::General;
            }
        }
        let off_diagonal = (0..DIM)
            .flat_map(|i| (0..DIM).filter(move |&j| j != i).map(move |j| (i, j)))
            .any(|(i, j)| first[(i, j)].abs() > tolerance);
        if off_diagonal {
            geometry = GeometryType::Affine;
        }
    }
    geometry
}

/// Geometric data of all batches for one quadrature rule.
#[derive(Debug, Clone, Default)]
pub struct MappingInfoStorage<const DIM: usize> {
    n_q_points: usize,
    n_lanes: usize,
    pub quadrature_points: Vec<Point<f64, DIM>>,
    pub jacobians: Vec<SMatrix<f64, DIM, DIM>>,
    pub inverse_jacobians: Vec<SMatrix<f64, DIM, DIM>>,
    pub jxw: Vec<f64>,
    /// Unit normals, only for faces.
    pub normal_vectors: Vec<SVector<f64, DIM>>,
    /// Inverse Jacobians of the exterior cell, only for faces. Zero where there is no exterior
    /// cell.
    pub exterior_inverse_jacobians: Vec<SMatrix<f64, DIM, DIM>>,
    geometry: Vec<GeometryType>,
}

/// The values of one batch before they are merged into the storage.
struct BatchValues<const DIM: usize> {
    quadrature_points: Vec<Point<f64, DIM>>,
    jacobians: Vec<SMatrix<f64, DIM, DIM>>,
    inverse_jacobians: Vec<SMatrix<f64, DIM, DIM>>,
    jxw: Vec<f64>,
    normal_vectors: Vec<SVector<f64, DIM>>,
    exterior_inverse_jacobians: Vec<SMatrix<f64, DIM, DIM>>,
}

impl<const DIM: usize> BatchValues<DIM> {
    fn new(size: usize, face: bool) -> Self {
        let face_size = if face { size } else { 0 };
        Self {
            quadrature_points: vec![Point::origin(); size],
            jacobians: vec![SMatrix::zeros(); size],
            inverse_jacobians: vec![SMatrix::zeros(); size],
            jxw: vec![0.0; size],
            normal_vectors: vec![SVector::zeros(); face_size],
            exterior_inverse_jacobians: vec![SMatrix::zeros(); face_size],
        }
    }

    fn store_lane(&mut self, data: &MappingData<DIM, DIM>, lane: usize, n_lanes: usize) {
        for q in 0..data.n_quadrature_points() {
            let i = q * n_lanes + lane;
            self.quadrature_points[i] = data.quadrature_points[q];
            self.jacobians[i] = data.jacobians[q];
            self.inverse_jacobians[i] = data.inverse_jacobians[q];
            self.jxw[i] = data.jxw[q];
            if !self.normal_vectors.is_empty() {
                self.normal_vectors[i] = data.normal_vectors[q];
            }
        }
    }
}

impl<const DIM: usize> MappingInfoStorage<DIM> {
    fn from_batches(batches: Vec<BatchValues<DIM>>, n_q_points: usize, n_lanes: usize) -> Self {
        let mut storage = Self {
            n_q_points,
            n_lanes,
            ..Default::default()
        };
        for batch in batches {
            storage
                .geometry
                .push(classify(&batch.jacobians, n_q_points, n_lanes));
            storage.quadrature_points.extend(batch.quadrature_points);
            storage.jacobians.extend(batch.jacobians);
            storage.inverse_jacobians.extend(batch.inverse_jacobians);
            storage.jxw.extend(batch.jxw);
            storage.normal_vectors.extend(batch.normal_vectors);
            storage
                .exterior_inverse_jacobians
                .extend(batch.exterior_inverse_jacobians);
        }
        storage
    }

    pub fn n_q_points(&self) -> usize {
        self.n_q_points
    }

    pub fn n_batches(&self) -> usize {
        self.geometry.len()
    }

    pub fn geometry_type(&self, batch: usize) -> GeometryType {
        self.geometry[batch]
    }

    /// Index of quadrature point `q` of `lane` in `batch` in the per-point arrays.
    pub fn index(&self, batch: usize, q: usize, lane: usize) -> usize {
        (batch * self.n_q_points + q) * self.n_lanes + lane
    }

    /// Range of the per-point arrays belonging to `batch`.
    pub fn batch_range(&self, batch: usize) -> std::ops::Range<usize> {
        let size = self.n_q_points * self.n_lanes;
        batch * size..(batch + 1) * size
    }

    pub fn memory_consumption(&self) -> usize {
        size_of::<Self>()
            + self.quadrature_points.capacity() * size_of::<Point<f64, DIM>>()
            + (self.jacobians.capacity() + self.inverse_jacobians.capacity() + self.exterior_inverse_jacobians.capacity())
                * size_of::<SMatrix<f64, DIM, DIM>>()
            + self.jxw.capacity() * size_of::<f64>()
            + self.normal_vectors.capacity() * size_of::<SVector<f64, DIM>>()
            + self.geometry.capacity() * size_of::<GeometryType>()
    }
}

/// Geometric data of the cell and face batches of a
/// [`MatrixFree`](crate::matrix_free::MatrixFree) structure, one storage per quadrature rule.
#[derive(Debug, Clone, Default)]
pub struct MappingInfo<const DIM: usize> {
    cell_flags: UpdateFlags,
    face_flags: UpdateFlags,
    cells: Vec<MappingInfoStorage<DIM>>,
    faces: Vec<MappingInfoStorage<DIM>>,
}

const ALWAYS_COMPUTED: UpdateFlags = UpdateFlags::QUADRATURE_POINTS
    .union(UpdateFlags::JACOBIANS)
    .union(UpdateFlags::INVERSE_JACOBIANS)
    .union(UpdateFlags::JXW_VALUES);

impl<const DIM: usize> MappingInfo<DIM> {
    /// Evaluates the mapping on all cell batches (owned and ghost) for each quadrature.
    pub fn compute_cells(
        mesh: &dyn MeshView<DIM, DIM>,
        mapping: &dyn GeometricMap<DIM, DIM>,
        batches: &CellBatches,
        quadratures: &[Quadrature<DIM>],
        flags: UpdateFlags,
    ) -> Result<Self, MappingError> {
        let cell_flags = mapping.requires_update_flags(flags | ALWAYS_COMPUTED);
        let n_lanes = batches.n_lanes();
        let mut cells = Vec::with_capacity(quadratures.len());
        for quadrature in quadratures {
            let contexts: ThreadLocal<RefCell<MappingData<DIM, DIM>>> = ThreadLocal::new();
            let n_q = quadrature.len();
            let values = (0..batches.n_batches())
                .into_par_iter()
                .with_min_len(8)
                .map(|batch| {
                    let mut data = contexts
                        .get_or(|| RefCell::new(mapping.get_data(cell_flags, quadrature)))
                        .borrow_mut();
                    let mut values = BatchValues::new(n_q * n_lanes, false);
                    for (lane, &cell) in batches.batch(batch).iter().enumerate() {
                        mapping.fill(mesh, cell, &mut data)?;
                        values.store_lane(&data, lane, n_lanes);
                    }
                    Ok::<_, MappingError>(values)
                })
                .collect::<Result<Vec<_>, MappingError>>()?;
            cells.push(MappingInfoStorage::from_batches(values, n_q, n_lanes));
        }
        Ok(Self {
            cell_flags,
            cells,
            ..Default::default()
        })
    }

    /// Evaluates the mapping on all face batches for each quadrature.
    ///
    /// The quadratures must be tensor products; their 1D factor defines the face rule.
    pub fn compute_faces(
        &mut self,
        mesh: &dyn MeshView<DIM, DIM>,
        mapping: &dyn GeometricMap<DIM, DIM>,
        cell_batches: &CellBatches,
        face_batches: &FaceBatches,
        quadratures: &[Quadrature<DIM>],
        flags: UpdateFlags,
    ) -> Result<(), MappingError> {
        let face_flags =
            mapping.requires_update_flags(flags | ALWAYS_COMPUTED | UpdateFlags::NORMAL_VECTORS);
        let n_lanes = face_batches.n_lanes();
        let n_faces = faces_per_cell(DIM);
        let mut faces = Vec::with_capacity(quadratures.len());
        for quadrature in quadratures {
            let rule_1d = quadrature.tensor_factor().ok_or_else(|| {
                MappingError::InvalidInput("face data needs a tensor-product quadrature".to_string())
            })?;
            let contexts: ThreadLocal<RefCell<Vec<MappingData<DIM, DIM>>>> = ThreadLocal::new();
            let n_q = rule_1d.1.len().pow(DIM as u32 - 1);
            let values = (0..face_batches.n_batches())
                .into_par_iter()
                .with_min_len(8)
                .map(|batch| {
                    let mut face_data = contexts
                        .get_or(|| {
                            RefCell::new(
                                (0..n_faces)
                                    .map(|face| mapping.get_face_data(face_flags, face, rule_1d))
                                    .collect(),
                            )
                        })
                        .borrow_mut();
                    let mut values = BatchValues::new(n_q * n_lanes, true);
                    for (lane, face) in face_batches.batch(batch).iter().enumerate() {
                        let interior = cell_batches.cell(face.interior_cell / n_lanes, face.interior_cell % n_lanes);
                        let data = &mut face_data[face.interior_face];
                        mapping.fill(mesh, interior, data)?;
                        values.store_lane(data, lane, n_lanes);

                        let Some(exterior_slot) = face.exterior_cell else {
                            continue;
                        };
                        let exterior = cell_batches.cell(exterior_slot / n_lanes, exterior_slot % n_lanes);
                        if face.subface.is_none() {
                            let data = &mut face_data[face.exterior_face];
                            mapping.fill(mesh, exterior, data)?;
                            for q in 0..n_q {
                                values.exterior_inverse_jacobians[q * n_lanes + lane] = data.inverse_jacobians[q];
                            }
                        } else {
                            // The points lie on a part of the exterior face, so locate them
                            for q in 0..n_q {
                                let x = values.quadrature_points[q * n_lanes + lane];
                                let xi = mapping.transform_real_to_unit_cell(mesh, exterior, &x)?;
                                let jacobian = mapping.jacobian(mesh, exterior, &xi);
                                let inverse = jacobian.try_inverse().ok_or(MappingError::DegenerateCell {
                                    quadrature_point: q,
                                    determinant: 0.0,
                                })?;
                                values.exterior_inverse_jacobians[q * n_lanes + lane] = inverse;
                            }
                        }
                    }
                    Ok::<_, MappingError>(values)
                })
                .collect::<Result<Vec<_>, MappingError>>()?;
            faces.push(MappingInfoStorage::from_batches(values, n_q, n_lanes));
        }
        self.face_flags = face_flags;
        self.faces = faces;
        Ok(())
    }

    pub fn cell_update_flags(&self) -> UpdateFlags {
        self.cell_flags
    }

    pub fn face_update_flags(&self) -> UpdateFlags {
        self.face_flags
    }

    pub fn cell_data(&self, quadrature: usize) -> &MappingInfoStorage<DIM> {
        &self.cells[quadrature]
    }

    /// Face data, empty if no faces were requested.
    pub fn face_data(&self, quadrature: usize) -> Option<&MappingInfoStorage<DIM>> {
        self.faces.get(quadrature)
    }

    pub fn n_quadratures(&self) -> usize {
        self.cells.len()
    }

    pub fn memory_consumption(&self) -> usize {
        size_of::<Self>()
            + self
                .cells
                .iter()
                .chain(&self.faces)
                .map(MappingInfoStorage::memory_consumption)
                .sum::<usize>()
    }
}
