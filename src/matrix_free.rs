//! The matrix-free setup: cell batches, execution plan, compressed DoF indices, faces and
//! geometry, assembled from a mesh, one or more DoF numberings and a mapping.
//!
//! ```ignore
//! let matrix_free = MatrixFree::reinit(&mesh, &mapping, &[&dofs], &[&constraints], &[quadrature], AdditionalData::default())?;
//! for batch in matrix_free.batches(0, 0) {
//!     // batch.dof_indices, batch.jxw, ...
//! }
//! ```
use crate::cell_batch::{ghost_cells, resolve_cells, active_cells_behind_face, CellBatches};
use crate::connectivity::build_cell_connectivity;
use crate::constraints::{ConstraintError, ConstraintTable};
use crate::dof_info::{gather_cell_dofs, mg_flux_ghost_dofs, ConstraintPool, DofInfo};
use crate::dofs::{DofNumbering, Partitioner};
use crate::evaluation::SharedVectorAccess;
use crate::face_batch::{FaceBatches, FaceKind, FaceSetupOptions};
use crate::mapping::{GeometricMap, MappingError, UpdateFlags};
use crate::mapping_info::{GeometryType, MappingInfo};
use crate::mesh::{faces_per_cell, CellHandle, MeshView};
use crate::quadrature::Quadrature;
use crate::shape_info::{ShapeInfo, ShapeInfoCache};
use crate::task::{schedule_cells, SchedulingOptions, TaskInfo, TaskScheme};
use itertools::Itertools;
use nalgebra::{Point, SMatrix};
use rustc_hash::{FxHashMap, FxHashSet};
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::fmt;
use std::fmt::{Display, Formatter};
use std::io;
use std::ops::Range;
use std::sync::Arc;

/// Options for [`MatrixFree::reinit`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AdditionalData {
    pub tasks_parallel_scheme: TaskScheme,
    /// Number of batches per parallel block in the coloring scheme.
    pub tasks_block_size: usize,
    /// Number of cells per batch.
    pub n_lanes: usize,
    pub mapping_update_flags: UpdateFlags,
    pub mapping_update_flags_boundary_faces: UpdateFlags,
    pub mapping_update_flags_inner_faces: UpdateFlags,
    /// Work on the cells of this level instead of the active cells.
    pub mg_level: Option<usize>,
    pub store_plain_indices: bool,
    /// Category of each cell, indexed by active cell number (or cell index on `mg_level`).
    /// Batches only mix cells of different categories if not
    /// [`strict`](Self::cell_vectorization_categories_strict).
    pub cell_vectorization_category: Vec<u32>,
    pub cell_vectorization_categories_strict: bool,
    pub hold_all_faces_to_owned_cells: bool,
    pub initialize_indices: bool,
    pub initialize_mapping: bool,
}

impl Default for AdditionalData {
    fn default() -> Self {
        Self {
            tasks_parallel_scheme: TaskScheme::None,
            tasks_block_size: 8,
            n_lanes: 4,
            mapping_update_flags: UpdateFlags::INVERSE_JACOBIANS | UpdateFlags::JXW_VALUES,
            mapping_update_flags_boundary_faces: UpdateFlags::empty(),
            mapping_update_flags_inner_faces: UpdateFlags::empty(),
            mg_level: None,
            store_plain_indices: true,
            cell_vectorization_category: Vec::new(),
            cell_vectorization_categories_strict: false,
            hold_all_faces_to_owned_cells: false,
            initialize_indices: true,
            initialize_mapping: true,
        }
    }
}

impl AdditionalData {
    fn needs_faces(&self) -> bool {
        !self.mapping_update_flags_boundary_faces.is_empty() || !self.mapping_update_flags_inner_faces.is_empty()
    }
}

#[derive(Debug)]
pub enum SetupError {
    IncompatibleOptions(String),
    UnsupportedElement(String),
    /// The locally owned DoFs of a numbering do not form a valid contiguous range.
    NonContiguousOwnership,
    DimensionMismatch(String),
    /// A DoF numbering was computed on an older state of the mesh.
    StaleMesh,
    Constraints(ConstraintError),
    Mapping(MappingError),
}

impl Display for SetupError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Self::IncompatibleOptions(msg) => write!(f, "Incompatible options: {msg}"),
            Self::UnsupportedElement(msg) => write!(f, "Unsupported element: {msg}"),
            Self::NonContiguousOwnership => write!(f, "Locally owned DoFs do not form a contiguous range"),
            Self::DimensionMismatch(msg) => write!(f, "Dimension mismatch: {msg}"),
            Self::StaleMesh => write!(f, "DoF numbering does not match the current mesh"),
            Self::Constraints(err) => write!(f, "Invalid constraints: {err}"),
            Self::Mapping(err) => write!(f, "Failed to compute geometry: {err}"),
        }
    }
}

impl std::error::Error for SetupError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Constraints(err) => Some(err),
            Self::Mapping(err) => Some(err),
            _ => None,
        }
    }
}

impl From<MappingError> for SetupError {
    fn from(err: MappingError) -> Self {
        Self::Mapping(err)
    }
}

impl From<ConstraintError> for SetupError {
    fn from(err: ConstraintError) -> Self {
        Self::Constraints(err)
    }
}

/// Byte counts of the parts of a [`MatrixFree`] structure.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryReport {
    pub cell_batches: usize,
    pub dof_info: usize,
    pub constraint_pool: usize,
    pub task_info: usize,
    pub face_info: usize,
    pub mapping_info: usize,
    pub shape_info: usize,
}

impl MemoryReport {
    pub fn total(&self) -> usize {
        self.cell_batches
            + self.dof_info
            + self.constraint_pool
            + self.task_info
            + self.face_info
            + self.mapping_info
            + self.shape_info
    }
}

impl Display for MemoryReport {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let entries = [
            ("Cell batches", self.cell_batches),
            ("DoF info", self.dof_info),
            ("Constraint pool", self.constraint_pool),
            ("Task info", self.task_info),
            ("Face info", self.face_info),
            ("Mapping info", self.mapping_info),
            ("Shape info", self.shape_info),
            ("Total", self.total()),
        ];
        for (name, bytes) in entries {
            writeln!(f, "{name:<16} {:>10.1} kB", bytes as f64 / 1024.0)?;
        }
        Ok(())
    }
}

/// The geometry and index data of one cell batch.
#[derive(Debug, Clone, Copy)]
pub struct BatchView<'a, const DIM: usize> {
    pub index: usize,
    pub n_active_lanes: usize,
    /// All lanes, including padding.
    pub cells: &'a [CellHandle],
    /// Compressed DoF indices of all lanes and components of the batch; empty if indices were
    /// not initialized.
    pub dof_indices: &'a [usize],
    pub geometry: GeometryType,
    pub quadrature_points: &'a [Point<f64, DIM>],
    pub inverse_jacobians: &'a [SMatrix<f64, DIM, DIM>],
    pub jxw: &'a [f64],
}

/// Index and geometry data for matrix-free operator evaluation on a mesh.
#[derive(Debug)]
pub struct MatrixFree<const DIM: usize> {
    data: AdditionalData,
    mesh_generation: u64,
    cell_batches: CellBatches,
    task_info: TaskInfo,
    dof_info: Vec<DofInfo>,
    constraint_pool: ConstraintPool,
    face_batches: Option<FaceBatches>,
    mapping_info: MappingInfo<DIM>,
    shape_info_cache: Arc<ShapeInfoCache>,
    shape_infos: Vec<Vec<Arc<ShapeInfo>>>,
    quadratures: Vec<Quadrature<DIM>>,
}

fn validate<const DIM: usize>(
    mesh: &dyn MeshView<DIM, DIM>,
    dof_handlers: &[&dyn DofNumbering],
    constraints: &[&ConstraintTable],
    quadratures: &[Quadrature<DIM>],
    data: &AdditionalData,
) -> Result<(), SetupError> {
    if data.n_lanes == 0 {
        return Err(SetupError::DimensionMismatch("batches need at least one lane".to_string()));
    }
    if !data.cell_vectorization_category.is_empty() && data.tasks_parallel_scheme.is_threaded() {
        return Err(SetupError::IncompatibleOptions(
            "cell vectorization categories cannot be combined with threaded task scheduling; \
             use TaskScheme::None"
                .to_string(),
        ));
    }
    if dof_handlers.is_empty() || dof_handlers.len() != constraints.len() {
        return Err(SetupError::DimensionMismatch(format!(
            "{} DoF numberings and {} constraint tables given",
            dof_handlers.len(),
            constraints.len()
        )));
    }
    if quadratures.is_empty() {
        return Err(SetupError::DimensionMismatch("at least one quadrature is needed".to_string()));
    }
    if quadratures.iter().any(|q| q.tensor_factor().is_none()) {
        return Err(SetupError::IncompatibleOptions(
            "quadratures must be tensor products".to_string(),
        ));
    }
    if let Some(level) = data.mg_level {
        if level >= mesh.n_levels() {
            return Err(SetupError::DimensionMismatch(format!(
                "level {level} requested, but the mesh has {} levels",
                mesh.n_levels()
            )));
        }
    }

    for numbering in dof_handlers {
        if numbering.mesh_generation() != mesh.generation() {
            return Err(SetupError::StaleMesh);
        }
        let degree = numbering.degree();
        if degree == 0 {
            return Err(SetupError::UnsupportedElement(
                "piecewise constant elements have no tensor-product node lattice".to_string(),
            ));
        }
        let expected = numbering.n_components() * (degree + 1).pow(DIM as u32);
        if numbering.dofs_per_cell() != expected {
            return Err(SetupError::UnsupportedElement(format!(
                "expected {expected} DoFs per cell for a tensor-product element, found {}",
                numbering.dofs_per_cell()
            )));
        }
        let (owned, size) = match data.mg_level {
            Some(level) => {
                if !numbering.has_level_dofs() {
                    return Err(SetupError::IncompatibleOptions(
                        "level DoFs must be distributed for multigrid levels".to_string(),
                    ));
                }
                (numbering.locally_owned_level_dofs(level), numbering.n_level_dofs(level))
            }
            None => (numbering.locally_owned_dofs(), numbering.n_dofs()),
        };
        if owned.start > owned.end || owned.end > size {
            return Err(SetupError::NonContiguousOwnership);
        }
    }
    Ok(())
}

impl<const DIM: usize> MatrixFree<DIM> {
    /// Builds the complete structure.
    ///
    /// `constraints[i]` belongs to `dof_handlers[i]`; unclosed tables are closed on a copy.
    pub fn reinit(
        mesh: &dyn MeshView<DIM, DIM>,
        mapping: &dyn GeometricMap<DIM, DIM>,
        dof_handlers: &[&dyn DofNumbering],
        constraints: &[&ConstraintTable],
        quadratures: &[Quadrature<DIM>],
        data: AdditionalData,
    ) -> Result<Self, SetupError> {
        Self::reinit_with_cache(
            mesh,
            mapping,
            dof_handlers,
            constraints,
            quadratures,
            data,
            Arc::new(ShapeInfoCache::new()),
        )
    }

    /// Like [`reinit`](Self::reinit), sharing shape data through the given cache.
    pub fn reinit_with_cache(
        mesh: &dyn MeshView<DIM, DIM>,
        mapping: &dyn GeometricMap<DIM, DIM>,
        dof_handlers: &[&dyn DofNumbering],
        constraints: &[&ConstraintTable],
        quadratures: &[Quadrature<DIM>],
        data: AdditionalData,
        shape_info_cache: Arc<ShapeInfoCache>,
    ) -> Result<Self, SetupError> {
        validate(mesh, dof_handlers, constraints, quadratures, &data)?;
        let mg_level = data.mg_level;
        let needs_faces = data.needs_faces();

        let constraints = constraints
            .iter()
            .map(|table| -> Result<Cow<ConstraintTable>, SetupError> {
                if table.is_closed() || table.n_constraints() == 0 {
                    Ok(Cow::Borrowed(*table))
                } else {
                    let mut table = (*table).clone();
                    table.close()?;
                    Ok(Cow::Owned(table))
                }
            })
            .collect::<Result<Vec<_>, _>>()?;

        let cells = resolve_cells(mesh, mg_level);
        let ghosts = if needs_faces {
            ghost_cells(mesh, &cells, mg_level)
        } else {
            Vec::new()
        };
        log::debug!("Resolved {} owned cells and {} ghost cells", cells.len(), ghosts.len());

        let categories = if data.cell_vectorization_category.is_empty() {
            None
        } else {
            Some(cell_categories(mesh, &cells, &data)?)
        };

        let all_cells = cells.iter().chain(&ghosts).copied().collect_vec();
        let cell_dofs = dof_handlers
            .iter()
            .map(|numbering| gather_cell_dofs::<DIM>(*numbering, &all_cells, mg_level))
            .collect_vec();

        let ghost_set: FxHashSet<CellHandle> = ghosts.iter().copied().collect();
        let boundary = cells
            .iter()
            .enumerate()
            .map(|(i, &cell)| {
                let foreign_dofs = dof_handlers.iter().zip(&cell_dofs).any(|(numbering, dofs)| {
                    let owned = match mg_level {
                        Some(level) => numbering.locally_owned_level_dofs(level),
                        None => numbering.locally_owned_dofs(),
                    };
                    dofs[i].iter().any(|dof| !owned.contains(dof))
                });
                foreign_dofs || has_ghost_neighbor(mesh, cell, mg_level, &ghost_set)
            })
            .collect_vec();

        // Cells writing to a common DoF of any numbering conflict. A constrained DoF is written
        // through the DoFs it is constrained to.
        let merged_dofs = (0..cells.len())
            .map(|i| {
                let mut offset = 0;
                let mut merged = Vec::new();
                for ((numbering, dofs), table) in dof_handlers.iter().zip(&cell_dofs).zip(&constraints) {
                    for &dof in &dofs[i] {
                        merged.push(dof + offset);
                        if let Some(entries) = table.constraint_entries(dof) {
                            merged.extend(entries.iter().map(|(column, _)| column + offset));
                        }
                    }
                    offset += match mg_level {
                        Some(level) => numbering.n_level_dofs(level),
                        None => numbering.n_dofs(),
                    };
                }
                merged
            })
            .collect_vec();
        let graph = build_cell_connectivity(mesh, &cells, mg_level, Some(merged_dofs.as_slice()), needs_faces);
        log::debug!("Connectivity graph has {} edges", graph.n_edges());

        let options = SchedulingOptions {
            scheme: data.tasks_parallel_scheme,
            block_size: data.tasks_block_size,
            n_lanes: data.n_lanes,
            categories_strict: data.cell_vectorization_categories_strict,
        };
        let (task_info, cell_batches) =
            schedule_cells(mesh, &cells, &ghosts, &boundary, categories.as_deref(), &graph, &options);
        log::debug!(
            "Formed {} cell batches ({} ghost), {} colors",
            cell_batches.n_batches(),
            cell_batches.n_ghost_batches(),
            task_info.n_colors()
        );

        let position: FxHashMap<CellHandle, usize> = all_cells
            .iter()
            .enumerate()
            .map(|(i, &cell)| (cell, i))
            .collect();
        let mut constraint_pool = ConstraintPool::new();
        let mut dof_info = Vec::new();
        if data.initialize_indices {
            for ((numbering, table), dofs) in dof_handlers.iter().zip(&constraints).zip(&cell_dofs) {
                let extra_ghosts = match mg_level {
                    Some(level) if needs_faces => mg_flux_ghost_dofs(mesh, *numbering, level),
                    _ => Vec::new(),
                };
                dof_info.push(DofInfo::build(
                    *numbering,
                    table,
                    &cell_batches,
                    |cell| dofs[position[&cell]].as_slice(),
                    mg_level,
                    &extra_ghosts,
                    data.store_plain_indices,
                    &mut constraint_pool,
                ));
            }
            log::debug!("Constraint pool holds {} distinct rows", constraint_pool.n_rows());
        }

        let face_batches = needs_faces.then(|| {
            let options = FaceSetupOptions {
                hold_all_faces_to_owned_cells: data.hold_all_faces_to_owned_cells,
                mg_level,
            };
            FaceBatches::build(mesh, &cell_batches, task_info.hard_boundaries(), &options)
        });

        let mut mapping_info = MappingInfo::default();
        if data.initialize_mapping {
            mapping_info =
                MappingInfo::compute_cells(mesh, mapping, &cell_batches, quadratures, data.mapping_update_flags)?;
            if let Some(face_batches) = &face_batches {
                let flags = data.mapping_update_flags_inner_faces | data.mapping_update_flags_boundary_faces;
                mapping_info.compute_faces(mesh, mapping, &cell_batches, face_batches, quadratures, flags)?;
            }
        }

        let shape_infos = dof_handlers
            .iter()
            .map(|numbering| {
                quadratures
                    .iter()
                    .filter_map(|quadrature| quadrature.tensor_factor())
                    .map(|rule_1d| {
                        shape_info_cache.get_or_insert(DIM, numbering.degree(), numbering.n_components(), rule_1d)
                    })
                    .collect()
            })
            .collect();

        let matrix_free = Self {
            data,
            mesh_generation: mesh.generation(),
            cell_batches,
            task_info,
            dof_info,
            constraint_pool,
            face_batches,
            mapping_info,
            shape_info_cache,
            shape_infos,
            quadratures: quadratures.to_vec(),
        };
        log::info!(
            "Matrix-free setup done: {} cells in {} batches of width {}, {} face batches, {:.1} kB",
            cells.len(),
            matrix_free.n_cell_batches(),
            matrix_free.n_lanes(),
            matrix_free
                .face_batches
                .as_ref()
                .map(FaceBatches::n_batches)
                .unwrap_or(0),
            matrix_free.memory_consumption().total() as f64 / 1024.0
        );
        Ok(matrix_free)
    }

    pub fn additional_data(&self) -> &AdditionalData {
        &self.data
    }

    /// Whether the structure was built for the current state of `mesh`.
    pub fn is_up_to_date(&self, mesh: &dyn MeshView<DIM, DIM>) -> bool {
        self.mesh_generation == mesh.generation()
    }

    pub fn n_lanes(&self) -> usize {
        self.cell_batches.n_lanes()
    }

    /// Number of locally owned cell batches.
    pub fn n_cell_batches(&self) -> usize {
        self.cell_batches.n_owned_batches()
    }

    pub fn n_ghost_cell_batches(&self) -> usize {
        self.cell_batches.n_ghost_batches()
    }

    pub fn n_active_entries_per_cell_batch(&self, batch: usize) -> usize {
        self.cell_batches.n_active_lanes(batch)
    }

    pub fn cell(&self, batch: usize, lane: usize) -> CellHandle {
        self.cell_batches.cell(batch, lane)
    }

    pub fn cell_batches(&self) -> &CellBatches {
        &self.cell_batches
    }

    pub fn task_info(&self) -> &TaskInfo {
        &self.task_info
    }

    pub fn n_dof_handlers(&self) -> usize {
        self.shape_infos.len()
    }

    /// Compressed indices of a DoF numbering.
    ///
    /// # Panics
    /// If the structure was set up without `initialize_indices`.
    pub fn dof_info(&self, dof_handler: usize) -> &DofInfo {
        &self.dof_info[dof_handler]
    }

    pub fn has_indices(&self) -> bool {
        !self.dof_info.is_empty()
    }

    pub fn constraint_pool(&self) -> &ConstraintPool {
        &self.constraint_pool
    }

    pub fn partitioner(&self, dof_handler: usize) -> &Partitioner {
        self.dof_info(dof_handler).partitioner()
    }

    /// A zero vector with room for the owned and ghost entries of a DoF numbering.
    pub fn create_vector(&self, dof_handler: usize) -> Vec<f64> {
        vec![0.0; self.partitioner(dof_handler).local_size()]
    }

    pub fn face_batches(&self) -> Option<&FaceBatches> {
        self.face_batches.as_ref()
    }

    pub fn mapping_info(&self) -> &MappingInfo<DIM> {
        &self.mapping_info
    }

    pub fn shape_info(&self, dof_handler: usize, quadrature: usize) -> &Arc<ShapeInfo> {
        &self.shape_infos[dof_handler][quadrature]
    }

    pub fn shape_info_cache(&self) -> &Arc<ShapeInfoCache> {
        &self.shape_info_cache
    }

    pub fn quadrature(&self, quadrature: usize) -> &Quadrature<DIM> {
        &self.quadratures[quadrature]
    }

    /// The owned batches with their indices (of `dof_handler`) and geometry (for `quadrature`).
    pub fn batches(&self, dof_handler: usize, quadrature: usize) -> impl Iterator<Item = BatchView<'_, DIM>> + '_ {
        (0..self.n_cell_batches()).map(move |batch| {
            let dof_indices = self
                .dof_info
                .get(dof_handler)
                .map(|info| &info.dof_indices()[info.batch_index_range(batch)])
                .unwrap_or(&[]);
            let (geometry, quadrature_points, inverse_jacobians, jxw) = if self.mapping_info.n_quadratures() > 0 {
                let storage = self.mapping_info.cell_data(quadrature);
                let range = storage.batch_range(batch);
                (
                    storage.geometry_type(batch),
                    &storage.quadrature_points[range.clone()],
                    &storage.inverse_jacobians[range.clone()],
                    &storage.jxw[range],
                )
            } else {
                (GeometryType::General, &[][..], &[][..], &[][..])
            };
            BatchView {
                index: batch,
                n_active_lanes: self.cell_batches.n_active_lanes(batch),
                cells: self.cell_batches.batch(batch),
                dof_indices,
                geometry,
                quadrature_points,
                inverse_jacobians,
                jxw,
            }
        })
    }

    /// Runs `kernel` on ranges of owned batches following the execution plan. Ranges handed out
    /// concurrently never share a DoF, so the kernel may add to `dst` through the given access.
    pub fn cell_loop<F>(&self, dst: &mut [f64], kernel: F)
    where
        F: Fn(&Self, &mut SharedVectorAccess<'_>, Range<usize>) + Sync,
    {
        let access = SharedVectorAccess::new(dst);
        self.task_info.execute(|range| {
            let mut access = access;
            kernel(self, &mut access, range)
        });
    }

    pub fn memory_consumption(&self) -> MemoryReport {
        MemoryReport {
            cell_batches: self.cell_batches.memory_consumption(),
            dof_info: self.dof_info.iter().map(DofInfo::memory_consumption).sum(),
            constraint_pool: self.constraint_pool.memory_consumption(),
            task_info: self.task_info.memory_consumption(),
            face_info: self
                .face_batches
                .as_ref()
                .map(FaceBatches::memory_consumption)
                .unwrap_or(0),
            mapping_info: self.mapping_info.memory_consumption(),
            shape_info: self
                .shape_infos
                .iter()
                .flatten()
                .unique_by(|info| Arc::as_ptr(info))
                .map(|info| info.memory_consumption())
                .sum(),
        }
    }

    pub fn print_memory_consumption(&self, out: &mut impl io::Write) -> io::Result<()> {
        write!(out, "{}", self.memory_consumption())
    }

    /// Writes a human-readable description of batches, partitions, colors and faces.
    pub fn print(&self, out: &mut impl io::Write) -> io::Result<()> {
        let partition = self.task_info.cell_partition_data();
        writeln!(
            out,
            "{} owned and {} ghost cell batches with {} lanes, scheme {:?}",
            self.n_cell_batches(),
            self.n_ghost_cell_batches(),
            self.n_lanes(),
            self.task_info.scheme()
        )?;
        writeln!(out, "Partition data: {:?}", partition)?;
        for (s, stage) in self.task_info.stages().iter().enumerate() {
            writeln!(out, "Stage {s}: blocks {:?}", stage)?;
        }
        if self.task_info.n_colors() > 0 {
            writeln!(out, "Colors: {:?}", self.task_info.batch_colors())?;
        }
        for batch in 0..self.cell_batches.n_batches() {
            let cells = self
                .cell_batches
                .active_cells(batch)
                .iter()
                .map(|cell| format!("{}.{}", cell.level, cell.index))
                .join(" ");
            let ghost = if self.cell_batches.is_ghost_batch(batch) { " (ghost)" } else { "" };
            writeln!(out, "Batch {batch}{ghost}: {cells}")?;
        }
        if let Some(faces) = &self.face_batches {
            for kind in [FaceKind::Interior, FaceKind::Boundary, FaceKind::InnerGhost, FaceKind::RefinementEdge] {
                let range = faces.batches_of_kind(kind);
                writeln!(out, "{:?} face batches: {:?}", kind, range)?;
                for batch in range {
                    let lanes = faces.batch(batch)[..faces.n_active_lanes(batch)]
                        .iter()
                        .map(|face| match face.exterior_cell {
                            Some(exterior) => format!(
                                "{}:{}|{}:{}",
                                face.interior_cell, face.interior_face, exterior, face.exterior_face
                            ),
                            None => format!("{}:{}|b{}", face.interior_cell, face.interior_face, face.boundary_id),
                        })
                        .join(" ");
                    writeln!(out, "  {batch}: {lanes}")?;
                }
            }
        }
        Ok(())
    }
}

fn has_ghost_neighbor<const DIM: usize>(
    mesh: &dyn MeshView<DIM, DIM>,
    cell: CellHandle,
    mg_level: Option<usize>,
    ghosts: &FxHashSet<CellHandle>,
) -> bool {
    if ghosts.is_empty() {
        return false;
    }
    (0..faces_per_cell(DIM)).any(|face| match mesh.neighbor(cell, face) {
        None => false,
        Some(neighbor) if mg_level.is_some() => ghosts.contains(&neighbor),
        Some(neighbor) => active_cells_behind_face(mesh, neighbor, mesh.neighbor_face(cell, face))
            .iter()
            .any(|c| ghosts.contains(c)),
    })
}

/// Looks up the category of each cell.
fn cell_categories<const DIM: usize>(
    mesh: &dyn MeshView<DIM, DIM>,
    cells: &[CellHandle],
    data: &AdditionalData,
) -> Result<Vec<u32>, SetupError> {
    let categories = &data.cell_vectorization_category;
    let expected = match data.mg_level {
        Some(level) => mesh.n_cells_on_level(level),
        None => mesh.active_cells().len(),
    };
    if categories.len() != expected {
        return Err(SetupError::DimensionMismatch(format!(
            "{} cell categories given for {expected} cells",
            categories.len()
        )));
    }
    Ok(match data.mg_level {
        Some(_) => cells.iter().map(|cell| categories[cell.index]).collect(),
        None => {
            let active_index: FxHashMap<CellHandle, usize> = mesh
                .active_cells()
                .into_iter()
                .enumerate()
                .map(|(i, cell)| (cell, i))
                .collect();
            cells
                .iter()
                .map(|cell| categories[active_index[cell]])
                .collect()
        }
    })
}
