//! Grouping of cells into fixed-width batches for vectorized processing.
//!
//! The cells to process are found by resolving the coarse cells of the mesh recursively into
//! their active (or, for multigrid, level) descendants. This keeps siblings next to each
//! other, which gives a z-order-like locality in the final cell order.
use crate::mesh::{faces_per_cell, max_children_per_cell, CellHandle, MeshView};
use itertools::Itertools;
use rustc_hash::FxHashSet;
use std::mem::size_of;

/// Collects the locally owned cells in hierarchical order.
///
/// Without `mg_level`, these are the active cells owned by the local subdomain. With
/// `mg_level`, these are the cells on that level whose level subdomain is the local one.
pub fn resolve_cells<const DIM: usize, const SPACEDIM: usize>(
    mesh: &dyn MeshView<DIM, SPACEDIM>,
    mg_level: Option<usize>,
) -> Vec<CellHandle> {
    fn resolve<const DIM: usize, const SPACEDIM: usize>(
        mesh: &dyn MeshView<DIM, SPACEDIM>,
        cell: CellHandle,
        mg_level: Option<usize>,
        cells: &mut Vec<CellHandle>,
    ) {
        match mg_level {
            Some(level) if cell.level == level => {
                if mesh.is_locally_owned_on_level(cell) {
                    cells.push(cell);
                }
            }
            _ if mesh.has_children(cell) => {
                for i in 0..max_children_per_cell(DIM) {
                    resolve(mesh, mesh.child(cell, i), mg_level, cells);
                }
            }
            Some(_) => {}
            None => {
                if mesh.is_locally_owned(cell) {
                    cells.push(cell);
                }
            }
        }
    }

    let mut cells = Vec::new();
    for index in 0..mesh.n_cells_on_level(0) {
        resolve(mesh, CellHandle::new(0, index), mg_level, &mut cells);
    }
    cells
}

/// Cells owned by other subdomains that share a face with one of the given cells.
///
/// The result is sorted by cell handle.
pub fn ghost_cells<const DIM: usize, const SPACEDIM: usize>(
    mesh: &dyn MeshView<DIM, SPACEDIM>,
    owned_cells: &[CellHandle],
    mg_level: Option<usize>,
) -> Vec<CellHandle> {
    if !mesh.supports_distributed_ownership() {
        return Vec::new();
    }
    let is_ghost = |cell: CellHandle| match mg_level {
        Some(_) => !mesh.is_locally_owned_on_level(cell),
        None => !mesh.is_locally_owned(cell) && !mesh.is_artificial(cell),
    };

    let mut ghosts = FxHashSet::default();
    for &cell in owned_cells {
        for face in 0..faces_per_cell(DIM) {
            let Some(neighbor) = mesh.neighbor(cell, face) else {
                continue;
            };
            match mg_level {
                Some(level) => {
                    if neighbor.level == level && is_ghost(neighbor) {
                        ghosts.insert(neighbor);
                    }
                }
                None => {
                    for candidate in active_cells_behind_face(mesh, neighbor, mesh.neighbor_face(cell, face)) {
                        if is_ghost(candidate) {
                            ghosts.insert(candidate);
                        }
                    }
                }
            }
        }
    }
    ghosts.into_iter().sorted().collect()
}

/// The active descendants of `cell` (or `cell` itself) that touch the given face.
pub fn active_cells_behind_face<const DIM: usize, const SPACEDIM: usize>(
    mesh: &dyn MeshView<DIM, SPACEDIM>,
    cell: CellHandle,
    face: usize,
) -> Vec<CellHandle> {
    if !mesh.has_children(cell) {
        return vec![cell];
    }
    let direction = face / 2;
    let side = face % 2;
    (0..max_children_per_cell(DIM))
        .filter(|c| (c >> direction) & 1 == side)
        .flat_map(|c| active_cells_behind_face(mesh, mesh.child(cell, c), face))
        .collect()
}

/// Cells grouped into batches of `n_lanes` cells.
///
/// Batches are formed group by group: the last batch of each group is padded by repeating
/// its last cell, and only the first [`n_active_lanes`](Self::n_active_lanes) lanes of a batch
/// hold distinct cells. Locally owned batches come first, followed by the ghost batches.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CellBatches {
    n_lanes: usize,
    cells: Vec<CellHandle>,
    active_lanes: Vec<usize>,
    n_owned_batches: usize,
}

impl CellBatches {
    /// Forms batches from consecutive runs of cells.
    ///
    /// `owned_groups` are the groups of owned cells in processing order; ghost cells are
    /// batched as one additional group.
    pub fn from_groups<'a>(
        n_lanes: usize,
        owned_groups: impl IntoIterator<Item = &'a [CellHandle]>,
        ghost_cells: &[CellHandle],
    ) -> Self {
        assert!(n_lanes > 0, "batches need at least one lane");
        let mut batches = Self {
            n_lanes,
            cells: Vec::new(),
            active_lanes: Vec::new(),
            n_owned_batches: 0,
        };
        for group in owned_groups {
            batches.push_group(group);
        }
        batches.n_owned_batches = batches.active_lanes.len();
        batches.push_group(ghost_cells);
        batches
    }

    fn push_group(&mut self, group: &[CellHandle]) {
        for chunk in group.chunks(self.n_lanes) {
            let last = *chunk.last().expect("chunks are never empty");
            self.cells.extend_from_slice(chunk);
            self.cells
                .extend(std::iter::repeat(last).take(self.n_lanes - chunk.len()));
            self.active_lanes.push(chunk.len());
        }
    }

    /// Number of batches needed to hold `n_cells` cells in one group.
    pub fn n_batches_for(n_cells: usize, n_lanes: usize) -> usize {
        (n_cells + n_lanes - 1) / n_lanes
    }

    pub fn n_lanes(&self) -> usize {
        self.n_lanes
    }

    pub fn n_batches(&self) -> usize {
        self.active_lanes.len()
    }

    pub fn n_owned_batches(&self) -> usize {
        self.n_owned_batches
    }

    pub fn n_ghost_batches(&self) -> usize {
        self.n_batches() - self.n_owned_batches
    }

    pub fn n_owned_cells(&self) -> usize {
        self.active_lanes[..self.n_owned_batches].iter().sum()
    }

    pub fn is_ghost_batch(&self, batch: usize) -> bool {
        batch >= self.n_owned_batches
    }

    pub fn n_active_lanes(&self, batch: usize) -> usize {
        self.active_lanes[batch]
    }

    /// All lanes of the batch, including padding.
    pub fn batch(&self, batch: usize) -> &[CellHandle] {
        &self.cells[batch * self.n_lanes..(batch + 1) * self.n_lanes]
    }

    /// The distinct cells of the batch.
    pub fn active_cells(&self, batch: usize) -> &[CellHandle] {
        &self.batch(batch)[..self.active_lanes[batch]]
    }

    pub fn cell(&self, batch: usize, lane: usize) -> CellHandle {
        self.cells[batch * self.n_lanes + lane]
    }

    /// All lanes of all batches, `n_lanes` entries per batch.
    pub fn cell_level_index(&self) -> &[CellHandle] {
        &self.cells
    }

    pub fn memory_consumption(&self) -> usize {
        size_of::<Self>()
            + self.cells.capacity() * size_of::<CellHandle>()
            + self.active_lanes.capacity() * size_of::<usize>()
    }
}
