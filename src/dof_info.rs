//! Compressed DoF index storage for cell batches.
//!
//! For every lane slot of every batch and every component, the DoF indices of the cell are
//! stored in lexicographic order as *local* indices of a [`Partitioner`]. Indices of
//! constrained DoFs are not stored themselves. Instead, a constraint indicator
//! `(n_unconstrained_before, pool_row)` records how many plain indices precede the constrained
//! DoF in the row and which row of the [`ConstraintPool`] holds its weights, and the indices of
//! the DoFs it is expanded into follow in the index array.
use crate::cell_batch::CellBatches;
use crate::constraints::ConstraintTable;
use crate::dofs::{DofNumbering, Partitioner};
use crate::mesh::{faces_per_cell, CellHandle, MeshView};
use crate::polynomials::lexicographic_to_hierarchic_numbering;
use ordered_float::OrderedFloat;
use rayon::prelude::*;
use rustc_hash::FxHashMap;
use std::mem::size_of;
use std::ops::Range;

/// Content-addressed storage of constraint weights.
///
/// Identical weight vectors share one row, so the pool stays small when many cells see the
/// same constraint pattern.
#[derive(Debug, Clone)]
pub struct ConstraintPool {
    lookup: FxHashMap<Vec<OrderedFloat<f64>>, usize>,
    data: Vec<f64>,
    row_index: Vec<usize>,
}

impl Default for ConstraintPool {
    fn default() -> Self {
        Self {
            lookup: FxHashMap::default(),
            data: Vec::new(),
            row_index: vec![0],
        }
    }
}

impl ConstraintPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the row holding `weights`, adding it if it is not present yet.
    pub fn insert(&mut self, weights: &[f64]) -> usize {
        let key: Vec<_> = weights.iter().copied().map(OrderedFloat).collect();
        if let Some(&row) = self.lookup.get(&key) {
            return row;
        }
        let row = self.n_rows();
        self.data.extend_from_slice(weights);
        self.row_index.push(self.data.len());
        self.lookup.insert(key, row);
        row
    }

    pub fn n_rows(&self) -> usize {
        self.row_index.len() - 1
    }

    pub fn row(&self, row: usize) -> &[f64] {
        &self.data[self.row_index[row]..self.row_index[row + 1]]
    }

    /// CSR offsets of the rows into [`data`](Self::data).
    pub fn row_index(&self) -> &[usize] {
        &self.row_index
    }

    pub fn data(&self) -> &[f64] {
        &self.data
    }

    pub fn memory_consumption(&self) -> usize {
        size_of::<Self>()
            + 2 * self.data.capacity() * size_of::<f64>()
            + self.lookup.capacity() * size_of::<(Vec<OrderedFloat<f64>>, usize)>()
            + self.row_index.capacity() * size_of::<usize>()
    }
}

/// Reads the DoF indices of a cell into `out`, component by component and in lexicographic
/// order within each component.
pub fn lexicographic_cell_dofs(
    numbering: &dyn DofNumbering,
    cell: CellHandle,
    level_numbering: bool,
    lexicographic_to_hierarchic: &[usize],
    out: &mut Vec<usize>,
) {
    let mut raw = Vec::with_capacity(numbering.dofs_per_cell());
    if level_numbering {
        numbering.level_cell_dof_indices(cell, &mut raw);
    } else {
        numbering.cell_dof_indices(cell, &mut raw);
    }
    let n_nodes = lexicographic_to_hierarchic.len();
    out.clear();
    for c in 0..numbering.n_components() {
        out.extend(lexicographic_to_hierarchic.iter().map(|&h| raw[c * n_nodes + h]));
    }
}

/// The DoF indices of each cell in lexicographic order.
pub fn gather_cell_dofs<const DIM: usize>(
    numbering: &dyn DofNumbering,
    cells: &[CellHandle],
    mg_level: Option<usize>,
) -> Vec<Vec<usize>> {
    let lex_to_h = lexicographic_to_hierarchic_numbering(DIM, numbering.degree());
    cells
        .par_iter()
        .map(|&cell| {
            let mut dofs = Vec::new();
            lexicographic_cell_dofs(numbering, cell, mg_level.is_some(), &lex_to_h, &mut dofs);
            dofs
        })
        .collect()
}

/// Level DoFs of coarser cells owned elsewhere that neighbor owned cells of the next finer
/// level. Face terms between levels read these values.
pub fn mg_flux_ghost_dofs<const DIM: usize, const SPACEDIM: usize>(
    mesh: &dyn MeshView<DIM, SPACEDIM>,
    numbering: &dyn DofNumbering,
    level: usize,
) -> Vec<usize> {
    let mut ghosts = Vec::new();
    if level + 1 >= mesh.n_levels() {
        return ghosts;
    }
    let mut indices = Vec::new();
    let own = mesh.locally_owned_subdomain();
    for index in 0..mesh.n_cells_on_level(level + 1) {
        let cell = CellHandle::new(level + 1, index);
        if !mesh.is_locally_owned_on_level(cell) {
            continue;
        }
        for face in 0..faces_per_cell(DIM) {
            if let Some(neighbor) = mesh.neighbor(cell, face) {
                if neighbor.level == level && mesh.level_subdomain_id(neighbor) != own {
                    numbering.level_cell_dof_indices(neighbor, &mut indices);
                    ghosts.extend_from_slice(&indices);
                }
            }
        }
    }
    ghosts
}

/// Compressed DoF indices of all cell batches for one DoF numbering.
#[derive(Debug, Clone)]
pub struct DofInfo {
    n_components: usize,
    dofs_per_component: usize,
    n_lanes: usize,
    row_starts: Vec<usize>,
    indicator_starts: Vec<usize>,
    dof_indices: Vec<usize>,
    constraint_indicator: Vec<(usize, usize)>,
    plain_dof_indices: Option<Vec<usize>>,
    partitioner: Partitioner,
    constrained_dofs: Vec<usize>,
}

/// Borrowed view of the compressed indices of one (lane slot, component) row.
#[derive(Debug, Copy, Clone)]
pub struct DofRow<'a> {
    pub indices: &'a [usize],
    pub constraint_indicator: &'a [(usize, usize)],
}

impl DofInfo {
    /// Compresses the DoF indices of all lanes of all batches.
    ///
    /// `cell_dofs` yields the lexicographic DoF indices of a cell (see [`gather_cell_dofs`]).
    /// `constraints` must be closed. `extra_ghosts` are added to the ghost set even if no
    /// cell refers to them. Padding lanes get empty rows.
    #[allow(clippy::too_many_arguments)]
    pub fn build<'a>(
        numbering: &dyn DofNumbering,
        constraints: &ConstraintTable,
        batches: &CellBatches,
        cell_dofs: impl Fn(CellHandle) -> &'a [usize],
        mg_level: Option<usize>,
        extra_ghosts: &[usize],
        store_plain_indices: bool,
        pool: &mut ConstraintPool,
    ) -> Self {
        assert!(
            constraints.is_closed() || constraints.n_constraints() == 0,
            "constraints must be closed before compressing indices"
        );
        let n_components = numbering.n_components();
        let dofs_per_component = numbering.dofs_per_cell() / n_components;
        let n_lanes = batches.n_lanes();
        let (owned, size) = match mg_level {
            Some(level) => (numbering.locally_owned_level_dofs(level), numbering.n_level_dofs(level)),
            None => (numbering.locally_owned_dofs(), numbering.n_dofs()),
        };

        let n_rows = batches.n_batches() * n_lanes * n_components;
        let mut row_starts = Vec::with_capacity(n_rows + 1);
        let mut indicator_starts = Vec::with_capacity(n_rows + 1);
        let mut dof_indices = Vec::new();
        let mut constraint_indicator = Vec::new();
        let mut plain = store_plain_indices.then(Vec::new);
        let mut weights = Vec::new();

        for batch in 0..batches.n_batches() {
            for (lane, &cell) in batches.batch(batch).iter().enumerate() {
                let dofs = cell_dofs(cell);
                assert_eq!(dofs.len(), n_components * dofs_per_component);
                if let Some(plain) = &mut plain {
                    plain.extend_from_slice(dofs);
                }
                let is_padding = lane >= batches.n_active_lanes(batch);
                for component in dofs.chunks(dofs_per_component) {
                    row_starts.push(dof_indices.len());
                    indicator_starts.push(constraint_indicator.len());
                    if is_padding {
                        continue;
                    }
                    let mut n_unconstrained = 0;
                    for &dof in component {
                        match constraints.constraint_entries(dof) {
                            Some(entries) => {
                                weights.clear();
                                weights.extend(entries.iter().map(|(_, w)| *w));
                                let row = pool.insert(&weights);
                                constraint_indicator.push((n_unconstrained, row));
                                dof_indices.extend(entries.iter().map(|(column, _)| *column));
                                n_unconstrained = 0;
                            }
                            None => {
                                dof_indices.push(dof);
                                n_unconstrained += 1;
                            }
                        }
                    }
                }
            }
        }
        row_starts.push(dof_indices.len());
        indicator_starts.push(constraint_indicator.len());

        let ghosts = dof_indices
            .iter()
            .chain(plain.iter().flatten())
            .chain(extra_ghosts)
            .copied()
            .filter(|dof| !owned.contains(dof))
            .collect::<Vec<_>>();
        let partitioner = Partitioner::new(size, owned.clone(), ghosts);
        let to_local = |dof: &mut usize| {
            *dof = partitioner
                .global_to_local(*dof)
                .expect("all indices are owned or ghosts");
        };
        dof_indices.iter_mut().for_each(to_local);
        if let Some(plain) = &mut plain {
            plain.iter_mut().for_each(to_local);
        }

        let constrained_dofs = constraints
            .lines()
            .map(|line| line.index)
            .filter(|dof| owned.contains(dof))
            .map(|dof| dof - owned.start)
            .collect();

        Self {
            n_components,
            dofs_per_component,
            n_lanes,
            row_starts,
            indicator_starts,
            dof_indices,
            constraint_indicator,
            plain_dof_indices: plain,
            partitioner,
            constrained_dofs,
        }
    }

    pub fn n_components(&self) -> usize {
        self.n_components
    }

    pub fn dofs_per_component(&self) -> usize {
        self.dofs_per_component
    }

    pub fn dofs_per_cell(&self) -> usize {
        self.n_components * self.dofs_per_component
    }

    /// One entry per (lane slot, component) plus a terminal entry equal to the length of
    /// [`dof_indices`](Self::dof_indices).
    pub fn row_starts(&self) -> &[usize] {
        &self.row_starts
    }

    pub fn dof_indices(&self) -> &[usize] {
        &self.dof_indices
    }

    pub fn constraint_indicator(&self) -> &[(usize, usize)] {
        &self.constraint_indicator
    }

    fn row_index(&self, batch: usize, lane: usize, component: usize) -> usize {
        (batch * self.n_lanes + lane) * self.n_components + component
    }

    pub fn row(&self, batch: usize, lane: usize, component: usize) -> DofRow<'_> {
        let r = self.row_index(batch, lane, component);
        DofRow {
            indices: &self.dof_indices[self.row_starts[r]..self.row_starts[r + 1]],
            constraint_indicator: &self.constraint_indicator[self.indicator_starts[r]..self.indicator_starts[r + 1]],
        }
    }

    /// Range of [`dof_indices`](Self::dof_indices) covering all lanes and components of a batch.
    pub fn batch_index_range(&self, batch: usize) -> Range<usize> {
        let first = self.row_index(batch, 0, 0);
        let last = self.row_index(batch + 1, 0, 0);
        self.row_starts[first]..self.row_starts[last]
    }

    /// Unconstrained local indices of a lane, if plain indices were stored.
    pub fn plain_dof_indices(&self, batch: usize, lane: usize) -> Option<&[usize]> {
        let n = self.dofs_per_cell();
        let start = (batch * self.n_lanes + lane) * n;
        self.plain_dof_indices
            .as_ref()
            .map(|plain| &plain[start..start + n])
    }

    pub fn has_plain_indices(&self) -> bool {
        self.plain_dof_indices.is_some()
    }

    pub fn partitioner(&self) -> &Partitioner {
        &self.partitioner
    }

    pub fn ghost_dofs(&self) -> &[usize] {
        self.partitioner.ghost_indices()
    }

    /// Local indices of the locally owned constrained DoFs.
    pub fn constrained_dofs(&self) -> &[usize] {
        &self.constrained_dofs
    }

    pub fn memory_consumption(&self) -> usize {
        size_of::<Self>()
            + (self.row_starts.capacity() + self.indicator_starts.capacity() + self.dof_indices.capacity())
                * size_of::<usize>()
            + self.constraint_indicator.capacity() * size_of::<(usize, usize)>()
            + self
                .plain_dof_indices
                .as_ref()
                .map(|plain| plain.capacity() * size_of::<usize>())
                .unwrap_or(0)
            + self.constrained_dofs.capacity() * size_of::<usize>()
            + self.partitioner.memory_consumption()
    }
}
