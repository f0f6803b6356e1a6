//! Cell adjacency graphs used to find conflict-free parallel execution orders.
use crate::cell_batch::active_cells_behind_face;
use crate::mesh::{faces_per_cell, CellHandle, MeshView};
use itertools::Itertools;
use nalgebra_sparse::pattern::SparsityPattern;
use rayon::prelude::*;
use rustc_hash::FxHashMap;
use std::mem::size_of;

/// A symmetric graph without self-loops, stored as a CSR sparsity pattern.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectivityGraph {
    pattern: SparsityPattern,
}

impl ConnectivityGraph {
    /// Builds the graph from (possibly one-sided, unsorted) adjacency lists.
    ///
    /// Every edge `i -> j` is mirrored, duplicates and self-loops are dropped.
    pub fn from_adjacency_lists(mut lists: Vec<Vec<usize>>) -> Self {
        let n = lists.len();
        let edges: Vec<(usize, usize)> = lists
            .iter()
            .enumerate()
            .flat_map(|(i, list)| list.iter().map(move |&j| (i, j)))
            .collect();
        for (i, j) in edges {
            assert!(j < n, "neighbor index {j} out of bounds for graph with {n} vertices");
            lists[j].push(i);
        }

        let mut offsets = Vec::with_capacity(n + 1);
        let mut indices = Vec::new();
        offsets.push(0);
        for (i, mut list) in lists.into_iter().enumerate() {
            list.sort_unstable();
            list.dedup();
            indices.extend(list.into_iter().filter(|&j| j != i));
            offsets.push(indices.len());
        }
        let pattern = SparsityPattern::try_from_offsets_and_indices(n, n, offsets, indices)
            .expect("sorted and deduplicated lists always form a valid pattern");
        Self { pattern }
    }

    pub fn n_vertices(&self) -> usize {
        self.pattern.major_dim()
    }

    /// Number of undirected edges.
    pub fn n_edges(&self) -> usize {
        self.pattern.nnz() / 2
    }

    pub fn neighbors(&self, vertex: usize) -> &[usize] {
        self.pattern.lane(vertex)
    }

    pub fn are_adjacent(&self, a: usize, b: usize) -> bool {
        self.neighbors(a).binary_search(&b).is_ok()
    }

    pub fn pattern(&self) -> &SparsityPattern {
        &self.pattern
    }

    /// Adds an edge between every pair of vertices that share a neighbor.
    pub fn with_neighbors_of_neighbors(&self) -> Self {
        let lists = (0..self.n_vertices())
            .into_par_iter()
            .map(|i| {
                self.neighbors(i)
                    .iter()
                    .flat_map(|&j| self.neighbors(j).iter().copied().chain(std::iter::once(j)))
                    .collect_vec()
            })
            .collect();
        Self::from_adjacency_lists(lists)
    }

    /// Merges the vertices into groups and connects two groups if any of their members are
    /// connected.
    pub fn condense(&self, group_of_vertex: &[usize], n_groups: usize) -> Self {
        assert_eq!(group_of_vertex.len(), self.n_vertices());
        let mut lists = vec![Vec::new(); n_groups];
        for (i, &group) in group_of_vertex.iter().enumerate() {
            lists[group].extend(self.neighbors(i).iter().map(|&j| group_of_vertex[j]));
        }
        Self::from_adjacency_lists(lists)
    }

    pub fn memory_consumption(&self) -> usize {
        size_of::<Self>() + (self.pattern.major_offsets().len() + self.pattern.nnz()) * size_of::<usize>()
    }
}

/// Builds the connectivity graph over the positions of `cells`.
///
/// Two cells are connected if they share a face and both are in `cells` (which are the cells
/// of one ownership tag), or if they share a DoF index in `cell_dofs`. With
/// `face_neighbors_of_neighbors`, cells two face-steps apart are connected as well, since
/// face integrals write into the cells on both sides of a face.
pub fn build_cell_connectivity<const DIM: usize, const SPACEDIM: usize>(
    mesh: &dyn MeshView<DIM, SPACEDIM>,
    cells: &[CellHandle],
    mg_level: Option<usize>,
    cell_dofs: Option<&[Vec<usize>]>,
    face_neighbors_of_neighbors: bool,
) -> ConnectivityGraph {
    let position: FxHashMap<CellHandle, usize> = cells
        .iter()
        .enumerate()
        .map(|(i, &cell)| (cell, i))
        .collect();

    let face_lists: Vec<Vec<usize>> = cells
        .par_iter()
        .map(|&cell| {
            let mut list = Vec::new();
            for face in 0..faces_per_cell(DIM) {
                let Some(neighbor) = mesh.neighbor(cell, face) else {
                    continue;
                };
                if mg_level.is_some() {
                    list.extend(position.get(&neighbor).copied());
                } else {
                    let behind = active_cells_behind_face(mesh, neighbor, mesh.neighbor_face(cell, face));
                    list.extend(behind.iter().filter_map(|c| position.get(c).copied()));
                }
            }
            list
        })
        .collect();

    let mut graph = ConnectivityGraph::from_adjacency_lists(face_lists);
    if face_neighbors_of_neighbors {
        graph = graph.with_neighbors_of_neighbors();
    }

    if let Some(cell_dofs) = cell_dofs {
        assert_eq!(cell_dofs.len(), cells.len(), "one DoF list per cell is needed");
        let mut lists = (0..cells.len())
            .map(|i| graph.neighbors(i).to_vec())
            .collect_vec();
        let dof_cell_pairs = cell_dofs
            .iter()
            .enumerate()
            .flat_map(|(cell, dofs)| dofs.iter().map(move |&dof| (dof, cell)))
            .sorted_unstable()
            .dedup()
            .collect_vec();
        for (_, group) in &dof_cell_pairs.into_iter().group_by(|(dof, _)| *dof) {
            let sharing_cells = group.map(|(_, cell)| cell).collect_vec();
            for &a in &sharing_cells {
                lists[a].extend(sharing_cells.iter().copied());
            }
        }
        graph = ConnectivityGraph::from_adjacency_lists(lists);
    }
    graph
}
