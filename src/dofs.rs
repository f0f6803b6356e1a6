//! Degree-of-freedom numbering for tensor-product Lagrange elements.
//!
//! Each cell carries `(degree + 1)^DIM` scalar nodes per component. The nodes of a cell are
//! listed in hierarchical order (see
//! [`hierarchic_to_lexicographic_numbering`](crate::polynomials::hierarchic_to_lexicographic_numbering))
//! and components are stored one after the other, so the local index of node `i` of component
//! `c` is `c * n_nodes + i`. Globally, the components of a node are interleaved: scalar node
//! `s` of component `c` has global index `s * n_components + c`.
use crate::mesh::{vertices_per_cell, CellHandle, MeshView, SubdomainId};
use crate::polynomials::{hierarchic_to_lexicographic_numbering, unravel_index};
use itertools::Itertools;
use rustc_hash::FxHashMap;
use std::mem::size_of;
use std::ops::Range;

/// Access to the global DoF indices of the cells of a mesh.
pub trait DofNumbering: Sync {
    fn n_components(&self) -> usize;

    fn degree(&self) -> usize;

    /// Whether neighboring cells share the nodes on their common faces.
    fn is_continuous(&self) -> bool;

    /// The generation of the mesh the numbering was computed on.
    fn mesh_generation(&self) -> u64;

    fn dofs_per_cell(&self) -> usize;

    fn n_dofs(&self) -> usize;

    /// The contiguous range of DoF indices owned by the local subdomain.
    fn locally_owned_dofs(&self) -> Range<usize>;

    /// Global DoF indices of an active cell, in hierarchical order with components one after
    /// the other.
    fn cell_dof_indices(&self, cell: CellHandle, indices: &mut Vec<usize>);

    /// Whether a numbering of the cells of each level is available.
    fn has_level_dofs(&self) -> bool;

    fn n_level_dofs(&self, level: usize) -> usize;

    fn locally_owned_level_dofs(&self, level: usize) -> Range<usize>;

    /// Level DoF indices of a cell on any level, ordered like [`cell_dof_indices`](Self::cell_dof_indices).
    fn level_cell_dof_indices(&self, cell: CellHandle, indices: &mut Vec<usize>);
}

#[derive(Debug, Clone, Default)]
struct CellNodeTable {
    // Scalar node indices of each cell on each level, `nodes_per_cell` entries per cell.
    // Cells without a numbering hold `usize::MAX`.
    levels: Vec<Vec<usize>>,
    n_nodes: usize,
    owned: Range<usize>,
}

impl CellNodeTable {
    fn cell_nodes(&self, cell: CellHandle, nodes_per_cell: usize) -> &[usize] {
        let start = cell.index * nodes_per_cell;
        &self.levels[cell.level][start..start + nodes_per_cell]
    }

    fn memory_consumption(&self) -> usize {
        self.levels
            .iter()
            .map(|level| level.capacity() * size_of::<usize>())
            .sum()
    }
}

/// The identity of a node independent of the cell it is seen from: the sorted global vertex
/// indices of the mesh entity it lies in, and its position inside that entity.
type NodeKey = (Vec<usize>, Vec<usize>);

/// Numbering of Q(p) Lagrange elements (continuous or discontinuous) with one or more
/// components.
#[derive(Debug, Clone)]
pub struct DofHandler<const DIM: usize> {
    degree: usize,
    n_components: usize,
    continuous: bool,
    mesh_generation: u64,
    active: CellNodeTable,
    level: Option<Vec<CellNodeTable>>,
}

impl<const DIM: usize> DofHandler<DIM> {
    /// Distributes continuous Q(p) DoFs on the active cells of the mesh.
    pub fn new<const SPACEDIM: usize>(mesh: &dyn MeshView<DIM, SPACEDIM>, degree: usize, n_components: usize) -> Self {
        Self::distribute(mesh, degree, n_components, true)
    }

    /// Distributes discontinuous Q(p) DoFs, i.e. every cell has its own set of nodes.
    pub fn new_discontinuous<const SPACEDIM: usize>(
        mesh: &dyn MeshView<DIM, SPACEDIM>,
        degree: usize,
        n_components: usize,
    ) -> Self {
        Self::distribute(mesh, degree, n_components, false)
    }

    fn distribute<const SPACEDIM: usize>(
        mesh: &dyn MeshView<DIM, SPACEDIM>,
        degree: usize,
        n_components: usize,
        continuous: bool,
    ) -> Self {
        assert!(n_components > 0, "need at least one component");
        let cells = mesh.active_cells();
        let mut active = number_cells(mesh, &cells, degree, continuous, |cell| mesh.true_subdomain_id(cell));
        if !mesh.supports_distributed_ownership() {
            active.owned = 0..active.n_nodes;
        }
        Self {
            degree,
            n_components,
            continuous,
            mesh_generation: mesh.generation(),
            active,
            level: None,
        }
    }

    /// Additionally numbers the nodes of all cells of each level, as needed by multigrid.
    pub fn distribute_level_dofs<const SPACEDIM: usize>(&mut self, mesh: &dyn MeshView<DIM, SPACEDIM>) {
        let levels = (0..mesh.n_levels())
            .map(|level| {
                let cells = (0..mesh.n_cells_on_level(level))
                    .map(|index| CellHandle::new(level, index))
                    .collect_vec();
                let mut table = number_cells(mesh, &cells, self.degree, self.continuous, |cell| {
                    mesh.level_subdomain_id(cell)
                });
                if !mesh.supports_distributed_ownership() {
                    table.owned = 0..table.n_nodes;
                }
                table
            })
            .collect();
        self.level = Some(levels);
    }

    pub fn nodes_per_cell(&self) -> usize {
        (self.degree + 1).pow(DIM as u32)
    }

    pub fn memory_consumption(&self) -> usize {
        let level_data: usize = self
            .level
            .iter()
            .flatten()
            .map(CellNodeTable::memory_consumption)
            .sum();
        size_of::<Self>() + self.active.memory_consumption() + level_data
    }

    fn level_table(&self, level: usize) -> &CellNodeTable {
        let levels = self
            .level
            .as_ref()
            .expect("level DoFs have not been distributed");
        &levels[level]
    }

    fn expand_components(&self, nodes: &[usize], indices: &mut Vec<usize>) {
        debug_assert!(nodes.iter().all(|n| *n != usize::MAX), "cell has no DoFs");
        indices.clear();
        for c in 0..self.n_components {
            indices.extend(nodes.iter().map(|node| node * self.n_components + c));
        }
    }
}

/// Numbers the nodes of the given cells and renumbers them so that each subdomain owns a
/// contiguous range. Within a subdomain, nodes keep the order in which they were first seen.
///
/// The owner of a node shared by several cells is the smallest owner among those cells.
fn number_cells<const DIM: usize, const SPACEDIM: usize>(
    mesh: &dyn MeshView<DIM, SPACEDIM>,
    cells: &[CellHandle],
    degree: usize,
    continuous: bool,
    owner_of: impl Fn(CellHandle) -> SubdomainId,
) -> CellNodeTable {
    let nodes_per_cell = (degree + 1).pow(DIM as u32);
    let hierarchic_to_lex = hierarchic_to_lexicographic_numbering(DIM, degree);

    let mut keys: FxHashMap<NodeKey, usize> = FxHashMap::default();
    let mut node_owners: Vec<SubdomainId> = Vec::new();
    let mut levels: Vec<Vec<usize>> = (0..mesh.n_levels())
        .map(|level| vec![usize::MAX; mesh.n_cells_on_level(level) * nodes_per_cell])
        .collect();

    for &cell in cells {
        let cell_owner = owner_of(cell);
        let vertex_indices: Vec<usize> = (0..vertices_per_cell(DIM))
            .map(|v| mesh.vertex_index(cell, v))
            .collect();
        let start = cell.index * nodes_per_cell;
        for (i, &lex) in hierarchic_to_lex.iter().enumerate() {
            let node = if continuous {
                let key = node_key::<DIM>(lex, degree, &vertex_indices);
                let next = node_owners.len();
                let node = *keys.entry(key).or_insert(next);
                if node == next {
                    node_owners.push(cell_owner);
                }
                node
            } else {
                node_owners.push(cell_owner);
                node_owners.len() - 1
            };
            node_owners[node] = node_owners[node].min(cell_owner);
            levels[cell.level][start + i] = node;
        }
    }

    // Stable renumbering by owner
    let n_nodes = node_owners.len();
    let order = (0..n_nodes)
        .sorted_by_key(|node| node_owners[*node])
        .collect_vec();
    let mut new_index = vec![0; n_nodes];
    for (new, old) in order.iter().enumerate() {
        new_index[*old] = new;
    }
    for level in &mut levels {
        for node in level.iter_mut().filter(|n| **n != usize::MAX) {
            *node = new_index[*node];
        }
    }

    let local_owner = mesh.locally_owned_subdomain();
    let owned_begin = order.partition_point(|node| node_owners[*node] < local_owner);
    let owned_end = order.partition_point(|node| node_owners[*node] <= local_owner);

    CellNodeTable {
        levels,
        n_nodes,
        owned: owned_begin..owned_end,
    }
}

/// Computes the key of the lattice point with lexicographic index `lex`.
fn node_key<const DIM: usize>(lex: usize, degree: usize, vertex_indices: &[usize]) -> NodeKey {
    let multi_index: [usize; DIM] = unravel_index(lex, degree + 1);
    let mut interior_mask = 0;
    let mut base_vertex = 0;
    for d in 0..DIM {
        if multi_index[d] == degree {
            base_vertex |= 1 << d;
        } else if multi_index[d] != 0 {
            interior_mask |= 1 << d;
        }
    }
    let corners = (0..vertices_per_cell(DIM))
        .filter(|v| v & !interior_mask == base_vertex)
        .map(|v| vertex_indices[v])
        .sorted()
        .collect();
    // Orient each interior direction from the smaller to the larger vertex index
    let position = (0..DIM)
        .filter(|d| interior_mask & (1 << d) != 0)
        .map(|d| {
            let lower = vertex_indices[base_vertex];
            let upper = vertex_indices[base_vertex | (1 << d)];
            if lower < upper {
                multi_index[d]
            } else {
                degree - multi_index[d]
            }
        })
        .collect();
    (corners, position)
}

impl<const DIM: usize> DofNumbering for DofHandler<DIM> {
    fn n_components(&self) -> usize {
        self.n_components
    }

    fn degree(&self) -> usize {
        self.degree
    }

    fn is_continuous(&self) -> bool {
        self.continuous
    }

    fn mesh_generation(&self) -> u64 {
        self.mesh_generation
    }

    fn dofs_per_cell(&self) -> usize {
        self.nodes_per_cell() * self.n_components
    }

    fn n_dofs(&self) -> usize {
        self.active.n_nodes * self.n_components
    }

    fn locally_owned_dofs(&self) -> Range<usize> {
        self.active.owned.start * self.n_components..self.active.owned.end * self.n_components
    }

    fn cell_dof_indices(&self, cell: CellHandle, indices: &mut Vec<usize>) {
        let nodes = self.active.cell_nodes(cell, self.nodes_per_cell());
        self.expand_components(nodes, indices);
    }

    fn has_level_dofs(&self) -> bool {
        self.level.is_some()
    }

    fn n_level_dofs(&self, level: usize) -> usize {
        self.level_table(level).n_nodes * self.n_components
    }

    fn locally_owned_level_dofs(&self, level: usize) -> Range<usize> {
        let owned = &self.level_table(level).owned;
        owned.start * self.n_components..owned.end * self.n_components
    }

    fn level_cell_dof_indices(&self, cell: CellHandle, indices: &mut Vec<usize>) {
        let nodes = self
            .level_table(cell.level)
            .cell_nodes(cell, self.nodes_per_cell());
        self.expand_components(nodes, indices);
    }
}

/// Describes the locally owned index range of a distributed vector together with the ghost
/// indices that are read or written locally.
///
/// Local indices run over the owned range first and then over the ghosts in ascending global
/// order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Partitioner {
    size: usize,
    owned: Range<usize>,
    ghosts: Vec<usize>,
}

impl Partitioner {
    /// Creates a partitioner. Ghost indices inside the owned range are dropped and duplicates
    /// removed.
    pub fn new(size: usize, owned: Range<usize>, ghosts: impl IntoIterator<Item = usize>) -> Self {
        assert!(owned.end <= size, "owned range exceeds global size");
        let ghosts = ghosts
            .into_iter()
            .filter(|g| !owned.contains(g))
            .sorted_unstable()
            .dedup()
            .collect_vec();
        assert!(ghosts.last().map(|g| *g < size).unwrap_or(true), "ghost index out of bounds");
        Self { size, owned, ghosts }
    }

    /// The global size of the vector.
    pub fn size(&self) -> usize {
        self.size
    }

    pub fn locally_owned_range(&self) -> Range<usize> {
        self.owned.clone()
    }

    pub fn n_locally_owned(&self) -> usize {
        self.owned.len()
    }

    pub fn ghost_indices(&self) -> &[usize] {
        &self.ghosts
    }

    pub fn n_ghosts(&self) -> usize {
        self.ghosts.len()
    }

    /// Number of owned and ghost entries, i.e. the length of a local vector.
    pub fn local_size(&self) -> usize {
        self.n_locally_owned() + self.n_ghosts()
    }

    pub fn is_ghost(&self, global: usize) -> bool {
        self.ghosts.binary_search(&global).is_ok()
    }

    pub fn is_locally_owned(&self, global: usize) -> bool {
        self.owned.contains(&global)
    }

    pub fn global_to_local(&self, global: usize) -> Option<usize> {
        if self.owned.contains(&global) {
            Some(global - self.owned.start)
        } else {
            self.ghosts
                .binary_search(&global)
                .ok()
                .map(|position| self.n_locally_owned() + position)
        }
    }

    pub fn local_to_global(&self, local: usize) -> usize {
        let n_owned = self.n_locally_owned();
        if local < n_owned {
            self.owned.start + local
        } else {
            self.ghosts[local - n_owned]
        }
    }

    pub fn memory_consumption(&self) -> usize {
        size_of::<Self>() + self.ghosts.capacity() * size_of::<usize>()
    }
}
