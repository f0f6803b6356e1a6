//! Hierarchical hypercube meshes and the view the matrix-free machinery consumes.
//!
//! Cells are addressed by [`CellHandle`]s, i.e. `(level, index)` pairs. Handles do not own
//! anything: they stay meaningful only while the mesh they were obtained from is unchanged.
//! Every structural change bumps the mesh [generation](MeshView::generation), which lets
//! derived structures detect that they are stale.
//!
//! Reference cell conventions (for all `D`):
//! - vertex `v` sits at the reference coordinates given by the bits of `v`, i.e. coordinate
//!   `d` is `(v >> d) & 1`;
//! - face `2d + s` is the face normal to direction `d` at reference coordinate `s`;
//! - child `c` of a refined cell occupies the sub-box whose lower corner has coordinate
//!   `0.5 * ((c >> d) & 1)` in direction `d`.
use itertools::Itertools;
use nalgebra::Point;
use rustc_hash::{FxHashMap, FxHashSet};
use serde::{Deserialize, Serialize};

pub mod procedural;

pub type SubdomainId = u32;
pub type BoundaryId = u32;

/// Subdomain id used to mean "no particular subdomain", e.g. for serial meshes.
pub const INVALID_SUBDOMAIN_ID: SubdomainId = SubdomainId::MAX;

/// Subdomain id of cells whose owner is not known to the local process.
pub const ARTIFICIAL_SUBDOMAIN_ID: SubdomainId = SubdomainId::MAX - 1;

/// Identifies a cell in a hierarchical mesh by its refinement level and index on that level.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CellHandle {
    pub level: usize,
    pub index: usize,
}

impl CellHandle {
    pub fn new(level: usize, index: usize) -> Self {
        Self { level, index }
    }
}

pub const fn vertices_per_cell(dim: usize) -> usize {
    1 << dim
}

pub const fn faces_per_cell(dim: usize) -> usize {
    2 * dim
}

pub const fn max_children_per_cell(dim: usize) -> usize {
    1 << dim
}

/// Read-only access to a hierarchical mesh of hypercube cells.
///
/// `DIM` is the dimension of the cells, `SPACEDIM` the dimension of the space they live in.
pub trait MeshView<const DIM: usize, const SPACEDIM: usize>: Sync {
    /// A counter that changes whenever the mesh structure changes.
    fn generation(&self) -> u64;

    fn n_levels(&self) -> usize;

    fn n_cells_on_level(&self, level: usize) -> usize;

    fn vertex(&self, cell: CellHandle, local_vertex: usize) -> Point<f64, SPACEDIM>;

    /// A global identifier of the vertex, shared by all cells touching it.
    fn vertex_index(&self, cell: CellHandle, local_vertex: usize) -> usize;

    fn has_children(&self, cell: CellHandle) -> bool;

    /// The `i`-th child of a refined cell.
    fn child(&self, cell: CellHandle, i: usize) -> CellHandle;

    fn parent(&self, cell: CellHandle) -> Option<CellHandle>;

    /// The neighbor across the given face.
    ///
    /// The neighbor is on the same level as `cell` if such a cell exists, otherwise it is the
    /// (active) coarser cell covering the face. Returns `None` at the boundary.
    fn neighbor(&self, cell: CellHandle, face: usize) -> Option<CellHandle>;

    fn boundary_id(&self, cell: CellHandle, face: usize) -> BoundaryId;

    fn subdomain_id(&self, cell: CellHandle) -> SubdomainId;

    fn level_subdomain_id(&self, cell: CellHandle) -> SubdomainId;

    /// The owner of the cell, also for cells that are artificial in this view.
    fn true_subdomain_id(&self, cell: CellHandle) -> SubdomainId {
        self.subdomain_id(cell)
    }

    /// Whether cell ownership is split among several subdomains.
    ///
    /// If `false`, every cell is considered locally owned.
    fn supports_distributed_ownership(&self) -> bool;

    /// The subdomain owned by the local process.
    fn locally_owned_subdomain(&self) -> SubdomainId;

    fn is_active(&self, cell: CellHandle) -> bool {
        !self.has_children(cell)
    }

    fn is_locally_owned(&self, cell: CellHandle) -> bool {
        !self.supports_distributed_ownership() || self.subdomain_id(cell) == self.locally_owned_subdomain()
    }

    fn is_locally_owned_on_level(&self, cell: CellHandle) -> bool {
        !self.supports_distributed_ownership()
            || self.level_subdomain_id(cell) == self.locally_owned_subdomain()
    }

    fn is_artificial(&self, cell: CellHandle) -> bool {
        self.subdomain_id(cell) == ARTIFICIAL_SUBDOMAIN_ID
    }

    /// The local number of the face through which the neighbor sees `cell`.
    fn neighbor_face(&self, _cell: CellHandle, face: usize) -> usize {
        face ^ 1
    }

    /// The index of `cell` among the children of its parent.
    fn child_index(&self, cell: CellHandle) -> Option<usize> {
        let parent = self.parent(cell)?;
        (0..max_children_per_cell(DIM)).find(|i| self.child(parent, *i) == cell)
    }

    fn vertices(&self, cell: CellHandle) -> Vec<Point<f64, SPACEDIM>> {
        (0..vertices_per_cell(DIM))
            .map(|v| self.vertex(cell, v))
            .collect()
    }

    /// The length of the longest diagonal of the cell.
    fn diameter(&self, cell: CellHandle) -> f64 {
        let n = vertices_per_cell(DIM);
        (0..n / 2)
            .map(|v| (self.vertex(cell, v) - self.vertex(cell, (n - 1) ^ v)).norm())
            .fold(0.0, f64::max)
    }

    /// All active cells in hierarchical (depth-first) order.
    fn active_cells(&self) -> Vec<CellHandle> {
        fn visit<const DIM: usize, const SPACEDIM: usize, M: MeshView<DIM, SPACEDIM> + ?Sized>(
            mesh: &M,
            cell: CellHandle,
            out: &mut Vec<CellHandle>,
        ) {
            if mesh.has_children(cell) {
                for i in 0..max_children_per_cell(DIM) {
                    visit(mesh, mesh.child(cell, i), out);
                }
            } else {
                out.push(cell);
            }
        }

        let mut cells = Vec::new();
        for index in 0..self.n_cells_on_level(0) {
            visit(self, CellHandle::new(0, index), &mut cells);
        }
        cells
    }
}

#[derive(Debug, Clone)]
struct CellData {
    vertices: Vec<usize>,
    parent: Option<usize>,
    first_child: Option<usize>,
    neighbors: Vec<Option<CellHandle>>,
    boundary_ids: Vec<BoundaryId>,
    subdomain_id: SubdomainId,
    true_subdomain_id: SubdomainId,
    level_subdomain_id: SubdomainId,
}

/// A mesh of hypercube cells with a refinement hierarchy.
///
/// The coarse cells must be consistently oriented: two cells sharing a face must see it with
/// the same axis directions. Meshes from [`procedural`] satisfy this.
///
/// Ownership follows a "shared" model: every process holds the entire mesh and cells carry
/// the id of the subdomain owning them. The local subdomain is set with
/// [`set_locally_owned_subdomain`](Self::set_locally_owned_subdomain).
#[derive(Debug, Clone)]
pub struct HierarchicalMesh<const DIM: usize, const SPACEDIM: usize> {
    vertices: Vec<Point<f64, SPACEDIM>>,
    levels: Vec<Vec<CellData>>,
    // Vertices created by refinement, keyed by the sorted vertices they are the average of
    refinement_vertices: FxHashMap<Vec<usize>, usize>,
    locally_owned_subdomain: SubdomainId,
    distributed: bool,
    generation: u64,
}

/// Error produced when a coarse mesh cannot be constructed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MeshError {
    InvalidVertexCount { cell: usize, found: usize, expected: usize },
    VertexOutOfBounds { cell: usize, vertex: usize },
    NonManifoldFace { cells: Vec<usize> },
}

impl std::fmt::Display for MeshError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidVertexCount { cell, found, expected } => {
                write!(f, "Cell {cell} has {found} vertices, expected {expected}")
            }
            Self::VertexOutOfBounds { cell, vertex } => {
                write!(f, "Cell {cell} references non-existent vertex {vertex}")
            }
            Self::NonManifoldFace { cells } => {
                write!(f, "A face is shared by more than two cells: {cells:?}")
            }
        }
    }
}

impl std::error::Error for MeshError {}

fn face_vertices(dim: usize, face: usize) -> impl Iterator<Item = usize> {
    let direction = face / 2;
    let side = face % 2;
    (0..vertices_per_cell(dim)).filter(move |v| (v >> direction) & 1 == side)
}

impl<const DIM: usize, const SPACEDIM: usize> HierarchicalMesh<DIM, SPACEDIM> {
    /// Constructs a mesh from coarse cells given by their vertices in reference order.
    pub fn from_coarse_cells(vertices: Vec<Point<f64, SPACEDIM>>, cells: Vec<Vec<usize>>) -> Result<Self, MeshError> {
        assert!(DIM >= 1 && DIM <= 3 && SPACEDIM >= DIM && SPACEDIM <= 3);
        let n_faces = faces_per_cell(DIM);
        let mut face_map: FxHashMap<Vec<usize>, Vec<(usize, usize)>> = FxHashMap::default();
        for (cell_idx, cell) in cells.iter().enumerate() {
            if cell.len() != vertices_per_cell(DIM) {
                return Err(MeshError::InvalidVertexCount {
                    cell: cell_idx,
                    found: cell.len(),
                    expected: vertices_per_cell(DIM),
                });
            }
            if let Some(&vertex) = cell.iter().find(|v| **v >= vertices.len()) {
                return Err(MeshError::VertexOutOfBounds { cell: cell_idx, vertex });
            }
            for face in 0..n_faces {
                let key: Vec<usize> = face_vertices(DIM, face).map(|v| cell[v]).sorted().collect();
                face_map.entry(key).or_default().push((cell_idx, face));
            }
        }

        let mut level0: Vec<CellData> = cells
            .into_iter()
            .map(|vertices| CellData {
                vertices,
                parent: None,
                first_child: None,
                neighbors: vec![None; n_faces],
                boundary_ids: vec![0; n_faces],
                subdomain_id: 0,
                true_subdomain_id: 0,
                level_subdomain_id: 0,
            })
            .collect();

        for sharing_cells in face_map.values() {
            match sharing_cells.as_slice() {
                [_] => {}
                [(c0, f0), (c1, f1)] => {
                    level0[*c0].neighbors[*f0] = Some(CellHandle::new(0, *c1));
                    level0[*c1].neighbors[*f1] = Some(CellHandle::new(0, *c0));
                }
                _ => {
                    return Err(MeshError::NonManifoldFace {
                        cells: sharing_cells.iter().map(|(c, _)| *c).collect(),
                    })
                }
            }
        }

        Ok(Self {
            vertices,
            levels: vec![level0],
            refinement_vertices: FxHashMap::default(),
            locally_owned_subdomain: INVALID_SUBDOMAIN_ID,
            distributed: false,
            generation: 0,
        })
    }

    fn cell_data(&self, cell: CellHandle) -> &CellData {
        &self.levels[cell.level][cell.index]
    }

    fn cell_data_mut(&mut self, cell: CellHandle) -> &mut CellData {
        &mut self.levels[cell.level][cell.index]
    }

    pub fn vertex_positions(&self) -> &[Point<f64, SPACEDIM>] {
        &self.vertices
    }

    /// Global vertex indices of the cell in reference order.
    pub fn cell_vertex_indices(&self, cell: CellHandle) -> &[usize] {
        &self.cell_data(cell).vertices
    }

    /// Moves a vertex. Cells sharing the vertex move with it.
    pub fn set_vertex_position(&mut self, vertex: usize, position: Point<f64, SPACEDIM>) {
        self.vertices[vertex] = position;
        self.generation += 1;
    }

    pub fn n_active_cells(&self) -> usize {
        self.levels
            .iter()
            .map(|level| level.iter().filter(|c| c.first_child.is_none()).count())
            .sum()
    }

    /// Assigns boundary id `f` to every boundary face with local face number `f`.
    pub fn colorize_boundary(&mut self) {
        for level in &mut self.levels {
            for cell in level {
                for (face, id) in cell.boundary_ids.iter_mut().enumerate() {
                    *id = face as BoundaryId;
                }
            }
        }
    }

    pub fn set_boundary_id(&mut self, cell: CellHandle, face: usize, id: BoundaryId) {
        self.cell_data_mut(cell).boundary_ids[face] = id;
    }

    fn refinement_vertex(&mut self, corners: Vec<usize>) -> usize {
        if corners.len() == 1 {
            return corners[0];
        }
        let key: Vec<usize> = corners.into_iter().sorted().collect();
        if let Some(&vertex) = self.refinement_vertices.get(&key) {
            return vertex;
        }
        let mut coords = nalgebra::SVector::<f64, SPACEDIM>::zeros();
        for &v in &key {
            coords += self.vertices[v].coords;
        }
        coords /= key.len() as f64;
        self.vertices.push(Point::from(coords));
        let vertex = self.vertices.len() - 1;
        self.refinement_vertices.insert(key, vertex);
        vertex
    }

    /// Refines an active cell into `2^DIM` children.
    pub fn refine_cell(&mut self, cell: CellHandle) {
        assert!(self.cell_data(cell).first_child.is_none(), "cell {cell:?} is already refined");
        let n_vertices = vertices_per_cell(DIM);
        let n_faces = faces_per_cell(DIM);
        let parent_vertices = self.cell_data(cell).vertices.clone();

        // Vertices of the 3^DIM lattice spanned by the refined cell
        let n_lattice = 3usize.pow(DIM as u32);
        let lattice: Vec<usize> = (0..n_lattice)
            .map(|t| {
                let mut corners = vec![0usize];
                let mut remainder = t;
                for d in 0..DIM {
                    let t_d = remainder % 3;
                    remainder /= 3;
                    corners = match t_d {
                        0 => corners,
                        2 => corners.into_iter().map(|v| v | (1 << d)).collect(),
                        _ => corners.into_iter().flat_map(|v| [v, v | (1 << d)]).collect(),
                    };
                }
                corners.iter().map(|v| parent_vertices[*v]).collect::<Vec<_>>()
            })
            .collect::<Vec<_>>()
            .into_iter()
            .map(|corners| self.refinement_vertex(corners))
            .collect();

        let child_level = cell.level + 1;
        if self.levels.len() <= child_level {
            self.levels.push(Vec::new());
        }
        let first_child = self.levels[child_level].len();
        let parent_data = self.cell_data(cell).clone();

        for c in 0..max_children_per_cell(DIM) {
            let vertices = (0..n_vertices)
                .map(|v| {
                    let mut t = 0;
                    let mut stride = 1;
                    for d in 0..DIM {
                        t += (((c >> d) & 1) + ((v >> d) & 1)) * stride;
                        stride *= 3;
                    }
                    lattice[t]
                })
                .collect();
            self.levels[child_level].push(CellData {
                vertices,
                parent: Some(cell.index),
                first_child: None,
                neighbors: vec![None; n_faces],
                boundary_ids: parent_data.boundary_ids.clone(),
                subdomain_id: parent_data.subdomain_id,
                true_subdomain_id: parent_data.true_subdomain_id,
                level_subdomain_id: parent_data.level_subdomain_id,
            });
        }
        self.cell_data_mut(cell).first_child = Some(first_child);

        for c in 0..max_children_per_cell(DIM) {
            let child = CellHandle::new(child_level, first_child + c);
            for face in 0..n_faces {
                let direction = face / 2;
                let side = face % 2;
                let neighbor = if (c >> direction) & 1 != side {
                    Some(CellHandle::new(child_level, first_child + (c ^ (1 << direction))))
                } else {
                    match parent_data.neighbors[face] {
                        None => None,
                        Some(n) if n.level == cell.level => {
                            let neighbor_first_child = self.cell_data(n).first_child;
                            match neighbor_first_child {
                                Some(n_first_child) => {
                                    let mirrored = CellHandle::new(child_level, n_first_child + (c ^ (1 << direction)));
                                    self.set_neighbor_recursively(mirrored, face ^ 1, child);
                                    Some(mirrored)
                                }
                                None => Some(n),
                            }
                        }
                        Some(coarser) => Some(coarser),
                    }
                };
                self.cell_data_mut(child).neighbors[face] = neighbor;
            }
        }

        self.generation += 1;
    }

    /// Points `cell` and its descendants adjacent to `face` at `neighbor`.
    fn set_neighbor_recursively(&mut self, cell: CellHandle, face: usize, neighbor: CellHandle) {
        self.cell_data_mut(cell).neighbors[face] = Some(neighbor);
        if let Some(first_child) = self.cell_data(cell).first_child {
            let direction = face / 2;
            let side = face % 2;
            for c in 0..max_children_per_cell(DIM) {
                if (c >> direction) & 1 == side {
                    self.set_neighbor_recursively(CellHandle::new(cell.level + 1, first_child + c), face, neighbor);
                }
            }
        }
    }

    /// Refines every active cell once.
    pub fn refine_global(&mut self, times: usize) {
        for _ in 0..times {
            for cell in self.active_cells() {
                self.refine_cell(cell);
            }
        }
    }

    /// Splits the active cells into `n_subdomains` contiguous chunks of the hierarchical order
    /// and assigns subdomain ids accordingly.
    ///
    /// Level subdomain ids are assigned bottom-up: a refined cell belongs to the smallest level
    /// subdomain id among its children.
    pub fn partition(&mut self, n_subdomains: usize) {
        assert!(n_subdomains > 0, "need at least one subdomain");
        let active = self.active_cells();
        let n_active = active.len();
        for (position, cell) in active.into_iter().enumerate() {
            let owner = (position * n_subdomains / n_active.max(1)) as SubdomainId;
            let data = self.cell_data_mut(cell);
            data.subdomain_id = owner;
            data.true_subdomain_id = owner;
            data.level_subdomain_id = owner;
        }
        for level in (0..self.levels.len().saturating_sub(1)).rev() {
            for index in 0..self.levels[level].len() {
                if let Some(first_child) = self.levels[level][index].first_child {
                    let owner = (0..max_children_per_cell(DIM))
                        .map(|c| self.levels[level + 1][first_child + c].level_subdomain_id)
                        .min()
                        .unwrap_or(0);
                    self.levels[level][index].level_subdomain_id = owner;
                }
            }
        }
        self.distributed = n_subdomains > 1;
        if self.locally_owned_subdomain == INVALID_SUBDOMAIN_ID {
            self.locally_owned_subdomain = 0;
        }
        self.generation += 1;
    }

    /// Makes this mesh the view of the given subdomain.
    ///
    /// With `allow_artificial_cells`, active cells that neither belong to the subdomain nor
    /// share a vertex with one of its cells are marked artificial.
    pub fn set_locally_owned_subdomain(&mut self, subdomain: SubdomainId, allow_artificial_cells: bool) {
        self.locally_owned_subdomain = subdomain;
        self.distributed = true;
        let active = self.active_cells();
        for cell in &active {
            let data = self.cell_data_mut(*cell);
            data.subdomain_id = data.true_subdomain_id;
        }
        if allow_artificial_cells {
            let halo_vertices: FxHashSet<usize> = active
                .iter()
                .filter(|cell| self.cell_data(**cell).true_subdomain_id == subdomain)
                .flat_map(|cell| self.cell_data(*cell).vertices.iter().copied())
                .collect();
            for cell in &active {
                let data = self.cell_data_mut(*cell);
                let touches_subdomain = data.vertices.iter().any(|v| halo_vertices.contains(v));
                if data.true_subdomain_id != subdomain && !touches_subdomain {
                    data.subdomain_id = ARTIFICIAL_SUBDOMAIN_ID;
                }
            }
        }
        self.generation += 1;
    }
}

impl<const DIM: usize, const SPACEDIM: usize> MeshView<DIM, SPACEDIM> for HierarchicalMesh<DIM, SPACEDIM> {
    fn generation(&self) -> u64 {
        self.generation
    }

    fn n_levels(&self) -> usize {
        self.levels.len()
    }

    fn n_cells_on_level(&self, level: usize) -> usize {
        self.levels.get(level).map(Vec::len).unwrap_or(0)
    }

    fn vertex(&self, cell: CellHandle, local_vertex: usize) -> Point<f64, SPACEDIM> {
        self.vertices[self.cell_data(cell).vertices[local_vertex]]
    }

    fn vertex_index(&self, cell: CellHandle, local_vertex: usize) -> usize {
        self.cell_data(cell).vertices[local_vertex]
    }

    fn has_children(&self, cell: CellHandle) -> bool {
        self.cell_data(cell).first_child.is_some()
    }

    fn child(&self, cell: CellHandle, i: usize) -> CellHandle {
        let first_child = self
            .cell_data(cell)
            .first_child
            .unwrap_or_else(|| panic!("cell {cell:?} has no children"));
        assert!(i < max_children_per_cell(DIM));
        CellHandle::new(cell.level + 1, first_child + i)
    }

    fn parent(&self, cell: CellHandle) -> Option<CellHandle> {
        self.cell_data(cell)
            .parent
            .map(|index| CellHandle::new(cell.level - 1, index))
    }

    fn neighbor(&self, cell: CellHandle, face: usize) -> Option<CellHandle> {
        self.cell_data(cell).neighbors[face]
    }

    fn boundary_id(&self, cell: CellHandle, face: usize) -> BoundaryId {
        self.cell_data(cell).boundary_ids[face]
    }

    fn subdomain_id(&self, cell: CellHandle) -> SubdomainId {
        self.cell_data(cell).subdomain_id
    }

    fn level_subdomain_id(&self, cell: CellHandle) -> SubdomainId {
        self.cell_data(cell).level_subdomain_id
    }

    fn true_subdomain_id(&self, cell: CellHandle) -> SubdomainId {
        self.cell_data(cell).true_subdomain_id
    }

    fn supports_distributed_ownership(&self) -> bool {
        self.distributed
    }

    fn locally_owned_subdomain(&self) -> SubdomainId {
        self.locally_owned_subdomain
    }

    fn child_index(&self, cell: CellHandle) -> Option<usize> {
        let parent = self.parent(cell)?;
        let first_child = self.cell_data(parent).first_child?;
        Some(cell.index - first_child)
    }
}
