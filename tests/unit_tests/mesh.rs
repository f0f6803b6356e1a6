use matfree::cell_batch::{active_cells_behind_face, ghost_cells, resolve_cells};
use matfree::mesh::procedural::{create_reference_cell_mesh, create_unit_hypercube_mesh};
use matfree::mesh::{CellHandle, HierarchicalMesh, MeshError, MeshView};
use matrixcompare::assert_scalar_eq;
use nalgebra::Point2;

fn handles(level: usize, indices: impl IntoIterator<Item = usize>) -> Vec<CellHandle> {
    indices
        .into_iter()
        .map(|index| CellHandle::new(level, index))
        .collect()
}

#[test]
fn coarse_neighbors_of_a_structured_square() {
    let mesh = create_unit_hypercube_mesh::<2>(2);
    assert_eq!(mesh.n_levels(), 1);
    assert_eq!(mesh.n_active_cells(), 4);

    let cell = CellHandle::new(0, 0);
    assert_eq!(mesh.neighbor(cell, 0), None);
    assert_eq!(mesh.neighbor(cell, 1), Some(CellHandle::new(0, 1)));
    assert_eq!(mesh.neighbor(cell, 2), None);
    assert_eq!(mesh.neighbor(cell, 3), Some(CellHandle::new(0, 2)));
    assert_eq!(mesh.neighbor_face(cell, 1), 0);

    assert_scalar_eq!(mesh.diameter(cell), 0.5 * 2f64.sqrt(), comp = abs, tol = 1e-14);
}

#[test]
fn local_refinement_links_fine_cells_to_coarse_neighbors() {
    let mut mesh = create_unit_hypercube_mesh::<2>(2);
    let generation = mesh.generation();
    mesh.refine_cell(CellHandle::new(0, 0));
    assert_ne!(mesh.generation(), generation);

    assert_eq!(mesh.n_levels(), 2);
    assert_eq!(mesh.n_active_cells(), 7);
    let mut expected = handles(1, 0..4);
    expected.extend(handles(0, 1..4));
    assert_eq!(mesh.active_cells(), expected);

    let fine = CellHandle::new(1, 1);
    assert_eq!(mesh.parent(fine), Some(CellHandle::new(0, 0)));
    assert_eq!(mesh.child_index(fine), Some(1));
    assert_eq!(mesh.neighbor(fine, 0), Some(CellHandle::new(1, 0)));
    assert_eq!(mesh.neighbor(fine, 1), Some(CellHandle::new(0, 1)));
    // The coarse cell still sees its refined neighbor on its own level
    assert_eq!(mesh.neighbor(CellHandle::new(0, 1), 0), Some(CellHandle::new(0, 0)));
    assert_eq!(
        active_cells_behind_face(&mesh, CellHandle::new(0, 0), 1),
        handles(1, [1, 3])
    );
}

#[test]
fn refining_neighbors_connects_their_children() {
    let mut mesh = create_unit_hypercube_mesh::<2>(2);
    mesh.refine_cell(CellHandle::new(0, 0));
    mesh.refine_cell(CellHandle::new(0, 1));

    let left = CellHandle::new(1, 1);
    let right = CellHandle::new(1, 4);
    assert_eq!(mesh.neighbor(left, 1), Some(right));
    assert_eq!(mesh.neighbor(right, 0), Some(left));
    // Refinement vertices on the common edge are shared
    assert_eq!(mesh.vertex_index(left, 3), mesh.vertex_index(right, 2));
    let midpoint = mesh.vertex(left, 3);
    assert_scalar_eq!(midpoint.x, 0.5, comp = abs, tol = 1e-14);
    assert_scalar_eq!(midpoint.y, 0.25, comp = abs, tol = 1e-14);
}

#[test]
fn global_refinement_of_a_cube() {
    let mut mesh = create_unit_hypercube_mesh::<3>(1);
    mesh.refine_global(2);
    assert_eq!(mesh.n_levels(), 3);
    assert_eq!(mesh.n_active_cells(), 64);
    assert_eq!(mesh.n_cells_on_level(1), 8);
    // 5^3 lattice points
    assert_eq!(mesh.vertex_positions().len(), 125);
}

#[test]
fn resolving_cells_on_levels() {
    let mut mesh = create_unit_hypercube_mesh::<2>(2);
    mesh.refine_cell(CellHandle::new(0, 0));

    assert_eq!(resolve_cells(&mesh, None).len(), 7);
    assert_eq!(resolve_cells(&mesh, Some(0)), handles(0, 0..4));
    assert_eq!(resolve_cells(&mesh, Some(1)), handles(1, 0..4));
}

#[test]
fn partitioning_splits_ownership_and_finds_ghosts() {
    let mut mesh = create_unit_hypercube_mesh::<2>(2);
    assert!(!mesh.supports_distributed_ownership());
    assert!(ghost_cells(&mesh, &resolve_cells(&mesh, None), None).is_empty());

    mesh.partition(2);
    assert!(mesh.supports_distributed_ownership());
    let subdomains: Vec<_> = mesh
        .active_cells()
        .into_iter()
        .map(|cell| mesh.subdomain_id(cell))
        .collect();
    assert_eq!(subdomains, vec![0, 0, 1, 1]);

    mesh.set_locally_owned_subdomain(1, false);
    let owned = resolve_cells(&mesh, None);
    assert_eq!(owned, handles(0, [2, 3]));
    assert_eq!(ghost_cells(&mesh, &owned, None), handles(0, [0, 1]));
}

#[test]
fn distant_cells_become_artificial() {
    let mut mesh = create_unit_hypercube_mesh::<2>(4);
    mesh.partition(4);
    mesh.set_locally_owned_subdomain(0, true);

    // Subdomain 0 is the lowest row, so the top row shares no vertex with it
    for index in 12..16 {
        assert!(mesh.is_artificial(CellHandle::new(0, index)));
        assert_eq!(mesh.true_subdomain_id(CellHandle::new(0, index)), 3);
    }
    for index in 4..8 {
        assert!(!mesh.is_artificial(CellHandle::new(0, index)));
    }
    let owned = resolve_cells(&mesh, None);
    assert_eq!(owned, handles(0, 0..4));
    assert_eq!(ghost_cells(&mesh, &owned, None), handles(0, 4..8));
}

#[test]
fn reference_cell_is_embedded() {
    let mesh: HierarchicalMesh<2, 3> = create_reference_cell_mesh();
    let top = mesh.vertex(CellHandle::new(0, 0), 3);
    assert_eq!(top.coords.as_slice(), &[1.0, 1.0, 0.0]);
}

#[test]
fn invalid_coarse_cells_are_rejected() {
    let vertices = vec![Point2::new(0.0, 0.0), Point2::new(1.0, 0.0), Point2::new(0.0, 1.0)];
    let result = HierarchicalMesh::<2, 2>::from_coarse_cells(vertices.clone(), vec![vec![0, 1, 2]]);
    assert!(matches!(result, Err(MeshError::InvalidVertexCount { cell: 0, found: 3, expected: 4 })));

    let result = HierarchicalMesh::<2, 2>::from_coarse_cells(vertices, vec![vec![0, 1, 2, 3]]);
    assert!(matches!(result, Err(MeshError::VertexOutOfBounds { cell: 0, vertex: 3 })));
}

#[test]
fn boundary_ids_are_colorized_by_face() {
    let mut mesh = create_unit_hypercube_mesh::<2>(1);
    mesh.colorize_boundary();
    mesh.refine_global(1);
    for face in 0..4 {
        assert_eq!(mesh.boundary_id(CellHandle::new(1, 0), face), face as u32);
    }
}
