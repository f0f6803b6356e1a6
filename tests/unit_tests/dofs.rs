use itertools::Itertools;
use matfree::dofs::{DofHandler, DofNumbering, Partitioner};
use matfree::mesh::procedural::{create_subdivided_hyper_rectangle, create_unit_hypercube_mesh};
use matfree::mesh::{CellHandle, MeshView};
use nalgebra::Point2;
use std::collections::BTreeSet;

fn cell_dofs(dofs: &dyn DofNumbering, cell: CellHandle) -> Vec<usize> {
    let mut indices = Vec::new();
    dofs.cell_dof_indices(cell, &mut indices);
    indices
}

#[test]
fn continuous_dof_counts() {
    let square = create_unit_hypercube_mesh::<2>(2);
    for degree in 1..=4 {
        let dofs = DofHandler::new(&square, degree, 1);
        assert_eq!(dofs.n_dofs(), (2 * degree + 1).pow(2));
        assert_eq!(dofs.dofs_per_cell(), (degree + 1).pow(2));
        assert_eq!(dofs.locally_owned_dofs(), 0..dofs.n_dofs());
    }

    let mut cube = create_unit_hypercube_mesh::<3>(1);
    cube.refine_global(1);
    let dofs = DofHandler::new(&cube, 3, 1);
    assert_eq!(dofs.n_dofs(), 7usize.pow(3));
}

#[test]
fn vector_valued_dofs_interleave_components() {
    let mesh = create_subdivided_hyper_rectangle(&Point2::new(0.0, 0.0), &Point2::new(3.0, 1.0), [3, 1]);
    let dofs = DofHandler::new(&mesh, 2, 3);
    assert_eq!(dofs.n_components(), 3);
    assert_eq!(dofs.n_dofs(), 3 * 7 * 3);
    assert_eq!(dofs.dofs_per_cell(), 27);

    let indices = cell_dofs(&dofs, CellHandle::new(0, 1));
    for (c, block) in indices.chunks(9).enumerate() {
        assert!(block.iter().all(|i| i % 3 == c));
    }
    // Blocks of different components refer to the same nodes
    assert_eq!(
        indices[0..9].iter().map(|i| i / 3).collect_vec(),
        indices[9..18].iter().map(|i| i / 3).collect_vec()
    );
}

#[test]
fn neighbors_share_the_dofs_on_their_common_face() {
    let mesh = create_unit_hypercube_mesh::<2>(2);
    for degree in 1..=3 {
        let dofs = DofHandler::new(&mesh, degree, 1);
        let left: BTreeSet<_> = cell_dofs(&dofs, CellHandle::new(0, 0)).into_iter().collect();
        let right: BTreeSet<_> = cell_dofs(&dofs, CellHandle::new(0, 1)).into_iter().collect();
        let diagonal: BTreeSet<_> = cell_dofs(&dofs, CellHandle::new(0, 3)).into_iter().collect();
        assert_eq!(left.intersection(&right).count(), degree + 1);
        assert_eq!(left.intersection(&diagonal).count(), 1);
    }
}

#[test]
fn discontinuous_cells_share_nothing() {
    let mesh = create_unit_hypercube_mesh::<2>(3);
    let dofs = DofHandler::new_discontinuous(&mesh, 2, 2);
    assert!(!dofs.is_continuous());
    assert_eq!(dofs.n_dofs(), 9 * 9 * 2);

    let all = mesh
        .active_cells()
        .into_iter()
        .flat_map(|cell| cell_dofs(&dofs, cell))
        .collect_vec();
    assert_eq!(all.len(), dofs.n_dofs());
    assert!(all.iter().all_unique());
}

#[test]
fn ownership_follows_the_smallest_subdomain() {
    let mut mesh = create_unit_hypercube_mesh::<2>(2);
    mesh.partition(2);

    mesh.set_locally_owned_subdomain(0, false);
    let first = DofHandler::new(&mesh, 1, 1);
    mesh.set_locally_owned_subdomain(1, false);
    let second = DofHandler::new(&mesh, 1, 1);

    // Cells 0 and 1 form the lower row. The interface nodes at y = 0.5 belong to subdomain 0.
    assert_eq!(first.locally_owned_dofs(), 0..6);
    assert_eq!(second.locally_owned_dofs(), 6..9);
    assert_eq!(first.n_dofs(), second.n_dofs());

    let upper_cell = cell_dofs(&second, CellHandle::new(0, 2));
    let owned = second.locally_owned_dofs();
    assert_eq!(upper_cell.iter().filter(|i| owned.contains(i)).count(), 2);
}

#[test]
fn numbering_remembers_the_mesh_generation() {
    let mut mesh = create_unit_hypercube_mesh::<2>(1);
    let dofs = DofHandler::new(&mesh, 1, 1);
    assert_eq!(dofs.mesh_generation(), mesh.generation());
    mesh.refine_global(1);
    assert_ne!(dofs.mesh_generation(), mesh.generation());
}

#[test]
fn level_dofs_number_every_level() {
    let mut mesh = create_unit_hypercube_mesh::<2>(1);
    mesh.refine_global(1);
    let mut dofs = DofHandler::new(&mesh, 1, 1);
    assert!(!dofs.has_level_dofs());

    dofs.distribute_level_dofs(&mesh);
    assert!(dofs.has_level_dofs());
    assert_eq!(dofs.n_level_dofs(0), 4);
    assert_eq!(dofs.n_level_dofs(1), 9);
    assert_eq!(dofs.locally_owned_level_dofs(1), 0..9);

    let mut indices = Vec::new();
    dofs.level_cell_dof_indices(CellHandle::new(0, 0), &mut indices);
    assert_eq!(indices.iter().copied().sorted().collect_vec(), vec![0, 1, 2, 3]);
    dofs.level_cell_dof_indices(CellHandle::new(1, 3), &mut indices);
    assert!(indices.iter().all(|i| *i < 9));
}

#[test]
fn partitioner_maps_between_global_and_local_indices() {
    let partitioner = Partitioner::new(10, 3..6, [1, 8, 4, 1]);
    assert_eq!(partitioner.size(), 10);
    assert_eq!(partitioner.ghost_indices(), &[1, 8]);
    assert_eq!(partitioner.n_locally_owned(), 3);
    assert_eq!(partitioner.local_size(), 5);

    assert_eq!(partitioner.global_to_local(4), Some(1));
    assert_eq!(partitioner.global_to_local(1), Some(3));
    assert_eq!(partitioner.global_to_local(8), Some(4));
    assert_eq!(partitioner.global_to_local(0), None);
    for local in 0..partitioner.local_size() {
        let global = partitioner.local_to_global(local);
        assert_eq!(partitioner.global_to_local(global), Some(local));
    }

    assert!(partitioner.is_ghost(8));
    assert!(!partitioner.is_ghost(4));
    assert!(partitioner.is_locally_owned(5));
    assert!(!partitioner.is_locally_owned(6));
}
