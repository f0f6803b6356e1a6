use matfree::constraints::{make_hanging_node_constraints, ConstraintTable};
use matfree::dofs::{DofHandler, DofNumbering};
use matfree::evaluation::CellEvaluator;
use matfree::mapping::{EulerPositionField, Mapping, MappingError, UpdateFlags};
use matfree::matrix_free::{AdditionalData, MatrixFree, SetupError};
use matfree::mesh::procedural::{create_single_cell_mesh, create_subdivided_hyper_rectangle, create_unit_hypercube_mesh};
use matfree::mesh::{CellHandle, HierarchicalMesh, MeshView};
use matfree::quadrature::Quadrature;
use matfree::task::TaskScheme;
use matfree::tensor_product::EvaluationFlags;
use matrixcompare::assert_scalar_eq;
use nalgebra::{Point2, Point3};
use std::collections::BTreeSet;

fn setup<const DIM: usize>(
    mesh: &HierarchicalMesh<DIM, DIM>,
    dofs: &DofHandler<DIM>,
    constraints: &ConstraintTable,
    data: AdditionalData,
) -> Result<MatrixFree<DIM>, SetupError> {
    let numbering: &dyn DofNumbering = dofs;
    let mapping = Mapping::<DIM, DIM>::q1();
    MatrixFree::reinit(
        mesh,
        &mapping,
        &[numbering],
        &[constraints],
        &[Quadrature::gauss(dofs.degree() + 1)],
        data,
    )
}

/// Applies the mass (`mass = true`) or Laplace operator to `src` with a cell loop.
fn apply_operator<const DIM: usize>(matrix_free: &MatrixFree<DIM>, src: &[f64], mass: bool) -> Vec<f64> {
    let flags = if mass {
        EvaluationFlags::VALUES
    } else {
        EvaluationFlags::GRADIENTS
    };
    let mut dst = matrix_free.create_vector(0);
    matrix_free.cell_loop(&mut dst, |matrix_free, dst, range| {
        let mut phi = CellEvaluator::new(matrix_free, 0, 0);
        for batch in range {
            phi.reinit(batch);
            phi.read_dof_values(src);
            phi.evaluate(flags);
            for lane in 0..phi.n_active_lanes() {
                for q in 0..phi.n_q_points() {
                    if mass {
                        let value = phi.get_value(q, lane, 0);
                        phi.submit_value(value, q, lane, 0);
                    } else {
                        let gradient = phi.get_gradient(q, lane, 0);
                        phi.submit_gradient(gradient, q, lane, 0);
                    }
                }
            }
            phi.integrate(flags);
            phi.distribute_local_to_global(dst);
        }
    });
    dst
}

#[test]
fn serial_batches_cover_all_cells_exactly_once() {
    for (n, n_lanes) in [(5, 4), (3, 1), (4, 8), (7, 3)] {
        let mesh = create_unit_hypercube_mesh::<2>(n);
        let dofs = DofHandler::new(&mesh, 1, 1);
        let data = AdditionalData {
            n_lanes,
            ..Default::default()
        };
        let matrix_free = setup(&mesh, &dofs, &ConstraintTable::new(), data).unwrap();

        let n_cells = n * n;
        let n_batches = matrix_free.n_cell_batches();
        assert_eq!(n_batches, (n_cells + n_lanes - 1) / n_lanes);
        assert_eq!(matrix_free.n_ghost_cell_batches(), 0);

        let mut seen = BTreeSet::new();
        for batch in 0..n_batches {
            let n_active = matrix_free.n_active_entries_per_cell_batch(batch);
            if batch + 1 < n_batches {
                assert_eq!(n_active, n_lanes);
            }
            for lane in 0..n_active {
                assert!(seen.insert(matrix_free.cell(batch, lane)));
            }
            // Padding repeats the last active cell
            for lane in n_active..n_lanes {
                assert_eq!(matrix_free.cell(batch, lane), matrix_free.cell(batch, n_active - 1));
            }
        }
        assert_eq!(seen.len(), n_cells);
    }
}

#[test]
fn compressed_rows_are_consistent() {
    let mut mesh = create_unit_hypercube_mesh::<2>(4);
    mesh.partition(2);
    mesh.set_locally_owned_subdomain(1, false);
    let dofs = DofHandler::new(&mesh, 2, 1);
    let matrix_free = setup(&mesh, &dofs, &ConstraintTable::new(), AdditionalData::default()).unwrap();

    let dof_info = matrix_free.dof_info(0);
    let row_starts = dof_info.row_starts();
    assert!(row_starts.windows(2).all(|w| w[0] <= w[1]));
    assert_eq!(*row_starts.last().unwrap(), dof_info.dof_indices().len());

    let partitioner = dof_info.partitioner();
    assert!(partitioner.n_ghosts() > 0);
    for &index in dof_info.dof_indices() {
        assert!(index < partitioner.local_size());
        let global = partitioner.local_to_global(index);
        assert!(partitioner.is_locally_owned(global) || partitioner.is_ghost(global));
    }

    // Boundary cells touch ghost DoFs and are scheduled between the interior parts
    let partition = matrix_free.task_info().cell_partition_data();
    assert!(partition[2] > partition[1]);
    assert_eq!(partition[3], matrix_free.n_cell_batches());
}

#[test]
fn batch_iterator_yields_indices_and_geometry() {
    let mesh = create_unit_hypercube_mesh::<2>(3);
    let dofs = DofHandler::new(&mesh, 1, 1);
    let matrix_free = setup(&mesh, &dofs, &ConstraintTable::new(), AdditionalData::default()).unwrap();

    let mut total_jxw = 0.0;
    let mut n_cells = 0;
    for batch in matrix_free.batches(0, 0) {
        let n_lanes = matrix_free.n_lanes();
        assert_eq!(batch.cells.len(), n_lanes);
        // Four DoFs per active lane, none for padding
        assert_eq!(batch.dof_indices.len(), 4 * batch.n_active_lanes);
        assert_eq!(batch.jxw.len(), 4 * n_lanes);
        for (i, jxw) in batch.jxw.iter().enumerate() {
            if i % n_lanes < batch.n_active_lanes {
                total_jxw += jxw;
            }
        }
        n_cells += batch.n_active_lanes;
    }
    assert_eq!(n_cells, 9);
    assert_scalar_eq!(total_jxw, 1.0, comp = abs, tol = 1e-12);
}

#[test]
fn coloring_separates_conflicting_batches() {
    let mesh = create_unit_hypercube_mesh::<2>(6);
    let dofs = DofHandler::new(&mesh, 1, 1);
    let data = AdditionalData {
        tasks_parallel_scheme: TaskScheme::Color,
        tasks_block_size: 2,
        ..Default::default()
    };
    let matrix_free = setup(&mesh, &dofs, &ConstraintTable::new(), data).unwrap();
    let task_info = matrix_free.task_info();
    let graph = task_info.batch_graph();
    assert!(task_info.n_colors() > 1);

    let mut covered = vec![false; matrix_free.n_cell_batches()];
    for stage in task_info.stages() {
        let batches = stage.iter().cloned().flatten().collect::<Vec<_>>();
        for &a in &batches {
            covered[a] = true;
            for &b in &batches {
                assert!(a == b || !graph.are_adjacent(a, b), "batches {a} and {b} conflict");
            }
        }
        let color = task_info.batch_colors()[batches[0]];
        assert!(batches.iter().all(|&b| task_info.batch_colors()[b] == color));
    }
    assert!(covered.into_iter().all(|c| c));
}

#[test]
fn concurrent_blocks_never_write_the_same_dof_with_hanging_nodes() {
    for scheme in [TaskScheme::Color, TaskScheme::Partition] {
        for n in 2..=4 {
            for refined in 0..n * n {
                let mut mesh = create_unit_hypercube_mesh::<2>(n);
                mesh.refine_cell(CellHandle::new(0, refined));
                let dofs = DofHandler::new(&mesh, 1, 1);
                let constraints = make_hanging_node_constraints(&mesh, &dofs).unwrap();
                let data = AdditionalData {
                    tasks_parallel_scheme: scheme,
                    tasks_block_size: 1,
                    n_lanes: 1,
                    ..Default::default()
                };
                let matrix_free = setup(&mesh, &dofs, &constraints, data).unwrap();
                let dof_info = matrix_free.dof_info(0);

                // Compressed rows hold the resolved targets of constrained DoFs
                let written = |block: &std::ops::Range<usize>| {
                    block
                        .clone()
                        .flat_map(|batch| dof_info.dof_indices()[dof_info.batch_index_range(batch)].iter().copied())
                        .collect::<BTreeSet<_>>()
                };
                for stage in matrix_free.task_info().stages() {
                    for (i, first) in stage.iter().enumerate() {
                        let first_dofs = written(first);
                        for second in &stage[i + 1..] {
                            let common = first_dofs.intersection(&written(second)).count();
                            assert_eq!(
                                common, 0,
                                "{scheme:?} n={n} refined={refined}: blocks {first:?} and {second:?} share DoFs"
                            );
                        }
                    }
                }
            }
        }
    }
}

#[test]
fn hanging_node_operator_matches_serial_with_coloring() {
    let mut mesh = create_unit_hypercube_mesh::<2>(4);
    mesh.refine_cell(CellHandle::new(0, 5));
    let dofs = DofHandler::new(&mesh, 1, 1);
    let constraints = make_hanging_node_constraints(&mesh, &dofs).unwrap();
    let src: Vec<f64> = (0..dofs.n_dofs()).map(|i| (i as f64 * 0.61).cos()).collect();

    let serial = setup(&mesh, &dofs, &constraints, AdditionalData::default()).unwrap();
    let expected = apply_operator(&serial, &src, false);
    let data = AdditionalData {
        tasks_parallel_scheme: TaskScheme::Color,
        tasks_block_size: 1,
        n_lanes: 1,
        ..Default::default()
    };
    let colored = setup(&mesh, &dofs, &constraints, data).unwrap();
    let result = apply_operator(&colored, &src, false);
    for (a, b) in result.iter().zip(&expected) {
        assert_scalar_eq!(*a, *b, comp = abs, tol = 1e-12);
    }
}

#[test]
fn partition_stages_do_not_touch() {
    let mesh = create_unit_hypercube_mesh::<2>(8);
    let dofs = DofHandler::new(&mesh, 1, 1);
    let data = AdditionalData {
        tasks_parallel_scheme: TaskScheme::Partition,
        n_lanes: 2,
        ..Default::default()
    };
    let matrix_free = setup(&mesh, &dofs, &ConstraintTable::new(), data).unwrap();
    let task_info = matrix_free.task_info();
    let graph = task_info.batch_graph();
    assert_eq!(task_info.stages().len(), 2);
    for stage in task_info.stages() {
        for (i, first) in stage.iter().enumerate() {
            for second in &stage[i + 1..] {
                for a in first.clone() {
                    for b in second.clone() {
                        assert!(!graph.are_adjacent(a, b));
                    }
                }
            }
        }
    }
}

#[test]
fn threaded_loop_matches_serial_loop() {
    let mesh = create_unit_hypercube_mesh::<2>(6);
    let dofs = DofHandler::new(&mesh, 2, 1);
    let src: Vec<f64> = (0..dofs.n_dofs()).map(|i| (i as f64 * 0.37).sin()).collect();

    let serial = setup(&mesh, &dofs, &ConstraintTable::new(), AdditionalData::default()).unwrap();
    let expected = apply_operator(&serial, &src, false);
    for scheme in [TaskScheme::Color, TaskScheme::Partition] {
        let data = AdditionalData {
            tasks_parallel_scheme: scheme,
            ..Default::default()
        };
        let threaded = setup(&mesh, &dofs, &ConstraintTable::new(), data).unwrap();
        let result = apply_operator(&threaded, &src, false);
        for (a, b) in result.iter().zip(&expected) {
            assert_scalar_eq!(*a, *b, comp = abs, tol = 1e-12);
        }
    }
}

#[test]
fn mass_operator_integrates_constant() {
    let mesh = create_unit_hypercube_mesh::<3>(2);
    let dofs = DofHandler::new(&mesh, 2, 1);
    let matrix_free = setup(&mesh, &dofs, &ConstraintTable::new(), AdditionalData::default()).unwrap();
    let ones = vec![1.0; dofs.n_dofs()];
    let result = apply_operator(&matrix_free, &ones, true);
    assert_scalar_eq!(result.iter().sum::<f64>(), 1.0, comp = abs, tol = 1e-12);
}

#[test]
fn laplace_operator_annihilates_linear_function_in_interior() {
    let mesh = create_unit_hypercube_mesh::<2>(4);
    let dofs = DofHandler::new(&mesh, 1, 1);
    let positions = EulerPositionField::<2, 2>::interpolate(&mesh, 1, |x| *x);
    // Scalar and vector numberings share the node numbering
    let x: Vec<f64> = (0..dofs.n_dofs())
        .map(|node| positions.values()[2 * node])
        .collect();
    let y: Vec<f64> = (0..dofs.n_dofs())
        .map(|node| positions.values()[2 * node + 1])
        .collect();
    let u: Vec<f64> = x.iter().zip(&y).map(|(x, y)| 2.0 * x - y + 1.0).collect();

    let matrix_free = setup(&mesh, &dofs, &ConstraintTable::new(), AdditionalData::default()).unwrap();
    let result = apply_operator(&matrix_free, &u, false);
    let eps = 1e-12;
    for node in 0..dofs.n_dofs() {
        let interior = x[node] > eps && x[node] < 1.0 - eps && y[node] > eps && y[node] < 1.0 - eps;
        if interior {
            assert_scalar_eq!(result[node], 0.0, comp = abs, tol = 1e-12);
        }
    }
    assert_scalar_eq!(result.iter().sum::<f64>(), 0.0, comp = abs, tol = 1e-12);
}

#[test]
fn hanging_node_constraints_are_resolved_through_the_pool() {
    let mut mesh = create_subdivided_hyper_rectangle(&Point2::origin(), &Point2::new(2.0, 1.0), [2, 1]);
    mesh.refine_cell(CellHandle::new(0, 0));
    let dofs = DofHandler::new(&mesh, 1, 1);
    let constraints = make_hanging_node_constraints(&mesh, &dofs).unwrap();
    assert_eq!(constraints.n_constraints(), 1);

    let matrix_free = setup(&mesh, &dofs, &constraints, AdditionalData::default()).unwrap();
    let pool = matrix_free.constraint_pool();
    assert_eq!(pool.n_rows(), 1);
    assert_eq!(pool.row(0), &[0.5, 0.5]);
    assert_eq!(matrix_free.dof_info(0).constrained_dofs().len(), 1);

    let ones = vec![1.0; dofs.n_dofs()];
    let result = apply_operator(&matrix_free, &ones, true);
    let hanging = matrix_free.dof_info(0).constrained_dofs()[0];
    assert_eq!(result[hanging], 0.0);
    assert_scalar_eq!(result.iter().sum::<f64>(), 2.0, comp = abs, tol = 1e-12);
}

#[test]
fn categories_with_threads_are_rejected() {
    let mesh = create_unit_hypercube_mesh::<2>(2);
    let dofs = DofHandler::new(&mesh, 1, 1);
    let data = AdditionalData {
        tasks_parallel_scheme: TaskScheme::Color,
        cell_vectorization_category: vec![0, 1, 0, 1],
        ..Default::default()
    };
    let result = setup(&mesh, &dofs, &ConstraintTable::new(), data);
    assert!(matches!(result, Err(SetupError::IncompatibleOptions(_))));
}

#[test]
fn strict_categories_never_share_a_batch() {
    let mesh = create_unit_hypercube_mesh::<2>(3);
    let dofs = DofHandler::new(&mesh, 1, 1);
    let categories: Vec<u32> = (0..9).map(|i| (i % 2) as u32).collect();
    let data = AdditionalData {
        cell_vectorization_category: categories.clone(),
        cell_vectorization_categories_strict: true,
        ..Default::default()
    };
    let matrix_free = setup(&mesh, &dofs, &ConstraintTable::new(), data).unwrap();
    for batch in 0..matrix_free.n_cell_batches() {
        let cells = matrix_free.cell_batches().active_cells(batch);
        let first = categories[cells[0].index];
        assert!(cells.iter().all(|cell| categories[cell.index] == first));
        assert_eq!(matrix_free.task_info().batch_category(batch), first);
    }
}

#[test]
fn stale_numbering_is_rejected() {
    let mut mesh = create_unit_hypercube_mesh::<2>(2);
    let dofs = DofHandler::new(&mesh, 1, 1);
    mesh.refine_global(1);
    let result = setup(&mesh, &dofs, &ConstraintTable::new(), AdditionalData::default());
    assert!(matches!(result, Err(SetupError::StaleMesh)));
}

#[test]
fn degenerate_cell_fails_setup() {
    let vertices = vec![
        Point3::new(0.0, 0.0, 0.0),
        Point3::new(1.0, 0.0, 0.0),
        Point3::new(1.0, 1.0, 0.0),
        Point3::new(0.0, 1.0, 0.0),
        Point3::new(0.0, 0.0, 1.0),
        Point3::new(1.0, 0.0, 1.0),
        Point3::new(1.0, 1.0, 1.0),
        Point3::new(0.0, 1.0, 1.0),
    ];
    let mesh: HierarchicalMesh<3, 3> = create_single_cell_mesh(vertices).unwrap();
    let dofs = DofHandler::new(&mesh, 1, 1);
    let result = setup(&mesh, &dofs, &ConstraintTable::new(), AdditionalData::default());
    assert!(matches!(
        result,
        Err(SetupError::Mapping(MappingError::DegenerateCell { .. }))
    ));
}

#[test]
fn faces_are_collected_once() {
    let mesh = create_unit_hypercube_mesh::<2>(3);
    let dofs = DofHandler::new_discontinuous(&mesh, 1, 1);
    let data = AdditionalData {
        mapping_update_flags_inner_faces: UpdateFlags::JXW_VALUES | UpdateFlags::NORMAL_VECTORS,
        mapping_update_flags_boundary_faces: UpdateFlags::JXW_VALUES | UpdateFlags::NORMAL_VECTORS,
        ..Default::default()
    };
    let matrix_free = setup(&mesh, &dofs, &ConstraintTable::new(), data).unwrap();
    let faces = matrix_free.face_batches().unwrap();
    let n_lanes = faces.n_lanes();

    let count = |kind| {
        faces
            .batches_of_kind(kind)
            .map(|batch| faces.n_active_lanes(batch))
            .sum::<usize>()
    };
    use matfree::face_batch::FaceKind;
    assert_eq!(count(FaceKind::Interior), 12);
    assert_eq!(count(FaceKind::Boundary), 12);
    assert_eq!(count(FaceKind::InnerGhost), 0);

    for batch in 0..faces.n_batches() {
        let lanes = &faces.batch(batch)[..faces.n_active_lanes(batch)];
        assert!(lanes.iter().all(|face| face.interior_face == lanes[0].interior_face));
    }

    // Every face of every cell is reachable from the cell
    for batch in 0..matrix_free.n_cell_batches() {
        for lane in 0..matrix_free.n_active_entries_per_cell_batch(batch) {
            for face in 0..4 {
                let slot = faces
                    .cell_and_face_to_plain_faces(batch, face, lane)
                    .expect("face is held locally");
                assert!(slot / n_lanes < faces.n_batches());
            }
        }
    }

    // Face geometry: total boundary length of the unit square
    let storage = matrix_free.mapping_info().face_data(0).unwrap();
    let mut length = 0.0;
    for batch in faces.batches_of_kind(FaceKind::Boundary) {
        for q in 0..storage.n_q_points() {
            for lane in 0..faces.n_active_lanes(batch) {
                length += storage.jxw[storage.index(batch, q, lane)];
            }
        }
    }
    assert_scalar_eq!(length, 4.0, comp = abs, tol = 1e-12);
}

#[test]
fn coarse_fine_faces_across_subdomains_are_held_exactly_once() {
    use matfree::face_batch::FaceKind;
    // The right cell is refined and its upper children belong to the second subdomain
    let mut mesh = create_subdivided_hyper_rectangle(&Point2::new(0.0, 0.0), &Point2::new(2.0, 1.0), [2, 1]);
    mesh.refine_cell(CellHandle::new(0, 1));
    mesh.partition(2);
    assert_eq!(mesh.true_subdomain_id(CellHandle::new(0, 0)), 0);
    assert_eq!(mesh.true_subdomain_id(CellHandle::new(1, 2)), 1);

    let data = AdditionalData {
        mapping_update_flags_inner_faces: UpdateFlags::JXW_VALUES | UpdateFlags::NORMAL_VECTORS,
        ..Default::default()
    };
    let mut held = Vec::new();
    for subdomain in 0..2 {
        mesh.set_locally_owned_subdomain(subdomain, false);
        let dofs = DofHandler::new_discontinuous(&mesh, 1, 1);
        let matrix_free = setup(&mesh, &dofs, &ConstraintTable::new(), data.clone()).unwrap();
        let faces = matrix_free.face_batches().unwrap();
        let n_lanes = faces.n_lanes();
        let handle = |slot: usize| matrix_free.cell(slot / n_lanes, slot % n_lanes);
        for kind in [FaceKind::Interior, FaceKind::InnerGhost] {
            for batch in faces.batches_of_kind(kind) {
                for face in &faces.batch(batch)[..faces.n_active_lanes(batch)] {
                    let exterior = face.exterior_cell.expect("inner faces have two sides");
                    let pair = (handle(face.interior_cell), handle(exterior));
                    held.push((pair.0.min(pair.1), pair.0.max(pair.1)));
                }
            }
        }
    }

    // Two coarse/fine faces and four faces between the children
    assert_eq!(held.len(), 6);
    let unique: BTreeSet<_> = held.iter().copied().collect();
    assert_eq!(unique.len(), 6);
    let coarse = CellHandle::new(0, 0);
    for child in [0, 2] {
        assert!(unique.contains(&(coarse, CellHandle::new(1, child))));
    }
}

#[test]
fn multigrid_level_uses_level_cells() {
    let mut mesh = create_unit_hypercube_mesh::<2>(2);
    mesh.refine_global(1);
    let mut dofs = DofHandler::new(&mesh, 1, 1);
    dofs.distribute_level_dofs(&mesh);
    for (level, n_cells) in [(0, 4), (1, 16)] {
        let data = AdditionalData {
            mg_level: Some(level),
            ..Default::default()
        };
        let matrix_free = setup(&mesh, &dofs, &ConstraintTable::new(), data).unwrap();
        assert_eq!(matrix_free.cell_batches().n_owned_cells(), n_cells);
        assert_eq!(
            matrix_free.dof_info(0).partitioner().size(),
            dofs.n_level_dofs(level)
        );
    }
}

#[test]
fn missing_level_dofs_are_a_configuration_error() {
    let mut mesh = create_unit_hypercube_mesh::<2>(2);
    mesh.refine_global(1);
    let dofs = DofHandler::new(&mesh, 1, 1);
    let data = AdditionalData {
        mg_level: Some(1),
        ..Default::default()
    };
    let result = setup(&mesh, &dofs, &ConstraintTable::new(), data);
    assert!(matches!(result, Err(SetupError::IncompatibleOptions(_))));
}

#[test]
fn memory_report_and_dump() {
    let mesh = create_unit_hypercube_mesh::<2>(3);
    let dofs = DofHandler::new(&mesh, 1, 1);
    let matrix_free = setup(&mesh, &dofs, &ConstraintTable::new(), AdditionalData::default()).unwrap();
    let report = matrix_free.memory_consumption();
    assert!(report.dof_info > 0);
    assert!(report.mapping_info > 0);
    assert_eq!(report.face_info, 0);
    assert!(report.total() >= report.cell_batches + report.dof_info);

    let mut out = Vec::new();
    matrix_free.print_memory_consumption(&mut out).unwrap();
    matrix_free.print(&mut out).unwrap();
    let text = String::from_utf8(out).unwrap();
    assert!(text.contains("Total"));
    assert!(text.contains("Batch 0"));
}

#[test]
fn additional_data_survives_serialization() {
    let data = AdditionalData {
        tasks_parallel_scheme: TaskScheme::Partition,
        n_lanes: 8,
        mapping_update_flags: UpdateFlags::JACOBIANS,
        cell_vectorization_category: vec![3, 1],
        ..Default::default()
    };
    let json = serde_json::to_string(&data).unwrap();
    let restored: AdditionalData = serde_json::from_str(&json).unwrap();
    assert_eq!(restored, data);

    // Missing fields take their default values
    let partial: AdditionalData = serde_json::from_str(r#"{ "n_lanes": 2 }"#).unwrap();
    assert_eq!(partial.n_lanes, 2);
    assert_eq!(partial.tasks_block_size, AdditionalData::default().tasks_block_size);
}
