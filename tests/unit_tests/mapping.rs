use matfree::mapping::{
    CellSimilarity, EulerPositionField, GeometricMap, InverseMappingSettings, Mapping, MappingData, MappingError,
    UpdateFlags,
};
use matfree::mesh::procedural::{create_single_cell_mesh, create_unit_hypercube_mesh};
use matfree::mesh::{CellHandle, HierarchicalMesh, MeshView};
use matfree::proptest::perturbed_box_vertices;
use matfree::quadrature::Quadrature;
use matrixcompare::{assert_matrix_eq, assert_scalar_eq};
use nalgebra::{Point, Point1, Point2, SMatrix, Vector2};
use proptest::prelude::*;
use std::sync::Arc;

fn reference_samples<const DIM: usize>() -> Vec<Point<f64, DIM>> {
    let coords = [0.1, 0.5, 0.85];
    let n = coords.len().pow(DIM as u32);
    (0..n)
        .map(|mut i| {
            let mut xi = Point::<f64, DIM>::origin();
            for d in 0..DIM {
                xi[d] = coords[i % coords.len()];
                i /= coords.len();
            }
            xi
        })
        .collect()
}

fn assert_round_trip<const DIM: usize, const SPACEDIM: usize>(vertices: Vec<Point<f64, SPACEDIM>>) {
    let mesh: HierarchicalMesh<DIM, SPACEDIM> = create_single_cell_mesh(vertices).unwrap();
    let cell = CellHandle::new(0, 0);
    for degree in 1..=4 {
        let mapping = Mapping::<DIM, SPACEDIM>::q_generic(degree);
        for xi in reference_samples::<DIM>() {
            let x = mapping.transform_unit_to_real_cell(&mesh, cell, &xi);
            let result = mapping
                .transform_real_to_unit_cell(&mesh, cell, &x)
                .unwrap_or_else(|err| panic!("degree {degree}, xi = {xi:?}: {err}"));
            assert!(
                (result - xi).norm() < 1e-10,
                "degree {degree}: expected {xi:?}, got {result:?}"
            );
        }
    }
}

#[test]
fn round_trip_1d() {
    assert_round_trip::<1, 1>(vec![Point::from([0.5]), Point::from([2.0])]);
}

#[test]
fn round_trip_line_in_plane() {
    assert_round_trip::<1, 2>(vec![Point::from([0.0, 0.0]), Point::from([1.0, 2.0])]);
}

#[test]
fn round_trip_line_in_space() {
    assert_round_trip::<1, 3>(vec![Point::from([0.0, 0.0, 0.0]), Point::from([1.0, 2.0, 3.0])]);
}

#[test]
fn round_trip_quadrilateral() {
    assert_round_trip::<2, 2>(vec![
        Point::from([0.0, 0.0]),
        Point::from([2.0, 0.1]),
        Point::from([0.2, 1.5]),
        Point::from([2.3, 1.8]),
    ]);
}

#[test]
fn round_trip_surface_quadrilateral() {
    assert_round_trip::<2, 3>(vec![
        Point::from([0.0, 0.0, 0.0]),
        Point::from([1.0, 0.0, 0.1]),
        Point::from([0.0, 1.0, 0.2]),
        Point::from([1.0, 1.0, 0.5]),
    ]);
}

#[test]
fn round_trip_hexahedron() {
    assert_round_trip::<3, 3>(vec![
        Point::from([0.0, 0.0, 0.0]),
        Point::from([1.1, 0.0, 0.1]),
        Point::from([0.0, 1.0, 0.0]),
        Point::from([1.0, 1.2, 0.0]),
        Point::from([0.1, 0.0, 1.0]),
        Point::from([1.0, 0.1, 1.1]),
        Point::from([0.0, 0.9, 1.0]),
        Point::from([1.2, 1.1, 1.3]),
    ]);
}

#[test]
fn unit_square_is_identity() {
    let mesh = create_unit_hypercube_mesh::<2>(1);
    let cell = CellHandle::new(0, 0);
    let mapping = Mapping::<2, 2>::q1();

    let xi = Point2::new(0.5, 0.5);
    let x = mapping.transform_unit_to_real_cell(&mesh, cell, &xi);
    assert_scalar_eq!(x.x, 0.5, comp = abs, tol = 1e-14);
    assert_scalar_eq!(x.y, 0.5, comp = abs, tol = 1e-14);

    let jacobian = mapping.jacobian(&mesh, cell, &xi);
    assert_matrix_eq!(jacobian, SMatrix::<f64, 2, 2>::identity(), comp = abs, tol = 1e-14);
    assert_scalar_eq!(jacobian.determinant(), 1.0, comp = abs, tol = 1e-14);
}

fn translated_squares() -> HierarchicalMesh<2, 2> {
    let vertices = vec![
        Point2::new(0.0, 0.0),
        Point2::new(1.0, 0.0),
        Point2::new(0.0, 1.0),
        Point2::new(1.0, 1.0),
        Point2::new(2.0, 3.0),
        Point2::new(3.0, 3.0),
        Point2::new(2.0, 4.0),
        Point2::new(3.0, 4.0),
    ];
    HierarchicalMesh::from_coarse_cells(vertices, vec![vec![0, 1, 2, 3], vec![4, 5, 6, 7]]).unwrap()
}

#[test]
fn translated_square_inverts_consistently() {
    let mesh = translated_squares();
    let mapping = Mapping::<2, 2>::q1();
    let original = CellHandle::new(0, 0);
    let translated = CellHandle::new(0, 1);
    for p in [Point2::new(0.25, 0.75), Point2::new(0.5, 0.1), Point2::new(0.9, 0.9)] {
        let expected = mapping
            .transform_real_to_unit_cell(&mesh, original, &p)
            .unwrap();
        let shifted = Point2::new(p.x + 2.0, p.y + 3.0);
        let result = mapping
            .transform_real_to_unit_cell(&mesh, translated, &shifted)
            .unwrap();
        assert!((result - expected).norm() < 1e-12);
    }
}

#[test]
fn translated_square_is_detected_as_translation() {
    let mesh = translated_squares();
    let mapping = Mapping::<2, 2>::q1();
    let quadrature = Quadrature::<2>::gauss(2);
    let flags = mapping.requires_update_flags(UpdateFlags::JXW_VALUES | UpdateFlags::QUADRATURE_POINTS);
    let mut data = mapping.get_data(flags, &quadrature);

    let first = mapping
        .fill(&mesh, CellHandle::new(0, 0), &mut data)
        .unwrap();
    assert_eq!(first, CellSimilarity::None);
    let points_before = data.quadrature_points.clone();
    let jxw_before = data.jxw.clone();

    let second = mapping
        .fill(&mesh, CellHandle::new(0, 1), &mut data)
        .unwrap();
    assert_eq!(second, CellSimilarity::Translation);
    assert_eq!(data.jxw, jxw_before);
    for (after, before) in data.quadrature_points.iter().zip(&points_before) {
        assert_scalar_eq!(after.x, before.x + 2.0, comp = abs, tol = 1e-14);
        assert_scalar_eq!(after.y, before.y + 3.0, comp = abs, tol = 1e-14);
    }
}

#[test]
fn q2_field_on_deformed_quadrilateral_round_trips() {
    let vertices = vec![
        Point2::new(0.0, 0.0),
        Point2::new(1.0, 0.0),
        Point2::new(0.0, 1.0),
        Point2::new(1.3, 1.2),
    ];
    let mesh: HierarchicalMesh<2, 2> = create_single_cell_mesh(vertices).unwrap();
    let field = EulerPositionField::<2, 2>::interpolate(&mesh, 2, |x| Point2::new(x.x, x.y + 0.1 * x.x * (1.0 - x.x)));
    let mapping = Mapping::fe_field(Arc::new(field));
    assert_eq!(mapping.degree(), 2);

    let cell = CellHandle::new(0, 0);
    for i in 0..4 {
        for j in 0..4 {
            let xi = Point2::new((i as f64 + 0.5) / 4.0, (j as f64 + 0.5) / 4.0);
            let x = mapping.transform_unit_to_real_cell(&mesh, cell, &xi);
            let result = mapping.transform_real_to_unit_cell(&mesh, cell, &x).unwrap();
            assert!((result - xi).norm() < 1e-10, "expected {xi:?}, got {result:?}");
        }
    }
}

#[test]
fn twisted_cell_is_reported_as_degenerate() {
    // Vertices 2 and 3 swapped, so that the cell folds over itself
    let vertices = vec![
        Point2::new(0.0, 0.0),
        Point2::new(1.0, 0.0),
        Point2::new(1.0, 1.0),
        Point2::new(0.0, 1.0),
    ];
    let mesh: HierarchicalMesh<2, 2> = create_single_cell_mesh(vertices).unwrap();
    let mapping = Mapping::<2, 2>::q1();
    let flags = mapping.requires_update_flags(UpdateFlags::JXW_VALUES);
    let mut data = mapping.get_data(flags, &Quadrature::gauss(2));
    let result = mapping.fill(&mesh, CellHandle::new(0, 0), &mut data);
    assert!(matches!(result, Err(MappingError::DegenerateCell { .. })));
}

#[test]
fn linear_field_inverts_the_displaced_cell() {
    // A degree 1 field does not keep the mesh vertices, so the inverse must use its own corners
    let mesh = create_unit_hypercube_mesh::<2>(1);
    let field = EulerPositionField::<2, 2>::interpolate(&mesh, 1, |x| Point2::new(0.5 * x.x, x.y));
    let mapping = Mapping::fe_field(Arc::new(field));
    assert!(!mapping.preserves_vertex_locations());
    let cell = CellHandle::new(0, 0);
    for xi in reference_samples::<2>() {
        let x = mapping.transform_unit_to_real_cell(&mesh, cell, &xi);
        assert_scalar_eq!(x.x, 0.5 * xi.x, comp = abs, tol = 1e-14);
        let result = mapping.transform_real_to_unit_cell(&mesh, cell, &x).unwrap();
        assert!((result - xi).norm() < 1e-10, "expected {xi:?}, got {result:?}");
    }

    let line = create_unit_hypercube_mesh::<1>(1);
    let field = EulerPositionField::<1, 1>::interpolate(&line, 1, |x| Point1::new(2.0 * x.x + 1.0));
    let mapping = Mapping::fe_field(Arc::new(field));
    let result = mapping
        .transform_real_to_unit_cell(&line, cell, &Point1::new(1.6))
        .unwrap();
    assert_scalar_eq!(result.x, 0.3, comp = abs, tol = 1e-14);
}

#[test]
fn failed_fill_is_not_reused_for_translated_cells() {
    let vertices = vec![
        // Unit square
        Point2::new(0.0, 0.0),
        Point2::new(1.0, 0.0),
        Point2::new(0.0, 1.0),
        Point2::new(1.0, 1.0),
        // Folded cell
        Point2::new(5.0, 0.0),
        Point2::new(6.0, 0.0),
        Point2::new(6.0, 1.0),
        Point2::new(5.0, 1.0),
        // Unit square translated by (2, 3)
        Point2::new(2.0, 3.0),
        Point2::new(3.0, 3.0),
        Point2::new(2.0, 4.0),
        Point2::new(3.0, 4.0),
    ];
    let cells = vec![vec![0, 1, 2, 3], vec![4, 5, 6, 7], vec![8, 9, 10, 11]];
    let mesh = HierarchicalMesh::<2, 2>::from_coarse_cells(vertices, cells).unwrap();
    let mapping = Mapping::<2, 2>::q1();
    let flags = mapping.requires_update_flags(UpdateFlags::JXW_VALUES | UpdateFlags::QUADRATURE_POINTS);
    let mut data = mapping.get_data(flags, &Quadrature::gauss(2));

    assert_eq!(mapping.fill(&mesh, CellHandle::new(0, 0), &mut data).unwrap(), CellSimilarity::None);
    assert!(matches!(
        mapping.fill(&mesh, CellHandle::new(0, 1), &mut data),
        Err(MappingError::DegenerateCell { .. })
    ));

    let similarity = mapping.fill(&mesh, CellHandle::new(0, 2), &mut data).unwrap();
    assert_eq!(similarity, CellSimilarity::None);
    assert_eq!(data.volume_elements.len(), 4);
    for (jacobian, jxw) in data.jacobians.iter().zip(&data.jxw) {
        assert_matrix_eq!(*jacobian, SMatrix::<f64, 2, 2>::identity(), comp = abs, tol = 1e-14);
        assert_scalar_eq!(*jxw, 0.25, comp = abs, tol = 1e-14);
    }
}

/// A single unit square deformed by a polynomial that a degree 4 field represents exactly.
fn curved_square(degree: usize) -> (HierarchicalMesh<2, 2>, Mapping<2, 2>) {
    let mesh = create_unit_hypercube_mesh::<2>(1);
    let field = EulerPositionField::<2, 2>::interpolate(&mesh, degree, |x| {
        Point2::new(
            x.x + 0.1 * x.y * x.y + 0.05 * x.x * x.x * x.y,
            x.y + 0.08 * x.x * x.x * x.x - 0.04 * x.x * x.y * x.y * x.y,
        )
    });
    (mesh, Mapping::fe_field(Arc::new(field)))
}

fn fill_at(
    mapping: &Mapping<2, 2>,
    mesh: &HierarchicalMesh<2, 2>,
    flags: UpdateFlags,
    points: Vec<Point2<f64>>,
) -> MappingData<2, 2> {
    let quadrature = Quadrature::from_weights_and_points(vec![1.0; points.len()], points);
    let mut data = mapping.get_data(flags, &quadrature);
    mapping.fill(mesh, CellHandle::new(0, 0), &mut data).unwrap();
    data
}

#[test]
fn reference_derivatives_match_finite_differences() {
    let (mesh, mapping) = curved_square(4);
    let flags = UpdateFlags::JACOBIAN_GRADS | UpdateFlags::JACOBIAN_2ND_DERIVATIVES | UpdateFlags::JACOBIAN_3RD_DERIVATIVES;
    let samples = reference_samples::<2>();
    let center = fill_at(&mapping, &mesh, flags, samples.clone());
    let h = 1e-4;

    for k in 0..2 {
        let mut step = Vector2::zeros();
        step[k] = h;
        let plus = fill_at(&mapping, &mesh, flags, samples.iter().map(|xi| xi + step).collect());
        let minus = fill_at(&mapping, &mesh, flags, samples.iter().map(|xi| xi - step).collect());
        for q in 0..samples.len() {
            let fd = (plus.jacobians[q] - minus.jacobians[q]) / (2.0 * h);
            assert_matrix_eq!(center.jacobian_grads[q][k], fd, comp = abs, tol = 1e-6);
            for l in 0..2 {
                let fd = (plus.jacobian_grads[q][l] - minus.jacobian_grads[q][l]) / (2.0 * h);
                assert_matrix_eq!(center.jacobian_2nd_derivatives[q][k][l], fd, comp = abs, tol = 1e-6);
                for m in 0..2 {
                    let fd = (plus.jacobian_2nd_derivatives[q][l][m] - minus.jacobian_2nd_derivatives[q][l][m]) / (2.0 * h);
                    assert_matrix_eq!(center.jacobian_3rd_derivatives[q][k][l][m], fd, comp = abs, tol = 1e-6);
                }
            }
        }
    }

    // d^3 x_1 / d xi_0^3 of 0.08 x^3
    for q in 0..samples.len() {
        assert_scalar_eq!(center.jacobian_2nd_derivatives[q][0][0][(1, 0)], 0.48, comp = abs, tol = 1e-9);
    }
}

#[test]
fn pushed_forward_derivatives_match_real_space_differences() {
    let (mesh, mapping) = curved_square(3);
    let flags = UpdateFlags::JACOBIAN_PUSHED_FORWARD_GRADS | UpdateFlags::JACOBIAN_PUSHED_FORWARD_2ND_DERIVATIVES;
    let samples = reference_samples::<2>();
    let data = fill_at(&mapping, &mesh, flags, samples.clone());
    let cell = CellHandle::new(0, 0);
    let h = 1e-4;

    for (q, xi) in samples.iter().enumerate() {
        let x = mapping.transform_unit_to_real_cell(&mesh, cell, xi);
        let inverse = data.inverse_jacobians[q];
        for k in 0..2 {
            let mut step = Vector2::zeros();
            step[k] = h;
            let xi_plus = mapping.transform_real_to_unit_cell(&mesh, cell, &(x + step)).unwrap();
            let xi_minus = mapping.transform_real_to_unit_cell(&mesh, cell, &(x - step)).unwrap();
            let dj_dx = (mapping.jacobian(&mesh, cell, &xi_plus) - mapping.jacobian(&mesh, cell, &xi_minus)) / (2.0 * h);
            assert_matrix_eq!(data.jacobian_pushed_forward_grads[q][k], dj_dx * inverse, comp = abs, tol = 1e-6);
        }
    }

    // The second derivative is pushed forward by contracting both reference indices
    let reference = fill_at(&mapping, &mesh, UpdateFlags::JACOBIAN_2ND_DERIVATIVES, samples.clone());
    for q in 0..samples.len() {
        let inverse = data.inverse_jacobians[q];
        for k in 0..2 {
            for l in 0..2 {
                let mut expected = SMatrix::<f64, 2, 2>::zeros();
                for a in 0..2 {
                    for b in 0..2 {
                        expected += reference.jacobian_2nd_derivatives[q][a][b] * inverse * (inverse[(a, k)] * inverse[(b, l)]);
                    }
                }
                assert_matrix_eq!(data.jacobian_pushed_forward_2nd_derivatives[q][k][l], expected, comp = abs, tol = 1e-12);
            }
        }
    }
}

#[test]
fn tensor_product_path_matches_pointwise_evaluation() {
    for degree in 2..=4 {
        let (mesh, mapping) = curved_square(degree);
        let flags = UpdateFlags::JACOBIAN_GRADS | UpdateFlags::QUADRATURE_POINTS | UpdateFlags::JXW_VALUES;
        let tensor = Quadrature::<2>::gauss(degree + 1);
        assert!(tensor.tensor_factor().is_some());
        let pointwise = Quadrature::from_weights_and_points(tensor.weights().to_vec(), tensor.points().to_vec());
        assert!(pointwise.tensor_factor().is_none());

        let cell = CellHandle::new(0, 0);
        let mut fused = mapping.get_data(flags, &tensor);
        mapping.fill(&mesh, cell, &mut fused).unwrap();
        let mut direct = mapping.get_data(flags, &pointwise);
        mapping.fill(&mesh, cell, &mut direct).unwrap();

        for q in 0..tensor.len() {
            assert!((fused.quadrature_points[q] - direct.quadrature_points[q]).norm() < 1e-13);
            assert_matrix_eq!(fused.jacobians[q], direct.jacobians[q], comp = abs, tol = 1e-13);
            for k in 0..2 {
                assert_matrix_eq!(fused.jacobian_grads[q][k], direct.jacobian_grads[q][k], comp = abs, tol = 1e-12);
            }
            assert_scalar_eq!(fused.jxw[q], direct.jxw[q], comp = abs, tol = 1e-13);
        }
    }
}

#[test]
fn settings_survive_serialization() {
    let settings = InverseMappingSettings {
        max_newton_iterations: 7,
        ..Default::default()
    };
    let json = serde_json::to_string(&settings).unwrap();
    let restored: InverseMappingSettings = serde_json::from_str(&json).unwrap();
    assert_eq!(restored, settings);
}

proptest! {
    #[test]
    fn q1_round_trip_on_perturbed_hexahedra(vertices in perturbed_box_vertices::<3>(0.15)) {
        let mesh: HierarchicalMesh<3, 3> = create_single_cell_mesh(vertices).unwrap();
        let mapping = Mapping::<3, 3>::q1();
        let cell = CellHandle::new(0, 0);
        for xi in reference_samples::<3>() {
            let x = mapping.transform_unit_to_real_cell(&mesh, cell, &xi);
            let result = mapping.transform_real_to_unit_cell(&mesh, cell, &x).unwrap();
            prop_assert!((result - xi).norm() < 1e-10);
        }
    }

    #[test]
    fn jacobian_is_positive_on_perturbed_quadrilaterals(vertices in perturbed_box_vertices::<2>(0.15)) {
        let mesh: HierarchicalMesh<2, 2> = create_single_cell_mesh(vertices).unwrap();
        let mapping = Mapping::<2, 2>::q_generic(2);
        for xi in reference_samples::<2>() {
            let jacobian = mapping.jacobian(&mesh, CellHandle::new(0, 0), &xi);
            prop_assert!(jacobian.determinant() > 0.0);
        }
        prop_assert_eq!(mesh.n_levels(), 1);
    }
}
