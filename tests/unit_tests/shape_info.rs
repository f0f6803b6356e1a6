use matfree::shape_info::{ElementType, ShapeInfo, ShapeInfoCache};
use matfree_quadrature::univariate::{gauss_unit, try_gauss_lobatto_unit};
use matrixcompare::assert_scalar_eq;
use std::sync::Arc;

#[test]
fn shape_values_form_a_partition_of_unity() {
    for degree in 1..=5 {
        let info = ShapeInfo::new(3, degree, 1, &gauss_unit(degree + 2));
        let n = degree + 1;
        assert_eq!(info.n_q_points_1d, degree + 2);
        assert_eq!(info.n_q_points, (degree + 2).pow(3));
        assert_eq!(info.dofs_per_component_on_cell, n.pow(3));
        assert_eq!(info.element_type, ElementType::General);

        for q in 0..info.n_q_points_1d {
            let values: f64 = info.shape_values[q * n..(q + 1) * n].iter().sum();
            let gradients: f64 = info.shape_gradients[q * n..(q + 1) * n].iter().sum();
            let hessians: f64 = info.shape_hessians[q * n..(q + 1) * n].iter().sum();
            assert_scalar_eq!(values, 1.0, comp = abs, tol = 1e-12);
            assert_scalar_eq!(gradients, 0.0, comp = abs, tol = 1e-10);
            assert_scalar_eq!(hessians, 0.0, comp = abs, tol = 1e-8);
        }
    }
}

#[test]
fn face_data_interpolates_at_the_interval_ends() {
    let degree = 3;
    let info = ShapeInfo::new(2, degree, 2, &gauss_unit(4));
    let n = degree + 1;
    let [left, right] = &info.shape_data_on_face;
    assert_eq!(left.len(), 3 * n);
    assert_scalar_eq!(left[0], 1.0, comp = abs, tol = 1e-14);
    assert_scalar_eq!(right[n - 1], 1.0, comp = abs, tol = 1e-14);
    for i in 1..n {
        assert_scalar_eq!(left[i], 0.0, comp = abs, tol = 1e-14);
    }
}

#[test]
fn gauss_lobatto_quadrature_is_detected_as_collocation() {
    let degree = 4;
    let rule = try_gauss_lobatto_unit(degree + 1).unwrap();
    let info = ShapeInfo::new(2, degree, 1, &rule);
    assert_eq!(info.element_type, ElementType::Collocation);
    let n = degree + 1;
    for q in 0..n {
        for i in 0..n {
            let expected = if q == i { 1.0 } else { 0.0 };
            assert_scalar_eq!(info.shape_values[q * n + i], expected, comp = abs, tol = 1e-13);
        }
    }
}

#[test]
fn lexicographic_numbering_is_a_permutation() {
    let info = ShapeInfo::new(3, 2, 1, &gauss_unit(3));
    let mut numbering = info.lexicographic_numbering.clone();
    numbering.sort_unstable();
    assert_eq!(numbering, (0..27).collect::<Vec<_>>());
    assert_eq!(info.n_hessian_components(), 6);
}

#[test]
fn cache_shares_identical_entries() {
    let cache = ShapeInfoCache::new();
    assert!(cache.is_empty());

    let a = cache.get_or_insert(2, 2, 1, &gauss_unit(3));
    let b = cache.get_or_insert(2, 2, 1, &gauss_unit(3));
    assert!(Arc::ptr_eq(&a, &b));
    assert_eq!(cache.len(), 1);

    let c = cache.get_or_insert(2, 2, 2, &gauss_unit(3));
    let d = cache.get_or_insert(2, 2, 1, &gauss_unit(4));
    let e = cache.get_or_insert(3, 2, 1, &gauss_unit(3));
    assert!(!Arc::ptr_eq(&a, &c));
    assert!(!Arc::ptr_eq(&a, &d));
    assert!(!Arc::ptr_eq(&a, &e));
    assert_eq!(cache.len(), 4);
    assert!(cache.memory_consumption() >= a.memory_consumption());
}

#[test]
fn cache_can_be_filled_concurrently() {
    use rayon::prelude::*;

    let cache = ShapeInfoCache::new();
    let infos: Vec<_> = (0..64)
        .into_par_iter()
        .map(|i| cache.get_or_insert(2, 1 + i % 2, 1, &gauss_unit(3)))
        .collect();
    assert_eq!(cache.len(), 2);
    for (i, info) in infos.iter().enumerate() {
        assert_eq!(info.degree, 1 + i % 2);
        assert!(Arc::ptr_eq(info, &infos[i % 2]));
    }
}
