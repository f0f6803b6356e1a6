use matfree_quadrature::integrate;
use matfree_quadrature::tensor::{hypercube_gauss, tensor_product};
use matfree_quadrature::univariate::try_gauss_lobatto_unit;
use matrixcompare::assert_scalar_eq;

#[test]
fn quadrilateral_gauss_rules_satisfy_expected_accuracy() {
    for n in 1..=8 {
        // Expected polynomial degree that the rule can exactly integrate *along each dimension*
        let expected_polynomial_degree = 2 * n - 1;
        let rule = hypercube_gauss::<2>(n);
        assert_eq!(rule.0.len(), n * n);
        assert!(rule.0.iter().all(|&w| w > 0.0));

        for alpha in 0..=expected_polynomial_degree as i32 {
            for beta in 0..=expected_polynomial_degree as i32 {
                let monomial_integral = 1.0 / ((alpha as f64 + 1.0) * (beta as f64 + 1.0));
                let estimated_integral = integrate(&rule, |&[x, y]| x.powi(alpha) * y.powi(beta));
                assert_scalar_eq!(estimated_integral, monomial_integral, comp = abs, tol = 1e-14);
            }
        }
    }
}

#[test]
fn hexahedral_gauss_rules_satisfy_expected_accuracy() {
    for n in 1..=4 {
        let expected_polynomial_degree = 2 * n - 1;
        let rule = hypercube_gauss::<3>(n);
        assert_eq!(rule.0.len(), n * n * n);

        for alpha in 0..=expected_polynomial_degree as i32 {
            for beta in 0..=expected_polynomial_degree as i32 {
                for gamma in 0..=expected_polynomial_degree as i32 {
                    let monomial_integral =
                        1.0 / ((alpha as f64 + 1.0) * (beta as f64 + 1.0) * (gamma as f64 + 1.0));
                    let estimated_integral =
                        integrate(&rule, |&[x, y, z]| x.powi(alpha) * y.powi(beta) * z.powi(gamma));
                    assert_scalar_eq!(estimated_integral, monomial_integral, comp = abs, tol = 1e-14);
                }
            }
        }
    }
}

#[test]
fn tensor_product_orders_first_coordinate_fastest() {
    let rule_1d = try_gauss_lobatto_unit(3).unwrap();
    let (_, points) = tensor_product::<2>(&rule_1d);
    assert_eq!(points[0], [0.0, 0.0]);
    assert_eq!(points[1], [0.5, 0.0]);
    assert_eq!(points[2], [1.0, 0.0]);
    assert_eq!(points[3], [0.0, 0.5]);
    assert_eq!(points[8], [1.0, 1.0]);
}
