use matfree_quadrature::integrate;
use matfree_quadrature::univariate::{gauss, gauss_unit, try_gauss_lobatto, try_gauss_lobatto_unit};

use matrixcompare::assert_scalar_eq;

#[test]
fn gauss_rules_satisfy_expected_accuracy() {
    for n in 1..=40 {
        let expected_polynomial_degree = 2 * n - 1;
        let rule = gauss(n);

        // Also test that weights are positive
        assert!(rule.0.iter().all(|&w| w > 0.0));

        // Integrate all monomials of degree <= expected polynomial degree that can be
        // exactly integrated
        for alpha in 0..=expected_polynomial_degree as i32 {
            let monomial = |x: f64| x.powi(alpha);
            let monomial_integral = (1.0 - (-1.0f64).powi(alpha + 1)) / (alpha as f64 + 1.0);
            let estimated_integral = integrate(&rule, |x| monomial(x[0]));

            assert_scalar_eq!(estimated_integral, monomial_integral, comp = abs, tol = 1e-13);
        }
    }
}

#[test]
fn gauss_lobatto_rules_satisfy_expected_accuracy() {
    assert!(try_gauss_lobatto(0).is_none());
    assert!(try_gauss_lobatto(1).is_none());

    for n in 2..=24 {
        let expected_polynomial_degree = 2 * n - 3;
        let rule = try_gauss_lobatto(n).unwrap();

        // Check that rule contains endpoints, like Gauss-Lobatto should
        assert_eq!(rule.1.first().unwrap(), &[-1.0]);
        assert_eq!(rule.1.last().unwrap(), &[1.0]);
        assert!(rule.1.windows(2).all(|pair| pair[0][0] < pair[1][0]));

        // Also test that weights are positive
        assert!(rule.0.iter().all(|&w| w > 0.0));

        for alpha in 0..=expected_polynomial_degree as i32 {
            let monomial = |x: f64| x.powi(alpha);
            let monomial_integral = (1.0 - (-1.0f64).powi(alpha + 1)) / (alpha as f64 + 1.0);
            let estimated_integral = integrate(&rule, |x| monomial(x[0]));

            assert_scalar_eq!(estimated_integral, monomial_integral, comp = abs, tol = 1e-13);
        }
    }
}

#[test]
fn unit_interval_rules_are_sorted_and_exact() {
    for n in 1..=10 {
        let rule = gauss_unit(n);
        assert!(rule.1.windows(2).all(|pair| pair[0][0] < pair[1][0]));
        assert!(rule.1.iter().all(|&[x]| x > 0.0 && x < 1.0));
        for alpha in 0..=(2 * n - 1) as i32 {
            let estimated_integral = integrate(&rule, |x| x[0].powi(alpha));
            assert_scalar_eq!(estimated_integral, 1.0 / (alpha as f64 + 1.0), comp = abs, tol = 1e-14);
        }
    }

    let lobatto = try_gauss_lobatto_unit(3).unwrap();
    assert_eq!(lobatto.1, vec![[0.0], [0.5], [1.0]]);
    assert_scalar_eq!(lobatto.0[0], 1.0 / 6.0, comp = abs, tol = 1e-15);
    assert_scalar_eq!(lobatto.0[1], 2.0 / 3.0, comp = abs, tol = 1e-15);
}
