//! Inversion of cell maps.
use crate::mapping::forward::{jacobian_determinant, jacobian_inverse, CellMap, ReferenceDerivatives};
use crate::mapping::{InverseMappingSettings, InversionFailure, MappingError};
use nalgebra::{Point, SMatrix, SVector};

pub(crate) fn transform_real_to_unit_cell<const DIM: usize, const SPACEDIM: usize>(
    cell_map: &CellMap<DIM, SPACEDIM>,
    vertices: &[Point<f64, SPACEDIM>],
    preserves_vertex_locations: bool,
    diameter: f64,
    point: &Point<f64, SPACEDIM>,
    settings: &InverseMappingSettings,
) -> Result<Point<f64, DIM>, MappingError> {
    let degree = cell_map.degree();
    if degree == 1 && DIM == SPACEDIM {
        // The support points of a linear map are its corners, which need not be the mesh
        // vertices
        let corners = cell_map.lexicographic_points();
        if DIM == 1 {
            return Ok(q1_inverse_1d(corners, point)?);
        }
        if DIM == 2 {
            match q1_inverse_2d(corners, point, settings) {
                Ok(xi) if is_inside_unit_cell(&xi, settings.unit_cell_epsilon) => return Ok(xi),
                Ok(xi) => log::debug!("Closed-form inverse {:?} outside of the unit cell, falling back to Newton", xi),
                Err(failure) => log::warn!("Closed-form inverse failed ({}), falling back to Newton", failure),
            }
        }
    }

    let initial_guess = if preserves_vertex_locations {
        match affine_inverse::<DIM, SPACEDIM>(vertices, point) {
            // The affine fit of a straight line is exact
            Some(xi) if DIM == 1 && degree == 1 => return Ok(xi),
            Some(xi) => xi,
            None => Point::from([0.5; DIM]),
        }
    } else {
        Point::from([0.5; DIM])
    };
    let initial_guess = initial_guess.map(|x| x.clamp(0.0, 1.0));

    if DIM == SPACEDIM {
        newton_inverse(cell_map, point, initial_guess, settings)
    } else {
        codim_newton_inverse(cell_map, point, initial_guess, diameter, settings)
    }
}

pub(crate) fn is_inside_unit_cell<const DIM: usize>(xi: &Point<f64, DIM>, epsilon: f64) -> bool {
    xi.iter().all(|x| *x >= -epsilon && *x <= 1.0 + epsilon)
}

fn q1_inverse_1d<const DIM: usize, const SPACEDIM: usize>(
    vertices: &[Point<f64, SPACEDIM>],
    point: &Point<f64, SPACEDIM>,
) -> Result<Point<f64, DIM>, InversionFailure> {
    let length = vertices[1][0] - vertices[0][0];
    if length <= 0.0 {
        return Err(InversionFailure::DegenerateJacobian);
    }
    let mut xi = Point::origin();
    xi[0] = (point[0] - vertices[0][0]) / length;
    Ok(xi)
}

/// 2D cross product.
fn cross(a: [f64; 2], b: [f64; 2]) -> f64 {
    a[0].mul_add(b[1], -a[1] * b[0])
}

/// Solves the bilinear equation `x(ξ, η) = p` in closed form.
///
/// Writing `x(ξ, η) - p = x0 + x1 ξ + x2 η + x3 ξ η`, eliminating `ξ` gives a quadratic
/// equation for `η`, whose root closer to the cell center is taken.
fn q1_inverse_2d<const DIM: usize, const SPACEDIM: usize>(
    vertices: &[Point<f64, SPACEDIM>],
    point: &Point<f64, SPACEDIM>,
    settings: &InverseMappingSettings,
) -> Result<Point<f64, DIM>, InversionFailure> {
    let v = |i: usize| [vertices[i][0], vertices[i][1]];
    let (v0, v1, v2, v3) = (v(0), v(1), v(2), v(3));
    let x0 = [v0[0] - point[0], v0[1] - point[1]];
    let x1 = [v1[0] - v0[0], v1[1] - v0[1]];
    let x2 = [v2[0] - v0[0], v2[1] - v0[1]];
    let x3 = [v0[0] - v1[0] - v2[0] + v3[0], v0[1] - v1[1] - v2[1] + v3[1]];

    let a = cross(x3, x2);
    let b = cross(x1, x2) + cross(x3, x0);
    let c = cross(x1, x0);

    let discriminant = b.mul_add(b, -4.0 * a * c);
    let eta = if a == 0.0 {
        if b == 0.0 {
            return Err(InversionFailure::NegativeDiscriminant);
        }
        -c / b
    } else {
        if !(discriminant > 0.0) {
            return Err(InversionFailure::NegativeDiscriminant);
        }
        let sqrt_discriminant = discriminant.sqrt();
        let (eta1, eta2) = if a.abs() < settings.parallelogram_threshold * b.abs() {
            // Avoids cancellation in -b + sqrt(disc) for nearly parallelogram cells
            (
                2.0 * c / (-b - sqrt_discriminant),
                2.0 * c / (-b + sqrt_discriminant),
            )
        } else {
            (
                (-b + sqrt_discriminant) / (2.0 * a),
                (-b - sqrt_discriminant) / (2.0 * a),
            )
        };
        match (eta1.is_finite(), eta2.is_finite()) {
            (true, true) if (eta1 - 0.5).abs() <= (eta2 - 0.5).abs() => eta1,
            (true, true) | (false, true) => eta2,
            (true, false) => eta1,
            (false, false) => return Err(InversionFailure::NegativeDiscriminant),
        }
    };

    let max_abs = |component: usize| {
        [v0, v1, v2, v3]
            .iter()
            .map(|v| v[component].abs())
            .fold(0.0, f64::max)
    };
    let denominator_x = x3[0].mul_add(eta, x1[0]);
    let denominator_y = x3[1].mul_add(eta, x1[1]);
    let xi = if denominator_x.abs() > settings.q1_denominator_threshold * max_abs(0) {
        -x2[0].mul_add(eta, x0[0]) / denominator_x
    } else if denominator_y.abs() > settings.q1_denominator_threshold * max_abs(1) {
        -x2[1].mul_add(eta, x0[1]) / denominator_y
    } else {
        return Err(InversionFailure::VanishingDenominators);
    };

    let mut result = Point::origin();
    result[0] = xi;
    result[1] = eta;
    Ok(result)
}

/// Inverts the least-squares affine fit of the vertices.
///
/// Returns `None` if the fit is degenerate.
pub(crate) fn affine_inverse<const DIM: usize, const SPACEDIM: usize>(
    vertices: &[Point<f64, SPACEDIM>],
    point: &Point<f64, SPACEDIM>,
) -> Option<Point<f64, DIM>> {
    let n = vertices.len() as f64;
    let center: SVector<f64, SPACEDIM> = vertices.iter().map(|v| v.coords).sum::<SVector<f64, SPACEDIM>>() / n;
    // For the vertices of the hypercube, the fitted linear part in direction d is the
    // difference between the mean of the upper and the lower vertices
    let mut a = SMatrix::<f64, SPACEDIM, DIM>::zeros();
    for (v, vertex) in vertices.iter().enumerate() {
        for d in 0..DIM {
            let sign = if (v >> d) & 1 == 1 { 1.0 } else { -1.0 };
            a.column_mut(d).axpy(2.0 * sign / n, &vertex.coords, 1.0);
        }
    }
    let a_inv = jacobian_inverse(&a)?;
    let xi = a_inv * (point.coords - center);
    Some(Point::from(xi.map(|x| x + 0.5)))
}

fn newton_inverse<const DIM: usize, const SPACEDIM: usize>(
    cell_map: &CellMap<DIM, SPACEDIM>,
    point: &Point<f64, SPACEDIM>,
    initial_guess: Point<f64, DIM>,
    settings: &InverseMappingSettings,
) -> Result<Point<f64, DIM>, MappingError> {
    let mut xi = initial_guess;
    let mut residual = point - cell_map.value(&xi);
    let mut jacobian = cell_map.jacobian(&xi);

    if residual.norm_squared() < 1e-24 * jacobian.norm_squared() {
        return Ok(xi);
    }

    let mut iterations = 0;
    loop {
        if jacobian_determinant(&jacobian) <= 0.0 {
            return Err(InversionFailure::DegenerateJacobian.into());
        }
        let jacobian_inv = jacobian_inverse(&jacobian).ok_or(InversionFailure::DegenerateJacobian)?;
        let delta = jacobian_inv * residual;

        let mut step_length = 1.0;
        loop {
            let xi_trial = xi + delta * step_length;
            let residual_trial = point - cell_map.value(&xi_trial);
            if residual_trial.norm() < residual.norm() {
                xi = xi_trial;
                residual = residual_trial;
                break;
            } else if step_length > settings.min_step_length {
                step_length /= 2.0;
            } else {
                return Err(InversionFailure::LineSearchFailed.into());
            }
        }

        iterations += 1;
        if iterations > settings.max_newton_iterations {
            return Err(InversionFailure::NoConvergence { iterations }.into());
        }
        // Measuring the residual in reference coordinates accounts for anisotropic cells
        if (jacobian_inv * residual).norm_squared() <= settings.newton_tolerance * settings.newton_tolerance {
            return Ok(xi);
        }
        jacobian = cell_map.jacobian(&xi);
    }
}

/// Newton iteration for the normal equations `Jᵀ(p - x(ξ)) = 0` of the closest point problem.
fn codim_newton_inverse<const DIM: usize, const SPACEDIM: usize>(
    cell_map: &CellMap<DIM, SPACEDIM>,
    point: &Point<f64, SPACEDIM>,
    initial_guess: Point<f64, DIM>,
    diameter: f64,
    settings: &InverseMappingSettings,
) -> Result<Point<f64, DIM>, MappingError> {
    let tolerance = settings.codim_tolerance_factor * diameter;
    let mut derivatives = ReferenceDerivatives::<DIM, SPACEDIM>::default();
    let mut xi = initial_guess;

    let evaluate = |xi: &Point<f64, DIM>, derivatives: &mut ReferenceDerivatives<DIM, SPACEDIM>| {
        cell_map.derivatives(xi, 2, derivatives);
        let p_minus_x = point - derivatives.value;
        let f: SVector<f64, DIM> = derivatives.jacobian.transpose() * p_minus_x;
        let df = SMatrix::<f64, DIM, DIM>::from_fn(|j, l| {
            -derivatives.jacobian.column(j).dot(&derivatives.jacobian.column(l))
                + derivatives.jacobian_grad[l].column(j).dot(&p_minus_x)
        });
        (f, df)
    };

    let (mut f, mut df) = evaluate(&xi, &mut derivatives);
    let mut iterations = 0;
    while f.norm() > tolerance {
        if iterations == settings.max_codim_iterations {
            return Err(InversionFailure::NoConvergence { iterations }.into());
        }
        iterations += 1;
        let df_inv = df
            .try_inverse()
            .ok_or(InversionFailure::DegenerateJacobian)?;
        let delta = df_inv * f;

        // Damp the step while it increases the residual
        let mut step_length = 1.0;
        loop {
            let xi_trial = xi - delta * step_length;
            let (f_trial, df_trial) = evaluate(&xi_trial, &mut derivatives);
            if f_trial.norm() < f.norm() || step_length <= settings.min_step_length {
                xi = xi_trial;
                f = f_trial;
                df = df_trial;
                break;
            }
            step_length /= 2.0;
        }
    }
    Ok(xi)
}
