//! Sum-factorization kernels for tensor-product bases.
//!
//! Arrays are stored lexicographically with the first direction running fastest. A
//! one-dimensional operator is applied along a single direction at a time, so that evaluating
//! a `d`-dimensional tensor-product basis at a tensor-product point set costs `O(d n^(d+1))`
//! operations instead of `O(n^(2d))`.

/// A dense one-dimensional operator stored in row-major order.
///
/// Rows correspond to evaluation points, columns to basis functions.
#[derive(Debug, Clone, Copy)]
pub struct Operator1d<'a> {
    values: &'a [f64],
    n_rows: usize,
    n_cols: usize,
}

impl<'a> Operator1d<'a> {
    pub fn new(values: &'a [f64], n_rows: usize, n_cols: usize) -> Self {
        assert_eq!(values.len(), n_rows * n_cols, "operator dimensions do not match data");
        Self { values, n_rows, n_cols }
    }

    pub fn n_rows(&self) -> usize {
        self.n_rows
    }

    pub fn n_cols(&self) -> usize {
        self.n_cols
    }

    #[inline]
    fn entry(&self, row: usize, col: usize) -> f64 {
        self.values[row * self.n_cols + col]
    }
}

/// Reusable buffers for sequences of one-dimensional contractions.
#[derive(Debug, Default, Clone)]
pub struct TensorWorkspace {
    first: Vec<f64>,
    second: Vec<f64>,
}

/// Applies `op` (or its transpose) along `direction` of the array `input` with the given extents.
///
/// The result is written to `output`, whose extents agree with `extents` except in
/// `direction`, where it is the number of rows (or columns, when transposed) of the operator.
pub fn apply_along_direction(
    op: &Operator1d,
    transpose: bool,
    extents: &[usize],
    direction: usize,
    input: &[f64],
    output: &mut [f64],
) {
    let (n_out, n_in) = if transpose {
        (op.n_cols, op.n_rows)
    } else {
        (op.n_rows, op.n_cols)
    };
    assert_eq!(extents[direction], n_in, "operator does not match array extent");
    let stride: usize = extents[..direction].iter().product();
    let n_high: usize = extents[direction + 1..].iter().product();
    assert_eq!(input.len(), stride * n_in * n_high);
    assert_eq!(output.len(), stride * n_out * n_high);

    for high in 0..n_high {
        let in_offset = high * n_in * stride;
        let out_offset = high * n_out * stride;
        for k in 0..n_out {
            for low in 0..stride {
                let mut sum = 0.0;
                for j in 0..n_in {
                    let a = if transpose { op.entry(j, k) } else { op.entry(k, j) };
                    sum += a * input[in_offset + j * stride + low];
                }
                output[out_offset + k * stride + low] = sum;
            }
        }
    }
}

/// Applies one operator per direction to `input`, which has `n_in` entries in each direction.
///
/// When `add` is set, the result is added to `output` instead of overwriting it.
pub fn apply_tensor_product(
    operators: &[Operator1d],
    transpose: bool,
    input: &[f64],
    output: &mut [f64],
    add: bool,
    workspace: &mut TensorWorkspace,
) {
    let dim = operators.len();
    let mut extents: Vec<usize> = operators
        .iter()
        .map(|op| if transpose { op.n_rows } else { op.n_cols })
        .collect();
    assert_eq!(input.len(), extents.iter().product::<usize>());

    let TensorWorkspace { first, second } = workspace;
    first.clear();
    first.extend_from_slice(input);
    for (direction, op) in operators.iter().enumerate() {
        let n_out = if transpose { op.n_cols } else { op.n_rows };
        let out_len = extents.iter().product::<usize>() / extents[direction] * n_out;
        second.clear();
        second.resize(out_len, 0.0);
        apply_along_direction(op, transpose, &extents, direction, first, second);
        extents[direction] = n_out;
        std::mem::swap(&mut *first, &mut *second);
    }
    debug_assert_eq!(dim, extents.len());

    assert_eq!(output.len(), first.len(), "output has wrong length");
    if add {
        for (o, r) in output.iter_mut().zip(first.iter()) {
            *o += r;
        }
    } else {
        output.copy_from_slice(first);
    }
}

/// Number of independent entries of a symmetric `dim x dim` tensor.
pub const fn n_hessian_components(dim: usize) -> usize {
    dim * (dim + 1) / 2
}

/// The pair of directions stored at position `component` of the symmetric Hessian storage.
///
/// Diagonal entries come first, followed by the upper off-diagonal entries in row-major order,
/// i.e. `00, 11, 01` in 2D and `00, 11, 22, 01, 02, 12` in 3D.
pub fn hessian_component_directions(dim: usize, component: usize) -> (usize, usize) {
    if component < dim {
        return (component, component);
    }
    let mut position = dim;
    for i in 0..dim {
        for j in i + 1..dim {
            if position == component {
                return (i, j);
            }
            position += 1;
        }
    }
    panic!("Hessian component {component} out of range for dimension {dim}");
}

/// One-dimensional shape data needed to evaluate a tensor-product basis at a tensor-product
/// point set.
#[derive(Debug, Clone, Copy)]
pub struct TensorShapeData<'a> {
    pub values: Operator1d<'a>,
    pub gradients: Operator1d<'a>,
    pub hessians: Operator1d<'a>,
}

/// Which quantities to compute at (or integrate from) the quadrature points.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EvaluationFlags {
    pub values: bool,
    pub gradients: bool,
    pub hessians: bool,
}

impl EvaluationFlags {
    pub const VALUES: Self = Self {
        values: true,
        gradients: false,
        hessians: false,
    };
    pub const GRADIENTS: Self = Self {
        values: false,
        gradients: true,
        hessians: false,
    };
    pub const VALUES_AND_GRADIENTS: Self = Self {
        values: true,
        gradients: true,
        hessians: false,
    };
    pub const ALL: Self = Self {
        values: true,
        gradients: true,
        hessians: true,
    };
}

fn operators_for_derivative<'a>(
    shape: &TensorShapeData<'a>,
    dim: usize,
    orders: &[usize],
    out: &mut Vec<Operator1d<'a>>,
) {
    out.clear();
    for d in 0..dim {
        out.push(match orders[d] {
            0 => shape.values,
            1 => shape.gradients,
            2 => shape.hessians,
            order => panic!("derivative order {order} not supported by the tensor kernels"),
        });
    }
}

/// Evaluates a scalar tensor-product field at all quadrature points.
///
/// `dof_values` are the coefficients in lexicographic order. On return, `values` holds the
/// values at the `n_q` quadrature points, `gradients[d * n_q + q]` holds the reference
/// derivative in direction `d` and `hessians[c * n_q + q]` the symmetric Hessian component `c`
/// (see [`hessian_component_directions`]). Buffers for quantities not requested are left
/// untouched.
pub fn evaluate(
    shape: &TensorShapeData,
    dim: usize,
    flags: EvaluationFlags,
    dof_values: &[f64],
    values: &mut [f64],
    gradients: &mut [f64],
    hessians: &mut [f64],
    workspace: &mut TensorWorkspace,
) {
    let n_q = shape.values.n_rows().pow(dim as u32);
    let mut ops = Vec::with_capacity(dim);
    let mut orders = vec![0; dim];
    if flags.values {
        operators_for_derivative(shape, dim, &orders, &mut ops);
        apply_tensor_product(&ops, false, dof_values, &mut values[..n_q], false, workspace);
    }
    if flags.gradients {
        for d in 0..dim {
            orders.fill(0);
            orders[d] = 1;
            operators_for_derivative(shape, dim, &orders, &mut ops);
            let out = &mut gradients[d * n_q..(d + 1) * n_q];
            apply_tensor_product(&ops, false, dof_values, out, false, workspace);
        }
    }
    if flags.hessians {
        for c in 0..n_hessian_components(dim) {
            let (i, j) = hessian_component_directions(dim, c);
            orders.fill(0);
            orders[i] += 1;
            orders[j] += 1;
            operators_for_derivative(shape, dim, &orders, &mut ops);
            let out = &mut hessians[c * n_q..(c + 1) * n_q];
            apply_tensor_product(&ops, false, dof_values, out, false, workspace);
        }
    }
}

/// The transpose of [`evaluate`] for values and gradients: tests the quadrature-point data
/// with all basis functions and sums the contributions into `dof_values`.
pub fn integrate(
    shape: &TensorShapeData,
    dim: usize,
    flags: EvaluationFlags,
    values: &[f64],
    gradients: &[f64],
    dof_values: &mut [f64],
    workspace: &mut TensorWorkspace,
) {
    assert!(!flags.hessians, "integration of Hessians is not supported");
    let n_q = shape.values.n_rows().pow(dim as u32);
    dof_values.fill(0.0);
    let mut ops = Vec::with_capacity(dim);
    let mut orders = vec![0; dim];
    if flags.values {
        operators_for_derivative(shape, dim, &orders, &mut ops);
        apply_tensor_product(&ops, true, &values[..n_q], dof_values, true, workspace);
    }
    if flags.gradients {
        for d in 0..dim {
            orders.fill(0);
            orders[d] = 1;
            operators_for_derivative(shape, dim, &orders, &mut ops);
            let input = &gradients[d * n_q..(d + 1) * n_q];
            apply_tensor_product(&ops, true, input, dof_values, true, workspace);
        }
    }
}
