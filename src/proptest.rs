use crate::mesh::procedural::create_unit_hypercube_mesh;
use crate::mesh::{vertices_per_cell, HierarchicalMesh};
use ::proptest::collection::vec;
use ::proptest::prelude::*;
use nalgebra::{Point, SVector};
use std::cmp::max;

pub fn point<const D: usize>() -> impl Strategy<Value = Point<f64, D>> {
    // Pick a reasonably small range to pick coordinates from,
    // otherwise we can easily get floating point numbers that are
    // so ridiculously large as to break anything we might want to do with them
    vec(-10.0..10.0, D).prop_map(|coords| Point::from_slice(&coords))
}

/// Vertices (in reference order) of a cell obtained from an axis-aligned box by moving each
/// vertex by at most `max_perturbation` box lengths in each direction.
///
/// Perturbations well below `0.25` keep the multilinear map invertible.
pub fn perturbed_box_vertices<const D: usize>(max_perturbation: f64) -> impl Strategy<Value = Vec<Point<f64, D>>> {
    let n_vertices = vertices_per_cell(D);
    (
        point::<D>(),
        vec(0.5..2.0, D),
        vec(-max_perturbation..=max_perturbation, n_vertices * D),
    )
        .prop_map(move |(origin, lengths, offsets)| {
            (0..n_vertices)
                .map(|v| {
                    let coords = SVector::<f64, D>::from_fn(|d, _| {
                        let corner = ((v >> d) & 1) as f64;
                        origin[d] + lengths[d] * (corner + offsets[v * D + d])
                    });
                    Point::from(coords)
                })
                .collect()
        })
}

/// A unit hypercube split into at most `max_cells_per_dim` cells per direction, with interior
/// vertices moved by at most `max_perturbation` cell lengths in each direction.
pub fn perturbed_unit_mesh_strategy<const D: usize>(
    max_cells_per_dim: usize,
    max_perturbation: f64,
) -> impl Strategy<Value = HierarchicalMesh<D, D>> {
    (1..=max(1, max_cells_per_dim))
        .prop_flat_map(move |n| {
            let n_vertices = (n + 1).pow(D as u32);
            (Just(n), vec(-max_perturbation..=max_perturbation, n_vertices * D))
        })
        .prop_map(|(n, offsets)| {
            let mut mesh = create_unit_hypercube_mesh::<D>(n);
            let h = 1.0 / n as f64;
            let eps = 1e-12;
            for v in 0..mesh.vertex_positions().len() {
                let mut position = mesh.vertex_positions()[v];
                let is_interior = (0..D).all(|d| position[d] > eps && position[d] < 1.0 - eps);
                if is_interior {
                    for d in 0..D {
                        position[d] += h * offsets[v * D + d];
                    }
                    mesh.set_vertex_position(v, position);
                }
            }
            mesh
        })
}
