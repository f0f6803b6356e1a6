//! Basic procedural mesh generation routines.
use crate::mesh::{vertices_per_cell, HierarchicalMesh, MeshError};
use nalgebra::{Point, SVector};

/// An axis-aligned box `[lower, upper]` split into `cells_per_dim[d]` cells in direction `d`.
///
/// Coarse cells and vertices are numbered lexicographically with the first direction running
/// fastest.
pub fn create_subdivided_hyper_rectangle<const D: usize>(
    lower: &Point<f64, D>,
    upper: &Point<f64, D>,
    cells_per_dim: [usize; D],
) -> HierarchicalMesh<D, D> {
    let vertices_per_dim = cells_per_dim.map(|n| n + 1);
    let n_vertices: usize = vertices_per_dim.iter().product();
    let n_cells: usize = cells_per_dim.iter().product();

    let vertices = (0..n_vertices)
        .map(|v| {
            let mut remainder = v;
            let mut coords = SVector::<f64, D>::zeros();
            for d in 0..D {
                let i = remainder % vertices_per_dim[d];
                remainder /= vertices_per_dim[d];
                let t = i as f64 / cells_per_dim[d] as f64;
                coords[d] = lower[d] + t * (upper[d] - lower[d]);
            }
            Point::from(coords)
        })
        .collect();

    let to_global_vertex_index = |multi_index: &[usize; D]| {
        let mut index = 0;
        let mut stride = 1;
        for d in 0..D {
            index += multi_index[d] * stride;
            stride *= vertices_per_dim[d];
        }
        index
    };

    let cells = (0..n_cells)
        .map(|c| {
            let mut remainder = c;
            let mut base = [0; D];
            for d in 0..D {
                base[d] = remainder % cells_per_dim[d];
                remainder /= cells_per_dim[d];
            }
            (0..vertices_per_cell(D))
                .map(|v| {
                    let mut corner = base;
                    for d in 0..D {
                        corner[d] += (v >> d) & 1;
                    }
                    to_global_vertex_index(&corner)
                })
                .collect()
        })
        .collect();

    HierarchicalMesh::from_coarse_cells(vertices, cells)
        .expect("a structured grid always forms a valid coarse mesh")
}

/// The unit cube `[0, 1]^D` split into `cells_per_dim` cells in every direction.
pub fn create_unit_hypercube_mesh<const D: usize>(cells_per_dim: usize) -> HierarchicalMesh<D, D> {
    create_subdivided_hyper_rectangle(&Point::origin(), &Point::from([1.0; D]), [cells_per_dim; D])
}

/// A single reference cell `[0, 1]^DIM`, embedded in `SPACEDIM` dimensions by padding
/// coordinates with zeros.
pub fn create_reference_cell_mesh<const DIM: usize, const SPACEDIM: usize>() -> HierarchicalMesh<DIM, SPACEDIM> {
    let vertices = (0..vertices_per_cell(DIM))
        .map(|v| {
            let mut coords = SVector::<f64, SPACEDIM>::zeros();
            for d in 0..DIM {
                coords[d] = ((v >> d) & 1) as f64;
            }
            Point::from(coords)
        })
        .collect();
    create_single_cell_mesh(vertices).expect("the reference cell is a valid mesh")
}

/// A mesh consisting of one cell with the given vertices in reference order.
pub fn create_single_cell_mesh<const DIM: usize, const SPACEDIM: usize>(
    vertices: Vec<Point<f64, SPACEDIM>>,
) -> Result<HierarchicalMesh<DIM, SPACEDIM>, MeshError> {
    let cell = (0..vertices.len()).collect();
    HierarchicalMesh::from_coarse_cells(vertices, vec![cell])
}
