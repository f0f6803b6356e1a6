//! Support points of polynomial cell maps.
//!
//! The `(p + 1)^DIM` support points of a degree `p` map sit at the tensor-product
//! Gauss–Lobatto lattice of the reference cell and are listed in hierarchical order: the
//! vertices first, followed by the points inside lines, faces (in 3D) and the cell.
use crate::dofs::{DofHandler, DofNumbering};
use crate::mesh::{vertices_per_cell, CellHandle, MeshView};
use crate::polynomials::{hierarchic_to_lexicographic_numbering, unravel_index, LagrangeBasis1d};
use nalgebra::{Point, SVector};

/// A source of support points for maps of a fixed degree, e.g. a discrete displacement or
/// position field.
pub trait PositionField<const DIM: usize, const SPACEDIM: usize>: Send + Sync {
    fn degree(&self) -> usize;

    /// Writes the support points of the cell, in hierarchical order, to `points`.
    fn support_points(&self, cell: CellHandle, points: &mut Vec<Point<f64, SPACEDIM>>);
}

/// Evaluates the multilinear interpolant of the vertices at a reference point.
pub fn multilinear_interpolation<const DIM: usize, const SPACEDIM: usize>(
    vertices: &[Point<f64, SPACEDIM>],
    reference_point: &[f64; DIM],
) -> Point<f64, SPACEDIM> {
    debug_assert_eq!(vertices.len(), vertices_per_cell(DIM));
    let mut x = SVector::<f64, SPACEDIM>::zeros();
    for (v, vertex) in vertices.iter().enumerate() {
        let weight: f64 = (0..DIM)
            .map(|d| {
                let t = reference_point[d];
                if (v >> d) & 1 == 1 {
                    t
                } else {
                    1.0 - t
                }
            })
            .product();
        x += vertex.coords * weight;
    }
    Point::from(x)
}

/// Places the support points of a straight-sided cell by multilinear interpolation of its
/// vertices.
pub fn interpolate_from_vertices<const DIM: usize, const SPACEDIM: usize>(
    vertices: &[Point<f64, SPACEDIM>],
    basis: &LagrangeBasis1d,
    hierarchic_to_lex: &[usize],
) -> Vec<Point<f64, SPACEDIM>> {
    let nodes = basis.nodes();
    hierarchic_to_lex
        .iter()
        .enumerate()
        .map(|(h, &lex)| {
            if h < vertices.len() {
                // Vertices are reproduced exactly
                vertices[h]
            } else {
                let multi_index: [usize; DIM] = unravel_index(lex, nodes.len());
                multilinear_interpolation::<DIM, SPACEDIM>(vertices, &multi_index.map(|i| nodes[i]))
            }
        })
        .collect()
}

/// A vector-valued field with `SPACEDIM` components on a continuous Q(p) numbering whose values
/// are the positions of the support points.
#[derive(Debug, Clone)]
pub struct EulerPositionField<const DIM: usize, const SPACEDIM: usize> {
    dofs: DofHandler<DIM>,
    values: Vec<f64>,
}

impl<const DIM: usize, const SPACEDIM: usize> EulerPositionField<DIM, SPACEDIM> {
    pub fn from_values(dofs: DofHandler<DIM>, values: Vec<f64>) -> Self {
        assert_eq!(dofs.n_components(), SPACEDIM, "position field needs SPACEDIM components");
        assert_eq!(values.len(), dofs.n_dofs(), "one value per DoF is needed");
        Self { dofs, values }
    }

    /// Interpolates `position(x)` at the support points of the straight-sided cells, where `x`
    /// runs over the points given by multilinear interpolation of the vertices.
    pub fn interpolate<F>(mesh: &dyn MeshView<DIM, SPACEDIM>, degree: usize, position: F) -> Self
    where
        F: Fn(&Point<f64, SPACEDIM>) -> Point<f64, SPACEDIM>,
    {
        let dofs = DofHandler::new(mesh, degree, SPACEDIM);
        let basis = LagrangeBasis1d::gauss_lobatto(degree);
        let hierarchic_to_lex = hierarchic_to_lexicographic_numbering(DIM, degree);
        let n_nodes = hierarchic_to_lex.len();
        let mut values = vec![0.0; dofs.n_dofs()];
        let mut indices = Vec::new();
        for cell in mesh.active_cells() {
            dofs.cell_dof_indices(cell, &mut indices);
            let points = interpolate_from_vertices::<DIM, SPACEDIM>(&mesh.vertices(cell), &basis, &hierarchic_to_lex);
            for (i, x) in points.iter().enumerate() {
                let y = position(x);
                for c in 0..SPACEDIM {
                    values[indices[c * n_nodes + i]] = y[c];
                }
            }
        }
        Self { dofs, values }
    }

    pub fn dofs(&self) -> &DofHandler<DIM> {
        &self.dofs
    }

    pub fn values(&self) -> &[f64] {
        &self.values
    }

    pub fn values_mut(&mut self) -> &mut [f64] {
        &mut self.values
    }
}

impl<const DIM: usize, const SPACEDIM: usize> PositionField<DIM, SPACEDIM> for EulerPositionField<DIM, SPACEDIM> {
    fn degree(&self) -> usize {
        self.dofs.degree()
    }

    fn support_points(&self, cell: CellHandle, points: &mut Vec<Point<f64, SPACEDIM>>) {
        let mut indices = Vec::new();
        self.dofs.cell_dof_indices(cell, &mut indices);
        let n_nodes = indices.len() / SPACEDIM;
        points.clear();
        points.extend((0..n_nodes).map(|i| Point::from(SVector::<f64, SPACEDIM>::from_fn(|c, _| self.values[indices[c * n_nodes + i]]))));
    }
}
