//! Polynomial maps between the reference cell `[0, 1]^DIM` and the cells of a mesh.
//!
//! A cell is mapped by `x(ξ) = Σ_k N_k(ξ) s_k`, where `N_k` are tensor-product Lagrange
//! polynomials on Gauss–Lobatto nodes and `s_k` are the *support points* of the cell. The
//! support points are listed in hierarchical order: vertices first, then the points inside
//! lines, faces and the cell (see [`support_points`]).
//!
//! [`Mapping`] comes in three flavors, selected by [`MappingKind`]:
//! - `Q1`: the multilinear map defined by the cell vertices;
//! - `QGeneric`: a map of arbitrary degree whose support points are interpolated from the
//!   vertices;
//! - `FeField`: a map of arbitrary degree whose support points are read from a vector-valued
//!   [`PositionField`], which can describe curved cells and need not preserve the vertices.
use crate::mesh::{CellHandle, MeshView};
use crate::polynomials::{hierarchic_to_lexicographic_numbering, LagrangeBasis1d};
use crate::quadrature::Quadrature;
use crate::shape_info::ShapeInfoCache;
use matfree_quadrature::Rule;
use nalgebra::{Point, SMatrix};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fmt::{Debug, Display, Formatter};
use std::ops::{BitAnd, BitOr, BitOrAssign};
use std::sync::Arc;

mod data;
mod forward;
mod inverse;
pub mod support_points;

pub use data::{CellSimilarity, MappingData};
pub use forward::{CellMap, ReferenceDerivatives};
pub use support_points::{EulerPositionField, PositionField};

/// Selects the geometric quantities computed by [`GeometricMap::fill`].
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UpdateFlags(u32);

impl UpdateFlags {
    pub const DEFAULT: Self = Self(0);
    pub const QUADRATURE_POINTS: Self = Self(1 << 0);
    pub const COVARIANT_TRANSFORMATION: Self = Self(1 << 1);
    pub const CONTRAVARIANT_TRANSFORMATION: Self = Self(1 << 2);
    pub const VOLUME_ELEMENTS: Self = Self(1 << 3);
    pub const JXW_VALUES: Self = Self(1 << 4);
    pub const JACOBIANS: Self = Self(1 << 5);
    pub const INVERSE_JACOBIANS: Self = Self(1 << 6);
    pub const JACOBIAN_GRADS: Self = Self(1 << 7);
    pub const JACOBIAN_PUSHED_FORWARD_GRADS: Self = Self(1 << 8);
    pub const JACOBIAN_2ND_DERIVATIVES: Self = Self(1 << 9);
    pub const JACOBIAN_PUSHED_FORWARD_2ND_DERIVATIVES: Self = Self(1 << 10);
    pub const JACOBIAN_3RD_DERIVATIVES: Self = Self(1 << 11);
    pub const JACOBIAN_PUSHED_FORWARD_3RD_DERIVATIVES: Self = Self(1 << 12);
    pub const BOUNDARY_FORMS: Self = Self(1 << 13);
    pub const NORMAL_VECTORS: Self = Self(1 << 14);

    pub const fn empty() -> Self {
        Self::DEFAULT
    }

    pub const fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    pub const fn bits(self) -> u32 {
        self.0
    }

    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Whether all flags of `other` are set in `self`.
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// Whether any flag of `other` is set in `self`.
    pub const fn intersects(self, other: Self) -> bool {
        self.0 & other.0 != 0
    }
}

impl BitOr for UpdateFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl BitOrAssign for UpdateFlags {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

impl BitAnd for UpdateFlags {
    type Output = Self;

    fn bitand(self, rhs: Self) -> Self {
        Self(self.0 & rhs.0)
    }
}

/// The reason an inversion of the cell map failed.
#[derive(Debug, Clone, PartialEq)]
pub enum InversionFailure {
    /// The Jacobian had a non-positive determinant at an iterate.
    DegenerateJacobian,
    NoConvergence { iterations: usize },
    /// Damping could not reduce the residual.
    LineSearchFailed,
    /// The quadratic equation of the bilinear inverse has no distinct real roots.
    NegativeDiscriminant,
    /// Both denominators of the bilinear inverse vanish.
    VanishingDenominators,
}

impl Display for InversionFailure {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Self::DegenerateJacobian => write!(f, "Jacobian is not invertible"),
            Self::NoConvergence { iterations } => {
                write!(f, "Newton iteration did not converge in {iterations} iterations")
            }
            Self::LineSearchFailed => write!(f, "Line search failed to reduce the residual"),
            Self::NegativeDiscriminant => write!(f, "Discriminant is not positive"),
            Self::VanishingDenominators => write!(f, "Both denominators vanish"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum MappingError {
    /// The inverse map could not be computed for a point.
    TransformationFailed(InversionFailure),
    /// The Jacobian determinant is not positive at a quadrature point.
    DegenerateCell { quadrature_point: usize, determinant: f64 },
    UnsupportedDimension { dim: usize, spacedim: usize },
    InvalidInput(String),
}

impl Display for MappingError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Self::TransformationFailed(failure) => write!(f, "Transformation failed: {failure}"),
            Self::DegenerateCell {
                quadrature_point,
                determinant,
            } => write!(
                f,
                "Degenerate cell: Jacobian determinant {determinant} at quadrature point {quadrature_point}"
            ),
            Self::UnsupportedDimension { dim, spacedim } => {
                write!(f, "Unsupported combination dim = {dim}, spacedim = {spacedim}")
            }
            Self::InvalidInput(msg) => write!(f, "Invalid input: {msg}"),
        }
    }
}

impl std::error::Error for MappingError {}

impl From<InversionFailure> for MappingError {
    fn from(failure: InversionFailure) -> Self {
        Self::TransformationFailed(failure)
    }
}

/// Numerical parameters of the inverse map.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InverseMappingSettings {
    /// Tolerance on the Jacobian-weighted residual of the Newton iteration.
    pub newton_tolerance: f64,
    pub max_newton_iterations: usize,
    /// Smallest damping factor tried by the line search.
    pub min_step_length: f64,
    /// Tolerance of the codimension Newton iteration, relative to the cell diameter.
    pub codim_tolerance_factor: f64,
    pub max_codim_iterations: usize,
    /// A denominator of the bilinear inverse is considered usable if it exceeds this threshold
    /// times the largest absolute vertex coordinate in the same direction. This is an
    /// approximation policy for nearly degenerate cells.
    pub q1_denominator_threshold: f64,
    /// Relative size of the quadratic coefficient below which the bilinear inverse uses the
    /// cancellation-free root formula.
    pub parallelogram_threshold: f64,
    /// How far outside the unit cell a result of the bilinear inverse may lie and still be
    /// accepted without running Newton.
    pub unit_cell_epsilon: f64,
}

impl Default for InverseMappingSettings {
    fn default() -> Self {
        Self {
            newton_tolerance: 1e-11,
            max_newton_iterations: 20,
            min_step_length: 0.05,
            codim_tolerance_factor: 1e-12,
            max_codim_iterations: 10,
            q1_denominator_threshold: 1e-10,
            parallelogram_threshold: 1e-8,
            unit_cell_epsilon: 1e-15,
        }
    }
}

/// The source of the support points of a [`Mapping`].
#[derive(Debug, Clone)]
pub enum MappingKind<const DIM: usize, const SPACEDIM: usize> {
    Q1,
    QGeneric,
    FeField(Arc<dyn PositionField<DIM, SPACEDIM>>),
}

/// Capabilities of a geometric map between the reference cell and the cells of a mesh.
pub trait GeometricMap<const DIM: usize, const SPACEDIM: usize>: Send + Sync {
    fn degree(&self) -> usize;

    /// Whether the map sends the reference vertices to the mesh vertices.
    fn preserves_vertex_locations(&self) -> bool;

    /// Support points of the cell in hierarchical order.
    fn compute_support_points(&self, mesh: &dyn MeshView<DIM, SPACEDIM>, cell: CellHandle) -> Vec<Point<f64, SPACEDIM>>;

    fn transform_unit_to_real_cell(
        &self,
        mesh: &dyn MeshView<DIM, SPACEDIM>,
        cell: CellHandle,
        reference_point: &Point<f64, DIM>,
    ) -> Point<f64, SPACEDIM>;

    fn jacobian(
        &self,
        mesh: &dyn MeshView<DIM, SPACEDIM>,
        cell: CellHandle,
        reference_point: &Point<f64, DIM>,
    ) -> SMatrix<f64, SPACEDIM, DIM>;

    /// Finds the reference point mapped to `point`.
    ///
    /// For `DIM < SPACEDIM`, the result is the reference point of the closest point on the
    /// cell.
    fn transform_real_to_unit_cell(
        &self,
        mesh: &dyn MeshView<DIM, SPACEDIM>,
        cell: CellHandle,
        point: &Point<f64, SPACEDIM>,
    ) -> Result<Point<f64, DIM>, MappingError>;

    /// Inverts the map for several points of the same cell.
    ///
    /// Each point gets its own result, so that one failing point does not affect the others.
    fn transform_points_real_to_unit_cell(
        &self,
        mesh: &dyn MeshView<DIM, SPACEDIM>,
        cell: CellHandle,
        points: &[Point<f64, SPACEDIM>],
    ) -> Vec<Result<Point<f64, DIM>, MappingError>> {
        points
            .iter()
            .map(|p| {
                let result = self.transform_real_to_unit_cell(mesh, cell, p);
                if let Err(err) = &result {
                    log::warn!("Inversion of point {:?} on cell {:?} failed: {}", p, cell, err);
                }
                result
            })
            .collect()
    }

    /// Adds the flags needed to compute the requested quantities.
    fn requires_update_flags(&self, flags: UpdateFlags) -> UpdateFlags;

    /// Creates the evaluation context for the given flags and quadrature on the cell.
    fn get_data(&self, flags: UpdateFlags, quadrature: &Quadrature<DIM>) -> MappingData<DIM, SPACEDIM>;

    /// Creates the evaluation context for a face of the cell, with the tensor product of the
    /// given rule as quadrature on the face.
    fn get_face_data(&self, flags: UpdateFlags, face: usize, rule_1d: &Rule<1>) -> MappingData<DIM, SPACEDIM>;

    /// Computes the geometric quantities selected in `data` on the given cell.
    fn fill(
        &self,
        mesh: &dyn MeshView<DIM, SPACEDIM>,
        cell: CellHandle,
        data: &mut MappingData<DIM, SPACEDIM>,
    ) -> Result<CellSimilarity, MappingError>;
}

/// A polynomial map of fixed degree. See the [module documentation](self).
#[derive(Debug, Clone)]
pub struct Mapping<const DIM: usize, const SPACEDIM: usize> {
    kind: MappingKind<DIM, SPACEDIM>,
    basis: LagrangeBasis1d,
    hierarchic_to_lex: Vec<usize>,
    settings: InverseMappingSettings,
    shape_info_cache: Arc<ShapeInfoCache>,
}

impl<const DIM: usize, const SPACEDIM: usize> Mapping<DIM, SPACEDIM> {
    fn with_kind(kind: MappingKind<DIM, SPACEDIM>, degree: usize) -> Self {
        assert!(
            (1..=3).contains(&DIM) && (DIM..=3).contains(&SPACEDIM),
            "unsupported combination dim = {DIM}, spacedim = {SPACEDIM}"
        );
        assert!(degree >= 1, "mapping degree must be at least 1");
        Self {
            kind,
            basis: LagrangeBasis1d::gauss_lobatto(degree),
            hierarchic_to_lex: hierarchic_to_lexicographic_numbering(DIM, degree),
            settings: InverseMappingSettings::default(),
            shape_info_cache: Arc::new(ShapeInfoCache::new()),
        }
    }

    /// The multilinear map given by the cell vertices.
    pub fn q1() -> Self {
        Self::with_kind(MappingKind::Q1, 1)
    }

    /// A map of the given degree with support points interpolated from the vertices.
    pub fn q_generic(degree: usize) -> Self {
        if degree == 1 {
            Self::q1()
        } else {
            Self::with_kind(MappingKind::QGeneric, degree)
        }
    }

    /// A map whose support points are given by a position field.
    pub fn fe_field(field: Arc<dyn PositionField<DIM, SPACEDIM>>) -> Self {
        let degree = field.degree();
        Self::with_kind(MappingKind::FeField(field), degree)
    }

    pub fn with_settings(mut self, settings: InverseMappingSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Uses the given cache for the shape data of the tensor-product evaluation path.
    pub fn with_shape_info_cache(mut self, cache: Arc<ShapeInfoCache>) -> Self {
        self.shape_info_cache = cache;
        self
    }

    pub fn kind(&self) -> &MappingKind<DIM, SPACEDIM> {
        &self.kind
    }

    pub fn settings(&self) -> &InverseMappingSettings {
        &self.settings
    }

    pub fn basis(&self) -> &LagrangeBasis1d {
        &self.basis
    }

    pub fn shape_info_cache(&self) -> &Arc<ShapeInfoCache> {
        &self.shape_info_cache
    }

    /// The map of a single cell.
    pub fn cell_map(&self, mesh: &dyn MeshView<DIM, SPACEDIM>, cell: CellHandle) -> CellMap<'_, DIM, SPACEDIM> {
        let support_points = self.compute_support_points(mesh, cell);
        CellMap::from_hierarchical(&self.basis, &support_points, &self.hierarchic_to_lex)
    }
}

impl<const DIM: usize, const SPACEDIM: usize> GeometricMap<DIM, SPACEDIM> for Mapping<DIM, SPACEDIM> {
    fn degree(&self) -> usize {
        self.basis.degree()
    }

    fn preserves_vertex_locations(&self) -> bool {
        !matches!(self.kind, MappingKind::FeField(_))
    }

    fn compute_support_points(&self, mesh: &dyn MeshView<DIM, SPACEDIM>, cell: CellHandle) -> Vec<Point<f64, SPACEDIM>> {
        match &self.kind {
            MappingKind::Q1 => mesh.vertices(cell),
            MappingKind::QGeneric => {
                support_points::interpolate_from_vertices::<DIM, SPACEDIM>(&mesh.vertices(cell), &self.basis, &self.hierarchic_to_lex)
            }
            MappingKind::FeField(field) => {
                let mut points = Vec::new();
                field.support_points(cell, &mut points);
                points
            }
        }
    }

    fn transform_unit_to_real_cell(
        &self,
        mesh: &dyn MeshView<DIM, SPACEDIM>,
        cell: CellHandle,
        reference_point: &Point<f64, DIM>,
    ) -> Point<f64, SPACEDIM> {
        self.cell_map(mesh, cell).value(reference_point)
    }

    fn jacobian(
        &self,
        mesh: &dyn MeshView<DIM, SPACEDIM>,
        cell: CellHandle,
        reference_point: &Point<f64, DIM>,
    ) -> SMatrix<f64, SPACEDIM, DIM> {
        self.cell_map(mesh, cell).jacobian(reference_point)
    }

    fn transform_real_to_unit_cell(
        &self,
        mesh: &dyn MeshView<DIM, SPACEDIM>,
        cell: CellHandle,
        point: &Point<f64, SPACEDIM>,
    ) -> Result<Point<f64, DIM>, MappingError> {
        let vertices = mesh.vertices(cell);
        let cell_map = self.cell_map(mesh, cell);
        inverse::transform_real_to_unit_cell(
            &cell_map,
            &vertices,
            self.preserves_vertex_locations(),
            mesh.diameter(cell),
            point,
            &self.settings,
        )
    }

    fn requires_update_flags(&self, flags: UpdateFlags) -> UpdateFlags {
        requires_update_flags(flags)
    }

    fn get_data(&self, flags: UpdateFlags, quadrature: &Quadrature<DIM>) -> MappingData<DIM, SPACEDIM> {
        let flags = self.requires_update_flags(flags);
        let shape_info = match quadrature.tensor_factor() {
            Some(rule_1d) if self.degree() >= 2 => {
                Some(self.shape_info_cache.get_or_insert(DIM, self.degree(), 1, rule_1d))
            }
            _ => None,
        };
        MappingData::new(flags, quadrature.points().to_vec(), quadrature.weights().to_vec(), None, shape_info)
    }

    fn get_face_data(&self, flags: UpdateFlags, face: usize, rule_1d: &Rule<1>) -> MappingData<DIM, SPACEDIM> {
        assert!(face < 2 * DIM, "face {face} out of range");
        let flags = self.requires_update_flags(flags);
        let (weights, points) = data::face_quadrature::<DIM>(face, rule_1d);
        MappingData::new(flags, points, weights, Some(face), None)
    }

    fn fill(
        &self,
        mesh: &dyn MeshView<DIM, SPACEDIM>,
        cell: CellHandle,
        data: &mut MappingData<DIM, SPACEDIM>,
    ) -> Result<CellSimilarity, MappingError> {
        let support_points = self.compute_support_points(mesh, cell);
        data.fill(&self.basis, &self.hierarchic_to_lex, support_points)
    }
}

/// Closes `flags` under the dependencies between geometric quantities.
pub fn requires_update_flags(flags: UpdateFlags) -> UpdateFlags {
    use UpdateFlags as F;
    let mut out = flags;
    loop {
        let previous = out;
        if out.intersects(F::JXW_VALUES | F::NORMAL_VECTORS) {
            out |= F::BOUNDARY_FORMS;
        }
        if out.intersects(
            F::COVARIANT_TRANSFORMATION
                | F::JXW_VALUES
                | F::JACOBIANS
                | F::JACOBIAN_GRADS
                | F::BOUNDARY_FORMS
                | F::NORMAL_VECTORS,
        ) {
            out |= F::CONTRAVARIANT_TRANSFORMATION;
        }
        if out.intersects(
            F::INVERSE_JACOBIANS
                | F::JACOBIAN_PUSHED_FORWARD_GRADS
                | F::JACOBIAN_PUSHED_FORWARD_2ND_DERIVATIVES
                | F::JACOBIAN_PUSHED_FORWARD_3RD_DERIVATIVES,
        ) {
            out |= F::COVARIANT_TRANSFORMATION;
        }
        if out.intersects(F::CONTRAVARIANT_TRANSFORMATION | F::NORMAL_VECTORS) {
            out |= F::VOLUME_ELEMENTS;
        }
        if out == previous {
            return out;
        }
    }
}

impl<const DIM: usize, const SPACEDIM: usize> Debug for dyn PositionField<DIM, SPACEDIM> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "PositionField(degree = {})", self.degree())
    }
}
