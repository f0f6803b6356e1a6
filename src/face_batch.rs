//! Batches of faces between cells, for vectorized face integrals.
//!
//! Faces are collected from the locally owned cells. Every face is seen from an *interior*
//! cell and, unless it lies on the domain boundary, from an *exterior* cell. Cells are
//! referred to by their slot `batch * n_lanes + lane` in the [`CellBatches`].
//!
//! Faces between cells on different refinement levels are recorded from the finer side, with
//! the finer cell as interior cell and the number of the subface it covers.
use crate::cell_batch::{active_cells_behind_face, CellBatches};
use crate::mesh::{faces_per_cell, BoundaryId, CellHandle, MeshView, SubdomainId};
use itertools::Itertools;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use std::mem::size_of;
use std::ops::Range;

/// Marks faces in [`FaceBatches::cell_and_face_boundary_id`] that are not on the boundary.
pub const INTERNAL_FACE_BOUNDARY_ID: BoundaryId = BoundaryId::MAX;

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum FaceKind {
    /// Both cells are locally owned.
    Interior,
    /// The face has no exterior cell.
    Boundary,
    /// The exterior cell is a ghost cell.
    InnerGhost,
    /// Multigrid level faces whose exterior side only exists on a coarser level.
    RefinementEdge,
}

/// One face as seen by one lane of a face batch.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FaceLane {
    /// The finer cell of a coarse/fine face, which is a ghost if an owned coarse cell holds the face.
    pub interior_cell: usize,
    pub interior_face: usize,
    /// `None` for boundary and refinement edge faces.
    pub exterior_cell: Option<usize>,
    pub exterior_face: usize,
    /// The subface of the exterior cell's face covered by the interior cell, if the exterior
    /// cell is coarser.
    pub subface: Option<usize>,
    pub boundary_id: BoundaryId,
}

impl FaceLane {
    fn grouping_key(&self) -> (usize, usize, Option<usize>, BoundaryId) {
        (self.interior_face, self.exterior_face, self.subface, self.boundary_id)
    }
}

#[derive(Debug, Clone, Default)]
pub struct FaceSetupOptions {
    /// Keep every face next to an owned cell, even those the neighboring subdomain holds.
    pub hold_all_faces_to_owned_cells: bool,
    pub mg_level: Option<usize>,
}

/// The faces of the locally owned cells, grouped into batches.
///
/// Batches hold faces of a single kind, with equal local face numbers, subface and boundary id
/// on all lanes, and their cells come from a single segment between two hard boundaries of the
/// cell batches. The order is: interior faces, boundary faces, inner ghost faces, refinement
/// edge faces. The last batch of each group is padded by repeating its last face.
#[derive(Debug, Clone, Default)]
pub struct FaceBatches {
    n_lanes: usize,
    kinds: Vec<FaceKind>,
    lanes: Vec<FaceLane>,
    active_lanes: Vec<usize>,
    inner_partition_data: Vec<usize>,
    boundary_partition_data: Vec<usize>,
    ranges: [Range<usize>; 4],
    n_faces_per_cell: usize,
    cell_and_face_to_plain_faces: Vec<Option<usize>>,
    cell_and_face_boundary_id: Vec<BoundaryId>,
}

/// The subface of a coarse face covered by `cell`, whose ancestor on `coarse_level + 1`
/// touches the face.
fn subface_number<const DIM: usize, const SPACEDIM: usize>(
    mesh: &dyn MeshView<DIM, SPACEDIM>,
    cell: CellHandle,
    face: usize,
    coarse_level: usize,
) -> usize {
    let mut ancestor = cell;
    while ancestor.level > coarse_level + 1 {
        ancestor = mesh.parent(ancestor).expect("cells above level 0 have parents");
    }
    let child = mesh
        .child_index(ancestor)
        .expect("cells above level 0 have parents");
    // Drop the bit of the face normal direction
    let direction = face / 2;
    let low = child & ((1 << direction) - 1);
    let high = child >> (direction + 1);
    low | (high << direction)
}

impl FaceBatches {
    /// Collects and batches the faces of the owned cells in `batches`.
    ///
    /// `segments` are sorted batch indices at which a new scheduling segment starts (the hard
    /// boundaries of the cell schedule); faces belong to the segment of their later owned cell.
    pub fn build<const DIM: usize, const SPACEDIM: usize>(
        mesh: &dyn MeshView<DIM, SPACEDIM>,
        batches: &CellBatches,
        segments: &[usize],
        options: &FaceSetupOptions,
    ) -> Self {
        let n_lanes = batches.n_lanes();
        let n_faces = faces_per_cell(DIM);
        let n_owned_slots = batches.n_owned_batches() * n_lanes;

        let mut slot_of_cell = FxHashMap::default();
        for batch in 0..batches.n_batches() {
            for (lane, &cell) in batches.active_cells(batch).iter().enumerate() {
                slot_of_cell.insert(cell, batch * n_lanes + lane);
            }
        }

        let subdomain = |cell: CellHandle| -> SubdomainId {
            match options.mg_level {
                Some(_) => mesh.level_subdomain_id(cell),
                None => mesh.true_subdomain_id(cell),
            }
        };
        let own = mesh.locally_owned_subdomain();
        let segment_of = |slot: usize| segments.partition_point(|&boundary| boundary <= slot / n_lanes);

        // (kind, segment, face) in discovery order
        let mut found: Vec<(FaceKind, usize, FaceLane)> = Vec::new();
        for batch in 0..batches.n_owned_batches() {
            for (lane, &cell) in batches.active_cells(batch).iter().enumerate() {
                let slot = batch * n_lanes + lane;
                for face in 0..n_faces {
                    let mut record = FaceLane {
                        interior_cell: slot,
                        interior_face: face,
                        exterior_cell: None,
                        exterior_face: mesh.neighbor_face(cell, face),
                        subface: None,
                        boundary_id: INTERNAL_FACE_BOUNDARY_ID,
                    };
                    let Some(neighbor) = mesh.neighbor(cell, face) else {
                        record.boundary_id = mesh.boundary_id(cell, face);
                        found.push((FaceKind::Boundary, segment_of(slot), record));
                        continue;
                    };

                    if neighbor.level < cell.level {
                        if options.mg_level.is_some() {
                            found.push((FaceKind::RefinementEdge, segment_of(slot), record));
                            continue;
                        }
                        record.subface = Some(subface_number(mesh, cell, face, neighbor.level));
                    } else if options.mg_level.is_none() && mesh.has_children(neighbor) {
                        // Seen from the finer cells, unless those are ghosts that leave the face
                        // to this side
                        let neighbor_face = mesh.neighbor_face(cell, face);
                        for child in active_cells_behind_face(mesh, neighbor, neighbor_face) {
                            let Some(&child_slot) = slot_of_cell.get(&child) else {
                                continue;
                            };
                            let held_here = options.hold_all_faces_to_owned_cells || own < subdomain(child);
                            if child_slot < n_owned_slots || !held_here {
                                continue;
                            }
                            found.push((
                                FaceKind::InnerGhost,
                                segment_of(slot),
                                FaceLane {
                                    interior_cell: child_slot,
                                    interior_face: neighbor_face,
                                    exterior_cell: Some(slot),
                                    exterior_face: face,
                                    subface: Some(subface_number(mesh, child, neighbor_face, cell.level)),
                                    boundary_id: INTERNAL_FACE_BOUNDARY_ID,
                                },
                            ));
                        }
                        continue;
                    }

                    let Some(&neighbor_slot) = slot_of_cell.get(&neighbor) else {
                        continue;
                    };
                    record.exterior_cell = Some(neighbor_slot);
                    if neighbor_slot < n_owned_slots {
                        // Same-level faces between owned cells are recorded once
                        if record.subface.is_none() && neighbor_slot < slot {
                            continue;
                        }
                        let segment = segment_of(slot.max(neighbor_slot));
                        found.push((FaceKind::Interior, segment, record));
                    } else {
                        let held_here = options.hold_all_faces_to_owned_cells || own < subdomain(neighbor);
                        if held_here {
                            found.push((FaceKind::InnerGhost, segment_of(slot), record));
                        }
                    }
                }
            }
        }

        let mut face_batches = Self {
            n_lanes,
            n_faces_per_cell: n_faces,
            cell_and_face_to_plain_faces: vec![None; n_owned_slots * n_faces],
            cell_and_face_boundary_id: vec![INTERNAL_FACE_BOUNDARY_ID; n_owned_slots * n_faces],
            ..Default::default()
        };

        let n_segments = segments.len() + 1;
        let kinds = [
            FaceKind::Interior,
            FaceKind::Boundary,
            FaceKind::InnerGhost,
            FaceKind::RefinementEdge,
        ];
        for (k, kind) in kinds.into_iter().enumerate() {
            let start = face_batches.n_batches();
            let mut partition_data = vec![start];
            for segment in 0..n_segments {
                let faces = found
                    .iter()
                    .filter(|(face_kind, face_segment, _)| *face_kind == kind && *face_segment == segment)
                    .map(|(_, _, face)| *face)
                    .sorted_by_key(FaceLane::grouping_key)
                    .collect_vec();
                for (_, group) in &faces.into_iter().group_by(FaceLane::grouping_key) {
                    face_batches.push_group(kind, &group.collect_vec());
                }
                partition_data.push(face_batches.n_batches());
            }
            face_batches.ranges[k] = start..face_batches.n_batches();
            match kind {
                FaceKind::Interior => face_batches.inner_partition_data = partition_data,
                FaceKind::Boundary => face_batches.boundary_partition_data = partition_data,
                _ => {}
            }
        }

        for batch in 0..batches.n_owned_batches() {
            for (lane, &cell) in batches.active_cells(batch).iter().enumerate() {
                for face in 0..n_faces {
                    if mesh.neighbor(cell, face).is_none() {
                        let entry = face_batches.table_index(batch * n_lanes + lane, face);
                        face_batches.cell_and_face_boundary_id[entry] = mesh.boundary_id(cell, face);
                    }
                }
            }
        }

        log::debug!(
            "Collected {} face batches ({} interior, {} boundary, {} inner ghost, {} refinement edge)",
            face_batches.n_batches(),
            face_batches.ranges[0].len(),
            face_batches.ranges[1].len(),
            face_batches.ranges[2].len(),
            face_batches.ranges[3].len()
        );
        face_batches
    }

    fn table_index(&self, cell_slot: usize, face: usize) -> usize {
        let batch = cell_slot / self.n_lanes;
        let lane = cell_slot % self.n_lanes;
        (batch * self.n_faces_per_cell + face) * self.n_lanes + lane
    }

    fn push_group(&mut self, kind: FaceKind, faces: &[FaceLane]) {
        for chunk in faces.chunks(self.n_lanes) {
            let batch = self.n_batches();
            for (lane, face) in chunk.iter().enumerate() {
                let face_slot = batch * self.n_lanes + lane;
                let n_owned_slots = self.cell_and_face_to_plain_faces.len() / self.n_faces_per_cell;
                // A ghost interior cell belongs to a coarse/fine face seen from the coarse side
                if face.interior_cell < n_owned_slots {
                    let entry = self.table_index(face.interior_cell, face.interior_face);
                    self.cell_and_face_to_plain_faces[entry] = Some(face_slot);
                }
                if let Some(exterior) = face.exterior_cell {
                    if exterior < n_owned_slots {
                        let entry = self.table_index(exterior, face.exterior_face);
                        // A coarse face with several subfaces keeps the first one
                        if self.cell_and_face_to_plain_faces[entry].is_none() {
                            self.cell_and_face_to_plain_faces[entry] = Some(face_slot);
                        }
                    }
                }
            }
            let last = *chunk.last().expect("chunks are never empty");
            self.lanes.extend_from_slice(chunk);
            self.lanes
                .extend(std::iter::repeat(last).take(self.n_lanes - chunk.len()));
            self.kinds.push(kind);
            self.active_lanes.push(chunk.len());
        }
    }

    pub fn n_lanes(&self) -> usize {
        self.n_lanes
    }

    pub fn n_batches(&self) -> usize {
        self.active_lanes.len()
    }

    pub fn kind(&self, batch: usize) -> FaceKind {
        self.kinds[batch]
    }

    pub fn n_active_lanes(&self, batch: usize) -> usize {
        self.active_lanes[batch]
    }

    /// All lanes of the batch, including padding.
    pub fn batch(&self, batch: usize) -> &[FaceLane] {
        &self.lanes[batch * self.n_lanes..(batch + 1) * self.n_lanes]
    }

    /// The batches of the given kind.
    pub fn batches_of_kind(&self, kind: FaceKind) -> Range<usize> {
        let k = match kind {
            FaceKind::Interior => 0,
            FaceKind::Boundary => 1,
            FaceKind::InnerGhost => 2,
            FaceKind::RefinementEdge => 3,
        };
        self.ranges[k].clone()
    }

    /// Offsets of the interior face batches of each scheduling segment.
    pub fn inner_partition_data(&self) -> &[usize] {
        &self.inner_partition_data
    }

    /// Offsets of the boundary face batches of each scheduling segment.
    pub fn boundary_partition_data(&self) -> &[usize] {
        &self.boundary_partition_data
    }

    /// The face slot (`face_batch * n_lanes + lane`) through which the given owned cell lane
    /// sees its face, if the face is held locally.
    pub fn cell_and_face_to_plain_faces(&self, cell_batch: usize, face: usize, lane: usize) -> Option<usize> {
        self.cell_and_face_to_plain_faces[(cell_batch * self.n_faces_per_cell + face) * self.n_lanes + lane]
    }

    /// The boundary id of a face of an owned cell lane, or [`INTERNAL_FACE_BOUNDARY_ID`].
    pub fn cell_and_face_boundary_id(&self, cell_batch: usize, face: usize, lane: usize) -> BoundaryId {
        self.cell_and_face_boundary_id[(cell_batch * self.n_faces_per_cell + face) * self.n_lanes + lane]
    }

    pub fn memory_consumption(&self) -> usize {
        size_of::<Self>()
            + self.kinds.capacity() * size_of::<FaceKind>()
            + self.lanes.capacity() * size_of::<FaceLane>()
            + (self.active_lanes.capacity()
                + self.inner_partition_data.capacity()
                + self.boundary_partition_data.capacity())
                * size_of::<usize>()
            + self.cell_and_face_to_plain_faces.capacity() * size_of::<Option<usize>>()
            + self.cell_and_face_boundary_id.capacity() * size_of::<BoundaryId>()
    }
}
