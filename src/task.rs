//! Scheduling of cell batches for (possibly) parallel execution.
//!
//! The scheduler orders the locally owned cells, forms batches from them and produces an
//! execution plan made of *stages*. Stages run one after another, while the *blocks* of
//! batches inside one stage never write to the same DoF and may run concurrently.
//!
//! Cells adjacent to other subdomains ("boundary" cells) are segregated into their own
//! section so that communication for ghost values can be overlapped with the interior work.
use crate::cell_batch::CellBatches;
use crate::connectivity::ConnectivityGraph;
use crate::mesh::{max_children_per_cell, CellHandle, MeshView};
use itertools::Itertools;
use rayon::prelude::*;
use rustc_hash::FxHashSet;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::mem::size_of;
use std::ops::Range;

#[derive(Debug, Copy, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum TaskScheme {
    /// Serial execution.
    #[default]
    None,
    /// Layers of the connectivity graph, grown outwards from the subdomain boundary.
    /// Even layers run concurrently, then odd layers.
    Partition,
    /// Greedy coloring of the batch graph; batches of one color run concurrently.
    Color,
}

impl TaskScheme {
    pub fn is_threaded(&self) -> bool {
        !matches!(self, TaskScheme::None)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchedulingOptions {
    pub scheme: TaskScheme,
    /// Number of batches per block when coloring.
    pub block_size: usize,
    pub n_lanes: usize,
    /// Whether batches may only hold cells of a single category.
    pub categories_strict: bool,
}

/// The result of scheduling: an ordering of the batches and the plan to execute them.
#[derive(Debug, Clone)]
pub struct TaskInfo {
    scheme: TaskScheme,
    cell_partition_data: [usize; 5],
    stages: Vec<Vec<Range<usize>>>,
    hard_boundaries: Vec<usize>,
    batch_color: Vec<usize>,
    n_colors: usize,
    batch_category: Vec<u32>,
    batch_graph: ConnectivityGraph,
}

impl TaskInfo {
    pub fn scheme(&self) -> TaskScheme {
        self.scheme
    }

    /// Batch offsets `[0, end_interior_a, end_boundary, end_owned, end_ghost]`.
    ///
    /// The owned batches consist of a first interior section, the boundary section and a
    /// second interior section. Threaded schemes leave the first interior section empty.
    pub fn cell_partition_data(&self) -> &[usize; 5] {
        &self.cell_partition_data
    }

    pub fn boundary_batches(&self) -> Range<usize> {
        self.cell_partition_data[1]..self.cell_partition_data[2]
    }

    pub fn n_owned_batches(&self) -> usize {
        self.cell_partition_data[3]
    }

    pub fn stages(&self) -> &[Vec<Range<usize>>] {
        &self.stages
    }

    /// Sorted batch indices that separate groups of batches. No face batch may contain faces
    /// of cells from both sides of such a boundary.
    pub fn hard_boundaries(&self) -> &[usize] {
        &self.hard_boundaries
    }

    /// Color of each owned batch. Empty unless coloring was used.
    pub fn batch_colors(&self) -> &[usize] {
        &self.batch_color
    }

    pub fn n_colors(&self) -> usize {
        self.n_colors
    }

    pub fn batch_category(&self, batch: usize) -> u32 {
        self.batch_category[batch]
    }

    /// Conflicts between owned batches.
    pub fn batch_graph(&self) -> &ConnectivityGraph {
        &self.batch_graph
    }

    /// Runs `kernel` on every block of batches, stage by stage.
    pub fn execute<F>(&self, kernel: F)
    where
        F: Fn(Range<usize>) + Sync + Send,
    {
        for stage in &self.stages {
            if self.scheme.is_threaded() {
                stage.par_iter().for_each(|block| kernel(block.clone()));
            } else {
                for block in stage {
                    kernel(block.clone());
                }
            }
        }
    }

    pub fn memory_consumption(&self) -> usize {
        size_of::<Self>()
            + self
                .stages
                .iter()
                .map(|stage| size_of::<Vec<Range<usize>>>() + stage.capacity() * size_of::<Range<usize>>())
                .sum::<usize>()
            + (self.hard_boundaries.capacity() + self.batch_color.capacity()) * size_of::<usize>()
            + self.batch_category.capacity() * size_of::<u32>()
            + self.batch_graph.memory_consumption()
    }
}

/// Splits the cells into runs of complete sibling families and single cells.
fn sibling_units<const DIM: usize, const SPACEDIM: usize>(
    mesh: &dyn MeshView<DIM, SPACEDIM>,
    cells: &[CellHandle],
) -> Vec<Range<usize>> {
    let n_children = max_children_per_cell(DIM);
    let mut units = Vec::new();
    let mut i = 0;
    while i < cells.len() {
        let parent = mesh.parent(cells[i]);
        let is_family = parent.is_some()
            && mesh.child_index(cells[i]) == Some(0)
            && i + n_children <= cells.len()
            && (1..n_children).all(|k| mesh.parent(cells[i + k]) == parent);
        let len = if is_family { n_children } else { 1 };
        units.push(i..i + len);
        i += len;
    }
    units
}

struct Color {
    batches: Vec<usize>,
    blocked: FxHashSet<usize>,
}

impl Color {
    fn new_with_batch(batch: usize, neighbors: &[usize]) -> Self {
        let mut blocked: FxHashSet<usize> = neighbors.iter().copied().collect();
        blocked.insert(batch);
        Self {
            batches: vec![batch],
            blocked,
        }
    }

    fn try_add_batch(&mut self, batch: usize, neighbors: &[usize]) -> bool {
        if self.blocked.contains(&batch) {
            false
        } else {
            self.batches.push(batch);
            self.blocked.insert(batch);
            self.blocked.extend(neighbors.iter().copied());
            true
        }
    }
}

/// Assigns each vertex the first color that has no member adjacent to it.
///
/// Returns the vertices of each color, in the order they were visited.
pub fn sequential_greedy_coloring(
    vertices: impl IntoIterator<Item = usize>,
    graph: &ConnectivityGraph,
) -> Vec<Vec<usize>> {
    let mut colors = Vec::<Color>::new();

    'vertex_loop: for vertex in vertices {
        let neighbors = graph.neighbors(vertex);
        for color in &mut colors {
            if color.try_add_batch(vertex, neighbors) {
                continue 'vertex_loop;
            }
        }
        colors.push(Color::new_with_batch(vertex, neighbors));
    }

    colors.into_iter().map(|color| color.batches).collect()
}

/// Collects the cell positions of the units, ordered by category.
///
/// Returns one group per category if `strict`, else a single group.
fn category_groups(units: &[Range<usize>], categories: Option<&[u32]>, strict: bool) -> Vec<Vec<usize>> {
    let Some(categories) = categories else {
        return vec![units.iter().flat_map(|unit| unit.clone()).collect()];
    };
    // A family of mixed categories cannot stay together
    let cells = units
        .iter()
        .flat_map(|unit| {
            let category = categories[unit.start];
            if unit.clone().all(|i| categories[i] == category) {
                vec![unit.clone()]
            } else {
                unit.clone().map(|i| i..i + 1).collect()
            }
        })
        .sorted_by_key(|unit| categories[unit.start])
        .flat_map(|unit| unit)
        .collect_vec();
    if strict {
        cells
            .into_iter()
            .group_by(|&i| categories[i])
            .into_iter()
            .map(|(_, group)| group.collect())
            .collect()
    } else {
        vec![cells]
    }
}

/// Appends the batches of each group and records the group ends as hard boundaries.
fn push_groups(
    batches: &mut Vec<Vec<usize>>,
    hard_boundaries: &mut Vec<usize>,
    n_lanes: usize,
    groups: Vec<Vec<usize>>,
) -> Range<usize> {
    let start = batches.len();
    for group in groups {
        batches.extend(chunk_batches(&group, n_lanes));
        hard_boundaries.push(batches.len());
    }
    start..batches.len()
}

fn chunk_batches(group: &[usize], n_lanes: usize) -> Vec<Vec<usize>> {
    group.chunks(n_lanes).map(|chunk| chunk.to_vec()).collect()
}

/// Orders and batches the locally owned cells according to the requested scheme.
///
/// `boundary` marks cells that touch data of other subdomains, `graph` is the cell
/// connectivity over the positions of `cells`, and `categories` optionally assigns each cell
/// a vectorization category (only honored without threads).
pub fn schedule_cells<const DIM: usize, const SPACEDIM: usize>(
    mesh: &dyn MeshView<DIM, SPACEDIM>,
    cells: &[CellHandle],
    ghost_cells: &[CellHandle],
    boundary: &[bool],
    categories: Option<&[u32]>,
    graph: &ConnectivityGraph,
    options: &SchedulingOptions,
) -> (TaskInfo, CellBatches) {
    assert_eq!(boundary.len(), cells.len());
    assert_eq!(graph.n_vertices(), cells.len());
    assert!(options.n_lanes > 0);
    debug_assert!(
        categories.is_none() || !options.scheme.is_threaded(),
        "categories cannot be combined with threaded scheduling"
    );

    let units = sibling_units(mesh, cells);
    let (boundary_units, interior_units): (Vec<_>, Vec<_>) = units
        .iter()
        .cloned()
        .partition(|unit| unit.clone().any(|i| boundary[i]));
    let n_boundary_cells = boundary_units.iter().map(|unit| unit.len()).sum::<usize>();

    // Batches as lists of cell positions, in final order
    let mut batches: Vec<Vec<usize>> = Vec::new();
    let mut hard_boundaries = Vec::new();
    let mut stages: Vec<Vec<Range<usize>>> = Vec::new();
    let mut batch_color = Vec::new();
    let mut n_colors = 0;
    let mut partition_data = [0; 5];

    match options.scheme {
        TaskScheme::None => {
            let (first, second) = if boundary_units.is_empty() {
                (interior_units.as_slice(), &[][..])
            } else {
                let n_interior = cells.len() - n_boundary_cells;
                let mut count = 0;
                let split = interior_units
                    .iter()
                    .take_while(|unit| {
                        count += unit.len();
                        2 * count <= n_interior
                    })
                    .count();
                interior_units.split_at(split)
            };
            let sections = [first, boundary_units.as_slice(), second];
            for (s, section) in sections.into_iter().enumerate() {
                let range = push_groups(&mut batches, &mut hard_boundaries, options.n_lanes, category_groups(section, categories, options.categories_strict));
                partition_data[s + 1] = range.end;
                if !range.is_empty() {
                    stages.push(vec![range]);
                }
            }
        }
        TaskScheme::Color => {
            let sections = [&boundary_units, &interior_units].map(|section| {
                let cells = section.iter().flat_map(|unit| unit.clone()).collect_vec();
                chunk_batches(&cells, options.n_lanes)
            });
            let provisional = sections.iter().flatten().cloned().collect_vec();
            let provisional_graph = condense_to_batches(graph, &provisional);

            let mut offset = 0;
            for (s, section) in sections.iter().enumerate() {
                let colors = sequential_greedy_coloring(offset..offset + section.len(), &provisional_graph);
                offset += section.len();
                for color in colors {
                    let start = batches.len();
                    batches.extend(color.iter().map(|&b| provisional[b].clone()));
                    batch_color.extend(std::iter::repeat(n_colors).take(color.len()));
                    hard_boundaries.push(batches.len());
                    n_colors += 1;
                    let blocks = (start..batches.len())
                        .step_by(options.block_size.max(1))
                        .map(|b| b..(b + options.block_size.max(1)).min(batches.len()))
                        .collect();
                    stages.push(blocks);
                }
                // The first interior section stays empty
                partition_data[s + 2] = batches.len();
            }
        }
        TaskScheme::Partition => {
            let layers = graph_layers(graph, &units, &boundary_units);
            let n_layers = layers.iter().copied().max().map(|l| l + 1).unwrap_or(0);
            let mut layer_ranges = Vec::with_capacity(n_layers);
            for layer in 0..n_layers {
                let group = units
                    .iter()
                    .zip(&layers)
                    .filter(|(_, l)| **l == layer)
                    .flat_map(|(unit, _)| unit.clone())
                    .collect_vec();
                layer_ranges.push(push_groups(&mut batches, &mut hard_boundaries, options.n_lanes, vec![group]));
            }
            for parity in 0..2 {
                let stage = layer_ranges
                    .iter()
                    .skip(parity)
                    .step_by(2)
                    .filter(|range| !range.is_empty())
                    .cloned()
                    .collect_vec();
                if !stage.is_empty() {
                    stages.push(stage);
                }
            }
            partition_data[2] = if n_boundary_cells > 0 {
                layer_ranges.first().map(|range| range.end).unwrap_or(0)
            } else {
                0
            };
            partition_data[3] = batches.len();
        }
    }

    let n_owned_batches = batches.len();
    partition_data[3] = n_owned_batches;
    hard_boundaries.sort_unstable();
    hard_boundaries.dedup();

    let batch_category = batches
        .iter()
        .map(|batch| {
            categories
                .and_then(|categories| batch.iter().map(|&i| categories[i]).max())
                .unwrap_or(0)
        })
        .chain(std::iter::repeat(0).take(CellBatches::n_batches_for(ghost_cells.len(), options.n_lanes)))
        .collect();
    let batch_graph = condense_to_batches(graph, &batches);

    let handles = batches
        .iter()
        .map(|batch| batch.iter().map(|&i| cells[i]).collect_vec())
        .collect_vec();
    let cell_batches = CellBatches::from_groups(options.n_lanes, handles.iter().map(Vec::as_slice), ghost_cells);
    partition_data[4] = cell_batches.n_batches();

    log::debug!(
        "Scheduled {} cells into {} owned batches and {} stages ({:?})",
        cells.len(),
        n_owned_batches,
        stages.len(),
        options.scheme
    );

    let info = TaskInfo {
        scheme: options.scheme,
        cell_partition_data: partition_data,
        stages,
        hard_boundaries,
        batch_color,
        n_colors,
        batch_category,
        batch_graph,
    };
    (info, cell_batches)
}

fn condense_to_batches(graph: &ConnectivityGraph, batches: &[Vec<usize>]) -> ConnectivityGraph {
    let mut batch_of_cell = vec![0; graph.n_vertices()];
    for (b, batch) in batches.iter().enumerate() {
        for &i in batch {
            batch_of_cell[i] = b;
        }
    }
    graph.condense(&batch_of_cell, batches.len())
}

/// Breadth-first layering of the units, starting from the boundary units.
///
/// Units in components without boundary units are layered from their first unit.
fn graph_layers(graph: &ConnectivityGraph, units: &[Range<usize>], boundary_units: &[Range<usize>]) -> Vec<usize> {
    let mut unit_of_cell = vec![0; graph.n_vertices()];
    for (u, unit) in units.iter().enumerate() {
        for i in unit.clone() {
            unit_of_cell[i] = u;
        }
    }
    let unit_graph = graph.condense(&unit_of_cell, units.len());

    let mut layer = vec![usize::MAX; units.len()];
    let mut queue = VecDeque::new();
    for unit in boundary_units {
        let u = unit_of_cell[unit.start];
        layer[u] = 0;
        queue.push_back(u);
    }
    let mut next_seed = 0;
    loop {
        while let Some(u) = queue.pop_front() {
            for &v in unit_graph.neighbors(u) {
                if layer[v] == usize::MAX {
                    layer[v] = layer[u] + 1;
                    queue.push_back(v);
                }
            }
        }
        while next_seed < units.len() && layer[next_seed] != usize::MAX {
            next_seed += 1;
        }
        if next_seed == units.len() {
            break;
        }
        layer[next_seed] = 0;
        queue.push_back(next_seed);
    }
    layer
}
