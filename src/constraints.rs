//! Affine constraints `x_i = sum_j w_ij x_j + b_i` between degrees of freedom.
use crate::dofs::DofNumbering;
use crate::mesh::{faces_per_cell, vertices_per_cell, CellHandle, MeshView};
use itertools::Itertools;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::fmt::{Display, Formatter};

/// A single constrained DoF.
#[derive(Debug, Clone, PartialEq)]
pub struct ConstraintLine {
    pub index: usize,
    pub entries: Vec<(usize, f64)>,
    pub inhomogeneity: f64,
}

/// How to resolve a DoF constrained in both tables of a merge.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum MergeConflictBehavior {
    NoConflictsAllowed,
    LeftObjectWins,
    RightObjectWins,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ConstraintError {
    /// The line was constrained in both tables of a merge.
    Conflict { line: usize },
    /// The tables of a merge store different sets of lines.
    DifferentLocalLines,
    /// The line is outside the set of lines the table may store.
    NotLocal { line: usize },
    /// The constraints of the line depend on the line itself.
    Cycle { line: usize },
    Unsupported(String),
}

impl Display for ConstraintError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Self::Conflict { line } => write!(f, "Line {line} is constrained in both tables"),
            Self::DifferentLocalLines => write!(f, "Constraint tables store different local lines"),
            Self::NotLocal { line } => write!(f, "Line {line} is not a local line of the table"),
            Self::Cycle { line } => write!(f, "Constraints of line {line} form a cycle"),
            Self::Unsupported(msg) => write!(f, "Unsupported constraints: {msg}"),
        }
    }
}

impl std::error::Error for ConstraintError {}

/// A table of affine constraints.
///
/// Lines are added with [`add_line`](Self::add_line) and filled with entries and an
/// inhomogeneity. Once all lines are known, [`close`](Self::close) resolves constraints that
/// refer to other constrained DoFs, so that afterwards every entry refers to an unconstrained
/// DoF.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConstraintTable {
    lines: BTreeMap<usize, ConstraintLine>,
    local_lines: Option<BTreeSet<usize>>,
    closed: bool,
}

impl ConstraintTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// A table that may only hold constraints for the given lines.
    pub fn with_local_lines(local_lines: impl IntoIterator<Item = usize>) -> Self {
        Self {
            local_lines: Some(local_lines.into_iter().collect()),
            ..Self::default()
        }
    }

    pub fn local_lines(&self) -> Option<&BTreeSet<usize>> {
        self.local_lines.as_ref()
    }

    fn check_local(&self, line: usize) -> Result<(), ConstraintError> {
        match &self.local_lines {
            Some(local) if !local.contains(&line) => Err(ConstraintError::NotLocal { line }),
            _ => Ok(()),
        }
    }

    /// Adds a line `x_line = 0`. Adding an existing line has no effect.
    pub fn add_line(&mut self, line: usize) -> Result<(), ConstraintError> {
        self.check_local(line)?;
        self.closed = false;
        self.lines.entry(line).or_insert_with(|| ConstraintLine {
            index: line,
            entries: Vec::new(),
            inhomogeneity: 0.0,
        });
        Ok(())
    }

    /// Adds `weight * x_column` to the right-hand side of an existing line.
    ///
    /// # Panics
    ///
    /// Panics if the line has not been added.
    pub fn add_entry(&mut self, line: usize, column: usize, weight: f64) {
        assert_ne!(line, column, "a line can not be constrained to itself");
        self.closed = false;
        let entries = &mut self
            .lines
            .get_mut(&line)
            .unwrap_or_else(|| panic!("line {line} has not been added"))
            .entries;
        match entries.iter_mut().find(|(j, _)| *j == column) {
            Some((_, w)) => *w = weight,
            None => entries.push((column, weight)),
        }
    }

    pub fn set_inhomogeneity(&mut self, line: usize, value: f64) {
        self.lines
            .get_mut(&line)
            .unwrap_or_else(|| panic!("line {line} has not been added"))
            .inhomogeneity = value;
    }

    pub fn is_constrained(&self, index: usize) -> bool {
        self.lines.contains_key(&index)
    }

    pub fn is_inhomogeneously_constrained(&self, index: usize) -> bool {
        self.lines
            .get(&index)
            .map(|line| line.inhomogeneity != 0.0)
            .unwrap_or(false)
    }

    pub fn constraint_entries(&self, index: usize) -> Option<&[(usize, f64)]> {
        self.lines.get(&index).map(|line| line.entries.as_slice())
    }

    pub fn inhomogeneity(&self, index: usize) -> f64 {
        self.lines
            .get(&index)
            .map(|line| line.inhomogeneity)
            .unwrap_or(0.0)
    }

    pub fn n_constraints(&self) -> usize {
        self.lines.len()
    }

    pub fn lines(&self) -> impl Iterator<Item = &ConstraintLine> {
        self.lines.values()
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Resolves chains of constraints and sorts the entries of each line.
    pub fn close(&mut self) -> Result<(), ConstraintError> {
        if self.closed {
            return Ok(());
        }
        let max_depth = self.lines.len() + 1;
        let indices = self.lines.keys().copied().collect_vec();
        for index in indices {
            let mut depth = 0;
            loop {
                let line = &self.lines[&index];
                let Some(position) = line
                    .entries
                    .iter()
                    .position(|(j, _)| self.lines.contains_key(j))
                else {
                    break;
                };
                depth += 1;
                if depth > max_depth {
                    return Err(ConstraintError::Cycle { line: index });
                }
                let (column, weight) = line.entries[position];
                if column == index {
                    return Err(ConstraintError::Cycle { line: index });
                }
                let replacement = self.lines[&column].clone();
                let line = self
                    .lines
                    .get_mut(&index)
                    .expect("line exists by construction");
                line.entries.swap_remove(position);
                line.inhomogeneity += weight * replacement.inhomogeneity;
                for (j, w) in replacement.entries {
                    match line.entries.iter_mut().find(|(k, _)| *k == j) {
                        Some((_, existing)) => *existing += weight * w,
                        None => line.entries.push((j, weight * w)),
                    }
                }
            }
            if let Some(line) = self.lines.get_mut(&index) {
                line.entries.sort_by_key(|(j, _)| *j);
            }
        }
        self.closed = true;
        Ok(())
    }

    /// Merges the constraints of `other` into this table.
    ///
    /// Entries of this table that refer to DoFs constrained in `other` are first expressed
    /// through the constraints of `other`. Lines present in both tables are resolved according
    /// to `behavior`.
    pub fn merge(
        &mut self,
        other: &ConstraintTable,
        behavior: MergeConflictBehavior,
        allow_different_local_lines: bool,
    ) -> Result<(), ConstraintError> {
        if !allow_different_local_lines && self.local_lines != other.local_lines {
            return Err(ConstraintError::DifferentLocalLines);
        }

        for line in self.lines.values_mut() {
            let mut resolved: Vec<(usize, f64)> = Vec::with_capacity(line.entries.len());
            for &(column, weight) in &line.entries {
                match other.lines.get(&column) {
                    Some(other_line) => {
                        line.inhomogeneity += weight * other_line.inhomogeneity;
                        for &(j, w) in &other_line.entries {
                            match resolved.iter_mut().find(|(k, _)| *k == j) {
                                Some((_, existing)) => *existing += weight * w,
                                None => resolved.push((j, weight * w)),
                            }
                        }
                    }
                    None => match resolved.iter_mut().find(|(k, _)| *k == column) {
                        Some((_, existing)) => *existing += weight,
                        None => resolved.push((column, weight)),
                    },
                }
            }
            line.entries = resolved;
        }

        for (index, other_line) in &other.lines {
            if allow_different_local_lines {
                if let Some(local) = &self.local_lines {
                    if !local.contains(index) {
                        continue;
                    }
                }
            }
            match (self.lines.contains_key(index), behavior) {
                (false, _) | (true, MergeConflictBehavior::RightObjectWins) => {
                    self.lines.insert(*index, other_line.clone());
                }
                (true, MergeConflictBehavior::LeftObjectWins) => {}
                (true, MergeConflictBehavior::NoConflictsAllowed) => {
                    return Err(ConstraintError::Conflict { line: *index });
                }
            }
        }

        let was_closed = self.closed && other.closed;
        self.closed = false;
        if was_closed {
            self.close()?;
        }
        Ok(())
    }

    /// Expands `values` at the constrained indices from the values at their entries.
    pub fn distribute(&self, values: &mut [f64]) {
        for line in self.lines.values() {
            values[line.index] = line.inhomogeneity
                + line
                    .entries
                    .iter()
                    .map(|(j, w)| w * values[*j])
                    .sum::<f64>();
        }
    }
}

/// Constrains the DoFs on the fine side of faces between cells of different refinement
/// levels so that the discrete field stays continuous.
///
/// Only continuous elements of degree one are supported. The returned table is closed.
pub fn make_hanging_node_constraints<const DIM: usize, const SPACEDIM: usize>(
    mesh: &dyn MeshView<DIM, SPACEDIM>,
    dofs: &dyn DofNumbering,
) -> Result<ConstraintTable, ConstraintError> {
    if !dofs.is_continuous() {
        return Err(ConstraintError::Unsupported(
            "hanging node constraints require a continuous element".to_string(),
        ));
    }
    if dofs.degree() != 1 {
        return Err(ConstraintError::Unsupported(format!(
            "hanging node constraints are only implemented for degree 1, got degree {}",
            dofs.degree()
        )));
    }

    let n_components = dofs.n_components();
    let n_vertices = vertices_per_cell(DIM);
    let mut constraints = ConstraintTable::new();
    let mut fine_dofs = Vec::new();
    let mut coarse_dofs = Vec::new();

    for cell in mesh.active_cells() {
        for face in 0..faces_per_cell(DIM) {
            let Some(neighbor) = mesh.neighbor(cell, face) else {
                continue;
            };
            if neighbor.level >= cell.level {
                continue;
            }
            let direction = face / 2;
            let side = face % 2;
            let (lower, h) = position_in_ancestor::<DIM, SPACEDIM>(mesh, cell, neighbor.level);

            dofs.cell_dof_indices(cell, &mut fine_dofs);
            dofs.cell_dof_indices(neighbor, &mut coarse_dofs);

            for v in (0..n_vertices).filter(|v| (v >> direction) & 1 == side) {
                let mut weights: Vec<(usize, f64)> = Vec::new();
                // The neighbor sees the face from the opposite side
                for w in (0..n_vertices).filter(|w| (w >> direction) & 1 != side) {
                    let weight: f64 = (0..DIM)
                        .filter(|d| *d != direction)
                        .map(|d| {
                            let t = lower[d] + h * ((v >> d) & 1) as f64;
                            if (w >> d) & 1 == 1 {
                                t
                            } else {
                                1.0 - t
                            }
                        })
                        .product();
                    if weight != 0.0 {
                        weights.push((w, weight));
                    }
                }
                if weights.len() == 1 && weights[0].1 == 1.0 {
                    // Coincides with a vertex of the coarse face
                    continue;
                }
                for c in 0..n_components {
                    let line = fine_dofs[c * n_vertices + v];
                    if constraints.is_constrained(line) {
                        continue;
                    }
                    constraints.add_line(line)?;
                    for &(w, weight) in &weights {
                        constraints.add_entry(line, coarse_dofs[c * n_vertices + w], weight);
                    }
                }
            }
        }
    }

    constraints.close()?;
    Ok(constraints)
}

/// The lower corner and edge length of `cell` in the reference coordinates of its ancestor
/// on `level`.
fn position_in_ancestor<const DIM: usize, const SPACEDIM: usize>(
    mesh: &dyn MeshView<DIM, SPACEDIM>,
    cell: CellHandle,
    level: usize,
) -> ([f64; DIM], f64) {
    let mut lower = [0.0; DIM];
    let mut h = 1.0;
    let mut current = cell;
    while current.level > level {
        let child = mesh
            .child_index(current)
            .expect("cells above the coarse level have a parent");
        for d in 0..DIM {
            lower[d] = 0.5 * (lower[d] + ((child >> d) & 1) as f64);
        }
        h *= 0.5;
        current = mesh
            .parent(current)
            .expect("cells above the coarse level have a parent");
    }
    (lower, h)
}
