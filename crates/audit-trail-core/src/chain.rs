use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::model::{DeletedAt, RowId};

/// Audit columns of one stored version, as read by an unscoped listing.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct VersionRow {
    pub id: RowId,
    pub parent_version_id: Option<RowId>,
    pub deleted_at: DeletedAt,
    pub last_changed_user: String,
}

#[derive(Debug, Clone, Serialize, Eq, PartialEq)]
#[serde(tag = "problem", rename_all = "snake_case")]
pub enum ChainProblem {
    DuplicateId { id: RowId },
    MissingParent { id: RowId, parent: RowId },
    ParentStillCurrent { id: RowId, parent: RowId },
    Cycle { id: RowId },
    MultipleCurrent { ids: Vec<RowId> },
}

#[derive(Debug, Clone, Serialize, Eq, PartialEq)]
pub struct ChainReport {
    pub versions: usize,
    pub current: Option<RowId>,
    pub roots: Vec<RowId>,
    /// Every version is the parent of at most one other version.
    pub linear: bool,
    pub problems: Vec<ChainProblem>,
}

impl ChainReport {
    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.problems.is_empty()
    }
}

/// Check the versions of one logical record against the chain invariants:
/// a single current version, parents that exist and are closed, no cycles.
#[must_use]
pub fn verify_chain(rows: &[VersionRow]) -> ChainReport {
    let mut problems = Vec::new();
    let mut by_id: BTreeMap<RowId, &VersionRow> = BTreeMap::new();
    for row in rows {
        if by_id.insert(row.id, row).is_some() {
            problems.push(ChainProblem::DuplicateId { id: row.id });
        }
    }

    let mut children: BTreeMap<RowId, usize> = BTreeMap::new();
    for row in by_id.values() {
        let Some(parent) = row.parent_version_id else {
            continue;
        };
        *children.entry(parent).or_default() += 1;
        match by_id.get(&parent) {
            None => problems.push(ChainProblem::MissingParent { id: row.id, parent }),
            Some(parent_row) if parent_row.deleted_at.is_current() && parent != row.id => {
                problems.push(ChainProblem::ParentStillCurrent { id: row.id, parent });
            }
            Some(_) => {}
        }
    }

    let mut cycles = BTreeSet::new();
    let mut finished: BTreeSet<RowId> = BTreeSet::new();
    for start in by_id.keys() {
        let mut path = Vec::new();
        let mut on_path: BTreeMap<RowId, usize> = BTreeMap::new();
        let mut cursor = Some(*start);
        while let Some(id) = cursor {
            if finished.contains(&id) {
                break;
            }
            if let Some(&position) = on_path.get(&id) {
                if let Some(smallest) = path[position..].iter().min() {
                    cycles.insert(*smallest);
                }
                break;
            }
            on_path.insert(id, path.len());
            path.push(id);
            cursor = by_id.get(&id).and_then(|row| row.parent_version_id);
        }
        finished.extend(path);
    }
    problems.extend(cycles.into_iter().map(|id| ChainProblem::Cycle { id }));

    let current_ids = by_id
        .values()
        .filter(|row| row.deleted_at.is_current())
        .map(|row| row.id)
        .collect::<Vec<_>>();
    if current_ids.len() > 1 {
        problems.push(ChainProblem::MultipleCurrent { ids: current_ids.clone() });
    }

    ChainReport {
        versions: by_id.len(),
        current: if current_ids.len() == 1 { current_ids.first().copied() } else { None },
        roots: by_id.values().filter(|row| row.parent_version_id.is_none()).map(|row| row.id).collect(),
        linear: children.values().all(|count| *count <= 1),
        problems,
    }
}
