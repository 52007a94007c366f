//! Policy-driven conflict resolution.

use todosync_core::{ConflictPolicy, Task};

use crate::merge::{Conflict, ConflictKind, Resolution, Side};

/// What the coordinator should do with a task after resolution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolutionOutcome {
    /// Write this version to whichever side differs from it.
    Write(Task),
    /// Remove the task from both sides.
    Delete,
    /// Leave both sides untouched until resolved externally.
    Pending,
}

#[derive(Debug, Clone, Copy)]
pub struct ConflictResolver {
    policy: ConflictPolicy,
}

impl ConflictResolver {
    pub fn new(policy: ConflictPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> ConflictPolicy {
        self.policy
    }

    /// Apply the configured policy, updating `conflict.resolution`.
    pub fn resolve(&self, conflict: &mut Conflict) -> ResolutionOutcome {
        let side = match self.policy {
            ConflictPolicy::PreferFile => Side::File,
            ConflictPolicy::PreferApp => Side::App,
            ConflictPolicy::LastWriteWins => newer_side(conflict),
            ConflictPolicy::Manual => {
                conflict.resolution = Resolution::Pending;
                return ResolutionOutcome::Pending;
            }
        };
        conflict.resolution = Resolution::Resolved { chosen: side };
        take_side(conflict, side)
    }
}

/// Resolve `conflict` in favor of `side`.
///
/// Field conflicts copy the chosen side's values for every conflicting field
/// into the partially merged task. Delete/edit conflicts take that side's
/// whole version: its deletion, or its edited task.
pub fn take_side(conflict: &Conflict, side: Side) -> ResolutionOutcome {
    match conflict.kind {
        ConflictKind::DeleteEdit { deleted_on } if deleted_on == side => ResolutionOutcome::Delete,
        ConflictKind::DeleteEdit { .. } => match conflict.version(side).as_task() {
            Some(task) => ResolutionOutcome::Write(task.clone()),
            None => ResolutionOutcome::Delete,
        },
        ConflictKind::Fields => {
            let (Some(chosen), Some(file), Some(app)) = (
                conflict.version(side).as_task(),
                conflict.file.as_task(),
                conflict.app.as_task(),
            ) else {
                return ResolutionOutcome::Pending;
            };
            let mut task = conflict.merged.clone().unwrap_or_else(|| chosen.clone());
            for field in &conflict.fields {
                field.copy(chosen, &mut task);
            }
            task.updated_at = file.updated_at.max(app.updated_at);
            ResolutionOutcome::Write(task)
        }
    }
}

/// Last-write-wins choice of side.
///
/// Field conflicts: higher `updated_at`, ties to the file. Delete/edit: the
/// edit wins only if it is newer than the base snapshot.
fn newer_side(conflict: &Conflict) -> Side {
    match conflict.kind {
        ConflictKind::Fields => match (conflict.file.as_task(), conflict.app.as_task()) {
            (Some(f), Some(a)) if a.updated_at > f.updated_at => Side::App,
            _ => Side::File,
        },
        ConflictKind::DeleteEdit { deleted_on } => {
            let edited_on = match deleted_on {
                Side::File => Side::App,
                Side::App => Side::File,
            };
            let edited = conflict.version(edited_on).as_task();
            let base = conflict.base.as_task();
            match (edited, base) {
                (Some(e), Some(b)) if e.updated_at > b.updated_at => edited_on,
                (Some(_), None) => edited_on,
                _ => deleted_on,
            }
        }
    }
}
