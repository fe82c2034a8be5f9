//! The task lifecycle engine.
//!
//! [`Engine`] ties the store to its collaborators (permissions, geometry) and
//! exposes the operations callers use: locking, release, undo, splitting,
//! bulk transitions and read-only state queries.
//!
//! Every status change goes through [`apply_transition`], which validates the
//! event against the transition table, appends exactly one ledger entry and
//! updates the status projection inside the caller's transaction.

mod bulk;
mod grid;
mod locking;
mod split;
mod undo;

use crate::config::{GridConfig, SplittingConfig};
use crate::db::invalidations;
use crate::db::ledger::{self, NewEntry};
use crate::db::{Database, now_ms, tasks};
use crate::error::TaskResult;
use crate::geometry::{ClipGeometry, GeometryOps};
use crate::permissions::PermissionCheck;
use crate::state_machine::{self, TaskEvent};
use crate::types::{
    LedgerAction, LedgerEntry, PrincipalId, ProjectId, Task, TaskId, TaskState, TaskStatus,
};
use rusqlite::Connection;
use std::sync::Arc;

/// Entry point for every lifecycle operation.
#[derive(Clone)]
pub struct Engine {
    db: Database,
    permissions: Arc<dyn PermissionCheck>,
    geometry: Arc<dyn GeometryOps>,
    grid: GridConfig,
    splitting: SplittingConfig,
}

impl Engine {
    /// Engine with the built-in clipping geometry and default grid and split settings.
    pub fn new(db: Database, permissions: Arc<dyn PermissionCheck>) -> Self {
        Self {
            db,
            permissions,
            geometry: Arc::new(ClipGeometry),
            grid: GridConfig::default(),
            splitting: SplittingConfig::default(),
        }
    }

    pub fn with_geometry(mut self, geometry: Arc<dyn GeometryOps>) -> Self {
        self.geometry = geometry;
        self
    }

    pub fn with_grid(mut self, grid: GridConfig) -> Self {
        self.grid = grid;
        self
    }

    pub fn with_splitting(mut self, splitting: SplittingConfig) -> Self {
        self.splitting = splitting;
        self
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    /// Status, lock holder and lock age. Never writes.
    pub fn current_state(&self, project_id: ProjectId, task_id: TaskId) -> TaskResult<TaskState> {
        let now = now_ms();
        self.db.with_conn(|conn| {
            let task = tasks::require_task(conn, project_id, task_id)?;
            let lock = ledger::current_lock_internal(conn, project_id, task_id)?;
            Ok(TaskState {
                project_id,
                task_id,
                status: task.status,
                lock_holder: lock.as_ref().map(|l| l.holder),
                lock_purpose: lock.as_ref().map(|l| l.purpose),
                lock_age_ms: lock.as_ref().map(|l| (now - l.locked_at).max(0)),
            })
        })
    }

    /// Append a `COMMENT` entry. Comments never change status.
    pub fn comment(
        &self,
        project_id: ProjectId,
        task_id: TaskId,
        principal: PrincipalId,
        text: &str,
    ) -> TaskResult<LedgerEntry> {
        if text.trim().is_empty() {
            return Err(crate::error::TaskError::InvalidInput(
                "comment text is empty".to_string(),
            ));
        }
        self.db.transaction(|tx| {
            tasks::require_task(tx, project_id, task_id)?;
            append_comment(tx, project_id, task_id, principal, text)
        })
    }

    /// Check that the status projection matches a replay of the ledger.
    pub fn verify_projection(&self, project_id: ProjectId, task_id: TaskId) -> TaskResult<bool> {
        self.db.with_conn(|conn| {
            let task = tasks::require_task(conn, project_id, task_id)?;
            let entries = ledger::history_internal(conn, project_id, task_id)?;
            Ok(state_machine::replay_status(&entries)? == task.status)
        })
    }
}

pub(crate) fn append_comment(
    conn: &Connection,
    project_id: ProjectId,
    task_id: TaskId,
    principal: PrincipalId,
    text: &str,
) -> TaskResult<LedgerEntry> {
    ledger::append_entry(
        conn,
        NewEntry {
            project_id,
            task_id,
            principal_id: principal,
            action: LedgerAction::Comment,
            action_text: Some(text.to_string()),
            lock_duration_ms: None,
            compensates: None,
            timestamp: now_ms(),
        },
    )
}

/// Apply `event` to `task`: validate, append one ledger entry, write status.
///
/// This is the only writer of `tasks.status` and of invalidation records.
pub(crate) fn apply_transition(
    conn: &Connection,
    task: &Task,
    principal: PrincipalId,
    event: TaskEvent,
    compensates: Option<i64>,
) -> TaskResult<(Task, LedgerEntry)> {
    let to = state_machine::next_status(task.id, task.status, event)?;
    let now = now_ms();

    // Entries that close a lock carry how long it was held.
    let lock_duration_ms = if task.status.is_locked() {
        ledger::current_lock_internal(conn, task.project_id, task.id)?
            .map(|lock| (now - lock.locked_at).max(0))
    } else {
        None
    };

    let (action, action_text) = match event {
        TaskEvent::Lock(purpose) => (purpose.lock_action(), task.status.as_str().to_string()),
        TaskEvent::AutoUnlock { .. } => {
            let purpose = task.status.lock_purpose().ok_or_else(|| {
                crate::error::TaskError::invalid_state(task.id, task.status, event.name())
            })?;
            (
                purpose.auto_unlock_action(),
                format_duration(lock_duration_ms.unwrap_or(0)),
            )
        }
        _ => (LedgerAction::StateChange, to.as_str().to_string()),
    };

    let entry = ledger::append_entry(
        conn,
        NewEntry {
            project_id: task.project_id,
            task_id: task.id,
            principal_id: principal,
            action,
            action_text: Some(action_text),
            lock_duration_ms,
            compensates,
            timestamp: now,
        },
    )?;
    tasks::write_status(conn, task.project_id, task.id, to, now)?;

    if let TaskEvent::Submit(status) = event {
        match status {
            TaskStatus::Invalidated => invalidations::record_invalidation(
                conn,
                task.project_id,
                task.id,
                principal,
                entry.id,
                now,
            )?,
            TaskStatus::Validated => invalidations::record_validation(
                conn,
                task.project_id,
                task.id,
                principal,
                entry.id,
                now,
            )?,
            _ => {}
        }
    }

    let updated = Task {
        status: to,
        updated_at: now,
        ..task.clone()
    };
    Ok((updated, entry))
}

/// Format milliseconds as `HH:MM:SS`.
pub fn format_duration(ms: i64) -> String {
    let total = ms.max(0) / 1000;
    format!("{:02}:{:02}:{:02}", total / 3600, (total % 3600) / 60, total % 60)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn durations_format_as_clock_time() {
        assert_eq!(format_duration(0), "00:00:00");
        assert_eq!(format_duration(61_500), "00:01:01");
        assert_eq!(format_duration(7_200_000), "02:00:00");
        assert_eq!(format_duration(90_061_000), "25:01:01");
        assert_eq!(format_duration(-5), "00:00:00");
    }
}
