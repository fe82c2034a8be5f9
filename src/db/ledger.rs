//! Append-only task history.
//!
//! Entries are never updated or deleted (triggers enforce it). Ordering is by
//! `id`, which is the insertion sequence; the highest id is the most recent
//! entry. `COMMENT` entries never affect lock or status logic, so the
//! "latest entry" helpers skip them.

use super::{Database, enum_column, optional};
use crate::error::{TaskError, TaskResult};
use crate::types::{
    LedgerAction, LedgerEntry, Lock, PrincipalId, ProjectId, TaskId, TaskStatus,
};
use rusqlite::{Connection, Row, params};
use tracing::debug;

/// Input for appending a ledger entry.
#[derive(Debug, Clone)]
pub(crate) struct NewEntry {
    pub project_id: ProjectId,
    pub task_id: TaskId,
    pub principal_id: PrincipalId,
    pub action: LedgerAction,
    pub action_text: Option<String>,
    pub lock_duration_ms: Option<i64>,
    pub compensates: Option<i64>,
    pub timestamp: i64,
}

fn parse_entry_row(row: &Row) -> rusqlite::Result<LedgerEntry> {
    Ok(LedgerEntry {
        id: row.get("id")?,
        project_id: row.get("project_id")?,
        task_id: row.get("task_id")?,
        principal_id: row.get("principal_id")?,
        action: enum_column(row, "action", LedgerAction::from_str)?,
        action_text: row.get("action_text")?,
        lock_duration_ms: row.get("lock_duration_ms")?,
        compensates: row.get("compensates")?,
        timestamp: row.get("timestamp")?,
    })
}

pub(crate) fn append_entry(conn: &Connection, entry: NewEntry) -> TaskResult<LedgerEntry> {
    conn.execute(
        "INSERT INTO task_history
             (project_id, task_id, principal_id, action, action_text, lock_duration_ms,
              compensates, timestamp)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        params![
            entry.project_id,
            entry.task_id,
            entry.principal_id,
            entry.action.as_str(),
            entry.action_text,
            entry.lock_duration_ms,
            entry.compensates,
            entry.timestamp,
        ],
    )?;
    let id = conn.last_insert_rowid();
    debug!(
        entry_id = id,
        project_id = entry.project_id,
        task_id = entry.task_id,
        principal_id = entry.principal_id,
        action = entry.action.as_str(),
        action_text = entry.action_text.as_deref().unwrap_or(""),
        "Appended ledger entry"
    );
    Ok(LedgerEntry {
        id,
        project_id: entry.project_id,
        task_id: entry.task_id,
        principal_id: entry.principal_id,
        action: entry.action,
        action_text: entry.action_text,
        lock_duration_ms: entry.lock_duration_ms,
        compensates: entry.compensates,
        timestamp: entry.timestamp,
    })
}

pub(crate) fn history_internal(
    conn: &Connection,
    project_id: ProjectId,
    task_id: TaskId,
) -> TaskResult<Vec<LedgerEntry>> {
    let mut stmt = conn.prepare(
        "SELECT * FROM task_history WHERE project_id = ?1 AND task_id = ?2 ORDER BY id ASC",
    )?;
    let entries = stmt
        .query_map(params![project_id, task_id], parse_entry_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(entries)
}

/// Most recent non-comment entry for a task.
pub(crate) fn latest_entry_internal(
    conn: &Connection,
    project_id: ProjectId,
    task_id: TaskId,
) -> TaskResult<Option<LedgerEntry>> {
    optional(conn.query_row(
        "SELECT * FROM task_history
         WHERE project_id = ?1 AND task_id = ?2 AND action != 'COMMENT'
         ORDER BY id DESC LIMIT 1",
        params![project_id, task_id],
        parse_entry_row,
    ))
}

/// Build the lock a `LOCKED_*` entry represents.
pub(crate) fn lock_from_entry(entry: &LedgerEntry) -> TaskResult<Option<Lock>> {
    let Some(purpose) = entry.action.lock_purpose() else {
        return Ok(None);
    };
    let prior_status = entry
        .action_text
        .as_deref()
        .and_then(TaskStatus::from_str)
        .ok_or_else(|| {
            TaskError::storage(format!(
                "lock entry {} does not record the pre-lock status",
                entry.id
            ))
        })?;
    Ok(Some(Lock {
        project_id: entry.project_id,
        task_id: entry.task_id,
        holder: entry.principal_id,
        purpose,
        locked_at: entry.timestamp,
        entry_id: entry.id,
        prior_status,
    }))
}

/// The outstanding lock on a task: present iff the latest entry is `LOCKED_*`.
pub(crate) fn current_lock_internal(
    conn: &Connection,
    project_id: ProjectId,
    task_id: TaskId,
) -> TaskResult<Option<Lock>> {
    match latest_entry_internal(conn, project_id, task_id)? {
        Some(entry) => lock_from_entry(&entry),
        None => Ok(None),
    }
}

/// Principal of the most recent surviving `STATE_CHANGE -> MAPPED`, with its time.
pub(crate) fn last_mapper_internal(
    conn: &Connection,
    project_id: ProjectId,
    task_id: TaskId,
) -> TaskResult<Option<(PrincipalId, i64)>> {
    optional(conn.query_row(
        "SELECT principal_id, timestamp FROM task_history h
         WHERE h.project_id = ?1 AND h.task_id = ?2
           AND h.action = 'STATE_CHANGE' AND h.action_text = 'MAPPED'
           AND NOT EXISTS (SELECT 1 FROM task_history u WHERE u.compensates = h.id)
         ORDER BY h.id DESC LIMIT 1",
        params![project_id, task_id],
        |row| Ok((row.get(0)?, row.get(1)?)),
    ))
}

/// Locks in a project that are still outstanding and were taken before `cutoff`.
pub(crate) fn stale_locks_internal(
    conn: &Connection,
    project_id: ProjectId,
    cutoff: i64,
) -> TaskResult<Vec<Lock>> {
    let mut stmt = conn.prepare(
        "SELECT h.* FROM task_history h
         JOIN tasks t ON t.project_id = h.project_id AND t.id = h.task_id
         WHERE t.project_id = ?1
           AND t.status IN ('LOCKED_FOR_MAPPING', 'LOCKED_FOR_VALIDATION')
           AND h.id = (
               SELECT MAX(l.id) FROM task_history l
               WHERE l.project_id = h.project_id AND l.task_id = h.task_id
                 AND l.action != 'COMMENT'
           )
           AND h.action IN ('LOCKED_FOR_MAPPING', 'LOCKED_FOR_VALIDATION')
           AND h.timestamp < ?2
         ORDER BY h.id",
    )?;
    let entries = stmt
        .query_map(params![project_id, cutoff], parse_entry_row)?
        .collect::<Result<Vec<_>, _>>()?;

    let mut locks = Vec::with_capacity(entries.len());
    for entry in &entries {
        if let Some(lock) = lock_from_entry(entry)? {
            locks.push(lock);
        }
    }
    Ok(locks)
}

impl Database {
    /// Full ledger of a task, oldest first.
    pub fn task_history(
        &self,
        project_id: ProjectId,
        task_id: TaskId,
    ) -> TaskResult<Vec<LedgerEntry>> {
        self.with_conn(|conn| history_internal(conn, project_id, task_id))
    }

    /// Most recent non-comment entry.
    pub fn latest_entry(
        &self,
        project_id: ProjectId,
        task_id: TaskId,
    ) -> TaskResult<Option<LedgerEntry>> {
        self.with_conn(|conn| latest_entry_internal(conn, project_id, task_id))
    }

    pub fn current_lock(&self, project_id: ProjectId, task_id: TaskId) -> TaskResult<Option<Lock>> {
        self.with_conn(|conn| current_lock_internal(conn, project_id, task_id))
    }

    pub fn last_mapper(
        &self,
        project_id: ProjectId,
        task_id: TaskId,
    ) -> TaskResult<Option<PrincipalId>> {
        self.with_conn(|conn| {
            Ok(last_mapper_internal(conn, project_id, task_id)?.map(|(principal, _)| principal))
        })
    }

    /// Outstanding locks in `project_id` older than `cutoff` (epoch ms).
    pub fn stale_locks(&self, project_id: ProjectId, cutoff: i64) -> TaskResult<Vec<Lock>> {
        self.with_conn(|conn| stale_locks_internal(conn, project_id, cutoff))
    }

    /// Every entry a principal appended, newest first.
    pub fn principal_history(
        &self,
        principal_id: PrincipalId,
        limit: Option<i64>,
    ) -> TaskResult<Vec<LedgerEntry>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT * FROM task_history WHERE principal_id = ?1 ORDER BY id DESC LIMIT ?2",
            )?;
            let entries = stmt
                .query_map(params![principal_id, limit.unwrap_or(-1)], parse_entry_row)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(entries)
        })
    }
}
