//! Invalidation records: which mapping was rejected, by whom, and when it was
//! finally validated. Written only by the engine's transition function.

use super::Database;
use super::ledger::last_mapper_internal;
use crate::error::TaskResult;
use crate::types::{InvalidationRecord, PrincipalId, ProjectId, TaskId};
use rusqlite::{Connection, Row, params};

fn parse_record_row(row: &Row) -> rusqlite::Result<InvalidationRecord> {
    Ok(InvalidationRecord {
        id: row.get("id")?,
        project_id: row.get("project_id")?,
        task_id: row.get("task_id")?,
        is_closed: row.get("is_closed")?,
        mapper_id: row.get("mapper_id")?,
        mapped_at: row.get("mapped_at")?,
        invalidator_id: row.get("invalidator_id")?,
        invalidated_at: row.get("invalidated_at")?,
        invalidation_history_id: row.get("invalidation_history_id")?,
        validator_id: row.get("validator_id")?,
        validated_at: row.get("validated_at")?,
        closed_by_history_id: row.get("closed_by_history_id")?,
        updated_at: row.get("updated_at")?,
    })
}

/// Close any open record for the task, then open one for this invalidation.
pub(crate) fn record_invalidation(
    conn: &Connection,
    project_id: ProjectId,
    task_id: TaskId,
    invalidator_id: PrincipalId,
    history_id: i64,
    now: i64,
) -> TaskResult<()> {
    conn.execute(
        "UPDATE task_invalidations SET is_closed = 1, closed_by_history_id = ?1, updated_at = ?2
         WHERE project_id = ?3 AND task_id = ?4 AND is_closed = 0",
        params![history_id, now, project_id, task_id],
    )?;

    let mapper = last_mapper_internal(conn, project_id, task_id)?;
    conn.execute(
        "INSERT INTO task_invalidations
             (project_id, task_id, is_closed, mapper_id, mapped_at, invalidator_id,
              invalidated_at, invalidation_history_id, updated_at)
         VALUES (?1, ?2, 0, ?3, ?4, ?5, ?6, ?7, ?6)",
        params![
            project_id,
            task_id,
            mapper.map(|(principal, _)| principal),
            mapper.map(|(_, at)| at),
            invalidator_id,
            now,
            history_id,
        ],
    )?;
    Ok(())
}

/// Close the open record for the task with the successful validation.
pub(crate) fn record_validation(
    conn: &Connection,
    project_id: ProjectId,
    task_id: TaskId,
    validator_id: PrincipalId,
    history_id: i64,
    now: i64,
) -> TaskResult<()> {
    conn.execute(
        "UPDATE task_invalidations
         SET is_closed = 1, validator_id = ?1, validated_at = ?2, updated_at = ?2,
             closed_by_history_id = ?3
         WHERE project_id = ?4 AND task_id = ?5 AND is_closed = 0",
        params![validator_id, now, history_id, project_id, task_id],
    )?;
    Ok(())
}

/// Undo the bookkeeping of a history entry.
///
/// Drops the record the entry opened and reopens any record it closed.
pub(crate) fn revert_for_history(conn: &Connection, history_id: i64, now: i64) -> TaskResult<()> {
    conn.execute(
        "DELETE FROM task_invalidations WHERE invalidation_history_id = ?1",
        params![history_id],
    )?;
    conn.execute(
        "UPDATE task_invalidations
         SET is_closed = 0, validator_id = NULL, validated_at = NULL,
             closed_by_history_id = NULL, updated_at = ?1
         WHERE closed_by_history_id = ?2",
        params![now, history_id],
    )?;
    Ok(())
}

impl Database {
    /// Invalidation records for a task, oldest first.
    pub fn invalidation_records(
        &self,
        project_id: ProjectId,
        task_id: TaskId,
    ) -> TaskResult<Vec<InvalidationRecord>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT * FROM task_invalidations
                 WHERE project_id = ?1 AND task_id = ?2
                 ORDER BY id",
            )?;
            let records = stmt
                .query_map(params![project_id, task_id], parse_record_row)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(records)
        })
    }

    /// Records where someone else invalidated this principal's mapping.
    pub fn invalidated_by_others(
        &self,
        mapper_id: PrincipalId,
    ) -> TaskResult<Vec<InvalidationRecord>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT * FROM task_invalidations
                 WHERE mapper_id = ?1 AND invalidator_id != ?1
                 ORDER BY invalidated_at DESC, id DESC",
            )?;
            let records = stmt
                .query_map(params![mapper_id], parse_record_row)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(records)
        })
    }
}
