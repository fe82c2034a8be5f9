//! Task rows.
//!
//! `status` is a projection of the ledger. [`write_status`] is only called
//! from the engine's transition function, which appends the matching ledger
//! entry in the same transaction.

use super::{Database, enum_column, json_column, now_ms, optional};
use crate::error::{TaskError, TaskResult};
use crate::types::{NewTask, ProjectId, Task, TaskId, TaskStatus};
use rusqlite::{Connection, Row, params};

pub fn parse_task_row(row: &Row) -> rusqlite::Result<Task> {
    Ok(Task {
        project_id: row.get("project_id")?,
        id: row.get("id")?,
        geometry: json_column(row, "geometry")?,
        x: row.get("x")?,
        y: row.get("y")?,
        zoom: row.get("zoom")?,
        is_square: row.get("is_square")?,
        status: enum_column(row, "status", TaskStatus::from_str)?,
        parent_id: row.get("parent_id")?,
        created_at: row.get("created_at")?,
        updated_at: row.get("updated_at")?,
    })
}

/// Internal helper to get a task using an existing connection.
pub(crate) fn get_task_internal(
    conn: &Connection,
    project_id: ProjectId,
    task_id: TaskId,
) -> TaskResult<Option<Task>> {
    optional(conn.query_row(
        "SELECT * FROM tasks WHERE project_id = ?1 AND id = ?2",
        params![project_id, task_id],
        parse_task_row,
    ))
}

pub(crate) fn require_task(
    conn: &Connection,
    project_id: ProjectId,
    task_id: TaskId,
) -> TaskResult<Task> {
    get_task_internal(conn, project_id, task_id)?.ok_or(TaskError::TaskNotFound {
        project_id,
        task_id,
    })
}

/// Next free task id within a project.
pub(crate) fn next_task_id(conn: &Connection, project_id: ProjectId) -> TaskResult<TaskId> {
    let max: Option<TaskId> = conn.query_row(
        "SELECT MAX(id) FROM tasks WHERE project_id = ?1",
        params![project_id],
        |row| row.get(0),
    )?;
    Ok(max.unwrap_or(0) + 1)
}

/// Insert a task in `READY`.
pub(crate) fn insert_task(
    conn: &Connection,
    project_id: ProjectId,
    id: TaskId,
    task: NewTask,
) -> TaskResult<Task> {
    let now = now_ms();
    conn.execute(
        "INSERT INTO tasks
             (project_id, id, geometry, x, y, zoom, is_square, status, parent_id,
              created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?10)",
        params![
            project_id,
            id,
            serde_json::to_string(&task.geometry)?,
            task.x,
            task.y,
            task.zoom,
            task.is_square,
            TaskStatus::Ready.as_str(),
            task.parent_id,
            now,
        ],
    )?;
    Ok(Task {
        project_id,
        id,
        geometry: task.geometry,
        x: task.x,
        y: task.y,
        zoom: task.zoom,
        is_square: task.is_square,
        status: TaskStatus::Ready,
        parent_id: task.parent_id,
        created_at: now,
        updated_at: now,
    })
}

/// Write the status projection.
pub(crate) fn write_status(
    conn: &Connection,
    project_id: ProjectId,
    task_id: TaskId,
    status: TaskStatus,
    now: i64,
) -> TaskResult<()> {
    let updated = conn.execute(
        "UPDATE tasks SET status = ?1, updated_at = ?2 WHERE project_id = ?3 AND id = ?4",
        params![status.as_str(), now, project_id, task_id],
    )?;
    if updated == 0 {
        return Err(TaskError::TaskNotFound {
            project_id,
            task_id,
        });
    }
    Ok(())
}

pub(crate) fn list_tasks_internal(
    conn: &Connection,
    project_id: ProjectId,
) -> TaskResult<Vec<Task>> {
    let mut stmt = conn.prepare("SELECT * FROM tasks WHERE project_id = ?1 ORDER BY id")?;
    let tasks = stmt
        .query_map(params![project_id], parse_task_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(tasks)
}

/// Number of splits between a task and its root ancestor.
pub(crate) fn split_generation(
    conn: &Connection,
    project_id: ProjectId,
    task_id: TaskId,
) -> TaskResult<u32> {
    let depth: i64 = conn.query_row(
        "WITH RECURSIVE lineage(id, parent_id, depth) AS (
             SELECT id, parent_id, 0 FROM tasks WHERE project_id = ?1 AND id = ?2
             UNION ALL
             SELECT t.id, t.parent_id, l.depth + 1
             FROM tasks t JOIN lineage l ON t.project_id = ?1 AND t.id = l.parent_id
         )
         SELECT COALESCE(MAX(depth), 0) FROM lineage",
        params![project_id, task_id],
        |row| row.get(0),
    )?;
    Ok(depth as u32)
}

impl Database {
    pub fn get_task(&self, project_id: ProjectId, task_id: TaskId) -> TaskResult<Option<Task>> {
        self.with_conn(|conn| get_task_internal(conn, project_id, task_id))
    }

    /// All tasks of a project, including split parents.
    pub fn list_tasks(&self, project_id: ProjectId) -> TaskResult<Vec<Task>> {
        self.with_conn(|conn| list_tasks_internal(conn, project_id))
    }

    /// Tasks currently in the active set (everything but split parents).
    pub fn list_active_tasks(&self, project_id: ProjectId) -> TaskResult<Vec<Task>> {
        Ok(self
            .list_tasks(project_id)?
            .into_iter()
            .filter(|task| task.status != TaskStatus::Split)
            .collect())
    }

    /// Tasks produced by splitting `parent_id`.
    pub fn get_children(&self, project_id: ProjectId, parent_id: TaskId) -> TaskResult<Vec<Task>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT * FROM tasks WHERE project_id = ?1 AND parent_id = ?2 ORDER BY id",
            )?;
            let tasks = stmt
                .query_map(params![project_id, parent_id], parse_task_row)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(tasks)
        })
    }

    /// Count of tasks per status in a project.
    pub fn status_counts(&self, project_id: ProjectId) -> TaskResult<Vec<(TaskStatus, i64)>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT status, COUNT(*) AS n FROM tasks WHERE project_id = ?1
                 GROUP BY status ORDER BY status",
            )?;
            let counts = stmt
                .query_map(params![project_id], |row| {
                    Ok((enum_column(row, "status", TaskStatus::from_str)?, row.get("n")?))
                })?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(counts)
        })
    }
}
