//! Project rows.

use super::{Database, enum_column, json_column, now_ms, optional};
use crate::error::{TaskError, TaskResult};
use crate::geometry::Geometry;
use crate::types::{GridMode, Project, ProjectId};
use rusqlite::{Connection, Row, params};

fn parse_project_row(row: &Row) -> rusqlite::Result<Project> {
    Ok(Project {
        id: row.get("id")?,
        aoi: json_column(row, "aoi")?,
        grid: enum_column(row, "grid", GridMode::from_str)?,
        max_zoom: row.get("max_zoom")?,
        created_at: row.get("created_at")?,
    })
}

pub(crate) fn insert_project(
    conn: &Connection,
    aoi: &Geometry,
    grid: GridMode,
    max_zoom: i32,
) -> TaskResult<Project> {
    let now = now_ms();
    conn.execute(
        "INSERT INTO projects (aoi, grid, max_zoom, created_at) VALUES (?1, ?2, ?3, ?4)",
        params![serde_json::to_string(aoi)?, grid.as_str(), max_zoom, now],
    )?;
    Ok(Project {
        id: conn.last_insert_rowid(),
        aoi: aoi.clone(),
        grid,
        max_zoom,
        created_at: now,
    })
}

pub(crate) fn get_project_internal(
    conn: &Connection,
    project_id: ProjectId,
) -> TaskResult<Option<Project>> {
    optional(conn.query_row(
        "SELECT * FROM projects WHERE id = ?1",
        params![project_id],
        parse_project_row,
    ))
}

pub(crate) fn require_project(conn: &Connection, project_id: ProjectId) -> TaskResult<Project> {
    get_project_internal(conn, project_id)?.ok_or(TaskError::ProjectNotFound(project_id))
}

/// Projects that currently have at least one locked task.
pub(crate) fn projects_with_locked_tasks(conn: &Connection) -> TaskResult<Vec<ProjectId>> {
    let mut stmt = conn.prepare(
        "SELECT DISTINCT project_id FROM tasks
         WHERE status IN ('LOCKED_FOR_MAPPING', 'LOCKED_FOR_VALIDATION')
         ORDER BY project_id",
    )?;
    let ids = stmt
        .query_map([], |row| row.get(0))?
        .collect::<Result<Vec<ProjectId>, _>>()?;
    Ok(ids)
}

impl Database {
    pub fn get_project(&self, project_id: ProjectId) -> TaskResult<Option<Project>> {
        self.with_conn(|conn| get_project_internal(conn, project_id))
    }

    pub fn list_projects(&self) -> TaskResult<Vec<Project>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare("SELECT * FROM projects ORDER BY id")?;
            let projects = stmt
                .query_map([], parse_project_row)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(projects)
        })
    }

    /// Projects the sweeper has to look at.
    pub fn projects_with_locked_tasks(&self) -> TaskResult<Vec<ProjectId>> {
        self.with_conn(projects_with_locked_tasks)
    }
}
