//! Mapping issues recorded at validation time.

use super::Database;
use crate::error::{TaskError, TaskResult};
use crate::types::{MappingIssue, MappingIssueInput, ProjectId, TaskId};
use rusqlite::{Connection, params};

pub(crate) fn insert_issues(
    conn: &Connection,
    history_id: i64,
    project_id: ProjectId,
    task_id: TaskId,
    issues: &[MappingIssueInput],
) -> TaskResult<()> {
    for issue in issues {
        if issue.count < 1 || issue.issue.trim().is_empty() {
            return Err(TaskError::InvalidInput(format!(
                "mapping issue for category {} needs a description and a positive count",
                issue.category_id
            )));
        }
        conn.execute(
            "INSERT INTO task_mapping_issues
                 (history_id, project_id, task_id, category_id, issue, count)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                history_id,
                project_id,
                task_id,
                issue.category_id,
                issue.issue,
                issue.count
            ],
        )?;
    }
    Ok(())
}

impl Database {
    pub fn mapping_issues(
        &self,
        project_id: ProjectId,
        task_id: TaskId,
    ) -> TaskResult<Vec<MappingIssue>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, history_id, project_id, task_id, category_id, issue, count
                 FROM task_mapping_issues WHERE project_id = ?1 AND task_id = ?2 ORDER BY id",
            )?;
            let issues = stmt
                .query_map(params![project_id, task_id], |row| {
                    Ok(MappingIssue {
                        id: row.get(0)?,
                        history_id: row.get(1)?,
                        project_id: row.get(2)?,
                        task_id: row.get(3)?,
                        category_id: row.get(4)?,
                        issue: row.get(5)?,
                        count: row.get(6)?,
                    })
                })?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(issues)
        })
    }
}
