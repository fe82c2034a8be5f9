//! Undo of a principal's last action by compensating append.

use super::{Engine, apply_transition};
use crate::db::ledger::history_internal;
use crate::db::{invalidations, now_ms, tasks};
use crate::error::{TaskError, TaskResult};
use crate::state_machine::{self, TaskEvent};
use crate::types::{LedgerAction, PrincipalId, ProjectId, Task, TaskId};
use tracing::info;

impl Engine {
    /// Revert the caller's most recent entry on a task.
    ///
    /// Only allowed while that entry is still the latest non-comment entry.
    /// The task returns to the resting status it had just before the entry.
    pub fn undo(
        &self,
        project_id: ProjectId,
        task_id: TaskId,
        principal: PrincipalId,
    ) -> TaskResult<Task> {
        let (task, undone_id) = self.db.transaction(|tx| {
            let task = tasks::require_task(tx, project_id, task_id)?;
            let entries: Vec<_> = history_internal(tx, project_id, task_id)?
                .into_iter()
                .filter(|entry| entry.action != LedgerAction::Comment)
                .collect();

            let Some(position) = entries.iter().rposition(|e| e.principal_id == principal) else {
                return Err(TaskError::NothingToUndo { task_id, principal });
            };
            if position + 1 != entries.len() {
                return Err(TaskError::StaleUndo { task_id, principal });
            }
            let target_entry = &entries[position];
            if target_entry.compensates.is_some() {
                return Err(TaskError::NothingToUndo { task_id, principal });
            }

            let target = state_machine::replay(&entries[..position])?.resting_status();
            if target == task.status {
                return Err(TaskError::NothingToUndo { task_id, principal });
            }

            let (task, _) = apply_transition(
                tx,
                &task,
                principal,
                TaskEvent::Revert(target),
                Some(target_entry.id),
            )?;

            invalidations::revert_for_history(tx, target_entry.id, now_ms())?;
            Ok((task, target_entry.id))
        })?;

        info!(
            project_id,
            task_id,
            principal,
            undone_entry = undone_id,
            status = task.status.as_str(),
            "Undid last action"
        );
        Ok(task)
    }
}
