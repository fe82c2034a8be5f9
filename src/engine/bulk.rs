//! Project-wide administrative transitions.
//!
//! Each task goes through the normal transition path in its own transaction,
//! so one task that cannot change is skipped without aborting the run.

use super::{Engine, apply_transition};
use crate::db::ledger::current_lock_internal;
use crate::db::{projects, tasks};
use crate::error::{TaskError, TaskResult};
use crate::state_machine::TaskEvent;
use crate::types::{
    BulkReport, BulkTransition, LockPurpose, PrincipalId, ProjectId, SkippedTask, Task, TaskId,
    TaskStatus,
};
use tracing::{debug, info};

impl BulkTransition {
    /// Whether a task resting in `base` is selected for this transition.
    pub fn selects(&self, base: TaskStatus) -> bool {
        match self {
            BulkTransition::MapAll => {
                matches!(base, TaskStatus::Ready | TaskStatus::Invalidated)
            }
            BulkTransition::ValidateAll => {
                matches!(base, TaskStatus::Mapped | TaskStatus::Invalidated)
            }
            BulkTransition::InvalidateAll => {
                matches!(base, TaskStatus::Mapped | TaskStatus::Validated)
            }
            BulkTransition::ResetAll => !matches!(base, TaskStatus::Ready | TaskStatus::Split),
            BulkTransition::ResetBadImagery => base == TaskStatus::BadImagery,
        }
    }

    /// Events applied in order to each selected task.
    fn events(&self) -> Vec<TaskEvent> {
        let submit = |purpose, status| vec![TaskEvent::Lock(purpose), TaskEvent::Submit(status)];
        match self {
            BulkTransition::MapAll => submit(LockPurpose::Mapping, TaskStatus::Mapped),
            BulkTransition::ValidateAll => submit(LockPurpose::Validation, TaskStatus::Validated),
            BulkTransition::InvalidateAll => {
                submit(LockPurpose::Validation, TaskStatus::Invalidated)
            }
            BulkTransition::ResetAll | BulkTransition::ResetBadImagery => vec![TaskEvent::Reset],
        }
    }
}

impl Engine {
    /// Apply `transition` to every eligible task in a project.
    pub fn bulk_apply(
        &self,
        project_id: ProjectId,
        transition: BulkTransition,
        principal: PrincipalId,
    ) -> TaskResult<BulkReport> {
        if !self.permissions.may_administer(principal, project_id) {
            return Err(TaskError::not_permitted(
                principal,
                project_id,
                format!("run {}", transition.as_str()),
            ));
        }

        let candidates = self.db.with_conn(|conn| {
            projects::require_project(conn, project_id)?;
            let mut selected = Vec::new();
            for task in tasks::list_tasks_internal(conn, project_id)? {
                let base = if task.status.is_locked() {
                    current_lock_internal(conn, project_id, task.id)?
                        .map(|lock| lock.prior_status)
                        .unwrap_or(task.status)
                } else {
                    task.status
                };
                if transition.selects(base) {
                    selected.push(task.id);
                }
            }
            Ok(selected)
        })?;

        let mut report = BulkReport {
            transition,
            changed: 0,
            skipped: Vec::new(),
        };
        for task_id in candidates {
            match self.bulk_apply_one(project_id, task_id, transition, principal) {
                Ok(_) => report.changed += 1,
                Err(err) if err.is_expected() => {
                    debug!(project_id, task_id, error = %err, "Bulk run skipped task");
                    report.skipped.push(SkippedTask {
                        task_id,
                        reason: err.code(),
                        message: err.to_string(),
                    });
                }
                Err(err) => return Err(err),
            }
        }

        info!(
            project_id,
            principal,
            transition = transition.as_str(),
            changed = report.changed,
            skipped = report.skipped.len(),
            "Bulk transition applied"
        );
        Ok(report)
    }

    fn bulk_apply_one(
        &self,
        project_id: ProjectId,
        task_id: TaskId,
        transition: BulkTransition,
        principal: PrincipalId,
    ) -> TaskResult<Task> {
        self.db.transaction(|tx| {
            let mut task = tasks::require_task(tx, project_id, task_id)?;
            if let Some(lock) = current_lock_internal(tx, project_id, task_id)? {
                return Err(TaskError::AlreadyLocked {
                    task_id,
                    holder: lock.holder,
                });
            }
            if !transition.selects(task.status) {
                return Err(TaskError::invalid_state(task_id, task.status, transition.as_str()));
            }
            for event in transition.events() {
                task = apply_transition(tx, &task, principal, event, None)?.0;
            }
            Ok(task)
        })
    }
}
