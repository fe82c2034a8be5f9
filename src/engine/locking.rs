//! Lock coordinator: acquire, release and privileged reclamation.

use super::{Engine, append_comment, apply_transition};
use crate::db::ledger::{current_lock_internal, last_mapper_internal, lock_from_entry};
use crate::db::{issues, tasks};
use crate::error::{TaskError, TaskResult};
use crate::state_machine::{self, TaskEvent};
use crate::types::{
    Lock, LockPurpose, PrincipalId, ProjectId, ReleaseNotes, ReleaseOutcome, Task, TaskId,
};
use tracing::info;

impl Engine {
    pub fn lock_for_mapping(
        &self,
        project_id: ProjectId,
        task_id: TaskId,
        principal: PrincipalId,
    ) -> TaskResult<Lock> {
        self.acquire(project_id, task_id, principal, LockPurpose::Mapping)
    }

    pub fn lock_for_validation(
        &self,
        project_id: ProjectId,
        task_id: TaskId,
        principal: PrincipalId,
    ) -> TaskResult<Lock> {
        self.acquire(project_id, task_id, principal, LockPurpose::Validation)
    }

    /// Lock a task for `purpose`.
    ///
    /// Re-locking a task the principal already holds for the same purpose
    /// returns the existing lock.
    pub fn acquire(
        &self,
        project_id: ProjectId,
        task_id: TaskId,
        principal: PrincipalId,
        purpose: LockPurpose,
    ) -> TaskResult<Lock> {
        let (lock, fresh) = self.db.transaction(|tx| {
            let task = tasks::require_task(tx, project_id, task_id)?;

            if let Some(existing) = current_lock_internal(tx, project_id, task_id)? {
                if existing.holder != principal {
                    return Err(TaskError::AlreadyLocked {
                        task_id,
                        holder: existing.holder,
                    });
                }
                if existing.purpose == purpose {
                    return Ok((existing, false));
                }
                return Err(TaskError::invalid_state(
                    task_id,
                    task.status,
                    TaskEvent::Lock(purpose).name(),
                ));
            }

            let event = TaskEvent::Lock(purpose);
            state_machine::next_status(task_id, task.status, event)?;

            if !self.permissions.may_lock(principal, project_id, purpose) {
                return Err(TaskError::not_permitted(
                    principal,
                    project_id,
                    format!("lock tasks for {}", purpose.as_str()),
                ));
            }
            if purpose == LockPurpose::Validation
                && !self.permissions.may_validate_own_work(principal, project_id)
                && last_mapper_internal(tx, project_id, task_id)?.map(|(mapper, _)| mapper)
                    == Some(principal)
            {
                return Err(TaskError::not_permitted(
                    principal,
                    project_id,
                    "validate their own mapping",
                ));
            }

            let (_, entry) = apply_transition(tx, &task, principal, event, None)?;
            let lock = lock_from_entry(&entry)?.ok_or_else(|| {
                TaskError::storage(format!("entry {} is not a lock entry", entry.id))
            })?;
            Ok((lock, true))
        })?;

        if fresh {
            info!(
                project_id,
                task_id,
                principal,
                purpose = purpose.as_str(),
                "Task locked"
            );
        }
        Ok(lock)
    }

    /// Release a lock held by `principal`.
    pub fn release(
        &self,
        project_id: ProjectId,
        task_id: TaskId,
        principal: PrincipalId,
        outcome: ReleaseOutcome,
    ) -> TaskResult<Task> {
        self.release_with(project_id, task_id, principal, outcome, &ReleaseNotes::default())
    }

    /// Release with an optional comment and, for validation outcomes, mapping issues.
    pub fn release_with(
        &self,
        project_id: ProjectId,
        task_id: TaskId,
        principal: PrincipalId,
        outcome: ReleaseOutcome,
        notes: &ReleaseNotes,
    ) -> TaskResult<Task> {
        let task = self.db.transaction(|tx| {
            let task = tasks::require_task(tx, project_id, task_id)?;
            let lock = current_lock_internal(tx, project_id, task_id)?
                .filter(|lock| lock.holder == principal)
                .ok_or(TaskError::NotLockHolder { task_id, principal })?;

            let event = match outcome {
                ReleaseOutcome::Submit(status) => TaskEvent::Submit(status),
                ReleaseOutcome::Abandon => TaskEvent::Unlock {
                    restore: lock.prior_status,
                },
            };
            state_machine::next_status(task_id, task.status, event)?;

            if !notes.issues.is_empty()
                && !matches!(
                    (lock.purpose, outcome),
                    (LockPurpose::Validation, ReleaseOutcome::Submit(_))
                )
            {
                return Err(TaskError::InvalidInput(
                    "mapping issues can only be recorded with a validation result".to_string(),
                ));
            }

            if let Some(text) = notes.comment.as_deref().filter(|t| !t.trim().is_empty()) {
                append_comment(tx, project_id, task_id, principal, text)?;
            }

            let (task, entry) = apply_transition(tx, &task, principal, event, None)?;
            issues::insert_issues(tx, entry.id, project_id, task_id, &notes.issues)?;
            Ok(task)
        })?;

        info!(
            project_id,
            task_id,
            principal,
            status = task.status.as_str(),
            "Task released"
        );
        Ok(task)
    }

    /// Reclaim an abandoned lock on behalf of the sweeper.
    ///
    /// Exempt from the lock-holder check. Applies only if `expected` is still
    /// the most recent entry for the task; returns `false` otherwise.
    pub fn reclaim_stale_lock(&self, expected: &Lock) -> TaskResult<bool> {
        let reclaimed = self.db.transaction(|tx| {
            let current = current_lock_internal(tx, expected.project_id, expected.task_id)?;
            if current.as_ref().map(|lock| lock.entry_id) != Some(expected.entry_id) {
                return Ok(None);
            }
            let task = tasks::require_task(tx, expected.project_id, expected.task_id)?;
            let event = TaskEvent::AutoUnlock {
                restore: expected.prior_status,
            };
            let (task, _) = apply_transition(tx, &task, expected.holder, event, None)?;
            Ok(Some(task))
        })?;

        match reclaimed {
            Some(task) => {
                info!(
                    project_id = expected.project_id,
                    task_id = expected.task_id,
                    holder = expected.holder,
                    status = task.status.as_str(),
                    "Reclaimed stale lock"
                );
                Ok(true)
            }
            None => Ok(false),
        }
    }
}
