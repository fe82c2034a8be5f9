//! Task status transition table and ledger replay.
//!
//! `next_status` is the only place that decides whether a transition is legal.
//! The engine applies its answer together with exactly one ledger entry.

use crate::error::{TaskError, TaskResult};
use crate::types::{LedgerAction, LedgerEntry, LockPurpose, TaskId, TaskStatus};

/// An event that may move a task between statuses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskEvent {
    /// Acquire a lock for the given purpose.
    Lock(LockPurpose),
    /// Lock holder submits a result.
    Submit(TaskStatus),
    /// Lock holder gives the task back without submitting.
    Unlock { restore: TaskStatus },
    /// Sweeper reclaims an abandoned lock.
    AutoUnlock { restore: TaskStatus },
    /// Administrative reset.
    Reset,
    /// Parent task is subdivided.
    Split,
    /// Compensating transition appended by undo.
    Revert(TaskStatus),
}

impl TaskEvent {
    pub fn name(&self) -> String {
        match self {
            TaskEvent::Lock(purpose) => format!("lock for {}", purpose.as_str()),
            TaskEvent::Submit(status) => format!("submit {}", status),
            TaskEvent::Unlock { .. } => "unlock".to_string(),
            TaskEvent::AutoUnlock { .. } => "auto-unlock".to_string(),
            TaskEvent::Reset => "reset".to_string(),
            TaskEvent::Split => "split".to_string(),
            TaskEvent::Revert(status) => format!("revert to {}", status),
        }
    }
}

/// Whether `status` may be locked for `purpose`.
pub fn admits_lock(status: TaskStatus, purpose: LockPurpose) -> bool {
    match purpose {
        LockPurpose::Mapping => matches!(
            status,
            TaskStatus::Ready | TaskStatus::Invalidated | TaskStatus::BadImagery
        ),
        LockPurpose::Validation => matches!(
            status,
            TaskStatus::Mapped
                | TaskStatus::Validated
                | TaskStatus::Invalidated
                | TaskStatus::BadImagery
        ),
    }
}

/// Whether `status` is a legal place for a task to rest unlocked.
fn is_resting(status: TaskStatus) -> bool {
    !status.is_locked() && status != TaskStatus::Split
}

/// Status `from` moves to on `event`, or `InvalidState`.
pub fn next_status(task_id: TaskId, from: TaskStatus, event: TaskEvent) -> TaskResult<TaskStatus> {
    let invalid = || TaskError::invalid_state(task_id, from, event.name());

    match event {
        TaskEvent::Lock(purpose) if admits_lock(from, purpose) => Ok(purpose.locked_status()),
        TaskEvent::Submit(status) => match (from, status) {
            (TaskStatus::LockedForMapping, TaskStatus::Mapped | TaskStatus::BadImagery)
            | (
                TaskStatus::LockedForValidation,
                TaskStatus::Validated | TaskStatus::Invalidated,
            ) => Ok(status),
            _ => Err(invalid()),
        },
        TaskEvent::Unlock { restore } | TaskEvent::AutoUnlock { restore }
            if from.is_locked() && is_resting(restore) =>
        {
            Ok(restore)
        }
        TaskEvent::Reset if is_resting(from) => Ok(TaskStatus::Ready),
        TaskEvent::Split if is_resting(from) => Ok(TaskStatus::Split),
        TaskEvent::Revert(target) if from != TaskStatus::Split && is_resting(target) => Ok(target),
        _ => Err(invalid()),
    }
}

/// Running state while replaying a ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Replay {
    pub status: TaskStatus,
    /// Status before the outstanding lock, if the task is locked.
    pub pre_lock: Option<TaskStatus>,
}

impl Default for Replay {
    fn default() -> Self {
        Self {
            status: TaskStatus::Ready,
            pre_lock: None,
        }
    }
}

impl Replay {
    /// Fold one entry into the running state.
    pub fn apply(&mut self, entry: &LedgerEntry) -> TaskResult<()> {
        let corrupt = || {
            TaskError::storage(format!(
                "ledger entry {} for task {} has unreadable action_text",
                entry.id, entry.task_id
            ))
        };

        match entry.action {
            LedgerAction::LockedForMapping | LedgerAction::LockedForValidation => {
                let prior = entry
                    .action_text
                    .as_deref()
                    .and_then(TaskStatus::from_str)
                    .unwrap_or(self.status);
                self.pre_lock = Some(prior);
                if let Some(purpose) = entry.action.lock_purpose() {
                    self.status = purpose.locked_status();
                }
            }
            LedgerAction::StateChange => {
                self.status = entry.resulting_status().ok_or_else(corrupt)?;
                self.pre_lock = None;
            }
            LedgerAction::AutoUnlockedForMapping | LedgerAction::AutoUnlockedForValidation => {
                self.status = self.pre_lock.take().ok_or_else(corrupt)?;
            }
            LedgerAction::Comment => {}
        }
        Ok(())
    }

    /// The status the task would rest in if its outstanding lock were dropped.
    pub fn resting_status(&self) -> TaskStatus {
        match self.pre_lock {
            Some(prior) if self.status.is_locked() => prior,
            _ => self.status,
        }
    }
}

/// Replay entries in order and return the resulting state.
pub fn replay(entries: &[LedgerEntry]) -> TaskResult<Replay> {
    let mut state = Replay::default();
    for entry in entries {
        state.apply(entry)?;
    }
    Ok(state)
}

/// Replay entries in order and return the resulting status.
pub fn replay_status(entries: &[LedgerEntry]) -> TaskResult<TaskStatus> {
    Ok(replay(entries)?.status)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::PrincipalId;

    fn entry(
        id: i64,
        principal: PrincipalId,
        action: LedgerAction,
        text: Option<&str>,
    ) -> LedgerEntry {
        LedgerEntry {
            id,
            project_id: 1,
            task_id: 7,
            principal_id: principal,
            action,
            action_text: text.map(str::to_string),
            lock_duration_ms: None,
            compensates: None,
            timestamp: id * 1000,
        }
    }

    #[test]
    fn mapping_lock_sources() {
        for status in TaskStatus::ALL {
            let expected = matches!(
                status,
                TaskStatus::Ready | TaskStatus::Invalidated | TaskStatus::BadImagery
            );
            assert_eq!(
                next_status(1, status, TaskEvent::Lock(LockPurpose::Mapping)).is_ok(),
                expected,
                "{status}"
            );
        }
    }

    #[test]
    fn validation_lock_sources() {
        for status in TaskStatus::ALL {
            let expected = matches!(
                status,
                TaskStatus::Mapped
                    | TaskStatus::Validated
                    | TaskStatus::Invalidated
                    | TaskStatus::BadImagery
            );
            assert_eq!(
                next_status(1, status, TaskEvent::Lock(LockPurpose::Validation)).is_ok(),
                expected,
                "{status}"
            );
        }
    }

    #[test]
    fn submissions_must_match_lock_purpose() {
        let from = TaskStatus::LockedForMapping;
        assert_eq!(
            next_status(1, from, TaskEvent::Submit(TaskStatus::Mapped)).unwrap(),
            TaskStatus::Mapped
        );
        assert_eq!(
            next_status(1, from, TaskEvent::Submit(TaskStatus::BadImagery)).unwrap(),
            TaskStatus::BadImagery
        );
        assert!(next_status(1, from, TaskEvent::Submit(TaskStatus::Validated)).is_err());

        let from = TaskStatus::LockedForValidation;
        assert!(next_status(1, from, TaskEvent::Submit(TaskStatus::Invalidated)).is_ok());
        assert!(next_status(1, from, TaskEvent::Submit(TaskStatus::Mapped)).is_err());
        assert!(next_status(1, TaskStatus::Ready, TaskEvent::Submit(TaskStatus::Mapped)).is_err());
    }

    #[test]
    fn unlock_restores_previous_state_only_from_locked() {
        let event = TaskEvent::Unlock {
            restore: TaskStatus::Invalidated,
        };
        assert_eq!(
            next_status(1, TaskStatus::LockedForMapping, event).unwrap(),
            TaskStatus::Invalidated
        );
        assert!(next_status(1, TaskStatus::Mapped, event).is_err());
        let bogus = TaskEvent::AutoUnlock {
            restore: TaskStatus::LockedForMapping,
        };
        assert!(next_status(1, TaskStatus::LockedForValidation, bogus).is_err());
    }

    #[test]
    fn split_is_terminal() {
        for event in [
            TaskEvent::Reset,
            TaskEvent::Split,
            TaskEvent::Lock(LockPurpose::Mapping),
            TaskEvent::Revert(TaskStatus::Ready),
        ] {
            let err = next_status(1, TaskStatus::Split, event).unwrap_err();
            assert_eq!(err.code(), crate::error::ErrorCode::InvalidState);
        }
    }

    #[test]
    fn reset_and_split_never_from_locked() {
        for from in [TaskStatus::LockedForMapping, TaskStatus::LockedForValidation] {
            assert!(next_status(1, from, TaskEvent::Reset).is_err());
            assert!(next_status(1, from, TaskEvent::Split).is_err());
        }
        assert_eq!(
            next_status(1, TaskStatus::Validated, TaskEvent::Split).unwrap(),
            TaskStatus::Split
        );
    }

    #[test]
    fn replay_reproduces_workflow() {
        let entries = vec![
            entry(1, 10, LedgerAction::LockedForMapping, Some("READY")),
            entry(2, 10, LedgerAction::StateChange, Some("MAPPED")),
            entry(3, 20, LedgerAction::LockedForValidation, Some("MAPPED")),
            entry(4, 20, LedgerAction::Comment, Some("missing buildings")),
            entry(5, 20, LedgerAction::StateChange, Some("INVALIDATED")),
        ];
        assert_eq!(replay_status(&entries).unwrap(), TaskStatus::Invalidated);
        assert_eq!(replay_status(&entries[..3]).unwrap(), TaskStatus::LockedForValidation);
    }

    #[test]
    fn replay_auto_unlock_restores_pre_lock_status() {
        let entries = vec![
            entry(1, 10, LedgerAction::LockedForMapping, Some("READY")),
            entry(2, 10, LedgerAction::StateChange, Some("MAPPED")),
            entry(3, 20, LedgerAction::LockedForValidation, Some("MAPPED")),
            entry(4, 20, LedgerAction::AutoUnlockedForValidation, Some("02:00:01")),
        ];
        let state = replay(&entries).unwrap();
        assert_eq!(state.status, TaskStatus::Mapped);
        assert_eq!(state.pre_lock, None);
    }

    #[test]
    fn resting_status_of_locked_task_is_pre_lock() {
        let entries = vec![
            entry(1, 10, LedgerAction::LockedForMapping, Some("READY")),
            entry(2, 10, LedgerAction::StateChange, Some("BADIMAGERY")),
            entry(3, 11, LedgerAction::LockedForMapping, Some("BADIMAGERY")),
        ];
        let state = replay(&entries).unwrap();
        assert_eq!(state.status, TaskStatus::LockedForMapping);
        assert_eq!(state.resting_status(), TaskStatus::BadImagery);
    }

    #[test]
    fn replay_rejects_corrupt_state_change() {
        let entries = vec![entry(1, 10, LedgerAction::StateChange, Some("FINISHED"))];
        assert!(replay_status(&entries).is_err());
    }
}
