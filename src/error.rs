//! Structured error types for engine operations.
//!
//! Every expected, recoverable outcome has its own variant so that callers can
//! tell "someone else is editing this" apart from "you're not allowed" or
//! "nothing to undo". Only [`TaskError::Storage`] is unexpected.

use crate::types::{PrincipalId, ProjectId, TaskId, TaskStatus};
use serde::Serialize;

/// Error kinds for programmatic error handling.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    // Workflow errors
    InvalidState,
    AlreadyLocked,
    NotLockHolder,
    NotPermitted,
    NotSplittable,
    NothingToUndo,
    StaleUndo,

    // Retryable
    ConcurrencyConflict,

    // Lookup / validation errors
    TaskNotFound,
    ProjectNotFound,
    InvalidInput,

    // Internal errors
    StorageError,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::InvalidState => "INVALID_STATE",
            ErrorCode::AlreadyLocked => "ALREADY_LOCKED",
            ErrorCode::NotLockHolder => "NOT_LOCK_HOLDER",
            ErrorCode::NotPermitted => "NOT_PERMITTED",
            ErrorCode::NotSplittable => "NOT_SPLITTABLE",
            ErrorCode::NothingToUndo => "NOTHING_TO_UNDO",
            ErrorCode::StaleUndo => "STALE_UNDO",
            ErrorCode::ConcurrencyConflict => "CONCURRENCY_CONFLICT",
            ErrorCode::TaskNotFound => "TASK_NOT_FOUND",
            ErrorCode::ProjectNotFound => "PROJECT_NOT_FOUND",
            ErrorCode::InvalidInput => "INVALID_INPUT",
            ErrorCode::StorageError => "STORAGE_ERROR",
        }
    }
}

/// Error returned by every engine and storage operation.
#[derive(Debug, thiserror::Error)]
pub enum TaskError {
    #[error("cannot {event} task {task_id} while it is {status}")]
    InvalidState {
        task_id: TaskId,
        status: TaskStatus,
        event: String,
    },

    #[error("task {task_id} is already locked by principal {holder}")]
    AlreadyLocked { task_id: TaskId, holder: PrincipalId },

    #[error("principal {principal} does not hold the lock on task {task_id}")]
    NotLockHolder {
        task_id: TaskId,
        principal: PrincipalId,
    },

    #[error("principal {principal} may not {action} in project {project_id}")]
    NotPermitted {
        principal: PrincipalId,
        project_id: ProjectId,
        action: String,
    },

    #[error("task {task_id} cannot be split: {reason}")]
    NotSplittable { task_id: TaskId, reason: String },

    #[error("principal {principal} has nothing to undo on task {task_id}")]
    NothingToUndo {
        task_id: TaskId,
        principal: PrincipalId,
    },

    #[error("task {task_id} was changed after principal {principal}'s last action")]
    StaleUndo {
        task_id: TaskId,
        principal: PrincipalId,
    },

    #[error("concurrent write conflict: {0}")]
    ConcurrencyConflict(String),

    #[error("task not found: {project_id}/{task_id}")]
    TaskNotFound {
        project_id: ProjectId,
        task_id: TaskId,
    },

    #[error("project not found: {0}")]
    ProjectNotFound(ProjectId),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("storage error: {0}")]
    Storage(String),
}

impl TaskError {
    /// The kind of this error.
    pub fn code(&self) -> ErrorCode {
        match self {
            TaskError::InvalidState { .. } => ErrorCode::InvalidState,
            TaskError::AlreadyLocked { .. } => ErrorCode::AlreadyLocked,
            TaskError::NotLockHolder { .. } => ErrorCode::NotLockHolder,
            TaskError::NotPermitted { .. } => ErrorCode::NotPermitted,
            TaskError::NotSplittable { .. } => ErrorCode::NotSplittable,
            TaskError::NothingToUndo { .. } => ErrorCode::NothingToUndo,
            TaskError::StaleUndo { .. } => ErrorCode::StaleUndo,
            TaskError::ConcurrencyConflict(_) => ErrorCode::ConcurrencyConflict,
            TaskError::TaskNotFound { .. } => ErrorCode::TaskNotFound,
            TaskError::ProjectNotFound(_) => ErrorCode::ProjectNotFound,
            TaskError::InvalidInput(_) => ErrorCode::InvalidInput,
            TaskError::Storage(_) => ErrorCode::StorageError,
        }
    }

    /// Whether the failure is transient and the unit of work may be retried.
    pub fn is_retryable(&self) -> bool {
        matches!(self, TaskError::ConcurrencyConflict(_))
    }

    /// Whether the failure is an expected workflow outcome rather than an
    /// infrastructure fault.
    pub fn is_expected(&self) -> bool {
        !matches!(self, TaskError::Storage(_))
    }

    pub fn storage(err: impl std::fmt::Display) -> Self {
        TaskError::Storage(err.to_string())
    }

    pub fn invalid_state(task_id: TaskId, status: TaskStatus, event: impl Into<String>) -> Self {
        TaskError::InvalidState {
            task_id,
            status,
            event: event.into(),
        }
    }

    pub fn not_splittable(task_id: TaskId, reason: impl Into<String>) -> Self {
        TaskError::NotSplittable {
            task_id,
            reason: reason.into(),
        }
    }

    pub fn not_permitted(
        principal: PrincipalId,
        project_id: ProjectId,
        action: impl Into<String>,
    ) -> Self {
        TaskError::NotPermitted {
            principal,
            project_id,
            action: action.into(),
        }
    }
}

impl From<rusqlite::Error> for TaskError {
    fn from(err: rusqlite::Error) -> Self {
        match err.sqlite_error_code() {
            Some(rusqlite::ErrorCode::DatabaseBusy) | Some(rusqlite::ErrorCode::DatabaseLocked) => {
                TaskError::ConcurrencyConflict(err.to_string())
            }
            _ => TaskError::Storage(err.to_string()),
        }
    }
}

impl From<serde_json::Error> for TaskError {
    fn from(err: serde_json::Error) -> Self {
        TaskError::Storage(format!("corrupt stored value: {}", err))
    }
}

impl From<refinery::Error> for TaskError {
    fn from(err: refinery::Error) -> Self {
        TaskError::Storage(format!("migration failed: {}", err))
    }
}

/// Result type for engine operations.
pub type TaskResult<T> = std::result::Result<T, TaskError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_serialize_screaming_snake_case() {
        let json = serde_json::to_string(&ErrorCode::AlreadyLocked).unwrap();
        assert_eq!(json, "\"ALREADY_LOCKED\"");
        assert_eq!(ErrorCode::StaleUndo.as_str(), "STALE_UNDO");
    }

    #[test]
    fn only_conflicts_are_retryable() {
        assert!(TaskError::ConcurrencyConflict("busy".into()).is_retryable());
        assert!(!TaskError::storage("disk gone").is_retryable());
        assert!(
            !TaskError::AlreadyLocked {
                task_id: 1,
                holder: 2
            }
            .is_retryable()
        );
    }

    #[test]
    fn storage_errors_are_not_expected() {
        assert!(!TaskError::storage("x").is_expected());
        assert!(TaskError::ProjectNotFound(3).is_expected());
        assert_eq!(TaskError::ProjectNotFound(3).code(), ErrorCode::ProjectNotFound);
    }

    #[test]
    fn busy_sqlite_errors_map_to_conflict() {
        let err = rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_BUSY),
            Some("database is locked".into()),
        );
        assert_eq!(TaskError::from(err).code(), ErrorCode::ConcurrencyConflict);
    }
}
