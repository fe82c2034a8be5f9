//! Core types for the tasking engine.

use crate::error::ErrorCode;
use crate::geometry::Geometry;
use serde::{Deserialize, Serialize};
use std::fmt;

pub type ProjectId = i64;
pub type TaskId = i64;
pub type PrincipalId = i64;

/// Workflow status of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TaskStatus {
    #[serde(rename = "READY")]
    Ready,
    #[serde(rename = "LOCKED_FOR_MAPPING")]
    LockedForMapping,
    #[serde(rename = "MAPPED")]
    Mapped,
    #[serde(rename = "LOCKED_FOR_VALIDATION")]
    LockedForValidation,
    #[serde(rename = "VALIDATED")]
    Validated,
    #[serde(rename = "INVALIDATED")]
    Invalidated,
    #[serde(rename = "BADIMAGERY")]
    BadImagery,
    #[serde(rename = "SPLIT")]
    Split,
}

impl TaskStatus {
    pub const ALL: [TaskStatus; 8] = [
        TaskStatus::Ready,
        TaskStatus::LockedForMapping,
        TaskStatus::Mapped,
        TaskStatus::LockedForValidation,
        TaskStatus::Validated,
        TaskStatus::Invalidated,
        TaskStatus::BadImagery,
        TaskStatus::Split,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Ready => "READY",
            TaskStatus::LockedForMapping => "LOCKED_FOR_MAPPING",
            TaskStatus::Mapped => "MAPPED",
            TaskStatus::LockedForValidation => "LOCKED_FOR_VALIDATION",
            TaskStatus::Validated => "VALIDATED",
            TaskStatus::Invalidated => "INVALIDATED",
            TaskStatus::BadImagery => "BADIMAGERY",
            TaskStatus::Split => "SPLIT",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        TaskStatus::ALL.into_iter().find(|status| status.as_str() == s)
    }

    pub fn is_locked(&self) -> bool {
        matches!(
            self,
            TaskStatus::LockedForMapping | TaskStatus::LockedForValidation
        )
    }

    /// The purpose of the lock this status represents, if any.
    pub fn lock_purpose(&self) -> Option<LockPurpose> {
        match self {
            TaskStatus::LockedForMapping => Some(LockPurpose::Mapping),
            TaskStatus::LockedForValidation => Some(LockPurpose::Validation),
            _ => None,
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a principal wants to lock a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LockPurpose {
    Mapping,
    Validation,
}

impl LockPurpose {
    pub fn as_str(&self) -> &'static str {
        match self {
            LockPurpose::Mapping => "mapping",
            LockPurpose::Validation => "validation",
        }
    }

    /// Status a task holds while locked for this purpose.
    pub fn locked_status(&self) -> TaskStatus {
        match self {
            LockPurpose::Mapping => TaskStatus::LockedForMapping,
            LockPurpose::Validation => TaskStatus::LockedForValidation,
        }
    }

    pub fn lock_action(&self) -> LedgerAction {
        match self {
            LockPurpose::Mapping => LedgerAction::LockedForMapping,
            LockPurpose::Validation => LedgerAction::LockedForValidation,
        }
    }

    pub fn auto_unlock_action(&self) -> LedgerAction {
        match self {
            LockPurpose::Mapping => LedgerAction::AutoUnlockedForMapping,
            LockPurpose::Validation => LedgerAction::AutoUnlockedForValidation,
        }
    }
}

/// Kind of a ledger entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LedgerAction {
    LockedForMapping,
    LockedForValidation,
    StateChange,
    AutoUnlockedForMapping,
    AutoUnlockedForValidation,
    Comment,
}

impl LedgerAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            LedgerAction::LockedForMapping => "LOCKED_FOR_MAPPING",
            LedgerAction::LockedForValidation => "LOCKED_FOR_VALIDATION",
            LedgerAction::StateChange => "STATE_CHANGE",
            LedgerAction::AutoUnlockedForMapping => "AUTO_UNLOCKED_FOR_MAPPING",
            LedgerAction::AutoUnlockedForValidation => "AUTO_UNLOCKED_FOR_VALIDATION",
            LedgerAction::Comment => "COMMENT",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "LOCKED_FOR_MAPPING" => Some(LedgerAction::LockedForMapping),
            "LOCKED_FOR_VALIDATION" => Some(LedgerAction::LockedForValidation),
            "STATE_CHANGE" => Some(LedgerAction::StateChange),
            "AUTO_UNLOCKED_FOR_MAPPING" => Some(LedgerAction::AutoUnlockedForMapping),
            "AUTO_UNLOCKED_FOR_VALIDATION" => Some(LedgerAction::AutoUnlockedForValidation),
            "COMMENT" => Some(LedgerAction::Comment),
            _ => None,
        }
    }

    /// Lock purpose for `LOCKED_*` entries.
    pub fn lock_purpose(&self) -> Option<LockPurpose> {
        match self {
            LedgerAction::LockedForMapping => Some(LockPurpose::Mapping),
            LedgerAction::LockedForValidation => Some(LockPurpose::Validation),
            _ => None,
        }
    }

    pub fn is_auto_unlock(&self) -> bool {
        matches!(
            self,
            LedgerAction::AutoUnlockedForMapping | LedgerAction::AutoUnlockedForValidation
        )
    }
}

/// How a project was gridded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GridMode {
    /// Regular Web Mercator tile grid with x/y/zoom addresses.
    Square,
    /// Free-form task shapes without grid addresses.
    Arbitrary,
}

impl GridMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            GridMode::Square => "square",
            GridMode::Arbitrary => "arbitrary",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "square" => Some(GridMode::Square),
            "arbitrary" => Some(GridMode::Arbitrary),
            _ => None,
        }
    }
}

/// A project's area of interest and grid parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Project {
    pub id: ProjectId,
    pub aoi: Geometry,
    pub grid: GridMode,
    pub max_zoom: i32,
    pub created_at: i64,
}

/// A unit of mappable work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub project_id: ProjectId,
    pub id: TaskId,
    pub geometry: Geometry,
    pub x: Option<i32>,
    pub y: Option<i32>,
    pub zoom: Option<i32>,
    pub is_square: bool,
    pub status: TaskStatus,
    pub parent_id: Option<TaskId>,
    pub created_at: i64,
    pub updated_at: i64,
}

impl Task {
    /// Grid address, when the task came from regular subdivision.
    pub fn grid_address(&self) -> Option<(i32, i32, i32)> {
        match (self.x, self.y, self.zoom) {
            (Some(x), Some(y), Some(zoom)) => Some((x, y, zoom)),
            _ => None,
        }
    }
}

/// Input for inserting a task.
#[derive(Debug, Clone)]
pub struct NewTask {
    pub geometry: Geometry,
    pub x: Option<i32>,
    pub y: Option<i32>,
    pub zoom: Option<i32>,
    pub is_square: bool,
    pub parent_id: Option<TaskId>,
}

/// An immutable ledger entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub id: i64,
    pub project_id: ProjectId,
    pub task_id: TaskId,
    pub principal_id: PrincipalId,
    pub action: LedgerAction,
    /// Resulting status for `STATE_CHANGE`, pre-lock status for `LOCKED_*`,
    /// elapsed lock duration for `AUTO_UNLOCKED_*`, free text for `COMMENT`.
    pub action_text: Option<String>,
    /// Set on the entry that closes a lock.
    pub lock_duration_ms: Option<i64>,
    /// Id of the entry an undo compensates.
    pub compensates: Option<i64>,
    pub timestamp: i64,
}

impl LedgerEntry {
    /// Status recorded by a `STATE_CHANGE` entry.
    pub fn resulting_status(&self) -> Option<TaskStatus> {
        match self.action {
            LedgerAction::StateChange => self.action_text.as_deref().and_then(TaskStatus::from_str),
            _ => None,
        }
    }
}

/// An outstanding lock, derived from the most recent ledger entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lock {
    pub project_id: ProjectId,
    pub task_id: TaskId,
    pub holder: PrincipalId,
    pub purpose: LockPurpose,
    pub locked_at: i64,
    /// Ledger entry that opened the lock.
    pub entry_id: i64,
    /// Status the task returns to if the lock is released without a submission.
    pub prior_status: TaskStatus,
}

/// Read-only snapshot for polling callers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskState {
    pub project_id: ProjectId,
    pub task_id: TaskId,
    pub status: TaskStatus,
    pub lock_holder: Option<PrincipalId>,
    pub lock_purpose: Option<LockPurpose>,
    pub lock_age_ms: Option<i64>,
}

/// How a lock holder ends their lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReleaseOutcome {
    /// Submit a result status (MAPPED/BADIMAGERY or VALIDATED/INVALIDATED).
    Submit(TaskStatus),
    /// Give the task back in its pre-lock status.
    Abandon,
}

/// Optional extras recorded alongside a release.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReleaseNotes {
    pub comment: Option<String>,
    #[serde(default)]
    pub issues: Vec<MappingIssueInput>,
}

/// A validation-time annotation to record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MappingIssueInput {
    pub category_id: i64,
    pub issue: String,
    #[serde(default = "default_issue_count")]
    pub count: i32,
}

fn default_issue_count() -> i32 {
    1
}

/// A stored mapping issue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MappingIssue {
    pub id: i64,
    pub history_id: i64,
    pub project_id: ProjectId,
    pub task_id: TaskId,
    pub category_id: i64,
    pub issue: String,
    pub count: i32,
}

/// Links a mapping to the invalidation that rejected it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvalidationRecord {
    pub id: i64,
    pub project_id: ProjectId,
    pub task_id: TaskId,
    pub is_closed: bool,
    pub mapper_id: Option<PrincipalId>,
    pub mapped_at: Option<i64>,
    pub invalidator_id: PrincipalId,
    pub invalidated_at: i64,
    pub invalidation_history_id: i64,
    pub validator_id: Option<PrincipalId>,
    pub validated_at: Option<i64>,
    pub closed_by_history_id: Option<i64>,
    pub updated_at: i64,
}

/// Result of splitting a task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SplitOutcome {
    pub parent: Task,
    pub children: Vec<Task>,
}

/// Administrative transitions applied project-wide.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BulkTransition {
    MapAll,
    ValidateAll,
    InvalidateAll,
    ResetAll,
    ResetBadImagery,
}

impl BulkTransition {
    pub fn as_str(&self) -> &'static str {
        match self {
            BulkTransition::MapAll => "map_all",
            BulkTransition::ValidateAll => "validate_all",
            BulkTransition::InvalidateAll => "invalidate_all",
            BulkTransition::ResetAll => "reset_all",
            BulkTransition::ResetBadImagery => "reset_bad_imagery",
        }
    }
}

/// A task a bulk run could not change.
#[derive(Debug, Clone, Serialize)]
pub struct SkippedTask {
    pub task_id: TaskId,
    pub reason: ErrorCode,
    pub message: String,
}

/// Result of a bulk run.
#[derive(Debug, Clone, Serialize)]
pub struct BulkReport {
    pub transition: BulkTransition,
    pub changed: usize,
    pub skipped: Vec<SkippedTask>,
}

/// A (project, task) pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TaskRef {
    pub project_id: ProjectId,
    pub task_id: TaskId,
}

/// Result of one sweeper pass.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SweepReport {
    pub projects_scanned: usize,
    pub reclaimed: Vec<TaskRef>,
    /// Candidates whose lock was released between scan and reclaim.
    pub skipped_released: usize,
    pub failures: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_names_round_trip_through_from_str() {
        for status in TaskStatus::ALL {
            assert_eq!(TaskStatus::from_str(status.as_str()), Some(status));
        }
        assert_eq!(TaskStatus::from_str("PENDING"), None);
    }

    #[test]
    fn status_serializes_with_ledger_names() {
        let json = serde_json::to_string(&TaskStatus::BadImagery).unwrap();
        assert_eq!(json, "\"BADIMAGERY\"");
        let json = serde_json::to_string(&TaskStatus::LockedForValidation).unwrap();
        assert_eq!(json, "\"LOCKED_FOR_VALIDATION\"");
    }

    #[test]
    fn only_lock_states_are_locked() {
        let locked: Vec<_> = TaskStatus::ALL
            .into_iter()
            .filter(TaskStatus::is_locked)
            .collect();
        assert_eq!(
            locked,
            vec![TaskStatus::LockedForMapping, TaskStatus::LockedForValidation]
        );
    }

    #[test]
    fn purposes_map_to_matching_actions() {
        assert_eq!(
            LockPurpose::Mapping.lock_action().lock_purpose(),
            Some(LockPurpose::Mapping)
        );
        assert!(LockPurpose::Validation.auto_unlock_action().is_auto_unlock());
        assert_eq!(
            TaskStatus::LockedForValidation.lock_purpose(),
            Some(LockPurpose::Validation)
        );
    }
}
