//! Integration tests for locking, release, undo and the history ledger.
//!
//! These tests drive the engine against an in-memory SQLite database.
//! Tests are organized by operation.

use std::sync::Arc;
use tasking_core::config::PolicyConfig;
use tasking_core::db::Database;
use tasking_core::engine::Engine;
use tasking_core::error::ErrorCode;
use tasking_core::geometry::tile_bounds;
use tasking_core::permissions::{AllowAll, PolicyPermissions};
use tasking_core::types::{
    GridMode, LedgerAction, LockPurpose, MappingIssueInput, ProjectId, ReleaseNotes,
    ReleaseOutcome, TaskId, TaskStatus,
};

const MAPPER: i64 = 10;
const OTHER: i64 = 11;
const VALIDATOR: i64 = 20;

/// Helper to create an engine over a fresh in-memory database.
fn setup_engine() -> Engine {
    let db = Database::open_in_memory().expect("Failed to create in-memory database");
    Engine::new(db, Arc::new(AllowAll))
}

/// Project covering exactly tile (100, 200) at zoom 12; its only task is id 1.
fn single_tile_project(engine: &Engine) -> (ProjectId, TaskId) {
    let aoi = tile_bounds(100, 200, 12).to_geometry();
    let (project, tasks) = engine
        .create_project(&aoi, GridMode::Square, 12, 14)
        .expect("Failed to create project");
    assert_eq!(tasks.len(), 1);
    (project.id, tasks[0].id)
}

fn submit(status: TaskStatus) -> ReleaseOutcome {
    ReleaseOutcome::Submit(status)
}

mod scenario_tests {
    use super::*;

    #[test]
    fn map_then_invalidate_workflow() {
        let engine = setup_engine();
        let (project, task) = single_tile_project(&engine);
        let db = engine.database();

        let created = db.get_task(project, task).unwrap().unwrap();
        assert_eq!(created.grid_address(), Some((100, 200, 12)));
        assert_eq!(created.status, TaskStatus::Ready);
        assert!(created.is_square);

        engine.lock_for_mapping(project, task, MAPPER).unwrap();
        let state = engine.current_state(project, task).unwrap();
        assert_eq!(state.status, TaskStatus::LockedForMapping);
        assert_eq!(state.lock_holder, Some(MAPPER));
        assert_eq!(db.task_history(project, task).unwrap().len(), 1);

        let err = engine.lock_for_mapping(project, task, OTHER).unwrap_err();
        assert_eq!(err.code(), ErrorCode::AlreadyLocked);

        let mapped = engine
            .release(project, task, MAPPER, submit(TaskStatus::Mapped))
            .unwrap();
        assert_eq!(mapped.status, TaskStatus::Mapped);
        assert_eq!(db.task_history(project, task).unwrap().len(), 2);

        engine.lock_for_validation(project, task, VALIDATOR).unwrap();
        assert_eq!(
            engine.current_state(project, task).unwrap().status,
            TaskStatus::LockedForValidation
        );

        let invalidated = engine
            .release(project, task, VALIDATOR, submit(TaskStatus::Invalidated))
            .unwrap();
        assert_eq!(invalidated.status, TaskStatus::Invalidated);

        let history = db.task_history(project, task).unwrap();
        assert_eq!(history.len(), 4);

        let records = db.invalidation_records(project, task).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].mapper_id, Some(MAPPER));
        assert_eq!(records[0].invalidator_id, VALIDATOR);
        assert_eq!(records[0].invalidation_history_id, history[3].id);
        assert!(!records[0].is_closed);

        assert!(engine.verify_projection(project, task).unwrap());
    }

    #[test]
    fn ledger_records_lock_metadata() {
        let engine = setup_engine();
        let (project, task) = single_tile_project(&engine);

        engine.lock_for_mapping(project, task, MAPPER).unwrap();
        engine
            .release(project, task, MAPPER, submit(TaskStatus::BadImagery))
            .unwrap();

        let history = engine.database().task_history(project, task).unwrap();
        assert_eq!(history[0].action, LedgerAction::LockedForMapping);
        assert_eq!(history[0].action_text.as_deref(), Some("READY"));
        assert!(history[0].lock_duration_ms.is_none());
        assert_eq!(history[1].action, LedgerAction::StateChange);
        assert_eq!(history[1].action_text.as_deref(), Some("BADIMAGERY"));
        assert!(history[1].lock_duration_ms.is_some());
        assert!(history[0].id < history[1].id);
    }

    #[test]
    fn invalidation_record_closes_on_revalidation() {
        let engine = setup_engine();
        let (project, task) = single_tile_project(&engine);
        let db = engine.database();

        engine.lock_for_mapping(project, task, MAPPER).unwrap();
        engine.release(project, task, MAPPER, submit(TaskStatus::Mapped)).unwrap();
        engine.lock_for_validation(project, task, VALIDATOR).unwrap();
        engine
            .release(project, task, VALIDATOR, submit(TaskStatus::Invalidated))
            .unwrap();

        engine.lock_for_mapping(project, task, MAPPER).unwrap();
        engine.release(project, task, MAPPER, submit(TaskStatus::Mapped)).unwrap();
        engine.lock_for_validation(project, task, OTHER).unwrap();
        engine
            .release(project, task, OTHER, submit(TaskStatus::Validated))
            .unwrap();

        let records = db.invalidation_records(project, task).unwrap();
        assert_eq!(records.len(), 1);
        assert!(records[0].is_closed);
        assert_eq!(records[0].validator_id, Some(OTHER));

        let by_others = db.invalidated_by_others(MAPPER).unwrap();
        assert_eq!(by_others.len(), 1);
        assert!(db.invalidated_by_others(VALIDATOR).unwrap().is_empty());
    }
}

mod lock_tests {
    use super::*;

    #[test]
    fn relock_by_holder_is_idempotent() {
        let engine = setup_engine();
        let (project, task) = single_tile_project(&engine);

        let first = engine.lock_for_mapping(project, task, MAPPER).unwrap();
        let again = engine.lock_for_mapping(project, task, MAPPER).unwrap();

        assert_eq!(first, again);
        assert_eq!(engine.database().task_history(project, task).unwrap().len(), 1);
    }

    #[test]
    fn holder_cannot_switch_purpose_while_locked() {
        let engine = setup_engine();
        let (project, task) = single_tile_project(&engine);

        engine.lock_for_mapping(project, task, MAPPER).unwrap();
        let err = engine.lock_for_validation(project, task, MAPPER).unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidState);
    }

    #[test]
    fn ready_task_cannot_be_locked_for_validation() {
        let engine = setup_engine();
        let (project, task) = single_tile_project(&engine);

        let err = engine.lock_for_validation(project, task, VALIDATOR).unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidState);
        assert!(engine.database().task_history(project, task).unwrap().is_empty());
    }

    #[test]
    fn unknown_task_is_reported() {
        let engine = setup_engine();
        let (project, _) = single_tile_project(&engine);

        let err = engine.lock_for_mapping(project, 99, MAPPER).unwrap_err();
        assert_eq!(err.code(), ErrorCode::TaskNotFound);
    }

    #[test]
    fn current_state_of_unlocked_task_has_no_holder() {
        let engine = setup_engine();
        let (project, task) = single_tile_project(&engine);

        let state = engine.current_state(project, task).unwrap();
        assert_eq!(state.status, TaskStatus::Ready);
        assert!(state.lock_holder.is_none());
        assert!(state.lock_age_ms.is_none());

        engine.lock_for_mapping(project, task, MAPPER).unwrap();
        let state = engine.current_state(project, task).unwrap();
        assert_eq!(state.lock_purpose, Some(LockPurpose::Mapping));
        assert!(state.lock_age_ms.unwrap() >= 0);
    }
}

mod release_tests {
    use super::*;

    #[test]
    fn only_holder_may_release() {
        let engine = setup_engine();
        let (project, task) = single_tile_project(&engine);

        let err = engine
            .release(project, task, MAPPER, submit(TaskStatus::Mapped))
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::NotLockHolder);

        engine.lock_for_mapping(project, task, MAPPER).unwrap();
        let err = engine
            .release(project, task, OTHER, submit(TaskStatus::Mapped))
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::NotLockHolder);
    }

    #[test]
    fn abandon_restores_pre_lock_status() {
        let engine = setup_engine();
        let (project, task) = single_tile_project(&engine);

        engine.lock_for_mapping(project, task, MAPPER).unwrap();
        engine
            .release(project, task, MAPPER, submit(TaskStatus::BadImagery))
            .unwrap();
        engine.lock_for_mapping(project, task, OTHER).unwrap();

        let task_row = engine
            .release(project, task, OTHER, ReleaseOutcome::Abandon)
            .unwrap();
        assert_eq!(task_row.status, TaskStatus::BadImagery);
        assert!(engine.verify_projection(project, task).unwrap());
    }

    #[test]
    fn submission_must_match_lock_purpose() {
        let engine = setup_engine();
        let (project, task) = single_tile_project(&engine);

        engine.lock_for_mapping(project, task, MAPPER).unwrap();
        let err = engine
            .release(project, task, MAPPER, submit(TaskStatus::Validated))
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidState);

        // The lock survives the rejected release.
        let state = engine.current_state(project, task).unwrap();
        assert_eq!(state.lock_holder, Some(MAPPER));
        assert_eq!(engine.database().task_history(project, task).unwrap().len(), 1);
    }

    #[test]
    fn release_comment_precedes_state_change() {
        let engine = setup_engine();
        let (project, task) = single_tile_project(&engine);

        engine.lock_for_mapping(project, task, MAPPER).unwrap();
        let notes = ReleaseNotes {
            comment: Some("roads done".to_string()),
            issues: vec![],
        };
        engine
            .release_with(project, task, MAPPER, submit(TaskStatus::Mapped), &notes)
            .unwrap();

        let actions: Vec<_> = engine
            .database()
            .task_history(project, task)
            .unwrap()
            .into_iter()
            .map(|e| e.action)
            .collect();
        assert_eq!(
            actions,
            vec![
                LedgerAction::LockedForMapping,
                LedgerAction::Comment,
                LedgerAction::StateChange
            ]
        );
    }

    #[test]
    fn mapping_issues_attach_to_validation_result() {
        let engine = setup_engine();
        let (project, task) = single_tile_project(&engine);
        let db = engine.database();
        let issues = vec![MappingIssueInput {
            category_id: 3,
            issue: "untagged buildings".to_string(),
            count: 5,
        }];

        engine.lock_for_mapping(project, task, MAPPER).unwrap();
        let notes = ReleaseNotes {
            comment: None,
            issues: issues.clone(),
        };
        let err = engine
            .release_with(project, task, MAPPER, submit(TaskStatus::Mapped), &notes)
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidInput);

        engine.release(project, task, MAPPER, submit(TaskStatus::Mapped)).unwrap();
        engine.lock_for_validation(project, task, VALIDATOR).unwrap();
        engine
            .release_with(project, task, VALIDATOR, submit(TaskStatus::Invalidated), &notes)
            .unwrap();

        let stored = db.mapping_issues(project, task).unwrap();
        let last = db.latest_entry(project, task).unwrap().unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].count, 5);
        assert_eq!(stored[0].history_id, last.id);
    }
}

mod comment_tests {
    use super::*;

    #[test]
    fn comments_do_not_affect_locks() {
        let engine = setup_engine();
        let (project, task) = single_tile_project(&engine);

        engine.lock_for_mapping(project, task, MAPPER).unwrap();
        engine.comment(project, task, OTHER, "is this still in progress?").unwrap();

        let lock = engine.database().current_lock(project, task).unwrap();
        assert_eq!(lock.map(|l| l.holder), Some(MAPPER));
        assert_eq!(
            engine.current_state(project, task).unwrap().status,
            TaskStatus::LockedForMapping
        );

        // A comment is not an action for undo purposes.
        let err = engine.undo(project, task, OTHER).unwrap_err();
        assert_eq!(err.code(), ErrorCode::NothingToUndo);
    }

    #[test]
    fn empty_comment_rejected() {
        let engine = setup_engine();
        let (project, task) = single_tile_project(&engine);

        let err = engine.comment(project, task, MAPPER, "   ").unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidInput);
    }
}

mod undo_tests {
    use super::*;

    #[test]
    fn undo_submission_returns_to_pre_lock_status() {
        let engine = setup_engine();
        let (project, task) = single_tile_project(&engine);

        engine.lock_for_mapping(project, task, MAPPER).unwrap();
        engine.release(project, task, MAPPER, submit(TaskStatus::Mapped)).unwrap();

        let reverted = engine.undo(project, task, MAPPER).unwrap();
        assert_eq!(reverted.status, TaskStatus::Ready);

        let history = engine.database().task_history(project, task).unwrap();
        assert_eq!(history.len(), 3);
        assert_eq!(history[2].compensates, Some(history[1].id));
        assert_eq!(history[2].action, LedgerAction::StateChange);
        assert!(engine.verify_projection(project, task).unwrap());
        assert_eq!(engine.database().last_mapper(project, task).unwrap(), None);
    }

    #[test]
    fn undo_of_lock_releases_it() {
        let engine = setup_engine();
        let (project, task) = single_tile_project(&engine);

        engine.lock_for_mapping(project, task, MAPPER).unwrap();
        let reverted = engine.undo(project, task, MAPPER).unwrap();

        assert_eq!(reverted.status, TaskStatus::Ready);
        assert!(engine.database().current_lock(project, task).unwrap().is_none());
    }

    #[test]
    fn undo_after_someone_else_acted_is_stale() {
        let engine = setup_engine();
        let (project, task) = single_tile_project(&engine);

        engine.lock_for_mapping(project, task, MAPPER).unwrap();
        engine.release(project, task, MAPPER, submit(TaskStatus::Mapped)).unwrap();
        engine.lock_for_validation(project, task, VALIDATOR).unwrap();

        let err = engine.undo(project, task, MAPPER).unwrap_err();
        assert_eq!(err.code(), ErrorCode::StaleUndo);

        // Still stale after the other principal undoes their own action.
        engine.undo(project, task, VALIDATOR).unwrap();
        assert_eq!(
            engine.current_state(project, task).unwrap().status,
            TaskStatus::Mapped
        );
        let err = engine.undo(project, task, MAPPER).unwrap_err();
        assert_eq!(err.code(), ErrorCode::StaleUndo);
    }

    #[test]
    fn nothing_to_undo_without_entries_or_twice() {
        let engine = setup_engine();
        let (project, task) = single_tile_project(&engine);

        let err = engine.undo(project, task, MAPPER).unwrap_err();
        assert_eq!(err.code(), ErrorCode::NothingToUndo);

        engine.lock_for_mapping(project, task, MAPPER).unwrap();
        engine.release(project, task, MAPPER, submit(TaskStatus::Mapped)).unwrap();
        engine.undo(project, task, MAPPER).unwrap();

        let err = engine.undo(project, task, MAPPER).unwrap_err();
        assert_eq!(err.code(), ErrorCode::NothingToUndo);
    }

    #[test]
    fn undo_invalidation_removes_its_record() {
        let engine = setup_engine();
        let (project, task) = single_tile_project(&engine);
        let db = engine.database();

        engine.lock_for_mapping(project, task, MAPPER).unwrap();
        engine.release(project, task, MAPPER, submit(TaskStatus::Mapped)).unwrap();
        engine.lock_for_validation(project, task, VALIDATOR).unwrap();
        engine
            .release(project, task, VALIDATOR, submit(TaskStatus::Invalidated))
            .unwrap();
        assert_eq!(db.invalidation_records(project, task).unwrap().len(), 1);

        let reverted = engine.undo(project, task, VALIDATOR).unwrap();
        assert_eq!(reverted.status, TaskStatus::Mapped);
        assert!(db.invalidation_records(project, task).unwrap().is_empty());
    }

    #[test]
    fn undo_validation_reopens_record() {
        let engine = setup_engine();
        let (project, task) = single_tile_project(&engine);
        let db = engine.database();

        engine.lock_for_mapping(project, task, MAPPER).unwrap();
        engine.release(project, task, MAPPER, submit(TaskStatus::Mapped)).unwrap();
        engine.lock_for_validation(project, task, VALIDATOR).unwrap();
        engine
            .release(project, task, VALIDATOR, submit(TaskStatus::Invalidated))
            .unwrap();
        engine.lock_for_mapping(project, task, MAPPER).unwrap();
        engine.release(project, task, MAPPER, submit(TaskStatus::Mapped)).unwrap();
        engine.lock_for_validation(project, task, OTHER).unwrap();
        engine
            .release(project, task, OTHER, submit(TaskStatus::Validated))
            .unwrap();
        assert!(db.invalidation_records(project, task).unwrap()[0].is_closed);

        engine.undo(project, task, OTHER).unwrap();
        let record = &db.invalidation_records(project, task).unwrap()[0];
        assert!(!record.is_closed);
        assert!(record.validator_id.is_none());
        assert!(record.closed_by_history_id.is_none());
    }

    #[test]
    fn undo_second_invalidation_reopens_first_record() {
        let engine = setup_engine();
        let (project, task) = single_tile_project(&engine);
        let db = engine.database();

        engine.lock_for_mapping(project, task, MAPPER).unwrap();
        engine.release(project, task, MAPPER, submit(TaskStatus::Mapped)).unwrap();
        engine.lock_for_validation(project, task, VALIDATOR).unwrap();
        engine
            .release(project, task, VALIDATOR, submit(TaskStatus::Invalidated))
            .unwrap();
        engine.lock_for_mapping(project, task, MAPPER).unwrap();
        engine.release(project, task, MAPPER, submit(TaskStatus::Mapped)).unwrap();
        engine.lock_for_validation(project, task, OTHER).unwrap();
        engine
            .release(project, task, OTHER, submit(TaskStatus::Invalidated))
            .unwrap();

        let records = db.invalidation_records(project, task).unwrap();
        assert_eq!(records.len(), 2);
        assert!(records[0].is_closed);
        assert_eq!(records[0].closed_by_history_id, Some(records[1].invalidation_history_id));
        assert!(!records[1].is_closed);

        let reverted = engine.undo(project, task, OTHER).unwrap();
        assert_eq!(reverted.status, TaskStatus::Mapped);

        let records = db.invalidation_records(project, task).unwrap();
        assert_eq!(records.len(), 1);
        assert!(!records[0].is_closed);
        assert_eq!(records[0].invalidator_id, VALIDATOR);
        assert!(records[0].closed_by_history_id.is_none());
    }
}

mod permission_tests {
    use super::*;

    fn policy_engine(policy: PolicyConfig) -> Engine {
        let db = Database::open_in_memory().expect("Failed to create in-memory database");
        Engine::new(db, Arc::new(PolicyPermissions::new(policy)))
    }

    #[test]
    fn blocked_principal_cannot_lock() {
        let engine = policy_engine(PolicyConfig {
            blocked: vec![OTHER],
            ..PolicyConfig::default()
        });
        let (project, task) = single_tile_project(&engine);

        let err = engine.lock_for_mapping(project, task, OTHER).unwrap_err();
        assert_eq!(err.code(), ErrorCode::NotPermitted);
        assert!(engine.lock_for_mapping(project, task, MAPPER).is_ok());
    }

    #[test]
    fn self_validation_follows_policy() {
        let engine = policy_engine(PolicyConfig {
            allow_self_validation: false,
            ..PolicyConfig::default()
        });
        let (project, task) = single_tile_project(&engine);

        engine.lock_for_mapping(project, task, MAPPER).unwrap();
        engine.release(project, task, MAPPER, submit(TaskStatus::Mapped)).unwrap();

        let err = engine.lock_for_validation(project, task, MAPPER).unwrap_err();
        assert_eq!(err.code(), ErrorCode::NotPermitted);
        assert!(engine.lock_for_validation(project, task, VALIDATOR).is_ok());
    }

    #[test]
    fn self_validation_allowed_by_default() {
        let engine = setup_engine();
        let (project, task) = single_tile_project(&engine);

        engine.lock_for_mapping(project, task, MAPPER).unwrap();
        engine.release(project, task, MAPPER, submit(TaskStatus::Mapped)).unwrap();
        assert!(engine.lock_for_validation(project, task, MAPPER).is_ok());
    }
}

mod ledger_tests {
    use super::*;

    #[test]
    fn history_rows_are_append_only() {
        let engine = setup_engine();
        let (project, task) = single_tile_project(&engine);
        engine.lock_for_mapping(project, task, MAPPER).unwrap();

        let db = engine.database();
        let update = db.with_conn(|conn| {
            Ok(conn.execute("UPDATE task_history SET principal_id = 99", []))
        });
        assert!(update.unwrap().is_err());

        let delete = db.with_conn(|conn| Ok(conn.execute("DELETE FROM task_history", [])));
        assert!(delete.unwrap().is_err());
        assert_eq!(db.task_history(project, task).unwrap().len(), 1);
    }

    #[test]
    fn principal_history_lists_newest_first() {
        let engine = setup_engine();
        let (project, task) = single_tile_project(&engine);

        engine.lock_for_mapping(project, task, MAPPER).unwrap();
        engine.release(project, task, MAPPER, submit(TaskStatus::Mapped)).unwrap();

        let entries = engine.database().principal_history(MAPPER, None).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].action, LedgerAction::StateChange);
        assert_eq!(
            engine.database().principal_history(MAPPER, Some(1)).unwrap().len(),
            1
        );
    }
}
