//! Tasking Core Library
//!
//! The task lifecycle engine for crowd-sourced mapping projects: locking,
//! the status state machine, the append-only history ledger, undo, task
//! splitting, bulk transitions and stale-lock sweeping.

pub mod cli;
pub mod config;
pub mod db;
pub mod engine;
pub mod error;
pub mod geometry;
pub mod permissions;
pub mod state_machine;
pub mod sweeper;
pub mod types;

pub use db::Database;
pub use engine::Engine;
pub use error::{ErrorCode, TaskError, TaskResult};
pub use permissions::{AllowAll, PermissionCheck, PolicyPermissions};
pub use sweeper::Sweeper;
