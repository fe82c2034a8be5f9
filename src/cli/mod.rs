//! CLI command definitions for tasking
//!
//! This module defines the CLI structure using clap's derive macros.
//! The main entry point is the `Cli` struct which contains subcommands.

use crate::types::{
    BulkTransition, LockPurpose, MappingIssueInput, PrincipalId, ProjectId, ReleaseOutcome,
    TaskId, TaskStatus,
};
use clap::{Args, Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

/// Tasking engine and administration CLI
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true)]
    pub config: Option<String>,

    /// Path to database file (overrides config)
    #[arg(short, long, global = true)]
    pub database: Option<String>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Logging output: 0/off, 1/stdout, 2/stderr (default), or filename
    #[arg(short, long, default_value = "2", global = true)]
    pub log: String,

    #[command(subcommand)]
    pub command: Option<Command>,
}

/// Available subcommands
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the auto-unlock sweeper until interrupted (default if no subcommand given)
    Serve,

    /// Run one sweeper pass and print the report
    Sweep(SweepArgs),

    /// Create a project and generate its task grid
    CreateProject(CreateProjectArgs),

    /// Show a task's status and lock
    State(TaskArgs),

    /// Show a task's ledger
    History(TaskArgs),

    /// Lock a task for mapping or validation
    Lock(LockArgs),

    /// Release a held lock with a result
    Release(ReleaseArgs),

    /// Undo the principal's last action on a task
    Undo(PrincipalTaskArgs),

    /// Split a task into children
    Split(PrincipalTaskArgs),

    /// Add a comment to a task's history
    Comment(CommentArgs),

    /// Apply an administrative transition to a whole project
    Bulk(BulkArgs),
}

/// Arguments for the sweep subcommand
#[derive(Args, Debug)]
pub struct SweepArgs {
    /// Reclaim locks older than this many seconds (overrides the configured TTL)
    #[arg(long)]
    pub older_than: Option<u64>,
}

/// Arguments for the create-project subcommand
#[derive(Args, Debug)]
pub struct CreateProjectArgs {
    /// GeoJSON file holding the area of interest (Polygon, MultiPolygon or Feature)
    #[arg(long, value_name = "FILE")]
    pub aoi: PathBuf,

    /// Zoom level of the initial grid
    #[arg(long, default_value_t = 12)]
    pub zoom: i32,

    /// Deepest zoom tasks may be split to
    #[arg(long)]
    pub max_zoom: Option<i32>,

    /// Create one free-form task instead of a tile grid
    #[arg(long)]
    pub arbitrary: bool,
}

impl CreateProjectArgs {
    /// Max zoom, defaulting to two levels below the grid.
    pub fn max_zoom(&self) -> i32 {
        self.max_zoom.unwrap_or(self.zoom + 2)
    }
}

/// A task address
#[derive(Args, Debug)]
pub struct TaskArgs {
    pub project: ProjectId,
    pub task: TaskId,
}

/// A task address and the acting principal
#[derive(Args, Debug)]
pub struct PrincipalTaskArgs {
    pub project: ProjectId,
    pub task: TaskId,

    /// Acting principal id
    #[arg(long)]
    pub principal: PrincipalId,
}

/// Arguments for the lock subcommand
#[derive(Args, Debug)]
pub struct LockArgs {
    pub project: ProjectId,
    pub task: TaskId,

    #[arg(long)]
    pub principal: PrincipalId,

    #[arg(long, value_enum, default_value_t = PurposeArg::Mapping)]
    pub purpose: PurposeArg,
}

/// Arguments for the release subcommand
#[derive(Args, Debug)]
pub struct ReleaseArgs {
    pub project: ProjectId,
    pub task: TaskId,

    #[arg(long)]
    pub principal: PrincipalId,

    #[arg(long, value_enum)]
    pub outcome: OutcomeArg,

    /// Comment recorded before the result
    #[arg(long)]
    pub comment: Option<String>,

    /// Mapping issue as CATEGORY:COUNT:TEXT (validation results only, repeatable)
    #[arg(long = "issue", value_parser = parse_issue)]
    pub issues: Vec<MappingIssueInput>,
}

/// Arguments for the comment subcommand
#[derive(Args, Debug)]
pub struct CommentArgs {
    pub project: ProjectId,
    pub task: TaskId,

    #[arg(long)]
    pub principal: PrincipalId,

    /// Comment text
    pub text: String,
}

/// Arguments for the bulk subcommand
#[derive(Args, Debug)]
pub struct BulkArgs {
    pub project: ProjectId,

    #[arg(value_enum)]
    pub transition: BulkArg,

    #[arg(long)]
    pub principal: PrincipalId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum PurposeArg {
    Mapping,
    Validation,
}

impl From<PurposeArg> for LockPurpose {
    fn from(arg: PurposeArg) -> Self {
        match arg {
            PurposeArg::Mapping => LockPurpose::Mapping,
            PurposeArg::Validation => LockPurpose::Validation,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutcomeArg {
    Mapped,
    Badimagery,
    Validated,
    Invalidated,
    /// Give the task back in its previous status
    Abandon,
}

impl From<OutcomeArg> for ReleaseOutcome {
    fn from(arg: OutcomeArg) -> Self {
        match arg {
            OutcomeArg::Mapped => ReleaseOutcome::Submit(TaskStatus::Mapped),
            OutcomeArg::Badimagery => ReleaseOutcome::Submit(TaskStatus::BadImagery),
            OutcomeArg::Validated => ReleaseOutcome::Submit(TaskStatus::Validated),
            OutcomeArg::Invalidated => ReleaseOutcome::Submit(TaskStatus::Invalidated),
            OutcomeArg::Abandon => ReleaseOutcome::Abandon,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum BulkArg {
    MapAll,
    ValidateAll,
    InvalidateAll,
    ResetAll,
    ResetBadImagery,
}

impl From<BulkArg> for BulkTransition {
    fn from(arg: BulkArg) -> Self {
        match arg {
            BulkArg::MapAll => BulkTransition::MapAll,
            BulkArg::ValidateAll => BulkTransition::ValidateAll,
            BulkArg::InvalidateAll => BulkTransition::InvalidateAll,
            BulkArg::ResetAll => BulkTransition::ResetAll,
            BulkArg::ResetBadImagery => BulkTransition::ResetBadImagery,
        }
    }
}

fn parse_issue(s: &str) -> Result<MappingIssueInput, String> {
    let mut parts = s.splitn(3, ':');
    let (Some(category), Some(count), Some(text)) = (parts.next(), parts.next(), parts.next())
    else {
        return Err(format!("expected CATEGORY:COUNT:TEXT, got '{}'", s));
    };
    Ok(MappingIssueInput {
        category_id: category
            .parse()
            .map_err(|_| format!("invalid category id '{}'", category))?,
        count: count
            .parse()
            .map_err(|_| format!("invalid count '{}'", count))?,
        issue: text.to_string(),
    })
}
