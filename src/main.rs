//! Tasking CLI
//!
//! Runs the auto-unlock sweeper and exposes the lifecycle engine operations
//! as subcommands that print JSON.

use anyhow::{Context, Result};
use clap::Parser;
use serde::Serialize;
use serde_json::json;
use std::fs::OpenOptions;
use std::sync::{Arc, Mutex};
use tasking_core::cli::{
    BulkArgs, Cli, Command, CommentArgs, CreateProjectArgs, LockArgs, PrincipalTaskArgs,
    ReleaseArgs, SweepArgs, TaskArgs,
};
use tasking_core::config::{Config, ConfigLoader};
use tasking_core::db::{Database, now_ms};
use tasking_core::engine::Engine;
use tasking_core::error::TaskResult;
use tasking_core::geometry::Geometry;
use tasking_core::permissions::PolicyPermissions;
use tasking_core::sweeper::Sweeper;
use tasking_core::types::{GridMode, ReleaseNotes};
use tokio::sync::watch;
use tracing::{Level, info};
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging based on --log option
    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    match cli.log.as_str() {
        "0" | "off" => {
            // No logging
        }
        "1" | "stdout" => install_subscriber(level, std::io::stdout, true)?,
        "2" | "stderr" => install_subscriber(level, std::io::stderr, true)?,
        filename => {
            // Log to file (append mode)
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(filename)
                .with_context(|| format!("failed to open log file {}", filename))?;
            install_subscriber(level, Mutex::new(file), false)?;
        }
    }

    // An explicit config path is handed to the loader through its env override.
    // SAFETY: set at startup before the runtime spawns any other threads.
    if let Some(config_path) = &cli.config {
        unsafe {
            std::env::set_var("TASKING_CONFIG_PATH", config_path);
        }
    }
    let mut loader = ConfigLoader::load()?;
    for (tier, path) in loader.sources() {
        info!(tier = %tier, path = %path.display(), "Using config file");
    }
    if let Some(db_path) = &cli.database {
        loader.config_mut().server.db_path = db_path.into();
    }
    let config = loader.into_config();
    let engine = open_engine(&config)?;

    match cli.command {
        Some(Command::Serve) | None => run_server(engine, &config).await?,
        Some(Command::Sweep(args)) => run_sweep(engine, &config, args),
        Some(Command::CreateProject(args)) => run_create_project(&engine, args)?,
        Some(Command::State(TaskArgs { project, task })) => {
            emit(engine.current_state(project, task))
        }
        Some(Command::History(TaskArgs { project, task })) => {
            emit(engine.database().task_history(project, task))
        }
        Some(Command::Lock(args)) => run_lock(&engine, args),
        Some(Command::Release(args)) => run_release(&engine, args),
        Some(Command::Undo(PrincipalTaskArgs {
            project,
            task,
            principal,
        })) => emit(engine.undo(project, task, principal)),
        Some(Command::Split(PrincipalTaskArgs {
            project,
            task,
            principal,
        })) => emit(engine.split(project, task, principal)),
        Some(Command::Comment(args)) => run_comment(&engine, args),
        Some(Command::Bulk(args)) => run_bulk(&engine, args),
    }

    Ok(())
}

/// Install a global fmt subscriber. `RUST_LOG`, when set, replaces the level.
fn install_subscriber<W>(level: Level, writer: W, ansi: bool) -> Result<()>
where
    W: for<'a> MakeWriter<'a> + Send + Sync + 'static,
{
    let builder = FmtSubscriber::builder().with_writer(writer).with_ansi(ansi);
    match EnvFilter::try_from_default_env() {
        Ok(filter) => {
            tracing::subscriber::set_global_default(builder.with_env_filter(filter).finish())?
        }
        Err(_) => tracing::subscriber::set_global_default(builder.with_max_level(level).finish())?,
    }
    Ok(())
}

fn open_engine(config: &Config) -> Result<Engine> {
    config.ensure_db_dir()?;
    let db = Database::open(&config.server.db_path)
        .with_context(|| format!("failed to open database {}", config.server.db_path.display()))?
        .with_busy_timeout(config.storage.busy_timeout())?
        .with_conflict_retries(config.storage.conflict_retries);
    info!(path = %config.server.db_path.display(), "Database opened");

    let permissions = Arc::new(PolicyPermissions::new(config.policy.clone()));
    Ok(Engine::new(db, permissions)
        .with_grid(config.grid.clone())
        .with_splitting(config.splitting.clone()))
}

/// Print a result as pretty JSON; expected failures print their error kind
/// and exit non-zero.
fn emit<T: Serialize>(result: TaskResult<T>) {
    let (value, failed) = match result {
        Ok(value) => (serde_json::to_value(value).unwrap_or_default(), false),
        Err(err) => (
            json!({ "error": err.code(), "message": err.to_string() }),
            true,
        ),
    };
    match serde_json::to_string_pretty(&value) {
        Ok(text) => println!("{}", text),
        Err(err) => eprintln!("failed to render output: {}", err),
    }
    if failed {
        std::process::exit(1);
    }
}

async fn run_server(engine: Engine, config: &Config) -> Result<()> {
    if !config.sweeper.enabled {
        info!("Sweeper disabled in config, nothing to serve");
        return Ok(());
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let handle = Sweeper::new(engine, config.sweeper.clone()).spawn(shutdown_rx);

    tokio::signal::ctrl_c().await?;
    info!("Shutdown requested");
    let _ = shutdown_tx.send(true);
    handle.await?;
    Ok(())
}

fn run_sweep(engine: Engine, config: &Config, args: SweepArgs) {
    let sweeper = Sweeper::new(engine, config.sweeper.clone());
    let report = match args.older_than {
        Some(seconds) => {
            let age_ms = i64::try_from(seconds.saturating_mul(1000)).unwrap_or(i64::MAX);
            sweeper.sweep_older_than(now_ms().saturating_sub(age_ms))
        }
        None => sweeper.sweep_once(),
    };
    emit(report);
}

fn run_create_project(engine: &Engine, args: CreateProjectArgs) -> Result<()> {
    let text = std::fs::read_to_string(&args.aoi)
        .with_context(|| format!("failed to read {}", args.aoi.display()))?;
    let result = Geometry::from_geojson(&text).and_then(|aoi| {
        let grid = if args.arbitrary {
            GridMode::Arbitrary
        } else {
            GridMode::Square
        };
        let (project, tasks) = engine.create_project(&aoi, grid, args.zoom, args.max_zoom())?;
        Ok(json!({ "project": project, "task_count": tasks.len() }))
    });
    emit(result);
    Ok(())
}

fn run_lock(engine: &Engine, args: LockArgs) {
    emit(engine.acquire(args.project, args.task, args.principal, args.purpose.into()));
}

fn run_release(engine: &Engine, args: ReleaseArgs) {
    let notes = ReleaseNotes {
        comment: args.comment,
        issues: args.issues,
    };
    emit(engine.release_with(
        args.project,
        args.task,
        args.principal,
        args.outcome.into(),
        &notes,
    ));
}

fn run_comment(engine: &Engine, args: CommentArgs) {
    emit(engine.comment(args.project, args.task, args.principal, &args.text));
}

fn run_bulk(engine: &Engine, args: BulkArgs) {
    emit(engine.bulk_apply(args.project, args.transition.into(), args.principal));
}
