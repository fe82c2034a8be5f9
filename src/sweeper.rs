//! Auto-unlock sweeper.
//!
//! Periodically reclaims locks older than the configured TTL. Each candidate
//! is re-checked at apply time, so a lock released between scan and reclaim
//! is left alone.

use crate::config::SweeperConfig;
use crate::db::now_ms;
use crate::engine::Engine;
use crate::error::TaskResult;
use crate::types::{SweepReport, TaskRef};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Stale-lock reclaimer bound to an engine.
#[derive(Clone)]
pub struct Sweeper {
    engine: Engine,
    config: SweeperConfig,
}

impl Sweeper {
    pub fn new(engine: Engine, config: SweeperConfig) -> Self {
        Self { engine, config }
    }

    /// One pass using the configured TTL.
    pub fn sweep_once(&self) -> TaskResult<SweepReport> {
        let ttl_ms = i64::try_from(self.config.lock_ttl().as_millis()).unwrap_or(i64::MAX);
        self.sweep_older_than(now_ms().saturating_sub(ttl_ms))
    }

    /// One pass reclaiming locks taken before `cutoff` (epoch ms).
    ///
    /// Failures on a single project or task are logged and counted; the pass
    /// continues.
    pub fn sweep_older_than(&self, cutoff: i64) -> TaskResult<SweepReport> {
        let db = self.engine.database();
        let mut report = SweepReport::default();

        for project_id in db.projects_with_locked_tasks()? {
            report.projects_scanned += 1;
            let stale = match db.stale_locks(project_id, cutoff) {
                Ok(stale) => stale,
                Err(err) => {
                    warn!(project_id, error = %err, "Sweeper could not scan project");
                    report.failures += 1;
                    continue;
                }
            };

            for lock in stale {
                match self.engine.reclaim_stale_lock(&lock) {
                    Ok(true) => report.reclaimed.push(TaskRef {
                        project_id: lock.project_id,
                        task_id: lock.task_id,
                    }),
                    Ok(false) => {
                        debug!(
                            project_id,
                            task_id = lock.task_id,
                            "Lock changed before reclaim, skipping"
                        );
                        report.skipped_released += 1;
                    }
                    Err(err) => {
                        warn!(
                            project_id,
                            task_id = lock.task_id,
                            error = %err,
                            "Sweeper failed to reclaim lock"
                        );
                        report.failures += 1;
                    }
                }
            }
        }

        info!(
            projects = report.projects_scanned,
            reclaimed = report.reclaimed.len(),
            skipped = report.skipped_released,
            failures = report.failures,
            "Sweep complete"
        );
        Ok(report)
    }

    /// Run passes on the configured interval until `shutdown` turns true.
    pub fn spawn(self, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(self.config.interval());
            info!(
                interval_seconds = self.config.interval_seconds,
                lock_ttl_seconds = self.config.lock_ttl_seconds,
                "Sweeper started"
            );

            loop {
                tokio::select! {
                    _ = interval.tick() => {}
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                        continue;
                    }
                }

                let sweeper = self.clone();
                match tokio::task::spawn_blocking(move || sweeper.sweep_once()).await {
                    Ok(Ok(_)) => {}
                    Ok(Err(err)) => warn!(error = %err, "Sweep pass failed"),
                    Err(err) => warn!(error = %err, "Sweep task panicked"),
                }
            }

            info!("Sweeper stopped");
        })
    }
}
