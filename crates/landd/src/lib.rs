//! landd - landing worker daemon
//!
//! Claims landing jobs, applies their patch stacks to a working copy,
//! optionally formats the result and pushes it.

pub mod autoformat;
pub mod command;
pub mod notify;
pub mod scm;
pub mod storage;
pub mod worker;

use std::sync::Arc;
use std::time::Duration;

use land_core::{Id, Repo, WorkerConfig};
use storage::Storage;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use worker::{Collaborators, JobOutcome, LandingWorker};

/// Pause after a storage error before polling again.
const ERROR_BACKOFF: Duration = Duration::from_secs(1);

/// Daemon state.
#[derive(Debug)]
pub struct Daemon {
    config: WorkerConfig,
    storage: Arc<Storage>,
    worker: LandingWorker,
    shutdown: CancellationToken,
}

impl Daemon {
    /// Open the database at `config.db_path` and build the worker.
    pub async fn new(
        config: WorkerConfig,
        repos: Vec<Repo>,
        collaborators: Collaborators,
    ) -> storage::Result<Self> {
        let storage = Storage::new(&config.db_path).await?;
        storage.migrate_embedded().await?;
        Ok(Self::with_storage(config, repos, Arc::new(storage), collaborators))
    }

    /// Build a daemon around an already migrated storage.
    pub fn with_storage(
        config: WorkerConfig,
        repos: Vec<Repo>,
        storage: Arc<Storage>,
        collaborators: Collaborators,
    ) -> Self {
        let worker = LandingWorker::new(config.clone(), repos, Arc::clone(&storage), collaborators);
        Self {
            config,
            storage,
            worker,
            shutdown: CancellationToken::new(),
        }
    }

    pub fn storage(&self) -> &Arc<Storage> {
        &self.storage
    }

    pub fn worker(&self) -> &LandingWorker {
        &self.worker
    }

    /// Token cancelled by [`Daemon::shutdown`].
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Run the polling loop until shutdown.
    ///
    /// Shutdown is only observed between jobs; a job in flight always
    /// reaches its final state first.
    pub async fn run(&self) -> worker::Result<()> {
        let repos = self.worker.bound_repos();
        info!(worker = %self.config.worker_name, repos = ?repos, "landd starting");
        info!("database: {}", self.config.db_path.display());
        if repos.is_empty() {
            warn!("no repositories bound, the worker will never claim a job");
        }

        if self.config.requeue_interrupted {
            match self.storage.requeue_interrupted_jobs(&repos).await {
                Ok(requeued) if !requeued.is_empty() => {
                    info!("requeued {} interrupted job(s)", requeued.len());
                    for id in &requeued {
                        info!("  - {}", id);
                    }
                }
                Ok(_) => {}
                Err(e) => warn!("failed to requeue interrupted jobs: {}", e),
            }
        }

        loop {
            if self.shutdown.is_cancelled() {
                info!("shutdown signal received, exiting");
                break;
            }

            if self.config.paused {
                debug!("worker paused");
                self.sleep(Duration::from_secs(self.config.sleep_seconds)).await;
                continue;
            }

            match self.worker.run_next().await {
                Ok(Some((id, outcome))) => {
                    debug!(job_id = %id, outcome = ?outcome, "job processed");
                    self.sleep(Duration::from_secs(self.config.throttle_seconds)).await;
                }
                Ok(None) => {
                    self.sleep(Duration::from_secs(self.config.sleep_seconds)).await;
                }
                Err(e) => {
                    error!("worker error: {}", e);
                    self.sleep(ERROR_BACKOFF).await;
                }
            }
        }

        Ok(())
    }

    /// Process at most one job.
    pub async fn run_once(&self) -> worker::Result<Option<(Id, JobOutcome)>> {
        if self.config.paused {
            info!("worker paused, not claiming");
            return Ok(None);
        }
        self.worker.run_next().await
    }

    /// Signal the daemon to shut down.
    pub fn shutdown(&self) {
        info!("shutdown requested");
        self.shutdown.cancel();
    }

    /// Sleep for `duration` unless shutdown arrives first.
    async fn sleep(&self, duration: Duration) {
        tokio::select! {
            () = self.shutdown.cancelled() => {}
            () = tokio::time::sleep(duration) => {}
        }
    }
}
