//! landd - landing worker daemon
//!
//! Runs the worker loop and the local admin commands that share its database.

mod render;

use mimalloc::MiMalloc;

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

use chrono::Utc;
use clap::{Parser, Subcommand};
use eyre::{bail, Result, WrapErr};
use land_core::config::load_repos;
use land_core::patch::build_patch;
use land_core::{Id, JobStatus, LandingJob, PatchData, PatchHelper, Revision, WorkerConfig};
use landd::storage::Storage;
use landd::worker::Collaborators;
use landd::Daemon;
use std::path::{Path, PathBuf};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Parser)]
#[command(name = "landd", about = "Landing worker daemon", version)]
struct Cli {
    /// Worker config file (key=value)
    #[arg(long, global = true, env = "LANDD_CONFIG")]
    config: Option<PathBuf>,

    /// Database path (overrides the config file)
    #[arg(long, global = true, env = "LANDD_DB")]
    db: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the landing worker
    Run {
        /// Process at most one job, then exit
        #[arg(long)]
        once: bool,
    },

    /// Queue a landing job from patch files, in landing order
    Submit {
        /// Target repository name
        #[arg(long)]
        repo: String,

        /// Requester email, notified on failure
        #[arg(long)]
        requester: String,

        /// Higher priorities are claimed first
        #[arg(long, default_value_t = 0)]
        priority: i32,

        /// External revision id per patch, in the same order
        #[arg(long = "revision-id")]
        revision_ids: Vec<i64>,

        /// Inputs are raw diffs; build the patch headers from the flags below
        #[arg(long, requires_all = ["author_name", "author_email", "message"])]
        raw: bool,

        #[arg(long)]
        author_name: Option<String>,

        #[arg(long)]
        author_email: Option<String>,

        /// Commit message for raw diffs
        #[arg(long)]
        message: Option<String>,

        /// Unix timestamp for raw diffs (default: now)
        #[arg(long)]
        timestamp: Option<i64>,

        /// Patch files
        #[arg(required = true)]
        patches: Vec<PathBuf>,
    },

    /// List jobs (optionally filter by status)
    List {
        #[arg(long, value_parser = parse_job_status)]
        status: Option<JobStatus>,
    },

    /// Show a job with its revisions and events
    Show { job_id: String },

    /// Cancel a job that has not been claimed
    Cancel { job_id: String },

    /// Replace the landing order of an unclaimed job
    Reorder {
        job_id: String,

        /// Revision ids in the new order
        #[arg(required = true)]
        revisions: Vec<String>,
    },
}

fn parse_job_status(s: &str) -> std::result::Result<JobStatus, String> {
    JobStatus::parse(s).ok_or_else(|| {
        format!(
            "invalid status '{s}', expected: submitted, in_progress, deferred, failed, landed, cancelled"
        )
    })
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize tracing.
    fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let mut config = load_config(cli.config.as_deref())?;
    if let Some(db) = cli.db {
        config.db_path = db;
    }

    // One job at a time; its subprocess calls run on the blocking pool.
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .wrap_err("failed to create tokio runtime")?;

    runtime.block_on(async {
        match cli.command {
            Command::Run { once } => run_worker(config, once).await,
            Command::Submit {
                repo,
                requester,
                priority,
                revision_ids,
                raw,
                author_name,
                author_email,
                message,
                timestamp,
                patches,
            } => {
                let metadata = if raw {
                    Some(PatchData {
                        author_name: author_name.unwrap_or_default(),
                        author_email: author_email.unwrap_or_default(),
                        timestamp: timestamp.unwrap_or_else(|| Utc::now().timestamp()),
                        commit_message: message.unwrap_or_default(),
                    })
                } else {
                    None
                };
                let mut job = LandingJob::new(repo, requester, Vec::new());
                job.priority = priority;
                submit(&config, job, &revision_ids, metadata.as_ref(), &patches).await
            }
            Command::List { status } => {
                let storage = open_storage(&config).await?;
                let jobs = storage.list_jobs(status).await?;
                render::print_job_list(&jobs);
                Ok(())
            }
            Command::Show { job_id } => {
                let storage = open_storage(&config).await?;
                let id = Id::from_string(job_id);
                let job = storage.get_job(&id).await?;
                let events = storage.list_events(&id).await?;
                render::print_job_details(&job, &events);
                Ok(())
            }
            Command::Cancel { job_id } => {
                let storage = open_storage(&config).await?;
                let job = storage.cancel_job(&Id::from_string(job_id)).await?;
                println!("Job {} cancelled", job.id);
                Ok(())
            }
            Command::Reorder { job_id, revisions } => {
                let storage = open_storage(&config).await?;
                let order: Vec<Id> = revisions.into_iter().map(Id::from_string).collect();
                let job = storage
                    .reorder_job_revisions(&Id::from_string(job_id), &order)
                    .await?;
                render::print_job_details(&job, &[]);
                Ok(())
            }
        }
    })
}

/// Load the worker config, resolving relative paths against its directory.
fn load_config(path: Option<&Path>) -> Result<WorkerConfig> {
    let Some(path) = path else {
        return Ok(WorkerConfig::default());
    };
    let mut config = WorkerConfig::from_file(path)
        .wrap_err_with(|| format!("failed to load config {}", path.display()))?;
    if let Some(base) = path.parent() {
        config.resolve_paths(base);
    }
    Ok(config)
}

async fn open_storage(config: &WorkerConfig) -> Result<Storage> {
    let storage = Storage::new(&config.db_path).await?;
    storage.migrate_embedded().await?;
    Ok(storage)
}

async fn run_worker(config: WorkerConfig, once: bool) -> Result<()> {
    let repos = load_repos(&config.repos_file)
        .wrap_err_with(|| format!("failed to load repositories from {}", config.repos_file.display()))?;
    let collaborators = Collaborators::from_config(&config);
    let daemon = Daemon::new(config, repos, collaborators).await?;

    if once {
        match daemon.run_once().await? {
            Some((id, outcome)) => println!("Job {id}: {outcome:?}"),
            None => println!("No eligible job."),
        }
        return Ok(());
    }

    tokio::spawn(wait_for_signal(daemon.shutdown_token()));
    daemon.run().await?;
    Ok(())
}

/// Cancel `token` on SIGINT or SIGTERM.
async fn wait_for_signal(token: CancellationToken) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate()).expect("failed to register SIGTERM handler");
        let mut sigint = signal(SignalKind::interrupt()).expect("failed to register SIGINT handler");

        tokio::select! {
            _ = sigint.recv() => info!("received SIGINT, initiating graceful shutdown"),
            _ = sigterm.recv() => info!("received SIGTERM, initiating graceful shutdown"),
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
        info!("received SIGINT, initiating graceful shutdown");
    }

    token.cancel();
}

async fn submit(
    config: &WorkerConfig,
    mut job: LandingJob,
    revision_ids: &[i64],
    metadata: Option<&PatchData>,
    patches: &[PathBuf],
) -> Result<()> {
    if !revision_ids.is_empty() && revision_ids.len() != patches.len() {
        bail!(
            "got {} revision ids for {} patches",
            revision_ids.len(),
            patches.len()
        );
    }

    for (index, path) in patches.iter().enumerate() {
        let content = std::fs::read_to_string(path)
            .wrap_err_with(|| format!("failed to read {}", path.display()))?;
        let mut revision = match metadata {
            Some(data) => {
                let mut revision = Revision::new(build_patch(&content, data));
                revision.patch_data = Some(data.clone());
                revision
            }
            None => Revision::new(content),
        };
        revision.revision_id = revision_ids.get(index).copied();
        if let Err(e) = PatchHelper::parse(&revision.patch) {
            warn!(path = %path.display(), error = %e, "patch will fail to land");
        }
        job.revisions.push(revision);
    }

    let storage = open_storage(config).await?;
    storage.insert_job(&mut job).await?;
    render::print_job_created(&job);
    Ok(())
}
