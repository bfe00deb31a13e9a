//! Landing worker: drives one claimed job to LANDED, FAILED or DEFERRED.
//!
//! The landing pipeline itself is synchronous (every step is a blocking
//! subprocess call) and runs on the blocking pool. It returns a
//! [`LandingError`] from the failure taxonomy; `process_job` turns the result
//! into job state, audit events and collaborator calls.

use crate::autoformat::{AutoformatError, Autoformatter, FormatOutcome};
use crate::command::{CommandRunner, ShellRunner};
use crate::notify::{ClosedTrees, LogNotifier, LogReviewSystem, Notifier, ReviewSystem, TreeStatus};
use crate::scm::{GitScmFactory, Scm, ScmError, ScmFactory};
use crate::storage::{Storage, StorageError};
use land_core::events::{
    AutoformatAppliedPayload, EventPayload, JobDeferredPayload, JobFailedPayload, JobLandedPayload,
    RevisionAppliedPayload,
};
use land_core::{
    extract_error_data, ErrorBreakdown, FailedPath, Id, JobStatus, LandingJob, PatchHelper,
    RejectEntry, Repo, Revision, WorkerConfig,
};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, error, info, warn};

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
}

pub type Result<T> = std::result::Result<T, WorkerError>;

/// Why a landing attempt did not land.
#[derive(Debug, Clone, Error)]
pub enum LandingError {
    #[error("{0}")]
    MalformedPatch(String),
    #[error("{message}")]
    ApplyConflict {
        message: String,
        breakdown: ErrorBreakdown,
    },
    #[error("{0}")]
    AutoformatFailure(String),
    #[error("{0}")]
    LostPushRace(String),
    #[error("{0}")]
    PushRejected(String),
    #[error("{0}")]
    PreconditionFailure(String),
    #[error("{0}")]
    UnexpectedFault(String),
}

impl LandingError {
    /// Stable name recorded in JOB_FAILED events.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::MalformedPatch(_) => "malformed_patch",
            Self::ApplyConflict { .. } => "apply_conflict",
            Self::AutoformatFailure(_) => "autoformat_failure",
            Self::LostPushRace(_) => "lost_push_race",
            Self::PushRejected(_) => "push_rejected",
            Self::PreconditionFailure(_) => "precondition_failure",
            Self::UnexpectedFault(_) => "unexpected_fault",
        }
    }
}

/// Final disposition of one processed job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobOutcome {
    Landed,
    Failed,
    Deferred,
}

/// External collaborators, replaceable in tests.
#[derive(Clone)]
pub struct Collaborators {
    pub scm_factory: Arc<dyn ScmFactory>,
    pub runner: Arc<dyn CommandRunner>,
    pub tree_status: Arc<dyn TreeStatus>,
    pub review: Arc<dyn ReviewSystem>,
    pub notifier: Arc<dyn Notifier>,
}

impl std::fmt::Debug for Collaborators {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Collaborators").finish_non_exhaustive()
    }
}

impl Collaborators {
    /// Git, `sh -c` formatters, closed trees from config, log-only reporting.
    pub fn from_config(config: &WorkerConfig) -> Self {
        Self {
            scm_factory: Arc::new(GitScmFactory::from_config(config)),
            runner: Arc::new(ShellRunner::new(config.formatter_timeout_sec)),
            tree_status: Arc::new(ClosedTrees::new(config.closed_trees.iter().cloned())),
            review: Arc::new(LogReviewSystem),
            notifier: Arc::new(LogNotifier),
        }
    }
}

/// Result of a successful landing pipeline run.
#[derive(Debug)]
struct Landed {
    tip: String,
    /// Commit created for each revision, in stack order.
    commits: Vec<(Id, String)>,
    format: Option<FormatOutcome>,
}

/// A revision's patch split into the pieces the SCM needs.
#[derive(Debug)]
struct ParsedPatch<'a> {
    revision: &'a Revision,
    diff: &'a str,
    description: String,
    author: String,
    date: String,
}

fn parse_patches(revisions: &[Revision]) -> std::result::Result<Vec<ParsedPatch<'_>>, LandingError> {
    revisions
        .iter()
        .map(|revision| {
            let malformed = |e: land_core::patch::PatchError| {
                LandingError::MalformedPatch(format!("Revision {}: {e}", revision.label()))
            };
            let helper = PatchHelper::parse(&revision.patch).map_err(malformed)?;
            Ok(ParsedPatch {
                revision,
                diff: helper.diff(),
                description: helper.description().to_string(),
                author: helper.author().map_err(malformed)?.to_string(),
                date: helper.date().map_err(malformed)?.to_string(),
            })
        })
        .collect()
}

/// Build the structured report for a failed apply.
fn conflict_breakdown(scm: &dyn Scm, revision: &Revision, diagnostics: &str) -> ErrorBreakdown {
    let (failed, rejects) = extract_error_data(diagnostics);
    let mut breakdown = ErrorBreakdown {
        revision_id: Some(revision.id.clone()),
        ..ErrorBreakdown::default()
    };
    for (path, reject) in failed.into_iter().zip(rejects) {
        // No reject file when the path itself was refused; keep the tool's words.
        let content = scm
            .read_reject(&reject)
            .unwrap_or_else(|| diagnostics_for(diagnostics, &path));
        breakdown.failed_paths.push(FailedPath { path: path.clone() });
        breakdown
            .rejects_paths
            .insert(path, RejectEntry { path: reject, content });
    }
    breakdown
}

/// Diagnostic lines mentioning `path`.
fn diagnostics_for(diagnostics: &str, path: &str) -> String {
    diagnostics
        .lines()
        .map(str::trim)
        .filter(|line| line.contains(path))
        .collect::<Vec<_>>()
        .join("\n")
}

fn unexpected(e: &ScmError) -> LandingError {
    LandingError::UnexpectedFault(e.to_string())
}

/// The synchronous part of a landing: everything between claim and record.
#[derive(Debug, Clone)]
struct Pipeline {
    collaborators: Collaborators,
    autoformatter: Autoformatter,
}

/// Processes claimed jobs for a set of repositories.
#[derive(Debug)]
pub struct LandingWorker {
    config: WorkerConfig,
    repos: HashMap<String, Repo>,
    storage: Arc<Storage>,
    pipeline: Pipeline,
}

impl LandingWorker {
    pub fn new(
        config: WorkerConfig,
        repos: Vec<Repo>,
        storage: Arc<Storage>,
        collaborators: Collaborators,
    ) -> Self {
        let autoformatter = Autoformatter::new(config.autoformat_config_file.clone());
        Self {
            repos: repos.into_iter().map(|r| (r.name.clone(), r)).collect(),
            config,
            storage,
            pipeline: Pipeline {
                collaborators,
                autoformatter,
            },
        }
    }

    /// Names of the repositories this worker claims jobs for.
    pub fn bound_repos(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .repos
            .keys()
            .filter(|name| self.config.is_bound_to(name))
            .cloned()
            .collect();
        names.sort();
        names
    }

    /// Claim and process at most one job. Returns `None` when nothing was eligible.
    pub async fn run_next(&self) -> Result<Option<(Id, JobOutcome)>> {
        let repos = self.bound_repos();
        let Some(job) = self
            .storage
            .claim_next_job(&self.config.worker_name, &repos)
            .await?
        else {
            return Ok(None);
        };
        let id = job.id.clone();
        let outcome = self.process_job(job).await?;
        Ok(Some((id, outcome)))
    }

    /// Run the landing pipeline for a claimed job and record the outcome.
    pub async fn process_job(&self, mut job: LandingJob) -> Result<JobOutcome> {
        info!(
            job_id = %job.id,
            repo = %job.target_repo,
            attempt = job.attempts,
            revisions = job.revisions.len(),
            "processing job"
        );

        let recorded = match self.repos.get(&job.target_repo) {
            Some(repo) => self.land_and_record(&mut job, repo).await,
            None => {
                let err = LandingError::PreconditionFailure(format!(
                    "Repository {} is not configured for this worker.",
                    job.target_repo
                ));
                self.finish_failed(&mut job, err).await
            }
        };

        match recorded {
            Ok(outcome) => Ok(outcome),
            Err(e) => self.fail_unrecorded(&mut job, e).await,
        }
    }

    async fn land_and_record(&self, job: &mut LandingJob, repo: &Repo) -> Result<JobOutcome> {
        let pipeline = self.pipeline.clone();
        let (landing_job, landing_repo) = (job.clone(), repo.clone());
        let result = tokio::task::spawn_blocking(move || {
            pipeline
                .check_tree(&landing_repo)
                .and_then(|()| pipeline.land(&landing_job, &landing_repo))
        })
        .await
        .unwrap_or_else(|e| {
            Err(LandingError::UnexpectedFault(format!(
                "Landing task did not complete: {e}"
            )))
        });

        match result {
            Ok(landed) => self.finish_landed(job, repo, landed).await,
            Err(LandingError::LostPushRace(reason)) if job.attempts < self.config.max_attempts => {
                self.finish_deferred(job, reason).await
            }
            Err(LandingError::LostPushRace(reason)) => {
                let err = LandingError::LostPushRace(format!(
                    "Gave up after {} attempts, the remote kept moving: {reason}",
                    job.attempts
                ));
                self.finish_failed(job, err).await
            }
            Err(err) => self.finish_failed(job, err).await,
        }
    }

    /// Last resort when the outcome could not be written: a claimed job must
    /// not stay IN_PROGRESS, or its repository is never claimed again.
    async fn fail_unrecorded(&self, job: &mut LandingJob, cause: WorkerError) -> Result<JobOutcome> {
        error!(job_id = %job.id, error = %cause, "failed to record job outcome");
        let message = format!("Landing result could not be recorded: {cause}");

        match self.storage.fail_in_progress_job(&job.id, &message).await {
            Ok(true) => {}
            Ok(false) => {
                warn!(job_id = %job.id, "job already left IN_PROGRESS");
                return Err(cause);
            }
            Err(e) => {
                error!(job_id = %job.id, error = %e, "failed to mark job FAILED");
                return Err(cause);
            }
        }

        let err = LandingError::UnexpectedFault(message);
        job.status = JobStatus::Failed;
        job.error = Some(err.to_string());
        job.error_breakdown = None;
        let payload = EventPayload::JobFailed(JobFailedPayload {
            job_id: job.id.clone(),
            kind: err.kind().to_string(),
            reason: err.to_string(),
        });
        if let Err(e) = self.storage.append_event(&job.id, &payload).await {
            warn!(job_id = %job.id, error = %e, "failed to record JOB_FAILED event");
        }
        if let Err(e) = self
            .pipeline
            .collaborators
            .notifier
            .notify_user_of_landing_failure(job)
        {
            warn!(job_id = %job.id, error = %e, "failed to notify requester");
        }
        Ok(JobOutcome::Failed)
    }
}

impl Pipeline {
    fn check_tree(&self, repo: &Repo) -> std::result::Result<(), LandingError> {
        match self.collaborators.tree_status.is_open(repo) {
            Ok(true) => Ok(()),
            Ok(false) => Err(LandingError::PreconditionFailure(format!(
                "Tree {} is closed.",
                repo.name
            ))),
            Err(e) => Err(LandingError::UnexpectedFault(format!(
                "Could not read the tree status of {}: {e}",
                repo.name
            ))),
        }
    }

    /// Apply, format and push the job's stack.
    fn land(&self, job: &LandingJob, repo: &Repo) -> std::result::Result<Landed, LandingError> {
        // Every patch must parse before anything touches the working copy.
        let patches = parse_patches(&job.revisions)?;
        let scm = self.collaborators.scm_factory.open(repo);

        let result = self.land_with(scm.as_ref(), job, repo, &patches);
        if result.is_err() {
            if let Err(e) = scm.clean_repo() {
                warn!(job_id = %job.id, error = %e, "failed to clean working copy");
            }
        }
        result
    }

    fn land_with(
        &self,
        scm: &dyn Scm,
        job: &LandingJob,
        repo: &Repo,
        patches: &[ParsedPatch<'_>],
    ) -> std::result::Result<Landed, LandingError> {
        let base = scm.update_repo(&repo.pull_url).map_err(|e| {
            error!(job_id = %job.id, repo = %repo.name, error = %e, "failed to update working copy");
            unexpected(&e)
        })?;
        debug!(job_id = %job.id, base = %base, "working copy updated");

        let mut commits = Vec::with_capacity(patches.len());
        for patch in patches {
            let revision = patch.revision;
            let commit = scm
                .apply_patch(patch.diff, &patch.description, &patch.author, &patch.date)
                .map_err(|e| match e {
                    ScmError::PatchConflict { diagnostics } => {
                        info!(job_id = %job.id, revision = %revision.label(), "patch failed to apply");
                        debug!(diagnostics = %diagnostics, "apply diagnostics");
                        LandingError::ApplyConflict {
                            message: format!(
                                "Problem while applying patch in revision {}:\n\n{}",
                                revision.label(),
                                diagnostics.trim()
                            ),
                            breakdown: conflict_breakdown(scm, revision, &diagnostics),
                        }
                    }
                    other => {
                        error!(job_id = %job.id, error = %other, "failed to apply patch");
                        unexpected(&other)
                    }
                })?;
            commits.push((revision.id.clone(), commit));
        }

        let format = if repo.autoformat_enabled {
            let descriptions: Vec<String> = patches.iter().map(|p| p.description.clone()).collect();
            self.autoformatter
                .run(scm, self.collaborators.runner.as_ref(), &base, &descriptions)
                .map_err(|e| match e {
                    AutoformatError::Scm(inner) => unexpected(&inner),
                    other => {
                        warn!(job_id = %job.id, error = %other, "autoformat failed");
                        LandingError::AutoformatFailure(format!(
                            "Landing failed to format your patch for conformity with our \
                             formatting policy: {other}"
                        ))
                    }
                })?
        } else {
            None
        };

        scm.push(repo.push_destination(), &repo.push_target, repo.force_push, &base)
            .map_err(|e| match e {
                ScmError::LostPushRace(detail) => LandingError::LostPushRace(detail),
                ScmError::PushFailed(detail) => {
                    LandingError::PushRejected(format!("Push to {} failed: {detail}", repo.name))
                }
                other => unexpected(&other),
            })?;

        let tip = scm.tip_commit_id().map_err(|e| unexpected(&e))?;
        Ok(Landed {
            tip,
            commits,
            format,
        })
    }

}

impl LandingWorker {
    async fn finish_landed(&self, job: &mut LandingJob, repo: &Repo, landed: Landed) -> Result<JobOutcome> {
        // An amended tip replaces the last revision's commit.
        let mut commits = landed.commits;
        if let Some(format) = landed.format.as_ref().filter(|f| f.amended) {
            if let Some((_, commit)) = commits.last_mut() {
                *commit = format.commit_id.clone();
            }
        }

        for (index, (revision_id, commit_id)) in commits.iter().enumerate() {
            self.storage
                .update_revision_commit_id(revision_id, commit_id)
                .await?;
            self.storage
                .append_event(
                    &job.id,
                    &EventPayload::RevisionApplied(RevisionAppliedPayload {
                        revision_id: revision_id.clone(),
                        index,
                        commit_id: commit_id.clone(),
                    }),
                )
                .await?;
            if let Some(revision) = job.revisions.iter_mut().find(|r| &r.id == revision_id) {
                revision.commit_id = Some(commit_id.clone());
            }
        }

        job.formatted_replacements = BTreeMap::new();
        if let Some(format) = landed.format {
            self.storage
                .append_event(
                    &job.id,
                    &EventPayload::AutoformatApplied(AutoformatAppliedPayload {
                        amended: format.amended,
                        replacements: format.replacements.clone(),
                    }),
                )
                .await?;
            job.formatted_replacements = format.replacements;
        }

        job.status = JobStatus::Landed;
        job.error = None;
        job.error_breakdown = None;
        job.landed_commit_id = Some(landed.tip.clone());
        self.storage.update_job(job).await?;
        self.storage
            .append_event(
                &job.id,
                &EventPayload::JobLanded(JobLandedPayload {
                    job_id: job.id.clone(),
                    landed_commit_id: landed.tip.clone(),
                }),
            )
            .await?;
        info!(job_id = %job.id, commit = %landed.tip, "job landed");

        if let Err(e) = self.pipeline.collaborators.review.trigger_repo_update(repo) {
            warn!(job_id = %job.id, repo = %repo.name, error = %e, "failed to notify review system");
        }
        Ok(JobOutcome::Landed)
    }

    async fn finish_deferred(&self, job: &mut LandingJob, reason: String) -> Result<JobOutcome> {
        // A lost race is not an error; the reason lives in the event only.
        job.status = JobStatus::Deferred;
        job.error = None;
        job.error_breakdown = None;
        self.storage.update_job(job).await?;
        self.storage
            .append_event(
                &job.id,
                &EventPayload::JobDeferred(JobDeferredPayload {
                    job_id: job.id.clone(),
                    attempt: job.attempts,
                    reason,
                }),
            )
            .await?;
        info!(job_id = %job.id, attempt = job.attempts, "job deferred");
        Ok(JobOutcome::Deferred)
    }

    async fn finish_failed(&self, job: &mut LandingJob, err: LandingError) -> Result<JobOutcome> {
        let kind = err.kind();
        error!(job_id = %job.id, kind = kind, error = %err, "job failed");

        job.status = JobStatus::Failed;
        job.error = Some(err.to_string());
        job.error_breakdown = match err {
            LandingError::ApplyConflict { breakdown, .. } => Some(breakdown),
            _ => None,
        };
        self.storage.update_job(job).await?;
        self.storage
            .append_event(
                &job.id,
                &EventPayload::JobFailed(JobFailedPayload {
                    job_id: job.id.clone(),
                    kind: kind.to_string(),
                    reason: job.error.clone().unwrap_or_default(),
                }),
            )
            .await?;

        if let Err(e) = self
            .pipeline
            .collaborators
            .notifier
            .notify_user_of_landing_failure(job)
        {
            warn!(job_id = %job.id, error = %e, "failed to notify requester");
        }
        Ok(JobOutcome::Failed)
    }
}
