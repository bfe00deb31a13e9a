//! SQLite storage module for the landing worker.
//!
//! Persists jobs, revisions, the ordered job/revision link table and the
//! audit log. Claiming is a conditional update gated on the current status,
//! so concurrent workers sharing one database never hold the same job.

use chrono::{DateTime, Utc};
use land_core::events::{
    EventPayload, JobCancelledPayload, JobClaimedPayload, JobSubmittedPayload,
    RevisionsReorderedPayload,
};
use land_core::{ErrorBreakdown, Event, Id, JobStatus, LandingJob, PatchData, Revision};
use sqlx::{sqlite::SqlitePoolOptions, Pool, Sqlite};
use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use thiserror::Error;
use tracing::{debug, info};

/// Explicit column list for landing_jobs queries.
const JOB_COLUMNS: &str = "id, status, target_repo, requester_email, priority, attempts, \
    error, error_breakdown_json, landed_commit_id, formatted_replacements_json, \
    created_at, updated_at";

/// Statuses a worker may claim, as SQL.
const CLAIMABLE: &str = "('SUBMITTED', 'DEFERRED')";

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("job not found: {0}")]
    JobNotFound(String),
    #[error("job {id} is {status} and cannot be {action}")]
    InvalidTransition {
        id: String,
        status: String,
        action: &'static str,
    },
    #[error("invalid revision order: {0}")]
    InvalidOrder(String),
    #[error("corrupt row: {0}")]
    Corrupt(String),
}

pub type Result<T> = std::result::Result<T, StorageError>;

/// Storage backend for the worker and the admin CLI.
#[derive(Debug)]
pub struct Storage {
    pool: Pool<Sqlite>,
}

impl Storage {
    /// Create a new storage instance with the given database path.
    pub async fn new(db_path: &Path) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent).ok();
        }

        let db_url = format!("sqlite://{}?mode=rwc", db_path.display());
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(&db_url)
            .await?;

        sqlx::query("PRAGMA journal_mode = WAL")
            .execute(&pool)
            .await?;

        Ok(Self { pool })
    }

    /// Run embedded migrations.
    pub async fn migrate_embedded(&self) -> Result<()> {
        let migrations = [include_str!("../../../migrations/0001_init.sql")];

        for migration_sql in migrations {
            // Remove comment lines before splitting.
            let cleaned: String = migration_sql
                .lines()
                .filter(|line| !line.trim().starts_with("--"))
                .collect::<Vec<_>>()
                .join("\n");

            for statement in cleaned.split(';') {
                let trimmed = statement.trim();
                if trimmed.is_empty() {
                    continue;
                }
                if let Err(e) = sqlx::query(trimmed).execute(&self.pool).await {
                    let msg = e.to_string();
                    // Ignore expected idempotent errors (duplicate column, table exists).
                    if !msg.contains("duplicate column") && !msg.contains("already exists") {
                        return Err(e.into());
                    }
                }
            }
        }
        Ok(())
    }

    // --- Job operations ---

    /// Insert a job together with its revisions, preserving stack order.
    ///
    /// A revision whose external `revision_id` already exists is updated in
    /// place and reused while every job holding it is still unclaimed and it
    /// has no commit. Otherwise a new row is stored, so landed history is
    /// never rewritten. `job.revisions[i].id` is set to the stored id.
    pub async fn insert_job(&self, job: &mut LandingJob) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO landing_jobs (id, status, target_repo, requester_email, priority, attempts,
                                      error, error_breakdown_json, landed_commit_id,
                                      formatted_replacements_json, created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
            "#,
        )
        .bind(job.id.as_ref())
        .bind(job.status.as_str())
        .bind(&job.target_repo)
        .bind(&job.requester_email)
        .bind(job.priority)
        .bind(i64::from(job.attempts))
        .bind(&job.error)
        .bind(breakdown_json(job.error_breakdown.as_ref())?)
        .bind(&job.landed_commit_id)
        .bind(serde_json::to_string(&job.formatted_replacements)?)
        .bind(job.created_at.timestamp_millis())
        .bind(job.updated_at.timestamp_millis())
        .execute(&mut *tx)
        .await?;

        for (idx, revision) in job.revisions.iter_mut().enumerate() {
            let patch_data = revision
                .patch_data
                .as_ref()
                .map(serde_json::to_string)
                .transpose()?;

            let existing: Option<String> = match revision.revision_id {
                Some(external) => {
                    let query = format!(
                        "SELECT r.id FROM revisions r \
                         WHERE r.revision_id = ?1 AND r.commit_id IS NULL \
                         AND NOT EXISTS (SELECT 1 FROM job_revisions jr \
                                         JOIN landing_jobs j ON j.id = jr.job_id \
                                         WHERE jr.revision_id = r.id \
                                         AND j.status NOT IN {CLAIMABLE}) \
                         ORDER BY r.created_at DESC LIMIT 1"
                    );
                    sqlx::query_scalar(&query)
                        .bind(external)
                        .fetch_optional(&mut *tx)
                        .await?
                }
                None => None,
            };

            match existing {
                Some(id) => {
                    sqlx::query(
                        "UPDATE revisions SET diff_id = ?1, patch = ?2, patch_data_json = ?3, \
                         commit_id = NULL, updated_at = ?4 WHERE id = ?5",
                    )
                    .bind(revision.diff_id)
                    .bind(&revision.patch)
                    .bind(&patch_data)
                    .bind(revision.updated_at.timestamp_millis())
                    .bind(&id)
                    .execute(&mut *tx)
                    .await?;
                    revision.id = Id::from_string(id);
                }
                None => {
                    sqlx::query(
                        r#"
                        INSERT INTO revisions (id, revision_id, diff_id, patch, patch_data_json,
                                               commit_id, created_at, updated_at)
                        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                        "#,
                    )
                    .bind(revision.id.as_ref())
                    .bind(revision.revision_id)
                    .bind(revision.diff_id)
                    .bind(&revision.patch)
                    .bind(&patch_data)
                    .bind(&revision.commit_id)
                    .bind(revision.created_at.timestamp_millis())
                    .bind(revision.updated_at.timestamp_millis())
                    .execute(&mut *tx)
                    .await?;
                }
            }

            sqlx::query(
                "INSERT INTO job_revisions (job_id, idx, revision_id, diff_id) VALUES (?1, ?2, ?3, ?4)",
            )
            .bind(job.id.as_ref())
            .bind(idx as i64)
            .bind(revision.id.as_ref())
            .bind(revision.diff_id)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;

        self.append_event(
            &job.id,
            &EventPayload::JobSubmitted(JobSubmittedPayload {
                job_id: job.id.clone(),
                target_repo: job.target_repo.clone(),
                requester_email: job.requester_email.clone(),
                revision_count: job.revisions.len(),
            }),
        )
        .await?;

        Ok(())
    }

    /// Get a job with its revisions in stack order.
    pub async fn get_job(&self, id: &Id) -> Result<LandingJob> {
        let query = format!("SELECT {JOB_COLUMNS} FROM landing_jobs WHERE id = ?1");
        let row = sqlx::query_as::<_, JobRow>(&query)
            .bind(id.as_ref())
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| StorageError::JobNotFound(id.to_string()))?;

        let revisions = self.list_job_revisions(id).await?;
        row.into_job(revisions)
    }

    /// List jobs, newest first, optionally filtered by status.
    pub async fn list_jobs(&self, status: Option<JobStatus>) -> Result<Vec<LandingJob>> {
        let rows = match status {
            Some(status) => {
                let query = format!(
                    "SELECT {JOB_COLUMNS} FROM landing_jobs WHERE status = ?1 \
                     ORDER BY created_at DESC, id DESC"
                );
                sqlx::query_as::<_, JobRow>(&query)
                    .bind(status.as_str())
                    .fetch_all(&self.pool)
                    .await?
            }
            None => {
                let query = format!(
                    "SELECT {JOB_COLUMNS} FROM landing_jobs ORDER BY created_at DESC, id DESC"
                );
                sqlx::query_as::<_, JobRow>(&query)
                    .fetch_all(&self.pool)
                    .await?
            }
        };

        let mut jobs = Vec::with_capacity(rows.len());
        for row in rows {
            let revisions = self.list_job_revisions(&Id::from_string(row.id.clone())).await?;
            jobs.push(row.into_job(revisions)?);
        }
        Ok(jobs)
    }

    /// Revisions attached to a job, ordered by their stack index.
    pub async fn list_job_revisions(&self, job_id: &Id) -> Result<Vec<Revision>> {
        let rows = sqlx::query_as::<_, RevisionRow>(
            r#"
            SELECT r.id, r.revision_id, COALESCE(jr.diff_id, r.diff_id) AS diff_id, r.patch,
                   r.patch_data_json, r.commit_id, r.created_at, r.updated_at
            FROM job_revisions jr
            JOIN revisions r ON r.id = jr.revision_id
            WHERE jr.job_id = ?1
            ORDER BY jr.idx ASC
            "#,
        )
        .bind(job_id.as_ref())
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(RevisionRow::into_revision).collect()
    }

    /// Atomically claim the next eligible job for one of `repos`.
    ///
    /// Eligible jobs are SUBMITTED or DEFERRED, target one of `repos`, and
    /// target a repository with no other IN_PROGRESS job. Highest priority
    /// wins, then the oldest. Increments `attempts`.
    pub async fn claim_next_job(&self, worker: &str, repos: &[String]) -> Result<Option<LandingJob>> {
        if repos.is_empty() {
            return Ok(None);
        }

        let placeholders = vec!["?"; repos.len()].join(", ");
        let candidates_sql = format!(
            "SELECT id FROM landing_jobs j \
             WHERE j.status IN {CLAIMABLE} AND j.target_repo IN ({placeholders}) \
             AND NOT EXISTS (SELECT 1 FROM landing_jobs o \
                             WHERE o.target_repo = j.target_repo AND o.status = 'IN_PROGRESS') \
             ORDER BY j.priority DESC, j.created_at ASC, j.id ASC"
        );
        let mut query = sqlx::query_scalar::<_, String>(&candidates_sql);
        for repo in repos {
            query = query.bind(repo);
        }
        let candidates = query.fetch_all(&self.pool).await?;

        let claim_sql = format!(
            "UPDATE landing_jobs SET status = 'IN_PROGRESS', attempts = attempts + 1, \
             claimed_by = ?1, updated_at = ?2 \
             WHERE id = ?3 AND status IN {CLAIMABLE} \
             AND NOT EXISTS (SELECT 1 FROM landing_jobs o \
                             WHERE o.target_repo = landing_jobs.target_repo \
                             AND o.status = 'IN_PROGRESS')"
        );

        for candidate in candidates {
            let result = sqlx::query(&claim_sql)
                .bind(worker)
                .bind(Utc::now().timestamp_millis())
                .bind(&candidate)
                .execute(&self.pool)
                .await?;

            if result.rows_affected() != 1 {
                // Another worker got there first.
                debug!(job_id = %candidate, "claim lost, trying next candidate");
                continue;
            }

            let job = self.get_job(&Id::from_string(candidate)).await?;
            self.append_event(
                &job.id,
                &EventPayload::JobClaimed(JobClaimedPayload {
                    job_id: job.id.clone(),
                    worker: worker.to_string(),
                    attempt: job.attempts,
                }),
            )
            .await?;
            return Ok(Some(job));
        }

        Ok(None)
    }

    /// Write the mutable job fields back.
    pub async fn update_job(&self, job: &LandingJob) -> Result<()> {
        let result = sqlx::query(
            "UPDATE landing_jobs SET status = ?1, attempts = ?2, error = ?3, \
             error_breakdown_json = ?4, landed_commit_id = ?5, \
             formatted_replacements_json = ?6, priority = ?7, updated_at = ?8 WHERE id = ?9",
        )
        .bind(job.status.as_str())
        .bind(i64::from(job.attempts))
        .bind(&job.error)
        .bind(breakdown_json(job.error_breakdown.as_ref())?)
        .bind(&job.landed_commit_id)
        .bind(serde_json::to_string(&job.formatted_replacements)?)
        .bind(job.priority)
        .bind(Utc::now().timestamp_millis())
        .bind(job.id.as_ref())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StorageError::JobNotFound(job.id.to_string()));
        }
        Ok(())
    }

    /// Record the commit created for a revision.
    pub async fn update_revision_commit_id(&self, revision: &Id, commit_id: &str) -> Result<()> {
        sqlx::query("UPDATE revisions SET commit_id = ?1, updated_at = ?2 WHERE id = ?3")
            .bind(commit_id)
            .bind(Utc::now().timestamp_millis())
            .bind(revision.as_ref())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Mark a job FAILED if it is still IN_PROGRESS.
    ///
    /// Returns false when the job had already left IN_PROGRESS.
    pub async fn fail_in_progress_job(&self, id: &Id, error: &str) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE landing_jobs SET status = 'FAILED', error = ?1, error_breakdown_json = NULL, \
             updated_at = ?2 WHERE id = ?3 AND status = 'IN_PROGRESS'",
        )
        .bind(error)
        .bind(Utc::now().timestamp_millis())
        .bind(id.as_ref())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    /// Cancel a job that has not been claimed.
    pub async fn cancel_job(&self, id: &Id) -> Result<LandingJob> {
        let job = self.get_job(id).await?;
        let query = format!(
            "UPDATE landing_jobs SET status = 'CANCELLED', updated_at = ?1 \
             WHERE id = ?2 AND status IN {CLAIMABLE}"
        );
        let result = sqlx::query(&query)
            .bind(Utc::now().timestamp_millis())
            .bind(id.as_ref())
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            let current = self.get_job(id).await?;
            return Err(StorageError::InvalidTransition {
                id: id.to_string(),
                status: current.status.as_str().to_string(),
                action: "cancelled",
            });
        }

        self.append_event(
            id,
            &EventPayload::JobCancelled(JobCancelledPayload {
                job_id: id.clone(),
                previous_status: job.status.as_str().to_string(),
            }),
        )
        .await?;
        info!(job_id = %id, "job cancelled");
        self.get_job(id).await
    }

    /// Replace the stack order of an unclaimed job.
    ///
    /// `order` must be a permutation of the job's current revision ids.
    pub async fn reorder_job_revisions(&self, job_id: &Id, order: &[Id]) -> Result<LandingJob> {
        let job = self.get_job(job_id).await?;
        if !job.status.is_claimable() {
            return Err(StorageError::InvalidTransition {
                id: job_id.to_string(),
                status: job.status.as_str().to_string(),
                action: "reordered",
            });
        }

        let previous: Vec<Id> = job.revisions.iter().map(|r| r.id.clone()).collect();
        let current: HashSet<&Id> = previous.iter().collect();
        let requested: HashSet<&Id> = order.iter().collect();
        if order.len() != previous.len() || requested.len() != order.len() || current != requested
        {
            return Err(StorageError::InvalidOrder(format!(
                "expected a permutation of {} revision(s)",
                previous.len()
            )));
        }

        let diff_ids: BTreeMap<&Id, Option<i64>> =
            job.revisions.iter().map(|r| (&r.id, r.diff_id)).collect();

        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM job_revisions WHERE job_id = ?1")
            .bind(job_id.as_ref())
            .execute(&mut *tx)
            .await?;
        for (idx, revision) in order.iter().enumerate() {
            sqlx::query(
                "INSERT INTO job_revisions (job_id, idx, revision_id, diff_id) VALUES (?1, ?2, ?3, ?4)",
            )
            .bind(job_id.as_ref())
            .bind(idx as i64)
            .bind(revision.as_ref())
            .bind(diff_ids.get(revision).copied().flatten())
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;

        self.append_event(
            job_id,
            &EventPayload::RevisionsReordered(RevisionsReorderedPayload {
                previous,
                order: order.to_vec(),
            }),
        )
        .await?;
        info!(job_id = %job_id, "revisions reordered");
        self.get_job(job_id).await
    }

    /// Move IN_PROGRESS jobs for `repos` back to DEFERRED.
    ///
    /// Used at start-up after a crash left jobs claimed by this worker.
    pub async fn requeue_interrupted_jobs(&self, repos: &[String]) -> Result<Vec<Id>> {
        let mut requeued = Vec::new();
        for repo in repos {
            let ids: Vec<String> = sqlx::query_scalar(
                "UPDATE landing_jobs SET status = 'DEFERRED', error = NULL, updated_at = ?1 \
                 WHERE target_repo = ?2 AND status = 'IN_PROGRESS' RETURNING id",
            )
            .bind(Utc::now().timestamp_millis())
            .bind(repo)
            .fetch_all(&self.pool)
            .await?;
            requeued.extend(ids.into_iter().map(Id::from_string));
        }
        Ok(requeued)
    }

    // --- Event operations ---

    /// Append an event to the audit log.
    pub async fn append_event(&self, job_id: &Id, payload: &EventPayload) -> Result<Event> {
        let id = Id::new();
        let now = Utc::now();
        let event_type = payload.event_type().as_str().to_string();
        let payload_json = payload.to_json()?;

        sqlx::query(
            "INSERT INTO events (id, job_id, type, ts, payload_json) VALUES (?1, ?2, ?3, ?4, ?5)",
        )
        .bind(id.as_ref())
        .bind(job_id.as_ref())
        .bind(&event_type)
        .bind(now.timestamp_millis())
        .bind(&payload_json)
        .execute(&self.pool)
        .await?;

        Ok(Event {
            id,
            job_id: job_id.clone(),
            event_type,
            timestamp: now,
            payload_json,
        })
    }

    /// List events for a job in insertion order.
    pub async fn list_events(&self, job_id: &Id) -> Result<Vec<Event>> {
        let rows = sqlx::query_as::<_, EventRow>(
            "SELECT id, job_id, type, ts, payload_json FROM events WHERE job_id = ?1 \
             ORDER BY ts ASC, rowid ASC",
        )
        .bind(job_id.as_ref())
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(EventRow::into_event).collect())
    }
}

fn breakdown_json(breakdown: Option<&ErrorBreakdown>) -> Result<Option<String>> {
    Ok(breakdown.map(serde_json::to_string).transpose()?)
}

// --- Row types for SQLx ---

#[derive(sqlx::FromRow)]
struct JobRow {
    id: String,
    status: String,
    target_repo: String,
    requester_email: String,
    priority: i32,
    attempts: i64,
    error: Option<String>,
    error_breakdown_json: Option<String>,
    landed_commit_id: Option<String>,
    formatted_replacements_json: Option<String>,
    created_at: i64,
    updated_at: i64,
}

impl JobRow {
    fn into_job(self, revisions: Vec<Revision>) -> Result<LandingJob> {
        let status = JobStatus::parse(&self.status).ok_or_else(|| {
            StorageError::Corrupt(format!("job {} has unknown status '{}'", self.id, self.status))
        })?;
        let error_breakdown: Option<ErrorBreakdown> = self
            .error_breakdown_json
            .as_deref()
            .map(serde_json::from_str)
            .transpose()?;
        let formatted_replacements: BTreeMap<String, String> = self
            .formatted_replacements_json
            .as_deref()
            .map(serde_json::from_str)
            .transpose()?
            .unwrap_or_default();

        Ok(LandingJob {
            id: Id::from_string(self.id),
            status,
            revisions,
            target_repo: self.target_repo,
            requester_email: self.requester_email,
            priority: self.priority,
            attempts: self.attempts as u32,
            error: self.error,
            error_breakdown,
            landed_commit_id: self.landed_commit_id,
            formatted_replacements,
            created_at: DateTime::from_timestamp_millis(self.created_at).unwrap_or_default(),
            updated_at: DateTime::from_timestamp_millis(self.updated_at).unwrap_or_default(),
        })
    }
}

#[derive(sqlx::FromRow)]
struct RevisionRow {
    id: String,
    revision_id: Option<i64>,
    diff_id: Option<i64>,
    patch: String,
    patch_data_json: Option<String>,
    commit_id: Option<String>,
    created_at: i64,
    updated_at: i64,
}

impl RevisionRow {
    fn into_revision(self) -> Result<Revision> {
        let patch_data = self
            .patch_data_json
            .as_deref()
            .map(serde_json::from_str::<PatchData>)
            .transpose()?;
        Ok(Revision {
            id: Id::from_string(self.id),
            revision_id: self.revision_id,
            diff_id: self.diff_id,
            patch: self.patch,
            patch_data,
            commit_id: self.commit_id,
            created_at: DateTime::from_timestamp_millis(self.created_at).unwrap_or_default(),
            updated_at: DateTime::from_timestamp_millis(self.updated_at).unwrap_or_default(),
        })
    }
}

#[derive(sqlx::FromRow)]
struct EventRow {
    id: String,
    job_id: String,
    #[sqlx(rename = "type")]
    event_type: String,
    ts: i64,
    payload_json: String,
}

impl EventRow {
    fn into_event(self) -> Event {
        Event {
            id: Id::from_string(self.id),
            job_id: Id::from_string(self.job_id),
            event_type: self.event_type,
            timestamp: DateTime::from_timestamp_millis(self.ts).unwrap_or_default(),
            payload_json: self.payload_json,
        }
    }
}
