//! Core types for the landing worker.
//!
//! Jobs, revisions, repositories and the structured error breakdown that is
//! persisted alongside a failed job.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use uuid::Uuid;

/// Unique identifier for jobs, revisions and events.
/// Uses `UUIDv7` for time-ordered lexicographic sorting.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Id(pub String);

impl Id {
    pub fn new() -> Self {
        Self(Uuid::now_v7().to_string())
    }

    pub fn from_string(s: impl Into<String>) -> Self {
        Self(s.into())
    }
}

impl Default for Id {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for Id {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl AsRef<str> for Id {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

// --- Enumerations ---

/// Landing job lifecycle status.
///
/// `SUBMITTED -> IN_PROGRESS -> {LANDED | FAILED | DEFERRED | CANCELLED}`.
/// `DEFERRED` is eligible for claiming again on a later poll.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Submitted,
    InProgress,
    Deferred,
    Failed,
    Landed,
    Cancelled,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Submitted => "SUBMITTED",
            Self::InProgress => "IN_PROGRESS",
            Self::Deferred => "DEFERRED",
            Self::Failed => "FAILED",
            Self::Landed => "LANDED",
            Self::Cancelled => "CANCELLED",
        }
    }

    /// Parse the stored representation. Accepts lowercase for CLI input.
    pub fn parse(value: &str) -> Option<Self> {
        match value.to_ascii_uppercase().as_str() {
            "SUBMITTED" => Some(Self::Submitted),
            "IN_PROGRESS" => Some(Self::InProgress),
            "DEFERRED" => Some(Self::Deferred),
            "FAILED" => Some(Self::Failed),
            "LANDED" => Some(Self::Landed),
            "CANCELLED" => Some(Self::Cancelled),
            _ => None,
        }
    }

    /// Terminal states are never claimed again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Landed | Self::Failed | Self::Cancelled)
    }

    /// States a worker may move to `IN_PROGRESS`.
    pub fn is_claimable(&self) -> bool {
        matches!(self, Self::Submitted | Self::Deferred)
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Version-control backend for a repository.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScmKind {
    #[default]
    Git,
}

impl ScmKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Git => "git",
        }
    }
}

// --- Core Types ---

/// Metadata used to build a header-carrying patch from a raw diff.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatchData {
    pub author_name: String,
    pub author_email: String,
    /// Unix timestamp (seconds) of the authored change.
    pub timestamp: i64,
    pub commit_message: String,
}

/// One unit of change. Immutable once landed apart from `commit_id`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Revision {
    pub id: Id,
    /// External review identifier (e.g. `D1234` without the prefix).
    pub revision_id: Option<i64>,
    /// External diff identifier at submission time.
    pub diff_id: Option<i64>,
    /// Raw patch text including the header block.
    pub patch: String,
    /// Metadata the patch was built from, when known.
    pub patch_data: Option<PatchData>,
    /// Commit created for this revision once landed.
    pub commit_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Revision {
    pub fn new(patch: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Id::new(),
            revision_id: None,
            diff_id: None,
            patch: patch.into(),
            patch_data: None,
            commit_id: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Short label for logs and error messages.
    pub fn label(&self) -> String {
        match self.revision_id {
            Some(id) => format!("D{id}"),
            None => self.id.to_string(),
        }
    }
}

/// A file that failed to apply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailedPath {
    pub path: String,
}

/// Reject file contents for one failed path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RejectEntry {
    pub path: String,
    pub content: String,
}

/// Machine-readable conflict report persisted with a failed job.
///
/// Keys of `rejects_paths` equal the `path` values of `failed_paths`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBreakdown {
    /// Revision whose patch failed to apply.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revision_id: Option<Id>,
    pub failed_paths: Vec<FailedPath>,
    pub rejects_paths: BTreeMap<String, RejectEntry>,
}

impl ErrorBreakdown {
    pub fn is_empty(&self) -> bool {
        self.failed_paths.is_empty()
    }
}

/// The unit of work: an ordered stack of revisions landed onto one repo.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LandingJob {
    pub id: Id,
    pub status: JobStatus,
    /// Landing order, oldest first. Persisted with an explicit index.
    pub revisions: Vec<Revision>,
    /// Name of the target repository.
    pub target_repo: String,
    pub requester_email: String,
    /// Higher values are claimed first.
    pub priority: i32,
    /// Number of times a worker has claimed this job.
    pub attempts: u32,
    /// Human-readable error for FAILED/DEFERRED jobs.
    pub error: Option<String>,
    pub error_breakdown: Option<ErrorBreakdown>,
    pub landed_commit_id: Option<String>,
    /// Pre-format commit id -> post-format commit id.
    pub formatted_replacements: BTreeMap<String, String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl LandingJob {
    /// Create a new SUBMITTED job.
    pub fn new(
        target_repo: impl Into<String>,
        requester_email: impl Into<String>,
        revisions: Vec<Revision>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Id::new(),
            status: JobStatus::Submitted,
            revisions,
            target_repo: target_repo.into(),
            requester_email: requester_email.into(),
            priority: 0,
            attempts: 0,
            error: None,
            error_breakdown: None,
            landed_commit_id: None,
            formatted_replacements: BTreeMap::new(),
            created_at: now,
            updated_at: now,
        }
    }
}

/// Repository configuration consumed by the worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Repo {
    pub name: String,
    #[serde(default)]
    pub scm_kind: ScmKind,
    pub pull_url: String,
    /// Defaults to `pull_url` when unset.
    #[serde(default)]
    pub push_url: Option<String>,
    /// Local working-copy path.
    pub system_path: PathBuf,
    #[serde(default = "default_branch")]
    pub default_branch: String,
    #[serde(default)]
    pub required_permission: String,
    /// Branch or bookmark to push to; empty means `default_branch`.
    #[serde(default)]
    pub push_target: String,
    #[serde(default)]
    pub force_push: bool,
    #[serde(default)]
    pub autoformat_enabled: bool,
    #[serde(default)]
    pub approval_required: bool,
}

fn default_branch() -> String {
    "main".to_string()
}

impl Repo {
    pub fn push_destination(&self) -> &str {
        self.push_url.as_deref().unwrap_or(&self.pull_url)
    }

    /// Branch the landed history ends up on.
    pub fn target_branch(&self) -> &str {
        if self.push_target.is_empty() {
            &self.default_branch
        } else {
            &self.push_target
        }
    }
}

/// An event in the job audit log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub id: Id,
    pub job_id: Id,
    /// Event type name (e.g., `JOB_CLAIMED`, `JOB_LANDED`).
    pub event_type: String,
    pub timestamp: DateTime<Utc>,
    /// JSON payload with event-specific data.
    pub payload_json: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn id_generates_unique_values() {
        let id1 = Id::new();
        let id2 = Id::new();
        assert_ne!(id1, id2);
    }

    #[test]
    fn job_status_serializes_correctly() {
        assert_eq!(
            serde_json::to_string(&JobStatus::InProgress).unwrap(),
            "\"IN_PROGRESS\""
        );
        assert_eq!(
            serde_json::to_string(&JobStatus::Cancelled).unwrap(),
            "\"CANCELLED\""
        );
    }

    #[test]
    fn job_status_parse_matches_as_str() {
        for status in [
            JobStatus::Submitted,
            JobStatus::InProgress,
            JobStatus::Deferred,
            JobStatus::Failed,
            JobStatus::Landed,
            JobStatus::Cancelled,
        ] {
            assert_eq!(JobStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(JobStatus::parse("landed"), Some(JobStatus::Landed));
        assert_eq!(JobStatus::parse("bogus"), None);
    }

    #[test]
    fn terminal_and_claimable_are_disjoint() {
        assert!(JobStatus::Landed.is_terminal());
        assert!(JobStatus::Failed.is_terminal());
        assert!(JobStatus::Cancelled.is_terminal());
        assert!(!JobStatus::Deferred.is_terminal());
        assert!(JobStatus::Submitted.is_claimable());
        assert!(JobStatus::Deferred.is_claimable());
        assert!(!JobStatus::InProgress.is_claimable());
        assert!(!JobStatus::Landed.is_claimable());
    }

    #[test]
    fn error_breakdown_serializes_expected_shape() {
        let mut breakdown = ErrorBreakdown {
            revision_id: None,
            failed_paths: vec![FailedPath {
                path: "a.txt".to_string(),
            }],
            rejects_paths: BTreeMap::new(),
        };
        breakdown.rejects_paths.insert(
            "a.txt".to_string(),
            RejectEntry {
                path: "a.txt.rej".to_string(),
                content: "@@ -1 +1 @@".to_string(),
            },
        );
        let value = serde_json::to_value(&breakdown).unwrap();
        assert_eq!(value["failed_paths"][0]["path"], "a.txt");
        assert_eq!(value["rejects_paths"]["a.txt"]["path"], "a.txt.rej");
        assert!(value.get("revision_id").is_none());
    }

    #[test]
    fn repo_defaults_push_destination_and_target() {
        let repo = Repo {
            name: "firefox".to_string(),
            scm_kind: ScmKind::Git,
            pull_url: "https://example.test/firefox".to_string(),
            push_url: None,
            system_path: PathBuf::from("/srv/firefox"),
            default_branch: "main".to_string(),
            required_permission: String::new(),
            push_target: String::new(),
            force_push: false,
            autoformat_enabled: false,
            approval_required: false,
        };
        assert_eq!(repo.push_destination(), "https://example.test/firefox");
        assert_eq!(repo.target_branch(), "main");

        let repo = Repo {
            push_url: Some("ssh://example.test/firefox".to_string()),
            push_target: "autoland".to_string(),
            ..repo
        };
        assert_eq!(repo.push_destination(), "ssh://example.test/firefox");
        assert_eq!(repo.target_branch(), "autoland");
    }

    #[test]
    fn revision_label_prefers_review_id() {
        let mut revision = Revision::new("patch");
        assert_eq!(revision.label(), revision.id.to_string());
        revision.revision_id = Some(42);
        assert_eq!(revision.label(), "D42");
    }
}
