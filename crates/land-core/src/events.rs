//! Event types for the job audit log.

use crate::types::Id;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Event type names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventType {
    JobSubmitted,
    JobClaimed,
    RevisionApplied,
    AutoformatApplied,
    JobLanded,
    JobFailed,
    JobDeferred,
    JobCancelled,
    RevisionsReordered,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::JobSubmitted => "JOB_SUBMITTED",
            Self::JobClaimed => "JOB_CLAIMED",
            Self::RevisionApplied => "REVISION_APPLIED",
            Self::AutoformatApplied => "AUTOFORMAT_APPLIED",
            Self::JobLanded => "JOB_LANDED",
            Self::JobFailed => "JOB_FAILED",
            Self::JobDeferred => "JOB_DEFERRED",
            Self::JobCancelled => "JOB_CANCELLED",
            Self::RevisionsReordered => "REVISIONS_REORDERED",
        }
    }
}

/// Payload for JOB_SUBMITTED event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobSubmittedPayload {
    pub job_id: Id,
    pub target_repo: String,
    pub requester_email: String,
    pub revision_count: usize,
}

/// Payload for JOB_CLAIMED event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobClaimedPayload {
    pub job_id: Id,
    pub worker: String,
    pub attempt: u32,
}

/// Payload for REVISION_APPLIED event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RevisionAppliedPayload {
    pub revision_id: Id,
    /// Position in the stack (0-indexed).
    pub index: usize,
    pub commit_id: String,
}

/// Payload for AUTOFORMAT_APPLIED event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AutoformatAppliedPayload {
    /// True when the tip commit was amended, false for a trailing commit.
    pub amended: bool,
    pub replacements: BTreeMap<String, String>,
}

/// Payload for JOB_LANDED event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobLandedPayload {
    pub job_id: Id,
    pub landed_commit_id: String,
}

/// Payload for JOB_FAILED event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobFailedPayload {
    pub job_id: Id,
    /// Failure category (e.g. `apply_conflict`, `autoformat_failure`).
    pub kind: String,
    pub reason: String,
}

/// Payload for JOB_DEFERRED event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobDeferredPayload {
    pub job_id: Id,
    pub attempt: u32,
    pub reason: String,
}

/// Payload for JOB_CANCELLED event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobCancelledPayload {
    pub job_id: Id,
    pub previous_status: String,
}

/// Payload for REVISIONS_REORDERED event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RevisionsReorderedPayload {
    pub previous: Vec<Id>,
    pub order: Vec<Id>,
}

/// Union type for all event payloads.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EventPayload {
    JobSubmitted(JobSubmittedPayload),
    JobClaimed(JobClaimedPayload),
    RevisionApplied(RevisionAppliedPayload),
    AutoformatApplied(AutoformatAppliedPayload),
    JobLanded(JobLandedPayload),
    JobFailed(JobFailedPayload),
    JobDeferred(JobDeferredPayload),
    JobCancelled(JobCancelledPayload),
    RevisionsReordered(RevisionsReorderedPayload),
}

impl EventPayload {
    pub fn event_type(&self) -> EventType {
        match self {
            Self::JobSubmitted(_) => EventType::JobSubmitted,
            Self::JobClaimed(_) => EventType::JobClaimed,
            Self::RevisionApplied(_) => EventType::RevisionApplied,
            Self::AutoformatApplied(_) => EventType::AutoformatApplied,
            Self::JobLanded(_) => EventType::JobLanded,
            Self::JobFailed(_) => EventType::JobFailed,
            Self::JobDeferred(_) => EventType::JobDeferred,
            Self::JobCancelled(_) => EventType::JobCancelled,
            Self::RevisionsReordered(_) => EventType::RevisionsReordered,
        }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_type_serializes_correctly() {
        assert_eq!(
            serde_json::to_string(&EventType::JobClaimed).unwrap(),
            "\"JOB_CLAIMED\""
        );
        assert_eq!(
            serde_json::to_string(&EventType::RevisionsReordered).unwrap(),
            "\"REVISIONS_REORDERED\""
        );
    }

    #[test]
    fn payload_reports_matching_event_type() {
        let payload = EventPayload::JobDeferred(JobDeferredPayload {
            job_id: Id::from_string("job-1"),
            attempt: 2,
            reason: "remote moved".to_string(),
        });
        assert_eq!(payload.event_type(), EventType::JobDeferred);
        assert_eq!(payload.event_type().as_str(), "JOB_DEFERRED");
    }

    #[test]
    fn payload_serializes_without_variant_tag() {
        let payload = EventPayload::JobFailed(JobFailedPayload {
            job_id: Id::from_string("job-1"),
            kind: "apply_conflict".to_string(),
            reason: "hunk failed".to_string(),
        });
        let json = payload.to_json().unwrap();
        assert!(json.contains("\"kind\":\"apply_conflict\""));
        assert!(!json.contains("JobFailed"));
    }
}
