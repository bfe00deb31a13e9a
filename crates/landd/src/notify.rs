//! Collaborators the worker reports to: tree status, the review system and
//! the requester notifier.
//!
//! The defaults only log; deployments substitute their own implementations.

use land_core::{LandingJob, Repo};
use std::collections::HashSet;
use thiserror::Error;
use tracing::{info, warn};

#[derive(Debug, Error)]
#[error("{0}")]
pub struct NotifyError(pub String);

/// Whether a repository's tree currently accepts landings.
pub trait TreeStatus: Send + Sync {
    fn is_open(&self, repo: &Repo) -> Result<bool, NotifyError>;
}

/// Review-system hook run once per landed job.
pub trait ReviewSystem: Send + Sync {
    fn trigger_repo_update(&self, repo: &Repo) -> Result<(), NotifyError>;
}

/// Delivers failure notices to the requester.
pub trait Notifier: Send + Sync {
    fn notify_user_of_landing_failure(&self, job: &LandingJob) -> Result<(), NotifyError>;
}

/// Trees listed in the worker configuration are closed, every other is open.
#[derive(Debug, Clone, Default)]
pub struct ClosedTrees {
    closed: HashSet<String>,
}

impl ClosedTrees {
    pub fn new<I, S>(closed: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            closed: closed.into_iter().map(Into::into).collect(),
        }
    }
}

impl TreeStatus for ClosedTrees {
    fn is_open(&self, repo: &Repo) -> Result<bool, NotifyError> {
        Ok(!self.closed.contains(&repo.name))
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct LogReviewSystem;

impl ReviewSystem for LogReviewSystem {
    fn trigger_repo_update(&self, repo: &Repo) -> Result<(), NotifyError> {
        info!(repo = %repo.name, "repository updated");
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn notify_user_of_landing_failure(&self, job: &LandingJob) -> Result<(), NotifyError> {
        warn!(
            job_id = %job.id,
            requester = %job.requester_email,
            error = job.error.as_deref().unwrap_or(""),
            "landing failed"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use land_core::ScmKind;
    use std::path::PathBuf;

    fn repo(name: &str) -> Repo {
        Repo {
            name: name.to_string(),
            scm_kind: ScmKind::Git,
            pull_url: "file:///tmp/x".to_string(),
            push_url: None,
            system_path: PathBuf::from("/tmp/x"),
            default_branch: "main".to_string(),
            required_permission: String::new(),
            push_target: String::new(),
            force_push: false,
            autoformat_enabled: false,
            approval_required: false,
        }
    }

    #[test]
    fn closed_trees_reject_listed_repos() {
        let trees = ClosedTrees::new(["central"]);
        assert!(!trees.is_open(&repo("central")).unwrap());
        assert!(trees.is_open(&repo("try")).unwrap());
        assert!(ClosedTrees::default().is_open(&repo("central")).unwrap());
    }
}
