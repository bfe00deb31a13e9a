//! SCM adapter: the capability surface the landing worker needs from a
//! version-control backend.

mod git;

pub use git::GitScm;

use crate::command::{CommandOutput, CommandRunner, RunnerError};
use land_core::{Repo, ScmKind};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Environment variable holding the pre-landing tip handed to formatters.
pub const ENV_BASE_COMMIT: &str = "LANDD_BASE_COMMIT";
/// Environment variable holding newline-separated changed paths.
pub const ENV_CHANGED_PATHS: &str = "LANDD_CHANGED_PATHS";

#[derive(Debug, Error)]
pub enum ScmError {
    /// One or more hunks did not apply. `diagnostics` is the tool output.
    #[error("patch failed to apply")]
    PatchConflict { diagnostics: String },
    /// The remote advanced after the last update.
    #[error("push lost a race with another push: {0}")]
    LostPushRace(String),
    #[error("push failed: {0}")]
    PushFailed(String),
    #[error("scm command failed: {0}")]
    CommandFailed(String),
    #[error("failed to execute scm: {0}")]
    Execution(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, ScmError>;

/// Operations on one repository working copy.
pub trait Scm: Send + Sync {
    /// Working-copy root.
    fn path(&self) -> &Path;

    /// Create the working copy from `pull_url` when it does not exist yet.
    fn prepare_repo(&self, pull_url: &str) -> Result<()>;

    /// Bring the working copy to the latest pull-source state and return the tip.
    fn update_repo(&self, pull_url: &str) -> Result<String>;

    /// Apply one patch as a new commit and return its id.
    ///
    /// `date` is `<unix-seconds> <offset-seconds-west>`.
    fn apply_patch(&self, diff: &str, description: &str, author: &str, date: &str) -> Result<String>;

    /// True when the working copy has uncommitted changes.
    fn has_changes(&self) -> Result<bool>;

    /// Fold working-copy changes into the tip commit, optionally replacing
    /// its description. Returns the new tip.
    fn amend_commit(&self, description: Option<&str>) -> Result<String>;

    /// Commit every working-copy change as a new commit. Returns the new tip.
    fn commit_all(&self, description: &str) -> Result<String>;

    /// Push local history. An empty `push_target` means the default branch.
    ///
    /// `expected_base` is the tip returned by the last `update_repo`. A forced
    /// push to the branch that tip came from only replaces the remote branch
    /// while it still points there; otherwise it is a lost race.
    fn push(&self, destination: &str, push_target: &str, force: bool, expected_base: &str) -> Result<()>;

    fn tip_commit_id(&self) -> Result<String>;

    /// Paths touched between `since` and the tip, including uncommitted ones.
    fn changed_paths(&self, since: &str) -> Result<Vec<String>>;

    /// Run a read-only backend command and return its stdout.
    fn query(&self, args: &[&str]) -> Result<String>;

    /// Discard every uncommitted change and untracked file.
    fn clean_repo(&self) -> Result<()>;

    /// Content of a reject file written by a failed apply, if present.
    fn read_reject(&self, path: &str) -> Option<String> {
        std::fs::read_to_string(self.path().join(path)).ok()
    }

    /// Run one formatter command against the working copy.
    fn format(
        &self,
        runner: &dyn CommandRunner,
        command: &str,
        base_commit: &str,
        paths: &[String],
    ) -> std::result::Result<CommandOutput, RunnerError> {
        let env = vec![
            (ENV_BASE_COMMIT.to_string(), base_commit.to_string()),
            (ENV_CHANGED_PATHS.to_string(), paths.join("\n")),
        ];
        runner.run(command, self.path(), &env)
    }
}

/// Opens an [`Scm`] for a configured repository.
pub trait ScmFactory: Send + Sync {
    fn open(&self, repo: &Repo) -> Box<dyn Scm>;
}

/// Factory for git working copies.
#[derive(Debug, Clone)]
pub struct GitScmFactory {
    pub git_bin: PathBuf,
    pub committer_name: String,
    pub committer_email: String,
}

impl GitScmFactory {
    pub fn from_config(config: &land_core::WorkerConfig) -> Self {
        Self {
            git_bin: config.git_bin.clone(),
            committer_name: config.committer_name.clone(),
            committer_email: config.committer_email.clone(),
        }
    }
}

impl ScmFactory for GitScmFactory {
    fn open(&self, repo: &Repo) -> Box<dyn Scm> {
        match repo.scm_kind {
            ScmKind::Git => Box::new(GitScm::new(
                repo.system_path.clone(),
                self.git_bin.clone(),
                repo.default_branch.clone(),
                self.committer_name.clone(),
                self.committer_email.clone(),
            )),
        }
    }
}
