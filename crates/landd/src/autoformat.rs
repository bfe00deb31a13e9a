//! Autoformat engine.
//!
//! Runs the formatter commands configured in the working copy once the whole
//! stack is applied and folds their changes into history: a single-revision
//! stack is amended in place, a longer stack gets one trailing commit.

use crate::command::{CommandRunner, RunnerError};
use crate::scm::{Scm, ScmError};
use land_core::config::ConfigError;
use land_core::patch::{format_bugs, parse_bugs};
use land_core::FormatConfig;
use std::collections::{BTreeMap, BTreeSet};
use thiserror::Error;
use tracing::{debug, info};

/// Marker telling blame tools to skip a changeset.
pub const IGNORE_MARKER: &str = "# ignore-this-changeset";

#[derive(Debug, Error)]
pub enum AutoformatError {
    #[error("invalid formatter configuration: {0}")]
    Config(#[from] ConfigError),
    #[error("formatter `{command}` exited with code {exit_code}: {output}")]
    CommandFailed {
        command: String,
        exit_code: i32,
        output: String,
    },
    #[error("formatter could not run: {0}")]
    Runner(#[from] RunnerError),
    #[error(transparent)]
    Scm(#[from] ScmError),
}

pub type Result<T> = std::result::Result<T, AutoformatError>;

/// What formatting did to history.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FormatOutcome {
    /// True when the tip was amended, false when a trailing commit was added.
    pub amended: bool,
    /// Pre-format commit id -> post-format commit id.
    pub replacements: BTreeMap<String, String>,
    /// Tip after formatting.
    pub commit_id: String,
}

/// Message of the trailing formatting commit for a stack.
pub fn trailing_commit_message<S: AsRef<str>>(descriptions: &[S]) -> String {
    let bugs: BTreeSet<u64> = descriptions
        .iter()
        .flat_map(|d| parse_bugs(d.as_ref()))
        .collect();
    let bugs: Vec<u64> = bugs.into_iter().collect();
    format!("{}: apply code formatting\n\n{IGNORE_MARKER}", format_bugs(&bugs))
}

#[derive(Debug, Clone)]
pub struct Autoformatter {
    /// Formatter config path relative to the working-copy root.
    config_file: String,
}

impl Autoformatter {
    pub fn new(config_file: impl Into<String>) -> Self {
        Self {
            config_file: config_file.into(),
        }
    }

    /// Format the working copy after a stack landed on top of `base_commit`.
    ///
    /// `descriptions` holds one entry per applied revision. Returns `None`
    /// when no formatter is configured or it changed nothing.
    pub fn run(
        &self,
        scm: &dyn Scm,
        runner: &dyn CommandRunner,
        base_commit: &str,
        descriptions: &[String],
    ) -> Result<Option<FormatOutcome>> {
        let config_path = scm.path().join(&self.config_file);
        let Some(config) = FormatConfig::load(&config_path)? else {
            debug!(path = %config_path.display(), "no formatter configured");
            return Ok(None);
        };
        if !config.is_active() {
            debug!(path = %config_path.display(), "formatter disabled");
            return Ok(None);
        }

        let paths = scm.changed_paths(base_commit)?;
        for command in &config.commands {
            let output = scm.format(runner, command, base_commit, &paths)?;
            if !output.success() {
                return Err(AutoformatError::CommandFailed {
                    command: command.clone(),
                    exit_code: output.exit_code,
                    output: output.combined().trim().to_string(),
                });
            }
        }

        if !scm.has_changes()? {
            debug!("formatters made no changes");
            return Ok(None);
        }

        let before = scm.tip_commit_id()?;
        let amended = descriptions.len() == 1;
        let after = if amended {
            scm.amend_commit(None)?
        } else {
            scm.commit_all(&trailing_commit_message(descriptions))?
        };
        info!(before = %before, after = %after, amended = amended, "applied formatting");

        Ok(Some(FormatOutcome {
            amended,
            replacements: BTreeMap::from([(before, after.clone())]),
            commit_id: after,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::ShellRunner;
    use crate::scm::GitScm;
    use std::path::{Path, PathBuf};
    use std::process::Command;
    use tempfile::TempDir;

    fn git(dir: &Path, args: &[&str]) -> String {
        let output = Command::new("git")
            .args(["-c", "user.name=Test", "-c", "user.email=test@example.com"])
            .args(args)
            .current_dir(dir)
            .output()
            .unwrap();
        assert!(output.status.success(), "git {args:?} failed");
        String::from_utf8_lossy(&output.stdout).trim().to_string()
    }

    /// Working copy with one base commit. Returns the scm and base id.
    fn setup(dir: &Path, config: Option<&str>) -> (GitScm, String) {
        git(dir, &["init"]);
        std::fs::write(dir.join("a.txt"), "base\n").unwrap();
        if let Some(config) = config {
            std::fs::write(dir.join(".landd.toml"), config).unwrap();
        }
        git(dir, &["add", "-A"]);
        git(dir, &["commit", "-m", "base"]);
        let base = git(dir, &["rev-parse", "HEAD"]);
        let scm = GitScm::new(
            dir.to_path_buf(),
            PathBuf::from("git"),
            "main".to_string(),
            "landd".to_string(),
            "landd@example.com".to_string(),
        );
        (scm, base)
    }

    const UPPERCASE: &str = "[autoformat]\ncommands = [\"for f in $LANDD_CHANGED_PATHS; do tr a-z A-Z < $f > $f.tmp && mv $f.tmp $f; done\"]\n";

    #[test]
    fn trailing_message_lists_bugs_and_marker() {
        let message = trailing_commit_message(&["Bug 3 - x", "bug 1: y", "Bug 3 again"]);
        assert_eq!(
            message,
            "Bug 1, Bug 3: apply code formatting\n\n# ignore-this-changeset"
        );
        assert!(trailing_commit_message::<&str>(&[]).starts_with("No bug: "));
    }

    #[test]
    fn missing_config_is_not_an_error() {
        let dir = TempDir::new().unwrap();
        let (scm, base) = setup(dir.path(), None);
        let result = Autoformatter::new(".landd.toml")
            .run(&scm, &ShellRunner::default(), &base, &["x".to_string()])
            .unwrap();
        assert_eq!(result, None);
    }

    #[test]
    fn disabled_config_is_skipped() {
        let dir = TempDir::new().unwrap();
        let (scm, base) = setup(dir.path(), Some("[autoformat]\nenabled = false\ncommands = [\"exit 1\"]\n"));
        let result = Autoformatter::new(".landd.toml")
            .run(&scm, &ShellRunner::default(), &base, &["x".to_string()])
            .unwrap();
        assert_eq!(result, None);
    }

    #[test]
    fn single_revision_is_amended() {
        let dir = TempDir::new().unwrap();
        let (scm, base) = setup(dir.path(), Some(UPPERCASE));
        std::fs::write(dir.path().join("b.txt"), "new content\n").unwrap();
        let applied = scm.commit_all("Bug 7 - add b").unwrap();

        let outcome = Autoformatter::new(".landd.toml")
            .run(&scm, &ShellRunner::default(), &base, &["Bug 7 - add b".to_string()])
            .unwrap()
            .unwrap();

        assert!(outcome.amended);
        assert_eq!(outcome.replacements.get(&applied), Some(&outcome.commit_id));
        assert_eq!(std::fs::read_to_string(dir.path().join("b.txt")).unwrap(), "NEW CONTENT\n");
        assert_eq!(std::fs::read_to_string(dir.path().join("a.txt")).unwrap(), "base\n");
        assert_eq!(git(dir.path(), &["log", "-1", "--format=%B"]), "Bug 7 - add b");
        assert_eq!(git(dir.path(), &["rev-list", "--count", "HEAD"]), "2");
    }

    #[test]
    fn stack_gets_one_trailing_commit() {
        let dir = TempDir::new().unwrap();
        let (scm, base) = setup(dir.path(), Some(UPPERCASE));
        std::fs::write(dir.path().join("b.txt"), "first\n").unwrap();
        scm.commit_all("Bug 1 - first").unwrap();
        std::fs::write(dir.path().join("c.txt"), "second\n").unwrap();
        let tip = scm.commit_all("Bug 2 - second").unwrap();

        let descriptions = vec!["Bug 1 - first".to_string(), "Bug 2 - second".to_string()];
        let outcome = Autoformatter::new(".landd.toml")
            .run(&scm, &ShellRunner::default(), &base, &descriptions)
            .unwrap()
            .unwrap();

        assert!(!outcome.amended);
        assert_eq!(outcome.replacements.get(&tip), Some(&outcome.commit_id));
        assert_eq!(git(dir.path(), &["rev-list", "--count", "HEAD"]), "4");
        assert_eq!(
            git(dir.path(), &["log", "-1", "--format=%B"]),
            "Bug 1, Bug 2: apply code formatting\n\n# ignore-this-changeset"
        );
        assert_eq!(std::fs::read_to_string(dir.path().join("c.txt")).unwrap(), "SECOND\n");
    }

    #[test]
    fn no_changes_leaves_history_alone() {
        let dir = TempDir::new().unwrap();
        let (scm, base) = setup(dir.path(), Some("[autoformat]\ncommands = [\"true\"]\n"));
        std::fs::write(dir.path().join("b.txt"), "x\n").unwrap();
        scm.commit_all("change").unwrap();

        let result = Autoformatter::new(".landd.toml")
            .run(&scm, &ShellRunner::default(), &base, &["change".to_string()])
            .unwrap();
        assert_eq!(result, None);
    }

    #[test]
    fn failing_formatter_is_reported() {
        let dir = TempDir::new().unwrap();
        let (scm, base) = setup(dir.path(), Some("[autoformat]\ncommands = [\"echo bad syntax >&2; exit 2\"]\n"));

        let err = Autoformatter::new(".landd.toml")
            .run(&scm, &ShellRunner::default(), &base, &["x".to_string()])
            .unwrap_err();
        match err {
            AutoformatError::CommandFailed { exit_code, output, .. } => {
                assert_eq!(exit_code, 2);
                assert_eq!(output, "bad syntax");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }
}
