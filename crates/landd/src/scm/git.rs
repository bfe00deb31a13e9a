//! Git implementation of the SCM adapter.
//!
//! Drives the `git` binary. Every invocation runs with `LC_ALL=C` so the
//! diagnostics parsed by the worker are stable, and with the configured
//! committer identity.

use super::{Result, Scm, ScmError};
use land_core::patch::parse_hg_date;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Command, Output, Stdio};
use tracing::{debug, info, warn};

/// Push stderr fragments meaning the remote moved after our fetch.
const RACE_MARKERS: &[&str] = &[
    "(fetch first)",
    "(non-fast-forward)",
    "(stale info)",
    "cannot lock ref",
];

#[derive(Debug, Clone)]
pub struct GitScm {
    path: PathBuf,
    git_bin: PathBuf,
    default_branch: String,
    committer_name: String,
    committer_email: String,
}

impl GitScm {
    pub fn new(
        path: PathBuf,
        git_bin: PathBuf,
        default_branch: String,
        committer_name: String,
        committer_email: String,
    ) -> Self {
        Self {
            path,
            git_bin,
            default_branch,
            committer_name,
            committer_email,
        }
    }

    fn command(&self, cwd: &Path) -> Command {
        let mut cmd = Command::new(&self.git_bin);
        cmd.arg("-c")
            .arg(format!("user.name={}", self.committer_name))
            .arg("-c")
            .arg(format!("user.email={}", self.committer_email))
            .arg("-c")
            .arg("commit.gpgsign=false")
            .env("LC_ALL", "C")
            .current_dir(cwd);
        cmd
    }

    fn output(&self, args: &[&str]) -> Result<Output> {
        debug!(repo = %self.path.display(), args = ?args, "running git");
        Ok(self.command(&self.path).args(args).output()?)
    }

    /// Run git and return trimmed stdout, failing on a non-zero exit.
    fn run(&self, args: &[&str]) -> Result<String> {
        let output = self.output(args)?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(ScmError::CommandFailed(format!(
                "git {}: {}",
                args.join(" "),
                stderr.trim()
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    fn commit(&self, extra: &[&str]) -> Result<String> {
        self.run(&["add", "-A"])?;
        let mut args = vec!["commit", "--no-verify", "--cleanup=verbatim", "--allow-empty-message"];
        args.extend_from_slice(extra);
        self.run(&args)?;
        self.tip_commit_id()
    }
}

/// Convert `<unix-seconds> <offset-seconds-west>` into git's
/// `@<unix-seconds> <+/-HHMM>` date format.
pub(crate) fn to_git_date(date: &str) -> Option<String> {
    let (timestamp, offset_west) = parse_hg_date(date)?;
    let east = -offset_west;
    let sign = if east < 0 { '-' } else { '+' };
    let minutes = east.unsigned_abs() / 60;
    Some(format!("@{timestamp} {sign}{:02}{:02}", minutes / 60, minutes % 60))
}

/// Force flag for a push to `branch`.
///
/// The branch the working copy was updated from is leased against the tip
/// seen then, so a commit pushed by someone else in between is never dropped.
/// Any other target is overwritten as requested.
fn force_flag(force: bool, branch: &str, default_branch: &str, expected_base: &str) -> Option<String> {
    if !force {
        return None;
    }
    if branch == default_branch && !expected_base.is_empty() {
        Some(format!("--force-with-lease=refs/heads/{branch}:{expected_base}"))
    } else {
        Some("--force".to_string())
    }
}

fn is_lost_race(stderr: &str) -> bool {
    RACE_MARKERS.iter().any(|marker| stderr.contains(marker))
}

impl Scm for GitScm {
    fn path(&self) -> &Path {
        &self.path
    }

    fn prepare_repo(&self, pull_url: &str) -> Result<()> {
        if self.path.join(".git").exists() {
            return Ok(());
        }
        let parent = self.path.parent().unwrap_or_else(|| Path::new("."));
        std::fs::create_dir_all(parent)?;

        info!(url = %pull_url, path = %self.path.display(), "cloning working copy");
        let output = self
            .command(parent)
            .arg("clone")
            .arg(pull_url)
            .arg(&self.path)
            .output()?;
        if !output.status.success() {
            return Err(ScmError::CommandFailed(format!(
                "git clone {pull_url}: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(())
    }

    fn update_repo(&self, pull_url: &str) -> Result<String> {
        self.prepare_repo(pull_url)?;
        let refspec = format!("refs/heads/{}", self.default_branch);
        self.run(&["fetch", pull_url, refspec.as_str()])?;
        self.run(&["checkout", "-f", "-B", self.default_branch.as_str(), "FETCH_HEAD"])?;
        self.run(&["clean", "-fd"])?;
        self.tip_commit_id()
    }

    fn apply_patch(&self, diff: &str, description: &str, author: &str, date: &str) -> Result<String> {
        let mut child = self
            .command(&self.path)
            .args(["apply", "--reject", "--verbose", "-"])
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;

        // Write from a thread so a large diff cannot deadlock against full output pipes.
        let writer = child.stdin.take().map(|mut stdin| {
            let body = diff.as_bytes().to_vec();
            std::thread::spawn(move || stdin.write_all(&body))
        });
        let output = child.wait_with_output()?;
        if let Some(handle) = writer {
            if let Ok(Err(e)) = handle.join() {
                debug!(error = %e, "git apply closed stdin early");
            }
        }

        if !output.status.success() {
            let mut diagnostics = String::from_utf8_lossy(&output.stdout).to_string();
            diagnostics.push_str(&String::from_utf8_lossy(&output.stderr));
            return Err(ScmError::PatchConflict { diagnostics });
        }

        let git_date = to_git_date(date).unwrap_or_else(|| date.to_string());
        let author_arg = format!("--author={author}");
        let date_arg = format!("--date={git_date}");
        self.commit(&["-m", description, author_arg.as_str(), date_arg.as_str()])
    }

    fn has_changes(&self) -> Result<bool> {
        Ok(!self.run(&["status", "--porcelain"])?.is_empty())
    }

    fn amend_commit(&self, description: Option<&str>) -> Result<String> {
        match description {
            Some(description) => self.commit(&["--amend", "-m", description]),
            None => self.commit(&["--amend", "--no-edit"]),
        }
    }

    fn commit_all(&self, description: &str) -> Result<String> {
        self.commit(&["-m", description])
    }

    fn push(&self, destination: &str, push_target: &str, force: bool, expected_base: &str) -> Result<()> {
        let branch = if push_target.is_empty() {
            self.default_branch.as_str()
        } else {
            push_target
        };
        let refspec = format!("HEAD:refs/heads/{branch}");
        let force_arg = force_flag(force, branch, &self.default_branch, expected_base);
        let mut args = vec!["push"];
        if let Some(flag) = force_arg.as_deref() {
            args.push(flag);
        }
        args.push(destination);
        args.push(refspec.as_str());

        info!(destination = %destination, target = %branch, force = force, "pushing");
        let output = self.output(&args)?;
        if output.status.success() {
            return Ok(());
        }

        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        if is_lost_race(&stderr) {
            warn!(destination = %destination, "push rejected, remote moved");
            Err(ScmError::LostPushRace(stderr))
        } else {
            Err(ScmError::PushFailed(stderr))
        }
    }

    fn tip_commit_id(&self) -> Result<String> {
        self.run(&["rev-parse", "HEAD"])
    }

    fn changed_paths(&self, since: &str) -> Result<Vec<String>> {
        let tracked = self.run(&["diff", "--name-only", since])?;
        let untracked = self.run(&["ls-files", "--others", "--exclude-standard"])?;
        let mut paths: Vec<String> = tracked
            .lines()
            .chain(untracked.lines())
            .filter(|line| !line.is_empty())
            .map(str::to_string)
            .collect();
        paths.sort();
        paths.dedup();
        Ok(paths)
    }

    fn query(&self, args: &[&str]) -> Result<String> {
        self.run(args)
    }

    fn clean_repo(&self) -> Result<()> {
        self.run(&["reset", "--hard"])?;
        self.run(&["clean", "-fd"])?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const DATE: &str = "1700000000 0";

    fn git(dir: &Path, args: &[&str]) -> String {
        let output = Command::new("git")
            .args(["-c", "user.name=Test", "-c", "user.email=test@example.com"])
            .args(args)
            .env("LC_ALL", "C")
            .current_dir(dir)
            .output()
            .unwrap();
        assert!(
            output.status.success(),
            "git {args:?} failed: {}",
            String::from_utf8_lossy(&output.stderr)
        );
        String::from_utf8_lossy(&output.stdout).trim().to_string()
    }

    /// Bare remote on `main` holding `test.txt` = "TEST\n".
    fn setup_remote(root: &Path) -> PathBuf {
        let remote = root.join("remote.git");
        std::fs::create_dir_all(&remote).unwrap();
        git(&remote, &["init", "--bare"]);
        git(&remote, &["symbolic-ref", "HEAD", "refs/heads/main"]);

        let seed = root.join("seed");
        std::fs::create_dir_all(&seed).unwrap();
        git(&seed, &["init"]);
        git(&seed, &["checkout", "-b", "main"]);
        std::fs::write(seed.join("test.txt"), "TEST\n").unwrap();
        git(&seed, &["add", "test.txt"]);
        git(&seed, &["commit", "-m", "initial commit"]);
        git(&seed, &["push", remote.to_str().unwrap(), "main"]);
        remote
    }

    fn scm_at(path: PathBuf) -> GitScm {
        GitScm::new(
            path,
            PathBuf::from("git"),
            "main".to_string(),
            "landd".to_string(),
            "landd@example.com".to_string(),
        )
    }

    const DIFF: &str = "diff --git a/test.txt b/test.txt
--- a/test.txt
+++ b/test.txt
@@ -1,1 +1,2 @@
 TEST
+adding another line
";

    #[test]
    fn converts_hg_dates() {
        assert_eq!(to_git_date("1700000000 0").as_deref(), Some("@1700000000 +0000"));
        assert_eq!(to_git_date("1700000000 -3600").as_deref(), Some("@1700000000 +0100"));
        assert_eq!(to_git_date("1700000000 19800").as_deref(), Some("@1700000000 -0530"));
        assert_eq!(to_git_date("garbage"), None);
    }

    #[test]
    fn detects_race_markers() {
        assert!(is_lost_race(" ! [rejected]        HEAD -> main (fetch first)"));
        assert!(is_lost_race(" ! [rejected]        HEAD -> main (non-fast-forward)"));
        assert!(is_lost_race(" ! [rejected]        HEAD -> main (stale info)"));
        assert!(!is_lost_race("remote: pre-receive hook declined"));
    }

    #[test]
    fn update_clones_and_applies_patch() {
        let dir = TempDir::new().unwrap();
        let remote = setup_remote(dir.path());
        let scm = scm_at(dir.path().join("wc"));
        let url = remote.to_str().unwrap();

        let base = scm.update_repo(url).unwrap();
        assert_eq!(base.len(), 40);
        assert!(!scm.has_changes().unwrap());

        let commit = scm
            .apply_patch(DIFF, "Bug 1 - add a line", "Ada <ada@example.com>", DATE)
            .unwrap();
        assert_ne!(commit, base);
        assert_eq!(
            std::fs::read_to_string(scm.path().join("test.txt")).unwrap(),
            "TEST\nadding another line\n"
        );
        assert_eq!(scm.query(&["log", "-1", "--format=%an <%ae>"]).unwrap(), "Ada <ada@example.com>");
        assert_eq!(scm.query(&["log", "-1", "--format=%B"]).unwrap(), "Bug 1 - add a line");
        assert_eq!(scm.query(&["log", "-1", "--format=%at"]).unwrap(), "1700000000");
        assert_eq!(scm.changed_paths(&base).unwrap(), vec!["test.txt"]);
    }

    #[test]
    fn conflict_returns_diagnostics_and_reject() {
        let dir = TempDir::new().unwrap();
        let remote = setup_remote(dir.path());
        let scm = scm_at(dir.path().join("wc"));
        scm.update_repo(remote.to_str().unwrap()).unwrap();

        let conflicting = "diff --git a/test.txt b/test.txt
--- a/test.txt
+++ b/test.txt
@@ -1,1 +1,1 @@
-NOT THERE
+replacement
";
        let err = scm
            .apply_patch(conflicting, "conflict", "Ada <ada@example.com>", DATE)
            .unwrap_err();
        let ScmError::PatchConflict { diagnostics } = err else {
            panic!("expected a conflict, got {err:?}");
        };
        let (failed, rejects) = land_core::extract_error_data(&diagnostics);
        assert_eq!(failed, vec!["test.txt"]);
        assert_eq!(rejects, vec!["test.txt.rej"]);
        assert!(scm.read_reject("test.txt.rej").is_some_and(|c| c.contains("NOT THERE")));

        scm.clean_repo().unwrap();
        assert!(scm.read_reject("test.txt.rej").is_none());
    }

    #[test]
    fn builds_force_flags() {
        assert_eq!(force_flag(false, "main", "main", "abc"), None);
        assert_eq!(
            force_flag(true, "main", "main", "abc").as_deref(),
            Some("--force-with-lease=refs/heads/main:abc")
        );
        assert_eq!(force_flag(true, "try", "main", "abc").as_deref(), Some("--force"));
    }

    /// Working copy with one local commit, plus a competing commit already on
    /// the remote. Returns the scm, the remote and the base it was built on.
    fn raced_working_copy(root: &Path) -> (GitScm, PathBuf, String) {
        let remote = setup_remote(root);
        let url = remote.to_str().unwrap();
        let scm = scm_at(root.join("wc"));
        let base = scm.update_repo(url).unwrap();
        scm.apply_patch(DIFF, "ours", "Ada <ada@example.com>", DATE).unwrap();

        // Someone else lands first.
        let other = scm_at(root.join("other"));
        let other_base = other.update_repo(url).unwrap();
        std::fs::write(other.path().join("other.txt"), "theirs\n").unwrap();
        other.commit_all("theirs").unwrap();
        other.push(url, "", false, &other_base).unwrap();
        (scm, remote, base)
    }

    #[test]
    fn push_reports_lost_race() {
        let dir = TempDir::new().unwrap();
        let (scm, remote, base) = raced_working_copy(dir.path());
        let url = remote.to_str().unwrap();

        let err = scm.push(url, "", false, &base).unwrap_err();
        assert!(matches!(err, ScmError::LostPushRace(_)), "got {err:?}");
    }

    #[test]
    fn force_push_never_drops_a_competing_commit() {
        let dir = TempDir::new().unwrap();
        let (scm, remote, base) = raced_working_copy(dir.path());
        let url = remote.to_str().unwrap();
        let theirs = git(&remote, &["rev-parse", "refs/heads/main"]);

        let err = scm.push(url, "", true, &base).unwrap_err();
        assert!(matches!(err, ScmError::LostPushRace(_)), "got {err:?}");
        assert_eq!(git(&remote, &["rev-parse", "refs/heads/main"]), theirs);
    }

    #[test]
    fn force_push_replaces_rewritten_history_at_base() {
        let dir = TempDir::new().unwrap();
        let remote = setup_remote(dir.path());
        let url = remote.to_str().unwrap();
        let scm = scm_at(dir.path().join("wc"));
        let base = scm.update_repo(url).unwrap();

        // Rewrite the remote tip locally: not a fast-forward of `base`.
        std::fs::write(scm.path().join("test.txt"), "REWRITTEN\n").unwrap();
        scm.amend_commit(Some("rewritten")).unwrap();
        let err = scm.push(url, "", false, &base).unwrap_err();
        assert!(matches!(err, ScmError::LostPushRace(_)), "got {err:?}");

        scm.push(url, "", true, &base).unwrap();
        assert_eq!(
            git(&remote, &["rev-parse", "refs/heads/main"]),
            scm.tip_commit_id().unwrap()
        );
    }

    #[test]
    fn push_to_named_target_and_missing_remote() {
        let dir = TempDir::new().unwrap();
        let remote = setup_remote(dir.path());
        let url = remote.to_str().unwrap();
        let scm = scm_at(dir.path().join("wc"));
        let base = scm.update_repo(url).unwrap();
        scm.apply_patch(DIFF, "ours", "Ada <ada@example.com>", DATE).unwrap();

        scm.push(url, "landing", false, &base).unwrap();
        assert_eq!(
            git(&remote, &["rev-parse", "refs/heads/landing"]),
            scm.tip_commit_id().unwrap()
        );

        let missing = dir.path().join("missing.git");
        let err = scm.push(missing.to_str().unwrap(), "", false, &base).unwrap_err();
        assert!(matches!(err, ScmError::PushFailed(_)), "got {err:?}");
    }

    #[test]
    fn amend_keeps_description_and_commit_count() {
        let dir = TempDir::new().unwrap();
        let remote = setup_remote(dir.path());
        let scm = scm_at(dir.path().join("wc"));
        scm.update_repo(remote.to_str().unwrap()).unwrap();
        let before = scm
            .apply_patch(DIFF, "Bug 2 - keep me", "Ada <ada@example.com>", DATE)
            .unwrap();

        std::fs::write(scm.path().join("test.txt"), "FORMATTED\n").unwrap();
        assert!(scm.has_changes().unwrap());
        let after = scm.amend_commit(None).unwrap();

        assert_ne!(before, after);
        assert!(!scm.has_changes().unwrap());
        assert_eq!(scm.query(&["log", "-1", "--format=%B"]).unwrap(), "Bug 2 - keep me");
        assert_eq!(scm.query(&["rev-list", "--count", "HEAD"]).unwrap(), "2");
    }
}
