//! Subprocess port used for formatter executables.
//!
//! Commands run through `sh -c` from the working-copy root. Stdout and stderr
//! are captured in full; a non-zero exit is reported, not raised.

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;
use thiserror::Error;
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tokio::runtime::{Builder, Handle};
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum RunnerError {
    #[error("failed to run command: {0}")]
    Io(#[from] std::io::Error),
    #[error("command timed out after {0} seconds")]
    Timeout(u32),
}

/// Captured result of one command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    /// Exit code, -1 when killed by a signal.
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// Stdout and stderr joined, for diagnostics.
    pub fn combined(&self) -> String {
        match (self.stdout.trim().is_empty(), self.stderr.trim().is_empty()) {
            (true, _) => self.stderr.clone(),
            (_, true) => self.stdout.clone(),
            _ => format!("{}\n{}", self.stdout.trim_end(), self.stderr),
        }
    }
}

/// Runs shell commands on behalf of the landing pipeline.
///
/// The pipeline is synchronous and runs on the blocking pool, so `run`
/// blocks the calling thread. It must not be called from an async task.
pub trait CommandRunner: Send + Sync {
    fn run(&self, command: &str, cwd: &Path, env: &[(String, String)]) -> Result<CommandOutput, RunnerError>;
}

/// `sh -c` runner with an optional per-command timeout.
#[derive(Debug, Clone, Default)]
pub struct ShellRunner {
    /// Seconds before the command is killed (0 = no timeout).
    pub timeout_sec: u32,
}

impl ShellRunner {
    pub fn new(timeout_sec: u32) -> Self {
        Self { timeout_sec }
    }

    /// Execute a single command.
    pub async fn execute(
        &self,
        command: &str,
        cwd: &Path,
        env: &[(String, String)],
    ) -> Result<CommandOutput, RunnerError> {
        debug!(cmd = %command, cwd = %cwd.display(), "running command");

        let mut process = Command::new("sh");
        process
            .arg("-c")
            .arg(command)
            .current_dir(cwd)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        for (key, value) in env {
            process.env(key, value);
        }

        let mut child = process.spawn()?;
        let mut stdout_handle = child.stdout.take();
        let mut stderr_handle = child.stderr.take();

        // Drain both pipes while waiting so a chatty formatter cannot block.
        let mut stdout = Vec::new();
        let mut stderr = Vec::new();
        let finished = async {
            let read_stdout = async {
                if let Some(ref mut handle) = stdout_handle {
                    let _ = handle.read_to_end(&mut stdout).await;
                }
            };
            let read_stderr = async {
                if let Some(ref mut handle) = stderr_handle {
                    let _ = handle.read_to_end(&mut stderr).await;
                }
            };
            let ((), (), status) = tokio::join!(read_stdout, read_stderr, child.wait());
            status
        };

        let status = if self.timeout_sec > 0 {
            let timeout_duration = Duration::from_secs(u64::from(self.timeout_sec));
            match tokio::time::timeout(timeout_duration, finished).await {
                Ok(status) => status?,
                Err(_) => {
                    // Kill the process on timeout, then reap it.
                    if let Err(e) = child.kill().await {
                        warn!(cmd = %command, error = %e, "failed to kill timed-out command");
                    }
                    warn!(cmd = %command, timeout_sec = self.timeout_sec, "command timed out");
                    return Err(RunnerError::Timeout(self.timeout_sec));
                }
            }
        } else {
            finished.await?
        };

        let output = CommandOutput {
            exit_code: status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&stdout).to_string(),
            stderr: String::from_utf8_lossy(&stderr).to_string(),
        };
        if !output.success() {
            warn!(cmd = %command, exit_code = output.exit_code, "command failed");
        }
        Ok(output)
    }
}

impl CommandRunner for ShellRunner {
    fn run(&self, command: &str, cwd: &Path, env: &[(String, String)]) -> Result<CommandOutput, RunnerError> {
        match Handle::try_current() {
            Ok(handle) => handle.block_on(self.execute(command, cwd, env)),
            Err(_) => Builder::new_current_thread()
                .enable_all()
                .build()?
                .block_on(self.execute(command, cwd, env)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn captures_output_and_exit_code() {
        let dir = TempDir::new().unwrap();
        let runner = ShellRunner::default();

        let output = runner
            .execute("echo out; echo err >&2; exit 3", dir.path(), &[])
            .await
            .unwrap();
        assert_eq!(output.exit_code, 3);
        assert!(!output.success());
        assert_eq!(output.stdout, "out\n");
        assert_eq!(output.stderr, "err\n");
        assert_eq!(output.combined(), "out\nerr\n");
    }

    #[tokio::test]
    async fn runs_in_cwd_with_env() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("marker"), "").unwrap();
        let runner = ShellRunner::default();

        let env = vec![("LANDD_TEST_VALUE".to_string(), "hello".to_string())];
        let output = runner
            .execute("ls; echo \"$LANDD_TEST_VALUE\"", dir.path(), &env)
            .await
            .unwrap();
        assert!(output.success());
        assert_eq!(output.stdout, "marker\nhello\n");
    }

    #[tokio::test]
    async fn times_out_long_commands() {
        let dir = TempDir::new().unwrap();
        let runner = ShellRunner::new(1);

        let started = std::time::Instant::now();
        let result = runner.execute("sleep 5", dir.path(), &[]).await;
        assert!(matches!(result, Err(RunnerError::Timeout(1))));
        assert!(started.elapsed() < Duration::from_secs(4));
    }

    #[tokio::test]
    async fn large_output_does_not_block() {
        let dir = TempDir::new().unwrap();
        let runner = ShellRunner::new(10);

        let output = runner
            .execute("head -c 1000000 /dev/zero | tr '\\0' x", dir.path(), &[])
            .await
            .unwrap();
        assert!(output.success());
        assert_eq!(output.stdout.len(), 1_000_000);
    }

    #[tokio::test]
    async fn blocking_run_from_blocking_pool() {
        let dir = TempDir::new().unwrap();
        let cwd = dir.path().to_path_buf();

        let output = tokio::task::spawn_blocking(move || ShellRunner::new(5).run("echo pooled", &cwd, &[]))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(output.stdout, "pooled\n");
    }

    #[test]
    fn blocking_run_outside_runtime() {
        let dir = TempDir::new().unwrap();
        let output = ShellRunner::default().run("echo plain", dir.path(), &[]).unwrap();
        assert_eq!(output.stdout, "plain\n");
    }

    #[test]
    fn combined_prefers_non_empty_stream() {
        let output = CommandOutput {
            exit_code: 1,
            stdout: String::new(),
            stderr: "boom\n".to_string(),
        };
        assert_eq!(output.combined(), "boom\n");
    }
}
