//! Configuration parsing for the landing worker.
//!
//! Worker settings use the same key=value format as the daemon config file.
//! Repository definitions and per-repository formatter settings are TOML.
//! Precedence: CLI flags > `--config` file > defaults.

use crate::types::Repo;
use serde::Deserialize;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),
    #[error("invalid config line: {0}")]
    InvalidLine(String),
    #[error("invalid boolean value for {key}: {value}")]
    InvalidBool { key: String, value: String },
    #[error("invalid integer value for {key}: {value}")]
    InvalidInt { key: String, value: String },
    #[error("invalid toml in {path}: {message}")]
    InvalidToml { path: String, message: String },
    #[error("duplicate repository name: {0}")]
    DuplicateRepo(String),
}

/// Worker configuration.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Name recorded on claims and in logs.
    pub worker_name: String,
    pub db_path: PathBuf,
    /// TOML file with `[[repo]]` tables.
    pub repos_file: PathBuf,
    /// Repositories this worker is bound to. Empty means every configured repo.
    pub repos: Vec<String>,

    // Polling
    pub sleep_seconds: u64,
    pub throttle_seconds: u64,
    /// When set the worker keeps polling but never claims.
    pub paused: bool,

    // Landing policy
    /// Deferrals beyond this many attempts become FAILED.
    pub max_attempts: u32,
    /// Repositories whose tree is closed to landings.
    pub closed_trees: Vec<String>,
    /// Move IN_PROGRESS jobs back to DEFERRED on start-up.
    pub requeue_interrupted: bool,

    // Autoformat
    /// Formatter configuration file, relative to the working copy.
    pub autoformat_config_file: String,
    /// Timeout per formatter command in seconds (0 = no timeout).
    pub formatter_timeout_sec: u32,

    // SCM
    pub git_bin: PathBuf,
    pub committer_name: String,
    pub committer_email: String,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            worker_name: "landd".to_string(),
            db_path: dirs::data_local_dir()
                .map_or_else(|| PathBuf::from("landd.db"), |d| d.join("landd/landd.db")),
            repos_file: PathBuf::from("repos.toml"),
            repos: Vec::new(),
            sleep_seconds: 10,
            throttle_seconds: 10,
            paused: false,
            max_attempts: 5,
            closed_trees: Vec::new(),
            requeue_interrupted: false,
            autoformat_config_file: ".landd.toml".to_string(),
            formatter_timeout_sec: 0,
            git_bin: PathBuf::from("git"),
            committer_name: "landd".to_string(),
            committer_email: "landd@localhost".to_string(),
        }
    }
}

impl WorkerConfig {
    /// Load config from a file, merging with defaults.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        config.load_file(path)?;
        Ok(config)
    }

    /// Load and merge values from a config file.
    pub fn load_file(&mut self, path: &Path) -> Result<(), ConfigError> {
        let content = std::fs::read_to_string(path)?;
        self.parse_content(&content)
    }

    /// Parse config content (key=value format).
    pub fn parse_content(&mut self, content: &str) -> Result<(), ConfigError> {
        for line in content.lines() {
            let trimmed = line.trim();

            if trimmed.is_empty() || trimmed.starts_with('#') {
                continue;
            }

            let Some((key, value)) = trimmed.split_once('=') else {
                return Err(ConfigError::InvalidLine(line.to_string()));
            };

            let key = key.trim();
            let value = Self::unquote(value.trim());

            self.apply_value(key, &value)?;
        }
        Ok(())
    }

    /// Remove surrounding quotes from a value.
    fn unquote(value: &str) -> String {
        if value.len() >= 2
            && ((value.starts_with('"') && value.ends_with('"'))
                || (value.starts_with('\'') && value.ends_with('\'')))
        {
            return value[1..value.len() - 1].to_string();
        }
        value.to_string()
    }

    /// Apply a single config value.
    fn apply_value(&mut self, key: &str, value: &str) -> Result<(), ConfigError> {
        match key {
            "worker_name" => self.worker_name = value.to_string(),
            "db_path" => self.db_path = PathBuf::from(value),
            "repos_file" => self.repos_file = PathBuf::from(value),
            "repos" => {
                self.repos = value.split_whitespace().map(String::from).collect();
            }
            "sleep_seconds" => self.sleep_seconds = Self::parse_int(key, value)?,
            "throttle_seconds" => self.throttle_seconds = Self::parse_int(key, value)?,
            "paused" => self.paused = Self::parse_bool(key, value)?,
            "max_attempts" => self.max_attempts = Self::parse_int(key, value)?,
            "closed_trees" => {
                self.closed_trees = value.split_whitespace().map(String::from).collect();
            }
            "requeue_interrupted" => self.requeue_interrupted = Self::parse_bool(key, value)?,
            "autoformat_config_file" => self.autoformat_config_file = value.to_string(),
            "formatter_timeout_sec" => self.formatter_timeout_sec = Self::parse_int(key, value)?,
            "git_bin" => self.git_bin = PathBuf::from(value),
            "committer_name" => self.committer_name = value.to_string(),
            "committer_email" => self.committer_email = value.to_string(),
            _ => {
                // Warn but don't fail for unknown keys.
                eprintln!("Warning: unknown config key: {key}");
            }
        }
        Ok(())
    }

    fn parse_int<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
        value.parse().map_err(|_| ConfigError::InvalidInt {
            key: key.to_string(),
            value: value.to_string(),
        })
    }

    fn parse_bool(key: &str, value: &str) -> Result<bool, ConfigError> {
        match value.to_lowercase().as_str() {
            "true" | "1" | "yes" | "y" | "on" => Ok(true),
            "false" | "0" | "no" | "n" | "off" => Ok(false),
            _ => Err(ConfigError::InvalidBool {
                key: key.to_string(),
                value: value.to_string(),
            }),
        }
    }

    /// Resolve relative paths against the directory holding the config file.
    pub fn resolve_paths(&mut self, base: &Path) {
        if self.repos_file.is_relative() {
            self.repos_file = base.join(&self.repos_file);
        }
        if self.db_path.is_relative() {
            self.db_path = base.join(&self.db_path);
        }
    }

    /// True when the worker handles `repo`.
    pub fn is_bound_to(&self, repo: &str) -> bool {
        self.repos.is_empty() || self.repos.iter().any(|r| r == repo)
    }
}

#[derive(Debug, Deserialize)]
struct ReposFile {
    #[serde(default, rename = "repo")]
    repos: Vec<Repo>,
}

/// Load repository definitions from a TOML file with `[[repo]]` tables.
///
/// Relative `system_path` values are resolved against the file's directory.
pub fn load_repos(path: &Path) -> Result<Vec<Repo>, ConfigError> {
    let content = std::fs::read_to_string(path)?;
    let file: ReposFile = toml::from_str(&content).map_err(|e| ConfigError::InvalidToml {
        path: path.display().to_string(),
        message: e.to_string(),
    })?;

    let base = path.parent().unwrap_or_else(|| Path::new("."));
    let mut seen = HashSet::new();
    let mut repos = Vec::with_capacity(file.repos.len());
    for mut repo in file.repos {
        if !seen.insert(repo.name.clone()) {
            return Err(ConfigError::DuplicateRepo(repo.name));
        }
        if repo.system_path.is_relative() {
            repo.system_path = base.join(&repo.system_path);
        }
        repos.push(repo);
    }
    Ok(repos)
}

/// Formatter settings read from a working copy.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct FormatConfig {
    #[serde(default = "enabled_by_default")]
    pub enabled: bool,
    /// Shell commands run in order from the working-copy root.
    #[serde(default)]
    pub commands: Vec<String>,
}

fn enabled_by_default() -> bool {
    true
}

#[derive(Debug, Deserialize)]
struct FormatFile {
    autoformat: Option<FormatConfig>,
}

impl FormatConfig {
    /// Read `[autoformat]` from `path`.
    ///
    /// A missing file or a file without the table means no formatter is
    /// configured and yields `Ok(None)`.
    pub fn load(path: &Path) -> Result<Option<Self>, ConfigError> {
        let content = match std::fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let file: FormatFile = toml::from_str(&content).map_err(|e| ConfigError::InvalidToml {
            path: path.display().to_string(),
            message: e.to_string(),
        })?;
        Ok(file.autoformat)
    }

    /// True when there is something to run.
    pub fn is_active(&self) -> bool {
        self.enabled && !self.commands.is_empty()
    }
}
