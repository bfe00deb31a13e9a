//! Extraction of failed paths from patch-apply diagnostics.
//!
//! Understands the GNU patch / hg import grammar:
//!
//! ```text
//! patching file toolkit/moz.configure
//! Hunk #1 FAILED at 2075
//! 1 out of 1 hunks FAILED -- saving rejects to file toolkit/moz.configure.rej
//! file G0fvb1RuMQxXNjs already exists
//! unable to find 'abc/def' for patching
//! ```
//!
//! and the `git apply --reject --verbose` grammar:
//!
//! ```text
//! Applying patch toolkit/moz.configure with 1 reject...
//! error: new.txt: already exists in working directory
//! error: abc/def: does not exist in index
//! ```

use regex::Regex;
use std::sync::OnceLock;

fn hunks_failed_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^\d+ out of \d+ hunks? FAILED -- saving rejects to file (.+)$")
            .expect("hunk failure pattern is a valid regex")
    })
}

fn git_rejects_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^Applying patch (.+) with [1-9]\d* rejects?\.\.\.$")
            .expect("git reject pattern is a valid regex")
    })
}

/// Path a failure line is attributed to until its reject line is seen.
#[derive(Debug)]
enum Pending {
    /// From "patching file X": only reported if hunks fail.
    Context(String),
    /// From a line that is itself a failure ("already exists", "unable to find").
    Failure(String),
}

/// Accumulates failure records in the order the tool reported them.
#[derive(Debug, Default)]
struct Collector {
    failed: Vec<String>,
    rejects: Vec<String>,
    pending: Option<Pending>,
}

impl Collector {
    fn push(&mut self, path: String, reject: String) {
        self.failed.push(path);
        self.rejects.push(reject);
    }

    /// Report a pending failure that never got a reject line.
    fn flush(&mut self) {
        if let Some(Pending::Failure(path)) = self.pending.take() {
            let reject = format!("{path}.rej");
            self.push(path, reject);
        }
    }

    fn set(&mut self, pending: Pending) {
        self.flush();
        self.pending = Some(pending);
    }

    fn reject(&mut self, reject: &str) {
        let path = match self.pending.take() {
            Some(Pending::Context(path) | Pending::Failure(path)) => path,
            None => reject.strip_suffix(".rej").unwrap_or(reject).to_string(),
        };
        self.push(path, reject.to_string());
    }
}

/// Extract `(failed_paths, reject_paths)` from apply diagnostics.
///
/// Both lists have the same length; the i-th reject belongs to the i-th
/// failed path. Lines reporting succeeded hunks are ignored.
pub fn extract_error_data(diagnostics: &str) -> (Vec<String>, Vec<String>) {
    let mut collector = Collector::default();

    for raw in diagnostics.lines() {
        let line = raw.trim();
        if line.is_empty() || line.contains("succeeded") {
            continue;
        }

        if let Some(path) = line.strip_prefix("patching file ") {
            collector.set(Pending::Context(path.trim().to_string()));
        } else if let Some(path) = line
            .strip_prefix("file ")
            .and_then(|rest| rest.strip_suffix(" already exists"))
        {
            collector.set(Pending::Failure(path.trim().to_string()));
        } else if let Some(path) = line
            .strip_prefix("unable to find '")
            .and_then(|rest| rest.strip_suffix("' for patching"))
        {
            collector.set(Pending::Failure(path.to_string()));
        } else if let Some(caps) = hunks_failed_re().captures(line) {
            collector.reject(caps[1].trim());
        } else if let Some(caps) = git_rejects_re().captures(line) {
            collector.flush();
            let path = caps[1].trim().to_string();
            let reject = format!("{path}.rej");
            collector.push(path, reject);
        } else if let Some(rest) = line.strip_prefix("error: ") {
            if let Some(path) = rest
                .strip_suffix(": already exists in working directory")
                .or_else(|| rest.strip_suffix(": does not exist in index"))
                .or_else(|| rest.strip_suffix(": No such file or directory"))
            {
                collector.set(Pending::Failure(path.to_string()));
            }
        }
    }
    collector.flush();

    (collector.failed, collector.rejects)
}
