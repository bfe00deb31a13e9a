//! Parsing and construction of header-carrying patches.
//!
//! A patch is a block of `# Name value` header lines, a free-text commit
//! description, and the diff body. The `# Diff Start Line N` header gives
//! the 1-based line where the body begins:
//!
//! ```text
//! # HG changeset patch
//! # User Test User <test@example.com>
//! # Date 0 0
//! #      Thu Jan 01 00:00:00 1970 +0000
//! # Diff Start Line 7
//! bug 123: add another file
//!
//! diff --git a/test.txt b/test.txt
//! ```

use crate::types::PatchData;
use chrono::DateTime;
use regex::Regex;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::OnceLock;
use thiserror::Error;

/// Header names recognised in the patch header block.
const KNOWN_HEADERS: &[&str] = &[
    "Diff Start Line",
    "Fail HG Import",
    "Node ID",
    "Parent",
    "Branch",
    "User",
    "Date",
];

pub const HEADER_USER: &str = "User";
pub const HEADER_DATE: &str = "Date";
pub const HEADER_DIFF_START_LINE: &str = "Diff Start Line";
pub const HEADER_TEST_DIRECTIVE: &str = "Fail HG Import";

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PatchError {
    #[error("patch has no diff start line")]
    MissingDiffStartLine,
    #[error("invalid diff start line: {0}")]
    InvalidDiffStartLine(String),
    #[error("diff start line {line} is beyond the end of the patch ({total} lines)")]
    DiffStartOutOfRange { line: usize, total: usize },
    #[error("patch is missing the {0} header")]
    MissingHeader(&'static str),
}

pub type Result<T> = std::result::Result<T, PatchError>;

/// A parsed view over one patch. Borrows the original text so the diff body
/// is returned byte-for-byte.
#[derive(Debug, Clone)]
pub struct PatchHelper<'a> {
    patch: &'a str,
    headers: BTreeMap<String, String>,
    description: String,
    diff_offset: usize,
}

impl<'a> PatchHelper<'a> {
    /// Parse `patch`. Fails when the diff start line is missing or invalid.
    pub fn parse(patch: &'a str) -> Result<Self> {
        let mut headers = BTreeMap::new();
        let mut header_lines = 0;
        for line in patch.lines() {
            let Some(rest) = line.strip_prefix('#') else {
                break;
            };
            header_lines += 1;
            if let Some((name, value)) = split_header(rest.trim_start()) {
                headers.insert(name.to_string(), value.to_string());
            }
        }

        let raw_start = headers
            .get(HEADER_DIFF_START_LINE)
            .ok_or(PatchError::MissingDiffStartLine)?;
        let start_line: usize = raw_start
            .parse()
            .map_err(|_| PatchError::InvalidDiffStartLine(raw_start.clone()))?;
        if start_line == 0 {
            return Err(PatchError::InvalidDiffStartLine(raw_start.clone()));
        }

        // Byte offset of every line start, so the body is an exact slice.
        let mut offset = 0;
        let mut diff_offset = None;
        let mut description_lines = Vec::new();
        for (index, line) in patch.split_inclusive('\n').enumerate() {
            let number = index + 1;
            if number == start_line {
                diff_offset = Some(offset);
                break;
            }
            if index >= header_lines {
                description_lines.push(line.trim_end_matches(['\n', '\r']));
            }
            offset += line.len();
        }
        let total = patch.split_inclusive('\n').count();
        let diff_offset = match diff_offset {
            Some(offset) => offset,
            // A start line one past the last line is an empty body.
            None if start_line == total + 1 => patch.len(),
            None => {
                return Err(PatchError::DiffStartOutOfRange {
                    line: start_line,
                    total,
                })
            }
        };

        Ok(Self {
            patch,
            headers,
            description: description_lines.join("\n").trim().to_string(),
            diff_offset,
        })
    }

    /// Header value by name, e.g. `User` or `Date`.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(String::as_str)
    }

    pub fn headers(&self) -> &BTreeMap<String, String> {
        &self.headers
    }

    /// Author in `Name <email>` form.
    pub fn author(&self) -> Result<&str> {
        self.header(HEADER_USER)
            .ok_or(PatchError::MissingHeader(HEADER_USER))
    }

    /// Raw `<unix-seconds> <offset-seconds-west>` date string.
    pub fn date(&self) -> Result<&str> {
        self.header(HEADER_DATE)
            .ok_or(PatchError::MissingHeader(HEADER_DATE))
    }

    /// Embedded test directive, if any.
    pub fn test_directive(&self) -> Option<&str> {
        self.header(HEADER_TEST_DIRECTIVE)
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    /// The diff body, starting at the diff start line.
    pub fn diff(&self) -> &'a str {
        &self.patch[self.diff_offset..]
    }

    /// Bug references in the description.
    pub fn bugs(&self) -> Vec<u64> {
        parse_bugs(&self.description)
    }
}

fn split_header(line: &str) -> Option<(&'static str, &str)> {
    KNOWN_HEADERS.iter().find_map(|name| {
        let rest = line.strip_prefix(name)?;
        if rest.is_empty() {
            return Some((*name, ""));
        }
        rest.strip_prefix(' ').map(|value| (*name, value.trim()))
    })
}

/// Parse an hg-style `<unix-seconds> <offset-seconds-west>` date.
pub fn parse_hg_date(date: &str) -> Option<(i64, i32)> {
    let mut parts = date.split_whitespace();
    let timestamp = parts.next()?.parse().ok()?;
    let offset = match parts.next() {
        Some(offset) => offset.parse().ok()?,
        None => 0,
    };
    if parts.next().is_some() {
        return None;
    }
    Some((timestamp, offset))
}

fn bug_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)\b(?:bug\s*#?\s*|b=#?)(\d+)\b").expect("bug pattern is a valid regex")
    })
}

/// Extract sorted, de-duplicated bug numbers from a commit description.
pub fn parse_bugs(description: &str) -> Vec<u64> {
    let bugs: BTreeSet<u64> = bug_re()
        .captures_iter(description)
        .filter_map(|caps| caps.get(1)?.as_str().parse().ok())
        .collect();
    bugs.into_iter().collect()
}

/// Render bug numbers as `Bug 1, Bug 2`, or `No bug` when empty.
pub fn format_bugs(bugs: &[u64]) -> String {
    if bugs.is_empty() {
        return "No bug".to_string();
    }
    bugs.iter()
        .map(|bug| format!("Bug {bug}"))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Build a header-carrying patch from a raw diff and its metadata.
pub fn build_patch(raw_diff: &str, data: &PatchData) -> String {
    let message = data.commit_message.trim();
    let mut header = vec![
        "# HG changeset patch".to_string(),
        format!("# User {} <{}>", data.author_name, data.author_email),
        format!("# Date {} 0", data.timestamp),
    ];
    if let Some(when) = DateTime::from_timestamp(data.timestamp, 0) {
        header.push(format!("#      {}", when.format("%a %b %d %H:%M:%S %Y %z")));
    }
    // Header lines, the directive itself, the message and one blank line.
    let start_line = header.len() + 1 + message.lines().count().max(1) + 1 + 1;
    header.push(format!("# {HEADER_DIFF_START_LINE} {start_line}"));

    let mut patch = header.join("\n");
    patch.push('\n');
    patch.push_str(message);
    patch.push_str("\n\n");
    patch.push_str(raw_diff);
    patch
}

#[cfg(test)]
mod tests {
    use super::*;

    const PATCH: &str = "# HG changeset patch
# User Test User <test@example.com>
# Date 0 0
#      Thu Jan 01 00:00:00 1970 +0000
# Diff Start Line 7
bug 123: add another file

diff --git a/test.txt b/test.txt
--- a/test.txt
+++ b/test.txt
@@ -1,1 +1,2 @@
 TEST
+adding another line
";

    const PATCH_WITH_DIRECTIVE: &str = "# HG changeset patch
# User Test User <test@example.com>
# Date 0 0
#      Thu Jan 01 00:00:00 1970 +0000
# Fail HG Import LOSE_PUSH_RACE
# Diff Start Line 8
add another file.
diff --git a/test.txt b/test.txt
--- a/test.txt
+++ b/test.txt
@@ -1,1 +1,2 @@
 TEST
+adding one more line again
";

    #[test]
    fn parses_headers_description_and_diff() {
        let helper = PatchHelper::parse(PATCH).unwrap();
        assert_eq!(helper.author().unwrap(), "Test User <test@example.com>");
        assert_eq!(helper.date().unwrap(), "0 0");
        assert_eq!(helper.description(), "bug 123: add another file");
        assert!(helper.diff().contains("diff --git a/test.txt b/test.txt"));
        assert!(helper.diff().ends_with("+adding another line\n"));
        assert_eq!(helper.bugs(), vec![123]);
        assert!(helper.test_directive().is_none());
    }

    #[test]
    fn diff_starts_exactly_at_start_line() {
        let helper = PatchHelper::parse(PATCH_WITH_DIRECTIVE).unwrap();
        assert!(helper.diff().starts_with("diff --git"));
        assert_eq!(helper.description(), "add another file.");
        assert_eq!(helper.test_directive(), Some("LOSE_PUSH_RACE"));
    }

    #[test]
    fn missing_start_line_is_an_error() {
        let patch = "# HG changeset patch
# User Test User <test@example.com>
# Date 0 0
add another file.
diff --git a/test.txt b/test.txt
";
        let err = PatchHelper::parse(patch).unwrap_err();
        assert_eq!(err, PatchError::MissingDiffStartLine);
        assert!(err.to_string().contains("no diff start line"));
    }

    #[test]
    fn invalid_start_lines_are_errors() {
        let patch = "# User a <a@b>\n# Diff Start Line seven\nmsg\n";
        assert!(matches!(
            PatchHelper::parse(patch),
            Err(PatchError::InvalidDiffStartLine(_))
        ));
        let patch = "# User a <a@b>\n# Diff Start Line 0\nmsg\n";
        assert!(matches!(
            PatchHelper::parse(patch),
            Err(PatchError::InvalidDiffStartLine(_))
        ));
        let patch = "# User a <a@b>\n# Diff Start Line 40\nmsg\n";
        assert!(matches!(
            PatchHelper::parse(patch),
            Err(PatchError::DiffStartOutOfRange { line: 40, total: 3 })
        ));
    }

    #[test]
    fn description_may_contain_hash_lines() {
        let patch = "# User a <a@b>
# Date 0 0
# Diff Start Line 7
Bug 5: tidy

# ignore-this-changeset
diff --git a/x b/x
";
        let helper = PatchHelper::parse(patch).unwrap();
        assert_eq!(helper.description(), "Bug 5: tidy\n\n# ignore-this-changeset");
        assert!(helper.diff().starts_with("diff --git a/x b/x"));
    }

    #[test]
    fn large_multibyte_body_round_trips() {
        let large = "😁".repeat(1_000_000);
        let patch = format!(
            "# User Test User <test@example.com>
# Date 0 0
# Diff Start Line 5
add another file.

diff --git a/test.txt b/test.txt
--- a/test.txt
+++ b/test.txt
@@ -1,1 +1,2 @@
 TEST
+{large}"
        );
        let helper = PatchHelper::parse(&patch).unwrap();
        assert!(helper.diff().starts_with('\n'));
        assert!(helper.diff().ends_with(&large));
        assert_eq!(
            helper.diff().len(),
            patch.len() - patch.find("\ndiff --git").unwrap()
        );
    }

    #[test]
    fn crlf_line_endings_are_preserved_in_body() {
        let patch = "# User a <a@b>\r\n# Diff Start Line 4\r\nmsg\r\n-x\r\n+y\r\n";
        let helper = PatchHelper::parse(patch).unwrap();
        assert_eq!(helper.description(), "msg");
        assert_eq!(helper.diff(), "-x\r\n+y\r\n");
    }

    #[test]
    fn parse_bugs_finds_unique_sorted_ids() {
        assert_eq!(parse_bugs("Bug 123 - fix; bug 45 and bug #123"), vec![45, 123]);
        assert_eq!(parse_bugs("b=77 r=someone"), vec![77]);
        assert!(parse_bugs("no references; debug 12 is not a bug id").is_empty());
    }

    #[test]
    fn format_bugs_joins_or_reports_none() {
        assert_eq!(format_bugs(&[123]), "Bug 123");
        assert_eq!(format_bugs(&[1, 2]), "Bug 1, Bug 2");
        assert_eq!(format_bugs(&[]), "No bug");
    }

    #[test]
    fn parse_hg_date_handles_offsets() {
        assert_eq!(parse_hg_date("0 0"), Some((0, 0)));
        assert_eq!(parse_hg_date("1700000000 -3600"), Some((1_700_000_000, -3600)));
        assert_eq!(parse_hg_date("1700000000"), Some((1_700_000_000, 0)));
        assert_eq!(parse_hg_date("yesterday"), None);
        assert_eq!(parse_hg_date("1 2 3"), None);
    }

    #[test]
    fn build_patch_is_parseable() {
        let data = PatchData {
            author_name: "Test User".to_string(),
            author_email: "test@example.com".to_string(),
            timestamp: 0,
            commit_message: "Bug 9: first line\n\nMore detail.".to_string(),
        };
        let raw = "diff --git a/a b/a\n--- a/a\n+++ b/a\n@@ -1 +1 @@\n-a\n+b\n";
        let patch = build_patch(raw, &data);
        assert!(patch.starts_with("# HG changeset patch\n"));
        assert!(patch.contains("#      Thu Jan 01 00:00:00 1970 +0000\n"));

        let helper = PatchHelper::parse(&patch).unwrap();
        assert_eq!(helper.author().unwrap(), "Test User <test@example.com>");
        assert_eq!(helper.date().unwrap(), "0 0");
        assert_eq!(helper.description(), "Bug 9: first line\n\nMore detail.");
        assert_eq!(helper.diff(), raw);
        assert_eq!(helper.bugs(), vec![9]);
    }
}
