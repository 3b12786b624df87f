//! Parsers for git command output.

use chrono::{DateTime, FixedOffset};
use indexmap::IndexSet;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::errors::GitError;

/// Field separator used in the structured log format.
const UNIT_SEP: char = '\u{1f}';
/// Record separator used in the structured log format.
const RECORD_SEP: char = '\u{1e}';

/// `--format` argument producing output [`parse_log`] understands.
pub const LOG_FORMAT: &str = "--format=%H%x1f%an%x1f%ae%x1f%aI%x1f%s%x1e";

/// One commit from the structured log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Commit {
    pub hash: String,
    pub author: String,
    pub email: String,
    pub date: DateTime<FixedOffset>,
    pub subject: String,
}

impl Commit {
    /// First seven characters of the hash.
    pub fn short_hash(&self) -> &str {
        &self.hash[..self.hash.len().min(7)]
    }
}

/// Parse output produced with [`LOG_FORMAT`].
pub fn parse_log(output: &str) -> Result<Vec<Commit>, GitError> {
    debug!("parsing git log output ({} bytes)", output.len());
    let mut commits = Vec::new();
    for record in output.split(RECORD_SEP) {
        let record = record.trim_start_matches(['\n', '\r']);
        if record.trim().is_empty() {
            continue;
        }
        let fields: Vec<&str> = record.split(UNIT_SEP).collect();
        if fields.len() != 5 {
            return Err(GitError::LogParse(format!(
                "expected 5 fields, found {} in {:?}",
                fields.len(),
                record
            )));
        }
        let date = DateTime::parse_from_rfc3339(fields[3].trim())
            .map_err(|e| GitError::LogParse(format!("bad date {:?}: {}", fields[3], e)))?;
        commits.push(Commit {
            hash: fields[0].trim().to_string(),
            author: fields[1].to_string(),
            email: fields[2].to_string(),
            date,
            subject: fields[4].trim_end().to_string(),
        });
    }
    Ok(commits)
}

/// Normalize `git branch -a` output into branch names.
///
/// Strips the current-branch marker and indentation, folds
/// `remotes/<remote>/` prefixes onto the local name, drops the symbolic
/// `HEAD` ref and detached-HEAD pseudo entries, and de-duplicates while
/// keeping first-seen order.
pub fn normalize_branch_list(raw: &str, remote: &str) -> IndexSet<String> {
    let remote_prefix = format!("remotes/{}/", remote);
    raw.lines()
        .map(|line| line.trim_end())
        .filter(|line| !line.is_empty())
        .map(|line| {
            let line = line.strip_prefix("* ").unwrap_or(line);
            let line = line.strip_prefix("+ ").unwrap_or(line);
            let line = line.trim_start();
            line.strip_prefix(&remote_prefix).unwrap_or(line).to_string()
        })
        .filter(|name| !name.starts_with("HEAD") && !name.starts_with('('))
        .collect()
}

/// Parse `git diff --name-only` style output.
pub fn parse_name_list(output: &str) -> Vec<String> {
    output
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(String::from)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(hash: &str, author: &str, date: &str, subject: &str) -> String {
        format!(
            "{hash}\u{1f}{author}\u{1f}{author}@vetus\u{1f}{date}\u{1f}{subject}\u{1e}\n"
        )
    }

    #[test]
    fn test_parse_log() {
        let output = format!(
            "{}{}",
            record("b2", "bob", "2024-03-02T10:00:00+01:00", "second"),
            record("a1", "alice", "2024-03-01T09:30:00+00:00", "first save")
        );
        let commits = parse_log(&output).unwrap();
        assert_eq!(commits.len(), 2);
        assert_eq!(commits[0].hash, "b2");
        assert_eq!(commits[0].author, "bob");
        assert_eq!(commits[1].subject, "first save");
        assert_eq!(commits[1].email, "alice@vetus");
        assert_eq!(
            commits[0].date.to_rfc3339(),
            "2024-03-02T10:00:00+01:00"
        );
    }

    #[test]
    fn test_parse_log_empty() {
        assert!(parse_log("").unwrap().is_empty());
        assert!(parse_log("\n").unwrap().is_empty());
    }

    #[test]
    fn test_parse_log_rejects_short_record() {
        let result = parse_log("abc\u{1f}alice\u{1e}\n");
        assert!(matches!(result, Err(GitError::LogParse(_))));
    }

    #[test]
    fn test_parse_log_rejects_bad_date() {
        let result = parse_log(&record("a1", "alice", "yesterday", "x"));
        assert!(matches!(result, Err(GitError::LogParse(_))));
    }

    #[test]
    fn test_normalize_branch_list() {
        let raw = "* work\n  master\n  hist_abc\n  remotes/origin/HEAD -> origin/master\n  remotes/origin/master\n  remotes/origin/other\n";
        let names: Vec<String> = normalize_branch_list(raw, "origin").into_iter().collect();
        assert_eq!(names, vec!["work", "master", "hist_abc", "other"]);
    }

    #[test]
    fn test_normalize_branch_list_skips_detached() {
        let raw = "* (HEAD detached at 1a2b3c4)\n  master\n";
        let names: Vec<String> = normalize_branch_list(raw, "origin").into_iter().collect();
        assert_eq!(names, vec!["master"]);
    }

    #[test]
    fn test_normalize_branch_list_empty() {
        assert!(normalize_branch_list("", "origin").is_empty());
    }

    #[test]
    fn test_short_hash() {
        let commit = parse_log(&record(
            "0123456789abcdef",
            "alice",
            "2024-03-01T09:30:00+00:00",
            "x",
        ))
        .unwrap()
        .remove(0);
        assert_eq!(commit.short_hash(), "0123456");
    }
}
