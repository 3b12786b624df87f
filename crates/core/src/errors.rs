//! Error types for the vetus core library.
//!
//! Each subsystem has its own error type derived with `thiserror`, and a
//! top-level [`CoreError`] enum unifies them all for callers that want a
//! single error type.

use thiserror::Error;

use crate::conflict::ConflictReport;

// ---------------------------------------------------------------------------
// Top-level error
// ---------------------------------------------------------------------------

/// Unified error type for the entire core library.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error(transparent)]
    Git(#[from] GitError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Collection(#[from] CollectionError),

    #[error(transparent)]
    History(#[from] HistoryError),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

// ---------------------------------------------------------------------------
// Git backend errors
// ---------------------------------------------------------------------------

/// Errors from the git backend adapter.
#[derive(Debug, Error)]
pub enum GitError {
    /// The configured git binary was not found on `$PATH`.
    #[error("git binary not found: {0}")]
    BinaryNotFound(String),

    /// A git command exited with a non-zero status.
    #[error("git command `{command}` failed (exit {exit_code}): {stderr}")]
    CommandFailed {
        command: String,
        exit_code: i32,
        stderr: String,
    },

    /// Clone, fetch, pull or push against the remote failed.
    #[error("remote {operation} failed: {detail}")]
    RemoteSyncFailure {
        operation: String,
        detail: String,
    },

    /// Push was rejected because the remote advanced.
    #[error("git push rejected for branch '{branch}': {detail}")]
    PushRejected {
        branch: String,
        detail: String,
    },

    /// A git command did not finish within its time bound.
    #[error("git {operation} timed out after {secs}s")]
    Timeout {
        operation: String,
        secs: u64,
    },

    /// Could not parse the structured log output.
    #[error("failed to parse git log output: {0}")]
    LogParse(String),

    /// Generic I/O wrapper.
    #[error("git I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

// ---------------------------------------------------------------------------
// Document store errors
// ---------------------------------------------------------------------------

/// Errors from reading or writing document files.
#[derive(Debug, Error)]
pub enum StoreError {
    /// A document file does not contain valid JSON.
    #[error("document '{file}' is corrupt: {detail}")]
    DocumentCorrupt {
        file: String,
        detail: String,
    },

    /// A document could not be serialized.
    #[error("failed to serialize document '{document}': {detail}")]
    Serialize {
        document: String,
        detail: String,
    },

    /// Generic I/O wrapper.
    #[error("document store I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

// ---------------------------------------------------------------------------
// Collection errors
// ---------------------------------------------------------------------------

/// Errors from collection, branch and merge operations.
#[derive(Debug, Error)]
pub enum CollectionError {
    /// The branch does not exist locally or on the remote.
    #[error("branch '{0}' does not exist - use create_branch")]
    BranchNotFound(String),

    /// The branch to be created already exists.
    #[error("branch '{0}' already exists")]
    BranchAlreadyExists(String),

    /// The name is in the namespace reserved for history checkpoints.
    #[error("branch name '{0}' is reserved for history checkpoints")]
    ReservedBranchName(String),

    /// Merging produced conflicts; the merge was aborted.
    #[error("merge of '{branch}' conflicts on {} field(s); merge aborted", report.conflicts.len())]
    MergeConflict {
        branch: String,
        output: String,
        report: ConflictReport,
    },

    #[error(transparent)]
    Git(#[from] GitError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

// ---------------------------------------------------------------------------
// History errors
// ---------------------------------------------------------------------------

/// Errors from the history engine.
#[derive(Debug, Error)]
pub enum HistoryError {
    /// The structural diff met a case it has no policy for.
    #[error("unhandled change at '{path}' in commit {commit}: {detail}")]
    StructuralDiffGap {
        commit: String,
        path: String,
        detail: String,
    },

    /// The replay was cancelled before a checkpoint was written.
    #[error("history update cancelled")]
    Cancelled,

    /// The branch has no commits to replay.
    #[error("branch '{0}' has no commits")]
    EmptyBranch(String),

    #[error(transparent)]
    Git(#[from] GitError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

// ---------------------------------------------------------------------------
// Configuration errors
// ---------------------------------------------------------------------------

/// Errors from configuration loading and validation.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Config file not found.
    #[error("configuration file not found: {0}")]
    FileNotFound(String),

    /// TOML parse error.
    #[error("configuration parse error: {0}")]
    ParseError(String),

    /// A config value is invalid.
    #[error("invalid configuration value for '{field}': {detail}")]
    InvalidValue {
        field: String,
        detail: String,
    },

    /// Generic I/O error reading the config file.
    #[error("configuration I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display_messages() {
        let err = CollectionError::BranchNotFound("work".into());
        assert_eq!(err.to_string(), "branch 'work' does not exist - use create_branch");

        let err = StoreError::DocumentCorrupt {
            file: "people.json".into(),
            detail: "expected value at line 1 column 1".into(),
        };
        assert!(err.to_string().contains("people.json"));

        let err = GitError::Timeout {
            operation: "push".into(),
            secs: 120,
        };
        assert_eq!(err.to_string(), "git push timed out after 120s");

        let err = HistoryError::StructuralDiffGap {
            commit: "abc123".into(),
            path: "people.address".into(),
            detail: "type changed from object to string".into(),
        };
        assert!(err.to_string().contains("people.address"));
    }

    #[test]
    fn test_merge_conflict_counts_fields() {
        let err = CollectionError::MergeConflict {
            branch: "feature".into(),
            output: String::new(),
            report: ConflictReport::default(),
        };
        assert_eq!(
            err.to_string(),
            "merge of 'feature' conflicts on 0 field(s); merge aborted"
        );
    }

    #[test]
    fn test_core_error_from_subsystem() {
        let git_err = GitError::LogParse("truncated record".into());
        let core_err: CoreError = git_err.into();
        assert!(matches!(core_err, CoreError::Git(_)));

        let coll_err: CollectionError = StoreError::IoError(std::io::Error::other("boom")).into();
        let core_err: CoreError = coll_err.into();
        assert!(matches!(core_err, CoreError::Collection(CollectionError::Store(_))));
    }
}
