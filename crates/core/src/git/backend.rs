//! The [`VcsBackend`] trait: the boundary between vetus and git.

use std::path::Path;

use async_trait::async_trait;

use super::parser::Commit;
use crate::errors::GitError;

/// Result of merging another branch into the checked-out branch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MergeOutcome {
    /// The merge completed (fast-forward, clean merge, or already up to date).
    Merged,
    /// The merge stopped with conflicts. The repository is mid-merge until
    /// [`VcsBackend::abort_merge`] is called.
    Conflicted {
        /// Combined stdout/stderr of the merge command.
        output: String,
        /// Paths git reported as unmerged.
        files: Vec<String>,
    },
}

/// Primitive repository operations over one directory.
///
/// Every method may suspend on subprocess or network I/O and reports a
/// non-zero exit as an error. Implementations are bound to a single
/// directory: a user working copy or the shared bare repository.
#[async_trait]
pub trait VcsBackend: Send + Sync {
    /// Directory this backend operates on.
    fn workdir(&self) -> &Path;

    /// Whether the directory already holds a repository (bare or not).
    async fn exists(&self) -> bool;

    /// Initialize a bare repository whose `HEAD` names `default_branch`.
    async fn init_bare(&self, default_branch: &str) -> Result<(), GitError>;

    /// Clone `source` into this backend's directory.
    async fn clone_from(&self, source: &Path) -> Result<(), GitError>;

    /// Set the commit identity for this repository.
    async fn configure_identity(&self, name: &str, email: &str) -> Result<(), GitError>;

    /// Check out a branch or commit.
    async fn checkout(&self, reference: &str) -> Result<(), GitError>;

    /// Whether `name` exists as a local or remote-tracking branch.
    async fn branch_exists(&self, name: &str) -> Result<bool, GitError>;

    /// Create branch `name` at `HEAD` without switching to it.
    async fn create_branch(&self, name: &str) -> Result<(), GitError>;

    /// Rename the checked-out branch.
    async fn rename_current_branch(&self, name: &str) -> Result<(), GitError>;

    /// Raw listing of local and remote branches, one per line.
    async fn branch_list(&self) -> Result<String, GitError>;

    /// Fetch refs from the remote.
    async fn fetch(&self) -> Result<(), GitError>;

    /// Fetch `branch` from `remote` and merge it into the checked-out branch.
    async fn pull(&self, remote: &str, branch: &str) -> Result<(), GitError>;

    /// Push `branch` to `remote`.
    async fn push(&self, remote: &str, branch: &str) -> Result<(), GitError>;

    /// Whether the working tree has uncommitted changes.
    async fn status(&self) -> Result<bool, GitError>;

    /// Stage every change, including deletions.
    async fn add_all(&self) -> Result<(), GitError>;

    /// Commit the staged changes.
    async fn commit(&self, message: &str) -> Result<(), GitError>;

    /// Merge `branch` into the checked-out branch.
    async fn merge(&self, branch: &str) -> Result<MergeOutcome, GitError>;

    /// Abort an in-progress merge.
    async fn abort_merge(&self) -> Result<(), GitError>;

    /// Whether a merge is in progress.
    async fn merge_in_progress(&self) -> Result<bool, GitError>;

    /// Best common ancestor of two branches or commits.
    async fn merge_base(&self, a: &str, b: &str) -> Result<String, GitError>;

    /// Commits reachable from `revision` along first parents, newest first.
    async fn structured_log(&self, revision: &str) -> Result<Vec<Commit>, GitError>;

    /// Drop staged and unstaged changes and untracked files.
    async fn discard_changes(&self) -> Result<(), GitError>;

    /// Hash of the checked-out commit.
    async fn head(&self) -> Result<String, GitError>;
}
