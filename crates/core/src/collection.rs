//! Collection manager: one user's view of the shared document store.
//!
//! A [`Collection`] is bound to `{root, user, branch}`. It owns the user's
//! in-memory document set and two backends: the user's working copy at
//! `<root>/<user>` and the shared bare repository at `<root>/_bare` that
//! every working copy pushes to and pulls from.
//!
//! Every public operation holds the working-directory lock for its whole
//! duration, so two handles on the same user never interleave checkouts.

use std::path::PathBuf;
use std::sync::Arc;

use indexmap::IndexSet;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, instrument, warn};

use crate::config::VetusConfig;
use crate::conflict::{ConflictDetector, ConflictReport};
use crate::errors::{CollectionError, CoreError, GitError};
use crate::git::{normalize_branch_list, Commit, GitCli, MergeOutcome, VcsBackend};
use crate::history::{is_checkpoint_branch, CancelFlag, HistoryCheckpoint, HistoryEngine};
use crate::lock::{workdir_lock, WorkdirLock};
use crate::store::{DocumentStore, Documents};

/// Directory name of the shared bare repository under the root.
pub const BARE_DIR: &str = "_bare";

// ---------------------------------------------------------------------------
// Options & results
// ---------------------------------------------------------------------------

/// Everything a [`Collection`] needs besides its backends.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollectionOptions {
    pub root: PathBuf,
    pub user: String,
    pub email: String,
    /// Target branch for load, save and merge.
    pub branch: String,
    /// Branch the bootstrap save pushes to.
    pub default_branch: String,
    pub remote: String,
    pub push_retries: u32,
}

impl CollectionOptions {
    pub fn from_config(config: &VetusConfig, user: &str, branch: &str) -> Self {
        Self {
            root: config.store.root.clone(),
            user: user.to_string(),
            email: config.store.email_for(user),
            branch: branch.to_string(),
            default_branch: config.store.default_branch.clone(),
            remote: config.git.remote.clone(),
            push_retries: config.sync.push_retries,
        }
    }

    /// The user's working copy.
    pub fn workdir(&self) -> PathBuf {
        self.root.join(&self.user)
    }

    /// The shared bare repository.
    pub fn bare_dir(&self) -> PathBuf {
        self.root.join(BARE_DIR)
    }
}

/// What [`Collection::save`] did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SaveOutcome {
    /// First save into an empty store: committed and pushed to the default
    /// branch.
    Bootstrapped,
    /// Committed and pushed to the target branch.
    Committed,
    /// Nothing changed since the last commit.
    Unchanged,
    /// First save into an empty store with no documents to commit.
    Empty,
}

impl std::fmt::Display for SaveOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Bootstrapped => write!(f, "bootstrapped"),
            Self::Committed => write!(f, "committed"),
            Self::Unchanged => write!(f, "unchanged"),
            Self::Empty => write!(f, "empty"),
        }
    }
}

/// Merge base of the target branch and one other work branch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SharedCommit {
    pub branch: String,
    pub base: String,
}

// ---------------------------------------------------------------------------
// Collection
// ---------------------------------------------------------------------------

/// Session handle for one user on one branch.
pub struct Collection<B: VcsBackend = GitCli> {
    options: CollectionOptions,
    repo: B,
    bare: B,
    store: DocumentStore,
    documents: Documents,
    lock: WorkdirLock,
    bare_initialized: bool,
}

impl Collection<GitCli> {
    /// Open a collection using the git executable described by `config`.
    pub fn open(config: &VetusConfig, user: &str, branch: &str) -> Self {
        let options = CollectionOptions::from_config(config, user, branch);
        let repo = GitCli::new(options.workdir(), &config.git);
        let bare = GitCli::new(options.bare_dir(), &config.git);
        Self::with_backends(options, repo, bare)
    }
}

impl<B: VcsBackend> Collection<B> {
    /// Build a collection over explicit backends for the working copy and
    /// the bare repository.
    pub fn with_backends(options: CollectionOptions, repo: B, bare: B) -> Self {
        let store = DocumentStore::new(repo.workdir());
        let lock = workdir_lock(repo.workdir());
        debug!(
            user = %options.user,
            branch = %options.branch,
            workdir = %repo.workdir().display(),
            "opened collection"
        );
        Self {
            options,
            repo,
            bare,
            store,
            documents: Documents::new(),
            lock,
            bare_initialized: false,
        }
    }

    pub fn options(&self) -> &CollectionOptions {
        &self.options
    }

    /// Current target branch.
    pub fn branch(&self) -> &str {
        &self.options.branch
    }

    // -- documents ----------------------------------------------------------

    /// In-memory documents as of the last load plus local edits.
    pub fn documents(&self) -> &Documents {
        &self.documents
    }

    pub fn documents_mut(&mut self) -> &mut Documents {
        &mut self.documents
    }

    pub fn document(&self, name: &str) -> Option<&Value> {
        self.documents.get(name)
    }

    /// Insert or replace a document; returns the previous value.
    pub fn set_document(&mut self, name: impl Into<String>, value: Value) -> Option<Value> {
        self.documents.insert(name.into(), value)
    }

    pub fn remove_document(&mut self, name: &str) -> Option<Value> {
        self.documents.remove(name)
    }

    // -- load / save --------------------------------------------------------

    /// Bring the working copy to the tip of the target branch and read every
    /// document into memory.
    #[instrument(skip(self), fields(user = %self.options.user, branch = %self.options.branch))]
    pub async fn load(&mut self) -> Result<&Documents, CollectionError> {
        let _guard = Arc::clone(&self.lock).lock_owned().await;
        self.ensure_repositories().await?;
        self.repo.fetch().await?;

        let branch = self.options.branch.clone();
        self.require_branch(&branch).await?;
        self.repo.checkout(&branch).await?;
        self.pull_or_abort(&branch).await?;

        self.documents = self.store.read_all().await?;
        info!(count = self.documents.len(), "loaded documents");
        Ok(&self.documents)
    }

    /// Write the in-memory documents, commit and push them.
    ///
    /// The very first save into an empty store commits on whatever branch
    /// the fresh clone is on and pushes it as the default branch.
    #[instrument(skip(self), fields(user = %self.options.user, branch = %self.options.branch))]
    pub async fn save(&mut self, message: &str) -> Result<SaveOutcome, CollectionError> {
        let _guard = Arc::clone(&self.lock).lock_owned().await;
        self.ensure_repositories().await?;

        if self.remote_uninitialized().await? {
            return self.bootstrap(message).await;
        }

        let branch = self.options.branch.clone();
        self.repo.fetch().await?;
        self.require_branch(&branch).await?;
        self.repo.checkout(&branch).await?;

        self.store.write_all(&self.documents).await?;
        if !self.repo.status().await? {
            // A merge may have left local commits that were never pushed.
            self.push_with_retry(&branch).await?;
            info!("no changes to commit");
            return Ok(SaveOutcome::Unchanged);
        }

        self.repo.add_all().await?;
        self.repo.commit(message).await?;
        self.push_with_retry(&branch).await?;
        info!(count = self.documents.len(), "saved documents");
        Ok(SaveOutcome::Committed)
    }

    async fn bootstrap(&mut self, message: &str) -> Result<SaveOutcome, CollectionError> {
        let default_branch = self.options.default_branch.clone();
        info!(branch = %default_branch, "store has no history, bootstrapping");

        self.store.write_all(&self.documents).await?;
        if self.repo.status().await? {
            self.repo.add_all().await?;
            self.repo.commit(message).await?;
        } else if self.has_local_commit().await? {
            // An earlier bootstrap committed but its push failed.
            info!("pushing earlier bootstrap commit");
        } else {
            warn!("bootstrap save has nothing to commit");
            return Ok(SaveOutcome::Empty);
        }

        self.repo.rename_current_branch(&default_branch).await?;
        self.repo.push(&self.options.remote, &default_branch).await?;
        self.bare_initialized = true;

        if self.options.branch != default_branch {
            warn!(
                target = %self.options.branch,
                pushed = %default_branch,
                "bootstrap commit went to the default branch"
            );
        }
        Ok(SaveOutcome::Bootstrapped)
    }

    // -- branches -----------------------------------------------------------

    /// Create `name` at the up-to-date tip of the target branch and push it.
    #[instrument(skip(self), fields(user = %self.options.user, from = %self.options.branch))]
    pub async fn create_branch(&mut self, name: &str) -> Result<(), CollectionError> {
        if is_checkpoint_branch(name) {
            return Err(CollectionError::ReservedBranchName(name.to_string()));
        }

        let _guard = Arc::clone(&self.lock).lock_owned().await;
        self.ensure_repositories().await?;
        self.repo.fetch().await?;

        if self.repo.branch_exists(name).await? {
            info!(name, "branch already exists");
            return Err(CollectionError::BranchAlreadyExists(name.to_string()));
        }

        let branch = self.options.branch.clone();
        self.require_branch(&branch).await?;
        self.repo.checkout(&branch).await?;
        self.pull_or_abort(&branch).await?;
        self.repo.create_branch(name).await?;
        self.repo.push(&self.options.remote, name).await?;
        info!(name, "created and pushed branch");
        Ok(())
    }

    /// Switch the working copy and this handle to `name`.
    ///
    /// Returns `false` if the branch does not exist.
    #[instrument(skip(self), fields(user = %self.options.user))]
    pub async fn change_branch(&mut self, name: &str) -> Result<bool, CollectionError> {
        if is_checkpoint_branch(name) {
            return Err(CollectionError::ReservedBranchName(name.to_string()));
        }

        let _guard = Arc::clone(&self.lock).lock_owned().await;
        self.ensure_repositories().await?;
        self.repo.fetch().await?;

        if !self.repo.branch_exists(name).await? {
            warn!(name, "cannot change to missing branch");
            return Ok(false);
        }
        self.repo.checkout(name).await?;
        self.options.branch = name.to_string();
        info!(name, "changed branch");
        Ok(true)
    }

    /// Merge `from` into the target branch.
    ///
    /// Both branches are brought up to date with the remote first, so the
    /// merge sees every commit other users have pushed.
    ///
    /// A conflicting merge is aborted before this returns and reported as
    /// [`CollectionError::MergeConflict`] with a field-level report. The
    /// in-memory documents are never touched; call [`load`](Self::load) to
    /// see merged content.
    #[instrument(skip(self), fields(user = %self.options.user, into = %self.options.branch))]
    pub async fn merge(&mut self, from: &str) -> Result<(), CollectionError> {
        let _guard = Arc::clone(&self.lock).lock_owned().await;
        self.ensure_repositories().await?;
        self.repo.fetch().await?;

        let branch = self.options.branch.clone();
        self.require_branch(from).await?;
        self.require_branch(&branch).await?;
        if from != branch {
            self.repo.checkout(from).await?;
            if let Err(e) = self.pull_or_abort(from).await {
                self.return_to(&branch).await;
                return Err(e);
            }
        }
        self.repo.checkout(&branch).await?;
        self.pull_or_abort(&branch).await?;

        match self.repo.merge(from).await {
            Ok(MergeOutcome::Merged) => {
                info!(from, "merge completed");
                Ok(())
            }
            Ok(MergeOutcome::Conflicted { output, files }) => {
                warn!(from, files = ?files, "merge conflicted, aborting");
                self.repo.abort_merge().await?;
                let report = self.resolve_conflict(from).await;
                self.return_to(&branch).await;
                Err(CollectionError::MergeConflict {
                    branch: from.to_string(),
                    output,
                    report: report?,
                })
            }
            Err(e) => {
                self.abort_unfinished_merge(from).await?;
                Err(e.into())
            }
        }
    }

    /// Compare the merge base, the target branch and `from` field by field.
    async fn resolve_conflict(&self, from: &str) -> Result<ConflictReport, CollectionError> {
        let base = self.repo.merge_base(&self.options.branch, from).await?;
        let base_docs = self.materialize(&base).await?;
        let ours = self.materialize(&self.options.branch).await?;
        let theirs = self.materialize(from).await?;
        Ok(ConflictDetector::detect(&base, &base_docs, &ours, &theirs))
    }

    /// Local and remote branch names, de-duplicated in first-seen order.
    /// Includes history checkpoint branches.
    #[instrument(skip(self), fields(user = %self.options.user))]
    pub async fn branch_list(&self) -> Result<IndexSet<String>, CollectionError> {
        let _guard = Arc::clone(&self.lock).lock_owned().await;
        self.ensure_repositories().await?;
        self.repo.fetch().await?;
        self.list_branches().await
    }

    /// Merge base of the target branch with every other work branch.
    #[instrument(skip(self), fields(user = %self.options.user, branch = %self.options.branch))]
    pub async fn shared_commits(&self) -> Result<Vec<SharedCommit>, CollectionError> {
        let _guard = Arc::clone(&self.lock).lock_owned().await;
        self.ensure_repositories().await?;
        self.repo.fetch().await?;
        self.require_branch(&self.options.branch).await?;

        let mut shared = Vec::new();
        for branch in self.list_branches().await? {
            if branch == self.options.branch || is_checkpoint_branch(&branch) {
                continue;
            }
            let base = self.repo.merge_base(&self.options.branch, &branch).await?;
            debug!(branch = %branch, base = %base, "shared commit");
            shared.push(SharedCommit { branch, base });
        }
        Ok(shared)
    }

    /// Structured log of `revision`, or of the target branch when `None`.
    #[instrument(skip(self), fields(user = %self.options.user))]
    pub async fn commit_log(&self, revision: Option<&str>) -> Result<Vec<Commit>, CollectionError> {
        let _guard = Arc::clone(&self.lock).lock_owned().await;
        self.ensure_repositories().await?;

        let commits = match revision {
            Some(rev) => self.repo.structured_log(rev).await?,
            None => {
                self.repo.fetch().await?;
                self.require_branch(&self.options.branch).await?;
                self.repo.checkout(&self.options.branch).await?;
                self.repo.structured_log(&self.options.branch).await?
            }
        };
        Ok(commits)
    }

    // -- history ------------------------------------------------------------

    /// Extend the history of `branch` (the target branch when `None`) to its
    /// tip and persist it as a checkpoint.
    #[instrument(skip(self, cancel), fields(user = %self.options.user))]
    pub async fn update_history(
        &self,
        branch: Option<&str>,
        cancel: CancelFlag,
    ) -> Result<HistoryCheckpoint, CoreError> {
        let _guard = Arc::clone(&self.lock).lock_owned().await;
        let branch = self.prepare_history(branch).await?;

        let engine = HistoryEngine::new(&self.repo, &self.store, &self.options.remote, cancel);
        let result = engine.update(&branch).await;
        self.return_to(&self.options.branch).await;
        Ok(result?)
    }

    /// Recompute the history of `branch` from its first commit without
    /// using or writing checkpoints.
    #[instrument(skip(self, cancel), fields(user = %self.options.user))]
    pub async fn rebuild_history(
        &self,
        branch: Option<&str>,
        cancel: CancelFlag,
    ) -> Result<HistoryCheckpoint, CoreError> {
        let _guard = Arc::clone(&self.lock).lock_owned().await;
        let branch = self.prepare_history(branch).await?;

        let engine = HistoryEngine::new(&self.repo, &self.store, &self.options.remote, cancel);
        let result = engine.rebuild(&branch).await;
        self.return_to(&self.options.branch).await;
        Ok(result?)
    }

    async fn prepare_history(&self, branch: Option<&str>) -> Result<String, CollectionError> {
        let branch = branch.unwrap_or(&self.options.branch).to_string();
        if is_checkpoint_branch(&branch) {
            return Err(CollectionError::ReservedBranchName(branch));
        }
        self.ensure_repositories().await?;
        self.repo.fetch().await?;
        self.require_branch(&branch).await?;
        self.repo.checkout(&branch).await?;
        self.pull_or_abort(&branch).await?;
        Ok(branch)
    }

    // -- helpers ------------------------------------------------------------

    /// Create the bare repository and the user's clone if either is missing.
    async fn ensure_repositories(&self) -> Result<(), CollectionError> {
        if !self.bare.exists().await {
            tokio::fs::create_dir_all(self.bare.workdir())
                .await
                .map_err(GitError::from)?;
            self.bare.init_bare(&self.options.default_branch).await?;
            info!(dir = %self.bare.workdir().display(), "created bare repository");
        }

        if !self.repo.exists().await {
            if let Some(parent) = self.repo.workdir().parent() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(GitError::from)?;
            }
            self.repo.clone_from(self.bare.workdir()).await?;
            self.repo
                .configure_identity(&self.options.user, &self.options.email)
                .await?;
            info!(dir = %self.repo.workdir().display(), "created working copy");
        }
        Ok(())
    }

    /// Whether the bare repository has no branches yet. Cached once false.
    async fn remote_uninitialized(&mut self) -> Result<bool, CollectionError> {
        if self.bare_initialized {
            return Ok(false);
        }
        let raw = self.bare.branch_list().await?;
        let empty = normalize_branch_list(&raw, &self.options.remote).is_empty();
        if !empty {
            self.bare_initialized = true;
        }
        Ok(empty)
    }

    async fn require_branch(&self, name: &str) -> Result<(), CollectionError> {
        if self.repo.branch_exists(name).await? {
            Ok(())
        } else {
            Err(CollectionError::BranchNotFound(name.to_string()))
        }
    }

    async fn list_branches(&self) -> Result<IndexSet<String>, CollectionError> {
        let raw = self.repo.branch_list().await?;
        Ok(normalize_branch_list(&raw, &self.options.remote))
    }

    /// Push `branch`, pulling and retrying after each rejection up to the
    /// configured limit.
    async fn push_with_retry(&self, branch: &str) -> Result<(), CollectionError> {
        let mut attempt = 0;
        loop {
            match self.repo.push(&self.options.remote, branch).await {
                Ok(()) => return Ok(()),
                Err(GitError::PushRejected { detail, .. }) if attempt < self.options.push_retries => {
                    attempt += 1;
                    warn!(branch, attempt, %detail, "push rejected, pulling before retry");
                    self.pull_or_abort(branch).await?;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Pull `branch`, aborting any merge the pull leaves behind.
    async fn pull_or_abort(&self, branch: &str) -> Result<(), CollectionError> {
        match self.repo.pull(&self.options.remote, branch).await {
            Ok(()) => Ok(()),
            Err(e) => {
                self.abort_unfinished_merge(branch).await?;
                Err(e.into())
            }
        }
    }

    /// Abort a merge left behind by a failed merge or pull on `branch`.
    async fn abort_unfinished_merge(&self, branch: &str) -> Result<(), CollectionError> {
        match self.repo.merge_in_progress().await {
            Ok(true) => {
                warn!(branch, "unfinished merge left behind, aborting");
                self.repo.abort_merge().await?;
            }
            Ok(false) => {}
            Err(e) => warn!(error = %e, branch, "could not check for an unfinished merge"),
        }
        Ok(())
    }

    /// Whether the working copy has a commit on its current branch. A fresh
    /// clone of an empty repository has none.
    async fn has_local_commit(&self) -> Result<bool, CollectionError> {
        match self.repo.head().await {
            Ok(hash) => {
                debug!(head = %hash, "working copy has a local commit");
                Ok(true)
            }
            Err(GitError::CommandFailed { .. }) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn materialize(&self, reference: &str) -> Result<Documents, CollectionError> {
        self.repo.checkout(reference).await?;
        Ok(self.store.read_all().await?)
    }

    /// Best-effort checkout after a failed or side-tracked operation.
    async fn return_to(&self, branch: &str) {
        if let Err(e) = self.repo.checkout(branch).await {
            warn!(error = %e, branch, "failed to return to branch");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GitConfig;
    use serde_json::json;

    fn options(root: &std::path::Path) -> CollectionOptions {
        let mut config = VetusConfig::default();
        config.store.root = root.to_path_buf();
        CollectionOptions::from_config(&config, "u1", "work")
    }

    #[test]
    fn test_options_from_config() {
        let opts = options(std::path::Path::new("/srv/vetus"));
        assert_eq!(opts.email, "u1@vetus");
        assert_eq!(opts.default_branch, "master");
        assert_eq!(opts.remote, "origin");
        assert_eq!(opts.push_retries, 1);
        assert_eq!(opts.workdir(), PathBuf::from("/srv/vetus/u1"));
        assert_eq!(opts.bare_dir(), PathBuf::from("/srv/vetus/_bare"));
    }

    #[test]
    fn test_document_accessors() {
        let dir = tempfile::tempdir().unwrap();
        let opts = options(dir.path());
        let git = GitConfig::default();
        let repo = GitCli::new(opts.workdir(), &git);
        let bare = GitCli::new(opts.bare_dir(), &git);
        let mut collection = Collection::with_backends(opts, repo, bare);

        assert!(collection.documents().is_empty());
        assert_eq!(collection.set_document("people", json!({"name": "Alice"})), None);
        assert_eq!(collection.document("people"), Some(&json!({"name": "Alice"})));

        collection
            .documents_mut()
            .insert("settings".into(), json!({"dark": true}));
        assert_eq!(collection.documents().len(), 2);

        assert_eq!(
            collection.remove_document("people"),
            Some(json!({"name": "Alice"}))
        );
        assert!(collection.document("people").is_none());
        assert_eq!(collection.branch(), "work");
    }

    #[tokio::test]
    async fn test_reserved_names_rejected_before_touching_disk() {
        let dir = tempfile::tempdir().unwrap();
        let mut collection = Collection::open(
            &{
                let mut c = VetusConfig::default();
                c.store.root = dir.path().to_path_buf();
                c
            },
            "u1",
            "work",
        );

        assert!(matches!(
            collection.create_branch("hist_abc").await,
            Err(CollectionError::ReservedBranchName(_))
        ));
        assert!(matches!(
            collection.change_branch("hist_abc").await,
            Err(CollectionError::ReservedBranchName(_))
        ));
        assert!(!dir.path().join(BARE_DIR).exists());
    }

    #[test]
    fn test_save_outcome_display() {
        assert_eq!(SaveOutcome::Bootstrapped.to_string(), "bootstrapped");
        assert_eq!(SaveOutcome::Unchanged.to_string(), "unchanged");
    }
}
