//! Incremental history replay over a branch's commits.
//!
//! [`HistoryEngine::update`] runs in four steps:
//!
//! 1. Check out the branch and log its first-parent commit path.
//! 2. Find the newest commit with a `hist_<commit>` checkpoint.
//! 3. Replay each newer commit, diffing consecutive document sets.
//! 4. Write the result on top of the tip commit, commit it, and only then
//!    create and push the tip's checkpoint branch.
//!
//! The caller must hold the working-copy lock for the whole call.

use std::collections::HashSet;

use tracing::{debug, info, instrument, warn};

use super::diff::compare_documents;
use super::plan::{plan_replay, ReplayPlan};
use super::{checkpoint_branch, is_cancelled, is_checkpoint_branch, CancelFlag, HistoryCheckpoint};
use crate::errors::HistoryError;
use crate::git::{normalize_branch_list, Commit, VcsBackend};
use crate::store::{DocumentStore, Documents};

/// Computes and persists field-level history for one working copy.
pub struct HistoryEngine<'a, B: VcsBackend> {
    repo: &'a B,
    store: &'a DocumentStore,
    remote: &'a str,
    cancel: CancelFlag,
}

impl<'a, B: VcsBackend> HistoryEngine<'a, B> {
    pub fn new(repo: &'a B, store: &'a DocumentStore, remote: &'a str, cancel: CancelFlag) -> Self {
        Self {
            repo,
            store,
            remote,
            cancel,
        }
    }

    /// Extend `branch`'s history from its nearest checkpoint to its tip and
    /// persist it as the tip's checkpoint.
    ///
    /// If the tip already has a checkpoint it is returned as is. On failure
    /// no new checkpoint branch exists and the working copy is back on
    /// `branch`.
    #[instrument(skip(self))]
    pub async fn update(&self, branch: &str) -> Result<HistoryCheckpoint, HistoryError> {
        let path = self.commit_path(branch).await?;
        let checkpoints = self.existing_checkpoints().await?;
        let plan = plan_replay(&path, |hash| checkpoints.contains(&checkpoint_branch(hash)));
        info!(
            anchor = plan.anchor.as_ref().map(Commit::short_hash).unwrap_or("none"),
            replay = plan.commits.len(),
            "planned history replay"
        );

        let result = if plan.is_current() {
            self.reuse_checkpoint(branch, &plan).await
        } else {
            self.replay_and_persist(branch, &plan).await
        };

        if let Err(e) = &result {
            warn!(error = %e, "history update failed, restoring working copy");
            self.restore(branch).await;
        }
        result
    }

    /// Replay `branch`'s whole path from the empty state without reading
    /// or writing checkpoints.
    #[instrument(skip(self))]
    pub async fn rebuild(&self, branch: &str) -> Result<HistoryCheckpoint, HistoryError> {
        let path = self.commit_path(branch).await?;
        let plan = plan_replay(&path, |_| false);

        let result = async {
            let history = self
                .replay(Documents::new(), Documents::new(), &plan.commits)
                .await?;
            self.repo.checkout(branch).await?;
            Ok::<_, HistoryError>(history)
        }
        .await;

        match result {
            Ok(history) => {
                let tip = plan
                    .tip()
                    .cloned()
                    .ok_or_else(|| HistoryError::EmptyBranch(branch.to_string()))?;
                Ok(HistoryCheckpoint {
                    branch: checkpoint_branch(&tip.hash),
                    commit: tip,
                    history,
                    created: false,
                })
            }
            Err(e) => {
                self.restore(branch).await;
                Err(e)
            }
        }
    }

    async fn commit_path(&self, branch: &str) -> Result<Vec<Commit>, HistoryError> {
        self.repo.checkout(branch).await?;
        let path = self.repo.structured_log(branch).await?;
        if path.is_empty() {
            return Err(HistoryError::EmptyBranch(branch.to_string()));
        }
        debug!(branch, commits = path.len(), "loaded commit path");
        Ok(path)
    }

    async fn existing_checkpoints(&self) -> Result<HashSet<String>, HistoryError> {
        let raw = self.repo.branch_list().await?;
        Ok(normalize_branch_list(&raw, self.remote)
            .into_iter()
            .filter(|name| is_checkpoint_branch(name))
            .collect())
    }

    async fn reuse_checkpoint(
        &self,
        branch: &str,
        plan: &ReplayPlan,
    ) -> Result<HistoryCheckpoint, HistoryError> {
        let anchor = plan
            .anchor
            .clone()
            .ok_or_else(|| HistoryError::EmptyBranch(branch.to_string()))?;
        let history = self.load_checkpoint(&anchor).await?;
        self.repo.checkout(branch).await?;
        info!(commit = anchor.short_hash(), "history already up to date");
        Ok(HistoryCheckpoint {
            branch: checkpoint_branch(&anchor.hash),
            commit: anchor,
            history,
            created: false,
        })
    }

    async fn replay_and_persist(
        &self,
        branch: &str,
        plan: &ReplayPlan,
    ) -> Result<HistoryCheckpoint, HistoryError> {
        let (history, previous) = match &plan.anchor {
            Some(anchor) => (
                self.load_checkpoint(anchor).await?,
                self.materialize(&anchor.hash).await?,
            ),
            None => (Documents::new(), Documents::new()),
        };

        let history = self.replay(history, previous, &plan.commits).await?;

        let tip = plan
            .tip()
            .cloned()
            .ok_or_else(|| HistoryError::EmptyBranch(branch.to_string()))?;
        let name = self.write_checkpoint(&tip, &history).await?;
        self.repo.checkout(branch).await?;

        Ok(HistoryCheckpoint {
            commit: tip,
            branch: name,
            history,
            created: true,
        })
    }

    /// Fold every commit into `history`, diffing against the previous
    /// commit's documents.
    async fn replay(
        &self,
        mut history: Documents,
        mut previous: Documents,
        commits: &[Commit],
    ) -> Result<Documents, HistoryError> {
        for commit in commits {
            self.check_cancelled()?;
            let current = self.materialize(&commit.hash).await?;
            history = compare_documents(&previous, &current, &history, commit)?;
            debug!(commit = commit.short_hash(), author = %commit.author, "replayed commit");
            previous = current;
        }
        Ok(history)
    }

    async fn write_checkpoint(&self, tip: &Commit, history: &Documents) -> Result<String, HistoryError> {
        self.check_cancelled()?;
        let name = checkpoint_branch(&tip.hash);

        self.repo.checkout(&tip.hash).await?;
        self.store.write_all(history).await?;
        if self.repo.status().await? {
            self.repo.add_all().await?;
            self.repo
                .commit(&format!("History checkpoint for {}", tip.hash))
                .await?;
        }
        self.repo.create_branch(&name).await?;
        info!(branch = %name, "created history checkpoint");

        self.repo.push(self.remote, &name).await?;
        Ok(name)
    }

    async fn load_checkpoint(&self, anchor: &Commit) -> Result<Documents, HistoryError> {
        self.repo.checkout(&checkpoint_branch(&anchor.hash)).await?;
        Ok(self.store.read_all().await?)
    }

    async fn materialize(&self, reference: &str) -> Result<Documents, HistoryError> {
        self.repo.checkout(reference).await?;
        Ok(self.store.read_all().await?)
    }

    fn check_cancelled(&self) -> Result<(), HistoryError> {
        if is_cancelled(&self.cancel) {
            info!("history update cancelled");
            return Err(HistoryError::Cancelled);
        }
        Ok(())
    }

    /// Best-effort return to a clean checkout of `branch` after a failure.
    async fn restore(&self, branch: &str) {
        if let Err(e) = self.repo.discard_changes().await {
            warn!(error = %e, "failed to discard working tree changes");
        }
        if let Err(e) = self.repo.checkout(branch).await {
            warn!(error = %e, branch, "failed to return to branch");
        }
    }
}
