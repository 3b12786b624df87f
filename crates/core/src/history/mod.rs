//! Field-level change history.
//!
//! For every document field the history holds a narrative of who created,
//! updated or deleted it and when. Histories are cached per commit in
//! checkpoint branches named `hist_<commit>`; extending a branch's history
//! replays only the commits newer than its nearest checkpoint.
//!
//! | Module | Description |
//! |--------|-------------|
//! | [`diff`] | Pure structural diff folding one commit into a history |
//! | [`plan`] | Checkpoint search over a commit path |
//! | [`engine`] | Checkout, replay and checkpoint persistence |

pub mod diff;
pub mod engine;
pub mod plan;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::git::Commit;
use crate::store::Documents;

pub use diff::{compare_documents, compare_json, DiffGap};
pub use engine::HistoryEngine;
pub use plan::{plan_replay, ReplayPlan};

/// Prefix of checkpoint branch names. Never valid for work branches.
pub const HISTORY_BRANCH_PREFIX: &str = "hist_";

/// Name of the checkpoint branch for `commit_hash`.
pub fn checkpoint_branch(commit_hash: &str) -> String {
    format!("{}{}", HISTORY_BRANCH_PREFIX, commit_hash)
}

/// Whether `name` is in the checkpoint namespace.
pub fn is_checkpoint_branch(name: &str) -> bool {
    name.starts_with(HISTORY_BRANCH_PREFIX)
}

/// Shared cancellation flag checked between replay steps.
pub type CancelFlag = Arc<AtomicBool>;

/// Create a flag that is not set.
pub fn new_cancel_flag() -> CancelFlag {
    Arc::new(AtomicBool::new(false))
}

/// Check whether cancellation has been requested.
pub fn is_cancelled(flag: &CancelFlag) -> bool {
    flag.load(Ordering::SeqCst)
}

/// History as of one commit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryCheckpoint {
    /// Commit the history describes.
    pub commit: Commit,
    /// Checkpoint branch holding (or that would hold) this history.
    pub branch: String,
    /// Document name to HistoryJson.
    pub history: Documents,
    /// Whether this call wrote the checkpoint branch.
    pub created: bool,
}
