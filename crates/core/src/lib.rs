//! vetus core library.
//!
//! A versioned JSON document store that keeps one file per document in a
//! git working copy, synchronizes every user's clone through a shared bare
//! repository, and maintains a field-level change history in dedicated
//! `hist_<commit>` checkpoint branches.

pub mod collection;
pub mod config;
pub mod conflict;
pub mod errors;
pub mod git;
pub mod history;
pub mod lock;
pub mod store;

// Re-exports for convenience.
pub use collection::{Collection, CollectionOptions, SaveOutcome, SharedCommit};
pub use config::VetusConfig;
pub use git::{Commit, GitCli, MergeOutcome, VcsBackend};
pub use history::{CancelFlag, HistoryCheckpoint, HistoryEngine};
pub use store::{DocumentStore, Documents};
