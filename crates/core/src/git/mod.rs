//! Git backend adapter for vetus.
//!
//! The core never touches repository internals: every primitive goes
//! through [`VcsBackend`], which [`GitCli`] implements by running the git
//! executable as a subprocess.

pub mod backend;
pub mod client;
pub mod parser;

pub use backend::{MergeOutcome, VcsBackend};
pub use client::GitCli;
pub use parser::*;
