//! Field-level conflict reports for aborted merges.
//!
//! When git cannot merge two branches, the merge is aborted and the three
//! document sets involved (merge base, ours, theirs) are compared field by
//! field to tell the caller exactly which values collided.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info};

use crate::store::Documents;

/// One field changed differently on both sides of a merge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldConflict {
    /// Document the field belongs to.
    pub document: String,
    /// Dotted path inside the document; empty for the document itself.
    pub path: String,
    /// Value at the merge base, `None` if absent.
    pub base: Option<Value>,
    /// Value on the branch being merged into.
    pub ours: Option<Value>,
    /// Value on the branch being merged from.
    pub theirs: Option<Value>,
}

/// All field conflicts found for one merge.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConflictReport {
    /// Merge base commit the comparison was made against.
    pub base_commit: String,
    pub conflicts: Vec<FieldConflict>,
}

impl ConflictReport {
    pub fn is_empty(&self) -> bool {
        self.conflicts.is_empty()
    }
}

/// Stateless three-way comparison of document sets.
pub struct ConflictDetector;

impl ConflictDetector {
    /// Compare both sides against their merge base.
    ///
    /// A field conflicts when ours and theirs both changed it and ended up
    /// with different values. Objects are descended into; arrays and
    /// scalars are compared as whole values.
    pub fn detect(
        base_commit: &str,
        base: &Documents,
        ours: &Documents,
        theirs: &Documents,
    ) -> ConflictReport {
        info!(
            base = base_commit,
            ours = ours.len(),
            theirs = theirs.len(),
            "detecting field conflicts"
        );

        let names: BTreeSet<&String> = base.keys().chain(ours.keys()).chain(theirs.keys()).collect();

        let mut conflicts = Vec::new();
        for name in names {
            let base_leaves = flatten(base.get(name.as_str()));
            let our_leaves = flatten(ours.get(name.as_str()));
            let their_leaves = flatten(theirs.get(name.as_str()));

            let paths: BTreeSet<&String> = base_leaves
                .keys()
                .chain(our_leaves.keys())
                .chain(their_leaves.keys())
                .collect();

            for path in paths {
                let b = base_leaves.get(path);
                let o = our_leaves.get(path);
                let t = their_leaves.get(path);
                if o != b && t != b && o != t {
                    debug!(document = %name, path = %path, "field conflict");
                    conflicts.push(FieldConflict {
                        document: name.clone(),
                        path: path.clone(),
                        base: b.cloned(),
                        ours: o.cloned(),
                        theirs: t.cloned(),
                    });
                }
            }
        }

        info!(count = conflicts.len(), "field conflict detection complete");
        ConflictReport {
            base_commit: base_commit.to_string(),
            conflicts,
        }
    }
}

/// Map every leaf of `value` to its dotted path.
fn flatten(value: Option<&Value>) -> BTreeMap<String, Value> {
    let mut leaves = BTreeMap::new();
    if let Some(value) = value {
        flatten_into(String::new(), value, &mut leaves);
    }
    leaves
}

fn flatten_into(prefix: String, value: &Value, leaves: &mut BTreeMap<String, Value>) {
    match value {
        Value::Object(map) if !map.is_empty() => {
            for (key, child) in map {
                let path = if prefix.is_empty() {
                    key.clone()
                } else {
                    format!("{}.{}", prefix, key)
                };
                flatten_into(path, child, leaves);
            }
        }
        _ => {
            leaves.insert(prefix, value.clone());
        }
    }
}
