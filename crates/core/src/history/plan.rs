//! Checkpoint search over a branch's commit path.

use crate::git::Commit;

/// What a history update has to replay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplayPlan {
    /// Newest commit on the path with a cached checkpoint, if any.
    pub anchor: Option<Commit>,
    /// Commits newer than the anchor, oldest first. With no anchor this is
    /// the whole path and replay starts from the empty document set.
    pub commits: Vec<Commit>,
}

impl ReplayPlan {
    /// The anchor is already the tip: nothing to replay.
    pub fn is_current(&self) -> bool {
        self.anchor.is_some() && self.commits.is_empty()
    }

    /// Commit the finished history describes.
    pub fn tip(&self) -> Option<&Commit> {
        self.commits.last().or(self.anchor.as_ref())
    }
}

/// Find the nearest checkpoint on `path` (newest first, as logged) and
/// return the commits that still need replaying.
pub fn plan_replay(path: &[Commit], has_checkpoint: impl Fn(&str) -> bool) -> ReplayPlan {
    match path.iter().position(|c| has_checkpoint(&c.hash)) {
        Some(i) => ReplayPlan {
            anchor: Some(path[i].clone()),
            commits: path[..i].iter().rev().cloned().collect(),
        },
        None => ReplayPlan {
            anchor: None,
            commits: path.iter().rev().cloned().collect(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::DateTime;

    fn path(hashes: &[&str]) -> Vec<Commit> {
        hashes
            .iter()
            .map(|h| Commit {
                hash: h.to_string(),
                author: "u1".into(),
                email: "u1@vetus".into(),
                date: DateTime::parse_from_rfc3339("2024-01-01T00:00:00+00:00").unwrap(),
                subject: String::new(),
            })
            .collect()
    }

    fn hashes(commits: &[Commit]) -> Vec<&str> {
        commits.iter().map(|c| c.hash.as_str()).collect()
    }

    #[test]
    fn test_no_checkpoint_replays_everything() {
        let plan = plan_replay(&path(&["c3", "c2", "c1"]), |_| false);
        assert_eq!(plan.anchor, None);
        assert_eq!(hashes(&plan.commits), vec!["c1", "c2", "c3"]);
        assert_eq!(plan.tip().unwrap().hash, "c3");
        assert!(!plan.is_current());
    }

    #[test]
    fn test_nearest_checkpoint_wins() {
        let plan = plan_replay(&path(&["c4", "c3", "c2", "c1"]), |h| h == "c2" || h == "c1");
        assert_eq!(plan.anchor.as_ref().unwrap().hash, "c2");
        assert_eq!(hashes(&plan.commits), vec!["c3", "c4"]);
    }

    #[test]
    fn test_checkpoint_at_tip_is_current() {
        let plan = plan_replay(&path(&["c2", "c1"]), |h| h == "c2");
        assert!(plan.is_current());
        assert_eq!(plan.tip().unwrap().hash, "c2");
    }

    #[test]
    fn test_empty_path() {
        let plan = plan_replay(&[], |_| true);
        assert_eq!(plan.anchor, None);
        assert!(plan.commits.is_empty());
        assert!(plan.tip().is_none());
    }
}
