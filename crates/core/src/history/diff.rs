//! Structural diff of JSON documents into a field-level history.
//!
//! A history node mirrors the document node it describes: objects map to
//! objects of history nodes, every other value maps to a narrative string
//! with one line per change. Nodes are never removed; a deleted field keeps
//! its narrative and gains a `Deleted` line.
//!
//! Arrays are opaque values. Any change between a scalar and an array, or
//! between scalar types, is an ordinary update. A change between an object
//! and anything else has no narrative representation and is reported as a
//! [`DiffGap`].

use serde_json::{Map, Value};

use crate::errors::HistoryError;
use crate::git::Commit;
use crate::store::Documents;

/// A change the diff has no policy for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiffGap {
    /// Dotted path of the field, starting with the document name at the
    /// top level.
    pub path: String,
    pub detail: String,
}

enum Change<'v> {
    Created(&'v Value),
    Updated(&'v Value),
    Deleted,
}

/// Fold the change from `old` to `new` into `history`.
///
/// Returns the new history; none of the inputs are modified.
pub fn compare_json(
    old: &Map<String, Value>,
    new: &Map<String, Value>,
    history: &Map<String, Value>,
    commit: &Commit,
) -> Result<Map<String, Value>, DiffGap> {
    compare_at("", old, new, history, commit)
}

/// [`compare_json`] over whole document sets, reporting gaps as
/// [`HistoryError::StructuralDiffGap`].
pub fn compare_documents(
    old: &Documents,
    new: &Documents,
    history: &Documents,
    commit: &Commit,
) -> Result<Documents, HistoryError> {
    compare_json(old, new, history, commit).map_err(|gap| HistoryError::StructuralDiffGap {
        commit: commit.hash.clone(),
        path: gap.path,
        detail: gap.detail,
    })
}

fn compare_at(
    prefix: &str,
    old: &Map<String, Value>,
    new: &Map<String, Value>,
    history: &Map<String, Value>,
    commit: &Commit,
) -> Result<Map<String, Value>, DiffGap> {
    let mut next = history.clone();

    for (key, new_value) in new {
        let path = join(prefix, key);
        let node = history.get(key);
        let changed = match old.get(key) {
            None => created(&path, new_value, node, commit)?,
            Some(old_value) if old_value == new_value => continue,
            Some(old_value) => updated(&path, old_value, new_value, node, commit)?,
        };
        next.insert(key.clone(), changed);
    }

    for (key, old_value) in old {
        if new.contains_key(key) {
            continue;
        }
        let path = join(prefix, key);
        next.insert(key.clone(), deleted(&path, old_value, history.get(key), commit)?);
    }

    Ok(next)
}

fn created(path: &str, value: &Value, node: Option<&Value>, commit: &Commit) -> Result<Value, DiffGap> {
    match value {
        Value::Object(fields) => {
            let nested = nested_history(path, node)?;
            Ok(Value::Object(compare_at(path, &Map::new(), fields, &nested, commit)?))
        }
        value => append(path, node, Change::Created(value), commit),
    }
}

fn updated(
    path: &str,
    old: &Value,
    new: &Value,
    node: Option<&Value>,
    commit: &Commit,
) -> Result<Value, DiffGap> {
    match (old, new) {
        (Value::Object(old_fields), Value::Object(new_fields)) => {
            let nested = nested_history(path, node)?;
            Ok(Value::Object(compare_at(path, old_fields, new_fields, &nested, commit)?))
        }
        (Value::Object(_), _) | (_, Value::Object(_)) => Err(DiffGap {
            path: path.to_string(),
            detail: format!("type changed from {} to {}", kind(old), kind(new)),
        }),
        (_, value) => append(path, node, Change::Updated(value), commit),
    }
}

fn deleted(path: &str, old: &Value, node: Option<&Value>, commit: &Commit) -> Result<Value, DiffGap> {
    match old {
        Value::Object(fields) => {
            let nested = nested_history(path, node)?;
            Ok(Value::Object(compare_at(path, fields, &Map::new(), &nested, commit)?))
        }
        _ => append(path, node, Change::Deleted, commit),
    }
}

/// Existing history for an object-valued field.
fn nested_history(path: &str, node: Option<&Value>) -> Result<Map<String, Value>, DiffGap> {
    match node {
        None => Ok(Map::new()),
        Some(Value::Object(map)) => Ok(map.clone()),
        Some(other) => Err(DiffGap {
            path: path.to_string(),
            detail: format!("object value but history holds {}", kind(other)),
        }),
    }
}

/// Append one narrative line to a leaf history node.
fn append(path: &str, node: Option<&Value>, change: Change<'_>, commit: &Commit) -> Result<Value, DiffGap> {
    let line = narrative_line(&change, commit);
    match node {
        None => Ok(Value::String(line)),
        Some(Value::String(existing)) if existing.is_empty() => Ok(Value::String(line)),
        Some(Value::String(existing)) => Ok(Value::String(format!("{}\n{}", existing, line))),
        Some(other) => Err(DiffGap {
            path: path.to_string(),
            detail: format!("non-object value but history holds {}", kind(other)),
        }),
    }
}

fn narrative_line(change: &Change<'_>, commit: &Commit) -> String {
    let at = commit.date.to_rfc3339();
    match change {
        Change::Created(value) => {
            format!("Created with value {} by {} at {}", value, commit.author, at)
        }
        Change::Updated(value) => {
            format!("Updated with value {} by {} at {}", value, commit.author, at)
        }
        Change::Deleted => format!("Deleted by {} at {}", commit.author, at),
    }
}

fn join(prefix: &str, key: &str) -> String {
    if prefix.is_empty() {
        key.to_string()
    } else {
        format!("{}.{}", prefix, key)
    }
}

fn kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::DateTime;
    use serde_json::json;

    fn commit(hash: &str, author: &str, date: &str) -> Commit {
        Commit {
            hash: hash.into(),
            author: author.into(),
            email: format!("{}@vetus", author),
            date: DateTime::parse_from_rfc3339(date).unwrap(),
            subject: "save".into(),
        }
    }

    fn map(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            _ => panic!("expected object"),
        }
    }

    fn lines(history: &Map<String, Value>, doc: &str, field: &str) -> Vec<String> {
        history[doc][field]
            .as_str()
            .unwrap()
            .lines()
            .map(String::from)
            .collect()
    }

    #[test]
    fn test_created_then_updated_keeps_order_and_provenance() {
        let c1 = commit("c1", "alice", "2024-01-01T10:00:00+00:00");
        let c2 = commit("c2", "bob", "2024-01-02T11:30:00+00:00");

        let v1 = map(json!({"people": {"name": "Alice"}}));
        let v2 = map(json!({"people": {"name": "Bob"}}));

        let h1 = compare_json(&Map::new(), &v1, &Map::new(), &c1).unwrap();
        let h2 = compare_json(&v1, &v2, &h1, &c2).unwrap();

        assert_eq!(
            lines(&h2, "people", "name"),
            vec![
                "Created with value \"Alice\" by alice at 2024-01-01T10:00:00+00:00",
                "Updated with value \"Bob\" by bob at 2024-01-02T11:30:00+00:00",
            ]
        );
    }

    #[test]
    fn test_nested_objects_mirror_document_shape() {
        let c1 = commit("c1", "alice", "2024-01-01T10:00:00+00:00");
        let doc = map(json!({"cfg": {"theme": {"dark": true, "size": 3}}}));

        let history = compare_json(&Map::new(), &doc, &Map::new(), &c1).unwrap();
        let theme = history["cfg"]["theme"].as_object().unwrap();
        assert!(theme["dark"].as_str().unwrap().starts_with("Created with value true"));
        assert!(theme["size"].as_str().unwrap().starts_with("Created with value 3"));
    }

    #[test]
    fn test_unchanged_fields_are_untouched() {
        let c1 = commit("c1", "alice", "2024-01-01T10:00:00+00:00");
        let c2 = commit("c2", "bob", "2024-01-02T10:00:00+00:00");
        let v1 = map(json!({"d": {"a": 1, "b": 2}}));
        let v2 = map(json!({"d": {"a": 1, "b": 3}}));

        let h1 = compare_json(&Map::new(), &v1, &Map::new(), &c1).unwrap();
        let h2 = compare_json(&v1, &v2, &h1, &c2).unwrap();
        assert_eq!(h1["d"]["a"], h2["d"]["a"]);
        assert_eq!(lines(&h2, "d", "b").len(), 2);
    }

    #[test]
    fn test_deleted_fields_are_annotated_not_removed() {
        let c1 = commit("c1", "alice", "2024-01-01T10:00:00+00:00");
        let c2 = commit("c2", "bob", "2024-01-02T10:00:00+00:00");
        let v1 = map(json!({"d": {"gone": "x", "sub": {"deep": 1}}}));
        let v2 = map(json!({"d": {}}));

        let h1 = compare_json(&Map::new(), &v1, &Map::new(), &c1).unwrap();
        let h2 = compare_json(&v1, &v2, &h1, &c2).unwrap();

        let gone = lines(&h2, "d", "gone");
        assert_eq!(gone.len(), 2);
        assert_eq!(gone[1], "Deleted by bob at 2024-01-02T10:00:00+00:00");
        let deep = h2["d"]["sub"]["deep"].as_str().unwrap();
        assert!(deep.ends_with("Deleted by bob at 2024-01-02T10:00:00+00:00"));
    }

    #[test]
    fn test_recreated_field_appends_to_narrative() {
        let c1 = commit("c1", "alice", "2024-01-01T10:00:00+00:00");
        let c2 = commit("c2", "bob", "2024-01-02T10:00:00+00:00");
        let c3 = commit("c3", "carol", "2024-01-03T10:00:00+00:00");
        let with = map(json!({"d": {"f": 1}}));
        let without = map(json!({"d": {}}));

        let h1 = compare_json(&Map::new(), &with, &Map::new(), &c1).unwrap();
        let h2 = compare_json(&with, &without, &h1, &c2).unwrap();
        let h3 = compare_json(&without, &with, &h2, &c3).unwrap();

        let f = lines(&h3, "d", "f");
        assert_eq!(f.len(), 3);
        assert!(f[1].starts_with("Deleted by bob"));
        assert!(f[2].starts_with("Created with value 1 by carol"));
    }

    #[test]
    fn test_arrays_are_opaque_values() {
        let c1 = commit("c1", "alice", "2024-01-01T10:00:00+00:00");
        let c2 = commit("c2", "bob", "2024-01-02T10:00:00+00:00");
        let v1 = map(json!({"d": {"tags": ["a"]}}));
        let v2 = map(json!({"d": {"tags": ["a", "b"]}}));

        let h1 = compare_json(&Map::new(), &v1, &Map::new(), &c1).unwrap();
        let h2 = compare_json(&v1, &v2, &h1, &c2).unwrap();
        let tags = lines(&h2, "d", "tags");
        assert!(tags[0].starts_with("Created with value [\"a\"]"));
        assert!(tags[1].starts_with("Updated with value [\"a\",\"b\"]"));
    }

    #[test]
    fn test_scalar_type_change_is_an_update() {
        let c1 = commit("c1", "alice", "2024-01-01T10:00:00+00:00");
        let c2 = commit("c2", "bob", "2024-01-02T10:00:00+00:00");
        let v1 = map(json!({"d": {"n": "7"}}));
        let v2 = map(json!({"d": {"n": 7}}));

        let h1 = compare_json(&Map::new(), &v1, &Map::new(), &c1).unwrap();
        let h2 = compare_json(&v1, &v2, &h1, &c2).unwrap();
        assert!(lines(&h2, "d", "n")[1].starts_with("Updated with value 7 by bob"));
    }

    #[test]
    fn test_object_type_change_is_a_gap() {
        let c1 = commit("c1", "alice", "2024-01-01T10:00:00+00:00");
        let c2 = commit("c2", "bob", "2024-01-02T10:00:00+00:00");
        let v1 = map(json!({"d": {"addr": "Main St"}}));
        let v2 = map(json!({"d": {"addr": {"street": "Main St"}}}));

        let h1 = compare_json(&Map::new(), &v1, &Map::new(), &c1).unwrap();
        let gap = compare_json(&v1, &v2, &h1, &c2).unwrap_err();
        assert_eq!(gap.path, "d.addr");
        assert_eq!(gap.detail, "type changed from string to object");

        let err = compare_documents(&v1, &v2, &h1, &c2).unwrap_err();
        assert!(matches!(
            err,
            HistoryError::StructuralDiffGap { ref commit, ref path, .. } if commit == "c2" && path == "d.addr"
        ));
    }

    #[test]
    fn test_recreated_with_other_shape_is_a_gap() {
        let c1 = commit("c1", "alice", "2024-01-01T10:00:00+00:00");
        let c2 = commit("c2", "bob", "2024-01-02T10:00:00+00:00");
        let c3 = commit("c3", "carol", "2024-01-03T10:00:00+00:00");
        let v1 = map(json!({"d": {"x": {"y": 1}}}));
        let v2 = map(json!({"d": {}}));
        let v3 = map(json!({"d": {"x": 5}}));

        let h1 = compare_json(&Map::new(), &v1, &Map::new(), &c1).unwrap();
        let h2 = compare_json(&v1, &v2, &h1, &c2).unwrap();
        let gap = compare_json(&v2, &v3, &h2, &c3).unwrap_err();
        assert_eq!(gap.path, "d.x");
    }

    #[test]
    fn test_inputs_are_not_mutated() {
        let c1 = commit("c1", "alice", "2024-01-01T10:00:00+00:00");
        let old = map(json!({"d": {"a": 1}}));
        let new = map(json!({"d": {"a": 2, "b": {"c": null}}}));
        let history = compare_json(&Map::new(), &old, &Map::new(), &c1).unwrap();

        let (old_before, new_before, history_before) = (old.clone(), new.clone(), history.clone());
        let _ = compare_json(&old, &new, &history, &c1).unwrap();
        assert_eq!(old, old_before);
        assert_eq!(new, new_before);
        assert_eq!(history, history_before);
    }

    #[test]
    fn test_split_replay_equals_single_pass() {
        let commits = [
            commit("c0", "alice", "2024-01-01T10:00:00+00:00"),
            commit("c1", "bob", "2024-01-02T10:00:00+00:00"),
            commit("c2", "carol", "2024-01-03T10:00:00+00:00"),
            commit("c3", "alice", "2024-01-04T10:00:00+00:00"),
        ];
        let states = [
            map(json!({"p": {"name": "A", "tags": [1]}})),
            map(json!({"p": {"name": "B", "tags": [1], "addr": {"city": "X"}}})),
            map(json!({"p": {"name": "B", "addr": {"city": "Y"}}, "q": {"k": true}})),
            map(json!({"q": {"k": false}})),
        ];

        let replay = |from: usize, to: usize, start: Map<String, Value>| {
            let mut history = start;
            let mut previous = if from == 0 { Map::new() } else { states[from - 1].clone() };
            for i in from..=to {
                history = compare_json(&previous, &states[i], &history, &commits[i]).unwrap();
                previous = states[i].clone();
            }
            history
        };

        let full = replay(0, 3, Map::new());
        for k in 0..3 {
            let prefix = replay(0, k, Map::new());
            assert_eq!(replay(k + 1, 3, prefix), full, "split after commit {}", k);
        }
    }
}
