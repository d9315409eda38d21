//! Replays a [`ChangeRecord`] in reverse (undo) or forward (redo) against an
//! owned [`Value`] tree, rebuilding missing parents and splicing sequences
//! as needed.
//!
//! Any step that can't be carried out (an expected parent or collection is
//! missing, or has changed kind) is an [`InvariantViolation`][crate::error::ChronicleError]
//! in spec terms: it is logged and skipped rather than propagated, so a
//! partially-diverged graph doesn't abort the rest of an undo/redo batch.

use crate::graph;
use crate::record::{ChangeKind, ChangeRecord, CollectionKind};
use crate::value::Value;

/// Undoes one record: the inverse of however it was originally applied.
pub fn apply_backward(root: &mut Value, record: &ChangeRecord) {
    if let Some(collection) = record.collection {
        apply_backward_collection(root, record, collection);
        return;
    }

    match record.kind {
        ChangeKind::Set if !record.existed_before => {
            graph::delete_at(root, &record.path);
        }
        ChangeKind::Set => match record.old_value.clone() {
            Some(old) => {
                graph::ensure_parents(root, &record.path);
                graph::set_at(root, &record.path, old);
            }
            None => warn_invariant("undo of Set missing old_value", record),
        },
        ChangeKind::Delete => match record.old_value.clone() {
            Some(old) => {
                graph::ensure_parents(root, &record.path);
                graph::insert_at(root, &record.path, old);
            }
            None => warn_invariant("undo of Delete missing old_value", record),
        },
    }
}

/// Re-applies one record forward, as redo does. Always stamps a fresh group
/// and timestamp on the caller's side; this only touches the graph.
pub fn apply_forward(root: &mut Value, record: &ChangeRecord) {
    if let Some(collection) = record.collection {
        apply_forward_collection(root, record, collection);
        return;
    }

    match record.kind {
        ChangeKind::Set => match record.new_value.clone() {
            Some(new) => {
                graph::ensure_parents(root, &record.path);
                graph::set_at(root, &record.path, new);
            }
            None => warn_invariant("redo of Set missing new_value", record),
        },
        ChangeKind::Delete => {
            graph::delete_at(root, &record.path);
        }
    }
}

fn apply_backward_collection(root: &mut Value, record: &ChangeRecord, collection: CollectionKind) {
    let key = match &record.key {
        Some(k) => k.clone(),
        None => return warn_invariant("collection record missing key", record),
    };
    let container = match graph::get_at_mut(root, &record.path) {
        Some(v) => v,
        None => return warn_invariant("collection missing at path during undo", record),
    };

    match (collection, container) {
        (CollectionKind::Map, Value::Map(m)) => match record.kind {
            ChangeKind::Set if !record.existed_before => {
                m.shift_remove(&key);
            }
            ChangeKind::Set | ChangeKind::Delete => {
                if let Some(old) = record.old_value.clone() {
                    m.insert(key, old);
                } else {
                    warn_invariant("undo of map entry missing old_value", record);
                }
            }
        },
        (CollectionKind::Set, Value::Set(s)) => match record.kind {
            ChangeKind::Set if !record.existed_before => {
                s.shift_remove(&key);
            }
            ChangeKind::Set | ChangeKind::Delete => {
                s.insert(key);
            }
        },
        _ => warn_invariant("collection kind mismatch during undo", record),
    }
}

fn apply_forward_collection(root: &mut Value, record: &ChangeRecord, collection: CollectionKind) {
    let key = match &record.key {
        Some(k) => k.clone(),
        None => return warn_invariant("collection record missing key", record),
    };
    let container = match graph::get_at_mut(root, &record.path) {
        Some(v) => v,
        None => return warn_invariant("collection missing at path during redo", record),
    };

    match (collection, container) {
        (CollectionKind::Map, Value::Map(m)) => match record.kind {
            ChangeKind::Set => {
                if let Some(new) = record.new_value.clone() {
                    m.insert(key, new);
                }
            }
            ChangeKind::Delete => {
                m.shift_remove(&key);
            }
        },
        (CollectionKind::Set, Value::Set(s)) => match record.kind {
            ChangeKind::Set => {
                s.insert(key);
            }
            ChangeKind::Delete => {
                s.shift_remove(&key);
            }
        },
        _ => warn_invariant("collection kind mismatch during redo", record),
    }
}

fn warn_invariant(message: &str, record: &ChangeRecord) {
    tracing::warn!(path = %record.path, "invariant violation: {}", message);
}

#[cfg(test)]
mod tests {
    use super::*;
    use chronicle_path::{Path, Segment};
    use indexmap::IndexMap;
    use std::time::Instant;

    fn rec(path: Path, kind: ChangeKind, old: Option<Value>, new: Option<Value>, existed_before: bool) -> ChangeRecord {
        ChangeRecord {
            path,
            kind,
            old_value: old,
            new_value: new,
            existed_before,
            timestamp: Instant::now(),
            group_id: 1,
            collection: None,
            key: None,
        }
    }

    #[test]
    fn undo_of_new_property_deletes_it() {
        let mut root = Value::Record(IndexMap::new());
        let path = Path::root().child(Segment::Key("a".into()));
        graph::set_at(&mut root, &path, Value::Number(1.0));
        let record = rec(path.clone(), ChangeKind::Set, None, Some(Value::Number(1.0)), false);
        apply_backward(&mut root, &record);
        assert!(graph::get_at(&root, &path).is_none());
    }

    #[test]
    fn undo_of_overwrite_restores_old_value() {
        let mut root = Value::Record(IndexMap::new());
        let path = Path::root().child(Segment::Key("a".into()));
        graph::set_at(&mut root, &path, Value::Number(2.0));
        let record = rec(path.clone(), ChangeKind::Set, Some(Value::Number(1.0)), Some(Value::Number(2.0)), true);
        apply_backward(&mut root, &record);
        assert!(matches!(graph::get_at(&root, &path), Some(Value::Number(n)) if *n == 1.0));
    }

    #[test]
    fn undo_of_sequence_delete_reinserts_without_overwrite() {
        let mut root = Value::Sequence(vec![Value::Number(1.0), Value::Number(3.0)]);
        let path = Path::root().child(Segment::Index(1));
        let record = rec(path, ChangeKind::Delete, Some(Value::Number(2.0)), None, false);
        apply_backward(&mut root, &record);
        let seq = root.as_sequence().unwrap();
        assert_eq!(seq.len(), 3);
        assert!(matches!(seq[1], Value::Number(n) if n == 2.0));
    }
}
