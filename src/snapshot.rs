//! Deep clone (honoring the `clone` hook) and structural diff (honoring the
//! `compare` and `diffFilter` hooks) between two [`Value`] trees.

use crate::options::{DiffScope, Options};
use crate::value::{deep_eq, Value};
use chronicle_path::{Path, Segment};

pub fn snapshot(value: &Value, options: &Options) -> Value {
    if let Some(hook) = &options.clone_hook {
        return hook(value);
    }
    clone_value(value)
}

fn clone_value(value: &Value) -> Value {
    match value {
        Value::Null => Value::Null,
        Value::Bool(b) => Value::Bool(*b),
        Value::Number(n) => Value::Number(*n),
        Value::String(s) => Value::String(s.clone()),
        Value::Record(m) => Value::Record(m.iter().map(|(k, v)| (k.clone(), clone_value(v))).collect()),
        Value::Sequence(s) => Value::Sequence(s.iter().map(clone_value).collect()),
        Value::Map(m) => Value::Map(m.iter().map(|(k, v)| (k.clone(), clone_value(v))).collect()),
        Value::Set(s) => Value::Set(s.iter().cloned().collect()),
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DiffKind {
    Added,
    Removed,
    Changed,
}

#[derive(Clone, Debug)]
pub struct DiffRecord {
    pub path: Path,
    pub kind: DiffKind,
    pub old_value: Option<Value>,
    pub new_value: Option<Value>,
}

fn values_equal(a: &Value, b: &Value, path: &Path, options: &Options) -> bool {
    if let Some(hook) = &options.compare_hook {
        hook(a, b)
    } else {
        let _ = path;
        deep_eq(a, b)
    }
}

/// Structural diff from `base` to `current`, scoped by `options.diff_filter`.
pub fn diff(base: &Value, current: &Value, options: &Options) -> Vec<DiffRecord> {
    let mut out = Vec::new();
    diff_at(base, current, &Path::root(), options, &mut out);
    out
}

fn diff_at(base: &Value, current: &Value, path: &Path, options: &Options, out: &mut Vec<DiffRecord>) {
    let scope = options.diff_filter.as_ref().map(|f| f(path)).unwrap_or(DiffScope::Recurse);
    if scope == DiffScope::Skip {
        return;
    }

    if values_equal(base, current, path, options) {
        return;
    }

    if scope == DiffScope::Shallow {
        out.push(DiffRecord {
            path: path.clone(),
            kind: DiffKind::Changed,
            old_value: Some(base.clone()),
            new_value: Some(current.clone()),
        });
        return;
    }

    match (base, current) {
        (Value::Record(a), Value::Record(b)) => {
            for (k, v) in a {
                let child_path = path.child(Segment::Key(k.clone()));
                match b.get(k) {
                    Some(v2) => diff_at(v, v2, &child_path, options, out),
                    None => out.push(DiffRecord {
                        path: child_path,
                        kind: DiffKind::Removed,
                        old_value: Some(v.clone()),
                        new_value: None,
                    }),
                }
            }
            for (k, v) in b {
                if !a.contains_key(k) {
                    out.push(DiffRecord {
                        path: path.child(Segment::Key(k.clone())),
                        kind: DiffKind::Added,
                        old_value: None,
                        new_value: Some(v.clone()),
                    });
                }
            }
        }
        (Value::Sequence(a), Value::Sequence(b)) => {
            let max = a.len().max(b.len());
            for i in 0..max {
                let child_path = path.child(Segment::Index(i));
                match (a.get(i), b.get(i)) {
                    (Some(v1), Some(v2)) => diff_at(v1, v2, &child_path, options, out),
                    (Some(v1), None) => out.push(DiffRecord {
                        path: child_path,
                        kind: DiffKind::Removed,
                        old_value: Some(v1.clone()),
                        new_value: None,
                    }),
                    (None, Some(v2)) => out.push(DiffRecord {
                        path: child_path,
                        kind: DiffKind::Added,
                        old_value: None,
                        new_value: Some(v2.clone()),
                    }),
                    (None, None) => unreachable!(),
                }
            }
        }
        (Value::Map(a), Value::Map(b)) => {
            for (k, v) in a {
                let child_path = path.child(key_segment(k));
                match b.get(k) {
                    Some(v2) => diff_at(v, v2, &child_path, options, out),
                    None => out.push(DiffRecord {
                        path: child_path,
                        kind: DiffKind::Removed,
                        old_value: Some(v.clone()),
                        new_value: None,
                    }),
                }
            }
            for (k, v) in b {
                if !a.contains_key(k) {
                    out.push(DiffRecord {
                        path: path.child(key_segment(k)),
                        kind: DiffKind::Added,
                        old_value: None,
                        new_value: Some(v.clone()),
                    });
                }
            }
        }
        _ => out.push(DiffRecord {
            path: path.clone(),
            kind: DiffKind::Changed,
            old_value: Some(base.clone()),
            new_value: Some(current.clone()),
        }),
    }
}

fn key_segment(key: &crate::value::ScalarKey) -> Segment {
    use crate::value::ScalarKey;
    match key {
        ScalarKey::String(s) => Segment::Key(s.clone()),
        other => Segment::Key(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use indexmap::IndexMap;

    #[test]
    fn snapshot_is_independent_of_source_mutation() {
        let options = Options::default();
        let mut record = IndexMap::new();
        record.insert("a".to_string(), Value::Number(1.0));
        let original = Value::Record(record);
        let snap = snapshot(&original, &options);
        if let Value::Record(snap_map) = &snap {
            assert!(matches!(snap_map.get("a"), Some(Value::Number(n)) if *n == 1.0));
        } else {
            panic!("expected record");
        }
    }

    #[test]
    fn diff_reports_changed_added_removed() {
        let options = Options::default();
        let mut a = IndexMap::new();
        a.insert("x".to_string(), Value::Number(1.0));
        a.insert("y".to_string(), Value::Number(2.0));
        let mut b = IndexMap::new();
        b.insert("x".to_string(), Value::Number(10.0));
        b.insert("z".to_string(), Value::Number(3.0));

        let records = diff(&Value::Record(a), &Value::Record(b), &options);
        let kinds: Vec<_> = records.iter().map(|r| r.kind).collect();
        assert!(kinds.contains(&DiffKind::Changed));
        assert!(kinds.contains(&DiffKind::Added));
        assert!(kinds.contains(&DiffKind::Removed));
    }

    #[test]
    fn diff_of_equal_trees_is_empty() {
        let options = Options::default();
        let a = Value::Number(1.0);
        let b = Value::Number(1.0);
        assert!(diff(&a, &b, &options).is_empty());
    }
}
