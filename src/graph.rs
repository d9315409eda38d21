//! Path-directed navigation and mutation of a [`Value`] tree: resolving a
//! path to its parent, synthesizing missing intermediates, and performing
//! splice-aware deletes on sequences so no sparse hole is ever left.

use crate::value::{ScalarKey, Value};
use chronicle_path::{Path, Segment};

/// A map's keys are `ScalarKey`; a path segment addressing one is always a
/// `Key` or `Symbol` (never an `Index` — maps aren't positional).
fn map_key(seg: &Segment) -> Option<ScalarKey> {
    match seg {
        Segment::Key(k) => Some(ScalarKey::String(k.clone())),
        Segment::Symbol(s) => Some(ScalarKey::Symbol(s.id())),
        Segment::Index(_) => None,
    }
}

/// Walks `root` along `path`, returning `None` if any intermediate segment
/// is missing or of the wrong container kind.
pub fn get_at<'a>(root: &'a Value, path: &Path) -> Option<&'a Value> {
    let mut cur = root;
    for seg in path.segments() {
        cur = step(cur, seg)?;
    }
    Some(cur)
}

fn step<'a>(cur: &'a Value, seg: &Segment) -> Option<&'a Value> {
    match cur {
        Value::Record(m) => match seg {
            Segment::Key(k) => m.get(k),
            _ => None,
        },
        Value::Sequence(s) => match seg {
            Segment::Index(i) => s.get(*i),
            _ => None,
        },
        Value::Map(m) => m.get(&map_key(seg)?),
        _ => None,
    }
}

/// Resolves `path` to `(parent, last segment)`. Returns `None` if `path` is
/// the root (no parent exists) or an intermediate is missing.
pub fn parent_and_key<'a, 'b>(root: &'a Value, path: &'b Path) -> Option<(&'a Value, &'b Segment)> {
    let parent_path = path.parent()?;
    let last = path.last()?;
    let parent = get_at(root, &parent_path)?;
    Some((parent, last))
}

pub(crate) fn parent_and_key_mut<'a>(root: &'a mut Value, path: &Path) -> Option<(&'a mut Value, Segment)> {
    let parent_path = path.parent()?;
    let last = path.last()?.clone();
    let parent = get_at_mut(root, &parent_path)?;
    Some((parent, last))
}

pub(crate) fn get_at_mut<'a>(root: &'a mut Value, path: &Path) -> Option<&'a mut Value> {
    let mut cur = root;
    for seg in path.segments() {
        cur = step_mut(cur, seg)?;
    }
    Some(cur)
}

fn step_mut<'a>(cur: &'a mut Value, seg: &Segment) -> Option<&'a mut Value> {
    match cur {
        Value::Record(m) => match seg {
            Segment::Key(k) => m.get_mut(k),
            _ => None,
        },
        Value::Sequence(s) => match seg {
            Segment::Index(i) => s.get_mut(*i),
            _ => None,
        },
        Value::Map(m) => m.get_mut(&map_key(seg)?),
        _ => None,
    }
}

/// Materializes every missing intermediate container along `path` (not
/// including the final segment's value itself). A missing intermediate is a
/// `Sequence` if the *next* segment looks like an index, otherwise a
/// `Record`.
pub fn ensure_parents(root: &mut Value, path: &Path) {
    let segments = path.segments();
    if segments.is_empty() {
        return;
    }
    let mut cur = root;
    for i in 0..segments.len() - 1 {
        let seg = &segments[i];
        let next_is_index = matches!(segments[i + 1], Segment::Index(_));
        cur = ensure_child(cur, seg, next_is_index);
    }
}

fn ensure_child<'a>(cur: &'a mut Value, seg: &Segment, child_is_sequence: bool) -> &'a mut Value {
    let blank = || if child_is_sequence { Value::sequence() } else { Value::record() };
    match seg {
        Segment::Index(i) => {
            if !matches!(cur, Value::Sequence(_)) {
                *cur = Value::sequence();
            }
            let seq = cur.as_sequence_mut().unwrap();
            while seq.len() <= *i {
                seq.push(Value::Null);
            }
            &mut seq[*i]
        }
        Segment::Key(_) | Segment::Symbol(_) => {
            if !matches!(cur, Value::Record(_) | Value::Map(_)) {
                // A record can't hold a symbol-keyed entry, so a fresh
                // intermediate under a symbol segment starts life as a map.
                *cur = if matches!(seg, Segment::Symbol(_)) { Value::map() } else { Value::record() };
            }
            match (cur, seg) {
                (Value::Record(m), Segment::Key(k)) => m.entry(k.clone()).or_insert_with(blank),
                (Value::Map(m), _) => {
                    let key = map_key(seg).expect("Key/Symbol segments always yield a ScalarKey");
                    m.entry(key).or_insert_with(blank)
                }
                _ => unreachable!("just normalized to Record or Map, and Record only takes Key"),
            }
        }
    }
}

/// Sets the value at `path`, synthesizing missing parents first. Returns
/// whether the property previously existed (needed by the recorder to
/// choose delete-vs-set on undo).
pub fn set_at(root: &mut Value, path: &Path, new_value: Value) -> bool {
    ensure_parents(root, path);
    match parent_and_key_mut(root, path) {
        Some((Value::Record(m), Segment::Key(k))) => {
            let existed = m.contains_key(&k);
            m.insert(k, new_value);
            existed
        }
        Some((Value::Sequence(s), Segment::Index(i))) => {
            let existed = i < s.len();
            while s.len() <= i {
                s.push(Value::Null);
            }
            s[i] = new_value;
            existed
        }
        Some((Value::Map(m), seg)) => match map_key(&seg) {
            Some(key) => {
                let existed = m.contains_key(&key);
                m.insert(key, new_value);
                existed
            }
            None => false,
        },
        _ => false,
    }
}

/// Inserts `value` at `path`, splicing it into a sequence (shifting later
/// elements up) rather than overwriting — the inverse of [`delete_at`]'s
/// splice-aware removal. On records and maps this is equivalent to
/// [`set_at`].
pub fn insert_at(root: &mut Value, path: &Path, value: Value) {
    ensure_parents(root, path);
    match parent_and_key_mut(root, path) {
        Some((Value::Sequence(s), Segment::Index(i))) => {
            let i = i.min(s.len());
            s.insert(i, value);
        }
        Some((Value::Record(m), Segment::Key(k))) => {
            m.insert(k, value);
        }
        Some((Value::Map(m), seg)) => {
            if let Some(key) = map_key(&seg) {
                m.insert(key, value);
            }
        }
        _ => {}
    }
}

/// Deletes the value at `path`. On a sequence this removes the element by
/// splice (shifting later elements down), never leaving a hole. Returns the
/// removed value, if any.
pub fn delete_at(root: &mut Value, path: &Path) -> Option<Value> {
    let (parent, seg) = parent_and_key_mut(root, path)?;
    match (parent, seg) {
        (Value::Record(m), Segment::Key(k)) => m.shift_remove(&k),
        (Value::Sequence(s), Segment::Index(i)) => {
            if i < s.len() {
                Some(s.remove(i))
            } else {
                None
            }
        }
        (Value::Map(m), seg) => map_key(&seg).and_then(|key| m.shift_remove(&key)),
        _ => None,
    }
}

/// Resolves `path` to a container of the requested kind, synthesizing it
/// (and every missing ancestor) if needed. Used by `push`/`map_set`/
/// `set_add` and friends, which must be able to start a collection from
/// nothing the way `set_at` starts a scalar from nothing.
fn ensure_container_at<'a>(
    root: &'a mut Value,
    path: &Path,
    make: fn() -> Value,
    is_kind: fn(&Value) -> bool,
) -> &'a mut Value {
    if path.is_empty() {
        if !is_kind(root) {
            *root = make();
        }
        return root;
    }
    ensure_parents(root, path);
    let (parent, seg) = parent_and_key_mut(root, path).expect("ensure_parents just created every ancestor");
    let slot: &mut Value = match (parent, &seg) {
        (Value::Record(m), Segment::Key(k)) => m.entry(k.clone()).or_insert_with(make),
        (Value::Map(m), _) => {
            let key = map_key(&seg).expect("Key/Symbol segments always yield a ScalarKey");
            m.entry(key).or_insert_with(make)
        }
        (Value::Sequence(s), Segment::Index(i)) => {
            while s.len() <= *i {
                s.push(Value::Null);
            }
            &mut s[*i]
        }
        _ => unreachable!("ensure_parents guarantees the parent is a Record, Map, or Sequence"),
    };
    if !is_kind(slot) {
        *slot = make();
    }
    slot
}

/// Resolves `path` to a `Sequence`, synthesizing it (and its ancestors) if
/// missing or of the wrong kind.
pub fn ensure_sequence_at<'a>(root: &'a mut Value, path: &Path) -> &'a mut Vec<Value> {
    ensure_container_at(root, path, Value::sequence, |v| matches!(v, Value::Sequence(_)))
        .as_sequence_mut()
        .expect("just ensured Sequence")
}

/// Resolves `path` to a `Map`, synthesizing it (and its ancestors) if
/// missing or of the wrong kind.
pub fn ensure_map_at<'a>(root: &'a mut Value, path: &Path) -> &'a mut indexmap::IndexMap<ScalarKey, Value> {
    ensure_container_at(root, path, Value::map, |v| matches!(v, Value::Map(_)))
        .as_map_mut()
        .expect("just ensured Map")
}

/// Resolves `path` to a `Set`, synthesizing it (and its ancestors) if
/// missing or of the wrong kind.
pub fn ensure_set_at<'a>(root: &'a mut Value, path: &Path) -> &'a mut indexmap::IndexSet<ScalarKey> {
    ensure_container_at(root, path, Value::set, |v| matches!(v, Value::Set(_)))
        .as_set_mut()
        .expect("just ensured Set")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ensure_parents_synthesizes_sequence_when_next_is_index() {
        let mut root = Value::record();
        let path = Path::root().child(Segment::Key("items".into())).child(Segment::Index(0));
        ensure_parents(&mut root, &path);
        assert!(matches!(
            root.as_record().unwrap().get("items"),
            Some(Value::Sequence(_))
        ));
    }

    #[test]
    fn delete_at_sequence_index_leaves_no_hole() {
        let mut root = Value::Sequence(vec![Value::Number(1.0), Value::Number(2.0), Value::Number(3.0)]);
        let path = Path::root().child(Segment::Index(1));
        let removed = delete_at(&mut root, &path);
        assert!(matches!(removed, Some(Value::Number(n)) if n == 2.0));
        assert_eq!(root.as_sequence().unwrap().len(), 2);
    }

    #[test]
    fn set_at_reports_whether_property_existed() {
        let mut root = Value::record();
        let path = Path::root().child(Segment::Key("a".into()));
        let existed_first = set_at(&mut root, &path, Value::Number(1.0));
        let existed_second = set_at(&mut root, &path, Value::Number(2.0));
        assert!(!existed_first);
        assert!(existed_second);
    }
}
