//! The owned container tree chronicle observes, and the equality rules used
//! throughout diff, undo, and merge.

use indexmap::{IndexMap, IndexSet};
use std::fmt;

/// A key usable in a `Map` or member of a `Set`. Arbitrary nested `Value`s
/// are not allowed here because they aren't cleanly `Eq + Hash`; restricting
/// collection keys to scalars keeps `Map`/`Set` backed by ordinary hash
/// collections instead of a hand-rolled structural-equality wrapper.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum ScalarKey {
    Null,
    Bool(bool),
    Integer(i64),
    String(String),
    /// A unique-identity key, addressed by a `Segment::Symbol`'s raw id.
    Symbol(u64),
}

impl fmt::Display for ScalarKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScalarKey::Null => write!(f, "null"),
            ScalarKey::Bool(b) => write!(f, "{}", b),
            ScalarKey::Integer(i) => write!(f, "{}", i),
            ScalarKey::String(s) => write!(f, "{}", s),
            ScalarKey::Symbol(id) => write!(f, "sym#{}", id),
        }
    }
}

/// The container abstraction a host graph is built from: a record (ordered
/// string-keyed fields), a sequence, a keyed map, a unique-value set, or a
/// scalar leaf.
#[derive(Clone, Debug)]
pub enum Value {
    Null,
    Bool(bool),
    Number(f64),
    String(String),
    Record(IndexMap<String, Value>),
    Sequence(Vec<Value>),
    Map(IndexMap<ScalarKey, Value>),
    Set(IndexSet<ScalarKey>),
}

impl Value {
    pub fn record() -> Self {
        Value::Record(IndexMap::new())
    }

    pub fn sequence() -> Self {
        Value::Sequence(Vec::new())
    }

    pub fn map() -> Self {
        Value::Map(IndexMap::new())
    }

    pub fn set() -> Self {
        Value::Set(IndexSet::new())
    }

    pub fn as_record(&self) -> Option<&IndexMap<String, Value>> {
        match self {
            Value::Record(m) => Some(m),
            _ => None,
        }
    }

    pub fn as_record_mut(&mut self) -> Option<&mut IndexMap<String, Value>> {
        match self {
            Value::Record(m) => Some(m),
            _ => None,
        }
    }

    pub fn as_sequence(&self) -> Option<&Vec<Value>> {
        match self {
            Value::Sequence(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_sequence_mut(&mut self) -> Option<&mut Vec<Value>> {
        match self {
            Value::Sequence(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&IndexMap<ScalarKey, Value>> {
        match self {
            Value::Map(m) => Some(m),
            _ => None,
        }
    }

    pub fn as_map_mut(&mut self) -> Option<&mut IndexMap<ScalarKey, Value>> {
        match self {
            Value::Map(m) => Some(m),
            _ => None,
        }
    }

    pub fn as_set(&self) -> Option<&IndexSet<ScalarKey>> {
        match self {
            Value::Set(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_set_mut(&mut self) -> Option<&mut IndexSet<ScalarKey>> {
        match self {
            Value::Set(s) => Some(s),
            _ => None,
        }
    }

    pub fn is_container(&self) -> bool {
        matches!(self, Value::Record(_) | Value::Sequence(_) | Value::Map(_) | Value::Set(_))
    }
}

impl From<ScalarKey> for Value {
    fn from(key: ScalarKey) -> Self {
        match key {
            ScalarKey::Null => Value::Null,
            ScalarKey::Bool(b) => Value::Bool(b),
            ScalarKey::Integer(i) => Value::Number(i as f64),
            ScalarKey::String(s) => Value::String(s),
            ScalarKey::Symbol(id) => Value::String(format!("sym#{}", id)),
        }
    }
}

/// Structural equality with NaN-aware number comparison (two NaNs are equal,
/// matching the default `compare` hook's contract so `diff` terminates and
/// `isPristine` is stable), order-sensitive sequences, and order-insensitive
/// records/maps/sets.
pub fn deep_eq(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Null, Value::Null) => true,
        (Value::Bool(x), Value::Bool(y)) => x == y,
        (Value::Number(x), Value::Number(y)) => x == y || (x.is_nan() && y.is_nan()),
        (Value::String(x), Value::String(y)) => x == y,
        (Value::Sequence(x), Value::Sequence(y)) => {
            x.len() == y.len() && x.iter().zip(y.iter()).all(|(a, b)| deep_eq(a, b))
        }
        (Value::Record(x), Value::Record(y)) => {
            x.len() == y.len() && x.iter().all(|(k, v)| y.get(k).map_or(false, |v2| deep_eq(v, v2)))
        }
        (Value::Map(x), Value::Map(y)) => {
            x.len() == y.len() && x.iter().all(|(k, v)| y.get(k).map_or(false, |v2| deep_eq(v, v2)))
        }
        (Value::Set(x), Value::Set(y)) => x.len() == y.len() && x.iter().all(|k| y.contains(k)),
        _ => false,
    }
}
