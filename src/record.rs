//! The change log: append-only [`ChangeRecord`]s, grouping, consecutive-set
//! compaction, and group-coherent trimming.

use crate::value::{ScalarKey, Value};
use chronicle_path::Path;
use std::collections::VecDeque;
use std::time::Instant;

/// Which of record/sequence mutation (`Set`/`Delete` at a path) or a
/// collection-method mutation (`collection`/`key` set) produced this record.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChangeKind {
    Set,
    Delete,
}

/// Whether a collection-method record came from a `Map` or a `Set`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CollectionKind {
    Map,
    Set,
}

/// One entry in the change log.
#[derive(Clone, Debug)]
pub struct ChangeRecord {
    pub path: Path,
    pub kind: ChangeKind,
    pub old_value: Option<Value>,
    pub new_value: Option<Value>,
    /// Only meaningful for `kind == Set`: did the property exist before.
    pub existed_before: bool,
    pub timestamp: Instant,
    pub group_id: u64,
    pub collection: Option<CollectionKind>,
    pub key: Option<ScalarKey>,
}

/// Supplies `record`'s timestamp. Production code uses [`crate::testing::SystemClock`]
/// (wall-clock `Instant::now`); tests inject a [`crate::testing::ManualClock`] so
/// `mergeWindowMs` behavior is deterministic.
pub trait Clock: std::fmt::Debug {
    fn now(&self) -> Instant;
}

/// The append-only record of every mutation applied to a root, subject to
/// compaction and trimming.
#[derive(Debug, Default)]
pub struct ChangeLog {
    entries: VecDeque<ChangeRecord>,
}

impl ChangeLog {
    pub fn new() -> Self {
        ChangeLog { entries: VecDeque::new() }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl DoubleEndedIterator<Item = &ChangeRecord> {
        self.entries.iter()
    }

    pub fn last(&self) -> Option<&ChangeRecord> {
        self.entries.back()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Appends `record`, then applies same-path compaction within the same
    /// group. Consecutive `Set`s to the same path in the same group are
    /// merged by keeping the first record's `old_value`/`existed_before` and
    /// the new record's `new_value`/`timestamp` — unless the path's last
    /// segment is an array index or the literal `"length"`, which are never
    /// compacted (array splices need every intermediate length change).
    pub fn push_with_compaction(&mut self, record: ChangeRecord, compact: bool) {
        if compact && self.should_compact(&record) {
            let prior = self.entries.back_mut().expect("should_compact implies a prior entry");
            prior.new_value = record.new_value;
            prior.timestamp = record.timestamp;
            return;
        }
        self.entries.push_back(record);
    }

    fn should_compact(&self, incoming: &ChangeRecord) -> bool {
        use chronicle_path::Segment;
        let prior = match self.entries.back() {
            Some(p) => p,
            None => return false,
        };
        if prior.group_id != incoming.group_id {
            return false;
        }
        if prior.kind != ChangeKind::Set || incoming.kind != ChangeKind::Set {
            return false;
        }
        if prior.path != incoming.path {
            return false;
        }
        // Collection-method records share the container's path across every
        // key; only compact when they're actually the same entry.
        if prior.collection.is_some() || incoming.collection.is_some() {
            return prior.collection == incoming.collection && prior.key == incoming.key;
        }
        match incoming.path.last() {
            Some(Segment::Index(_)) => false,
            Some(Segment::Key(k)) if k == "length" => false,
            _ => true,
        }
    }

    /// Drops whole groups from the front until `len() <= max`. Never splits
    /// a group: if the group at the trim boundary still has members beyond
    /// `max`, all of that group's remaining members are dropped too.
    pub fn trim_to(&mut self, max: usize) {
        if self.entries.len() <= max {
            return;
        }
        let excess = self.entries.len() - max;
        let boundary_group = self.entries[excess - 1].group_id;
        let mut cut = excess;
        while self.entries.get(cut).map_or(false, |r| r.group_id == boundary_group) {
            cut += 1;
        }
        self.entries.drain(0..cut);
    }

    /// Removes and returns the last `n` records, most-recent first (the
    /// order undo wants to apply them in).
    pub fn pop_last(&mut self, n: usize) -> Vec<ChangeRecord> {
        let n = n.min(self.entries.len());
        let mut out = Vec::with_capacity(n);
        for _ in 0..n {
            if let Some(r) = self.entries.pop_back() {
                out.push(r);
            }
        }
        out
    }

    /// Removes and returns every record from `marker` (a prior `len()`) to
    /// the end, most-recent first.
    pub fn pop_since(&mut self, marker: usize) -> Vec<ChangeRecord> {
        self.pop_last(self.entries.len().saturating_sub(marker))
    }

    /// Removes and returns the trailing `n` whole groups, most-recent first
    /// within each group reversed (suitable for direct undo application).
    pub fn pop_last_groups(&mut self, n: usize) -> Vec<ChangeRecord> {
        if n == 0 || self.entries.is_empty() {
            return Vec::new();
        }
        let mut groups_seen = 0;
        let mut cut = self.entries.len();
        let mut current_group = self.entries[cut - 1].group_id;
        groups_seen += 1;
        loop {
            if cut == 0 {
                break;
            }
            let gid = self.entries[cut - 1].group_id;
            if gid != current_group {
                groups_seen += 1;
                if groups_seen > n {
                    break;
                }
                current_group = gid;
            }
            cut -= 1;
        }
        self.pop_last(self.entries.len() - cut)
    }

    pub fn push(&mut self, record: ChangeRecord) {
        self.entries.push_back(record);
    }
}
