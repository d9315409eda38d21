//! The listener trie: a path-indexed structure of subscriber buckets per
//! mode (`exact`, `up`, `down`), plus a global bucket, from which the set of
//! listeners affected by a change at a given path (its *affinity set*) is
//! computed fresh per change.

use chronicle_path::{Path, Segment};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SubscriberId(u64);

static NEXT_SUBSCRIBER_ID: AtomicU64 = AtomicU64::new(1);

impl SubscriberId {
    fn fresh() -> Self {
        SubscriberId(NEXT_SUBSCRIBER_ID.fetch_add(1, Ordering::Relaxed))
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Mode {
    Exact,
    Up,
    Down,
}

#[derive(Default)]
struct Node {
    children: HashMap<Segment, Node>,
    exact: HashSet<SubscriberId>,
    down: HashSet<SubscriberId>,
    up: HashSet<SubscriberId>,
}

impl Node {
    fn bucket_mut(&mut self, mode: Mode) -> &mut HashSet<SubscriberId> {
        match mode {
            Mode::Exact => &mut self.exact,
            Mode::Down => &mut self.down,
            Mode::Up => &mut self.up,
        }
    }

    fn is_empty(&self) -> bool {
        self.children.is_empty() && self.exact.is_empty() && self.down.is_empty() && self.up.is_empty()
    }
}

/// Where a subscriber was registered, so `unsubscribe` can find and prune it.
enum Location {
    Global,
    AtPath(Path, Mode),
}

#[derive(Default)]
pub struct ListenerTrie {
    root: Node,
    globals: HashSet<SubscriberId>,
    locations: HashMap<SubscriberId, Location>,
}

impl ListenerTrie {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&mut self, path: &Path, mode: Mode) -> SubscriberId {
        let id = SubscriberId::fresh();
        let node = self.node_mut(path);
        node.bucket_mut(mode).insert(id);
        self.locations.insert(id, Location::AtPath(path.clone(), mode));
        id
    }

    pub fn subscribe_global(&mut self) -> SubscriberId {
        let id = SubscriberId::fresh();
        self.globals.insert(id);
        self.locations.insert(id, Location::Global);
        id
    }

    /// Idempotent: unsubscribing an already-removed or unknown id is a no-op.
    pub fn unsubscribe(&mut self, id: SubscriberId) {
        match self.locations.remove(&id) {
            None => {}
            Some(Location::Global) => {
                self.globals.remove(&id);
            }
            Some(Location::AtPath(path, mode)) => {
                remove_at(&mut self.root, path.segments(), mode, id);
            }
        }
    }

    fn node_mut(&mut self, path: &Path) -> &mut Node {
        let mut node = &mut self.root;
        for seg in path.segments() {
            node = node.children.entry(seg.clone()).or_insert_with(Node::default);
        }
        node
    }

    /// The subscribers that must be notified of a change at `path`, in
    /// delivery order: globals, then `down` listeners at every prefix of
    /// `path` (root through `path` itself), then `exact` listeners at
    /// `path`, then `up` listeners anywhere strictly below `path` in the
    /// trie. Each subscription contributes at most one id, so no dedup is
    /// needed across categories.
    pub fn affinity(&self, path: &Path) -> Vec<SubscriberId> {
        let mut out: Vec<SubscriberId> = self.globals.iter().copied().collect();
        let mut node = &self.root;
        out.extend(node.down.iter().copied());

        let mut reached = true;
        for seg in path.segments() {
            match node.children.get(seg) {
                Some(child) => {
                    node = child;
                    out.extend(node.down.iter().copied());
                }
                None => {
                    reached = false;
                    break;
                }
            }
        }

        if reached {
            out.extend(node.exact.iter().copied());
            collect_up_descendants(node, &mut out);
        }

        out
    }
}

fn collect_up_descendants(node: &Node, out: &mut Vec<SubscriberId>) {
    for child in node.children.values() {
        out.extend(child.up.iter().copied());
        collect_up_descendants(child, out);
    }
}

/// Removes `id` from `mode`'s bucket at the node reached by `segments`, then
/// prunes every node from there back to the root that is left empty.
fn remove_at(node: &mut Node, segments: &[Segment], mode: Mode, id: SubscriberId) -> bool {
    if let Some((first, rest)) = segments.split_first() {
        if let Some(child) = node.children.get_mut(first) {
            if remove_at(child, rest, mode, id) {
                node.children.remove(first);
            }
        }
    } else {
        node.bucket_mut(mode).remove(&id);
    }
    node.is_empty()
}
