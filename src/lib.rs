//! Chronicle: an in-process state-observation engine. A [`Chronicle`] wraps
//! an owned [`Value`] graph and intercepts every mutation made through its
//! API, maintaining a change log, dispatching to path-scoped listeners, and
//! offering undo/redo, batch/transaction grouping, snapshot/diff, and
//! three-way merge on top of that log.
//!
//! The pieces are deliberately small and composable, mirroring how this
//! crate's own dependency graph is assembled: [`value`] is the container
//! model, [`graph`] is path-directed navigation/mutation over it, [`record`]
//! and [`group`] are the change log and its grouping policy, [`trie`] and
//! [`dispatch`] are the listener fabric, [`batch`] is the frame stack,
//! [`inverse`] replays records for undo/redo, [`snapshot`] and [`merge`]
//! round out diff and three-way merge. This module is only the glue.

mod batch;
mod dispatch;
mod error;
mod graph;
mod group;
mod inverse;
mod merge;
mod options;
mod record;
mod snapshot;
pub mod testing;
mod trie;
mod value;

pub use batch::BatchFrame;
pub use chronicle_path::{Path, Segment, Symbol};
pub use dispatch::{DeliveryMeta, ImmediateScheduler, Listener, ListenerOptions, Schedule, Scheduler};
pub use error::ChronicleError;
pub use merge::{Conflict, MergePlan, Resolution};
pub use options::{DiffScope, Options, OptionsBuilder};
pub use record::{ChangeKind, ChangeRecord, Clock, CollectionKind};
pub use snapshot::{DiffKind, DiffRecord};
pub use trie::Mode;
pub use value::{deep_eq, ScalarKey, Value};

use batch::BatchStack;
use dispatch::Dispatcher;
use group::GroupTracker;
use record::ChangeLog;
use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;
use trie::SubscriberId;

/// All state behind one wrapped root. Every field is independently
/// interior-mutable rather than the whole struct living behind one
/// `RefCell`, so a listener callback that mutates the graph mid-dispatch
/// only ever re-borrows fields the outer call has already released — see
/// `dispatch::Dispatcher`'s module doc for the same discipline applied one
/// level down.
struct ChronicleState {
    root: RefCell<Value>,
    options: RefCell<Options>,
    log: RefCell<ChangeLog>,
    redo: RefCell<Vec<ChangeRecord>>,
    dispatcher: Dispatcher,
    groups: RefCell<GroupTracker>,
    batches: RefCell<BatchStack>,
    pristine: RefCell<Option<Value>>,
    clock: Box<dyn Clock>,
    scheduler: Box<dyn Scheduler>,
    handle_cache: RefCell<chronicle_registry::HandleCache<Rc<Handle>>>,
}

/// A cheaply-cloned handle to a wrapped root. Cloning shares the same
/// underlying state (an `Rc`); there is exactly one `Chronicle` identity per
/// call to [`Chronicle::wrap`], no matter how many clones exist.
#[derive(Clone)]
pub struct Chronicle {
    state: Rc<ChronicleState>,
}

/// A cached, path-addressed view onto a [`Chronicle`]. Two calls to
/// [`Chronicle::at`] with the same path return the same `Rc<Handle>` (and so
/// compare equal under `Rc::ptr_eq`) as long as `cache_proxies` stays on and
/// nothing at or above that path has been invalidated by a mutation —
/// standing in for "wrapping the same sub-object twice returns the same
/// proxy" in a host without a weak-map-keyed registry.
pub struct Handle {
    chronicle: Chronicle,
    path: Path,
}

impl Handle {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn get(&self) -> Option<Value> {
        self.chronicle.get(&self.path)
    }

    pub fn set(&self, value: Value) {
        self.chronicle.set(&self.path, value)
    }

    pub fn delete(&self) -> Option<Value> {
        self.chronicle.delete(&self.path)
    }

    pub fn child(&self, segment: Segment) -> Rc<Handle> {
        self.chronicle.at(self.path.child(segment))
    }
}

/// The result of a `transaction`: the action's return value, the log
/// marker recorded when the transaction opened, and a one-shot closure that
/// undoes exactly what the transaction did.
pub struct TransactionOutcome<R> {
    pub result: R,
    pub marker: usize,
    undo: Box<dyn FnOnce()>,
}

impl<R> TransactionOutcome<R> {
    /// Undoes this transaction: `undoGroups(1)` if its group is still the
    /// most recent thing in the log, otherwise `undoSince(marker)` to avoid
    /// clawing back unrelated changes recorded after it.
    pub fn undo(self) {
        (self.undo)()
    }
}

/// The outcome of a [`Chronicle::merge`] call.
#[derive(Debug)]
pub struct MergeOutcome {
    pub success: bool,
    pub conflicts: Vec<Conflict>,
    pub applied: usize,
}

impl Chronicle {
    /// Wraps `root`, capturing it as the pristine snapshot, with default
    /// options.
    pub fn wrap(root: Value) -> Self {
        Self::wrap_with(root, Options::default())
    }

    /// Wraps `root` with explicit `options`.
    pub fn wrap_with(root: Value, options: Options) -> Self {
        Self::wrap_internal(root, options, Box::new(testing::SystemClock), Box::new(ImmediateScheduler))
    }

    /// Wraps `root` with an injected clock and scheduler, so tests can
    /// control `mergeWindowMs`/debounce/throttle timing and scheduled
    /// delivery deterministically (see [`testing`]).
    pub fn wrap_for_testing(root: Value, options: Options, clock: Box<dyn Clock>, scheduler: Box<dyn Scheduler>) -> Self {
        Self::wrap_internal(root, options, clock, scheduler)
    }

    fn wrap_internal(root: Value, options: Options, clock: Box<dyn Clock>, scheduler: Box<dyn Scheduler>) -> Self {
        let pristine = snapshot::snapshot(&root, &options);
        let state = ChronicleState {
            root: RefCell::new(root),
            options: RefCell::new(options),
            log: RefCell::new(ChangeLog::new()),
            redo: RefCell::new(Vec::new()),
            dispatcher: Dispatcher::new(),
            groups: RefCell::new(GroupTracker::new()),
            batches: RefCell::new(BatchStack::new()),
            pristine: RefCell::new(Some(pristine)),
            clock,
            scheduler,
            handle_cache: RefCell::new(chronicle_registry::HandleCache::new()),
        };
        Chronicle { state: Rc::new(state) }
    }

    /// Replaces this root's configuration wholesale.
    pub fn configure(&self, options: Options) {
        *self.state.options.borrow_mut() = options;
    }

    // -- Reads -----------------------------------------------------------

    pub fn get(&self, path: &Path) -> Option<Value> {
        graph::get_at(&self.state.root.borrow(), path).cloned()
    }

    /// A deep clone of the whole observed graph.
    pub fn unwrap(&self) -> Value {
        self.state.root.borrow().clone()
    }

    /// A cached, path-addressed handle onto this root (see [`Handle`]).
    pub fn at(&self, path: Path) -> Rc<Handle> {
        if !self.state.options.borrow().cache_proxies {
            return Rc::new(Handle { chronicle: self.clone(), path });
        }
        let key = path.cache_key();
        if let Some(existing) = self.state.handle_cache.borrow().get(&key) {
            return existing.clone();
        }
        let handle = Rc::new(Handle { chronicle: self.clone(), path: path.clone() });
        self.state.handle_cache.borrow_mut().insert(key, handle.clone());
        handle
    }

    // -- Mutation ----------------------------------------------------------

    /// Sets the value at `path`, creating intermediate containers as
    /// needed, and records/dispatches a `Set`.
    pub fn set(&self, path: &Path, value: Value) {
        let old = graph::get_at(&self.state.root.borrow(), path).cloned();
        let existed_before = graph::set_at(&mut self.state.root.borrow_mut(), path, value.clone());
        self.record_and_dispatch(path.clone(), ChangeKind::Set, old, Some(value), existed_before, None, None);
    }

    /// Deletes the value at `path`. A no-op (no record, no dispatch) if
    /// nothing was there.
    pub fn delete(&self, path: &Path) -> Option<Value> {
        let old = graph::delete_at(&mut self.state.root.borrow_mut(), path);
        if let Some(v) = &old {
            self.record_and_dispatch(path.clone(), ChangeKind::Delete, Some(v.clone()), None, false, None, None);
        }
        old
    }

    /// Appends `value` to the sequence at `path` (synthesizing an empty
    /// sequence there first if needed), recording the append as a `Set` at
    /// the new index with `existed_before: false` — undoing it is therefore
    /// a hole-free splice-delete, not a sparse overwrite.
    pub fn push(&self, path: &Path, value: Value) {
        let index = {
            let mut root = self.state.root.borrow_mut();
            let seq = graph::ensure_sequence_at(&mut root, path);
            seq.push(value.clone());
            seq.len() - 1
        };
        let child = path.child(Segment::Index(index));
        self.record_and_dispatch(child, ChangeKind::Set, None, Some(value), false, None, None);
    }

    /// Removes and returns the last element of the sequence at `path`, if
    /// any, recording a `Delete` at its index.
    pub fn pop(&self, path: &Path) -> Option<Value> {
        let (removed, index) = {
            let mut root = self.state.root.borrow_mut();
            let seq = graph::get_at_mut(&mut root, path)?.as_sequence_mut()?;
            let removed = seq.pop()?;
            (removed, seq.len())
        };
        let child = path.child(Segment::Index(index));
        self.record_and_dispatch(child, ChangeKind::Delete, Some(removed.clone()), None, false, None, None);
        Some(removed)
    }

    /// Shrinks the sequence at `path` to `new_len`, synthesizing one
    /// `Delete` record per removed index (highest index first, no
    /// compaction) under a single shared group, matching how a splice-style
    /// array shrink is observed one element at a time. Returns the removed
    /// elements in their original order.
    pub fn truncate(&self, path: &Path, new_len: usize) -> Vec<Value> {
        let removed: Vec<Value> = {
            let mut root = self.state.root.borrow_mut();
            match graph::get_at_mut(&mut root, path).and_then(Value::as_sequence_mut) {
                Some(seq) if seq.len() > new_len => seq.split_off(new_len),
                _ => return Vec::new(),
            }
        };
        if removed.is_empty() {
            return removed;
        }
        self.begin_batch();
        for (offset, value) in removed.iter().enumerate().rev() {
            let idx = new_len + offset;
            self.record_and_dispatch(path.child(Segment::Index(idx)), ChangeKind::Delete, Some(value.clone()), None, false, None, None);
        }
        self.commit_batch();
        removed
    }

    /// Sets `key` to `value` in the `Map` at `path` (synthesizing an empty
    /// map there first if needed).
    pub fn map_set(&self, path: &Path, key: ScalarKey, value: Value) {
        let (old, existed_before) = {
            let mut root = self.state.root.borrow_mut();
            let map = graph::ensure_map_at(&mut root, path);
            let old = map.get(&key).cloned();
            let existed = old.is_some();
            map.insert(key.clone(), value.clone());
            (old, existed)
        };
        self.record_and_dispatch(path.clone(), ChangeKind::Set, old, Some(value), existed_before, Some(CollectionKind::Map), Some(key));
    }

    /// Removes `key` from the `Map` at `path`. Returns whether it was
    /// present.
    pub fn map_delete(&self, path: &Path, key: &ScalarKey) -> bool {
        let old = {
            let mut root = self.state.root.borrow_mut();
            graph::get_at_mut(&mut root, path).and_then(Value::as_map_mut).and_then(|m| m.shift_remove(key))
        };
        match old {
            Some(v) => {
                self.record_and_dispatch(path.clone(), ChangeKind::Delete, Some(v), None, false, Some(CollectionKind::Map), Some(key.clone()));
                true
            }
            None => false,
        }
    }

    /// Removes every entry from the `Map` at `path`, one `Delete` record per
    /// entry under a single shared group.
    pub fn map_clear(&self, path: &Path) {
        let entries: Vec<(ScalarKey, Value)> = {
            let mut root = self.state.root.borrow_mut();
            match graph::get_at_mut(&mut root, path).and_then(Value::as_map_mut) {
                Some(m) => m.drain(..).collect(),
                None => Vec::new(),
            }
        };
        if entries.is_empty() {
            return;
        }
        self.begin_batch();
        for (key, value) in entries {
            self.record_and_dispatch(path.clone(), ChangeKind::Delete, Some(value), None, false, Some(CollectionKind::Map), Some(key));
        }
        self.commit_batch();
    }

    /// Adds `value` to the `Set` at `path` (synthesizing an empty set there
    /// first if needed). Returns whether it was newly added.
    pub fn set_add(&self, path: &Path, value: ScalarKey) -> bool {
        let existed_before = {
            let mut root = self.state.root.borrow_mut();
            let set = graph::ensure_set_at(&mut root, path);
            let existed = set.contains(&value);
            set.insert(value.clone());
            existed
        };
        if !existed_before {
            self.record_and_dispatch(
                path.clone(),
                ChangeKind::Set,
                None,
                Some(value.clone().into()),
                false,
                Some(CollectionKind::Set),
                Some(value),
            );
        }
        !existed_before
    }

    /// Removes `value` from the `Set` at `path`. Returns whether it was
    /// present.
    pub fn set_remove(&self, path: &Path, value: &ScalarKey) -> bool {
        let removed = {
            let mut root = self.state.root.borrow_mut();
            graph::get_at_mut(&mut root, path).and_then(Value::as_set_mut).map_or(false, |s| s.shift_remove(value))
        };
        if removed {
            self.record_and_dispatch(
                path.clone(),
                ChangeKind::Delete,
                Some(value.clone().into()),
                None,
                false,
                Some(CollectionKind::Set),
                Some(value.clone()),
            );
        }
        removed
    }

    /// Removes every member of the `Set` at `path`, one `Delete` record per
    /// member under a single shared group.
    pub fn set_clear(&self, path: &Path) {
        let values: Vec<ScalarKey> = {
            let mut root = self.state.root.borrow_mut();
            match graph::get_at_mut(&mut root, path).and_then(Value::as_set_mut) {
                Some(s) => s.drain(..).collect(),
                None => Vec::new(),
            }
        };
        if values.is_empty() {
            return;
        }
        self.begin_batch();
        for value in values {
            self.record_and_dispatch(
                path.clone(),
                ChangeKind::Delete,
                Some(value.clone().into()),
                None,
                false,
                Some(CollectionKind::Set),
                Some(value),
            );
        }
        self.commit_batch();
    }

    fn record_and_dispatch(
        &self,
        path: Path,
        kind: ChangeKind,
        old: Option<Value>,
        new: Option<Value>,
        existed_before: bool,
        collection: Option<CollectionKind>,
        key: Option<ScalarKey>,
    ) {
        let group_id = {
            let top = self.state.batches.borrow().top().copied();
            match top {
                Some(frame) => frame.group_id,
                None => {
                    let window = self.state.options.borrow().merge_window;
                    let merge_enabled = self.state.options.borrow().merge_ungrouped;
                    self.state.groups.borrow_mut().ungrouped_id(self.state.clock.as_ref(), window, merge_enabled)
                }
            }
        };
        let timestamp = self.state.clock.now();
        let record = ChangeRecord {
            path: path.clone(),
            kind,
            old_value: old.clone(),
            new_value: new.clone(),
            existed_before,
            timestamp,
            group_id,
            collection,
            key: key.clone(),
        };

        // A fresh forward mutation invalidates whatever was undone before it.
        self.state.redo.borrow_mut().clear();

        let keep = self.state.options.borrow().filter.as_ref().map(|f| f(&record)).unwrap_or(true);
        if keep {
            let compact = self.state.options.borrow().compact_consecutive_same_path;
            let max_history = self.state.options.borrow().max_history;
            let mut log = self.state.log.borrow_mut();
            log.push_with_compaction(record, compact);
            log.trim_to(max_history);
        }

        if self.state.options.borrow().cache_proxies {
            self.state.handle_cache.borrow_mut().invalidate_prefix(&path.cache_key(), chronicle_path::CACHE_KEY_DELIMITER);
        }

        let meta = DeliveryMeta { kind, existed_before, group_id, collection, key };
        self.state.dispatcher.dispatch(&path, new.as_ref(), old.as_ref(), &meta, self.state.clock.as_ref(), self.state.scheduler.as_ref());
    }

    fn invalidate_cache_for(&self, records: &[ChangeRecord]) {
        if !self.state.options.borrow().cache_proxies {
            return;
        }
        let mut cache = self.state.handle_cache.borrow_mut();
        for r in records {
            cache.invalidate_prefix(&r.path.cache_key(), chronicle_path::CACHE_KEY_DELIMITER);
        }
    }

    // -- Listeners ---------------------------------------------------------

    /// Subscribes `callback` to changes at `path` under `mode`. Returns a
    /// [`Subscription`] whose `unsubscribe` removes it.
    pub fn listen(
        &self,
        path: &Path,
        mode: Mode,
        options: ListenerOptions,
        callback: impl Fn(&Path, Option<&Value>, Option<&Value>, &DeliveryMeta) + 'static,
    ) -> Subscription {
        let id = self.state.dispatcher.listen(path, mode, options, Rc::new(callback));
        Subscription { chronicle: self.clone(), id }
    }

    /// Subscribes `callback` to every change on this root, regardless of
    /// path — the facade-level collapse of the union-of-modes form the
    /// underlying listener fabric doesn't need a fourth `Mode` for.
    pub fn on_any(&self, options: ListenerOptions, callback: impl Fn(&Path, Option<&Value>, Option<&Value>, &DeliveryMeta) + 'static) -> Subscription {
        let id = self.state.dispatcher.on_any(options, Rc::new(callback));
        Subscription { chronicle: self.clone(), id }
    }

    pub fn pause(&self) {
        self.state.dispatcher.pause();
    }

    pub fn resume(&self) {
        self.state.dispatcher.resume(self.state.clock.as_ref(), self.state.scheduler.as_ref());
    }

    pub fn flush(&self) {
        self.state.dispatcher.flush(self.state.clock.as_ref(), self.state.scheduler.as_ref());
    }

    // -- History -------------------------------------------------------------

    /// A marker usable with `undoSince`/a transaction's own bookkeeping: the
    /// change log's current length.
    pub fn mark(&self) -> usize {
        self.state.log.borrow().len()
    }

    pub fn history(&self) -> Vec<ChangeRecord> {
        self.state.log.borrow().iter().cloned().collect()
    }

    pub fn clear_history(&self) {
        self.state.log.borrow_mut().clear();
    }

    pub fn can_undo(&self) -> bool {
        !self.state.log.borrow().is_empty()
    }

    pub fn can_redo(&self) -> bool {
        !self.state.redo.borrow().is_empty()
    }

    pub fn clear_redo(&self) {
        self.state.redo.borrow_mut().clear();
    }

    /// Pops and inverts up to `steps` records, pushing them onto the redo
    /// stack. Returns how many were undone.
    pub fn undo(&self, steps: usize) -> usize {
        let popped = self.state.log.borrow_mut().pop_last(steps);
        self.apply_undo(popped)
    }

    /// Like `undo`, but counts whole groups rather than individual records.
    pub fn undo_groups(&self, groups: usize) -> usize {
        let popped = self.state.log.borrow_mut().pop_last_groups(groups);
        self.apply_undo(popped)
    }

    /// Undoes every record recorded since `marker` (a prior `mark()`).
    pub fn undo_since(&self, marker: usize) -> usize {
        let popped = self.state.log.borrow_mut().pop_since(marker);
        self.apply_undo(popped)
    }

    fn apply_undo(&self, popped: Vec<ChangeRecord>) -> usize {
        if popped.is_empty() {
            return 0;
        }
        {
            let mut root = self.state.root.borrow_mut();
            for record in &popped {
                inverse::apply_backward(&mut root, record);
            }
        }
        self.invalidate_cache_for(&popped);
        {
            let mut redo = self.state.redo.borrow_mut();
            for record in &popped {
                redo.push(record.clone());
            }
        }
        popped.len()
    }

    /// Replays up to `steps` records from the redo stack forward, in the
    /// order they were originally applied, under one fresh group id.
    pub fn redo(&self, steps: usize) -> usize {
        let popped = {
            let mut redo = self.state.redo.borrow_mut();
            pop_trailing(&mut redo, steps)
        };
        self.apply_redo(popped)
    }

    /// Like `redo`, but counts whole (pre-undo) groups rather than
    /// individual records.
    pub fn redo_groups(&self, groups: usize) -> usize {
        let popped = {
            let mut redo = self.state.redo.borrow_mut();
            pop_trailing_groups(&mut redo, groups)
        };
        self.apply_redo(popped)
    }

    fn apply_redo(&self, popped: Vec<ChangeRecord>) -> usize {
        if popped.is_empty() {
            return 0;
        }
        let fresh_group = self.state.groups.borrow_mut().new_group();
        let now = self.state.clock.now();
        let count = popped.len();
        {
            let mut root = self.state.root.borrow_mut();
            let mut log = self.state.log.borrow_mut();
            for original in &popped {
                inverse::apply_forward(&mut root, original);
                let mut record = original.clone();
                record.group_id = fresh_group;
                record.timestamp = now;
                log.push(record);
            }
        }
        self.invalidate_cache_for(&popped);
        count
    }

    // -- Batch / transaction -------------------------------------------------

    /// Opens a new frame: every mutation recorded before the matching
    /// `commit_batch`/`rollback_batch` shares one fresh group id.
    pub fn begin_batch(&self) -> BatchFrame {
        let marker = self.state.log.borrow().len();
        let group_id = {
            let mut groups = self.state.groups.borrow_mut();
            groups.reset_ungrouped();
            groups.new_group()
        };
        let frame = BatchFrame { marker, group_id };
        self.state.batches.borrow_mut().push(frame);
        frame
    }

    /// Closes the innermost open frame, keeping everything it recorded.
    pub fn commit_batch(&self) -> Option<BatchFrame> {
        self.state.batches.borrow_mut().pop()
    }

    /// Closes the innermost open frame and undoes everything recorded since
    /// it opened, without touching the redo stack (a rolled-back change
    /// never existed from the caller's perspective).
    pub fn rollback_batch(&self) -> Option<BatchFrame> {
        let frame = self.state.batches.borrow_mut().pop()?;
        let popped = self.state.log.borrow_mut().pop_since(frame.marker);
        if !popped.is_empty() {
            {
                let mut root = self.state.root.borrow_mut();
                for record in &popped {
                    inverse::apply_backward(&mut root, record);
                }
            }
            self.invalidate_cache_for(&popped);
        }
        Some(frame)
    }

    /// Runs `action` inside a batch frame: commits on `Ok`, rolls back and
    /// propagates on `Err`. A panic inside `action` also rolls back — the
    /// guard below defuses only once `action` has actually returned.
    pub fn batch<R, E>(&self, action: impl FnOnce() -> Result<R, E>) -> Result<R, E> {
        self.begin_batch();
        let chronicle = self.clone();
        let guard = scopeguard::guard((), move |_| {
            chronicle.rollback_batch();
        });
        let result = action();
        scopeguard::ScopeGuard::into_inner(guard);
        match result {
            Ok(value) => {
                self.commit_batch();
                Ok(value)
            }
            Err(err) => {
                self.rollback_batch();
                Err(err)
            }
        }
    }

    /// Like `transaction`, but awaits an async action. The batch frame stays
    /// open across every `await` inside `action` — nothing but `action`
    /// itself runs while it's suspended, so mutations made by the same
    /// logical caller between its `await` points still land in this
    /// transaction's group, matching the single-threaded cooperative model
    /// the rest of this engine assumes.
    pub async fn transaction_async<R, E, Fut>(&self, action: impl FnOnce() -> Fut) -> Result<TransactionOutcome<R>, E>
    where
        Fut: futures::future::Future<Output = Result<R, E>>,
    {
        let top_level = self.state.batches.borrow().is_empty();
        let marker = self.state.log.borrow().len();
        if top_level {
            self.begin_batch();
        }
        let group_id = self.state.batches.borrow().top().map(|f| f.group_id).unwrap_or(0);

        let guard_chronicle = self.clone();
        let guard = scopeguard::guard((), move |_| {
            if top_level {
                guard_chronicle.rollback_batch();
            } else {
                guard_chronicle.undo_since(marker);
            }
        });
        let outcome = action().await;
        scopeguard::ScopeGuard::into_inner(guard);

        match outcome {
            Ok(result) => {
                if top_level {
                    self.commit_batch();
                }
                let chronicle = self.clone();
                let undo: Box<dyn FnOnce()> = Box::new(move || {
                    let still_latest = chronicle.state.log.borrow().last().map(|r| r.group_id) == Some(group_id);
                    if still_latest {
                        chronicle.undo_groups(1);
                    } else {
                        chronicle.undo_since(marker);
                    }
                });
                Ok(TransactionOutcome { result, marker, undo })
            }
            Err(err) => {
                if top_level {
                    self.rollback_batch();
                } else {
                    self.undo_since(marker);
                }
                Err(err)
            }
        }
    }

    /// Like `batch`, but only opens a frame at the top level — a transaction
    /// invoked while already inside an outer batch/transaction rides on that
    /// outer frame instead of nesting its own. Returns the action's result
    /// together with an `undo` closure that reverses exactly this
    /// transaction's effect.
    pub fn transaction<R, E>(&self, action: impl FnOnce() -> Result<R, E>) -> Result<TransactionOutcome<R>, E> {
        let top_level = self.state.batches.borrow().is_empty();
        let marker = self.state.log.borrow().len();
        if top_level {
            self.begin_batch();
        }
        let group_id = self.state.batches.borrow().top().map(|f| f.group_id).unwrap_or(0);

        let guard_chronicle = self.clone();
        let guard = scopeguard::guard((), move |_| {
            if top_level {
                guard_chronicle.rollback_batch();
            } else {
                guard_chronicle.undo_since(marker);
            }
        });
        let outcome = action();
        scopeguard::ScopeGuard::into_inner(guard);

        match outcome {
            Ok(result) => {
                if top_level {
                    self.commit_batch();
                }
                let chronicle = self.clone();
                let undo: Box<dyn FnOnce()> = Box::new(move || {
                    let still_latest = chronicle.state.log.borrow().last().map(|r| r.group_id) == Some(group_id);
                    if still_latest {
                        chronicle.undo_groups(1);
                    } else {
                        chronicle.undo_since(marker);
                    }
                });
                Ok(TransactionOutcome { result, marker, undo })
            }
            Err(err) => {
                if top_level {
                    self.rollback_batch();
                } else {
                    self.undo_since(marker);
                }
                Err(err)
            }
        }
    }

    // -- Snapshot / diff / merge ---------------------------------------------

    pub fn snapshot(&self) -> Value {
        snapshot::snapshot(&self.state.root.borrow(), &self.state.options.borrow())
    }

    /// Refreshes the pristine snapshot to the current graph.
    pub fn mark_pristine(&self) {
        let snap = self.snapshot();
        *self.state.pristine.borrow_mut() = Some(snap);
    }

    /// The structural diff from the pristine snapshot to the current graph.
    pub fn diff(&self) -> Vec<DiffRecord> {
        let base = self.state.pristine.borrow().clone().unwrap_or(Value::Null);
        snapshot::diff(&base, &self.state.root.borrow(), &self.state.options.borrow())
    }

    pub fn is_pristine(&self) -> bool {
        self.diff().is_empty()
    }

    /// Resets the graph to the pristine snapshot, clearing the change log
    /// and redo stack along with it (they describe mutations against a
    /// graph that no longer exists). On a root that was never snapshotted
    /// this falls back to `mark_pristine`.
    pub fn reset(&self) {
        let pristine = self.state.pristine.borrow().clone();
        match pristine {
            Some(value) => {
                *self.state.root.borrow_mut() = value;
                self.state.log.borrow_mut().clear();
                self.state.redo.borrow_mut().clear();
                self.state.handle_cache.borrow_mut().clear();
            }
            None => self.mark_pristine(),
        }
    }

    /// Three-way merges `incoming` into the current graph, using `pristine`
    /// as the common ancestor. Paths where only `incoming` changed are
    /// applied through `set`/`delete` (recorded and dispatched normally);
    /// paths with an explicit entry in `resolutions` are written straight to
    /// the raw graph, bypassing the log and listeners; everything else
    /// conflicting with no resolution is reported back unresolved.
    pub fn merge(&self, incoming: &Value, resolutions: &HashMap<Path, Resolution>) -> Result<MergeOutcome, ChronicleError> {
        let pristine = self
            .state
            .pristine
            .borrow()
            .clone()
            .ok_or_else(|| ChronicleError::PreconditionFailure("merge requires a pristine snapshot".into()))?;

        let plan = {
            let root = self.state.root.borrow();
            let options = self.state.options.borrow();
            merge::plan_merge(&root, &pristine, incoming, resolutions, &options)
        };

        let mut applied = 0;
        if !plan.theirs.is_empty() {
            self.begin_batch();
            for (path, value) in &plan.theirs {
                match value {
                    Some(v) => self.set(path, v.clone()),
                    None => {
                        self.delete(path);
                    }
                }
                applied += 1;
            }
            self.commit_batch();
        }

        if !plan.resolved.is_empty() {
            {
                let mut root = self.state.root.borrow_mut();
                for (path, value) in &plan.resolved {
                    match value {
                        Some(v) => {
                            graph::set_at(&mut root, path, v.clone());
                        }
                        None => {
                            graph::delete_at(&mut root, path);
                        }
                    }
                }
            }
            let mut cache = self.state.handle_cache.borrow_mut();
            for (path, _) in &plan.resolved {
                cache.invalidate_prefix(&path.cache_key(), chronicle_path::CACHE_KEY_DELIMITER);
            }
            applied += plan.resolved.len();
        }

        Ok(MergeOutcome { success: plan.conflicts.is_empty(), conflicts: plan.conflicts, applied })
    }
}

/// Pops up to `n` items from the end of `buf`, in pop order (most-recently
/// pushed first).
fn pop_trailing(buf: &mut Vec<ChangeRecord>, n: usize) -> Vec<ChangeRecord> {
    let n = n.min(buf.len());
    let mut out = Vec::with_capacity(n);
    for _ in 0..n {
        if let Some(record) = buf.pop() {
            out.push(record);
        }
    }
    out
}

/// Pops whole trailing groups from the end of `buf` (the same "never split
/// a group" rule `ChangeLog::pop_last_groups` applies to the log), in pop
/// order.
fn pop_trailing_groups(buf: &mut Vec<ChangeRecord>, n: usize) -> Vec<ChangeRecord> {
    if n == 0 {
        return Vec::new();
    }
    let mut out = Vec::new();
    let mut current_group = None;
    let mut groups_seen = 0usize;
    while let Some(last) = buf.last() {
        let gid = last.group_id;
        if current_group != Some(gid) {
            groups_seen += 1;
            if groups_seen > n {
                break;
            }
            current_group = Some(gid);
        }
        out.push(buf.pop().expect("just peeked via buf.last()"));
    }
    out
}

/// A live subscription returned by `listen`/`on_any`. Dropping it leaves the
/// listener registered; call `unsubscribe` explicitly to remove it.
pub struct Subscription {
    chronicle: Chronicle,
    id: SubscriberId,
}

impl Subscription {
    pub fn unsubscribe(self) {
        self.chronicle.state.dispatcher.unsubscribe(self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    fn key(name: &str) -> Path {
        Path::root().child(Segment::Key(name.into()))
    }

    #[test]
    fn set_then_undo_restores_prior_value() {
        let c = Chronicle::wrap(Value::record());
        c.set(&key("a"), Value::Number(1.0));
        c.set(&key("a"), Value::Number(2.0));
        assert_eq!(c.undo(1), 1);
        assert!(matches!(c.get(&key("a")), Some(Value::Number(n)) if n == 1.0));
    }

    #[test]
    fn undo_of_new_property_then_redo_restores_it() {
        let c = Chronicle::wrap(Value::record());
        c.set(&key("a"), Value::Number(1.0));
        assert_eq!(c.undo(1), 1);
        assert!(c.get(&key("a")).is_none());
        assert_eq!(c.redo(1), 1);
        assert!(matches!(c.get(&key("a")), Some(Value::Number(n)) if n == 1.0));
    }

    #[test]
    fn push_then_undo_leaves_no_hole() {
        let c = Chronicle::wrap(Value::sequence());
        let arr = Path::root();
        c.push(&arr, Value::Number(1.0));
        c.push(&arr, Value::Number(2.0));
        c.push(&arr, Value::Number(3.0));
        c.undo(1);
        let seq = c.unwrap();
        assert_eq!(seq.as_sequence().unwrap().len(), 2);
    }

    #[test]
    fn forward_mutation_clears_redo() {
        let c = Chronicle::wrap(Value::record());
        c.set(&key("a"), Value::Number(1.0));
        c.undo(1);
        assert!(c.can_redo());
        c.set(&key("b"), Value::Number(2.0));
        assert!(!c.can_redo());
    }

    #[test]
    fn batch_rolls_back_on_error() {
        let c = Chronicle::wrap(Value::record());
        c.set(&key("a"), Value::Number(1.0));
        let marker = c.mark();
        let result: Result<(), &str> = c.batch(|| {
            c.set(&key("a"), Value::Number(99.0));
            Err("boom")
        });
        assert!(result.is_err());
        assert_eq!(c.mark(), marker);
        assert!(matches!(c.get(&key("a")), Some(Value::Number(n)) if n == 1.0));
    }

    #[test]
    fn exact_listener_fires_only_for_its_path() {
        let c = Chronicle::wrap(Value::record());
        let hits = Rc::new(Cell::new(0));
        let hits2 = hits.clone();
        let _sub = c.listen(&key("a"), Mode::Exact, ListenerOptions::default(), move |_, _, _, _| {
            hits2.set(hits2.get() + 1);
        });
        c.set(&key("b"), Value::Number(1.0));
        assert_eq!(hits.get(), 0);
        c.set(&key("a"), Value::Number(1.0));
        assert_eq!(hits.get(), 1);
    }

    #[test]
    fn pause_then_resume_delivers_queued_changes() {
        let c = Chronicle::wrap(Value::record());
        let hits = Rc::new(Cell::new(0));
        let hits2 = hits.clone();
        let _sub = c.on_any(ListenerOptions::default(), move |_, _, _, _| hits2.set(hits2.get() + 1));
        c.pause();
        c.set(&key("a"), Value::Number(1.0));
        c.set(&key("b"), Value::Number(2.0));
        assert_eq!(hits.get(), 0);
        c.resume();
        assert_eq!(hits.get(), 2);
    }

    #[test]
    fn listener_can_mutate_graph_without_panicking() {
        let c = Chronicle::wrap(Value::record());
        let inner = c.clone();
        let fired = Rc::new(Cell::new(false));
        let fired2 = fired.clone();
        let _sub = c.listen(&key("a"), Mode::Exact, ListenerOptions::default(), move |_, _, _, _| {
            if !fired2.get() {
                fired2.set(true);
                inner.set(&key("b"), Value::Number(7.0));
            }
        });
        c.set(&key("a"), Value::Number(1.0));
        assert!(matches!(c.get(&key("b")), Some(Value::Number(n)) if n == 7.0));
    }

    #[test]
    fn is_pristine_tracks_mark_pristine() {
        let c = Chronicle::wrap(Value::record());
        assert!(c.is_pristine());
        c.set(&key("a"), Value::Number(1.0));
        assert!(!c.is_pristine());
        c.mark_pristine();
        assert!(c.is_pristine());
    }

    #[test]
    fn at_returns_same_handle_when_cache_proxies_enabled() {
        let c = Chronicle::wrap(Value::record());
        let a = c.at(key("a"));
        let b = c.at(key("a"));
        assert!(Rc::ptr_eq(&a, &b));
        c.set(&key("a"), Value::Number(1.0));
        let after = c.at(key("a"));
        assert!(!Rc::ptr_eq(&a, &after));
    }

    #[test]
    fn merge_applies_theirs_and_reports_conflict() {
        let pristine = {
            let mut m = indexmap::IndexMap::new();
            m.insert("a".to_string(), Value::Number(1.0));
            m.insert("b".to_string(), Value::Number(1.0));
            Value::Record(m)
        };
        let c = Chronicle::wrap_with(pristine.clone(), Options::default());
        c.set(&key("a"), Value::Number(10.0));

        let incoming = {
            let mut m = indexmap::IndexMap::new();
            m.insert("a".to_string(), Value::Number(100.0));
            m.insert("b".to_string(), Value::Number(2.0));
            Value::Record(m)
        };

        let outcome = c.merge(&incoming, &HashMap::new()).unwrap();
        assert!(!outcome.success);
        assert_eq!(outcome.conflicts.len(), 1);
        assert!(matches!(c.get(&key("b")), Some(Value::Number(n)) if n == 2.0));
    }
}
