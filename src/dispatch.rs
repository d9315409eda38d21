//! Listener delivery: affinity lookup via [`crate::trie::ListenerTrie`], the
//! pause/flush/resume queue, and per-listener debounce/throttle/once/
//! schedule wrapping.

use crate::record::{ChangeKind, Clock, CollectionKind};
use crate::trie::{ListenerTrie, Mode, SubscriberId};
use crate::value::{ScalarKey, Value};
use chronicle_path::Path;
use std::cell::{Cell, RefCell};
use std::collections::{HashMap, VecDeque};
use std::rc::Rc;
use std::time::{Duration, Instant};

/// The single struct of delivery parameters every listener receives,
/// replacing what would otherwise be a chain of wrapping closures.
#[derive(Clone, Debug)]
pub struct DeliveryMeta {
    pub kind: ChangeKind,
    pub existed_before: bool,
    pub group_id: u64,
    pub collection: Option<CollectionKind>,
    pub key: Option<ScalarKey>,
}

pub type Listener = Rc<dyn Fn(&Path, Option<&Value>, Option<&Value>, &DeliveryMeta)>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Schedule {
    Sync,
    Scheduled,
}

#[derive(Clone, Debug, Default)]
pub struct ListenerOptions {
    pub once: bool,
    pub debounce: Option<Duration>,
    pub throttle: Option<Duration>,
    pub schedule: Option<Schedule>,
}

/// A unit of work handed to a [`Scheduler`]. Production code runs it
/// immediately; [`crate::testing::RecordingScheduler`] buffers it.
pub struct Scheduled(Box<dyn FnOnce()>);

impl Scheduled {
    pub fn new(f: impl FnOnce() + 'static) -> Self {
        Scheduled(Box::new(f))
    }

    pub fn run(self) {
        (self.0)()
    }
}

/// Where deliveries with `schedule: Scheduled` go. `ImmediateScheduler` runs
/// them synchronously, standing in for a microtask queue in a host with no
/// async runtime assumption.
pub trait Scheduler {
    fn schedule(&self, task: Scheduled);
}

#[derive(Default)]
pub struct ImmediateScheduler;

impl Scheduler for ImmediateScheduler {
    fn schedule(&self, task: Scheduled) {
        task.run();
    }
}

struct Entry {
    callback: Listener,
    options: ListenerOptions,
    /// Leading-edge bookkeeping for `throttle`: the last time this listener
    /// actually fired.
    last_delivered: Option<Instant>,
    /// Trailing-edge bookkeeping for `debounce`: the most recent event still
    /// waiting out its quiet window, overwritten (not queued) by every event
    /// that arrives before it fires.
    pending_debounce: Option<PendingDebounce>,
}

/// The latest event a debounced listener has seen, plus when it was last
/// refreshed. Delivered once a later event (or an explicit `flush`/`resume`)
/// observes that `window` has since elapsed with no newer event replacing it.
struct PendingDebounce {
    last_seen: Instant,
    path: Path,
    new_value: Option<Value>,
    old_value: Option<Value>,
    meta: DeliveryMeta,
}

struct QueuedDelivery {
    id: SubscriberId,
    path: Path,
    new_value: Option<Value>,
    old_value: Option<Value>,
    meta: DeliveryMeta,
}

/// Owns the listener trie, the per-listener wrapping state, and the pause
/// queue for one root.
///
/// Every field is independently interior-mutable so `dispatch` never holds a
/// borrow across a user callback: a listener that mutates the observed graph
/// (which re-enters `dispatch`) only ever finds borrows it itself is not
/// still holding.
#[derive(Default)]
pub struct Dispatcher {
    trie: RefCell<ListenerTrie>,
    entries: RefCell<HashMap<SubscriberId, Rc<RefCell<Entry>>>>,
    paused: Cell<bool>,
    queue: RefCell<VecDeque<QueuedDelivery>>,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn listen(&self, path: &Path, mode: Mode, options: ListenerOptions, callback: Listener) -> SubscriberId {
        let id = self.trie.borrow_mut().subscribe(path, mode);
        self.entries
            .borrow_mut()
            .insert(id, Rc::new(RefCell::new(Entry { callback, options, last_delivered: None, pending_debounce: None })));
        id
    }

    pub fn on_any(&self, options: ListenerOptions, callback: Listener) -> SubscriberId {
        let id = self.trie.borrow_mut().subscribe_global();
        self.entries
            .borrow_mut()
            .insert(id, Rc::new(RefCell::new(Entry { callback, options, last_delivered: None, pending_debounce: None })));
        id
    }

    pub fn unsubscribe(&self, id: SubscriberId) {
        self.trie.borrow_mut().unsubscribe(id);
        self.entries.borrow_mut().remove(&id);
    }

    pub fn pause(&self) {
        self.paused.set(true);
    }

    /// Delivers every queued item in FIFO order and unpauses.
    pub fn resume(&self, clock: &dyn Clock, scheduler: &dyn Scheduler) {
        self.paused.set(false);
        self.drain_queue(clock, scheduler);
        self.settle_ripe_debounces(clock, scheduler);
    }

    /// Delivers every queued item in FIFO order without unpausing, then
    /// delivers any pending debounced event whose quiet window has already
    /// elapsed. There is no background timer driving debounce on its own —
    /// a trailing value only ever goes out when something calls back into
    /// the dispatcher, so a caller that wants a debounced listener to settle
    /// without a further mutation advances its clock and calls `flush`.
    pub fn flush(&self, clock: &dyn Clock, scheduler: &dyn Scheduler) {
        self.drain_queue(clock, scheduler);
        self.settle_ripe_debounces(clock, scheduler);
    }

    /// Delivers the pending event of every debounced listener whose quiet
    /// window has elapsed as of `clock.now()`.
    fn settle_ripe_debounces(&self, clock: &dyn Clock, scheduler: &dyn Scheduler) {
        let now = clock.now();
        let entries: Vec<(SubscriberId, Rc<RefCell<Entry>>)> = self.entries.borrow().iter().map(|(id, e)| (*id, e.clone())).collect();
        for (id, entry_rc) in entries {
            let ripe = {
                let mut e = entry_rc.borrow_mut();
                match e.options.debounce {
                    Some(window) => e.pending_debounce.take().filter(|p| now.saturating_duration_since(p.last_seen) >= window),
                    None => None,
                }
            };
            if let Some(pending) = ripe {
                self.deliver_pending(id, &entry_rc, pending, scheduler);
            }
        }
    }

    fn drain_queue(&self, clock: &dyn Clock, scheduler: &dyn Scheduler) {
        let queued: Vec<QueuedDelivery> = self.queue.borrow_mut().drain(..).collect();
        for item in queued {
            self.deliver_to(item.id, &item.path, item.new_value.as_ref(), item.old_value.as_ref(), &item.meta, clock, scheduler);
        }
    }

    /// Computes the affinity set for `path` and delivers (or enqueues, if
    /// paused) to each.
    pub fn dispatch(
        &self,
        path: &Path,
        new_value: Option<&Value>,
        old_value: Option<&Value>,
        meta: &DeliveryMeta,
        clock: &dyn Clock,
        scheduler: &dyn Scheduler,
    ) {
        let affected = self.trie.borrow().affinity(path);
        let paused = self.paused.get();
        for id in affected {
            if paused {
                self.queue.borrow_mut().push_back(QueuedDelivery {
                    id,
                    path: path.clone(),
                    new_value: new_value.cloned(),
                    old_value: old_value.cloned(),
                    meta: meta.clone(),
                });
            } else {
                self.deliver_to(id, path, new_value, old_value, meta, clock, scheduler);
            }
        }
    }

    /// Routes to trailing-edge debounce handling if the listener has one,
    /// otherwise applies leading-edge throttle and delivers (or drops)
    /// immediately. A listener with both options set is treated as
    /// debounced; combining the two isn't a configuration this engine gives
    /// distinct meaning to.
    fn deliver_to(
        &self,
        id: SubscriberId,
        path: &Path,
        new_value: Option<&Value>,
        old_value: Option<&Value>,
        meta: &DeliveryMeta,
        clock: &dyn Clock,
        scheduler: &dyn Scheduler,
    ) {
        let entry_rc = match self.entries.borrow().get(&id) {
            Some(e) => e.clone(),
            None => return,
        };

        let debounce_window = entry_rc.borrow().options.debounce;
        if let Some(window) = debounce_window {
            self.handle_debounced(id, &entry_rc, window, path, new_value, old_value, meta, clock, scheduler);
            return;
        }

        let (once, schedule, callback) = {
            let e = entry_rc.borrow();
            if let Some(window) = e.options.throttle {
                if let Some(last) = e.last_delivered {
                    if clock.now().saturating_duration_since(last) < window {
                        return;
                    }
                }
            }
            (e.options.once, e.options.schedule.unwrap_or(Schedule::Sync), e.callback.clone())
        };
        entry_rc.borrow_mut().last_delivered = Some(clock.now());
        self.fire(id, once, schedule, callback, path, new_value, old_value, meta, scheduler);
    }

    /// Collapses a burst: if the previously pending event's quiet window has
    /// already elapsed, it fires now (the burst before this one ended) and
    /// this event becomes the new pending one; otherwise this event just
    /// replaces whatever was pending, resetting the quiet timer.
    #[allow(clippy::too_many_arguments)]
    fn handle_debounced(
        &self,
        id: SubscriberId,
        entry_rc: &Rc<RefCell<Entry>>,
        window: Duration,
        path: &Path,
        new_value: Option<&Value>,
        old_value: Option<&Value>,
        meta: &DeliveryMeta,
        clock: &dyn Clock,
        scheduler: &dyn Scheduler,
    ) {
        let now = clock.now();
        let ripe = {
            let mut e = entry_rc.borrow_mut();
            let ripe = e.pending_debounce.take().filter(|p| now.saturating_duration_since(p.last_seen) >= window);
            e.pending_debounce = Some(PendingDebounce {
                last_seen: now,
                path: path.clone(),
                new_value: new_value.cloned(),
                old_value: old_value.cloned(),
                meta: meta.clone(),
            });
            ripe
        };
        if let Some(pending) = ripe {
            self.deliver_pending(id, entry_rc, pending, scheduler);
        }
    }

    fn deliver_pending(&self, id: SubscriberId, entry_rc: &Rc<RefCell<Entry>>, pending: PendingDebounce, scheduler: &dyn Scheduler) {
        let (once, schedule, callback) = {
            let e = entry_rc.borrow();
            (e.options.once, e.options.schedule.unwrap_or(Schedule::Sync), e.callback.clone())
        };
        entry_rc.borrow_mut().last_delivered = Some(pending.last_seen);
        self.fire(id, once, schedule, callback, &pending.path, pending.new_value.as_ref(), pending.old_value.as_ref(), &pending.meta, scheduler);
    }

    #[allow(clippy::too_many_arguments)]
    fn fire(
        &self,
        id: SubscriberId,
        once: bool,
        schedule: Schedule,
        callback: Listener,
        path: &Path,
        new_value: Option<&Value>,
        old_value: Option<&Value>,
        meta: &DeliveryMeta,
        scheduler: &dyn Scheduler,
    ) {
        // Unsubscribe before invoking so a reentrant dispatch from inside the
        // callback can't redeliver to a `once` listener.
        if once {
            self.unsubscribe(id);
        }

        let path = path.clone();
        let new_value = new_value.cloned();
        let old_value = old_value.cloned();
        let meta = meta.clone();
        let invoke = move || {
            callback(&path, new_value.as_ref(), old_value.as_ref(), &meta);
        };

        match schedule {
            Schedule::Sync => invoke(),
            Schedule::Scheduled => scheduler.schedule(Scheduled::new(invoke)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{ManualClock, SystemClock};
    use chronicle_path::Segment;
    use std::cell::Cell;

    fn path(segs: &[&str]) -> Path {
        segs.iter().fold(Path::root(), |p, s| p.child(Segment::Key((*s).into())))
    }

    fn meta() -> DeliveryMeta {
        DeliveryMeta { kind: ChangeKind::Set, existed_before: false, group_id: 1, collection: None, key: None }
    }

    #[test]
    fn pause_queues_deliveries_until_resume() {
        let dispatcher = Dispatcher::new();
        let calls = Rc::new(Cell::new(0));
        let calls2 = calls.clone();
        dispatcher.listen(&path(&["x"]), Mode::Exact, ListenerOptions::default(), Rc::new(move |_, _, _, _| {
            calls2.set(calls2.get() + 1);
        }));
        dispatcher.pause();
        let clock = SystemClock;
        let scheduler = ImmediateScheduler;
        for _ in 0..3 {
            dispatcher.dispatch(&path(&["x"]), None, None, &meta(), &clock, &scheduler);
        }
        assert_eq!(calls.get(), 0);
        dispatcher.resume(&clock, &scheduler);
        assert_eq!(calls.get(), 3);
    }

    #[test]
    fn once_listener_unsubscribes_after_first_delivery() {
        let dispatcher = Dispatcher::new();
        let calls = Rc::new(Cell::new(0));
        let calls2 = calls.clone();
        dispatcher.listen(
            &path(&["x"]),
            Mode::Exact,
            ListenerOptions { once: true, ..Default::default() },
            Rc::new(move |_, _, _, _| calls2.set(calls2.get() + 1)),
        );
        let clock = SystemClock;
        let scheduler = ImmediateScheduler;
        dispatcher.dispatch(&path(&["x"]), None, None, &meta(), &clock, &scheduler);
        dispatcher.dispatch(&path(&["x"]), None, None, &meta(), &clock, &scheduler);
        assert_eq!(calls.get(), 1);
    }

    #[test]
    fn debounce_collapses_a_burst_and_delivers_the_trailing_value() {
        let dispatcher = Dispatcher::new();
        let seen = Rc::new(RefCell::new(Vec::new()));
        let seen2 = seen.clone();
        dispatcher.listen(
            &path(&["x"]),
            Mode::Exact,
            ListenerOptions { debounce: Some(Duration::from_millis(50)), ..Default::default() },
            Rc::new(move |_, new, _, _| {
                if let Some(Value::Number(n)) = new {
                    seen2.borrow_mut().push(*n);
                }
            }),
        );
        let clock = ManualClock::new();
        let scheduler = ImmediateScheduler;

        // A burst within the window delivers nothing yet, not even the
        // leading value.
        dispatcher.dispatch(&path(&["x"]), Some(&Value::Number(1.0)), None, &meta(), &clock, &scheduler);
        clock.advance(Duration::from_millis(10));
        dispatcher.dispatch(&path(&["x"]), Some(&Value::Number(2.0)), None, &meta(), &clock, &scheduler);
        clock.advance(Duration::from_millis(10));
        dispatcher.dispatch(&path(&["x"]), Some(&Value::Number(3.0)), None, &meta(), &clock, &scheduler);
        assert!(seen.borrow().is_empty());

        // Once the quiet window has elapsed with no new event, flushing
        // settles the burst's trailing value.
        clock.advance(Duration::from_millis(60));
        dispatcher.flush(&clock, &scheduler);
        assert_eq!(*seen.borrow(), vec![3.0]);
    }

    #[test]
    fn throttle_drops_events_within_the_window_after_the_leading_delivery() {
        let dispatcher = Dispatcher::new();
        let seen = Rc::new(RefCell::new(Vec::new()));
        let seen2 = seen.clone();
        dispatcher.listen(
            &path(&["x"]),
            Mode::Exact,
            ListenerOptions { throttle: Some(Duration::from_millis(50)), ..Default::default() },
            Rc::new(move |_, new, _, _| {
                if let Some(Value::Number(n)) = new {
                    seen2.borrow_mut().push(*n);
                }
            }),
        );
        let clock = ManualClock::new();
        let scheduler = ImmediateScheduler;

        dispatcher.dispatch(&path(&["x"]), Some(&Value::Number(1.0)), None, &meta(), &clock, &scheduler);
        clock.advance(Duration::from_millis(10));
        dispatcher.dispatch(&path(&["x"]), Some(&Value::Number(2.0)), None, &meta(), &clock, &scheduler);
        clock.advance(Duration::from_millis(60));
        dispatcher.dispatch(&path(&["x"]), Some(&Value::Number(3.0)), None, &meta(), &clock, &scheduler);

        assert_eq!(*seen.borrow(), vec![1.0, 3.0]);
    }
}
