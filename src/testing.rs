//! Test-only utilities: a clock whose time an assertion can advance by hand,
//! and a scheduler that buffers deliveries for deterministic draining
//! instead of using a real timer or microtask queue.

use crate::dispatch::{Scheduled, Scheduler};
use crate::record::Clock;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// A [`Clock`] whose `now()` is a fixed base instant plus an offset the test
/// advances explicitly, so `mergeWindowMs` and debounce/throttle windows can
/// be exercised without sleeping real time.
pub struct ManualClock {
    base: Instant,
    offset_nanos: AtomicU64,
}

impl ManualClock {
    pub fn new() -> Self {
        ManualClock { base: Instant::now(), offset_nanos: AtomicU64::new(0) }
    }

    pub fn advance(&self, by: Duration) {
        self.offset_nanos.fetch_add(by.as_nanos() as u64, Ordering::SeqCst);
    }
}

impl fmt::Debug for ManualClock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ManualClock").field("offset_nanos", &self.offset_nanos.load(Ordering::SeqCst)).finish()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        self.base + Duration::from_nanos(self.offset_nanos.load(Ordering::SeqCst))
    }
}

/// The default production clock: plain wall time.
#[derive(Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// A [`Scheduler`] that buffers every scheduled delivery instead of running
/// it, so a test can assert on pending work and then drain it deterministically.
#[derive(Default)]
pub struct RecordingScheduler {
    pending: Mutex<Vec<Scheduled>>,
}

impl RecordingScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().unwrap().len()
    }

    /// Runs every buffered delivery, in the order scheduled.
    pub fn drain(&self) {
        let batch: Vec<Scheduled> = std::mem::take(&mut *self.pending.lock().unwrap());
        for task in batch {
            task.run();
        }
    }
}

impl Scheduler for RecordingScheduler {
    fn schedule(&self, task: Scheduled) {
        self.pending.lock().unwrap().push(task);
    }
}
