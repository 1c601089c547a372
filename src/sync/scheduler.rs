//! Timers for the node's event loop. A timer never calls back into the node;
//! when due it is handed back as a [`TimerEvent`] and processed like any other
//! input, so handlers stay sequential.

use crate::sync::clock::{Clock, ManualClock};
use chrono::{DateTime, TimeDelta, Utc};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimerId(u64);

/// What a timer is for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerKind {
    /// Connect attempt `attempt` did not complete in time.
    JoinTimeout { attempt: u32 },
    /// Start connect attempt `attempt` after an error back-off.
    JoinRetry { attempt: u32 },
    KeepAlive,
    ReapIdle,
    ResumePendingJoin,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerEvent {
    pub id: TimerId,
    pub kind: TimerKind,
}

pub trait Scheduler: Send {
    /// Fire `kind` once after `delay`.
    fn schedule(&mut self, delay: Duration, kind: TimerKind) -> TimerId;

    /// Fire `kind` every `interval` until cancelled. The first tick is one
    /// interval from now.
    fn schedule_repeating(&mut self, interval: Duration, kind: TimerKind) -> TimerId;

    /// Disarm `id`. Unknown or already fired ids are ignored.
    fn cancel(&mut self, id: TimerId);
}

// ── TokioScheduler ──────────────────────────────────────────────────────────

/// Scheduler backed by tokio sleeps. Due timers are posted on the channel
/// returned by [`TokioScheduler::new`].
pub struct TokioScheduler {
    tx: mpsc::UnboundedSender<TimerEvent>,
    tasks: HashMap<TimerId, JoinHandle<()>>,
    next_id: u64,
}

impl TokioScheduler {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<TimerEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                tx,
                tasks: HashMap::new(),
                next_id: 1,
            },
            rx,
        )
    }

    fn allocate(&mut self) -> TimerId {
        self.tasks.retain(|_, handle| !handle.is_finished());
        let id = TimerId(self.next_id);
        self.next_id += 1;
        id
    }
}

impl Scheduler for TokioScheduler {
    fn schedule(&mut self, delay: Duration, kind: TimerKind) -> TimerId {
        let id = self.allocate();
        let tx = self.tx.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(TimerEvent { id, kind });
        });
        self.tasks.insert(id, handle);
        id
    }

    fn schedule_repeating(&mut self, interval: Duration, kind: TimerKind) -> TimerId {
        let id = self.allocate();
        let tx = self.tx.clone();
        let period = interval.max(Duration::from_millis(1));
        let handle = tokio::spawn(async move {
            let start = tokio::time::Instant::now() + period;
            let mut ticker = tokio::time::interval_at(start, period);
            loop {
                ticker.tick().await;
                if tx.send(TimerEvent { id, kind }).is_err() {
                    break;
                }
            }
        });
        self.tasks.insert(id, handle);
        id
    }

    fn cancel(&mut self, id: TimerId) {
        if let Some(handle) = self.tasks.remove(&id) {
            handle.abort();
        }
    }
}

impl Drop for TokioScheduler {
    fn drop(&mut self) {
        for (_, handle) in self.tasks.drain() {
            handle.abort();
        }
    }
}

// ── ManualScheduler ─────────────────────────────────────────────────────────

#[derive(Debug)]
struct Entry {
    due: DateTime<Utc>,
    interval: Option<TimeDelta>,
    kind: TimerKind,
}

#[derive(Debug, Default)]
struct ManualTimers {
    next_id: u64,
    entries: BTreeMap<TimerId, Entry>,
}

/// Scheduler on virtual time. Due-ness is judged against a [`ManualClock`];
/// tests move the clock and pull due timers with [`ManualScheduler::pop_due`].
/// Clones share the same timer table.
#[derive(Debug, Clone)]
pub struct ManualScheduler {
    clock: ManualClock,
    timers: Arc<Mutex<ManualTimers>>,
}

impl ManualScheduler {
    pub fn new(clock: ManualClock) -> Self {
        Self {
            clock,
            timers: Arc::new(Mutex::new(ManualTimers::default())),
        }
    }

    pub fn clock(&self) -> &ManualClock {
        &self.clock
    }

    /// Earliest timer due at or before the clock's current time. Repeating
    /// timers are re-armed one interval later.
    pub fn pop_due(&self) -> Option<TimerEvent> {
        let now = self.clock.now();
        let mut timers = self.timers.lock();
        let (&id, _) = timers
            .entries
            .iter()
            .filter(|(_, e)| e.due <= now)
            .min_by_key(|(id, e)| (e.due, **id))?;

        let entry = timers.entries.get_mut(&id)?;
        let kind = entry.kind;
        match entry.interval {
            Some(interval) => entry.due += interval,
            None => {
                timers.entries.remove(&id);
            }
        }
        Some(TimerEvent { id, kind })
    }

    /// Advance the clock by `by` and collect everything that became due.
    pub fn advance(&self, by: Duration) -> Vec<TimerEvent> {
        self.clock.advance(by);
        std::iter::from_fn(|| self.pop_due()).collect()
    }

    pub fn pending(&self) -> usize {
        self.timers.lock().entries.len()
    }

    pub fn is_armed(&self, kind: TimerKind) -> bool {
        self.timers.lock().entries.values().any(|e| e.kind == kind)
    }

    fn insert(&self, delay: Duration, interval: Option<Duration>, kind: TimerKind) -> TimerId {
        let to_delta = |d: Duration| TimeDelta::from_std(d).unwrap_or(TimeDelta::MAX);
        let mut timers = self.timers.lock();
        timers.next_id += 1;
        let id = TimerId(timers.next_id);
        timers.entries.insert(
            id,
            Entry {
                due: self.clock.now() + to_delta(delay),
                interval: interval.map(|i| to_delta(i.max(Duration::from_millis(1)))),
                kind,
            },
        );
        id
    }
}

impl Scheduler for ManualScheduler {
    fn schedule(&mut self, delay: Duration, kind: TimerKind) -> TimerId {
        self.insert(delay, None, kind)
    }

    fn schedule_repeating(&mut self, interval: Duration, kind: TimerKind) -> TimerId {
        self.insert(interval, Some(interval), kind)
    }

    fn cancel(&mut self, id: TimerId) {
        self.timers.lock().entries.remove(&id);
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────
