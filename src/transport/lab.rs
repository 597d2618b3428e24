//! In-memory completion queue.
//!
//! [`LabQueue`] plays the role of the transport in tests and demos. Test code
//! completes operations by posting their tag, either immediately
//! ([`post`](LabQueue::post)) or through an alarm that fires after a delay
//! ([`post_after`](LabQueue::post_after)).
//!
//! # Shutdown
//!
//! [`shutdown`](LabQueue::shutdown) cancels outstanding alarms (they are
//! delivered with `ok = false`), lets already-ready events drain, and then
//! makes [`next`](CompletionQueue::next) return `None`. Posts after shutdown
//! are dropped.
//!
//! # Wakeup accounting
//!
//! Events registered through [`notify`](CompletionQueue::notify) are counted
//! separately so tests can assert how many wakeups were ever outstanding at
//! once (see [`LabStats`]).
//!
//! ```ignore
//! let queue = LabQueue::new();
//! queue.post_after(Duration::from_millis(10), tag, true);
//! assert_eq!(queue.next(), Some(Event::new(tag, true)));
//! ```

use super::{CompletionQueue, Event, NextStatus, Tag};
use crate::tracing_compat::{debug, warn};
use parking_lot::{Condvar, Mutex};
use std::collections::{BinaryHeap, VecDeque};
use std::time::{Duration, Instant};

/// An alarm waiting for its deadline.
#[derive(Debug, PartialEq, Eq)]
struct Alarm {
    deadline: Instant,
    /// Insertion order, breaks ties between equal deadlines.
    sequence: u64,
    event: Event,
}

impl PartialOrd for Alarm {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Alarm {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // Min-heap: earliest deadline first, then by sequence.
        other
            .deadline
            .cmp(&self.deadline)
            .then_with(|| other.sequence.cmp(&self.sequence))
    }
}

#[derive(Debug)]
struct Ready {
    event: Event,
    /// Registered through `notify` rather than `post`.
    wakeup: bool,
}

/// Counters describing the traffic through a [`LabQueue`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LabStats {
    /// Completions posted by test code (immediate and alarms).
    pub posted: u64,
    /// Events handed out by `next` / `next_before`.
    pub delivered: u64,
    /// Wakeups registered through `notify`.
    pub notifications: u64,
    /// Highest number of undelivered wakeups observed at any instant.
    pub max_outstanding_notifications: u64,
}

#[derive(Debug, Default)]
struct LabState {
    ready: VecDeque<Ready>,
    alarms: BinaryHeap<Alarm>,
    next_sequence: u64,
    shutdown: bool,
    outstanding_notifications: u64,
    stats: LabStats,
}

impl LabState {
    fn promote_due(&mut self, now: Instant) {
        while self.alarms.peek().is_some_and(|alarm| alarm.deadline <= now) {
            if let Some(alarm) = self.alarms.pop() {
                self.ready.push_back(Ready {
                    event: alarm.event,
                    wakeup: false,
                });
            }
        }
    }

    fn take_ready(&mut self) -> Option<Event> {
        let ready = self.ready.pop_front()?;
        if ready.wakeup {
            self.outstanding_notifications = self.outstanding_notifications.saturating_sub(1);
        }
        self.stats.delivered += 1;
        Some(ready.event)
    }

    fn next_alarm(&self) -> Option<Instant> {
        self.alarms.peek().map(|alarm| alarm.deadline)
    }
}

/// An in-memory completion queue.
#[derive(Debug, Default)]
pub struct LabQueue {
    state: Mutex<LabState>,
    available: Condvar,
}

impl LabQueue {
    /// Creates an empty queue.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Completes the operation identified by `tag` right away.
    pub fn post(&self, tag: Tag, ok: bool) {
        let mut state = self.state.lock();
        if state.shutdown {
            warn!(?tag, "post after shutdown dropped");
            return;
        }
        state.stats.posted += 1;
        state.ready.push_back(Ready {
            event: Event::new(tag, ok),
            wakeup: false,
        });
        drop(state);
        self.available.notify_one();
    }

    /// Completes the operation identified by `tag` once `delay` has elapsed.
    pub fn post_after(&self, delay: Duration, tag: Tag, ok: bool) {
        self.post_at(Instant::now() + delay, tag, ok);
    }

    /// Completes the operation identified by `tag` at `deadline`.
    pub fn post_at(&self, deadline: Instant, tag: Tag, ok: bool) {
        let mut state = self.state.lock();
        if state.shutdown {
            warn!(?tag, "alarm after shutdown dropped");
            return;
        }
        let sequence = state.next_sequence;
        state.next_sequence += 1;
        state.stats.posted += 1;
        state.alarms.push(Alarm {
            deadline,
            sequence,
            event: Event::new(tag, ok),
        });
        drop(state);
        // The waiter may be sleeping until a later deadline.
        self.available.notify_all();
    }

    /// Shuts the queue down.
    ///
    /// Pending alarms are cancelled and delivered with `ok = false`.
    pub fn shutdown(&self) {
        let mut state = self.state.lock();
        if state.shutdown {
            return;
        }
        state.shutdown = true;
        let mut cancelled: Vec<Alarm> = state.alarms.drain().collect();
        cancelled.sort_by(|a, b| b.cmp(a));
        debug!(cancelled = cancelled.len(), "lab queue shutting down");
        for alarm in cancelled {
            state.ready.push_back(Ready {
                event: Event::new(alarm.event.tag, false),
                wakeup: false,
            });
        }
        drop(state);
        self.available.notify_all();
    }

    /// Returns true once [`shutdown`](Self::shutdown) has been called.
    #[must_use]
    pub fn is_shutdown(&self) -> bool {
        self.state.lock().shutdown
    }

    /// Returns the number of events not yet delivered (ready plus alarms).
    #[must_use]
    pub fn pending(&self) -> usize {
        let state = self.state.lock();
        state.ready.len() + state.alarms.len()
    }

    /// Returns a snapshot of the traffic counters.
    #[must_use]
    pub fn stats(&self) -> LabStats {
        self.state.lock().stats
    }
}

impl CompletionQueue for LabQueue {
    fn next(&self) -> Option<Event> {
        let mut state = self.state.lock();
        loop {
            state.promote_due(Instant::now());
            if let Some(event) = state.take_ready() {
                return Some(event);
            }
            if state.shutdown {
                return None;
            }
            match state.next_alarm() {
                Some(deadline) => {
                    let _ = self.available.wait_until(&mut state, deadline);
                }
                None => self.available.wait(&mut state),
            }
        }
    }

    fn next_before(&self, deadline: Instant) -> NextStatus {
        let mut state = self.state.lock();
        loop {
            let now = Instant::now();
            state.promote_due(now);
            if let Some(event) = state.take_ready() {
                return NextStatus::Ready(event);
            }
            if state.shutdown {
                return NextStatus::Shutdown;
            }
            if now >= deadline {
                return NextStatus::Timeout;
            }
            let wake_at = state
                .next_alarm()
                .map_or(deadline, |alarm| alarm.min(deadline));
            let _ = self.available.wait_until(&mut state, wake_at);
        }
    }

    fn notify(&self, tag: Tag) {
        let mut state = self.state.lock();
        state.ready.push_back(Ready {
            event: Event::new(tag, true),
            wakeup: true,
        });
        state.stats.notifications += 1;
        state.outstanding_notifications += 1;
        state.stats.max_outstanding_notifications = state
            .stats
            .max_outstanding_notifications
            .max(state.outstanding_notifications);
        drop(state);
        self.available.notify_one();
    }
}
