//! Cross-thread inbox for the I/O thread.
//!
//! Producers on arbitrary threads push tasks here; only the loop consumes.
//! Besides the items, the queue carries one bit of consumer state: whether
//! the I/O thread has declared itself idle. A push atomically clears that bit
//! and reports whether it was set, which tells exactly one producer per idle
//! period that it must wake the I/O thread.
//!
//! # State word
//!
//! ```text
//!  usize:  [ pending count ........................ | INACTIVE ]
//!            bits 1..                                  bit 0
//! ```
//!
//! - `enqueue`: push item, then CAS `count += 1` and clear `INACTIVE`.
//! - `try_mark_inactive_or_dequeue_all`: if `count == 0`, CAS in `INACTIVE`;
//!   otherwise subtract the observed count and pop that many items.
//!
//! Both transitions are CAS loops on the same word, so "drain everything" and
//! "mark idle" can never both succeed against the same snapshot: a push that
//! lands between the emptiness check and the idle mark makes the CAS fail and
//! the consumer retries.

use crate::runtime::task::TaskRef;
use crossbeam_queue::SegQueue;
use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};

const INACTIVE: usize = 1;
const ONE: usize = 2;

/// Multi-producer, single-consumer task inbox with an idle marker.
pub struct RemoteQueue {
    items: SegQueue<TaskRef>,
    state: AtomicUsize,
}

impl RemoteQueue {
    /// Creates a queue whose consumer starts out active.
    ///
    /// Producers pushing before the loop first idles do not need to signal:
    /// the loop always checks this queue before it blocks.
    #[must_use]
    pub fn new() -> Self {
        Self {
            items: SegQueue::new(),
            state: AtomicUsize::new(0),
        }
    }

    /// Creates a queue whose consumer starts out idle.
    #[must_use]
    pub fn new_inactive() -> Self {
        Self {
            items: SegQueue::new(),
            state: AtomicUsize::new(INACTIVE),
        }
    }

    /// Pushes a task.
    ///
    /// Returns `true` if the consumer was marked inactive, in which case the
    /// caller is responsible for waking it.
    pub fn enqueue(&self, task: TaskRef) -> bool {
        self.items.push(task);
        let mut current = self.state.load(Ordering::Acquire);
        loop {
            let next = (current & !INACTIVE) + ONE;
            match self.state.compare_exchange_weak(
                current,
                next,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return current & INACTIVE != 0,
                Err(actual) => current = actual,
            }
        }
    }

    /// Takes every counted item, or marks the consumer inactive if there are none.
    ///
    /// An empty result means the queue was empty and is now marked inactive,
    /// so the next push will report the transition. A non-empty result means
    /// the consumer stays active.
    #[must_use]
    pub fn try_mark_inactive_or_dequeue_all(&self) -> VecDeque<TaskRef> {
        let mut current = self.state.load(Ordering::Acquire);
        loop {
            let pending = current >> 1;
            if pending == 0 {
                match self.state.compare_exchange_weak(
                    current,
                    current | INACTIVE,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                ) {
                    Ok(_) => return VecDeque::new(),
                    Err(actual) => {
                        current = actual;
                        continue;
                    }
                }
            }

            // Only the consumer decrements, so the count cannot shrink under us.
            self.state.fetch_sub(pending * ONE, Ordering::AcqRel);
            let mut batch = VecDeque::with_capacity(pending);
            while batch.len() < pending {
                // Every counted item was pushed before its count was published.
                match self.items.pop() {
                    Some(task) => batch.push_back(task),
                    None => std::hint::spin_loop(),
                }
            }
            return batch;
        }
    }

    /// Returns true if the consumer is currently marked inactive.
    #[must_use]
    pub fn is_inactive(&self) -> bool {
        self.state.load(Ordering::Acquire) & INACTIVE != 0
    }

    /// Returns the number of items published but not yet dequeued.
    #[must_use]
    pub fn len(&self) -> usize {
        self.state.load(Ordering::Acquire) >> 1
    }

    /// Returns true if no published items are waiting.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for RemoteQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for RemoteQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteQueue")
            .field("len", &self.len())
            .field("inactive", &self.is_inactive())
            .finish()
    }
}

impl Drop for RemoteQueue {
    fn drop(&mut self) {
        while let Some(task) = self.items.pop() {
            task.header().mark_dequeued();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::task::Schedulable;
    use crate::runtime::task::test_support::RecordingTask;
    use parking_lot::Mutex;
    use proptest::prelude::*;
    use std::sync::{Arc, Barrier};
    use std::thread;

    fn push(queue: &RemoteQueue, id: usize, log: &Arc<Mutex<Vec<(usize, bool)>>>) -> bool {
        let task = RecordingTask::new(id, log);
        task.header().mark_enqueued();
        queue.enqueue(task)
    }

    fn run_batch(batch: VecDeque<TaskRef>) -> usize {
        let n = batch.len();
        for task in batch {
            task.header().mark_dequeued();
            task.execute(true);
        }
        n
    }

    #[test]
    fn starts_active() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let queue = RemoteQueue::new();
        assert!(!queue.is_inactive());
        assert!(!push(&queue, 1, &log), "active consumer needs no wakeup");
    }

    #[test]
    fn idle_transition_reported_once() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let queue = RemoteQueue::new();

        assert!(queue.try_mark_inactive_or_dequeue_all().is_empty());
        assert!(queue.is_inactive());

        assert!(push(&queue, 1, &log), "first push after idle must wake");
        assert!(!push(&queue, 2, &log), "second push must not wake again");
        assert!(!queue.is_inactive());
        assert_eq!(queue.len(), 2);

        let drained = run_batch(queue.try_mark_inactive_or_dequeue_all());
        assert_eq!(drained, 2);
        assert!(!queue.is_inactive(), "drain keeps the consumer active");

        assert!(queue.try_mark_inactive_or_dequeue_all().is_empty());
        assert!(push(&queue, 3, &log));
    }

    #[test]
    fn drain_is_fifo_for_single_producer() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let queue = RemoteQueue::new();
        for id in 0..5 {
            push(&queue, id, &log);
        }
        run_batch(queue.try_mark_inactive_or_dequeue_all());
        let ids: Vec<usize> = log.lock().iter().map(|(id, _)| *id).collect();
        assert_eq!(ids, vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn inactive_constructor() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let queue = RemoteQueue::new_inactive();
        assert!(queue.is_inactive());
        assert!(push(&queue, 0, &log));
    }

    #[test]
    fn concurrent_producers_exactly_once() {
        const PRODUCERS: usize = 8;
        const PER_PRODUCER: usize = 250;

        let log = Arc::new(Mutex::new(Vec::new()));
        let queue = Arc::new(RemoteQueue::new());
        let wakeups = Arc::new(AtomicUsize::new(0));
        let barrier = Arc::new(Barrier::new(PRODUCERS + 1));

        let handles: Vec<_> = (0..PRODUCERS)
            .map(|p| {
                let queue = Arc::clone(&queue);
                let log = Arc::clone(&log);
                let wakeups = Arc::clone(&wakeups);
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    for i in 0..PER_PRODUCER {
                        if push(&queue, p * PER_PRODUCER + i, &log) {
                            wakeups.fetch_add(1, Ordering::Relaxed);
                        }
                    }
                })
            })
            .collect();

        barrier.wait();
        let mut idle_marks = 0usize;
        let mut drained = 0usize;
        while drained < PRODUCERS * PER_PRODUCER {
            let batch = queue.try_mark_inactive_or_dequeue_all();
            if batch.is_empty() {
                idle_marks += 1;
                thread::yield_now();
            } else {
                drained += run_batch(batch);
            }
        }
        for handle in handles {
            handle.join().expect("producer panicked");
        }

        let mut ids: Vec<usize> = log.lock().iter().map(|(id, _)| *id).collect();
        assert_eq!(ids.len(), PRODUCERS * PER_PRODUCER, "no duplicates");
        ids.sort_unstable();
        ids.dedup();
        assert_eq!(ids.len(), PRODUCERS * PER_PRODUCER);
        // Each idle mark is answered by at most one wakeup.
        assert!(wakeups.load(Ordering::Relaxed) <= idle_marks);
        assert!(queue.is_empty());
    }

    proptest! {
        #[test]
        fn interleaved_pushes_and_drains_match_model(
            ops in proptest::collection::vec(any::<bool>(), 1..128)
        ) {
            let log = Arc::new(Mutex::new(Vec::new()));
            let queue = RemoteQueue::new();
            let mut idle = false;
            let mut next_id = 0usize;
            for push_op in ops {
                if push_op {
                    let woke = push(&queue, next_id, &log);
                    prop_assert_eq!(woke, idle);
                    idle = false;
                    next_id += 1;
                } else {
                    let batch = queue.try_mark_inactive_or_dequeue_all();
                    idle = batch.is_empty();
                    run_batch(batch);
                }
                prop_assert_eq!(queue.is_inactive(), idle);
            }
            run_batch(queue.try_mark_inactive_or_dequeue_all());
            let ids: Vec<usize> = log.lock().iter().map(|(id, _)| *id).collect();
            prop_assert_eq!(ids, (0..next_id).collect::<Vec<_>>());
        }
    }
}
