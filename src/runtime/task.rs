//! Schedulable units.
//!
//! A task is whatever a suspended consumer leaves behind for the engine to
//! resume: a [`TaskHeader`] holding the enqueued flag, plus a type-erased
//! [`Schedulable::execute`] entry point. Consumers own their task (it lives
//! in the shared state of their operation future); the engine only holds a
//! [`TaskRef`] while the task is linked into a queue or registered under a
//! transport tag.
//!
//! # Enqueued flag
//!
//! | Value | Meaning |
//! |-------|---------|
//! | 0 | not linked into any queue |
//! | 1 | linked into the local or remote queue |
//!
//! The flag is set exactly once per enqueue and cleared exactly once per
//! dequeue, so a task can never sit in two queues at once.

use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

/// Shared reference to a type-erased task.
pub type TaskRef = Arc<dyn Schedulable>;

/// Queue-membership state embedded in every task.
#[derive(Default)]
pub struct TaskHeader {
    enqueued: AtomicU8,
}

impl TaskHeader {
    /// Creates a header for a task that is not queued.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            enqueued: AtomicU8::new(0),
        }
    }

    /// Returns true while the task is linked into a queue.
    #[must_use]
    pub fn is_enqueued(&self) -> bool {
        self.enqueued.load(Ordering::Acquire) != 0
    }

    /// Marks the task as linked into a queue.
    pub(crate) fn mark_enqueued(&self) {
        let prev = self.enqueued.fetch_add(1, Ordering::AcqRel);
        debug_assert_eq!(prev, 0, "task enqueued twice");
    }

    /// Clears the enqueued flag when the task leaves its queue.
    pub(crate) fn mark_dequeued(&self) {
        let prev = self.enqueued.fetch_sub(1, Ordering::AcqRel);
        debug_assert_eq!(prev, 1, "task dequeued while not enqueued");
    }
}

impl fmt::Debug for TaskHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskHeader")
            .field("enqueued", &self.enqueued.load(Ordering::Relaxed))
            .finish()
    }
}

impl Drop for TaskHeader {
    fn drop(&mut self) {
        if std::thread::panicking() {
            return;
        }
        debug_assert_eq!(
            *self.enqueued.get_mut(),
            0,
            "task dropped while still enqueued"
        );
    }
}

/// A unit the engine can resume.
///
/// `execute` is invoked on the I/O thread, exactly once per dequeue or per
/// delivered completion, with `ok = true` for scheduled runs and the
/// transport status for completions.
pub trait Schedulable: Send + Sync + 'static {
    /// Returns the queue-membership header of this task.
    fn header(&self) -> &TaskHeader;

    /// Resumes the task.
    fn execute(self: Arc<Self>, ok: bool);

    /// Called instead of [`execute`](Self::execute) when the engine drops
    /// the task without running it. Releases whatever the task holds that
    /// may refer back to it, such as a waker of the future awaiting it.
    fn discard(&self) {}
}


#[cfg(test)]
mod tests {
    use super::test_support::RecordingTask;
    use super::*;
    use parking_lot::Mutex;

    #[test]
    fn enqueue_dequeue_cycle() {
        let header = TaskHeader::new();
        assert!(!header.is_enqueued());
        header.mark_enqueued();
        assert!(header.is_enqueued());
        header.mark_dequeued();
        assert!(!header.is_enqueued());
        header.mark_enqueued();
        header.mark_dequeued();
        assert!(!header.is_enqueued());
    }

    #[test]
    fn type_erased_execute() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let task: TaskRef = RecordingTask::new(5, &log);
        Arc::clone(&task).execute(false);
        task.execute(true);
        assert_eq!(*log.lock(), vec![(5, false), (5, true)]);
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic(expected = "task enqueued twice")]
    fn double_enqueue_is_caught() {
        let header = TaskHeader::new();
        header.mark_enqueued();
        header.mark_enqueued();
    }
}
