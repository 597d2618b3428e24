//! I/O-thread local ready queue.
//!
//! Only the thread running the engine loop ever touches this queue, so it is
//! a plain FIFO with no synchronization. A drain pass takes the whole queue
//! with [`take_batch`](LocalQueue::take_batch) and runs it to completion;
//! anything scheduled while the batch runs lands in the freshly emptied
//! queue and waits for the next pass.

use crate::runtime::task::TaskRef;
use std::collections::VecDeque;
use std::fmt;

/// FIFO queue of ready tasks, owned by the loop.
#[derive(Default)]
pub struct LocalQueue {
    tasks: VecDeque<TaskRef>,
}

impl LocalQueue {
    /// Creates an empty queue.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a task. The caller has already set its enqueued flag.
    pub fn push_back(&mut self, task: TaskRef) {
        debug_assert!(task.header().is_enqueued());
        self.tasks.push_back(task);
    }

    /// Appends a batch of tasks, keeping their order.
    pub fn append(&mut self, tasks: impl IntoIterator<Item = TaskRef>) {
        self.tasks.extend(tasks);
    }

    /// Removes and returns everything currently queued.
    #[must_use]
    pub fn take_batch(&mut self) -> VecDeque<TaskRef> {
        std::mem::take(&mut self.tasks)
    }

    /// Returns the number of queued tasks.
    #[must_use]
    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    /// Returns true if nothing is queued.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }
}

impl fmt::Debug for LocalQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalQueue")
            .field("len", &self.tasks.len())
            .finish()
    }
}

impl Drop for LocalQueue {
    fn drop(&mut self) {
        // Tasks abandoned with the queue are no longer linked anywhere.
        for task in self.tasks.drain(..) {
            task.header().mark_dequeued();
        }
    }
}
