//! Completion-source abstraction.
//!
//! The engine multiplexes exactly one [`CompletionQueue`] per instance. The
//! queue is the foreign I/O source: operations registered on it carry an
//! opaque [`Tag`], and the queue later hands that tag back together with a
//! boolean status once the operation finishes.
//!
//! # Contract
//!
//! | Method | Behavior |
//! |--------|----------|
//! | [`next`](CompletionQueue::next) | block until a tag is ready; `None` once shut down and drained |
//! | [`next_before`](CompletionQueue::next_before) | wait no later than a deadline; `Timeout` if nothing is ready |
//! | [`notify`](CompletionQueue::notify) | one-shot wakeup delivering a caller-chosen tag through the same path |
//!
//! [`Tag::WAKEUP`] is reserved for the engine's cross-thread wakeup and is
//! never handed out to operations.
//!
//! # Implementations
//!
//! | Queue | Module |
//! |-------|--------|
//! | [`LabQueue`] | in-memory queue for tests and demos (`lab.rs`) |

pub mod lab;

pub use lab::{LabQueue, LabStats};

use std::fmt;
use std::time::Instant;

/// Opaque identifier of exactly one in-flight transport operation.
///
/// The engine packs a slab index and generation into the tag, so a tag that
/// arrives after its slot was recycled does not resolve to the wrong task.
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Tag(u64);

impl Tag {
    /// Reserved sentinel delivered by the engine's wakeup signal.
    pub const WAKEUP: Self = Self(u64::MAX);

    /// Creates a tag from its raw representation.
    #[must_use]
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    /// Returns the raw representation of the tag.
    #[must_use]
    pub const fn into_raw(self) -> u64 {
        self.0
    }

    /// Returns true if this is the reserved wakeup sentinel.
    #[must_use]
    pub const fn is_wakeup(self) -> bool {
        self.0 == u64::MAX
    }
}

impl fmt::Debug for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_wakeup() {
            write!(f, "Tag(WAKEUP)")
        } else {
            write!(f, "Tag({:#x})", self.0)
        }
    }
}

/// A completed operation reported by the queue.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Event {
    /// Tag supplied when the operation was registered.
    pub tag: Tag,
    /// Whether the operation succeeded.
    pub ok: bool,
}

impl Event {
    /// Creates a new event.
    #[must_use]
    pub const fn new(tag: Tag, ok: bool) -> Self {
        Self { tag, ok }
    }
}

/// Result of a deadline-bounded poll.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum NextStatus {
    /// An event was ready before the deadline.
    Ready(Event),
    /// The deadline passed without an event.
    Timeout,
    /// The queue has been shut down and fully drained.
    Shutdown,
}

/// A completion-queue based transport.
///
/// Implementations must be usable from any thread: operations are
/// registered on the engine's I/O thread, but [`notify`](Self::notify) is
/// called by whichever producer thread observes the I/O thread going idle.
pub trait CompletionQueue: Send + Sync + 'static {
    /// Blocks until the next completed operation.
    ///
    /// Returns `None` once the queue is shut down and has no more events.
    fn next(&self) -> Option<Event>;

    /// Waits for the next completed operation, no later than `deadline`.
    ///
    /// A deadline in the past turns this into a non-blocking poll.
    fn next_before(&self, deadline: Instant) -> NextStatus;

    /// Registers a one-shot wakeup that delivers `tag` with `ok = true`
    /// through the normal completion path as soon as possible.
    fn notify(&self, tag: Tag);
}

impl<Q: CompletionQueue> CompletionQueue for std::sync::Arc<Q> {
    fn next(&self) -> Option<Event> {
        (**self).next()
    }

    fn next_before(&self, deadline: Instant) -> NextStatus {
        (**self).next_before(deadline)
    }

    fn notify(&self, tag: Tag) {
        (**self).notify(tag);
    }
}
