//! The two operations consumers await.
//!
//! - [`Completion`]: run an initiator on the I/O thread, then resume with the
//!   boolean status the transport reports for the initiator's tag.
//! - [`Schedule`]: resume once the consumer has been moved onto the I/O
//!   thread. This is the engine's only cooperative cancellation checkpoint.
//!
//! Both futures allocate their task on first poll, store the waker, and only
//! then hand the task to the engine, so a resumption can never race ahead of
//! the waker it needs.

use crate::error::{Error, Result};
use crate::runtime::engine::{Engine, WeakEngine};
use crate::runtime::stop::StopToken;
use crate::runtime::task::{Schedulable, TaskHeader, TaskRef};
use crate::tracing_compat::trace;
use crate::transport::{CompletionQueue, Tag};
use parking_lot::Mutex;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll, Waker};

/// Value handed from the I/O thread to the suspended consumer.
struct ResumeSlot<T> {
    value: Option<T>,
    waker: Option<Waker>,
}

impl<T> ResumeSlot<T> {
    fn waiting(waker: &Waker) -> Mutex<Self> {
        Mutex::new(Self {
            value: None,
            waker: Some(waker.clone()),
        })
    }
}

fn resume<T>(slot: &Mutex<ResumeSlot<T>>, value: T) {
    let waker = {
        let mut slot = slot.lock();
        slot.value = Some(value);
        slot.waker.take()
    };
    if let Some(waker) = waker {
        waker.wake();
    }
}

fn poll_slot<T>(slot: &Mutex<ResumeSlot<T>>, cx: &Context<'_>) -> Poll<T> {
    let mut slot = slot.lock();
    if let Some(value) = slot.value.take() {
        return Poll::Ready(value);
    }
    match &slot.waker {
        Some(waker) if waker.will_wake(cx.waker()) => {}
        _ => slot.waker = Some(cx.waker().clone()),
    }
    Poll::Pending
}

// ============================================================================
// Completion
// ============================================================================

const HOPPING: u8 = 0;
const REGISTERED: u8 = 1;

struct CompletionOp<Q: CompletionQueue, F> {
    header: TaskHeader,
    engine: WeakEngine<Q>,
    initiator: Mutex<Option<F>>,
    phase: AtomicU8,
    slot: Mutex<ResumeSlot<bool>>,
}

impl<Q, F> CompletionOp<Q, F>
where
    Q: CompletionQueue,
    F: FnOnce(&Q, Tag) + Send + 'static,
{
    /// Registers with the transport. Runs on the I/O thread.
    fn start_io(self: &Arc<Self>) {
        let Some(engine) = self.engine.upgrade() else {
            return;
        };
        let Some(initiator) = self.initiator.lock().take() else {
            return;
        };
        self.phase.store(REGISTERED, Ordering::Release);
        let tag = engine.register(Arc::clone(self) as TaskRef);
        initiator(engine.queue(), tag);
    }
}

impl<Q, F> Schedulable for CompletionOp<Q, F>
where
    Q: CompletionQueue,
    F: FnOnce(&Q, Tag) + Send + 'static,
{
    fn header(&self) -> &TaskHeader {
        &self.header
    }

    fn execute(self: Arc<Self>, ok: bool) {
        if self.phase.load(Ordering::Acquire) == HOPPING {
            self.start_io();
        } else {
            resume(&self.slot, ok);
        }
    }

    fn discard(&self) {
        let initiator = self.initiator.lock().take();
        let waker = self.slot.lock().waker.take();
        drop((initiator, waker));
    }
}

enum CompletionState<Q: CompletionQueue, F> {
    Init(F),
    Waiting(Arc<CompletionOp<Q, F>>),
    Done,
}

/// Future returned by [`Engine::completion`].
///
/// Resolves to the transport's status for the registered operation. The
/// initiator always runs on the I/O thread: polled elsewhere, the future
/// first hops there through the remote queue. A stop token has no effect on
/// this future; an operation that should be cancellable must be cancelled
/// through the transport.
#[must_use = "futures do nothing unless polled"]
pub struct Completion<Q: CompletionQueue, F> {
    engine: Engine<Q>,
    state: CompletionState<Q, F>,
}

impl<Q: CompletionQueue, F> Completion<Q, F> {
    pub(crate) fn new(engine: Engine<Q>, initiator: F) -> Self {
        Self {
            engine,
            state: CompletionState::Init(initiator),
        }
    }
}

// The initiator is moved out before use and never pinned.
impl<Q: CompletionQueue, F> Unpin for Completion<Q, F> {}

impl<Q, F> Future for Completion<Q, F>
where
    Q: CompletionQueue,
    F: FnOnce(&Q, Tag) + Send + 'static,
{
    type Output = bool;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<bool> {
        let this = self.get_mut();
        match std::mem::replace(&mut this.state, CompletionState::Done) {
            CompletionState::Init(initiator) => {
                let op = Arc::new(CompletionOp {
                    header: TaskHeader::new(),
                    engine: this.engine.downgrade(),
                    initiator: Mutex::new(Some(initiator)),
                    phase: AtomicU8::new(HOPPING),
                    slot: ResumeSlot::waiting(cx.waker()),
                });
                this.state = CompletionState::Waiting(Arc::clone(&op));
                if this.engine.is_on_io_thread() {
                    op.start_io();
                } else {
                    trace!(engine = this.engine.id(), "completion hopping to I/O thread");
                    this.engine.schedule_task(op);
                }
                Poll::Pending
            }
            CompletionState::Waiting(op) => {
                let poll = poll_slot(&op.slot, cx);
                if poll.is_pending() {
                    this.state = CompletionState::Waiting(op);
                }
                poll
            }
            CompletionState::Done => panic!("`Completion` polled after completion"),
        }
    }
}

impl<Q: CompletionQueue, F> fmt::Debug for Completion<Q, F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match &self.state {
            CompletionState::Init(_) => "init",
            CompletionState::Waiting(_) => "waiting",
            CompletionState::Done => "done",
        };
        f.debug_struct("Completion")
            .field("engine", &self.engine.id())
            .field("state", &state)
            .finish()
    }
}

// ============================================================================
// Schedule
// ============================================================================

struct ScheduleOp {
    header: TaskHeader,
    stop: StopToken,
    slot: Mutex<ResumeSlot<Result<()>>>,
}

impl Schedulable for ScheduleOp {
    fn header(&self) -> &TaskHeader {
        &self.header
    }

    fn execute(self: Arc<Self>, _ok: bool) {
        let outcome = if self.stop.is_stop_requested() {
            Err(Error::cancelled())
        } else {
            Ok(())
        };
        resume(&self.slot, outcome);
    }

    fn discard(&self) {
        let waker = self.slot.lock().waker.take();
        drop(waker);
    }
}

/// Future returned by [`Engine::schedule`].
///
/// Resolves with `Ok(())` on the I/O thread's next drain pass, or with
/// [`ErrorKind::Cancelled`](crate::ErrorKind::Cancelled) if its stop token
/// was signaled by the time the pass reached it.
#[must_use = "futures do nothing unless polled"]
pub struct Schedule<Q: CompletionQueue> {
    engine: Engine<Q>,
    stop: StopToken,
    op: Option<Arc<ScheduleOp>>,
}

impl<Q: CompletionQueue> Schedule<Q> {
    pub(crate) fn new(engine: Engine<Q>) -> Self {
        Self {
            engine,
            stop: StopToken::never(),
            op: None,
        }
    }

    /// Checks `token` when the scheduled resumption runs.
    pub fn with_stop_token(mut self, token: StopToken) -> Self {
        self.stop = token;
        self
    }
}

impl<Q: CompletionQueue> Future for Schedule<Q> {
    type Output = Result<()>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        if let Some(op) = &this.op {
            return poll_slot(&op.slot, cx);
        }
        let op = Arc::new(ScheduleOp {
            header: TaskHeader::new(),
            stop: this.stop.clone(),
            slot: ResumeSlot::waiting(cx.waker()),
        });
        this.op = Some(Arc::clone(&op));
        this.engine.schedule_task(op);
        Poll::Pending
    }
}

impl<Q: CompletionQueue> fmt::Debug for Schedule<Q> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Schedule")
            .field("engine", &self.engine.id())
            .field("stop", &self.stop)
            .field("scheduled", &self.op.is_some())
            .finish()
    }
}
