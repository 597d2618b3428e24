//! Futures driven by the engine loop.
//!
//! [`Engine::spawn`](super::Engine::spawn) boxes a future into a
//! [`SpawnedTask`], a [`Schedulable`] whose waker reschedules it through the
//! engine. Waking from the I/O thread lands in the local queue; waking from
//! anywhere else goes through the remote queue and the wakeup protocol.
//!
//! A `notified` flag collapses repeated wakes into one enqueue, so the task
//! is never linked into two queues at once.
//!
//! Panics raised while polling are caught and surface as
//! [`ErrorKind::TaskPanicked`] on the task's [`JoinHandle`].

use crate::error::{Error, ErrorKind, Result};
use crate::runtime::engine::{Engine, WeakEngine};
use crate::runtime::task::{Schedulable, TaskHeader, TaskRef};
use crate::tracing_compat::{trace, warn};
use crate::transport::CompletionQueue;
use parking_lot::Mutex;
use std::any::Any;
use std::fmt;
use std::future::Future;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll, Wake, Waker};

type BoxFuture = Pin<Box<dyn Future<Output = ()> + Send>>;

/// Extracts a printable message from a panic payload.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// Polls the inner future inside `catch_unwind`.
pub(crate) struct CatchUnwind<F> {
    inner: Pin<Box<F>>,
}

impl<F: Future> CatchUnwind<F> {
    pub(crate) fn new(future: F) -> Self {
        Self {
            inner: Box::pin(future),
        }
    }
}

impl<F: Future> Future for CatchUnwind<F> {
    type Output = std::result::Result<F::Output, Box<dyn Any + Send>>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let inner = self.inner.as_mut();
        match catch_unwind(AssertUnwindSafe(|| inner.poll(cx))) {
            Ok(Poll::Pending) => Poll::Pending,
            Ok(Poll::Ready(value)) => Poll::Ready(Ok(value)),
            Err(payload) => Poll::Ready(Err(payload)),
        }
    }
}

struct JoinState<T> {
    result: Option<Result<T>>,
    waker: Option<Waker>,
}

impl<T> JoinState<T> {
    const fn new() -> Self {
        Self {
            result: None,
            waker: None,
        }
    }
}

/// Producing side of a [`JoinHandle`].
pub(crate) struct JoinSender<T> {
    state: Arc<Mutex<JoinState<T>>>,
}

impl<T> JoinSender<T> {
    /// Stores the result and wakes the awaiting consumer.
    pub(crate) fn send(self, result: Result<T>) {
        let waker = {
            let mut guard = self.state.lock();
            guard.result = Some(result);
            guard.waker.take()
        };
        if let Some(waker) = waker {
            waker.wake();
        }
    }
}

/// Creates a connected sender / handle pair.
pub(crate) fn join_pair<T>() -> (JoinSender<T>, JoinHandle<T>) {
    let state = Arc::new(Mutex::new(JoinState::new()));
    (
        JoinSender {
            state: Arc::clone(&state),
        },
        JoinHandle { state },
    )
}

/// A join handle returned by [`Engine::spawn`](super::Engine::spawn),
/// [`WorkerPool::spawn`](super::WorkerPool::spawn) and the executor's spawn
/// methods.
///
/// Dropping the handle detaches the task; it keeps running.
pub struct JoinHandle<T> {
    state: Arc<Mutex<JoinState<T>>>,
}

impl<T> JoinHandle<T> {
    /// Returns true if the task has completed.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.state.lock().result.is_some()
    }
}

impl<T> Future for JoinHandle<T> {
    type Output = Result<T>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut guard = self.state.lock();
        guard.result.take().map_or_else(
            || {
                guard.waker = Some(cx.waker().clone());
                Poll::Pending
            },
            Poll::Ready,
        )
    }
}

impl<T> fmt::Debug for JoinHandle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JoinHandle")
            .field("finished", &self.is_finished())
            .finish()
    }
}

/// A boxed future scheduled on an engine.
///
/// Holds only a weak engine handle: a task parked in the engine's own queues
/// must not keep the engine alive. Wakes after the engine is gone are dropped.
pub(crate) struct SpawnedTask<Q: CompletionQueue> {
    header: TaskHeader,
    engine: WeakEngine<Q>,
    notified: AtomicBool,
    future: Mutex<Option<BoxFuture>>,
}

impl<Q: CompletionQueue> SpawnedTask<Q> {
    /// Wraps `future`; the caller schedules the returned task.
    ///
    /// The task starts out notified, so wakes before its first poll are
    /// absorbed by that poll.
    pub(crate) fn new<F>(engine: &Engine<Q>, future: F) -> (Arc<Self>, JoinHandle<F::Output>)
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        let (sender, handle) = join_pair();
        let wrapped = async move {
            let result = CatchUnwind::new(future).await.map_err(|payload| {
                let message = panic_message(payload.as_ref());
                warn!(%message, "spawned task panicked");
                Error::new(ErrorKind::TaskPanicked).with_message(message)
            });
            sender.send(result);
        };
        let task = Arc::new(Self {
            header: TaskHeader::new(),
            engine: engine.downgrade(),
            notified: AtomicBool::new(true),
            future: Mutex::new(Some(Box::pin(wrapped))),
        });
        (task, handle)
    }
}

impl<Q: CompletionQueue> Schedulable for SpawnedTask<Q> {
    fn header(&self) -> &TaskHeader {
        &self.header
    }

    fn execute(self: Arc<Self>, _ok: bool) {
        self.notified.store(false, Ordering::Release);
        let waker = Waker::from(Arc::clone(&self));
        let mut cx = Context::from_waker(&waker);
        let mut slot = self.future.lock();
        if let Some(future) = slot.as_mut() {
            if future.as_mut().poll(&mut cx).is_ready() {
                *slot = None;
            }
        }
    }

    fn discard(&self) {
        let future = self.future.lock().take();
        drop(future);
    }
}

impl<Q: CompletionQueue> Wake for SpawnedTask<Q> {
    fn wake(self: Arc<Self>) {
        self.wake_by_ref();
    }

    fn wake_by_ref(self: &Arc<Self>) {
        if self.notified.swap(true, Ordering::AcqRel) {
            return;
        }
        match self.engine.upgrade() {
            Some(engine) => engine.schedule_task(Arc::clone(self) as TaskRef),
            None => trace!("wake for task of a dropped engine ignored"),
        }
    }
}
