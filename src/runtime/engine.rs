//! The execution engine.
//!
//! An [`Engine`] multiplexes one [`CompletionQueue`] with two task queues on
//! a single designated thread, the *I/O thread*: whichever thread is inside
//! [`Engine::run`]. Only that thread touches the local queue, the tag slab,
//! and the blocking reads on the completion source. Every other thread talks
//! to the loop through the remote queue.
//!
//! # Loop
//!
//! ```text
//! loop {
//!     1. run the local queue's current contents (one drain pass)
//!     2. stop requested?                        -> return
//!     3. no read outstanding?  drain remote queue into local queue,
//!                              or mark it idle (read now outstanding)
//!     4. read outstanding?     wait on the completion source (blocking
//!                              only if the local queue is empty), dispatch
//!                              tags until nothing is immediately ready
//! }
//! ```
//!
//! # Wakeup protocol
//!
//! A remote push that flips the queue from idle to active must wake the
//! loop, which may be blocked inside the completion source. The pusher claims
//! the `notifying` flag and asks the source to deliver [`Tag::WAKEUP`]. The
//! loop clears the flag when the sentinel arrives, so at most one wakeup is
//! ever outstanding and every idle mark is answered by exactly one signal.
//!
//! # Thread affinity
//!
//! The loop-owned state ([`LoopState`]) lives in a thread-local slot while
//! the loop runs and is parked inside the engine between runs. "Am I the I/O
//! thread" is answered by checking whether the slot holds this engine's
//! state.

use crate::error::{Error, ErrorKind, Result};
use crate::runtime::config::{EngineConfig, ShutdownPolicy};
use crate::runtime::ops::{Completion, Schedule};
use crate::runtime::scheduler::{LocalQueue, RemoteQueue};
use crate::runtime::spawn::{JoinHandle, SpawnedTask};
use crate::runtime::stop::StopToken;
use crate::runtime::tag_slab::TagSlab;
use crate::runtime::task::{Schedulable, TaskHeader, TaskRef};
use crate::tracing_compat::{debug, error, trace, warn};
use crate::transport::{CompletionQueue, Event, NextStatus, Tag};
use parking_lot::Mutex;
use std::cell::RefCell;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Instant;

/// Process exit status used by [`ShutdownPolicy::Exit`].
pub const FATAL_EXIT_CODE: i32 = 255;

static NEXT_ENGINE_ID: AtomicU64 = AtomicU64::new(1);

thread_local! {
    static CURRENT_LOOP: RefCell<Option<LoopState>> = const { RefCell::new(None) };
}

/// State only the I/O thread may touch.
struct LoopState {
    engine: u64,
    local: LocalQueue,
    tags: TagSlab,
    /// The remote queue is marked idle and the loop relies on a wakeup.
    read_submitted: bool,
}

impl LoopState {
    fn new(engine: u64) -> Self {
        Self {
            engine,
            local: LocalQueue::new(),
            tags: TagSlab::new(),
            read_submitted: false,
        }
    }
}

/// Counters describing what the loop has done so far.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EngineStats {
    /// Loop iterations started.
    pub iterations: u64,
    /// Tasks run from the local queue.
    pub tasks_executed: u64,
    /// Completion tags dispatched to their tasks.
    pub completions_dispatched: u64,
    /// Wakeups requested from the completion source.
    pub wakeups_signaled: u64,
}

#[derive(Default)]
struct StatsCell {
    iterations: AtomicU64,
    tasks_executed: AtomicU64,
    completions_dispatched: AtomicU64,
    wakeups_signaled: AtomicU64,
}

impl StatsCell {
    fn snapshot(&self) -> EngineStats {
        EngineStats {
            iterations: self.iterations.load(Ordering::Relaxed),
            tasks_executed: self.tasks_executed.load(Ordering::Relaxed),
            completions_dispatched: self.completions_dispatched.load(Ordering::Relaxed),
            wakeups_signaled: self.wakeups_signaled.load(Ordering::Relaxed),
        }
    }
}

struct EngineInner<Q> {
    id: u64,
    queue: Q,
    remote: RemoteQueue,
    /// A wakeup has been requested and not yet consumed by the loop.
    notifying: AtomicBool,
    /// Loop state while no thread is running the loop.
    parked: Mutex<Option<LoopState>>,
    config: EngineConfig,
    stats: StatsCell,
}

/// Handle to an execution engine bound to one completion queue.
///
/// Cloning the handle is cheap; all clones drive the same engine.
pub struct Engine<Q: CompletionQueue> {
    inner: Arc<EngineInner<Q>>,
}

impl<Q: CompletionQueue> Engine<Q> {
    /// Creates an engine with the default configuration.
    #[must_use]
    pub fn new(queue: Q) -> Self {
        Self::with_config(queue, EngineConfig::default())
    }

    /// Creates an engine with an explicit configuration.
    #[must_use]
    pub fn with_config(queue: Q, mut config: EngineConfig) -> Self {
        config.normalize();
        let id = NEXT_ENGINE_ID.fetch_add(1, Ordering::Relaxed);
        Self {
            inner: Arc::new(EngineInner {
                id,
                queue,
                remote: RemoteQueue::new(),
                notifying: AtomicBool::new(false),
                parked: Mutex::new(Some(LoopState::new(id))),
                config,
                stats: StatsCell::default(),
            }),
        }
    }

    /// Returns the process-unique id of this engine.
    #[must_use]
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    /// Returns the completion queue this engine multiplexes.
    #[must_use]
    pub fn queue(&self) -> &Q {
        &self.inner.queue
    }

    /// Returns the engine configuration.
    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    /// Returns a snapshot of the loop counters.
    #[must_use]
    pub fn stats(&self) -> EngineStats {
        self.inner.stats.snapshot()
    }

    /// Returns true if the calling thread is currently running this engine's loop.
    #[must_use]
    pub fn is_on_io_thread(&self) -> bool {
        CURRENT_LOOP.with(|slot| {
            slot.borrow()
                .as_ref()
                .is_some_and(|state| state.engine == self.inner.id)
        })
    }

    /// Runs the loop on the calling thread until the process is torn down.
    ///
    /// Returns only on error; see [`run_until`](Self::run_until).
    pub fn run(&self) -> Result<()> {
        self.run_until(&StopToken::never())
    }

    /// Runs the loop on the calling thread until `stop` is signaled.
    ///
    /// The stop is delivered as a scheduled task, so work already queued when
    /// the stop is requested still runs first.
    ///
    /// # Errors
    ///
    /// - [`ErrorKind::AlreadyRunning`] if another `run` is active on this engine.
    /// - [`ErrorKind::TransportShutdown`] if the completion source shuts down
    ///   under [`ShutdownPolicy::ReturnError`].
    pub fn run_until(&self, stop: &StopToken) -> Result<()> {
        let state = self.inner.parked.lock().take().ok_or_else(|| {
            Error::new(ErrorKind::AlreadyRunning)
                .with_message(format!("engine {} loop is already running", self.inner.id))
        })?;

        let stop_task = Arc::new(StopTask::default());
        let _registration = {
            let engine = self.clone();
            let task = Arc::clone(&stop_task);
            stop.on_stop(move || engine.schedule_task(task))
        };

        let _guard = LoopGuard::enter(self, state);
        debug!(engine = self.inner.id, "engine loop started");
        let result = self.run_loop(&stop_task);
        debug!(engine = self.inner.id, ok = result.is_ok(), "engine loop exited");
        result
    }

    fn run_loop(&self, stop: &StopTask) -> Result<()> {
        loop {
            self.inner.stats.iterations.fetch_add(1, Ordering::Relaxed);
            self.execute_pending_local();
            if stop.is_fired() {
                return Ok(());
            }
            if !self.with_loop(|state| state.read_submitted) {
                let idle = self.try_schedule_local_remote_queue_contents();
                self.with_loop(|state| state.read_submitted = idle);
            }
            let (read_submitted, local_empty) =
                self.with_loop(|state| (state.read_submitted, state.local.is_empty()));
            if read_submitted {
                // Block only while no local work is queued.
                self.acquire_completion_queue_items(local_empty)?;
            }
        }
    }

    /// Schedules `task` to run on the I/O thread.
    ///
    /// On the I/O thread the task goes straight to the local queue; anywhere
    /// else it goes to the remote queue, waking the loop if it was idle.
    ///
    /// # Panics
    ///
    /// Panics in debug builds if `task` is already enqueued.
    pub fn schedule_task(&self, task: TaskRef) {
        task.header().mark_enqueued();
        if let Err(task) = self.push_local(task) {
            self.push_remote(task);
        }
    }

    fn push_local(&self, task: TaskRef) -> std::result::Result<(), TaskRef> {
        CURRENT_LOOP.with(|slot| match slot.borrow_mut().as_mut() {
            Some(state) if state.engine == self.inner.id => {
                state.local.push_back(task);
                Ok(())
            }
            _ => Err(task),
        })
    }

    fn push_remote(&self, task: TaskRef) {
        if self.inner.remote.enqueue(task) {
            self.signal_remote_queue();
        }
    }

    /// Wakes the loop after the remote queue left the idle state.
    fn signal_remote_queue(&self) {
        if self
            .inner
            .notifying
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            self.inner
                .stats
                .wakeups_signaled
                .fetch_add(1, Ordering::Relaxed);
            trace!(engine = self.inner.id, "signaling remote queue wakeup");
            self.inner.queue.notify(Tag::WAKEUP);
        }
    }

    /// Runs every task queued at the start of the pass, in FIFO order.
    fn execute_pending_local(&self) -> usize {
        let batch = self.with_loop(|state| state.local.take_batch());
        let count = batch.len();
        if count == 0 {
            return 0;
        }
        for task in batch {
            task.header().mark_dequeued();
            task.execute(true);
        }
        self.inner
            .stats
            .tasks_executed
            .fetch_add(count as u64, Ordering::Relaxed);
        trace!(engine = self.inner.id, count, "local drain pass");
        count
    }

    /// Moves the remote queue into the local queue, or marks it idle.
    ///
    /// Returns `true` if the queue was empty and is now idle, so the loop may
    /// block on the completion source.
    fn try_schedule_local_remote_queue_contents(&self) -> bool {
        let batch = self.inner.remote.try_mark_inactive_or_dequeue_all();
        if batch.is_empty() {
            trace!(engine = self.inner.id, "remote queue idle");
            return true;
        }
        trace!(engine = self.inner.id, count = batch.len(), "remote queue drained");
        self.with_loop(|state| state.local.append(batch));
        false
    }

    /// Waits for one completion, then dispatches whatever else is ready.
    ///
    /// With `block == false` the first read only takes an event that is
    /// already ready.
    fn acquire_completion_queue_items(&self, block: bool) -> Result<()> {
        let first = if block {
            self.inner.queue.next()
        } else {
            match self.inner.queue.next_before(Instant::now()) {
                NextStatus::Ready(event) => Some(event),
                NextStatus::Timeout => return Ok(()),
                NextStatus::Shutdown => None,
            }
        };
        let Some(mut event) = first else {
            return self.on_transport_shutdown();
        };
        let mut handled = 0usize;
        loop {
            if event.tag.is_wakeup() {
                trace!(engine = self.inner.id, "wakeup received");
                self.inner.notifying.store(false, Ordering::Release);
                self.with_loop(|state| state.read_submitted = false);
                return Ok(());
            }

            self.dispatch(event);
            handled += 1;
            if handled >= self.inner.config.completion_batch_limit {
                return Ok(());
            }

            match self.inner.queue.next_before(Instant::now()) {
                NextStatus::Ready(next) => event = next,
                NextStatus::Timeout => return Ok(()),
                NextStatus::Shutdown => return self.on_transport_shutdown(),
            }
        }
    }

    fn dispatch(&self, event: Event) {
        match self.with_loop(|state| state.tags.remove(event.tag)) {
            Some(task) => {
                self.inner
                    .stats
                    .completions_dispatched
                    .fetch_add(1, Ordering::Relaxed);
                task.execute(event.ok);
            }
            None => warn!(
                engine = self.inner.id,
                tag = ?event.tag,
                ok = event.ok,
                "completion for unknown tag dropped"
            ),
        }
    }

    fn on_transport_shutdown(&self) -> Result<()> {
        match self.inner.config.shutdown_policy {
            ShutdownPolicy::Exit => {
                error!(
                    engine = self.inner.id,
                    "completion queue shut down while the loop was running; terminating process"
                );
                std::process::exit(FATAL_EXIT_CODE)
            }
            ShutdownPolicy::ReturnError => {
                error!(
                    engine = self.inner.id,
                    "completion queue shut down while the loop was running"
                );
                Err(Error::new(ErrorKind::TransportShutdown)
                    .with_message("completion queue shut down while the loop was running"))
            }
        }
    }

    /// Parks `task` until the transport reports the returned tag.
    ///
    /// Must be called on the I/O thread.
    pub(crate) fn register(&self, task: TaskRef) -> Tag {
        let tag = self.with_loop(|state| state.tags.insert(task));
        trace!(engine = self.inner.id, ?tag, "operation registered");
        tag
    }

    /// Returns the number of operations waiting for a completion.
    ///
    /// Only meaningful on the I/O thread or while the loop is not running;
    /// returns `None` if another thread is running the loop.
    #[must_use]
    pub fn pending_operations(&self) -> Option<usize> {
        if self.is_on_io_thread() {
            return Some(self.with_loop(|state| state.tags.len()));
        }
        self.inner.parked.lock().as_ref().map(|state| state.tags.len())
    }

    fn with_loop<R>(&self, f: impl FnOnce(&mut LoopState) -> R) -> R {
        CURRENT_LOOP.with(|slot| match slot.borrow_mut().as_mut() {
            Some(state) if state.engine == self.inner.id => f(state),
            _ => unreachable!("loop state of engine {} used off its I/O thread", self.inner.id),
        })
    }

    pub(crate) fn downgrade(&self) -> WeakEngine<Q> {
        WeakEngine {
            inner: Arc::downgrade(&self.inner),
        }
    }

    /// Drops every queued task and registered operation.
    ///
    /// Futures spawned on the engine usually hold engine handles of their
    /// own; while they sit in its queues the engine cannot be freed. Call
    /// this once the loop will not run again. Returns the number of tasks
    /// dropped.
    ///
    /// # Errors
    ///
    /// [`ErrorKind::AlreadyRunning`] if the loop is running.
    pub fn clear_pending(&self) -> Result<usize> {
        let mut parked = self.inner.parked.lock();
        let Some(state) = parked.as_mut() else {
            return Err(Error::new(ErrorKind::AlreadyRunning)
                .with_message(format!("engine {} loop is running", self.inner.id)));
        };
        let mut queued = state.local.take_batch();
        let registered = state.tags.drain();
        drop(parked);
        // Leaves the idle mark alone; a non-empty queue is never marked idle.
        if !self.inner.remote.is_empty() {
            queued.append(&mut self.inner.remote.try_mark_inactive_or_dequeue_all());
        }
        for task in &queued {
            task.header().mark_dequeued();
        }
        let count = queued.len() + registered.len();
        // Outside the lock: dropping a future may drop engine handles.
        for task in queued.into_iter().chain(registered) {
            task.discard();
        }
        debug!(engine = self.inner.id, count, "pending tasks cleared");
        Ok(count)
    }

    /// Returns a future that resumes once it has been scheduled onto the I/O thread.
    pub fn schedule(&self) -> Schedule<Q> {
        Schedule::new(self.clone())
    }

    /// Returns a future that runs `initiator` on the I/O thread and resolves
    /// with the status the transport reports for the supplied tag.
    ///
    /// `initiator` must register exactly one asynchronous operation on the
    /// queue using the tag it is given.
    pub fn completion<F>(&self, initiator: F) -> Completion<Q, F>
    where
        F: FnOnce(&Q, Tag) + Send + 'static,
    {
        Completion::new(self.clone(), initiator)
    }

    /// Spawns a future driven by this engine's loop.
    ///
    /// The future is first polled on the I/O thread during the next drain
    /// pass, and is re-polled there every time it is woken.
    pub fn spawn<F>(&self, future: F) -> JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        let (task, handle) = SpawnedTask::new(self, future);
        self.schedule_task(task);
        handle
    }
}

/// Non-owning handle to an [`Engine`].
///
/// Tasks the engine itself stores (queued, registered or parked) refer back
/// to it through this handle, so they never keep the engine alive.
pub(crate) struct WeakEngine<Q: CompletionQueue> {
    inner: Weak<EngineInner<Q>>,
}

impl<Q: CompletionQueue> WeakEngine<Q> {
    pub(crate) fn upgrade(&self) -> Option<Engine<Q>> {
        self.inner.upgrade().map(|inner| Engine { inner })
    }
}

impl<Q: CompletionQueue> Clone for Engine<Q> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<Q: CompletionQueue> PartialEq for Engine<Q> {
    fn eq(&self, other: &Self) -> bool {
        self.inner.id == other.inner.id
    }
}

impl<Q: CompletionQueue> Eq for Engine<Q> {}

impl<Q: CompletionQueue> fmt::Debug for Engine<Q> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Engine")
            .field("id", &self.inner.id)
            .field("remote", &self.inner.remote)
            .field("notifying", &self.inner.notifying.load(Ordering::Relaxed))
            .field("running", &self.inner.parked.lock().is_none())
            .finish()
    }
}

/// Installs the loop state on entry, parks it back in the engine on exit.
struct LoopGuard<'a, Q: CompletionQueue> {
    engine: &'a Engine<Q>,
    prev: Option<LoopState>,
}

impl<'a, Q: CompletionQueue> LoopGuard<'a, Q> {
    fn enter(engine: &'a Engine<Q>, state: LoopState) -> Self {
        let prev = CURRENT_LOOP.with(|slot| slot.borrow_mut().replace(state));
        Self { engine, prev }
    }
}

impl<Q: CompletionQueue> Drop for LoopGuard<'_, Q> {
    fn drop(&mut self) {
        let prev = self.prev.take();
        let state = CURRENT_LOOP.with(|slot| std::mem::replace(&mut *slot.borrow_mut(), prev));
        *self.engine.inner.parked.lock() = state;
    }
}

/// Scheduled by the loop's stop callback; observed at the top of an iteration.
#[derive(Default)]
struct StopTask {
    header: TaskHeader,
    fired: AtomicBool,
}

impl StopTask {
    fn is_fired(&self) -> bool {
        self.fired.load(Ordering::Acquire)
    }
}

impl Schedulable for StopTask {
    fn header(&self) -> &TaskHeader {
        &self.header
    }

    fn execute(self: Arc<Self>, _ok: bool) {
        self.fired.store(true, Ordering::Release);
    }
}
