#![allow(dead_code)]
#![allow(unused_imports)]
//! Shared integration test utilities.
//!
//! Import with:
//! ```
//! mod common;
//! use common::*;
//! ```

use cqbridge::grpc::{IncomingCall, Status, StreamingCall};
use cqbridge::runtime::{
    EngineConfig, ExecutorBuilder, Schedulable, ShutdownPolicy, StopSource, StopToken, TaskHeader,
};
use cqbridge::transport::LabQueue;
use cqbridge::{Engine, Executor, Tag};
use parking_lot::Mutex;
use proptest::prelude::ProptestConfig;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Once};
use std::thread;
use std::time::Duration;
use tracing_subscriber::fmt::format::FmtSpan;

static INIT_LOGGING: Once = Once::new();

/// Log a test phase transition with a visual separator.
macro_rules! test_phase {
    ($name:expr) => {
        tracing::info!(phase = %$name, "========================================");
        tracing::info!(phase = %$name, "TEST PHASE: {}", $name);
        tracing::info!(phase = %$name, "========================================");
    };
}

/// Log before assertions for context.
macro_rules! assert_with_log {
    ($cond:expr, $msg:expr, $expected:expr, $actual:expr) => {
        tracing::debug!(
            expected = ?$expected,
            actual = ?$actual,
            "Asserting: {}",
            $msg
        );
        assert!($cond, "{}: expected {:?}, got {:?}", $msg, $expected, $actual);
    };
}

/// Queue type used throughout the integration tests.
pub type Queue = Arc<LabQueue>;

/// Initialize test logging once per test binary.
pub fn init_test_logging() {
    INIT_LOGGING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_max_level(tracing::Level::DEBUG)
            .with_test_writer()
            .with_thread_names(true)
            .with_span_events(FmtSpan::CLOSE)
            .with_ansi(false)
            .try_init();
    });
}

/// Proptest config with a modest case count; the loop spins real threads.
pub fn proptest_config(cases: u32) -> ProptestConfig {
    ProptestConfig::with_cases(cases)
}

/// Engine over a fresh [`LabQueue`] that returns errors instead of exiting.
pub fn lab_engine() -> Engine<Queue> {
    Engine::with_config(
        Arc::new(LabQueue::new()),
        EngineConfig {
            shutdown_policy: ShutdownPolicy::ReturnError,
            ..EngineConfig::default()
        },
    )
}

/// Executor over a fresh [`LabQueue`] with `workers` pool threads.
pub fn lab_executor(workers: usize) -> Executor<Queue> {
    ExecutorBuilder::new()
        .worker_threads(workers)
        .shutdown_policy(ShutdownPolicy::ReturnError)
        .build(Arc::new(LabQueue::new()))
        .expect("build executor")
}

/// How long a test waits on the loop before declaring it hung.
pub const LOOP_DEADLINE: Duration = Duration::from_secs(10);

/// Runs the loop on its own thread until `stop`, failing the test if it has
/// not returned within [`LOOP_DEADLINE`].
pub fn run_bounded(engine: &Engine<Queue>, stop: &StopToken) -> cqbridge::Result<()> {
    let (tx, rx) = mpsc::channel();
    let runner = engine.clone();
    let token = stop.clone();
    thread::Builder::new()
        .name("io".to_string())
        .spawn(move || {
            let result = runner.run_until(&token);
            // Release the engine before reporting, so callers see the final refcount.
            drop(runner);
            let _ = tx.send(result);
        })
        .expect("spawn io thread");
    match rx.recv_timeout(LOOP_DEADLINE) {
        Ok(result) => result,
        Err(mpsc::RecvTimeoutError::Timeout) => {
            panic!("engine loop still running after {LOOP_DEADLINE:?}")
        }
        Err(mpsc::RecvTimeoutError::Disconnected) => panic!("engine loop panicked"),
    }
}

/// Runs an executor's loop on a dedicated thread until shut down.
pub struct IoThread {
    stop: Arc<StopSource>,
    thread: Option<thread::JoinHandle<cqbridge::Result<()>>>,
}

impl IoThread {
    pub fn start(executor: &Executor<Queue>) -> Self {
        let stop = Arc::new(StopSource::new());
        let token = stop.token();
        let runner = executor.clone();
        let thread = thread::Builder::new()
            .name("io".to_string())
            .spawn(move || runner.run_until(&token))
            .expect("spawn io thread");
        Self {
            stop,
            thread: Some(thread),
        }
    }

    pub fn start_engine(engine: &Engine<Queue>) -> Self {
        let stop = Arc::new(StopSource::new());
        let token = stop.token();
        let runner = engine.clone();
        let thread = thread::Builder::new()
            .name("io".to_string())
            .spawn(move || runner.run_until(&token))
            .expect("spawn io thread");
        Self {
            stop,
            thread: Some(thread),
        }
    }

    pub fn shutdown(mut self) -> cqbridge::Result<()> {
        self.stop.request_stop();
        self.thread
            .take()
            .expect("joined twice")
            .join()
            .expect("io thread panicked")
    }
}

impl Drop for IoThread {
    fn drop(&mut self) {
        self.stop.request_stop();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

/// Task that records `(id, ok)` when executed.
pub struct LogTask {
    header: TaskHeader,
    id: usize,
    log: Arc<Mutex<Vec<(usize, bool)>>>,
}

impl LogTask {
    pub fn new(id: usize, log: &Arc<Mutex<Vec<(usize, bool)>>>) -> Arc<Self> {
        Arc::new(Self {
            header: TaskHeader::new(),
            id,
            log: Arc::clone(log),
        })
    }
}

impl Schedulable for LogTask {
    fn header(&self) -> &TaskHeader {
        &self.header
    }

    fn execute(self: Arc<Self>, ok: bool) {
        self.log.lock().push((self.id, ok));
    }
}

// ============================================================================
// Scripted server-streaming call
// ============================================================================

/// Streaming call whose replies and outcomes are fixed up front.
pub struct ScriptedStream {
    pub start_ok: bool,
    pub replies: VecDeque<u32>,
    pub final_status: Status,
    current: Option<u32>,
    pub finishes: Arc<AtomicUsize>,
    pub reads: Arc<AtomicUsize>,
}

impl ScriptedStream {
    pub fn new(replies: impl IntoIterator<Item = u32>) -> Self {
        Self {
            start_ok: true,
            replies: replies.into_iter().collect(),
            final_status: Status::ok(),
            current: None,
            finishes: Arc::new(AtomicUsize::new(0)),
            reads: Arc::new(AtomicUsize::new(0)),
        }
    }
}

impl StreamingCall<Queue> for ScriptedStream {
    type Reply = u32;

    fn start(&mut self, queue: &Queue, tag: Tag) {
        queue.post(tag, self.start_ok);
    }

    fn read(&mut self, queue: &Queue, tag: Tag) {
        self.reads.fetch_add(1, Ordering::SeqCst);
        self.current = self.replies.pop_front();
        queue.post(tag, self.current.is_some());
    }

    fn take_reply(&mut self) -> Option<u32> {
        self.current.take()
    }

    fn finish(&mut self, queue: &Queue, tag: Tag) {
        self.finishes.fetch_add(1, Ordering::SeqCst);
        queue.post(tag, true);
    }

    fn status(&self) -> Status {
        self.final_status.clone()
    }
}

// ============================================================================
// Fake server transport
// ============================================================================

#[derive(Default)]
struct ServerState {
    waiting: Option<(Tag, Arc<Mutex<Option<u32>>>)>,
    backlog: VecDeque<u32>,
    closed: bool,
    finished: Vec<(Option<u32>, Status)>,
}

/// Server side of the fake transport: test code delivers requests, the
/// accept loop's calls pick them up and record how they were finished.
#[derive(Clone)]
pub struct FakeServer {
    queue: Queue,
    state: Arc<Mutex<ServerState>>,
}

impl FakeServer {
    pub fn new(queue: &Queue) -> Self {
        Self {
            queue: Arc::clone(queue),
            state: Arc::default(),
        }
    }

    /// Creates the call object for one accept.
    pub fn new_call(&self) -> FakeIncoming {
        FakeIncoming {
            state: Arc::clone(&self.state),
            request: Arc::default(),
        }
    }

    /// A client sends `request`.
    pub fn deliver(&self, request: u32) {
        let mut state = self.state.lock();
        if let Some((tag, slot)) = state.waiting.take() {
            *slot.lock() = Some(request);
            drop(state);
            self.queue.post(tag, true);
        } else {
            state.backlog.push_back(request);
        }
    }

    /// Fails the outstanding and all later requests, as a transport does
    /// when the server goes away.
    pub fn close(&self) {
        let waiting = {
            let mut state = self.state.lock();
            state.closed = true;
            state.waiting.take()
        };
        if let Some((tag, _)) = waiting {
            self.queue.post(tag, false);
        }
    }

    pub fn finished(&self) -> Vec<(Option<u32>, Status)> {
        self.state.lock().finished.clone()
    }
}

/// Call object handed to the accept loop.
pub struct FakeIncoming {
    state: Arc<Mutex<ServerState>>,
    request: Arc<Mutex<Option<u32>>>,
}

impl IncomingCall<Queue> for FakeIncoming {
    type Request = u32;
    type Reply = u32;

    fn request(&mut self, queue: &Queue, tag: Tag) {
        let mut state = self.state.lock();
        if state.closed {
            drop(state);
            queue.post(tag, false);
        } else if let Some(request) = state.backlog.pop_front() {
            *self.request.lock() = Some(request);
            drop(state);
            queue.post(tag, true);
        } else {
            state.waiting = Some((tag, Arc::clone(&self.request)));
        }
    }

    fn take_request(&mut self) -> Option<u32> {
        self.request.lock().take()
    }

    fn finish(&mut self, queue: &Queue, tag: Tag, reply: Option<u32>, status: Status) {
        self.state.lock().finished.push((reply, status));
        queue.post(tag, true);
    }
}
