//! Test utilities for cqbridge.
//!
//! - Consistent tracing-based logging initialization
//! - Phase/section macros for readable test output
//! - A lock for tests that mutate process environment variables
//! - An engine harness that runs the loop on its own thread

use crate::runtime::{EngineConfig, ShutdownPolicy, StopSource, StopToken};
use crate::transport::{CompletionQueue, LabQueue};
use crate::Engine;
use std::sync::mpsc;
use std::sync::{Arc, Mutex, MutexGuard, Once, PoisonError};
use std::thread;
use std::time::Duration;
use tracing_subscriber::fmt::format::FmtSpan;

static INIT_LOGGING: Once = Once::new();
static ENV_LOCK: Mutex<()> = Mutex::new(());

/// Initialize test logging with trace-level output.
///
/// Safe to call multiple times; only initializes once.
pub fn init_test_logging() {
    init_test_logging_with_level(tracing::Level::TRACE);
}

/// Initialize test logging with a custom level.
///
/// The first call wins; later calls are no-ops.
pub fn init_test_logging_with_level(level: tracing::Level) {
    INIT_LOGGING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_max_level(level)
            .with_test_writer()
            .with_file(true)
            .with_line_number(true)
            .with_target(true)
            .with_thread_ids(true)
            .with_thread_names(true)
            .with_span_events(FmtSpan::CLOSE)
            .with_ansi(false)
            .try_init();
    });
}

/// Acquire the global environment lock for tests that mutate env vars.
pub(crate) fn env_lock() -> MutexGuard<'static, ()> {
    ENV_LOCK.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Engine over a [`LabQueue`] that returns errors instead of exiting.
pub(crate) fn lab_engine() -> Engine<Arc<LabQueue>> {
    Engine::with_config(
        Arc::new(LabQueue::new()),
        EngineConfig {
            shutdown_policy: ShutdownPolicy::ReturnError,
            ..EngineConfig::default()
        },
    )
}

/// How long a test lets a loop run before declaring it hung.
pub(crate) const LOOP_DEADLINE: Duration = Duration::from_secs(10);

/// Runs the loop on its own thread until `stop`, failing the test if the
/// loop has not returned within [`LOOP_DEADLINE`].
pub(crate) fn run_bounded<Q: CompletionQueue>(
    engine: &Engine<Q>,
    stop: &StopToken,
) -> crate::Result<()> {
    let (tx, rx) = mpsc::channel();
    let runner = engine.clone();
    let token = stop.clone();
    thread::Builder::new()
        .name("cqbridge-io".to_string())
        .spawn(move || {
            let result = runner.run_until(&token);
            // Release the engine before reporting, so callers see the final refcount.
            drop(runner);
            let _ = tx.send(result);
        })
        .expect("spawn engine thread");
    match rx.recv_timeout(LOOP_DEADLINE) {
        Ok(result) => result,
        Err(mpsc::RecvTimeoutError::Timeout) => {
            panic!("engine loop still running after {LOOP_DEADLINE:?}")
        }
        Err(mpsc::RecvTimeoutError::Disconnected) => panic!("engine loop panicked"),
    }
}

/// An engine whose loop runs on a dedicated thread until dropped.
pub(crate) struct EngineThread {
    pub(crate) engine: Engine<Arc<LabQueue>>,
    stop: Arc<StopSource>,
    thread: Option<thread::JoinHandle<crate::Result<()>>>,
}

impl EngineThread {
    pub(crate) fn start() -> Self {
        let engine = lab_engine();
        let stop = Arc::new(StopSource::new());
        let token = stop.token();
        let runner = engine.clone();
        let thread = thread::Builder::new()
            .name("cqbridge-io".to_string())
            .spawn(move || runner.run_until(&token))
            .expect("spawn engine thread");
        Self {
            engine,
            stop,
            thread: Some(thread),
        }
    }

    /// Requests stop and joins the loop thread.
    pub(crate) fn shutdown(mut self) -> crate::Result<()> {
        self.stop.request_stop();
        self.thread
            .take()
            .expect("engine thread joined twice")
            .join()
            .expect("engine thread panicked")
    }
}

impl Drop for EngineThread {
    fn drop(&mut self) {
        self.stop.request_stop();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

/// Log a test phase transition with a visual separator.
#[macro_export]
macro_rules! test_phase {
    ($name:expr) => {
        tracing::info!(phase = %$name, "========================================");
        tracing::info!(phase = %$name, "TEST PHASE: {}", $name);
        tracing::info!(phase = %$name, "========================================");
    };
}

/// Log a section within a test phase.
#[macro_export]
macro_rules! test_section {
    ($name:expr) => {
        tracing::debug!(section = %$name, "--- {} ---", $name);
    };
}

/// Log test completion with summary.
#[macro_export]
macro_rules! test_complete {
    ($name:expr) => {
        tracing::info!(test = %$name, "test completed successfully: {}", $name);
    };
}

/// Log before assertions for context.
#[macro_export]
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
