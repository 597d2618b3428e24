//! Engine and executor configuration types.
//!
//! These types hold the concrete values that drive engine behavior. In most
//! cases you should use [`ExecutorBuilder`](super::executor::ExecutorBuilder)
//! rather than creating an [`ExecutorConfig`] directly.
//!
//! # Defaults
//!
//! | Field | Default |
//! |-------|---------|
//! | `engine.completion_batch_limit` | 128 |
//! | `engine.shutdown_policy` | [`ShutdownPolicy::Exit`] |
//! | `pool.threads` | available CPU parallelism |
//! | `pool.thread_name_prefix` | `"cqbridge-worker"` |
//! | `pool.thread_stack_size` | 2 MiB |

use std::str::FromStr;

/// Default number of completions handled per blocking read.
pub const DEFAULT_COMPLETION_BATCH_LIMIT: usize = 128;

/// Default worker thread name prefix.
pub const DEFAULT_THREAD_NAME_PREFIX: &str = "cqbridge-worker";

/// Default worker thread stack size.
pub const DEFAULT_THREAD_STACK_SIZE: usize = 2 * 1024 * 1024;

/// What the loop does when the completion source reports shutdown.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ShutdownPolicy {
    /// Log the condition and terminate the process with a non-zero status.
    #[default]
    Exit,
    /// Leave the loop and return [`ErrorKind::TransportShutdown`](crate::ErrorKind::TransportShutdown).
    ReturnError,
}

impl FromStr for ShutdownPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "exit" | "abort" => Ok(Self::Exit),
            "error" | "return" | "return_error" => Ok(Self::ReturnError),
            other => Err(format!("unknown shutdown policy {other:?}")),
        }
    }
}

/// Configuration of an [`Engine`](super::Engine).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    /// Upper bound on completions dispatched per blocking read before the
    /// loop goes back to its local queue.
    pub completion_batch_limit: usize,
    /// Reaction to transport shutdown.
    pub shutdown_policy: ShutdownPolicy,
}

impl EngineConfig {
    /// Normalize configuration values to safe defaults.
    pub fn normalize(&mut self) {
        if self.completion_batch_limit == 0 {
            self.completion_batch_limit = 1;
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            completion_batch_limit: DEFAULT_COMPLETION_BATCH_LIMIT,
            shutdown_policy: ShutdownPolicy::Exit,
        }
    }
}

/// Configuration of the auxiliary [`WorkerPool`](super::WorkerPool).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerPoolConfig {
    /// Number of worker threads.
    pub threads: usize,
    /// Name prefix for worker threads.
    pub thread_name_prefix: String,
    /// Stack size per worker thread.
    pub thread_stack_size: usize,
}

impl WorkerPoolConfig {
    /// Normalize configuration values to safe defaults.
    pub fn normalize(&mut self) {
        if self.threads == 0 {
            self.threads = 1;
        }
        if self.thread_stack_size == 0 {
            self.thread_stack_size = DEFAULT_THREAD_STACK_SIZE;
        }
        if self.thread_name_prefix.is_empty() {
            self.thread_name_prefix = DEFAULT_THREAD_NAME_PREFIX.to_string();
        }
    }
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            threads: std::thread::available_parallelism().map_or(1, std::num::NonZeroUsize::get),
            thread_name_prefix: DEFAULT_THREAD_NAME_PREFIX.to_string(),
            thread_stack_size: DEFAULT_THREAD_STACK_SIZE,
        }
    }
}

/// Configuration of an [`Executor`](super::Executor).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecutorConfig {
    /// Engine settings.
    pub engine: EngineConfig,
    /// Worker pool settings.
    pub pool: WorkerPoolConfig,
}

impl ExecutorConfig {
    /// Normalize configuration values to safe defaults.
    pub fn normalize(&mut self) {
        self.engine.normalize();
        self.pool.normalize();
    }
}
