//! Engine plus worker pool.
//!
//! An [`Executor`] is what RPC code normally holds: the [`Engine`] that owns
//! the I/O thread, and a [`WorkerPool`] for handler logic that must not run
//! there. Cloning an executor is cheap; the pool shuts down when the last
//! clone is dropped.
//!
//! # Builder
//!
//! ```ignore
//! use cqbridge::runtime::ExecutorBuilder;
//!
//! let executor = ExecutorBuilder::new()
//!     .with_env_overrides()?
//!     .worker_threads(4)
//!     .build(queue)?;
//! executor.run_until(&stop.token())?;
//! ```

use crate::error::Result;
use crate::runtime::config::{ExecutorConfig, ShutdownPolicy};
use crate::runtime::engine::Engine;
use crate::runtime::env_config;
use crate::runtime::ops::{Completion, Schedule};
use crate::runtime::spawn::JoinHandle;
use crate::runtime::stop::StopToken;
use crate::runtime::worker_pool::WorkerPool;
use crate::tracing_compat::debug;
use crate::transport::{CompletionQueue, Tag};
use std::fmt;
use std::future::Future;
use std::sync::Arc;

struct ExecutorInner<Q: CompletionQueue> {
    engine: Engine<Q>,
    pool: WorkerPool,
}

/// An engine and its auxiliary worker pool.
pub struct Executor<Q: CompletionQueue> {
    inner: Arc<ExecutorInner<Q>>,
}

impl<Q: CompletionQueue> Executor<Q> {
    /// Creates an executor with the default configuration.
    ///
    /// # Errors
    ///
    /// Fails if the worker pool cannot start.
    pub fn new(queue: Q) -> Result<Self> {
        Self::with_config(queue, ExecutorConfig::default())
    }

    /// Creates an executor with an explicit configuration.
    ///
    /// # Errors
    ///
    /// Fails if the worker pool cannot start.
    pub fn with_config(queue: Q, mut config: ExecutorConfig) -> Result<Self> {
        config.normalize();
        let pool = WorkerPool::new(config.pool)?;
        let engine = Engine::with_config(queue, config.engine);
        debug!(
            engine = engine.id(),
            workers = pool.threads(),
            "executor created"
        );
        Ok(Self {
            inner: Arc::new(ExecutorInner { engine, pool }),
        })
    }

    /// Returns the engine.
    #[must_use]
    pub fn engine(&self) -> &Engine<Q> {
        &self.inner.engine
    }

    /// Returns the worker pool.
    #[must_use]
    pub fn pool(&self) -> &WorkerPool {
        &self.inner.pool
    }

    /// Returns the completion queue.
    #[must_use]
    pub fn queue(&self) -> &Q {
        self.inner.engine.queue()
    }

    /// Runs the engine loop on the calling thread; see [`Engine::run`].
    pub fn run(&self) -> Result<()> {
        self.inner.engine.run()
    }

    /// Runs the engine loop until `stop` is signaled; see [`Engine::run_until`].
    pub fn run_until(&self, stop: &StopToken) -> Result<()> {
        self.inner.engine.run_until(stop)
    }

    /// Returns true if the calling thread runs this executor's loop.
    #[must_use]
    pub fn is_on_io_thread(&self) -> bool {
        self.inner.engine.is_on_io_thread()
    }

    /// Spawns a future on the I/O thread.
    pub fn spawn_local<F>(&self, future: F) -> JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        self.inner.engine.spawn(future)
    }

    /// Runs a blocking closure on the worker pool.
    pub fn spawn_blocking<F, T>(&self, f: F) -> JoinHandle<T>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        self.inner.pool.spawn(f)
    }

    /// See [`Engine::completion`].
    pub fn completion<F>(&self, initiator: F) -> Completion<Q, F>
    where
        F: FnOnce(&Q, Tag) + Send + 'static,
    {
        self.inner.engine.completion(initiator)
    }

    /// See [`Engine::schedule`].
    pub fn schedule(&self) -> Schedule<Q> {
        self.inner.engine.schedule()
    }
}

impl<Q: CompletionQueue> Clone for Executor<Q> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<Q: CompletionQueue> fmt::Debug for Executor<Q> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Executor")
            .field("engine", &self.inner.engine)
            .field("pool", &self.inner.pool)
            .finish()
    }
}

/// Builder for [`Executor`].
///
/// Values set through builder methods win over environment variables, which
/// win over a config file, which wins over the defaults.
#[derive(Debug, Clone, Default)]
pub struct ExecutorBuilder {
    base: ExecutorConfig,
    worker_threads: Option<usize>,
    thread_name_prefix: Option<String>,
    thread_stack_size: Option<usize>,
    completion_batch_limit: Option<usize>,
    shutdown_policy: Option<ShutdownPolicy>,
}

impl ExecutorBuilder {
    /// Creates a builder starting from the defaults.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the number of worker pool threads.
    #[must_use]
    pub fn worker_threads(mut self, n: usize) -> Self {
        self.worker_threads = Some(n);
        self
    }

    /// Set the worker thread name prefix.
    #[must_use]
    pub fn thread_name_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.thread_name_prefix = Some(prefix.into());
        self
    }

    /// Set the worker thread stack size.
    #[must_use]
    pub fn thread_stack_size(mut self, size: usize) -> Self {
        self.thread_stack_size = Some(size);
        self
    }

    /// Set how many completions one blocking read may dispatch.
    #[must_use]
    pub fn completion_batch_limit(mut self, limit: usize) -> Self {
        self.completion_batch_limit = Some(limit);
        self
    }

    /// Set the reaction to transport shutdown.
    #[must_use]
    pub fn shutdown_policy(mut self, policy: ShutdownPolicy) -> Self {
        self.shutdown_policy = Some(policy);
        self
    }

    /// Applies `CQBRIDGE_*` environment variables on top of the file and defaults.
    ///
    /// # Errors
    ///
    /// Returns [`ErrorKind::Config`](crate::ErrorKind::Config) for unparseable values.
    pub fn with_env_overrides(mut self) -> Result<Self> {
        env_config::apply_env_overrides(&mut self.base)?;
        Ok(self)
    }

    /// Starts from a TOML config file.
    ///
    /// # Errors
    ///
    /// Returns [`ErrorKind::Config`](crate::ErrorKind::Config) if the file
    /// cannot be read or parsed.
    #[cfg(feature = "config-file")]
    pub fn from_toml(path: impl AsRef<std::path::Path>) -> Result<Self> {
        let parsed = env_config::parse_toml_file(path.as_ref())?;
        let mut builder = Self::new();
        env_config::apply_toml_config(&mut builder.base, &parsed)?;
        Ok(builder)
    }

    /// Starts from a TOML document.
    ///
    /// # Errors
    ///
    /// Returns [`ErrorKind::Config`](crate::ErrorKind::Config) if parsing fails.
    #[cfg(feature = "config-file")]
    pub fn from_toml_str(toml: &str) -> Result<Self> {
        let parsed = env_config::parse_toml_str(toml)?;
        let mut builder = Self::new();
        env_config::apply_toml_config(&mut builder.base, &parsed)?;
        Ok(builder)
    }

    /// Returns the configuration the builder would use.
    #[must_use]
    pub fn config(&self) -> ExecutorConfig {
        let mut config = self.base.clone();
        if let Some(n) = self.worker_threads {
            config.pool.threads = n;
        }
        if let Some(ref prefix) = self.thread_name_prefix {
            config.pool.thread_name_prefix.clone_from(prefix);
        }
        if let Some(size) = self.thread_stack_size {
            config.pool.thread_stack_size = size;
        }
        if let Some(limit) = self.completion_batch_limit {
            config.engine.completion_batch_limit = limit;
        }
        if let Some(policy) = self.shutdown_policy {
            config.engine.shutdown_policy = policy;
        }
        config.normalize();
        config
    }

    /// Builds an executor driving `queue`.
    ///
    /// # Errors
    ///
    /// Fails if the worker pool cannot start.
    pub fn build<Q: CompletionQueue>(self, queue: Q) -> Result<Executor<Q>> {
        Executor::with_config(queue, self.config())
    }
}
