//! Auxiliary pool for blocking and CPU-bound work.
//!
//! The I/O thread must never block on user logic, so handlers that do heavy
//! lifting run here instead. The pool is deliberately simple: a fixed set of
//! named threads pulling closures from one FIFO queue.
//!
//! # Shutdown
//!
//! [`shutdown`](WorkerPool::shutdown) stops accepting work; jobs already
//! queued still run. Dropping the pool shuts it down and joins its threads.

use crate::error::{Error, ErrorKind, Result};
use crate::runtime::config::WorkerPoolConfig;
use crate::runtime::spawn::{join_pair, panic_message, JoinHandle};
use crate::tracing_compat::{debug, trace, warn};
use crossbeam_queue::SegQueue;
use parking_lot::{Condvar, Mutex};
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle as ThreadJoinHandle};

type Job = Box<dyn FnOnce() + Send + 'static>;

struct PoolInner {
    queue: SegQueue<Job>,
    shutdown: AtomicBool,
    pending: AtomicUsize,
    busy: AtomicUsize,
    completed: AtomicU64,
    /// Mutex paired with `condvar` for parking idle workers.
    mutex: Mutex<()>,
    condvar: Condvar,
}

impl PoolInner {
    fn notify_one(&self) {
        let _guard = self.mutex.lock();
        self.condvar.notify_one();
    }

    fn notify_all(&self) {
        let _guard = self.mutex.lock();
        self.condvar.notify_all();
    }
}

/// Fixed-size pool of worker threads.
pub struct WorkerPool {
    inner: Arc<PoolInner>,
    threads: Mutex<Vec<ThreadJoinHandle<()>>>,
    config: WorkerPoolConfig,
}

impl WorkerPool {
    /// Starts a pool with `config.threads` workers.
    ///
    /// # Errors
    ///
    /// Returns [`ErrorKind::Internal`] if no worker thread could be spawned.
    pub fn new(mut config: WorkerPoolConfig) -> Result<Self> {
        config.normalize();
        let inner = Arc::new(PoolInner {
            queue: SegQueue::new(),
            shutdown: AtomicBool::new(false),
            pending: AtomicUsize::new(0),
            busy: AtomicUsize::new(0),
            completed: AtomicU64::new(0),
            mutex: Mutex::new(()),
            condvar: Condvar::new(),
        });

        let mut threads = Vec::with_capacity(config.threads);
        for index in 0..config.threads {
            let worker = Arc::clone(&inner);
            let name = format!("{}-{index}", config.thread_name_prefix);
            let spawned = thread::Builder::new()
                .name(name.clone())
                .stack_size(config.thread_stack_size)
                .spawn(move || {
                    debug!(thread = %name, "worker thread started");
                    worker_loop(&worker);
                    debug!(thread = %name, "worker thread stopped");
                });
            match spawned {
                Ok(handle) => threads.push(handle),
                Err(e) if threads.is_empty() => {
                    inner.shutdown.store(true, Ordering::Release);
                    return Err(Error::new(ErrorKind::Internal)
                        .with_message("failed to spawn any worker thread")
                        .with_source(e));
                }
                Err(e) => {
                    warn!(index, error = %e, "failed to spawn worker thread; running with fewer");
                    break;
                }
            }
        }

        Ok(Self {
            inner,
            threads: Mutex::new(threads),
            config,
        })
    }

    /// Queues `job` for execution on a worker.
    ///
    /// A panic inside `job` is logged and does not take the worker down.
    ///
    /// # Errors
    ///
    /// Returns [`ErrorKind::PoolShutdown`] once the pool has been shut down.
    pub fn execute<F>(&self, job: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        if self.is_shutdown() {
            return Err(
                Error::new(ErrorKind::PoolShutdown).with_message("worker pool is shut down")
            );
        }
        self.inner.pending.fetch_add(1, Ordering::Relaxed);
        self.inner.queue.push(Box::new(job));
        self.inner.notify_one();
        Ok(())
    }

    /// Runs `f` on a worker and returns a handle resolving to its result.
    ///
    /// The handle resolves with [`ErrorKind::TaskPanicked`] if `f` panics and
    /// with [`ErrorKind::PoolShutdown`] if the pool no longer accepts work.
    pub fn spawn<F, T>(&self, f: F) -> JoinHandle<T>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        let (sender, handle) = join_pair();
        let sender = Arc::new(Mutex::new(Some(sender)));
        let job_sender = Arc::clone(&sender);
        let submitted = self.execute(move || {
            let result = catch_unwind(AssertUnwindSafe(f)).map_err(|payload| {
                Error::new(ErrorKind::TaskPanicked).with_message(panic_message(payload.as_ref()))
            });
            if let Some(sender) = job_sender.lock().take() {
                sender.send(result);
            }
        });
        if let Err(err) = submitted {
            if let Some(sender) = sender.lock().take() {
                sender.send(Err(err));
            }
        }
        handle
    }

    /// Stops accepting work. Queued jobs still run.
    pub fn shutdown(&self) {
        if !self.inner.shutdown.swap(true, Ordering::AcqRel) {
            debug!(pending = self.pending(), "worker pool shutting down");
        }
        self.inner.notify_all();
    }

    /// Returns `true` if the pool is shut down.
    #[must_use]
    pub fn is_shutdown(&self) -> bool {
        self.inner.shutdown.load(Ordering::Acquire)
    }

    /// Returns the number of queued jobs not yet started.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.inner.pending.load(Ordering::Relaxed)
    }

    /// Returns the number of jobs currently running.
    #[must_use]
    pub fn busy(&self) -> usize {
        self.inner.busy.load(Ordering::Relaxed)
    }

    /// Returns the number of jobs that have finished.
    #[must_use]
    pub fn completed(&self) -> u64 {
        self.inner.completed.load(Ordering::Relaxed)
    }

    /// Returns the number of worker threads.
    #[must_use]
    pub fn threads(&self) -> usize {
        self.threads.lock().len()
    }

    /// Returns the configuration the pool was started with.
    #[must_use]
    pub fn config(&self) -> &WorkerPoolConfig {
        &self.config
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
        let current = thread::current().id();
        for handle in self.threads.get_mut().drain(..) {
            // The last owner may itself be a worker; it cannot join itself.
            if handle.thread().id() == current {
                continue;
            }
            let _ = handle.join();
        }
    }
}

impl fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerPool")
            .field("threads", &self.threads())
            .field("pending", &self.pending())
            .field("busy", &self.busy())
            .field("shutdown", &self.is_shutdown())
            .finish()
    }
}

fn worker_loop(inner: &PoolInner) {
    loop {
        if let Some(job) = inner.queue.pop() {
            inner.pending.fetch_sub(1, Ordering::Relaxed);
            inner.busy.fetch_add(1, Ordering::Relaxed);
            if let Err(payload) = catch_unwind(AssertUnwindSafe(job)) {
                warn!(message = %panic_message(payload.as_ref()), "worker job panicked");
            }
            inner.busy.fetch_sub(1, Ordering::Relaxed);
            inner.completed.fetch_add(1, Ordering::Relaxed);
            continue;
        }

        if inner.shutdown.load(Ordering::Acquire) {
            break;
        }

        let mut guard = inner.mutex.lock();
        if inner.queue.is_empty() && !inner.shutdown.load(Ordering::Acquire) {
            trace!("worker idle");
            inner.condvar.wait(&mut guard);
        }
    }
}
