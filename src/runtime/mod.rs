//! Engine, task queues and the operations consumers await.
//!
//! - [`task`]: schedulable units and their enqueued flag
//! - [`scheduler`]: local and remote task queues
//! - [`tag_slab`]: tag-to-task registry for in-flight transport operations
//! - [`engine`]: the execution loop and wakeup protocol
//! - [`ops`]: [`Completion`] and [`Schedule`] futures
//! - [`stop`]: cooperative stop tokens
//! - [`spawn`]: futures driven by the loop
//! - [`worker_pool`]: auxiliary threads for blocking work
//! - [`executor`]: engine plus worker pool, and its builder
//! - [`config`] / [`env_config`]: configuration, env vars, TOML files
//!
//! # Quick Start
//!
//! ```ignore
//! use cqbridge::runtime::{block_on, Executor, StopSource};
//!
//! let executor = Executor::new(queue)?;
//! let stop = StopSource::new();
//! let reply = executor.spawn_local(async move { /* issue RPCs */ });
//! executor.run_until(&stop.token())?;
//! ```

pub mod block_on;
pub mod config;
pub mod engine;
pub mod env_config;
pub mod executor;
pub mod ops;
pub mod scheduler;
pub mod spawn;
pub mod stop;
pub mod tag_slab;
pub mod task;
pub mod worker_pool;

pub use block_on::{block_on, block_on_timeout};
pub use config::{EngineConfig, ExecutorConfig, ShutdownPolicy, WorkerPoolConfig};
pub use engine::{Engine, EngineStats, FATAL_EXIT_CODE};
pub use executor::{Executor, ExecutorBuilder};
pub use ops::{Completion, Schedule};
pub use spawn::JoinHandle;
pub use stop::{StopRegistration, StopSource, StopToken};
pub use task::{Schedulable, TaskHeader, TaskRef};
pub use worker_pool::WorkerPool;
