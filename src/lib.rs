//! cqbridge: an async execution engine over a completion-queue RPC transport.
//!
//! # Overview
//!
//! RPC transports in the gRPC style report finished operations through a
//! completion queue: the caller registers an operation with an opaque tag
//! and later reads `(tag, ok)` pairs back. cqbridge turns that into awaitable
//! operations. One dedicated I/O thread runs the [`Engine`] loop, which owns
//! the queue, resumes suspended tasks when their tag comes back, and accepts
//! work scheduled from any other thread.
//!
//! # Core Guarantees
//!
//! - **Thread affinity**: transport operations are only ever initiated on the I/O thread
//! - **FIFO per pass**: tasks scheduled on the I/O thread run in scheduling order
//! - **No lost wakeups**: a task scheduled from another thread always gets run
//! - **Bounded signalling**: at most one wakeup notification is outstanding at a time
//! - **Exactly once**: every task is resumed once per registration
//!
//! # Module Structure
//!
//! - [`runtime`]: engine, task queues, completion and schedule futures, executor
//! - [`transport`]: the completion-queue seam and an in-memory queue
//! - [`grpc`]: unary and streaming call helpers, the accept loop, status codes
//! - [`util`]: loop-rate limiter
//! - [`error`]: error types

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::doc_markdown)]

pub mod error;
pub mod grpc;
pub mod runtime;
pub mod tracing_compat;
pub mod transport;
pub mod util;

#[cfg(test)]
pub(crate) mod test_utils;

pub use error::{Error, ErrorKind, Result};
pub use grpc::{RpcFault, RpcResult, Status};
pub use runtime::{Engine, Executor, ExecutorBuilder, JoinHandle, StopSource, StopToken};
pub use transport::{CompletionQueue, Tag};
