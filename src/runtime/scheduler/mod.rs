//! Task queues feeding the engine loop.
//!
//! The loop owns two queues:
//! 1. [`LocalQueue`] - plain FIFO, touched only by the I/O thread
//! 2. [`RemoteQueue`] - lock-free inbox for every other thread, carrying the
//!    idle bit that drives the wakeup protocol

pub mod local_queue;
pub mod remote_queue;

pub use local_queue::LocalQueue;
pub use remote_queue::RemoteQueue;
