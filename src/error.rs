//! Error types for the execution engine.
//!
//! Engine-level failures are reported through [`Error`], a small struct
//! carrying an [`ErrorKind`], an optional message and an optional source.
//! RPC-level faults are a separate type ([`RpcFault`](crate::grpc::RpcFault))
//! because they travel as values along the await chain rather than as
//! engine failures.
//!
//! # Error Kinds
//!
//! | Kind | Raised by |
//! |------|-----------|
//! | `Cancelled` | a [`Schedule`](crate::runtime::Schedule) resumed with its stop token signaled |
//! | `TransportShutdown` | the completion source reporting shutdown under [`ShutdownPolicy::ReturnError`](crate::runtime::ShutdownPolicy) |
//! | `AlreadyRunning` | a second concurrent `run` on the same engine |
//! | `PoolShutdown` | submitting work to a worker pool that was shut down |
//! | `TaskPanicked` | a spawned future or blocking job that panicked |
//! | `Config` | invalid configuration values |
//! | `Internal` | engine invariant violations |

use core::fmt;
use std::sync::Arc;

/// The kind of error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Operation was cancelled through its stop token.
    Cancelled,
    /// The completion source shut down while the loop was running.
    TransportShutdown,
    /// The engine loop is already running on some thread.
    AlreadyRunning,
    /// The worker pool no longer accepts work.
    PoolShutdown,
    /// A task or job panicked.
    TaskPanicked,
    /// Configuration value could not be parsed or applied.
    Config,
    /// Internal engine error (bug).
    Internal,
}

impl ErrorKind {
    /// Returns true if the engine can keep making progress after this error.
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        !matches!(self, Self::TransportShutdown | Self::Internal)
    }
}

/// The main error type for engine operations.
#[derive(Debug, Clone)]
pub struct Error {
    kind: ErrorKind,
    message: Option<String>,
    source: Option<Arc<dyn std::error::Error + Send + Sync>>,
}

impl Error {
    /// Creates a new error with the given kind.
    #[must_use]
    pub const fn new(kind: ErrorKind) -> Self {
        Self {
            kind,
            message: None,
            source: None,
        }
    }

    /// Returns the error kind.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// Returns true if this error represents cancellation.
    #[must_use]
    pub const fn is_cancelled(&self) -> bool {
        matches!(self.kind, ErrorKind::Cancelled)
    }

    /// Returns true if this error is the transport shutting down.
    #[must_use]
    pub const fn is_shutdown(&self) -> bool {
        matches!(self.kind, ErrorKind::TransportShutdown)
    }

    /// Adds a message description to the error.
    #[must_use]
    pub fn with_message(mut self, msg: impl Into<String>) -> Self {
        self.message = Some(msg.into());
        self
    }

    /// Adds a source error to the chain.
    #[must_use]
    pub fn with_source(mut self, source: impl std::error::Error + Send + Sync + 'static) -> Self {
        self.source = Some(Arc::new(source));
        self
    }

    /// Returns the error message, if any.
    #[must_use]
    pub fn message(&self) -> Option<&str> {
        self.message.as_deref()
    }

    /// Creates a cancellation error.
    #[must_use]
    pub fn cancelled() -> Self {
        Self::new(ErrorKind::Cancelled).with_message("stop requested before resumption")
    }

    /// Creates a configuration error.
    #[must_use]
    pub fn config(detail: impl Into<String>) -> Self {
        Self::new(ErrorKind::Config).with_message(detail)
    }

    /// Creates an internal error (engine bug).
    #[must_use]
    pub fn internal(detail: impl Into<String>) -> Self {
        Self::new(ErrorKind::Internal).with_message(detail)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.kind)?;
        if let Some(msg) = &self.message {
            write!(f, ": {msg}")?;
        }
        Ok(())
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source
            .as_ref()
            .map(|e| e.as_ref() as &(dyn std::error::Error + 'static))
    }
}

impl From<ErrorKind> for Error {
    fn from(kind: ErrorKind) -> Self {
        Self::new(kind)
    }
}

/// A specialized Result type for engine operations.
pub type Result<T> = std::result::Result<T, Error>;
