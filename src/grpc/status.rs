//! gRPC status codes and RPC-level faults.
//!
//! A [`Status`] is what the transport reports when a call finishes. An
//! [`RpcFault`] is a non-OK status travelling as the `Err` side of an
//! [`RpcResult`], so callers must inspect the result before touching the
//! reply.

use std::fmt;

/// gRPC status codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum Code {
    /// Not an error.
    Ok = 0,
    /// The operation was cancelled.
    Cancelled = 1,
    /// Unknown error.
    Unknown = 2,
    /// Client specified an invalid argument.
    InvalidArgument = 3,
    /// Deadline expired before the operation could complete.
    DeadlineExceeded = 4,
    /// Requested entity was not found.
    NotFound = 5,
    /// Entity already exists.
    AlreadyExists = 6,
    /// Caller lacks permission.
    PermissionDenied = 7,
    /// Some resource has been exhausted.
    ResourceExhausted = 8,
    /// System is not in a state required for the operation.
    FailedPrecondition = 9,
    /// The operation was aborted.
    Aborted = 10,
    /// Operation was attempted past the valid range.
    OutOfRange = 11,
    /// Operation is not implemented.
    Unimplemented = 12,
    /// Internal error.
    Internal = 13,
    /// The service is currently unavailable.
    Unavailable = 14,
    /// Unrecoverable data loss or corruption.
    DataLoss = 15,
    /// Request lacks valid authentication credentials.
    Unauthenticated = 16,
}

impl Code {
    /// Converts a wire value into a code. Unrecognized values map to `Unknown`.
    #[must_use]
    pub const fn from_i32(value: i32) -> Self {
        match value {
            0 => Self::Ok,
            1 => Self::Cancelled,
            3 => Self::InvalidArgument,
            4 => Self::DeadlineExceeded,
            5 => Self::NotFound,
            6 => Self::AlreadyExists,
            7 => Self::PermissionDenied,
            8 => Self::ResourceExhausted,
            9 => Self::FailedPrecondition,
            10 => Self::Aborted,
            11 => Self::OutOfRange,
            12 => Self::Unimplemented,
            13 => Self::Internal,
            14 => Self::Unavailable,
            15 => Self::DataLoss,
            16 => Self::Unauthenticated,
            _ => Self::Unknown,
        }
    }

    /// Returns the wire value.
    #[must_use]
    pub const fn as_i32(self) -> i32 {
        self as i32
    }

    /// Returns the canonical upper-case name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Ok => "OK",
            Self::Cancelled => "CANCELLED",
            Self::Unknown => "UNKNOWN",
            Self::InvalidArgument => "INVALID_ARGUMENT",
            Self::DeadlineExceeded => "DEADLINE_EXCEEDED",
            Self::NotFound => "NOT_FOUND",
            Self::AlreadyExists => "ALREADY_EXISTS",
            Self::PermissionDenied => "PERMISSION_DENIED",
            Self::ResourceExhausted => "RESOURCE_EXHAUSTED",
            Self::FailedPrecondition => "FAILED_PRECONDITION",
            Self::Aborted => "ABORTED",
            Self::OutOfRange => "OUT_OF_RANGE",
            Self::Unimplemented => "UNIMPLEMENTED",
            Self::Internal => "INTERNAL",
            Self::Unavailable => "UNAVAILABLE",
            Self::DataLoss => "DATA_LOSS",
            Self::Unauthenticated => "UNAUTHENTICATED",
        }
    }
}

impl fmt::Display for Code {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Final status of an RPC.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Status {
    code: Code,
    message: String,
}

impl Status {
    /// Creates a status with the given code and message.
    #[must_use]
    pub fn new(code: Code, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    /// The OK status.
    #[must_use]
    pub fn ok() -> Self {
        Self::new(Code::Ok, "")
    }

    /// The generic failure reported when the transport gives no detail.
    #[must_use]
    pub fn unknown() -> Self {
        Self::new(Code::Unknown, "unknown")
    }

    /// A cancellation status.
    #[must_use]
    pub fn cancelled(message: impl Into<String>) -> Self {
        Self::new(Code::Cancelled, message)
    }

    /// An internal-error status.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(Code::Internal, message)
    }

    /// A not-found status.
    #[must_use]
    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(Code::NotFound, message)
    }

    /// A invalid-argument status.
    #[must_use]
    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::new(Code::InvalidArgument, message)
    }

    /// Returns the status code.
    #[must_use]
    pub fn code(&self) -> Code {
        self.code
    }

    /// Returns the status message.
    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Returns true if the code is [`Code::Ok`].
    #[must_use]
    pub fn is_ok(&self) -> bool {
        self.code == Code::Ok
    }
}

impl Default for Status {
    fn default() -> Self {
        Self::ok()
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.message.is_empty() {
            write!(f, "{}", self.code)
        } else {
            write!(f, "{}: {}", self.code, self.message)
        }
    }
}

/// A failed RPC: a numeric code and a message.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("rpc failed with {code}: {message}")]
pub struct RpcFault {
    code: Code,
    message: String,
}

impl RpcFault {
    /// Creates a fault.
    #[must_use]
    pub fn new(code: Code, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    /// The generic fault for a failed transport operation.
    #[must_use]
    pub fn unknown() -> Self {
        Status::unknown().into()
    }

    /// Returns the fault code.
    #[must_use]
    pub fn code(&self) -> Code {
        self.code
    }

    /// Returns the fault message.
    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Converts the fault back into the status to send on the wire.
    #[must_use]
    pub fn into_status(self) -> Status {
        Status::new(self.code, self.message)
    }
}

impl From<Status> for RpcFault {
    fn from(status: Status) -> Self {
        Self {
            code: status.code,
            message: status.message,
        }
    }
}

/// Result of an RPC: the reply, or the fault that replaced it.
pub type RpcResult<T> = Result<T, RpcFault>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn code_wire_values() {
        assert_eq!(Code::Ok.as_i32(), 0);
        assert_eq!(Code::Unknown.as_i32(), 2);
        assert_eq!(Code::Unauthenticated.as_i32(), 16);
        for value in 0..=16 {
            assert_eq!(Code::from_i32(value).as_i32(), value);
        }
        assert_eq!(Code::from_i32(99), Code::Unknown);
        assert_eq!(Code::DeadlineExceeded.to_string(), "DEADLINE_EXCEEDED");
    }

    #[test]
    fn status_helpers() {
        assert!(Status::ok().is_ok());
        assert!(Status::default().is_ok());
        let unknown = Status::unknown();
        assert_eq!(unknown.code(), Code::Unknown);
        assert_eq!(unknown.message(), "unknown");
        assert_eq!(unknown.to_string(), "UNKNOWN: unknown");
        assert_eq!(Status::ok().to_string(), "OK");
    }

    #[test]
    fn fault_from_status_keeps_code_and_message() {
        let fault = RpcFault::from(Status::not_found("no such user"));
        assert_eq!(fault.code(), Code::NotFound);
        assert_eq!(fault.message(), "no such user");
        assert_eq!(fault.to_string(), "rpc failed with NOT_FOUND: no such user");
        assert_eq!(fault.into_status(), Status::not_found("no such user"));
    }
}
