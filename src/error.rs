//! Error types shared by devices, the server and remote clients.
//!
//! `PqnError` is the single error type of the crate. The same variants are used
//! locally and remotely: a server converts an error into an `ErrorKind` plus a
//! message on the wire, and the client turns that pair back into the matching
//! variant, so callers can `match` on a failure without caring where it happened.
//!
//! ## Error Taxonomy
//!
//! - **`NotFound`**: unknown device name or unknown operation.
//! - **`NotReady`**: the device is `OFF`/`ERROR`, or `BUSY` under the reject policy.
//! - **`HardwareIo`**: the physical instrument failed. This is the only kind that
//!   moves a device into the `ERROR` status.
//! - **`Timeout`**: the caller's deadline elapsed. Produced only client-side.
//! - **`Serialization`**: a value could not be carried over the wire.
//! - **`InvalidArgument`**: the operation rejected its arguments.
//! - **`Cancelled`**: a cooperative operation observed its cancellation token.
//! - **`Connection`**: the transport to a server failed. Produced only client-side.
//! - **`Protocol`**: a malformed frame or payload.
//!
//! The remaining variants (`UnknownServer`, `AlreadyRegistered`, `Config`,
//! `Configuration`, `Io`, `Internal`) cover setup and plumbing failures.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Convenience alias for results using the crate error type.
pub type PqnResult<T> = std::result::Result<T, PqnError>;

/// Every failure a device, server or client can report.
#[derive(Error, Debug)]
pub enum PqnError {
    /// Unknown device, operation or resource.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Device is `OFF`, `ERROR`, or busy under the reject policy.
    #[error("Device not ready: {0}")]
    NotReady(String),

    /// The instrument failed; the device moves to `ERROR`.
    #[error("Hardware I/O error: {0}")]
    HardwareIo(String),

    /// The caller's deadline elapsed.
    #[error("Request timed out after {0:?}")]
    Timeout(Duration),

    /// A value cannot be carried on the wire.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// An operation rejected its arguments.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// A cooperative operation saw its token fire.
    #[error("Operation cancelled: {0}")]
    Cancelled(String),

    /// Transport to a server failed or was shut down.
    #[error("Connection error: {0}")]
    Connection(String),

    /// Malformed frame, envelope or payload.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Server name missing from the directory.
    #[error("Unknown server '{0}'")]
    UnknownServer(String),

    /// Device name already taken on this server.
    #[error("Device '{0}' is already registered")]
    AlreadyRegistered(String),

    /// Configuration could not be loaded.
    #[error("Configuration error: {0}")]
    Config(#[from] Box<figment::Error>),

    /// Configuration loaded but failed validation.
    #[error("Configuration validation error: {0}")]
    Configuration(String),

    /// Socket or file I/O.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Anything else, including client-side kinds reported by a remote server.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<serde_json::Error> for PqnError {
    fn from(err: serde_json::Error) -> Self {
        PqnError::Serialization(err.to_string())
    }
}

impl From<figment::Error> for PqnError {
    fn from(err: figment::Error) -> Self {
        PqnError::Config(Box::new(err))
    }
}

/// Error categories carried on the wire as `error.kind`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    /// `NotFoundError`
    #[serde(rename = "NotFoundError")]
    NotFound,
    /// `NotReadyError`
    #[serde(rename = "NotReadyError")]
    NotReady,
    /// `HardwareIOError`
    #[serde(rename = "HardwareIOError")]
    HardwareIo,
    /// `TimeoutError`
    #[serde(rename = "TimeoutError")]
    Timeout,
    /// `SerializationError`
    #[serde(rename = "SerializationError")]
    Serialization,
    /// `InvalidArgumentError`
    #[serde(rename = "InvalidArgumentError")]
    InvalidArgument,
    /// `CancelledError`
    #[serde(rename = "CancelledError")]
    Cancelled,
    /// `ConnectionError`
    #[serde(rename = "ConnectionError")]
    Connection,
    /// `ProtocolError`
    #[serde(rename = "ProtocolError")]
    Protocol,
    /// `InternalError`
    #[serde(rename = "InternalError")]
    Internal,
}

impl ErrorKind {
    /// Wire name of the kind.
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::NotFound => "NotFoundError",
            ErrorKind::NotReady => "NotReadyError",
            ErrorKind::HardwareIo => "HardwareIOError",
            ErrorKind::Timeout => "TimeoutError",
            ErrorKind::Serialization => "SerializationError",
            ErrorKind::InvalidArgument => "InvalidArgumentError",
            ErrorKind::Cancelled => "CancelledError",
            ErrorKind::Connection => "ConnectionError",
            ErrorKind::Protocol => "ProtocolError",
            ErrorKind::Internal => "InternalError",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl PqnError {
    /// Category used when this error crosses the wire.
    pub fn kind(&self) -> ErrorKind {
        match self {
            PqnError::NotFound(_) => ErrorKind::NotFound,
            PqnError::NotReady(_) => ErrorKind::NotReady,
            PqnError::HardwareIo(_) => ErrorKind::HardwareIo,
            PqnError::Timeout(_) => ErrorKind::Timeout,
            PqnError::Serialization(_) => ErrorKind::Serialization,
            PqnError::InvalidArgument(_) => ErrorKind::InvalidArgument,
            PqnError::Cancelled(_) => ErrorKind::Cancelled,
            PqnError::Connection(_) | PqnError::UnknownServer(_) => ErrorKind::Connection,
            PqnError::Protocol(_) => ErrorKind::Protocol,
            PqnError::AlreadyRegistered(_)
            | PqnError::Config(_)
            | PqnError::Configuration(_)
            | PqnError::Io(_)
            | PqnError::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Message without the variant prefix, as sent in `error.message`.
    pub fn message(&self) -> String {
        match self {
            PqnError::NotFound(m)
            | PqnError::NotReady(m)
            | PqnError::HardwareIo(m)
            | PqnError::Serialization(m)
            | PqnError::InvalidArgument(m)
            | PqnError::Cancelled(m)
            | PqnError::Connection(m)
            | PqnError::Protocol(m)
            | PqnError::Configuration(m)
            | PqnError::Internal(m) => m.clone(),
            other => other.to_string(),
        }
    }

    /// Rebuild an error reported by a remote server.
    ///
    /// `Timeout` and `Connection` are never trusted from the wire: a server
    /// reporting either is folded into `Internal` so the client-side meaning of
    /// those kinds stays unambiguous.
    pub fn from_remote(kind: ErrorKind, message: impl Into<String>) -> Self {
        let message = message.into();
        match kind {
            ErrorKind::NotFound => PqnError::NotFound(message),
            ErrorKind::NotReady => PqnError::NotReady(message),
            ErrorKind::HardwareIo => PqnError::HardwareIo(message),
            ErrorKind::Serialization => PqnError::Serialization(message),
            ErrorKind::InvalidArgument => PqnError::InvalidArgument(message),
            ErrorKind::Cancelled => PqnError::Cancelled(message),
            ErrorKind::Protocol => PqnError::Protocol(message),
            ErrorKind::Timeout | ErrorKind::Connection | ErrorKind::Internal => {
                PqnError::Internal(message)
            }
        }
    }

    /// True for failures that put a device into the `ERROR` status.
    pub fn is_hardware_fault(&self) -> bool {
        matches!(self, PqnError::HardwareIo(_))
    }
}
