//! Transport-layer send errors surfaced to callers.
//!
//! Receive-path faults never become errors; they are traced and dropped.
//! Send-path faults are returned so the transaction layer can count them
//! against the retransmit budget.

use std::fmt;

/// Result codes for transport send operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// No established connection to the destination and the caller did not
    /// permit opening one.
    NotConnected,
    /// Name resolution definitively failed.
    HostNotFound,
    /// Asynchronous resolution was kicked off; retry will find a cache hit.
    InProgress,
    /// The operation was cancelled by shutdown.
    Aborted,
    ConnectionRefused,
    /// Connect or write exceeded its timeout.
    Timeout,
    /// No channel matches the requested protocol and address family.
    NoMatchingChannel,
    /// Underlying socket fault.
    Io(String),
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportError::NotConnected => write!(f, "socket not connected"),
            TransportError::HostNotFound => write!(f, "host not found"),
            TransportError::InProgress => write!(f, "resolution in progress"),
            TransportError::Aborted => write!(f, "operation aborted"),
            TransportError::ConnectionRefused => write!(f, "connection refused"),
            TransportError::Timeout => write!(f, "operation timed out"),
            TransportError::NoMatchingChannel => write!(f, "no matching channel"),
            TransportError::Io(detail) => write!(f, "io error: {}", detail),
        }
    }
}

impl std::error::Error for TransportError {}

impl From<std::io::Error> for TransportError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::ConnectionRefused => TransportError::ConnectionRefused,
            std::io::ErrorKind::NotConnected => TransportError::NotConnected,
            std::io::ErrorKind::TimedOut => TransportError::Timeout,
            _ => TransportError::Io(err.to_string()),
        }
    }
}
