//! Transport error type.

use std::error::Error;
use std::fmt;

/// Error raised by a bus connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// Could not connect to any server.
    ConnectionFailed(String),
    /// A request got no reply in time.
    Timeout,
    /// Nobody is subscribed to the request subject.
    NoResponders(String),
    /// No stream captures the subject of a durable publish.
    NoStream(String),
    /// The connection was closed.
    Closed,
    /// Other error
    Other(String),
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportError::ConnectionFailed(msg) => write!(f, "connection failed: {}", msg),
            TransportError::Timeout => write!(f, "request timed out"),
            TransportError::NoResponders(subject) => write!(f, "no responders on {}", subject),
            TransportError::NoStream(subject) => write!(f, "no stream for subject {}", subject),
            TransportError::Closed => write!(f, "connection closed"),
            TransportError::Other(msg) => write!(f, "transport error: {}", msg),
        }
    }
}

impl Error for TransportError {}
