//! Routes an inbound payload to its registered handler.
//!
//! ```text
//!   subject + bytes ──► resolve ──► decode_request ──► handler ──► CallResponse
//!                          │              │                │
//!                          ▼              ▼                ▼
//!               UnknownFunctionError  MalformedPayloadError  <handler kind>
//! ```
//!
//! The dispatcher never panics on bad input and never lets a handler
//! panic escape; every outcome becomes a response envelope.

use std::error::Error;
use std::fmt;
use std::sync::Arc;

use serde_json::Value;

use crate::envelope::{decode_request, CallResponse, EnvelopeError};
use crate::error::FunctionError;
use crate::registry::Registry;

/// Error kind reported when no function is registered for a subject.
pub const UNKNOWN_FUNCTION: &str = "UnknownFunctionError";

/// Error kind reported when a request payload cannot be decoded.
pub const MALFORMED_PAYLOAD: &str = "MalformedPayloadError";

/// Why a dispatch did not produce a result.
#[derive(Debug, Clone)]
pub enum DispatchError {
    /// The request payload is not a valid envelope.
    Malformed(EnvelopeError),
    /// No function is registered under the subject.
    UnknownFunction(String),
    /// The handler ran and failed.
    Handler(FunctionError),
}

impl DispatchError {
    /// Kind tag written to the failure envelope.
    pub fn kind(&self) -> &str {
        match self {
            DispatchError::Malformed(_) => MALFORMED_PAYLOAD,
            DispatchError::UnknownFunction(_) => UNKNOWN_FUNCTION,
            DispatchError::Handler(err) => err.kind(),
        }
    }

    /// Whether the message could be routed to a handler at all.
    pub fn is_unroutable(&self) -> bool {
        !matches!(self, DispatchError::Handler(_))
    }

    /// Map this error to an HTTP-style status code.
    pub fn status_code(&self) -> u16 {
        match self {
            DispatchError::Malformed(_) => 400,
            DispatchError::UnknownFunction(_) => 404,
            DispatchError::Handler(err) if err.kind() == "TypeError" => 400,
            DispatchError::Handler(_) => 500,
        }
    }

    /// Failure envelope for this error.
    pub fn to_response(&self) -> CallResponse {
        match self {
            DispatchError::Malformed(err) => CallResponse::failure(MALFORMED_PAYLOAD, err.to_string()),
            DispatchError::UnknownFunction(subject) => CallResponse::failure(
                UNKNOWN_FUNCTION,
                format!("no function registered for `{}`", subject),
            ),
            DispatchError::Handler(err) => CallResponse::from_error(err),
        }
    }
}

impl fmt::Display for DispatchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DispatchError::Malformed(err) => write!(f, "{}", err),
            DispatchError::UnknownFunction(subject) => {
                write!(f, "unknown function: {}", subject)
            }
            DispatchError::Handler(err) => write!(f, "handler failed: {}", err),
        }
    }
}

impl Error for DispatchError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            DispatchError::Malformed(e) => Some(e),
            DispatchError::Handler(e) => Some(e),
            DispatchError::UnknownFunction(_) => None,
        }
    }
}

impl From<EnvelopeError> for DispatchError {
    fn from(err: EnvelopeError) -> Self {
        DispatchError::Malformed(err)
    }
}

/// Resolves subjects against a shared [`Registry`] and runs handlers.
#[derive(Clone)]
pub struct Dispatcher {
    registry: Arc<Registry>,
}

impl Dispatcher {
    pub fn new(registry: Arc<Registry>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// Run the function registered under `subject` with the decoded payload.
    pub async fn dispatch(&self, subject: &str, payload: &[u8]) -> Result<Value, DispatchError> {
        let function = self
            .registry
            .resolve(subject)
            .ok_or_else(|| DispatchError::UnknownFunction(subject.to_string()))?;
        let request = decode_request(payload)?;
        function.invoke(request).await.map_err(DispatchError::Handler)
    }

    /// Dispatch and wrap the outcome in a response envelope.
    pub async fn respond(&self, subject: &str, payload: &[u8]) -> CallResponse {
        match self.dispatch(subject, payload).await {
            Ok(result) => CallResponse::Success { result },
            Err(err) => {
                log_failure(subject, &err);
                err.to_response()
            }
        }
    }
}

impl fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dispatcher")
            .field("functions", &self.registry.len())
            .finish()
    }
}

pub(crate) fn log_failure(subject: &str, err: &DispatchError) {
    match err {
        DispatchError::UnknownFunction(_) => {
            tracing::warn!(subject, "no function found");
        }
        DispatchError::Malformed(e) => {
            tracing::warn!(subject, error = %e, "malformed payload");
        }
        DispatchError::Handler(e) => {
            tracing::error!(subject, kind = e.kind(), message = %e.message_text(), "handler failed");
        }
    }
}
