//! Errors raised by remote functions.
//!
//! A handler fails by returning a [`FunctionError`]. The error carries a
//! kind tag (the name the caller sees in the `error` field of the failure
//! envelope), a message that is either a string or a structured JSON value,
//! and, when the error came from a [`RemoteException`] type, a portable form
//! the caller can turn back into the original Rust type.

use std::collections::BTreeMap;
use std::fmt;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::envelope::PortableException;

/// An error type that can cross the bus and be rebuilt on the caller side.
///
/// Implementors are serialized into the `pickled_exc` field of the failure
/// envelope. Callers that register the type in their
/// [`ExceptionRegistry`](crate::client::ExceptionRegistry) receive the
/// original value back from [`RemoteFailure::downcast_ref`](crate::client::RemoteFailure::downcast_ref).
pub trait RemoteException:
    std::error::Error + Serialize + DeserializeOwned + Send + Sync + 'static
{
    /// Kind tag written to the envelope's `error` field.
    const KIND: &'static str;

    /// A structured message to send instead of the `Display` text.
    ///
    /// Validation errors override this to expose their field map.
    fn structured_message(&self) -> Option<Value> {
        None
    }
}

/// Error returned by a remote function handler.
#[derive(Debug, Clone)]
pub struct FunctionError {
    kind: String,
    message: Value,
    portable: Option<PortableException>,
}

impl FunctionError {
    /// Create an error with a kind tag and a plain message.
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: Value::String(message.into()),
            portable: None,
        }
    }

    /// Create an error whose message is a structured JSON value.
    pub fn structured(kind: impl Into<String>, message: Value) -> Self {
        Self {
            kind: kind.into(),
            message,
            portable: None,
        }
    }

    /// Raise a [`RemoteException`], keeping a portable copy of it.
    ///
    /// If the exception cannot be serialized the portable form is dropped
    /// and only the kind and message travel.
    pub fn raise<E: RemoteException>(exception: E) -> Self {
        let message = exception
            .structured_message()
            .unwrap_or_else(|| Value::String(exception.to_string()));
        let portable = match PortableException::capture(&exception) {
            Ok(portable) => Some(portable),
            Err(e) => {
                tracing::warn!(kind = E::KIND, error = %e, "exception is not portable");
                None
            }
        };
        Self {
            kind: E::KIND.to_string(),
            message,
            portable,
        }
    }

    /// Wrap a non-portable error, naming it after its type.
    ///
    /// Application exception types should implement
    /// `From<MyError> for FunctionError` with [`FunctionError::raise`]
    /// instead, so callers can rebuild them.
    pub fn from_error<E: std::error::Error + ?Sized>(err: &E) -> Self {
        Self::new(short_type_name::<E>(), err.to_string())
    }

    /// Argument binding failed (wrong arity, missing or mistyped argument).
    pub fn type_error(message: impl Into<String>) -> Self {
        Self::new("TypeError", message)
    }

    /// The handler panicked or its task was torn down.
    pub fn panicked(message: impl Into<String>) -> Self {
        Self::new("HandlerPanic", message)
    }

    /// Kind tag of this error.
    pub fn kind(&self) -> &str {
        &self.kind
    }

    /// Message payload, a string or a structured value.
    pub fn message(&self) -> &Value {
        &self.message
    }

    /// Message flattened to text.
    pub fn message_text(&self) -> String {
        match &self.message {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        }
    }

    pub(crate) fn portable(&self) -> Option<&PortableException> {
        self.portable.as_ref()
    }
}

impl fmt::Display for FunctionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message_text())
    }
}

impl std::error::Error for FunctionError {}

impl From<serde_json::Error> for FunctionError {
    fn from(err: serde_json::Error) -> Self {
        FunctionError::from_error(&err)
    }
}

impl From<std::io::Error> for FunctionError {
    fn from(err: std::io::Error) -> Self {
        FunctionError::from_error(&err)
    }
}

/// Last path segment of a type name, without generic parameters.
fn short_type_name<T: ?Sized>() -> &'static str {
    let full = std::any::type_name::<T>();
    let base = full.split('<').next().unwrap_or(full);
    base.rsplit("::").next().unwrap_or(base)
}

/// Field-level validation failure.
///
/// Its message on the wire is the field map itself, so the caller keeps
/// per-field detail instead of a flattened sentence.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationError {
    pub fields: BTreeMap<String, Vec<String>>,
}

impl ValidationError {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a message for a field. Builder style.
    pub fn field(mut self, field: impl Into<String>, message: impl Into<String>) -> Self {
        self.fields
            .entry(field.into())
            .or_default()
            .push(message.into());
        self
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "validation failed")?;
        for (i, (field, messages)) in self.fields.iter().enumerate() {
            let sep = if i == 0 { ": " } else { "; " };
            write!(f, "{}{}: {}", sep, field, messages.join(", "))?;
        }
        Ok(())
    }
}

impl std::error::Error for ValidationError {}

impl RemoteException for ValidationError {
    const KIND: &'static str = "ValidationError";

    fn structured_message(&self) -> Option<Value> {
        serde_json::to_value(&self.fields).ok()
    }
}

impl From<ValidationError> for FunctionError {
    fn from(err: ValidationError) -> Self {
        FunctionError::raise(err)
    }
}
