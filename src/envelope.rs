//! Wire envelopes for calls and their results.
//!
//! ```text
//! request:  {"args": [...], "kwargs": {...}}
//! success:  {"success": true,  "result": <any>}
//! failure:  {"success": false, "error": "<Kind>", "message": <string|object>,
//!            "pickled_exc": "<portable form, optional>"}
//! ```
//!
//! All payloads are UTF-8 JSON.

use std::error::Error;
use std::fmt;

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{FunctionError, RemoteException};

/// Error produced while encoding or decoding an envelope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnvelopeError {
    /// The payload is not valid JSON or does not have the envelope shape.
    Malformed(String),
    /// A value could not be serialized to JSON.
    Encode(String),
}

impl fmt::Display for EnvelopeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EnvelopeError::Malformed(msg) => write!(f, "malformed payload: {}", msg),
            EnvelopeError::Encode(msg) => write!(f, "encode failed: {}", msg),
        }
    }
}

impl Error for EnvelopeError {}

// =============================================================================
// Requests
// =============================================================================

/// Positional and keyword arguments of a call.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CallRequest {
    #[serde(default)]
    pub args: Vec<Value>,
    #[serde(default)]
    pub kwargs: Map<String, Value>,
    /// First argument that failed to serialize; encoding reports it.
    #[serde(skip)]
    encode_error: Option<String>,
}

impl CallRequest {
    /// An empty request.
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a request from already-encoded values.
    pub fn from_parts(args: Vec<Value>, kwargs: Map<String, Value>) -> Self {
        Self {
            args,
            kwargs,
            encode_error: None,
        }
    }

    /// Append a positional argument.
    ///
    /// A value that fails to serialize makes [`encode_request`] fail; use
    /// [`try_arg`](Self::try_arg) to see the failure here instead.
    pub fn arg<T: Serialize>(mut self, value: T) -> Self {
        let position = self.args.len().to_string();
        let value = self.capture(&position, serde_json::to_value(value));
        self.args.push(value);
        self
    }

    /// Append a positional argument, reporting serialization failures.
    pub fn try_arg<T: Serialize>(mut self, value: T) -> Result<Self, EnvelopeError> {
        let value = serde_json::to_value(value).map_err(|e| EnvelopeError::Encode(e.to_string()))?;
        self.args.push(value);
        Ok(self)
    }

    /// Set a keyword argument. Serialization failures behave as in [`arg`](Self::arg).
    pub fn kwarg<T: Serialize>(mut self, name: impl Into<String>, value: T) -> Self {
        let name = name.into();
        let value = self.capture(&name, serde_json::to_value(value));
        self.kwargs.insert(name, value);
        self
    }

    /// Keep the first serialization failure, leaving a `null` placeholder.
    fn capture(&mut self, argument: &str, value: serde_json::Result<Value>) -> Value {
        value.unwrap_or_else(|e| {
            tracing::warn!(argument, error = %e, "argument failed to serialize");
            if self.encode_error.is_none() {
                self.encode_error = Some(format!("argument '{}': {}", argument, e));
            }
            Value::Null
        })
    }

    /// Set a keyword argument, reporting serialization failures.
    pub fn try_kwarg<T: Serialize>(
        mut self,
        name: impl Into<String>,
        value: T,
    ) -> Result<Self, EnvelopeError> {
        let value = serde_json::to_value(value).map_err(|e| EnvelopeError::Encode(e.to_string()))?;
        self.kwargs.insert(name.into(), value);
        Ok(self)
    }

    /// Check the call shape against a handler's parameter list.
    ///
    /// Rejects surplus positionals, unknown keywords, and parameters given
    /// both positionally and by keyword.
    pub fn check_arity(&self, params: &[&str]) -> Result<(), FunctionError> {
        if self.args.len() > params.len() {
            return Err(FunctionError::type_error(format!(
                "takes {} positional arguments but {} were given",
                params.len(),
                self.args.len()
            )));
        }
        for key in self.kwargs.keys() {
            match params.iter().position(|p| *p == key.as_str()) {
                None => {
                    return Err(FunctionError::type_error(format!(
                        "got an unexpected keyword argument '{}'",
                        key
                    )))
                }
                Some(index) if index < self.args.len() => {
                    return Err(FunctionError::type_error(format!(
                        "got multiple values for argument '{}'",
                        key
                    )))
                }
                Some(_) => {}
            }
        }
        Ok(())
    }

    /// Raw value of a parameter, by position first and then by name.
    pub fn get(&self, position: usize, name: &str) -> Option<&Value> {
        self.args.get(position).or_else(|| self.kwargs.get(name))
    }

    /// Bind a required parameter.
    pub fn bind<T: DeserializeOwned>(&self, position: usize, name: &str) -> Result<T, FunctionError> {
        let value = self.get(position, name).ok_or_else(|| {
            FunctionError::type_error(format!("missing required argument '{}'", name))
        })?;
        serde_json::from_value(value.clone()).map_err(|e| {
            FunctionError::type_error(format!("argument '{}': {}", name, e))
        })
    }

    /// Bind an optional parameter; absent or `null` gives `None`.
    pub fn bind_optional<T: DeserializeOwned>(
        &self,
        position: usize,
        name: &str,
    ) -> Result<Option<T>, FunctionError> {
        match self.get(position, name) {
            None | Some(Value::Null) => Ok(None),
            Some(value) => serde_json::from_value(value.clone())
                .map(Some)
                .map_err(|e| FunctionError::type_error(format!("argument '{}': {}", name, e))),
        }
    }
}

/// Encode a request as `{"args": [...], "kwargs": {...}}`.
///
/// Fails if any argument given through `arg`/`kwarg` did not serialize.
pub fn encode_request(request: &CallRequest) -> Result<Vec<u8>, EnvelopeError> {
    if let Some(reason) = &request.encode_error {
        return Err(EnvelopeError::Encode(reason.clone()));
    }
    serde_json::to_vec(request).map_err(|e| EnvelopeError::Encode(e.to_string()))
}

/// Decode a request. Missing `args` or `kwargs` default to empty.
pub fn decode_request(bytes: &[u8]) -> Result<CallRequest, EnvelopeError> {
    let value: Value =
        serde_json::from_slice(bytes).map_err(|e| EnvelopeError::Malformed(e.to_string()))?;
    if !value.is_object() {
        return Err(EnvelopeError::Malformed(
            "request must be a JSON object".to_string(),
        ));
    }
    serde_json::from_value(value).map_err(|e| EnvelopeError::Malformed(e.to_string()))
}

// =============================================================================
// Responses
// =============================================================================

/// Outcome of a single invocation.
#[derive(Debug, Clone, PartialEq)]
pub enum CallResponse {
    Success {
        result: Value,
    },
    Failure {
        error: String,
        message: Value,
        pickled_exc: Option<String>,
    },
}

impl CallResponse {
    /// Build the envelope for a handler outcome.
    pub fn from_result(result: Result<Value, FunctionError>) -> Self {
        match result {
            Ok(result) => CallResponse::Success { result },
            Err(err) => CallResponse::from_error(&err),
        }
    }

    /// Build a failure envelope from a handler error.
    pub fn from_error(err: &FunctionError) -> Self {
        CallResponse::Failure {
            error: err.kind().to_string(),
            message: err.message().clone(),
            pickled_exc: err.portable().and_then(|p| p.encode().ok()),
        }
    }

    /// Failure envelope with no portable exception.
    pub fn failure(error: impl Into<String>, message: impl Into<String>) -> Self {
        CallResponse::Failure {
            error: error.into(),
            message: Value::String(message.into()),
            pickled_exc: None,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, CallResponse::Success { .. })
    }
}

/// On-the-wire shape of a response.
#[derive(Serialize, Deserialize)]
struct WireResponse {
    success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    message: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pickled_exc: Option<String>,
}

/// Encode a response envelope.
pub fn encode_response(response: &CallResponse) -> Result<Vec<u8>, EnvelopeError> {
    let wire = match response {
        CallResponse::Success { result } => WireResponse {
            success: true,
            result: Some(result.clone()),
            error: None,
            message: None,
            pickled_exc: None,
        },
        CallResponse::Failure {
            error,
            message,
            pickled_exc,
        } => WireResponse {
            success: false,
            result: None,
            error: Some(error.clone()),
            message: Some(message.clone()),
            pickled_exc: pickled_exc.clone(),
        },
    };
    serde_json::to_vec(&wire).map_err(|e| EnvelopeError::Encode(e.to_string()))
}

/// Decode a response envelope.
///
/// A success without `result` decodes as `null`; a failure without `error`
/// decodes with an empty kind.
pub fn decode_response(bytes: &[u8]) -> Result<CallResponse, EnvelopeError> {
    let wire: WireResponse =
        serde_json::from_slice(bytes).map_err(|e| EnvelopeError::Malformed(e.to_string()))?;
    if wire.success {
        Ok(CallResponse::Success {
            result: wire.result.unwrap_or(Value::Null),
        })
    } else {
        Ok(CallResponse::Failure {
            error: wire.error.unwrap_or_default(),
            message: wire.message.unwrap_or(Value::Null),
            pickled_exc: wire.pickled_exc,
        })
    }
}

/// Decode a response as raw JSON, with `pickled_exc` stripped.
///
/// Failure envelopes are returned as data, never as errors.
pub fn decode_response_raw(bytes: &[u8]) -> Result<Value, EnvelopeError> {
    let mut value: Value =
        serde_json::from_slice(bytes).map_err(|e| EnvelopeError::Malformed(e.to_string()))?;
    if let Value::Object(map) = &mut value {
        map.remove("pickled_exc");
    }
    Ok(value)
}

// =============================================================================
// Portable exceptions
// =============================================================================

/// Serialized form of a [`RemoteException`].
///
/// Encoded as base64 of a bitcode frame holding the kind tag and the JSON
/// text of the exception value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortableException {
    pub kind: String,
    pub payload: String,
}

impl PortableException {
    /// Snapshot an exception value.
    pub fn capture<E: RemoteException>(exception: &E) -> Result<Self, EnvelopeError> {
        let payload =
            serde_json::to_string(exception).map_err(|e| EnvelopeError::Encode(e.to_string()))?;
        Ok(Self {
            kind: E::KIND.to_string(),
            payload,
        })
    }

    /// Encode for the `pickled_exc` field.
    pub fn encode(&self) -> Result<String, EnvelopeError> {
        let bytes = bitcode::serialize(self).map_err(|e| EnvelopeError::Encode(e.to_string()))?;
        Ok(STANDARD.encode(bytes))
    }

    /// Decode a `pickled_exc` field.
    pub fn decode(encoded: &str) -> Result<Self, EnvelopeError> {
        let bytes = STANDARD
            .decode(encoded)
            .map_err(|e| EnvelopeError::Malformed(e.to_string()))?;
        bitcode::deserialize(&bytes).map_err(|e| EnvelopeError::Malformed(e.to_string()))
    }

    /// Rebuild the exception value, if it is of type `E`.
    pub fn rebuild<E: RemoteException>(&self) -> Option<E> {
        if self.kind != E::KIND {
            return None;
        }
        serde_json::from_str(&self.payload).ok()
    }
}
