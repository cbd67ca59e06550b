//! Calling remote functions.
//!
//! Every operation opens its own connection, does its work, and closes the
//! connection again, whatever the outcome. There is no pooling.
//!
//! ```text
//!   call(ns, name, req)
//!     connect ─► request {ns}.{name} ─► wait ≤ timeout ─► decode ─► close
//!                                          │                 │
//!                                          ▼                 ▼
//!                                   CallError::Timeout   Ok(result) / CallError::Remote
//!
//!   send(ns, name, req)          connect ─► publish {ns}.{name}    ─► close
//!   send_durable(ns, name, req)  connect ─► publish {ns}.js.{name} ─► close
//! ```
//!
//! A failure envelope becomes [`CallError::Remote`]. When its kind is in the
//! client's [`ExceptionRegistry`] the original exception value is rebuilt
//! and reachable through [`RemoteFailure::downcast_ref`].

use std::collections::HashMap;
use std::error::Error;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::bus::{Connection, Connector, TransportError};
use crate::envelope::{
    decode_response, decode_response_raw, encode_request, CallRequest, CallResponse, EnvelopeError,
    PortableException,
};
use crate::error::{RemoteException, ValidationError};
use crate::settings::Settings;
use crate::subject;

// =============================================================================
// Errors
// =============================================================================

/// A failure envelope received from the remote side.
pub struct RemoteFailure {
    kind: String,
    message: Value,
    exception: Option<Box<dyn Error + Send + Sync>>,
}

impl RemoteFailure {
    pub fn new(kind: impl Into<String>, message: Value) -> Self {
        Self {
            kind: kind.into(),
            message,
            exception: None,
        }
    }

    /// Kind tag the remote reported.
    pub fn kind(&self) -> &str {
        &self.kind
    }

    /// Message payload, a string or a structured value.
    pub fn message(&self) -> &Value {
        &self.message
    }

    pub fn message_text(&self) -> String {
        match &self.message {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        }
    }

    /// Whether the original exception value was rebuilt.
    pub fn is_reconstructed(&self) -> bool {
        self.exception.is_some()
    }

    /// The rebuilt exception, if it is of type `E`.
    pub fn downcast_ref<E: Error + 'static>(&self) -> Option<&E> {
        self.exception.as_deref()?.downcast_ref::<E>()
    }
}

impl fmt::Debug for RemoteFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteFailure")
            .field("kind", &self.kind)
            .field("message", &self.message)
            .field("reconstructed", &self.exception.is_some())
            .finish()
    }
}

impl fmt::Display for RemoteFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message_text())
    }
}

impl Error for RemoteFailure {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        self.exception
            .as_deref()
            .map(|e| e as &(dyn Error + 'static))
    }
}

/// Why a call did not return a result.
#[derive(Debug)]
pub enum CallError {
    /// No reply arrived before the timeout.
    Timeout(Duration),
    /// Connecting, publishing or waiting failed.
    Transport(TransportError),
    /// The request could not be encoded or the reply could not be decoded.
    Envelope(EnvelopeError),
    /// The remote function failed.
    Remote(RemoteFailure),
}

impl CallError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, CallError::Timeout(_))
    }

    /// The remote failure, if the remote function raised.
    pub fn remote(&self) -> Option<&RemoteFailure> {
        match self {
            CallError::Remote(failure) => Some(failure),
            _ => None,
        }
    }
}

impl fmt::Display for CallError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CallError::Timeout(after) => write!(f, "no reply within {:?}", after),
            CallError::Transport(e) => write!(f, "transport error: {}", e),
            CallError::Envelope(e) => write!(f, "envelope error: {}", e),
            CallError::Remote(e) => write!(f, "{}", e),
        }
    }
}

impl Error for CallError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            CallError::Timeout(_) => None,
            CallError::Transport(e) => Some(e),
            CallError::Envelope(e) => Some(e),
            CallError::Remote(e) => Some(e),
        }
    }
}

impl From<TransportError> for CallError {
    fn from(err: TransportError) -> Self {
        CallError::Transport(err)
    }
}

impl From<EnvelopeError> for CallError {
    fn from(err: EnvelopeError) -> Self {
        CallError::Envelope(err)
    }
}

// =============================================================================
// Exception registry
// =============================================================================

type Rebuild = fn(&PortableException) -> Option<Box<dyn Error + Send + Sync>>;

/// Exception kinds a client knows how to rebuild.
///
/// Kinds not registered here, and portable forms that fail to decode, fall
/// back to a plain [`RemoteFailure`] carrying the kind and message.
#[derive(Clone)]
pub struct ExceptionRegistry {
    kinds: HashMap<&'static str, Rebuild>,
}

impl Default for ExceptionRegistry {
    /// Registry that knows [`ValidationError`].
    fn default() -> Self {
        let mut registry = Self::empty();
        registry.register::<ValidationError>();
        registry
    }
}

impl ExceptionRegistry {
    /// Registry that rebuilds nothing.
    pub fn empty() -> Self {
        Self {
            kinds: HashMap::new(),
        }
    }

    /// Make `E` reconstructible.
    pub fn register<E: RemoteException>(&mut self) -> &mut Self {
        self.kinds.insert(E::KIND, |portable| {
            portable
                .rebuild::<E>()
                .map(|e| Box::new(e) as Box<dyn Error + Send + Sync>)
        });
        self
    }

    pub fn knows(&self, kind: &str) -> bool {
        self.kinds.contains_key(kind)
    }

    /// Turn a failure envelope into a [`RemoteFailure`].
    pub fn failure(&self, error: String, message: Value, pickled_exc: Option<&str>) -> RemoteFailure {
        let mut failure = RemoteFailure::new(error, message);
        let Some(encoded) = pickled_exc else {
            return failure;
        };
        match PortableException::decode(encoded) {
            Ok(portable) if portable.kind == failure.kind => {
                failure.exception = self
                    .kinds
                    .get(portable.kind.as_str())
                    .and_then(|rebuild| rebuild(&portable));
            }
            Ok(portable) => {
                tracing::debug!(
                    kind = %failure.kind,
                    portable = %portable.kind,
                    "portable exception kind mismatch"
                );
            }
            Err(e) => {
                tracing::debug!(kind = %failure.kind, error = %e, "undecodable portable exception");
            }
        }
        failure
    }
}

impl fmt::Debug for ExceptionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut kinds: Vec<_> = self.kinds.keys().collect();
        kinds.sort();
        f.debug_struct("ExceptionRegistry").field("kinds", &kinds).finish()
    }
}

// =============================================================================
// Client
// =============================================================================

/// Per-call options.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CallOptions {
    /// Reply wait. Falls back to `Settings::request_timeout`.
    pub timeout: Option<Duration>,
    /// Return the whole response envelope (minus `pickled_exc`) instead of
    /// the result, and never fail on a failure envelope.
    pub raw: bool,
}

impl CallOptions {
    pub fn timeout(timeout: Duration) -> Self {
        Self {
            timeout: Some(timeout),
            raw: false,
        }
    }

    pub fn raw() -> Self {
        Self {
            timeout: None,
            raw: true,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// Invokes remote functions over the bus.
#[derive(Clone)]
pub struct Client {
    connector: Arc<dyn Connector>,
    settings: Settings,
    exceptions: Arc<ExceptionRegistry>,
}

impl Client {
    pub fn new(connector: Arc<dyn Connector>, settings: Settings) -> Self {
        Self {
            connector,
            settings,
            exceptions: Arc::new(ExceptionRegistry::default()),
        }
    }

    /// Replace the set of reconstructible exception kinds.
    pub fn with_exceptions(mut self, exceptions: ExceptionRegistry) -> Self {
        self.exceptions = Arc::new(exceptions);
        self
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Call `{namespace}.{name}` and wait for its result.
    pub async fn call(
        &self,
        namespace: &str,
        name: &str,
        request: CallRequest,
    ) -> Result<Value, CallError> {
        self.call_with(namespace, name, request, CallOptions::default())
            .await
    }

    /// Call with explicit options.
    pub async fn call_with(
        &self,
        namespace: &str,
        name: &str,
        request: CallRequest,
        options: CallOptions,
    ) -> Result<Value, CallError> {
        let subject = subject::function_subject(namespace, name, false);
        let payload = encode_request(&request)?;
        let timeout = options.timeout.unwrap_or(self.settings.request_timeout);

        let reply = self
            .with_connection(|conn| async move {
                conn.request(&subject, payload, timeout)
                    .await
                    .map_err(|e| match e {
                        TransportError::Timeout => CallError::Timeout(timeout),
                        other => CallError::Transport(other),
                    })
            })
            .await?;

        if options.raw {
            return Ok(decode_response_raw(&reply.payload)?);
        }
        match decode_response(&reply.payload)? {
            CallResponse::Success { result } => Ok(result),
            CallResponse::Failure {
                error,
                message,
                pickled_exc,
            } => Err(CallError::Remote(self.exceptions.failure(
                error,
                message,
                pickled_exc.as_deref(),
            ))),
        }
    }

    /// Call and return the response envelope as JSON, `pickled_exc` removed.
    pub async fn call_raw(
        &self,
        namespace: &str,
        name: &str,
        request: CallRequest,
    ) -> Result<Value, CallError> {
        self.call_with(namespace, name, request, CallOptions::raw())
            .await
    }

    /// Call and deserialize the result.
    pub async fn call_as<T: DeserializeOwned>(
        &self,
        namespace: &str,
        name: &str,
        request: CallRequest,
    ) -> Result<T, CallError> {
        let value = self.call(namespace, name, request).await?;
        serde_json::from_value(value).map_err(|e| CallError::Envelope(EnvelopeError::Malformed(e.to_string())))
    }

    /// Publish a call to `{namespace}.{name}` without waiting for anything.
    pub async fn send(
        &self,
        namespace: &str,
        name: &str,
        request: CallRequest,
    ) -> Result<(), CallError> {
        let subject = subject::function_subject(namespace, name, false);
        let payload = encode_request(&request)?;
        self.with_connection(|conn| async move {
            conn.publish(&subject, payload).await?;
            Ok(())
        })
        .await
    }

    /// Publish a call to `{namespace}.js.{name}`, stored until a durable
    /// consumer acknowledges it.
    pub async fn send_durable(
        &self,
        namespace: &str,
        name: &str,
        request: CallRequest,
    ) -> Result<(), CallError> {
        let subject = subject::function_subject(namespace, name, true);
        let payload = encode_request(&request)?;
        self.with_connection(|conn| async move {
            conn.publish_durable(&subject, payload).await?;
            Ok(())
        })
        .await
    }

    /// [`call`](Self::call) from synchronous code.
    ///
    /// Runs on a fresh current-thread runtime; fails when called from
    /// inside a runtime.
    pub fn call_blocking(
        &self,
        namespace: &str,
        name: &str,
        request: CallRequest,
    ) -> Result<Value, CallError> {
        block_on(self.call(namespace, name, request))?
    }

    /// [`send`](Self::send) from synchronous code.
    pub fn send_blocking(
        &self,
        namespace: &str,
        name: &str,
        request: CallRequest,
    ) -> Result<(), CallError> {
        block_on(self.send(namespace, name, request))?
    }

    /// [`send_durable`](Self::send_durable) from synchronous code.
    pub fn send_durable_blocking(
        &self,
        namespace: &str,
        name: &str,
        request: CallRequest,
    ) -> Result<(), CallError> {
        block_on(self.send_durable(namespace, name, request))?
    }

    /// Run `op` on a fresh connection and close it afterwards.
    async fn with_connection<T, F, Fut>(&self, op: F) -> Result<T, CallError>
    where
        F: FnOnce(Arc<dyn Connection>) -> Fut,
        Fut: Future<Output = Result<T, CallError>>,
    {
        let lease = Lease::new(self.connector.connect().await?);
        let result = op(lease.connection()).await;
        lease.release().await;
        result
    }
}

impl fmt::Debug for Client {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Client")
            .field("settings", &self.settings)
            .field("exceptions", &self.exceptions)
            .finish()
    }
}

/// A connection owned by one client operation.
///
/// Closed by [`release`](Lease::release), or in the background if the
/// operation's future is dropped first.
struct Lease {
    connection: Arc<dyn Connection>,
    released: bool,
}

impl Lease {
    fn new(connection: Arc<dyn Connection>) -> Self {
        Self {
            connection,
            released: false,
        }
    }

    fn connection(&self) -> Arc<dyn Connection> {
        Arc::clone(&self.connection)
    }

    async fn release(mut self) {
        self.released = true;
        if let Err(e) = self.connection.close().await {
            tracing::warn!(error = %e, "failed to close connection");
        }
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        let conn = Arc::clone(&self.connection);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    let _ = conn.close().await;
                });
            }
            Err(_) => tracing::warn!("connection dropped outside a runtime"),
        }
    }
}

fn block_on<F: Future>(future: F) -> Result<F::Output, CallError> {
    if tokio::runtime::Handle::try_current().is_ok() {
        return Err(CallError::Transport(TransportError::Other(
            "blocking call made from inside an async runtime".to_string(),
        )));
    }
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .map_err(|e| CallError::Transport(TransportError::Other(e.to_string())))?;
    Ok(runtime.block_on(future))
}
