//! Named remote functions over a publish/subscribe bus.
//!
//! Functions are registered under `(namespace, durable, name)` and
//! addressed on the bus as `{namespace}.{name}`, or `{namespace}.js.{name}`
//! when they are consumed through a durable pull consumer. A [`Listener`]
//! serves a [`Registry`]; a [`Client`] calls into it.
//!
//! ```text
//!   Client ──encode──► {ns}.{name} ──► Listener ──► Dispatcher ──► handler
//!     ▲                                                  │
//!     └──────────────decode◄── reply envelope ◄──────────┘
//! ```
//!
//! ## Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use remote_fn::{remote_fn, CallRequest, Client, Listener, Registry, Settings};
//! use remote_fn::bus::InMemoryBus;
//!
//! #[remote_fn]
//! fn add(a: i64, b: i64) -> i64 {
//!     a + b
//! }
//!
//! let mut registry = Registry::with_namespace("math");
//! registry.register(add)?;
//!
//! let bus = Arc::new(InMemoryBus::new());
//! let listener = Listener::new(Arc::new(registry), bus.clone(), Settings::default());
//! let handle = listener.start().await?;
//!
//! let client = Client::new(bus, Settings::default());
//! let sum: i64 = client.call_as("math", "add", CallRequest::new().arg(2).arg(3)).await?;
//! assert_eq!(sum, 5);
//!
//! handle.stop().await;
//! ```

// Lets `#[remote_fn]` expansions resolve `::remote_fn` inside this crate.
extern crate self as remote_fn;

pub mod bus;
pub mod client;
pub mod dispatcher;
pub mod envelope;
pub mod error;
pub mod handler;
#[cfg(feature = "http")]
pub mod http;
pub mod listener;
pub mod registry;
pub mod settings;
pub mod subject;

pub use client::{CallError, CallOptions, Client, ExceptionRegistry, RemoteFailure};
pub use dispatcher::{DispatchError, Dispatcher};
pub use envelope::{CallRequest, CallResponse, EnvelopeError};
pub use error::{FunctionError, RemoteException, ValidationError};
pub use handler::{BlockingPool, ExecutionContext, Handler, HandlerResult, Inline};
pub use listener::{Listener, ListenerError, ListenerHandle, ListenerState, ListenerStats};
pub use registry::{
    FunctionKey, RegisteredFunction, Registration, RegistrationError, Registry, RemoteFunction,
};
pub use settings::{Settings, SettingsError};

// Re-export the attribute macro from the remote_fn_macros crate
pub use remote_fn_macros::remote_fn;

#[doc(hidden)]
pub mod __private {
    use serde::Serialize;

    use crate::error::FunctionError;
    use crate::handler::HandlerResult;

    /// Serialize a `#[remote_fn]` return value.
    pub fn into_result<T: Serialize>(value: T) -> HandlerResult {
        serde_json::to_value(value).map_err(FunctionError::from)
    }
}
