//! remote_fn integration tests.

mod support;
mod functions;
mod registration;
mod calls;
mod durable;

#[cfg(feature = "http")]
mod http;
