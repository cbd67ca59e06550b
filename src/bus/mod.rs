//! Message bus abstraction.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                 Client / Listener                           │
//! │  request() / publish() / subscribe() / fetch() / ack()      │
//! └─────────────────────────────────────────────────────────────┘
//!                            │
//!                            ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │          Connector + Connection + PullConsumer traits        │
//! └─────────────────────────────────────────────────────────────┘
//!          │                                     │
//!          ▼                                     ▼
//! ┌─────────────────┐                 ┌─────────────────────────┐
//! │  InMemoryBus    │                 │ NATS + JetStream client │
//! │  (included)     │                 │      (external)         │
//! └─────────────────┘                 └─────────────────────────┘
//! ```

mod connection;
mod error;
mod in_memory;
mod message;

pub use connection::{Connection, Connector, PullConsumer, Subscription};
pub use error::TransportError;
pub use in_memory::{InMemoryBus, InMemoryConnection, InMemoryConsumer, DEFAULT_ACK_WAIT};
pub use message::{Delivery, Message};
