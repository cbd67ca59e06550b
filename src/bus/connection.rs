//! Transport traits.
//!
//! The dispatch layer talks to the message bus only through these traits.
//! [`InMemoryBus`](super::InMemoryBus) implements them for tests and
//! single-process use; a broker client (NATS with JetStream, for instance)
//! implements them for production.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use super::error::TransportError;
use super::message::{Delivery, Message};

/// Opens connections to the bus.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self) -> Result<Arc<dyn Connection>, TransportError>;
}

/// A live connection to the bus.
///
/// Implementations must allow concurrent publishes from many tasks.
#[async_trait]
pub trait Connection: Send + Sync {
    /// Publish a message, fire-and-forget.
    async fn publish(&self, subject: &str, payload: Vec<u8>) -> Result<(), TransportError>;

    /// Publish into a durable stream and wait for the stream to store it.
    async fn publish_durable(&self, subject: &str, payload: Vec<u8>) -> Result<(), TransportError>;

    /// Publish with a fresh reply address and wait for a single reply.
    async fn request(
        &self,
        subject: &str,
        payload: Vec<u8>,
        timeout: Duration,
    ) -> Result<Message, TransportError>;

    /// Subscribe to a subject pattern (`*` and `>` wildcards allowed).
    async fn subscribe(&self, subject: &str) -> Result<Subscription, TransportError>;

    /// Create a stream capturing `subjects`, or extend an existing one.
    async fn ensure_stream(&self, stream: &str, subjects: &[String]) -> Result<(), TransportError>;

    /// Create or bind to a named durable pull consumer.
    ///
    /// Binding to an existing name resumes from its stored cursor.
    async fn pull_consumer(
        &self,
        stream: &str,
        durable_name: &str,
        filter_subject: &str,
    ) -> Result<Arc<dyn PullConsumer>, TransportError>;

    /// Flush pending publishes, then close.
    async fn drain(&self) -> Result<(), TransportError>;

    /// Close immediately.
    async fn close(&self) -> Result<(), TransportError>;
}

/// A durable pull consumer bound to one subject.
#[async_trait]
pub trait PullConsumer: Send + Sync {
    fn name(&self) -> &str;

    /// Fetch up to `batch` messages, waiting at most `expires`.
    ///
    /// Returns an empty batch when nothing arrived in time.
    async fn fetch(&self, batch: usize, expires: Duration) -> Result<Vec<Delivery>, TransportError>;

    /// Acknowledge a delivery so it is never redelivered.
    async fn ack(&self, delivery: &Delivery) -> Result<(), TransportError>;
}

/// Push subscription. Ends when the connection closes.
pub struct Subscription {
    subject: String,
    receiver: mpsc::UnboundedReceiver<Message>,
}

impl Subscription {
    pub fn new(subject: impl Into<String>, receiver: mpsc::UnboundedReceiver<Message>) -> Self {
        Self {
            subject: subject.into(),
            receiver,
        }
    }

    /// Subject pattern this subscription was created with.
    pub fn subject(&self) -> &str {
        &self.subject
    }

    /// Next message, or `None` once the subscription is closed.
    pub async fn next(&mut self) -> Option<Message> {
        self.receiver.recv().await
    }
}
