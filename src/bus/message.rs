//! Messages as they travel on the bus.

/// A message received from a subject.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Message {
    /// Subject the message was published on
    pub subject: String,
    /// Reply address, present on requests
    pub reply: Option<String>,
    /// Raw payload (JSON envelopes in this crate)
    pub payload: Vec<u8>,
}

impl Message {
    pub fn new(subject: impl Into<String>, payload: Vec<u8>) -> Self {
        Self {
            subject: subject.into(),
            reply: None,
            payload,
        }
    }

    /// Set the reply address.
    pub fn with_reply(mut self, reply: impl Into<String>) -> Self {
        self.reply = Some(reply.into());
        self
    }

    /// Get the payload as a string (if valid UTF-8).
    pub fn payload_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.payload).ok()
    }
}

/// A message handed out by a durable pull consumer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Delivery {
    pub message: Message,
    /// Stream sequence, used to acknowledge.
    pub sequence: u64,
    /// 1 on first delivery, incremented on each redelivery.
    pub attempt: u32,
}
