//! Runtime settings for clients and listeners.
//!
//! Settings load from defaults, a TOML document, or `NATS_*` environment
//! variables:
//!
//! | Variable               | Field              | Default      |
//! |------------------------|--------------------|--------------|
//! | `NATS_SERVER`          | `servers` (single) |              |
//! | `NATS_SERVERS`         | `servers` (comma)  | `[]`         |
//! | `NATS_NAMESPACE`       | `namespace`        | `default`    |
//! | `NATS_REQUEST_TIMEOUT` | `request_timeout`  | `1` second   |
//! | `NATS_DURABLE_NAME`    | `durable_name`     | `remote_fn`  |
//! | `NATS_STREAM_NAME`     | `stream_name`      | `remote_fn`  |
//! | `NATS_FETCH_BATCH`     | `fetch_batch`      | `1`          |
//! | `NATS_FETCH_WAIT`      | `fetch_wait`       | `1` second   |
//! | `NATS_ACK_UNROUTABLE`  | `ack_unroutable`   | `true`       |
//! | `NATS_DRAIN_TIMEOUT`   | `drain_timeout`    | `30` seconds |
//!
//! Durations are given in (fractional) seconds.

use std::error::Error;
use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::registry::DEFAULT_NAMESPACE;

/// Reply wait for requests when nothing else is configured.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(1);

/// Error loading settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SettingsError {
    /// The TOML document could not be parsed.
    Parse(String),
    /// A value is out of range or has the wrong format.
    Invalid { key: String, reason: String },
}

impl fmt::Display for SettingsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SettingsError::Parse(msg) => write!(f, "settings parse error: {}", msg),
            SettingsError::Invalid { key, reason } => {
                write!(f, "invalid setting {}: {}", key, reason)
            }
        }
    }
}

impl Error for SettingsError {}

/// Client and listener settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Server URLs handed to the connector.
    pub servers: Vec<String>,
    /// Default namespace for registrations.
    pub namespace: String,
    /// How long `call` waits for a reply.
    #[serde(with = "seconds")]
    pub request_timeout: Duration,
    /// Base name for durable consumers.
    pub durable_name: String,
    /// Stream that captures durable subjects.
    pub stream_name: String,
    /// Messages per pull-consumer fetch.
    pub fetch_batch: usize,
    /// Longest a fetch waits for messages.
    #[serde(with = "seconds")]
    pub fetch_wait: Duration,
    /// Acknowledge durable messages that cannot be routed (unknown
    /// function, malformed payload) instead of letting them redeliver.
    pub ack_unroutable: bool,
    /// How long a stopping listener waits for in-flight replies.
    #[serde(with = "seconds")]
    pub drain_timeout: Duration,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            servers: Vec::new(),
            namespace: DEFAULT_NAMESPACE.to_string(),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            durable_name: "remote_fn".to_string(),
            stream_name: "remote_fn".to_string(),
            fetch_batch: 1,
            fetch_wait: Duration::from_secs(1),
            ack_unroutable: true,
            drain_timeout: Duration::from_secs(30),
        }
    }
}

impl Settings {
    /// Parse settings from TOML. Missing keys keep their defaults.
    pub fn from_toml_str(source: &str) -> Result<Self, SettingsError> {
        let settings: Settings =
            toml::from_str(source).map_err(|e| SettingsError::Parse(e.to_string()))?;
        settings.validate()
    }

    /// Defaults overlaid with `NATS_*` environment variables.
    pub fn from_env() -> Result<Self, SettingsError> {
        Self::default().overlay(|key| std::env::var(key).ok())
    }

    /// Overlay values from a variable lookup.
    pub fn overlay<F>(mut self, lookup: F) -> Result<Self, SettingsError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(servers) = lookup("NATS_SERVERS") {
            self.servers = servers
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(String::from)
                .collect();
        }
        // A single server wins over the list.
        if let Some(server) = lookup("NATS_SERVER") {
            self.servers = vec![server];
        }
        if let Some(namespace) = lookup("NATS_NAMESPACE") {
            self.namespace = namespace;
        }
        if let Some(timeout) = lookup("NATS_REQUEST_TIMEOUT") {
            self.request_timeout = parse_seconds("NATS_REQUEST_TIMEOUT", &timeout)?;
        }
        if let Some(name) = lookup("NATS_DURABLE_NAME") {
            self.durable_name = name;
        }
        if let Some(name) = lookup("NATS_STREAM_NAME") {
            self.stream_name = name;
        }
        if let Some(batch) = lookup("NATS_FETCH_BATCH") {
            self.fetch_batch = batch.trim().parse().map_err(|_| SettingsError::Invalid {
                key: "NATS_FETCH_BATCH".to_string(),
                reason: format!("`{}` is not a positive integer", batch),
            })?;
        }
        if let Some(wait) = lookup("NATS_FETCH_WAIT") {
            self.fetch_wait = parse_seconds("NATS_FETCH_WAIT", &wait)?;
        }
        if let Some(flag) = lookup("NATS_ACK_UNROUTABLE") {
            self.ack_unroutable = parse_bool("NATS_ACK_UNROUTABLE", &flag)?;
        }
        if let Some(timeout) = lookup("NATS_DRAIN_TIMEOUT") {
            self.drain_timeout = parse_seconds("NATS_DRAIN_TIMEOUT", &timeout)?;
        }
        self.validate()
    }

    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_fetch_wait(mut self, wait: Duration) -> Self {
        self.fetch_wait = wait;
        self
    }

    pub fn with_drain_timeout(mut self, timeout: Duration) -> Self {
        self.drain_timeout = timeout;
        self
    }

    pub fn with_ack_unroutable(mut self, ack: bool) -> Self {
        self.ack_unroutable = ack;
        self
    }

    fn validate(self) -> Result<Self, SettingsError> {
        if self.fetch_batch == 0 {
            return Err(SettingsError::Invalid {
                key: "fetch_batch".to_string(),
                reason: "must be at least 1".to_string(),
            });
        }
        if let Err(reason) = crate::subject::validate_token(&self.namespace) {
            return Err(SettingsError::Invalid {
                key: "namespace".to_string(),
                reason: reason.to_string(),
            });
        }
        Ok(self)
    }
}

fn parse_seconds(key: &str, value: &str) -> Result<Duration, SettingsError> {
    value
        .trim()
        .parse::<f64>()
        .ok()
        .and_then(|secs| Duration::try_from_secs_f64(secs).ok())
        .ok_or_else(|| SettingsError::Invalid {
            key: key.to_string(),
            reason: format!("`{}` is not a duration in seconds", value),
        })
}

fn parse_bool(key: &str, value: &str) -> Result<bool, SettingsError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(SettingsError::Invalid {
            key: key.to_string(),
            reason: format!("`{}` is not a boolean", value),
        }),
    }
}

/// Serde adapter for durations written as seconds.
mod seconds {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(value.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(deserializer)?;
        Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom)
    }
}
