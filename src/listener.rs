//! Background listener serving a [`Registry`] over the bus.
//!
//! ```text
//!   Stopped ─► Connecting ─► Subscribing ─► Running ─► Draining ─► Stopped
//!
//!   Running:
//!   ┌───────────────────────────┐     ┌──────────────────────────────────┐
//!   │ {ns}.> subscription       │     │ pull consumer per durable fn     │
//!   │  msg ─► spawn ─► dispatch │     │  fetch ─► spawn ─► dispatch      │
//!   │        └─► reply (if any) │     │        └─► ack (per policy)      │
//!   └───────────────────────────┘     └──────────────────────────────────┘
//! ```
//!
//! Every namespace in the registry gets one wildcard subscription, which
//! serves its ephemeral functions and answers unknown names.
//! Durable functions each get their own pull consumer, named from the
//! configured base name and the subject so a restart resumes the same
//! server-side cursor. Messages are handled in their own tasks; a failing
//! message never takes the listener down.
//!
//! ## Example
//!
//! ```ignore
//! let listener = Listener::new(Arc::new(registry), Arc::new(bus), Settings::from_env()?);
//! let handle = listener.start().await?;
//! // ...
//! let stats = handle.stop().await;
//! ```

use std::error::Error;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};

use crate::bus::{Connection, Connector, Delivery, Message, PullConsumer, Subscription, TransportError};
use crate::dispatcher::{log_failure, DispatchError, Dispatcher};
use crate::envelope::{encode_response, CallResponse};
use crate::registry::Registry;
use crate::settings::Settings;
use crate::subject;

/// Pause after a failed fetch before the next one.
const FETCH_RETRY_PAUSE: Duration = Duration::from_millis(100);

// =============================================================================
// State, stats, errors
// =============================================================================

/// Lifecycle state of a [`Listener`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerState {
    Stopped,
    Connecting,
    Subscribing,
    Running,
    Draining,
}

/// Counters collected while a listener runs.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ListenerStats {
    /// Messages taken off subscriptions and pull consumers.
    pub received: usize,
    /// Messages whose handler returned a result.
    pub handled: usize,
    /// Messages that failed: unknown function, bad payload, or handler error.
    pub failed: usize,
    /// Replies published.
    pub replied: usize,
    /// Durable messages acknowledged.
    pub acked: usize,
    /// Fetch calls issued by pull loops.
    pub fetches: usize,
}

#[derive(Default)]
struct Counters {
    received: AtomicUsize,
    handled: AtomicUsize,
    failed: AtomicUsize,
    replied: AtomicUsize,
    acked: AtomicUsize,
    fetches: AtomicUsize,
}

impl Counters {
    fn bump(counter: &AtomicUsize) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> ListenerStats {
        ListenerStats {
            received: self.received.load(Ordering::Relaxed),
            handled: self.handled.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            replied: self.replied.load(Ordering::Relaxed),
            acked: self.acked.load(Ordering::Relaxed),
            fetches: self.fetches.load(Ordering::Relaxed),
        }
    }
}

/// Error starting a listener. All of them are fatal.
#[derive(Debug)]
pub enum ListenerError {
    /// The bus connection could not be opened.
    Connect(TransportError),
    /// A subscription, stream or pull consumer could not be set up.
    Subscribe {
        subject: String,
        source: TransportError,
    },
    /// `start` was called on a listener that is not stopped.
    AlreadyStarted,
}

impl fmt::Display for ListenerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ListenerError::Connect(e) => write!(f, "listener failed to connect: {}", e),
            ListenerError::Subscribe { subject, source } => {
                write!(f, "failed to subscribe to {}: {}", subject, source)
            }
            ListenerError::AlreadyStarted => write!(f, "listener is already running"),
        }
    }
}

impl Error for ListenerError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            ListenerError::Connect(e) => Some(e),
            ListenerError::Subscribe { source, .. } => Some(source),
            ListenerError::AlreadyStarted => None,
        }
    }
}

// =============================================================================
// Listener
// =============================================================================

/// Serves every function in a registry.
pub struct Listener {
    dispatcher: Dispatcher,
    connector: Arc<dyn Connector>,
    settings: Settings,
    state: Arc<watch::Sender<ListenerState>>,
}

impl Listener {
    pub fn new(registry: Arc<Registry>, connector: Arc<dyn Connector>, settings: Settings) -> Self {
        let (state, _) = watch::channel(ListenerState::Stopped);
        Self {
            dispatcher: Dispatcher::new(registry),
            connector,
            settings,
            state: Arc::new(state),
        }
    }

    pub fn state(&self) -> ListenerState {
        *self.state.borrow()
    }

    /// Watch state transitions.
    pub fn watch_state(&self) -> watch::Receiver<ListenerState> {
        self.state.subscribe()
    }

    /// Connect, subscribe, and start serving in background tasks.
    pub async fn start(&self) -> Result<ListenerHandle, ListenerError> {
        let claimed = self.state.send_if_modified(|state| {
            if *state == ListenerState::Stopped {
                *state = ListenerState::Connecting;
                true
            } else {
                false
            }
        });
        if !claimed {
            return Err(ListenerError::AlreadyStarted);
        }

        let connection = match self.connector.connect().await {
            Ok(connection) => connection,
            Err(e) => {
                tracing::error!(error = %e, "listener failed to connect");
                self.state.send_replace(ListenerState::Stopped);
                return Err(ListenerError::Connect(e));
            }
        };

        self.state.send_replace(ListenerState::Subscribing);
        let sources = match self.subscribe_all(&connection).await {
            Ok(sources) => sources,
            Err(e) => {
                tracing::error!(error = %e, "listener failed to subscribe");
                if let Err(close) = connection.close().await {
                    tracing::warn!(error = %close, "failed to close connection");
                }
                self.state.send_replace(ListenerState::Stopped);
                return Err(e);
            }
        };

        let (stop_tx, _) = watch::channel(false);
        let counters = Arc::new(Counters::default());
        let mut tasks = Vec::new();
        for source in sources {
            let worker = Worker {
                dispatcher: self.dispatcher.clone(),
                connection: Arc::clone(&connection),
                counters: Arc::clone(&counters),
                settings: self.settings.clone(),
                stop: stop_tx.subscribe(),
            };
            tasks.push(match source {
                Source::Subscription(sub) => tokio::spawn(worker.serve_subscription(sub)),
                Source::Consumer(consumer) => tokio::spawn(worker.serve_consumer(consumer)),
            });
        }

        self.log_started();
        self.state.send_replace(ListenerState::Running);

        Ok(ListenerHandle {
            stop_tx,
            tasks,
            connection: Some(connection),
            counters,
            state: Arc::clone(&self.state),
        })
    }

    /// Start, serve until `shutdown` resolves, then stop.
    pub async fn run_until<F: Future>(&self, shutdown: F) -> Result<ListenerStats, ListenerError> {
        let handle = self.start().await?;
        shutdown.await;
        Ok(handle.stop().await)
    }

    /// Serve until Ctrl-C.
    pub async fn run(&self) -> Result<ListenerStats, ListenerError> {
        self.run_until(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %e, "failed to listen for ctrl-c");
            }
        })
        .await
    }

    async fn subscribe_all(
        &self,
        connection: &Arc<dyn Connection>,
    ) -> Result<Vec<Source>, ListenerError> {
        let registry = self.dispatcher.registry();
        let mut sources = Vec::new();

        for namespace in registry.namespaces() {
            let wildcard = subject::namespace_wildcard(namespace);
            let sub = connection
                .subscribe(&wildcard)
                .await
                .map_err(|source| ListenerError::Subscribe {
                    subject: wildcard.clone(),
                    source,
                })?;
            sources.push(Source::Subscription(sub));
        }

        let mut durable: Vec<String> = registry
            .durable_functions()
            .map(|f| f.subject().to_string())
            .collect();
        durable.sort();
        if !durable.is_empty() {
            connection
                .ensure_stream(&self.settings.stream_name, &durable)
                .await
                .map_err(|source| ListenerError::Subscribe {
                    subject: durable.join(","),
                    source,
                })?;
        }
        for subject in &durable {
            let name = subject::durable_consumer_name(&self.settings.durable_name, subject);
            let consumer = connection
                .pull_consumer(&self.settings.stream_name, &name, subject)
                .await
                .map_err(|source| ListenerError::Subscribe {
                    subject: subject.clone(),
                    source,
                })?;
            sources.push(Source::Consumer(consumer));
        }

        Ok(sources)
    }

    fn log_started(&self) {
        let registry = self.dispatcher.registry();
        if registry.is_empty() {
            tracing::warn!("no functions registered, listener is idle");
            return;
        }
        let mut subjects: Vec<&str> = registry.subjects().collect();
        subjects.sort_unstable();
        tracing::info!(subjects = ?subjects, "listening");
    }
}

impl fmt::Debug for Listener {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Listener")
            .field("state", &self.state())
            .field("dispatcher", &self.dispatcher)
            .finish()
    }
}

enum Source {
    Subscription(Subscription),
    Consumer(Arc<dyn PullConsumer>),
}

/// Handle to a running listener. Drop or call `stop()` to shut down.
pub struct ListenerHandle {
    stop_tx: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
    connection: Option<Arc<dyn Connection>>,
    counters: Arc<Counters>,
    state: Arc<watch::Sender<ListenerState>>,
}

impl ListenerHandle {
    /// Counters so far.
    pub fn stats(&self) -> ListenerStats {
        self.counters.snapshot()
    }

    /// Drain and stop. Returns the final counters.
    ///
    /// In-flight ephemeral messages get up to `drain_timeout` to reply; pull
    /// loops are abandoned and their unacknowledged messages redeliver.
    pub async fn stop(mut self) -> ListenerStats {
        self.state.send_replace(ListenerState::Draining);
        let _ = self.stop_tx.send(true);

        for task in std::mem::take(&mut self.tasks) {
            if let Err(e) = task.await {
                tracing::warn!(error = %e, "listener task ended abnormally");
            }
        }
        if let Some(connection) = self.connection.take() {
            if let Err(e) = connection.drain().await {
                tracing::warn!(error = %e, "failed to drain connection");
            }
        }

        self.state.send_replace(ListenerState::Stopped);
        let stats = self.counters.snapshot();
        tracing::info!(?stats, "listener stopped");
        stats
    }

    /// Signal stop without waiting.
    pub fn signal_stop(&self) {
        let _ = self.stop_tx.send(true);
    }
}

impl Drop for ListenerHandle {
    fn drop(&mut self) {
        let _ = self.stop_tx.send(true);
        let Some(connection) = self.connection.take() else {
            return;
        };
        let state = Arc::clone(&self.state);
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(async move {
                    let _ = connection.close().await;
                    state.send_replace(ListenerState::Stopped);
                });
            }
            Err(_) => {
                state.send_replace(ListenerState::Stopped);
            }
        }
    }
}

// =============================================================================
// Workers
// =============================================================================

/// Everything one subscription or pull loop needs.
struct Worker {
    dispatcher: Dispatcher,
    connection: Arc<dyn Connection>,
    counters: Arc<Counters>,
    settings: Settings,
    stop: watch::Receiver<bool>,
}

impl Worker {
    fn is_consumed_durable(&self, subject: &str) -> bool {
        subject::is_durable_subject(subject)
            && self
                .dispatcher
                .registry()
                .resolve(subject)
                .is_some_and(|f| f.is_durable())
    }

    async fn serve_subscription(mut self, mut sub: Subscription) {
        let mut in_flight = JoinSet::new();
        loop {
            let message = tokio::select! {
                _ = self.stop.changed() => break,
                message = sub.next() => match message {
                    Some(message) => message,
                    None => break,
                },
            };
            // Registered durable subjects match the wildcard too; their pull consumer owns them.
            if self.is_consumed_durable(&message.subject) {
                continue;
            }
            Counters::bump(&self.counters.received);
            in_flight.spawn(handle_message(
                self.dispatcher.clone(),
                Arc::clone(&self.connection),
                Arc::clone(&self.counters),
                message,
            ));
            while in_flight.try_join_next().is_some() {}
        }

        let drained = tokio::time::timeout(self.settings.drain_timeout, async {
            while in_flight.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            tracing::warn!(
                subject = sub.subject(),
                abandoned = in_flight.len(),
                "drain timed out"
            );
            in_flight.abort_all();
        }
    }

    async fn serve_consumer(mut self, consumer: Arc<dyn PullConsumer>) {
        let mut in_flight = JoinSet::new();
        loop {
            Counters::bump(&self.counters.fetches);
            let fetched = tokio::select! {
                _ = self.stop.changed() => break,
                fetched = consumer.fetch(self.settings.fetch_batch, self.settings.fetch_wait) => fetched,
            };
            match fetched {
                Ok(batch) => {
                    for delivery in batch {
                        Counters::bump(&self.counters.received);
                        in_flight.spawn(handle_delivery(
                            self.dispatcher.clone(),
                            Arc::clone(&consumer),
                            Arc::clone(&self.counters),
                            self.settings.ack_unroutable,
                            delivery,
                        ));
                    }
                }
                Err(e) => {
                    tracing::warn!(consumer = consumer.name(), error = %e, "fetch failed");
                    tokio::select! {
                        _ = self.stop.changed() => break,
                        _ = tokio::time::sleep(FETCH_RETRY_PAUSE) => {}
                    }
                }
            }
            while in_flight.try_join_next().is_some() {}
        }
        // Unacknowledged deliveries come back after the ack wait.
        in_flight.abort_all();
    }
}

/// Dispatch one ephemeral message and reply when asked to.
async fn handle_message(
    dispatcher: Dispatcher,
    connection: Arc<dyn Connection>,
    counters: Arc<Counters>,
    message: Message,
) {
    tracing::debug!(subject = %message.subject, "received");
    let response = match dispatcher.dispatch(&message.subject, &message.payload).await {
        Ok(result) => {
            Counters::bump(&counters.handled);
            CallResponse::Success { result }
        }
        Err(err) => {
            Counters::bump(&counters.failed);
            log_failure(&message.subject, &err);
            err.to_response()
        }
    };

    let Some(reply) = message.reply else {
        return;
    };
    let body = match encode_response(&response) {
        Ok(body) => body,
        Err(e) => {
            tracing::error!(subject = %message.subject, error = %e, "failed to encode response");
            match encode_response(&CallResponse::failure("EncodeError", e.to_string())) {
                Ok(body) => body,
                Err(_) => return,
            }
        }
    };
    match connection.publish(&reply, body).await {
        Ok(()) => Counters::bump(&counters.replied),
        Err(e) => tracing::warn!(subject = %message.subject, error = %e, "failed to publish reply"),
    }
}

/// Dispatch one durable delivery and acknowledge it per policy.
///
/// Success is acknowledged. Handler failures are left for redelivery.
/// Unroutable messages are acknowledged when `ack_unroutable` is set.
async fn handle_delivery(
    dispatcher: Dispatcher,
    consumer: Arc<dyn PullConsumer>,
    counters: Arc<Counters>,
    ack_unroutable: bool,
    delivery: Delivery,
) {
    let subject = delivery.message.subject.as_str();
    tracing::debug!(subject, attempt = delivery.attempt, "received delivery");
    let ack = match dispatcher.dispatch(subject, &delivery.message.payload).await {
        Ok(_) => {
            Counters::bump(&counters.handled);
            true
        }
        Err(err) => {
            Counters::bump(&counters.failed);
            log_failure(subject, &err);
            match err {
                DispatchError::UnknownFunction(_) | DispatchError::Malformed(_) => ack_unroutable,
                DispatchError::Handler(_) => {
                    tracing::debug!(
                        subject,
                        attempt = delivery.attempt,
                        "leaving delivery for redelivery"
                    );
                    false
                }
            }
        }
    };
    if !ack {
        return;
    }
    match consumer.ack(&delivery).await {
        Ok(()) => Counters::bump(&counters.acked),
        Err(e) => tracing::warn!(subject, error = %e, "failed to ack"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::InMemoryBus;
    use crate::client::Client;
    use crate::envelope::CallRequest;
    use crate::error::FunctionError;
    use crate::handler::Handler;
    use crate::registry::Registration;
    use serde_json::json;

    fn registry() -> Registry {
        let mut registry = Registry::with_namespace("ns");
        registry
            .register_handler(
                Registration::new().name("echo").inline(),
                Handler::blocking(|req| Ok(json!(req.args))),
            )
            .unwrap();
        registry
    }

    #[tokio::test]
    async fn lifecycle_states() {
        let bus = InMemoryBus::new();
        let listener = Listener::new(Arc::new(registry()), Arc::new(bus.clone()), Settings::default());
        assert_eq!(listener.state(), ListenerState::Stopped);

        let handle = listener.start().await.unwrap();
        assert_eq!(listener.state(), ListenerState::Running);
        assert!(matches!(listener.start().await, Err(ListenerError::AlreadyStarted)));

        handle.stop().await;
        assert_eq!(listener.state(), ListenerState::Stopped);
        assert_eq!(bus.open_connections(), 0);
    }

    #[tokio::test]
    async fn connect_failure_returns_to_stopped() {
        let bus = InMemoryBus::new();
        bus.set_unavailable(true);
        let listener = Listener::new(Arc::new(registry()), Arc::new(bus), Settings::default());
        assert!(matches!(listener.start().await, Err(ListenerError::Connect(_))));
        assert_eq!(listener.state(), ListenerState::Stopped);
    }

    #[tokio::test]
    async fn replies_to_requests() {
        let bus = InMemoryBus::new();
        let listener = Listener::new(Arc::new(registry()), Arc::new(bus.clone()), Settings::default());
        let handle = listener.start().await.unwrap();

        let client = Client::new(Arc::new(bus.clone()), Settings::default());
        let result = client
            .call("ns", "echo", CallRequest::new().arg(1).arg("a"))
            .await
            .unwrap();
        assert_eq!(result, json!([1, "a"]));

        let stats = handle.stop().await;
        assert_eq!(stats.received, 1);
        assert_eq!(stats.handled, 1);
        assert_eq!(stats.replied, 1);
    }

    #[tokio::test]
    async fn unknown_function_in_served_namespace() {
        let bus = InMemoryBus::new();
        let listener = Listener::new(Arc::new(registry()), Arc::new(bus.clone()), Settings::default());
        let handle = listener.start().await.unwrap();

        let raw = Client::new(Arc::new(bus.clone()), Settings::default())
            .call_raw("ns", "missing", CallRequest::new())
            .await
            .unwrap();
        assert_eq!(raw["success"], json!(false));
        assert_eq!(raw["error"], json!("UnknownFunctionError"));

        let stats = handle.stop().await;
        assert_eq!(stats.failed, 1);
    }

    #[tokio::test]
    async fn durable_failures_are_redelivered() {
        let bus = InMemoryBus::with_ack_wait(Duration::from_millis(30));
        let attempts = Arc::new(AtomicUsize::new(0));
        let mut registry = Registry::with_namespace("ns");
        let seen = Arc::clone(&attempts);
        registry
            .register_handler(
                Registration::new().name("flaky").durable(true).inline(),
                Handler::blocking(move |_req| {
                    if seen.fetch_add(1, Ordering::SeqCst) == 0 {
                        Err(FunctionError::new("RuntimeError", "first attempt fails"))
                    } else {
                        Ok(json!(null))
                    }
                }),
            )
            .unwrap();

        let settings = Settings::default().with_fetch_wait(Duration::from_millis(20));
        let listener = Listener::new(Arc::new(registry), Arc::new(bus.clone()), settings.clone());
        let handle = listener.start().await.unwrap();

        Client::new(Arc::new(bus.clone()), settings)
            .send_durable("ns", "flaky", CallRequest::new())
            .await
            .unwrap();

        let consumer = subject::durable_consumer_name("remote_fn", "ns.js.flaky");
        for _ in 0..100 {
            if bus.ack_count(&consumer) == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(bus.ack_count(&consumer), 1);
        assert_eq!(attempts.load(Ordering::SeqCst), 2);

        let stats = handle.stop().await;
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.handled, 1);
        assert_eq!(stats.acked, 1);
        assert!(stats.fetches >= 2);
    }
}
