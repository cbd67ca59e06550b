//! In-memory message bus for testing and single-process scenarios.
//!
//! Implements every transport trait in this crate:
//! - core publish/subscribe with `*` and `>` wildcards
//! - request/reply through per-request inbox subjects, with timeout and
//!   "no responders" detection
//! - streams with named durable pull consumers whose cursor survives
//!   re-binding, and redelivery of unacknowledged messages after the
//!   ack wait
//!
//! Stream messages are discarded once every consumer on the stream has
//! moved past them and acknowledged them. Connections and acks are counted
//! so tests can assert on connection hygiene and at-least-once delivery.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::time::Instant;

use super::connection::{Connection, Connector, PullConsumer, Subscription};
use super::error::TransportError;
use super::message::{Delivery, Message};
use crate::subject::subject_matches;

/// How long a fetched message may stay unacknowledged before redelivery.
pub const DEFAULT_ACK_WAIT: Duration = Duration::from_secs(30);

/// Sleep between checks while a fetch waits for messages.
const POLL_INTERVAL: Duration = Duration::from_millis(2);

/// In-memory bus. Cheap to clone; clones share the same broker state.
///
/// ## Example
///
/// ```
/// use remote_fn::bus::{Connection, Connector, InMemoryBus};
///
/// # tokio_test_block_on(async {
/// let bus = InMemoryBus::new();
/// let conn = bus.connect().await.unwrap();
/// let mut sub = conn.subscribe("orders.>").await.unwrap();
///
/// conn.publish("orders.created", b"{}".to_vec()).await.unwrap();
/// let msg = sub.next().await.unwrap();
/// assert_eq!(msg.subject, "orders.created");
///
/// conn.close().await.unwrap();
/// assert_eq!(bus.connections_closed(), 1);
/// # });
/// # fn tokio_test_block_on<F: std::future::Future>(f: F) -> F::Output {
/// #     tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap().block_on(f)
/// # }
/// ```
#[derive(Clone)]
pub struct InMemoryBus {
    inner: Arc<Inner>,
}

struct Inner {
    state: Mutex<BusState>,
    ack_wait: Duration,
    next_id: AtomicU64,
    opened: AtomicUsize,
    closed: AtomicUsize,
    unavailable: AtomicBool,
}

#[derive(Default)]
struct BusState {
    subscriptions: Vec<SubscriptionEntry>,
    streams: HashMap<String, StreamState>,
    consumers: HashMap<String, ConsumerState>,
    /// Ack count per consumer.
    acks: HashMap<String, usize>,
}

impl BusState {
    /// Discard messages every consumer of `stream` has passed and acknowledged.
    ///
    /// A stream nobody consumes yet keeps everything.
    fn compact(&mut self, stream: &str) {
        let floor = self
            .consumers
            .values()
            .filter(|c| c.stream == stream)
            .map(ConsumerState::floor)
            .min();
        if let (Some(floor), Some(state)) = (floor, self.streams.get_mut(stream)) {
            state.discard_before(floor);
        }
    }
}

struct SubscriptionEntry {
    connection: u64,
    pattern: String,
    sender: mpsc::UnboundedSender<Message>,
}

struct StreamState {
    subjects: Vec<String>,
    /// Sequence of the front message. Sequences start at 1.
    first_sequence: u64,
    messages: VecDeque<Message>,
}

impl StreamState {
    fn new() -> Self {
        Self {
            subjects: Vec::new(),
            first_sequence: 1,
            messages: VecDeque::new(),
        }
    }

    fn next_sequence(&self) -> u64 {
        self.first_sequence + self.messages.len() as u64
    }

    fn get(&self, sequence: u64) -> Option<&Message> {
        let index = sequence.checked_sub(self.first_sequence)?;
        self.messages.get(usize::try_from(index).ok()?)
    }

    fn discard_before(&mut self, floor: u64) {
        while self.first_sequence < floor && self.messages.pop_front().is_some() {
            self.first_sequence += 1;
        }
    }
}

struct ConsumerState {
    stream: String,
    filter: String,
    /// Next stream sequence this consumer has not looked at.
    next_sequence: u64,
    in_flight: BTreeMap<u64, InFlight>,
}

impl ConsumerState {
    /// Lowest sequence this consumer may still need.
    fn floor(&self) -> u64 {
        self.in_flight
            .keys()
            .next()
            .copied()
            .unwrap_or(self.next_sequence)
    }
}

struct InFlight {
    redeliver_at: Instant,
    attempt: u32,
}

impl Default for InMemoryBus {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryBus {
    pub fn new() -> Self {
        Self::with_ack_wait(DEFAULT_ACK_WAIT)
    }

    /// Bus whose pull consumers redeliver after `ack_wait`.
    pub fn with_ack_wait(ack_wait: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(BusState::default()),
                ack_wait,
                next_id: AtomicU64::new(1),
                opened: AtomicUsize::new(0),
                closed: AtomicUsize::new(0),
                unavailable: AtomicBool::new(false),
            }),
        }
    }

    /// Make subsequent `connect` calls fail.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.inner.unavailable.store(unavailable, Ordering::SeqCst);
    }

    pub fn connections_opened(&self) -> usize {
        self.inner.opened.load(Ordering::SeqCst)
    }

    pub fn connections_closed(&self) -> usize {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Connections opened and not yet closed.
    pub fn open_connections(&self) -> usize {
        self.connections_opened() - self.connections_closed()
    }

    /// Number of acks received by one consumer.
    pub fn ack_count(&self, consumer: &str) -> usize {
        self.snapshot().acks.get(consumer).copied().unwrap_or(0)
    }

    /// Messages a stream still retains.
    pub fn stream_messages(&self, stream: &str) -> Vec<Message> {
        self.snapshot()
            .streams
            .get(stream)
            .map(|s| s.messages.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Names of the durable consumers created so far, sorted.
    pub fn consumer_names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.snapshot().consumers.keys().cloned().collect();
        names.sort();
        names
    }

    /// Messages fetched by a consumer but not acknowledged yet.
    pub fn pending(&self, consumer: &str) -> usize {
        self.snapshot()
            .consumers
            .get(consumer)
            .map(|c| c.in_flight.len())
            .unwrap_or(0)
    }

    fn next_id(&self) -> u64 {
        self.inner.next_id.fetch_add(1, Ordering::SeqCst)
    }

    fn state(&self) -> Result<MutexGuard<'_, BusState>, TransportError> {
        self.inner
            .state
            .lock()
            .map_err(|_| TransportError::Other("bus state lock poisoned".to_string()))
    }

    /// Lock for read-only inspection, recovering from poisoning.
    fn snapshot(&self) -> MutexGuard<'_, BusState> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Store into matching streams and push to matching subscriptions.
    ///
    /// Returns how many subscriptions received the message and whether
    /// any stream stored it.
    fn route(&self, message: Message) -> Result<(usize, bool), TransportError> {
        let mut state = self.state()?;

        let mut stored = false;
        for stream in state.streams.values_mut() {
            if stream
                .subjects
                .iter()
                .any(|pattern| subject_matches(pattern, &message.subject))
            {
                stream.messages.push_back(Message::new(
                    message.subject.clone(),
                    message.payload.clone(),
                ));
                stored = true;
            }
        }

        let mut delivered = 0;
        state.subscriptions.retain(|entry| {
            if !subject_matches(&entry.pattern, &message.subject) {
                return true;
            }
            match entry.sender.send(message.clone()) {
                Ok(()) => {
                    delivered += 1;
                    true
                }
                // receiver dropped
                Err(_) => false,
            }
        });

        Ok((delivered, stored))
    }

    fn add_subscription(
        &self,
        connection: u64,
        pattern: &str,
    ) -> Result<mpsc::UnboundedReceiver<Message>, TransportError> {
        let (sender, receiver) = mpsc::unbounded_channel();
        self.state()?.subscriptions.push(SubscriptionEntry {
            connection,
            pattern: pattern.to_string(),
            sender,
        });
        Ok(receiver)
    }

    fn remove_subscriptions(&self, connection: u64, pattern: Option<&str>) {
        self.snapshot().subscriptions.retain(|entry| {
            entry.connection != connection || pattern.is_some_and(|p| entry.pattern != p)
        });
    }
}

#[async_trait]
impl Connector for InMemoryBus {
    async fn connect(&self) -> Result<Arc<dyn Connection>, TransportError> {
        if self.inner.unavailable.load(Ordering::SeqCst) {
            return Err(TransportError::ConnectionFailed(
                "in-memory bus is unavailable".to_string(),
            ));
        }
        self.inner.opened.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(InMemoryConnection {
            bus: self.clone(),
            id: self.next_id(),
            closed: Arc::new(AtomicBool::new(false)),
        }))
    }
}

/// A connection to an [`InMemoryBus`].
pub struct InMemoryConnection {
    bus: InMemoryBus,
    id: u64,
    closed: Arc<AtomicBool>,
}

impl InMemoryConnection {
    fn ensure_open(&self) -> Result<(), TransportError> {
        if self.closed.load(Ordering::SeqCst) {
            Err(TransportError::Closed)
        } else {
            Ok(())
        }
    }

    fn shutdown(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.bus.remove_subscriptions(self.id, None);
            self.bus.inner.closed.fetch_add(1, Ordering::SeqCst);
        }
    }
}

#[async_trait]
impl Connection for InMemoryConnection {
    async fn publish(&self, subject: &str, payload: Vec<u8>) -> Result<(), TransportError> {
        self.ensure_open()?;
        self.bus.route(Message::new(subject, payload))?;
        Ok(())
    }

    async fn publish_durable(&self, subject: &str, payload: Vec<u8>) -> Result<(), TransportError> {
        self.ensure_open()?;
        let (_, stored) = self.bus.route(Message::new(subject, payload))?;
        if stored {
            Ok(())
        } else {
            Err(TransportError::NoStream(subject.to_string()))
        }
    }

    async fn request(
        &self,
        subject: &str,
        payload: Vec<u8>,
        timeout: Duration,
    ) -> Result<Message, TransportError> {
        self.ensure_open()?;
        let inbox = format!("_INBOX.{}", self.bus.next_id());
        let mut replies = self.bus.add_subscription(self.id, &inbox)?;

        let routed = self
            .bus
            .route(Message::new(subject, payload).with_reply(inbox.clone()));
        let result = match routed {
            Ok((0, _)) => Err(TransportError::NoResponders(subject.to_string())),
            Ok(_) => match tokio::time::timeout(timeout, replies.recv()).await {
                Ok(Some(reply)) => Ok(reply),
                Ok(None) => Err(TransportError::Closed),
                Err(_) => Err(TransportError::Timeout),
            },
            Err(e) => Err(e),
        };

        self.bus.remove_subscriptions(self.id, Some(&inbox));
        result
    }

    async fn subscribe(&self, subject: &str) -> Result<Subscription, TransportError> {
        self.ensure_open()?;
        let receiver = self.bus.add_subscription(self.id, subject)?;
        Ok(Subscription::new(subject, receiver))
    }

    async fn ensure_stream(&self, stream: &str, subjects: &[String]) -> Result<(), TransportError> {
        self.ensure_open()?;
        let mut state = self.bus.state()?;
        let entry = state
            .streams
            .entry(stream.to_string())
            .or_insert_with(StreamState::new);
        for subject in subjects {
            if !entry.subjects.contains(subject) {
                entry.subjects.push(subject.clone());
            }
        }
        Ok(())
    }

    async fn pull_consumer(
        &self,
        stream: &str,
        durable_name: &str,
        filter_subject: &str,
    ) -> Result<Arc<dyn PullConsumer>, TransportError> {
        self.ensure_open()?;
        let mut state = self.bus.state()?;
        let first_sequence = match state.streams.get(stream) {
            Some(existing) => existing.first_sequence,
            None => return Err(TransportError::NoStream(stream.to_string())),
        };
        state
            .consumers
            .entry(durable_name.to_string())
            .or_insert_with(|| ConsumerState {
                stream: stream.to_string(),
                filter: filter_subject.to_string(),
                next_sequence: first_sequence,
                in_flight: BTreeMap::new(),
            });
        Ok(Arc::new(InMemoryConsumer {
            bus: self.bus.clone(),
            name: durable_name.to_string(),
            closed: Arc::clone(&self.closed),
        }))
    }

    async fn drain(&self) -> Result<(), TransportError> {
        // publishes are delivered synchronously, nothing to flush
        self.shutdown();
        Ok(())
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.shutdown();
        Ok(())
    }
}

/// A durable pull consumer on an [`InMemoryBus`] stream.
pub struct InMemoryConsumer {
    bus: InMemoryBus,
    name: String,
    closed: Arc<AtomicBool>,
}

impl InMemoryConsumer {
    fn take_ready(&self, batch: usize) -> Result<Vec<Delivery>, TransportError> {
        let ack_wait = self.bus.inner.ack_wait;
        let mut guard = self.bus.state()?;
        let BusState {
            streams, consumers, ..
        } = &mut *guard;

        let consumer = consumers
            .get_mut(&self.name)
            .ok_or_else(|| TransportError::Other(format!("unknown consumer {}", self.name)))?;
        let stream = streams
            .get(&consumer.stream)
            .ok_or_else(|| TransportError::NoStream(consumer.stream.clone()))?;

        let now = Instant::now();
        let mut ready = Vec::new();

        for (sequence, flight) in consumer.in_flight.iter_mut() {
            if ready.len() >= batch {
                break;
            }
            if flight.redeliver_at <= now {
                flight.attempt += 1;
                flight.redeliver_at = now + ack_wait;
                if let Some(message) = stream.get(*sequence) {
                    ready.push(Delivery {
                        message: message.clone(),
                        sequence: *sequence,
                        attempt: flight.attempt,
                    });
                }
            }
        }

        let end = stream.next_sequence();
        while ready.len() < batch && consumer.next_sequence < end {
            let sequence = consumer.next_sequence;
            consumer.next_sequence += 1;
            let Some(message) = stream.get(sequence) else {
                continue;
            };
            if !subject_matches(&consumer.filter, &message.subject) {
                continue;
            }
            consumer.in_flight.insert(
                sequence,
                InFlight {
                    redeliver_at: now + ack_wait,
                    attempt: 1,
                },
            );
            ready.push(Delivery {
                message: message.clone(),
                sequence,
                attempt: 1,
            });
        }

        // Skipped messages may now be behind every consumer.
        let stream_name = consumer.stream.clone();
        guard.compact(&stream_name);
        Ok(ready)
    }
}

#[async_trait]
impl PullConsumer for InMemoryConsumer {
    fn name(&self) -> &str {
        &self.name
    }

    async fn fetch(&self, batch: usize, expires: Duration) -> Result<Vec<Delivery>, TransportError> {
        let deadline = Instant::now() + expires;
        loop {
            if self.closed.load(Ordering::SeqCst) {
                return Err(TransportError::Closed);
            }

            let ready = self.take_ready(batch.max(1))?;
            if !ready.is_empty() {
                return Ok(ready);
            }

            if Instant::now() >= deadline {
                return Ok(Vec::new());
            }

            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    async fn ack(&self, delivery: &Delivery) -> Result<(), TransportError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        let mut state = self.bus.state()?;
        let stream = state.consumers.get_mut(&self.name).map(|consumer| {
            consumer.in_flight.remove(&delivery.sequence);
            consumer.stream.clone()
        });
        *state.acks.entry(self.name.clone()).or_insert(0) += 1;
        if let Some(stream) = stream {
            state.compact(&stream);
        }
        Ok(())
    }
}
