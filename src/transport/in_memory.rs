//! In-memory transport for testing and single-process scenarios.
//!
//! Provides named queues (competing consumers) and topics with named
//! subscriptions, at-least-once redelivery on abandon, dead-lettering after
//! a maximum delivery count, and a log of every send and disposition that
//! tests can inspect.
//!
//! Lock tokens are tracked only while a delivery is in flight. The inspection
//! log keeps every record until [`InMemoryTransport::clear_log`] is called, so
//! long-running single-process users should clear it periodically.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::{mpsc, oneshot, Semaphore};
use tokio::task::JoinHandle;
use uuid::Uuid;

use super::channel::{Channel, Destination, EnvelopeCallback, Sender, Source, Transport};
use super::envelope::{Envelope, SubscriptionMode};
use super::error::TransportError;

/// Default number of deliveries before an envelope is dead-lettered.
pub const DEFAULT_MAX_DELIVERY_COUNT: u32 = 10;

/// An abandoned delivery and the metadata attached to it.
#[derive(Clone, Debug)]
pub struct AbandonRecord {
    pub envelope: Envelope,
    pub metadata: Vec<(String, String)>,
}

impl AbandonRecord {
    /// Get a metadata value by key.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.metadata
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }
}

/// In-memory broker.
///
/// Cloning creates another handle to the same broker state, so a transport
/// can be shared by several bus instances to model several processes.
///
/// ## Example
///
/// ```
/// use courier::transport::{Destination, Envelope, InMemoryTransport, MessageKind, Sender};
///
/// # tokio::runtime::Runtime::new().unwrap().block_on(async {
/// let transport = InMemoryTransport::new();
/// let envelope = Envelope::new("orders.place", MessageKind::Command, b"{}".to_vec());
/// transport
///     .send(&Destination::Queue("orders.place".into()), envelope)
///     .await
///     .unwrap();
/// assert_eq!(transport.sent().len(), 1);
/// # });
/// ```
#[derive(Clone, Default)]
pub struct InMemoryTransport {
    inner: Arc<Inner>,
}

struct Inner {
    queues: Mutex<HashMap<String, Arc<Entity>>>,
    topics: Mutex<HashMap<String, Vec<Arc<Entity>>>>,
    log: Mutex<Log>,
    max_delivery_count: AtomicU32,
    expire_locks: AtomicBool,
}

impl Default for Inner {
    fn default() -> Self {
        Self {
            queues: Mutex::new(HashMap::new()),
            topics: Mutex::new(HashMap::new()),
            log: Mutex::new(Log::default()),
            max_delivery_count: AtomicU32::new(DEFAULT_MAX_DELIVERY_COUNT),
            expire_locks: AtomicBool::new(false),
        }
    }
}

#[derive(Default)]
struct Log {
    sent: Vec<(Destination, Envelope)>,
    completed: Vec<Envelope>,
    abandoned: Vec<AbandonRecord>,
    dead_lettered: Vec<Envelope>,
    /// Lock tokens of deliveries handed out and not yet settled.
    locked: HashSet<String>,
}

/// A queue, or one subscription of a topic.
struct Entity {
    path: String,
    mode: Option<SubscriptionMode>,
    tx: mpsc::UnboundedSender<Envelope>,
    rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Envelope>>,
}

impl Entity {
    fn new(path: String, mode: Option<SubscriptionMode>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            path,
            mode,
            tx,
            rx: tokio::sync::Mutex::new(rx),
        }
    }

    fn enqueue(&self, envelope: Envelope) -> Result<(), TransportError> {
        self.tx
            .send(envelope)
            .map_err(|_| TransportError::Closed(self.path.clone()))
    }

    fn stamp(&self, envelope: &mut Envelope) {
        envelope.delivery.delivery_count += 1;
        envelope.delivery.received_at = Some(Utc::now());
        envelope.delivery.lock_token = Some(Uuid::new_v4().to_string());
        envelope.delivery.subscription = self.mode;
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl InMemoryTransport {
    /// Create a new in-memory transport.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the number of deliveries after which an abandoned envelope is dead-lettered.
    pub fn with_max_delivery_count(self, count: u32) -> Self {
        self.inner
            .max_delivery_count
            .store(count.max(1), Ordering::SeqCst);
        self
    }

    /// Make every subsequent `complete`/`abandon` fail as if the delivery lock expired.
    pub fn expire_locks(&self, expired: bool) {
        self.inner.expire_locks.store(expired, Ordering::SeqCst);
    }

    /// Every envelope sent, with its destination, in send order.
    pub fn sent(&self) -> Vec<(Destination, Envelope)> {
        lock(&self.inner.log).sent.clone()
    }

    /// Every completed delivery, in completion order.
    pub fn completed(&self) -> Vec<Envelope> {
        lock(&self.inner.log).completed.clone()
    }

    /// Every abandoned delivery, in abandon order.
    pub fn abandoned(&self) -> Vec<AbandonRecord> {
        lock(&self.inner.log).abandoned.clone()
    }

    /// Envelopes that exhausted their deliveries.
    pub fn dead_lettered(&self) -> Vec<Envelope> {
        lock(&self.inner.log).dead_lettered.clone()
    }

    /// Completed deliveries of one message type.
    pub fn completed_of_type(&self, message_type: &str) -> Vec<Envelope> {
        lock(&self.inner.log)
            .completed
            .iter()
            .filter(|e| e.message_type == message_type)
            .cloned()
            .collect()
    }

    /// Abandoned deliveries of one message type.
    pub fn abandoned_of_type(&self, message_type: &str) -> Vec<AbandonRecord> {
        lock(&self.inner.log)
            .abandoned
            .iter()
            .filter(|r| r.envelope.message_type == message_type)
            .cloned()
            .collect()
    }

    fn queue(&self, name: &str) -> Arc<Entity> {
        lock(&self.inner.queues)
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(Entity::new(name.to_string(), None)))
            .clone()
    }

    fn subscription(&self, topic: &str, path: String, mode: SubscriptionMode) -> Arc<Entity> {
        let mut topics = lock(&self.inner.topics);
        let subscriptions = topics.entry(topic.to_string()).or_default();
        if let Some(existing) = subscriptions.iter().find(|e| e.path == path) {
            return existing.clone();
        }
        let entity = Arc::new(Entity::new(path, Some(mode)));
        subscriptions.push(entity.clone());
        entity
    }

    /// Number of deliveries handed to a channel and not yet settled.
    pub fn in_flight(&self) -> usize {
        lock(&self.inner.log).locked.len()
    }

    /// Drop the send and disposition records. In-flight locks are kept.
    pub fn clear_log(&self) {
        let mut log = lock(&self.inner.log);
        log.sent.clear();
        log.completed.clear();
        log.abandoned.clear();
        log.dead_lettered.clear();
    }

    fn lock_delivery(&self, envelope: &Envelope) {
        if let Some(token) = &envelope.delivery.lock_token {
            lock(&self.inner.log).locked.insert(token.clone());
        }
    }

    /// Release the delivery lock. An expired lock is released too, so the
    /// token set only ever holds deliveries still in flight.
    fn settle(&self, envelope: &Envelope) -> Result<MutexGuard<'_, Log>, TransportError> {
        let token = envelope
            .delivery
            .lock_token
            .as_ref()
            .ok_or_else(|| TransportError::LockLost(format!("{} was never delivered", envelope.id)))?;

        let mut log = lock(&self.inner.log);
        if !log.locked.remove(token) {
            return Err(TransportError::LockLost(format!(
                "delivery of {} is not locked",
                envelope.id
            )));
        }
        if self.inner.expire_locks.load(Ordering::SeqCst) {
            return Err(TransportError::LockLost(format!(
                "lock for {} expired",
                envelope.id
            )));
        }
        Ok(log)
    }
}

#[async_trait]
impl Sender for InMemoryTransport {
    async fn send(
        &self,
        destination: &Destination,
        envelope: Envelope,
    ) -> Result<(), TransportError> {
        lock(&self.inner.log)
            .sent
            .push((destination.clone(), envelope.clone()));

        match destination {
            Destination::Queue(name) => self.queue(name).enqueue(envelope),
            Destination::Topic(name) => {
                let subscriptions = lock(&self.inner.topics)
                    .get(name)
                    .cloned()
                    .unwrap_or_default();
                for subscription in subscriptions {
                    subscription.enqueue(envelope.clone())?;
                }
                Ok(())
            }
        }
    }
}

#[async_trait]
impl Transport for InMemoryTransport {
    async fn open(&self, source: &Source) -> Result<Arc<dyn Channel>, TransportError> {
        let entity = match source {
            Source::Queue(name) => self.queue(name),
            Source::Subscription { topic, mode, .. } => {
                self.subscription(topic, source.path(), *mode)
            }
        };
        Ok(Arc::new(InMemoryChannel {
            source: source.clone(),
            entity,
            transport: self.clone(),
            receiver: Mutex::new(None),
        }))
    }
}

struct ReceiveLoop {
    stop: oneshot::Sender<()>,
    handle: JoinHandle<()>,
}

/// Receiving end of one queue or subscription.
pub struct InMemoryChannel {
    source: Source,
    entity: Arc<Entity>,
    transport: InMemoryTransport,
    receiver: Mutex<Option<ReceiveLoop>>,
}

#[async_trait]
impl Channel for InMemoryChannel {
    fn source(&self) -> &Source {
        &self.source
    }

    async fn start(
        &self,
        on_envelope: EnvelopeCallback,
        max_concurrency: usize,
    ) -> Result<(), TransportError> {
        let mut receiver = lock(&self.receiver);
        if receiver.is_some() {
            return Err(TransportError::AlreadyReceiving(self.entity.path.clone()));
        }

        let (stop, mut stopped) = oneshot::channel::<()>();
        let entity = self.entity.clone();
        let transport = self.transport.clone();
        let permits = Arc::new(Semaphore::new(max_concurrency.max(1)));

        let handle = tokio::spawn(async move {
            loop {
                let permit = tokio::select! {
                    _ = &mut stopped => break,
                    permit = permits.clone().acquire_owned() => match permit {
                        Ok(permit) => permit,
                        Err(_) => break,
                    },
                };

                let next = tokio::select! {
                    _ = &mut stopped => break,
                    next = async { entity.rx.lock().await.recv().await } => next,
                };

                let Some(mut envelope) = next else { break };
                entity.stamp(&mut envelope);
                transport.lock_delivery(&envelope);

                let callback = on_envelope.clone();
                tokio::spawn(async move {
                    callback(envelope).await;
                    drop(permit);
                });
            }
        });

        *receiver = Some(ReceiveLoop { stop, handle });
        Ok(())
    }

    async fn stop(&self) -> Result<(), TransportError> {
        let receive_loop = lock(&self.receiver).take();
        if let Some(receive_loop) = receive_loop {
            let _ = receive_loop.stop.send(());
            let _ = receive_loop.handle.await;
        }
        Ok(())
    }

    async fn complete(&self, envelope: &Envelope) -> Result<(), TransportError> {
        let mut log = self.transport.settle(envelope)?;
        log.completed.push(envelope.clone());
        Ok(())
    }

    async fn abandon(
        &self,
        envelope: &Envelope,
        metadata: Vec<(String, String)>,
    ) -> Result<(), TransportError> {
        let max_deliveries = self.transport.inner.max_delivery_count.load(Ordering::SeqCst);
        {
            let mut log = self.transport.settle(envelope)?;
            log.abandoned.push(AbandonRecord {
                envelope: envelope.clone(),
                metadata,
            });
            if envelope.delivery.delivery_count >= max_deliveries {
                log.dead_lettered.push(envelope.clone());
                return Ok(());
            }
        }
        self.entity.enqueue(envelope.clone())
    }
}
