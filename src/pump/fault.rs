//! Fault diagnostics: one event per abandoned delivery.

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;

use crate::error::BusError;
use crate::transport::Envelope;

/// Default number of fault events buffered for slow subscribers.
pub const DEFAULT_FAULT_STREAM_CAPACITY: usize = 256;

/// Why a delivery was abandoned.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct FaultEvent {
    pub envelope_id: String,
    pub message_type: String,
    /// Queue or subscription path the delivery came from.
    pub source: String,
    /// Stable error class, see [`BusError::kind`].
    pub fault_kind: String,
    pub description: String,
    pub delivery_count: u32,
    pub at: DateTime<Utc>,
}

impl FaultEvent {
    pub fn new(envelope: &Envelope, source: &str, reason: &BusError, at: DateTime<Utc>) -> Self {
        Self {
            envelope_id: envelope.id.clone(),
            message_type: envelope.message_type.clone(),
            source: source.to_string(),
            fault_kind: reason.kind().to_string(),
            description: reason.to_string(),
            delivery_count: envelope.delivery.delivery_count,
            at,
        }
    }
}

/// Receives fault events from message pumps.
pub trait FaultSink: Send + Sync {
    fn publish(&self, event: FaultEvent);
}

/// Broadcast fault stream. Events published while nobody subscribes are dropped.
///
/// ```
/// use courier::pump::{FaultSink, FaultStream};
///
/// let stream = FaultStream::new(16);
/// let mut faults = stream.subscribe();
/// assert_eq!(stream.subscriber_count(), 1);
/// assert!(faults.try_recv().is_err());
/// ```
#[derive(Clone, Debug)]
pub struct FaultStream {
    tx: broadcast::Sender<FaultEvent>,
}

impl FaultStream {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<FaultEvent> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for FaultStream {
    fn default() -> Self {
        Self::new(DEFAULT_FAULT_STREAM_CAPACITY)
    }
}

impl FaultSink for FaultStream {
    fn publish(&self, event: FaultEvent) {
        let _ = self.tx.send(event);
    }
}

/// Forwards fault events as JSON strings to in-process `EventEmitter` listeners.
#[cfg(feature = "emitter")]
pub struct EmitterFaultSink {
    emitter: std::sync::Mutex<event_emitter_rs::EventEmitter>,
    event_name: String,
}

#[cfg(feature = "emitter")]
impl EmitterFaultSink {
    /// Event name used when none is given.
    pub const DEFAULT_EVENT_NAME: &'static str = "courier.fault";

    pub fn new(emitter: event_emitter_rs::EventEmitter) -> Self {
        Self {
            emitter: std::sync::Mutex::new(emitter),
            event_name: Self::DEFAULT_EVENT_NAME.to_string(),
        }
    }

    pub fn with_event_name(mut self, name: impl Into<String>) -> Self {
        self.event_name = name.into();
        self
    }

    /// Register a listener for fault JSON on the sink's emitter.
    pub fn on<F>(&self, listener: F)
    where
        F: Fn(String) + Send + Sync + 'static,
    {
        self.emitter
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .on(&self.event_name, listener);
    }
}

#[cfg(feature = "emitter")]
impl FaultSink for EmitterFaultSink {
    fn publish(&self, event: FaultEvent) {
        let json = match serde_json::to_string(&event) {
            Ok(json) => json,
            Err(err) => {
                tracing::warn!(error = %err, envelope_id = %event.envelope_id, "fault event not serializable");
                return;
            }
        };
        self.emitter
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .emit(&self.event_name, json);
    }
}
