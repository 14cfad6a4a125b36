use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::Utc;
use futures::FutureExt;

use super::fault::{FaultEvent, FaultSink, FaultStream};
use crate::dispatch::{Disposition, Dispatcher};
use crate::error::BusError;
use crate::transport::{Channel, Envelope, EnvelopeCallback};

/// Abandon metadata key carrying the fault description.
pub const FAULT_METADATA_KEY: &str = "courier.fault";
/// Abandon metadata key carrying the stable fault kind.
pub const FAULT_KIND_METADATA_KEY: &str = "courier.fault-kind";
/// Abandon metadata key carrying the RFC 3339 time of the fault.
pub const FAULT_AT_METADATA_KEY: &str = "courier.fault-at";

/// Lifecycle of a pump.
///
/// | from \ call | start                | stop                 |
/// |-------------|----------------------|----------------------|
/// | Stopped     | → Starting → Running | no-op                |
/// | Starting    | illegal              | illegal              |
/// | Running     | illegal              | → Stopping → Stopped |
/// | Stopping    | illegal              | no-op                |
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum PumpState {
    Stopped,
    Starting,
    Running,
    Stopping,
}

impl fmt::Display for PumpState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PumpState::Stopped => "stopped",
            PumpState::Starting => "starting",
            PumpState::Running => "running",
            PumpState::Stopping => "stopping",
        };
        f.write_str(name)
    }
}

/// Counters of a pump since it was created.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PumpStats {
    /// Deliveries handed to the dispatcher.
    pub dispatched: usize,
    pub completed: usize,
    pub abandoned: usize,
    /// `complete` or `abandon` calls that failed.
    pub disposition_faults: usize,
}

#[derive(Default)]
struct Counters {
    dispatched: AtomicUsize,
    completed: AtomicUsize,
    abandoned: AtomicUsize,
    disposition_faults: AtomicUsize,
}

struct Inner {
    channel: Arc<dyn Channel>,
    dispatcher: Dispatcher,
    max_concurrency: usize,
    state: Mutex<PumpState>,
    counters: Counters,
    faults: Arc<dyn FaultSink>,
}

/// Drives one channel: receives deliveries, dispatches each as its own task,
/// and settles every delivery with `complete` or `abandon`.
///
/// Cloning gives another handle to the same pump.
///
/// ## Example
///
/// ```ignore
/// let pump = MessagePump::builder(channel, dispatcher)
///     .with_max_concurrency(8)
///     .with_fault_sink(Arc::new(faults.clone()))
///     .build();
/// pump.start().await?;
/// // ...
/// pump.stop().await?;
/// pump.stop().await?; // already stopped: no-op
/// ```
#[derive(Clone)]
pub struct MessagePump {
    inner: Arc<Inner>,
}

/// Configures a [`MessagePump`] before it is shared.
pub struct MessagePumpBuilder {
    channel: Arc<dyn Channel>,
    dispatcher: Dispatcher,
    max_concurrency: usize,
    faults: Arc<dyn FaultSink>,
}

impl MessagePumpBuilder {
    /// Maximum number of deliveries dispatched at once. Defaults to 1.
    pub fn with_max_concurrency(mut self, max: usize) -> Self {
        self.max_concurrency = max.max(1);
        self
    }

    /// Where fault events go. Defaults to a private [`FaultStream`].
    pub fn with_fault_sink(mut self, sink: Arc<dyn FaultSink>) -> Self {
        self.faults = sink;
        self
    }

    pub fn build(self) -> MessagePump {
        MessagePump {
            inner: Arc::new(Inner {
                channel: self.channel,
                dispatcher: self.dispatcher,
                max_concurrency: self.max_concurrency,
                state: Mutex::new(PumpState::Stopped),
                counters: Counters::default(),
                faults: self.faults,
            }),
        }
    }
}

impl MessagePump {
    pub fn new(channel: Arc<dyn Channel>, dispatcher: Dispatcher) -> Self {
        Self::builder(channel, dispatcher).build()
    }

    pub fn builder(channel: Arc<dyn Channel>, dispatcher: Dispatcher) -> MessagePumpBuilder {
        MessagePumpBuilder {
            channel,
            dispatcher,
            max_concurrency: 1,
            faults: Arc::new(FaultStream::default()),
        }
    }

    pub fn state(&self) -> PumpState {
        *self.inner.state()
    }

    pub fn source(&self) -> String {
        self.inner.channel.source().to_string()
    }

    pub fn stats(&self) -> PumpStats {
        let c = &self.inner.counters;
        PumpStats {
            dispatched: c.dispatched.load(Ordering::Relaxed),
            completed: c.completed.load(Ordering::Relaxed),
            abandoned: c.abandoned.load(Ordering::Relaxed),
            disposition_faults: c.disposition_faults.load(Ordering::Relaxed),
        }
    }

    /// Start receiving. The transition runs as its own task; the returned
    /// future reports its outcome.
    pub fn start(&self) -> impl Future<Output = Result<(), BusError>> + Send + 'static {
        let inner = Arc::clone(&self.inner);
        let task = tokio::spawn(Inner::start(inner));
        task.map(|joined| {
            joined.unwrap_or_else(|e| Err(BusError::IllegalState(format!("pump start task failed: {}", e))))
        })
    }

    /// Stop receiving. Idempotent once stopped. Deliveries already being
    /// dispatched run to completion.
    pub fn stop(&self) -> impl Future<Output = Result<(), BusError>> + Send + 'static {
        let inner = Arc::clone(&self.inner);
        let task = tokio::spawn(async move { inner.stop().await });
        task.map(|joined| {
            joined.unwrap_or_else(|e| Err(BusError::IllegalState(format!("pump stop task failed: {}", e))))
        })
    }
}

impl Inner {
    fn state(&self) -> MutexGuard<'_, PumpState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn source(&self) -> String {
        self.channel.source().to_string()
    }

    async fn start(self: Arc<Self>) -> Result<(), BusError> {
        {
            let mut state = self.state();
            if *state != PumpState::Stopped {
                return Err(BusError::IllegalState(format!(
                    "cannot start pump for {} while it is {}",
                    self.source(),
                    *state
                )));
            }
            *state = PumpState::Starting;
        }

        let pump = Arc::clone(&self);
        let callback: EnvelopeCallback = Arc::new(move |envelope| {
            let pump = Arc::clone(&pump);
            async move { pump.handle(envelope).await }.boxed()
        });

        let started = self.channel.start(callback, self.max_concurrency).await;
        let mut state = self.state();
        match started {
            Ok(()) => {
                *state = PumpState::Running;
                tracing::debug!(source = %self.source(), "pump running");
                Ok(())
            }
            Err(err) => {
                *state = PumpState::Stopped;
                tracing::error!(source = %self.source(), error = %err, "pump failed to start");
                Err(err.into())
            }
        }
    }

    async fn stop(&self) -> Result<(), BusError> {
        {
            let mut state = self.state();
            match *state {
                PumpState::Stopped | PumpState::Stopping => return Ok(()),
                PumpState::Starting => {
                    return Err(BusError::IllegalState(format!(
                        "cannot stop pump for {} while it is starting",
                        self.source()
                    )))
                }
                PumpState::Running => *state = PumpState::Stopping,
            }
        }

        let stopped = self.channel.stop().await;
        *self.state() = PumpState::Stopped;
        tracing::debug!(source = %self.source(), "pump stopped");
        stopped.map_err(BusError::from)
    }

    /// Dispatch one delivery and settle it. Never fails: disposition errors are
    /// logged and counted.
    async fn handle(&self, envelope: Envelope) {
        self.counters.dispatched.fetch_add(1, Ordering::Relaxed);

        match self.dispatcher.dispatch(&envelope).await {
            Disposition::Complete => match self.channel.complete(&envelope).await {
                Ok(()) => {
                    self.counters.completed.fetch_add(1, Ordering::Relaxed);
                }
                Err(err) => self.disposition_fault(&envelope, BusError::Disposition(err)),
            },
            Disposition::Abandon(reason) => {
                let at = Utc::now();
                tracing::error!(
                    envelope_id = %envelope.id,
                    message_type = %envelope.message_type,
                    delivery_count = envelope.delivery.delivery_count,
                    fault_kind = reason.kind(),
                    error = %reason,
                    "abandoning delivery"
                );

                let metadata = vec![
                    (FAULT_METADATA_KEY.to_string(), reason.to_string()),
                    (FAULT_KIND_METADATA_KEY.to_string(), reason.kind().to_string()),
                    (FAULT_AT_METADATA_KEY.to_string(), at.to_rfc3339()),
                ];
                self.faults
                    .publish(FaultEvent::new(&envelope, &self.source(), &reason, at));

                match self.channel.abandon(&envelope, metadata).await {
                    Ok(()) => {
                        self.counters.abandoned.fetch_add(1, Ordering::Relaxed);
                    }
                    Err(err) => self.disposition_fault(&envelope, BusError::Disposition(err)),
                }
            }
        }
    }

    fn disposition_fault(&self, envelope: &Envelope, fault: BusError) {
        self.counters
            .disposition_faults
            .fetch_add(1, Ordering::Relaxed);
        tracing::error!(
            envelope_id = %envelope.id,
            message_type = %envelope.message_type,
            error = %fault,
            "disposition failed"
        );
    }
}
