//! Bus - the caller-facing API of one application instance.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tokio::sync::{broadcast, Mutex};

use crate::config::BusConfig;
use crate::correlation::{MulticastAggregator, RequestCorrelator};
use crate::dispatch::Dispatcher;
use crate::error::BusError;
use crate::handler::{HandlerKind, HandlerRegistry};
use crate::message::{BusCommand, BusEvent, BusMessage, BusRequest};
use crate::pump::{FaultEvent, FaultStream, MessagePump, PumpState, PumpStats};
use crate::transport::{
    Destination, Envelope, MessageKind, Sender, Source, SubscriptionMode, Transport,
};

struct Inner {
    config: BusConfig,
    registry: Arc<HandlerRegistry>,
    transport: Arc<dyn Transport>,
    sender: Arc<dyn Sender>,
    correlator: RequestCorrelator,
    aggregator: MulticastAggregator,
    dispatcher: Dispatcher,
    faults: FaultStream,
    pumps: Mutex<Vec<MessagePump>>,
}

/// One application instance on the bus.
///
/// Sends commands, publishes events, makes requests, and runs one message
/// pump per inbound queue or subscription. Cloning gives another handle to
/// the same instance; every method is safe to call concurrently.
///
/// ## Example
///
/// ```ignore
/// let bus = Bus::builder()
///     .with_config(BusConfig::new("orders", "orders-1"))
///     .with_registry(registry)
///     .with_transport(transport.clone())
///     .build()?;
/// bus.start().await?;
///
/// bus.send_command(&PlaceOrder { id: "o1".into() }).await?;
/// bus.publish_event(&OrderPlaced { id: "o1".into() }).await?;
///
/// let quote = bus.send_request(&Quote { sku: "abc".into() }, None).await?;
/// let votes = bus
///     .send_multicast_request(&BlackBall { id: "o1".into() }, Some(Duration::from_secs(2)), Some(3))
///     .await?;
///
/// bus.stop().await?;
/// ```
#[derive(Clone)]
pub struct Bus {
    inner: Arc<Inner>,
}

impl Bus {
    pub fn builder() -> BusBuilder {
        BusBuilder::default()
    }

    pub fn config(&self) -> &BusConfig {
        &self.inner.config
    }

    pub fn registry(&self) -> &HandlerRegistry {
        &self.inner.registry
    }

    /// Send a command to the queue named by its type.
    pub async fn send_command<C: BusCommand>(&self, command: &C) -> Result<(), BusError> {
        self.ensure_known::<C>(MessageKind::Command)?;
        let envelope = Envelope::encode(MessageKind::Command, command)?;
        self.transmit(Destination::Queue(C::MESSAGE_TYPE.to_string()), envelope)
            .await
    }

    /// Publish an event to the topic named by its type.
    pub async fn publish_event<E: BusEvent>(&self, event: &E) -> Result<(), BusError> {
        self.ensure_known::<E>(MessageKind::Event)?;
        let envelope = Envelope::encode(MessageKind::Event, event)?;
        self.transmit(Destination::Topic(E::MESSAGE_TYPE.to_string()), envelope)
            .await
    }

    /// Send a request to the queue named by its type and wait for the reply.
    ///
    /// `timeout` falls back to the configured default. No reply in time is
    /// [`BusError::RequestTimedOut`].
    pub async fn send_request<R: BusRequest>(
        &self,
        request: &R,
        timeout: Option<Duration>,
    ) -> Result<R::Response, BusError> {
        self.ensure_known::<R>(MessageKind::Request)?;
        let timeout = timeout.unwrap_or_else(|| self.inner.config.default_timeout());
        let envelope = Envelope::encode(MessageKind::Request, request)?
            .with_reply_to(self.inner.config.reply_queue());

        let reply = self
            .inner
            .correlator
            .send(
                &*self.inner.sender,
                &Destination::Queue(R::MESSAGE_TYPE.to_string()),
                envelope,
                timeout,
            )
            .await?
            .await?;
        reply.decode::<R::Response>()
    }

    /// Broadcast a request to the topic named by its type and collect the
    /// replies that arrive before the deadline, in arrival order.
    ///
    /// Resolves early once `expected` responders have replied. Running out of
    /// time is not an error: the result may be empty. A reply whose payload
    /// does not decode is logged and left out.
    pub async fn send_multicast_request<R: BusRequest>(
        &self,
        request: &R,
        timeout: Option<Duration>,
        expected: Option<usize>,
    ) -> Result<Vec<R::Response>, BusError> {
        self.ensure_known::<R>(MessageKind::MulticastRequest)?;
        let timeout = timeout.unwrap_or_else(|| self.inner.config.default_timeout());
        let envelope = Envelope::encode(MessageKind::MulticastRequest, request)?
            .with_reply_to(self.inner.config.reply_queue());

        let replies = self
            .inner
            .aggregator
            .send(
                &*self.inner.sender,
                &Destination::Topic(R::MESSAGE_TYPE.to_string()),
                envelope,
                timeout,
                expected,
            )
            .await?
            .await;

        let responses = replies
            .iter()
            .filter_map(|reply| match reply.decode::<R::Response>() {
                Ok(response) => Some(response),
                Err(err) => {
                    tracing::warn!(
                        envelope_id = %reply.id,
                        message_type = %reply.message_type,
                        responder = reply.responder.as_deref().unwrap_or("unknown"),
                        error = %err,
                        "discarding undecodable multicast reply"
                    );
                    None
                }
            })
            .collect();
        Ok(responses)
    }

    /// Open a pump for every inbound source on first start, then start them all.
    pub async fn start(&self) -> Result<(), BusError> {
        let mut pumps = self.inner.pumps.lock().await;
        if pumps.is_empty() {
            for source in self.sources() {
                let channel = self.inner.transport.open(&source).await?;
                let pump = MessagePump::builder(channel, self.inner.dispatcher.clone())
                    .with_max_concurrency(self.inner.config.max_concurrent_dispatches)
                    .with_fault_sink(Arc::new(self.inner.faults.clone()))
                    .build();
                pumps.push(pump);
            }
        }

        let results = join_all(pumps.iter().map(|pump| pump.start())).await;
        results.into_iter().collect::<Result<Vec<()>, _>>()?;

        tracing::info!(
            application = %self.inner.config.application_name,
            instance = %self.inner.config.instance_name,
            pumps = pumps.len(),
            "bus started"
        );
        Ok(())
    }

    /// Stop every pump. Idempotent.
    pub async fn stop(&self) -> Result<(), BusError> {
        let pumps = self.inner.pumps.lock().await;
        let results = join_all(pumps.iter().map(|pump| pump.stop())).await;
        results.into_iter().collect::<Result<Vec<()>, _>>()?;

        tracing::info!(instance = %self.inner.config.instance_name, "bus stopped");
        Ok(())
    }

    /// Subscribe to fault events of every pump of this bus.
    pub fn faults(&self) -> broadcast::Receiver<FaultEvent> {
        self.inner.faults.subscribe()
    }

    /// State and counters of each pump, keyed by source path.
    pub async fn pumps(&self) -> Vec<(String, PumpState, PumpStats)> {
        self.inner
            .pumps
            .lock()
            .await
            .iter()
            .map(|pump| (pump.source(), pump.state(), pump.stats()))
            .collect()
    }

    /// Every inbound source this instance listens on.
    pub fn sources(&self) -> Vec<Source> {
        let config = &self.inner.config;
        let mut sources = BTreeSet::new();
        sources.insert(Source::Queue(config.reply_queue()));

        for descriptor in self.inner.registry.descriptors() {
            let message_type = descriptor.message_type().to_string();
            let source = match descriptor.kind() {
                HandlerKind::Command | HandlerKind::Request => Source::Queue(message_type),
                HandlerKind::CompetingEvent => Source::Subscription {
                    topic: message_type,
                    name: config.application_name.clone(),
                    mode: SubscriptionMode::Competing,
                },
                HandlerKind::MulticastEvent | HandlerKind::MulticastRequest => {
                    Source::Subscription {
                        topic: message_type,
                        name: config.multicast_subscription(),
                        mode: SubscriptionMode::Multicast,
                    }
                }
            };
            sources.insert(source);
        }
        sources.into_iter().collect()
    }

    fn ensure_known<T: BusMessage>(&self, kind: MessageKind) -> Result<(), BusError> {
        if self.inner.registry.is_known(T::MESSAGE_TYPE) {
            Ok(())
        } else {
            Err(BusError::UnregisteredType {
                message_type: T::MESSAGE_TYPE.to_string(),
                kind: kind.as_str(),
            })
        }
    }

    async fn transmit(&self, destination: Destination, envelope: Envelope) -> Result<(), BusError> {
        tracing::debug!(
            envelope_id = %envelope.id,
            message_type = %envelope.message_type,
            destination = %destination,
            "sending"
        );
        self.inner.sender.send(&destination, envelope).await?;
        Ok(())
    }
}

/// Wires configuration, handler registry and transport into a [`Bus`].
#[derive(Default)]
pub struct BusBuilder {
    config: Option<BusConfig>,
    registry: Option<HandlerRegistry>,
    transport: Option<(Arc<dyn Transport>, Arc<dyn Sender>)>,
}

impl BusBuilder {
    pub fn with_config(mut self, config: BusConfig) -> Self {
        self.config = Some(config);
        self
    }

    pub fn with_registry(mut self, registry: HandlerRegistry) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn with_transport<T: Transport + 'static>(mut self, transport: T) -> Self {
        let transport = Arc::new(transport);
        let sender: Arc<dyn Sender> = transport.clone();
        let transport: Arc<dyn Transport> = transport;
        self.transport = Some((transport, sender));
        self
    }

    pub fn build(self) -> Result<Bus, BusError> {
        let config = self.config.unwrap_or_default();
        config.validate()?;
        let (transport, sender) = self
            .transport
            .ok_or_else(|| BusError::Config("a transport is required".into()))?;
        let registry = Arc::new(match self.registry {
            Some(registry) => registry,
            None => HandlerRegistry::builder().build()?,
        });

        let correlator = RequestCorrelator::new();
        let aggregator = MulticastAggregator::new();
        let dispatcher = Dispatcher::new(Arc::clone(&registry), Arc::clone(&sender))
            .with_instance_name(config.instance_name.clone())
            .with_correlator(correlator.clone())
            .with_aggregator(aggregator.clone());
        let faults = FaultStream::new(config.fault_stream_capacity);

        Ok(Bus {
            inner: Arc::new(Inner {
                config,
                registry,
                transport,
                sender,
                correlator,
                aggregator,
                dispatcher,
                faults,
                pumps: Mutex::new(Vec::new()),
            }),
        })
    }
}
