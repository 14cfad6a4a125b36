use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::future::join_all;
use futures::FutureExt;

use super::{Classification, Disposition};
use crate::correlation::{MulticastAggregator, ReplyOutcome, RequestCorrelator};
use crate::error::{BusError, HandlerFault};
use crate::handler::{HandlerDescriptor, HandlerError, HandlerKind, HandlerRegistry};
use crate::transport::{Destination, Envelope, MessageKind, Sender, SubscriptionMode};

/// Routes inbound envelopes to their handlers.
///
/// Stateless apart from its collaborators, so one dispatcher serves every
/// pump of a bus and any number of concurrent deliveries.
///
/// ## Example
///
/// ```ignore
/// let dispatcher = Dispatcher::new(registry, transport.clone())
///     .with_instance_name("billing-1")
///     .with_correlator(correlator.clone())
///     .with_aggregator(aggregator.clone());
///
/// match dispatcher.dispatch(&envelope).await {
///     Disposition::Complete => channel.complete(&envelope).await?,
///     Disposition::Abandon(reason) => channel.abandon(&envelope, metadata(&reason)).await?,
/// }
/// ```
#[derive(Clone)]
pub struct Dispatcher {
    registry: Arc<HandlerRegistry>,
    sender: Arc<dyn Sender>,
    correlator: RequestCorrelator,
    aggregator: MulticastAggregator,
    instance_name: String,
}

impl Dispatcher {
    pub fn new(registry: Arc<HandlerRegistry>, sender: Arc<dyn Sender>) -> Self {
        Self {
            registry,
            sender,
            correlator: RequestCorrelator::new(),
            aggregator: MulticastAggregator::new(),
            instance_name: "local".to_string(),
        }
    }

    /// Instance name used as the prefix of multicast responder identities.
    pub fn with_instance_name(mut self, name: impl Into<String>) -> Self {
        self.instance_name = name.into();
        self
    }

    /// Correlator that receives single replies.
    pub fn with_correlator(mut self, correlator: RequestCorrelator) -> Self {
        self.correlator = correlator;
        self
    }

    /// Aggregator that receives multicast replies.
    pub fn with_aggregator(mut self, aggregator: MulticastAggregator) -> Self {
        self.aggregator = aggregator;
        self
    }

    pub fn registry(&self) -> &HandlerRegistry {
        &self.registry
    }

    /// Decide how an envelope is routed, from its kind, its delivery
    /// subscription and the registry.
    pub fn classify(&self, envelope: &Envelope) -> Classification {
        let message_type = envelope.message_type.as_str();
        let has = |kind| !self.registry.resolve_kind(message_type, kind).is_empty();

        match envelope.kind {
            MessageKind::Reply if envelope.correlation_id.is_some() => Classification::Reply,
            MessageKind::Reply => Classification::Unroutable,
            MessageKind::Command if has(HandlerKind::Command) => Classification::Command,
            MessageKind::Request if has(HandlerKind::Request) => Classification::Request,
            MessageKind::MulticastRequest if has(HandlerKind::MulticastRequest) => {
                Classification::MulticastRequest
            }
            MessageKind::Event => match envelope.delivery.subscription {
                Some(SubscriptionMode::Multicast) if has(HandlerKind::MulticastEvent) => {
                    Classification::MulticastEvent
                }
                Some(SubscriptionMode::Competing) if has(HandlerKind::CompetingEvent) => {
                    Classification::CompetingEvent
                }
                None if has(HandlerKind::CompetingEvent) => Classification::CompetingEvent,
                None if has(HandlerKind::MulticastEvent) => Classification::MulticastEvent,
                _ => Classification::Unroutable,
            },
            _ => Classification::Unroutable,
        }
    }

    /// Run the handlers for one delivery and report what should happen to it.
    pub async fn dispatch(&self, envelope: &Envelope) -> Disposition {
        let classification = self.classify(envelope);
        tracing::debug!(
            envelope_id = %envelope.id,
            message_type = %envelope.message_type,
            delivery_count = envelope.delivery.delivery_count,
            ?classification,
            "dispatching"
        );

        match classification {
            Classification::Unroutable => unroutable(envelope),
            Classification::Command => self.invoke_single(envelope, HandlerKind::Command).await,
            Classification::CompetingEvent => {
                self.invoke_single(envelope, HandlerKind::CompetingEvent).await
            }
            Classification::MulticastEvent => self.invoke_all(envelope).await,
            Classification::Request => self.answer(envelope).await,
            Classification::MulticastRequest => self.answer_all(envelope).await,
            Classification::Reply => self.route_reply(envelope),
        }
    }

    fn descriptors(&self, envelope: &Envelope, kind: HandlerKind) -> Vec<&HandlerDescriptor> {
        self.registry.resolve_kind(&envelope.message_type, kind)
    }

    /// `<instance>/<handler>` for single responders. Multicast responders add
    /// `#<ordinal>`, since one instance may register the same handler type twice.
    fn responder(&self, descriptor: &HandlerDescriptor) -> String {
        match descriptor.kind() {
            HandlerKind::MulticastRequest => format!(
                "{}/{}#{}",
                self.instance_name,
                descriptor.handler_name(),
                descriptor.ordinal()
            ),
            _ => format!("{}/{}", self.instance_name, descriptor.handler_name()),
        }
    }

    async fn invoke_single(&self, envelope: &Envelope, kind: HandlerKind) -> Disposition {
        let Some(descriptor) = self.descriptors(envelope, kind).into_iter().next() else {
            return unroutable(envelope);
        };
        match run(descriptor, envelope).await {
            Ok(_) => Disposition::Complete,
            Err(fault) => Disposition::Abandon(BusError::Handler(fault)),
        }
    }

    /// Every multicast handler runs, whatever the others do.
    async fn invoke_all(&self, envelope: &Envelope) -> Disposition {
        let descriptors = self.descriptors(envelope, HandlerKind::MulticastEvent);
        let total = descriptors.len();

        let faults: Vec<HandlerFault> = join_all(descriptors.into_iter().map(|d| run(d, envelope)))
            .await
            .into_iter()
            .filter_map(Result::err)
            .collect();

        if faults.is_empty() {
            Disposition::Complete
        } else {
            Disposition::Abandon(BusError::MulticastHandlers { faults, total })
        }
    }

    /// Single responder: reply on success, nothing on fault.
    async fn answer(&self, envelope: &Envelope) -> Disposition {
        let Some(reply_to) = envelope.reply_to.clone() else {
            return missing_reply_to(envelope);
        };
        let Some(descriptor) = self
            .descriptors(envelope, HandlerKind::Request)
            .into_iter()
            .next()
        else {
            return unroutable(envelope);
        };

        let payload = match run(descriptor, envelope).await {
            Ok(payload) => payload.unwrap_or_default(),
            Err(fault) => return Disposition::Abandon(BusError::Handler(fault)),
        };

        let reply = Envelope::reply(
            envelope,
            descriptor.response_type().unwrap_or_default(),
            payload,
            Some(self.responder(descriptor)),
        );
        match self.sender.send(&Destination::Queue(reply_to), reply).await {
            Ok(()) => Disposition::Complete,
            Err(err) => Disposition::Abandon(BusError::Transport(err)),
        }
    }

    /// Every responder replies on its own, as soon as it is done.
    async fn answer_all(&self, envelope: &Envelope) -> Disposition {
        let Some(reply_to) = envelope.reply_to.clone() else {
            return missing_reply_to(envelope);
        };
        let destination = Destination::Queue(reply_to);
        let descriptors = self.descriptors(envelope, HandlerKind::MulticastRequest);
        let total = descriptors.len();

        let outcomes = join_all(descriptors.into_iter().map(|descriptor| {
            let destination = &destination;
            async move {
                let responder = self.responder(descriptor);
                let result = run(descriptor, envelope).await;
                let reply = match &result {
                    Ok(payload) => Envelope::reply(
                        envelope,
                        descriptor.response_type().unwrap_or_default(),
                        payload.clone().unwrap_or_default(),
                        Some(responder),
                    ),
                    Err(fault) => Envelope::fault_reply(envelope, Some(responder), &fault.to_string()),
                };
                let sent = self.sender.send(destination, reply).await;
                (result, sent)
            }
        }))
        .await;

        let mut faults = Vec::new();
        let mut send_error = None;
        for (result, sent) in outcomes {
            if let Err(fault) = result {
                faults.push(fault);
            }
            if let Err(err) = sent {
                send_error = send_error.or(Some(err));
            }
        }

        if !faults.is_empty() {
            Disposition::Abandon(BusError::MulticastHandlers { faults, total })
        } else if let Some(err) = send_error {
            Disposition::Abandon(BusError::Transport(err))
        } else {
            Disposition::Complete
        }
    }

    /// Replies never fault: matched or not, they are completed.
    fn route_reply(&self, envelope: &Envelope) -> Disposition {
        let Some(correlation_id) = envelope.correlation_id.as_ref() else {
            return unroutable(envelope);
        };

        if self.correlator.resolve(correlation_id, envelope.clone()) {
            return Disposition::Complete;
        }

        match self.aggregator.accept(correlation_id, envelope.clone()) {
            ReplyOutcome::Unmatched => {
                tracing::warn!(
                    envelope_id = %envelope.id,
                    correlation_id = %correlation_id,
                    message_type = %envelope.message_type,
                    "dropping reply with no pending request"
                );
            }
            ReplyOutcome::Duplicate => {
                tracing::debug!(
                    correlation_id = %correlation_id,
                    responder = envelope.responder.as_deref().unwrap_or("unknown"),
                    "ignoring duplicate multicast reply"
                );
            }
            ReplyOutcome::Collected | ReplyOutcome::Completed | ReplyOutcome::Faulted => {}
        }
        Disposition::Complete
    }
}

fn unroutable(envelope: &Envelope) -> Disposition {
    Disposition::Abandon(BusError::UnregisteredType {
        message_type: envelope.message_type.clone(),
        kind: envelope.kind.as_str(),
    })
}

fn missing_reply_to(envelope: &Envelope) -> Disposition {
    Disposition::Abandon(BusError::MissingReplyTo {
        envelope_id: envelope.id.clone(),
    })
}

/// Invoke one handler, turning errors and panics into a tagged fault.
async fn run(
    descriptor: &HandlerDescriptor,
    envelope: &Envelope,
) -> Result<Option<Vec<u8>>, HandlerFault> {
    let invocation = async { descriptor.invoke(envelope.clone()).await };
    let result = match AssertUnwindSafe(invocation).catch_unwind().await {
        Ok(result) => result,
        Err(panic) => Err(HandlerError::Panicked(panic_message(panic.as_ref()))),
    };

    result.map_err(|source| {
        tracing::debug!(
            envelope_id = %envelope.id,
            handler = descriptor.handler_name(),
            error = %source,
            "handler failed"
        );
        HandlerFault {
            handler: descriptor.handler_name(),
            source,
        }
    })
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
