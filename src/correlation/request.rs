//! Request correlator: one request, one reply, one deadline.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll};
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::error::BusError;
use crate::transport::{CorrelationId, Destination, Envelope, Sender, FAULT_HEADER};

type ReplyResult = Result<Envelope, BusError>;

struct PendingRequest {
    tx: oneshot::Sender<ReplyResult>,
    timer: JoinHandle<()>,
}

#[derive(Default)]
struct Inner {
    pending: Mutex<HashMap<CorrelationId, PendingRequest>>,
}

impl Inner {
    fn pending(&self) -> MutexGuard<'_, HashMap<CorrelationId, PendingRequest>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Remove an entry without resolving it.
    fn release(&self, correlation_id: &CorrelationId) {
        let entry = self.pending().remove(correlation_id);
        if let Some(entry) = entry {
            entry.timer.abort();
        }
    }

    /// Deadline reached: the timer task owns this call, so it does not abort itself.
    fn expire(&self, correlation_id: &CorrelationId, timeout: Duration) {
        let entry = self.pending().remove(correlation_id);
        if let Some(entry) = entry {
            tracing::debug!(correlation_id = %correlation_id, ?timeout, "request timed out");
            let _ = entry.tx.send(Err(BusError::RequestTimedOut {
                correlation_id: correlation_id.clone(),
                timeout,
            }));
        }
    }
}

/// Tracks outstanding single-reply requests by correlation id.
///
/// Each entry is resolved exactly once: by the first matching reply, or by its
/// deadline timer. Removal from the map is the resolution step, so whichever
/// side removes the entry wins and the other finds nothing to do.
#[derive(Clone, Default)]
pub struct RequestCorrelator {
    inner: Arc<Inner>,
}

impl RequestCorrelator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stamp a fresh correlation id on `envelope`, track it, and transmit it.
    ///
    /// Must be called from within a tokio runtime; the deadline is a spawned timer.
    pub async fn send(
        &self,
        sender: &dyn Sender,
        destination: &Destination,
        envelope: Envelope,
        timeout: Duration,
    ) -> Result<PendingReply, BusError> {
        let correlation_id = CorrelationId::new();
        let envelope = envelope.with_correlation_id(correlation_id.clone());
        let (tx, rx) = oneshot::channel();

        {
            let mut pending = self.inner.pending();
            let inner = Arc::clone(&self.inner);
            let id = correlation_id.clone();
            let timer = tokio::spawn(async move {
                tokio::time::sleep(timeout).await;
                inner.expire(&id, timeout);
            });
            pending.insert(correlation_id.clone(), PendingRequest { tx, timer });
        }

        tracing::debug!(
            correlation_id = %correlation_id,
            message_type = %envelope.message_type,
            destination = %destination,
            "sending request"
        );

        if let Err(err) = sender.send(destination, envelope).await {
            self.inner.release(&correlation_id);
            return Err(err.into());
        }

        Ok(PendingReply {
            correlation_id,
            rx,
            inner: Arc::clone(&self.inner),
            finished: false,
        })
    }

    /// Resolve the pending request matching `correlation_id` with `reply`.
    ///
    /// Returns `false` when nothing is pending under that id (already resolved,
    /// timed out, cancelled, or never sent from here).
    ///
    /// A fault reply resolves the caller with [`BusError::RemoteFault`]. The
    /// dispatcher in this crate never answers a single request with a fault
    /// (the request is abandoned and redelivered instead), so fault replies
    /// here come from external responders sharing the envelope format.
    pub fn resolve(&self, correlation_id: &CorrelationId, reply: Envelope) -> bool {
        let Some(entry) = self.inner.pending().remove(correlation_id) else {
            return false;
        };
        entry.timer.abort();

        let result = if reply.is_fault() {
            let description = reply.header(FAULT_HEADER).unwrap_or_default().to_string();
            let responder = reply.responder.clone().unwrap_or_default();
            tracing::warn!(
                correlation_id = %correlation_id,
                responder = %responder,
                fault = %description,
                "fault reply received"
            );
            Err(BusError::RemoteFault {
                responder,
                description,
            })
        } else {
            Ok(reply)
        };

        let _ = entry.tx.send(result);
        true
    }

    pub fn is_pending(&self, correlation_id: &CorrelationId) -> bool {
        self.inner.pending().contains_key(correlation_id)
    }

    /// Number of requests still awaiting a reply.
    pub fn outstanding(&self) -> usize {
        self.inner.pending().len()
    }
}

/// Future of a single reply.
///
/// Dropping it before it resolves cancels the request: the tracking entry and
/// its timer are released, and a reply arriving later is unmatched.
pub struct PendingReply {
    correlation_id: CorrelationId,
    rx: oneshot::Receiver<ReplyResult>,
    inner: Arc<Inner>,
    finished: bool,
}

impl PendingReply {
    pub fn correlation_id(&self) -> &CorrelationId {
        &self.correlation_id
    }
}

impl Future for PendingReply {
    type Output = Result<Envelope, BusError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        match Pin::new(&mut this.rx).poll(cx) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(result) => {
                this.finished = true;
                Poll::Ready(result.unwrap_or_else(|_| {
                    Err(BusError::IllegalState(format!(
                        "request {} was released without a result",
                        this.correlation_id
                    )))
                }))
            }
        }
    }
}

impl Drop for PendingReply {
    fn drop(&mut self) {
        if !self.finished {
            self.inner.release(&self.correlation_id);
        }
    }
}
