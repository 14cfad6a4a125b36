//! Multicast response aggregator: one request, many replies, bounded wait.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll};
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::error::BusError;
use crate::transport::{CorrelationId, Destination, Envelope, Sender, FAULT_HEADER};

/// What happened to a reply offered to the aggregator.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReplyOutcome {
    /// Appended to a pending collection that is still open.
    Collected,
    /// Appended, and the expected count was reached; the caller has been resolved.
    Completed,
    /// A responder that already replied under this correlation id.
    Duplicate,
    /// A fault reply; logged, never counted.
    Faulted,
    /// Nothing pending under this correlation id.
    Unmatched,
}

struct PendingMulticastEntry {
    tx: oneshot::Sender<Vec<Envelope>>,
    replies: Vec<Envelope>,
    responders: HashSet<String>,
    expected: Option<usize>,
    timer: JoinHandle<()>,
}

#[derive(Default)]
struct Inner {
    pending: Mutex<HashMap<CorrelationId, PendingMulticastEntry>>,
}

impl Inner {
    fn pending(&self) -> MutexGuard<'_, HashMap<CorrelationId, PendingMulticastEntry>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn release(&self, correlation_id: &CorrelationId) {
        let entry = self.pending().remove(correlation_id);
        if let Some(entry) = entry {
            entry.timer.abort();
        }
    }

    /// Resolve early with what has been collected.
    fn finish(&self, correlation_id: &CorrelationId) {
        let entry = self.pending().remove(correlation_id);
        if let Some(entry) = entry {
            entry.timer.abort();
            let _ = entry.tx.send(entry.replies);
        }
    }

    fn expire(&self, correlation_id: &CorrelationId) {
        let entry = self.pending().remove(correlation_id);
        if let Some(entry) = entry {
            tracing::debug!(
                correlation_id = %correlation_id,
                received = entry.replies.len(),
                expected = ?entry.expected,
                "multicast request deadline reached"
            );
            let _ = entry.tx.send(entry.replies);
        }
    }
}

/// Collects the replies to multicast requests.
///
/// A pending collection resolves at whichever comes first: its deadline, with
/// whatever arrived (possibly nothing), or the arrival of `expected` distinct
/// responders. When fewer responders exist than expected the full deadline is
/// waited out.
#[derive(Clone, Default)]
pub struct MulticastAggregator {
    inner: Arc<Inner>,
}

impl MulticastAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stamp a fresh correlation id on `envelope`, track it, and broadcast it.
    pub async fn send(
        &self,
        sender: &dyn Sender,
        destination: &Destination,
        envelope: Envelope,
        timeout: Duration,
        expected: Option<usize>,
    ) -> Result<PendingMulticast, BusError> {
        let correlation_id = CorrelationId::new();
        let envelope = envelope.with_correlation_id(correlation_id.clone());
        let (tx, rx) = oneshot::channel();

        {
            let mut pending = self.inner.pending();
            let inner = Arc::clone(&self.inner);
            let id = correlation_id.clone();
            let timer = tokio::spawn(async move {
                tokio::time::sleep(timeout).await;
                inner.expire(&id);
            });
            pending.insert(
                correlation_id.clone(),
                PendingMulticastEntry {
                    tx,
                    replies: Vec::new(),
                    responders: HashSet::new(),
                    expected,
                    timer,
                },
            );
        }

        tracing::debug!(
            correlation_id = %correlation_id,
            message_type = %envelope.message_type,
            destination = %destination,
            expected = ?expected,
            "broadcasting multicast request"
        );

        if let Err(err) = sender.send(destination, envelope).await {
            self.inner.release(&correlation_id);
            return Err(err.into());
        }

        if expected == Some(0) {
            self.inner.finish(&correlation_id);
        }

        Ok(PendingMulticast {
            correlation_id,
            rx,
            inner: Arc::clone(&self.inner),
            finished: false,
        })
    }

    /// Offer a reply to the collection pending under `correlation_id`.
    pub fn accept(&self, correlation_id: &CorrelationId, reply: Envelope) -> ReplyOutcome {
        let mut pending = self.inner.pending();
        let Some(entry) = pending.get_mut(correlation_id) else {
            return ReplyOutcome::Unmatched;
        };

        if reply.is_fault() {
            tracing::warn!(
                correlation_id = %correlation_id,
                responder = reply.responder.as_deref().unwrap_or("unknown"),
                fault = reply.header(FAULT_HEADER).unwrap_or_default(),
                "multicast responder faulted"
            );
            return ReplyOutcome::Faulted;
        }

        // Replies without a responder identity can only be told apart by id.
        let responder = reply.responder.clone().unwrap_or_else(|| reply.id.clone());
        if !entry.responders.insert(responder) {
            return ReplyOutcome::Duplicate;
        }
        entry.replies.push(reply);

        let done = entry
            .expected
            .is_some_and(|expected| entry.replies.len() >= expected);
        if !done {
            return ReplyOutcome::Collected;
        }

        let Some(entry) = pending.remove(correlation_id) else {
            return ReplyOutcome::Unmatched;
        };
        drop(pending);

        entry.timer.abort();
        tracing::debug!(
            correlation_id = %correlation_id,
            received = entry.replies.len(),
            "multicast request complete"
        );
        let _ = entry.tx.send(entry.replies);
        ReplyOutcome::Completed
    }

    pub fn is_pending(&self, correlation_id: &CorrelationId) -> bool {
        self.inner.pending().contains_key(correlation_id)
    }

    /// Number of multicast requests still collecting.
    pub fn outstanding(&self) -> usize {
        self.inner.pending().len()
    }
}

/// Future of the replies to one multicast request, in arrival order.
///
/// Dropping it before it resolves releases the tracking entry and its timer.
pub struct PendingMulticast {
    correlation_id: CorrelationId,
    rx: oneshot::Receiver<Vec<Envelope>>,
    inner: Arc<Inner>,
    finished: bool,
}

impl PendingMulticast {
    pub fn correlation_id(&self) -> &CorrelationId {
        &self.correlation_id
    }
}

impl Future for PendingMulticast {
    type Output = Vec<Envelope>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        match Pin::new(&mut this.rx).poll(cx) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(replies) => {
                this.finished = true;
                Poll::Ready(replies.unwrap_or_default())
            }
        }
    }
}

impl Drop for PendingMulticast {
    fn drop(&mut self) {
        if !self.finished {
            self.inner.release(&self.correlation_id);
        }
    }
}
