//! Correlation table for in-flight RPC calls.
//!
//! Every entry is removed exactly once: by the matching reply, by its own
//! timer, or by an explicit failure. Removal goes through `DashMap::remove`,
//! so whichever path gets there first owns the completion sender and the
//! others find nothing.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use courier_core::{CorrelationId, ResponseEnvelope};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::sync::oneshot;
use tokio::task::AbortHandle;
use tracing::debug;

use crate::error::RpcError;

/// Outcome delivered to the caller of a pending call.
pub type Completion = Result<ResponseEnvelope, RpcError>;

#[derive(Debug)]
struct PendingRequest {
    queue: String,
    timeout: Duration,
    tx: oneshot::Sender<Completion>,
    timer: Option<AbortHandle>,
}

impl PendingRequest {
    fn complete(self, outcome: Completion) {
        if let Some(timer) = &self.timer {
            timer.abort();
        }
        // The caller may have dropped its future (fire-and-forget).
        let _ = self.tx.send(outcome);
    }
}

/// In-flight calls of one publisher, keyed by correlation id.
#[derive(Debug, Default)]
pub struct PendingTable {
    entries: DashMap<CorrelationId, PendingRequest>,
}

impl PendingTable {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a pending call and arms its timer.
    ///
    /// The timer is a spawned task owned by the table, so the entry expires
    /// after `timeout` whether or not anyone polls the returned
    /// [`PendingReply`].
    ///
    /// # Errors
    ///
    /// Returns [`RpcError::DuplicateCorrelation`] if `id` is already in flight.
    pub fn register(
        self: &Arc<Self>,
        id: CorrelationId,
        queue: &str,
        timeout: Duration,
    ) -> Result<PendingReply, RpcError> {
        let (tx, rx) = oneshot::channel();
        match self.entries.entry(id.clone()) {
            Entry::Occupied(_) => return Err(RpcError::DuplicateCorrelation(id)),
            Entry::Vacant(slot) => {
                slot.insert(PendingRequest {
                    queue: queue.to_string(),
                    timeout,
                    tx,
                    timer: None,
                });
            }
        }

        // Armed after insertion so a zero timeout cannot fire before the entry exists.
        let table = Arc::clone(self);
        let timer_id = id.clone();
        let timer = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            table.expire(timer_id.as_str());
        })
        .abort_handle();

        match self.entries.get_mut(&id) {
            Some(mut entry) => entry.timer = Some(timer),
            None => timer.abort(),
        }

        Ok(PendingReply { id, rx })
    }

    /// Completes the call `id` with a raw reply body.
    ///
    /// Returns `false` if no call with that id is in flight (already timed
    /// out, already answered, or never issued); the body is then ignored.
    pub fn resolve(&self, id: &str, body: &[u8]) -> bool {
        let Some((_, entry)) = self.entries.remove(id) else {
            return false;
        };
        let outcome = ResponseEnvelope::decode(body).map_err(RpcError::from);
        entry.complete(outcome);
        true
    }

    /// Completes the call `id` with an error, e.g. after a failed publish.
    pub fn fail(&self, id: &str, error: RpcError) -> bool {
        let Some((_, entry)) = self.entries.remove(id) else {
            return false;
        };
        entry.complete(Err(error));
        true
    }

    fn expire(&self, id: &str) -> bool {
        let Some((_, entry)) = self.entries.remove(id) else {
            return false;
        };
        let timeout_ms = u64::try_from(entry.timeout.as_millis()).unwrap_or(u64::MAX);
        debug!(correlation_id = id, queue = %entry.queue, timeout_ms, "RPC call timed out");
        let error = RpcError::Timeout {
            queue: entry.queue.clone(),
            timeout_ms,
        };
        entry.complete(Err(error));
        true
    }

    /// Returns `true` if `id` is still awaiting a reply.
    #[must_use]
    pub fn contains(&self, id: &str) -> bool {
        self.entries.contains_key(id)
    }

    /// Number of calls awaiting a reply.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Future resolving to the outcome of one pending call.
#[derive(Debug)]
pub struct PendingReply {
    id: CorrelationId,
    rx: oneshot::Receiver<Completion>,
}

impl PendingReply {
    #[must_use]
    pub fn correlation_id(&self) -> &CorrelationId {
        &self.id
    }
}

impl Future for PendingReply {
    type Output = Completion;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|received| received.unwrap_or(Err(RpcError::Cancelled)))
    }
}
