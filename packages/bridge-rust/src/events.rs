//! Fire-and-forget events over the RPC publisher.
//!
//! An event is an ordinary call whose outcome nobody has to wait for. The
//! correlation entry still expires on its own timer, so dropping the returned
//! handle leaks nothing.

use std::sync::Arc;

use courier_core::{RequestEnvelope, ResponseEnvelope};
use serde_json::Value;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::config::EventConfig;
use crate::error::RpcError;
use crate::publisher::RpcPublisher;

/// Emits one-way events through a shared [`RpcPublisher`].
#[derive(Clone)]
pub struct EventBridge {
    publisher: Arc<RpcPublisher>,
    config: EventConfig,
}

impl EventBridge {
    #[must_use]
    pub fn new(publisher: Arc<RpcPublisher>, config: EventConfig) -> Self {
        Self { publisher, config }
    }

    /// Sends `event` with `data` to `queue` in the background.
    ///
    /// Returns immediately. The handle resolves to the reply if the consumer
    /// answers within `event_timeout`; failures are logged either way, so the
    /// handle may be dropped.
    pub fn emit(
        &self,
        queue: impl Into<String>,
        event: impl Into<String>,
        data: Value,
    ) -> JoinHandle<Result<ResponseEnvelope, RpcError>> {
        let publisher = Arc::clone(&self.publisher);
        let timeout = self.config.event_timeout;
        let queue = queue.into();
        let envelope = RequestEnvelope::new(event, data);

        tokio::spawn(async move {
            let outcome = publisher.call(&queue, &envelope, timeout).await;
            match &outcome {
                Ok(reply) if reply.ok => {
                    debug!(queue = %queue, event = %envelope.action, "event delivered");
                }
                Ok(reply) => warn!(
                    queue = %queue,
                    event = %envelope.action,
                    error = reply.error.as_deref().unwrap_or_default(),
                    "event rejected by consumer"
                ),
                Err(err) => warn!(
                    queue = %queue,
                    event = %envelope.action,
                    error = %err,
                    "event failed"
                ),
            }
            outcome
        })
    }

    #[must_use]
    pub fn publisher(&self) -> &Arc<RpcPublisher> {
        &self.publisher
    }
}
