//! RPC publisher: correlated request/reply over a private reply queue.
//!
//! 1. **Initialization**: declare request queues, declare one exclusive reply
//!    queue, start a single no-ack consumer on it.
//! 2. **Calls** (`call`): register a pending entry with its timer, publish the
//!    request with `correlation_id` and `reply_to`, await the outcome.
//! 3. **Reply listener**: demultiplexes replies into the [`PendingTable`] by
//!    correlation id and re-establishes the reply queue after a lost channel.

pub mod pending;

use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use courier_core::{CorrelationId, MessageProperties, RequestEnvelope, ResponseEnvelope};
use futures_util::StreamExt;
use serde::Serialize;
use serde_json::Value;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::broker::{Broker, ConsumeOptions, Delivery, DeliveryStream, QueueOptions};
use crate::config::PublisherConfig;
use crate::connection::ConnectionManager;
use crate::error::{BrokerError, RpcError};
use crate::telemetry::RPC_CALLS_TOTAL;

pub use pending::{Completion, PendingReply, PendingTable};

// ---------------------------------------------------------------------------
// RpcPublisher
// ---------------------------------------------------------------------------

/// Issues RPC calls and tracks their replies.
///
/// Each instance owns its reply queue and correlation table; several
/// publishers can share one [`ConnectionManager`] without seeing each
/// other's replies. Dropping the publisher stops its reply listener.
pub struct RpcPublisher {
    manager: Arc<ConnectionManager>,
    config: PublisherConfig,
    pending: Arc<PendingTable>,
    reply_queue: Arc<ArcSwap<String>>,
    listener: JoinHandle<()>,
}

impl RpcPublisher {
    /// Connects, declares queues and starts the reply listener.
    ///
    /// Waits for the broker (retrying forever) if it is not reachable yet.
    ///
    /// # Errors
    ///
    /// Returns an error if a queue declaration or the reply consumer fails on
    /// an otherwise open channel.
    pub async fn initialize(
        manager: Arc<ConnectionManager>,
        config: PublisherConfig,
    ) -> Result<Self, RpcError> {
        Self::with_table(manager, config, Arc::new(PendingTable::new())).await
    }

    /// Like [`initialize`](Self::initialize) with a caller-provided table.
    ///
    /// # Errors
    ///
    /// See [`initialize`](Self::initialize).
    pub async fn with_table(
        manager: Arc<ConnectionManager>,
        config: PublisherConfig,
        pending: Arc<PendingTable>,
    ) -> Result<Self, RpcError> {
        let channel = manager.get_channel().await;
        let (reply_name, stream) = open_reply_consumer(channel.as_ref(), &config).await?;
        info!(reply_queue = %reply_name, "RPC publisher initialized");

        let reply_queue = Arc::new(ArcSwap::from_pointee(reply_name));
        let listener = ReplyListener {
            manager: Arc::clone(&manager),
            config: config.clone(),
            pending: Arc::clone(&pending),
            reply_queue: Arc::clone(&reply_queue),
        };
        let listener = tokio::spawn(listener.run(channel, stream));

        Ok(Self {
            manager,
            config,
            pending,
            reply_queue,
            listener,
        })
    }

    /// Publishes `payload` to `queue` and waits for the correlated reply.
    ///
    /// The timer starts before the broker channel is acquired, so the call
    /// fails with [`RpcError::Timeout`] after `timeout` even while the broker
    /// is unreachable.
    ///
    /// # Errors
    ///
    /// - [`RpcError::Encode`] if `payload` cannot be serialized.
    /// - [`RpcError::Broker`] if the publish is rejected.
    /// - [`RpcError::Timeout`] if no reply arrives within `timeout`.
    /// - [`RpcError::Parse`] if the reply body is not a response envelope.
    pub async fn call<T>(
        &self,
        queue: &str,
        payload: &T,
        timeout: Duration,
    ) -> Result<ResponseEnvelope, RpcError>
    where
        T: Serialize + ?Sized,
    {
        let body = serde_json::to_vec(payload)?;
        let id = CorrelationId::generate();
        let mut reply = self.pending.register(id.clone(), queue, timeout)?;

        let send = self.send(queue, &body, &id);
        tokio::select! {
            outcome = &mut reply => return record(queue, outcome),
            sent = send => {
                if let Err(err) = sent {
                    warn!(queue, correlation_id = %id, error = %err, "RPC publish failed");
                    self.pending.fail(id.as_str(), err.into());
                }
            }
        }

        record(queue, reply.await)
    }

    async fn send(&self, queue: &str, body: &[u8], id: &CorrelationId) -> Result<(), BrokerError> {
        let channel = self.manager.get_channel().await;
        let reply_to = self.reply_queue.load_full();
        let properties = MessageProperties::request(id.clone(), reply_to.as_str());
        channel.publish(queue, body, &properties).await?;
        debug!(queue, correlation_id = %id, reply_to = %reply_to, "RPC request sent");
        Ok(())
    }

    /// Calls `action` on `queue` with the default timeout and unwraps the reply.
    ///
    /// # Errors
    ///
    /// Everything [`call`](Self::call) returns, plus [`RpcError::Remote`] when
    /// the server replies with `ok: false`.
    pub async fn invoke(&self, queue: &str, action: &str, data: Value) -> Result<Value, RpcError> {
        let envelope = RequestEnvelope::new(action, data);
        let reply = self
            .call(queue, &envelope, self.config.default_timeout)
            .await?;
        reply.into_result().map_err(RpcError::Remote)
    }

    /// Number of calls awaiting a reply.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// The correlation table of this publisher.
    #[must_use]
    pub fn pending(&self) -> &Arc<PendingTable> {
        &self.pending
    }

    /// Current reply queue address.
    #[must_use]
    pub fn reply_queue(&self) -> String {
        self.reply_queue.load().as_ref().clone()
    }

    /// Publisher settings.
    #[must_use]
    pub fn config(&self) -> &PublisherConfig {
        &self.config
    }
}

impl Drop for RpcPublisher {
    fn drop(&mut self) {
        self.listener.abort();
    }
}

fn record(queue: &str, outcome: Completion) -> Completion {
    let label = match &outcome {
        Ok(reply) if reply.ok => "ok",
        Ok(_) => "remote_error",
        Err(err) => err.kind(),
    };
    metrics::counter!(
        RPC_CALLS_TOTAL,
        "queue" => queue.to_string(),
        "outcome" => label
    )
    .increment(1);
    outcome
}

/// Declares request queues and the reply queue, and subscribes to replies.
async fn open_reply_consumer(
    channel: &dyn Broker,
    config: &PublisherConfig,
) -> Result<(String, DeliveryStream), BrokerError> {
    for queue in &config.request_queues {
        channel.declare_queue(queue, QueueOptions::durable()).await?;
    }
    let reply = channel.declare_queue("", QueueOptions::exclusive()).await?;
    let stream = channel
        .consume(&reply.name, ConsumeOptions::auto_ack())
        .await?;
    Ok((reply.name, stream))
}

// ---------------------------------------------------------------------------
// ReplyListener
// ---------------------------------------------------------------------------

struct ReplyListener {
    manager: Arc<ConnectionManager>,
    config: PublisherConfig,
    pending: Arc<PendingTable>,
    reply_queue: Arc<ArcSwap<String>>,
}

impl ReplyListener {
    async fn run(self, mut channel: Arc<dyn Broker>, mut stream: DeliveryStream) {
        loop {
            while let Some(item) = stream.next().await {
                match item {
                    Ok(delivery) => self.dispatch(&delivery),
                    Err(err) => {
                        warn!(error = %err, "reply consumer failed");
                        break;
                    }
                }
            }

            warn!(reply_queue = %self.reply_queue.load(), "reply stream ended, re-establishing");
            (channel, stream) = self.reopen(&channel).await;
        }
    }

    fn dispatch(&self, delivery: &Delivery) {
        let Some(id) = delivery.properties.correlation_id.as_ref() else {
            debug!("reply without correlation id dropped");
            return;
        };
        if !self.pending.resolve(id.as_str(), &delivery.body) {
            debug!(correlation_id = %id, "reply for unknown or expired call dropped");
        }
    }

    async fn reopen(&self, stale: &Arc<dyn Broker>) -> (Arc<dyn Broker>, DeliveryStream) {
        self.manager.invalidate(stale).await;
        loop {
            let channel = self.manager.get_channel().await;
            match open_reply_consumer(channel.as_ref(), &self.config).await {
                Ok((name, stream)) => {
                    info!(reply_queue = %name, "reply queue re-established");
                    self.reply_queue.store(Arc::new(name));
                    return (channel, stream);
                }
                Err(err) => {
                    warn!(error = %err, "failed to re-establish reply queue");
                    self.manager.invalidate(&channel).await;
                    tokio::time::sleep(self.manager.retry_interval()).await;
                }
            }
        }
    }
}
