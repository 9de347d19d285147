//! RPC server: consumes a request queue and replies through action handlers.
//!
//! Per delivery: decode the envelope, dispatch through the
//! [`DispatchPipeline`], publish the reply when the sender asked for one,
//! then acknowledge. Bodies that are not JSON are acknowledged and discarded;
//! JSON without a string action is answered as an unknown action.

pub mod dispatch;
pub mod middleware;
pub mod router;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use courier_core::{ActionContext, MessageProperties, RequestEnvelope, ResponseEnvelope};
use futures_util::StreamExt;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tower::{Service, ServiceExt};
use tracing::{debug, info, warn};

use crate::broker::{Broker, ConsumeOptions, Delivery, DeliveryStream, QueueOptions};
use crate::config::ServerConfig;
use crate::connection::ConnectionManager;
use crate::error::BrokerError;

pub use dispatch::{ActionRequest, DispatchError, RouterError};
pub use middleware::{build_dispatch_pipeline, DispatchPipeline};
pub use router::{ActionRouter, ActionRouterBuilder};

/// Action name reported for requests that carry none.
const UNDEFINED_ACTION: &str = "undefined";

// ---------------------------------------------------------------------------
// ServerStats
// ---------------------------------------------------------------------------

/// Live counters of one server.
#[derive(Debug, Default)]
pub struct ServerStats {
    received: AtomicU64,
    discarded: AtomicU64,
    replied: AtomicU64,
    failed: AtomicU64,
}

/// Point-in-time copy of [`ServerStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ServerStatsSnapshot {
    /// Deliveries taken from the request queue.
    pub received: u64,
    /// Deliveries dropped because the body was not a request envelope.
    pub discarded: u64,
    /// Replies published, successful or not.
    pub replied: u64,
    /// Dispatches that ended in an error (unknown action, handler failure).
    pub failed: u64,
}

impl ServerStats {
    #[must_use]
    pub fn snapshot(&self) -> ServerStatsSnapshot {
        ServerStatsSnapshot {
            received: self.received.load(Ordering::Relaxed),
            discarded: self.discarded.load(Ordering::Relaxed),
            replied: self.replied.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
        }
    }

    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

// ---------------------------------------------------------------------------
// RpcServer
// ---------------------------------------------------------------------------

/// Entry point for serving a request queue.
pub struct RpcServer;

impl RpcServer {
    /// Declares `queue`, subscribes with manual acknowledgment and starts the
    /// consume loop on the runtime.
    ///
    /// The loop runs until [`ServerHandle::stop`] is called or the handle is
    /// dropped. A lost channel is re-established transparently.
    ///
    /// # Errors
    ///
    /// Returns an error if the initial declaration or subscription fails on
    /// an open channel.
    pub async fn serve(
        manager: Arc<ConnectionManager>,
        queue: impl Into<String>,
        router: ActionRouter,
        config: ServerConfig,
    ) -> Result<ServerHandle, BrokerError> {
        let queue = queue.into();
        let channel = manager.get_channel().await;
        let stream = open_consumer(channel.as_ref(), &queue, &config).await?;
        info!(queue = %queue, actions = ?router.actions(), prefetch = config.prefetch, "RPC server listening");

        let stats = Arc::new(ServerStats::default());
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let consumer = ServerLoop {
            pipeline: build_dispatch_pipeline(router, &config),
            manager,
            queue: queue.clone(),
            config,
            stats: Arc::clone(&stats),
        };
        let handle = tokio::spawn(consumer.run(channel, stream, shutdown_rx));

        Ok(ServerHandle {
            queue,
            stats,
            shutdown_tx: Some(shutdown_tx),
            handle: Some(handle),
        })
    }
}

async fn open_consumer(
    channel: &dyn Broker,
    queue: &str,
    config: &ServerConfig,
) -> Result<DeliveryStream, BrokerError> {
    channel.declare_queue(queue, QueueOptions::durable()).await?;
    channel
        .consume(queue, ConsumeOptions::manual(config.prefetch))
        .await
}

// ---------------------------------------------------------------------------
// ServerHandle
// ---------------------------------------------------------------------------

/// Controls a running server. Dropping the handle stops the server.
#[derive(Debug)]
pub struct ServerHandle {
    queue: String,
    stats: Arc<ServerStats>,
    shutdown_tx: Option<oneshot::Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl ServerHandle {
    /// Stops consuming and waits for the message in progress to finish.
    pub async fn stop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }
    }

    #[must_use]
    pub fn stats(&self) -> ServerStatsSnapshot {
        self.stats.snapshot()
    }

    #[must_use]
    pub fn queue(&self) -> &str {
        &self.queue
    }

    /// Returns `true` once the consume loop has exited.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.handle.as_ref().map_or(true, JoinHandle::is_finished)
    }
}

// ---------------------------------------------------------------------------
// ServerLoop
// ---------------------------------------------------------------------------

struct ServerLoop {
    manager: Arc<ConnectionManager>,
    queue: String,
    config: ServerConfig,
    pipeline: DispatchPipeline,
    stats: Arc<ServerStats>,
}

impl ServerLoop {
    async fn run(
        mut self,
        mut channel: Arc<dyn Broker>,
        mut stream: DeliveryStream,
        mut shutdown: oneshot::Receiver<()>,
    ) {
        loop {
            let next = tokio::select! {
                biased;
                _ = &mut shutdown => break,
                next = stream.next() => next,
            };

            match next {
                Some(Ok(delivery)) => self.process(channel.as_ref(), delivery).await,
                Some(Err(err)) => {
                    warn!(queue = %self.queue, error = %err, "request consumer failed");
                    match self.reopen(&channel, &mut shutdown).await {
                        Some(fresh) => (channel, stream) = fresh,
                        None => break,
                    }
                }
                None => {
                    warn!(queue = %self.queue, "request stream ended, re-establishing");
                    match self.reopen(&channel, &mut shutdown).await {
                        Some(fresh) => (channel, stream) = fresh,
                        None => break,
                    }
                }
            }
        }
        info!(queue = %self.queue, "RPC server stopped");
    }

    async fn process(&mut self, channel: &dyn Broker, delivery: Delivery) {
        ServerStats::bump(&self.stats.received);
        let Delivery {
            delivery_tag,
            body,
            properties,
        } = delivery;

        let (action, outcome) = match RequestEnvelope::decode(&body) {
            Ok(request) => {
                let ctx = ActionContext {
                    action: request.action,
                    queue: self.queue.clone(),
                    correlation_id: properties.correlation_id.clone(),
                    reply_to: properties.reply_to.clone(),
                };
                let action = ctx.action.clone();
                let outcome = match self.pipeline.ready().await {
                    Ok(pipeline) => pipeline.call(ActionRequest::new(ctx, request.data)).await,
                    Err(err) => Err(err),
                };
                (action, outcome)
            }
            Err(err) if err.is_invalid_json() => {
                warn!(queue = %self.queue, delivery_tag, error = %err, "undecodable request discarded");
                ServerStats::bump(&self.stats.discarded);
                self.ack(channel, delivery_tag).await;
                return;
            }
            // JSON without a usable action still gets an answer.
            Err(err) => {
                debug!(queue = %self.queue, delivery_tag, error = %err, "request has no action");
                let action = UNDEFINED_ACTION.to_string();
                let outcome = Err(DispatchError::UnknownAction {
                    action: action.clone(),
                });
                (action, outcome)
            }
        };

        let response = match outcome {
            Ok(data) => ResponseEnvelope::success(data),
            Err(err) => {
                warn!(queue = %self.queue, action = %action, error = %err, "action failed");
                ServerStats::bump(&self.stats.failed);
                ResponseEnvelope::failure(err.to_string())
            }
        };

        match properties.reply_to.as_deref() {
            Some(reply_to) if properties.expects_reply() => {
                self.reply(channel, reply_to, &properties, &response).await;
            }
            _ => debug!(queue = %self.queue, action = %action, "no reply address, reply skipped"),
        }

        self.ack(channel, delivery_tag).await;
    }

    async fn reply(
        &self,
        channel: &dyn Broker,
        reply_to: &str,
        request: &MessageProperties,
        response: &ResponseEnvelope,
    ) {
        let body = match response.encode() {
            Ok(body) => body,
            Err(err) => {
                warn!(queue = %self.queue, error = %err, "failed to encode reply");
                return;
            }
        };
        let properties = MessageProperties::reply(request.correlation_id.clone());
        match channel.publish(reply_to, &body, &properties).await {
            Ok(()) => ServerStats::bump(&self.stats.replied),
            Err(err) => warn!(
                queue = %self.queue,
                reply_to,
                error = %err,
                "failed to publish reply"
            ),
        }
    }

    async fn ack(&self, channel: &dyn Broker, delivery_tag: u64) {
        if let Err(err) = channel.ack(delivery_tag).await {
            warn!(queue = %self.queue, delivery_tag, error = %err, "ack failed");
        }
    }

    /// Waits for a fresh channel and resubscribes. Returns `None` on shutdown.
    async fn reopen(
        &self,
        stale: &Arc<dyn Broker>,
        shutdown: &mut oneshot::Receiver<()>,
    ) -> Option<(Arc<dyn Broker>, DeliveryStream)> {
        self.manager.invalidate(stale).await;
        loop {
            let channel = tokio::select! {
                biased;
                _ = &mut *shutdown => return None,
                channel = self.manager.get_channel() => channel,
            };
            match open_consumer(channel.as_ref(), &self.queue, &self.config).await {
                Ok(stream) => {
                    info!(queue = %self.queue, "request consumer re-established");
                    return Some((channel, stream));
                }
                Err(err) => {
                    warn!(queue = %self.queue, error = %err, "failed to re-establish request consumer");
                    self.manager.invalidate(&channel).await;
                    tokio::select! {
                        biased;
                        _ = &mut *shutdown => return None,
                        () = tokio::time::sleep(self.manager.retry_interval()) => {}
                    }
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use courier_core::{handler_fn, CorrelationId};
    use serde_json::{json, Value};

    use super::*;
    use crate::broker::{Connector, MemoryBroker, MemoryConnector};
    use crate::config::BrokerConfig;

    const QUEUE: &str = "svc_queue";
    const REPLIES: &str = "test_replies";

    fn manager(connector: &Arc<MemoryConnector>) -> Arc<ConnectionManager> {
        let connector: Arc<dyn Connector> = Arc::clone(connector) as Arc<dyn Connector>;
        Arc::new(ConnectionManager::new(
            connector,
            BrokerConfig {
                retry_interval: Duration::from_millis(10),
                max_backoff: Duration::from_millis(10),
                ..BrokerConfig::default()
            },
        ))
    }

    fn router() -> ActionRouter {
        ActionRouter::builder()
            .register("echo", handler_fn(|data| async move { Ok(data) }))
            .unwrap()
            .build()
    }

    async fn reply_client(broker: &MemoryBroker) -> (crate::broker::MemoryChannel, DeliveryStream) {
        let channel = broker.channel();
        channel
            .declare_queue(REPLIES, QueueOptions::default())
            .await
            .unwrap();
        let replies = channel
            .consume(REPLIES, ConsumeOptions::auto_ack())
            .await
            .unwrap();
        (channel, replies)
    }

    async fn next_reply(replies: &mut DeliveryStream) -> Delivery {
        tokio::time::timeout(Duration::from_secs(2), replies.next())
            .await
            .expect("reply within 2s")
            .expect("stream open")
            .expect("delivery")
    }

    async fn wait_for_stats(handle: &ServerHandle, done: impl Fn(ServerStatsSnapshot) -> bool) {
        tokio::time::timeout(Duration::from_secs(2), async {
            while !done(handle.stats()) {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("stats condition within 2s");
    }

    #[tokio::test]
    async fn replies_with_handler_result_and_acks() {
        let broker = MemoryBroker::new();
        let connector = Arc::new(MemoryConnector::new(broker.clone()));
        let mut handle = RpcServer::serve(manager(&connector), QUEUE, router(), ServerConfig::default())
            .await
            .unwrap();
        assert_eq!(broker.is_durable(QUEUE), Some(true));

        let (client, mut replies) = reply_client(&broker).await;
        let body = RequestEnvelope::new("echo", json!({"v": 7})).encode().unwrap();
        client
            .publish(QUEUE, &body, &MessageProperties::request(CorrelationId::from("c-1"), REPLIES))
            .await
            .unwrap();

        let reply = next_reply(&mut replies).await;
        assert_eq!(reply.properties.correlation_id, Some(CorrelationId::from("c-1")));
        let response = ResponseEnvelope::decode(&reply.body).unwrap();
        assert_eq!(response, ResponseEnvelope::success(json!({"v": 7})));

        wait_for_stats(&handle, |s| s.replied == 1).await;
        assert_eq!(broker.ready_count(QUEUE), Some(0));
        handle.stop().await;
        assert!(handle.is_finished());
    }

    #[tokio::test]
    async fn unknown_action_gets_error_reply() {
        let broker = MemoryBroker::new();
        let connector = Arc::new(MemoryConnector::new(broker.clone()));
        let handle = RpcServer::serve(manager(&connector), QUEUE, router(), ServerConfig::default())
            .await
            .unwrap();

        let (client, mut replies) = reply_client(&broker).await;
        let body = RequestEnvelope::new("rpc_missing", Value::Null).encode().unwrap();
        client
            .publish(QUEUE, &body, &MessageProperties::request(CorrelationId::from("c-2"), REPLIES))
            .await
            .unwrap();

        let response = ResponseEnvelope::decode(&next_reply(&mut replies).await.body).unwrap();
        assert!(!response.ok);
        assert_eq!(response.error.as_deref(), Some("Unknown action: rpc_missing"));
        wait_for_stats(&handle, |s| s.failed == 1).await;
    }

    #[tokio::test]
    async fn malformed_body_is_acked_without_reply() {
        let broker = MemoryBroker::new();
        let connector = Arc::new(MemoryConnector::new(broker.clone()));
        let handle = RpcServer::serve(manager(&connector), QUEUE, router(), ServerConfig::default())
            .await
            .unwrap();

        let (client, _replies) = reply_client(&broker).await;
        client
            .publish(QUEUE, b"not json", &MessageProperties::request(CorrelationId::from("c-3"), REPLIES))
            .await
            .unwrap();

        wait_for_stats(&handle, |s| s.discarded == 1).await;
        assert_eq!(handle.stats().replied, 0);
        assert_eq!(broker.ready_count(QUEUE), Some(0));
        assert_eq!(broker.ready_count(REPLIES), Some(0));
    }

    #[tokio::test]
    async fn json_without_action_gets_unknown_action_reply() {
        let broker = MemoryBroker::new();
        let connector = Arc::new(MemoryConnector::new(broker.clone()));
        let handle = RpcServer::serve(manager(&connector), QUEUE, router(), ServerConfig::default())
            .await
            .unwrap();

        let (client, mut replies) = reply_client(&broker).await;
        let bodies: [(&str, &[u8]); 3] = [
            ("c-4", br#"{"data":{"x":1}}"#),
            ("c-5", b"[1,2]"),
            ("c-6", br#"{"action":7}"#),
        ];
        for (id, body) in bodies {
            client
                .publish(QUEUE, body, &MessageProperties::request(CorrelationId::from(id), REPLIES))
                .await
                .unwrap();

            let reply = next_reply(&mut replies).await;
            assert_eq!(reply.properties.correlation_id, Some(CorrelationId::from(id)));
            let response = ResponseEnvelope::decode(&reply.body).unwrap();
            assert_eq!(response, ResponseEnvelope::failure("Unknown action: undefined"));
        }

        wait_for_stats(&handle, |s| s.replied == 3).await;
        let stats = handle.stats();
        assert_eq!(stats.failed, 3);
        assert_eq!(stats.discarded, 0);
        assert_eq!(broker.ready_count(QUEUE), Some(0));
    }

    #[tokio::test]
    async fn one_way_message_is_processed_without_reply() {
        let broker = MemoryBroker::new();
        let connector = Arc::new(MemoryConnector::new(broker.clone()));
        let handle = RpcServer::serve(manager(&connector), QUEUE, router(), ServerConfig::default())
            .await
            .unwrap();

        let client = broker.channel();
        let body = br#"{"type":"user_signed_up","userId":"u1"}"#;
        client
            .publish(QUEUE, body, &MessageProperties::default())
            .await
            .unwrap();

        wait_for_stats(&handle, |s| s.received == 1).await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        let stats = handle.stats();
        assert_eq!(stats.replied, 0);
        assert_eq!(stats.discarded, 0);
        assert_eq!(broker.ready_count(QUEUE), Some(0));
    }

    #[tokio::test]
    async fn resumes_after_connection_loss() {
        let broker = MemoryBroker::new();
        let connector = Arc::new(MemoryConnector::new(broker.clone()));
        let handle = RpcServer::serve(manager(&connector), QUEUE, router(), ServerConfig::default())
            .await
            .unwrap();

        connector.drop_connection();

        let (client, mut replies) = reply_client(&broker).await;
        let body = RequestEnvelope::new("echo", json!("again")).encode().unwrap();
        client
            .publish(QUEUE, &body, &MessageProperties::request(CorrelationId::from("c-4"), REPLIES))
            .await
            .unwrap();

        let response = ResponseEnvelope::decode(&next_reply(&mut replies).await.body).unwrap();
        assert_eq!(response.data, Some(json!("again")));
        assert!(connector.attempts() >= 2);
        drop(handle);
    }

    #[tokio::test]
    async fn dropping_handle_stops_server() {
        let broker = MemoryBroker::new();
        let connector = Arc::new(MemoryConnector::new(broker.clone()));
        let handle = RpcServer::serve(manager(&connector), QUEUE, router(), ServerConfig::default())
            .await
            .unwrap();
        drop(handle);
        tokio::time::sleep(Duration::from_millis(20)).await;

        let client = broker.channel();
        let body = RequestEnvelope::new("echo", Value::Null).encode().unwrap();
        client
            .publish(QUEUE, &body, &MessageProperties::default())
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_eq!(broker.ready_count(QUEUE), Some(1));
    }
}
