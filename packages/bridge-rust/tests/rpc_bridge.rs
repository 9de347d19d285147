//! End-to-end publisher/server behavior over the in-memory broker.

use std::sync::Arc;
use std::time::Duration;

use courier_bridge::broker::{Broker, ConsumeOptions, Connector, MemoryBroker, MemoryConnector};
use courier_bridge::{
    ActionRouter, BrokerConfig, ConnectionManager, EventBridge, EventConfig, PublisherConfig,
    RpcError, RpcPublisher, RpcServer, ServerConfig, ServerHandle,
};
use courier_core::{handler_fn, typed, MessageProperties, RequestEnvelope};
use futures_util::StreamExt;
use serde::Deserialize;
use serde_json::{json, Value};

const QUEUE: &str = "user_service_queue";

struct Harness {
    broker: MemoryBroker,
    connector: Arc<MemoryConnector>,
    manager: Arc<ConnectionManager>,
}

fn harness() -> Harness {
    let broker = MemoryBroker::new();
    let connector = Arc::new(MemoryConnector::new(broker.clone()));
    let dyn_connector: Arc<dyn Connector> = Arc::clone(&connector) as Arc<dyn Connector>;
    let manager = Arc::new(ConnectionManager::new(
        dyn_connector,
        BrokerConfig {
            url: "memory://".to_string(),
            retry_interval: Duration::from_millis(10),
            max_backoff: Duration::from_millis(20),
            backoff_multiplier: 2.0,
        },
    ));
    Harness {
        broker,
        connector,
        manager,
    }
}

#[derive(Deserialize)]
struct AddRequest {
    a: i64,
    b: i64,
}

fn router() -> ActionRouter {
    ActionRouter::builder()
        .register("rpc_echo", handler_fn(|data| async move { Ok(data) }))
        .unwrap()
        .register(
            "rpc_fail",
            handler_fn(|_| async { Err::<Value, _>(anyhow::anyhow!("boom")) }),
        )
        .unwrap()
        .register(
            "rpc_add",
            typed(|req: AddRequest| async move { Ok(req.a + req.b) }),
        )
        .unwrap()
        .require(&["rpc_echo", "rpc_add"])
        .unwrap()
        .build()
}

async fn serve(h: &Harness) -> ServerHandle {
    RpcServer::serve(Arc::clone(&h.manager), QUEUE, router(), ServerConfig::default())
        .await
        .unwrap()
}

async fn publisher(h: &Harness, default_timeout: Duration) -> RpcPublisher {
    RpcPublisher::initialize(
        Arc::clone(&h.manager),
        PublisherConfig {
            request_queues: vec![QUEUE.to_string()],
            default_timeout,
        },
    )
    .await
    .unwrap()
}

async fn eventually(what: &str, check: impl Fn() -> bool) {
    tokio::time::timeout(Duration::from_secs(2), async {
        while !check() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("timed out waiting for {what}"));
}

#[tokio::test]
async fn round_trip_returns_handler_result() {
    let h = harness();
    let _server = serve(&h).await;
    let publisher = publisher(&h, Duration::from_secs(2)).await;

    let echoed = publisher
        .invoke(QUEUE, "rpc_echo", json!({"userId": "u1"}))
        .await
        .unwrap();
    assert_eq!(echoed, json!({"userId": "u1"}));

    let sum = publisher
        .invoke(QUEUE, "rpc_add", json!({"a": 2, "b": 40}))
        .await
        .unwrap();
    assert_eq!(sum, json!(42));
    assert_eq!(publisher.pending_count(), 0);
}

#[tokio::test]
async fn call_returns_full_response_envelope() {
    let h = harness();
    let _server = serve(&h).await;
    let publisher = publisher(&h, Duration::from_secs(2)).await;

    let reply = publisher
        .call(
            QUEUE,
            &RequestEnvelope::new("rpc_echo", json!([1, 2, 3])),
            Duration::from_secs(2),
        )
        .await
        .unwrap();
    assert!(reply.ok);
    assert_eq!(reply.data, Some(json!([1, 2, 3])));
    assert_eq!(reply.error, None);
}

#[tokio::test]
async fn unknown_action_is_reported_to_caller() {
    let h = harness();
    let server = serve(&h).await;
    let publisher = publisher(&h, Duration::from_secs(2)).await;

    let err = publisher
        .invoke(QUEUE, "rpc_does_not_exist", Value::Null)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        RpcError::Remote(ref message) if message == "Unknown action: rpc_does_not_exist"
    ));

    eventually("failed counter", || server.stats().failed == 1).await;
    assert_eq!(h.broker.ready_count(QUEUE), Some(0));
}

#[tokio::test]
async fn call_without_server_times_out_and_clears_entry() {
    let h = harness();
    let publisher = publisher(&h, Duration::from_secs(2)).await;

    let started = tokio::time::Instant::now();
    let err = publisher
        .call(
            QUEUE,
            &RequestEnvelope::new("rpc_echo", Value::Null),
            Duration::from_millis(50),
        )
        .await
        .unwrap_err();

    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_millis(50));
    assert!(elapsed < Duration::from_millis(550), "timed out late: {elapsed:?}");
    assert_eq!(err.to_string(), format!("RPC timeout after 50ms on queue {QUEUE}"));
    assert_eq!(publisher.pending_count(), 0);
    // The request itself was delivered and is waiting for a consumer.
    assert_eq!(h.broker.ready_count(QUEUE), Some(1));
}

#[tokio::test]
async fn handler_error_does_not_stop_the_server() {
    let h = harness();
    let server = serve(&h).await;
    let publisher = publisher(&h, Duration::from_secs(2)).await;

    let err = publisher
        .invoke(QUEUE, "rpc_fail", Value::Null)
        .await
        .unwrap_err();
    assert_eq!(err.to_string(), "boom");

    let bad_payload = publisher
        .invoke(QUEUE, "rpc_add", json!({"a": "two"}))
        .await
        .unwrap_err();
    assert!(bad_payload
        .to_string()
        .contains("invalid data for action `rpc_add`"));

    let next = publisher
        .invoke(QUEUE, "rpc_echo", json!("still alive"))
        .await
        .unwrap();
    assert_eq!(next, json!("still alive"));

    let stats = server.stats();
    assert_eq!(stats.failed, 2);
    assert_eq!(stats.received, 3);
}

#[tokio::test]
async fn malformed_request_is_acked_and_discarded() {
    let h = harness();
    let server = serve(&h).await;
    let publisher = publisher(&h, Duration::from_secs(2)).await;

    let raw = h.broker.channel();
    let properties = MessageProperties::request("manual-1".into(), publisher.reply_queue());
    raw.publish(QUEUE, b"{not json", &properties).await.unwrap();

    eventually("discarded counter", || server.stats().discarded == 1).await;
    assert_eq!(raw.message_count(QUEUE).await.unwrap(), 0);
    assert_eq!(server.stats().replied, 0);

    let echoed = publisher
        .invoke(QUEUE, "rpc_echo", json!("after garbage"))
        .await
        .unwrap();
    assert_eq!(echoed, json!("after garbage"));
}

#[tokio::test]
async fn request_without_action_is_answered_promptly() {
    let h = harness();
    let server = serve(&h).await;
    let publisher = publisher(&h, Duration::from_secs(2)).await;

    let started = tokio::time::Instant::now();
    let reply = publisher
        .call(QUEUE, &json!({"data": {"x": 1}}), Duration::from_secs(2))
        .await
        .unwrap();
    assert!(!reply.ok);
    assert_eq!(reply.error.as_deref(), Some("Unknown action: undefined"));

    let reply = publisher
        .call(QUEUE, &json!([1, 2]), Duration::from_secs(2))
        .await
        .unwrap();
    assert_eq!(reply.error.as_deref(), Some("Unknown action: undefined"));
    assert!(started.elapsed() < Duration::from_secs(1));

    eventually("failed counter", || server.stats().failed == 2).await;
    assert_eq!(server.stats().discarded, 0);
}

#[tokio::test]
async fn legacy_type_envelope_is_dispatched() {
    let h = harness();
    let _server = serve(&h).await;
    let publisher = publisher(&h, Duration::from_secs(2)).await;

    let reply = publisher
        .call(
            QUEUE,
            &json!({"type": "rpc_add", "a": 1, "b": 2}),
            Duration::from_secs(2),
        )
        .await
        .unwrap();
    assert_eq!(reply.data, Some(json!(3)));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_calls_get_their_own_replies() {
    let h = harness();
    let _server = serve(&h).await;
    let publisher = Arc::new(publisher(&h, Duration::from_secs(5)).await);

    let calls: Vec<_> = (0..50)
        .map(|i| {
            let publisher = Arc::clone(&publisher);
            tokio::spawn(async move {
                let out = publisher
                    .invoke(QUEUE, "rpc_echo", json!({ "i": i }))
                    .await
                    .unwrap();
                (i, out)
            })
        })
        .collect();

    for call in calls {
        let (i, out) = call.await.unwrap();
        assert_eq!(out, json!({ "i": i }));
    }
    assert_eq!(publisher.pending_count(), 0);
}

#[tokio::test]
async fn duplicate_reply_is_ignored() {
    let h = harness();
    let publisher = Arc::new(publisher(&h, Duration::from_secs(2)).await);

    // Stand-in server that answers the same request twice.
    let fake = h.broker.channel();
    let mut requests = fake.consume(QUEUE, ConsumeOptions::manual(1)).await.unwrap();

    let call = {
        let publisher = Arc::clone(&publisher);
        tokio::spawn(async move { publisher.invoke(QUEUE, "rpc_echo", json!(1)).await })
    };

    let request = requests.next().await.unwrap().unwrap();
    assert!(request.properties.persistent);
    let reply_to = request.properties.reply_to.clone().unwrap();
    assert_eq!(reply_to, publisher.reply_queue());
    let envelope = RequestEnvelope::decode(&request.body).unwrap();
    assert_eq!(envelope, RequestEnvelope::new("rpc_echo", json!(1)));

    let reply = MessageProperties::reply(request.properties.correlation_id.clone());
    fake.publish(&reply_to, br#"{"ok":true,"data":"first"}"#, &reply)
        .await
        .unwrap();
    fake.publish(&reply_to, br#"{"ok":true,"data":"second"}"#, &reply)
        .await
        .unwrap();
    fake.ack(request.delivery_tag).await.unwrap();

    assert_eq!(call.await.unwrap().unwrap(), json!("first"));
    assert_eq!(publisher.pending_count(), 0);

    // An orphan reply for an id nobody issued is dropped as well.
    let orphan = MessageProperties::reply(Some("never-issued".into()));
    fake.publish(&reply_to, br#"{"ok":true}"#, &orphan)
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(publisher.pending_count(), 0);
}

#[tokio::test]
async fn fire_and_forget_entries_expire() {
    let h = harness();
    let publisher = Arc::new(publisher(&h, Duration::from_secs(2)).await);
    let events = EventBridge::new(
        Arc::clone(&publisher),
        EventConfig {
            event_timeout: Duration::from_millis(40),
        },
    );

    for n in 0..5 {
        drop(events.emit("notification_queue", "user_signed_up", json!({ "n": n })));
    }
    eventually("events to be registered", || publisher.pending_count() == 5).await;
    eventually("events to expire", || publisher.pending_count() == 0).await;
}

#[tokio::test]
async fn event_is_delivered_to_rpc_server() {
    let h = harness();
    let server = serve(&h).await;
    let publisher = Arc::new(publisher(&h, Duration::from_secs(2)).await);
    let events = EventBridge::new(Arc::clone(&publisher), EventConfig::default());

    let reply = events
        .emit(QUEUE, "rpc_echo", json!({"kind": "signup"}))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(reply.data, Some(json!({"kind": "signup"})));
    assert_eq!(server.stats().replied, 1);
}

#[tokio::test]
async fn publisher_and_server_recover_from_connection_loss() {
    let h = harness();
    let _server = serve(&h).await;
    let publisher = publisher(&h, Duration::from_secs(2)).await;

    assert_eq!(
        publisher.invoke(QUEUE, "rpc_echo", json!("before")).await.unwrap(),
        json!("before")
    );
    let old_reply_queue = publisher.reply_queue();

    h.connector.drop_connection();
    eventually("reply queue to be redeclared", || {
        publisher.reply_queue() != old_reply_queue
    })
    .await;
    assert!(!h.broker.queue_exists(&old_reply_queue));

    assert_eq!(
        publisher.invoke(QUEUE, "rpc_echo", json!("after")).await.unwrap(),
        json!("after")
    );
    assert!(h.connector.attempts() >= 2);
    assert!(h.manager.connections() >= 2);
}

#[tokio::test]
async fn initialize_waits_for_unreachable_broker() {
    let h = harness();
    h.connector.fail_next(3);

    let publisher = publisher(&h, Duration::from_secs(2)).await;

    assert_eq!(h.connector.attempts(), 4);
    assert!(h.broker.queue_exists(QUEUE));
    assert!(h.broker.queue_exists(&publisher.reply_queue()));
}
