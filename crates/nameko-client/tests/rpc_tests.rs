//! End-to-end call lifecycle tests against the in-process broker.
//!
//! A `MemoryBroker` worker stands in for a nameko service, so these tests
//! cover the full path: publish, routing, worker reply, reply dispatch and
//! deadline handling.

use futures::future::join_all;
use nameko_client::transport::{Fault, WorkerHandle};
use nameko_client::{
    Broker, CallEnvelope, ClientConfig, MemoryBroker, MessageMetadata, NamekoClient,
    ReconnectConfig, ResponseEnvelope, RpcError, SessionState,
};
use serde_json::{json, Map, Value};
use std::collections::HashSet;
use std::time::Duration;
use tokio::sync::mpsc;

const EXCHANGE: &str = "nameko-rpc";

/// Worker for the `math` service used throughout these tests.
async fn math_worker(broker: &MemoryBroker) -> WorkerHandle {
    broker
        .spawn_worker(EXCHANGE, "math", |method, call: CallEnvelope| match method {
            "add" => ResponseEnvelope::success(json!(call
                .args
                .iter()
                .filter_map(Value::as_i64)
                .sum::<i64>())),
            "echo" => ResponseEnvelope::success(call.args.first().cloned().unwrap_or(Value::Null)),
            "scale" => {
                let factor = call.kwargs.get("factor").and_then(Value::as_i64).unwrap_or(1);
                let value = call.args.first().and_then(Value::as_i64).unwrap_or(0);
                ResponseEnvelope::success(json!(value * factor))
            }
            "validate" => ResponseEnvelope::failure("ValueError", "bad input"),
            "nothing" => ResponseEnvelope::default(),
            other => ResponseEnvelope::failure("nameko.exceptions.MethodNotFound", other),
        })
        .await
        .expect("Failed to start math worker")
}

async fn connect(broker: &MemoryBroker, config: ClientConfig) -> NamekoClient {
    NamekoClient::builder(config)
        .broker(broker.clone())
        .reconnect_backoff(ReconnectConfig::default().with_jitter(false))
        .connect()
        .await
        .expect("Failed to connect client")
}

async fn wait_for_state(client: &NamekoClient, wanted: SessionState) {
    client
        .subscribe_state()
        .wait_for(|state| *state == wanted)
        .await
        .expect("State channel closed");
}

#[tokio::test]
async fn test_add_publishes_call_and_resolves_result() {
    let broker = MemoryBroker::new();
    let _worker = math_worker(&broker).await;
    let client = connect(&broker, ClientConfig::default()).await;

    let call = client.call("math", "add", vec![json!(2), json!(3)], Map::new());
    let id = call.correlation_id().expect("Call should be published");
    assert_eq!(call.await.unwrap(), json!(5));
    assert_eq!(client.pending_calls(), 0);

    let published = broker
        .published()
        .into_iter()
        .find(|d| d.routing_key == "math.add")
        .expect("Call was not published");
    let body: Value = serde_json::from_slice(&published.body).unwrap();
    assert_eq!(body, json!({"args": [2, 3], "kwargs": {}}));
    assert_eq!(published.metadata.reply_to.as_deref(), Some(client.reply_queue()));
    assert_eq!(published.metadata.correlation_id, Some(id.to_string()));
    assert_eq!(
        published.metadata.content_type.as_deref(),
        Some("application/json")
    );
}

#[tokio::test]
async fn test_kwargs_reach_the_worker() {
    let broker = MemoryBroker::new();
    let _worker = math_worker(&broker).await;
    let client = connect(&broker, ClientConfig::default()).await;

    let mut kwargs = Map::new();
    kwargs.insert("factor".into(), json!(4));
    let result = client.call("math", "scale", vec![json!(10)], kwargs).await;
    assert_eq!(result.unwrap(), json!(40));
}

#[tokio::test]
async fn test_reply_without_result_resolves_null() {
    let broker = MemoryBroker::new();
    let _worker = math_worker(&broker).await;
    let client = connect(&broker, ClientConfig::default()).await;

    let result = client.call("math", "nothing", vec![], Map::new()).await;
    assert_eq!(result.unwrap(), Value::Null);
}

#[tokio::test(start_paused = true)]
async fn test_unanswered_call_times_out() {
    let broker = MemoryBroker::new();
    let client = connect(&broker, ClientConfig::default()).await;
    assert_eq!(client.config().timeout, Duration::from_millis(30_000));

    let started = tokio::time::Instant::now();
    let err = client
        .call("math", "add", vec![json!(2), json!(3)], Map::new())
        .await
        .unwrap_err();

    assert!(started.elapsed() >= Duration::from_millis(30_000));
    assert!(matches!(err, RpcError::Timeout { .. }));
    let wire = err.to_wire();
    assert_eq!(wire["exc_type"], "Timeout");
    assert_eq!(wire["value"], "math.add");
    assert_eq!(client.pending_calls(), 0);
    assert_eq!(client.state(), SessionState::Ready);
}

#[tokio::test]
async fn test_remote_error_rejects_with_path_and_value() {
    let broker = MemoryBroker::new();
    let _worker = math_worker(&broker).await;
    let client = connect(&broker, ClientConfig::default()).await;

    let err = client
        .call("math", "validate", vec![json!("x")], Map::new())
        .await
        .unwrap_err();

    assert!(err.to_string().contains("ValueError: bad input"));
    match &err {
        RpcError::Remote {
            exc_path, value, ..
        } => {
            assert_eq!(exc_path, "ValueError");
            assert_eq!(value, "bad input");
        }
        other => panic!("Expected Remote error, got: {:?}", other),
    }
    assert!(!err.is_session_scoped());

    // Call-scoped errors leave the session usable
    assert_eq!(client.state(), SessionState::Ready);
    let result = client.call("math", "add", vec![json!(1), json!(1)], Map::new()).await;
    assert_eq!(result.unwrap(), json!(2));
}

#[tokio::test(start_paused = true)]
async fn test_late_reply_after_timeout_is_dropped() {
    let broker = MemoryBroker::new();
    let client = connect(
        &broker,
        ClientConfig::default().with_timeout(Duration::from_millis(100)),
    )
    .await;

    let call = client.call("slow", "op", vec![], Map::new());
    let id = call.correlation_id().unwrap();
    assert!(matches!(call.await, Err(RpcError::Timeout { .. })));

    // A worker answering after the deadline
    let (conn, _events) = broker.connect(&ClientConfig::default()).await.unwrap();
    conn.publish(
        EXCHANGE,
        client.reply_queue(),
        serde_json::to_vec(&json!({"result": "too late"})).unwrap(),
        MessageMetadata::for_reply(id.to_string()),
    )
    .await
    .unwrap();
    tokio::time::sleep(Duration::from_millis(10)).await;

    // The reply reached the reply queue and settled nothing
    let late = broker
        .published()
        .into_iter()
        .find(|d| d.routing_key == client.reply_queue())
        .expect("Late reply was not routed");
    assert_eq!(late.metadata.correlation_id, Some(id.to_string()));
    assert_eq!(client.pending_calls(), 0);
    assert_eq!(client.state(), SessionState::Ready);

    // The session keeps serving calls afterwards
    let _worker = math_worker(&broker).await;
    let result = client.call("math", "add", vec![json!(4), json!(4)], Map::new()).await;
    assert_eq!(result.unwrap(), json!(8));
}

#[tokio::test(start_paused = true)]
async fn test_calls_fail_fast_while_reconnecting() {
    let broker = MemoryBroker::new();
    let _worker = math_worker(&broker).await;
    let client = connect(&broker, ClientConfig::default()).await;

    broker.inject(Fault::Connect("ECONNREFUSED".into()));
    broker.sever("broker restart");
    wait_for_state(&client, SessionState::Connecting).await;

    let call = client.call("math", "add", vec![json!(1), json!(2)], Map::new());
    assert!(call.correlation_id().is_none());
    assert!(matches!(
        call.await,
        Err(RpcError::NotReady {
            state: SessionState::Connecting
        })
    ));
    assert_eq!(client.pending_calls(), 0);

    broker.clear_faults();
    client.wait_ready().await.unwrap();
    let _worker = math_worker(&broker).await;
    let result = client.call("math", "add", vec![json!(1), json!(2)], Map::new()).await;
    assert_eq!(result.unwrap(), json!(3));
}

#[tokio::test]
async fn test_concurrent_calls_are_routed_to_their_callers() {
    let broker = MemoryBroker::new();
    let _worker = math_worker(&broker).await;
    let client = connect(&broker, ClientConfig::default()).await;

    let calls: Vec<_> = (0..50)
        .map(|i| client.call("math", "echo", vec![json!(i)], Map::new()))
        .collect();
    let ids: HashSet<_> = calls.iter().filter_map(|c| c.correlation_id()).collect();
    assert_eq!(ids.len(), 50);

    let results = join_all(calls).await;
    for (i, result) in results.into_iter().enumerate() {
        assert_eq!(result.unwrap(), json!(i));
    }
    assert_eq!(client.pending_calls(), 0);
}

#[tokio::test]
async fn test_clones_share_one_session() {
    let broker = MemoryBroker::new();
    let _worker = math_worker(&broker).await;
    let client = connect(&broker, ClientConfig::default()).await;
    let other = client.clone();

    let task = tokio::spawn(async move {
        other
            .call("math", "add", vec![json!(20), json!(22)], Map::new())
            .await
    });
    assert_eq!(task.await.unwrap().unwrap(), json!(42));
    // One connection for the worker, one for the client
    assert_eq!(broker.connection_count(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_reconnect_restores_calls_but_not_in_flight_ones() {
    let broker = MemoryBroker::new();
    let _worker = math_worker(&broker).await;
    let client = connect(
        &broker,
        ClientConfig::default().with_timeout(Duration::from_secs(5)),
    )
    .await;
    let reply_queue = client.reply_queue().to_string();

    // Nobody serves `ghost`, so this call is still in flight at the drop
    let in_flight = client.call("ghost", "op", vec![], Map::new());
    tokio::task::yield_now().await;

    broker.sever("broker restart");
    client
        .subscribe_state()
        .wait_for(|state| !state.is_ready())
        .await
        .unwrap();
    client.wait_ready().await.unwrap();

    assert_eq!(client.reply_queue(), reply_queue);
    assert!(broker.queue_exists(&reply_queue));

    let _worker = math_worker(&broker).await;
    let result = client.call("math", "add", vec![json!(2), json!(3)], Map::new()).await;
    assert_eq!(result.unwrap(), json!(5));

    assert!(matches!(in_flight.await, Err(RpcError::Timeout { .. })));
    assert_eq!(client.pending_calls(), 0);
}

#[tokio::test]
async fn test_connection_loss_without_reconnect_fails_fast() {
    let broker = MemoryBroker::new();
    let (tx, mut errors) = mpsc::unbounded_channel();
    let client = NamekoClient::builder(ClientConfig::default().with_reconnect(false))
        .broker(broker.clone())
        .on_error(move |err| {
            let _ = tx.send(err.clone());
        })
        .connect()
        .await
        .unwrap();

    broker.sever("node down");
    wait_for_state(&client, SessionState::Failed).await;

    match errors.recv().await {
        Some(RpcError::Connection { message }) => assert_eq!(message, "node down"),
        other => panic!("Expected Connection error, got: {:?}", other),
    }

    let result = client.call("math", "add", vec![], Map::new()).await;
    assert!(matches!(
        result,
        Err(RpcError::NotReady {
            state: SessionState::Failed
        })
    ));
    assert!(client.wait_ready().await.is_err());
    assert_eq!(client.pending_calls(), 0);
}

#[tokio::test]
async fn test_dropped_client_leaves_no_broker_state() {
    let broker = MemoryBroker::new();
    let client = connect(&broker, ClientConfig::default()).await;
    let reply_queue = client.reply_queue().to_string();
    assert!(broker.queue_exists(&reply_queue));

    drop(client);
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(broker.connection_count(), 0);
    assert!(!broker.queue_exists(&reply_queue));
}

#[tokio::test]
async fn test_close_leaves_in_flight_calls_to_their_deadline() {
    let broker = MemoryBroker::new();
    let client = connect(
        &broker,
        ClientConfig::default().with_timeout(Duration::from_millis(50)),
    )
    .await;

    let in_flight = client.call("ghost", "op", vec![], Map::new());
    tokio::task::yield_now().await;
    client.close().await;

    assert_eq!(client.state(), SessionState::Closed);
    assert!(!broker.queue_exists(client.reply_queue()));
    assert!(matches!(in_flight.await, Err(RpcError::Timeout { .. })));
}
