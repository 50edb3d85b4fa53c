//! In-process topic exchange broker.
//!
//! Emulates the parts of an AMQP broker the client relies on: durable topic
//! exchanges, exclusive queues that vanish with their connection, topic
//! bindings with `*`/`#` wildcards and push consumers. Faults can be injected
//! per bootstrap step, and [`MemoryBroker::sever`] drops every live
//! connection to exercise reconnect handling.
//!
//! [`MemoryBroker::spawn_worker`] attaches a nameko-style service worker that
//! answers calls on `service.*`.

use super::{
    Broker, BrokerConnection, DeliveryHandler, ExchangeOptions, QueueOptions, TransportError,
    TransportEvent, TransportEvents, TransportResult,
};
use crate::config::ClientConfig;
use crate::protocol::{CallEnvelope, Delivery, MessageMetadata, ResponseEnvelope};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// A failure the broker will report until cleared.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Fault {
    Connect(String),
    Exchange(String),
    Queue(String),
    Publish(String),
}

#[derive(Debug, Default)]
struct Faults {
    connect: Option<String>,
    exchange: Option<String>,
    queue: Option<String>,
    publish: Option<String>,
}

#[derive(Debug)]
struct QueueEntry {
    /// Owning connection for exclusive queues.
    owner: Option<u64>,
    /// `(exchange, pattern)` pairs.
    bindings: Vec<(String, String)>,
    tx: mpsc::UnboundedSender<Delivery>,
    rx: Option<mpsc::UnboundedReceiver<Delivery>>,
    consumer: Option<(u64, JoinHandle<()>)>,
}

impl QueueEntry {
    fn new(owner: Option<u64>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            owner,
            bindings: Vec::new(),
            tx,
            rx: Some(rx),
            consumer: None,
        }
    }

    /// Stop the consumer and make the queue consumable again.
    fn detach_consumer(&mut self) {
        if let Some((_, handle)) = self.consumer.take() {
            handle.abort();
        }
        let (tx, rx) = mpsc::unbounded_channel();
        self.tx = tx;
        self.rx = Some(rx);
    }
}

/// Messages kept by [`MemoryBroker::published`] unless configured otherwise.
pub const DEFAULT_PUBLISHED_CAPACITY: usize = 1024;

#[derive(Debug)]
struct BrokerState {
    exchanges: HashMap<String, ExchangeOptions>,
    queues: HashMap<String, QueueEntry>,
    connections: HashMap<u64, mpsc::UnboundedSender<TransportEvent>>,
    next_connection: u64,
    faults: Faults,
    /// Most recent messages, oldest first.
    published: VecDeque<Delivery>,
    published_capacity: usize,
}

impl Default for BrokerState {
    fn default() -> Self {
        Self {
            exchanges: HashMap::new(),
            queues: HashMap::new(),
            connections: HashMap::new(),
            next_connection: 0,
            faults: Faults::default(),
            published: VecDeque::new(),
            published_capacity: DEFAULT_PUBLISHED_CAPACITY,
        }
    }
}

impl BrokerState {
    fn ensure_open(&self, connection: u64) -> TransportResult<()> {
        if self.connections.contains_key(&connection) {
            Ok(())
        } else {
            Err(TransportError::new("connection closed"))
        }
    }

    fn drop_connection(&mut self, connection: u64) {
        self.connections.remove(&connection);

        self.queues.retain(|name, queue| {
            if queue.owner == Some(connection) {
                debug!("Deleting exclusive queue {}", name);
                if let Some((_, handle)) = queue.consumer.take() {
                    handle.abort();
                }
                return false;
            }
            if matches!(queue.consumer, Some((owner, _)) if owner == connection) {
                queue.detach_consumer();
            }
            true
        });
    }

    fn record(&mut self, delivery: Delivery) {
        if self.published_capacity == 0 {
            return;
        }
        while self.published.len() >= self.published_capacity {
            self.published.pop_front();
        }
        self.published.push_back(delivery);
    }

    fn route(&mut self, exchange: &str, delivery: Delivery) -> TransportResult<usize> {
        if !self.exchanges.contains_key(exchange) {
            return Err(TransportError::new(format!(
                "NOT_FOUND - no exchange '{}'",
                exchange
            )));
        }

        let mut routed = 0;
        for queue in self.queues.values() {
            let bound = queue
                .bindings
                .iter()
                .any(|(ex, pattern)| ex == exchange && topic_matches(pattern, &delivery.routing_key));
            if bound && queue.tx.send(delivery.clone()).is_ok() {
                routed += 1;
            }
        }
        if routed == 0 {
            debug!("Message to {} was unroutable, dropping", delivery.routing_key);
        }
        self.record(delivery);
        Ok(routed)
    }
}

/// Shared in-process broker. Clones refer to the same broker.
#[derive(Debug, Clone, Default)]
pub struct MemoryBroker {
    state: Arc<Mutex<BrokerState>>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Keep at most `capacity` published messages (0 keeps none).
    pub fn with_published_capacity(self, capacity: usize) -> Self {
        {
            let mut state = self.lock();
            state.published_capacity = capacity;
            while state.published.len() > capacity {
                state.published.pop_front();
            }
        }
        self
    }

    fn lock(&self) -> MutexGuard<'_, BrokerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Make the matching primitive fail until [`clear_faults`](Self::clear_faults).
    pub fn inject(&self, fault: Fault) {
        let mut state = self.lock();
        match fault {
            Fault::Connect(msg) => state.faults.connect = Some(msg),
            Fault::Exchange(msg) => state.faults.exchange = Some(msg),
            Fault::Queue(msg) => state.faults.queue = Some(msg),
            Fault::Publish(msg) => state.faults.publish = Some(msg),
        }
    }

    pub fn clear_faults(&self) {
        self.lock().faults = Faults::default();
    }

    /// Drop every live connection, as if the broker restarted.
    pub fn sever(&self, reason: &str) {
        let mut state = self.lock();
        let ids: Vec<u64> = state.connections.keys().copied().collect();
        for id in ids {
            if let Some(events) = state.connections.get(&id) {
                let _ = events.send(TransportEvent::Closed {
                    reason: reason.to_string(),
                });
            }
            state.drop_connection(id);
        }
        warn!("Severed all broker connections: {}", reason);
    }

    pub fn connection_count(&self) -> usize {
        self.lock().connections.len()
    }

    pub fn queue_exists(&self, name: &str) -> bool {
        self.lock().queues.contains_key(name)
    }

    /// The most recently published messages, oldest first.
    pub fn published(&self) -> Vec<Delivery> {
        self.lock().published.iter().cloned().collect()
    }

    /// Attach a worker answering calls to `service.*` on `exchange`.
    ///
    /// `handler` receives the method name and decoded call body.
    pub async fn spawn_worker<F>(
        &self,
        exchange: &str,
        service: &str,
        handler: F,
    ) -> TransportResult<WorkerHandle>
    where
        F: Fn(&str, CallEnvelope) -> ResponseEnvelope + Send + Sync + 'static,
    {
        let connection = self.open_connection()?;
        let queue = format!("rpc-{}", service);

        connection
            .declare_exchange(exchange, ExchangeOptions::default())
            .await?;
        connection.declare_queue(&queue, QueueOptions::default()).await?;
        connection
            .bind_queue(&queue, exchange, &format!("{}.*", service))
            .await?;

        let broker = self.clone();
        let reply_exchange = exchange.to_string();
        let prefix = format!("{}.", service);
        let on_call: DeliveryHandler = Arc::new(move |delivery: Delivery| {
            let method = delivery
                .routing_key
                .strip_prefix(&prefix)
                .unwrap_or(&delivery.routing_key)
                .to_string();
            let response = match serde_json::from_slice::<CallEnvelope>(&delivery.body) {
                Ok(call) => handler(&method, call),
                Err(e) => ResponseEnvelope::failure("nameko.exceptions.MalformedRequest", e.to_string()),
            };

            let (Some(reply_to), Some(correlation_id)) = (
                delivery.metadata.reply_to.clone(),
                delivery.metadata.correlation_id.clone(),
            ) else {
                warn!("Worker received call without reply address, ignoring");
                return;
            };

            let body = match serde_json::to_vec(&response) {
                Ok(body) => body,
                Err(e) => {
                    warn!("Worker failed to encode reply: {}", e);
                    return;
                }
            };
            let reply = Delivery {
                routing_key: reply_to,
                body,
                metadata: MessageMetadata::for_reply(correlation_id),
            };
            if let Err(e) = broker.lock().route(&reply_exchange, reply) {
                warn!("Worker failed to publish reply: {}", e);
            }
        });

        connection.subscribe(&queue, on_call).await?;
        debug!("Worker for {} attached to {}", service, queue);

        Ok(WorkerHandle { connection })
    }

    fn open_connection(&self) -> TransportResult<Arc<MemoryConnection>> {
        self.open_connection_with_events().map(|(conn, _)| conn)
    }

    fn open_connection_with_events(&self) -> TransportResult<(Arc<MemoryConnection>, TransportEvents)> {
        let mut state = self.lock();
        if let Some(msg) = &state.faults.connect {
            return Err(TransportError::new(msg.clone()));
        }

        state.next_connection += 1;
        let id = state.next_connection;
        let (tx, rx) = mpsc::unbounded_channel();
        state.connections.insert(id, tx);

        let connection = Arc::new(MemoryConnection {
            broker: self.clone(),
            id,
        });
        Ok((connection, rx))
    }
}

#[async_trait::async_trait]
impl Broker for MemoryBroker {
    async fn connect(
        &self,
        _config: &ClientConfig,
    ) -> TransportResult<(Arc<dyn BrokerConnection>, TransportEvents)> {
        let (connection, events) = self.open_connection_with_events()?;
        let connection: Arc<dyn BrokerConnection> = connection;
        Ok((connection, events))
    }
}

/// A connection to a [`MemoryBroker`].
#[derive(Debug)]
pub struct MemoryConnection {
    broker: MemoryBroker,
    id: u64,
}

#[async_trait::async_trait]
impl BrokerConnection for MemoryConnection {
    async fn declare_exchange(&self, name: &str, options: ExchangeOptions) -> TransportResult<()> {
        let mut state = self.broker.lock();
        state.ensure_open(self.id)?;
        if let Some(msg) = &state.faults.exchange {
            return Err(TransportError::new(msg.clone()));
        }

        match state.exchanges.get(name) {
            Some(existing) if *existing != options => Err(TransportError::new(format!(
                "PRECONDITION_FAILED - inequivalent arguments for exchange '{}'",
                name
            ))),
            Some(_) => Ok(()),
            None => {
                state.exchanges.insert(name.to_string(), options);
                Ok(())
            }
        }
    }

    async fn declare_queue(&self, name: &str, options: QueueOptions) -> TransportResult<()> {
        let mut state = self.broker.lock();
        state.ensure_open(self.id)?;
        if let Some(msg) = &state.faults.queue {
            return Err(TransportError::new(msg.clone()));
        }

        match state.queues.get(name) {
            Some(queue) if queue.owner.is_some_and(|owner| owner != self.id) => {
                Err(TransportError::new(format!(
                    "RESOURCE_LOCKED - queue '{}' is exclusive to another connection",
                    name
                )))
            }
            Some(_) => Ok(()),
            None => {
                let owner = options.exclusive.then_some(self.id);
                state.queues.insert(name.to_string(), QueueEntry::new(owner));
                Ok(())
            }
        }
    }

    async fn bind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> TransportResult<()> {
        let mut state = self.broker.lock();
        state.ensure_open(self.id)?;
        if !state.exchanges.contains_key(exchange) {
            return Err(TransportError::new(format!(
                "NOT_FOUND - no exchange '{}'",
                exchange
            )));
        }
        let entry = state
            .queues
            .get_mut(queue)
            .ok_or_else(|| TransportError::new(format!("NOT_FOUND - no queue '{}'", queue)))?;

        let binding = (exchange.to_string(), routing_key.to_string());
        if !entry.bindings.contains(&binding) {
            entry.bindings.push(binding);
        }
        Ok(())
    }

    async fn subscribe(&self, queue: &str, handler: DeliveryHandler) -> TransportResult<String> {
        let mut state = self.broker.lock();
        state.ensure_open(self.id)?;
        let entry = state
            .queues
            .get_mut(queue)
            .ok_or_else(|| TransportError::new(format!("NOT_FOUND - no queue '{}'", queue)))?;
        let mut rx = entry
            .rx
            .take()
            .ok_or_else(|| TransportError::new(format!("queue '{}' already has a consumer", queue)))?;

        let consumer = tokio::spawn(async move {
            while let Some(delivery) = rx.recv().await {
                handler(delivery);
            }
        });
        entry.consumer = Some((self.id, consumer));

        Ok(format!("memory-ctag-{}-{}", self.id, queue))
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: Vec<u8>,
        metadata: MessageMetadata,
    ) -> TransportResult<()> {
        let mut state = self.broker.lock();
        state.ensure_open(self.id)?;
        if let Some(msg) = &state.faults.publish {
            return Err(TransportError::new(msg.clone()));
        }

        let delivery = Delivery {
            routing_key: routing_key.to_string(),
            body,
            metadata,
        };
        state.route(exchange, delivery).map(|_| ())
    }

    async fn close(&self) -> TransportResult<()> {
        self.broker.lock().drop_connection(self.id);
        Ok(())
    }
}

impl Drop for MemoryConnection {
    fn drop(&mut self) {
        self.broker.lock().drop_connection(self.id);
    }
}

/// Handle to a worker attached with [`MemoryBroker::spawn_worker`].
#[derive(Debug)]
pub struct WorkerHandle {
    connection: Arc<MemoryConnection>,
}

impl WorkerHandle {
    /// Detach the worker. Its queue stays bound and buffers further calls.
    pub async fn stop(self) -> TransportResult<()> {
        self.connection.close().await
    }
}

/// AMQP topic matching: `*` matches one word, `#` matches zero or more.
pub fn topic_matches(pattern: &str, routing_key: &str) -> bool {
    let pattern: Vec<&str> = pattern.split('.').collect();
    let key: Vec<&str> = routing_key.split('.').collect();
    match_words(&pattern, &key)
}

fn match_words(pattern: &[&str], key: &[&str]) -> bool {
    match pattern.split_first() {
        None => key.is_empty(),
        Some((&"#", rest)) => (0..=key.len()).any(|skip| match_words(rest, &key[skip..])),
        Some((&word, rest)) => match key.split_first() {
            Some((&head, tail)) if word == "*" || word == head => match_words(rest, tail),
            _ => false,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_topic_matching() {
        assert!(topic_matches("math.add", "math.add"));
        assert!(topic_matches("math.*", "math.add"));
        assert!(!topic_matches("math.*", "math.add.extra"));
        assert!(topic_matches("math.#", "math.add.extra"));
        assert!(topic_matches("#", "anything.at.all"));
        assert!(topic_matches("#.add", "math.add"));
        assert!(!topic_matches("math.add", "math.sub"));
        assert!(!topic_matches("*.add", "add"));
    }

    #[tokio::test]
    async fn test_publish_routes_to_bound_queue() {
        let broker = MemoryBroker::new();
        let (conn, _events) = broker.connect(&ClientConfig::default()).await.unwrap();

        conn.declare_exchange("ex", ExchangeOptions::default()).await.unwrap();
        conn.declare_queue("q", QueueOptions::default()).await.unwrap();
        conn.bind_queue("q", "ex", "svc.*").await.unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel();
        conn.subscribe(
            "q",
            Arc::new(move |d: Delivery| {
                let _ = tx.send(d);
            }),
        )
        .await
        .unwrap();

        conn.publish("ex", "svc.ping", b"{}".to_vec(), MessageMetadata::default())
            .await
            .unwrap();
        conn.publish("ex", "other.ping", b"{}".to_vec(), MessageMetadata::default())
            .await
            .unwrap();

        let delivery = rx.recv().await.unwrap();
        assert_eq!(delivery.routing_key, "svc.ping");
        assert!(rx.try_recv().is_err());
        assert_eq!(broker.published().len(), 2);
    }

    #[tokio::test]
    async fn test_published_log_keeps_most_recent() {
        let broker = MemoryBroker::new().with_published_capacity(3);
        let (conn, _events) = broker.connect(&ClientConfig::default()).await.unwrap();
        conn.declare_exchange("ex", ExchangeOptions::default()).await.unwrap();

        for i in 0..5 {
            conn.publish("ex", &format!("svc.m{}", i), Vec::new(), MessageMetadata::default())
                .await
                .unwrap();
        }

        let keys: Vec<_> = broker.published().into_iter().map(|d| d.routing_key).collect();
        assert_eq!(keys, vec!["svc.m2", "svc.m3", "svc.m4"]);
    }

    #[tokio::test]
    async fn test_zero_capacity_records_nothing() {
        let broker = MemoryBroker::new().with_published_capacity(0);
        let (conn, _events) = broker.connect(&ClientConfig::default()).await.unwrap();
        conn.declare_exchange("ex", ExchangeOptions::default()).await.unwrap();
        conn.publish("ex", "svc.m", Vec::new(), MessageMetadata::default())
            .await
            .unwrap();
        assert!(broker.published().is_empty());
    }

    #[tokio::test]
    async fn test_dropping_connection_releases_exclusive_queue() {
        let broker = MemoryBroker::new();
        let (conn, _events) = broker.connect(&ClientConfig::default()).await.unwrap();
        conn.declare_queue("reply", QueueOptions { exclusive: true }).await.unwrap();
        assert_eq!(broker.connection_count(), 1);

        drop(conn);

        assert_eq!(broker.connection_count(), 0);
        assert!(!broker.queue_exists("reply"));
    }

    #[tokio::test]
    async fn test_publish_to_missing_exchange_fails() {
        let broker = MemoryBroker::new();
        let (conn, _events) = broker.connect(&ClientConfig::default()).await.unwrap();
        let result = conn
            .publish("nope", "a.b", Vec::new(), MessageMetadata::default())
            .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_exclusive_queue_is_locked_and_removed_on_close() {
        let broker = MemoryBroker::new();
        let (a, _ea) = broker.connect(&ClientConfig::default()).await.unwrap();
        let (b, _eb) = broker.connect(&ClientConfig::default()).await.unwrap();

        a.declare_queue("reply", QueueOptions { exclusive: true }).await.unwrap();
        assert!(b.declare_queue("reply", QueueOptions { exclusive: true }).await.is_err());

        a.close().await.unwrap();
        assert!(!broker.queue_exists("reply"));
        assert!(b.declare_queue("reply", QueueOptions { exclusive: true }).await.is_ok());
    }

    #[tokio::test]
    async fn test_exchange_redeclare_with_different_flags_fails() {
        let broker = MemoryBroker::new();
        let (conn, _events) = broker.connect(&ClientConfig::default()).await.unwrap();
        conn.declare_exchange("ex", ExchangeOptions::default()).await.unwrap();
        let result = conn
            .declare_exchange(
                "ex",
                ExchangeOptions {
                    durable: false,
                    auto_delete: true,
                },
            )
            .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_injected_connect_fault() {
        let broker = MemoryBroker::new();
        broker.inject(Fault::Connect("ECONNREFUSED".into()));
        let err = broker.connect(&ClientConfig::default()).await.err().unwrap();
        assert_eq!(err.message, "ECONNREFUSED");

        broker.clear_faults();
        assert!(broker.connect(&ClientConfig::default()).await.is_ok());
    }

    #[tokio::test]
    async fn test_sever_emits_closed_and_closes_connections() {
        let broker = MemoryBroker::new();
        let (conn, mut events) = broker.connect(&ClientConfig::default()).await.unwrap();

        broker.sever("broker restart");

        assert_eq!(
            events.recv().await,
            Some(TransportEvent::Closed {
                reason: "broker restart".into()
            })
        );
        assert_eq!(broker.connection_count(), 0);
        assert!(conn
            .declare_exchange("ex", ExchangeOptions::default())
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_worker_replies_to_reply_queue() {
        let broker = MemoryBroker::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = calls.clone();
        let _worker = broker
            .spawn_worker("ex", "math", move |method, call| {
                seen.fetch_add(1, Ordering::SeqCst);
                assert_eq!(method, "add");
                let sum: i64 = call.args.iter().filter_map(|v| v.as_i64()).sum();
                ResponseEnvelope::success(json!(sum))
            })
            .await
            .unwrap();

        let (conn, _events) = broker.connect(&ClientConfig::default()).await.unwrap();
        conn.declare_queue("replies", QueueOptions { exclusive: true }).await.unwrap();
        conn.bind_queue("replies", "ex", "replies").await.unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        conn.subscribe(
            "replies",
            Arc::new(move |d: Delivery| {
                let _ = tx.send(d);
            }),
        )
        .await
        .unwrap();

        let metadata = MessageMetadata {
            reply_to: Some("replies".into()),
            correlation_id: Some("cid-1".into()),
            ..Default::default()
        };
        conn.publish("ex", "math.add", br#"{"args":[2,3],"kwargs":{}}"#.to_vec(), metadata)
            .await
            .unwrap();

        let reply = rx.recv().await.unwrap();
        assert_eq!(reply.metadata.correlation_id.as_deref(), Some("cid-1"));
        let body: ResponseEnvelope = serde_json::from_slice(&reply.body).unwrap();
        assert_eq!(body.result, Some(json!(5)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
