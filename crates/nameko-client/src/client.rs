//! RPC client for nameko services.
//!
//! `NamekoClient::call()` returns immediately with an [`RpcCall`] future. By
//! then the call is registered in the correlation table, its deadline is
//! armed and the publish is in flight. The reply queue consumer settles the
//! call through [`handle_reply`]; the deadline task settles it with a
//! `Timeout`. Whichever claims the table entry first wins.
//!
//! # Thread Safety
//!
//! The client is a cheap handle (`Arc` inside) and can be cloned into as many
//! tasks as needed. The correlation table is the only shared mutable state
//! and is guarded by a mutex.

use crate::config::{ClientConfig, ReconnectConfig};
use crate::correlation::{CorrelationId, CorrelationTable, PendingCall};
use crate::error::{Result, RpcError};
use crate::protocol::{routing_key, CallEnvelope, Delivery, MessageMetadata, ResponseEnvelope};
use crate::session::{log_errors, ErrorHandler, Session, SessionState};
use crate::transport::{Broker, DeliveryHandler};
use serde_json::{Map, Value};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::sync::{oneshot, watch};
use tracing::{debug, error, Instrument};

/// What the dispatcher did with an inbound reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Dispatch {
    /// Settled the call with this id.
    Resolved(CorrelationId),
    /// No pending call matched; the reply was dropped.
    Unknown(String),
    /// Matched a call but the body could not be decoded; the call was rejected.
    Malformed(CorrelationId),
}

/// Settle the pending call a reply belongs to.
///
/// Replies for ids that already timed out (or never existed) are logged and
/// dropped.
pub fn handle_reply(table: &CorrelationTable, delivery: Delivery) -> Dispatch {
    let raw_id = delivery.metadata.correlation_id.unwrap_or_default();
    let claimed = CorrelationId::parse(&raw_id).and_then(|id| table.claim(&id).map(|call| (id, call)));

    let Some((id, call)) = claimed else {
        error!("[{}] Received response with unknown cid!", raw_id);
        return Dispatch::Unknown(raw_id);
    };

    debug!("[{}] Received response for {}", id, call.target());
    match serde_json::from_slice::<ResponseEnvelope>(&delivery.body) {
        Ok(response) => {
            if !call.settle(response.into_result()) {
                debug!("[{}] Caller went away before the response arrived", id);
            }
            Dispatch::Resolved(id)
        }
        Err(e) => {
            error!("[{}] Malformed response body: {}", id, e);
            call.settle(Err(RpcError::from(e)));
            Dispatch::Malformed(id)
        }
    }
}

/// Future for the outcome of one call. Settles exactly once.
///
/// Dropping it does not cancel the call; the table entry is still reaped by
/// the reply or the deadline.
#[derive(Debug)]
pub struct RpcCall {
    correlation_id: Option<CorrelationId>,
    rx: oneshot::Receiver<Result<Value>>,
}

impl RpcCall {
    fn pending(correlation_id: CorrelationId, rx: oneshot::Receiver<Result<Value>>) -> Self {
        Self {
            correlation_id: Some(correlation_id),
            rx,
        }
    }

    /// A call rejected before anything was registered or published.
    fn rejected(err: RpcError) -> Self {
        let (tx, rx) = oneshot::channel();
        let _ = tx.send(Err(err));
        Self {
            correlation_id: None,
            rx,
        }
    }

    /// Correlation id of the published call, `None` if it was rejected up front.
    pub fn correlation_id(&self) -> Option<CorrelationId> {
        self.correlation_id
    }
}

impl Future for RpcCall {
    type Output = Result<Value>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|received| received.unwrap_or(Err(RpcError::SessionClosed)))
    }
}

struct ClientInner {
    config: ClientConfig,
    table: Arc<CorrelationTable>,
    session: Arc<Session>,
}

impl Drop for ClientInner {
    fn drop(&mut self) {
        let Some(connection) = self.session.detach() else {
            return;
        };
        // Outside a runtime the connection is simply dropped
        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            runtime.spawn(
                async move {
                    if let Err(e) = connection.close().await {
                        debug!("Closing connection of dropped client failed: {}", e);
                    }
                }
                .instrument(self.config.span.clone()),
            );
        }
    }
}

/// Client for calling `service.method` on nameko workers.
///
/// # Example
///
/// ```rust,ignore
/// use nameko_client::{ClientConfig, NamekoClient};
/// use serde_json::{json, Map};
///
/// let client = NamekoClient::connect(ClientConfig::from_env()?).await?;
/// let sum = client.call("math", "add", vec![json!(2), json!(3)], Map::new()).await?;
/// assert_eq!(sum, json!(5));
/// ```
#[derive(Clone)]
pub struct NamekoClient {
    inner: Arc<ClientInner>,
}

impl std::fmt::Debug for NamekoClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NamekoClient")
            .field("endpoint", &self.inner.config.endpoint())
            .field("exchange", &self.inner.config.exchange)
            .field("reply_queue", &self.inner.session.reply_queue())
            .field("state", &self.inner.session.state())
            .field("pending_calls", &self.inner.table.len())
            .finish()
    }
}

impl NamekoClient {
    /// Connect to the configured AMQP broker and wait until the session is ready.
    #[cfg(feature = "amqp")]
    pub async fn connect(config: ClientConfig) -> Result<Self> {
        Self::builder(config)
            .broker(crate::transport::AmqpBroker::new())
            .connect()
            .await
    }

    /// Start building a client with custom broker or error handling.
    pub fn builder(config: ClientConfig) -> ClientBuilder {
        ClientBuilder::new(config)
    }

    /// Call `service.method` with positional and keyword arguments.
    ///
    /// Never blocks. The returned future resolves with the remote result or
    /// rejects with `Timeout`, `Remote`, `Publish`, `NotReady` or
    /// `Validation`. No retry is attempted.
    pub fn call(
        &self,
        service: &str,
        method: &str,
        args: Vec<Value>,
        kwargs: Map<String, Value>,
    ) -> RpcCall {
        let _entered = self.inner.config.span.enter();

        let routing_key = match routing_key(service, method) {
            Ok(key) => key,
            Err(e) => return RpcCall::rejected(e),
        };
        let connection = match self.inner.session.ready_connection() {
            Ok(connection) => connection,
            Err(e) => {
                debug!("Rejecting {} while session is not ready: {}", routing_key, e);
                return RpcCall::rejected(e);
            }
        };
        let body = match serde_json::to_vec(&CallEnvelope::new(args, kwargs)) {
            Ok(body) => body,
            Err(e) => return RpcCall::rejected(e.into()),
        };

        let (tx, rx) = oneshot::channel();
        let timeout = self.inner.config.timeout;
        let table = self.inner.table.clone();
        let span = self.inner.config.span.clone();

        // Registered before publishing so a fast reply always finds its entry
        let id = self.inner.table.register(|id| {
            let deadline = tokio::spawn(
                async move {
                    tokio::time::sleep(timeout).await;
                    if let Some(call) = table.claim(&id) {
                        error!(
                            "[{}] Timed out: no response within {} ms.",
                            id,
                            timeout.as_millis()
                        );
                        call.expire(timeout);
                    }
                }
                .instrument(span),
            );
            PendingCall::new(service, method, tx).with_deadline(deadline.abort_handle())
        });

        debug!("[{}] Calling {}(...)", id, routing_key);

        let metadata = MessageMetadata::for_call(&id, self.inner.session.reply_queue());
        let exchange = self.inner.config.exchange.clone();
        let table = self.inner.table.clone();
        tokio::spawn(
            async move {
                if let Err(e) = connection.publish(&exchange, &routing_key, body, metadata).await {
                    error!("[{}] Publish to {} failed: {}", id, routing_key, e);
                    if let Some(call) = table.claim(&id) {
                        call.settle(Err(RpcError::Publish {
                            routing_key,
                            message: e.message,
                        }));
                    }
                }
            }
            .instrument(self.inner.config.span.clone()),
        );

        RpcCall::pending(id, rx)
    }

    /// Number of calls still waiting for a reply or their deadline.
    pub fn pending_calls(&self) -> usize {
        self.inner.table.len()
    }

    /// Name of this client's reply queue.
    pub fn reply_queue(&self) -> &str {
        self.inner.session.reply_queue()
    }

    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    pub fn state(&self) -> SessionState {
        self.inner.session.state()
    }

    /// Watch session state transitions.
    pub fn subscribe_state(&self) -> watch::Receiver<SessionState> {
        self.inner.session.subscribe_state()
    }

    /// Wait until the session is `Ready` (for example after a reconnect).
    pub async fn wait_ready(&self) -> Result<()> {
        self.inner.session.wait_ready().await
    }

    /// Disconnect from the broker.
    ///
    /// Calls still in flight are not cancelled; they settle at their deadline.
    pub async fn close(&self) {
        self.inner.session.close().await;
    }
}

/// Builder for configuring a [`NamekoClient`].
///
/// # Example
///
/// ```rust,ignore
/// let client = NamekoClient::builder(ClientConfig::default())
///     .broker(MemoryBroker::new())
///     .on_error(|err| eprintln!("session error: {err}"))
///     .connect()
///     .await?;
/// ```
pub struct ClientBuilder {
    config: ClientConfig,
    broker: Option<Arc<dyn Broker>>,
    on_error: ErrorHandler,
    backoff: ReconnectConfig,
}

impl ClientBuilder {
    pub fn new(config: ClientConfig) -> Self {
        Self {
            config,
            broker: None,
            on_error: log_errors(),
            backoff: ReconnectConfig::default(),
        }
    }

    /// Broker transport to connect through.
    pub fn broker(self, broker: impl Broker) -> Self {
        self.shared_broker(Arc::new(broker))
    }

    pub fn shared_broker(mut self, broker: Arc<dyn Broker>) -> Self {
        self.broker = Some(broker);
        self
    }

    /// Receive session-scoped errors (connection loss, bootstrap failures).
    ///
    /// Default: log at error level.
    pub fn on_error(mut self, handler: impl Fn(&RpcError) + Send + Sync + 'static) -> Self {
        self.on_error = Arc::new(handler);
        self
    }

    /// Backoff between reconnect attempts.
    pub fn reconnect_backoff(mut self, backoff: ReconnectConfig) -> Self {
        self.backoff = backoff;
        self
    }

    /// Bootstrap the session and resolve once it is `Ready`.
    pub async fn connect(self) -> Result<NamekoClient> {
        self.config.validate()?;

        let broker = match self.broker {
            Some(broker) => broker,
            None => default_broker()?,
        };

        let table = Arc::new(CorrelationTable::new());
        let dispatch_table = table.clone();
        let span = self.config.span.clone();
        let handler: DeliveryHandler = Arc::new(move |delivery: Delivery| {
            let _entered = span.enter();
            handle_reply(&dispatch_table, delivery);
        });

        let session = Arc::new(Session::new(
            self.config.clone(),
            broker,
            handler,
            self.on_error,
            self.backoff,
        ));

        session
            .start()
            .instrument(self.config.span.clone())
            .await?;

        Ok(NamekoClient {
            inner: Arc::new(ClientInner {
                config: self.config,
                table,
                session,
            }),
        })
    }
}

#[cfg(feature = "amqp")]
fn default_broker() -> Result<Arc<dyn Broker>> {
    Ok(Arc::new(crate::transport::AmqpBroker::new()))
}

#[cfg(not(feature = "amqp"))]
fn default_broker() -> Result<Arc<dyn Broker>> {
    Err(RpcError::Config {
        message: "no broker configured and the `amqp` feature is disabled".to_string(),
    })
}
