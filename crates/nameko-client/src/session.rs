//! Transport session bootstrap and supervision.
//!
//! A session walks the broker through a fixed sequence before any call may
//! be published:
//!
//! ```text
//! Connecting ──► ExchangeOpening ──► QueueBinding ──► Ready
//!     │                │                   │
//!     └────────────────┴───────────────────┴──────► Failed
//! ```
//!
//! The reply queue name is generated once per session and redeclared on every
//! reconnect. After `Ready`, a supervisor task watches the transport's event
//! stream. When the connection is lost it reports a `Connection` error and
//! either re-runs the bootstrap with backoff (reconnect enabled) or parks the
//! session in `Failed`. Calls in flight at that moment are not replayed; their
//! own deadlines settle them.

use crate::config::{ClientConfig, ReconnectConfig, WireConfig};
use crate::error::{Result, RpcError};
use crate::transport::{
    Broker, BrokerConnection, DeliveryHandler, ExchangeOptions, QueueOptions, TransportError,
    TransportEvent, TransportEvents,
};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn, Instrument};
use uuid::Uuid;

/// Bootstrap state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    Connecting,
    ExchangeOpening,
    QueueBinding,
    Ready,
    Failed,
    /// Closed by the owner.
    Closed,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Connecting => "connecting",
            SessionState::ExchangeOpening => "exchange_opening",
            SessionState::QueueBinding => "queue_binding",
            SessionState::Ready => "ready",
            SessionState::Failed => "failed",
            SessionState::Closed => "closed",
        }
    }

    pub fn is_ready(&self) -> bool {
        *self == SessionState::Ready
    }

    /// No further transitions will happen on their own.
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionState::Failed | SessionState::Closed)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Out-of-band receiver for session-scoped errors.
pub type ErrorHandler = Arc<dyn Fn(&RpcError) + Send + Sync>;

/// Handler used when the owner does not supply one: log and move on.
pub fn log_errors() -> ErrorHandler {
    Arc::new(|err: &RpcError| error!("AMQP error: {}", err))
}

/// Owns the broker connection and the reply queue identity.
pub(crate) struct Session {
    config: ClientConfig,
    broker: Arc<dyn Broker>,
    reply_queue: String,
    state: watch::Sender<SessionState>,
    connection: RwLock<Option<Arc<dyn BrokerConnection>>>,
    handler: DeliveryHandler,
    on_error: ErrorHandler,
    backoff: ReconnectConfig,
    closing: AtomicBool,
    supervisor: Mutex<Option<JoinHandle<()>>>,
}

impl Session {
    pub(crate) fn new(
        config: ClientConfig,
        broker: Arc<dyn Broker>,
        handler: DeliveryHandler,
        on_error: ErrorHandler,
        backoff: ReconnectConfig,
    ) -> Self {
        let reply_queue = format!("{}{}", WireConfig::REPLY_QUEUE_PREFIX, Uuid::new_v4());
        let (state, _) = watch::channel(SessionState::Connecting);
        Self {
            config,
            broker,
            reply_queue,
            state,
            connection: RwLock::new(None),
            handler,
            on_error,
            backoff,
            closing: AtomicBool::new(false),
            supervisor: Mutex::new(None),
        }
    }

    pub(crate) fn reply_queue(&self) -> &str {
        &self.reply_queue
    }

    pub(crate) fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    pub(crate) fn subscribe_state(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    /// Move to `next`. `Closed` is final and never left.
    fn set_state(&self, next: SessionState) {
        let mut previous = next;
        let changed = self.state.send_if_modified(|state| {
            if *state == SessionState::Closed || *state == next {
                return false;
            }
            previous = std::mem::replace(state, next);
            true
        });
        if changed {
            debug!("Session {} -> {}", previous, next);
        }
    }

    fn set_connection(&self, connection: Option<Arc<dyn BrokerConnection>>) -> Option<Arc<dyn BrokerConnection>> {
        let mut slot = self.connection.write().unwrap_or_else(PoisonError::into_inner);
        std::mem::replace(&mut *slot, connection)
    }

    /// The live connection, if and only if the session is `Ready`.
    pub(crate) fn ready_connection(&self) -> Result<Arc<dyn BrokerConnection>> {
        let state = self.state();
        if !state.is_ready() {
            return Err(RpcError::NotReady { state });
        }
        self.connection
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or(RpcError::NotReady { state })
    }

    /// Run the bootstrap and, on success, start supervising the connection.
    ///
    /// A bootstrap failure parks the session in `Failed`, is reported to the
    /// error handler and returned.
    pub(crate) async fn start(self: &Arc<Self>) -> Result<()> {
        match self.bootstrap().await {
            Ok(events) => {
                let supervisor = tokio::spawn(
                    self.clone()
                        .supervise(events)
                        .instrument(self.config.span.clone()),
                );
                *self.supervisor.lock().unwrap_or_else(PoisonError::into_inner) = Some(supervisor);
                Ok(())
            }
            Err(e) => {
                self.set_state(SessionState::Failed);
                (self.on_error)(&e);
                Err(e)
            }
        }
    }

    /// One pass through Connecting → ExchangeOpening → QueueBinding → Ready.
    async fn bootstrap(&self) -> Result<TransportEvents> {
        self.set_state(SessionState::Connecting);
        let (connection, events) = self
            .broker
            .connect(&self.config)
            .await
            .map_err(RpcError::connection)?;
        debug!("Connected to {}", self.config.endpoint());

        if let Err(e) = self.open_reply_path(connection.as_ref()).await {
            if let Err(close_err) = connection.close().await {
                debug!("Closing half-open connection failed: {}", close_err);
            }
            return Err(e);
        }

        // A concurrent close either takes the installed connection or is seen here
        self.set_connection(Some(connection));
        if self.closing.load(Ordering::SeqCst) {
            if let Some(connection) = self.set_connection(None) {
                let _ = connection.close().await;
            }
            return Err(RpcError::SessionClosed);
        }
        self.set_state(SessionState::Ready);
        info!("Nameko client ready (reply queue {})", self.reply_queue);
        Ok(events)
    }

    async fn open_reply_path(&self, connection: &dyn BrokerConnection) -> Result<()> {
        let exchange = &self.config.exchange;

        self.set_state(SessionState::ExchangeOpening);
        connection
            .declare_exchange(exchange, ExchangeOptions::default())
            .await
            .map_err(|e| RpcError::Exchange {
                exchange: exchange.clone(),
                message: e.message,
            })?;
        debug!("Selected exchange {}", exchange);

        self.set_state(SessionState::QueueBinding);
        let queue_error = |e: TransportError| RpcError::Queue {
            queue: self.reply_queue.clone(),
            message: e.message,
        };
        connection
            .declare_queue(&self.reply_queue, QueueOptions { exclusive: true })
            .await
            .map_err(queue_error)?;
        connection
            .bind_queue(&self.reply_queue, exchange, &self.reply_queue)
            .await
            .map_err(queue_error)?;
        let tag = connection
            .subscribe(&self.reply_queue, self.handler.clone())
            .await
            .map_err(queue_error)?;
        debug!("Consuming reply queue {} as {}", self.reply_queue, tag);

        Ok(())
    }

    async fn supervise(self: Arc<Self>, mut events: TransportEvents) {
        loop {
            let reason = match events.recv().await {
                Some(TransportEvent::Closed { reason }) => reason,
                Some(TransportEvent::Error { message }) => message,
                None => "transport event stream ended".to_string(),
            };
            if self.closing.load(Ordering::SeqCst) {
                return;
            }

            warn!("Broker connection lost: {}", reason);
            if let Some(stale) = self.set_connection(None) {
                let _ = stale.close().await;
            }
            (self.on_error)(&RpcError::Connection { message: reason });

            if !self.config.reconnect {
                self.set_state(SessionState::Failed);
                return;
            }
            match self.reconnect().await {
                Some(fresh) => events = fresh,
                None => return,
            }
        }
    }

    async fn reconnect(&self) -> Option<TransportEvents> {
        let mut attempt: u32 = 0;
        loop {
            if self.closing.load(Ordering::SeqCst) {
                return None;
            }
            self.set_state(SessionState::Connecting);
            let delay = self.backoff.calculate_delay(attempt);
            info!(
                "Reconnecting to {} in {:?} (attempt {})",
                self.config.endpoint(),
                delay,
                attempt + 1
            );
            tokio::time::sleep(delay).await;

            match self.bootstrap().await {
                Ok(events) => {
                    info!("Session re-established after {} attempt(s)", attempt + 1);
                    return Some(events);
                }
                Err(RpcError::SessionClosed) => return None,
                Err(e) => {
                    warn!("Reconnect attempt {} failed: {}", attempt + 1, e);
                    (self.on_error)(&e);
                    attempt = attempt.saturating_add(1);
                }
            }
        }
    }

    /// Resolve once the session is `Ready`, or fail if it ends up `Failed`/`Closed`.
    pub(crate) async fn wait_ready(&self) -> Result<()> {
        let mut rx = self.state.subscribe();
        let state = *rx
            .wait_for(|s| s.is_ready() || s.is_terminal())
            .await
            .map_err(|_| RpcError::SessionClosed)?;
        if state.is_ready() {
            Ok(())
        } else {
            Err(RpcError::NotReady { state })
        }
    }

    /// Stop supervising without touching the connection.
    pub(crate) fn halt(&self) {
        self.closing.store(true, Ordering::SeqCst);
        if let Some(supervisor) = self
            .supervisor
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            supervisor.abort();
        }
    }

    /// Stop supervising, mark the session `Closed` and hand back the
    /// connection for the caller to close.
    pub(crate) fn detach(&self) -> Option<Arc<dyn BrokerConnection>> {
        self.halt();
        let connection = self.set_connection(None);
        self.set_state(SessionState::Closed);
        connection
    }

    /// Disconnect from the broker. Pending calls are left to their deadlines.
    pub(crate) async fn close(&self) {
        if let Some(connection) = self.detach() {
            if let Err(e) = connection.close().await {
                warn!("Error closing broker connection: {}", e);
            }
        }
        info!("Nameko client closed");
    }
}
