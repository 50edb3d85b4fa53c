//! Broker transport collaborators.
//!
//! The RPC client never speaks a broker protocol directly. It drives a
//! [`Broker`] through a fixed sequence of primitives (connect, declare
//! exchange, declare/bind/consume the reply queue, publish) and listens to
//! [`TransportEvent`]s for connection loss.
//!
//! # Implementations
//!
//! - [`MemoryBroker`]: in-process topic exchange, used by tests and local runs
//! - [`AmqpBroker`]: AMQP 0-9-1 via `lapin` (feature `amqp`)

#[cfg(feature = "amqp")]
pub mod amqp;
pub mod memory;

#[cfg(feature = "amqp")]
pub use amqp::AmqpBroker;
pub use memory::{Fault, MemoryBroker, WorkerHandle};

use crate::config::ClientConfig;
use crate::protocol::{Delivery, MessageMetadata};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;

/// Failure reported by a transport primitive.
///
/// The session maps it onto the client error taxonomy depending on which
/// bootstrap step or call it came from.
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct TransportError {
    pub message: String,
}

impl TransportError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

pub type TransportResult<T> = std::result::Result<T, TransportError>;

/// Out-of-band connection events.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// The connection is gone.
    Closed { reason: String },
    /// The broker or client library reported an error on the connection.
    Error { message: String },
}

/// Receiving end of a connection's event stream.
pub type TransportEvents = mpsc::UnboundedReceiver<TransportEvent>;

/// Callback invoked for every message on a subscribed queue.
///
/// Must not block: the consumer delivers the next message only after it returns.
pub type DeliveryHandler = Arc<dyn Fn(Delivery) + Send + Sync>;

/// Exchange declaration flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExchangeOptions {
    pub durable: bool,
    pub auto_delete: bool,
}

impl Default for ExchangeOptions {
    fn default() -> Self {
        Self {
            durable: true,
            auto_delete: false,
        }
    }
}

/// Queue declaration flags.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueOptions {
    /// Owned by the declaring connection and deleted when it closes.
    pub exclusive: bool,
}

/// Factory for broker connections.
#[async_trait::async_trait]
pub trait Broker: Send + Sync + 'static {
    /// Open a connection. Events for its lifetime arrive on the returned receiver.
    async fn connect(
        &self,
        config: &ClientConfig,
    ) -> TransportResult<(Arc<dyn BrokerConnection>, TransportEvents)>;
}

/// One live broker connection with a channel to work on.
#[async_trait::async_trait]
pub trait BrokerConnection: Send + Sync + 'static {
    /// Declare a topic exchange.
    async fn declare_exchange(&self, name: &str, options: ExchangeOptions) -> TransportResult<()>;

    async fn declare_queue(&self, name: &str, options: QueueOptions) -> TransportResult<()>;

    async fn bind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> TransportResult<()>;

    /// Start consuming a queue. Returns the consumer tag.
    async fn subscribe(&self, queue: &str, handler: DeliveryHandler) -> TransportResult<String>;

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: Vec<u8>,
        metadata: MessageMetadata,
    ) -> TransportResult<()>;

    /// Close the connection. Exclusive queues it owns are removed by the broker.
    async fn close(&self) -> TransportResult<()>;
}
