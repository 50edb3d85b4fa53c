//! AMQP 0-9-1 transport backed by `lapin`.
//!
//! One connection and one channel per session. The reply queue consumer runs
//! in no-ack mode; every delivery is handed straight to the client's
//! dispatcher. Connection errors and the end of the consumer stream are
//! forwarded as [`TransportEvent`]s.

use super::{
    Broker, BrokerConnection, DeliveryHandler, ExchangeOptions, QueueOptions, TransportError,
    TransportEvent, TransportEvents, TransportResult,
};
use crate::config::ClientConfig;
use crate::protocol::{Delivery, MessageMetadata};
use futures::StreamExt;
use lapin::options::{
    BasicConsumeOptions, BasicPublishOptions, ExchangeDeclareOptions, QueueBindOptions,
    QueueDeclareOptions,
};
use lapin::types::{AMQPValue, FieldTable, ShortString};
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties, ExchangeKind};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error};

impl From<lapin::Error> for TransportError {
    fn from(err: lapin::Error) -> Self {
        TransportError::new(err.to_string())
    }
}

/// Broker reached over the network with the AMQP protocol.
#[derive(Debug, Clone, Copy, Default)]
pub struct AmqpBroker;

impl AmqpBroker {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait::async_trait]
impl Broker for AmqpBroker {
    async fn connect(
        &self,
        config: &ClientConfig,
    ) -> TransportResult<(Arc<dyn BrokerConnection>, TransportEvents)> {
        let connection =
            Connection::connect(&config.amqp_uri(), ConnectionProperties::default()).await?;
        let channel = connection.create_channel().await?;

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let on_error = events_tx.clone();
        connection.on_error(move |err| {
            let _ = on_error.send(TransportEvent::Error {
                message: err.to_string(),
            });
        });

        debug!("AMQP connection to {} open", config.endpoint());

        let connection: Arc<dyn BrokerConnection> = Arc::new(AmqpConnection {
            connection,
            channel,
            events: events_tx,
            consumers: Mutex::new(Vec::new()),
        });
        Ok((connection, events_rx))
    }
}

/// A live AMQP connection and its channel.
pub struct AmqpConnection {
    connection: Connection,
    channel: Channel,
    events: mpsc::UnboundedSender<TransportEvent>,
    consumers: Mutex<Vec<JoinHandle<()>>>,
}

impl std::fmt::Debug for AmqpConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AmqpConnection").finish_non_exhaustive()
    }
}

#[async_trait::async_trait]
impl BrokerConnection for AmqpConnection {
    async fn declare_exchange(&self, name: &str, options: ExchangeOptions) -> TransportResult<()> {
        self.channel
            .exchange_declare(
                name,
                ExchangeKind::Topic,
                ExchangeDeclareOptions {
                    durable: options.durable,
                    auto_delete: options.auto_delete,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await?;
        Ok(())
    }

    async fn declare_queue(&self, name: &str, options: QueueOptions) -> TransportResult<()> {
        self.channel
            .queue_declare(
                name,
                QueueDeclareOptions {
                    exclusive: options.exclusive,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await?;
        Ok(())
    }

    async fn bind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> TransportResult<()> {
        self.channel
            .queue_bind(
                queue,
                exchange,
                routing_key,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await?;
        Ok(())
    }

    async fn subscribe(&self, queue: &str, handler: DeliveryHandler) -> TransportResult<String> {
        let mut consumer = self
            .channel
            .basic_consume(
                queue,
                "",
                BasicConsumeOptions {
                    no_ack: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await?;
        let tag = consumer.tag().as_str().to_string();

        let events = self.events.clone();
        let queue_name = queue.to_string();
        let task = tokio::spawn(async move {
            while let Some(next) = consumer.next().await {
                match next {
                    Ok(delivery) => handler(convert_delivery(delivery)),
                    Err(e) => {
                        error!("Consumer on {} failed: {}", queue_name, e);
                        let _ = events.send(TransportEvent::Error {
                            message: e.to_string(),
                        });
                        return;
                    }
                }
            }
            let _ = events.send(TransportEvent::Closed {
                reason: format!("consumer on {} ended", queue_name),
            });
        });
        self.consumers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(task);

        Ok(tag)
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: Vec<u8>,
        metadata: MessageMetadata,
    ) -> TransportResult<()> {
        let mut properties = BasicProperties::default();
        if let Some(content_type) = metadata.content_type {
            properties = properties.with_content_type(ShortString::from(content_type));
        }
        if let Some(reply_to) = metadata.reply_to {
            properties = properties.with_reply_to(ShortString::from(reply_to));
        }
        if let Some(correlation_id) = metadata.correlation_id {
            properties = properties.with_correlation_id(ShortString::from(correlation_id));
        }
        if !metadata.headers.is_empty() {
            let mut headers = FieldTable::default();
            for (key, value) in metadata.headers {
                headers.insert(ShortString::from(key), AMQPValue::LongString(value.into()));
            }
            properties = properties.with_headers(headers);
        }

        self.channel
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions::default(),
                &body,
                properties,
            )
            .await?
            .await?;
        Ok(())
    }

    async fn close(&self) -> TransportResult<()> {
        let consumers: Vec<JoinHandle<()>> = self
            .consumers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();
        for task in consumers {
            task.abort();
        }
        self.connection.close(200, "client closed").await?;
        Ok(())
    }
}

impl Drop for AmqpConnection {
    fn drop(&mut self) {
        for task in self
            .consumers
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
        {
            task.abort();
        }
    }
}

fn convert_delivery(delivery: lapin::message::Delivery) -> Delivery {
    let properties = &delivery.properties;
    let text = |value: &Option<ShortString>| value.as_ref().map(|s| s.as_str().to_string());

    // Reply headers carry nothing the client reads
    Delivery {
        routing_key: delivery.routing_key.as_str().to_string(),
        metadata: MessageMetadata {
            content_type: text(properties.content_type()),
            reply_to: text(properties.reply_to()),
            correlation_id: text(properties.correlation_id()),
            headers: BTreeMap::new(),
        },
        body: delivery.data,
    }
}
