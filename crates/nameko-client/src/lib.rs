//! Nameko Client - request/reply RPC over a topic-exchange message broker.
//!
//! Calls named `service.method` targets on nameko workers. Each call is
//! published to the RPC exchange with a random correlation id and this
//! client's reply queue as return address; replies arriving on the reply
//! queue are matched back to the waiting call. Every call carries its own
//! deadline, and remote failures come back as structured errors.
//!
//! # Example
//!
//! ```rust,ignore
//! use nameko_client::{ClientConfig, NamekoClient};
//! use serde_json::{json, Map};
//!
//! #[tokio::main]
//! async fn main() -> nameko_client::Result<()> {
//!     let config = ClientConfig::from_env()?;
//!     let client = NamekoClient::connect(config).await?;
//!
//!     let sum = client.call("math", "add", vec![json!(2), json!(3)], Map::new()).await?;
//!     println!("2 + 3 = {}", sum);
//!
//!     client.close().await;
//!     Ok(())
//! }
//! ```

pub mod client;
pub mod config;
pub mod correlation;
pub mod error;
pub mod protocol;
pub mod session;
pub mod transport;

// Re-export commonly used types
pub use client::{handle_reply, ClientBuilder, Dispatch, NamekoClient, RpcCall};
pub use config::{ClientConfig, ReconnectConfig, WireConfig};
pub use correlation::{CorrelationId, CorrelationTable, PendingCall};
pub use error::{Result, RpcError};
pub use protocol::{CallEnvelope, Delivery, MessageMetadata, RemoteErrorDescriptor, ResponseEnvelope};
pub use session::{ErrorHandler, SessionState};
#[cfg(feature = "amqp")]
pub use transport::AmqpBroker;
pub use transport::{Broker, BrokerConnection, MemoryBroker, TransportError, TransportEvent};
