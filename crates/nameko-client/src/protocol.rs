//! Wire types for nameko RPC over a topic exchange.
//!
//! A call is published to the exchange under the routing key
//! `service.method` with a JSON body and AMQP message properties:
//!
//! ```text
//! body:        {"args": [...], "kwargs": {...}}
//! properties:  content_type, reply_to, correlation_id,
//!              headers {"nameko.call_id_stack": ...}
//! ```
//!
//! The worker answers on the reply queue with the same correlation id and a
//! body carrying either `result` or `error`.

use crate::config::WireConfig;
use crate::correlation::CorrelationId;
use crate::error::{Result, RpcError};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

/// Serialized call body.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CallEnvelope {
    #[serde(default)]
    pub args: Vec<Value>,
    #[serde(default)]
    pub kwargs: Map<String, Value>,
}

impl CallEnvelope {
    pub fn new(args: Vec<Value>, kwargs: Map<String, Value>) -> Self {
        Self { args, kwargs }
    }
}

/// Message properties attached to every publish.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MessageMetadata {
    pub content_type: Option<String>,
    pub reply_to: Option<String>,
    pub correlation_id: Option<String>,
    pub headers: BTreeMap<String, String>,
}

impl MessageMetadata {
    /// Metadata for an outbound call.
    pub fn for_call(correlation_id: &CorrelationId, reply_to: &str) -> Self {
        let mut headers = BTreeMap::new();
        headers.insert(
            WireConfig::CALL_ID_STACK_HEADER.to_string(),
            WireConfig::CALL_ID_STACK_VALUE.to_string(),
        );
        Self {
            content_type: Some(WireConfig::CONTENT_TYPE.to_string()),
            reply_to: Some(reply_to.to_string()),
            correlation_id: Some(correlation_id.to_string()),
            headers,
        }
    }

    /// Metadata for a reply to the given call.
    pub fn for_reply(correlation_id: impl Into<String>) -> Self {
        Self {
            content_type: Some(WireConfig::CONTENT_TYPE.to_string()),
            correlation_id: Some(correlation_id.into()),
            ..Default::default()
        }
    }
}

/// An inbound message handed to a subscriber.
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    pub routing_key: String,
    pub body: Vec<u8>,
    pub metadata: MessageMetadata,
}

/// Failure reported by a remote worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteErrorDescriptor {
    pub exc_path: String,
    #[serde(default)]
    pub value: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exc_type: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub exc_args: Vec<Value>,
}

/// Reply body sent by a worker.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResponseEnvelope {
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub error: Option<RemoteErrorDescriptor>,
}

impl ResponseEnvelope {
    /// Create a success response.
    pub fn success(result: Value) -> Self {
        Self {
            result: Some(result),
            error: None,
        }
    }

    /// Create an error response.
    pub fn failure(exc_path: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            result: None,
            error: Some(RemoteErrorDescriptor {
                exc_path: exc_path.into(),
                value: value.into(),
                exc_type: None,
                exc_args: Vec::new(),
            }),
        }
    }

    /// Resolve the envelope into the caller-facing outcome.
    ///
    /// An error descriptor always wins; a reply with neither field resolves to `null`.
    pub fn into_result(self) -> Result<Value> {
        match self.error {
            Some(err) => Err(RpcError::Remote {
                exc_path: err.exc_path,
                value: err.value,
                exc_type: err.exc_type,
                exc_args: err.exc_args,
            }),
            None => Ok(self.result.unwrap_or(Value::Null)),
        }
    }
}

/// Build the routing key for a call, validating both identifiers.
pub fn routing_key(service: &str, method: &str) -> Result<String> {
    validate_identifier("service", service)?;
    validate_identifier("method", method)?;
    Ok(format!("{}.{}", service, method))
}

fn validate_identifier(field: &str, value: &str) -> Result<()> {
    if value.is_empty() {
        return Err(RpcError::Validation {
            field: field.to_string(),
            message: format!("{} name must not be empty", field),
        });
    }
    if value.contains(['.', '*', '#']) || value.chars().any(char::is_whitespace) {
        return Err(RpcError::Validation {
            field: field.to_string(),
            message: format!("{} name '{}' is not a valid routing key segment", field, value),
        });
    }
    Ok(())
}
