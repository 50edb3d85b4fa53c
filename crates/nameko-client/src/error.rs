//! Error types for the nameko RPC client.
//!
//! Errors fall into two scopes. Session-scoped errors (connection, exchange,
//! queue) are reported through the session error handler and never resolve a
//! particular call. Call-scoped errors (timeout, remote failure, publish
//! failure) only ever settle the call they belong to.

use crate::session::SessionState;
use serde_json::{json, Value};
use std::time::Duration;
use thiserror::Error;

/// Main error type for the nameko client.
#[derive(Debug, Clone, Error)]
pub enum RpcError {
    // Session errors
    #[error("Connection error: {message}")]
    Connection { message: String },

    #[error("Exchange error for {exchange}: {message}")]
    Exchange { exchange: String, message: String },

    #[error("Queue error for {queue}: {message}")]
    Queue { queue: String, message: String },

    #[error("Session is not ready (state: {state})")]
    NotReady { state: SessionState },

    #[error("Session closed before the call settled")]
    SessionClosed,

    // Call errors
    #[error("Publish failed for {routing_key}: {message}")]
    Publish { routing_key: String, message: String },

    #[error("Timeout: no response from {service}.{method} within {timeout:?}")]
    Timeout {
        service: String,
        method: String,
        timeout: Duration,
    },

    #[error("{exc_path}: {value}")]
    Remote {
        exc_path: String,
        value: String,
        /// Short exception class name, when the worker reported one.
        exc_type: Option<String>,
        exc_args: Vec<Value>,
    },

    // Serialization errors
    #[error("JSON error: {message}")]
    Json { message: String },

    // Configuration errors
    #[error("Configuration error: {message}")]
    Config { message: String },

    // Validation errors
    #[error("Validation error for {field}: {message}")]
    Validation { field: String, message: String },
}

/// Result type alias for client operations.
pub type Result<T> = std::result::Result<T, RpcError>;

impl From<serde_json::Error> for RpcError {
    fn from(err: serde_json::Error) -> Self {
        RpcError::Json {
            message: err.to_string(),
        }
    }
}

impl RpcError {
    /// Create a connection error from any displayable cause.
    pub fn connection(err: impl std::fmt::Display) -> Self {
        RpcError::Connection {
            message: err.to_string(),
        }
    }

    /// Whether this error belongs to the session rather than a single call.
    pub fn is_session_scoped(&self) -> bool {
        matches!(
            self,
            RpcError::Connection { .. } | RpcError::Exchange { .. } | RpcError::Queue { .. }
        )
    }

    /// Check if the caller may reasonably resend the call.
    ///
    /// The client itself never retries.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            RpcError::Timeout { .. } | RpcError::Connection { .. } | RpcError::NotReady { .. }
        )
    }

    /// Short exception type name used on the wire.
    pub fn exc_type(&self) -> &str {
        match self {
            RpcError::Connection { .. } => "ConnectionError",
            RpcError::Exchange { .. } => "ExchangeError",
            RpcError::Queue { .. } => "QueueError",
            RpcError::NotReady { .. } => "NotReady",
            RpcError::SessionClosed => "SessionClosed",
            RpcError::Publish { .. } => "PublishError",
            RpcError::Timeout { .. } => "Timeout",
            RpcError::Remote {
                exc_type, exc_path, ..
            } => exc_type
                .as_deref()
                .unwrap_or_else(|| exc_path.rsplit('.').next().unwrap_or(exc_path)),
            RpcError::Json { .. } => "JsonError",
            RpcError::Config { .. } => "ConfigError",
            RpcError::Validation { .. } => "ValidationError",
        }
    }

    /// Convert to the error object shape nameko callers expect:
    /// `{exc_type, exc_path, value, exc_args}`.
    pub fn to_wire(&self) -> Value {
        match self {
            RpcError::Timeout {
                service, method, ..
            } => json!({
                "exc_type": "Timeout",
                "exc_path": Value::Null,
                "value": format!("{}.{}", service, method),
                "exc_args": [service, method],
            }),
            RpcError::Remote {
                exc_path,
                value,
                exc_args,
                ..
            } => json!({
                "exc_type": self.exc_type(),
                "exc_path": exc_path,
                "value": value,
                "exc_args": exc_args,
            }),
            other => json!({
                "exc_type": other.exc_type(),
                "exc_path": Value::Null,
                "value": other.to_string(),
                "exc_args": [],
            }),
        }
    }
}
