//! Client configuration.
//!
//! `ClientConfig` carries the broker connection parameters and per-call
//! behavior. It is immutable once handed to the client; overrides are merged
//! over the defaults with the `with_*` methods or read from the environment.

use crate::error::{Result, RpcError};
use std::time::Duration;

/// Wire-level constants shared by every call.
pub struct WireConfig;

impl WireConfig {
    pub const REPLY_QUEUE_PREFIX: &'static str = "rpc-node-response-";
    pub const CONTENT_TYPE: &'static str = "application/json";
    pub const CALL_ID_STACK_HEADER: &'static str = "nameko.call_id_stack";
    pub const CALL_ID_STACK_VALUE: &'static str = "standalone_rpc_proxy.call.bar";
}

/// Session connection and call configuration.
#[derive(Clone)]
pub struct ClientConfig {
    /// Broker hostname.
    pub host: String,
    /// AMQP virtual host.
    pub vhost: String,
    /// Broker port.
    pub port: u16,
    pub login: String,
    pub password: String,
    /// Name of the topic exchange services listen on.
    pub exchange: String,
    /// Deadline applied to every call.
    pub timeout: Duration,
    /// Re-establish the session when the broker connection drops.
    pub reconnect: bool,
    /// Span that session and call events are recorded in.
    pub span: tracing::Span,
}

impl ClientConfig {
    pub const DEFAULT_HOST: &'static str = "rabbit";
    pub const DEFAULT_VHOST: &'static str = "/";
    pub const DEFAULT_PORT: u16 = 5672;
    pub const DEFAULT_LOGIN: &'static str = "guest";
    pub const DEFAULT_PASSWORD: &'static str = "guest";
    pub const DEFAULT_EXCHANGE: &'static str = "nameko-rpc";
    pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(30_000);
}

impl std::fmt::Debug for ClientConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientConfig")
            .field("host", &self.host)
            .field("vhost", &self.vhost)
            .field("port", &self.port)
            .field("login", &self.login)
            .field("password", &"<redacted>")
            .field("exchange", &self.exchange)
            .field("timeout", &self.timeout)
            .field("reconnect", &self.reconnect)
            .finish_non_exhaustive()
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            host: Self::DEFAULT_HOST.to_string(),
            vhost: Self::DEFAULT_VHOST.to_string(),
            port: Self::DEFAULT_PORT,
            login: Self::DEFAULT_LOGIN.to_string(),
            password: Self::DEFAULT_PASSWORD.to_string(),
            exchange: Self::DEFAULT_EXCHANGE.to_string(),
            timeout: Self::DEFAULT_TIMEOUT,
            reconnect: true,
            span: tracing::info_span!("nameko"),
        }
    }
}

impl ClientConfig {
    /// Create a config with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a config from `RABBIT_*` environment variables.
    ///
    /// Unset variables keep their defaults.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build a config from an arbitrary key lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = Self::default();

        if let Some(host) = lookup("RABBIT_HOST") {
            config.host = host;
        }
        if let Some(vhost) = lookup("RABBIT_VHOST") {
            config.vhost = vhost;
        }
        if let Some(port) = lookup("RABBIT_PORT") {
            config.port = parse_var("RABBIT_PORT", &port)?;
        }
        if let Some(login) = lookup("RABBIT_USER") {
            config.login = login;
        }
        if let Some(password) = lookup("RABBIT_PASSWORD") {
            config.password = password;
        }
        if let Some(exchange) = lookup("RABBIT_EXCHANGE") {
            config.exchange = exchange;
        }
        if let Some(timeout) = lookup("RABBIT_TIMEOUT_MS") {
            config.timeout = Duration::from_millis(parse_var("RABBIT_TIMEOUT_MS", &timeout)?);
        }
        if let Some(reconnect) = lookup("RABBIT_RECONNECT") {
            config.reconnect = parse_var("RABBIT_RECONNECT", &reconnect)?;
        }

        Ok(config)
    }

    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    pub fn with_vhost(mut self, vhost: impl Into<String>) -> Self {
        self.vhost = vhost.into();
        self
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Set login and password.
    pub fn with_credentials(mut self, login: impl Into<String>, password: impl Into<String>) -> Self {
        self.login = login.into();
        self.password = password.into();
        self
    }

    pub fn with_exchange(mut self, exchange: impl Into<String>) -> Self {
        self.exchange = exchange.into();
        self
    }

    /// Set the per-call deadline.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_reconnect(mut self, reconnect: bool) -> Self {
        self.reconnect = reconnect;
        self
    }

    /// Record client events inside the given span.
    pub fn with_span(mut self, span: tracing::Span) -> Self {
        self.span = span;
        self
    }

    /// Reject configurations the session cannot work with.
    pub fn validate(&self) -> Result<()> {
        if self.host.is_empty() {
            return Err(RpcError::Validation {
                field: "host".to_string(),
                message: "host must not be empty".to_string(),
            });
        }
        if self.exchange.is_empty() {
            return Err(RpcError::Validation {
                field: "exchange".to_string(),
                message: "exchange name must not be empty".to_string(),
            });
        }
        if self.timeout.is_zero() {
            return Err(RpcError::Validation {
                field: "timeout".to_string(),
                message: "timeout must be greater than zero".to_string(),
            });
        }
        Ok(())
    }

    /// AMQP URI for this configuration, with userinfo and vhost percent-encoded.
    pub fn amqp_uri(&self) -> String {
        format!(
            "amqp://{}:{}@{}:{}/{}",
            urlencoding::encode(&self.login),
            urlencoding::encode(&self.password),
            self.host,
            self.port,
            urlencoding::encode(&self.vhost)
        )
    }

    /// `host:port` for log messages.
    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

fn parse_var<T: std::str::FromStr>(key: &str, raw: &str) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    raw.trim().parse().map_err(|e: T::Err| RpcError::Config {
        message: format!("invalid value for {}: '{}' ({})", key, raw, e),
    })
}

/// Backoff used between reconnect attempts.
#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    /// Delay before the first reconnect attempt.
    pub base_delay: Duration,
    /// Maximum delay cap.
    pub max_delay: Duration,
    /// Exponential base (typically 2.0 for doubling).
    pub exponential_base: f64,
    /// Whether to add random jitter to delays.
    pub jitter: bool,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            exponential_base: 2.0,
            jitter: true,
        }
    }
}

impl ReconnectConfig {
    pub fn with_base_delay(mut self, delay: Duration) -> Self {
        self.base_delay = delay;
        self
    }

    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// Calculate the delay for a given attempt number (0-indexed).
    pub fn calculate_delay(&self, attempt: u32) -> Duration {
        let multiplier = self.exponential_base.powi(attempt.min(32) as i32);
        let delay_secs = self.base_delay.as_secs_f64() * multiplier;
        let capped_secs = delay_secs.min(self.max_delay.as_secs_f64());

        let final_secs = if self.jitter {
            // Factor in [0.5, 1.5)
            let jitter_factor = rand::random_range(0.5..1.5);
            (capped_secs * jitter_factor).min(self.max_delay.as_secs_f64())
        } else {
            capped_secs
        };

        Duration::from_secs_f64(final_secs)
    }
}
