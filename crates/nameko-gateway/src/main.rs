//! Nameko Gateway - HTTP front door for nameko RPC services.
//!
//! Every `POST /rpc/:service/:method` request is forwarded as a call over the
//! broker and answered with the service's result or structured error.

mod handler;
mod server;

use anyhow::Result;
use clap::{ArgAction, Parser};
use nameko_client::{ClientConfig, MemoryBroker, NamekoClient};
use server::ServerOptions;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[derive(Parser)]
#[command(name = "nameko-gateway")]
#[command(about = "HTTP gateway for nameko RPC services")]
struct Args {
    /// Port to listen on (0 = auto-assign)
    #[arg(short, long, env = "PORT", default_value_t = 3000)]
    port: u16,

    /// Host to bind to
    #[arg(long, default_value = "0.0.0.0")]
    host: String,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,

    /// Emit logs as JSON lines
    #[arg(long)]
    json_logs: bool,

    /// Broker hostname
    #[arg(long, env = "RABBIT_HOST", default_value = ClientConfig::DEFAULT_HOST)]
    rabbit_host: String,

    /// Broker port
    #[arg(long, env = "RABBIT_PORT", default_value_t = ClientConfig::DEFAULT_PORT)]
    rabbit_port: u16,

    /// AMQP virtual host
    #[arg(long, env = "RABBIT_VHOST", default_value = ClientConfig::DEFAULT_VHOST)]
    rabbit_vhost: String,

    #[arg(long, env = "RABBIT_USER", default_value = ClientConfig::DEFAULT_LOGIN)]
    rabbit_user: String,

    #[arg(long, env = "RABBIT_PASSWORD", default_value = ClientConfig::DEFAULT_PASSWORD, hide_env_values = true)]
    rabbit_password: String,

    /// Topic exchange the services listen on
    #[arg(long, env = "RABBIT_EXCHANGE", default_value = ClientConfig::DEFAULT_EXCHANGE)]
    rabbit_exchange: String,

    /// Per-call deadline in milliseconds
    #[arg(long, env = "RABBIT_TIMEOUT_MS", default_value_t = 30_000)]
    rabbit_timeout_ms: u64,

    /// Re-establish the broker session after a connection loss
    #[arg(long, env = "RABBIT_RECONNECT", default_value_t = true, action = ArgAction::Set)]
    rabbit_reconnect: bool,

    /// Allowed CORS origin (repeatable; none allows any origin)
    #[arg(long = "allow-origin", env = "CORS_ALLOW_ORIGINS", value_delimiter = ',')]
    allow_origins: Vec<String>,

    /// Serve static files from this directory
    #[arg(long)]
    static_dir: Option<PathBuf>,

    /// Use the in-process broker instead of connecting to RabbitMQ
    #[arg(long)]
    memory_broker: bool,
}

impl std::fmt::Debug for Args {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Args")
            .field("port", &self.port)
            .field("host", &self.host)
            .field("debug", &self.debug)
            .field("json_logs", &self.json_logs)
            .field("rabbit_host", &self.rabbit_host)
            .field("rabbit_port", &self.rabbit_port)
            .field("rabbit_vhost", &self.rabbit_vhost)
            .field("rabbit_user", &self.rabbit_user)
            .field("rabbit_password", &"<redacted>")
            .field("rabbit_exchange", &self.rabbit_exchange)
            .field("rabbit_timeout_ms", &self.rabbit_timeout_ms)
            .field("rabbit_reconnect", &self.rabbit_reconnect)
            .field("allow_origins", &self.allow_origins)
            .field("static_dir", &self.static_dir)
            .field("memory_broker", &self.memory_broker)
            .finish()
    }
}

impl Args {
    fn client_config(&self) -> ClientConfig {
        ClientConfig::new()
            .with_host(&self.rabbit_host)
            .with_port(self.rabbit_port)
            .with_vhost(&self.rabbit_vhost)
            .with_credentials(&self.rabbit_user, &self.rabbit_password)
            .with_exchange(&self.rabbit_exchange)
            .with_timeout(Duration::from_millis(self.rabbit_timeout_ms))
            .with_reconnect(self.rabbit_reconnect)
    }

    fn server_options(&self) -> ServerOptions {
        ServerOptions {
            host: self.host.clone(),
            port: self.port,
            allow_origins: self.allow_origins.clone(),
            static_dir: self.static_dir.clone(),
        }
    }
}

fn init_logging(args: &Args) {
    let default_level = if args.debug { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let builder = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false);

    if args.json_logs {
        builder.json().init();
    } else {
        builder.compact().init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(&args);

    info!("Starting Nameko Gateway");

    let config = args.client_config();
    let client = if args.memory_broker {
        warn!("Using the in-process broker; calls only reach in-process workers");
        NamekoClient::builder(config)
            .broker(MemoryBroker::new().with_published_capacity(0))
            .connect()
            .await?
    } else {
        info!("Connecting to broker at {}", config.endpoint());
        NamekoClient::connect(config).await?
    };

    let addr = server::start_server(client.clone(), &args.server_options()).await?;

    // Port line for supervisors and tests (intentional stdout)
    println!("GATEWAY_PORT={}", addr.port());

    info!("Gateway running on {}", addr);

    // Wait for shutdown signal
    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received, exiting");
    client.close().await;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_client_defaults() {
        let args = Args::parse_from(["nameko-gateway"]);
        let config = args.client_config();
        let defaults = ClientConfig::default();

        assert_eq!(config.host, defaults.host);
        assert_eq!(config.port, defaults.port);
        assert_eq!(config.exchange, defaults.exchange);
        assert_eq!(config.timeout, defaults.timeout);
        assert!(config.reconnect);
    }

    #[test]
    fn test_broker_flags() {
        let args = Args::parse_from([
            "nameko-gateway",
            "--rabbit-host",
            "broker.internal",
            "--rabbit-timeout-ms",
            "250",
            "--rabbit-reconnect",
            "false",
            "--allow-origin",
            "http://a.test",
            "--allow-origin",
            "http://b.test",
        ]);
        let config = args.client_config();

        assert_eq!(config.host, "broker.internal");
        assert_eq!(config.timeout, Duration::from_millis(250));
        assert!(!config.reconnect);
        assert_eq!(
            args.server_options().allow_origins,
            vec!["http://a.test".to_string(), "http://b.test".to_string()]
        );
    }

    #[test]
    fn test_debug_redacts_password() {
        let args = Args::parse_from(["nameko-gateway", "--rabbit-password", "s3cret-pw"]);
        let printed = format!("{:?}", args);
        assert!(!printed.contains("s3cret-pw"));
        assert!(!format!("{:?}", args.client_config()).contains("s3cret-pw"));
    }

    #[test]
    fn test_args_definition_is_consistent() {
        use clap::CommandFactory;
        Args::command().debug_assert();
    }
}
