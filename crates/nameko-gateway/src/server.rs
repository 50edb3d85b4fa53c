//! HTTP server implementation using Axum.

use crate::handler::{handle_health, handle_rpc};
use anyhow::Context;
use axum::{
    http::{header, HeaderValue, Method},
    routing::{get, post},
    Router,
};
use nameko_client::NamekoClient;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

/// Application state shared across handlers.
pub struct AppState {
    /// RPC client all requests are forwarded through
    pub client: NamekoClient,
}

/// Listener and routing options.
#[derive(Debug, Clone)]
pub struct ServerOptions {
    pub host: String,
    /// Port to bind (0 = auto-assign)
    pub port: u16,
    /// Origins allowed by CORS. Empty allows any origin.
    pub allow_origins: Vec<String>,
    /// Directory served for paths no route matches.
    pub static_dir: Option<PathBuf>,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 0,
            allow_origins: Vec::new(),
            static_dir: None,
        }
    }
}

fn cors_layer(allow_origins: &[String]) -> anyhow::Result<CorsLayer> {
    let cors = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST])
        .allow_headers([header::CONTENT_TYPE]);

    if allow_origins.is_empty() {
        return Ok(cors.allow_origin(Any));
    }

    let origins = allow_origins
        .iter()
        .map(|origin| {
            HeaderValue::from_str(origin).with_context(|| format!("Invalid CORS origin '{}'", origin))
        })
        .collect::<anyhow::Result<Vec<_>>>()?;
    Ok(cors.allow_origin(AllowOrigin::list(origins)))
}

/// Build the gateway router.
pub fn build_router(state: Arc<AppState>, options: &ServerOptions) -> anyhow::Result<Router> {
    let mut app = Router::new()
        .route("/health", get(handle_health))
        .route("/rpc/:service/:method", post(handle_rpc));

    if let Some(dir) = &options.static_dir {
        info!("Serving static files from {}", dir.display());
        app = app.fallback_service(ServeDir::new(dir));
    }

    Ok(app
        .layer(cors_layer(&options.allow_origins)?)
        .layer(TraceLayer::new_for_http())
        .with_state(state))
}

/// Start the gateway HTTP server.
///
/// Returns the actual address the server is bound to (useful when port=0).
pub async fn start_server(client: NamekoClient, options: &ServerOptions) -> anyhow::Result<SocketAddr> {
    let state = Arc::new(AppState { client });
    let app = build_router(state, options)?;

    // Parse the address
    let addr: SocketAddr = format!("{}:{}", options.host, options.port).parse()?;

    // Bind to the address
    let listener = tokio::net::TcpListener::bind(addr).await?;
    let actual_addr = listener.local_addr()?;

    info!("Server listening on {}", actual_addr);

    // Spawn the server in the background
    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            error!("Server error: {}", e);
        }
    });

    Ok(actual_addr)
}
