//! HTTP request handlers.

use crate::server::AppState;
use axum::{
    body::Bytes,
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use nameko_client::RpcError;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use std::sync::Arc;
use tracing::{debug, warn};

/// Body of `POST /rpc/:service/:method`. Both fields may be omitted.
#[derive(Debug, Default, Deserialize)]
pub struct CallRequest {
    #[serde(default)]
    pub args: Vec<Value>,
    #[serde(default)]
    pub kwargs: Map<String, Value>,
}

impl CallRequest {
    /// Parse a request body; an empty body means no arguments.
    pub fn from_body(body: &[u8]) -> Result<Self, RpcError> {
        if body.iter().all(u8::is_ascii_whitespace) {
            return Ok(Self::default());
        }
        serde_json::from_slice(body).map_err(|e| RpcError::Validation {
            field: "body".to_string(),
            message: e.to_string(),
        })
    }
}

/// HTTP status for a failed call.
pub fn status_for(err: &RpcError) -> StatusCode {
    match err {
        RpcError::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,
        RpcError::Remote { .. } | RpcError::Json { .. } => StatusCode::BAD_GATEWAY,
        RpcError::Validation { .. } => StatusCode::BAD_REQUEST,
        RpcError::NotReady { .. }
        | RpcError::SessionClosed
        | RpcError::Publish { .. }
        | RpcError::Connection { .. }
        | RpcError::Exchange { .. }
        | RpcError::Queue { .. } => StatusCode::SERVICE_UNAVAILABLE,
        RpcError::Config { .. } => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn error_response(err: &RpcError) -> (StatusCode, Json<Value>) {
    (status_for(err), Json(json!({ "error": err.to_wire() })))
}

/// Health check endpoint. Reports the broker session state.
pub async fn handle_health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let session = state.client.state();
    let (status, label) = if session.is_ready() {
        (StatusCode::OK, "ok")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "unavailable")
    };
    (
        status,
        Json(json!({
            "status": label,
            "session": session.as_str(),
            "pending_calls": state.client.pending_calls(),
        })),
    )
}

/// Forward one HTTP request as a call to `service.method`.
pub async fn handle_rpc(
    State(state): State<Arc<AppState>>,
    Path((service, method)): Path<(String, String)>,
    body: Bytes,
) -> impl IntoResponse {
    let request = match CallRequest::from_body(&body) {
        Ok(request) => request,
        Err(e) => {
            warn!("Rejecting {}.{}: {}", service, method, e);
            return error_response(&e);
        }
    };

    debug!("RPC call: {}.{}({:?})", service, method, request.args);

    match state
        .client
        .call(&service, &method, request.args, request.kwargs)
        .await
    {
        Ok(result) => (StatusCode::OK, Json(json!({ "result": result }))),
        Err(e) => {
            warn!("RPC error for {}.{}: {}", service, method, e);
            error_response(&e)
        }
    }
}
