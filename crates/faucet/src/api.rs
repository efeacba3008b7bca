//! HTTP API for faucet service

use crate::dispatcher::Dispatcher;
use crate::error::{FaucetError, FaucetResult};
use crate::metrics::FaucetMetrics;
use crate::service::{FaucetResponse, FaucetService, FaucetStatus};
use axum::{
    extract::{rejection::JsonRejection, ConnectInfo, State},
    http::{header, HeaderMap},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{debug, info};

/// Shared handler state
#[derive(Clone)]
pub struct AppState {
    pub service: Arc<FaucetService>,
    pub dispatcher: Arc<Dispatcher>,
    pub metrics: Arc<FaucetMetrics>,
}

/// Funding request
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FundRequest {
    pub address: String,
}

/// Build the faucet router
pub fn router(state: AppState) -> Router {
    let cors_enabled = state.service.config().cors_enabled;

    let mut app = Router::new()
        .route("/", get(root_handler))
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .route("/api/status", get(status_handler))
        .route("/api/faucet", post(fund_handler))
        .with_state(state)
        .layer(TraceLayer::new_for_http());

    if cors_enabled {
        let cors = CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any);

        app = app.layer(cors);
        info!("CORS enabled");
    }

    app
}

/// Funding handler
pub async fn fund_handler(
    State(state): State<AppState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    payload: Result<Json<FundRequest>, JsonRejection>,
) -> Response {
    let client_key = client_key(
        &headers,
        peer,
        state.service.config().trust_forwarded_for,
    );

    let request = match payload {
        Ok(Json(request)) => request,
        Err(rejection) => {
            debug!("Malformed request from {}: {}", client_key, rejection);
            state.metrics.record_request("invalid");
            return FaucetError::InvalidRequest(rejection.body_text()).into_response();
        }
    };

    let now = state.service.now();
    match state.service.admit(&request.address, &client_key, now).await {
        Ok(message) => Json(FaucetResponse::success(message)).into_response(),
        Err(e) => e.into_response(),
    }
}

/// Rate limit bucket for a request: the first `X-Forwarded-For` hop when the
/// faucet sits behind a trusted proxy, the socket peer otherwise.
fn client_key(headers: &HeaderMap, peer: SocketAddr, trust_forwarded_for: bool) -> String {
    if trust_forwarded_for {
        let forwarded = headers
            .get("x-forwarded-for")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.split(',').next())
            .map(str::trim)
            .filter(|v| !v.is_empty());
        if let Some(first) = forwarded {
            return first.to_string();
        }
    }
    peer.ip().to_string()
}

/// Status handler
pub async fn status_handler(
    State(state): State<AppState>,
) -> Result<Json<FaucetStatus>, FaucetError> {
    let status = state.service.status(state.dispatcher.state()).await?;
    Ok(Json(status))
}

/// Health check handler
pub async fn health_handler() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "timestamp": chrono::Utc::now().to_rfc3339()
    }))
}

/// Prometheus scrape endpoint
pub async fn metrics_handler(State(state): State<AppState>) -> FaucetResult<impl IntoResponse> {
    let body = state.metrics.gather()?;
    Ok((
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        body,
    ))
}

/// Root handler with info
pub async fn root_handler() -> impl IntoResponse {
    Json(serde_json::json!({
        "name": "Empe Faucet",
        "version": env!("CARGO_PKG_VERSION"),
        "description": "Queued, batched token faucet",
        "endpoints": {
            "POST /api/faucet": "Request tokens",
            "GET /api/status": "Get faucet status",
            "GET /health": "Health check",
            "GET /metrics": "Prometheus metrics"
        }
    }))
}
