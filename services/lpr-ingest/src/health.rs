use crate::broker::{ConnectionManager, ConnectionState};
use crate::config::ApiConfig;
use crate::store::RecordStore;
use anyhow::{Context, Result};
use axum::{extract::State, http::StatusCode, response::IntoResponse, routing::get, Json, Router};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::info;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub broker: Arc<ConnectionManager>,
    pub store: Arc<dyn RecordStore>,
}

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/ready", get(readiness_check))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Liveness endpoint
async fn health_check() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "healthy",
        "service": "lpr-ingest"
    }))
}

/// Ready once the broker is connected and the database answers
async fn readiness_check(State(state): State<AppState>) -> impl IntoResponse {
    let broker_ok = state.broker.health_check();
    let database = state.store.ping().await;

    let status = if broker_ok && database.is_ok() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    let broker = match state.broker.state() {
        ConnectionState::Connected if broker_ok => "connected",
        ConnectionState::Connecting => "connecting",
        _ => "disconnected",
    };

    let mut body = serde_json::json!({
        "status": if status == StatusCode::OK { "ready" } else { "not_ready" },
        "broker": broker,
        "database": if database.is_ok() { "connected" } else { "disconnected" },
    });
    if let Err(e) = database {
        body["error"] = serde_json::Value::String(e.to_string());
    }

    (status, Json(body))
}

/// Serve health endpoints until shutdown
pub async fn start_api_server(state: AppState, config: &ApiConfig, shutdown: CancellationToken) -> Result<()> {
    let router = create_router(state);
    let addr = format!("{}:{}", config.host, config.port);

    info!(address = %addr, "Starting health API server");

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .context("Failed to bind to address")?;

    axum::serve(listener, router)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .context("API server error")?;

    Ok(())
}
