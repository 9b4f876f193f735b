// Local status server
//
// Read-only view of a running daemon for `agentlink daemon status` and
// scrapers. Binds to localhost by default.
//
//   GET /health   → JSON: machine id, stream health, registered agents
//   GET /metrics  → prometheus text exposition

use anyhow::{Context, Result};
use axum::{
    extract::State,
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;

use crate::bus::Presence;
use crate::daemon::AgentRegistry;
use crate::metrics::METRICS;
use crate::stream::{StreamConnection, StreamHealth};

#[derive(Clone)]
pub struct StatusState {
    pub machine_id: String,
    pub stream: Arc<StreamConnection>,
    pub registry: AgentRegistry,
    pub started_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentStatus {
    pub id: String,
    pub session_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub project_path: Option<String>,
    pub presence: Presence,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthReport {
    /// "ok" when the stream is connected, otherwise "degraded"
    pub status: &'static str,
    pub machine_id: String,
    pub version: &'static str,
    pub started_at: DateTime<Utc>,
    pub stream: StreamHealth,
    pub agents: Vec<AgentStatus>,
}

pub fn create_router(state: StatusState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/metrics", get(metrics_endpoint))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

pub async fn health_check(State(state): State<StatusState>) -> Json<HealthReport> {
    let now = Utc::now();
    let stream = state.stream.health();
    let agents = state
        .registry
        .agents()
        .await
        .into_iter()
        .map(|agent| AgentStatus {
            presence: agent.presence(now),
            id: agent.id,
            session_id: agent.session_id,
            session_name: agent.session_name,
            project_path: agent.project_path,
        })
        .collect();

    Json(HealthReport {
        status: if stream.connected { "ok" } else { "degraded" },
        machine_id: state.machine_id.clone(),
        version: env!("CARGO_PKG_VERSION"),
        started_at: state.started_at,
        stream,
        agents,
    })
}

pub async fn metrics_endpoint() -> Response {
    match METRICS.render() {
        Ok(body) => (
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            body,
        )
            .into_response(),
        Err(e) => {
            tracing::error!(error = %e, "failed to encode metrics");
            (StatusCode::INTERNAL_SERVER_ERROR, "Error encoding metrics").into_response()
        }
    }
}

/// Serve until `cancel` fires.
pub async fn serve(bind_address: &str, state: StatusState, cancel: CancellationToken) -> Result<()> {
    let addr: SocketAddr = bind_address
        .parse()
        .with_context(|| format!("Invalid status server address: {}", bind_address))?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind status server to {}", addr))?;
    tracing::info!(%addr, "status server listening");

    axum::serve(listener, create_router(state))
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await
        .context("Status server failed")?;
    Ok(())
}
