//! API request handlers

use crate::config::DsmeConfig;
use crate::engine::StateSnapshot;
use axum::{extract::State, http::StatusCode, Json};
use serde::Serialize;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::watch;
use utoipa::ToSchema;

/// API error response (RFC 7807 problem+json format).
#[derive(Debug, Serialize, ToSchema)]
pub struct ErrorResponse {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub r#type: Option<String>,
    pub title: String,
    pub status: u16,
    pub detail: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instance: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", rename = "requestId")]
    pub request_id: Option<String>,
}

impl ErrorResponse {
    pub fn new(status: StatusCode, detail: String) -> Self {
        Self {
            r#type: None,
            title: status.canonical_reason().unwrap_or("Error").to_string(),
            status: status.as_u16(),
            detail,
            instance: None,
            request_id: None,
        }
    }
}

/// Health check response.
#[derive(Debug, Serialize, ToSchema)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub uptime_secs: u64,
}

/// Shared state handed to every route handler.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<DsmeConfig>,
    pub snapshot_rx: watch::Receiver<StateSnapshot>,
    pub bus: crate::bus::Bus,
    pub started_at: Instant,
}

/// Health check endpoint.
#[utoipa::path(
    get,
    path = "/health",
    responses(
        (status = 200, description = "Service is healthy", body = HealthResponse)
    ),
    tag = "health"
)]
pub async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_secs: state.started_at.elapsed().as_secs(),
    })
}

/// Current device state, runlevel and condition bits.
#[utoipa::path(
    get,
    path = "/api/v1/state",
    responses(
        (status = 200, description = "Current engine state", body = StateSnapshot)
    ),
    tag = "state"
)]
pub async fn get_state(State(state): State<AppState>) -> Json<StateSnapshot> {
    Json(state.snapshot_rx.borrow().clone())
}

/// Effective daemon configuration.
#[utoipa::path(
    get,
    path = "/api/v1/config",
    responses(
        (status = 200, description = "Effective configuration", body = DsmeConfig)
    ),
    tag = "config"
)]
pub async fn get_config(State(state): State<AppState>) -> Json<DsmeConfig> {
    Json((*state.config).clone())
}
