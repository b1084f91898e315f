//! /status, /responses, /scheduler, /reset handlers.

use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use serde::Serialize;

use pulse_services::NodeStatus;

use super::{node_error, ApiState, DeliveredResponse};

// ── /status ──────────────────────────────────────────────────────────────────

pub async fn handle_status(
    State(state): State<ApiState>,
) -> Result<Json<NodeStatus>, (StatusCode, String)> {
    let status = state.node.status().await.map_err(node_error)?;
    Ok(Json(status))
}

// ── /responses ───────────────────────────────────────────────────────────────

#[derive(Serialize)]
pub struct ResponsesResponse {
    pub device_id: String,
    pub responses: Vec<DeliveredResponse>,
}

pub async fn handle_responses(State(state): State<ApiState>) -> Json<ResponsesResponse> {
    let responses = state
        .responses
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .iter()
        .cloned()
        .collect();
    Json(ResponsesResponse {
        device_id: state.device_id.clone(),
        responses,
    })
}

// ── /scheduler/start, /scheduler/stop ────────────────────────────────────────

#[derive(Serialize)]
pub struct SchedulerResponse {
    pub running: bool,
    /// False when the request did not change anything.
    pub changed: bool,
}

pub async fn handle_scheduler_start(
    State(state): State<ApiState>,
) -> Result<Json<SchedulerResponse>, (StatusCode, String)> {
    let changed = state.node.start_scheduler().await.map_err(node_error)?;
    Ok(Json(SchedulerResponse {
        running: true,
        changed,
    }))
}

pub async fn handle_scheduler_stop(
    State(state): State<ApiState>,
) -> Result<Json<SchedulerResponse>, (StatusCode, String)> {
    let was_running = state
        .node
        .status()
        .await
        .map_err(node_error)?
        .scheduler_running;
    state.node.stop_scheduler().await.map_err(node_error)?;
    Ok(Json(SchedulerResponse {
        running: false,
        changed: was_running,
    }))
}

// ── /reset ───────────────────────────────────────────────────────────────────

#[derive(Serialize)]
pub struct ResetResponse {
    pub reset: bool,
}

pub async fn handle_reset(
    State(state): State<ApiState>,
) -> Result<Json<ResetResponse>, (StatusCode, String)> {
    state.node.reset().await.map_err(node_error)?;
    state
        .responses
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .clear();
    tracing::info!(device_id = %state.device_id, "reset requested over API");
    Ok(Json(ResetResponse { reset: true }))
}
