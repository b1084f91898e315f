//! /query, /response, /report, /heartbeat handlers.

use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use serde::{Deserialize, Serialize};

use pulse_core::{Location, QueryKind};
use pulse_services::{NewQuery, NewReport};

use super::{node_error, ApiState};

// ── /query (POST) ─────────────────────────────────────────────────────────────

#[derive(Deserialize)]
pub struct QueryRequest {
    pub text: String,
    #[serde(default)]
    pub kind: Option<QueryKind>,
    #[serde(default)]
    pub location: Option<Location>,
    #[serde(default)]
    pub extra: Option<serde_json::Value>,
    #[serde(default)]
    pub query_id: Option<String>,
}

#[derive(Serialize)]
pub struct QueryResponse {
    pub query_id: String,
}

pub async fn handle_query(
    State(state): State<ApiState>,
    Json(req): Json<QueryRequest>,
) -> Result<Json<QueryResponse>, (StatusCode, String)> {
    if req.text.trim().is_empty() {
        return Err((StatusCode::BAD_REQUEST, "text is required".to_string()));
    }
    let query = NewQuery {
        query_id: req.query_id.filter(|id| !id.is_empty()),
        text: req.text,
        kind: req.kind.unwrap_or(QueryKind::Assistant),
        location: req.location,
        extra: req.extra,
    };
    let query_id = state.node.send_query(query).await.map_err(node_error)?;
    Ok(Json(QueryResponse { query_id }))
}

// ── /response (POST) ──────────────────────────────────────────────────────────

#[derive(Deserialize)]
pub struct ResponseRequest {
    pub query_id: String,
    pub text: String,
}

#[derive(Serialize)]
pub struct OkResponse {
    pub ok: bool,
}

pub async fn handle_response(
    State(state): State<ApiState>,
    Json(req): Json<ResponseRequest>,
) -> Result<Json<OkResponse>, (StatusCode, String)> {
    if req.query_id.is_empty() {
        return Err((StatusCode::BAD_REQUEST, "query_id is required".to_string()));
    }
    state
        .node
        .send_response(&req.query_id, &req.text)
        .await
        .map_err(node_error)?;
    Ok(Json(OkResponse { ok: true }))
}

// ── /report (POST) ────────────────────────────────────────────────────────────

#[derive(Deserialize)]
pub struct ReportRequest {
    pub report_type: String,
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub location: Option<Location>,
    #[serde(default)]
    pub severity: Option<u8>,
    #[serde(default)]
    pub report_id: Option<String>,
}

#[derive(Serialize)]
pub struct ReportResponse {
    pub report_id: String,
}

pub async fn handle_report(
    State(state): State<ApiState>,
    Json(req): Json<ReportRequest>,
) -> Result<Json<ReportResponse>, (StatusCode, String)> {
    if let Some(severity) = req.severity {
        if !(1..=5).contains(&severity) {
            return Err((
                StatusCode::BAD_REQUEST,
                "severity must be between 1 and 5".to_string(),
            ));
        }
    }
    let report = NewReport {
        report_id: req.report_id.filter(|id| !id.is_empty()),
        report_type: req.report_type,
        title: req.title,
        description: req.description,
        location: req.location,
        severity: req.severity,
    };
    let report_id = state.node.send_report(report).await.map_err(node_error)?;
    Ok(Json(ReportResponse { report_id }))
}

// ── /heartbeat (POST) ─────────────────────────────────────────────────────────

pub async fn handle_heartbeat(
    State(state): State<ApiState>,
) -> Result<Json<OkResponse>, (StatusCode, String)> {
    state.node.announce_presence().await.map_err(node_error)?;
    Ok(Json(OkResponse { ok: true }))
}
