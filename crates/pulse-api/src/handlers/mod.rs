//! HTTP API handlers: the application-facing side of the relay node.

pub mod relay;
pub mod status;

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use axum::http::StatusCode;
use serde::Serialize;
use tokio::sync::broadcast;

use pulse_services::{NodeError, NodeEvent, NodeHandle};

/// How many delivered responses `/responses` remembers.
const RESPONSE_LOG_LEN: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeliveredResponse {
    pub query_id: String,
    pub text: String,
    pub received_at: u64,
}

#[derive(Clone)]
pub struct ApiState {
    pub node: NodeHandle,
    pub device_id: String,
    /// Most recent responses, oldest first.
    pub responses: Arc<Mutex<VecDeque<DeliveredResponse>>>,
}

impl ApiState {
    /// Build the state and start recording delivered responses.
    pub fn new(node: NodeHandle, device_id: impl Into<String>) -> Self {
        let state = Self {
            responses: Arc::new(Mutex::new(VecDeque::with_capacity(RESPONSE_LOG_LEN))),
            device_id: device_id.into(),
            node,
        };

        let log = state.responses.clone();
        let mut events = state.node.subscribe();
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(NodeEvent::Response { query_id, text }) => {
                        let mut log = log.lock().unwrap_or_else(|e| e.into_inner());
                        if log.len() == RESPONSE_LOG_LEN {
                            log.pop_front();
                        }
                        log.push_back(DeliveredResponse {
                            query_id,
                            text,
                            received_at: pulse_core::message::unix_millis(),
                        });
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        tracing::warn!(skipped = n, "response log lagged behind node events");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        state
    }
}

// ── Shared helpers ────────────────────────────────────────────────────────────

fn node_error(e: NodeError) -> (StatusCode, String) {
    let status = match e {
        NodeError::Closed => StatusCode::SERVICE_UNAVAILABLE,
        NodeError::Wire(_) | NodeError::Payload(_) => StatusCode::BAD_REQUEST,
        NodeError::Transport(_) => StatusCode::BAD_GATEWAY,
    };
    (status, e.to_string())
}

pub use relay::{handle_heartbeat, handle_query, handle_report, handle_response};
pub use status::{
    handle_reset, handle_responses, handle_scheduler_start, handle_scheduler_stop, handle_status,
};
