use std::collections::BTreeMap;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};

use testflow_core::error::FlowError;
use testflow_core::types::{ExecutionStatus, RunId, StatusEvent, TestRun};

/// Body of a `202 Accepted` run submission.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunAccepted {
    pub run_id: RunId,
    pub flow_id: String,
}

/// A frame sent on the run socket when there is nothing to relay.
#[derive(Debug, Serialize)]
pub struct ErrorFrame {
    #[serde(rename = "type")]
    pub frame_type: &'static str,
    pub message: String,
}

impl ErrorFrame {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            frame_type: "error",
            message: message.into(),
        }
    }
}

/// The `run_complete` event a finished run would have published.
pub fn completion_event(run: &TestRun) -> StatusEvent {
    let node_durations: BTreeMap<String, u64> = run
        .node_results
        .iter()
        .filter(|(_, r)| r.status != ExecutionStatus::Skipped)
        .map(|(id, r)| (id.clone(), r.duration_ms))
        .collect();
    StatusEvent::RunComplete {
        run_id: run.id.clone(),
        status: run.status,
        error: run.error.clone(),
        duration_ms: run.duration_ms,
        node_durations,
    }
}

/// JSON error response: `{"error": "...", "kind": "..."}`.
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub message: String,
    pub kind: &'static str,
}

impl ApiError {
    pub fn not_found(what: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            message: what.into(),
            kind: "not_found",
        }
    }
}

impl From<FlowError> for ApiError {
    fn from(e: FlowError) -> Self {
        let status = match &e {
            FlowError::NotFound(_) => StatusCode::NOT_FOUND,
            e if e.is_structural() => StatusCode::UNPROCESSABLE_ENTITY,
            FlowError::InvalidConfig { .. } | FlowError::UnsupportedNodeKind(_) => {
                StatusCode::UNPROCESSABLE_ENTITY
            }
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self {
            status,
            message: e.to_string(),
            kind: e.kind(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (
            self.status,
            Json(serde_json::json!({ "error": self.message, "kind": self.kind })),
        )
            .into_response()
    }
}
