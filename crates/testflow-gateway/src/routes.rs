use std::sync::Arc;

use axum::extract::ws::{WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use testflow_core::error::FlowError;
use testflow_core::flow::Flow;
use testflow_core::types::{RunId, TestRun};
use testflow_engine::{resolve, RunLogger};

use crate::connection;
use crate::protocol::{ApiError, RunAccepted};
use crate::state::AppState;

type ApiResult<T> = Result<T, ApiError>;

// GET /api/health
pub async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

// ── Flows ───────────────────────────────────────────────────────

// GET /api/flows
pub async fn list_flows(State(state): State<Arc<AppState>>) -> ApiResult<Json<serde_json::Value>> {
    let flows = state.flows.list_flows().await?;
    Ok(Json(serde_json::json!({ "flows": flows })))
}

// POST /api/flows
pub async fn save_flow(
    State(state): State<Arc<AppState>>,
    Json(flow): Json<Flow>,
) -> ApiResult<(StatusCode, Json<Flow>)> {
    flow.validate()?;
    state.flows.save_flow(&flow).await?;
    info!(flow_id = %flow.id, nodes = flow.nodes.len(), "Flow saved");
    Ok((StatusCode::CREATED, Json(flow)))
}

// GET /api/flows/{id}
pub async fn get_flow(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<Json<Flow>> {
    match state.flows.get_flow(&id).await? {
        Some(flow) => Ok(Json(flow)),
        None => Err(ApiError::not_found(format!("flow {}", id))),
    }
}

// DELETE /api/flows/{id}
pub async fn delete_flow(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<StatusCode> {
    if state.flows.delete_flow(&id).await? {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(ApiError::not_found(format!("flow {}", id)))
    }
}

#[derive(Deserialize)]
pub struct HistoryQuery {
    #[serde(default = "default_limit")]
    pub limit: usize,
}

fn default_limit() -> usize {
    50
}

// GET /api/flows/{id}/runs?limit=50
pub async fn flow_runs(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Query(q): Query<HistoryQuery>,
) -> ApiResult<Json<serde_json::Value>> {
    let runs = state.runs.runs_for_flow(&id, q.limit).await?;
    Ok(Json(serde_json::json!({ "runs": runs })))
}

// ── Runs ────────────────────────────────────────────────────────

// POST /api/flows/{id}/run
pub async fn run_flow(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<(StatusCode, Json<RunAccepted>)> {
    let flow = state
        .flows
        .get_flow(&id)
        .await?
        .ok_or_else(|| ApiError::not_found(format!("flow {}", id)))?;
    launch(&state, flow)
}

// POST /api/runs: run an unsaved flow
pub async fn run_inline(
    State(state): State<Arc<AppState>>,
    Json(flow): Json<Flow>,
) -> ApiResult<(StatusCode, Json<RunAccepted>)> {
    launch(&state, flow)
}

// GET /api/runs/{id}
pub async fn get_run(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<(StatusCode, Json<serde_json::Value>)> {
    let run_id = RunId::from_string(&id);
    if let Some(run) = state.runs.get_run(&run_id).await? {
        let body = serde_json::to_value(&run).map_err(FlowError::from)?;
        return Ok((StatusCode::OK, Json(body)));
    }
    if state.is_active(&run_id) {
        return Ok((
            StatusCode::ACCEPTED,
            Json(serde_json::json!({ "id": run_id, "status": "running" })),
        ));
    }
    Err(ApiError::not_found(format!("run {}", id)))
}

// POST /api/runs/{id}/cancel
pub async fn cancel_run(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<(StatusCode, Json<serde_json::Value>)> {
    let run_id = RunId::from_string(&id);
    if state.cancel(&run_id) {
        info!(run_id = %run_id, "Run cancellation requested");
        Ok((
            StatusCode::ACCEPTED,
            Json(serde_json::json!({ "runId": run_id, "cancelled": true })),
        ))
    } else {
        Err(ApiError::not_found(format!("active run {}", id)))
    }
}

/// Start a run in the background. Structural errors are rejected up front so
/// the caller gets them synchronously instead of on the socket.
fn launch(state: &Arc<AppState>, flow: Flow) -> ApiResult<(StatusCode, Json<RunAccepted>)> {
    resolve(&flow)?;

    let handle = state.scheduler.start(flow.clone());
    let run_id = handle.run_id.clone();
    state.track(run_id.clone(), handle.cancel.clone());
    info!(run_id = %run_id, flow_id = %flow.id, "Run accepted");

    if let Some(dir) = &state.run_log_dir {
        let logger = RunLogger::new(dir.clone());
        let flow_id = flow.id.clone();
        let id = run_id.clone();
        let events = handle.events;
        tokio::spawn(async move {
            logger.run(&flow_id, id, events, CancellationToken::new()).await;
        });
    }

    let accepted = RunAccepted {
        run_id: run_id.clone(),
        flow_id: flow.id.clone(),
    };

    let state = Arc::clone(state);
    let join = handle.join;
    tokio::spawn(async move {
        match join.await {
            Ok(Ok(run)) => record(&state, run).await,
            Ok(Err(e)) => warn!(run_id = %run_id, error = %e, "Run aborted"),
            Err(e) => error!(run_id = %run_id, error = %e, "Run task failed"),
        }
        // Only after the record is readable, so polling never sees a gap.
        state.untrack(&run_id);
    });

    Ok((StatusCode::ACCEPTED, Json(accepted)))
}

/// Persist a finished run and copy its results onto the stored flow.
async fn record(state: &AppState, run: TestRun) {
    if let Err(e) = state.runs.save_run(&run).await {
        error!(run_id = %run.id, error = %e, "Failed to save run");
    }
    match state.flows.get_flow(&run.flow_id).await {
        Ok(Some(mut flow)) => {
            flow.apply_run(&run);
            if let Err(e) = state.flows.save_flow(&flow).await {
                error!(flow_id = %flow.id, error = %e, "Failed to update flow");
            }
        }
        Ok(None) => debug!(flow_id = %run.flow_id, "Run of unsaved flow, not updating"),
        Err(e) => error!(flow_id = %run.flow_id, error = %e, "Failed to load flow"),
    }
}

// ── WebSocket ───────────────────────────────────────────────────

#[derive(Deserialize)]
pub struct WsQuery {
    #[serde(rename = "runId")]
    pub run_id: String,
}

// GET /ws?runId=...
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    Query(q): Query<WsQuery>,
) -> impl IntoResponse {
    let run_id = RunId::from_string(&q.run_id);
    ws.on_upgrade(move |socket| handle_ws(socket, state, run_id))
}

async fn handle_ws(socket: WebSocket, state: Arc<AppState>, run_id: RunId) {
    info!(run_id = %run_id, "WebSocket client connected");
    connection::relay_run(socket, state, run_id).await;
    debug!("WebSocket client disconnected");
}
