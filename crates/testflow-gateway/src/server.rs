use std::sync::Arc;

use axum::routing::{get, post};
use axum::Router;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tracing::info;

use testflow_core::config::GatewayConfig;

use crate::routes;
use crate::state::AppState;

/// HTTP + WebSocket gateway built on axum.
pub struct GatewayServer {
    config: GatewayConfig,
    state: Arc<AppState>,
}

impl GatewayServer {
    pub fn new(config: GatewayConfig, state: Arc<AppState>) -> Self {
        Self { config, state }
    }

    /// Run the gateway server until the cancellation token is triggered.
    pub async fn run(&self, shutdown: CancellationToken) -> anyhow::Result<()> {
        let app = build_router(self.state.clone());

        let listener = TcpListener::bind(&self.config.bind).await?;
        info!(bind = %self.config.bind, "Gateway listening");

        axum::serve(listener, app)
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await?;

        info!("Gateway shut down");
        Ok(())
    }
}

pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        // WebSocket
        .route("/ws", get(routes::ws_handler))
        // REST API
        .route("/api/health", get(routes::health))
        .route("/api/flows", get(routes::list_flows).post(routes::save_flow))
        .route(
            "/api/flows/{id}",
            get(routes::get_flow).delete(routes::delete_flow),
        )
        .route("/api/flows/{id}/run", post(routes::run_flow))
        .route("/api/flows/{id}/runs", get(routes::flow_runs))
        .route("/api/runs", post(routes::run_inline))
        .route("/api/runs/{id}", get(routes::get_run))
        .route("/api/runs/{id}/cancel", post(routes::cancel_run))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use serde_json::{json, Value};
    use tower::ServiceExt;

    use testflow_core::config::FailurePolicy;
    use testflow_core::event::StatusBroadcaster;
    use testflow_core::flow::Flow;
    use testflow_engine::RunScheduler;
    use testflow_store::SqliteStore;
    use testflow_test_utils::{chain, engine_config, mock, slow_mock, verify_equals, StubTransport};

    fn app() -> Router {
        let scheduler = Arc::new(RunScheduler::with_transport(
            engine_config(4, FailurePolicy::Skip),
            Arc::new(StubTransport::new()),
            Arc::new(StatusBroadcaster::new(64)),
        ));
        let store = Arc::new(SqliteStore::in_memory().unwrap());
        build_router(Arc::new(AppState::new(scheduler, store.clone(), store, None)))
    }

    fn login_flow() -> Flow {
        chain(
            "login",
            vec![mock("m", json!({"status": 200})), verify_equals("v", json!({"status": 200}))],
        )
    }

    async fn send(app: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let request = Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json")
            .body(match body {
                Some(v) => Body::from(v.to_string()),
                None => Body::empty(),
            })
            .unwrap();
        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, value)
    }

    async fn wait_for_run(app: &Router, run_id: &str) -> Value {
        for _ in 0..200 {
            let (status, body) = send(app, "GET", &format!("/api/runs/{}", run_id), None).await;
            if status == StatusCode::OK {
                return body;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("run {run_id} never finished");
    }

    #[tokio::test]
    async fn test_health() {
        let (status, body) = send(&app(), "GET", "/api/health", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
    }

    #[tokio::test]
    async fn test_flow_crud() {
        let app = app();
        let flow = serde_json::to_value(login_flow()).unwrap();

        let (status, _) = send(&app, "POST", "/api/flows", Some(flow)).await;
        assert_eq!(status, StatusCode::CREATED);

        let (status, body) = send(&app, "GET", "/api/flows/login", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["nodes"].as_array().unwrap().len(), 2);

        let (_, body) = send(&app, "GET", "/api/flows", None).await;
        assert_eq!(body["flows"][0]["id"], "login");

        let (status, _) = send(&app, "DELETE", "/api/flows/login", None).await;
        assert_eq!(status, StatusCode::NO_CONTENT);
        let (status, body) = send(&app, "GET", "/api/flows/login", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["kind"], "not_found");
    }

    #[tokio::test]
    async fn test_rejects_dangling_edge() {
        let mut flow = serde_json::to_value(login_flow()).unwrap();
        flow["edges"][0]["target"] = json!("ghost");
        let (status, body) = send(&app(), "POST", "/api/flows", Some(flow)).await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(body["kind"], "invalid_flow");
    }

    #[tokio::test]
    async fn test_run_saved_flow_records_history() {
        let app = app();
        send(&app, "POST", "/api/flows", Some(serde_json::to_value(login_flow()).unwrap())).await;

        let (status, accepted) = send(&app, "POST", "/api/flows/login/run", None).await;
        assert_eq!(status, StatusCode::ACCEPTED);
        assert_eq!(accepted["flowId"], "login");
        let run_id = accepted["runId"].as_str().unwrap().to_string();

        let run = wait_for_run(&app, &run_id).await;
        assert_eq!(run["status"], "success");
        assert_eq!(run["node_results"]["v"]["status"], "success");

        let (_, history) = send(&app, "GET", "/api/flows/login/runs?limit=5", None).await;
        assert_eq!(history["runs"][0]["id"], run_id.as_str());

        let (_, flow) = send(&app, "GET", "/api/flows/login", None).await;
        assert_eq!(flow["nodes"][1]["status"], "success");
    }

    #[tokio::test]
    async fn test_inline_cycle_is_rejected() {
        let flow = Flow::new("loop", "Loop")
            .with_node(mock("a", json!(1)))
            .with_node(mock("b", json!(2)))
            .with_edge("a", "b")
            .with_edge("b", "a");
        let (status, body) = send(&app(), "POST", "/api/runs", Some(serde_json::to_value(flow).unwrap())).await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(body["kind"], "cyclic_graph");
    }

    #[tokio::test]
    async fn test_cancel_inline_run() {
        let app = app();
        let flow = chain("slow", vec![slow_mock("wait", json!(1), 30_000), mock("after", json!(2))]);
        let (status, accepted) = send(&app, "POST", "/api/runs", Some(serde_json::to_value(flow).unwrap())).await;
        assert_eq!(status, StatusCode::ACCEPTED);
        let run_id = accepted["runId"].as_str().unwrap().to_string();

        let (status, _) = send(&app, "POST", &format!("/api/runs/{}/cancel", run_id), None).await;
        assert_eq!(status, StatusCode::ACCEPTED);

        let run = wait_for_run(&app, &run_id).await;
        assert_eq!(run["status"], "failed");
        assert_eq!(run["error"], "Execution cancelled");
        assert_eq!(run["node_results"]["after"]["status"], "skipped");
    }

    #[tokio::test]
    async fn test_unknown_run() {
        let app = app();
        let (status, _) = send(&app, "GET", "/api/runs/nope", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        let (status, _) = send(&app, "POST", "/api/runs/nope/cancel", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }
}
