//! Shared fixtures for testflow tests: node and flow builders, a recording
//! HTTP stub, event collection and temporary config files.

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use chrono::Utc;
use futures::future::BoxFuture;
use serde_json::Value;
use tokio::sync::broadcast;

use testflow_core::config::{AppConfig, EngineConfig, FailurePolicy};
use testflow_core::error::{FlowError, Result};
use testflow_core::flow::{
    ApiConfig, Flow, MockConfig, Node, ReportConfig, Step, VerificationConfig,
};
use testflow_core::traits::HttpTransport;
use testflow_core::types::{
    ExecutionStatus, HttpRequest, HttpResponse, NodeResult, RunId, StatusEvent, TestRun,
};

// ── Nodes and flows ────────────────────────────────────────────

pub fn mock(id: &str, response: Value) -> Node {
    Node::new(id, id, Step::Mock(MockConfig::responding(response)))
}

pub fn slow_mock(id: &str, response: Value, delay_ms: u64) -> Node {
    Node::new(
        id,
        id,
        Step::Mock(MockConfig::responding(response).with_delay_ms(delay_ms)),
    )
}

pub fn verify_equals(id: &str, expected: Value) -> Node {
    Node::new(id, id, Step::Verification(VerificationConfig::equals(expected)))
}

pub fn api(id: &str, method: &str, url: &str) -> Node {
    Node::new(id, id, Step::Api(ApiConfig::new(method, url)))
}

pub fn report(id: &str) -> Node {
    Node::new(id, id, Step::Report(ReportConfig::default()))
}

/// A flow whose nodes run one after another in the given order.
pub fn chain(flow_id: &str, nodes: Vec<Node>) -> Flow {
    let ids: Vec<String> = nodes.iter().map(|n| n.id.clone()).collect();
    let mut flow = Flow::new(flow_id, flow_id);
    for node in nodes {
        flow = flow.with_node(node);
    }
    for pair in ids.windows(2) {
        flow = flow.with_edge(pair[0].clone(), pair[1].clone());
    }
    flow
}

pub fn engine_config(max_concurrency: usize, failure_policy: FailurePolicy) -> EngineConfig {
    EngineConfig {
        max_concurrency,
        failure_policy,
        ..Default::default()
    }
}

/// A finished run record with one result per `(node_id, status)` pair.
pub fn sample_run(flow_id: &str, nodes: &[(&str, ExecutionStatus)]) -> TestRun {
    let node_results: HashMap<String, NodeResult> = nodes
        .iter()
        .map(|(id, status)| {
            (
                id.to_string(),
                NodeResult {
                    status: *status,
                    output: None,
                    error: None,
                    error_kind: None,
                    duration_ms: 1,
                },
            )
        })
        .collect();
    let status = if nodes.iter().all(|(_, s)| *s == ExecutionStatus::Success) {
        ExecutionStatus::Success
    } else {
        ExecutionStatus::Failed
    };
    let now = Utc::now();
    TestRun {
        id: RunId::new(),
        flow_id: flow_id.to_string(),
        flow_name: None,
        status,
        started_at: now,
        completed_at: Some(now),
        duration_ms: Some(nodes.len() as u64),
        node_results,
        error: None,
    }
}

// ── HTTP stub ──────────────────────────────────────────────────

/// Records every request and answers with a canned response or error.
#[derive(Clone)]
pub struct StubTransport {
    requests: Arc<Mutex<Vec<HttpRequest>>>,
    reply: std::result::Result<HttpResponse, String>,
}

impl StubTransport {
    /// Answers `200 {}` to everything.
    pub fn new() -> Self {
        Self {
            requests: Arc::new(Mutex::new(Vec::new())),
            reply: Ok(response(200, "{}")),
        }
    }

    pub fn respond_with(mut self, status: u16, body: &str) -> Self {
        self.reply = Ok(response(status, body));
        self
    }

    /// Fail every request as a network error would.
    pub fn fail_with(mut self, message: &str) -> Self {
        self.reply = Err(message.to_string());
        self
    }

    pub fn requests(&self) -> Vec<HttpRequest> {
        self.requests.lock().unwrap().clone()
    }
}

impl Default for StubTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl HttpTransport for StubTransport {
    fn send(&self, request: HttpRequest) -> BoxFuture<'_, Result<HttpResponse>> {
        self.requests.lock().unwrap().push(request);
        let reply = self.reply.clone().map_err(FlowError::Execution);
        Box::pin(async move { reply })
    }

    fn name(&self) -> &str {
        "stub"
    }
}

fn response(status: u16, body: &str) -> HttpResponse {
    let mut headers = BTreeMap::new();
    headers.insert("content-type".to_string(), "application/json".to_string());
    HttpResponse {
        status,
        status_text: String::new(),
        headers,
        body: body.to_string(),
    }
}

// ── Events ─────────────────────────────────────────────────────

/// Drain a run subscription until its channel closes.
pub async fn collect_events(mut rx: broadcast::Receiver<StatusEvent>) -> Vec<StatusEvent> {
    let mut events = Vec::new();
    loop {
        match rx.recv().await {
            Ok(event) => events.push(event),
            Err(broadcast::error::RecvError::Lagged(_)) => continue,
            Err(broadcast::error::RecvError::Closed) => return events,
        }
    }
}

// ── Config ─────────────────────────────────────────────────────

/// Write a config file into a fresh temp dir. Keep the `TempDir` alive.
pub fn temp_config(contents: &str) -> (tempfile::TempDir, PathBuf) {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("testflow.toml");
    std::fs::write(&path, contents).unwrap();
    (dir, path)
}

/// Serialize a config the way it would be written to disk.
pub fn config_toml(config: &AppConfig) -> String {
    toml::to_string(config).unwrap()
}
