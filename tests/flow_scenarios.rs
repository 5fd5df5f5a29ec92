//! End-to-end runs of flows written in their JSON wire form.

use std::sync::Arc;

use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use testflow_core::config::{ApiMode, AppConfig, FailurePolicy};
use testflow_core::event::StatusBroadcaster;
use testflow_core::flow::Flow;
use testflow_core::types::{ExecutionStatus, RunId, TestRun};
use testflow_engine::{resolve, RunLogger, RunScheduler};
use testflow_test_utils::collect_events;

fn parse(flow: Value) -> Flow {
    serde_json::from_value(flow).expect("valid flow json")
}

fn simulated(policy: FailurePolicy) -> AppConfig {
    let mut config = AppConfig::default();
    config.engine.api_mode = ApiMode::Simulated;
    config.engine.failure_policy = policy;
    config
}

async fn run(config: &AppConfig, flow: Flow) -> TestRun {
    let broadcaster = Arc::new(StatusBroadcaster::new(64));
    let scheduler = Arc::new(RunScheduler::new(config, broadcaster).expect("scheduler"));
    let handle = scheduler.start(flow);
    handle.join.await.expect("join").expect("run")
}

fn checkout_flow() -> Value {
    json!({
        "id": "checkout",
        "name": "Checkout",
        "nodes": [
            { "id": "login", "type": "api", "label": "Login",
              "config": { "method": "POST", "url": "https://shop.test/login",
                          "body": "{\"user\":\"ada\"}" } },
            { "id": "cart", "type": "mock", "label": "Cart",
              "config": { "mockResponse": { "items": 2, "total": "19.90" }, "mockDelay": 5 } },
            { "id": "logged-in", "type": "verification", "label": "Logged in",
              "config": { "assertionType": "equals", "source": "login",
                          "path": "/body/requestBody/user", "expected": "ada" } },
            { "id": "total", "type": "verification", "label": "Total",
              "config": { "assertionType": "regex", "source": "cart",
                          "path": "/total", "expected": "^\\d+\\.\\d{2}$" } },
            { "id": "two-items", "type": "verification",
              "config": { "assertionType": "custom", "source": "cart",
                          "customScript": "actual.items == 2 and nodes.login.status == 200" } },
            { "id": "summary", "type": "report", "config": { "reportName": "Checkout report" } }
        ],
        "edges": [
            { "id": "e1", "source": "login", "target": "logged-in" },
            { "id": "e2", "source": "cart", "target": "total" },
            { "id": "e3", "source": "login", "target": "two-items" },
            { "id": "e4", "source": "cart", "target": "two-items" },
            { "id": "e5", "source": "logged-in", "target": "summary" },
            { "id": "e6", "source": "total", "target": "summary" },
            { "id": "e7", "source": "two-items", "target": "summary" }
        ]
    })
}

#[tokio::test]
async fn test_checkout_flow_succeeds() {
    let run = run(&simulated(FailurePolicy::Skip), parse(checkout_flow())).await;

    assert_eq!(run.status, ExecutionStatus::Success, "{:?}", run.error);
    assert_eq!(run.node_results.len(), 6);
    assert_eq!(run.count(ExecutionStatus::Success), 6);

    let login = run.node_results["login"].output.as_ref().unwrap();
    assert_eq!(login["status"], 200);
    assert_eq!(login["body"]["method"], "POST");

    let report = run.node_results["summary"].output.as_ref().unwrap();
    assert_eq!(report["name"], "Checkout report");
    assert_eq!(report["nodes"].as_array().unwrap().len(), 5);
}

#[tokio::test]
async fn test_failed_assertion_skips_report() {
    let mut flow = checkout_flow();
    flow["nodes"][2]["config"]["expected"] = json!("grace");

    let run = run(&simulated(FailurePolicy::Skip), parse(flow)).await;

    assert_eq!(run.status, ExecutionStatus::Failed);
    let failed = &run.node_results["logged-in"];
    assert_eq!(failed.status, ExecutionStatus::Failed);
    assert_eq!(failed.output.as_ref().unwrap()["actual"], "ada");
    assert_eq!(run.node_results["summary"].status, ExecutionStatus::Skipped);
    assert_eq!(run.node_results["total"].status, ExecutionStatus::Success);
}

#[tokio::test]
async fn test_continue_policy_still_reports() {
    let mut flow = checkout_flow();
    flow["nodes"][2]["config"]["expected"] = json!("grace");

    let run = run(&simulated(FailurePolicy::Continue), parse(flow)).await;

    assert_eq!(run.status, ExecutionStatus::Failed);
    assert_eq!(run.node_results["summary"].status, ExecutionStatus::Success);
    let report = run.node_results["summary"].output.as_ref().unwrap();
    let statuses: Vec<&str> = report["nodes"]
        .as_array()
        .unwrap()
        .iter()
        .filter_map(|n| n["status"].as_str())
        .collect();
    assert!(statuses.contains(&"failed"));
}

#[tokio::test]
async fn test_unknown_node_kind_fails_only_that_node() {
    let flow = parse(json!({
        "id": "legacy",
        "name": "Legacy",
        "nodes": [
            { "id": "hook", "type": "webhook", "config": { "url": "https://x.test" } },
            { "id": "ping", "type": "mock", "config": null }
        ],
        "edges": []
    }));

    let run = run(&simulated(FailurePolicy::Skip), flow).await;

    assert_eq!(run.status, ExecutionStatus::Failed);
    assert_eq!(run.node_results["hook"].status, ExecutionStatus::Failed);
    assert_eq!(run.node_results["ping"].status, ExecutionStatus::Success);
    assert_eq!(
        run.node_results["ping"].output.as_ref().unwrap(),
        &json!({ "status": 200 })
    );
}

#[test]
fn test_cycle_is_reported_before_running() {
    let flow = parse(json!({
        "id": "loop",
        "name": "Loop",
        "nodes": [
            { "id": "a", "type": "mock" },
            { "id": "b", "type": "mock" }
        ],
        "edges": [
            { "source": "a", "target": "b" },
            { "source": "b", "target": "a" }
        ]
    }));

    let err = resolve(&flow).unwrap_err();
    assert_eq!(err.kind(), "cyclic_graph");
}

#[tokio::test]
async fn test_run_log_records_every_event() {
    let dir = tempfile::tempdir().unwrap();
    let broadcaster = Arc::new(StatusBroadcaster::new(64));
    let scheduler = Arc::new(
        RunScheduler::new(&simulated(FailurePolicy::Skip), broadcaster.clone()).unwrap(),
    );

    let run_id = RunId::new();
    let rx = broadcaster.subscribe(&run_id);
    let logger = RunLogger::new(dir.path().to_path_buf());
    let id = run_id.clone();
    let log_task = tokio::spawn(async move {
        logger.run("checkout", id, rx, CancellationToken::new()).await
    });

    let handle = scheduler.start_as(parse(checkout_flow()), run_id);
    let events = collect_events(handle.events).await;
    let run = handle.join.await.unwrap().unwrap();
    assert!(run.succeeded());

    let path = log_task.await.unwrap().expect("log written");
    let content = std::fs::read_to_string(path).unwrap();
    let lines: Vec<Value> = content
        .lines()
        .map(|l| serde_json::from_str(l).unwrap())
        .collect();

    assert_eq!(lines.len(), events.len());
    assert_eq!(lines.last().unwrap()["event_type"], "run_complete");
    assert_eq!(lines.last().unwrap()["status"], "success");
}

#[tokio::test]
async fn test_editor_saved_flow_runs() {
    let flow = parse(json!({
        "id": "editor",
        "name": "Editor",
        "tags": null,
        "nodes": [
            { "id": "n1", "type": "custom", "position": { "x": 0, "y": 0 },
              "data": { "type": "mock", "label": "Stub",
                        "config": { "mockResponse": { "status": 200 } } } },
            { "id": "n2", "type": "custom", "position": { "x": 0, "y": 0 },
              "data": { "type": "mock", "label": "Other",
                        "config": { "mockResponse": { "status": 500 } } } },
            { "id": "n3", "type": "custom", "position": { "x": 200, "y": 0 },
              "data": { "type": "verification", "label": "Check",
                        "config": { "assertionType": "equals", "expected": { "status": 200 } } } }
        ],
        "edges": [{ "id": "e1", "source": "n1", "target": "n3" }]
    }));

    for limit in [1, 4] {
        let mut config = simulated(FailurePolicy::Skip);
        config.engine.max_concurrency = limit;
        let run = run(&config, flow.clone()).await;
        assert_eq!(run.status, ExecutionStatus::Success, "limit {limit}: {:?}", run.node_results);
    }
}
