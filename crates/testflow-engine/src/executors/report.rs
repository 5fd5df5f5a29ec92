use chrono::Utc;
use serde_json::json;

use testflow_core::flow::ReportConfig;

use crate::context::ContextView;

const DEFAULT_REPORT_NAME: &str = "Test Report";

/// Summarize every node that reached a terminal status before this one started.
pub fn execute(config: &ReportConfig, view: &ContextView) -> serde_json::Value {
    let name = config
        .report_name
        .as_deref()
        .filter(|n| !n.trim().is_empty())
        .unwrap_or(DEFAULT_REPORT_NAME);

    let nodes: Vec<serde_json::Value> = view
        .completed()
        .iter()
        .map(|(id, status)| json!({ "nodeId": id, "status": status }))
        .collect();

    json!({
        "name": name,
        "timestamp": Utc::now().to_rfc3339(),
        "nodes": nodes,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::ExecutionContext;
    use testflow_core::types::ExecutionStatus;

    #[test]
    fn test_empty_report_uses_default_name() {
        let out = execute(&ReportConfig::default(), &ContextView::default());
        assert_eq!(out["name"], "Test Report");
        assert_eq!(out["nodes"], json!([]));
        assert!(out["timestamp"].is_string());
    }

    #[test]
    fn test_lists_completed_nodes() {
        let mut ctx = ExecutionContext::new();
        ctx.set_status("api", ExecutionStatus::Success);
        ctx.set_status("check", ExecutionStatus::Failed);
        ctx.set_status("other", ExecutionStatus::Running);

        let config = ReportConfig {
            report_name: Some("Nightly".into()),
        };
        let out = execute(&config, &ctx.snapshot());
        assert_eq!(out["name"], "Nightly");
        assert_eq!(
            out["nodes"],
            json!([
                {"nodeId": "api", "status": "success"},
                {"nodeId": "check", "status": "failed"},
            ])
        );
    }
}
