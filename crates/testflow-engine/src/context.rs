use std::collections::HashMap;
use std::sync::Arc;

use testflow_core::types::ExecutionStatus;

/// Per-run mutable state: captured outputs and statuses keyed by node id.
///
/// Owned by exactly one scheduler invocation. Executors never see it
/// directly; they get a [`ContextView`] snapshot taken when they start.
#[derive(Debug, Default)]
pub struct ExecutionContext {
    outputs: HashMap<String, serde_json::Value>,
    statuses: HashMap<String, ExecutionStatus>,
    /// Node ids in the order their outputs were captured.
    captured: Vec<String>,
    /// Node ids in the order they reached a terminal status.
    completed: Vec<String>,
}

impl ExecutionContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_status(&mut self, node_id: &str, status: ExecutionStatus) {
        let previous = self.statuses.insert(node_id.to_string(), status);
        let was_terminal = previous.is_some_and(|s| s.is_terminal());
        if status.is_terminal() && !was_terminal {
            self.completed.push(node_id.to_string());
        }
    }

    pub fn status(&self, node_id: &str) -> ExecutionStatus {
        self.statuses.get(node_id).copied().unwrap_or_default()
    }

    /// Store a node's output. A later capture for the same node replaces it.
    pub fn capture(&mut self, node_id: &str, output: serde_json::Value) {
        if self.outputs.insert(node_id.to_string(), output).is_some() {
            self.captured.retain(|id| id != node_id);
        }
        self.captured.push(node_id.to_string());
    }

    /// Read-only snapshot with no upstream scope.
    pub fn snapshot(&self) -> ContextView {
        self.snapshot_for(Vec::new())
    }

    /// Read-only snapshot handed to an executor whose direct dependencies
    /// are `upstream`.
    pub fn snapshot_for(&self, upstream: Vec<String>) -> ContextView {
        ContextView {
            inner: Arc::new(ViewData {
                outputs: self.outputs.clone(),
                captured: self.captured.clone(),
                upstream,
                completed: self
                    .completed
                    .iter()
                    .map(|id| (id.clone(), self.status(id)))
                    .collect(),
            }),
        }
    }
}

#[derive(Debug, Default)]
struct ViewData {
    outputs: HashMap<String, serde_json::Value>,
    captured: Vec<String>,
    upstream: Vec<String>,
    completed: Vec<(String, ExecutionStatus)>,
}

/// Immutable view of an [`ExecutionContext`] at the moment a node started.
///
/// Every dependency of that node is terminal by then, so its output (if it
/// succeeded) is always visible here.
#[derive(Debug, Clone, Default)]
pub struct ContextView {
    inner: Arc<ViewData>,
}

impl ContextView {
    pub fn output(&self, node_id: &str) -> Option<&serde_json::Value> {
        self.inner.outputs.get(node_id)
    }

    /// The most recently captured output, if any.
    pub fn latest_output(&self) -> Option<(&str, &serde_json::Value)> {
        let id = self.inner.captured.last()?;
        self.inner.outputs.get(id).map(|v| (id.as_str(), v))
    }

    /// The most recently captured output among the node's direct
    /// dependencies. A node without dependencies sees the latest capture of
    /// the whole run.
    pub fn upstream_output(&self) -> Option<(&str, &serde_json::Value)> {
        if self.inner.upstream.is_empty() {
            return self.latest_output();
        }
        let id = self
            .inner
            .captured
            .iter()
            .rev()
            .find(|id| self.inner.upstream.contains(id))?;
        self.inner.outputs.get(id).map(|v| (id.as_str(), v))
    }

    /// Terminal nodes in completion order.
    pub fn completed(&self) -> &[(String, ExecutionStatus)] {
        &self.inner.completed
    }

    /// All captured outputs as a JSON object keyed by node id.
    pub fn outputs_json(&self) -> serde_json::Value {
        serde_json::Value::Object(
            self.inner
                .outputs
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_capture_and_latest() {
        let mut ctx = ExecutionContext::new();
        ctx.capture("a", json!(1));
        ctx.capture("b", json!(2));
        let view = ctx.snapshot();
        assert_eq!(view.latest_output(), Some(("b", &json!(2))));
        assert_eq!(view.output("a"), Some(&json!(1)));

        ctx.capture("a", json!(3));
        assert_eq!(ctx.snapshot().latest_output(), Some(("a", &json!(3))));
        // Earlier snapshot is unaffected.
        assert_eq!(view.output("a"), Some(&json!(1)));
    }

    #[test]
    fn test_completion_order_ignores_running() {
        let mut ctx = ExecutionContext::new();
        ctx.set_status("a", ExecutionStatus::Running);
        ctx.set_status("b", ExecutionStatus::Running);
        ctx.set_status("b", ExecutionStatus::Failed);
        ctx.set_status("a", ExecutionStatus::Success);
        ctx.set_status("c", ExecutionStatus::Skipped);

        let view = ctx.snapshot();
        let completed: Vec<_> = view.completed().iter().map(|(id, s)| (id.as_str(), *s)).collect();
        assert_eq!(
            completed,
            vec![
                ("b", ExecutionStatus::Failed),
                ("a", ExecutionStatus::Success),
                ("c", ExecutionStatus::Skipped),
            ]
        );
        assert_eq!(ctx.status("missing"), ExecutionStatus::Pending);
    }

    #[test]
    fn test_upstream_output_ignores_unrelated_captures() {
        let mut ctx = ExecutionContext::new();
        ctx.capture("login", json!({"status": 200}));
        ctx.capture("cart", json!({"items": 2}));
        ctx.capture("sibling", json!({"status": 500}));

        let view = ctx.snapshot_for(vec!["login".into(), "cart".into()]);
        assert_eq!(view.upstream_output(), Some(("cart", &json!({"items": 2}))));

        let view = ctx.snapshot_for(vec!["login".into()]);
        assert_eq!(view.upstream_output(), Some(("login", &json!({"status": 200}))));

        // Dependencies that produced nothing leave nothing to check.
        assert!(ctx.snapshot_for(vec!["failed".into()]).upstream_output().is_none());

        // No dependencies: the whole run's latest capture.
        assert_eq!(ctx.snapshot().upstream_output(), Some(("sibling", &json!({"status": 500}))));
    }

    #[test]
    fn test_outputs_json() {
        let mut ctx = ExecutionContext::new();
        ctx.capture("login", json!({"body": {"token": "t"}}));
        let all = ctx.snapshot().outputs_json();
        assert_eq!(all["login"]["body"]["token"], "t");
    }
}
