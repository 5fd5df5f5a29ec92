//! Step executors: one handler per node kind.
//!
//! Dispatch is an exhaustive match over [`Step`], so a new node kind cannot
//! be added without a handler here. Every handler receives a read-only
//! [`ContextView`] and returns the node's output value or a typed failure.

pub mod api;
pub mod event_trigger;
pub mod mock;
pub mod report;
pub mod verification;

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::debug;

use testflow_core::error::{FlowError, Result};
use testflow_core::flow::{Node, Step};
use testflow_core::traits::HttpTransport;

use crate::context::ContextView;

/// The set of step handlers shared by every run of a scheduler.
pub struct StepExecutors {
    http: Arc<dyn HttpTransport>,
}

impl StepExecutors {
    pub fn new(http: Arc<dyn HttpTransport>) -> Self {
        Self { http }
    }

    /// Execute one node.
    ///
    /// `cancel` is the run's cancellation token; handlers that suspend
    /// (HTTP, mock delay) return `FlowError::Cancelled` when it fires.
    pub async fn execute(
        &self,
        node: &Node,
        view: &ContextView,
        cancel: &CancellationToken,
    ) -> Result<serde_json::Value> {
        debug!(node_id = %node.id, kind = node.kind(), "Dispatching step");
        match &node.step {
            Step::Api(config) => {
                api::execute(&node.id, config, self.http.as_ref(), view, cancel).await
            }
            Step::Mock(config) => mock::execute(config, cancel).await,
            Step::Verification(config) => verification::execute(&node.id, config, view),
            Step::Report(config) => Ok(report::execute(config, view)),
            Step::EventTrigger(config) => Ok(event_trigger::execute(config)),
            Step::Unsupported { kind, .. } => Err(FlowError::UnsupportedNodeKind(kind.clone())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use testflow_core::flow::{EventTriggerConfig, MockConfig};
    use testflow_test_utils::StubTransport;

    fn executors() -> StepExecutors {
        StepExecutors::new(Arc::new(StubTransport::new()))
    }

    #[tokio::test]
    async fn test_unsupported_kind_fails() {
        let node = Node::new(
            "n1",
            "Webhook",
            Step::Unsupported {
                kind: "webhook".into(),
                config: json!({}),
            },
        );
        let err = executors()
            .execute(&node, &ContextView::default(), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, FlowError::UnsupportedNodeKind(ref k) if k == "webhook"));
    }

    #[tokio::test]
    async fn test_dispatches_by_kind() {
        let cancel = CancellationToken::new();
        let view = ContextView::default();

        let mock = Node::new("m", "Mock", Step::Mock(MockConfig::responding(json!({"ok": true}))));
        let out = executors().execute(&mock, &view, &cancel).await.unwrap();
        assert_eq!(out, json!({"ok": true}));

        let trigger = Node::new(
            "t",
            "Trigger",
            Step::EventTrigger(EventTriggerConfig {
                event_name: Some("deployed".into()),
                condition: None,
            }),
        );
        let out = executors().execute(&trigger, &view, &cancel).await.unwrap();
        assert_eq!(out["event"], "deployed");
        assert_eq!(out["triggered"], true);
    }
}
