use futures::future::BoxFuture;

use crate::error::Result;
use crate::flow::Flow;
use crate::types::{HttpRequest, HttpResponse, RunId, TestRun};

/// HTTP transport used by API nodes.
pub trait HttpTransport: Send + Sync + 'static {
    /// Perform one request. Network failures are `FlowError::Execution`.
    fn send(&self, request: HttpRequest) -> BoxFuture<'_, Result<HttpResponse>>;

    /// Transport name for logs.
    fn name(&self) -> &str {
        "http"
    }
}

/// Persistence backend for flow definitions.
pub trait FlowStore: Send + Sync + 'static {
    /// Insert or replace a flow.
    fn save_flow(&self, flow: &Flow) -> BoxFuture<'_, Result<()>>;

    fn get_flow(&self, id: &str) -> BoxFuture<'_, Result<Option<Flow>>>;

    /// All flows, most recently updated first.
    fn list_flows(&self) -> BoxFuture<'_, Result<Vec<Flow>>>;

    /// Returns true if the flow existed.
    fn delete_flow(&self, id: &str) -> BoxFuture<'_, Result<bool>>;
}

/// Persistence backend for run history.
pub trait RunStore: Send + Sync + 'static {
    /// Insert or replace a run record.
    fn save_run(&self, run: &TestRun) -> BoxFuture<'_, Result<()>>;

    fn get_run(&self, id: &RunId) -> BoxFuture<'_, Result<Option<TestRun>>>;

    /// Runs of one flow, newest first.
    fn runs_for_flow(&self, flow_id: &str, limit: usize) -> BoxFuture<'_, Result<Vec<TestRun>>>;
}
