use std::time::Duration;

use tokio_util::sync::CancellationToken;

use testflow_core::error::{FlowError, Result};
use testflow_core::flow::MockConfig;

/// Wait `delay_ms`, then return the configured response or `{"status": 200}`.
pub async fn execute(config: &MockConfig, cancel: &CancellationToken) -> Result<serde_json::Value> {
    if config.delay_ms > 0 {
        tokio::select! {
            _ = cancel.cancelled() => return Err(FlowError::Cancelled),
            _ = tokio::time::sleep(Duration::from_millis(config.delay_ms)) => {}
        }
    }

    Ok(config
        .response
        .clone()
        .unwrap_or_else(|| serde_json::json!({ "status": 200 })))
}
