use chrono::Utc;
use serde_json::json;

use testflow_core::flow::EventTriggerConfig;

/// Emit a trigger descriptor. The condition is carried through, not evaluated.
pub fn execute(config: &EventTriggerConfig) -> serde_json::Value {
    json!({
        "event": config.event_name,
        "condition": config.condition,
        "triggered": true,
        "timestamp": Utc::now().to_rfc3339(),
    })
}
