use std::path::PathBuf;

use chrono::Utc;
use serde::Serialize;
use tokio::io::AsyncWriteExt;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use testflow_core::types::{RunId, StatusEvent};

/// JSONL run logger.
///
/// Consumes one run's status events and writes them as JSONL (one JSON
/// object per line) to `{log_dir}/{flow_id}/{run_id}.jsonl`. Every line is
/// flushed as it is written, so a crash mid-run leaves a readable prefix.
pub struct RunLogger {
    log_dir: PathBuf,
}

#[derive(Serialize)]
struct LogEntry<'a> {
    timestamp: String,
    run_id: &'a str,
    event_type: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    node_id: Option<&'a str>,
    status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    detail: Option<serde_json::Value>,
}

impl RunLogger {
    pub fn new(log_dir: PathBuf) -> Self {
        Self { log_dir }
    }

    pub fn path_for(&self, flow_id: &str, run_id: &RunId) -> PathBuf {
        self.log_dir
            .join(sanitize(flow_id))
            .join(format!("{}.jsonl", run_id))
    }

    /// Write events from `rx` until the run completes, the channel closes or
    /// `cancel` fires. Returns the log path if the file could be opened.
    ///
    /// `rx` must be subscribed before the run starts.
    pub async fn run(
        self,
        flow_id: &str,
        run_id: RunId,
        mut rx: broadcast::Receiver<StatusEvent>,
        cancel: CancellationToken,
    ) -> Option<PathBuf> {
        let log_path = self.path_for(flow_id, &run_id);
        if let Some(parent) = log_path.parent() {
            if let Err(e) = tokio::fs::create_dir_all(parent).await {
                error!(error = %e, "Failed to create run log directory");
                return None;
            }
        }

        let file = match tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)
            .await
        {
            Ok(f) => f,
            Err(e) => {
                error!(error = %e, path = %log_path.display(), "Failed to open run log");
                return None;
            }
        };

        info!(path = %log_path.display(), "RunLogger started");
        let mut writer = tokio::io::BufWriter::new(file);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("RunLogger cancelled");
                    break;
                }
                result = rx.recv() => {
                    match result {
                        Ok(event) => {
                            let entry = to_entry(&event);
                            if let Ok(json) = serde_json::to_string(&entry) {
                                let line = format!("{}\n", json);
                                if let Err(e) = writer.write_all(line.as_bytes()).await {
                                    error!(error = %e, "Failed to write run log entry");
                                    break;
                                }
                                if let Err(e) = writer.flush().await {
                                    error!(error = %e, "Failed to flush run log");
                                }
                            }
                            if event.is_run_complete() {
                                break;
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            debug!(skipped = n, "RunLogger lagged, skipped events");
                        }
                        Err(broadcast::error::RecvError::Closed) => {
                            debug!("Run channel closed, RunLogger stopping");
                            break;
                        }
                    }
                }
            }
        }

        writer.flush().await.ok();
        debug!(path = %log_path.display(), "RunLogger finished");
        Some(log_path)
    }
}

fn to_entry(event: &StatusEvent) -> LogEntry<'_> {
    let timestamp = Utc::now().to_rfc3339();
    match event {
        StatusEvent::NodeUpdate {
            run_id,
            node_id,
            status,
            output,
            error,
            duration_ms,
        } => {
            let mut detail = serde_json::Map::new();
            if let Some(output) = output {
                detail.insert("output".into(), truncate_json(output, 2000));
            }
            if let Some(error) = error {
                detail.insert("error".into(), error.clone().into());
            }
            if let Some(ms) = duration_ms {
                detail.insert("duration_ms".into(), (*ms).into());
            }
            LogEntry {
                timestamp,
                run_id: run_id.as_str(),
                event_type: "node_update",
                node_id: Some(node_id.as_str()),
                status: status.as_str(),
                detail: (!detail.is_empty()).then_some(serde_json::Value::Object(detail)),
            }
        }
        StatusEvent::RunComplete {
            run_id,
            status,
            error,
            duration_ms,
            node_durations,
        } => LogEntry {
            timestamp,
            run_id: run_id.as_str(),
            event_type: "run_complete",
            node_id: None,
            status: status.as_str(),
            detail: Some(serde_json::json!({
                "error": error,
                "duration_ms": duration_ms,
                "node_durations": node_durations,
            })),
        },
    }
}

/// Keep flow ids usable as a single path component.
fn sanitize(id: &str) -> String {
    id.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect()
}

fn truncate_json(value: &serde_json::Value, max_len: usize) -> serde_json::Value {
    let s = value.to_string();
    if s.len() <= max_len {
        value.clone()
    } else {
        let mut end = max_len;
        while !s.is_char_boundary(end) {
            end -= 1;
        }
        serde_json::Value::String(format!("{}...", &s[..end]))
    }
}
