use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use futures::{SinkExt, StreamExt};
use tracing::{debug, warn};

use testflow_core::types::RunId;
use testflow_engine::status_stream;

use crate::protocol::{completion_event, ErrorFrame};
use crate::state::AppState;

/// Relay one run's status events to a WebSocket client as JSON text frames.
///
/// The socket closes after `run_complete`. A client that connects after the
/// run has finished gets the stored completion event (or an error frame for
/// an unknown run) and is closed straight away; if the run is still being
/// recorded, that reply waits for the record. Frames sent by the client
/// are ignored apart from close.
pub async fn relay_run(ws: WebSocket, state: Arc<AppState>, run_id: RunId) {
    let (mut ws_tx, mut ws_rx) = ws.split();

    let Some(rx) = state.scheduler.broadcaster().subscribe_existing(&run_id) else {
        // The channel closes before the record is written.
        state.settled(&run_id).await;
        let frame = match state.runs.get_run(&run_id).await {
            Ok(Some(run)) => serde_json::to_string(&completion_event(&run)),
            Ok(None) => serde_json::to_string(&ErrorFrame::new(format!("unknown run {}", run_id))),
            Err(e) => serde_json::to_string(&ErrorFrame::new(e.to_string())),
        };
        if let Ok(json) = frame {
            let _ = ws_tx.send(Message::Text(json.into())).await;
        }
        let _ = ws_tx.send(Message::Close(None)).await;
        return;
    };

    let events = status_stream(rx);
    tokio::pin!(events);

    loop {
        tokio::select! {
            event = events.next() => {
                let Some(event) = event else {
                    debug!(run_id = %run_id, "Run stream ended");
                    break;
                };
                match serde_json::to_string(&event) {
                    Ok(json) => {
                        if ws_tx.send(Message::Text(json.into())).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => warn!(error = %e, "Failed to serialize status event"),
                }
            }
            msg = ws_rx.next() => {
                match msg {
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(e)) => {
                        debug!(error = %e, "WebSocket read error");
                        break;
                    }
                    Some(Ok(_)) => {}
                }
            }
        }
    }

    let _ = ws_tx.send(Message::Close(None)).await;
}
