use std::collections::HashMap;
use std::sync::Mutex;

use tokio::sync::broadcast;
use tracing::debug;

use crate::types::{RunId, StatusEvent};

/// Per-run fan-out of status events.
///
/// Every run id gets its own tokio broadcast channel, created on first
/// publish or subscribe. Each subscriber owns a bounded ring buffer of
/// `capacity` events: a subscriber that falls behind loses the oldest events
/// and sees `RecvError::Lagged(n)` instead of stalling the publisher.
/// Publishing with no subscribers drops the event.
///
/// Publishing a `RunComplete` event removes the channel, so subscribers drain
/// what is buffered and then observe `RecvError::Closed`.
pub struct StatusBroadcaster {
    channels: Mutex<HashMap<RunId, broadcast::Sender<StatusEvent>>>,
    capacity: usize,
}

impl StatusBroadcaster {
    pub fn new(capacity: usize) -> Self {
        Self {
            channels: Mutex::new(HashMap::new()),
            capacity: capacity.max(1),
        }
    }

    pub fn publish(&self, event: StatusEvent) {
        let complete = event.is_run_complete();
        let run_id = event.run_id().clone();

        let mut channels = self.lock();
        let sender = if complete {
            channels.remove(&run_id)
        } else {
            Some(
                channels
                    .entry(run_id.clone())
                    .or_insert_with(|| broadcast::channel(self.capacity).0)
                    .clone(),
            )
        };
        drop(channels);

        if let Some(tx) = sender {
            // Ignore error if no receivers
            let delivered = tx.send(event).unwrap_or(0);
            if complete {
                debug!(run_id = %run_id, delivered, "Run channel closed");
            }
        }
    }

    /// Subscribe to a run's events. Subscribing before the run starts is
    /// the only way to be sure nothing is missed.
    pub fn subscribe(&self, run_id: &RunId) -> broadcast::Receiver<StatusEvent> {
        self.lock()
            .entry(run_id.clone())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .subscribe()
    }

    /// Subscribe only if the run's channel is still open. Returns `None`
    /// once the run has completed (or never started).
    pub fn subscribe_existing(&self, run_id: &RunId) -> Option<broadcast::Receiver<StatusEvent>> {
        self.lock().get(run_id).map(|tx| tx.subscribe())
    }

    /// Number of live subscribers for a run.
    #[cfg(test)]
    pub fn subscriber_count(&self, run_id: &RunId) -> usize {
        self.lock()
            .get(run_id)
            .map(|tx| tx.receiver_count())
            .unwrap_or(0)
    }

    /// Whether a channel is currently open for the run.
    #[cfg(test)]
    pub fn is_open(&self, run_id: &RunId) -> bool {
        self.lock().contains_key(run_id)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<RunId, broadcast::Sender<StatusEvent>>> {
        // A panic while holding the lock leaves the map itself consistent.
        self.channels.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Default for StatusBroadcaster {
    fn default() -> Self {
        Self::new(256)
    }
}
