use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use testflow_core::traits::{FlowStore, RunStore};
use testflow_core::types::RunId;
use testflow_engine::RunScheduler;

/// Shared application state for axum handlers.
pub struct AppState {
    pub scheduler: Arc<RunScheduler>,
    pub flows: Arc<dyn FlowStore>,
    pub runs: Arc<dyn RunStore>,
    /// Write a JSONL log per run into this directory when set.
    pub run_log_dir: Option<PathBuf>,
    active: Mutex<HashMap<RunId, CancellationToken>>,
    /// Woken whenever a run leaves the active set.
    settled: Notify,
}

impl AppState {
    pub fn new(
        scheduler: Arc<RunScheduler>,
        flows: Arc<dyn FlowStore>,
        runs: Arc<dyn RunStore>,
        run_log_dir: Option<PathBuf>,
    ) -> Self {
        Self {
            scheduler,
            flows,
            runs,
            run_log_dir,
            active: Mutex::new(HashMap::new()),
            settled: Notify::new(),
        }
    }

    pub fn track(&self, run_id: RunId, cancel: CancellationToken) {
        self.active().insert(run_id, cancel);
    }

    /// Drop a run from the active set once its record is stored.
    pub fn untrack(&self, run_id: &RunId) {
        self.active().remove(run_id);
        self.settled.notify_waiters();
    }

    pub fn is_active(&self, run_id: &RunId) -> bool {
        self.active().contains_key(run_id)
    }

    /// Wait until the run is no longer active, i.e. its record (if any) has
    /// been written. Returns at once for a run that is not tracked.
    pub async fn settled(&self, run_id: &RunId) {
        loop {
            let notified = self.settled.notified();
            if !self.is_active(run_id) {
                return;
            }
            notified.await;
        }
    }

    /// Signal cancellation. Returns false if the run is not in flight.
    pub fn cancel(&self, run_id: &RunId) -> bool {
        match self.active().get(run_id) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    fn active(&self) -> MutexGuard<'_, HashMap<RunId, CancellationToken>> {
        self.active.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use testflow_core::config::FailurePolicy;
    use testflow_core::event::StatusBroadcaster;
    use testflow_store::SqliteStore;
    use testflow_test_utils::{engine_config, StubTransport};

    fn state() -> Arc<AppState> {
        let scheduler = Arc::new(RunScheduler::with_transport(
            engine_config(1, FailurePolicy::Skip),
            Arc::new(StubTransport::new()),
            Arc::new(StatusBroadcaster::new(16)),
        ));
        let store = Arc::new(SqliteStore::in_memory().unwrap());
        Arc::new(AppState::new(scheduler, store.clone(), store, None))
    }

    #[tokio::test]
    async fn test_settled_waits_for_untrack() {
        let state = state();
        let run_id = RunId::new();
        state.track(run_id.clone(), CancellationToken::new());

        let waiter = {
            let state = state.clone();
            let run_id = run_id.clone();
            tokio::spawn(async move { state.settled(&run_id).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        state.untrack(&run_id);
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter woke")
            .unwrap();
    }

    #[tokio::test]
    async fn test_settled_returns_for_unknown_run() {
        let state = state();
        tokio::time::timeout(Duration::from_millis(100), state.settled(&RunId::new()))
            .await
            .expect("unknown run is already settled");
    }
}
