use std::cmp::Reverse;
use std::collections::{BTreeMap, BinaryHeap, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use futures::stream::{FuturesUnordered, Stream, StreamExt};
use serde_json::json;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use testflow_core::config::{AppConfig, EngineConfig, FailurePolicy};
use testflow_core::error::{FlowError, Result};
use testflow_core::event::StatusBroadcaster;
use testflow_core::flow::Flow;
use testflow_core::traits::HttpTransport;
use testflow_core::types::{ExecutionStatus, NodeResult, RunId, StatusEvent, TestRun};

use crate::context::ExecutionContext;
use crate::executors::StepExecutors;
use crate::http::transport_for;
use crate::resolver::{self, ExecutionPlan};

/// Why a run stopped before every node finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Abort {
    Cancelled,
    Timeout,
}

impl Abort {
    fn message(self) -> &'static str {
        match self {
            Self::Cancelled => "Execution cancelled",
            Self::Timeout => "Execution timeout",
        }
    }

    fn kind(self) -> &'static str {
        match self {
            Self::Cancelled => "cancelled",
            Self::Timeout => "timeout",
        }
    }
}

/// A run started in the background with [`RunScheduler::start`].
pub struct RunHandle {
    pub run_id: RunId,
    /// Subscribed before the run was spawned, so no event is missed.
    pub events: broadcast::Receiver<StatusEvent>,
    pub cancel: CancellationToken,
    pub join: JoinHandle<Result<TestRun>>,
}

/// Drives flow runs: resolves the graph, dispatches ready nodes with bounded
/// concurrency, records results and publishes status events.
///
/// The scheduler holds no per-run state. Each call to [`execute`](Self::execute)
/// owns a fresh [`ExecutionContext`], so concurrent runs never observe each
/// other's outputs.
pub struct RunScheduler {
    executors: StepExecutors,
    broadcaster: Arc<StatusBroadcaster>,
    config: EngineConfig,
}

impl RunScheduler {
    /// Build a scheduler with the transport selected by `engine.api_mode`.
    pub fn new(config: &AppConfig, broadcaster: Arc<StatusBroadcaster>) -> Result<Self> {
        let http = transport_for(config.engine.api_mode, &config.http)?;
        Ok(Self::with_transport(config.engine.clone(), http, broadcaster))
    }

    pub fn with_transport(
        config: EngineConfig,
        http: Arc<dyn HttpTransport>,
        broadcaster: Arc<StatusBroadcaster>,
    ) -> Self {
        Self {
            executors: StepExecutors::new(http),
            broadcaster,
            config,
        }
    }

    pub fn broadcaster(&self) -> &Arc<StatusBroadcaster> {
        &self.broadcaster
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Spawn a run on the runtime and return a handle to it.
    pub fn start(self: &Arc<Self>, flow: Flow) -> RunHandle {
        self.start_as(flow, RunId::new())
    }

    /// Like [`start`](Self::start) with a caller-chosen run id, so other
    /// observers can subscribe before the run begins.
    pub fn start_as(self: &Arc<Self>, flow: Flow, run_id: RunId) -> RunHandle {
        let events = self.broadcaster.subscribe(&run_id);
        let cancel = CancellationToken::new();

        let scheduler = Arc::clone(self);
        let id = run_id.clone();
        let token = cancel.clone();
        let join = tokio::spawn(async move { scheduler.execute(&flow, id, token).await });

        RunHandle {
            run_id,
            events,
            cancel,
            join,
        }
    }

    /// Execute a flow to completion.
    ///
    /// Node failures never surface as `Err`: they are recorded on the
    /// returned run, whose status is `Failed`. `Err` is returned only for a
    /// flow that cannot be scheduled at all (cycle, dangling edge), after a
    /// failed `run_complete` event has been published.
    pub async fn execute(&self, flow: &Flow, run_id: RunId, cancel: CancellationToken) -> Result<TestRun> {
        let started_at = Utc::now();
        let clock = Instant::now();
        info!(run_id = %run_id, flow_id = %flow.id, nodes = flow.nodes.len(), "Starting flow run");

        let plan = match resolver::resolve(flow) {
            Ok(plan) => plan,
            Err(e) => {
                warn!(run_id = %run_id, flow_id = %flow.id, error = %e, "Flow cannot be scheduled");
                self.broadcaster.publish(StatusEvent::RunComplete {
                    run_id,
                    status: ExecutionStatus::Failed,
                    error: Some(e.to_string()),
                    duration_ms: Some(clock.elapsed().as_millis() as u64),
                    node_durations: BTreeMap::new(),
                });
                return Err(e);
            }
        };

        let mut run = RunState::new(flow, &plan, &run_id, &self.broadcaster);
        let abort = self.drive(&mut run, &cancel).await;

        if let Some(reason) = abort {
            // Whatever never started is skipped, in resolver order.
            for &idx in &plan.order {
                if !run.ctx.status(&flow.nodes[idx].id).is_terminal() {
                    run.finish(idx, skipped(reason.message(), reason.kind()), None);
                }
            }
        }

        let status = if abort.is_none()
            && flow
                .nodes
                .iter()
                .all(|n| run.ctx.status(&n.id) == ExecutionStatus::Success)
        {
            ExecutionStatus::Success
        } else {
            ExecutionStatus::Failed
        };
        let duration_ms = clock.elapsed().as_millis() as u64;
        let error = abort.map(|a| a.message().to_string());

        let results = run.results;
        let node_durations: BTreeMap<String, u64> = results
            .iter()
            .filter(|(_, r)| r.status != ExecutionStatus::Skipped)
            .map(|(id, r)| (id.clone(), r.duration_ms))
            .collect();

        info!(
            run_id = %run_id,
            flow_id = %flow.id,
            status = %status,
            duration_ms,
            "Flow run complete"
        );

        self.broadcaster.publish(StatusEvent::RunComplete {
            run_id: run_id.clone(),
            status,
            error: error.clone(),
            duration_ms: Some(duration_ms),
            node_durations,
        });

        Ok(TestRun {
            id: run_id,
            flow_id: flow.id.clone(),
            flow_name: Some(flow.name.clone()),
            status,
            started_at,
            completed_at: Some(Utc::now()),
            duration_ms: Some(duration_ms),
            node_results: results,
            error,
        })
    }

    /// The dispatch loop. Returns the abort reason if the run was cut short.
    async fn drive(&self, run: &mut RunState<'_>, cancel: &CancellationToken) -> Option<Abort> {
        let limit = self.config.max_concurrency.max(1);
        let policy = self.config.failure_policy;

        // Executors watch this token, so a timeout reaches them too.
        let node_cancel = cancel.child_token();
        let timeout = (self.config.run_timeout_secs > 0)
            .then(|| Duration::from_secs(self.config.run_timeout_secs));
        let deadline = async {
            match timeout {
                Some(d) => tokio::time::sleep(d).await,
                None => std::future::pending::<()>().await,
            }
        };
        tokio::pin!(deadline);

        let executors = &self.executors;
        let (flow, plan) = (run.flow, run.plan);
        let mut in_flight = FuturesUnordered::new();
        let mut abort: Option<Abort> = None;

        loop {
            while abort.is_none() && in_flight.len() < limit {
                let Some(Reverse((_, idx))) = run.ready.pop() else {
                    break;
                };
                let node = &flow.nodes[idx];

                let upstream_ok = plan.dependencies[idx]
                    .iter()
                    .all(|&d| run.ctx.status(&flow.nodes[d].id) == ExecutionStatus::Success);
                if !upstream_ok && policy == FailurePolicy::Skip {
                    debug!(node_id = %node.id, "Skipping node, upstream did not succeed");
                    run.finish(idx, skipped("Upstream node did not succeed", "upstream_failed"), None);
                    continue;
                }

                run.mark_running(idx);
                let upstream = plan.dependencies[idx]
                    .iter()
                    .map(|&d| flow.nodes[d].id.clone())
                    .collect();
                let view = run.ctx.snapshot_for(upstream);
                let token = &node_cancel;
                in_flight.push(async move {
                    let started = Instant::now();
                    let outcome = executors.execute(node, &view, token).await;
                    (idx, outcome, started.elapsed())
                });
            }

            if in_flight.is_empty() {
                break;
            }

            tokio::select! {
                biased;
                _ = cancel.cancelled(), if abort.is_none() => {
                    warn!(run_id = %run.run_id, "Run cancelled");
                    abort = Some(Abort::Cancelled);
                    node_cancel.cancel();
                }
                _ = &mut deadline, if abort.is_none() => {
                    warn!(run_id = %run.run_id, timeout_secs = self.config.run_timeout_secs, "Run timed out");
                    abort = Some(Abort::Timeout);
                    node_cancel.cancel();
                }
                Some((idx, outcome, elapsed)) = in_flight.next() => {
                    let duration_ms = elapsed.as_millis() as u64;
                    let result = match outcome {
                        Ok(output) => NodeResult {
                            status: ExecutionStatus::Success,
                            output: Some(output),
                            error: None,
                            error_kind: None,
                            duration_ms,
                        },
                        Err(e) => {
                            warn!(node_id = %flow.nodes[idx].id, error = %e, "Node failed");
                            failed(e, abort, duration_ms)
                        }
                    };
                    run.finish(idx, result, Some(duration_ms));
                }
            }
        }

        abort
    }
}

fn skipped(reason: &str, kind: &str) -> NodeResult {
    NodeResult {
        status: ExecutionStatus::Skipped,
        output: None,
        error: Some(reason.to_string()),
        error_kind: Some(kind.to_string()),
        duration_ms: 0,
    }
}

fn failed(error: FlowError, abort: Option<Abort>, duration_ms: u64) -> NodeResult {
    // A node interrupted by a timeout reports the timeout, not a bare cancel.
    let (message, kind) = match (&error, abort) {
        (FlowError::Cancelled, Some(reason)) => (reason.message().to_string(), reason.kind()),
        _ => (error.to_string(), error.kind()),
    };
    let output = match error {
        FlowError::AssertionFailed { expected, actual } => {
            Some(json!({ "passed": false, "expected": expected, "actual": actual }))
        }
        _ => None,
    };
    NodeResult {
        status: ExecutionStatus::Failed,
        output,
        error: Some(message),
        error_kind: Some(kind.to_string()),
        duration_ms,
    }
}

/// Mutable bookkeeping for one run.
struct RunState<'a> {
    flow: &'a Flow,
    plan: &'a ExecutionPlan,
    run_id: &'a RunId,
    broadcaster: &'a StatusBroadcaster,
    ctx: ExecutionContext,
    results: HashMap<String, NodeResult>,
    /// Unfinished dependency count per node.
    waiting_on: Vec<usize>,
    /// Nodes whose dependencies are all terminal, keyed by resolver position.
    ready: BinaryHeap<Reverse<(usize, usize)>>,
}

impl<'a> RunState<'a> {
    fn new(
        flow: &'a Flow,
        plan: &'a ExecutionPlan,
        run_id: &'a RunId,
        broadcaster: &'a StatusBroadcaster,
    ) -> Self {
        let waiting_on: Vec<usize> = plan.dependencies.iter().map(Vec::len).collect();
        let ready = waiting_on
            .iter()
            .enumerate()
            .filter(|(_, &n)| n == 0)
            .map(|(idx, _)| Reverse((plan.position[idx], idx)))
            .collect();

        Self {
            flow,
            plan,
            run_id,
            broadcaster,
            ctx: ExecutionContext::new(),
            results: HashMap::new(),
            waiting_on,
            ready,
        }
    }

    fn mark_running(&mut self, idx: usize) {
        let node = &self.flow.nodes[idx];
        debug!(run_id = %self.run_id, node_id = %node.id, kind = node.kind(), "Node running");
        self.ctx.set_status(&node.id, ExecutionStatus::Running);
        self.broadcaster.publish(StatusEvent::NodeUpdate {
            run_id: self.run_id.clone(),
            node_id: node.id.clone(),
            status: ExecutionStatus::Running,
            output: None,
            error: None,
            duration_ms: None,
        });
    }

    /// Record a terminal result, publish it and release dependents.
    fn finish(&mut self, idx: usize, result: NodeResult, duration_ms: Option<u64>) {
        let node_id = self.flow.nodes[idx].id.clone();

        if result.status == ExecutionStatus::Success {
            if let Some(output) = &result.output {
                self.ctx.capture(&node_id, output.clone());
            }
        }
        self.ctx.set_status(&node_id, result.status);

        debug!(
            run_id = %self.run_id,
            node_id = %node_id,
            status = %result.status,
            duration_ms = result.duration_ms,
            "Node finished"
        );
        self.broadcaster.publish(StatusEvent::NodeUpdate {
            run_id: self.run_id.clone(),
            node_id: node_id.clone(),
            status: result.status,
            output: result.output.clone(),
            error: result.error.clone(),
            duration_ms,
        });
        self.results.insert(node_id, result);

        for &dep in &self.plan.dependents[idx] {
            self.waiting_on[dep] -= 1;
            if self.waiting_on[dep] == 0 {
                self.ready.push(Reverse((self.plan.position[dep], dep)));
            }
        }
    }
}

/// Turn a run subscription into a stream that ends when the run completes.
///
/// Events lost to a slow consumer are logged and skipped.
pub fn status_stream(rx: broadcast::Receiver<StatusEvent>) -> impl Stream<Item = StatusEvent> {
    futures::stream::unfold(rx, |mut rx| async move {
        loop {
            match rx.recv().await {
                Ok(event) => return Some((event, rx)),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!(skipped = n, "Status subscriber lagged");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    })
}
