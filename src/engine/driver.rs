//! Per-run scheduling driver.
//!
//! Each run is driven by one task owning the run's in-memory frontier:
//! recorded outputs, per-node predecessor counters, and the set of
//! settled nodes. Capability attempts execute on worker tasks bounded
//! by a global semaphore; everything else (branch decisions, merges,
//! skips, retries) is settled inside the driver loop. All terminal
//! node decisions go through the store's conditional transition, so a
//! decision is accepted at most once even across crash recovery.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Instant;

use serde_json::{json, Map, Value};
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, error, info, instrument, warn};

use super::bindings::resolve_input;
use super::cancel::CancelHandle;
use super::predicate::eval_predicate;
use crate::adapters::{AdapterRegistry, CallContext};
use crate::error::{AdapterError, AdapterErrorKind, Error, Result, RunError};
use crate::events::{CallRecord, EventKind, EventSink};
use crate::graph::{CompiledNode, Graph, NodeKind};
use crate::state::{NodeExecution, NodeStatus, Run, RunStatus, SqliteStore};

/// Message from a worker or retry timer back to the driver.
#[derive(Debug)]
pub(super) enum WorkerMsg {
    Finished {
        node_id: String,
        attempt: u32,
        result: std::result::Result<Value, AdapterError>,
    },
    RetryDue {
        node_id: String,
        attempt: u32,
    },
}

/// A node decision already recorded in the store, to be folded into the
/// in-memory frontier.
struct Settled {
    node_id: String,
    /// Value this node contributes downstream; `None` for skipped and
    /// cancelled nodes.
    contribution: Option<Value>,
    /// Selected successor when the node is a branch.
    selected: Option<String>,
}

enum Outcome {
    Succeeded(Value),
    Failed(RunError),
    Cancelled,
}

pub(super) struct RunDriver {
    store: SqliteStore,
    adapters: AdapterRegistry,
    events: EventSink,
    semaphore: Arc<Semaphore>,
    cancel: Arc<CancelHandle>,
    graph: Arc<Graph>,
    run_id: String,
    run_input: Value,

    outputs: HashMap<String, Value>,
    remaining_preds: HashMap<String, usize>,
    live_preds: HashMap<String, usize>,
    settled: HashSet<String>,
    dispatched: HashSet<String>,
    /// Nodes with a pre-existing execution row during crash recovery;
    /// the replay pass decides them, never the settle loop.
    predecided: HashSet<String>,
    failure: Option<RunError>,

    tasks: JoinSet<()>,
    tx: mpsc::Sender<WorkerMsg>,
}

impl RunDriver {
    #[allow(clippy::too_many_arguments)]
    pub(super) fn new(
        store: SqliteStore,
        adapters: AdapterRegistry,
        events: EventSink,
        semaphore: Arc<Semaphore>,
        cancel: Arc<CancelHandle>,
        graph: Arc<Graph>,
        run: &Run,
    ) -> (Self, mpsc::Receiver<WorkerMsg>) {
        let (tx, rx) = mpsc::channel(256);
        let remaining_preds = graph.in_degrees();
        let driver = Self {
            store,
            adapters,
            events,
            semaphore,
            cancel,
            graph,
            run_id: run.id.clone(),
            run_input: run.input.clone(),
            outputs: HashMap::new(),
            remaining_preds,
            live_preds: HashMap::new(),
            settled: HashSet::new(),
            dispatched: HashSet::new(),
            predecided: HashSet::new(),
            failure: None,
            tasks: JoinSet::new(),
            tx,
        };
        (driver, rx)
    }

    /// Drive the run to a terminal status.
    #[instrument(skip_all, fields(run_id = %self.run_id, workflow = %self.graph.name))]
    pub(super) async fn drive(mut self, mut rx: mpsc::Receiver<WorkerMsg>, resume: bool) {
        metrics::gauge!("weft_active_runs").increment(1.0);
        let run_id = self.run_id.clone();
        match self.execute(&mut rx, resume).await {
            Ok(Outcome::Succeeded(output)) => {
                info!(run_id = %run_id, "run succeeded");
                self.finish(RunStatus::Succeeded, Some(output), None).await;
            }
            Ok(Outcome::Failed(err)) => {
                warn!(run_id = %run_id, error = %err, "run failed");
                self.cancel_outstanding().await;
                self.finish(RunStatus::Failed, None, Some(err.to_string())).await;
            }
            Ok(Outcome::Cancelled) => {
                info!(run_id = %run_id, "run cancelled");
                self.cancel_outstanding().await;
                let reason = RunError::RunCancelled {
                    run_id: run_id.clone(),
                }
                .to_string();
                self.finish(RunStatus::Cancelled, None, Some(reason)).await;
            }
            Err(e) => {
                error!(run_id = %run_id, error = %e, "run driver aborted");
                self.cancel_outstanding().await;
                self.finish(RunStatus::Failed, None, Some(e.external_message()))
                    .await;
            }
        }
        metrics::gauge!("weft_active_runs").decrement(1.0);
    }

    async fn execute(
        &mut self,
        rx: &mut mpsc::Receiver<WorkerMsg>,
        resume: bool,
    ) -> Result<Outcome> {
        self.store
            .update_run_status(&self.run_id, RunStatus::Running, None, None)
            .await?;
        metrics::counter!("weft_runs_started_total").increment(1);
        self.events.emit(
            &self.run_id,
            EventKind::RunStarted,
            json!({"workflow": self.graph.name, "version": self.graph.version, "resumed": resume}),
        );

        if resume {
            self.replay().await?;
        }

        let start = self.graph.start_id().to_string();
        if self.failure.is_none()
            && !self.settled.contains(&start)
            && !self.dispatched.contains(&start)
        {
            self.complete_locally(&start, 1, self.run_input.clone(), None)
                .await?;
        }

        let cancel = self.cancel.clone();
        loop {
            if let Some(err) = self.failure.take() {
                return Ok(Outcome::Failed(err));
            }
            if self.settled.len() == self.graph.node_count() {
                return Ok(Outcome::Succeeded(self.run_output()));
            }

            tokio::select! {
                _ = cancel.cancelled() => return Ok(Outcome::Cancelled),
                msg = rx.recv() => match msg {
                    Some(WorkerMsg::Finished { node_id, attempt, result }) => {
                        self.handle_finished(&node_id, attempt, result).await?;
                    }
                    Some(WorkerMsg::RetryDue { node_id, attempt }) => {
                        self.dispatch_capability(&node_id, attempt).await?;
                    }
                    None => {
                        return Err(Error::Internal("driver channel closed".into()));
                    }
                },
            }
        }
    }

    // =========================================================================
    // Settlement
    // =========================================================================

    /// Fold a recorded terminal decision into the frontier and decide
    /// every successor that becomes decidable, transitively. Worklist
    /// form; the decision for each folded node is already in the store.
    async fn settle(&mut self, seed: Settled) -> Result<()> {
        let mut queue = VecDeque::new();
        queue.push_back(seed);

        while let Some(item) = queue.pop_front() {
            if !self.settled.insert(item.node_id.clone()) {
                continue;
            }
            if let Some(value) = item.contribution {
                self.outputs.insert(item.node_id.clone(), value);
            }
            let contributes = self.outputs.contains_key(&item.node_id);

            for succ in self.graph.successors(&item.node_id).to_vec() {
                if let Some(rem) = self.remaining_preds.get_mut(&succ) {
                    *rem = rem.saturating_sub(1);
                }
                let arm_taken = item
                    .selected
                    .as_deref()
                    .map(|sel| sel == succ)
                    .unwrap_or(true);
                if contributes && arm_taken {
                    *self.live_preds.entry(succ.clone()).or_insert(0) += 1;
                }

                let decidable = self.remaining_preds.get(&succ).copied() == Some(0)
                    && !self.settled.contains(&succ)
                    && !self.dispatched.contains(&succ)
                    && !self.predecided.contains(&succ);
                if !decidable {
                    continue;
                }

                if self.live_preds.get(&succ).copied().unwrap_or(0) == 0 {
                    // No selected or producing path reaches this node.
                    if let Some(settled) = self.skip_node(&succ).await? {
                        queue.push_back(settled);
                    }
                } else if let Some(settled) = self.activate(&succ).await? {
                    queue.push_back(settled);
                }
            }
        }
        Ok(())
    }

    /// A node's predecessors are all settled and at least one selected
    /// it: run it. Local kinds settle immediately; capability kinds go
    /// to a worker.
    async fn activate(&mut self, node_id: &str) -> Result<Option<Settled>> {
        let node = self.node(node_id)?.clone();
        let input = resolve_input(&self.graph, &node, &self.run_input, &self.outputs);

        match &node.kind {
            NodeKind::Start | NodeKind::End | NodeKind::Merge => {
                self.record_local_success(node_id, 1, input, None).await
            }
            NodeKind::Branch(cfg) => match eval_predicate(&cfg.predicate, &input) {
                Ok(take_true) => {
                    let selected = if take_true {
                        cfg.on_true.clone()
                    } else {
                        cfg.on_false.clone()
                    };
                    debug!(run_id = %self.run_id, node = node_id, selected = %selected, "branch decided");
                    self.record_local_success(node_id, 1, input, Some(selected))
                        .await
                }
                Err(reason) => {
                    // Deterministic definition failure; retries would
                    // only repeat it.
                    self.record_node_failure(&node, 1, &reason).await
                }
            },
            _ => {
                self.dispatched.insert(node_id.to_string());
                self.store
                    .init_node_execution(&self.run_id, node_id, NodeStatus::Ready)
                    .await?;
                self.events.emit(
                    &self.run_id,
                    EventKind::NodeScheduled,
                    json!({"node": node_id, "attempt": 1}),
                );
                self.spawn_worker(node, 1, input);
                Ok(None)
            }
        }
    }

    async fn skip_node(&mut self, node_id: &str) -> Result<Option<Settled>> {
        self.store
            .init_node_execution(&self.run_id, node_id, NodeStatus::Ready)
            .await?;
        let transition = self
            .store
            .transition(&self.run_id, node_id, NodeStatus::Skipped, 1, None, None)
            .await?;
        let record = transition.record().clone();
        self.events.emit(
            &self.run_id,
            EventKind::NodeSkipped,
            json!({"node": node_id}),
        );
        self.count_node(node_id, record.status);
        Ok(Some(self.settled_from_record(&record)?))
    }

    /// Record a success decided inside the driver (start, end, merge,
    /// branch) and return the settle item for it.
    async fn record_local_success(
        &mut self,
        node_id: &str,
        attempt: u32,
        output: Value,
        selected: Option<String>,
    ) -> Result<Option<Settled>> {
        self.dispatched.insert(node_id.to_string());
        self.store
            .init_node_execution(&self.run_id, node_id, NodeStatus::Ready)
            .await?;
        let transition = self
            .store
            .transition(
                &self.run_id,
                node_id,
                NodeStatus::Succeeded,
                attempt,
                Some(&output),
                None,
            )
            .await?;
        let record = transition.record().clone();
        let mut payload = json!({"node": node_id, "status": record.status, "attempt": record.attempt});
        if let Some(sel) = &selected {
            payload["selected"] = json!(sel);
        }
        self.events.emit(&self.run_id, EventKind::NodeFinished, payload);
        self.count_node(node_id, record.status);

        let mut settled = self.settled_from_record(&record)?;
        if matches!(record.status, NodeStatus::Succeeded) {
            settled.selected = selected;
        }
        Ok(Some(settled))
    }

    /// Variant of `record_local_success` used at the seed, where the
    /// settle loop is not already running.
    async fn complete_locally(
        &mut self,
        node_id: &str,
        attempt: u32,
        output: Value,
        selected: Option<String>,
    ) -> Result<()> {
        if let Some(settled) = self
            .record_local_success(node_id, attempt, output, selected)
            .await?
        {
            self.settle(settled).await?;
        }
        Ok(())
    }

    // =========================================================================
    // Capability workers
    // =========================================================================

    async fn dispatch_capability(&mut self, node_id: &str, attempt: u32) -> Result<()> {
        let node = self.node(node_id)?.clone();
        let input = resolve_input(&self.graph, &node, &self.run_input, &self.outputs);
        self.dispatched.insert(node_id.to_string());
        self.events.emit(
            &self.run_id,
            EventKind::NodeScheduled,
            json!({"node": node_id, "attempt": attempt}),
        );
        self.spawn_worker(node, attempt, input);
        Ok(())
    }

    fn spawn_worker(&mut self, node: CompiledNode, attempt: u32, input: Value) {
        let store = self.store.clone();
        let events = self.events.clone();
        let adapters = self.adapters.clone();
        let semaphore = self.semaphore.clone();
        let tx = self.tx.clone();
        let run_id = self.run_id.clone();

        self.tasks.spawn(async move {
            let node_id = node.id.clone();
            let result =
                execute_attempt(store, events, adapters, semaphore, &run_id, &node, attempt, input)
                    .await;
            let _ = tx
                .send(WorkerMsg::Finished {
                    node_id,
                    attempt,
                    result,
                })
                .await;
        });
    }

    async fn handle_finished(
        &mut self,
        node_id: &str,
        attempt: u32,
        result: std::result::Result<Value, AdapterError>,
    ) -> Result<()> {
        match result {
            Ok(output) => {
                let transition = self
                    .store
                    .transition(
                        &self.run_id,
                        node_id,
                        NodeStatus::Succeeded,
                        attempt,
                        Some(&output),
                        None,
                    )
                    .await?;
                let record = transition.record().clone();
                self.events.emit(
                    &self.run_id,
                    EventKind::NodeFinished,
                    json!({"node": node_id, "status": record.status, "attempt": record.attempt}),
                );
                self.count_node(node_id, record.status);
                let settled = self.settled_from_record(&record)?;
                self.settle(settled).await?;
            }
            Err(err) => {
                let node = self.node(node_id)?.clone();
                if attempt < node.max_attempts() && err_is_retryable(&err) {
                    self.schedule_retry(&node, attempt, &err).await?;
                } else if let Some(settled) = self
                    .record_node_failure(&node, attempt, &err.to_string())
                    .await?
                {
                    self.settle(settled).await?;
                }
            }
        }
        Ok(())
    }

    async fn schedule_retry(
        &mut self,
        node: &CompiledNode,
        attempt: u32,
        err: &AdapterError,
    ) -> Result<()> {
        let transition = self
            .store
            .transition(
                &self.run_id,
                &node.id,
                NodeStatus::Ready,
                attempt + 1,
                None,
                Some(&err.to_string()),
            )
            .await?;
        // A concurrent terminal decision (cancel) wins over the retry.
        if !matches!(transition.record().status, NodeStatus::Ready) {
            let settled = self.settled_from_record(transition.record())?;
            return self.settle(settled).await;
        }

        let delay = node
            .retry
            .as_ref()
            .map(|r| r.delay_after(attempt))
            .unwrap_or_default();
        metrics::counter!("weft_node_retries_total", "kind" => node.kind.name()).increment(1);
        self.events.emit(
            &self.run_id,
            EventKind::NodeRetrying,
            json!({
                "node": node.id,
                "next_attempt": attempt + 1,
                "delay_ms": delay.as_millis() as u64,
                "error": err.to_string(),
            }),
        );
        debug!(run_id = %self.run_id, node = %node.id, attempt, delay_ms = delay.as_millis() as u64, "retry scheduled");

        let tx = self.tx.clone();
        let node_id = node.id.clone();
        self.tasks.spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx
                .send(WorkerMsg::RetryDue {
                    node_id,
                    attempt: attempt + 1,
                })
                .await;
        });
        Ok(())
    }

    /// Record a terminal node failure. Optional nodes contribute `Null`
    /// downstream; otherwise the whole run fails.
    async fn record_node_failure(
        &mut self,
        node: &CompiledNode,
        attempt: u32,
        reason: &str,
    ) -> Result<Option<Settled>> {
        self.dispatched.insert(node.id.clone());
        self.store
            .init_node_execution(&self.run_id, &node.id, NodeStatus::Ready)
            .await?;
        let transition = self
            .store
            .transition(
                &self.run_id,
                &node.id,
                NodeStatus::Failed,
                attempt,
                None,
                Some(reason),
            )
            .await?;
        let record = transition.record().clone();
        self.events.emit(
            &self.run_id,
            EventKind::NodeFinished,
            json!({"node": node.id, "status": record.status, "attempt": record.attempt, "error": reason}),
        );
        self.count_node(&node.id, record.status);

        if !matches!(record.status, NodeStatus::Failed) {
            // Lost the race; act on what was recorded.
            return Ok(Some(self.settled_from_record(&record)?));
        }
        if node.optional {
            warn!(run_id = %self.run_id, node = %node.id, reason, "optional node failed, continuing with null");
            return Ok(Some(Settled {
                node_id: node.id.clone(),
                contribution: Some(Value::Null),
                selected: None,
            }));
        }
        self.failure = Some(RunError::NodeFailed {
            node_id: node.id.clone(),
            attempts: attempt,
            reason: reason.to_string(),
        });
        Ok(Some(Settled {
            node_id: node.id.clone(),
            contribution: None,
            selected: None,
        }))
    }

    // =========================================================================
    // Crash recovery
    // =========================================================================

    /// Rebuild the frontier from persisted node executions. Succeeded
    /// rows are reused as-is; branch selections are re-derived from the
    /// recorded inputs (predicates are pure); interrupted attempts are
    /// re-dispatched with their recorded attempt number.
    async fn replay(&mut self) -> Result<()> {
        let snapshot = self
            .store
            .snapshot(&self.run_id)
            .await?
            .ok_or_else(|| Error::Internal(format!("run {} vanished during recovery", self.run_id)))?;

        let rows: HashMap<String, NodeExecution> = snapshot
            .nodes
            .into_iter()
            .map(|n| (n.node_id.clone(), n))
            .collect();
        self.predecided = rows.keys().cloned().collect();
        info!(run_id = %self.run_id, rows = rows.len(), "resuming run");

        for node_id in self.graph.topo_order().to_vec() {
            let Some(record) = rows.get(&node_id).cloned() else {
                continue;
            };
            self.predecided.remove(&node_id);

            match record.status {
                NodeStatus::Succeeded => {
                    let node = self.node(&node_id)?.clone();
                    let selected = match &node.kind {
                        NodeKind::Branch(cfg) => {
                            let input =
                                resolve_input(&self.graph, &node, &self.run_input, &self.outputs);
                            match eval_predicate(&cfg.predicate, &input) {
                                Ok(true) => Some(cfg.on_true.clone()),
                                Ok(false) => Some(cfg.on_false.clone()),
                                Err(reason) => {
                                    self.failure = Some(RunError::NodeFailed {
                                        node_id: node_id.clone(),
                                        attempts: record.attempt,
                                        reason,
                                    });
                                    return Ok(());
                                }
                            }
                        }
                        _ => None,
                    };
                    self.dispatched.insert(node_id.clone());
                    self.settle(Settled {
                        node_id,
                        contribution: Some(record.output.unwrap_or(Value::Null)),
                        selected,
                    })
                    .await?;
                }
                NodeStatus::Skipped | NodeStatus::Cancelled => {
                    self.dispatched.insert(node_id.clone());
                    self.settle(Settled {
                        node_id,
                        contribution: None,
                        selected: None,
                    })
                    .await?;
                }
                NodeStatus::Failed => {
                    let node = self.node(&node_id)?.clone();
                    self.dispatched.insert(node_id.clone());
                    if node.optional {
                        self.settle(Settled {
                            node_id,
                            contribution: Some(Value::Null),
                            selected: None,
                        })
                        .await?;
                    } else {
                        self.failure = Some(RunError::NodeFailed {
                            node_id: node_id.clone(),
                            attempts: record.attempt,
                            reason: record.error.unwrap_or_else(|| "node failed".into()),
                        });
                        return Ok(());
                    }
                }
                NodeStatus::Blocked | NodeStatus::Ready | NodeStatus::Running => {
                    let node = self.node(&node_id)?.clone();
                    match &node.kind {
                        NodeKind::Start => {
                            self.complete_locally(&node_id, record.attempt, self.run_input.clone(), None)
                                .await?;
                        }
                        NodeKind::End | NodeKind::Merge | NodeKind::Branch(_) => {
                            let settled = self.activate(&node_id).await?;
                            if let Some(settled) = settled {
                                self.settle(settled).await?;
                            }
                        }
                        _ => {
                            self.dispatch_capability(&node_id, record.attempt.max(1))
                                .await?;
                        }
                    }
                }
            }
        }
        Ok(())
    }

    // =========================================================================
    // Run completion
    // =========================================================================

    /// The run output is the output of the (non-skipped) end node, or a
    /// map keyed by end node ID when several are live.
    fn run_output(&self) -> Value {
        let live: Vec<&String> = self
            .graph
            .end_ids()
            .iter()
            .filter(|id| self.outputs.contains_key(*id))
            .collect();
        match live.as_slice() {
            [] => Value::Null,
            [only] => self.outputs[only.as_str()].clone(),
            many => {
                let mut object = Map::new();
                for id in many {
                    object.insert((*id).clone(), self.outputs[id.as_str()].clone());
                }
                Value::Object(object)
            }
        }
    }

    /// Abort in-flight workers and mark every dispatched, unsettled
    /// node cancelled. Nodes that never got a row stay rowless.
    async fn cancel_outstanding(&mut self) {
        self.tasks.abort_all();
        let pending: Vec<String> = self
            .dispatched
            .iter()
            .filter(|id| !self.settled.contains(*id))
            .cloned()
            .collect();
        for node_id in pending {
            let result = self
                .store
                .transition(&self.run_id, &node_id, NodeStatus::Cancelled, 1, None, None)
                .await;
            if let Err(e) = result {
                warn!(run_id = %self.run_id, node = %node_id, error = %e, "failed to cancel node");
            }
        }
    }

    async fn finish(&mut self, status: RunStatus, output: Option<Value>, error: Option<String>) {
        let result = self
            .store
            .update_run_status(&self.run_id, status, output.as_ref(), error.as_deref())
            .await;
        if let Err(e) = result {
            error!(run_id = %self.run_id, error = %e, "failed to record run completion");
        }
        metrics::counter!("weft_runs_completed_total", "status" => status.to_string()).increment(1);
        self.events.emit(
            &self.run_id,
            EventKind::RunFinished,
            json!({"status": status, "error": error}),
        );
    }

    // =========================================================================
    // Helpers
    // =========================================================================

    fn node(&self, node_id: &str) -> Result<&CompiledNode> {
        self.graph
            .node(node_id)
            .ok_or_else(|| Error::Internal(format!("unknown node '{}' in run {}", node_id, self.run_id)))
    }

    /// Build a settle item from a recorded row, deriving the downstream
    /// contribution from the recorded status.
    fn settled_from_record(&self, record: &NodeExecution) -> Result<Settled> {
        let contribution = match record.status {
            NodeStatus::Succeeded => Some(record.output.clone().unwrap_or(Value::Null)),
            NodeStatus::Failed => {
                let optional = self.node(&record.node_id)?.optional;
                optional.then_some(Value::Null)
            }
            _ => None,
        };
        Ok(Settled {
            node_id: record.node_id.clone(),
            contribution,
            selected: None,
        })
    }

    fn count_node(&self, node_id: &str, status: NodeStatus) {
        let kind = self
            .graph
            .node(node_id)
            .map(|n| n.kind.name())
            .unwrap_or("unknown");
        metrics::counter!(
            "weft_node_executions_total",
            "kind" => kind,
            "status" => status.to_string()
        )
        .increment(1);
    }
}

/// Retries make sense for conditions that can clear on their own; a
/// definitive backend refusal will not.
fn err_is_retryable(err: &AdapterError) -> bool {
    !matches!(err.kind, AdapterErrorKind::BackendRejected)
}

/// One capability attempt, on a worker task.
#[allow(clippy::too_many_arguments)]
#[instrument(skip_all, fields(run_id, node_id = %node.id, attempt))]
async fn execute_attempt(
    store: SqliteStore,
    events: EventSink,
    adapters: AdapterRegistry,
    semaphore: Arc<Semaphore>,
    run_id: &str,
    node: &CompiledNode,
    attempt: u32,
    input: Value,
) -> std::result::Result<Value, AdapterError> {
    let _permit = semaphore
        .acquire_owned()
        .await
        .map_err(|_| AdapterError::unavailable("engine is shutting down"))?;

    match store
        .transition(run_id, &node.id, NodeStatus::Running, attempt, None, None)
        .await
    {
        Ok(t) if !t.is_accepted() && t.record().status.is_terminal() => {
            // Already decided, e.g. replayed after a crash mid-attempt.
            return match t.record().status {
                NodeStatus::Succeeded => Ok(t.record().output.clone().unwrap_or(Value::Null)),
                other => Err(AdapterError::rejected(format!(
                    "node already decided as {}",
                    other
                ))),
            };
        }
        Ok(_) => {}
        Err(e) => return Err(AdapterError::unavailable(format!("state store error: {}", e))),
    }

    events.emit(
        run_id,
        EventKind::NodeStarted,
        json!({"node": node.id, "attempt": attempt, "kind": node.kind.name()}),
    );

    let adapter = adapters.get(node.kind.name()).ok_or_else(|| {
        AdapterError::unavailable(format!("no adapter registered for kind '{}'", node.kind.name()))
    })?;

    let ctx = CallContext {
        run_id: run_id.to_string(),
        node_id: node.id.clone(),
        attempt,
        input: input.clone(),
        timeout: node.timeout,
    };
    events.emit(
        run_id,
        EventKind::CallIssued,
        json!({
            "node": node.id,
            "attempt": attempt,
            "kind": node.kind.name(),
            "token": ctx.idempotency_token(),
        }),
    );

    let started = Instant::now();
    let result = match tokio::time::timeout(node.timeout, adapter.invoke(&node.kind, &ctx)).await {
        Ok(inner) => inner,
        Err(_) => Err(AdapterError::timeout(format!(
            "attempt did not complete within {}s",
            node.timeout.as_secs()
        ))),
    };
    let latency = started.elapsed();
    metrics::histogram!("weft_node_duration_seconds", "kind" => node.kind.name())
        .record(latency.as_secs_f64());

    events.emit_call(&CallRecord {
        run_id: run_id.to_string(),
        node_id: node.id.clone(),
        attempt,
        request: input,
        response: result.as_ref().ok().cloned(),
        error: result.as_ref().err().map(|e| e.to_string()),
        latency_ms: latency.as_millis() as u64,
    });

    result
}
