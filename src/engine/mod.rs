//! Run scheduling and execution.

mod bindings;
mod cancel;
mod driver;
mod predicate;

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::{Notify, Semaphore};
use tokio::task::JoinHandle;
use tracing::info;

use crate::adapters::AdapterRegistry;
use crate::error::{Error, Result};
use crate::events::EventSink;
use crate::graph::{compile, parse_definition, Graph};
use crate::state::{Run, SqliteStore, StoredWorkflow};

use cancel::CancelRegistry;
use driver::RunDriver;

/// Outcome of a cancel request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    /// The run was signalled (or force-marked) cancelled.
    Accepted,
    /// The run had already reached a terminal status.
    AlreadyFinished,
    /// No run with that ID exists.
    NotFound,
}

/// The orchestration engine: compiles stored workflows and drives runs.
///
/// One engine instance serves the whole process; runs share its worker
/// semaphore, adapter registry, and event sink.
pub struct Engine {
    store: SqliteStore,
    adapters: AdapterRegistry,
    events: EventSink,
    semaphore: Arc<Semaphore>,
    cancels: CancelRegistry,
    shutting_down: AtomicBool,
    active: Arc<AtomicUsize>,
    drained: Arc<Notify>,
}

impl Engine {
    pub fn new(
        store: SqliteStore,
        adapters: AdapterRegistry,
        events: EventSink,
        workers: usize,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            adapters,
            events,
            semaphore: Arc::new(Semaphore::new(workers.max(1))),
            cancels: CancelRegistry::default(),
            shutting_down: AtomicBool::new(false),
            active: Arc::new(AtomicUsize::new(0)),
            drained: Arc::new(Notify::new()),
        })
    }

    pub fn store(&self) -> &SqliteStore {
        &self.store
    }

    /// Start a run and return immediately; the run proceeds on its own
    /// driver task.
    pub async fn start_run(self: &Arc<Self>, workflow: &StoredWorkflow, input: Value) -> Result<Run> {
        let (run, _handle) = self.launch(workflow, input).await?;
        Ok(run)
    }

    /// Start a run and wait for it to reach a terminal status.
    pub async fn run_to_completion(
        self: &Arc<Self>,
        workflow: &StoredWorkflow,
        input: Value,
    ) -> Result<Run> {
        let (run, handle) = self.launch(workflow, input).await?;
        handle
            .await
            .map_err(|e| Error::Internal(format!("run driver panicked: {}", e)))?;
        self.store
            .get_run(&run.id)
            .await?
            .ok_or_else(|| Error::Internal(format!("run {} vanished", run.id)))
    }

    /// Request cancellation of a run.
    ///
    /// Live runs are signalled and wind down through their driver; a
    /// non-terminal run without a live driver (left over from a crashed
    /// process) is marked cancelled directly.
    pub async fn cancel_run(&self, run_id: &str) -> Result<CancelOutcome> {
        let Some(run) = self.store.get_run(run_id).await? else {
            return Ok(CancelOutcome::NotFound);
        };
        if run.status.is_terminal() {
            return Ok(CancelOutcome::AlreadyFinished);
        }
        if !self.cancels.cancel(run_id) {
            self.store
                .update_run_status(
                    run_id,
                    crate::state::RunStatus::Cancelled,
                    None,
                    Some("cancelled by operator"),
                )
                .await?;
        }
        info!(run_id, "cancellation requested");
        Ok(CancelOutcome::Accepted)
    }

    /// Resume every run left non-terminal by a previous process.
    /// Returns the number of runs resumed.
    pub async fn recover(self: &Arc<Self>) -> Result<usize> {
        let run_ids = self.store.unfinished_run_ids().await?;
        let mut resumed = 0;
        for run_id in run_ids {
            let Some(run) = self.store.get_run(&run_id).await? else {
                continue;
            };
            let Some(workflow) = self.store.get_workflow(&run.workflow_id).await? else {
                self.store
                    .update_run_status(
                        &run_id,
                        crate::state::RunStatus::Failed,
                        None,
                        Some("workflow definition missing during recovery"),
                    )
                    .await?;
                continue;
            };
            let definition = parse_definition(&workflow.definition)?;
            let graph = compile(&definition)?;
            self.spawn_driver(graph, &run, true);
            resumed += 1;
        }
        if resumed > 0 {
            info!(resumed, "resumed unfinished runs");
        }
        Ok(resumed)
    }

    async fn launch(
        self: &Arc<Self>,
        workflow: &StoredWorkflow,
        input: Value,
    ) -> Result<(Run, JoinHandle<()>)> {
        if self.shutting_down.load(Ordering::SeqCst) {
            return Err(Error::Internal("engine is shutting down".into()));
        }
        let definition = parse_definition(&workflow.definition)?;
        let graph = compile(&definition)?;
        let run = self
            .store
            .create_run(&workflow.id, &workflow.name, graph.version, &input)
            .await?;
        info!(run_id = %run.id, workflow = %workflow.name, "run started");
        let handle = self.spawn_driver(graph, &run, false);
        Ok((run, handle))
    }

    fn spawn_driver(self: &Arc<Self>, graph: Arc<Graph>, run: &Run, resume: bool) -> JoinHandle<()> {
        let cancel = self.cancels.register(&run.id);
        let (driver, rx) = RunDriver::new(
            self.store.clone(),
            self.adapters.clone(),
            self.events.clone(),
            self.semaphore.clone(),
            cancel,
            graph,
            run,
        );
        let cancels = self.cancels.clone();
        let run_id = run.id.clone();
        let active = self.active.clone();
        let drained = self.drained.clone();
        active.fetch_add(1, Ordering::SeqCst);
        tokio::spawn(async move {
            driver.drive(rx, resume).await;
            cancels.remove(&run_id);
            if active.fetch_sub(1, Ordering::SeqCst) == 1 {
                drained.notify_waiters();
            }
        })
    }

    /// Stop accepting new runs, wait for live drivers to settle, then
    /// flush buffered events to the store.
    pub async fn shutdown(&self) {
        self.shutting_down.store(true, Ordering::SeqCst);
        loop {
            let notified = self.drained.notified();
            if self.active.load(Ordering::SeqCst) == 0 {
                break;
            }
            notified.await;
        }
        self.semaphore.close();
        self.events.flush().await;
        info!("engine drained");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::{Adapter, CallContext};
    use crate::error::AdapterError;
    use crate::graph::NodeKind;
    use crate::state::{NodeStatus, RunStatus};
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    struct StubAdapter {
        kind: &'static str,
        fail_times: u32,
        hang: bool,
        delay: Duration,
        output: Value,
        calls: Arc<AtomicU32>,
    }

    impl StubAdapter {
        fn succeeding(kind: &'static str, output: Value) -> Self {
            Self {
                kind,
                fail_times: 0,
                hang: false,
                delay: Duration::ZERO,
                output,
                calls: Arc::new(AtomicU32::new(0)),
            }
        }

        fn flaky(kind: &'static str, fail_times: u32, output: Value) -> Self {
            Self {
                fail_times,
                ..Self::succeeding(kind, output)
            }
        }

        fn hanging(kind: &'static str) -> Self {
            Self {
                hang: true,
                ..Self::succeeding(kind, Value::Null)
            }
        }

        fn slow(kind: &'static str, delay: Duration, output: Value) -> Self {
            Self {
                delay,
                ..Self::succeeding(kind, output)
            }
        }
    }

    #[async_trait]
    impl Adapter for StubAdapter {
        fn kind(&self) -> &'static str {
            self.kind
        }

        async fn invoke(
            &self,
            _kind: &NodeKind,
            _ctx: &CallContext,
        ) -> std::result::Result<Value, AdapterError> {
            if self.hang {
                tokio::time::sleep(Duration::from_secs(3600)).await;
            }
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if call <= self.fail_times {
                return Err(AdapterError::unavailable("stub backend outage"));
            }
            Ok(self.output.clone())
        }
    }

    fn test_engine(adapters: AdapterRegistry) -> (Arc<Engine>, SqliteStore) {
        let store = SqliteStore::open_in_memory().unwrap();
        let (events, _writer) = EventSink::spawn(store.clone(), 256);
        (Engine::new(store.clone(), adapters, events, 4), store)
    }

    async fn saved(store: &SqliteStore, name: &str, yaml: &str) -> StoredWorkflow {
        store.save_workflow(name, yaml).await.unwrap()
    }

    async fn wait_terminal(store: &SqliteStore, run_id: &str) -> Run {
        for _ in 0..400 {
            let run = store.get_run(run_id).await.unwrap().unwrap();
            if run.status.is_terminal() {
                return run;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("run {} did not reach a terminal status", run_id);
    }

    const LINEAR: &str = r#"
name: linear
nodes:
  - id: start
    kind: start
  - id: call
    kind: model_call
    config:
      prompt: "Summarize {{ input }}"
    depends_on: [start]
  - id: done
    kind: end
    depends_on: [call]
"#;

    #[tokio::test]
    async fn linear_run_carries_output_to_the_end() {
        let mut adapters = AdapterRegistry::empty();
        adapters.register(Arc::new(StubAdapter::succeeding(
            "model_call",
            json!({"text": "summary"}),
        )));
        let (engine, store) = test_engine(adapters);

        let workflow = saved(&store, "linear", LINEAR).await;
        let run = engine
            .run_to_completion(&workflow, json!({"orders": [1, 2]}))
            .await
            .unwrap();

        assert_eq!(run.status, RunStatus::Succeeded);
        assert_eq!(run.output, Some(json!({"text": "summary"})));

        let snapshot = store.snapshot(&run.id).await.unwrap().unwrap();
        assert_eq!(snapshot.nodes.len(), 3);
        assert!(snapshot
            .nodes
            .iter()
            .all(|n| n.status == NodeStatus::Succeeded));
    }

    #[tokio::test]
    async fn flaky_node_retries_until_it_succeeds() {
        let stub = StubAdapter::flaky("model_call", 2, json!({"text": "third time"}));
        let calls = stub.calls.clone();
        let mut adapters = AdapterRegistry::empty();
        adapters.register(Arc::new(stub));
        let (engine, store) = test_engine(adapters);

        let workflow = saved(
            &store,
            "flaky",
            r#"
name: flaky
nodes:
  - id: start
    kind: start
  - id: call
    kind: model_call
    config:
      prompt: "go"
    depends_on: [start]
    retry:
      max_attempts: 3
      backoff: fixed
      base_delay_ms: 1
  - id: done
    kind: end
    depends_on: [call]
"#,
        )
        .await;

        let run = engine
            .run_to_completion(&workflow, Value::Null)
            .await
            .unwrap();
        assert_eq!(run.status, RunStatus::Succeeded);
        assert_eq!(calls.load(Ordering::SeqCst), 3);

        let record = store
            .get_node_execution(&run.id, "call")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(record.attempt, 3);
        assert_eq!(record.status, NodeStatus::Succeeded);
    }

    #[tokio::test]
    async fn exhausted_required_node_fails_the_run() {
        let mut adapters = AdapterRegistry::empty();
        adapters.register(Arc::new(StubAdapter::flaky("model_call", 99, Value::Null)));
        let (engine, store) = test_engine(adapters);

        let workflow = saved(&store, "doomed", LINEAR).await;
        let run = engine
            .run_to_completion(&workflow, Value::Null)
            .await
            .unwrap();

        assert_eq!(run.status, RunStatus::Failed);
        assert!(run.error.unwrap().contains("call"));
        // The end node was never reached, so it has no execution row.
        assert!(store
            .get_node_execution(&run.id, "done")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn optional_node_failure_contributes_null_downstream() {
        let mut adapters = AdapterRegistry::empty();
        adapters.register(Arc::new(StubAdapter::flaky("model_call", 99, Value::Null)));
        let (engine, store) = test_engine(adapters);

        let workflow = saved(
            &store,
            "lenient",
            r#"
name: lenient
nodes:
  - id: start
    kind: start
  - id: enrich
    kind: model_call
    config:
      prompt: "enrich"
    depends_on: [start]
    optional: true
  - id: done
    kind: end
    depends_on: [enrich]
"#,
        )
        .await;

        let run = engine
            .run_to_completion(&workflow, json!({"id": 7}))
            .await
            .unwrap();
        assert_eq!(run.status, RunStatus::Succeeded);
        assert_eq!(run.output, Some(Value::Null));

        let record = store
            .get_node_execution(&run.id, "enrich")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(record.status, NodeStatus::Failed);
    }

    #[tokio::test]
    async fn branch_runs_selected_arm_and_skips_the_other() {
        let mut adapters = AdapterRegistry::empty();
        adapters.register(Arc::new(StubAdapter::succeeding(
            "tool_call",
            json!({"ran": true}),
        )));
        let (engine, store) = test_engine(adapters);

        let workflow = saved(
            &store,
            "branching",
            r#"
name: branching
nodes:
  - id: start
    kind: start
  - id: decide
    kind: branch
    config:
      predicate: "input.total > 10"
      on_true: big
      on_false: small
    depends_on: [start]
  - id: big
    kind: tool_call
    config:
      tool_id: big_orders
    depends_on: [decide]
  - id: small
    kind: tool_call
    config:
      tool_id: small_orders
    depends_on: [decide]
  - id: done
    kind: end
    depends_on: [big, small]
"#,
        )
        .await;

        let run = engine
            .run_to_completion(&workflow, json!({"total": 42}))
            .await
            .unwrap();
        assert_eq!(run.status, RunStatus::Succeeded);
        assert_eq!(run.output, Some(json!({"ran": true})));

        let big = store.get_node_execution(&run.id, "big").await.unwrap().unwrap();
        let small = store
            .get_node_execution(&run.id, "small")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(big.status, NodeStatus::Succeeded);
        assert_eq!(small.status, NodeStatus::Skipped);
    }

    #[tokio::test]
    async fn cancelled_run_winds_down_without_finishing_nodes() {
        let mut adapters = AdapterRegistry::empty();
        adapters.register(Arc::new(StubAdapter::hanging("model_call")));
        let (engine, store) = test_engine(adapters);

        let workflow = saved(&store, "stuck", LINEAR).await;
        let run = engine.start_run(&workflow, Value::Null).await.unwrap();

        // Let the capability attempt get in flight before cancelling.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(
            engine.cancel_run(&run.id).await.unwrap(),
            CancelOutcome::Accepted
        );

        let finished = wait_terminal(&store, &run.id).await;
        assert_eq!(finished.status, RunStatus::Cancelled);

        let record = store
            .get_node_execution(&run.id, "call")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(record.status, NodeStatus::Cancelled);

        assert_eq!(
            engine.cancel_run(&run.id).await.unwrap(),
            CancelOutcome::AlreadyFinished
        );
        assert_eq!(
            engine.cancel_run("no-such-run").await.unwrap(),
            CancelOutcome::NotFound
        );
    }

    #[tokio::test(start_paused = true)]
    async fn attempt_exceeding_its_budget_times_out() {
        let mut adapters = AdapterRegistry::empty();
        adapters.register(Arc::new(StubAdapter::hanging("model_call")));
        let (engine, store) = test_engine(adapters);

        let workflow = saved(
            &store,
            "slow",
            r#"
name: slow
nodes:
  - id: start
    kind: start
  - id: call
    kind: model_call
    config:
      prompt: "go"
    depends_on: [start]
    timeout_seconds: 1
  - id: done
    kind: end
    depends_on: [call]
"#,
        )
        .await;

        let run = engine
            .run_to_completion(&workflow, Value::Null)
            .await
            .unwrap();
        assert_eq!(run.status, RunStatus::Failed);
        assert!(run.error.unwrap().contains("ADAPTER_TIMEOUT"));
    }

    #[tokio::test]
    async fn recovery_reuses_finished_nodes_and_redrives_the_rest() {
        let stub = StubAdapter::succeeding("model_call", json!({"text": "resumed"}));
        let calls = stub.calls.clone();
        let mut adapters = AdapterRegistry::empty();
        adapters.register(Arc::new(stub));
        let (engine, store) = test_engine(adapters);

        let workflow = saved(&store, "interrupted", LINEAR).await;

        // Simulate a crash mid-run: start finished, call was in flight.
        let input = json!({"orders": []});
        let run = store
            .create_run(&workflow.id, &workflow.name, 1, &input)
            .await
            .unwrap();
        store
            .update_run_status(&run.id, RunStatus::Running, None, None)
            .await
            .unwrap();
        store
            .init_node_execution(&run.id, "start", NodeStatus::Ready)
            .await
            .unwrap();
        store
            .transition(&run.id, "start", NodeStatus::Succeeded, 1, Some(&input), None)
            .await
            .unwrap();
        store
            .init_node_execution(&run.id, "call", NodeStatus::Ready)
            .await
            .unwrap();
        store
            .transition(&run.id, "call", NodeStatus::Running, 1, None, None)
            .await
            .unwrap();

        assert_eq!(engine.recover().await.unwrap(), 1);
        let finished = wait_terminal(&store, &run.id).await;
        assert_eq!(finished.status, RunStatus::Succeeded);
        assert_eq!(finished.output, Some(json!({"text": "resumed"})));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn shutdown_drains_live_runs_and_flushes_events() {
        let mut adapters = AdapterRegistry::empty();
        adapters.register(Arc::new(StubAdapter::slow(
            "model_call",
            Duration::from_millis(100),
            json!({"text": "slow"}),
        )));
        let (engine, store) = test_engine(adapters);

        let workflow = saved(&store, "slow", LINEAR).await;
        let run = engine
            .start_run(&workflow, json!({"orders": []}))
            .await
            .unwrap();

        engine.shutdown().await;

        let finished = store.get_run(&run.id).await.unwrap().unwrap();
        assert_eq!(finished.status, RunStatus::Succeeded);

        let events = store.list_events(&run.id).await.unwrap();
        assert!(events.iter().any(|e| e.kind == "run_finished"));

        let err = engine
            .start_run(&workflow, json!({"orders": []}))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("shutting down"));
    }
}
