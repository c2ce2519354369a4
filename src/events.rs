//! Run event sink.
//!
//! The engine emits an ordered stream of lifecycle and trace events per run.
//! Emission is non-blocking: events go into a bounded channel and a writer
//! task persists them. When the buffer is full the event is dropped and
//! counted, never stalling the scheduler.

use chrono::Utc;
use serde::Serialize;
use serde_json::{json, Value};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::state::SqliteStore;

/// Event kinds emitted over a run's lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    RunStarted,
    RunFinished,
    NodeScheduled,
    NodeStarted,
    NodeFinished,
    NodeRetrying,
    NodeSkipped,
    CallIssued,
    CallCompleted,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::RunStarted => "run_started",
            EventKind::RunFinished => "run_finished",
            EventKind::NodeScheduled => "node_scheduled",
            EventKind::NodeStarted => "node_started",
            EventKind::NodeFinished => "node_finished",
            EventKind::NodeRetrying => "node_retrying",
            EventKind::NodeSkipped => "node_skipped",
            EventKind::CallIssued => "call_issued",
            EventKind::CallCompleted => "call_completed",
        }
    }
}

/// Trace record for one capability backend call.
#[derive(Debug, Clone, Serialize)]
pub struct CallRecord {
    pub run_id: String,
    pub node_id: String,
    pub attempt: u32,
    pub request: Value,
    /// Backend output when the call succeeded
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response: Option<Value>,
    /// Error description when it did not
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub latency_ms: u64,
}

#[derive(Debug)]
struct PendingEvent {
    run_id: String,
    kind: EventKind,
    payload: Value,
}

#[derive(Debug)]
enum SinkMsg {
    Event(PendingEvent),
    /// Flush barrier: acknowledged once every earlier event is written.
    Flush(oneshot::Sender<()>),
}

/// Handle for emitting run events. Cheap to clone.
#[derive(Clone)]
pub struct EventSink {
    tx: mpsc::Sender<SinkMsg>,
}

impl EventSink {
    /// Spawn the writer task and return the sink plus its join handle.
    pub fn spawn(store: SqliteStore, buffer: usize) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(buffer.max(1));
        let handle = tokio::spawn(writer_loop(store, rx));
        (Self { tx }, handle)
    }

    /// Emit an event. Never blocks; drops and counts on a full buffer.
    pub fn emit(&self, run_id: &str, kind: EventKind, payload: Value) {
        let event = PendingEvent {
            run_id: run_id.to_string(),
            kind,
            payload,
        };
        if let Err(e) = self.tx.try_send(SinkMsg::Event(event)) {
            metrics::counter!("weft_events_dropped_total").increment(1);
            warn!(error = %e, "event buffer full, dropping event");
        }
    }

    /// Wait until every event emitted so far is persisted. The channel
    /// is FIFO, so the barrier's acknowledgement implies all earlier
    /// events were written (or deliberately dropped).
    pub async fn flush(&self) {
        let (ack, done) = oneshot::channel();
        if self.tx.send(SinkMsg::Flush(ack)).await.is_ok() {
            let _ = done.await;
        }
    }

    /// Emit the trace pair payload for a completed backend call.
    pub fn emit_call(&self, record: &CallRecord) {
        let payload = serde_json::to_value(record).unwrap_or_else(|_| json!({}));
        self.emit(&record.run_id, EventKind::CallCompleted, payload);
    }
}

async fn writer_loop(store: SqliteStore, mut rx: mpsc::Receiver<SinkMsg>) {
    while let Some(msg) = rx.recv().await {
        let event = match msg {
            SinkMsg::Event(event) => event,
            SinkMsg::Flush(ack) => {
                let _ = ack.send(());
                continue;
            }
        };
        let payload = json!({
            "at": Utc::now().to_rfc3339(),
            "data": event.payload,
        });
        // One retry on a transient storage error, then drop.
        for attempt in 0..2u8 {
            match store
                .append_event(&event.run_id, event.kind.as_str(), &payload)
                .await
            {
                Ok(_) => break,
                Err(e) if attempt == 0 => {
                    debug!(error = %e, "event write failed, retrying");
                    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
                }
                Err(e) => {
                    metrics::counter!("weft_events_dropped_total").increment(1);
                    warn!(error = %e, run_id = %event.run_id, "event write failed, dropping");
                }
            }
        }
    }
    debug!("event writer stopped");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn events_are_persisted_in_emission_order() {
        let store = SqliteStore::open_in_memory().unwrap();
        let (sink, handle) = EventSink::spawn(store.clone(), 64);

        sink.emit("run-1", EventKind::RunStarted, json!({"input": 1}));
        sink.emit("run-1", EventKind::NodeStarted, json!({"node": "a"}));
        sink.emit("run-1", EventKind::RunFinished, json!({"status": "succeeded"}));
        drop(sink);
        handle.await.unwrap();

        let events = store.list_events("run-1").await.unwrap();
        assert_eq!(events.len(), 3);
        assert_eq!(events[0].kind, "run_started");
        assert_eq!(events[1].kind, "node_started");
        assert_eq!(events[2].kind, "run_finished");
        assert!(events[0].id < events[1].id);
    }

    #[tokio::test]
    async fn flush_waits_for_buffered_events() {
        let store = SqliteStore::open_in_memory().unwrap();
        let (sink, _writer) = EventSink::spawn(store.clone(), 64);

        for i in 0..10 {
            sink.emit("run-1", EventKind::NodeStarted, json!({"seq": i}));
        }
        // The writer task keeps running; flush alone must guarantee
        // everything emitted before it is on disk.
        sink.flush().await;

        let events = store.list_events("run-1").await.unwrap();
        assert_eq!(events.len(), 10);
    }

    #[tokio::test]
    async fn call_records_serialize_without_empty_fields() {
        let record = CallRecord {
            run_id: "r".into(),
            node_id: "n".into(),
            attempt: 1,
            request: json!({"prompt": "hi"}),
            response: Some(json!({"text": "ok"})),
            error: None,
            latency_ms: 12,
        };
        let value = serde_json::to_value(&record).unwrap();
        assert!(value.get("error").is_none());
        assert_eq!(value["latency_ms"], 12);
    }
}
