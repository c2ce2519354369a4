//! weft - Agent workflow orchestration engine
//!
//! weft compiles declarative workflow definitions into immutable DAGs
//! and drives runs over them: model calls, tool invocations, and RPA
//! actions, with per-node retry, timeout, and branching, and durable
//! run state that survives a crash.
//!
//! ## Example
//!
//! ```yaml
//! name: order-triage
//! description: Classify incoming orders and route big ones to review
//!
//! nodes:
//!   - id: start
//!     kind: start
//!
//!   - id: classify
//!     kind: model_call
//!     config:
//!       prompt: "Classify this order: {{ input }}"
//!     depends_on: [start]
//!     retry:
//!       max_attempts: 3
//!       backoff: exponential
//!       base_delay_ms: 500
//!
//!   - id: decide
//!     kind: branch
//!     config:
//!       predicate: "input.total > 1000"
//!       on_true: review
//!       on_false: archive
//!     depends_on: [classify]
//!
//!   - id: review
//!     kind: tool_call
//!     config:
//!       tool_id: review_queue
//!     depends_on: [decide]
//!
//!   - id: archive
//!     kind: tool_call
//!     config:
//!       tool_id: archive
//!     depends_on: [decide]
//!
//!   - id: done
//!     kind: end
//!     depends_on: [review, archive]
//! ```

pub mod adapters;
pub mod api;
pub mod config;
pub mod engine;
pub mod error;
pub mod events;
pub mod graph;
pub mod metrics;
pub mod shutdown;
pub mod state;

pub use engine::Engine;
pub use error::{Error, Result};
