//! Workflow definition types.
//!
//! A definition is the declarative document produced by the (external)
//! authoring layer. Node kinds form a closed enumeration with per-kind
//! strongly-typed config, so a malformed step is rejected at compile
//! time rather than at dispatch time.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A complete workflow definition, prior to compilation.
///
/// # Example YAML
///
/// ```yaml
/// name: order-summary
/// version: 1
///
/// nodes:
///   - id: start
///     kind: start
///
///   - id: summarize
///     kind: model_call
///     config:
///       prompt: "Summarize these orders"
///     depends_on: [start]
///     retry:
///       max_attempts: 3
///       backoff: exponential
///       base_delay_ms: 100
///
///   - id: end
///     kind: end
///     depends_on: [summarize]
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphDefinition {
    /// Unique workflow name (used as identifier)
    pub name: String,

    /// Human-readable description
    #[serde(default)]
    pub description: String,

    /// Version number (for tracking changes)
    #[serde(default = "default_version")]
    pub version: u32,

    /// Nodes (steps) in the workflow
    pub nodes: Vec<NodeDef>,
}

fn default_version() -> u32 {
    1
}

/// A node (step) in the workflow definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeDef {
    /// Unique node ID within this workflow
    pub id: String,

    /// Node kind and kind-specific configuration
    #[serde(flatten)]
    pub kind: NodeKind,

    /// Dependencies - nodes that must complete before this one
    #[serde(default)]
    pub depends_on: Vec<String>,

    /// Input bindings - how this node's input object is assembled from
    /// dependency outputs. When empty, dependency outputs are merged
    /// positionally (single dependency passes through).
    #[serde(default)]
    pub bindings: Vec<Binding>,

    /// Timeout for one attempt of this node in seconds
    #[serde(default = "default_node_timeout")]
    pub timeout_seconds: u64,

    /// Retry configuration; absent means a single attempt
    #[serde(default)]
    pub retry: Option<RetryPolicy>,

    /// Optional nodes that exhaust retries contribute a null output
    /// downstream instead of failing the run
    #[serde(default)]
    pub optional: bool,
}

fn default_node_timeout() -> u64 {
    60
}

/// Closed enumeration of node kinds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", content = "config", rename_all = "snake_case")]
pub enum NodeKind {
    /// Entry point; its output is the run input.
    Start,
    /// Exit point; its resolved input becomes the run output.
    End,
    /// Large-model invocation.
    ModelCall(ModelCallConfig),
    /// AI/MCP tool invocation.
    ToolCall(ToolCallConfig),
    /// RPA automation action.
    RpaAction(RpaActionConfig),
    /// Predicate over the resolved input selecting one successor path.
    Branch(BranchConfig),
    /// Join point; proceeds once all non-skipped predecessors are terminal.
    Merge,
}

impl NodeKind {
    /// Stable name used in storage, metrics, and the adapter registry.
    pub fn name(&self) -> &'static str {
        match self {
            NodeKind::Start => "start",
            NodeKind::End => "end",
            NodeKind::ModelCall(_) => "model_call",
            NodeKind::ToolCall(_) => "tool_call",
            NodeKind::RpaAction(_) => "rpa_action",
            NodeKind::Branch(_) => "branch",
            NodeKind::Merge => "merge",
        }
    }

    /// Whether this kind dispatches to a capability adapter.
    pub fn is_capability(&self) -> bool {
        matches!(
            self,
            NodeKind::ModelCall(_) | NodeKind::ToolCall(_) | NodeKind::RpaAction(_)
        )
    }
}

/// Model call configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelCallConfig {
    /// Prompt template sent to the model backend
    pub prompt: String,

    /// Model identifier (backend default when absent)
    #[serde(default)]
    pub model: Option<String>,

    /// System prompt (optional)
    #[serde(default)]
    pub system: Option<String>,

    /// Sampling temperature (optional)
    #[serde(default)]
    pub temperature: Option<f32>,

    /// Backend endpoint override (engine default when absent)
    #[serde(default)]
    pub endpoint: Option<String>,
}

/// Tool call configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCallConfig {
    /// Tool identifier in the external tool/MCP registry
    pub tool_id: String,

    /// Operation name for multi-operation tools
    #[serde(default)]
    pub operation: Option<String>,

    /// Static arguments merged under the resolved input
    #[serde(default)]
    pub arguments: Value,

    /// Tool execution endpoint override
    #[serde(default)]
    pub endpoint: Option<String>,
}

/// RPA action configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpaActionConfig {
    /// Action name understood by the RPA driver
    pub action: String,

    /// Static action parameters merged under the resolved input
    #[serde(default)]
    pub parameters: Value,

    /// RPA driver endpoint override
    #[serde(default)]
    pub endpoint: Option<String>,
}

/// Branch configuration.
///
/// The predicate is a rhai boolean expression evaluated over the node's
/// resolved input (bound as `input`). The selected successor proceeds;
/// the other arm and its exclusive descendants are skipped.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BranchConfig {
    /// Boolean rhai expression over `input`
    pub predicate: String,

    /// Successor taken when the predicate is true
    pub on_true: String,

    /// Successor taken when the predicate is false
    pub on_false: String,
}

/// One entry in a node's input bindings.
///
/// Bindings are ordered; the resolved input is an object whose keys are
/// assigned in binding order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Binding {
    /// Node whose recorded output is read (must be an ancestor)
    pub source: String,

    /// Dot-path into the source output (whole output when absent)
    #[serde(default)]
    pub key: Option<String>,

    /// Key under which the value appears in the resolved input
    /// (defaults to the source node ID)
    #[serde(default, rename = "as")]
    pub rename: Option<String>,
}

/// Retry configuration for a node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum attempts, including the first
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Backoff strategy
    #[serde(default)]
    pub backoff: Backoff,

    /// Delay before the first retry in milliseconds
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,

    /// Upper bound on any single delay in milliseconds
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_base_delay_ms() -> u64 {
    1_000
}

fn default_max_delay_ms() -> u64 {
    30_000
}

/// Backoff strategy for retries.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Backoff {
    /// Fixed delay between retries
    #[default]
    Fixed,
    /// Delay doubles per attempt, capped at `max_delay_ms`
    Exponential,
}

impl RetryPolicy {
    /// Delay to wait after the given failed attempt (1-based).
    pub fn delay_after(&self, attempt: u32) -> std::time::Duration {
        let ms = match self.backoff {
            Backoff::Fixed => self.base_delay_ms,
            Backoff::Exponential => {
                let shift = attempt.saturating_sub(1).min(20);
                self.base_delay_ms.saturating_mul(1u64 << shift)
            }
        };
        std::time::Duration::from_millis(ms.min(self.max_delay_ms))
    }
}

impl GraphDefinition {
    /// Get a node definition by ID.
    pub fn get_node(&self, id: &str) -> Option<&NodeDef> {
        self.nodes.iter().find(|n| n.id == id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exponential_backoff_doubles_and_caps() {
        let policy = RetryPolicy {
            max_attempts: 5,
            backoff: Backoff::Exponential,
            base_delay_ms: 100,
            max_delay_ms: 350,
        };
        assert_eq!(policy.delay_after(1).as_millis(), 100);
        assert_eq!(policy.delay_after(2).as_millis(), 200);
        // 400ms capped at 350ms
        assert_eq!(policy.delay_after(3).as_millis(), 350);
    }

    #[test]
    fn fixed_backoff_is_constant() {
        let policy = RetryPolicy {
            max_attempts: 3,
            backoff: Backoff::Fixed,
            base_delay_ms: 250,
            max_delay_ms: 30_000,
        };
        assert_eq!(policy.delay_after(1), policy.delay_after(2));
    }

    #[test]
    fn node_kind_names_are_stable() {
        assert_eq!(NodeKind::Start.name(), "start");
        assert_eq!(NodeKind::Merge.name(), "merge");
        let kind = NodeKind::Branch(BranchConfig {
            predicate: "true".into(),
            on_true: "a".into(),
            on_false: "b".into(),
        });
        assert_eq!(kind.name(), "branch");
    }
}
