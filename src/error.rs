//! Error types for weft.
//!
//! Errors carry machine-parseable codes so API consumers and calling
//! agents can branch on them without string matching.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type alias for weft operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Top-level weft error.
#[derive(Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Compile(#[from] CompileError),

    #[error(transparent)]
    Adapter(#[from] AdapterError),

    #[error(transparent)]
    Run(#[from] RunError),

    #[error("Definition error: {0}")]
    Definition(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Get the error code for programmatic handling.
    pub fn code(&self) -> &'static str {
        match self {
            Error::Compile(e) => e.kind.code(),
            Error::Adapter(e) => e.kind.code(),
            Error::Run(RunError::NodeFailed { .. }) => "NODE_FAILED",
            Error::Run(RunError::RunCancelled { .. }) => "RUN_CANCELLED",
            Error::Definition(_) => "DEFINITION_ERROR",
            Error::Storage(_) => "STORAGE_ERROR",
            Error::Config(_) => "CONFIG_ERROR",
            Error::Internal(_) => "INTERNAL_ERROR",
            Error::Database(_) => "DATABASE_ERROR",
            Error::Yaml(_) => "YAML_ERROR",
            Error::Json(_) => "JSON_ERROR",
            Error::Io(_) => "IO_ERROR",
        }
    }

    /// Get a sanitized message safe for external consumers.
    ///
    /// Hides internal details like file paths and SQL statements that
    /// could leak sensitive information.
    pub fn external_message(&self) -> String {
        match self {
            // User-facing errors carry their own message
            Error::Compile(e) => e.to_string(),
            Error::Adapter(e) => e.to_string(),
            Error::Run(e) => e.to_string(),
            Error::Definition(msg) => format!("Definition error: {}", msg),
            Error::Config(msg) => format!("Configuration error: {}", msg),

            // Internal errors are sanitized
            Error::Storage(_) => "A storage error occurred".to_string(),
            Error::Internal(_) => "An internal error occurred".to_string(),
            Error::Database(_) => "A database error occurred".to_string(),
            Error::Io(_) => "An I/O error occurred".to_string(),

            Error::Yaml(_) => "Invalid YAML format".to_string(),
            Error::Json(_) => "Invalid JSON format".to_string(),
        }
    }

    /// Convert to a structured JSON error body.
    pub fn to_external_json(&self) -> serde_json::Value {
        serde_json::json!({
            "error": {
                "code": self.code(),
                "message": self.external_message(),
            }
        })
    }
}

/// Validation failure kinds for workflow graph compilation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompileErrorKind {
    /// The definition contains a dependency cycle.
    Cycle,
    /// A binding references a node that is not an ancestor (or does not exist).
    DanglingBinding,
    /// A node is not reachable from the start node.
    Unreachable,
    /// Two nodes share the same ID.
    DuplicateId,
    /// Start/end arity violation (no start, multiple starts, no end).
    InvalidStructure,
}

impl CompileErrorKind {
    pub fn code(&self) -> &'static str {
        match self {
            Self::Cycle => "GRAPH_CYCLE",
            Self::DanglingBinding => "GRAPH_DANGLING_BINDING",
            Self::Unreachable => "GRAPH_UNREACHABLE_NODE",
            Self::DuplicateId => "GRAPH_DUPLICATE_ID",
            Self::InvalidStructure => "GRAPH_INVALID_STRUCTURE",
        }
    }
}

/// A workflow definition failed to compile.
///
/// Compilation is all-or-nothing: a definition that produces any
/// `CompileError` is never partially scheduled.
#[derive(Error, Debug, Clone, Serialize, Deserialize)]
#[error("Graph compilation failed ({}): {message}{}", kind.code(), format_nodes(nodes))]
pub struct CompileError {
    pub kind: CompileErrorKind,
    pub message: String,
    /// IDs of the offending node(s), when identifiable.
    pub nodes: Vec<String>,
}

impl CompileError {
    pub fn new(kind: CompileErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            nodes: Vec::new(),
        }
    }

    pub fn with_nodes(mut self, nodes: Vec<String>) -> Self {
        self.nodes = nodes;
        self
    }
}

fn format_nodes(nodes: &[String]) -> String {
    if nodes.is_empty() {
        String::new()
    } else {
        format!(" [{}]", nodes.join(", "))
    }
}

/// Failure kinds shared by all capability backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdapterErrorKind {
    /// The call did not complete within its deadline.
    Timeout,
    /// The backend accepted the request but refused to perform it.
    BackendRejected,
    /// The backend could not be reached.
    BackendUnavailable,
    /// The backend answered with a payload the adapter cannot interpret.
    InvalidOutput,
}

impl AdapterErrorKind {
    pub fn code(&self) -> &'static str {
        match self {
            Self::Timeout => "ADAPTER_TIMEOUT",
            Self::BackendRejected => "ADAPTER_BACKEND_REJECTED",
            Self::BackendUnavailable => "ADAPTER_BACKEND_UNAVAILABLE",
            Self::InvalidOutput => "ADAPTER_INVALID_OUTPUT",
        }
    }
}

/// A capability adapter call failed.
///
/// Adapter errors are retried per the node's retry policy before they
/// become a terminal node failure.
#[derive(Error, Debug, Clone, Serialize, Deserialize)]
#[error("Adapter call failed ({}): {message}", kind.code())]
pub struct AdapterError {
    pub kind: AdapterErrorKind,
    pub message: String,
}

impl AdapterError {
    pub fn new(kind: AdapterErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(AdapterErrorKind::Timeout, message)
    }

    pub fn rejected(message: impl Into<String>) -> Self {
        Self::new(AdapterErrorKind::BackendRejected, message)
    }

    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::new(AdapterErrorKind::BackendUnavailable, message)
    }

    pub fn invalid_output(message: impl Into<String>) -> Self {
        Self::new(AdapterErrorKind::InvalidOutput, message)
    }
}

/// Terminal run-level failures.
#[derive(Error, Debug, Clone, Serialize, Deserialize)]
pub enum RunError {
    #[error("Node '{node_id}' failed after {attempts} attempt(s): {reason}")]
    NodeFailed {
        node_id: String,
        attempts: u32,
        reason: String,
    },

    #[error("Run '{run_id}' was cancelled")]
    RunCancelled { run_id: String },
}
