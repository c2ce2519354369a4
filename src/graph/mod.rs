//! Workflow graph: definition types, parser, and compiler.

mod compile;
mod parser;
mod types;

pub use compile::{compile, CompiledNode, Graph};
pub use parser::{parse_definition, parse_definition_file};
pub use types::{
    Backoff, Binding, BranchConfig, GraphDefinition, ModelCallConfig, NodeDef, NodeKind,
    RetryPolicy, RpaActionConfig, ToolCallConfig,
};
