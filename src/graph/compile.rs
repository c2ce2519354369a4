//! Graph compiler and validator.
//!
//! Compilation turns a parsed definition into an immutable `Graph` that
//! the scheduler can share read-only across concurrent runs. Validation
//! is all-or-nothing: a definition that fails any check produces a
//! `CompileError` and nothing is ever scheduled from it.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use super::types::{GraphDefinition, NodeKind, Binding, RetryPolicy};
use crate::error::{CompileError, CompileErrorKind};

/// A single compiled node.
#[derive(Debug, Clone)]
pub struct CompiledNode {
    pub id: String,
    pub kind: NodeKind,
    pub bindings: Vec<Binding>,
    pub timeout: Duration,
    pub retry: Option<RetryPolicy>,
    pub optional: bool,
}

impl CompiledNode {
    /// Maximum attempts for this node, including the first.
    pub fn max_attempts(&self) -> u32 {
        self.retry.as_ref().map(|r| r.max_attempts.max(1)).unwrap_or(1)
    }
}

/// Immutable compiled workflow graph.
///
/// Wrapped in `Arc` and reused by arbitrarily many concurrent runs;
/// nothing run-specific is ever written back into it.
#[derive(Debug)]
pub struct Graph {
    pub name: String,
    pub version: u32,
    nodes: HashMap<String, CompiledNode>,
    /// Node IDs in a valid topological order.
    order: Vec<String>,
    start: String,
    ends: Vec<String>,
    successors: HashMap<String, Vec<String>>,
    predecessors: HashMap<String, Vec<String>>,
}

impl Graph {
    pub fn node(&self, id: &str) -> Option<&CompiledNode> {
        self.nodes.get(id)
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn start_id(&self) -> &str {
        &self.start
    }

    pub fn end_ids(&self) -> &[String] {
        &self.ends
    }

    /// Node IDs in topological order.
    pub fn topo_order(&self) -> &[String] {
        &self.order
    }

    pub fn successors(&self, id: &str) -> &[String] {
        self.successors.get(id).map(|v| v.as_slice()).unwrap_or(&[])
    }

    pub fn predecessors(&self, id: &str) -> &[String] {
        self.predecessors
            .get(id)
            .map(|v| v.as_slice())
            .unwrap_or(&[])
    }

    /// In-degree of every node, used to seed run readiness.
    pub fn in_degrees(&self) -> HashMap<String, usize> {
        self.order
            .iter()
            .map(|id| (id.clone(), self.predecessors(id).len()))
            .collect()
    }
}

/// Compile a definition into an immutable graph.
pub fn compile(definition: &GraphDefinition) -> Result<Arc<Graph>, CompileError> {
    check_duplicate_ids(definition)?;

    let ids: HashSet<&str> = definition.nodes.iter().map(|n| n.id.as_str()).collect();

    // Every dependency must name a defined node.
    for node in &definition.nodes {
        for dep in &node.depends_on {
            if !ids.contains(dep.as_str()) {
                return Err(CompileError::new(
                    CompileErrorKind::DanglingBinding,
                    format!("node '{}' depends on unknown node '{}'", node.id, dep),
                )
                .with_nodes(vec![node.id.clone()]));
            }
        }
    }

    let start = find_start(definition)?;
    let ends: Vec<String> = definition
        .nodes
        .iter()
        .filter(|n| matches!(n.kind, NodeKind::End))
        .map(|n| n.id.clone())
        .collect();
    if ends.is_empty() {
        return Err(CompileError::new(
            CompileErrorKind::InvalidStructure,
            "workflow must contain at least one end node",
        ));
    }

    let mut successors: HashMap<String, Vec<String>> = HashMap::new();
    let mut predecessors: HashMap<String, Vec<String>> = HashMap::new();
    for node in &definition.nodes {
        successors.entry(node.id.clone()).or_default();
        predecessors.entry(node.id.clone()).or_default();
    }
    for node in &definition.nodes {
        for dep in &node.depends_on {
            if let Some(s) = successors.get_mut(dep) {
                s.push(node.id.clone());
            }
            if let Some(p) = predecessors.get_mut(&node.id) {
                p.push(dep.clone());
            }
        }
    }

    let order = topological_order(definition, &successors)?;
    check_reachability(definition, &start, &successors)?;
    check_bindings(definition, &order, &predecessors)?;
    check_branch_arms(definition, &successors)?;

    let nodes: HashMap<String, CompiledNode> = definition
        .nodes
        .iter()
        .map(|n| {
            (
                n.id.clone(),
                CompiledNode {
                    id: n.id.clone(),
                    kind: n.kind.clone(),
                    bindings: n.bindings.clone(),
                    timeout: Duration::from_secs(n.timeout_seconds.max(1)),
                    retry: n.retry.clone(),
                    optional: n.optional,
                },
            )
        })
        .collect();

    debug!(
        workflow = %definition.name,
        nodes = nodes.len(),
        "Compiled workflow graph"
    );

    Ok(Arc::new(Graph {
        name: definition.name.clone(),
        version: definition.version,
        nodes,
        order,
        start,
        ends,
        successors,
        predecessors,
    }))
}

fn check_duplicate_ids(definition: &GraphDefinition) -> Result<(), CompileError> {
    let mut seen = HashSet::new();
    let mut duplicates = Vec::new();
    for node in &definition.nodes {
        if node.id.is_empty() {
            return Err(CompileError::new(
                CompileErrorKind::InvalidStructure,
                "node ID cannot be empty",
            ));
        }
        if !seen.insert(node.id.as_str()) {
            duplicates.push(node.id.clone());
        }
    }
    if duplicates.is_empty() {
        Ok(())
    } else {
        Err(CompileError::new(
            CompileErrorKind::DuplicateId,
            "duplicate node IDs",
        )
        .with_nodes(duplicates))
    }
}

fn find_start(definition: &GraphDefinition) -> Result<String, CompileError> {
    let starts: Vec<&super::types::NodeDef> = definition
        .nodes
        .iter()
        .filter(|n| matches!(n.kind, NodeKind::Start))
        .collect();

    match starts.as_slice() {
        [] => Err(CompileError::new(
            CompileErrorKind::InvalidStructure,
            "workflow must contain exactly one start node",
        )),
        [start] => {
            if !start.depends_on.is_empty() {
                return Err(CompileError::new(
                    CompileErrorKind::InvalidStructure,
                    "start node cannot have dependencies",
                )
                .with_nodes(vec![start.id.clone()]));
            }
            Ok(start.id.clone())
        }
        many => Err(CompileError::new(
            CompileErrorKind::InvalidStructure,
            "workflow must contain exactly one start node",
        )
        .with_nodes(many.iter().map(|n| n.id.clone()).collect())),
    }
}

/// Kahn's algorithm. Fails with `Cycle` naming the nodes left with
/// unresolved dependencies.
fn topological_order(
    definition: &GraphDefinition,
    successors: &HashMap<String, Vec<String>>,
) -> Result<Vec<String>, CompileError> {
    let mut in_degree: HashMap<&str, usize> = definition
        .nodes
        .iter()
        .map(|n| (n.id.as_str(), n.depends_on.len()))
        .collect();

    let mut queue: VecDeque<&str> = definition
        .nodes
        .iter()
        .filter(|n| n.depends_on.is_empty())
        .map(|n| n.id.as_str())
        .collect();

    let mut order = Vec::with_capacity(definition.nodes.len());
    while let Some(id) = queue.pop_front() {
        order.push(id.to_string());
        if let Some(next) = successors.get(id) {
            for succ in next {
                let entry = in_degree.get_mut(succ.as_str()).expect("known node");
                *entry -= 1;
                if *entry == 0 {
                    queue.push_back(succ.as_str());
                }
            }
        }
    }

    if order.len() == definition.nodes.len() {
        Ok(order)
    } else {
        let stuck: Vec<String> = in_degree
            .iter()
            .filter(|(_, d)| **d > 0)
            .map(|(id, _)| id.to_string())
            .collect();
        Err(CompileError::new(
            CompileErrorKind::Cycle,
            "dependency cycle detected",
        )
        .with_nodes(stuck))
    }
}

fn check_reachability(
    definition: &GraphDefinition,
    start: &str,
    successors: &HashMap<String, Vec<String>>,
) -> Result<(), CompileError> {
    let mut reachable = HashSet::new();
    let mut queue = VecDeque::from([start.to_string()]);
    while let Some(id) = queue.pop_front() {
        if !reachable.insert(id.clone()) {
            continue;
        }
        if let Some(next) = successors.get(&id) {
            queue.extend(next.iter().cloned());
        }
    }

    let unreachable: Vec<String> = definition
        .nodes
        .iter()
        .filter(|n| !reachable.contains(&n.id))
        .map(|n| n.id.clone())
        .collect();

    if unreachable.is_empty() {
        Ok(())
    } else {
        Err(CompileError::new(
            CompileErrorKind::Unreachable,
            "nodes not reachable from start",
        )
        .with_nodes(unreachable))
    }
}

/// Every binding source must be a strict ancestor of the binding node.
fn check_bindings(
    definition: &GraphDefinition,
    order: &[String],
    predecessors: &HashMap<String, Vec<String>>,
) -> Result<(), CompileError> {
    // Ancestor sets accumulate along the topological order.
    let mut ancestors: HashMap<&str, HashSet<&str>> = HashMap::new();
    for id in order {
        let mut set = HashSet::new();
        if let Some(preds) = predecessors.get(id) {
            for pred in preds {
                set.insert(pred.as_str());
                if let Some(pred_anc) = ancestors.get(pred.as_str()) {
                    set.extend(pred_anc.iter().copied());
                }
            }
        }
        // `order` borrows from `definition`, which outlives this map.
        let key = definition
            .nodes
            .iter()
            .find(|n| &n.id == id)
            .map(|n| n.id.as_str())
            .expect("known node");
        ancestors.insert(key, set);
    }

    for node in &definition.nodes {
        let node_ancestors = ancestors.get(node.id.as_str()).expect("known node");
        for binding in &node.bindings {
            if !node_ancestors.contains(binding.source.as_str()) {
                return Err(CompileError::new(
                    CompileErrorKind::DanglingBinding,
                    format!(
                        "node '{}' binds output of '{}' which is not an ancestor",
                        node.id, binding.source
                    ),
                )
                .with_nodes(vec![node.id.clone()]));
            }
        }
    }

    Ok(())
}

/// Branch arms must name direct successors of the branch node.
fn check_branch_arms(
    definition: &GraphDefinition,
    successors: &HashMap<String, Vec<String>>,
) -> Result<(), CompileError> {
    for node in &definition.nodes {
        if let NodeKind::Branch(config) = &node.kind {
            let succ = successors.get(&node.id).cloned().unwrap_or_default();
            for arm in [&config.on_true, &config.on_false] {
                if !succ.contains(arm) {
                    return Err(CompileError::new(
                        CompileErrorKind::DanglingBinding,
                        format!(
                            "branch '{}' selects '{}' which is not a successor",
                            node.id, arm
                        ),
                    )
                    .with_nodes(vec![node.id.clone()]));
                }
            }
        }
    }
    Ok(())
}
