//! Input resolution.
//!
//! A node's input is assembled from the recorded outputs of its
//! predecessors just before dispatch. Explicit bindings pick values out
//! of ancestor outputs by dot-path; without bindings the input falls
//! back to positional pass-through.

use std::collections::HashMap;

use serde_json::{Map, Value};

use crate::graph::{CompiledNode, Graph};

/// Assemble the input for `node` from recorded predecessor outputs.
///
/// `outputs` holds the contribution of every node that produced one:
/// succeeded nodes map to their output, optional nodes that exhausted
/// retries map to `Null`, skipped nodes have no entry. A binding whose
/// source has no entry resolves to `Null`.
pub fn resolve_input(
    graph: &Graph,
    node: &CompiledNode,
    run_input: &Value,
    outputs: &HashMap<String, Value>,
) -> Value {
    if !node.bindings.is_empty() {
        let mut object = Map::new();
        for binding in &node.bindings {
            let source = outputs.get(&binding.source).cloned().unwrap_or(Value::Null);
            let value = match &binding.key {
                Some(path) => extract_path(&source, path),
                None => source,
            };
            let key = binding
                .rename
                .clone()
                .unwrap_or_else(|| binding.source.clone());
            object.insert(key, value);
        }
        return Value::Object(object);
    }

    let preds = graph.predecessors(&node.id);
    if preds.is_empty() {
        // Start node: the run input flows in.
        return run_input.clone();
    }

    let contributing: Vec<&String> = preds.iter().filter(|p| outputs.contains_key(*p)).collect();
    match contributing.as_slice() {
        [] => Value::Null,
        [only] => outputs[only.as_str()].clone(),
        many => {
            let mut object = Map::new();
            for pred in many {
                object.insert((*pred).clone(), outputs[pred.as_str()].clone());
            }
            Value::Object(object)
        }
    }
}

/// Walk a dot-path into a JSON value. Array segments may be numeric
/// indexes. A missing segment yields `Null`.
pub fn extract_path(value: &Value, path: &str) -> Value {
    let mut current = value;
    for segment in path.split('.') {
        current = match current {
            Value::Object(map) => match map.get(segment) {
                Some(v) => v,
                None => return Value::Null,
            },
            Value::Array(items) => match segment.parse::<usize>().ok().and_then(|i| items.get(i)) {
                Some(v) => v,
                None => return Value::Null,
            },
            _ => return Value::Null,
        };
    }
    current.clone()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn extract_path_walks_objects_and_arrays() {
        let value = json!({"items": [{"name": "first"}, {"name": "second"}]});
        assert_eq!(extract_path(&value, "items.1.name"), json!("second"));
        assert_eq!(extract_path(&value, "items.5.name"), Value::Null);
        assert_eq!(extract_path(&value, "missing"), Value::Null);
    }

    #[test]
    fn extract_path_on_scalar_is_null() {
        assert_eq!(extract_path(&json!(42), "anything"), Value::Null);
    }

    fn diamond() -> std::sync::Arc<Graph> {
        let def = crate::graph::parse_definition(
            r#"
name: diamond
nodes:
  - id: start
    kind: start
  - id: left
    kind: merge
    depends_on: [start]
  - id: right
    kind: merge
    depends_on: [start]
  - id: join
    kind: merge
    depends_on: [left, right]
  - id: done
    kind: end
    depends_on: [join]
    bindings:
      - source: left
        key: score
        as: left_score
      - source: right
"#,
        )
        .unwrap();
        crate::graph::compile(&def).unwrap()
    }

    #[test]
    fn input_without_bindings_merges_predecessor_outputs() {
        let graph = diamond();
        let mut outputs = HashMap::new();
        outputs.insert("left".to_string(), json!({"score": 1}));
        outputs.insert("right".to_string(), json!({"score": 2}));

        let input = resolve_input(
            &graph,
            graph.node("join").unwrap(),
            &Value::Null,
            &outputs,
        );
        assert_eq!(input, json!({"left": {"score": 1}, "right": {"score": 2}}));
    }

    #[test]
    fn bindings_extract_and_rename() {
        let graph = diamond();
        let mut outputs = HashMap::new();
        outputs.insert("left".to_string(), json!({"score": 7}));
        outputs.insert("right".to_string(), json!("raw"));

        let input = resolve_input(
            &graph,
            graph.node("done").unwrap(),
            &Value::Null,
            &outputs,
        );
        assert_eq!(input, json!({"left_score": 7, "right": "raw"}));
    }

    #[test]
    fn binding_to_absent_source_is_null() {
        let graph = diamond();
        let input = resolve_input(
            &graph,
            graph.node("done").unwrap(),
            &Value::Null,
            &HashMap::new(),
        );
        assert_eq!(input, json!({"left_score": null, "right": null}));
    }
}
