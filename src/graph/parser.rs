//! Workflow definition YAML parser.

use std::path::Path;

use super::types::GraphDefinition;
use crate::error::{Error, Result};

/// Parse a workflow definition from a YAML string.
pub fn parse_definition(yaml: &str) -> Result<GraphDefinition> {
    if yaml.trim().is_empty() {
        return Err(Error::Definition("Empty workflow definition".to_string()));
    }

    let definition: GraphDefinition = serde_yaml::from_str(yaml).map_err(|e| {
        let msg = e.to_string();
        if let Some(field) = extract_missing_field(&msg) {
            Error::Definition(format!("Missing required field: {}", field))
        } else {
            Error::Definition(format!("Invalid YAML: {}", msg))
        }
    })?;

    if definition.name.is_empty() {
        return Err(Error::Definition("Workflow name is required".to_string()));
    }
    if !definition
        .name
        .chars()
        .all(|c| c.is_alphanumeric() || c == '-' || c == '_')
    {
        return Err(Error::Definition(
            "Workflow name must contain only alphanumeric characters, hyphens, and underscores"
                .to_string(),
        ));
    }

    Ok(definition)
}

/// Parse a workflow definition from a file path.
pub fn parse_definition_file(path: &Path) -> Result<GraphDefinition> {
    let content = std::fs::read_to_string(path)?;
    parse_definition(&content)
}

fn extract_missing_field(error_message: &str) -> Option<&str> {
    let marker = "missing field `";
    let start = error_message.find(marker)? + marker.len();
    let rest = &error_message[start..];
    let end = rest.find('`')?;
    Some(&rest[..end])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::types::NodeKind;

    #[test]
    fn parse_simple_definition() {
        let yaml = r#"
name: test-workflow
description: A test workflow

nodes:
  - id: start
    kind: start

  - id: summarize
    kind: model_call
    config:
      prompt: "Summarize the input"
    depends_on: [start]

  - id: end
    kind: end
    depends_on: [summarize]
"#;
        let definition = parse_definition(yaml).unwrap();
        assert_eq!(definition.name, "test-workflow");
        assert_eq!(definition.version, 1);
        assert_eq!(definition.nodes.len(), 3);

        let summarize = definition.get_node("summarize").unwrap();
        assert_eq!(summarize.depends_on, vec!["start"]);
        match &summarize.kind {
            NodeKind::ModelCall(config) => assert_eq!(config.prompt, "Summarize the input"),
            other => panic!("unexpected kind: {}", other.name()),
        }
    }

    #[test]
    fn parse_branch_and_retry() {
        let yaml = r#"
name: branching
nodes:
  - id: start
    kind: start
  - id: decide
    kind: branch
    config:
      predicate: "input.urgent == true"
      on_true: fast
      on_false: slow
    depends_on: [start]
  - id: fast
    kind: tool_call
    config:
      tool_id: notify
    depends_on: [decide]
    retry:
      max_attempts: 3
      backoff: exponential
      base_delay_ms: 100
  - id: slow
    kind: rpa_action
    config:
      action: file-ticket
    depends_on: [decide]
  - id: join
    kind: merge
    depends_on: [fast, slow]
  - id: end
    kind: end
    depends_on: [join]
"#;
        let definition = parse_definition(yaml).unwrap();
        let decide = definition.get_node("decide").unwrap();
        match &decide.kind {
            NodeKind::Branch(config) => {
                assert_eq!(config.on_true, "fast");
                assert_eq!(config.on_false, "slow");
            }
            other => panic!("unexpected kind: {}", other.name()),
        }

        let fast = definition.get_node("fast").unwrap();
        let retry = fast.retry.as_ref().unwrap();
        assert_eq!(retry.max_attempts, 3);
        assert_eq!(retry.base_delay_ms, 100);
    }

    #[test]
    fn reject_empty_definition() {
        assert!(parse_definition("").is_err());
        assert!(parse_definition("   \n").is_err());
    }

    #[test]
    fn reject_invalid_name() {
        let yaml = r#"
name: "my workflow!"
nodes:
  - id: start
    kind: start
"#;
        assert!(parse_definition(yaml).is_err());
    }

    #[test]
    fn missing_field_is_reported_by_name() {
        let yaml = r#"
name: incomplete
nodes:
  - kind: start
"#;
        let err = parse_definition(yaml).unwrap_err().to_string();
        assert!(err.contains("id"), "got: {}", err);
    }

    #[test]
    fn unknown_kind_is_rejected() {
        let yaml = r#"
name: bad-kind
nodes:
  - id: a
    kind: quantum_call
"#;
        assert!(parse_definition(yaml).is_err());
    }
}
