//! Branch predicate evaluation.
//!
//! Predicates are rhai boolean expressions evaluated over the node's
//! resolved input, bound in scope as `input`. Expressions are pure:
//! the same input always selects the same arm, which is what makes
//! branch decisions replayable after a crash.

use serde_json::Value;

/// Evaluate a branch predicate against a resolved input.
///
/// Any evaluation failure is a definition bug, not a transient backend
/// condition, so callers treat it as an immediate node failure without
/// retries.
pub fn eval_predicate(expr: &str, input: &Value) -> Result<bool, String> {
    let engine = rhai::Engine::new();
    let dynamic = rhai::serde::to_dynamic(input)
        .map_err(|e| format!("predicate input not convertible: {}", e))?;

    let mut scope = rhai::Scope::new();
    scope.push_dynamic("input", dynamic);

    engine
        .eval_expression_with_scope::<bool>(&mut scope, expr)
        .map_err(|e| format!("predicate '{}' failed: {}", expr, e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn predicate_reads_input_fields() {
        let input = json!({"total": 120, "tier": "gold"});
        assert!(eval_predicate("input.total > 100", &input).unwrap());
        assert!(!eval_predicate("input.tier == \"silver\"", &input).unwrap());
    }

    #[test]
    fn non_boolean_expression_is_an_error() {
        assert!(eval_predicate("input.total + 1", &json!({"total": 1})).is_err());
    }

    #[test]
    fn unknown_field_is_an_error_not_a_default() {
        assert!(eval_predicate("input.nope > 1", &json!({"total": 1})).is_err());
    }
}
