//! Model adapter - invokes a large-model serving endpoint.

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::debug;

use super::types::{check_endpoint_override, map_status, map_transport_error, Adapter, CallContext};
use crate::error::AdapterError;
use crate::graph::NodeKind;

/// Adapter for `model_call` nodes.
pub struct ModelAdapter {
    client: Client,
    default_endpoint: String,
}

impl ModelAdapter {
    pub fn new(default_endpoint: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            default_endpoint: default_endpoint.into(),
        }
    }
}

#[derive(Debug, Serialize)]
struct ModelRequest<'a> {
    prompt: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    model: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    input: &'a Value,
    idempotency_key: String,
}

#[derive(Debug, Deserialize)]
struct ModelResponse {
    content: String,
    #[serde(default)]
    usage: Option<Value>,
}

#[async_trait]
impl Adapter for ModelAdapter {
    fn kind(&self) -> &'static str {
        "model_call"
    }

    fn description(&self) -> &str {
        "Invoke a large-model serving endpoint"
    }

    async fn invoke(&self, kind: &NodeKind, ctx: &CallContext) -> Result<Value, AdapterError> {
        let config = match kind {
            NodeKind::ModelCall(config) => config,
            other => {
                return Err(AdapterError::invalid_output(format!(
                    "model adapter dispatched for '{}' node",
                    other.name()
                )))
            }
        };

        let endpoint = match &config.endpoint {
            Some(url) => check_endpoint_override(url)?.to_string(),
            None => self.default_endpoint.clone(),
        };

        let prompt = render_prompt(&config.prompt, &ctx.input);
        let request = ModelRequest {
            prompt,
            model: config.model.as_deref(),
            system: config.system.as_deref(),
            temperature: config.temperature,
            input: &ctx.input,
            idempotency_key: ctx.idempotency_token(),
        };

        debug!(
            node_id = %ctx.node_id,
            attempt = ctx.attempt,
            endpoint = %endpoint,
            "Dispatching model call"
        );

        let response = self
            .client
            .post(&endpoint)
            .header("X-Idempotency-Key", ctx.idempotency_token())
            .timeout(ctx.timeout)
            .json(&request)
            .send()
            .await
            .map_err(map_transport_error)?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(map_status(status.as_u16(), body));
        }

        let parsed: ModelResponse = response
            .json()
            .await
            .map_err(|e| AdapterError::invalid_output(format!("model response: {}", e)))?;

        let mut output = json!({"text": parsed.content});
        if let Some(usage) = parsed.usage {
            output["usage"] = usage;
        }
        Ok(output)
    }
}

/// Substitute `{{ input }}` in the prompt with the resolved input JSON.
fn render_prompt(template: &str, input: &Value) -> String {
    if !template.contains("{{") {
        return template.to_string();
    }
    let rendered = serde_json::to_string(input).unwrap_or_default();
    template
        .replace("{{ input }}", &rendered)
        .replace("{{input}}", &rendered)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn prompt_without_placeholder_is_untouched() {
        assert_eq!(render_prompt("just do it", &json!({"a": 1})), "just do it");
    }

    #[test]
    fn prompt_placeholder_receives_input_json() {
        let rendered = render_prompt("Summarize: {{ input }}", &json!({"orders": [1, 2]}));
        assert_eq!(rendered, r#"Summarize: {"orders":[1,2]}"#);
    }

    #[tokio::test]
    async fn mismatched_kind_is_an_error() {
        let adapter = ModelAdapter::new("http://model.invalid");
        let ctx = CallContext {
            run_id: "r".into(),
            node_id: "n".into(),
            attempt: 1,
            input: Value::Null,
            timeout: std::time::Duration::from_secs(1),
        };
        let err = adapter.invoke(&NodeKind::Merge, &ctx).await.unwrap_err();
        assert!(err.message.contains("merge"));
    }
}
