//! Tool adapter - invokes the external tool/MCP execution service.

use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;
use serde_json::Value;
use tracing::debug;

use super::types::{
    check_endpoint_override, map_status, map_transport_error, parse_envelope, Adapter, CallContext,
};
use crate::error::AdapterError;
use crate::graph::NodeKind;

/// Adapter for `tool_call` nodes.
///
/// Tools live behind an external registry/execution service; the
/// adapter posts one execution request and interprets the service's
/// `{code, message, data}` envelope.
pub struct ToolAdapter {
    client: Client,
    default_endpoint: String,
}

impl ToolAdapter {
    pub fn new(default_endpoint: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            default_endpoint: default_endpoint.into(),
        }
    }
}

#[derive(Debug, Serialize)]
struct ToolRequest<'a> {
    tool_id: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    operation: Option<&'a str>,
    arguments: &'a Value,
    input: &'a Value,
    idempotency_key: String,
}

#[async_trait]
impl Adapter for ToolAdapter {
    fn kind(&self) -> &'static str {
        "tool_call"
    }

    fn description(&self) -> &str {
        "Invoke a tool through the external tool/MCP execution service"
    }

    async fn invoke(&self, kind: &NodeKind, ctx: &CallContext) -> Result<Value, AdapterError> {
        let config = match kind {
            NodeKind::ToolCall(config) => config,
            other => {
                return Err(AdapterError::invalid_output(format!(
                    "tool adapter dispatched for '{}' node",
                    other.name()
                )))
            }
        };

        let endpoint = match &config.endpoint {
            Some(url) => check_endpoint_override(url)?.to_string(),
            None => self.default_endpoint.clone(),
        };

        let request = ToolRequest {
            tool_id: &config.tool_id,
            operation: config.operation.as_deref(),
            arguments: &config.arguments,
            input: &ctx.input,
            idempotency_key: ctx.idempotency_token(),
        };

        debug!(
            node_id = %ctx.node_id,
            attempt = ctx.attempt,
            tool_id = %config.tool_id,
            "Dispatching tool call"
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

        let body: Value = response
            .json()
            .await
            .map_err(|e| AdapterError::invalid_output(format!("tool response: {}", e)))?;

        parse_envelope(body)
    }
}
