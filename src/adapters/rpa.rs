//! RPA adapter - drives an external RPA automation driver.

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

/// Adapter for `rpa_action` nodes.
///
/// The driver executes one automation action per request. Actions are
/// generally not idempotent on the driver side, which is why the
/// idempotency token travels with every request.
pub struct RpaAdapter {
    client: Client,
    default_endpoint: String,
}

impl RpaAdapter {
    pub fn new(default_endpoint: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            default_endpoint: default_endpoint.into(),
        }
    }
}

#[derive(Debug, Serialize)]
struct RpaRequest<'a> {
    action: &'a str,
    parameters: &'a Value,
    input: &'a Value,
    idempotency_key: String,
}

#[async_trait]
impl Adapter for RpaAdapter {
    fn kind(&self) -> &'static str {
        "rpa_action"
    }

    fn description(&self) -> &str {
        "Drive an external RPA automation action"
    }

    async fn invoke(&self, kind: &NodeKind, ctx: &CallContext) -> Result<Value, AdapterError> {
        let config = match kind {
            NodeKind::RpaAction(config) => config,
            other => {
                return Err(AdapterError::invalid_output(format!(
                    "rpa adapter dispatched for '{}' node",
                    other.name()
                )))
            }
        };

        let endpoint = match &config.endpoint {
            Some(url) => check_endpoint_override(url)?.to_string(),
            None => self.default_endpoint.clone(),
        };

        let request = RpaRequest {
            action: &config.action,
            parameters: &config.parameters,
            input: &ctx.input,
            idempotency_key: ctx.idempotency_token(),
        };

        debug!(
            node_id = %ctx.node_id,
            attempt = ctx.attempt,
            action = %config.action,
            "Dispatching RPA action"
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
            .map_err(|e| AdapterError::invalid_output(format!("rpa response: {}", e)))?;

        parse_envelope(body)
    }
}
