//! Capability adapter trait and call context.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::AdapterError;
use crate::graph::NodeKind;

/// Context for one capability call.
#[derive(Debug, Clone)]
pub struct CallContext {
    /// Run this call belongs to
    pub run_id: String,

    /// Node being executed
    pub node_id: String,

    /// Attempt number, 1-based
    pub attempt: u32,

    /// Resolved input assembled from dependency outputs
    pub input: Value,

    /// Remaining time budget for this attempt
    pub timeout: Duration,
}

impl CallContext {
    /// Idempotency token for this attempt.
    ///
    /// Sent with every backend request so a well-behaved backend can
    /// deduplicate re-invocations after a retry or crash recovery. The
    /// engine itself cannot guarantee exactly-once execution against
    /// arbitrary backends.
    pub fn idempotency_token(&self) -> String {
        format!("{}:{}:{}", self.run_id, self.node_id, self.attempt)
    }
}

/// Uniform invocation contract wrapping a model call, a tool call, or
/// an RPA action behind one interface, hiding transport differences.
#[async_trait]
pub trait Adapter: Send + Sync {
    /// Node kind this adapter serves (e.g. "model_call").
    fn kind(&self) -> &'static str;

    /// Translate the uniform call into the backend's native
    /// request/response shape and map backend failures into the shared
    /// error taxonomy.
    async fn invoke(&self, kind: &NodeKind, ctx: &CallContext) -> Result<Value, AdapterError>;

    /// Get a description of this adapter.
    fn description(&self) -> &str {
        "A capability adapter"
    }
}

/// Map a transport error into the shared taxonomy.
pub(crate) fn map_transport_error(e: reqwest::Error) -> AdapterError {
    if e.is_timeout() {
        AdapterError::timeout("backend request timed out")
    } else if e.is_connect() {
        AdapterError::unavailable(format!("failed to connect to backend: {}", e))
    } else if e.is_decode() {
        AdapterError::invalid_output(format!("backend response not decodable: {}", e))
    } else if let Some(status) = e.status() {
        map_status(status.as_u16(), e.to_string())
    } else {
        AdapterError::unavailable(format!("backend request failed: {}", e))
    }
}

/// Map an HTTP status into the shared taxonomy.
pub(crate) fn map_status(status: u16, message: String) -> AdapterError {
    match status {
        400..=499 => AdapterError::rejected(format!("backend rejected request ({}): {}", status, message)),
        _ => AdapterError::unavailable(format!("backend unavailable ({}): {}", status, message)),
    }
}

/// Parse the `{code, message, data}` envelope used by the tool and RPA
/// execution services. A non-zero code is a backend-side refusal.
pub(crate) fn parse_envelope(body: Value) -> Result<Value, AdapterError> {
    let obj = body
        .as_object()
        .ok_or_else(|| AdapterError::invalid_output("expected a JSON object envelope"))?;

    let code = obj
        .get("code")
        .and_then(Value::as_i64)
        .ok_or_else(|| AdapterError::invalid_output("envelope missing integer 'code'"))?;

    if code != 0 {
        let message = obj
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or("no message");
        return Err(AdapterError::rejected(format!(
            "backend returned code {}: {}",
            code, message
        )));
    }

    Ok(obj.get("data").cloned().unwrap_or(Value::Null))
}

/// Reject endpoint overrides that point into loopback or private
/// address space. Only definition-supplied overrides pass through this
/// check; operator-configured default endpoints are trusted.
pub(crate) fn check_endpoint_override(url: &str) -> Result<reqwest::Url, AdapterError> {
    let parsed = reqwest::Url::parse(url)
        .map_err(|e| AdapterError::rejected(format!("invalid endpoint override '{}': {}", url, e)))?;

    if is_local_url(&parsed) {
        return Err(AdapterError::rejected(format!(
            "endpoint override '{}' resolves to a local or private address",
            url
        )));
    }

    Ok(parsed)
}

fn is_local_url(url: &reqwest::Url) -> bool {
    match url.host_str() {
        None => true,
        Some(host) => {
            let host = host.trim_start_matches('[').trim_end_matches(']');
            if host.eq_ignore_ascii_case("localhost") || host == "::1" || host == "0.0.0.0" {
                return true;
            }
            if let Ok(ip) = host.parse::<std::net::IpAddr>() {
                return match ip {
                    std::net::IpAddr::V4(v4) => {
                        v4.is_loopback()
                            || v4.is_private()
                            || v4.is_link_local()
                            || v4.is_unspecified()
                    }
                    std::net::IpAddr::V6(v6) => v6.is_loopback() || v6.is_unspecified(),
                };
            }
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use crate::error::AdapterErrorKind;

    #[test]
    fn idempotency_token_identifies_attempt() {
        let ctx = CallContext {
            run_id: "r1".into(),
            node_id: "n1".into(),
            attempt: 2,
            input: Value::Null,
            timeout: Duration::from_secs(5),
        };
        assert_eq!(ctx.idempotency_token(), "r1:n1:2");
    }

    #[test]
    fn envelope_success_returns_data() {
        let data = parse_envelope(json!({"code": 0, "message": "ok", "data": {"x": 1}})).unwrap();
        assert_eq!(data, json!({"x": 1}));
    }

    #[test]
    fn envelope_error_code_is_rejected() {
        let err = parse_envelope(json!({"code": 42, "message": "denied"})).unwrap_err();
        assert_eq!(err.kind, AdapterErrorKind::BackendRejected);
        assert!(err.message.contains("42"));
    }

    #[test]
    fn envelope_must_be_object_with_code() {
        assert_eq!(
            parse_envelope(json!("nope")).unwrap_err().kind,
            AdapterErrorKind::InvalidOutput
        );
        assert_eq!(
            parse_envelope(json!({"data": 1})).unwrap_err().kind,
            AdapterErrorKind::InvalidOutput
        );
    }

    #[test]
    fn local_endpoint_overrides_are_rejected() {
        for url in [
            "http://localhost:8080/run",
            "http://127.0.0.1/run",
            "http://10.0.0.5/run",
            "http://192.168.1.10/run",
            "http://172.16.0.1/run",
            "http://[::1]:9000/run",
        ] {
            assert!(check_endpoint_override(url).is_err(), "{} accepted", url);
        }
    }

    #[test]
    fn public_endpoint_overrides_are_accepted() {
        assert!(check_endpoint_override("https://tools.example.com/execute").is_ok());
        assert!(check_endpoint_override("http://8.8.8.8/execute").is_ok());
    }

    #[test]
    fn status_mapping_distinguishes_rejection_from_outage() {
        assert_eq!(
            map_status(422, "bad".into()).kind,
            AdapterErrorKind::BackendRejected
        );
        assert_eq!(
            map_status(503, "down".into()).kind,
            AdapterErrorKind::BackendUnavailable
        );
    }
}
