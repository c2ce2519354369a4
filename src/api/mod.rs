//! HTTP control API.
//!
//! The API is the run-control surface: register workflow definitions,
//! start and inspect runs, cancel them, and read their event streams.
//! Workflow authoring stays external; definitions arrive here already
//! written.

use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::{HeaderValue, Method, StatusCode},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, warn};

use crate::engine::{CancelOutcome, Engine};
use crate::error::Error;
use crate::graph::{compile, parse_definition};
use crate::state::RunStatus;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<Engine>,
}

/// Create the API router (without state applied).
pub fn create_api_routes() -> Router<AppState> {
    Router::new()
        .route("/health", get(health_check))
        .route("/metrics", get(metrics_endpoint))
        .route("/api/v1/workflows", post(create_workflow).get(list_workflows))
        .route("/api/v1/workflows/{name}", get(get_workflow))
        .route("/api/v1/runs", post(start_run).get(list_runs))
        .route("/api/v1/runs/{id}", get(get_run))
        .route("/api/v1/runs/{id}/cancel", post(cancel_run))
        .route("/api/v1/runs/{id}/events", get(list_run_events))
}

/// Create the complete API router with state and middleware.
pub fn create_router(state: AppState) -> Router {
    create_api_routes()
        .layer(create_concurrency_limit())
        .layer(TraceLayer::new_for_http())
        .layer(create_cors_layer())
        .with_state(state)
}

/// Create CORS layer based on environment configuration.
///
/// - WEFT_CORS_ORIGINS: Comma-separated list of allowed origins
/// - WEFT_CORS_ALLOW_ALL: Set to "true" to allow all origins
pub fn create_cors_layer() -> CorsLayer {
    let allow_all = std::env::var("WEFT_CORS_ALLOW_ALL")
        .map(|v| v.to_lowercase() == "true")
        .unwrap_or(false);
    if allow_all {
        warn!("CORS configured to allow all origins - this is NOT secure for production!");
        return CorsLayer::very_permissive();
    }

    let origins_str = std::env::var("WEFT_CORS_ORIGINS")
        .unwrap_or_else(|_| "http://localhost:3000".to_string());
    let origins: Vec<HeaderValue> = origins_str
        .split(',')
        .filter_map(|s| {
            let trimmed = s.trim();
            if trimmed.is_empty() {
                return None;
            }
            match trimmed.parse::<HeaderValue>() {
                Ok(hv) => Some(hv),
                Err(e) => {
                    warn!("Invalid CORS origin '{}': {}", trimmed, e);
                    None
                }
            }
        })
        .collect();

    CorsLayer::new()
        .allow_origin(origins)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([
            axum::http::header::CONTENT_TYPE,
            axum::http::header::AUTHORIZATION,
        ])
}

const DEFAULT_MAX_CONCURRENT_REQUESTS: usize = 100;

/// Concurrency limit to prevent resource exhaustion.
///
/// - WEFT_MAX_CONCURRENT_REQUESTS: Maximum concurrent requests
pub fn create_concurrency_limit() -> tower::limit::ConcurrencyLimitLayer {
    let max = std::env::var("WEFT_MAX_CONCURRENT_REQUESTS")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(DEFAULT_MAX_CONCURRENT_REQUESTS);
    tower::limit::ConcurrencyLimitLayer::new(max)
}

/// Sanitized error response for external consumers. The full error is
/// logged internally; the client sees only code and safe message.
fn external_error_response(e: Error) -> (StatusCode, Json<Value>) {
    error!("API error: {:?}", e);
    let status = match &e {
        Error::Compile(_) | Error::Definition(_) | Error::Yaml(_) | Error::Json(_) => {
            StatusCode::BAD_REQUEST
        }
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, Json(e.to_external_json()))
}

fn not_found(what: &str, key: &str) -> (StatusCode, Json<Value>) {
    (
        StatusCode::NOT_FOUND,
        Json(json!({"error": {"code": "NOT_FOUND", "message": format!("{} '{}' not found", what, key)}})),
    )
}

// ============================================================================
// Health and metrics
// ============================================================================

async fn health_check() -> impl IntoResponse {
    Json(json!({"status": "ok"}))
}

async fn metrics_endpoint() -> impl IntoResponse {
    crate::metrics::render_metrics()
}

// ============================================================================
// Workflow endpoints
// ============================================================================

#[derive(Deserialize)]
struct CreateWorkflowRequest {
    /// Workflow definition document, YAML
    definition: String,
}

#[derive(Serialize)]
struct WorkflowResponse {
    id: String,
    name: String,
    version: u32,
    node_count: usize,
    created_at: String,
    updated_at: String,
}

/// Register (or re-register) a workflow. The definition is compiled
/// before it is stored; an invalid graph is rejected outright.
async fn create_workflow(
    State(state): State<AppState>,
    Json(request): Json<CreateWorkflowRequest>,
) -> impl IntoResponse {
    let definition = match parse_definition(&request.definition) {
        Ok(d) => d,
        Err(e) => return external_error_response(e).into_response(),
    };
    let graph = match compile(&definition) {
        Ok(g) => g,
        Err(e) => return external_error_response(e.into()).into_response(),
    };

    match state
        .engine
        .store()
        .save_workflow(&definition.name, &request.definition)
        .await
    {
        Ok(stored) => (
            StatusCode::CREATED,
            Json(json!(WorkflowResponse {
                id: stored.id,
                name: stored.name,
                version: stored.version,
                node_count: graph.node_count(),
                created_at: stored.created_at.to_rfc3339(),
                updated_at: stored.updated_at.to_rfc3339(),
            })),
        )
            .into_response(),
        Err(e) => external_error_response(e).into_response(),
    }
}

async fn list_workflows(State(state): State<AppState>) -> impl IntoResponse {
    match state.engine.store().list_workflows().await {
        Ok(workflows) => {
            let responses: Vec<WorkflowResponse> = workflows
                .into_iter()
                .map(|w| {
                    let node_count = parse_definition(&w.definition)
                        .map(|d| d.nodes.len())
                        .unwrap_or(0);
                    WorkflowResponse {
                        id: w.id,
                        name: w.name,
                        version: w.version,
                        node_count,
                        created_at: w.created_at.to_rfc3339(),
                        updated_at: w.updated_at.to_rfc3339(),
                    }
                })
                .collect();
            Json(json!({"workflows": responses})).into_response()
        }
        Err(e) => external_error_response(e).into_response(),
    }
}

async fn get_workflow(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> impl IntoResponse {
    match state.engine.store().get_workflow(&name).await {
        Ok(Some(w)) => Json(json!({
            "id": w.id,
            "name": w.name,
            "version": w.version,
            "created_at": w.created_at.to_rfc3339(),
            "updated_at": w.updated_at.to_rfc3339(),
            "definition": w.definition,
        }))
        .into_response(),
        Ok(None) => not_found("Workflow", &name).into_response(),
        Err(e) => external_error_response(e).into_response(),
    }
}

// ============================================================================
// Run endpoints
// ============================================================================

#[derive(Deserialize)]
struct StartRunRequest {
    /// Workflow name or ID
    workflow: String,

    #[serde(default)]
    input: Value,

    /// Wait for the run to reach a terminal status before responding
    #[serde(default)]
    wait: bool,
}

#[derive(Serialize)]
struct RunResponse {
    run_id: String,
    workflow: String,
    status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    output: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
    started_at: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    finished_at: Option<String>,
}

impl From<crate::state::Run> for RunResponse {
    fn from(run: crate::state::Run) -> Self {
        Self {
            run_id: run.id,
            workflow: run.workflow_name,
            status: run.status.to_string(),
            output: run.output,
            error: run.error,
            started_at: run.started_at.to_rfc3339(),
            finished_at: run.finished_at.map(|t| t.to_rfc3339()),
        }
    }
}

async fn start_run(
    State(state): State<AppState>,
    Json(request): Json<StartRunRequest>,
) -> impl IntoResponse {
    let stored = match state.engine.store().get_workflow(&request.workflow).await {
        Ok(Some(w)) => w,
        Ok(None) => return not_found("Workflow", &request.workflow).into_response(),
        Err(e) => return external_error_response(e).into_response(),
    };

    let result = if request.wait {
        state.engine.run_to_completion(&stored, request.input).await
    } else {
        state.engine.start_run(&stored, request.input).await
    };
    // A waited run is already terminal when we answer; only the async
    // form is merely accepted.
    let status = if request.wait {
        StatusCode::OK
    } else {
        StatusCode::ACCEPTED
    };
    match result {
        Ok(run) => (status, Json(RunResponse::from(run))).into_response(),
        Err(e) => external_error_response(e).into_response(),
    }
}

#[derive(Deserialize)]
struct ListRunsQuery {
    status: Option<String>,
    #[serde(default)]
    limit: usize,
}

async fn list_runs(
    State(state): State<AppState>,
    Query(query): Query<ListRunsQuery>,
) -> impl IntoResponse {
    let status = match query.status.as_deref() {
        None => None,
        Some(s) => match s.parse::<RunStatus>() {
            Ok(status) => Some(status),
            Err(_) => {
                return (
                    StatusCode::BAD_REQUEST,
                    Json(json!({"error": {"code": "BAD_QUERY", "message": format!("unknown run status '{}'", s)}})),
                )
                    .into_response()
            }
        },
    };
    match state.engine.store().list_runs(status, query.limit).await {
        Ok(runs) => {
            let responses: Vec<RunResponse> = runs.into_iter().map(RunResponse::from).collect();
            Json(json!({"runs": responses})).into_response()
        }
        Err(e) => external_error_response(e).into_response(),
    }
}

async fn get_run(State(state): State<AppState>, Path(id): Path<String>) -> impl IntoResponse {
    match state.engine.store().snapshot(&id).await {
        Ok(Some(snapshot)) => {
            let nodes: Vec<Value> = snapshot
                .nodes
                .iter()
                .map(|n| {
                    json!({
                        "node_id": n.node_id,
                        "status": n.status,
                        "attempt": n.attempt,
                        "output": n.output,
                        "error": n.error,
                        "started_at": n.started_at.map(|t| t.to_rfc3339()),
                        "finished_at": n.finished_at.map(|t| t.to_rfc3339()),
                    })
                })
                .collect();
            let mut body = serde_json::to_value(RunResponse::from(snapshot.run))
                .unwrap_or_else(|_| json!({}));
            body["nodes"] = Value::Array(nodes);
            Json(body).into_response()
        }
        Ok(None) => not_found("Run", &id).into_response(),
        Err(e) => external_error_response(e).into_response(),
    }
}

async fn cancel_run(State(state): State<AppState>, Path(id): Path<String>) -> impl IntoResponse {
    match state.engine.cancel_run(&id).await {
        Ok(CancelOutcome::Accepted) => (
            StatusCode::ACCEPTED,
            Json(json!({"run_id": id, "status": "cancelling"})),
        )
            .into_response(),
        Ok(CancelOutcome::AlreadyFinished) => (
            StatusCode::CONFLICT,
            Json(json!({"error": {"code": "RUN_FINISHED", "message": "run already reached a terminal status"}})),
        )
            .into_response(),
        Ok(CancelOutcome::NotFound) => not_found("Run", &id).into_response(),
        Err(e) => external_error_response(e).into_response(),
    }
}

async fn list_run_events(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    match state.engine.store().get_run(&id).await {
        Ok(None) => return not_found("Run", &id).into_response(),
        Err(e) => return external_error_response(e).into_response(),
        Ok(Some(_)) => {}
    }
    match state.engine.store().list_events(&id).await {
        Ok(events) => {
            let items: Vec<Value> = events
                .iter()
                .map(|e| {
                    json!({
                        "id": e.id,
                        "kind": e.kind,
                        "payload": e.payload,
                        "created_at": e.created_at.to_rfc3339(),
                    })
                })
                .collect();
            Json(json!({"run_id": id, "events": items})).into_response()
        }
        Err(e) => external_error_response(e).into_response(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::AdapterRegistry;
    use crate::events::EventSink;
    use crate::state::SqliteStore;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    fn test_router() -> Router {
        let store = SqliteStore::open_in_memory().unwrap();
        let (events, _writer) = EventSink::spawn(store.clone(), 64);
        let engine = Engine::new(store, AdapterRegistry::empty(), events, 2);
        create_api_routes().with_state(AppState { engine })
    }

    async fn body_json(response: axum::response::Response) -> Value {
        let bytes = axum::body::to_bytes(response.into_body(), 1 << 20)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    const WORKFLOW_YAML: &str = r#"
name: api-test
nodes:
  - id: start
    kind: start
  - id: done
    kind: end
    depends_on: [start]
"#;

    #[tokio::test]
    async fn workflow_roundtrip_and_run_lifecycle() {
        let router = test_router();

        let create = router
            .clone()
            .oneshot(
                Request::post("/api/v1/workflows")
                    .header("content-type", "application/json")
                    .body(Body::from(
                        json!({"definition": WORKFLOW_YAML}).to_string(),
                    ))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(create.status(), StatusCode::CREATED);
        let created = body_json(create).await;
        assert_eq!(created["name"], "api-test");
        assert_eq!(created["node_count"], 2);

        let run = router
            .clone()
            .oneshot(
                Request::post("/api/v1/runs")
                    .header("content-type", "application/json")
                    .body(Body::from(
                        json!({"workflow": "api-test", "input": {"x": 1}, "wait": true})
                            .to_string(),
                    ))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(run.status(), StatusCode::OK);
        let run = body_json(run).await;
        assert_eq!(run["status"], "succeeded");
        assert_eq!(run["output"], json!({"x": 1}));

        let detail = router
            .clone()
            .oneshot(
                Request::get(format!("/api/v1/runs/{}", run["run_id"].as_str().unwrap()))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(detail.status(), StatusCode::OK);
        let detail = body_json(detail).await;
        assert_eq!(detail["nodes"].as_array().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn async_run_start_answers_accepted() {
        let router = test_router();

        let create = router
            .clone()
            .oneshot(
                Request::post("/api/v1/workflows")
                    .header("content-type", "application/json")
                    .body(Body::from(
                        json!({"definition": WORKFLOW_YAML}).to_string(),
                    ))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(create.status(), StatusCode::CREATED);

        let run = router
            .clone()
            .oneshot(
                Request::post("/api/v1/runs")
                    .header("content-type", "application/json")
                    .body(Body::from(
                        json!({"workflow": "api-test", "input": {}}).to_string(),
                    ))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(run.status(), StatusCode::ACCEPTED);
    }

    #[tokio::test]
    async fn invalid_definition_is_rejected_with_a_code() {
        let router = test_router();
        let yaml = r#"
name: cyclic
nodes:
  - id: start
    kind: start
  - id: a
    kind: merge
    depends_on: [start, b]
  - id: b
    kind: merge
    depends_on: [a]
  - id: done
    kind: end
    depends_on: [b]
"#;
        let response = router
            .oneshot(
                Request::post("/api/v1/workflows")
                    .header("content-type", "application/json")
                    .body(Body::from(json!({"definition": yaml}).to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = body_json(response).await;
        assert_eq!(body["error"]["code"], "GRAPH_CYCLE");
    }

    #[tokio::test]
    async fn unknown_resources_are_404() {
        let router = test_router();
        for uri in ["/api/v1/workflows/nope", "/api/v1/runs/nope"] {
            let response = router
                .clone()
                .oneshot(Request::get(uri).body(Body::empty()).unwrap())
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::NOT_FOUND, "{}", uri);
        }

        let response = router
            .oneshot(
                Request::post("/api/v1/runs/nope/cancel")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
