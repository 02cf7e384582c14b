use std::sync::Arc;

use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{info, warn};

use stepgraph_core::state::State as RunState;
use stepgraph_core::types::{RunId, RunStatus};

use crate::auth;
use crate::error::ApiError;
use crate::middleware::Authenticated;
use crate::state::AppState;

type ApiResult = Result<Json<Value>, ApiError>;

fn require_viewer(auth_result: &auth::AuthResult) -> Result<(), ApiError> {
    if auth::has_viewer_access(&auth_result.role) {
        Ok(())
    } else {
        Err(ApiError::forbidden())
    }
}

fn require_operator(auth_result: &auth::AuthResult) -> Result<(), ApiError> {
    if auth::has_operator_access(&auth_result.role) {
        Ok(())
    } else {
        Err(ApiError::forbidden())
    }
}

fn parse_body<T>(body: Result<Json<T>, JsonRejection>) -> Result<T, ApiError> {
    body.map(|Json(b)| b)
        .map_err(|rejection| ApiError::bad_request(rejection.body_text()))
}

// GET /api/health: no auth required
pub async fn health() -> Json<Value> {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

// GET /api/graph: requires Viewer+
pub async fn graph(
    Authenticated(auth_result): Authenticated,
    State(state): State<Arc<AppState>>,
) -> ApiResult {
    require_viewer(&auth_result)?;
    Ok(Json(json!(state.runs.graph().describe())))
}

#[derive(Deserialize)]
pub struct StartRunBody {
    #[serde(default)]
    pub input: serde_json::Map<String, Value>,
}

// POST /api/runs: requires Operator+
pub async fn start_run(
    Authenticated(auth_result): Authenticated,
    State(state): State<Arc<AppState>>,
    body: Result<Json<StartRunBody>, JsonRejection>,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    require_operator(&auth_result)?;
    let body = parse_body(body)?;

    let run_id = state.runs.start(RunState::from_map(body.input))?;
    info!(run_id = %run_id, caller = %auth_result.name, "Run accepted");
    Ok((StatusCode::ACCEPTED, Json(json!({ "run_id": run_id }))))
}

// GET /api/runs: requires Viewer+
pub async fn list_runs(
    Authenticated(auth_result): Authenticated,
    State(state): State<Arc<AppState>>,
) -> ApiResult {
    require_viewer(&auth_result)?;
    Ok(Json(json!({ "runs": state.runs.list() })))
}

// GET /api/runs/{id}: requires Viewer+
pub async fn get_run(
    Authenticated(auth_result): Authenticated,
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult {
    require_viewer(&auth_result)?;
    let snapshot = state.runs.status(&RunId::from_string(&id))?;
    Ok(Json(json!(snapshot)))
}

// POST /api/runs/{id}/cancel: requires Operator+
pub async fn cancel_run(
    Authenticated(auth_result): Authenticated,
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult {
    require_operator(&auth_result)?;
    let run_id = RunId::from_string(&id);
    let cancelled = state.runs.cancel(&run_id)?;
    Ok(Json(json!({ "run_id": run_id, "cancelled": cancelled })))
}

#[derive(Deserialize)]
pub struct InvokeBody {
    pub input: String,
    #[serde(default)]
    pub thread_id: Option<String>,
}

// POST /api/invoke: requires Operator+
//
// Runs the graph to completion for one user message and logs the exchange
// to the thread's history.
pub async fn invoke(
    Authenticated(auth_result): Authenticated,
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Result<Json<InvokeBody>, JsonRejection>,
) -> ApiResult {
    require_operator(&auth_result)?;
    let body = parse_body(body)?;
    if body.input.trim().is_empty() {
        return Err(ApiError::bad_request("input must not be empty"));
    }

    let thread_id = body
        .thread_id
        .filter(|t| !t.is_empty())
        .or_else(|| {
            headers
                .get("x-thread-id")
                .and_then(|v| v.to_str().ok())
                .filter(|t| !t.is_empty())
                .map(str::to_string)
        })
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

    let initial = RunState::from_map([
        ("user_input".to_string(), json!(body.input)),
        ("thread_id".to_string(), json!(thread_id)),
    ]);
    let run_id = state.runs.start(initial)?;
    info!(run_id = %run_id, thread_id = %thread_id, "Invoking workflow");

    let snapshot = state.runs.wait(&run_id).await?;
    match snapshot.status {
        RunStatus::Completed => {
            let final_output = snapshot
                .state
                .get_str("final_output")
                .unwrap_or("Agent did not produce a textual output.")
                .to_string();
            if let Err(e) = state
                .history
                .append(&thread_id, &body.input, Some(&final_output))
                .await
            {
                warn!(thread_id = %thread_id, error = %e, "Failed to log exchange");
            }
            Ok(Json(json!({
                "thread_id": thread_id,
                "run_id": run_id,
                "final_output": final_output,
                "state": snapshot.state,
            })))
        }
        status => {
            let message = snapshot
                .error
                .as_ref()
                .map(|f| f.message.clone())
                .unwrap_or_else(|| format!("run ended {}", status));
            if let Err(e) = state
                .history
                .append(&thread_id, &body.input, Some(&format!("Error: {}", message)))
                .await
            {
                warn!(thread_id = %thread_id, error = %e, "Failed to log exchange");
            }
            let code = if status == RunStatus::Cancelled {
                StatusCode::CONFLICT
            } else {
                StatusCode::BAD_GATEWAY
            };
            Err(ApiError {
                status: code,
                body: json!({
                    "thread_id": thread_id,
                    "run_id": run_id,
                    "status": status,
                    "error": snapshot.error,
                }),
            })
        }
    }
}

#[derive(Deserialize)]
pub struct HistoryQuery {
    pub limit: Option<usize>,
}

// GET /api/history/{thread_id}?limit=20: requires Viewer+
pub async fn history(
    Authenticated(auth_result): Authenticated,
    State(state): State<Arc<AppState>>,
    Path(thread_id): Path<String>,
    Query(q): Query<HistoryQuery>,
) -> ApiResult {
    require_viewer(&auth_result)?;
    let limit = q.limit.unwrap_or(state.history_limit);
    let entries = state.history.load(&thread_id, limit).await?;
    Ok(Json(json!({
        "thread_id": thread_id,
        "history": entries,
    })))
}
