//! HTTP surface for the decoy engine.

use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::json;
use shared_types::TurnRequest;
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::policy::BanditCounts;
use crate::service::SharedDecoyEngine;

pub const API_KEY_HEADER: &str = "x-api-key";

#[derive(Clone)]
pub struct ApiState {
    pub engine: SharedDecoyEngine,
    /// Required `x-api-key` value; open when `None`.
    pub api_key: Option<Arc<str>>,
}

impl ApiState {
    pub fn new(engine: SharedDecoyEngine, api_key: Option<String>) -> Self {
        Self {
            engine,
            api_key: api_key.map(Arc::from),
        }
    }
}

/// Configure all API routes
pub fn router() -> Router<ApiState> {
    Router::new()
        .route("/health", get(health_check))
        .route("/analyze", post(analyze))
        .route("/sessions/{session_id}", get(get_session))
        .route("/policy/{state_key}", get(get_policy))
}

fn authorize(state: &ApiState, headers: &HeaderMap) -> Result<(), Response> {
    let Some(expected) = state.api_key.as_deref() else {
        return Ok(());
    };
    let provided = headers
        .get(API_KEY_HEADER)
        .and_then(|value| value.to_str().ok());
    if provided == Some(expected) {
        return Ok(());
    }
    Err((
        StatusCode::UNAUTHORIZED,
        Json(json!({
            "success": false,
            "error": "invalid_api_key"
        })),
    )
        .into_response())
}

async fn health_check(State(state): State<ApiState>) -> impl IntoResponse {
    let store = state.engine.store();
    let pending_writes = match store.pending_writes().await {
        Ok(count) => Some(count),
        Err(e) => {
            tracing::warn!(error = %e, "Persister unavailable for health check");
            None
        }
    };
    Json(json!({
        "status": "healthy",
        "service": "decoy-engine",
        "version": env!("CARGO_PKG_VERSION"),
        "cached_sessions": store.cached_sessions(),
        "pending_writes": pending_writes,
    }))
}

async fn analyze(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Json(request): Json<TurnRequest>,
) -> Response {
    if let Err(rejection) = authorize(&state, &headers) {
        return rejection;
    }
    let response = state.engine.handle_turn(request).await;
    (StatusCode::OK, Json(response)).into_response()
}

async fn get_session(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Path(session_id): Path<String>,
) -> Response {
    if let Err(rejection) = authorize(&state, &headers) {
        return rejection;
    }
    match state.engine.session(&session_id).await {
        Ok(Some(record)) => (StatusCode::OK, Json(record)).into_response(),
        Ok(None) => (
            StatusCode::NOT_FOUND,
            Json(json!({
                "success": false,
                "error": "session_not_found"
            })),
        )
            .into_response(),
        Err(e) => {
            tracing::warn!(session_id = %session_id, error = %e, "Session lookup failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({
                    "success": false,
                    "error": e.code(),
                })),
            )
                .into_response()
        }
    }
}

async fn get_policy(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Path(state_key): Path<String>,
) -> Response {
    if let Err(rejection) = authorize(&state, &headers) {
        return rejection;
    }
    let tables = state.engine.policy().tables();
    let q_values: BTreeMap<String, f64> = tables
        .q_row(&state_key)
        .into_iter()
        .map(|(tactic, value)| (tactic.to_string(), value))
        .collect();
    let bandit: BTreeMap<String, BanditCounts> = tables
        .bandit_row(&state_key)
        .into_iter()
        .map(|(tactic, counts)| (tactic.to_string(), counts))
        .collect();

    (
        StatusCode::OK,
        Json(json!({
            "state_key": state_key,
            "q_values": q_values,
            "bandit": bandit,
        })),
    )
        .into_response()
}
