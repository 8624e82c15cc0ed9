//! HTTP API integration tests

use axum::body::Body;
use axum::http::{Request, StatusCode};
use http_body_util::BodyExt;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceExt;

use decoy_engine::api::{self, ApiState, API_KEY_HEADER};
use decoy_engine::collaborators::{Collaborators, TracingAuditSink};
use decoy_engine::payoff::PayoffModel;
use decoy_engine::pipeline::{Orchestrator, PipelineSettings};
use decoy_engine::policy::TacticPolicy;
use decoy_engine::session::{MemorySessionBackend, SessionStore, SessionStoreLimits};
use decoy_engine::DecoyEngine;

async fn setup_test_app(api_key: Option<&str>) -> axum::Router {
    let store = SessionStore::start(
        Arc::new(MemorySessionBackend::new()),
        SessionStoreLimits {
            cache_capacity: 32,
            lock_capacity: 32,
            persist_interval: Duration::from_millis(10),
        },
    )
    .await
    .expect("failed to start session store");

    let orchestrator = Orchestrator::new(
        Collaborators::local(),
        Arc::new(TacticPolicy::seeded(7)),
        PayoffModel::new(Duration::from_millis(500)),
        PipelineSettings::default(),
    );
    let engine = Arc::new(DecoyEngine::new(
        Arc::new(store),
        orchestrator,
        Arc::new(TracingAuditSink),
        Duration::from_secs(2),
    ));

    api::router().with_state(ApiState::new(engine, api_key.map(str::to_string)))
}

async fn json_response(app: &axum::Router, req: Request<Body>) -> (StatusCode, Value) {
    let response = app.clone().oneshot(req).await.expect("request failed");
    let status = response.status();
    let body = response
        .into_body()
        .collect()
        .await
        .expect("failed to read body")
        .to_bytes();
    let value: Value = serde_json::from_slice(&body).expect("invalid json");
    (status, value)
}

fn analyze_request(body: Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri("/analyze")
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .expect("failed to build request")
}

fn get(uri: &str) -> Request<Body> {
    Request::builder()
        .uri(uri)
        .body(Body::empty())
        .expect("failed to build request")
}

#[tokio::test]
async fn test_health_check() {
    let app = setup_test_app(None).await;
    let (status, body) = json_response(&app, get("/health")).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "healthy");
    assert_eq!(body["service"], "decoy-engine");
    assert_eq!(body["cached_sessions"], 0);
    assert_eq!(body["pending_writes"], 0);
}

#[tokio::test]
async fn test_analyze_then_fetch_session() {
    let app = setup_test_app(None).await;

    let (status, body) = json_response(
        &app,
        analyze_request(json!({
            "session_id": "api-session-1",
            "message": "Pay 5000 to raju@upi or face arrest"
        })),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "success");
    assert_eq!(body["session_id"], "api-session-1");
    assert!(!body["reply"].as_str().unwrap_or_default().is_empty());
    assert_eq!(body["extracted_intelligence"]["upi_ids"], json!(["raju@upi"]));
    assert_eq!(body["decision"]["turn"], 1);
    assert!(body["typing_delay_ms"].as_u64().is_some());

    let (status, record) = json_response(&app, get("/sessions/api-session-1")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(record["session_id"], "api-session-1");
    assert_eq!(record["turn_count"], 1);
    assert_eq!(record["history"].as_array().map(Vec::len), Some(2));
}

#[tokio::test]
async fn test_unknown_session_is_404() {
    let app = setup_test_app(None).await;
    let (status, body) = json_response(&app, get("/sessions/never-seen")).await;

    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["success"], false);
    assert_eq!(body["error"], "session_not_found");
}

#[tokio::test]
async fn test_api_key_is_enforced() {
    let app = setup_test_app(Some("s3cret")).await;
    let payload = json!({"session_id": "api-session-2", "message": "hello"});

    let (status, body) = json_response(&app, analyze_request(payload.clone())).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["error"], "invalid_api_key");

    let mut req = analyze_request(payload);
    req.headers_mut()
        .insert(API_KEY_HEADER, "s3cret".parse().expect("header value"));
    let (status, body) = json_response(&app, req).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["tactic"], "FAST_REFLEX");

    // Health stays open.
    let (status, _) = json_response(&app, get("/health")).await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn test_policy_row_reports_every_action() {
    let app = setup_test_app(None).await;
    let (status, body) = json_response(&app, get("/policy/EARLY_LOW_GENERIC")).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["state_key"], "EARLY_LOW_GENERIC");
    let q_values = body["q_values"].as_object().expect("q_values object");
    assert_eq!(q_values.len(), 6);
    assert!(q_values.values().all(|v| v.as_f64() == Some(0.0)));
    assert_eq!(body["bandit"]["BAIT_FOR_INTEL"]["successes"], 0);
}

#[tokio::test]
async fn test_malformed_body_is_rejected() {
    let app = setup_test_app(None).await;
    let response = app
        .clone()
        .oneshot(analyze_request(json!({"message": "no session id"})))
        .await
        .expect("request failed");
    assert!(response.status().is_client_error());
}
