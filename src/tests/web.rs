use std::sync::Arc;
use std::time::Duration;

use axum::{
    body::Body,
    http::{Request, StatusCode},
    Router,
};
use http_body_util::BodyExt;
use serde_json::Value;
use tower::ServiceExt;

use super::support::*;
use crate::questions::Question;
use crate::semantic::EmbeddingCache;
use crate::visibility::ApprovalStatus;
use crate::web::{router, AppState};

const TOKEN: &str = "upstream-secret";

fn fixture() -> Vec<Question> {
    vec![
        approved(1, "How do I change my meal plan"),
        with_embedding(approved(2, "Dining plan options"), &[1.0, 0.1, 0.0]),
        with_embedding(approved(3, "Parking permits"), &[0.0, 1.0, 0.0]),
        with_embedding(question(4, "Meal plan for staff", 60, ApprovalStatus::Pending), &[1.0, 0.0, 0.0]),
    ]
}

struct TestApp {
    _tmp: tempfile::TempDir,
    router: Router,
}

fn app(mode: StubMode, auth_token: Option<&str>, debug_errors: bool) -> TestApp {
    let (tmp, store) = store(fixture());
    let (service, _) = service(store, StubEmbedder::new(mode).rule("meal plan", &[1.0, 0.0, 0.0]));

    let state = Arc::new(AppState {
        service: Arc::new(service),
        cache: Arc::new(EmbeddingCache::new(10, Duration::from_secs(60))),
        auth_token: auth_token.map(Arc::from),
        debug_errors,
    });

    TestApp {
        _tmp: tmp,
        router: router(state),
    }
}

async fn send(app: &TestApp, request: Request<Body>) -> (StatusCode, Value) {
    let response = app.router.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let body = response.into_body().collect().await.unwrap().to_bytes();
    let json = serde_json::from_slice(&body).unwrap_or(Value::Null);
    (status, json)
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

#[tokio::test(flavor = "multi_thread")]
async fn test_similar_endpoint_returns_neighbors() {
    let app = app(StubMode::Ready, None, false);

    let (status, body) = send(&app, get("/api/questions/1/similar")).await;

    assert_eq!(status, StatusCode::OK);
    let similar = body["similar"].as_array().unwrap();
    assert_eq!(similar.len(), 1);
    assert_eq!(similar[0]["id"], 2);
    assert!(similar[0]["similarity"].as_f64().unwrap() > 0.9);
    assert_eq!(similar[0]["approvalStatus"], "APPROVED");
    assert!(body.get("message").is_none());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_similar_endpoint_degrades_without_credentials() {
    let app = app(StubMode::NoCredential, None, false);

    let (status, body) = send(&app, get("/api/questions/1/similar")).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["similar"], serde_json::json!([]));
    assert!(body["message"].as_str().unwrap().contains("not configured"));
    assert!(body.get("debug").is_none());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_similar_endpoint_exposes_debug_when_enabled() {
    let app = app(StubMode::Down, None, true);

    let (status, body) = send(&app, get("/api/questions/1/similar")).await;

    assert_eq!(status, StatusCode::OK);
    assert!(body["debug"].as_str().unwrap().contains("503"));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_similar_endpoint_not_found() {
    let app = app(StubMode::Ready, None, false);

    let (status, body) = send(&app, get("/api/questions/99/similar")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert!(body["error"].is_string());

    // pending question, anonymous caller
    let (status, _) = send(&app, get("/api/questions/4/similar")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_similar_endpoint_uses_identity_headers() {
    let app = app(StubMode::Ready, None, false);

    let request = Request::builder()
        .uri("/api/questions/4/similar")
        .header("x-user-id", "60")
        .header("x-user-role", "STUDENT")
        .body(Body::empty())
        .unwrap();
    let (status, body) = send(&app, request).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["similar"][0]["id"], 2);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_similar_endpoint_rejects_bad_threshold() {
    let app = app(StubMode::Ready, None, false);

    let (status, _) = send(&app, get("/api/questions/1/similar?threshold=1.5")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = send(&app, get("/api/questions/1/similar?threshold=0.95&limit=3")).await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_token_gate() {
    let app = app(StubMode::Ready, Some(TOKEN), false);

    let (status, body) = send(&app, get("/api/search?q=meal")).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert!(body["error"].is_string());

    let request = Request::builder()
        .uri("/api/search?q=meal")
        .header("authorization", "Bearer wrong")
        .body(Body::empty())
        .unwrap();
    let (status, _) = send(&app, request).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let request = Request::builder()
        .uri("/api/search?q=meal")
        .header("authorization", format!("Bearer {TOKEN}"))
        .body(Body::empty())
        .unwrap();
    let (status, _) = send(&app, request).await;
    assert_eq!(status, StatusCode::OK);

    // health stays open
    let (status, body) = send(&app, get("/api/health")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
}

#[tokio::test(flavor = "multi_thread")]
async fn test_search_endpoint_camel_case_params() {
    let app = app(StubMode::Ready, None, false);

    let (status, body) = send(&app, get("/api/search?q=meal%20plan&useVector=false")).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["usedVector"], false);
    assert_eq!(body["results"].as_array().unwrap().len(), 1);
    assert_eq!(body["results"][0]["id"], 1);
    assert_eq!(body["pagination"]["totalPages"], 1);
    assert!(body["results"][0]["relationalScore"].is_number());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_search_endpoint_fuses_vector_matches() {
    let app = app(StubMode::Ready, None, false);

    let (status, body) = send(&app, get("/api/search?q=meal%20plan&limit=5")).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["usedVector"], true);
    let ids = body["results"]
        .as_array()
        .unwrap()
        .iter()
        .map(|r| r["id"].as_u64().unwrap())
        .collect::<Vec<_>>();
    assert_eq!(ids, vec![1, 2]);
    assert!(body["results"][1]["relationalScore"].is_null());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_search_endpoint_rejects_bad_weight() {
    let app = app(StubMode::Ready, None, false);

    let (status, _) = send(&app, get("/api/search?q=meal&vectorWeight=2")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_health_reports_provider_state() {
    let app = app(StubMode::NoCredential, None, false);

    let (status, body) = send(&app, get("/api/health")).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["questions"], 4);
    assert_eq!(body["cacheEntries"], 0);
    assert_eq!(body["provider"], "gemini");
    assert_eq!(body["embeddingsAvailable"], false);
}
