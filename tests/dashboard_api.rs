//! Dashboard router: key check, error envelope, and selection endpoints.

use std::sync::Arc;

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use chrono::Utc;
use serde_json::{json, Value};
use tower::ServiceExt;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use capctl::api::{api_router, DASHBOARD_KEY_HEADER};
use capctl::auth::authorize::AuthorizeRequest;
use capctl::auth::broker::{AuthorizationBroker, BrokerError};
use capctl::clock::ManualClock;
use capctl::config::Config;
use capctl::controller::Controller;
use capctl::store::MemoryStore;
use capctl::AppState;

const KEY: &str = "test-dashboard-key";

/// Interactive sign-in always succeeds with the same token.
struct FixedBroker;

#[async_trait]
impl AuthorizationBroker for FixedBroker {
    async fn authorize(&self, req: &AuthorizeRequest) -> Result<String, BrokerError> {
        if req.prompt.is_silent() {
            return Err(BrokerError::SilentUnavailable);
        }
        Ok(format!("access_token=tok&expires_in=3600&state={}", req.state))
    }
}

async fn app(server: &MockServer) -> axum::Router {
    let cfg = Config::for_base_url("test-client", &server.uri());
    let controller = Controller::build(
        cfg,
        Arc::new(MemoryStore::new()),
        Arc::new(FixedBroker),
        Arc::new(ManualClock::new(Utc::now())),
    )
    .await
    .unwrap();
    let state = Arc::new(AppState {
        controller,
        dashboard_key: KEY.into(),
    });
    axum::Router::new()
        .nest("/api/v1", api_router(state.clone()))
        .with_state(state)
}

fn request(method: &str, uri: &str, body: Option<Value>) -> Request<Body> {
    let builder = Request::builder()
        .method(method)
        .uri(uri)
        .header(DASHBOARD_KEY_HEADER, KEY)
        .header("content-type", "application/json");
    match body {
        Some(v) => builder.body(Body::from(v.to_string())).unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    }
}

async fn json_body(resp: axum::response::Response) -> Value {
    let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn test_missing_key_is_rejected() {
    let server = MockServer::start().await;
    let resp = app(&server)
        .await
        .oneshot(
            Request::builder()
                .uri("/api/v1/capacities")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_wrong_key_is_rejected() {
    let server = MockServer::start().await;
    let resp = app(&server)
        .await
        .oneshot(
            Request::builder()
                .uri("/api/v1/capacities")
                .header(DASHBOARD_KEY_HEADER, "guess")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_empty_snapshot_before_load() {
    let server = MockServer::start().await;
    let resp = app(&server)
        .await
        .oneshot(request("GET", "/api/v1/capacities", None))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let body = json_body(resp).await;
    assert_eq!(body["capacities"], json!([]));
    assert_eq!(body["selected"], Value::Null);
    assert_eq!(body["controls"]["start"], false);
    assert_eq!(body["controls"]["refresh"], true);
}

#[tokio::test]
async fn test_start_without_selection_is_an_error_envelope() {
    let server = MockServer::start().await;
    let resp = app(&server)
        .await
        .oneshot(request("POST", "/api/v1/capacities/start", None))
        .await
        .unwrap();
    assert!(resp.status().is_client_error());
    let body = json_body(resp).await;
    assert!(body["error"]["message"].is_string());
    assert!(body["error"]["type"].is_string());
}

#[tokio::test]
async fn test_forbidden_subscription_listing_surfaces_reason() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/subscriptions"))
        .respond_with(ResponseTemplate::new(403).set_body_json(json!({
            "error": {
                "code": "AuthorizationFailed",
                "message": "The client does not have authorization to perform action"
            }
        })))
        .mount(&server)
        .await;

    let router = app(&server).await;
    let login = router
        .clone()
        .oneshot(request("POST", "/api/v1/login", None))
        .await
        .unwrap();
    assert_eq!(login.status(), StatusCode::OK);
    assert_eq!(json_body(login).await["signed_in"], true);

    let resp = router
        .oneshot(request("POST", "/api/v1/capacities/load", None))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn test_select_unknown_capacity_is_rejected() {
    let server = MockServer::start().await;
    let resp = app(&server)
        .await
        .oneshot(request(
            "POST",
            "/api/v1/capacities/select",
            Some(json!({"id": "/subscriptions/x/capacities/nope"})),
        ))
        .await
        .unwrap();
    assert!(resp.status().is_client_error());
}
