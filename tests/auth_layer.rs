#![allow(missing_docs)]

mod common;

use async_trait::async_trait;
use common::test_helpers::{json_body, request, LogCapture, RecordingHandler};
use floodgate::auth::{AuthLayer, BearerSessions, Principal, Role, SessionError, SessionOracle};
use http::header::CONTENT_TYPE;
use http::request::Parts;
use http::StatusCode;
use std::sync::Arc;
use tower::{Layer, ServiceExt};

fn sessions() -> Arc<BearerSessions> {
    let sessions = BearerSessions::new();
    sessions.insert("user-token", Principal::new("user-42", Role::User));
    sessions.insert("admin-token", Principal::new("admin-1", Role::Admin));
    Arc::new(sessions)
}

struct BrokenBackend;

#[async_trait]
impl SessionOracle for BrokenBackend {
    async fn verify_session(&self, _: &Parts) -> Result<Option<Principal>, SessionError> {
        Err(SessionError::Unavailable("redis://10.0.0.5:6379 timed out".into()))
    }
}

#[tokio::test]
async fn unauthenticated_get_is_rejected_before_the_handler() {
    let handler = RecordingHandler::ok(r#"{"ok":true}"#);
    let svc = AuthLayer::new(sessions()).layer(handler.clone());

    let res = svc.oneshot(request("GET", "/api/favorites", &[])).await.unwrap();
    assert_eq!(res.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(res.headers()[CONTENT_TYPE], "application/json");
    assert_eq!(json_body(res).await, serde_json::json!({"error": "Authentication required"}));
    assert_eq!(handler.calls(), 0);
}

#[tokio::test]
async fn unknown_token_is_rejected() {
    let handler = RecordingHandler::ok("{}");
    let svc = AuthLayer::new(sessions()).layer(handler.clone());
    let req = request("POST", "/api/favorites", &[("authorization", "Bearer stolen")]);
    let res = svc.oneshot(req).await.unwrap();
    assert_eq!(res.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(handler.calls(), 0);
}

#[tokio::test]
async fn authenticated_post_forwards_the_verified_user_id() {
    let handler = RecordingHandler::ok("{}");
    let svc = AuthLayer::new(sessions()).layer(handler.clone());
    let req = request(
        "POST",
        "/api/favorites",
        &[("authorization", "Bearer user-token"), ("x-user-id", "admin-1")],
    );

    let res = svc.oneshot(req).await.unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    assert_eq!(handler.users(), vec![Some("user-42".to_string())]);
}

#[tokio::test]
async fn admin_gate_rejects_plain_users_with_403() {
    let handler = RecordingHandler::ok("{}");
    let svc = AuthLayer::admin(sessions()).layer(handler.clone());

    let req = request("DELETE", "/api/admin/rivers/7", &[("authorization", "Bearer user-token")]);
    let res = svc.clone().oneshot(req).await.unwrap();
    assert_eq!(res.status(), StatusCode::FORBIDDEN);
    assert_eq!(json_body(res).await["error"], "Admin access required");
    assert_eq!(handler.calls(), 0);

    let anonymous = svc.clone().oneshot(request("DELETE", "/api/admin/rivers/7", &[])).await.unwrap();
    assert_eq!(anonymous.status(), StatusCode::UNAUTHORIZED);

    let req = request("DELETE", "/api/admin/rivers/7", &[("authorization", "Bearer admin-token")]);
    let res = svc.oneshot(req).await.unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    assert_eq!(handler.users(), vec![Some("admin-1".to_string())]);
}

#[tokio::test]
async fn revoked_session_stops_working() {
    let sessions = sessions();
    let handler = RecordingHandler::ok("{}");
    let svc = AuthLayer::new(sessions.clone()).layer(handler.clone());
    sessions.revoke("user-token");

    let req = request("POST", "/api/reviews", &[("authorization", "Bearer user-token")]);
    let res = svc.oneshot(req).await.unwrap();
    assert_eq!(res.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn oracle_failure_is_logged_but_not_leaked() {
    let logs = LogCapture::start();
    let handler = RecordingHandler::ok("{}");
    let svc = AuthLayer::new(Arc::new(BrokenBackend)).layer(handler.clone());

    let res = svc.oneshot(request("GET", "/api/profile", &[])).await.unwrap();
    assert_eq!(res.status(), StatusCode::UNAUTHORIZED);
    let body = json_body(res).await;
    assert_eq!(body, serde_json::json!({"error": "Authentication required"}));
    assert_eq!(handler.calls(), 0);

    let output = logs.contents();
    assert!(output.contains("WARN"), "expected a warning, got: {output}");
    assert!(output.contains("session verification failed"), "got: {output}");
    assert!(output.contains("10.0.0.5:6379"), "detail stays in the logs: {output}");
}
