//! End-to-end HTTP surface tests (spec §8 S1–S7 scenarios): device auth,
//! project creation, push/pull/status/snapshot, idempotent retry, and the
//! non-member 404-not-403 policy. Each request goes through the real axum
//! `Router` via `tower::ServiceExt::oneshot` rather than mocking handlers.

use std::sync::Arc;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use serde_json::{json, Value};
use tower::ServiceExt;

use syncd::config::{CliOverrides, ServerConfig};
use syncd::AppContext;

async fn test_ctx() -> (Arc<AppContext>, tempfile::TempDir) {
    let dir = tempfile::tempdir().expect("tempdir");
    let config = ServerConfig::new(CliOverrides {
        data_dir: Some(dir.path().to_path_buf()),
        allow_signup: Some(true),
        ..Default::default()
    });
    let ctx = Arc::new(AppContext::new(config).await.expect("app context"));
    (ctx, dir)
}

fn router(ctx: Arc<AppContext>) -> axum::Router {
    syncd::rest::build_router(ctx)
}

async fn body_json(response: axum::response::Response) -> (StatusCode, Value) {
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("read body");
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).expect("valid json body")
    };
    (status, value)
}

fn post(uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn authed(method: &str, uri: &str, token: &str, body: Option<Value>) -> Request<Body> {
    let builder = Request::builder()
        .method(method)
        .uri(uri)
        .header("authorization", format!("Bearer {token}"))
        .header("content-type", "application/json");
    match body {
        Some(b) => builder.body(Body::from(b.to_string())).unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    }
}

/// Drives `/v1/auth/device/{start,verify,poll}` to completion and returns the
/// issued plaintext API key (spec §4.5, §10.5 auto-approve since
/// `allow_signup` is enabled in `test_ctx`).
async fn device_login(app: &axum::Router, email: &str) -> String {
    let (status, body) = body_json(
        app.clone()
            .oneshot(post("/v1/auth/device/start", json!({ "email": email })))
            .await
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let user_code = body["data"]["user_code"].as_str().unwrap().to_string();
    let device_code = body["data"]["device_code"].as_str().unwrap().to_string();

    let (status, _) = body_json(
        app.clone()
            .oneshot(post(
                "/v1/auth/device/verify",
                json!({ "user_code": user_code }),
            ))
            .await
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let (status, body) = body_json(
        app.clone()
            .oneshot(post(
                "/v1/auth/device/poll",
                json!({ "device_code": device_code }),
            ))
            .await
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["status"], "approved");
    body["data"]["api_key"].as_str().unwrap().to_string()
}

#[tokio::test]
async fn healthz_reports_ok() {
    let (ctx, _dir) = test_ctx().await;
    let app = router(ctx);
    let resp = app
        .oneshot(Request::get("/healthz").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
}

#[tokio::test]
async fn push_pull_status_snapshot_round_trip() {
    let (ctx, _dir) = test_ctx().await;
    let app = router(ctx);

    let token = device_login(&app, "alice@example.com").await;

    let (status, body) = body_json(
        app.clone()
            .oneshot(authed(
                "POST",
                "/v1/projects",
                &token,
                Some(json!({ "name": "roadmap", "description": "Q3 plan" })),
            ))
            .await
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let project_id = body["data"]["id"].as_str().unwrap().to_string();

    let push_body = json!({
        "device_id": "device-1",
        "session_id": "session-1",
        "events": [
            {
                "client_action_id": 1,
                "action_type": "create",
                "entity_type": "issues",
                "entity_id": "issue-1",
                "payload": {"title": "Write docs"},
                "client_timestamp": "2026-07-28T00:00:00Z",
            },
            {
                "client_action_id": 2,
                "action_type": "update",
                "entity_type": "issues",
                "entity_id": "issue-1",
                "payload": {"title": "Write docs", "status": "done"},
                "client_timestamp": "2026-07-28T00:01:00Z",
            },
        ],
    });
    let (status, body) = body_json(
        app.clone()
            .oneshot(authed(
                "POST",
                &format!("/v1/projects/{project_id}/sync/push"),
                &token,
                Some(push_body.clone()),
            ))
            .await
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["accepted"], 2);
    assert_eq!(body["data"]["acks"].as_array().unwrap().len(), 2);
    assert!(body["data"]["rejected"].as_array().unwrap().is_empty());

    // Re-push the same batch: every event is a duplicate by
    // (device_id, client_action_id), each reporting its original server_seq.
    let (status, body) = body_json(
        app.clone()
            .oneshot(authed(
                "POST",
                &format!("/v1/projects/{project_id}/sync/push"),
                &token,
                Some(push_body),
            ))
            .await
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["accepted"], 0);
    let rejected = body["data"]["rejected"].as_array().unwrap();
    assert_eq!(rejected.len(), 2);
    assert_eq!(rejected[0]["reason"], "duplicate");
    assert!(rejected[0]["server_seq"].is_number());

    let (status, body) = body_json(
        app.clone()
            .oneshot(authed(
                "GET",
                &format!("/v1/projects/{project_id}/sync/pull?device_id=device-2&after_server_seq=0"),
                &token,
                None,
            ))
            .await
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let events = body["data"]["events"].as_array().unwrap();
    assert_eq!(events.len(), 2);
    assert_eq!(body["data"]["has_more"], false);

    let (status, body) = body_json(
        app.clone()
            .oneshot(authed(
                "GET",
                &format!("/v1/projects/{project_id}/sync/status"),
                &token,
                None,
            ))
            .await
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["event_count"], 2);
    assert_eq!(body["data"]["last_server_seq"], 2);

    let (status, body) = body_json(
        app.clone()
            .oneshot(authed(
                "GET",
                &format!("/v1/projects/{project_id}/sync/snapshot"),
                &token,
                None,
            ))
            .await
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["snapshot_seq"], 2);
    let issues = body["data"]["entities"]["issues"].as_array().unwrap();
    assert_eq!(issues.len(), 1);
    assert_eq!(issues[0]["status"], "done");
}

#[tokio::test]
async fn non_member_gets_not_found_not_forbidden() {
    let (ctx, _dir) = test_ctx().await;
    let app = router(ctx);

    let owner_token = device_login(&app, "owner@example.com").await;
    let outsider_token = device_login(&app, "outsider@example.com").await;

    let (_, body) = body_json(
        app.clone()
            .oneshot(authed(
                "POST",
                "/v1/projects",
                &owner_token,
                Some(json!({ "name": "private", "description": null })),
            ))
            .await
            .unwrap(),
    )
    .await;
    let project_id = body["data"]["id"].as_str().unwrap().to_string();

    let resp = app
        .clone()
        .oneshot(authed(
            "GET",
            &format!("/v1/projects/{project_id}/sync/status"),
            &outsider_token,
            None,
        ))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    let (_, body) = body_json(resp).await;
    assert_eq!(body["error"]["code"], "not_found");
}

#[tokio::test]
async fn unauthenticated_request_is_rejected() {
    let (ctx, _dir) = test_ctx().await;
    let app = router(ctx);

    let resp = app
        .oneshot(
            Request::get("/v1/projects")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn admin_overview_requires_admin_scope() {
    let (ctx, _dir) = test_ctx().await;
    let app = router(ctx.clone());

    let sync_token = device_login(&app, "member@example.com").await;
    let resp = app
        .clone()
        .oneshot(authed("GET", "/v1/admin/server/overview", &sync_token, None))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::FORBIDDEN);

    let user = ctx
        .control
        .get_user_by_email("member@example.com")
        .await
        .unwrap()
        .unwrap();
    let (admin_token, _record) = ctx
        .control
        .generate_api_key(&user.id, "admin-cli", &[syncd::auth::SCOPE_ADMIN_READ_SERVER], None)
        .await
        .unwrap();

    let (status, body) = body_json(
        app.clone()
            .oneshot(authed(
                "GET",
                "/v1/admin/server/overview",
                &admin_token,
                None,
            ))
            .await
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert!(body["data"].is_object());
}
