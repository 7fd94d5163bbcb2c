//! Integration tests for the approval dashboard API.
//!
//! These tests exercise the router end to end against a temporary vault:
//! - Listing, pagination and kind filtering of pending approvals
//! - Content edits, approvals and rejections
//! - Error mapping for conflicts, missing records and traversal attempts
//! - Bearer-token authorization
//! - Audit queries and summaries

use axum::{
    body::Body,
    http::{header, Method, Request, StatusCode},
};
use http_body_util::BodyExt;
use serde_json::{json, Value};
use std::sync::Arc;
use tempfile::TempDir;
use tower::ServiceExt;

use vault_common::{AuditLedger, WorkZone};
use vault_workflow::{
    build_routes, AuthState, Broadcaster, DashboardState, Header, Lifecycle, Resilience, State, Vault,
};

// ─────────────────────────────────────────────────────────────────────────────
// Test Setup Helpers
// ─────────────────────────────────────────────────────────────────────────────

struct Fixture {
    _dir: TempDir,
    lifecycle: Lifecycle,
    app: axum::Router,
}

fn setup(auth: Option<AuthState>) -> Fixture {
    let dir = TempDir::new().unwrap();
    let vault = Vault::open(dir.path()).unwrap();
    let ledger = Arc::new(AuditLedger::open(vault.layout().logs_dir()).unwrap());
    let lifecycle = Lifecycle::new(vault, ledger, WorkZone::Local);

    let state = DashboardState::new(
        lifecycle.clone(),
        Arc::new(Broadcaster::new(16)),
        Arc::new(Resilience::default()),
    )
    .with_auth(auth);

    Fixture {
        _dir: dir,
        lifecycle,
        app: build_routes(state),
    }
}

/// Put a record awaiting review straight into `Pending_Approval/<kind>/`.
fn pending(lifecycle: &Lifecycle, kind: &str, id: &str, title: &str) {
    let header: Header = [
        ("type", kind),
        ("status", "pending_approval"),
        ("title", title),
        ("to", "client@example.com"),
    ]
    .into_iter()
    .collect();
    lifecycle
        .vault()
        .write(
            format!("Pending_Approval/{kind}/{id}.md"),
            &header,
            &format!("# {title}\n\n## Draft\nOriginal draft for {id}\n"),
        )
        .unwrap();
}

async fn send(app: &axum::Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let body = response.into_body().collect().await.unwrap().to_bytes();
    let json = serde_json::from_slice(&body).unwrap_or(Value::Null);
    (status, json)
}

/// Helper to make a request and get the JSON response.
async fn request_json(
    app: &axum::Router,
    method: Method,
    uri: &str,
    body: Option<Value>,
) -> (StatusCode, Value) {
    let builder = Request::builder().method(method).uri(uri);
    let request = match body {
        Some(b) => builder
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(serde_json::to_string(&b).unwrap()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    };
    send(app, request).await
}

async fn request_with_token(app: &axum::Router, uri: &str, token: Option<&str>) -> (StatusCode, Value) {
    let mut builder = Request::builder().method(Method::GET).uri(uri);
    if let Some(token) = token {
        builder = builder.header(header::AUTHORIZATION, format!("Bearer {token}"));
    }
    send(app, builder.body(Body::empty()).unwrap()).await
}

// ─────────────────────────────────────────────────────────────────────────────
// Health & status
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_health_is_public() {
    let fx = setup(Some(AuthState::new("secret", 60)));
    let (status, body) = request_json(&fx.app, Method::GET, "/health", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "healthy");
}

#[tokio::test]
async fn test_status_reports_pending_count() {
    let fx = setup(None);
    pending(&fx.lifecycle, "email", "EMAIL_1", "One");
    pending(&fx.lifecycle, "email", "EMAIL_2", "Two");

    let (status, body) = request_json(&fx.app, Method::GET, "/api/status", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["zone"], "local");
    assert_eq!(body["data"]["pending"], 2);
    assert_eq!(body["data"]["subscribers"], 0);
}

// ─────────────────────────────────────────────────────────────────────────────
// Listing
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_list_empty() {
    let fx = setup(None);
    let (status, body) = request_json(&fx.app, Method::GET, "/api/approvals", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], true);
    assert_eq!(body["data"]["total"], 0);
    assert!(body["data"]["items"].as_array().unwrap().is_empty());
    assert!(body.get("error").is_none());
}

#[tokio::test]
async fn test_list_paginates_and_filters_by_kind() {
    let fx = setup(None);
    for i in 0..5 {
        pending(&fx.lifecycle, "email", &format!("EMAIL_{i}"), &format!("Reply {i}"));
    }
    pending(&fx.lifecycle, "social_media", "SOCIAL_1", "Launch post");

    let (_, body) = request_json(&fx.app, Method::GET, "/api/approvals?per_page=4", None).await;
    assert_eq!(body["data"]["total"], 6);
    assert_eq!(body["data"]["per_page"], 4);
    assert_eq!(body["data"]["items"].as_array().unwrap().len(), 4);

    let (_, body) = request_json(&fx.app, Method::GET, "/api/approvals?per_page=4&page=2", None).await;
    assert_eq!(body["data"]["page"], 2);
    assert_eq!(body["data"]["items"].as_array().unwrap().len(), 2);

    let (_, body) = request_json(&fx.app, Method::GET, "/api/approvals?kind=social_media", None).await;
    assert_eq!(body["data"]["total"], 1);
    let item = &body["data"]["items"][0];
    assert_eq!(item["id"], "SOCIAL_1");
    assert_eq!(item["kind"], "social_media");
    assert_eq!(item["title"], "Launch post");
    assert_eq!(item["file_name"], "SOCIAL_1.md");
}

#[tokio::test]
async fn test_list_clamps_page_size() {
    let fx = setup(None);
    pending(&fx.lifecycle, "email", "EMAIL_1", "One");

    let (status, body) = request_json(&fx.app, Method::GET, "/api/approvals?per_page=0&page=0", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["per_page"], 1);
    assert_eq!(body["data"]["page"], 1);
    assert_eq!(body["data"]["items"].as_array().unwrap().len(), 1);
}

// ─────────────────────────────────────────────────────────────────────────────
// Detail & edits
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_get_approval_includes_draft() {
    let fx = setup(None);
    pending(&fx.lifecycle, "email", "EMAIL_1", "Invoice");

    let (status, body) = request_json(&fx.app, Method::GET, "/api/approvals/EMAIL_1", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["id"], "EMAIL_1");
    assert_eq!(body["data"]["state"], "pending_approval");
    assert!(body["data"]["draft"].as_str().unwrap().contains("Original draft for EMAIL_1"));
    assert_eq!(body["data"]["header"]["type"], "email");
}

#[tokio::test]
async fn test_get_missing_record_is_not_found() {
    let fx = setup(None);
    let (status, body) = request_json(&fx.app, Method::GET, "/api/approvals/NOPE", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["success"], false);
    assert!(body["error"].as_str().is_some());
}

#[tokio::test]
async fn test_traversal_id_is_rejected() {
    let fx = setup(None);
    let (status, body) = request_json(&fx.app, Method::GET, "/api/approvals/..%2F..%2Fetc", None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["success"], false);
}

#[tokio::test]
async fn test_update_content_rewrites_body() {
    let fx = setup(None);
    pending(&fx.lifecycle, "email", "EMAIL_1", "Invoice");

    let (status, body) = request_json(
        &fx.app,
        Method::PUT,
        "/api/approvals/EMAIL_1/content",
        Some(json!({ "content": "## Draft\nRevised wording\n", "edited_by": "carol" })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["header"]["edited_by"], "carol");

    let record = fx.lifecycle.vault().find("EMAIL_1", &[State::PendingApproval]).unwrap();
    assert!(record.body.contains("Revised wording"));
    assert!(record.get("last_edited").is_some());
}

#[tokio::test]
async fn test_update_content_rejects_empty() {
    let fx = setup(None);
    pending(&fx.lifecycle, "email", "EMAIL_1", "Invoice");

    let (status, _) = request_json(
        &fx.app,
        Method::PUT,
        "/api/approvals/EMAIL_1/content",
        Some(json!({ "content": "   " })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

// ─────────────────────────────────────────────────────────────────────────────
// Decisions
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_approve_moves_record() {
    let fx = setup(None);
    pending(&fx.lifecycle, "email", "EMAIL_1", "Invoice");

    let (status, body) = request_json(
        &fx.app,
        Method::POST,
        "/api/approvals/EMAIL_1/approve",
        Some(json!({ "actor": "alice", "note": "ship it" })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["header"]["status"], "approved");
    assert_eq!(body["data"]["header"]["approved_by"], "alice");

    let record = fx.lifecycle.vault().find("EMAIL_1", &[State::Approved]).unwrap();
    assert!(record.path.ends_with("Approved/email/EMAIL_1.md"));

    // Deciding twice is a conflict.
    let (status, body) = request_json(&fx.app, Method::POST, "/api/approvals/EMAIL_1/approve", None).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["success"], false);
}

#[tokio::test]
async fn test_reject_without_body_uses_default_actor() {
    let fx = setup(None);
    pending(&fx.lifecycle, "social_media", "SOCIAL_1", "Launch");

    let (status, body) = request_json(&fx.app, Method::POST, "/api/approvals/SOCIAL_1/reject", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["header"]["rejected_by"], "dashboard");
    assert!(fx.lifecycle.vault().find("SOCIAL_1", &[State::Rejected]).is_ok());

    let (status, _) = request_json(&fx.app, Method::POST, "/api/approvals/SOCIAL_1/approve", None).await;
    assert_eq!(status, StatusCode::CONFLICT);
}

#[tokio::test]
async fn test_approve_missing_record_is_not_found() {
    let fx = setup(None);
    let (status, _) = request_json(&fx.app, Method::POST, "/api/approvals/GHOST/approve", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

// ─────────────────────────────────────────────────────────────────────────────
// Authorization
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_api_requires_bearer_token_when_secret_set() {
    let auth = AuthState::new("dashboard-secret", 3600);
    let token = auth.generate_token("reviewer", vec!["reviewer".into()]).unwrap();
    let fx = setup(Some(auth));
    pending(&fx.lifecycle, "email", "EMAIL_1", "Invoice");

    let (status, body) = request_with_token(&fx.app, "/api/approvals", None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["success"], false);

    let (status, _) = request_with_token(&fx.app, "/api/approvals", Some("not-a-jwt")).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (status, body) = request_with_token(&fx.app, "/api/approvals", Some(&token)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["total"], 1);
}

#[tokio::test]
async fn test_token_subject_becomes_actor() {
    let auth = AuthState::new("dashboard-secret", 3600);
    let token = auth.generate_token("dana", vec![]).unwrap();
    let fx = setup(Some(auth));
    pending(&fx.lifecycle, "email", "EMAIL_1", "Invoice");

    let request = Request::builder()
        .method(Method::POST)
        .uri("/api/approvals/EMAIL_1/approve")
        .header(header::AUTHORIZATION, format!("Bearer {token}"))
        .body(Body::empty())
        .unwrap();
    let (status, body) = send(&fx.app, request).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["header"]["approved_by"], "dana");
}

#[tokio::test]
async fn test_api_open_without_secret() {
    let fx = setup(None);
    let (status, _) = request_with_token(&fx.app, "/api/approvals", None).await;
    assert_eq!(status, StatusCode::OK);
}

// ─────────────────────────────────────────────────────────────────────────────
// Audit
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_audit_reflects_dashboard_decisions() {
    let fx = setup(None);
    pending(&fx.lifecycle, "email", "EMAIL_1", "One");
    pending(&fx.lifecycle, "email", "EMAIL_2", "Two");

    request_json(&fx.app, Method::POST, "/api/approvals/EMAIL_1/approve", None).await;
    request_json(&fx.app, Method::POST, "/api/approvals/EMAIL_2/reject", None).await;

    let (status, body) = request_json(&fx.app, Method::GET, "/api/audit?category=lifecycle", None).await;
    assert_eq!(status, StatusCode::OK);
    let actions: Vec<&str> = body["data"]
        .as_array()
        .unwrap()
        .iter()
        .filter_map(|e| e["action"].as_str())
        .collect();
    assert!(actions.contains(&"approved"));
    assert!(actions.contains(&"rejected"));

    let (status, body) = request_json(&fx.app, Method::GET, "/api/audit/summary", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["total"], 2);
    assert_eq!(body["data"]["by_category"]["lifecycle"], 2);
}

#[tokio::test]
async fn test_audit_rejects_inverted_range() {
    let fx = setup(None);
    let (status, _) = request_json(
        &fx.app,
        Method::GET,
        "/api/audit?start=2026-02-01&end=2026-01-01",
        None,
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = request_json(
        &fx.app,
        Method::GET,
        "/api/audit/summary?start=2026-02-01&end=2026-01-01",
        None,
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}
