//! HTTP routes for the approval dashboard.
//!
//! Provides REST API endpoints for:
//! - Listing and inspecting records awaiting review
//! - Editing drafts, approving and rejecting
//! - Querying the audit ledger
//! - The live change feed over WebSocket

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    middleware,
    response::{IntoResponse, Response},
    routing::{get, post, put},
    Extension, Json, Router,
};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use vault_common::{AuditEntry, AuditQuery, AuditSummary, Error};

use crate::auth::{auth_middleware, AuthState, AuthUser};
use crate::feed::Broadcaster;
use crate::lifecycle::Lifecycle;
use crate::record::Record;
use crate::resilience::{CircuitBreakerStats, Resilience};
use crate::state::{Kind, State as RecordState};
use crate::store::ListOrder;
use crate::ws;

// ============================================================================
// State
// ============================================================================

/// Shared state for the dashboard server.
#[derive(Clone)]
pub struct DashboardState {
    pub lifecycle: Arc<Lifecycle>,
    pub broadcaster: Arc<Broadcaster>,
    pub auth: Option<AuthState>,
    pub resilience: Arc<Resilience>,
}

impl DashboardState {
    pub fn new(lifecycle: Lifecycle, broadcaster: Arc<Broadcaster>, resilience: Arc<Resilience>) -> Self {
        Self {
            lifecycle: Arc::new(lifecycle),
            broadcaster,
            auth: None,
            resilience,
        }
    }

    pub fn with_auth(mut self, auth: Option<AuthState>) -> Self {
        self.auth = auth;
        self
    }
}

// ============================================================================
// Response Types
// ============================================================================

#[derive(Debug, Serialize, Deserialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl<T: Serialize> ApiResponse<T> {
    fn success(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }
}

impl ApiResponse<()> {
    fn error(msg: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(msg.into()),
        }
    }
}

/// Error body with the status code the taxonomy assigns.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl From<Error> for ApiError {
    fn from(error: Error) -> Self {
        let status =
            StatusCode::from_u16(error.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        if status.is_server_error() {
            tracing::error!(error = %error, "Request failed");
        }
        Self {
            status,
            message: error.to_string(),
        }
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(error: anyhow::Error) -> Self {
        tracing::error!(error = %error, "Request failed");
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: error.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(ApiResponse::error(self.message))).into_response()
    }
}

type ApiResult<T> = std::result::Result<Json<ApiResponse<T>>, ApiError>;

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    service: &'static str,
    version: &'static str,
}

/// One row of the approvals list.
#[derive(Debug, Serialize)]
pub struct ApprovalSummary {
    pub id: String,
    pub kind: String,
    pub file_name: String,
    pub title: Option<String>,
    pub created: Option<String>,
    pub expires: Option<String>,
    pub modified: String,
}

impl From<&Record> for ApprovalSummary {
    fn from(record: &Record) -> Self {
        let modified: chrono::DateTime<chrono::Utc> = record.modified.into();
        Self {
            id: record.id.clone(),
            kind: record.kind().as_str().to_string(),
            file_name: record.file_name.clone(),
            title: record
                .header
                .first_of(&["title", "subject", "topic"])
                .map(str::to_string),
            created: record.get("created").map(str::to_string),
            expires: record.get("expires").map(str::to_string),
            modified: modified.to_rfc3339(),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub total: usize,
    pub page: usize,
    pub per_page: usize,
}

#[derive(Debug, Serialize)]
pub struct ApprovalDetail {
    pub state: &'static str,
    pub draft: Option<String>,
    #[serde(flatten)]
    pub record: Record,
}

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub zone: String,
    pub pending: usize,
    pub subscribers: usize,
    pub breakers: Vec<CircuitBreakerStats>,
}

// ============================================================================
// Router
// ============================================================================

/// Build the dashboard router.
pub fn build_routes(state: DashboardState) -> Router {
    let api = Router::new()
        .route("/api/approvals", get(list_approvals))
        .route("/api/approvals/:id", get(get_approval))
        .route("/api/approvals/:id/content", put(update_content))
        .route("/api/approvals/:id/approve", post(approve))
        .route("/api/approvals/:id/reject", post(reject))
        .route("/api/audit", get(list_audit))
        .route("/api/audit/summary", get(audit_summary))
        .route("/api/status", get(status))
        .layer(middleware::from_fn_with_state(state.auth.clone(), auth_middleware));

    Router::new()
        .route("/health", get(health))
        .route("/api/ws", get(ws::feed_handler))
        .merge(api)
        .with_state(state)
}

// ============================================================================
// Health
// ============================================================================

async fn health() -> impl IntoResponse {
    Json(HealthResponse {
        status: "healthy",
        service: "vault-workflow",
        version: env!("CARGO_PKG_VERSION"),
    })
}

async fn status(State(state): State<DashboardState>) -> ApiResult<StatusResponse> {
    let pending = state
        .lifecycle
        .vault()
        .records(RecordState::PendingApproval, ListOrder::Lexical)?
        .len();
    Ok(Json(ApiResponse::success(StatusResponse {
        zone: state.lifecycle.zone().to_string(),
        pending,
        subscribers: state.broadcaster.subscriber_count(),
        breakers: state.resilience.stats(),
    })))
}

// ============================================================================
// Approvals
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct ListParams {
    pub kind: Option<String>,
    pub page: Option<usize>,
    pub per_page: Option<usize>,
}

async fn list_approvals(
    State(state): State<DashboardState>,
    Query(params): Query<ListParams>,
) -> ApiResult<Page<ApprovalSummary>> {
    let kind = params.kind.as_deref().filter(|k| !k.is_empty()).map(Kind::parse);
    let page = params.page.unwrap_or(1).max(1);
    let per_page = params.per_page.unwrap_or(20).clamp(1, 100);

    let records: Vec<Record> = state
        .lifecycle
        .vault()
        .records(RecordState::PendingApproval, ListOrder::Recent)?
        .into_iter()
        .filter(|r| kind.as_ref().map_or(true, |k| &r.kind() == k))
        .collect();

    let total = records.len();
    let items = records
        .iter()
        .skip((page - 1) * per_page)
        .take(per_page)
        .map(ApprovalSummary::from)
        .collect();

    Ok(Json(ApiResponse::success(Page {
        items,
        total,
        page,
        per_page,
    })))
}

async fn get_approval(
    State(state): State<DashboardState>,
    Path(id): Path<String>,
) -> ApiResult<ApprovalDetail> {
    let vault = state.lifecycle.vault();
    let record = vault.find(
        &id,
        &[
            RecordState::PendingApproval,
            RecordState::Approved,
            RecordState::Rejected,
            RecordState::Done,
        ],
    )?;
    let record_state = vault
        .layout()
        .state_of(&record.path)
        .map_or("unknown", |s| s.as_str());

    Ok(Json(ApiResponse::success(ApprovalDetail {
        state: record_state,
        draft: record.section(&["## Draft", "## Draft Reply", "## Draft Post"]),
        record,
    })))
}

#[derive(Debug, Deserialize)]
pub struct ContentRequest {
    pub content: String,
    pub edited_by: Option<String>,
}

async fn update_content(
    State(state): State<DashboardState>,
    Path(id): Path<String>,
    user: Option<Extension<AuthUser>>,
    Json(req): Json<ContentRequest>,
) -> ApiResult<Record> {
    if req.content.trim().is_empty() {
        return Err(Error::InvalidInput("content must not be empty".into()).into());
    }
    let editor = actor(req.edited_by.as_deref(), user.as_ref().map(|u| &u.0));
    let record = state.lifecycle.edit_content(&id, &req.content, &editor)?;
    tracing::info!(record = %id, edited_by = %editor, "Draft edited from dashboard");
    Ok(Json(ApiResponse::success(record)))
}

#[derive(Debug, Default, Deserialize)]
pub struct DecisionRequest {
    pub actor: Option<String>,
    pub note: Option<String>,
}

async fn approve(
    State(state): State<DashboardState>,
    Path(id): Path<String>,
    user: Option<Extension<AuthUser>>,
    body: Option<Json<DecisionRequest>>,
) -> ApiResult<Record> {
    let req = body.map(|Json(b)| b).unwrap_or_default();
    let who = actor(req.actor.as_deref(), user.as_ref().map(|u| &u.0));
    let record = state.lifecycle.approve(&id, &who, req.note.as_deref())?;
    tracing::info!(record = %id, actor = %who, "Approved from dashboard");
    Ok(Json(ApiResponse::success(record)))
}

async fn reject(
    State(state): State<DashboardState>,
    Path(id): Path<String>,
    user: Option<Extension<AuthUser>>,
    body: Option<Json<DecisionRequest>>,
) -> ApiResult<Record> {
    let req = body.map(|Json(b)| b).unwrap_or_default();
    let who = actor(req.actor.as_deref(), user.as_ref().map(|u| &u.0));
    let record = state.lifecycle.reject(&id, &who, req.note.as_deref())?;
    tracing::info!(record = %id, actor = %who, "Rejected from dashboard");
    Ok(Json(ApiResponse::success(record)))
}

/// Explicit actor, else the token subject, else `dashboard`.
fn actor(explicit: Option<&str>, user: Option<&AuthUser>) -> String {
    explicit
        .map(str::trim)
        .filter(|a| !a.is_empty())
        .map(str::to_string)
        .or_else(|| user.map(|u| u.subject.clone()))
        .unwrap_or_else(|| "dashboard".to_string())
}

// ============================================================================
// Audit
// ============================================================================

async fn list_audit(
    State(state): State<DashboardState>,
    Query(query): Query<AuditQuery>,
) -> ApiResult<Vec<AuditEntry>> {
    check_range(query.start, query.end)?;
    let entries = state.lifecycle.ledger().query(&query)?;
    Ok(Json(ApiResponse::success(entries)))
}

#[derive(Debug, Deserialize)]
pub struct RangeParams {
    pub start: Option<NaiveDate>,
    pub end: Option<NaiveDate>,
}

async fn audit_summary(
    State(state): State<DashboardState>,
    Query(range): Query<RangeParams>,
) -> ApiResult<AuditSummary> {
    check_range(range.start, range.end)?;
    let summary = state.lifecycle.ledger().summary(range.start, range.end)?;
    Ok(Json(ApiResponse::success(summary)))
}

fn check_range(start: Option<NaiveDate>, end: Option<NaiveDate>) -> std::result::Result<(), ApiError> {
    match (start, end) {
        (Some(s), Some(e)) if s > e => {
            Err(Error::InvalidInput(format!("start {s} is after end {e}")).into())
        }
        _ => Ok(()),
    }
}
