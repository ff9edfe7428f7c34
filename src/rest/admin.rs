//! `/v1/admin/*` (spec §10.6): server/user/project/event/snapshot/rate-limit
//! listings behind admin scopes. Admin endpoints are exempt from the
//! per-request rate limiter but every call is still recorded for the audit
//! trail (spec §4.8).

use std::sync::Arc;

use axum::extract::{Extension, Path, Query, State};
use axum::Json;
use serde::Deserialize;
use serde_json::json;

use crate::auth::{self, Identity, SCOPE_ADMIN_READ_EVENTS, SCOPE_ADMIN_READ_PROJECTS, SCOPE_ADMIN_READ_SERVER, SCOPE_ADMIN_READ_SNAPSHOTS};
use crate::auth::device;
use crate::error::{ok_envelope, ApiError, ApiResult};
use crate::observability::HealthStatus;
use crate::pagination::{self, CursorValue};
use crate::sync;
use crate::AppContext;

async fn audit(ctx: &AppContext, identity: &Identity) {
    ctx.rate_limiter
        .record_admin_usage(&ctx.control, &identity.rate_limit_identity())
        .await;
}

#[derive(Deserialize)]
pub struct CursorPageQuery {
    pub cursor: Option<String>,
    pub limit: Option<u32>,
}

pub async fn server_overview(
    State(ctx): State<Arc<AppContext>>,
    Extension(identity): Extension<Identity>,
) -> ApiResult<Json<serde_json::Value>> {
    auth::require_admin_scope(&identity, SCOPE_ADMIN_READ_SERVER)?;
    audit(&ctx, &identity).await;

    let total_users = ctx.control.count_users().await?;
    let total_projects = ctx.control.total_projects().await?;
    let total_members = ctx.control.total_members().await?;
    let health = HealthStatus::ok(ctx.uptime_secs(), true);
    Ok(ok_envelope(json!({
        "uptime_seconds": ctx.uptime_secs(),
        "health": health,
        "total_users": total_users,
        "total_projects": total_projects,
        "total_members": total_members,
    })))
}

pub async fn list_users(
    State(ctx): State<Arc<AppContext>>,
    Extension(identity): Extension<Identity>,
    Query(q): Query<CursorPageQuery>,
) -> ApiResult<Json<serde_json::Value>> {
    auth::require_admin_scope(&identity, SCOPE_ADMIN_READ_SERVER)?;
    audit(&ctx, &identity).await;

    let limit = pagination::clamp_limit(q.limit);
    let after_id = pagination::cursor_bound(q.cursor.as_deref())?;
    let rows = ctx.control.list_users(after_id.as_deref(), limit as i64 + 1).await?;
    let page = pagination::build_page(rows, limit, |u| CursorValue::from_id(u.id.clone()));
    Ok(ok_envelope(page))
}

#[derive(Deserialize)]
pub struct ListProjectsQuery {
    pub cursor: Option<String>,
    pub limit: Option<u32>,
    #[serde(default)]
    pub include_deleted: bool,
}

pub async fn list_projects(
    State(ctx): State<Arc<AppContext>>,
    Extension(identity): Extension<Identity>,
    Query(q): Query<ListProjectsQuery>,
) -> ApiResult<Json<serde_json::Value>> {
    auth::require_admin_scope(&identity, SCOPE_ADMIN_READ_PROJECTS)?;
    audit(&ctx, &identity).await;

    let limit = pagination::clamp_limit(q.limit);
    let after_id = pagination::cursor_bound(q.cursor.as_deref())?;
    let rows = ctx
        .control
        .list_projects_admin(after_id.as_deref(), limit as i64 + 1, q.include_deleted)
        .await?;
    let page = pagination::build_page(rows, limit, |p| CursorValue::from_id(p.id.clone()));
    Ok(ok_envelope(page))
}

#[derive(Deserialize)]
pub struct ListEventsQuery {
    pub cursor: Option<String>,
    pub limit: Option<u32>,
    pub entity_type: Option<String>,
    pub action_type: Option<String>,
    pub device_id: Option<String>,
}

pub async fn list_project_events(
    State(ctx): State<Arc<AppContext>>,
    Extension(identity): Extension<Identity>,
    Path(project_id): Path<String>,
    Query(q): Query<ListEventsQuery>,
) -> ApiResult<Json<serde_json::Value>> {
    auth::require_admin_scope(&identity, SCOPE_ADMIN_READ_EVENTS)?;
    audit(&ctx, &identity).await;

    let limit = pagination::clamp_limit(q.limit);
    let page = sync::admin_list_events(
        &ctx.journal_pool,
        &project_id,
        q.entity_type.as_deref(),
        q.action_type.as_deref(),
        q.device_id.as_deref(),
        q.cursor.as_deref(),
        limit,
    )
    .await?;
    Ok(ok_envelope(page))
}

pub async fn project_snapshot_meta(
    State(ctx): State<Arc<AppContext>>,
    Extension(identity): Extension<Identity>,
    Path(project_id): Path<String>,
) -> ApiResult<Json<serde_json::Value>> {
    auth::require_admin_scope(&identity, SCOPE_ADMIN_READ_SNAPSHOTS)?;
    audit(&ctx, &identity).await;

    let meta = ctx.snapshot_engine.meta(&ctx.journal_pool, &project_id).await?;
    Ok(ok_envelope(meta))
}

pub async fn project_cursors(
    State(ctx): State<Arc<AppContext>>,
    Extension(identity): Extension<Identity>,
    Path(project_id): Path<String>,
    Query(q): Query<CursorPageQuery>,
) -> ApiResult<Json<serde_json::Value>> {
    auth::require_admin_scope(&identity, SCOPE_ADMIN_READ_EVENTS)?;
    audit(&ctx, &identity).await;

    let handle = ctx
        .journal_pool
        .acquire(&project_id)
        .await
        .map_err(|_| ApiError::not_found("project journal is unavailable"))?;
    let head_seq = crate::journal::store::head_seq(handle.pool()).await?;

    let limit = pagination::clamp_limit(q.limit);
    let after_client_id = pagination::cursor_bound(q.cursor.as_deref())?;
    let rows = ctx
        .control
        .list_sync_cursors(&project_id, after_client_id.as_deref(), limit as i64 + 1)
        .await?;
    let page = pagination::build_page(rows, limit, |c| CursorValue::from_id(c.client_id.clone()));
    let data: Vec<serde_json::Value> = page
        .data
        .iter()
        .map(|c| {
            json!({
                "project_id": c.project_id,
                "client_id": c.client_id,
                "last_event_id": c.last_event_id,
                "last_sync_at": c.last_sync_at,
                "distance_from_head": head_seq - c.last_event_id,
            })
        })
        .collect();
    Ok(ok_envelope(json!({
        "data": data,
        "next_cursor": page.next_cursor,
        "has_more": page.has_more,
    })))
}

pub async fn list_rate_limit_events(
    State(ctx): State<Arc<AppContext>>,
    Extension(identity): Extension<Identity>,
    Query(q): Query<CursorPageQuery>,
) -> ApiResult<Json<serde_json::Value>> {
    auth::require_admin_scope(&identity, SCOPE_ADMIN_READ_SERVER)?;
    audit(&ctx, &identity).await;

    let limit = pagination::clamp_limit(q.limit);
    let after_id = pagination::cursor_bound(q.cursor.as_deref())?;
    let rows = ctx
        .control
        .list_rate_limit_events(after_id.as_deref(), limit as i64 + 1)
        .await?;
    let page = pagination::build_page(rows, limit, |e| CursorValue::from_id(e.id.clone()));
    Ok(ok_envelope(page))
}

pub async fn list_auth_events(
    State(ctx): State<Arc<AppContext>>,
    Extension(identity): Extension<Identity>,
    Query(q): Query<CursorPageQuery>,
) -> ApiResult<Json<serde_json::Value>> {
    auth::require_admin_scope(&identity, SCOPE_ADMIN_READ_SERVER)?;
    audit(&ctx, &identity).await;

    let limit = pagination::clamp_limit(q.limit);
    let after_id = pagination::cursor_bound(q.cursor.as_deref())?;
    let rows = ctx.control.list_auth_events(after_id.as_deref(), limit as i64 + 1).await?;
    let page = pagination::build_page(rows, limit, |e| CursorValue::from_id(e.id.clone()));
    Ok(ok_envelope(page))
}

pub async fn approve_auth_request(
    State(ctx): State<Arc<AppContext>>,
    Extension(identity): Extension<Identity>,
    Path(auth_request_id): Path<String>,
) -> ApiResult<Json<serde_json::Value>> {
    auth::require_admin_scope(&identity, SCOPE_ADMIN_READ_SERVER)?;
    audit(&ctx, &identity).await;

    let plaintext_key = device::admin_approve(&ctx.control, &auth_request_id).await?;
    Ok(ok_envelope(json!({ "api_key": plaintext_key })))
}
