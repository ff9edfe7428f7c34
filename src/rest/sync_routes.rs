//! `/v1/projects/{id}/sync/*` (spec §4.6, §4.7, §6): push, pull, status, and
//! snapshot. Thin HTTP wrappers around [`crate::sync`] and
//! [`crate::snapshot`] — all admission/pagination/fold logic lives there.

use std::sync::Arc;

use axum::extract::{Extension, Path, Query, State};
use axum::Json;
use serde::Deserialize;
use serde_json::json;

use crate::auth::{self, Identity, Role};
use crate::error::{ok_envelope, ApiResult};
use crate::observability::LatencyTracker;
use crate::rate_limit::IdentityClass;
use crate::sync::{self, PushEvent};
use crate::AppContext;

#[derive(Deserialize)]
pub struct PushRequest {
    pub device_id: String,
    pub session_id: String,
    pub events: Vec<PushEvent>,
}

pub async fn push(
    State(ctx): State<Arc<AppContext>>,
    Extension(identity): Extension<Identity>,
    Path(project_id): Path<String>,
    Json(body): Json<PushRequest>,
) -> ApiResult<Json<serde_json::Value>> {
    ctx.rate_limiter
        .check(&ctx.control, &identity.rate_limit_identity(), IdentityClass::Push)
        .await?;
    auth::require_project_role(&ctx.control, &identity, &project_id, Role::Writer).await?;
    let tracker = LatencyTracker::start("sync.push");
    let result = sync::push(
        &ctx.journal_pool,
        &ctx.control,
        &project_id,
        &body.device_id,
        &body.session_id,
        body.events,
    )
    .await?;
    tracker.finish();
    Ok(ok_envelope(result))
}

#[derive(Deserialize)]
pub struct PullQuery {
    pub cursor: Option<String>,
    pub after_server_seq: Option<i64>,
    pub limit: Option<u32>,
    pub device_id: Option<String>,
}

pub async fn pull(
    State(ctx): State<Arc<AppContext>>,
    Extension(identity): Extension<Identity>,
    Path(project_id): Path<String>,
    Query(q): Query<PullQuery>,
) -> ApiResult<Json<serde_json::Value>> {
    ctx.rate_limiter
        .check(&ctx.control, &identity.rate_limit_identity(), IdentityClass::Pull)
        .await?;
    auth::require_project_role(&ctx.control, &identity, &project_id, Role::Reader).await?;

    let after_seq = match q.cursor.as_deref() {
        Some(cursor) => sync::decode_after_seq(Some(cursor))?,
        None => q.after_server_seq.unwrap_or(0),
    };
    let limit = sync::clamp_pull_limit(q.limit);
    let tracker = LatencyTracker::start("sync.pull");
    let page = sync::pull(
        &ctx.journal_pool,
        &ctx.control,
        &project_id,
        q.device_id.as_deref(),
        after_seq,
        limit,
    )
    .await?;
    tracker.finish();

    let last_server_seq = page.data.last().map(|e| e.server_seq).unwrap_or(after_seq);
    Ok(ok_envelope(json!({
        "events": page.data,
        "last_server_seq": last_server_seq,
        "has_more": page.has_more,
        "next_cursor": page.next_cursor,
    })))
}

pub async fn status(
    State(ctx): State<Arc<AppContext>>,
    Extension(identity): Extension<Identity>,
    Path(project_id): Path<String>,
) -> ApiResult<Json<serde_json::Value>> {
    ctx.rate_limiter
        .check(&ctx.control, &identity.rate_limit_identity(), IdentityClass::Other)
        .await?;
    auth::require_project_role(&ctx.control, &identity, &project_id, Role::Reader).await?;
    let status = sync::status(&ctx.control, &project_id).await?;
    Ok(ok_envelope(status))
}

pub async fn snapshot(
    State(ctx): State<Arc<AppContext>>,
    Extension(identity): Extension<Identity>,
    Path(project_id): Path<String>,
) -> ApiResult<Json<serde_json::Value>> {
    ctx.rate_limiter
        .check(&ctx.control, &identity.rate_limit_identity(), IdentityClass::Other)
        .await?;
    auth::require_project_role(&ctx.control, &identity, &project_id, Role::Reader).await?;
    let tracker = LatencyTracker::start("sync.snapshot");
    let result = ctx
        .snapshot_engine
        .build(&ctx.journal_pool, &project_id, ctx.config.snapshot_max_replay)
        .await?;
    tracker.finish();
    Ok(ok_envelope(result))
}
