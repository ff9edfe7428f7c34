use std::sync::Arc;

use axum::extract::State;
use axum::Json;

use crate::observability::HealthStatus;
use crate::AppContext;

pub async fn health(State(ctx): State<Arc<AppContext>>) -> Json<HealthStatus> {
    let db_ok = ctx.control.count_users().await.is_ok();
    Json(HealthStatus::ok(ctx.uptime_secs(), db_ok))
}
