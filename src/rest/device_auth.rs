//! `POST /v1/auth/device/{start,verify,poll}` (spec §4.5, §6) — unauthenticated
//! endpoints, rate-limited under the `auth` class keyed by client IP since
//! there is no bearer identity yet.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{ConnectInfo, State};
use axum::Json;
use serde::Deserialize;
use serde_json::json;

use crate::auth::device;
use crate::error::{ApiResult, ok_envelope};
use crate::rate_limit::IdentityClass;
use crate::AppContext;

fn ip_identity(addr: &SocketAddr) -> String {
    format!("ip:{}", addr.ip())
}

#[derive(Deserialize)]
pub struct StartRequest {
    pub email: String,
}

pub async fn start(
    State(ctx): State<Arc<AppContext>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Json(body): Json<StartRequest>,
) -> ApiResult<Json<serde_json::Value>> {
    ctx.rate_limiter
        .check(&ctx.control, &ip_identity(&addr), IdentityClass::Auth)
        .await?;
    let req = device::start(&ctx.control, &body.email).await?;
    Ok(ok_envelope(json!({
        "auth_request_id": req.id,
        "user_code": req.user_code,
        "device_code": req.device_code,
        "expires_at": req.expires_at,
    })))
}

#[derive(Deserialize)]
pub struct VerifyRequest {
    pub user_code: String,
}

pub async fn verify(
    State(ctx): State<Arc<AppContext>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Json(body): Json<VerifyRequest>,
) -> ApiResult<Json<serde_json::Value>> {
    ctx.rate_limiter
        .check(&ctx.control, &ip_identity(&addr), IdentityClass::Auth)
        .await?;
    let req = device::verify(&ctx.control, &body.user_code).await?;
    Ok(ok_envelope(json!({
        "auth_request_id": req.id,
        "status": req.status,
    })))
}

#[derive(Deserialize)]
pub struct PollRequest {
    pub device_code: String,
}

pub async fn poll(
    State(ctx): State<Arc<AppContext>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Json(body): Json<PollRequest>,
) -> ApiResult<Json<serde_json::Value>> {
    ctx.rate_limiter
        .check(&ctx.control, &ip_identity(&addr), IdentityClass::Auth)
        .await?;
    let outcome = device::poll(&ctx.control, &body.device_code, ctx.config.allow_signup).await?;
    let body = match outcome {
        device::PollOutcome::Pending => json!({"status": "pending"}),
        device::PollOutcome::Failed => json!({"status": "failed"}),
        device::PollOutcome::Expired => json!({"status": "expired"}),
        device::PollOutcome::Approved { plaintext_key } => {
            json!({"status": "approved", "api_key": plaintext_key})
        }
    };
    Ok(ok_envelope(body))
}
