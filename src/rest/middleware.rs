//! Auth middleware (spec §4.8 chain, step "auth"): validates the bearer
//! token and attaches the resolved [`Identity`] to the request extensions so
//! downstream handlers can pull it out with `Extension<Identity>`.
//!
//! Rate limiting (the chain's final step) is not a generic layer here —
//! which bucket a request consumes from depends on the endpoint (push vs.
//! pull vs. admin vs. everything else), so each handler calls
//! [`crate::rate_limit::RateLimiter::check`] itself once it knows its class,
//! mirroring the explicit per-handler checks this codebase already uses
//! elsewhere rather than threading a class enum through a generic layer.

use std::sync::Arc;

use axum::{
    extract::{Request, State},
    http::header,
    middleware::Next,
    response::{IntoResponse, Response},
};

use crate::auth::{self};
use crate::AppContext;

pub async fn require_auth(State(ctx): State<Arc<AppContext>>, mut req: Request, next: Next) -> Response {
    let header = req
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);

    match auth::authenticate(&ctx.control, header.as_deref()).await {
        Ok(identity) => {
            req.extensions_mut().insert(identity);
            next.run(req).await
        }
        Err(err) => err.into_response(),
    }
}
