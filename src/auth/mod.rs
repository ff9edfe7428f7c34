//! Auth + authorization (spec §4.5): bearer-token validation, scope checks,
//! and project-role checks. The device-code login flow itself lives in
//! [`device`].

pub mod device;

use std::str::FromStr;

use crate::control::{ApiKeyRecord, BearerOutcome, ControlStore, User};
use crate::error::ApiError;

/// Project membership role lattice: `reader < writer < owner` (spec §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Reader,
    Writer,
    Owner,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::Reader => "reader",
            Role::Writer => "writer",
            Role::Owner => "owner",
        }
    }
}

impl FromStr for Role {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "reader" => Ok(Role::Reader),
            "writer" => Ok(Role::Writer),
            "owner" => Ok(Role::Owner),
            _ => Err(()),
        }
    }
}

/// Admin scopes, each guarding one family of admin endpoints (spec §3).
pub const SCOPE_SYNC: &str = "sync";
pub const SCOPE_ADMIN_READ_SERVER: &str = "admin:read:server";
pub const SCOPE_ADMIN_READ_PROJECTS: &str = "admin:read:projects";
pub const SCOPE_ADMIN_READ_SNAPSHOTS: &str = "admin:read:snapshots";
pub const SCOPE_ADMIN_READ_EVENTS: &str = "admin:read:events";

/// The authenticated identity attached to a request after the bearer
/// middleware runs.
#[derive(Debug, Clone)]
pub struct Identity {
    pub user: User,
    pub key: ApiKeyRecord,
}

impl Identity {
    /// Rate-limit / quota identity: the API key id, falling back to nothing
    /// (the HTTP layer falls back further to client IP — see §4.8).
    pub fn rate_limit_identity(&self) -> String {
        format!("key:{}", self.key.id)
    }
}

/// Parse and validate the `Authorization: Bearer <token>` header (spec §4.5
/// steps 1-3). Returns `unauthorized` for missing/malformed headers, unknown
/// tokens, and `unauthorized` (not a distinct code) for expired ones too,
/// matching spec's error table — §7 maps both cases to HTTP 401.
pub async fn authenticate(
    store: &ControlStore,
    authorization_header: Option<&str>,
) -> Result<Identity, ApiError> {
    let header = authorization_header.ok_or_else(|| ApiError::unauthorized("missing Authorization header"))?;
    let token = header
        .strip_prefix("Bearer ")
        .ok_or_else(|| ApiError::unauthorized("malformed Authorization header"))?;
    if token.is_empty() {
        return Err(ApiError::unauthorized("empty bearer token"));
    }

    match store.validate_bearer(token).await.map_err(ApiError::from)? {
        BearerOutcome::Ok { user, key } => Ok(Identity { user, key }),
        BearerOutcome::Unauthorized => Err(ApiError::unauthorized("invalid bearer token")),
        BearerOutcome::Expired => Err(ApiError::unauthorized("bearer token expired")),
    }
}

/// Admin-endpoint gate (spec §4.5 step 4): the user must be an admin AND the
/// key must carry the specific scope this endpoint requires.
pub fn require_admin_scope(identity: &Identity, scope: &str) -> Result<(), ApiError> {
    if !identity.user.is_admin {
        return Err(ApiError::forbidden("admin endpoints require an admin user"));
    }
    if !identity.key.has_scope(scope) {
        return Err(ApiError::insufficient_admin_scope(scope));
    }
    Ok(())
}

/// Project-endpoint gate (spec §4.5 step 5): resolve membership and check
/// role ≥ floor. Absent membership is reported as `not_found`, never
/// `403`, to avoid a membership oracle (spec §9, testable property 4).
pub async fn require_project_role(
    store: &ControlStore,
    identity: &Identity,
    project_id: &str,
    floor: Role,
) -> Result<Role, ApiError> {
    let membership = store
        .get_membership(project_id, &identity.user.id)
        .await
        .map_err(ApiError::from)?
        .ok_or_else(|| ApiError::not_found("project not found"))?;
    let role = membership.role();
    if role < floor {
        return Err(ApiError::forbidden("insufficient project role"));
    }
    Ok(role)
}
