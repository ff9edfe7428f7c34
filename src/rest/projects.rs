//! `/v1/projects*` (spec §4.2, §6): project CRUD and membership management.
//! Every project-scoped route first resolves the caller's membership via
//! [`auth::require_project_role`], which reports `not_found` rather than
//! `forbidden` for a project the caller isn't a member of (spec §9).

use std::sync::Arc;

use axum::extract::{Extension, Path, State};
use axum::Json;
use serde::Deserialize;
use serde_json::json;

use crate::auth::{self, Identity, Role};
use crate::error::{ok_envelope, ApiError, ApiResult};
use crate::rate_limit::IdentityClass;
use crate::AppContext;

#[derive(Deserialize)]
pub struct CreateProjectRequest {
    pub name: String,
    pub description: Option<String>,
}

pub async fn create_project(
    State(ctx): State<Arc<AppContext>>,
    Extension(identity): Extension<Identity>,
    Json(body): Json<CreateProjectRequest>,
) -> ApiResult<Json<serde_json::Value>> {
    ctx.rate_limiter
        .check(&ctx.control, &identity.rate_limit_identity(), IdentityClass::Other)
        .await?;
    if body.name.trim().is_empty() {
        return Err(ApiError::validation("project name must not be empty"));
    }
    let project = ctx
        .control
        .create_project(&body.name, body.description.as_deref(), &identity.user.id)
        .await?;
    Ok(ok_envelope(project))
}

pub async fn list_projects(
    State(ctx): State<Arc<AppContext>>,
    Extension(identity): Extension<Identity>,
) -> ApiResult<Json<serde_json::Value>> {
    ctx.rate_limiter
        .check(&ctx.control, &identity.rate_limit_identity(), IdentityClass::Other)
        .await?;
    let projects = ctx.control.list_projects_for_user(&identity.user.id).await?;
    Ok(ok_envelope(json!({ "data": projects })))
}

pub async fn get_project(
    State(ctx): State<Arc<AppContext>>,
    Extension(identity): Extension<Identity>,
    Path(project_id): Path<String>,
) -> ApiResult<Json<serde_json::Value>> {
    ctx.rate_limiter
        .check(&ctx.control, &identity.rate_limit_identity(), IdentityClass::Other)
        .await?;
    auth::require_project_role(&ctx.control, &identity, &project_id, Role::Reader).await?;
    let project = ctx
        .control
        .get_project(&project_id)
        .await?
        .ok_or_else(|| ApiError::not_found("project not found"))?;
    Ok(ok_envelope(project))
}

#[derive(Deserialize)]
pub struct UpdateProjectRequest {
    pub name: Option<String>,
    pub description: Option<String>,
}

pub async fn update_project(
    State(ctx): State<Arc<AppContext>>,
    Extension(identity): Extension<Identity>,
    Path(project_id): Path<String>,
    Json(body): Json<UpdateProjectRequest>,
) -> ApiResult<Json<serde_json::Value>> {
    ctx.rate_limiter
        .check(&ctx.control, &identity.rate_limit_identity(), IdentityClass::Other)
        .await?;
    auth::require_project_role(&ctx.control, &identity, &project_id, Role::Writer).await?;
    ctx.control
        .update_project(&project_id, body.name.as_deref(), body.description.as_deref())
        .await?;
    let project = ctx
        .control
        .get_project(&project_id)
        .await?
        .ok_or_else(|| ApiError::not_found("project not found"))?;
    Ok(ok_envelope(project))
}

pub async fn delete_project(
    State(ctx): State<Arc<AppContext>>,
    Extension(identity): Extension<Identity>,
    Path(project_id): Path<String>,
) -> ApiResult<Json<serde_json::Value>> {
    ctx.rate_limiter
        .check(&ctx.control, &identity.rate_limit_identity(), IdentityClass::Other)
        .await?;
    auth::require_project_role(&ctx.control, &identity, &project_id, Role::Owner).await?;
    ctx.control.soft_delete_project(&project_id).await?;
    Ok(ok_envelope(json!({ "deleted": true })))
}

#[derive(Deserialize)]
pub struct AddMemberRequest {
    pub user_id: String,
    pub role: Role,
}

pub async fn add_member(
    State(ctx): State<Arc<AppContext>>,
    Extension(identity): Extension<Identity>,
    Path(project_id): Path<String>,
    Json(body): Json<AddMemberRequest>,
) -> ApiResult<Json<serde_json::Value>> {
    ctx.rate_limiter
        .check(&ctx.control, &identity.rate_limit_identity(), IdentityClass::Other)
        .await?;
    auth::require_project_role(&ctx.control, &identity, &project_id, Role::Owner).await?;
    let membership = match ctx
        .control
        .add_member(&project_id, &body.user_id, body.role, &identity.user.id)
        .await
    {
        Ok(m) => m,
        Err(e) if e.to_string().contains("duplicate") => {
            return Err(ApiError::conflict("user is already a member of this project"))
        }
        Err(e) => return Err(ApiError::from(e)),
    };
    Ok(ok_envelope(membership))
}

pub async fn get_member(
    State(ctx): State<Arc<AppContext>>,
    Extension(identity): Extension<Identity>,
    Path((project_id, user_id)): Path<(String, String)>,
) -> ApiResult<Json<serde_json::Value>> {
    ctx.rate_limiter
        .check(&ctx.control, &identity.rate_limit_identity(), IdentityClass::Other)
        .await?;
    auth::require_project_role(&ctx.control, &identity, &project_id, Role::Reader).await?;
    let membership = ctx
        .control
        .get_membership(&project_id, &user_id)
        .await?
        .ok_or_else(|| ApiError::not_found("membership not found"))?;
    Ok(ok_envelope(membership))
}

#[derive(Deserialize)]
pub struct UpdateMemberRequest {
    pub role: Role,
}

pub async fn update_member(
    State(ctx): State<Arc<AppContext>>,
    Extension(identity): Extension<Identity>,
    Path((project_id, user_id)): Path<(String, String)>,
    Json(body): Json<UpdateMemberRequest>,
) -> ApiResult<Json<serde_json::Value>> {
    ctx.rate_limiter
        .check(&ctx.control, &identity.rate_limit_identity(), IdentityClass::Other)
        .await?;
    auth::require_project_role(&ctx.control, &identity, &project_id, Role::Owner).await?;
    match ctx.control.update_member_role(&project_id, &user_id, body.role).await {
        Ok(()) => {}
        Err(e) if e.to_string().contains("last owner") => {
            return Err(ApiError::conflict("cannot demote the last owner"))
        }
        Err(e) => return Err(ApiError::from(e)),
    }
    let membership = ctx
        .control
        .get_membership(&project_id, &user_id)
        .await?
        .ok_or_else(|| ApiError::not_found("membership not found"))?;
    Ok(ok_envelope(membership))
}

pub async fn remove_member(
    State(ctx): State<Arc<AppContext>>,
    Extension(identity): Extension<Identity>,
    Path((project_id, user_id)): Path<(String, String)>,
) -> ApiResult<Json<serde_json::Value>> {
    ctx.rate_limiter
        .check(&ctx.control, &identity.rate_limit_identity(), IdentityClass::Other)
        .await?;
    auth::require_project_role(&ctx.control, &identity, &project_id, Role::Owner).await?;
    match ctx.control.remove_member(&project_id, &user_id).await {
        Ok(()) => {}
        Err(e) if e.to_string().contains("last owner") => {
            return Err(ApiError::conflict("cannot remove the last owner"))
        }
        Err(e) => return Err(ApiError::from(e)),
    }
    Ok(ok_envelope(json!({ "removed": true })))
}
