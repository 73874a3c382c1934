use axum::{
    Extension, Json,
    extract::{Path, Query, State},
};
use chrono::Utc;
use serde::Deserialize;
use serde_json::json;
use tracing::info;

use super::super::{ApiError, AppState};
use super::{parse_key_cursor, parse_limit, require_write};
use crate::core::model::{TenantContext, project::slugify};
use crate::core::query::AgentQuery;

#[derive(Debug, Deserialize)]
pub struct ProjectNameRequest {
    name: String,
}

fn checked_name(raw: &str) -> Result<&str, ApiError> {
    let name = raw.trim();
    if slugify(name).is_empty() {
        return Err(ApiError::invalid(
            "project name must contain at least one letter or digit",
        ));
    }
    Ok(name)
}

pub async fn list_projects(
    State(state): State<AppState>,
    Extension(ctx): Extension<TenantContext>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let projects = state.store.list_projects(&ctx.tenant_id).await?;
    Ok(Json(json!({ "projects": projects })))
}

pub async fn create_project(
    State(state): State<AppState>,
    Extension(ctx): Extension<TenantContext>,
    Json(payload): Json<ProjectNameRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    require_write(&ctx)?;
    let name = checked_name(&payload.name)?;
    let project = state
        .store
        .create_project(&ctx.tenant_id, name)
        .await?
        .ok_or_else(|| ApiError::Conflict(format!("project '{}' already exists", slugify(name))))?;
    info!("Tenant {} created project {}", ctx.tenant_id, project.project_id);
    Ok(Json(json!({ "project": project })))
}

pub async fn rename_project(
    State(state): State<AppState>,
    Extension(ctx): Extension<TenantContext>,
    Path(project_id): Path<String>,
    Json(payload): Json<ProjectNameRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    require_write(&ctx)?;
    let name = checked_name(&payload.name)?;
    let project = state
        .store
        .rename_project(&ctx.tenant_id, &project_id, name)
        .await?
        .ok_or_else(|| ApiError::not_found(format!("project '{}'", project_id)))?;
    Ok(Json(json!({ "project": project })))
}

pub async fn delete_project(
    State(state): State<AppState>,
    Extension(ctx): Extension<TenantContext>,
    Path(project_id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    require_write(&ctx)?;
    let project = state
        .store
        .get_project(&ctx.tenant_id, &project_id)
        .await?
        .ok_or_else(|| ApiError::not_found(format!("project '{}'", project_id)))?;
    if project.is_default {
        return Err(ApiError::Conflict(
            "the default project cannot be deleted".to_string(),
        ));
    }
    state.store.delete_project(&ctx.tenant_id, &project_id).await?;
    info!("Tenant {} deleted project {}", ctx.tenant_id, project_id);
    Ok(Json(json!({ "deleted": project_id })))
}

#[derive(Debug, Default, Deserialize)]
pub struct ProjectAgentParams {
    cursor: Option<String>,
    limit: Option<String>,
}

pub async fn list_project_agents(
    State(state): State<AppState>,
    Extension(ctx): Extension<TenantContext>,
    Path(project_id): Path<String>,
    Query(params): Query<ProjectAgentParams>,
) -> Result<Json<serde_json::Value>, ApiError> {
    if state
        .store
        .get_project(&ctx.tenant_id, &project_id)
        .await?
        .is_none()
    {
        return Err(ApiError::not_found(format!("project '{}'", project_id)));
    }
    let query = AgentQuery {
        project_id: Some(project_id),
        environment: ctx.forced_environment().map(str::to_string),
        status: None,
        limit: parse_limit(params.limit.as_deref())?,
    };
    let cursor = parse_key_cursor(params.cursor.as_deref())?;
    let page = state
        .queries
        .list_agents(&ctx.tenant_id, &query, cursor.as_ref(), Utc::now())
        .await?;
    Ok(Json(json!({
        "agents": page.agents,
        "next_cursor": page.next_cursor,
    })))
}
