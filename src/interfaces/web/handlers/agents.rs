use axum::{
    Extension, Json,
    extract::{Path, Query, State},
};
use chrono::Utc;
use serde::Deserialize;
use serde_json::json;

use super::super::{ApiError, AppState};
use super::{parse_key_cursor, parse_limit, scoped_environment};
use crate::core::model::{AgentStatus, TenantContext};
use crate::core::query::AgentQuery;

#[derive(Debug, Default, Deserialize)]
pub struct AgentListParams {
    project_id: Option<String>,
    environment: Option<String>,
    status: Option<String>,
    cursor: Option<String>,
    limit: Option<String>,
}

pub async fn list_agents(
    State(state): State<AppState>,
    Extension(ctx): Extension<TenantContext>,
    Query(params): Query<AgentListParams>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let status = match params.status.as_deref() {
        None | Some("") => None,
        Some(raw) => Some(
            AgentStatus::parse(raw).ok_or_else(|| ApiError::invalid(format!("unknown status '{}'", raw)))?,
        ),
    };
    let query = AgentQuery {
        project_id: params.project_id.filter(|p| !p.is_empty()),
        environment: scoped_environment(&ctx, params.environment),
        status,
        limit: parse_limit(params.limit.as_deref())?,
    };
    let cursor = parse_key_cursor(params.cursor.as_deref())?;
    let page = state
        .queries
        .list_agents(&ctx.tenant_id, &query, cursor.as_ref(), Utc::now())
        .await?;
    Ok(Json(json!({
        "agents": page.agents,
        "count": page.agents.len(),
        "next_cursor": page.next_cursor,
    })))
}

pub async fn get_agent(
    State(state): State<AppState>,
    Extension(ctx): Extension<TenantContext>,
    Path(agent_id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let detail = state
        .queries
        .agent_detail(&ctx.tenant_id, &agent_id, ctx.forced_environment(), Utc::now())
        .await?
        .ok_or_else(|| ApiError::not_found(format!("agent '{}'", agent_id)))?;
    Ok(Json(json!({ "agent": detail })))
}

pub async fn get_pipeline(
    State(state): State<AppState>,
    Extension(ctx): Extension<TenantContext>,
    Path(agent_id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let environment = ctx.forced_environment();
    let profile = state
        .store
        .get_profile(&ctx.tenant_id, &agent_id, environment)
        .await?
        .ok_or_else(|| ApiError::not_found(format!("agent '{}'", agent_id)))?;

    let pipeline = state
        .queries
        .pipeline(&ctx.tenant_id, &profile.agent_id, environment)
        .await?;
    Ok(Json(json!({ "pipeline": pipeline })))
}
