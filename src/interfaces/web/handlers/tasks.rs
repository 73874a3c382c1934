use axum::{
    Extension, Json,
    extract::{Path, Query, State},
};
use chrono::Utc;
use serde::Deserialize;
use serde_json::json;

use super::super::{ApiError, AppState};
use super::{parse_key_cursor, parse_limit, parse_time, scoped_environment};
use crate::core::model::{TaskStatus, TenantContext};
use crate::core::query::TaskQuery;

#[derive(Debug, Default, Deserialize)]
pub struct TaskListParams {
    project_id: Option<String>,
    agent_id: Option<String>,
    environment: Option<String>,
    status: Option<String>,
    since: Option<String>,
    cursor: Option<String>,
    limit: Option<String>,
}

pub async fn list_tasks(
    State(state): State<AppState>,
    Extension(ctx): Extension<TenantContext>,
    Query(params): Query<TaskListParams>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let status = match params.status.as_deref() {
        None | Some("") => None,
        Some(raw) => Some(
            TaskStatus::parse(raw).ok_or_else(|| ApiError::invalid(format!("unknown status '{}'", raw)))?,
        ),
    };
    let since = params
        .since
        .as_deref()
        .map(|raw| parse_time("since", raw))
        .transpose()?;

    let query = TaskQuery {
        project_id: params.project_id.filter(|p| !p.is_empty()),
        agent_id: params.agent_id.filter(|a| !a.is_empty()),
        environment: scoped_environment(&ctx, params.environment),
        status,
        since,
        limit: parse_limit(params.limit.as_deref())?,
    };
    let cursor = parse_key_cursor(params.cursor.as_deref())?;
    let page = state
        .queries
        .list_tasks(&ctx.tenant_id, &query, cursor.as_ref(), Utc::now())
        .await?;
    Ok(Json(json!({
        "tasks": page.tasks,
        "count": page.tasks.len(),
        "next_cursor": page.next_cursor,
    })))
}

pub async fn get_task(
    State(state): State<AppState>,
    Extension(ctx): Extension<TenantContext>,
    Path(task_id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let detail = state
        .queries
        .task_detail(&ctx.tenant_id, &task_id, ctx.forced_environment(), Utc::now())
        .await?
        .ok_or_else(|| ApiError::not_found(format!("task '{}'", task_id)))?;
    Ok(Json(json!({ "task": detail })))
}

pub async fn get_timeline(
    State(state): State<AppState>,
    Extension(ctx): Extension<TenantContext>,
    Path(task_id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let timeline = state
        .queries
        .timeline(&ctx.tenant_id, &task_id, ctx.forced_environment(), Utc::now())
        .await?
        .ok_or_else(|| ApiError::not_found(format!("task '{}'", task_id)))?;
    Ok(Json(json!({ "timeline": timeline })))
}
