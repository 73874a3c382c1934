use axum::{
    Extension, Json,
    extract::{Query, State},
};
use chrono::Utc;
use serde::Deserialize;
use serde_json::json;

use super::super::{ApiError, AppState};
use super::{parse_range, scoped_environment};
use crate::core::model::TenantContext;
use crate::core::query::{CostGrouping, Scope};

#[derive(Debug, Default, Deserialize)]
pub struct WindowParams {
    range: Option<String>,
    project_id: Option<String>,
    agent_id: Option<String>,
    environment: Option<String>,
    group_by: Option<String>,
}

impl WindowParams {
    fn scope(&self, ctx: &TenantContext) -> Scope {
        Scope {
            project_id: self.project_id.clone().filter(|v| !v.is_empty()),
            agent_id: self.agent_id.clone().filter(|v| !v.is_empty()),
            environment: scoped_environment(ctx, self.environment.clone()),
        }
    }
}

pub async fn get_metrics(
    State(state): State<AppState>,
    Extension(ctx): Extension<TenantContext>,
    Query(params): Query<WindowParams>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let range = parse_range(params.range.as_deref())?;
    let report = state
        .queries
        .metrics(&ctx.tenant_id, &params.scope(&ctx), range, Utc::now())
        .await?;
    Ok(Json(json!({ "range": range, "metrics": report })))
}

pub async fn get_cost(
    State(state): State<AppState>,
    Extension(ctx): Extension<TenantContext>,
    Query(params): Query<WindowParams>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let range = parse_range(params.range.as_deref())?;
    let group_by = match params.group_by.as_deref() {
        None | Some("") => CostGrouping::default(),
        Some(raw) => CostGrouping::parse(raw)
            .ok_or_else(|| ApiError::invalid("group_by must be one of agent, model, agent_model"))?,
    };
    let report = state
        .queries
        .cost(&ctx.tenant_id, &params.scope(&ctx), range, group_by, Utc::now())
        .await?;
    Ok(Json(json!({ "range": range, "cost": report })))
}

pub async fn get_cost_timeseries(
    State(state): State<AppState>,
    Extension(ctx): Extension<TenantContext>,
    Query(params): Query<WindowParams>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let range = parse_range(params.range.as_deref())?;
    let (interval_seconds, points) = state
        .queries
        .cost_timeseries(&ctx.tenant_id, &params.scope(&ctx), range, Utc::now())
        .await?;
    Ok(Json(json!({
        "range": range,
        "interval_seconds": interval_seconds,
        "timeseries": points,
    })))
}
