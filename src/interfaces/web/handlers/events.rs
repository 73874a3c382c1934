use axum::{
    Extension, Json,
    extract::{Query, State},
};
use serde::Deserialize;
use serde_json::json;

use super::super::{ApiError, AppState};
use super::{parse_cursor, parse_limit, parse_time, scoped_environment};
use crate::core::model::{EventType, Severity, TenantContext};
use crate::core::store::EventFilter;

#[derive(Debug, Default, Deserialize)]
pub struct EventListParams {
    project_id: Option<String>,
    agent_id: Option<String>,
    task_id: Option<String>,
    environment: Option<String>,
    /// Comma-separated list.
    event_type: Option<String>,
    min_severity: Option<String>,
    payload_kind: Option<String>,
    since: Option<String>,
    until: Option<String>,
    cursor: Option<String>,
    limit: Option<String>,
}

fn parse_event_types(raw: Option<&str>) -> Result<Vec<EventType>, ApiError> {
    let Some(raw) = raw else {
        return Ok(Vec::new());
    };
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| {
            EventType::parse(s).ok_or_else(|| ApiError::invalid(format!("unknown event_type '{}'", s)))
        })
        .collect()
}

pub async fn list_events(
    State(state): State<AppState>,
    Extension(ctx): Extension<TenantContext>,
    Query(params): Query<EventListParams>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let min_severity = match params.min_severity.as_deref() {
        None | Some("") => None,
        Some(raw) => Some(
            Severity::parse(raw)
                .ok_or_else(|| ApiError::invalid(format!("unknown min_severity '{}'", raw)))?,
        ),
    };
    let since = params.since.as_deref().map(|r| parse_time("since", r)).transpose()?;
    let until = params.until.as_deref().map(|r| parse_time("until", r)).transpose()?;
    if let (Some(s), Some(u)) = (since, until)
        && s > u
    {
        return Err(ApiError::invalid("since must not be after until"));
    }

    let filter = EventFilter {
        project_id: params.project_id.filter(|v| !v.is_empty()),
        agent_id: params.agent_id.filter(|v| !v.is_empty()),
        task_id: params.task_id.filter(|v| !v.is_empty()),
        environment: scoped_environment(&ctx, params.environment),
        payload_kind: params.payload_kind.filter(|v| !v.is_empty()),
        event_types: parse_event_types(params.event_type.as_deref())?,
        min_severity,
        since_ms: since.map(|t| t.timestamp_millis()),
        until_ms: until.map(|t| t.timestamp_millis()),
        ..Default::default()
    };
    let cursor = parse_cursor(params.cursor.as_deref())?;
    let limit = parse_limit(params.limit.as_deref())?;

    let page = state
        .store
        .query_events(&ctx.tenant_id, &filter, cursor, limit)
        .await?;
    Ok(Json(json!({
        "events": page.events,
        "next_cursor": page.next_cursor,
    })))
}
