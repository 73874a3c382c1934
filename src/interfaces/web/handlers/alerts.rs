use axum::{
    Extension, Json,
    extract::{Path, Query, State},
};
use serde::Deserialize;
use serde_json::json;
use tracing::info;

use super::super::{ApiError, AppState};
use super::{parse_cursor, parse_limit, require_rule_write};
use crate::core::model::{AlertAction, AlertRuleDraft, TenantContext};

fn validate_draft(draft: &AlertRuleDraft) -> Result<(), ApiError> {
    if draft.name.trim().is_empty() {
        return Err(ApiError::invalid("rule name is required"));
    }
    draft.condition.validate().map_err(ApiError::InvalidParameter)?;
    if draft.cooldown_seconds.is_some_and(|c| c < 0) {
        return Err(ApiError::invalid("cooldown_seconds must not be negative"));
    }
    for action in &draft.actions {
        if let AlertAction::Webhook { url, .. } = action
            && !(url.starts_with("http://") || url.starts_with("https://"))
        {
            return Err(ApiError::invalid(format!(
                "webhook url '{}' must be http or https",
                url
            )));
        }
    }
    Ok(())
}

/// Rule bodies are parsed by hand so schema errors use the API error shape.
fn parse_draft(body: serde_json::Value) -> Result<AlertRuleDraft, ApiError> {
    let draft: AlertRuleDraft = serde_json::from_value(body)
        .map_err(|e| ApiError::invalid(format!("invalid alert rule: {}", e)))?;
    validate_draft(&draft)?;
    Ok(draft)
}

pub async fn list_rules(
    State(state): State<AppState>,
    Extension(ctx): Extension<TenantContext>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let rules = state.store.list_rules(&ctx.tenant_id).await?;
    Ok(Json(json!({ "rules": rules })))
}

pub async fn create_rule(
    State(state): State<AppState>,
    Extension(ctx): Extension<TenantContext>,
    Json(body): Json<serde_json::Value>,
) -> Result<Json<serde_json::Value>, ApiError> {
    require_rule_write(&ctx)?;
    let draft = parse_draft(body)?;
    let rule = state.store.create_rule(&ctx.tenant_id, draft).await?;
    info!(
        "Tenant {} created alert rule {} ({})",
        ctx.tenant_id,
        rule.rule_id,
        rule.condition.type_name()
    );
    Ok(Json(json!({ "rule": rule })))
}

pub async fn get_rule(
    State(state): State<AppState>,
    Extension(ctx): Extension<TenantContext>,
    Path(rule_id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let rule = state
        .store
        .get_rule(&ctx.tenant_id, &rule_id)
        .await?
        .ok_or_else(|| ApiError::not_found(format!("alert rule '{}'", rule_id)))?;
    Ok(Json(json!({ "rule": rule })))
}

pub async fn replace_rule(
    State(state): State<AppState>,
    Extension(ctx): Extension<TenantContext>,
    Path(rule_id): Path<String>,
    Json(body): Json<serde_json::Value>,
) -> Result<Json<serde_json::Value>, ApiError> {
    require_rule_write(&ctx)?;
    let draft = parse_draft(body)?;
    let rule = state
        .store
        .replace_rule(&ctx.tenant_id, &rule_id, draft)
        .await?
        .ok_or_else(|| ApiError::not_found(format!("alert rule '{}'", rule_id)))?;
    Ok(Json(json!({ "rule": rule })))
}

pub async fn delete_rule(
    State(state): State<AppState>,
    Extension(ctx): Extension<TenantContext>,
    Path(rule_id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    require_rule_write(&ctx)?;
    if !state.store.delete_rule(&ctx.tenant_id, &rule_id).await? {
        return Err(ApiError::not_found(format!("alert rule '{}'", rule_id)));
    }
    Ok(Json(json!({ "deleted": rule_id })))
}

#[derive(Debug, Default, Deserialize)]
pub struct HistoryParams {
    rule_id: Option<String>,
    cursor: Option<String>,
    limit: Option<String>,
}

pub async fn list_history(
    State(state): State<AppState>,
    Extension(ctx): Extension<TenantContext>,
    Query(params): Query<HistoryParams>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let cursor = parse_cursor(params.cursor.as_deref())?;
    let limit = parse_limit(params.limit.as_deref())?;
    let page = state
        .store
        .list_firings(
            &ctx.tenant_id,
            params.rule_id.as_deref().filter(|r| !r.is_empty()),
            ctx.forced_environment(),
            cursor,
            limit,
        )
        .await?;
    Ok(Json(json!({
        "firings": page.firings,
        "next_cursor": page.next_cursor,
    })))
}
