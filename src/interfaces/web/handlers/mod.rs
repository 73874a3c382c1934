pub mod agents;
pub mod alerts;
pub mod events;
pub mod ingest;
pub mod metrics;
pub mod projects;
pub mod stream;
pub mod tasks;

use chrono::{DateTime, Utc};

use super::ApiError;
use crate::core::model::TenantContext;
use crate::core::query::TimeRange;
use crate::core::store::cursor::{Cursor, KeyCursor};

pub const DEFAULT_LIMIT: usize = 50;
pub const MAX_LIMIT: usize = 500;

/// Accepts RFC 3339 or integer epoch milliseconds.
pub fn parse_time(name: &str, raw: &str) -> Result<DateTime<Utc>, ApiError> {
    let raw = raw.trim();
    if let Ok(ms) = raw.parse::<i64>() {
        return DateTime::<Utc>::from_timestamp_millis(ms)
            .ok_or_else(|| ApiError::invalid(format!("{} is out of range", name)));
    }
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|_| ApiError::invalid(format!("{} must be RFC 3339 or epoch milliseconds", name)))
}

pub fn parse_limit(raw: Option<&str>) -> Result<usize, ApiError> {
    match raw {
        None => Ok(DEFAULT_LIMIT),
        Some(raw) => raw
            .trim()
            .parse::<usize>()
            .ok()
            .filter(|n| *n > 0)
            .map(|n| n.min(MAX_LIMIT))
            .ok_or_else(|| ApiError::invalid("limit must be a positive integer")),
    }
}

pub fn parse_cursor(raw: Option<&str>) -> Result<Option<Cursor>, ApiError> {
    match raw {
        None | Some("") => Ok(None),
        Some(raw) => Cursor::decode(raw).map(Some).ok_or(ApiError::InvalidCursor),
    }
}

pub fn parse_key_cursor(raw: Option<&str>) -> Result<Option<KeyCursor>, ApiError> {
    match raw {
        None | Some("") => Ok(None),
        Some(raw) => KeyCursor::decode(raw).map(Some).ok_or(ApiError::InvalidCursor),
    }
}

pub fn parse_range(raw: Option<&str>) -> Result<TimeRange, ApiError> {
    match raw {
        None => Ok(TimeRange::default()),
        Some(raw) => TimeRange::parse(raw)
            .ok_or_else(|| ApiError::invalid("range must be one of 1h, 6h, 24h, 7d, 30d")),
    }
}

/// Test keys only ever see the test environment, whatever they ask for.
pub fn scoped_environment(ctx: &TenantContext, requested: Option<String>) -> Option<String> {
    match ctx.forced_environment() {
        Some(env) => Some(env.to_string()),
        None => requested.filter(|e| !e.is_empty()),
    }
}

pub fn require_write(ctx: &TenantContext) -> Result<(), ApiError> {
    if ctx.access_level.can_write() {
        Ok(())
    } else {
        Err(ApiError::Forbidden(format!(
            "{} keys cannot modify data",
            ctx.access_level.as_str()
        )))
    }
}

/// Alert rules apply to every environment of the tenant, so keys confined
/// to one environment may read them but not change them.
pub fn require_rule_write(ctx: &TenantContext) -> Result<(), ApiError> {
    require_write(ctx)?;
    match ctx.forced_environment() {
        Some(env) => Err(ApiError::Forbidden(format!(
            "{} keys are confined to the '{}' environment and cannot change alert rules",
            ctx.access_level.as_str(),
            env
        ))),
        None => Ok(()),
    }
}
