//! Per-event validation. Every check produces a machine-readable code so
//! producers can tell exactly which events were dropped and why.

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;

use crate::core::model::{AgentMeta, Event, EventType, IncomingEvent, Payload, Severity};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectCode {
    MissingField,
    InvalidEventType,
    InvalidSeverity,
    InvalidTimestamp,
    PayloadTooLarge,
    MalformedEvent,
}

impl RejectCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            RejectCode::MissingField => "missing_field",
            RejectCode::InvalidEventType => "invalid_event_type",
            RejectCode::InvalidSeverity => "invalid_severity",
            RejectCode::InvalidTimestamp => "invalid_timestamp",
            RejectCode::PayloadTooLarge => "payload_too_large",
            RejectCode::MalformedEvent => "malformed_event",
        }
    }
}

pub const WARNING_PAYLOAD_SHAPE: &str = "payload_shape";

/// A rejected event or an advisory warning about a stored one.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct EventIssue {
    pub event_id: Option<String>,
    pub code: String,
    pub message: String,
}

impl EventIssue {
    fn reject(event_id: Option<&str>, code: RejectCode, message: impl Into<String>) -> Self {
        Self {
            event_id: event_id.map(str::to_string),
            code: code.as_str().to_string(),
            message: message.into(),
        }
    }
}

/// Batch-level values stamped onto every event.
#[derive(Debug, Clone)]
pub struct Stamp {
    pub tenant_id: String,
    pub agent_id: String,
    pub environment: String,
    pub group: Option<String>,
    pub agent_meta: Option<AgentMeta>,
    pub received_at: DateTime<Utc>,
}

/// A validated event plus an optional advisory warning.
#[derive(Debug)]
pub struct Validated {
    pub event: Event,
    pub warning: Option<EventIssue>,
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

fn parse_timestamp(raw: &Value) -> Option<DateTime<Utc>> {
    match raw {
        Value::String(s) => DateTime::parse_from_rfc3339(s)
            .ok()
            .map(|t| t.with_timezone(&Utc)),
        Value::Number(n) => n.as_i64().and_then(DateTime::<Utc>::from_timestamp_millis),
        _ => None,
    }
}

pub fn validate_event(raw: Value, stamp: &Stamp, max_payload_bytes: usize) -> Result<Validated, EventIssue> {
    let raw_id = raw
        .get("event_id")
        .and_then(Value::as_str)
        .map(str::to_string);
    if !raw.is_object() {
        return Err(EventIssue::reject(None, RejectCode::MalformedEvent, "event must be a JSON object"));
    }
    let incoming: IncomingEvent = serde_json::from_value(raw).map_err(|e| {
        EventIssue::reject(raw_id.as_deref(), RejectCode::MalformedEvent, e.to_string())
    })?;

    let Some(event_id) = non_empty(incoming.event_id) else {
        return Err(EventIssue::reject(None, RejectCode::MissingField, "event_id is required"));
    };
    let id = Some(event_id.as_str());

    let agent_id = non_empty(incoming.agent_id).unwrap_or_else(|| stamp.agent_id.clone());
    if agent_id.trim().is_empty() {
        return Err(EventIssue::reject(id, RejectCode::MissingField, "agent_id is required"));
    }

    let Some(type_name) = non_empty(incoming.event_type) else {
        return Err(EventIssue::reject(id, RejectCode::MissingField, "event_type is required"));
    };
    let Some(event_type) = EventType::parse(&type_name) else {
        return Err(EventIssue::reject(
            id,
            RejectCode::InvalidEventType,
            format!("unknown event_type '{}'", type_name),
        ));
    };

    let Some(raw_ts) = incoming.timestamp.filter(|v| !v.is_null()) else {
        return Err(EventIssue::reject(id, RejectCode::MissingField, "timestamp is required"));
    };
    let Some(timestamp) = parse_timestamp(&raw_ts) else {
        return Err(EventIssue::reject(
            id,
            RejectCode::InvalidTimestamp,
            format!("timestamp {} is neither RFC 3339 nor epoch milliseconds", raw_ts),
        ));
    };

    let severity = match non_empty(incoming.severity) {
        Some(s) => Severity::parse(&s).ok_or_else(|| {
            EventIssue::reject(id, RejectCode::InvalidSeverity, format!("unknown severity '{}'", s))
        })?,
        None => event_type.default_severity(),
    };

    let mut warning = None;
    let payload = match incoming.payload.filter(|p| !p.is_null()) {
        None => None,
        Some(value) => {
            let size = serde_json::to_vec(&value).map(|b| b.len()).unwrap_or(usize::MAX);
            if size > max_payload_bytes {
                return Err(EventIssue::reject(
                    id,
                    RejectCode::PayloadTooLarge,
                    format!("payload is {} bytes, limit is {}", size, max_payload_bytes),
                ));
            }
            let payload: Payload = serde_json::from_value(value).map_err(|e| {
                EventIssue::reject(id, RejectCode::MalformedEvent, format!("payload: {}", e))
            })?;
            if let Err(e) = payload.decode() {
                warning = Some(EventIssue {
                    event_id: Some(event_id.clone()),
                    code: WARNING_PAYLOAD_SHAPE.to_string(),
                    message: format!(
                        "payload does not match the '{}' shape: {}",
                        payload.kind.as_deref().unwrap_or_default(),
                        e
                    ),
                });
            }
            Some(payload)
        }
    };

    let event = Event {
        seq: 0,
        event_id,
        tenant_id: stamp.tenant_id.clone(),
        agent_id,
        environment: stamp.environment.clone(),
        group: stamp.group.clone(),
        project_id: non_empty(incoming.project_id),
        task_id: non_empty(incoming.task_id),
        task_type: incoming.task_type,
        task_run_id: non_empty(incoming.task_run_id),
        action_id: non_empty(incoming.action_id),
        parent_action_id: non_empty(incoming.parent_action_id),
        event_type,
        severity,
        status: incoming.status,
        duration_ms: incoming.duration_ms,
        parent_event_id: non_empty(incoming.parent_event_id),
        payload,
        timestamp,
        received_at: stamp.received_at,
        agent_meta: stamp.agent_meta.clone(),
    };
    Ok(Validated { event, warning })
}
