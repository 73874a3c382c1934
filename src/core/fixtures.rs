//! Builders shared by unit tests across the core modules.

use chrono::{DateTime, Duration, TimeZone, Utc};
use serde_json::{Value, json};

use crate::core::model::payload::KIND_LLM_CALL;
use crate::core::model::{AgentProfile, Event, EventType, Payload};

pub const TENANT: &str = "tenant-a";

/// Fixed origin so tests never depend on the wall clock.
pub fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 3, 1, 12, 0, 0).unwrap()
}

pub fn at(secs: i64) -> DateTime<Utc> {
    t0() + Duration::seconds(secs)
}

pub fn event(agent_id: &str, event_id: &str, event_type: EventType, secs: i64) -> Event {
    Event {
        seq: 0,
        event_id: event_id.to_string(),
        tenant_id: TENANT.to_string(),
        agent_id: agent_id.to_string(),
        environment: "production".to_string(),
        group: None,
        project_id: None,
        task_id: None,
        task_type: None,
        task_run_id: None,
        action_id: None,
        parent_action_id: None,
        event_type,
        severity: event_type.default_severity(),
        status: None,
        duration_ms: None,
        parent_event_id: None,
        payload: None,
        timestamp: at(secs),
        received_at: at(secs),
        agent_meta: None,
    }
}

pub fn task_event(
    agent_id: &str,
    task_id: &str,
    event_id: &str,
    event_type: EventType,
    secs: i64,
) -> Event {
    let mut e = event(agent_id, event_id, event_type, secs);
    e.task_id = Some(task_id.to_string());
    e
}

pub fn with_payload(mut e: Event, kind: &str, data: Value) -> Event {
    e.payload = Some(Payload {
        kind: Some(kind.to_string()),
        summary: None,
        data,
        tags: vec![],
    });
    e
}

pub fn llm_call(
    agent_id: &str,
    event_id: &str,
    secs: i64,
    model: &str,
    tokens_in: i64,
    tokens_out: i64,
    cost: f64,
) -> Event {
    with_payload(
        event(agent_id, event_id, EventType::Custom, secs),
        KIND_LLM_CALL,
        json!({"model": model, "tokens_in": tokens_in, "tokens_out": tokens_out, "cost": cost}),
    )
}

/// A live profile last seen (and heartbeating) at `t0`.
pub fn profile(agent_id: &str) -> AgentProfile {
    AgentProfile {
        tenant_id: TENANT.to_string(),
        agent_id: agent_id.to_string(),
        agent_type: None,
        agent_version: None,
        framework: None,
        runtime: None,
        sdk_version: None,
        environment: "production".to_string(),
        group: None,
        first_seen_at: at(0),
        last_seen_at: at(0),
        last_heartbeat_at: Some(at(0)),
        last_event_type: None,
        last_event_at: None,
        last_task_id: None,
        last_project_id: None,
        stuck_threshold_seconds: 300,
    }
}
