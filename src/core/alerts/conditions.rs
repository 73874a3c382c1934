//! Threshold checks for each alert condition. A check returns one finding
//! per environment in which the condition holds.

use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use serde_json::{Value, json};
use std::collections::BTreeMap;

use crate::core::model::payload::{KIND_LLM_CALL, LlmCall};
use crate::core::model::{AlertCondition, AlertRule, Event, EventType};
use crate::core::store::{EventFilter, EventStore};

/// What prompted an evaluation.
#[derive(Debug, Clone, Copy)]
pub enum Trigger<'a> {
    /// Events just stored for the rule's tenant.
    Ingest(&'a [Event]),
    /// Periodic sweep for conditions that change with time alone.
    Sweep,
}

/// A condition that holds, with the snapshot to record and the environment
/// whose data tripped it.
#[derive(Debug, Clone, PartialEq)]
pub struct Finding {
    pub snapshot: Value,
    pub environment: Option<String>,
}

fn in_scope(rule: &AlertRule, event: &Event) -> bool {
    match &rule.project_id {
        Some(p) => event.project_id.as_deref() == Some(p.as_str()),
        None => true,
    }
}

fn window_filter(
    rule: &AlertRule,
    environment: Option<&str>,
    now: DateTime<Utc>,
    window_seconds: i64,
) -> EventFilter {
    EventFilter {
        project_id: rule.project_id.clone(),
        environment: environment.map(str::to_string),
        since_ms: Some((now - Duration::seconds(window_seconds)).timestamp_millis()),
        ..Default::default()
    }
}

pub async fn check(
    store: &EventStore,
    rule: &AlertRule,
    trigger: Trigger<'_>,
    now: DateTime<Utc>,
) -> Result<Vec<Finding>> {
    let tenant = rule.tenant_id.as_str();
    // An ingest batch carries one envelope, so one environment.
    let batch_env = match trigger {
        Trigger::Ingest(events) => events.first().map(|e| e.environment.clone()),
        Trigger::Sweep => None,
    };
    let env = batch_env.as_deref();
    let findings: Vec<(Value, Option<String>)> = match (&rule.condition, trigger) {
        (
            AlertCondition::TaskFailureCount {
                count,
                window_seconds,
            },
            Trigger::Ingest(events),
        ) => {
            if !events
                .iter()
                .any(|e| e.event_type == EventType::TaskFailed && in_scope(rule, e))
            {
                return Ok(Vec::new());
            }
            let filter = EventFilter {
                event_types: vec![EventType::TaskFailed],
                ..window_filter(rule, env, now, *window_seconds)
            };
            let observed = store.count_events(tenant, &filter).await?;
            (observed >= *count)
                .then(|| {
                    json!({
                        "failures": observed,
                        "count": count,
                        "window_seconds": window_seconds,
                    })
                })
                .map(|s| (s, batch_env.clone()))
                .into_iter()
                .collect()
        }

        (
            AlertCondition::ErrorRate {
                threshold_percent,
                window_seconds,
                min_tasks,
            },
            Trigger::Ingest(events),
        ) => {
            if !events.iter().any(|e| {
                matches!(e.event_type, EventType::TaskCompleted | EventType::TaskFailed)
                    && in_scope(rule, e)
            }) {
                return Ok(Vec::new());
            }
            let failed = store
                .count_events(
                    tenant,
                    &EventFilter {
                        event_types: vec![EventType::TaskFailed],
                        ..window_filter(rule, env, now, *window_seconds)
                    },
                )
                .await?;
            let completed = store
                .count_events(
                    tenant,
                    &EventFilter {
                        event_types: vec![EventType::TaskCompleted],
                        ..window_filter(rule, env, now, *window_seconds)
                    },
                )
                .await?;
            let total = failed + completed;
            if total < *min_tasks || total == 0 {
                return Ok(Vec::new());
            }
            let rate = failed as f64 * 100.0 / total as f64;
            (rate >= *threshold_percent)
                .then(|| {
                    json!({
                        "error_rate_percent": rate,
                        "failed": failed,
                        "total": total,
                        "threshold_percent": threshold_percent,
                        "window_seconds": window_seconds,
                    })
                })
                .map(|s| (s, batch_env.clone()))
                .into_iter()
                .collect()
        }

        (AlertCondition::DurationExceeded { threshold_ms }, Trigger::Ingest(events)) => events
            .iter()
            .filter(|e| in_scope(rule, e))
            .find(|e| e.duration_ms.is_some_and(|d| d > *threshold_ms))
            .map(|e| {
                json!({
                    "event_id": e.event_id,
                    "agent_id": e.agent_id,
                    "task_id": e.task_id,
                    "event_type": e.event_type,
                    "duration_ms": e.duration_ms,
                    "threshold_ms": threshold_ms,
                })
            })
            .map(|s| (s, batch_env.clone()))
            .into_iter()
            .collect(),

        (
            AlertCondition::CostThreshold {
                threshold_usd,
                window_seconds,
                agent_id,
            },
            Trigger::Ingest(events),
        ) => {
            let relevant = events.iter().any(|e| {
                e.payload_kind() == Some(KIND_LLM_CALL)
                    && in_scope(rule, e)
                    && agent_id.as_ref().is_none_or(|a| *a == e.agent_id)
            });
            if !relevant {
                return Ok(Vec::new());
            }
            let filter = EventFilter {
                payload_kind: Some(KIND_LLM_CALL.to_string()),
                agent_id: agent_id.clone(),
                ..window_filter(rule, env, now, *window_seconds)
            };
            let spent: f64 = store
                .scan_events(tenant, &filter)
                .await?
                .iter()
                .filter_map(|e| e.payload.as_ref())
                .filter_map(|p| LlmCall::lenient(&p.data).cost)
                .sum();
            (spent >= *threshold_usd)
                .then(|| {
                    json!({
                        "cost_usd": spent,
                        "threshold_usd": threshold_usd,
                        "window_seconds": window_seconds,
                        "agent_id": agent_id,
                    })
                })
                .map(|s| (s, batch_env.clone()))
                .into_iter()
                .collect()
        }

        (AlertCondition::AgentStuck { threshold_seconds }, Trigger::Sweep) => {
            let mut stuck: BTreeMap<String, Vec<Value>> = BTreeMap::new();
            for p in store
                .list_profiles(tenant, None, rule.project_id.as_deref())
                .await?
                .into_iter()
                .filter(|p| p.heartbeat_age_seconds(now) > *threshold_seconds)
            {
                stuck.entry(p.environment.clone()).or_default().push(json!({
                    "agent_id": p.agent_id,
                    "seconds_since_heartbeat": p.heartbeat_age_seconds(now),
                }));
            }
            stuck
                .into_iter()
                .map(|(environment, agents)| {
                    (
                        json!({
                            "agents": agents,
                            "threshold_seconds": threshold_seconds,
                        }),
                        Some(environment),
                    )
                })
                .collect()
        }

        (
            AlertCondition::HeartbeatLost {
                agent_id,
                threshold_seconds,
            },
            Trigger::Sweep,
        ) => store
            .get_profile(tenant, agent_id, None)
            .await?
            .filter(|p| p.heartbeat_age_seconds(now) > *threshold_seconds)
            .map(|p| {
                let snapshot = json!({
                    "agent_id": p.agent_id,
                    "last_heartbeat_at": p.liveness_at(),
                    "seconds_since_heartbeat": p.heartbeat_age_seconds(now),
                    "threshold_seconds": threshold_seconds,
                });
                (snapshot, Some(p.environment))
            })
            .into_iter()
            .collect(),

        _ => Vec::new(),
    };

    Ok(findings
        .into_iter()
        .map(|(mut snapshot, environment)| {
            if let Value::Object(map) = &mut snapshot {
                map.insert("type".to_string(), json!(rule.condition.type_name()));
                map.insert("evaluated_at".to_string(), json!(now));
            }
            Finding {
                snapshot,
                environment,
            }
        })
        .collect())
}
