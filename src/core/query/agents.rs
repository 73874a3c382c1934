use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;

use super::cost::aggregate_cost;
use super::metrics::build_metrics;
use super::{CostGrouping, QueryEngine, Scope};
use crate::core::derive::agent_status;
use crate::core::model::{AgentProfile, AgentStatus, Event, EventType};
use crate::core::model::payload::KIND_LLM_CALL;
use crate::core::store::cursor::KeyCursor;
use crate::core::store::{EventFilter, profile_cursor};

const RECENT_EVENTS: usize = 20;
/// Profiles inspected per page when a status filter is applied.
const STATUS_FILTER_SCAN: usize = 500;

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct AgentSummary {
    #[serde(flatten)]
    pub profile: AgentProfile,
    pub status: AgentStatus,
    pub heartbeat_age_seconds: i64,
}

impl AgentSummary {
    pub fn from_profile(profile: AgentProfile, now: DateTime<Utc>) -> Self {
        Self {
            status: agent_status(&profile, now),
            heartbeat_age_seconds: profile.heartbeat_age_seconds(now),
            profile,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct AgentStats {
    pub tasks_completed: u64,
    pub tasks_failed: u64,
    pub success_rate: f64,
    pub avg_duration_ms: Option<f64>,
    pub llm_calls: u64,
    pub cost: f64,
    pub tokens_in: i64,
    pub tokens_out: i64,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct AgentDetail {
    #[serde(flatten)]
    pub summary: AgentSummary,
    pub projects: Vec<String>,
    pub stats_24h: AgentStats,
    pub recent_events: Vec<Event>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct AgentPage {
    pub agents: Vec<AgentSummary>,
    pub next_cursor: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct AgentQuery {
    pub project_id: Option<String>,
    pub environment: Option<String>,
    pub status: Option<AgentStatus>,
    pub limit: usize,
}

impl QueryEngine {
    /// One page of agents, most recently seen first. A status filter is
    /// applied after deriving, so such pages may come back short while
    /// `next_cursor` still points further.
    pub async fn list_agents(
        &self,
        tenant_id: &str,
        query: &AgentQuery,
        cursor: Option<&KeyCursor>,
        now: DateTime<Utc>,
    ) -> Result<AgentPage> {
        let fetch = if query.status.is_some() {
            STATUS_FILTER_SCAN.max(query.limit + 1)
        } else {
            query.limit + 1
        };
        let profiles = self
            .store
            .page_profiles(
                tenant_id,
                query.environment.as_deref(),
                query.project_id.as_deref(),
                cursor,
                fetch,
            )
            .await?;
        let more = profiles.len() == fetch;

        let mut agents = Vec::new();
        let mut consumed: Option<KeyCursor> = None;
        let mut truncated = false;
        for profile in profiles {
            if agents.len() >= query.limit {
                truncated = true;
                break;
            }
            consumed = Some(profile_cursor(&profile));
            let summary = AgentSummary::from_profile(profile, now);
            if query.status.is_none_or(|s| s == summary.status) {
                agents.push(summary);
            }
        }

        let next_cursor = if truncated || more {
            consumed.map(|c| c.encode())
        } else {
            None
        };
        Ok(AgentPage { agents, next_cursor })
    }

    /// `environment` hides agents living elsewhere, as if they did not exist.
    pub async fn agent_detail(
        &self,
        tenant_id: &str,
        agent_id: &str,
        environment: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<Option<AgentDetail>> {
        let Some(profile) = self.store.get_profile(tenant_id, agent_id, environment).await? else {
            return Ok(None);
        };

        let since = now - Duration::hours(24);
        let scope = Scope {
            agent_id: Some(agent_id.to_string()),
            environment: environment.map(str::to_string),
            ..Default::default()
        };
        let lifecycle = EventFilter {
            event_types: vec![EventType::TaskCompleted, EventType::TaskFailed],
            ..scope.filter(since, now)
        };
        let spend = EventFilter {
            payload_kind: Some(KIND_LLM_CALL.to_string()),
            ..scope.filter(since, now)
        };
        let finished = self.store.scan_events(tenant_id, &lifecycle).await?;
        let calls = self.store.scan_events(tenant_id, &spend).await?;

        // One bucket spanning the window; only the summary is used.
        let (summary, _) = build_metrics(&finished, since, since, 24 * 3_600);
        let (cost, _) = aggregate_cost(&calls, CostGrouping::Agent);
        let stats_24h = AgentStats {
            tasks_completed: summary.completed,
            tasks_failed: summary.failed,
            success_rate: summary.success_rate,
            avg_duration_ms: summary.avg_duration_ms,
            llm_calls: cost.calls,
            cost: cost.cost,
            tokens_in: cost.tokens_in,
            tokens_out: cost.tokens_out,
        };

        let recent = self
            .store
            .query_events(
                tenant_id,
                &EventFilter {
                    agent_id: Some(agent_id.to_string()),
                    environment: environment.map(str::to_string),
                    ..Default::default()
                },
                None,
                RECENT_EVENTS,
            )
            .await?
            .events;

        Ok(Some(AgentDetail {
            projects: self.store.agent_project_ids(tenant_id, agent_id).await?,
            summary: AgentSummary::from_profile(profile, now),
            stats_24h,
            recent_events: recent,
        }))
    }
}
