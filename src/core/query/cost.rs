use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::{QueryEngine, Scope, TimeRange, bucket_seconds, bucket_start, bucket_starts};
use crate::core::model::Event;
use crate::core::model::payload::{KIND_LLM_CALL, LlmCall};
use crate::core::store::EventFilter;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum CostGrouping {
    #[default]
    Agent,
    Model,
    AgentModel,
}

impl CostGrouping {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "agent" => Some(CostGrouping::Agent),
            "model" => Some(CostGrouping::Model),
            "agent_model" => Some(CostGrouping::AgentModel),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct CostRow {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    pub calls: u64,
    pub cost: f64,
    pub tokens_in: i64,
    pub tokens_out: i64,
    pub avg_cost_per_call: f64,
}

impl CostRow {
    fn add(&mut self, call: &LlmCall) {
        self.calls += 1;
        self.cost += call.cost.unwrap_or(0.0);
        self.tokens_in += call.tokens_in.unwrap_or(0);
        self.tokens_out += call.tokens_out.unwrap_or(0);
    }

    fn finish(mut self) -> Self {
        if self.calls > 0 {
            self.avg_cost_per_call = self.cost / self.calls as f64;
        }
        self
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct CostReport {
    pub since: DateTime<Utc>,
    pub until: DateTime<Utc>,
    pub group_by: CostGrouping,
    pub total: CostRow,
    pub rows: Vec<CostRow>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct CostPoint {
    pub bucket: DateTime<Utc>,
    pub calls: u64,
    pub cost: f64,
    pub tokens_in: i64,
    pub tokens_out: i64,
}

fn calls(events: &[Event]) -> impl Iterator<Item = (&Event, LlmCall)> {
    events
        .iter()
        .filter(|e| e.payload_kind() == Some(KIND_LLM_CALL))
        .filter_map(|e| e.payload.as_ref().map(|p| (e, LlmCall::lenient(&p.data))))
}

/// Groups LLM calls. Missing numbers contribute zero. Rows come back
/// most expensive first.
pub fn aggregate_cost(events: &[Event], group_by: CostGrouping) -> (CostRow, Vec<CostRow>) {
    let mut total = CostRow::default();
    let mut groups: BTreeMap<(Option<String>, Option<String>), CostRow> = BTreeMap::new();

    for (event, call) in calls(events) {
        total.add(&call);
        let key = match group_by {
            CostGrouping::Agent => (Some(event.agent_id.clone()), None),
            CostGrouping::Model => (None, Some(call.model.clone())),
            CostGrouping::AgentModel => (Some(event.agent_id.clone()), Some(call.model.clone())),
        };
        let row = groups.entry(key.clone()).or_insert_with(|| CostRow {
            agent_id: key.0,
            model: key.1,
            ..Default::default()
        });
        row.add(&call);
    }

    let mut rows: Vec<CostRow> = groups.into_values().map(CostRow::finish).collect();
    rows.sort_by(|a, b| b.cost.total_cmp(&a.cost));
    (total.finish(), rows)
}

pub fn cost_series(
    events: &[Event],
    since: DateTime<Utc>,
    until: DateTime<Utc>,
    width_seconds: i64,
) -> Vec<CostPoint> {
    let mut buckets: BTreeMap<DateTime<Utc>, CostPoint> = bucket_starts(since, until, width_seconds)
        .into_iter()
        .map(|b| {
            (
                b,
                CostPoint {
                    bucket: b,
                    calls: 0,
                    cost: 0.0,
                    tokens_in: 0,
                    tokens_out: 0,
                },
            )
        })
        .collect();

    for (event, call) in calls(events) {
        if let Some(point) = buckets.get_mut(&bucket_start(event.timestamp, width_seconds)) {
            point.calls += 1;
            point.cost += call.cost.unwrap_or(0.0);
            point.tokens_in += call.tokens_in.unwrap_or(0);
            point.tokens_out += call.tokens_out.unwrap_or(0);
        }
    }
    buckets.into_values().collect()
}

impl QueryEngine {
    async fn llm_events(&self, tenant_id: &str, scope: &Scope, since: DateTime<Utc>, until: DateTime<Utc>) -> Result<Vec<Event>> {
        let filter = EventFilter {
            payload_kind: Some(KIND_LLM_CALL.to_string()),
            ..scope.filter(since, until)
        };
        self.store.scan_events(tenant_id, &filter).await
    }

    pub async fn cost(
        &self,
        tenant_id: &str,
        scope: &Scope,
        range: TimeRange,
        group_by: CostGrouping,
        now: DateTime<Utc>,
    ) -> Result<CostReport> {
        let (since, until) = range.window(now);
        let events = self.llm_events(tenant_id, scope, since, until).await?;
        let (total, rows) = aggregate_cost(&events, group_by);
        Ok(CostReport {
            since,
            until,
            group_by,
            total,
            rows,
        })
    }

    pub async fn cost_timeseries(
        &self,
        tenant_id: &str,
        scope: &Scope,
        range: TimeRange,
        now: DateTime<Utc>,
    ) -> Result<(i64, Vec<CostPoint>)> {
        let (since, until) = range.window(now);
        let width = bucket_seconds(range.duration());
        let events = self.llm_events(tenant_id, scope, since, until).await?;
        Ok((width, cost_series(&events, since, until, width)))
    }
}
