//! Read-side aggregations. Everything is computed on demand from indexed
//! scans of the event log; nothing here writes.

pub mod agents;
pub mod cost;
pub mod metrics;
pub mod pipeline;
pub mod tasks;
pub mod timeline;

pub use agents::{AgentDetail, AgentPage, AgentQuery, AgentStats, AgentSummary};
pub use cost::{CostGrouping, CostPoint, CostReport, CostRow};
pub use metrics::{MetricsPoint, MetricsReport, MetricsSummary};
pub use pipeline::{IssueView, PipelineSnapshot, TodoView};
pub use tasks::{TaskDetail, TaskPage, TaskQuery, TaskSummary};
pub use timeline::{ActionNode, PlanProgress, RetryChain, Timeline};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::core::store::{EventFilter, EventStore};

/// Dimensions shared by the windowed reports.
#[derive(Debug, Clone, Default)]
pub struct Scope {
    pub project_id: Option<String>,
    pub agent_id: Option<String>,
    pub environment: Option<String>,
}

impl Scope {
    fn filter(&self, since: DateTime<Utc>, until: DateTime<Utc>) -> EventFilter {
        EventFilter {
            project_id: self.project_id.clone(),
            agent_id: self.agent_id.clone(),
            environment: self.environment.clone(),
            since_ms: Some(since.timestamp_millis()),
            until_ms: Some(until.timestamp_millis()),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum TimeRange {
    #[serde(rename = "1h")]
    Hour,
    #[serde(rename = "6h")]
    SixHours,
    #[default]
    #[serde(rename = "24h")]
    Day,
    #[serde(rename = "7d")]
    Week,
    #[serde(rename = "30d")]
    Month,
}

impl TimeRange {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "1h" => Some(TimeRange::Hour),
            "6h" => Some(TimeRange::SixHours),
            "24h" | "1d" => Some(TimeRange::Day),
            "7d" => Some(TimeRange::Week),
            "30d" => Some(TimeRange::Month),
            _ => None,
        }
    }

    pub fn duration(&self) -> Duration {
        match self {
            TimeRange::Hour => Duration::hours(1),
            TimeRange::SixHours => Duration::hours(6),
            TimeRange::Day => Duration::hours(24),
            TimeRange::Week => Duration::days(7),
            TimeRange::Month => Duration::days(30),
        }
    }

    pub fn window(&self, now: DateTime<Utc>) -> (DateTime<Utc>, DateTime<Utc>) {
        (now - self.duration(), now)
    }
}

/// Bucket width for a span: ≤1h → 5m, ≤6h → 15m, ≤24h → 1h, ≤7d → 6h, else 1d.
pub fn bucket_seconds(span: Duration) -> i64 {
    let secs = span.num_seconds();
    if secs <= 3_600 {
        300
    } else if secs <= 6 * 3_600 {
        900
    } else if secs <= 24 * 3_600 {
        3_600
    } else if secs <= 7 * 24 * 3_600 {
        6 * 3_600
    } else {
        24 * 3_600
    }
}

/// Start of the bucket containing `at`, aligned to the epoch.
pub fn bucket_start(at: DateTime<Utc>, width_seconds: i64) -> DateTime<Utc> {
    let ts = at.timestamp();
    let start = ts - ts.rem_euclid(width_seconds);
    DateTime::<Utc>::from_timestamp(start, 0).unwrap_or(at)
}

/// Every bucket start covering `[since, until]`, oldest first.
pub fn bucket_starts(since: DateTime<Utc>, until: DateTime<Utc>, width_seconds: i64) -> Vec<DateTime<Utc>> {
    let mut starts = Vec::new();
    let step = Duration::seconds(width_seconds);
    let mut cursor = bucket_start(since, width_seconds);
    while cursor <= until {
        starts.push(cursor);
        cursor += step;
    }
    starts
}

#[derive(Clone)]
pub struct QueryEngine {
    store: EventStore,
}

impl QueryEngine {
    pub fn new(store: EventStore) -> Self {
        Self { store }
    }
}
