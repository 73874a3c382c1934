use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, HashSet};

use super::{QueryEngine, Scope, TimeRange, bucket_seconds, bucket_start, bucket_starts};
use crate::core::model::payload::{KIND_LLM_CALL, LlmCall};
use crate::core::model::{Event, EventType};
use crate::core::store::EventFilter;

#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct MetricsSummary {
    /// Distinct tasks with any lifecycle event in the window.
    pub total_tasks: u64,
    pub completed: u64,
    pub failed: u64,
    /// Percentage of finished tasks that completed. 0 when none finished.
    pub success_rate: f64,
    pub avg_duration_ms: Option<f64>,
    pub total_cost: f64,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct MetricsPoint {
    pub bucket: DateTime<Utc>,
    pub completed: u64,
    pub failed: u64,
    pub cost: f64,
    pub avg_duration_ms: Option<f64>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct MetricsReport {
    pub since: DateTime<Utc>,
    pub until: DateTime<Utc>,
    pub interval_seconds: i64,
    pub summary: MetricsSummary,
    pub timeseries: Vec<MetricsPoint>,
}

#[derive(Default)]
struct Accumulator {
    completed: u64,
    failed: u64,
    cost: f64,
    duration_sum: i64,
    duration_count: u64,
}

impl Accumulator {
    fn add(&mut self, event: &Event) {
        match event.event_type {
            EventType::TaskCompleted => self.completed += 1,
            EventType::TaskFailed => self.failed += 1,
            _ => {}
        }
        if matches!(event.event_type, EventType::TaskCompleted | EventType::TaskFailed)
            && let Some(d) = event.duration_ms
        {
            self.duration_sum += d;
            self.duration_count += 1;
        }
        if event.payload_kind() == Some(KIND_LLM_CALL)
            && let Some(payload) = &event.payload
        {
            self.cost += LlmCall::lenient(&payload.data).cost.unwrap_or(0.0);
        }
    }

    fn avg_duration(&self) -> Option<f64> {
        (self.duration_count > 0).then(|| self.duration_sum as f64 / self.duration_count as f64)
    }
}

/// Summary and dense timeseries over task lifecycle and LLM-call events.
pub fn build_metrics(
    events: &[Event],
    since: DateTime<Utc>,
    until: DateTime<Utc>,
    width_seconds: i64,
) -> (MetricsSummary, Vec<MetricsPoint>) {
    let mut overall = Accumulator::default();
    let mut tasks = HashSet::new();
    let mut buckets: BTreeMap<DateTime<Utc>, Accumulator> = bucket_starts(since, until, width_seconds)
        .into_iter()
        .map(|b| (b, Accumulator::default()))
        .collect();

    for event in events {
        overall.add(event);
        if let Some(task) = &event.task_id {
            tasks.insert(task.as_str());
        }
        if let Some(acc) = buckets.get_mut(&bucket_start(event.timestamp, width_seconds)) {
            acc.add(event);
        }
    }

    let finished = overall.completed + overall.failed;
    let summary = MetricsSummary {
        total_tasks: tasks.len() as u64,
        completed: overall.completed,
        failed: overall.failed,
        success_rate: if finished > 0 {
            overall.completed as f64 * 100.0 / finished as f64
        } else {
            0.0
        },
        avg_duration_ms: overall.avg_duration(),
        total_cost: overall.cost,
    };
    let series = buckets
        .into_iter()
        .map(|(bucket, acc)| MetricsPoint {
            bucket,
            completed: acc.completed,
            failed: acc.failed,
            cost: acc.cost,
            avg_duration_ms: acc.avg_duration(),
        })
        .collect();
    (summary, series)
}

impl QueryEngine {
    pub async fn metrics(
        &self,
        tenant_id: &str,
        scope: &Scope,
        range: TimeRange,
        now: DateTime<Utc>,
    ) -> Result<MetricsReport> {
        let (since, until) = range.window(now);
        let width = bucket_seconds(range.duration());

        let lifecycle = EventFilter {
            event_types: vec![
                EventType::TaskStarted,
                EventType::TaskCompleted,
                EventType::TaskFailed,
            ],
            ..scope.filter(since, until)
        };
        let spend = EventFilter {
            payload_kind: Some(KIND_LLM_CALL.to_string()),
            ..scope.filter(since, until)
        };
        let mut events = self.store.scan_events(tenant_id, &lifecycle).await?;
        events.extend(
            self.store
                .scan_events(tenant_id, &spend)
                .await?
                .into_iter()
                .filter(|e| !matches!(
                    e.event_type,
                    EventType::TaskStarted | EventType::TaskCompleted | EventType::TaskFailed
                )),
        );

        let (summary, timeseries) = build_metrics(&events, since, until, width);
        Ok(MetricsReport {
            since,
            until,
            interval_seconds: width,
            summary,
            timeseries,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::fixtures::{TENANT, at, llm_call, task_event};
    use crate::core::store::test_event_store;

    fn finished(task: &str, id: &str, t: EventType, secs: i64, duration: i64) -> Event {
        let mut e = task_event("a1", task, id, t, secs);
        e.duration_ms = Some(duration);
        e
    }

    #[test]
    fn summary_counts_outcomes_and_cost() {
        let events = vec![
            task_event("a1", "t1", "s1", EventType::TaskStarted, 0),
            finished("t1", "c1", EventType::TaskCompleted, 10, 1_000),
            finished("t2", "f2", EventType::TaskFailed, 20, 3_000),
            task_event("a1", "t3", "s3", EventType::TaskStarted, 30),
            llm_call("a1", "l1", 40, "m", 1, 1, 0.25),
        ];
        let (summary, series) = build_metrics(&events, at(0), at(3_600), 300);
        assert_eq!(summary.total_tasks, 3);
        assert_eq!(summary.completed, 1);
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.success_rate, 50.0);
        assert_eq!(summary.avg_duration_ms, Some(2_000.0));
        assert_eq!(summary.total_cost, 0.25);
        assert_eq!(series.len(), 13);
        assert_eq!(series[0].completed, 1);
        assert_eq!(series[1].avg_duration_ms, None);
    }

    #[test]
    fn empty_window_reports_zeroes() {
        let (summary, series) = build_metrics(&[], at(0), at(600), 300);
        assert_eq!(summary, MetricsSummary::default());
        assert!(series.iter().all(|p| p.completed == 0 && p.cost == 0.0));
    }

    #[tokio::test]
    async fn scoped_to_agent() {
        let store = test_event_store();
        let mut other = task_event("a2", "t9", "x9", EventType::TaskFailed, -30);
        other.duration_ms = Some(10);
        store
            .append(vec![
                finished("t1", "c1", EventType::TaskCompleted, -60, 500),
                other,
            ])
            .await
            .unwrap();
        let engine = QueryEngine::new(store);
        let scope = Scope {
            agent_id: Some("a1".to_string()),
            ..Default::default()
        };
        let report = engine.metrics(TENANT, &scope, TimeRange::Hour, at(0)).await.unwrap();
        assert_eq!(report.interval_seconds, 300);
        assert_eq!(report.summary.completed, 1);
        assert_eq!(report.summary.failed, 0);
        assert_eq!(report.summary.success_rate, 100.0);
    }
}
