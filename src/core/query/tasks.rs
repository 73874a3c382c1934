use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{BTreeSet, HashMap};

use super::QueryEngine;
use crate::core::derive::{agent_status, latest_run, task_status};
use crate::core::model::{AgentStatus, Event, EventType, TaskStatus};
use crate::core::store::EventFilter;
use crate::core::store::cursor::KeyCursor;

/// Tasks inspected when a status filter forces summarising before limiting.
const STATUS_FILTER_SCAN: usize = 500;

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct TaskSummary {
    pub task_id: String,
    pub agent_id: String,
    pub task_type: Option<String>,
    pub project_id: Option<String>,
    pub environment: String,
    pub status: TaskStatus,
    /// Run the status was derived from.
    pub task_run_id: Option<String>,
    pub runs: usize,
    pub started_at: DateTime<Utc>,
    pub last_event_at: DateTime<Utc>,
    pub duration_ms: Option<i64>,
    pub event_count: usize,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct TaskDetail {
    #[serde(flatten)]
    pub summary: TaskSummary,
    pub run_ids: Vec<String>,
    /// Events of the latest run, oldest first.
    pub events: Vec<Event>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct TaskPage {
    pub tasks: Vec<TaskSummary>,
    pub next_cursor: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct TaskQuery {
    pub project_id: Option<String>,
    pub agent_id: Option<String>,
    pub environment: Option<String>,
    pub status: Option<TaskStatus>,
    pub since: Option<DateTime<Utc>>,
    pub limit: usize,
}

/// Summary of one task from its chronological events. `None` when there
/// are no events.
pub fn summarize_task(task_id: &str, events: &[Event], agent_stuck: bool) -> Option<TaskSummary> {
    let run = latest_run(events);
    let first = *run.first()?;
    let last = *run.last()?;

    let started_at = run
        .iter()
        .find(|e| e.event_type == EventType::TaskStarted)
        .map(|e| e.timestamp)
        .unwrap_or(first.timestamp);
    let terminal = run
        .iter()
        .rev()
        .find(|e| matches!(e.event_type, EventType::TaskCompleted | EventType::TaskFailed));
    let duration_ms = terminal.map(|t| {
        t.duration_ms
            .unwrap_or_else(|| (t.timestamp - started_at).num_milliseconds().max(0))
    });
    let runs: BTreeSet<&str> = events.iter().filter_map(|e| e.task_run_id.as_deref()).collect();

    Some(TaskSummary {
        task_id: task_id.to_string(),
        agent_id: last.agent_id.clone(),
        task_type: run.iter().find_map(|e| e.task_type.clone()),
        project_id: run.iter().rev().find_map(|e| e.project_id.clone()),
        environment: last.environment.clone(),
        status: task_status(events, agent_stuck),
        task_run_id: last.task_run_id.clone(),
        runs: runs.len().max(1),
        started_at,
        last_event_at: last.timestamp,
        duration_ms,
        event_count: run.len(),
    })
}

impl QueryEngine {
    pub(super) async fn agent_is_stuck(
        &self,
        tenant_id: &str,
        agent_id: &str,
        environment: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        Ok(self
            .store
            .get_profile(tenant_id, agent_id, environment)
            .await?
            .is_some_and(|p| agent_status(&p, now) == AgentStatus::Stuck))
    }

    /// Chronological events of a task, restricted to one environment when given.
    pub(super) async fn scoped_task_events(
        &self,
        tenant_id: &str,
        task_id: &str,
        environment: Option<&str>,
    ) -> Result<Vec<Event>> {
        let mut events = self.store.task_events(tenant_id, task_id).await?;
        if let Some(env) = environment {
            events.retain(|e| e.environment == env);
        }
        Ok(events)
    }

    /// One page of tasks, most recently active first. With a status filter
    /// a page may come back short while `next_cursor` still points further.
    pub async fn list_tasks(
        &self,
        tenant_id: &str,
        query: &TaskQuery,
        cursor: Option<&KeyCursor>,
        now: DateTime<Utc>,
    ) -> Result<TaskPage> {
        let filter = EventFilter {
            project_id: query.project_id.clone(),
            agent_id: query.agent_id.clone(),
            environment: query.environment.clone(),
            since_ms: query.since.map(|s| s.timestamp_millis()),
            ..Default::default()
        };
        let fetch = if query.status.is_some() {
            STATUS_FILTER_SCAN.max(query.limit + 1)
        } else {
            query.limit + 1
        };
        let ids = self.store.recent_task_ids(tenant_id, &filter, cursor, fetch).await?;
        let more = ids.len() == fetch;

        let mut stuck: HashMap<String, bool> = HashMap::new();
        let mut tasks = Vec::new();
        let mut consumed: Option<KeyCursor> = None;
        let mut truncated = false;
        for (task_id, last_ts) in ids {
            if tasks.len() >= query.limit {
                truncated = true;
                break;
            }
            consumed = Some(KeyCursor {
                ts: last_ts,
                rank: 0,
                key: task_id.clone(),
            });

            let events = self
                .scoped_task_events(tenant_id, &task_id, query.environment.as_deref())
                .await?;
            let Some(agent_id) = events.last().map(|e| e.agent_id.clone()) else {
                continue;
            };
            let agent_stuck = match stuck.get(&agent_id) {
                Some(s) => *s,
                None => {
                    let s = self
                        .agent_is_stuck(tenant_id, &agent_id, query.environment.as_deref(), now)
                        .await?;
                    stuck.insert(agent_id, s);
                    s
                }
            };
            let Some(summary) = summarize_task(&task_id, &events, agent_stuck) else {
                continue;
            };
            if query.status.is_some_and(|s| s != summary.status) {
                continue;
            }
            tasks.push(summary);
        }

        let next_cursor = if truncated || more {
            consumed.map(|c| c.encode())
        } else {
            None
        };
        Ok(TaskPage { tasks, next_cursor })
    }

    pub async fn task_detail(
        &self,
        tenant_id: &str,
        task_id: &str,
        environment: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<Option<TaskDetail>> {
        let events = self.scoped_task_events(tenant_id, task_id, environment).await?;
        let Some(agent_id) = events.last().map(|e| e.agent_id.clone()) else {
            return Ok(None);
        };
        let agent_stuck = self.agent_is_stuck(tenant_id, &agent_id, environment, now).await?;
        let Some(summary) = summarize_task(task_id, &events, agent_stuck) else {
            return Ok(None);
        };

        let mut run_ids: Vec<String> = Vec::new();
        for e in &events {
            if let Some(run) = &e.task_run_id
                && !run_ids.contains(run)
            {
                run_ids.push(run.clone());
            }
        }
        let latest: Vec<Event> = latest_run(&events).into_iter().cloned().collect();
        Ok(Some(TaskDetail {
            summary,
            run_ids,
            events: latest,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::fixtures::{TENANT, at, event, task_event};
    use crate::core::store::test_event_store;

    #[test]
    fn summary_uses_latest_run() {
        let mut events = vec![
            task_event("a1", "t1", "s1", EventType::TaskStarted, 0),
            task_event("a1", "t1", "f1", EventType::TaskFailed, 10),
            task_event("a1", "t1", "s2", EventType::TaskStarted, 20),
            task_event("a1", "t1", "c2", EventType::TaskCompleted, 50),
        ];
        for (i, e) in events.iter_mut().enumerate() {
            e.task_run_id = Some(if i < 2 { "r1" } else { "r2" }.to_string());
        }
        let s = summarize_task("t1", &events, false).unwrap();
        assert_eq!(s.status, TaskStatus::Completed);
        assert_eq!(s.runs, 2);
        assert_eq!(s.task_run_id.as_deref(), Some("r2"));
        assert_eq!(s.started_at, at(20));
        assert_eq!(s.duration_ms, Some(30_000));
        assert_eq!(s.event_count, 2);
    }

    #[test]
    fn unfinished_task_has_no_duration() {
        let events = vec![task_event("a1", "t1", "s1", EventType::TaskStarted, 0)];
        let s = summarize_task("t1", &events, true).unwrap();
        assert_eq!(s.status, TaskStatus::Stuck);
        assert_eq!(s.duration_ms, None);
        assert!(summarize_task("t1", &[], false).is_none());
    }

    #[tokio::test]
    async fn list_filters_by_status_and_agent() {
        let store = test_event_store();
        store
            .append(vec![
                event("a1", "hb", EventType::Heartbeat, 0),
                task_event("a1", "t1", "s1", EventType::TaskStarted, 1),
                task_event("a1", "t1", "c1", EventType::TaskCompleted, 2),
                task_event("a1", "t2", "s2", EventType::TaskStarted, 3),
                task_event("a2", "t3", "f3", EventType::TaskFailed, 4),
            ])
            .await
            .unwrap();
        let engine = QueryEngine::new(store);

        let all = engine
            .list_tasks(TENANT, &TaskQuery { limit: 10, ..Default::default() }, None, at(5))
            .await
            .unwrap();
        let ids: Vec<&str> = all.tasks.iter().map(|t| t.task_id.as_str()).collect();
        assert_eq!(ids, vec!["t3", "t2", "t1"]);
        assert!(all.next_cursor.is_none());

        let processing = engine
            .list_tasks(
                TENANT,
                &TaskQuery {
                    agent_id: Some("a1".to_string()),
                    status: Some(TaskStatus::Processing),
                    limit: 10,
                    ..Default::default()
                },
                None,
                at(5),
            )
            .await
            .unwrap();
        assert_eq!(processing.tasks.len(), 1);
        assert_eq!(processing.tasks[0].task_id, "t2");

        let detail = engine.task_detail(TENANT, "t1", None, at(5)).await.unwrap().unwrap();
        assert_eq!(detail.summary.status, TaskStatus::Completed);
        assert_eq!(detail.events.len(), 2);
        assert!(engine.task_detail(TENANT, "t1", Some("test"), at(5)).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn task_pages_walk_without_gaps_or_repeats() {
        let store = test_event_store();
        store
            .append(vec![
                task_event("a1", "t1", "s1", EventType::TaskStarted, 1),
                task_event("a1", "t2", "s2", EventType::TaskStarted, 2),
                task_event("a1", "t3", "s3", EventType::TaskStarted, 3),
                // Same latest activity as t3; the id breaks the tie.
                task_event("a2", "t4", "s4", EventType::TaskStarted, 3),
                task_event("a2", "t5", "s5", EventType::TaskStarted, 4),
            ])
            .await
            .unwrap();
        let engine = QueryEngine::new(store);
        let query = TaskQuery { limit: 3, ..Default::default() };

        let first = engine.list_tasks(TENANT, &query, None, at(5)).await.unwrap();
        let ids: Vec<&str> = first.tasks.iter().map(|t| t.task_id.as_str()).collect();
        assert_eq!(ids, vec!["t5", "t4", "t3"]);
        let raw = first.next_cursor.expect("more tasks remain");

        let cursor = KeyCursor::decode(&raw).unwrap();
        let second = engine
            .list_tasks(TENANT, &query, Some(&cursor), at(5))
            .await
            .unwrap();
        let ids: Vec<&str> = second.tasks.iter().map(|t| t.task_id.as_str()).collect();
        assert_eq!(ids, vec!["t2", "t1"]);
        assert!(second.next_cursor.is_none());
    }
}
