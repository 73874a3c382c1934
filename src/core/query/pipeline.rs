use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;

use super::QueryEngine;
use crate::core::model::Event;
use crate::core::model::payload::{
    IssueAction, IssueReport, KIND_ISSUE, KIND_QUEUE_SNAPSHOT, KIND_SCHEDULED, KIND_TODO, QueueSnapshot,
    ScheduledItem, ScheduledReport, TodoAction, TodoItem,
};
use crate::core::store::EventFilter;

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct QueueView {
    pub event_id: String,
    pub at: DateTime<Utc>,
    pub summary: Option<String>,
    pub snapshot: Option<QueueSnapshot>,
    /// Raw data when it does not match the queue shape.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub raw: Option<Value>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ScheduledView {
    pub event_id: String,
    pub at: DateTime<Utc>,
    pub items: Vec<ScheduledItem>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct TodoView {
    pub todo_id: String,
    pub action: TodoAction,
    pub active: bool,
    pub summary: Option<String>,
    pub priority: Option<String>,
    pub source: Option<String>,
    pub context: Option<String>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct IssueView {
    /// `issue_id`, or the summary when the producer sent no id.
    pub key: String,
    pub summary: Option<String>,
    pub severity: Option<String>,
    pub category: Option<String>,
    pub action: IssueAction,
    pub active: bool,
    pub occurrences: u64,
    pub first_seen_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct PipelineSnapshot {
    pub agent_id: String,
    pub queue: Option<QueueView>,
    pub scheduled: Option<ScheduledView>,
    pub todos: Vec<TodoView>,
    pub active_todos: usize,
    pub issues: Vec<IssueView>,
    pub active_issues: usize,
}

fn decode<T: serde::de::DeserializeOwned>(event: &Event) -> Option<T> {
    let data = event.payload.as_ref()?.data.clone();
    serde_json::from_value(data).ok()
}

fn summary(event: &Event) -> Option<String> {
    event.payload.as_ref().and_then(|p| p.summary.clone())
}

pub fn queue_view(event: &Event) -> QueueView {
    let snapshot = decode::<QueueSnapshot>(event);
    QueueView {
        event_id: event.event_id.clone(),
        at: event.timestamp,
        summary: summary(event),
        raw: if snapshot.is_none() {
            event.payload.as_ref().map(|p| p.data.clone())
        } else {
            None
        },
        snapshot,
    }
}

/// Latest state per todo id. Input must be chronological; active todos sort first.
pub fn fold_todos(events: &[Event]) -> Vec<TodoView> {
    let mut latest: HashMap<String, TodoView> = HashMap::new();
    for event in events {
        let Some(item) = decode::<TodoItem>(event) else {
            continue;
        };
        latest.insert(
            item.todo_id.clone(),
            TodoView {
                todo_id: item.todo_id,
                action: item.action,
                active: !item.action.is_closed(),
                summary: summary(event),
                priority: item.priority,
                source: item.source,
                context: item.context,
                updated_at: event.timestamp,
            },
        );
    }
    let mut todos: Vec<TodoView> = latest.into_values().collect();
    todos.sort_by(|a, b| b.active.cmp(&a.active).then(b.updated_at.cmp(&a.updated_at)));
    todos
}

/// Issues grouped by id (or summary). Occurrences count reports unless the
/// producer supplies its own count.
pub fn fold_issues(events: &[Event]) -> Vec<IssueView> {
    let mut grouped: HashMap<String, IssueView> = HashMap::new();
    for event in events {
        let Some(report) = decode::<IssueReport>(event) else {
            continue;
        };
        let text = summary(event);
        let Some(key) = report.issue_id.clone().or_else(|| text.clone()) else {
            continue;
        };
        let active = !matches!(report.action, IssueAction::Resolved | IssueAction::Dismissed);
        let view = grouped.entry(key.clone()).or_insert_with(|| IssueView {
            key,
            summary: None,
            severity: None,
            category: None,
            action: report.action,
            active,
            occurrences: 0,
            first_seen_at: event.timestamp,
            last_seen_at: event.timestamp,
        });
        if report.action == IssueAction::Reported {
            view.occurrences += 1;
        }
        if let Some(count) = report.occurrence_count {
            view.occurrences = view.occurrences.max(count);
        }
        view.summary = text.or(view.summary.take());
        view.severity = report.severity.or(view.severity.take());
        view.category = report.category.or(view.category.take());
        view.action = report.action;
        view.active = active;
        view.last_seen_at = event.timestamp;
    }
    let mut issues: Vec<IssueView> = grouped.into_values().collect();
    issues.sort_by(|a, b| b.active.cmp(&a.active).then(b.last_seen_at.cmp(&a.last_seen_at)));
    issues
}

impl QueryEngine {
    fn kind_filter(agent_id: &str, kind: &str, environment: Option<&str>) -> EventFilter {
        EventFilter {
            agent_id: Some(agent_id.to_string()),
            payload_kind: Some(kind.to_string()),
            environment: environment.map(str::to_string),
            ..Default::default()
        }
    }

    async fn latest_of_kind(
        &self,
        tenant_id: &str,
        agent_id: &str,
        kind: &str,
        environment: Option<&str>,
    ) -> Result<Option<Event>> {
        let page = self
            .store
            .query_events(tenant_id, &Self::kind_filter(agent_id, kind, environment), None, 1)
            .await?;
        Ok(page.events.into_iter().next())
    }

    /// Pipeline state of one agent. `environment` restricts which events
    /// are folded in.
    pub async fn pipeline(
        &self,
        tenant_id: &str,
        agent_id: &str,
        environment: Option<&str>,
    ) -> Result<PipelineSnapshot> {
        let queue = self
            .latest_of_kind(tenant_id, agent_id, KIND_QUEUE_SNAPSHOT, environment)
            .await?
            .map(|e| queue_view(&e));
        let scheduled = self
            .latest_of_kind(tenant_id, agent_id, KIND_SCHEDULED, environment)
            .await?
            .map(|e| ScheduledView {
                event_id: e.event_id.clone(),
                at: e.timestamp,
                items: decode::<ScheduledReport>(&e).map(|r| r.items).unwrap_or_default(),
            });

        let todos = self
            .store
            .scan_events(tenant_id, &Self::kind_filter(agent_id, KIND_TODO, environment))
            .await?;
        let issues = self
            .store
            .scan_events(tenant_id, &Self::kind_filter(agent_id, KIND_ISSUE, environment))
            .await?;
        let todos = fold_todos(&todos);
        let issues = fold_issues(&issues);
        Ok(PipelineSnapshot {
            agent_id: agent_id.to_string(),
            queue,
            scheduled,
            active_todos: todos.iter().filter(|t| t.active).count(),
            todos,
            active_issues: issues.iter().filter(|i| i.active).count(),
            issues,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::fixtures::{TENANT, event, with_payload};
    use crate::core::model::EventType;
    use crate::core::store::test_event_store;
    use serde_json::json;

    fn custom(id: &str, secs: i64, kind: &str, data: Value) -> Event {
        with_payload(event("a1", id, EventType::Custom, secs), kind, data)
    }

    #[test]
    fn todos_keep_latest_state_per_id() {
        let events = vec![
            custom("1", 0, KIND_TODO, json!({"todo_id": "x", "action": "created"})),
            custom("2", 1, KIND_TODO, json!({"todo_id": "y", "action": "created"})),
            custom("3", 2, KIND_TODO, json!({"todo_id": "x", "action": "completed"})),
            custom("4", 3, KIND_TODO, json!({"todo_id": "z", "action": "deferred"})),
        ];
        let todos = fold_todos(&events);
        assert_eq!(todos.len(), 3);
        let active: Vec<&str> = todos.iter().filter(|t| t.active).map(|t| t.todo_id.as_str()).collect();
        assert_eq!(active, vec!["z", "y"]);
        assert_eq!(todos[2].action, TodoAction::Completed);
    }

    #[test]
    fn issues_group_by_id_or_summary() {
        let mut by_summary = custom("3", 2, KIND_ISSUE, json!({"severity": "low"}));
        if let Some(p) = by_summary.payload.as_mut() {
            p.summary = Some("slow disk".to_string());
        }
        let events = vec![
            custom("1", 0, KIND_ISSUE, json!({"issue_id": "quota", "severity": "high"})),
            custom("2", 1, KIND_ISSUE, json!({"issue_id": "quota"})),
            by_summary,
            custom("4", 3, KIND_ISSUE, json!({"issue_id": "quota", "action": "resolved"})),
        ];
        let issues = fold_issues(&events);
        assert_eq!(issues.len(), 2);
        assert_eq!(issues[0].key, "slow disk");
        assert!(issues[0].active);
        let quota = &issues[1];
        assert!(!quota.active);
        assert_eq!(quota.occurrences, 2);
        assert_eq!(quota.severity.as_deref(), Some("high"));
    }

    #[tokio::test]
    async fn snapshot_picks_latest_queue_and_schedule() {
        let store = test_event_store();
        store
            .append(vec![
                custom("q1", 0, KIND_QUEUE_SNAPSHOT, json!({"depth": 9})),
                custom("q2", 5, KIND_QUEUE_SNAPSHOT, json!({"depth": 2, "oldest_age_seconds": 4.5})),
                custom("s1", 1, KIND_SCHEDULED, json!({"items": [{"id": "n", "name": "nightly"}]})),
                custom("t1", 2, KIND_TODO, json!({"todo_id": "x", "action": "created"})),
            ])
            .await
            .unwrap();
        let engine = QueryEngine::new(store);
        let snap = engine.pipeline(TENANT, "a1", None).await.unwrap();
        assert_eq!(snap.queue.unwrap().snapshot.unwrap().depth, 2);
        assert_eq!(snap.scheduled.unwrap().items[0].name, "nightly");
        assert_eq!(snap.active_todos, 1);
        assert!(snap.issues.is_empty());

        let empty = engine.pipeline(TENANT, "ghost", None).await.unwrap();
        assert!(empty.queue.is_none() && empty.todos.is_empty());

        let sandboxed = engine.pipeline(TENANT, "a1", Some("test")).await.unwrap();
        assert!(sandboxed.queue.is_none() && sandboxed.todos.is_empty());
    }
}
