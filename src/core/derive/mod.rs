//! Status derivation. Everything here is a pure function of stored facts
//! and the current time; nothing is persisted.

use chrono::{DateTime, Utc};

use crate::core::model::{AgentProfile, AgentStatus, Event, EventType, TaskStatus};
use crate::core::store::ProfileChange;

/// Agent status cascade. The first matching rule wins.
pub fn agent_status(profile: &AgentProfile, now: DateTime<Utc>) -> AgentStatus {
    if profile.heartbeat_age_seconds(now) > profile.stuck_threshold_seconds {
        return AgentStatus::Stuck;
    }
    match profile.last_event_type {
        Some(EventType::TaskFailed | EventType::ActionFailed) => AgentStatus::Error,
        Some(EventType::ApprovalRequested) => AgentStatus::WaitingApproval,
        Some(EventType::TaskStarted | EventType::ActionStarted) => AgentStatus::Processing,
        _ => AgentStatus::Idle,
    }
}

/// Status before and after an ingest touched a profile. `None` before
/// means the agent was first seen in this batch.
pub fn status_change(
    change: &ProfileChange,
    now: DateTime<Utc>,
) -> (Option<AgentStatus>, AgentStatus) {
    (
        change.before.as_ref().map(|p| agent_status(p, now)),
        agent_status(&change.after, now),
    )
}

/// Events belonging to the most recent run of a task. With run ids, that
/// is every event of the newest run id; without them, everything from the
/// last `task_started` on. Input must be chronological.
pub fn latest_run(events: &[Event]) -> Vec<&Event> {
    if let Some(run) = events.iter().rev().find_map(|e| e.task_run_id.as_deref()) {
        return events
            .iter()
            .filter(|e| e.task_run_id.as_deref() == Some(run))
            .collect();
    }
    let start = events
        .iter()
        .rposition(|e| e.event_type == EventType::TaskStarted)
        .unwrap_or(0);
    events[start..].iter().collect()
}

fn last_at(run: &[&Event], event_type: EventType) -> Option<DateTime<Utc>> {
    run.iter()
        .filter(|e| e.event_type == event_type)
        .map(|e| e.timestamp)
        .max()
}

fn unresolved(run: &[&Event], opened_by: EventType) -> bool {
    match (last_at(run, opened_by), last_at(run, EventType::ApprovalReceived)) {
        (Some(opened), Some(resolved)) => opened > resolved,
        (Some(_), None) => true,
        (None, _) => false,
    }
}

/// Task status over the latest run. `agent_stuck` is the owning agent's
/// current derived state.
pub fn task_status(events: &[Event], agent_stuck: bool) -> TaskStatus {
    let run = latest_run(events);
    let has = |t: EventType| run.iter().any(|e| e.event_type == t);

    if has(EventType::TaskCompleted) {
        TaskStatus::Completed
    } else if has(EventType::TaskFailed) {
        TaskStatus::Failed
    } else if unresolved(&run, EventType::Escalated) {
        TaskStatus::Escalated
    } else if unresolved(&run, EventType::ApprovalRequested) {
        TaskStatus::Waiting
    } else if agent_stuck {
        TaskStatus::Stuck
    } else {
        TaskStatus::Processing
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::fixtures::{TENANT, at, task_event};

    fn profile(last: Option<EventType>, heartbeat_secs: Option<i64>) -> AgentProfile {
        AgentProfile {
            tenant_id: TENANT.to_string(),
            agent_id: "a1".to_string(),
            agent_type: None,
            agent_version: None,
            framework: None,
            runtime: None,
            sdk_version: None,
            environment: "production".to_string(),
            group: None,
            first_seen_at: at(0),
            last_seen_at: at(0),
            last_heartbeat_at: heartbeat_secs.map(at),
            last_event_type: last,
            last_event_at: last.map(|_| at(0)),
            last_task_id: None,
            last_project_id: None,
            stuck_threshold_seconds: 300,
        }
    }

    #[test]
    fn stale_heartbeat_beats_everything() {
        let p = profile(Some(EventType::TaskFailed), Some(0));
        assert_eq!(agent_status(&p, at(301)), AgentStatus::Stuck);
        assert_eq!(agent_status(&p, at(300)), AgentStatus::Error);
    }

    #[test]
    fn cascade_follows_last_status_event() {
        let now = at(10);
        let cases = [
            (Some(EventType::ActionFailed), AgentStatus::Error),
            (Some(EventType::ApprovalRequested), AgentStatus::WaitingApproval),
            (Some(EventType::TaskStarted), AgentStatus::Processing),
            (Some(EventType::ActionStarted), AgentStatus::Processing),
            (Some(EventType::TaskCompleted), AgentStatus::Idle),
            (Some(EventType::ApprovalReceived), AgentStatus::Idle),
            (None, AgentStatus::Idle),
        ];
        for (last, expected) in cases {
            assert_eq!(agent_status(&profile(last, Some(5)), now), expected, "{:?}", last);
        }
    }

    #[test]
    fn never_heartbeating_agent_is_judged_on_last_seen() {
        let p = profile(Some(EventType::TaskStarted), None);
        assert_eq!(agent_status(&p, at(200)), AgentStatus::Processing);
        assert_eq!(agent_status(&p, at(400)), AgentStatus::Stuck);
    }

    #[test]
    fn task_completion_outranks_failure() {
        let events = vec![
            task_event("a1", "t1", "s", EventType::TaskStarted, 0),
            task_event("a1", "t1", "f", EventType::ActionFailed, 1),
            task_event("a1", "t1", "c", EventType::TaskCompleted, 2),
        ];
        assert_eq!(task_status(&events, true), TaskStatus::Completed);
    }

    #[test]
    fn escalation_resolved_by_later_approval() {
        let mut events = vec![
            task_event("a1", "t1", "s", EventType::TaskStarted, 0),
            task_event("a1", "t1", "x", EventType::Escalated, 5),
        ];
        assert_eq!(task_status(&events, false), TaskStatus::Escalated);

        events.push(task_event("a1", "t1", "ok", EventType::ApprovalReceived, 9));
        assert_eq!(task_status(&events, false), TaskStatus::Processing);
        assert_eq!(task_status(&events, true), TaskStatus::Stuck);
    }

    #[test]
    fn outstanding_approval_means_waiting() {
        let events = vec![
            task_event("a1", "t1", "s", EventType::TaskStarted, 0),
            task_event("a1", "t1", "q", EventType::ApprovalRequested, 3),
        ];
        assert_eq!(task_status(&events, true), TaskStatus::Waiting);
    }

    #[test]
    fn only_the_latest_run_counts() {
        let mut failed = task_event("a1", "t1", "f", EventType::TaskFailed, 5);
        failed.task_run_id = Some("run-1".to_string());
        let mut first = task_event("a1", "t1", "s1", EventType::TaskStarted, 0);
        first.task_run_id = Some("run-1".to_string());
        let mut retry = task_event("a1", "t1", "s2", EventType::TaskStarted, 10);
        retry.task_run_id = Some("run-2".to_string());

        let events = vec![first, failed, retry];
        assert_eq!(latest_run(&events).len(), 1);
        assert_eq!(task_status(&events, false), TaskStatus::Processing);
    }

    #[test]
    fn without_run_ids_the_last_start_opens_the_run() {
        let events = vec![
            task_event("a1", "t1", "s1", EventType::TaskStarted, 0),
            task_event("a1", "t1", "f", EventType::TaskFailed, 5),
            task_event("a1", "t1", "s2", EventType::TaskStarted, 10),
        ];
        assert_eq!(task_status(&events, false), TaskStatus::Processing);
    }
}
