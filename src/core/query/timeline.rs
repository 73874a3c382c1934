//! Single-task timeline: flat events, action tree, error→retry chains and
//! plan progress.

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{HashMap, HashSet};

use super::QueryEngine;
use super::tasks::{TaskSummary, summarize_task};
use crate::core::derive::latest_run;
use crate::core::model::payload::{KIND_LLM_CALL, KIND_PLAN_CREATED, KIND_PLAN_STEP, LlmCall, PlanCreated, PlanStep, StepAction};
use crate::core::model::{Event, EventType};

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ActionNode {
    pub action_id: String,
    pub name: Option<String>,
    pub status: String,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<i64>,
    pub event_count: usize,
    pub children: Vec<ActionNode>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ChainLink {
    pub event_id: String,
    pub event_type: EventType,
    pub action_id: Option<String>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct RetryChain {
    pub root_event_id: String,
    pub links: Vec<ChainLink>,
    /// The chain ends in a completion.
    pub resolved: bool,
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StepState {
    Pending,
    Started,
    Completed,
    Failed,
    Skipped,
}

impl From<StepAction> for StepState {
    fn from(action: StepAction) -> Self {
        match action {
            StepAction::Started => StepState::Started,
            StepAction::Completed => StepState::Completed,
            StepAction::Failed => StepState::Failed,
            StepAction::Skipped => StepState::Skipped,
        }
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct PlanStepView {
    pub index: u32,
    pub description: String,
    pub status: StepState,
    pub summary: Option<String>,
    pub updated_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
pub struct Progress {
    pub completed: u32,
    pub total: u32,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct PlanProgress {
    pub revision: u32,
    pub steps: Vec<PlanStepView>,
    pub progress: Progress,
}

#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct TimelineTotals {
    pub events: usize,
    pub actions: usize,
    pub failures: usize,
    pub retries: usize,
    pub llm_calls: usize,
    pub cost: f64,
    pub tokens_in: i64,
    pub tokens_out: i64,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct Timeline {
    pub task: TaskSummary,
    pub totals: TimelineTotals,
    pub events: Vec<Event>,
    pub action_tree: Vec<ActionNode>,
    pub retry_chains: Vec<RetryChain>,
    pub plan: Option<PlanProgress>,
}

fn action_status(events: &[&Event]) -> &'static str {
    let last = events.iter().rev().find_map(|e| match e.event_type {
        EventType::ActionStarted => Some("running"),
        EventType::ActionCompleted => Some("completed"),
        EventType::ActionFailed => Some("failed"),
        EventType::RetryStarted => Some("retrying"),
        _ => None,
    });
    last.unwrap_or("running")
}

/// Nests actions under their parents. Orphans (unknown or cyclic parents)
/// become roots. Siblings keep first-seen order.
pub fn action_tree<'a>(events: &[&'a Event]) -> Vec<ActionNode> {
    let mut order: Vec<&'a str> = Vec::new();
    let mut grouped: HashMap<&'a str, Vec<&'a Event>> = HashMap::new();
    let mut parents: HashMap<&'a str, &'a str> = HashMap::new();
    for e in events.iter().copied() {
        let Some(action) = e.action_id.as_deref() else {
            continue;
        };
        if !grouped.contains_key(action) {
            order.push(action);
        }
        grouped.entry(action).or_default().push(e);
        if let Some(parent) = e.parent_action_id.as_deref()
            && parent != action
        {
            parents.entry(action).or_insert(parent);
        }
    }

    let mut children: HashMap<&'a str, Vec<&'a str>> = HashMap::new();
    let mut roots: Vec<&'a str> = Vec::new();
    for action in order.iter().copied() {
        match parents.get(action).copied() {
            Some(parent) if grouped.contains_key(parent) => {
                children.entry(parent).or_default().push(action)
            }
            _ => roots.push(action),
        }
    }

    let mut visited = HashSet::new();
    let mut tree = Vec::new();
    for root in roots {
        if !visited.contains(root) {
            tree.push(build_node(root, &grouped, &children, &mut visited));
        }
    }
    // Actions only reachable through a parent cycle.
    for action in order.iter().copied() {
        if !visited.contains(action) {
            tree.push(build_node(action, &grouped, &children, &mut visited));
        }
    }
    tree
}

fn build_node<'a>(
    id: &'a str,
    grouped: &HashMap<&'a str, Vec<&'a Event>>,
    children: &HashMap<&'a str, Vec<&'a str>>,
    visited: &mut HashSet<&'a str>,
) -> ActionNode {
    visited.insert(id);
    let events: &[&Event] = grouped.get(id).map(Vec::as_slice).unwrap_or_default();
    let started = events
        .iter()
        .copied()
        .find(|e| e.event_type == EventType::ActionStarted);
    let finished = events.iter().copied().rev().find(|e| {
        matches!(e.event_type, EventType::ActionCompleted | EventType::ActionFailed)
    });
    let started_at = started
        .or(events.first().copied())
        .map(|e| e.timestamp);
    let duration_ms = finished.and_then(|f| {
        f.duration_ms
            .or_else(|| started_at.map(|s| (f.timestamp - s).num_milliseconds().max(0)))
    });
    let name = started
        .or(events.first().copied())
        .and_then(|e| e.payload.as_ref())
        .and_then(|p| p.summary.clone());

    let mut nodes = Vec::new();
    if let Some(kids) = children.get(id) {
        for child in kids.iter().copied() {
            if !visited.contains(child) {
                nodes.push(build_node(child, grouped, children, visited));
            }
        }
    }
    ActionNode {
        action_id: id.to_string(),
        name,
        status: action_status(events).to_string(),
        started_at,
        finished_at: finished.map(|e| e.timestamp),
        duration_ms,
        event_count: events.len(),
        children: nodes,
    }
}

fn has_failed_ancestor<'a>(event: &'a Event, by_id: &HashMap<&'a str, &'a Event>) -> bool {
    let mut seen: HashSet<&str> = HashSet::new();
    let mut cursor = event.parent_event_id.as_deref();
    while let Some(id) = cursor {
        if !seen.insert(id) {
            break;
        }
        let Some(parent) = by_id.get(id).copied() else {
            break;
        };
        if parent.event_type.is_failure() {
            return true;
        }
        cursor = parent.parent_event_id.as_deref();
    }
    false
}

/// Failure events followed through `parent_event_id` links. A chain starts
/// at a failure with no failing ancestor and holds every descendant.
pub fn retry_chains<'a>(events: &[&'a Event]) -> Vec<RetryChain> {
    let by_id: HashMap<&'a str, &'a Event> = events
        .iter()
        .copied()
        .map(|e| (e.event_id.as_str(), e))
        .collect();
    let mut children: HashMap<&'a str, Vec<&'a Event>> = HashMap::new();
    for e in events.iter().copied() {
        if let Some(parent) = e.parent_event_id.as_deref()
            && by_id.contains_key(parent)
            && parent != e.event_id
        {
            children.entry(parent).or_default().push(e);
        }
    }

    let mut chains = Vec::new();
    for root in events
        .iter()
        .copied()
        .filter(|e| e.event_type.is_failure() && !has_failed_ancestor(e, &by_id))
    {
        let mut members: Vec<&Event> = Vec::new();
        let mut seen: HashSet<&str> = HashSet::from([root.event_id.as_str()]);
        let mut frontier = vec![root.event_id.as_str()];
        while let Some(id) = frontier.pop() {
            let Some(kids) = children.get(id) else {
                continue;
            };
            for child in kids.iter().copied() {
                if seen.insert(child.event_id.as_str()) {
                    members.push(child);
                    frontier.push(child.event_id.as_str());
                }
            }
        }
        if members.is_empty() {
            continue;
        }
        members.sort_by_key(|e| (e.timestamp, e.seq));

        let resolved = members.last().is_some_and(|e| {
            matches!(e.event_type, EventType::ActionCompleted | EventType::TaskCompleted)
        });
        let links = std::iter::once(root)
            .chain(members)
            .map(|e| ChainLink {
                event_id: e.event_id.clone(),
                event_type: e.event_type,
                action_id: e.action_id.clone(),
                timestamp: e.timestamp,
            })
            .collect();
        chains.push(RetryChain {
            root_event_id: root.event_id.clone(),
            links,
            resolved,
        });
    }
    chains
}

/// Steps come from the latest `plan_created`; each step takes the state
/// of its most recent `plan_step` after that. `None` without a plan.
pub fn plan_progress(events: &[&Event]) -> Option<PlanProgress> {
    let (created_at, plan) = events.iter().rev().find_map(|e| {
        if e.payload_kind() != Some(KIND_PLAN_CREATED) {
            return None;
        }
        let data = e.payload.as_ref()?.data.clone();
        serde_json::from_value::<PlanCreated>(data)
            .ok()
            .map(|p| ((e.timestamp, e.seq), p))
    })?;

    let mut revision = plan.revision.unwrap_or(1);
    let mut steps: Vec<PlanStepView> = plan
        .steps
        .into_iter()
        .map(|s| PlanStepView {
            index: s.index,
            description: s.description,
            status: StepState::Pending,
            summary: None,
            updated_at: None,
        })
        .collect();
    steps.sort_by_key(|s| s.index);

    for e in events
        .iter()
        .filter(|e| (e.timestamp, e.seq) >= created_at && e.payload_kind() == Some(KIND_PLAN_STEP))
    {
        let Some(update) = e
            .payload
            .as_ref()
            .and_then(|p| serde_json::from_value::<PlanStep>(p.data.clone()).ok())
        else {
            continue;
        };
        if let Some(r) = update.plan_revision
            && r > revision
        {
            revision = r;
        }
        if let Some(step) = steps.iter_mut().find(|s| s.index == update.step_index) {
            step.status = update.action.into();
            step.summary = update.summary.or_else(|| step.summary.take());
            step.updated_at = Some(e.timestamp);
        }
    }

    let completed = steps.iter().filter(|s| s.status == StepState::Completed).count() as u32;
    let total = steps.len() as u32;
    Some(PlanProgress {
        revision,
        steps,
        progress: Progress { completed, total },
    })
}

fn totals(events: &[Event]) -> TimelineTotals {
    let mut totals = TimelineTotals {
        events: events.len(),
        ..Default::default()
    };
    let mut actions = HashSet::new();
    for e in events {
        if let Some(a) = &e.action_id {
            actions.insert(a.as_str());
        }
        if e.event_type.is_failure() {
            totals.failures += 1;
        }
        if e.event_type == EventType::RetryStarted {
            totals.retries += 1;
        }
        if e.payload_kind() == Some(KIND_LLM_CALL)
            && let Some(p) = &e.payload
        {
            let call = LlmCall::lenient(&p.data);
            totals.llm_calls += 1;
            totals.cost += call.cost.unwrap_or(0.0);
            totals.tokens_in += call.tokens_in.unwrap_or(0);
            totals.tokens_out += call.tokens_out.unwrap_or(0);
        }
    }
    totals.actions = actions.len();
    totals
}

impl QueryEngine {
    pub async fn timeline(
        &self,
        tenant_id: &str,
        task_id: &str,
        environment: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<Option<Timeline>> {
        let events = self.scoped_task_events(tenant_id, task_id, environment).await?;
        let Some(agent_id) = events.last().map(|e| e.agent_id.clone()) else {
            return Ok(None);
        };
        let agent_stuck = self.agent_is_stuck(tenant_id, &agent_id, environment, now).await?;
        let Some(task) = summarize_task(task_id, &events, agent_stuck) else {
            return Ok(None);
        };

        let run = latest_run(&events);
        let action_tree = action_tree(&run);
        let retry_chains = retry_chains(&run);
        let plan = plan_progress(&run);
        let totals = totals(&events);
        Ok(Some(Timeline {
            task,
            totals,
            events,
            action_tree,
            retry_chains,
            plan,
        }))
    }
}
