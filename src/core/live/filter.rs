use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use crate::core::model::{AgentProfile, AlertFiring, Event, EventType, Severity};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Channel {
    Events,
    Agents,
    Alerts,
}

impl Channel {
    pub const ALL: [Channel; 3] = [Channel::Events, Channel::Agents, Channel::Alerts];
}

/// Per-subscriber filter. Every set field must match; unset fields match
/// anything.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SubscriptionFilter {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub project_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub environment: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub event_types: Vec<EventType>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min_severity: Option<Severity>,
}

fn field_matches(wanted: &Option<String>, actual: Option<&str>) -> bool {
    match wanted {
        Some(w) => actual == Some(w.as_str()),
        None => true,
    }
}

impl SubscriptionFilter {
    pub fn matches_event(&self, event: &Event) -> bool {
        field_matches(&self.project_id, event.project_id.as_deref())
            && field_matches(&self.environment, Some(&event.environment))
            && field_matches(&self.agent_id, Some(&event.agent_id))
            && (self.event_types.is_empty() || self.event_types.contains(&event.event_type))
            && self.min_severity.is_none_or(|min| event.severity >= min)
    }

    /// Agent notifications are matched on identity only; type and severity
    /// filters apply to events. The project filter matches any project the
    /// agent is linked to.
    pub fn matches_agent(&self, profile: &AgentProfile, project_ids: &[String]) -> bool {
        let in_project = match &self.project_id {
            Some(p) => {
                project_ids.contains(p) || profile.last_project_id.as_deref() == Some(p.as_str())
            }
            None => true,
        };
        in_project
            && field_matches(&self.environment, Some(&profile.environment))
            && field_matches(&self.agent_id, Some(&profile.agent_id))
    }

    /// Firings are not tied to one agent or project, so only the
    /// environment filter applies.
    pub fn matches_alert(&self, firing: &AlertFiring) -> bool {
        field_matches(&self.environment, firing.environment.as_deref())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Subscription {
    pub channels: HashSet<Channel>,
    pub filter: SubscriptionFilter,
}
