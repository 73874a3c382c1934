use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::event::EventType;
use super::tenant::TEST_ENVIRONMENT;

/// Rebuildable per-agent cache. Every field can be recomputed by replaying
/// the agent's events; it exists so status queries skip a log scan.
///
/// Traffic sent with test keys keeps its own profile, so an agent id reused
/// in the `test` environment never touches the live one.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AgentProfile {
    pub tenant_id: String,
    pub agent_id: String,
    pub agent_type: Option<String>,
    pub agent_version: Option<String>,
    pub framework: Option<String>,
    pub runtime: Option<String>,
    pub sdk_version: Option<String>,
    pub environment: String,
    pub group: Option<String>,
    pub first_seen_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
    pub last_heartbeat_at: Option<DateTime<Utc>>,
    pub last_event_type: Option<EventType>,
    pub last_event_at: Option<DateTime<Utc>>,
    pub last_task_id: Option<String>,
    pub last_project_id: Option<String>,
    pub stuck_threshold_seconds: i64,
}

impl AgentProfile {
    /// Timestamp liveness is measured from. Agents that never heartbeat are
    /// judged on their last event of any kind.
    pub fn liveness_at(&self) -> DateTime<Utc> {
        self.last_heartbeat_at.unwrap_or(self.last_seen_at)
    }

    /// Whether this is the agent's `test` environment profile.
    pub fn is_test(&self) -> bool {
        self.environment == TEST_ENVIRONMENT
    }

    pub fn heartbeat_age_seconds(&self, now: DateTime<Utc>) -> i64 {
        (now - self.liveness_at()).num_seconds().max(0)
    }
}
