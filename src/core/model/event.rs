use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::payload::Payload;

/// Closed set of lifecycle events an agent can report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    AgentRegistered,
    Heartbeat,
    TaskStarted,
    TaskCompleted,
    TaskFailed,
    ActionStarted,
    ActionCompleted,
    ActionFailed,
    RetryStarted,
    Escalated,
    ApprovalRequested,
    ApprovalReceived,
    Custom,
}

impl EventType {
    pub const ALL: [EventType; 13] = [
        EventType::AgentRegistered,
        EventType::Heartbeat,
        EventType::TaskStarted,
        EventType::TaskCompleted,
        EventType::TaskFailed,
        EventType::ActionStarted,
        EventType::ActionCompleted,
        EventType::ActionFailed,
        EventType::RetryStarted,
        EventType::Escalated,
        EventType::ApprovalRequested,
        EventType::ApprovalReceived,
        EventType::Custom,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::AgentRegistered => "agent_registered",
            EventType::Heartbeat => "heartbeat",
            EventType::TaskStarted => "task_started",
            EventType::TaskCompleted => "task_completed",
            EventType::TaskFailed => "task_failed",
            EventType::ActionStarted => "action_started",
            EventType::ActionCompleted => "action_completed",
            EventType::ActionFailed => "action_failed",
            EventType::RetryStarted => "retry_started",
            EventType::Escalated => "escalated",
            EventType::ApprovalRequested => "approval_requested",
            EventType::ApprovalReceived => "approval_received",
            EventType::Custom => "custom",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|t| t.as_str() == s)
    }

    /// Severity applied when the producer leaves it out.
    pub fn default_severity(&self) -> Severity {
        match self {
            EventType::Heartbeat => Severity::Debug,
            EventType::TaskFailed | EventType::ActionFailed => Severity::Error,
            EventType::RetryStarted | EventType::Escalated | EventType::ApprovalRequested => {
                Severity::Warn
            }
            _ => Severity::Info,
        }
    }

    /// Whether this event moves the agent's "last event" pointer.
    /// Heartbeats only refresh liveness; custom events carry telemetry.
    pub fn is_status_bearing(&self) -> bool {
        !matches!(self, EventType::Heartbeat | EventType::Custom)
    }

    pub fn is_failure(&self) -> bool {
        matches!(self, EventType::TaskFailed | EventType::ActionFailed)
    }

    pub fn is_start(&self) -> bool {
        matches!(self, EventType::TaskStarted | EventType::ActionStarted)
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Debug,
    Info,
    Warn,
    Error,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Debug => "debug",
            Severity::Info => "info",
            Severity::Warn => "warn",
            Severity::Error => "error",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "debug" => Some(Severity::Debug),
            "info" => Some(Severity::Info),
            "warn" | "warning" => Some(Severity::Warn),
            "error" => Some(Severity::Error),
            _ => None,
        }
    }

    /// Numeric rank stored alongside the event so severity floors are index-friendly.
    pub fn rank(&self) -> i64 {
        match self {
            Severity::Debug => 0,
            Severity::Info => 1,
            Severity::Warn => 2,
            Severity::Error => 3,
        }
    }

    pub fn from_rank(rank: i64) -> Self {
        match rank {
            i64::MIN..=0 => Severity::Debug,
            1 => Severity::Info,
            2 => Severity::Warn,
            _ => Severity::Error,
        }
    }
}

/// An immutable fact as stored in the event log.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Event {
    /// Store-assigned sequence, monotonic per deployment.
    pub seq: i64,
    pub event_id: String,
    pub tenant_id: String,
    pub agent_id: String,
    pub environment: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub group: Option<String>,
    pub project_id: Option<String>,
    pub task_id: Option<String>,
    pub task_type: Option<String>,
    pub task_run_id: Option<String>,
    pub action_id: Option<String>,
    pub parent_action_id: Option<String>,
    pub event_type: EventType,
    pub severity: Severity,
    pub status: Option<String>,
    pub duration_ms: Option<i64>,
    pub parent_event_id: Option<String>,
    pub payload: Option<Payload>,
    pub timestamp: DateTime<Utc>,
    pub received_at: DateTime<Utc>,
    /// Producer metadata from the batch envelope, kept so profiles can be
    /// rebuilt from the log alone.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_meta: Option<AgentMeta>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct AgentMeta {
    pub agent_type: Option<String>,
    pub agent_version: Option<String>,
    pub framework: Option<String>,
    pub runtime: Option<String>,
    pub sdk_version: Option<String>,
}

impl AgentMeta {
    pub fn is_empty(&self) -> bool {
        self.agent_type.is_none()
            && self.agent_version.is_none()
            && self.framework.is_none()
            && self.runtime.is_none()
            && self.sdk_version.is_none()
    }
}

impl Event {
    pub fn payload_kind(&self) -> Option<&str> {
        self.payload.as_ref().and_then(|p| p.kind.as_deref())
    }
}

/// Agent/run metadata sent once per batch by the instrumentation library.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct BatchEnvelope {
    #[serde(default)]
    pub agent_id: String,
    pub agent_type: Option<String>,
    pub agent_version: Option<String>,
    pub framework: Option<String>,
    pub runtime: Option<String>,
    pub sdk_version: Option<String>,
    pub environment: Option<String>,
    pub group: Option<String>,
}

impl BatchEnvelope {
    pub fn agent_meta(&self) -> Option<AgentMeta> {
        let meta = AgentMeta {
            agent_type: self.agent_type.clone(),
            agent_version: self.agent_version.clone(),
            framework: self.framework.clone(),
            runtime: self.runtime.clone(),
            sdk_version: self.sdk_version.clone(),
        };
        if meta.is_empty() { None } else { Some(meta) }
    }
}

/// Wire shape of a single event before validation. Every field is optional
/// so that one malformed event never fails deserialization of the batch.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct IncomingEvent {
    pub event_id: Option<String>,
    pub agent_id: Option<String>,
    pub project_id: Option<String>,
    pub task_id: Option<String>,
    pub task_type: Option<String>,
    pub task_run_id: Option<String>,
    pub action_id: Option<String>,
    pub parent_action_id: Option<String>,
    pub event_type: Option<String>,
    pub severity: Option<String>,
    pub status: Option<String>,
    pub duration_ms: Option<i64>,
    pub parent_event_id: Option<String>,
    pub payload: Option<serde_json::Value>,
    /// RFC 3339 string or integer epoch milliseconds.
    pub timestamp: Option<serde_json::Value>,
}
