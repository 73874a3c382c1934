use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const DEFAULT_COOLDOWN_SECONDS: i64 = 300;

fn default_min_tasks() -> i64 {
    5
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AlertCondition {
    /// Any agent in scope without a heartbeat for `threshold_seconds`.
    AgentStuck { threshold_seconds: i64 },
    TaskFailureCount { count: i64, window_seconds: i64 },
    ErrorRate {
        threshold_percent: f64,
        window_seconds: i64,
        #[serde(default = "default_min_tasks")]
        min_tasks: i64,
    },
    DurationExceeded { threshold_ms: i64 },
    HeartbeatLost { agent_id: String, threshold_seconds: i64 },
    CostThreshold {
        threshold_usd: f64,
        window_seconds: i64,
        #[serde(default)]
        agent_id: Option<String>,
    },
}

impl AlertCondition {
    pub fn type_name(&self) -> &'static str {
        match self {
            AlertCondition::AgentStuck { .. } => "agent_stuck",
            AlertCondition::TaskFailureCount { .. } => "task_failure_count",
            AlertCondition::ErrorRate { .. } => "error_rate",
            AlertCondition::DurationExceeded { .. } => "duration_exceeded",
            AlertCondition::HeartbeatLost { .. } => "heartbeat_lost",
            AlertCondition::CostThreshold { .. } => "cost_threshold",
        }
    }

    /// Conditions that can become true without any new event arriving.
    /// These are checked by the periodic sweep rather than on ingest.
    pub fn is_time_driven(&self) -> bool {
        matches!(
            self,
            AlertCondition::AgentStuck { .. } | AlertCondition::HeartbeatLost { .. }
        )
    }

    pub fn validate(&self) -> Result<(), String> {
        let positive = |name: &str, v: i64| {
            if v > 0 {
                Ok(())
            } else {
                Err(format!("{} must be greater than zero", name))
            }
        };
        match self {
            AlertCondition::AgentStuck { threshold_seconds } => {
                positive("threshold_seconds", *threshold_seconds)
            }
            AlertCondition::TaskFailureCount {
                count,
                window_seconds,
            } => {
                positive("count", *count)?;
                positive("window_seconds", *window_seconds)
            }
            AlertCondition::ErrorRate {
                threshold_percent,
                window_seconds,
                min_tasks,
            } => {
                if !(0.0..=100.0).contains(threshold_percent) {
                    return Err("threshold_percent must be between 0 and 100".to_string());
                }
                positive("window_seconds", *window_seconds)?;
                positive("min_tasks", *min_tasks)
            }
            AlertCondition::DurationExceeded { threshold_ms } => {
                positive("threshold_ms", *threshold_ms)
            }
            AlertCondition::HeartbeatLost {
                agent_id,
                threshold_seconds,
            } => {
                if agent_id.trim().is_empty() {
                    return Err("agent_id is required".to_string());
                }
                positive("threshold_seconds", *threshold_seconds)
            }
            AlertCondition::CostThreshold {
                threshold_usd,
                window_seconds,
                ..
            } => {
                if *threshold_usd <= 0.0 {
                    return Err("threshold_usd must be greater than zero".to_string());
                }
                positive("window_seconds", *window_seconds)
            }
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AlertAction {
    Webhook {
        url: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        secret: Option<String>,
    },
    Notify,
    Log,
}

impl AlertAction {
    pub fn type_name(&self) -> &'static str {
        match self {
            AlertAction::Webhook { .. } => "webhook",
            AlertAction::Notify => "notify",
            AlertAction::Log => "log",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AlertRule {
    pub rule_id: String,
    pub tenant_id: String,
    pub name: String,
    pub condition: AlertCondition,
    pub project_id: Option<String>,
    pub actions: Vec<AlertAction>,
    pub cooldown_seconds: i64,
    pub enabled: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Fields a client may set when creating or replacing a rule.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertRuleDraft {
    pub name: String,
    pub condition: AlertCondition,
    #[serde(default)]
    pub project_id: Option<String>,
    #[serde(default)]
    pub actions: Vec<AlertAction>,
    #[serde(default)]
    pub cooldown_seconds: Option<i64>,
    #[serde(default)]
    pub enabled: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DispatchOutcome {
    pub action: String,
    pub ok: bool,
    pub detail: Option<String>,
    pub recorded_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AlertFiring {
    pub firing_id: String,
    pub rule_id: String,
    pub tenant_id: String,
    pub rule_name: String,
    pub fired_at: DateTime<Utc>,
    pub condition_snapshot: serde_json::Value,
    /// Environment whose data tripped the rule. Cooldowns and live delivery
    /// are kept apart per environment.
    pub environment: Option<String>,
    /// Set once every action has been attempted, whatever the outcome.
    pub dispatched: bool,
    pub outcomes: Vec<DispatchOutcome>,
}
