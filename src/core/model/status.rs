use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    Idle,
    Processing,
    WaitingApproval,
    Error,
    Stuck,
}

impl AgentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentStatus::Idle => "idle",
            AgentStatus::Processing => "processing",
            AgentStatus::WaitingApproval => "waiting_approval",
            AgentStatus::Error => "error",
            AgentStatus::Stuck => "stuck",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "idle" => Some(AgentStatus::Idle),
            "processing" => Some(AgentStatus::Processing),
            "waiting_approval" => Some(AgentStatus::WaitingApproval),
            "error" => Some(AgentStatus::Error),
            "stuck" => Some(AgentStatus::Stuck),
            _ => None,
        }
    }
}

impl std::fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Processing,
    Completed,
    Failed,
    Escalated,
    Waiting,
    Stuck,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Processing => "processing",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Escalated => "escalated",
            TaskStatus::Waiting => "waiting",
            TaskStatus::Stuck => "stuck",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "processing" => Some(TaskStatus::Processing),
            "completed" => Some(TaskStatus::Completed),
            "failed" => Some(TaskStatus::Failed),
            "escalated" => Some(TaskStatus::Escalated),
            "waiting" => Some(TaskStatus::Waiting),
            "stuck" => Some(TaskStatus::Stuck),
            _ => None,
        }
    }
}
