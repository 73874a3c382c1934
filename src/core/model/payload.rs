//! Event payload envelope and the well-known shapes carried in `data`.
//!
//! `kind` selects a documented schema. Unknown or missing kinds decode to
//! [`PayloadData::Generic`] so new producers never break ingestion.

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const KIND_LLM_CALL: &str = "llm_call";
pub const KIND_PLAN_CREATED: &str = "plan_created";
pub const KIND_PLAN_STEP: &str = "plan_step";
pub const KIND_QUEUE_SNAPSHOT: &str = "queue_snapshot";
pub const KIND_TODO: &str = "todo";
pub const KIND_SCHEDULED: &str = "scheduled";
pub const KIND_ISSUE: &str = "issue";

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Payload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    #[serde(default)]
    pub data: Value,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
}

impl Payload {
    /// Decode `data` according to `kind`. An error means a known kind whose
    /// data does not match its schema.
    pub fn decode(&self) -> Result<PayloadData, String> {
        let data = self.data.clone();
        let decoded = match self.kind.as_deref() {
            Some(KIND_LLM_CALL) => PayloadData::LlmCall(decode_shape(data)?),
            Some(KIND_PLAN_CREATED) => PayloadData::PlanCreated(decode_shape(data)?),
            Some(KIND_PLAN_STEP) => PayloadData::PlanStep(decode_shape(data)?),
            Some(KIND_QUEUE_SNAPSHOT) => PayloadData::QueueSnapshot(decode_shape(data)?),
            Some(KIND_TODO) => PayloadData::Todo(decode_shape(data)?),
            Some(KIND_SCHEDULED) => PayloadData::Scheduled(decode_shape(data)?),
            Some(KIND_ISSUE) => PayloadData::Issue(decode_shape(data)?),
            _ => PayloadData::Generic(data),
        };
        Ok(decoded)
    }
}

fn decode_shape<T: serde::de::DeserializeOwned>(data: Value) -> Result<T, String> {
    serde_json::from_value(data).map_err(|e| e.to_string())
}

#[derive(Debug, Clone, PartialEq)]
pub enum PayloadData {
    LlmCall(LlmCall),
    PlanCreated(PlanCreated),
    PlanStep(PlanStep),
    QueueSnapshot(QueueSnapshot),
    Todo(TodoItem),
    Scheduled(ScheduledReport),
    Issue(IssueReport),
    Generic(Value),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct LlmCall {
    #[serde(default)]
    pub name: Option<String>,
    pub model: String,
    #[serde(default)]
    pub tokens_in: Option<i64>,
    #[serde(default)]
    pub tokens_out: Option<i64>,
    #[serde(default)]
    pub cost: Option<f64>,
    #[serde(default)]
    pub duration_ms: Option<i64>,
    #[serde(default)]
    pub prompt_preview: Option<String>,
    #[serde(default)]
    pub response_preview: Option<String>,
}

impl LlmCall {
    /// Field-by-field extraction used by aggregations. Wrong-typed or missing
    /// numbers contribute nothing instead of dropping the whole call.
    pub fn lenient(data: &Value) -> Self {
        let int = |key: &str| {
            data.get(key)
                .and_then(|v| v.as_i64().or_else(|| v.as_f64().map(|f| f as i64)))
        };
        Self {
            name: data.get("name").and_then(Value::as_str).map(str::to_string),
            model: data
                .get("model")
                .and_then(Value::as_str)
                .unwrap_or("unknown")
                .to_string(),
            tokens_in: int("tokens_in"),
            tokens_out: int("tokens_out"),
            cost: data.get("cost").and_then(Value::as_f64),
            duration_ms: int("duration_ms"),
            prompt_preview: None,
            response_preview: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PlanStepSpec {
    pub index: u32,
    pub description: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PlanCreated {
    pub steps: Vec<PlanStepSpec>,
    #[serde(default)]
    pub revision: Option<u32>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StepAction {
    Started,
    Completed,
    Failed,
    Skipped,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PlanStep {
    pub step_index: u32,
    pub action: StepAction,
    #[serde(default)]
    pub total_steps: Option<u32>,
    #[serde(default)]
    pub summary: Option<String>,
    #[serde(default)]
    pub plan_revision: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QueueSnapshot {
    pub depth: u64,
    #[serde(default)]
    pub oldest_age_seconds: Option<f64>,
    #[serde(default)]
    pub processing: Option<Value>,
    #[serde(default)]
    pub items: Option<Vec<Value>>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TodoAction {
    Created,
    Completed,
    Failed,
    Dismissed,
    Deferred,
}

impl TodoAction {
    pub fn is_closed(&self) -> bool {
        matches!(self, TodoAction::Completed | TodoAction::Dismissed)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TodoItem {
    pub todo_id: String,
    pub action: TodoAction,
    #[serde(default)]
    pub priority: Option<String>,
    #[serde(default)]
    pub source: Option<String>,
    #[serde(default)]
    pub context: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ScheduledItem {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub next_run: Option<String>,
    #[serde(default)]
    pub interval: Option<String>,
    #[serde(default)]
    pub enabled: Option<bool>,
    #[serde(default)]
    pub last_status: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ScheduledReport {
    pub items: Vec<ScheduledItem>,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum IssueAction {
    #[default]
    Reported,
    Resolved,
    Dismissed,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct IssueReport {
    #[serde(default)]
    pub severity: Option<String>,
    #[serde(default)]
    pub issue_id: Option<String>,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub context: Option<Value>,
    #[serde(default)]
    pub action: IssueAction,
    #[serde(default)]
    pub occurrence_count: Option<u64>,
}
