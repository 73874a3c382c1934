pub mod alert;
pub mod event;
pub mod payload;
pub mod profile;
pub mod project;
pub mod status;
pub mod tenant;

pub use alert::{AlertAction, AlertCondition, AlertFiring, AlertRule, AlertRuleDraft, DispatchOutcome};
pub use event::{AgentMeta, BatchEnvelope, Event, EventType, IncomingEvent, Severity};
pub use payload::{Payload, PayloadData};
pub use profile::AgentProfile;
pub use project::{DEFAULT_PROJECT_ID, Project};
pub use status::{AgentStatus, TaskStatus};
pub use tenant::{AccessLevel, ApiKeyRecord, TEST_ENVIRONMENT, Tenant, TenantContext};

use chrono::{DateTime, Utc};

/// Millisecond timestamps are the storage representation for every time column.
pub fn from_millis(ms: i64) -> DateTime<Utc> {
    DateTime::<Utc>::from_timestamp_millis(ms).unwrap_or_default()
}
