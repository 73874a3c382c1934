use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const TEST_ENVIRONMENT: &str = "test";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccessLevel {
    Full,
    Test,
    Read,
}

impl AccessLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            AccessLevel::Full => "full",
            AccessLevel::Test => "test",
            AccessLevel::Read => "read",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "full" | "live" => Some(AccessLevel::Full),
            "test" => Some(AccessLevel::Test),
            "read" => Some(AccessLevel::Read),
            _ => None,
        }
    }

    pub fn key_prefix(&self) -> &'static str {
        match self {
            AccessLevel::Full => "hw_live_",
            AccessLevel::Test => "hw_test_",
            AccessLevel::Read => "hw_read_",
        }
    }

    pub fn can_write(&self) -> bool {
        !matches!(self, AccessLevel::Read)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Tenant {
    pub tenant_id: String,
    pub name: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ApiKeyRecord {
    pub key_id: String,
    pub tenant_id: String,
    pub name: String,
    pub access_level: AccessLevel,
    pub revoked: bool,
    pub created_at: DateTime<Utc>,
}

/// What a credential resolves to. Handlers only ever see this, never a
/// client-supplied tenant id.
#[derive(Debug, Clone, PartialEq)]
pub struct TenantContext {
    pub tenant_id: String,
    pub key_id: String,
    pub access_level: AccessLevel,
}

impl TenantContext {
    /// Test keys are confined to the test environment for reads and writes.
    pub fn forced_environment(&self) -> Option<&'static str> {
        match self.access_level {
            AccessLevel::Test => Some(TEST_ENVIRONMENT),
            _ => None,
        }
    }
}
