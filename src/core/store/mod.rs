mod alerts;
mod credentials;
pub mod cursor;
mod events;
mod profiles;
mod projects;

pub use alerts::FiringPage;
pub use credentials::hash_key;
pub use events::{AppendOutcome, EventFilter, EventPage, ProfileChange, SCAN_LIMIT};
pub use profiles::profile_cursor;

use anyhow::Result;
use rusqlite::{Connection, OpenFlags};
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex, MutexGuard};
use tracing::info;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS tenants (
    tenant_id TEXT PRIMARY KEY,
    name TEXT NOT NULL,
    created_at INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS api_keys (
    key_id TEXT PRIMARY KEY,
    tenant_id TEXT NOT NULL,
    name TEXT NOT NULL,
    key_hash TEXT NOT NULL UNIQUE,
    access_level TEXT NOT NULL,
    revoked INTEGER NOT NULL DEFAULT 0,
    created_at INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS projects (
    tenant_id TEXT NOT NULL,
    project_id TEXT NOT NULL,
    name TEXT NOT NULL,
    slug TEXT NOT NULL,
    is_default INTEGER NOT NULL DEFAULT 0,
    created_at INTEGER NOT NULL,
    PRIMARY KEY (tenant_id, project_id)
);

CREATE TABLE IF NOT EXISTS agent_projects (
    tenant_id TEXT NOT NULL,
    agent_id TEXT NOT NULL,
    project_id TEXT NOT NULL,
    first_seen_at INTEGER NOT NULL,
    PRIMARY KEY (tenant_id, agent_id, project_id)
);

CREATE TABLE IF NOT EXISTS events (
    seq INTEGER PRIMARY KEY AUTOINCREMENT,
    tenant_id TEXT NOT NULL,
    event_id TEXT NOT NULL,
    agent_id TEXT NOT NULL,
    environment TEXT NOT NULL,
    group_name TEXT,
    project_id TEXT,
    task_id TEXT,
    task_type TEXT,
    task_run_id TEXT,
    action_id TEXT,
    parent_action_id TEXT,
    event_type TEXT NOT NULL,
    severity INTEGER NOT NULL,
    status TEXT,
    duration_ms INTEGER,
    parent_event_id TEXT,
    payload_kind TEXT,
    payload TEXT,
    agent_meta TEXT,
    ts INTEGER NOT NULL,
    received_at INTEGER NOT NULL,
    UNIQUE (tenant_id, event_id)
);

CREATE INDEX IF NOT EXISTS idx_events_tenant_ts ON events(tenant_id, ts, seq);
CREATE INDEX IF NOT EXISTS idx_events_tenant_agent_ts ON events(tenant_id, agent_id, ts);
CREATE INDEX IF NOT EXISTS idx_events_tenant_task_ts ON events(tenant_id, task_id, ts);
CREATE INDEX IF NOT EXISTS idx_events_tenant_project_ts ON events(tenant_id, project_id, ts);
CREATE INDEX IF NOT EXISTS idx_events_tenant_type_ts ON events(tenant_id, event_type, ts);
CREATE INDEX IF NOT EXISTS idx_events_tenant_kind_ts ON events(tenant_id, payload_kind, ts);

CREATE TABLE IF NOT EXISTS agent_profiles (
    tenant_id TEXT NOT NULL,
    agent_id TEXT NOT NULL,
    agent_type TEXT,
    agent_version TEXT,
    framework TEXT,
    runtime TEXT,
    sdk_version TEXT,
    environment TEXT NOT NULL,
    group_name TEXT,
    first_seen_at INTEGER NOT NULL,
    last_seen_at INTEGER NOT NULL,
    last_heartbeat_at INTEGER,
    last_event_type TEXT,
    last_event_at INTEGER,
    last_task_id TEXT,
    last_project_id TEXT,
    stuck_threshold_seconds INTEGER NOT NULL,
    threshold_set_at INTEGER,
    test_scope INTEGER NOT NULL DEFAULT 0,
    PRIMARY KEY (tenant_id, agent_id, test_scope)
);

CREATE INDEX IF NOT EXISTS idx_agent_profiles_seen
    ON agent_profiles(tenant_id, last_seen_at, agent_id, test_scope);

CREATE TABLE IF NOT EXISTS alert_rules (
    rule_id TEXT PRIMARY KEY,
    tenant_id TEXT NOT NULL,
    name TEXT NOT NULL,
    condition_json TEXT NOT NULL,
    project_id TEXT,
    actions_json TEXT NOT NULL,
    cooldown_seconds INTEGER NOT NULL,
    enabled INTEGER NOT NULL DEFAULT 1,
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_alert_rules_tenant ON alert_rules(tenant_id);

CREATE TABLE IF NOT EXISTS alert_firings (
    firing_id TEXT PRIMARY KEY,
    rule_id TEXT NOT NULL,
    tenant_id TEXT NOT NULL,
    rule_name TEXT NOT NULL,
    fired_at INTEGER NOT NULL,
    condition_snapshot TEXT NOT NULL,
    environment TEXT,
    dispatched INTEGER NOT NULL DEFAULT 0
);

CREATE INDEX IF NOT EXISTS idx_alert_firings_rule ON alert_firings(rule_id, fired_at);
CREATE INDEX IF NOT EXISTS idx_alert_firings_tenant ON alert_firings(tenant_id, fired_at);

CREATE TABLE IF NOT EXISTS alert_dispatches (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    firing_id TEXT NOT NULL,
    action TEXT NOT NULL,
    ok INTEGER NOT NULL,
    detail TEXT,
    recorded_at INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_alert_dispatches_firing ON alert_dispatches(firing_id);
";

/// SQLite event log and everything derived from or attached to it.
/// All writers serialize on `db`. Reads go through a small set of read-only
/// connections so long scans never hold the ingest lock; an in-memory store
/// has no second connection to the same data and reads through `db`.
#[derive(Clone)]
pub struct EventStore {
    db: Arc<Mutex<Connection>>,
    readers: Arc<Vec<Mutex<Connection>>>,
    next_reader: Arc<AtomicUsize>,
    default_stuck_threshold: i64,
}

impl EventStore {
    pub async fn open<P: AsRef<Path>>(
        path: P,
        default_stuck_threshold: i64,
        read_connections: usize,
    ) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            tokio::fs::create_dir_all(parent).await?;
        }

        let db = Connection::open(path)?;
        db.pragma_update(None, "journal_mode", "WAL").ok();
        db.pragma_update(None, "synchronous", "NORMAL").ok();
        db.execute_batch(SCHEMA)?;

        let mut readers = Vec::with_capacity(read_connections);
        for _ in 0..read_connections {
            let reader = Connection::open_with_flags(
                path,
                OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
            )?;
            reader.busy_timeout(Duration::from_secs(5))?;
            readers.push(Mutex::new(reader));
        }
        info!(
            "Event store opened at {} ({} read connections)",
            path.display(),
            readers.len()
        );

        Ok(Self {
            db: Arc::new(Mutex::new(db)),
            readers: Arc::new(readers),
            next_reader: Arc::new(AtomicUsize::new(0)),
            default_stuck_threshold,
        })
    }

    pub fn open_in_memory(default_stuck_threshold: i64) -> Result<Self> {
        let db = Connection::open_in_memory()?;
        db.execute_batch(SCHEMA)?;
        Ok(Self {
            db: Arc::new(Mutex::new(db)),
            readers: Arc::new(Vec::new()),
            next_reader: Arc::new(AtomicUsize::new(0)),
            default_stuck_threshold,
        })
    }

    /// A connection for queries. Takes the first idle reader, otherwise
    /// queues on the next one in rotation.
    async fn read(&self) -> MutexGuard<'_, Connection> {
        if self.readers.is_empty() {
            return self.db.lock().await;
        }
        for reader in self.readers.iter() {
            if let Ok(guard) = reader.try_lock() {
                return guard;
            }
        }
        let i = self.next_reader.fetch_add(1, Ordering::Relaxed) % self.readers.len();
        self.readers[i].lock().await
    }

    pub fn default_stuck_threshold(&self) -> i64 {
        self.default_stuck_threshold
    }

    /// Retention sweep. Removes events and firings (with their dispatch
    /// records) older than `cutoff_ms`. Returns `(events, firings)` removed.
    pub async fn purge_before(&self, cutoff_ms: i64) -> Result<(usize, usize)> {
        let mut db = self.db.lock().await;
        let tx = db.transaction()?;
        let events = tx.execute("DELETE FROM events WHERE ts < ?1", [cutoff_ms])?;
        tx.execute(
            "DELETE FROM alert_dispatches WHERE firing_id IN
                (SELECT firing_id FROM alert_firings WHERE fired_at < ?1)",
            [cutoff_ms],
        )?;
        let firings = tx.execute("DELETE FROM alert_firings WHERE fired_at < ?1", [cutoff_ms])?;
        tx.commit()?;
        Ok((events, firings))
    }
}

/// In-memory store for tests, seeded with nothing.
#[cfg(test)]
pub fn test_event_store() -> EventStore {
    EventStore::open_in_memory(300).expect("open in-memory store")
}

#[cfg(test)]
mod tests;
