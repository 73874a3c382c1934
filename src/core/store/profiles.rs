use anyhow::Result;
use rusqlite::types::Value as SqlValue;
use rusqlite::{Connection, OptionalExtension, Row, params, params_from_iter};
use serde_json::Value;

use super::EventStore;
use super::cursor::KeyCursor;
use super::events::{EVENT_COLUMNS, row_to_event};
use crate::core::model::{AgentProfile, Event, EventType, TEST_ENVIRONMENT, from_millis};

const PROFILE_COLUMNS: &str = "tenant_id, agent_id, agent_type, agent_version, framework, runtime, \
     sdk_version, environment, group_name, first_seen_at, last_seen_at, last_heartbeat_at, \
     last_event_type, last_event_at, last_task_id, last_project_id, stuck_threshold_seconds";

fn row_to_profile(row: &Row<'_>) -> rusqlite::Result<AgentProfile> {
    let last_event_type: Option<String> = row.get(12)?;
    Ok(AgentProfile {
        tenant_id: row.get(0)?,
        agent_id: row.get(1)?,
        agent_type: row.get(2)?,
        agent_version: row.get(3)?,
        framework: row.get(4)?,
        runtime: row.get(5)?,
        sdk_version: row.get(6)?,
        environment: row.get(7)?,
        group: row.get(8)?,
        first_seen_at: from_millis(row.get(9)?),
        last_seen_at: from_millis(row.get(10)?),
        last_heartbeat_at: row.get::<_, Option<i64>>(11)?.map(from_millis),
        last_event_type: last_event_type.as_deref().and_then(EventType::parse),
        last_event_at: row.get::<_, Option<i64>>(13)?.map(from_millis),
        last_task_id: row.get(14)?,
        last_project_id: row.get(15)?,
        stuck_threshold_seconds: row.get(16)?,
    })
}

/// Profile partition an environment writes to. Test traffic never shares a
/// row with live traffic for the same agent id.
pub(super) fn test_scope(environment: &str) -> bool {
    environment == TEST_ENVIRONMENT
}

pub(super) fn load_profile(
    conn: &Connection,
    tenant_id: &str,
    agent_id: &str,
    test: bool,
) -> rusqlite::Result<Option<AgentProfile>> {
    conn.query_row(
        &format!(
            "SELECT {} FROM agent_profiles WHERE tenant_id = ?1 AND agent_id = ?2 AND test_scope = ?3",
            PROFILE_COLUMNS
        ),
        params![tenant_id, agent_id, test],
        row_to_profile,
    )
    .optional()
}

/// Threshold override carried by a registration payload.
fn registered_threshold(event: &Event) -> Option<i64> {
    if event.event_type != EventType::AgentRegistered {
        return None;
    }
    event
        .payload
        .as_ref()
        .and_then(|p| p.data.get("stuck_threshold_seconds"))
        .and_then(Value::as_i64)
        .filter(|v| *v > 0)
}

/// Folds one stored event into its agent's profile. Every update is guarded
/// so the newest timestamp wins no matter which order events arrive in.
pub(super) fn apply_event(
    conn: &Connection,
    event: &Event,
    default_stuck_threshold: i64,
) -> rusqlite::Result<()> {
    let ts = event.timestamp.timestamp_millis();
    let test = test_scope(&event.environment);
    let meta = event.agent_meta.clone().unwrap_or_default();

    conn.execute(
        "INSERT INTO agent_profiles (
            tenant_id, agent_id, agent_type, agent_version, framework, runtime, sdk_version,
            environment, group_name, first_seen_at, last_seen_at, stuck_threshold_seconds,
            test_scope
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?10, ?11, ?12)
        ON CONFLICT(tenant_id, agent_id, test_scope) DO NOTHING",
        params![
            event.tenant_id,
            event.agent_id,
            meta.agent_type,
            meta.agent_version,
            meta.framework,
            meta.runtime,
            meta.sdk_version,
            event.environment,
            event.group,
            ts,
            default_stuck_threshold,
            test,
        ],
    )?;

    conn.execute(
        "UPDATE agent_profiles
         SET first_seen_at = MIN(first_seen_at, ?4), last_seen_at = MAX(last_seen_at, ?4)
         WHERE tenant_id = ?1 AND agent_id = ?2 AND test_scope = ?3",
        params![event.tenant_id, event.agent_id, test, ts],
    )?;

    match event.event_type {
        EventType::Custom => {}
        EventType::Heartbeat => {
            conn.execute(
                "UPDATE agent_profiles SET last_heartbeat_at = ?4
                 WHERE tenant_id = ?1 AND agent_id = ?2 AND test_scope = ?3
                   AND (last_heartbeat_at IS NULL OR last_heartbeat_at < ?4)",
                params![event.tenant_id, event.agent_id, test, ts],
            )?;
        }
        event_type => {
            conn.execute(
                "UPDATE agent_profiles SET
                    last_event_type = ?4,
                    last_event_at = ?5,
                    last_task_id = COALESCE(?6, last_task_id),
                    last_project_id = COALESCE(?7, last_project_id),
                    environment = ?8,
                    group_name = COALESCE(?9, group_name),
                    agent_type = COALESCE(?10, agent_type),
                    agent_version = COALESCE(?11, agent_version),
                    framework = COALESCE(?12, framework),
                    runtime = COALESCE(?13, runtime),
                    sdk_version = COALESCE(?14, sdk_version)
                 WHERE tenant_id = ?1 AND agent_id = ?2 AND test_scope = ?3
                   AND (last_event_at IS NULL OR last_event_at <= ?5)",
                params![
                    event.tenant_id,
                    event.agent_id,
                    test,
                    event_type.as_str(),
                    ts,
                    event.task_id,
                    event.project_id,
                    event.environment,
                    event.group,
                    meta.agent_type,
                    meta.agent_version,
                    meta.framework,
                    meta.runtime,
                    meta.sdk_version,
                ],
            )?;
            if let Some(threshold) = registered_threshold(event) {
                conn.execute(
                    "UPDATE agent_profiles SET stuck_threshold_seconds = ?4, threshold_set_at = ?5
                     WHERE tenant_id = ?1 AND agent_id = ?2 AND test_scope = ?3
                       AND (threshold_set_at IS NULL OR threshold_set_at <= ?5)",
                    params![event.tenant_id, event.agent_id, test, threshold, ts],
                )?;
            }
        }
    }
    Ok(())
}

/// Shared WHERE clause of the profile listings.
fn profile_filter(
    tenant_id: &str,
    environment: Option<&str>,
    project_id: Option<&str>,
) -> (String, Vec<SqlValue>) {
    let mut sql = "tenant_id = ?".to_string();
    let mut values = vec![SqlValue::from(tenant_id.to_string())];
    if let Some(env) = environment {
        sql.push_str(" AND environment = ?");
        values.push(SqlValue::from(env.to_string()));
    }
    if let Some(project) = project_id {
        sql.push_str(
            " AND agent_id IN (SELECT agent_id FROM agent_projects WHERE tenant_id = ? AND project_id = ?)",
        );
        values.push(SqlValue::from(tenant_id.to_string()));
        values.push(SqlValue::from(project.to_string()));
    }
    (sql, values)
}

fn collect_profiles(
    conn: &Connection,
    sql: &str,
    values: &[SqlValue],
) -> rusqlite::Result<Vec<AgentProfile>> {
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt.query_map(params_from_iter(values.iter()), row_to_profile)?;
    let mut profiles = Vec::new();
    for row in rows {
        profiles.push(row?);
    }
    Ok(profiles)
}

/// Keyset position of a profile in the agent listing.
pub fn profile_cursor(profile: &AgentProfile) -> KeyCursor {
    KeyCursor {
        ts: profile.last_seen_at.timestamp_millis(),
        rank: i64::from(profile.is_test()),
        key: profile.agent_id.clone(),
    }
}

impl EventStore {
    /// An agent's profile. `environment` pins the lookup to that
    /// environment; without it the live profile is preferred over the test
    /// one.
    pub async fn get_profile(
        &self,
        tenant_id: &str,
        agent_id: &str,
        environment: Option<&str>,
    ) -> Result<Option<AgentProfile>> {
        let db = self.read().await;
        let profile = match environment {
            Some(env) => load_profile(&db, tenant_id, agent_id, test_scope(env))?
                .filter(|p| p.environment == env),
            None => db
                .query_row(
                    &format!(
                        "SELECT {} FROM agent_profiles WHERE tenant_id = ?1 AND agent_id = ?2
                         ORDER BY test_scope ASC LIMIT 1",
                        PROFILE_COLUMNS
                    ),
                    params![tenant_id, agent_id],
                    row_to_profile,
                )
                .optional()?,
        };
        Ok(profile)
    }

    /// Every matching profile, most recently seen first.
    pub async fn list_profiles(
        &self,
        tenant_id: &str,
        environment: Option<&str>,
        project_id: Option<&str>,
    ) -> Result<Vec<AgentProfile>> {
        let (clause, values) = profile_filter(tenant_id, environment, project_id);
        let sql = format!(
            "SELECT {} FROM agent_profiles WHERE {} ORDER BY last_seen_at DESC",
            PROFILE_COLUMNS, clause
        );
        let db = self.read().await;
        Ok(collect_profiles(&db, &sql, &values)?)
    }

    /// One page of profiles ordered by `(last_seen_at, agent_id, test_scope)`
    /// descending, starting after `cursor`.
    pub async fn page_profiles(
        &self,
        tenant_id: &str,
        environment: Option<&str>,
        project_id: Option<&str>,
        cursor: Option<&KeyCursor>,
        limit: usize,
    ) -> Result<Vec<AgentProfile>> {
        let (mut clause, mut values) = profile_filter(tenant_id, environment, project_id);
        if let Some(c) = cursor {
            clause.push_str(" AND (last_seen_at, agent_id, test_scope) < (?, ?, ?)");
            values.push(SqlValue::from(c.ts));
            values.push(SqlValue::from(c.key.clone()));
            values.push(SqlValue::from(c.rank));
        }
        let sql = format!(
            "SELECT {} FROM agent_profiles WHERE {}
             ORDER BY last_seen_at DESC, agent_id DESC, test_scope DESC LIMIT {}",
            PROFILE_COLUMNS, clause, limit
        );
        let db = self.read().await;
        Ok(collect_profiles(&db, &sql, &values)?)
    }

    /// Every profile across all tenants. Used by the liveness watchdog.
    pub async fn all_profiles(&self) -> Result<Vec<AgentProfile>> {
        let db = self.read().await;
        let sql = format!("SELECT {} FROM agent_profiles", PROFILE_COLUMNS);
        Ok(collect_profiles(&db, &sql, &[])?)
    }

    /// Recomputes an agent's profiles by replaying its events in storage
    /// order. Returns the live profile (the test one if there is no live
    /// one), or `None` if the agent has no events left.
    pub async fn rebuild_profile(&self, tenant_id: &str, agent_id: &str) -> Result<Option<AgentProfile>> {
        let mut db = self.db.lock().await;
        let tx = db.transaction()?;
        tx.execute(
            "DELETE FROM agent_profiles WHERE tenant_id = ?1 AND agent_id = ?2",
            params![tenant_id, agent_id],
        )?;

        let events = {
            let mut stmt = tx.prepare(&format!(
                "SELECT {} FROM events WHERE tenant_id = ?1 AND agent_id = ?2 ORDER BY seq ASC",
                EVENT_COLUMNS
            ))?;
            let rows = stmt.query_map(params![tenant_id, agent_id], row_to_event)?;
            let mut events = Vec::new();
            for row in rows {
                events.push(row?);
            }
            events
        };
        for event in &events {
            apply_event(&tx, event, self.default_stuck_threshold)?;
        }

        let profile = match load_profile(&tx, tenant_id, agent_id, false)? {
            Some(live) => Some(live),
            None => load_profile(&tx, tenant_id, agent_id, true)?,
        };
        tx.commit()?;
        Ok(profile)
    }
}
