use anyhow::Result;
use rusqlite::types::Value as SqlValue;
use rusqlite::{Connection, Row, params, params_from_iter};
use tracing::warn;

use super::EventStore;
use super::cursor::{Cursor, KeyCursor};
use super::profiles::{apply_event, load_profile, test_scope};
use super::projects::link_agent_project;
use crate::core::model::{AgentProfile, Event, EventType, Severity, from_millis};

/// Upper bound on rows pulled into memory by a single aggregation scan.
pub const SCAN_LIMIT: usize = 50_000;

pub(super) const EVENT_COLUMNS: &str = "seq, event_id, tenant_id, agent_id, environment, group_name, \
     project_id, task_id, task_type, task_run_id, action_id, parent_action_id, event_type, \
     severity, status, duration_ms, parent_event_id, payload, agent_meta, ts, received_at";

pub(super) fn row_to_event(row: &Row<'_>) -> rusqlite::Result<Event> {
    let event_type: String = row.get(12)?;
    let payload: Option<String> = row.get(17)?;
    let agent_meta: Option<String> = row.get(18)?;
    Ok(Event {
        seq: row.get(0)?,
        event_id: row.get(1)?,
        tenant_id: row.get(2)?,
        agent_id: row.get(3)?,
        environment: row.get(4)?,
        group: row.get(5)?,
        project_id: row.get(6)?,
        task_id: row.get(7)?,
        task_type: row.get(8)?,
        task_run_id: row.get(9)?,
        action_id: row.get(10)?,
        parent_action_id: row.get(11)?,
        event_type: EventType::parse(&event_type).unwrap_or(EventType::Custom),
        severity: Severity::from_rank(row.get(13)?),
        status: row.get(14)?,
        duration_ms: row.get(15)?,
        parent_event_id: row.get(16)?,
        payload: payload.and_then(|p| serde_json::from_str(&p).ok()),
        agent_meta: agent_meta.and_then(|m| serde_json::from_str(&m).ok()),
        timestamp: from_millis(row.get(19)?),
        received_at: from_millis(row.get(20)?),
    })
}

/// Inserts one event unless `(tenant_id, event_id)` already exists.
/// Returns the assigned sequence, or `None` for a duplicate.
fn insert_event(conn: &Connection, event: &Event) -> Result<Option<i64>> {
    let payload = event.payload.as_ref().map(serde_json::to_string).transpose()?;
    let agent_meta = event
        .agent_meta
        .as_ref()
        .map(serde_json::to_string)
        .transpose()?;
    let inserted = conn.execute(
        "INSERT INTO events (
            event_id, tenant_id, agent_id, environment, group_name, project_id, task_id,
            task_type, task_run_id, action_id, parent_action_id, event_type, severity, status,
            duration_ms, parent_event_id, payload_kind, payload, agent_meta, ts, received_at
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19, ?20, ?21)
        ON CONFLICT(tenant_id, event_id) DO NOTHING",
        params![
            event.event_id,
            event.tenant_id,
            event.agent_id,
            event.environment,
            event.group,
            event.project_id,
            event.task_id,
            event.task_type,
            event.task_run_id,
            event.action_id,
            event.parent_action_id,
            event.event_type.as_str(),
            event.severity.rank(),
            event.status,
            event.duration_ms,
            event.parent_event_id,
            event.payload_kind(),
            payload,
            agent_meta,
            event.timestamp.timestamp_millis(),
            event.received_at.timestamp_millis(),
        ],
    )?;
    if inserted == 0 {
        return Ok(None);
    }
    Ok(Some(conn.last_insert_rowid()))
}

/// Profile of one agent before and after a batch touched it.
#[derive(Debug, Clone)]
pub struct ProfileChange {
    pub before: Option<AgentProfile>,
    pub after: AgentProfile,
}

#[derive(Debug, Default)]
pub struct AppendOutcome {
    /// Newly stored events with their sequence numbers, in storage order.
    pub inserted: Vec<Event>,
    pub duplicates: usize,
    pub profiles: Vec<ProfileChange>,
    /// Project ids registered implicitly by this batch.
    pub new_projects: Vec<String>,
}

#[derive(Debug, Clone, Default)]
pub struct EventFilter {
    pub project_id: Option<String>,
    pub agent_id: Option<String>,
    pub task_id: Option<String>,
    pub task_run_id: Option<String>,
    pub environment: Option<String>,
    pub payload_kind: Option<String>,
    pub event_types: Vec<EventType>,
    pub min_severity: Option<Severity>,
    pub since_ms: Option<i64>,
    pub until_ms: Option<i64>,
}

impl EventFilter {
    fn where_clause(&self, tenant_id: &str) -> (String, Vec<SqlValue>) {
        let mut clauses = vec!["tenant_id = ?".to_string()];
        let mut values: Vec<SqlValue> = vec![SqlValue::from(tenant_id.to_string())];

        let exact = [
            ("project_id", &self.project_id),
            ("agent_id", &self.agent_id),
            ("task_id", &self.task_id),
            ("task_run_id", &self.task_run_id),
            ("environment", &self.environment),
            ("payload_kind", &self.payload_kind),
        ];
        for (column, value) in exact {
            if let Some(v) = value {
                clauses.push(format!("{} = ?", column));
                values.push(SqlValue::from(v.clone()));
            }
        }
        if !self.event_types.is_empty() {
            let marks = vec!["?"; self.event_types.len()].join(", ");
            clauses.push(format!("event_type IN ({})", marks));
            for t in &self.event_types {
                values.push(SqlValue::from(t.as_str().to_string()));
            }
        }
        if let Some(sev) = self.min_severity {
            clauses.push("severity >= ?".to_string());
            values.push(SqlValue::from(sev.rank()));
        }
        if let Some(since) = self.since_ms {
            clauses.push("ts >= ?".to_string());
            values.push(SqlValue::from(since));
        }
        if let Some(until) = self.until_ms {
            clauses.push("ts <= ?".to_string());
            values.push(SqlValue::from(until));
        }
        (clauses.join(" AND "), values)
    }
}

#[derive(Debug, Clone, Default)]
pub struct EventPage {
    pub events: Vec<Event>,
    pub next_cursor: Option<String>,
}

impl EventStore {
    /// Stores a validated, tenant-stamped batch. Dedup, profile maintenance
    /// and project registration happen in one transaction.
    pub async fn append(&self, mut events: Vec<Event>) -> Result<AppendOutcome> {
        events.sort_by_key(|e| e.timestamp);

        let mut db = self.db.lock().await;
        let tx = db.transaction()?;
        let mut outcome = AppendOutcome::default();
        let mut touched: Vec<(String, String, bool, Option<AgentProfile>)> = Vec::new();

        for mut event in events {
            let Some(seq) = insert_event(&tx, &event)? else {
                outcome.duplicates += 1;
                continue;
            };
            event.seq = seq;

            let test = test_scope(&event.environment);
            if !touched
                .iter()
                .any(|(t, a, s, _)| *t == event.tenant_id && *a == event.agent_id && *s == test)
            {
                let before = load_profile(&tx, &event.tenant_id, &event.agent_id, test)?;
                touched.push((event.tenant_id.clone(), event.agent_id.clone(), test, before));
            }
            apply_event(&tx, &event, self.default_stuck_threshold)?;

            if let Some(project_id) = &event.project_id
                && link_agent_project(
                    &tx,
                    &event.tenant_id,
                    &event.agent_id,
                    project_id,
                    event.received_at.timestamp_millis(),
                )?
            {
                outcome.new_projects.push(project_id.clone());
            }
            outcome.inserted.push(event);
        }

        for (tenant_id, agent_id, test, before) in touched {
            if let Some(after) = load_profile(&tx, &tenant_id, &agent_id, test)? {
                outcome.profiles.push(ProfileChange { before, after });
            }
        }

        tx.commit()?;
        Ok(outcome)
    }

    /// Filtered page ordered newest first. `limit` is clamped by the caller.
    pub async fn query_events(
        &self,
        tenant_id: &str,
        filter: &EventFilter,
        cursor: Option<Cursor>,
        limit: usize,
    ) -> Result<EventPage> {
        let (mut clause, mut values) = filter.where_clause(tenant_id);
        if let Some(c) = cursor {
            clause.push_str(" AND (ts < ? OR (ts = ? AND seq < ?))");
            values.push(SqlValue::from(c.ts));
            values.push(SqlValue::from(c.ts));
            values.push(SqlValue::from(c.seq));
        }
        let sql = format!(
            "SELECT {} FROM events WHERE {} ORDER BY ts DESC, seq DESC LIMIT {}",
            EVENT_COLUMNS,
            clause,
            limit + 1
        );

        let db = self.read().await;
        let mut stmt = db.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(values.iter()), row_to_event)?;
        let mut events = Vec::new();
        for row in rows {
            events.push(row?);
        }

        let next_cursor = if events.len() > limit {
            events.truncate(limit);
            events.last().map(|e| {
                Cursor {
                    ts: e.timestamp.timestamp_millis(),
                    seq: e.seq,
                }
                .encode()
            })
        } else {
            None
        };
        Ok(EventPage {
            events,
            next_cursor,
        })
    }

    /// All matching events in chronological order, capped at [`SCAN_LIMIT`]
    /// (the most recent rows are kept when the cap is hit).
    pub async fn scan_events(&self, tenant_id: &str, filter: &EventFilter) -> Result<Vec<Event>> {
        let (clause, values) = filter.where_clause(tenant_id);
        let sql = format!(
            "SELECT {} FROM events WHERE {} ORDER BY ts DESC, seq DESC LIMIT {}",
            EVENT_COLUMNS, clause, SCAN_LIMIT
        );

        let db = self.read().await;
        let mut stmt = db.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(values.iter()), row_to_event)?;
        let mut events = Vec::new();
        for row in rows {
            events.push(row?);
        }
        if events.len() == SCAN_LIMIT {
            warn!("Event scan for tenant {} hit the {} row cap", tenant_id, SCAN_LIMIT);
        }
        events.reverse();
        Ok(events)
    }

    pub async fn count_events(&self, tenant_id: &str, filter: &EventFilter) -> Result<i64> {
        let (clause, values) = filter.where_clause(tenant_id);
        let sql = format!("SELECT COUNT(*) FROM events WHERE {}", clause);
        let db = self.read().await;
        let count = db.query_row(&sql, params_from_iter(values.iter()), |row| row.get(0))?;
        Ok(count)
    }

    /// Every event of one task in chronological order.
    pub async fn task_events(&self, tenant_id: &str, task_id: &str) -> Result<Vec<Event>> {
        let filter = EventFilter {
            task_id: Some(task_id.to_string()),
            ..Default::default()
        };
        self.scan_events(tenant_id, &filter).await
    }

    /// Task ids with their latest activity (ms), ordered by
    /// `(last_ts, task_id)` descending and starting after `after`. Tasks are
    /// grouped across their runs; `filter` narrows which events count as
    /// activity.
    pub async fn recent_task_ids(
        &self,
        tenant_id: &str,
        filter: &EventFilter,
        after: Option<&KeyCursor>,
        limit: usize,
    ) -> Result<Vec<(String, i64)>> {
        let (clause, mut values) = filter.where_clause(tenant_id);
        let having = match after {
            Some(c) => {
                values.push(SqlValue::from(c.ts));
                values.push(SqlValue::from(c.key.clone()));
                " HAVING (last_ts, task_id) < (?, ?)"
            }
            None => "",
        };
        let sql = format!(
            "SELECT task_id, MAX(ts) AS last_ts FROM events
             WHERE {} AND task_id IS NOT NULL
             GROUP BY task_id{} ORDER BY last_ts DESC, task_id DESC LIMIT {}",
            clause, having, limit
        );
        let db = self.read().await;
        let mut stmt = db.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(values.iter()), |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
        })?;
        let mut ids = Vec::new();
        for row in rows {
            ids.push(row?);
        }
        Ok(ids)
    }
}
