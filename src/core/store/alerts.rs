use anyhow::Result;
use chrono::{DateTime, Utc};
use rusqlite::types::Value as SqlValue;
use rusqlite::{Connection, OptionalExtension, Row, TransactionBehavior, params, params_from_iter};

use super::EventStore;
use super::cursor::Cursor;
use crate::core::model::alert::DEFAULT_COOLDOWN_SECONDS;
use crate::core::model::{AlertFiring, AlertRule, AlertRuleDraft, DispatchOutcome, from_millis};

const RULE_COLUMNS: &str = "rule_id, tenant_id, name, condition_json, project_id, actions_json, \
     cooldown_seconds, enabled, created_at, updated_at";

fn row_to_rule(row: &Row<'_>) -> rusqlite::Result<AlertRule> {
    let condition: String = row.get(3)?;
    let actions: String = row.get(5)?;
    Ok(AlertRule {
        rule_id: row.get(0)?,
        tenant_id: row.get(1)?,
        name: row.get(2)?,
        condition: serde_json::from_str(&condition).map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(3, rusqlite::types::Type::Text, Box::new(e))
        })?,
        project_id: row.get(4)?,
        actions: serde_json::from_str(&actions).map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(5, rusqlite::types::Type::Text, Box::new(e))
        })?,
        cooldown_seconds: row.get(6)?,
        enabled: row.get::<_, i64>(7)? != 0,
        created_at: from_millis(row.get(8)?),
        updated_at: from_millis(row.get(9)?),
    })
}

fn load_outcomes(conn: &Connection, firing_id: &str) -> rusqlite::Result<Vec<DispatchOutcome>> {
    let mut stmt = conn.prepare(
        "SELECT action, ok, detail, recorded_at FROM alert_dispatches
         WHERE firing_id = ?1 ORDER BY id ASC",
    )?;
    let rows = stmt.query_map(params![firing_id], |row| {
        Ok(DispatchOutcome {
            action: row.get(0)?,
            ok: row.get::<_, i64>(1)? != 0,
            detail: row.get(2)?,
            recorded_at: from_millis(row.get(3)?),
        })
    })?;
    rows.collect()
}

#[derive(Debug, Clone, Default)]
pub struct FiringPage {
    pub firings: Vec<AlertFiring>,
    pub next_cursor: Option<String>,
}

impl EventStore {
    pub async fn create_rule(&self, tenant_id: &str, draft: AlertRuleDraft) -> Result<AlertRule> {
        let now = Utc::now();
        let rule = AlertRule {
            rule_id: uuid::Uuid::new_v4().to_string(),
            tenant_id: tenant_id.to_string(),
            name: draft.name,
            condition: draft.condition,
            project_id: draft.project_id,
            actions: draft.actions,
            cooldown_seconds: draft.cooldown_seconds.unwrap_or(DEFAULT_COOLDOWN_SECONDS),
            enabled: draft.enabled.unwrap_or(true),
            created_at: from_millis(now.timestamp_millis()),
            updated_at: from_millis(now.timestamp_millis()),
        };

        let db = self.db.lock().await;
        db.execute(
            &format!(
                "INSERT INTO alert_rules ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                RULE_COLUMNS
            ),
            params![
                rule.rule_id,
                rule.tenant_id,
                rule.name,
                serde_json::to_string(&rule.condition)?,
                rule.project_id,
                serde_json::to_string(&rule.actions)?,
                rule.cooldown_seconds,
                rule.enabled as i64,
                rule.created_at.timestamp_millis(),
                rule.updated_at.timestamp_millis(),
            ],
        )?;
        Ok(rule)
    }

    pub async fn list_rules(&self, tenant_id: &str) -> Result<Vec<AlertRule>> {
        let db = self.read().await;
        let mut stmt = db.prepare(&format!(
            "SELECT {} FROM alert_rules WHERE tenant_id = ?1 ORDER BY created_at ASC",
            RULE_COLUMNS
        ))?;
        let rows = stmt.query_map(params![tenant_id], row_to_rule)?;
        let mut rules = Vec::new();
        for row in rows {
            rules.push(row?);
        }
        Ok(rules)
    }

    /// Enabled rules of every tenant, for the periodic sweep.
    pub async fn enabled_rules(&self) -> Result<Vec<AlertRule>> {
        let db = self.read().await;
        let mut stmt = db.prepare(&format!(
            "SELECT {} FROM alert_rules WHERE enabled = 1",
            RULE_COLUMNS
        ))?;
        let rows = stmt.query_map([], row_to_rule)?;
        let mut rules = Vec::new();
        for row in rows {
            rules.push(row?);
        }
        Ok(rules)
    }

    pub async fn get_rule(&self, tenant_id: &str, rule_id: &str) -> Result<Option<AlertRule>> {
        let db = self.read().await;
        let rule = db
            .query_row(
                &format!(
                    "SELECT {} FROM alert_rules WHERE tenant_id = ?1 AND rule_id = ?2",
                    RULE_COLUMNS
                ),
                params![tenant_id, rule_id],
                row_to_rule,
            )
            .optional()?;
        Ok(rule)
    }

    pub async fn replace_rule(
        &self,
        tenant_id: &str,
        rule_id: &str,
        draft: AlertRuleDraft,
    ) -> Result<Option<AlertRule>> {
        {
            let db = self.db.lock().await;
            let updated = db.execute(
                "UPDATE alert_rules SET name = ?3, condition_json = ?4, project_id = ?5,
                    actions_json = ?6, cooldown_seconds = ?7, enabled = ?8, updated_at = ?9
                 WHERE tenant_id = ?1 AND rule_id = ?2",
                params![
                    tenant_id,
                    rule_id,
                    draft.name,
                    serde_json::to_string(&draft.condition)?,
                    draft.project_id,
                    serde_json::to_string(&draft.actions)?,
                    draft.cooldown_seconds.unwrap_or(DEFAULT_COOLDOWN_SECONDS),
                    draft.enabled.unwrap_or(true) as i64,
                    Utc::now().timestamp_millis(),
                ],
            )?;
            if updated == 0 {
                return Ok(None);
            }
        }
        self.get_rule(tenant_id, rule_id).await
    }

    pub async fn delete_rule(&self, tenant_id: &str, rule_id: &str) -> Result<bool> {
        let db = self.db.lock().await;
        let rows = db.execute(
            "DELETE FROM alert_rules WHERE tenant_id = ?1 AND rule_id = ?2",
            params![tenant_id, rule_id],
        )?;
        Ok(rows > 0)
    }

    /// Records a firing unless the rule fired in the same environment within
    /// its cooldown. The check and the insert share one immediate
    /// transaction, so concurrent evaluations of the same rule produce at
    /// most one firing.
    pub async fn try_record_firing(
        &self,
        rule: &AlertRule,
        snapshot: serde_json::Value,
        environment: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<Option<AlertFiring>> {
        let now_ms = now.timestamp_millis();
        let mut db = self.db.lock().await;
        let tx = db.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let last: Option<i64> = tx.query_row(
            "SELECT MAX(fired_at) FROM alert_firings WHERE rule_id = ?1 AND environment IS ?2",
            params![rule.rule_id, environment],
            |row| row.get(0),
        )?;
        if let Some(last) = last
            && now_ms - last < rule.cooldown_seconds * 1000
        {
            return Ok(None);
        }

        let firing = AlertFiring {
            firing_id: uuid::Uuid::new_v4().to_string(),
            rule_id: rule.rule_id.clone(),
            tenant_id: rule.tenant_id.clone(),
            rule_name: rule.name.clone(),
            fired_at: from_millis(now_ms),
            condition_snapshot: snapshot,
            environment: environment.map(str::to_string),
            dispatched: false,
            outcomes: Vec::new(),
        };
        tx.execute(
            "INSERT INTO alert_firings (firing_id, rule_id, tenant_id, rule_name, fired_at,
                                        condition_snapshot, environment)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                firing.firing_id,
                firing.rule_id,
                firing.tenant_id,
                firing.rule_name,
                now_ms,
                serde_json::to_string(&firing.condition_snapshot)?,
                firing.environment,
            ],
        )?;
        tx.commit()?;
        Ok(Some(firing))
    }

    pub async fn record_dispatch(&self, firing_id: &str, outcome: &DispatchOutcome) -> Result<()> {
        let db = self.db.lock().await;
        db.execute(
            "INSERT INTO alert_dispatches (firing_id, action, ok, detail, recorded_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                firing_id,
                outcome.action,
                outcome.ok as i64,
                outcome.detail,
                outcome.recorded_at.timestamp_millis(),
            ],
        )?;
        Ok(())
    }

    pub async fn mark_dispatched(&self, firing_id: &str) -> Result<()> {
        let db = self.db.lock().await;
        db.execute(
            "UPDATE alert_firings SET dispatched = 1 WHERE firing_id = ?1",
            params![firing_id],
        )?;
        Ok(())
    }

    /// Firing history, newest first, with dispatch outcomes attached. An
    /// environment limits the history to firings tripped by that
    /// environment's data.
    pub async fn list_firings(
        &self,
        tenant_id: &str,
        rule_id: Option<&str>,
        environment: Option<&str>,
        cursor: Option<Cursor>,
        limit: usize,
    ) -> Result<FiringPage> {
        let mut sql = String::from(
            "SELECT rowid, firing_id, rule_id, tenant_id, rule_name, fired_at, condition_snapshot,
                    dispatched, environment
             FROM alert_firings WHERE tenant_id = ?",
        );
        let mut values = vec![SqlValue::from(tenant_id.to_string())];
        if let Some(rule_id) = rule_id {
            sql.push_str(" AND rule_id = ?");
            values.push(SqlValue::from(rule_id.to_string()));
        }
        if let Some(env) = environment {
            sql.push_str(" AND environment = ?");
            values.push(SqlValue::from(env.to_string()));
        }
        if let Some(c) = cursor {
            sql.push_str(" AND (fired_at < ? OR (fired_at = ? AND rowid < ?))");
            values.push(SqlValue::from(c.ts));
            values.push(SqlValue::from(c.ts));
            values.push(SqlValue::from(c.seq));
        }
        sql.push_str(&format!(" ORDER BY fired_at DESC, rowid DESC LIMIT {}", limit + 1));

        let db = self.read().await;
        let mut rows_out: Vec<(i64, AlertFiring)> = {
            let mut stmt = db.prepare(&sql)?;
            let rows = stmt.query_map(params_from_iter(values.iter()), |row| {
                let snapshot: String = row.get(6)?;
                Ok((
                    row.get::<_, i64>(0)?,
                    AlertFiring {
                        firing_id: row.get(1)?,
                        rule_id: row.get(2)?,
                        tenant_id: row.get(3)?,
                        rule_name: row.get(4)?,
                        fired_at: from_millis(row.get(5)?),
                        condition_snapshot: serde_json::from_str(&snapshot).map_err(|e| {
                            rusqlite::Error::FromSqlConversionFailure(
                                6,
                                rusqlite::types::Type::Text,
                                Box::new(e),
                            )
                        })?,
                        environment: row.get(8)?,
                        dispatched: row.get::<_, i64>(7)? != 0,
                        outcomes: Vec::new(),
                    },
                ))
            })?;
            let mut out = Vec::new();
            for row in rows {
                out.push(row?);
            }
            out
        };

        let next_cursor = if rows_out.len() > limit {
            rows_out.truncate(limit);
            rows_out.last().map(|(rowid, f)| {
                Cursor {
                    ts: f.fired_at.timestamp_millis(),
                    seq: *rowid,
                }
                .encode()
            })
        } else {
            None
        };

        let mut firings = Vec::with_capacity(rows_out.len());
        for (_, mut firing) in rows_out {
            firing.outcomes = load_outcomes(&db, &firing.firing_id)?;
            firings.push(firing);
        }
        Ok(FiringPage {
            firings,
            next_cursor,
        })
    }
}
