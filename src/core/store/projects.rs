use anyhow::Result;
use chrono::Utc;
use rusqlite::{Connection, OptionalExtension, Row, params};

use super::EventStore;
use crate::core::model::project::slugify;
use crate::core::model::{DEFAULT_PROJECT_ID, Project, from_millis};

const PROJECT_COLUMNS: &str = "project_id, tenant_id, name, slug, is_default, created_at";

fn row_to_project(row: &Row<'_>) -> rusqlite::Result<Project> {
    Ok(Project {
        project_id: row.get(0)?,
        tenant_id: row.get(1)?,
        name: row.get(2)?,
        slug: row.get(3)?,
        is_default: row.get::<_, i64>(4)? != 0,
        created_at: from_millis(row.get(5)?),
    })
}

pub(super) fn insert_default_project(conn: &Connection, tenant_id: &str, now_ms: i64) -> rusqlite::Result<()> {
    conn.execute(
        "INSERT INTO projects (tenant_id, project_id, name, slug, is_default, created_at)
         VALUES (?1, ?2, 'Default', ?2, 1, ?3)
         ON CONFLICT DO NOTHING",
        params![tenant_id, DEFAULT_PROJECT_ID, now_ms],
    )?;
    Ok(())
}

/// Records that `agent_id` reported into `project_id`, registering the
/// project on first sight. Returns true when the project was new.
pub(super) fn link_agent_project(
    conn: &Connection,
    tenant_id: &str,
    agent_id: &str,
    project_id: &str,
    now_ms: i64,
) -> rusqlite::Result<bool> {
    let created = conn.execute(
        "INSERT INTO projects (tenant_id, project_id, name, slug, is_default, created_at)
         VALUES (?1, ?2, ?2, ?2, 0, ?3)
         ON CONFLICT DO NOTHING",
        params![tenant_id, project_id, now_ms],
    )? > 0;
    conn.execute(
        "INSERT INTO agent_projects (tenant_id, agent_id, project_id, first_seen_at)
         VALUES (?1, ?2, ?3, ?4)
         ON CONFLICT DO NOTHING",
        params![tenant_id, agent_id, project_id, now_ms],
    )?;
    Ok(created)
}

impl EventStore {
    pub async fn list_projects(&self, tenant_id: &str) -> Result<Vec<Project>> {
        let db = self.read().await;
        let mut stmt = db.prepare(&format!(
            "SELECT {} FROM projects WHERE tenant_id = ?1 ORDER BY is_default DESC, name ASC",
            PROJECT_COLUMNS
        ))?;
        let rows = stmt.query_map(params![tenant_id], row_to_project)?;
        let mut projects = Vec::new();
        for row in rows {
            projects.push(row?);
        }
        Ok(projects)
    }

    pub async fn get_project(&self, tenant_id: &str, project_id: &str) -> Result<Option<Project>> {
        let db = self.read().await;
        let project = db
            .query_row(
                &format!(
                    "SELECT {} FROM projects WHERE tenant_id = ?1 AND project_id = ?2",
                    PROJECT_COLUMNS
                ),
                params![tenant_id, project_id],
                row_to_project,
            )
            .optional()?;
        Ok(project)
    }

    /// Creates a project whose id is the slug of `name`. Returns `None` when
    /// the tenant already has a project with that slug.
    pub async fn create_project(&self, tenant_id: &str, name: &str) -> Result<Option<Project>> {
        let slug = slugify(name);
        let now = Utc::now();
        let db = self.db.lock().await;
        let inserted = db.execute(
            "INSERT INTO projects (tenant_id, project_id, name, slug, is_default, created_at)
             VALUES (?1, ?2, ?3, ?2, 0, ?4)
             ON CONFLICT DO NOTHING",
            params![tenant_id, slug, name.trim(), now.timestamp_millis()],
        )?;
        if inserted == 0 {
            return Ok(None);
        }
        Ok(Some(Project {
            project_id: slug.clone(),
            tenant_id: tenant_id.to_string(),
            name: name.trim().to_string(),
            slug,
            is_default: false,
            created_at: from_millis(now.timestamp_millis()),
        }))
    }

    /// Renames a project. The id and slug stay stable.
    pub async fn rename_project(
        &self,
        tenant_id: &str,
        project_id: &str,
        name: &str,
    ) -> Result<Option<Project>> {
        {
            let db = self.db.lock().await;
            let updated = db.execute(
                "UPDATE projects SET name = ?3 WHERE tenant_id = ?1 AND project_id = ?2",
                params![tenant_id, project_id, name.trim()],
            )?;
            if updated == 0 {
                return Ok(None);
            }
        }
        self.get_project(tenant_id, project_id).await
    }

    /// Deletes a non-default project and its agent links. Events keep
    /// their project id.
    pub async fn delete_project(&self, tenant_id: &str, project_id: &str) -> Result<bool> {
        let mut db = self.db.lock().await;
        let tx = db.transaction()?;
        let deleted = tx.execute(
            "DELETE FROM projects WHERE tenant_id = ?1 AND project_id = ?2 AND is_default = 0",
            params![tenant_id, project_id],
        )?;
        if deleted > 0 {
            tx.execute(
                "DELETE FROM agent_projects WHERE tenant_id = ?1 AND project_id = ?2",
                params![tenant_id, project_id],
            )?;
        }
        tx.commit()?;
        Ok(deleted > 0)
    }

    pub async fn agent_project_ids(&self, tenant_id: &str, agent_id: &str) -> Result<Vec<String>> {
        let db = self.read().await;
        let mut stmt = db.prepare(
            "SELECT project_id FROM agent_projects WHERE tenant_id = ?1 AND agent_id = ?2
             ORDER BY first_seen_at ASC",
        )?;
        let rows = stmt.query_map(params![tenant_id, agent_id], |row| row.get::<_, String>(0))?;
        let mut ids = Vec::new();
        for row in rows {
            ids.push(row?);
        }
        Ok(ids)
    }
}
