use anyhow::Result;
use chrono::Utc;
use rusqlite::{OptionalExtension, Row, params};
use sha2::{Digest, Sha256};

use super::EventStore;
use super::projects::insert_default_project;
use crate::core::model::{AccessLevel, ApiKeyRecord, Tenant, TenantContext, from_millis};

pub fn hash_key(raw_key: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(raw_key.as_bytes());
    format!("{:x}", hasher.finalize())
}

fn generate_raw_key(level: AccessLevel) -> String {
    let bytes: [u8; 24] = rand::random();
    format!("{}{}", level.key_prefix(), hex::encode(bytes))
}

fn row_to_key(row: &Row<'_>) -> rusqlite::Result<ApiKeyRecord> {
    let level: String = row.get(3)?;
    Ok(ApiKeyRecord {
        key_id: row.get(0)?,
        tenant_id: row.get(1)?,
        name: row.get(2)?,
        access_level: AccessLevel::parse(&level).unwrap_or(AccessLevel::Read),
        revoked: row.get::<_, i64>(4)? != 0,
        created_at: from_millis(row.get(5)?),
    })
}

impl EventStore {
    /// Creates a tenant, its default project and a first full-access key.
    /// The raw key is returned once and never stored.
    pub async fn create_tenant(&self, name: &str) -> Result<(Tenant, String, ApiKeyRecord)> {
        let tenant_id = uuid::Uuid::new_v4().to_string();
        let now = Utc::now().timestamp_millis();

        {
            let mut db = self.db.lock().await;
            let tx = db.transaction()?;
            tx.execute(
                "INSERT INTO tenants (tenant_id, name, created_at) VALUES (?1, ?2, ?3)",
                params![tenant_id, name, now],
            )?;
            insert_default_project(&tx, &tenant_id, now)?;
            tx.commit()?;
        }

        let (raw_key, record) = self
            .create_api_key(&tenant_id, "default", AccessLevel::Full)
            .await?
            .ok_or_else(|| anyhow::anyhow!("tenant {} vanished during creation", tenant_id))?;

        Ok((
            Tenant {
                tenant_id,
                name: name.to_string(),
                created_at: from_millis(now),
            },
            raw_key,
            record,
        ))
    }

    pub async fn list_tenants(&self) -> Result<Vec<Tenant>> {
        let db = self.read().await;
        let mut stmt =
            db.prepare("SELECT tenant_id, name, created_at FROM tenants ORDER BY created_at ASC")?;
        let rows = stmt.query_map([], |row| {
            Ok(Tenant {
                tenant_id: row.get(0)?,
                name: row.get(1)?,
                created_at: from_millis(row.get(2)?),
            })
        })?;
        let mut tenants = Vec::new();
        for row in rows {
            tenants.push(row?);
        }
        Ok(tenants)
    }

    /// Issues a new key. Returns `None` if the tenant does not exist.
    pub async fn create_api_key(
        &self,
        tenant_id: &str,
        name: &str,
        level: AccessLevel,
    ) -> Result<Option<(String, ApiKeyRecord)>> {
        let raw_key = generate_raw_key(level);
        let key_id = uuid::Uuid::new_v4().to_string();
        let now = Utc::now().timestamp_millis();

        let db = self.db.lock().await;
        let exists: bool = db
            .query_row(
                "SELECT 1 FROM tenants WHERE tenant_id = ?1",
                params![tenant_id],
                |_| Ok(true),
            )
            .optional()?
            .unwrap_or(false);
        if !exists {
            return Ok(None);
        }

        db.execute(
            "INSERT INTO api_keys (key_id, tenant_id, name, key_hash, access_level, revoked, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, 0, ?6)",
            params![key_id, tenant_id, name, hash_key(&raw_key), level.as_str(), now],
        )?;

        Ok(Some((
            raw_key,
            ApiKeyRecord {
                key_id,
                tenant_id: tenant_id.to_string(),
                name: name.to_string(),
                access_level: level,
                revoked: false,
                created_at: from_millis(now),
            },
        )))
    }

    pub async fn list_api_keys(&self, tenant_id: &str) -> Result<Vec<ApiKeyRecord>> {
        let db = self.read().await;
        let mut stmt = db.prepare(
            "SELECT key_id, tenant_id, name, access_level, revoked, created_at
             FROM api_keys WHERE tenant_id = ?1 ORDER BY created_at ASC",
        )?;
        let rows = stmt.query_map(params![tenant_id], row_to_key)?;
        let mut keys = Vec::new();
        for row in rows {
            keys.push(row?);
        }
        Ok(keys)
    }

    pub async fn revoke_api_key(&self, key_id: &str) -> Result<bool> {
        let db = self.db.lock().await;
        let rows = db.execute(
            "UPDATE api_keys SET revoked = 1 WHERE key_id = ?1 AND revoked = 0",
            params![key_id],
        )?;
        Ok(rows > 0)
    }

    /// Resolves a raw bearer key to its tenant. Unknown and revoked keys
    /// both resolve to `None`.
    pub async fn resolve_api_key(&self, raw_key: &str) -> Result<Option<TenantContext>> {
        let db = self.read().await;
        let record = db
            .query_row(
                "SELECT key_id, tenant_id, name, access_level, revoked, created_at
                 FROM api_keys WHERE key_hash = ?1",
                params![hash_key(raw_key)],
                row_to_key,
            )
            .optional()?;
        Ok(record.filter(|r| !r.revoked).map(|r| TenantContext {
            tenant_id: r.tenant_id,
            key_id: r.key_id,
            access_level: r.access_level,
        }))
    }
}
