use anyhow::{Result, bail};
use console::style;

use crate::core::model::AccessLevel;
use crate::core::store::EventStore;
use crate::core::terminal;

pub async fn create_tenant(store: &EventStore, name: &str) -> Result<()> {
    let name = name.trim();
    if name.is_empty() {
        bail!("tenant name must not be empty");
    }
    let (tenant, raw_key, record) = store.create_tenant(name).await?;
    terminal::print_success(&format!("Tenant '{}' created", tenant.name));
    terminal::print_status("Tenant id", &tenant.tenant_id);
    terminal::print_status("Key id", &record.key_id);
    terminal::print_secret("API key", &raw_key);
    terminal::print_warn("Save the key now. It will not be shown again.");
    Ok(())
}

pub async fn list_tenants(store: &EventStore) -> Result<()> {
    let tenants = store.list_tenants().await?;
    if tenants.is_empty() {
        terminal::print_info("No tenants yet. Create one with 'hivewatch tenant create <name>'.");
        return Ok(());
    }
    for tenant in tenants {
        println!(
            "  {}  {}  {}",
            style(&tenant.tenant_id).cyan(),
            style(&tenant.name).bold(),
            style(tenant.created_at.format("%Y-%m-%d %H:%M")).dim()
        );
    }
    Ok(())
}

pub async fn create_key(
    store: &EventStore,
    tenant_id: &str,
    level: AccessLevel,
    name: &str,
) -> Result<()> {
    let Some((raw_key, record)) = store.create_api_key(tenant_id, name, level).await? else {
        bail!("tenant '{}' does not exist", tenant_id);
    };
    terminal::print_success(&format!(
        "{} key '{}' created",
        level.as_str(),
        record.name
    ));
    terminal::print_status("Key id", &record.key_id);
    terminal::print_secret("API key", &raw_key);
    terminal::print_warn("Save the key now. It will not be shown again.");
    Ok(())
}

pub async fn list_keys(store: &EventStore, tenant_id: &str) -> Result<()> {
    let keys = store.list_api_keys(tenant_id).await?;
    if keys.is_empty() {
        terminal::print_info(&format!("No keys for tenant '{}'.", tenant_id));
        return Ok(());
    }
    for key in keys {
        let state = if key.revoked {
            style("revoked").red()
        } else {
            style("active").green()
        };
        println!(
            "  {}  {:<6} {:<8} {}",
            style(&key.key_id).cyan(),
            key.access_level.as_str(),
            state,
            key.name
        );
    }
    Ok(())
}

pub async fn revoke_key(store: &EventStore, key_id: &str) -> Result<()> {
    if store.revoke_api_key(key_id).await? {
        terminal::print_success(&format!("Key {} revoked", key_id));
    } else {
        terminal::print_warn(&format!("No active key with id {}", key_id));
    }
    Ok(())
}

pub async fn rebuild_profile(store: &EventStore, tenant_id: &str, agent_id: &str) -> Result<()> {
    match store.rebuild_profile(tenant_id, agent_id).await? {
        Some(profile) => {
            terminal::print_success(&format!("Profile for agent '{}' rebuilt", agent_id));
            terminal::print_status("Environment", &profile.environment);
            terminal::print_status("Last seen", &profile.last_seen_at.to_rfc3339());
        }
        None => terminal::print_warn(&format!(
            "Agent '{}' has no events for tenant '{}'",
            agent_id, tenant_id
        )),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::store::test_event_store;

    #[tokio::test]
    async fn key_for_unknown_tenant_fails() {
        let store = test_event_store();
        assert!(create_key(&store, "ghost", AccessLevel::Read, "x").await.is_err());
    }

    #[tokio::test]
    async fn blank_tenant_name_fails() {
        let store = test_event_store();
        assert!(create_tenant(&store, "   ").await.is_err());
        assert!(create_tenant(&store, "acme").await.is_ok());
        assert_eq!(store.list_tenants().await.unwrap().len(), 1);
    }
}
