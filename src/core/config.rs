use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use tracing::info;

pub const CONFIG_FILE_NAME: &str = "hivewatch.toml";

#[derive(Debug, Clone, Deserialize, Default)]
pub struct HivewatchConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub ingest: IngestConfig,
    #[serde(default)]
    pub agents: AgentConfig,
    #[serde(default)]
    pub alerts: AlertConfig,
    #[serde(default)]
    pub live: LiveConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Allowed CORS origins. Empty allows any origin.
    #[serde(default)]
    pub cors_origins: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    /// SQLite file. Defaults to `<data dir>/hivewatch/hivewatch.db`.
    #[serde(default)]
    pub path: Option<PathBuf>,
    /// Days of events and firings to keep. 0 keeps everything.
    #[serde(default = "default_retention_days")]
    pub retention_days: u32,
    /// Read-only connections serving queries alongside the writer.
    #[serde(default = "default_read_connections")]
    pub read_connections: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct IngestConfig {
    #[serde(default = "default_max_batch_events")]
    pub max_batch_events: usize,
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,
    #[serde(default = "default_max_payload_bytes")]
    pub max_payload_bytes: usize,
    #[serde(default = "default_environment")]
    pub default_environment: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AgentConfig {
    #[serde(default = "default_stuck_threshold")]
    pub stuck_threshold_seconds: i64,
    #[serde(default = "default_watchdog_interval")]
    pub watchdog_interval_seconds: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AlertConfig {
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_seconds: u64,
    #[serde(default = "default_webhook_timeout")]
    pub webhook_timeout_seconds: u64,
    #[serde(default = "default_handoff_capacity")]
    pub queue_capacity: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LiveConfig {
    #[serde(default = "default_live_queue_size")]
    pub queue_size: usize,
    #[serde(default = "default_ping_interval")]
    pub ping_interval_seconds: u64,
    #[serde(default = "default_max_missed_pings")]
    pub max_missed_pings: u32,
    #[serde(default = "default_handoff_capacity")]
    pub handoff_capacity: usize,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}
fn default_port() -> u16 {
    8790
}
fn default_retention_days() -> u32 {
    30
}
fn default_read_connections() -> usize {
    4
}
fn default_max_batch_events() -> usize {
    500
}
fn default_max_body_bytes() -> usize {
    1024 * 1024
}
fn default_max_payload_bytes() -> usize {
    32 * 1024
}
fn default_environment() -> String {
    "production".to_string()
}
fn default_stuck_threshold() -> i64 {
    300
}
fn default_watchdog_interval() -> u64 {
    15
}
fn default_sweep_interval() -> u64 {
    30
}
fn default_webhook_timeout() -> u64 {
    10
}
fn default_handoff_capacity() -> usize {
    1024
}
fn default_live_queue_size() -> usize {
    256
}
fn default_ping_interval() -> u64 {
    20
}
fn default_max_missed_pings() -> u32 {
    3
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            cors_origins: Vec::new(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            path: None,
            retention_days: default_retention_days(),
            read_connections: default_read_connections(),
        }
    }
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            max_batch_events: default_max_batch_events(),
            max_body_bytes: default_max_body_bytes(),
            max_payload_bytes: default_max_payload_bytes(),
            default_environment: default_environment(),
        }
    }
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            stuck_threshold_seconds: default_stuck_threshold(),
            watchdog_interval_seconds: default_watchdog_interval(),
        }
    }
}

impl Default for AlertConfig {
    fn default() -> Self {
        Self {
            sweep_interval_seconds: default_sweep_interval(),
            webhook_timeout_seconds: default_webhook_timeout(),
            queue_capacity: default_handoff_capacity(),
        }
    }
}

impl Default for LiveConfig {
    fn default() -> Self {
        Self {
            queue_size: default_live_queue_size(),
            ping_interval_seconds: default_ping_interval(),
            max_missed_pings: default_max_missed_pings(),
            handoff_capacity: default_handoff_capacity(),
        }
    }
}

impl HivewatchConfig {
    /// Loads `explicit` if given (it must exist), otherwise `./hivewatch.toml`
    /// when present, otherwise defaults.
    pub async fn load(explicit: Option<&Path>) -> Result<Self> {
        let path = match explicit {
            Some(p) => p.to_path_buf(),
            None => {
                let local = PathBuf::from(CONFIG_FILE_NAME);
                if !local.exists() {
                    info!("No {} found, using defaults.", CONFIG_FILE_NAME);
                    return Ok(Self::default());
                }
                local
            }
        };

        let content = tokio::fs::read_to_string(&path)
            .await
            .with_context(|| format!("reading config {}", path.display()))?;
        let config: HivewatchConfig = toml::from_str(&content)
            .with_context(|| format!("parsing config {}", path.display()))?;
        info!(
            "Loaded config from {}: listen={}:{}, retention={}d",
            path.display(),
            config.server.host,
            config.server.port,
            config.storage.retention_days
        );
        Ok(config)
    }

    pub fn database_path(&self) -> PathBuf {
        match &self.storage.path {
            Some(p) => p.clone(),
            None => default_data_dir().join("hivewatch.db"),
        }
    }
}

pub fn default_data_dir() -> PathBuf {
    dirs::data_local_dir()
        .or_else(dirs::home_dir)
        .unwrap_or_else(|| PathBuf::from("."))
        .join("hivewatch")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_limits() {
        let config = HivewatchConfig::default();
        assert_eq!(config.server.port, 8790);
        assert_eq!(config.ingest.max_batch_events, 500);
        assert_eq!(config.ingest.max_body_bytes, 1024 * 1024);
        assert_eq!(config.ingest.max_payload_bytes, 32 * 1024);
        assert_eq!(config.agents.stuck_threshold_seconds, 300);
        assert_eq!(config.live.queue_size, 256);
        assert_eq!(config.live.ping_interval_seconds, 20);
        assert_eq!(config.live.max_missed_pings, 3);
        assert_eq!(config.storage.retention_days, 30);
        assert_eq!(config.storage.read_connections, 4);
    }

    #[tokio::test]
    async fn partial_file_keeps_other_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE_NAME);
        std::fs::write(
            &path,
            "[server]\nport = 9100\n\n[storage]\npath = \"/tmp/hw.db\"\nretention_days = 7\n",
        )
        .unwrap();

        let config = HivewatchConfig::load(Some(&path)).await.unwrap();
        assert_eq!(config.server.port, 9100);
        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.storage.retention_days, 7);
        assert_eq!(config.database_path(), PathBuf::from("/tmp/hw.db"));
        assert_eq!(config.ingest.max_batch_events, 500);
    }

    #[tokio::test]
    async fn missing_explicit_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let result = HivewatchConfig::load(Some(&dir.path().join("absent.toml"))).await;
        assert!(result.is_err());
    }
}
