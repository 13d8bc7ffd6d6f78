use machinemon_alert::EngineConfig;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_data_dir")]
    pub data_dir: String,
    #[serde(default = "default_database_file")]
    pub database_file: String,
    /// Pending check-in evaluations; further triggers are dropped while full.
    #[serde(default = "default_checkin_queue_capacity")]
    pub checkin_queue_capacity: usize,
    #[serde(default = "default_offline_sweep_secs")]
    pub offline_sweep_secs: u64,
    #[serde(default = "default_retention_sweep_secs")]
    pub retention_sweep_secs: u64,
    /// Upper bound for one provider send.
    #[serde(default = "default_provider_timeout_secs")]
    pub provider_timeout_secs: u64,
    /// Interval clients are told to wait before their next check-in.
    #[serde(default = "default_checkin_interval_secs")]
    pub checkin_interval_secs: u64,
}

fn default_data_dir() -> String {
    "data".to_string()
}

fn default_database_file() -> String {
    "machinemon.db".to_string()
}

fn default_checkin_queue_capacity() -> usize {
    100
}

fn default_offline_sweep_secs() -> u64 {
    30
}

fn default_retention_sweep_secs() -> u64 {
    24 * 3600
}

fn default_provider_timeout_secs() -> u64 {
    30
}

fn default_checkin_interval_secs() -> u64 {
    120
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            database_file: default_database_file(),
            checkin_queue_capacity: default_checkin_queue_capacity(),
            offline_sweep_secs: default_offline_sweep_secs(),
            retention_sweep_secs: default_retention_sweep_secs(),
            provider_timeout_secs: default_provider_timeout_secs(),
            checkin_interval_secs: default_checkin_interval_secs(),
        }
    }
}

impl ServerConfig {
    pub fn load(path: &str) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("Failed to read config '{}': {}", path, e))?;
        let config: Self = toml::from_str(&content)?;
        Ok(config)
    }

    pub fn database_path(&self) -> PathBuf {
        PathBuf::from(&self.data_dir).join(&self.database_file)
    }

    pub fn provider_timeout(&self) -> Duration {
        Duration::from_secs(self.provider_timeout_secs.max(1))
    }

    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            queue_capacity: self.checkin_queue_capacity.max(1),
            offline_sweep_interval: Duration::from_secs(self.offline_sweep_secs.max(1)),
            retention_sweep_interval: Duration::from_secs(self.retention_sweep_secs.max(1)),
        }
    }
}

// ---- Seed file types (used by the `init-providers` CLI subcommand) ----

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderSeedFile {
    #[serde(default)]
    pub providers: Vec<SeedProvider>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SeedProvider {
    pub name: String,
    #[serde(rename = "type")]
    pub provider_type: String,
    #[serde(default = "default_seed_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub config: serde_json::Value,
}

fn default_seed_enabled() -> bool {
    true
}
