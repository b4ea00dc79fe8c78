//! Agent configuration
//!
//! Handles:
//! - machine identity, monitored sensors and fault detection settings
//! - kernel address and reconnection policy
//! - simulated source parameters
//!
//! Stored as TOML in the OS config directory, or at `$DAQLINK_AGENT_CONFIG`.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

pub const CONFIG_ENV: &str = "DAQLINK_AGENT_CONFIG";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AgentConfig {
    pub machine: MachineConfig,
    pub server: ServerConfig,
    pub source: SourceConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct MachineConfig {
    pub name: String,
    /// sensor name -> settings
    pub sensors: BTreeMap<String, SensorConfig>,
    /// absent = no fault detection
    pub fault: Option<FaultConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SensorConfig {
    /// type tag sent with every batch (VIB, TEMP, ...)
    #[serde(rename = "type")]
    pub kind: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FaultConfig {
    pub threshold: f64,
    /// samples per sensor before a detection pass
    pub batch_size: usize,
    /// absolute value above which a sample counts as an anomaly
    pub limit: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub retry_interval_secs: u64,
    pub connect_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SourceConfig {
    pub sample_rate_hz: f64,
    /// samples per sensor per read
    pub chunk_size: usize,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            machine: MachineConfig::default(),
            server: ServerConfig::default(),
            source: SourceConfig::default(),
        }
    }
}

impl Default for MachineConfig {
    fn default() -> Self {
        let mut sensors = BTreeMap::new();
        sensors.insert("temp".to_string(), SensorConfig { kind: "TEMP".to_string() });
        sensors.insert("vib".to_string(), SensorConfig { kind: "VIB".to_string() });
        Self { name: "machine-1".to_string(), sensors, fault: None }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8082,
            retry_interval_secs: 60,
            connect_timeout_secs: 10,
        }
    }
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self { sample_rate_hz: 100.0, chunk_size: 100 }
    }
}

impl ServerConfig {
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn retry_interval(&self) -> Duration {
        Duration::from_secs(self.retry_interval_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

impl SourceConfig {
    /// Time covered by one chunk, `None` when it is not a usable timer period
    fn checked_chunk_period(&self) -> Option<Duration> {
        if !self.sample_rate_hz.is_finite() || self.sample_rate_hz <= 0.0 || self.chunk_size == 0 {
            return None;
        }
        Duration::try_from_secs_f64(self.chunk_size as f64 / self.sample_rate_hz)
            .ok()
            .filter(|period| !period.is_zero())
    }

    /// Time covered by one chunk; one second for settings `parse` would refuse
    pub fn chunk_period(&self) -> Duration {
        self.checked_chunk_period().unwrap_or(Duration::from_secs(1))
    }
}

impl AgentConfig {
    pub fn parse(content: &str) -> Result<Self> {
        let config: AgentConfig = toml::from_str(content).context("invalid agent config")?;
        anyhow::ensure!(!config.machine.name.trim().is_empty(), "machine name must not be empty");
        if let Some(fault) = &config.machine.fault {
            anyhow::ensure!(fault.batch_size > 0, "fault batch_size must be at least 1");
        }
        anyhow::ensure!(config.source.chunk_size > 0, "source chunk_size must be at least 1");
        anyhow::ensure!(
            config.source.checked_chunk_period().is_some(),
            "source sample_rate_hz must be a positive rate giving a non-zero chunk period"
        );
        Ok(config)
    }

    /// Load config from `$DAQLINK_AGENT_CONFIG` or the OS-specific location
    pub async fn load() -> Result<Self> {
        let config_path = Self::config_file_path()?;

        if config_path.exists() {
            let content = tokio::fs::read_to_string(&config_path)
                .await
                .with_context(|| format!("failed to read {}", config_path.display()))?;
            Self::parse(&content)
        } else {
            tracing::info!(path = %config_path.display(), "no agent config, using defaults");
            Ok(Self::default())
        }
    }

    pub fn config_file_path() -> Result<PathBuf> {
        if let Ok(path) = std::env::var(CONFIG_ENV) {
            return Ok(PathBuf::from(path));
        }
        let mut path = dirs::config_dir().ok_or_else(|| anyhow::anyhow!("Could not find config directory"))?;
        path.push("daqlink-agent");
        path.push("config.toml");
        Ok(path)
    }
}
