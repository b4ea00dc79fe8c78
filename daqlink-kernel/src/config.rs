use crate::stat::{default_modes, StatMode};
use serde::{Deserialize, Deserializer, Serialize};
use std::{collections::HashMap, path::Path, path::PathBuf};
use tokio::fs;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid config: {0}")]
    Invalid(#[from] serde_yaml::Error),
    #[error("replay_capacity must be at least 1")]
    ZeroReplay,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct KernelConfig {
    pub server: ServerConf,
    pub storage: StorageConf,
    pub notification: NotificationConf,
    /// type de capteur -> ABS | REAL, fusionné par-dessus les modes par défaut
    #[serde(deserialize_with = "over_default_modes")]
    pub stat: HashMap<String, StatMode>,
    /// taille du buffer de rejeu par capteur
    pub replay_capacity: usize,
    /// décalage horaire des horodatages, local si absent
    pub utc_offset_hours: Option<i8>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct ServerConf {
    pub host: String,
    pub http_port: u16,
    pub tcp_port: u16,
    /// workers du runtime dédié au listener machines
    pub listener_threads: usize,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    Sqlite,
    Memory,
}

impl StorageBackend {
    pub fn name(&self) -> &'static str {
        match self {
            StorageBackend::Sqlite => "sqlite",
            StorageBackend::Memory => "memory",
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct StorageConf {
    pub backend: StorageBackend,
    pub path: PathBuf,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct NotificationConf {
    pub topic: String,
    pub min_interval_secs: u64,
    /// POST JSON vers ce webhook, sinon simple log
    pub webhook_url: Option<String>,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            server: ServerConf::default(),
            storage: StorageConf::default(),
            notification: NotificationConf::default(),
            stat: default_modes(),
            replay_capacity: 60,
            utc_offset_hours: None,
        }
    }
}

fn over_default_modes<'de, D: Deserializer<'de>>(deserializer: D) -> Result<HashMap<String, StatMode>, D::Error> {
    let overrides = Option::<HashMap<String, StatMode>>::deserialize(deserializer)?;
    let mut modes = default_modes();
    modes.extend(overrides.unwrap_or_default());
    Ok(modes)
}

impl Default for ServerConf {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".into(),
            http_port: 8080,
            tcp_port: 8082,
            listener_threads: 2,
        }
    }
}

impl Default for StorageConf {
    fn default() -> Self {
        Self { backend: StorageBackend::Sqlite, path: PathBuf::from("./data/db") }
    }
}

impl Default for NotificationConf {
    fn default() -> Self {
        Self { topic: "anomaly".into(), min_interval_secs: 60, webhook_url: None }
    }
}

impl NotificationConf {
    /// Intervalle minimal entre deux notifications, saturé à `i64::MAX` secondes
    pub fn min_interval(&self) -> time::Duration {
        time::Duration::seconds(i64::try_from(self.min_interval_secs).unwrap_or(i64::MAX))
    }
}

impl KernelConfig {
    pub fn http_addr(&self) -> String {
        format!("{}:{}", self.server.host, self.server.http_port)
    }

    pub fn tcp_addr(&self) -> String {
        format!("{}:{}", self.server.host, self.server.tcp_port)
    }
}

pub fn parse_config(txt: &str) -> Result<KernelConfig, ConfigError> {
    if txt.trim().is_empty() {
        return Ok(KernelConfig::default());
    }
    let cfg: KernelConfig = serde_yaml::from_str(txt)?;
    if cfg.replay_capacity == 0 {
        return Err(ConfigError::ZeroReplay);
    }
    Ok(cfg)
}

pub async fn load_config() -> KernelConfig {
    let path = std::env::var("DAQLINK_KERNEL_CONFIG").unwrap_or_else(|_| "kernel.yaml".into());
    if Path::new(&path).exists() {
        let txt = fs::read_to_string(&path).await.unwrap_or_default();
        parse_config(&txt).unwrap_or_else(|e| {
            tracing::warn!(path = %path, error = %e, "config invalide, usage config par défaut");
            KernelConfig::default()
        })
    } else {
        tracing::info!(path = %path, "pas de kernel.yaml, usage config par défaut");
        KernelConfig::default()
    }
}
