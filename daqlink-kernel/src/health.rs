use crate::coordinator::CoordinatorHandle;
use crate::relay::RelayCounters;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;

#[derive(Debug, Serialize, Deserialize, PartialEq)]
pub struct KernelHealth {
    pub status: String,
    pub uptime_seconds: u64,
    pub live_machines: usize,
    pub sessions_opened: u64,
    pub sessions_closed: u64,
    pub events_relayed: u64,
    pub memory_usage_mb: f32,
    pub storage_backend: String,
}

#[derive(Clone)]
pub struct HealthTracker {
    start_time: Instant,
    relay: Arc<RelayCounters>,
    storage_backend: String,
}

impl HealthTracker {
    pub fn new(relay: Arc<RelayCounters>, storage_backend: impl Into<String>) -> Self {
        Self { start_time: Instant::now(), relay, storage_backend: storage_backend.into() }
    }

    pub fn get_health(&self, coordinator: &CoordinatorHandle) -> KernelHealth {
        let relay = self.relay.snapshot();
        KernelHealth {
            status: "ok".into(),
            uptime_seconds: self.start_time.elapsed().as_secs(),
            live_machines: coordinator.live_machines(),
            sessions_opened: relay.sessions_opened,
            sessions_closed: relay.sessions_closed,
            events_relayed: relay.events,
            memory_usage_mb: get_memory_usage_mb(),
            storage_backend: self.storage_backend.clone(),
        }
    }
}

/// RSS du process en Mo, 0 si indisponible
fn get_memory_usage_mb() -> f32 {
    #[cfg(target_os = "linux")]
    {
        if let Ok(status) = std::fs::read_to_string("/proc/self/status") {
            let rss_kb = status
                .lines()
                .find(|line| line.starts_with("VmRSS:"))
                .and_then(|line| line.split_whitespace().nth(1))
                .and_then(|kb| kb.parse::<u64>().ok());
            if let Some(kb) = rss_kb {
                return kb as f32 / 1024.0;
            }
        }
    }
    0.0
}
