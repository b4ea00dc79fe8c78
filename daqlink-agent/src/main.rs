//! DAQLink Agent - machine-side telemetry producer
//!
//! Samples the (simulated) device at the configured rate and streams every
//! chunk to the kernel until interrupted.

use anyhow::{Context, Result};
use daqlink_agent::client::{DataSender, LinkConfig};
use daqlink_agent::config::AgentConfig;
use daqlink_agent::machine::Machine;
use daqlink_agent::source::SimulatedSource;
use tokio::time::interval;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = AgentConfig::load().await.context("Failed to load agent configuration")?;
    info!(
        machine = %config.machine.name,
        sensors = config.machine.sensors.len(),
        kernel = %config.server.addr(),
        "Starting DAQLink agent v{}",
        env!("CARGO_PKG_VERSION")
    );

    let mut machine = Machine::new(&config.machine);
    let mut source =
        SimulatedSource::new(machine.sensor_types(), config.source.sample_rate_hz, config.source.chunk_size);
    let (sender, link_task) = DataSender::spawn(LinkConfig::new(machine.name(), &config.server));

    let mut ticker = interval(config.source.chunk_period());
    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let chunk = source.next_chunk();
                for event in machine.data_update(&chunk) {
                    if !sender.event_handle(event) {
                        debug!("event not delivered");
                    }
                }
            }
            _ = &mut shutdown => {
                info!("Shutting down agent");
                break;
            }
        }
    }

    drop(sender);
    link_task.await.context("link task panicked")?;
    Ok(())
}
