//! DAQLink Agent - machine-side telemetry producer
//!
//! Reads sensor chunks from an acquisition source, turns them into machine
//! events and keeps a persistent link to the kernel:
//! - `machine`: sensor filtering and fault detection batches
//! - `client`: connection state machine, resampling, retry
//! - `source`: simulated acquisition device
//! - `config`: TOML configuration

pub mod client;
pub mod config;
pub mod machine;
pub mod resample;
pub mod source;
