//! Simulated acquisition device
//!
//! Produces one chunk per sensor per read: a sine at a per-sensor frequency
//! plus uniform noise, offset by a base level chosen from the sensor type.

use crate::machine::DeviceChunk;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::BTreeMap;
use std::f64::consts::PI;

#[derive(Debug, Clone)]
struct Channel {
    base: f64,
    amplitude: f64,
    frequency_hz: f64,
}

pub struct SimulatedSource {
    channels: BTreeMap<String, Channel>,
    sample_rate_hz: f64,
    chunk_size: usize,
    noise: f64,
    /// samples emitted since start
    position: u64,
    rng: StdRng,
}

impl SimulatedSource {
    /// `sensors`: sensor name -> type tag
    pub fn new(sensors: &BTreeMap<String, String>, sample_rate_hz: f64, chunk_size: usize) -> Self {
        Self::with_rng(sensors, sample_rate_hz, chunk_size, StdRng::from_os_rng())
    }

    pub fn seeded(sensors: &BTreeMap<String, String>, sample_rate_hz: f64, chunk_size: usize, seed: u64) -> Self {
        Self::with_rng(sensors, sample_rate_hz, chunk_size, StdRng::seed_from_u64(seed))
    }

    fn with_rng(sensors: &BTreeMap<String, String>, sample_rate_hz: f64, chunk_size: usize, rng: StdRng) -> Self {
        let channels = sensors
            .iter()
            .enumerate()
            .map(|(i, (name, kind))| {
                let channel = match kind.as_str() {
                    "TEMP" => Channel { base: 25.0, amplitude: 0.5, frequency_hz: 0.01 },
                    "VIB" => Channel { base: 0.0, amplitude: 1.0, frequency_hz: 5.0 + i as f64 },
                    _ => Channel { base: 0.0, amplitude: 1.0, frequency_hz: 1.0 },
                };
                (name.clone(), channel)
            })
            .collect();
        Self { channels, sample_rate_hz: sample_rate_hz.max(1.0), chunk_size, noise: 0.1, position: 0, rng }
    }

    pub fn with_noise(mut self, noise: f64) -> Self {
        self.noise = noise.abs();
        self
    }

    pub fn next_chunk(&mut self) -> DeviceChunk {
        let mut chunk = DeviceChunk::new();
        for (name, channel) in &self.channels {
            let samples = (0..self.chunk_size as u64)
                .map(|i| {
                    let t = (self.position + i) as f64 / self.sample_rate_hz;
                    let jitter = if self.noise > 0.0 { self.rng.random_range(-self.noise..self.noise) } else { 0.0 };
                    channel.base + channel.amplitude * (2.0 * PI * channel.frequency_hz * t).sin() + jitter
                })
                .collect();
            chunk.insert(name.clone(), samples);
        }
        self.position += self.chunk_size as u64;
        chunk
    }
}
