//! Machine-side event production
//!
//! A `Machine` receives raw device chunks, keeps the sensors it is
//! configured for and turns them into `MachineEvent`s:
//! - every non-empty chunk becomes a `DataUpdate`
//! - with fault detection on, samples fill per-sensor batches; once every
//!   sensor holds `batch_size` samples the detector runs on each batch and
//!   the summed anomaly counts are reported as `FaultDetect`

use crate::config::MachineConfig;
use daqlink_protocol::{FaultReport, MachineEvent, SensorBatch, SensorData};
use std::collections::BTreeMap;
use tracing::debug;

/// Raw device output: sensor name -> samples
pub type DeviceChunk = BTreeMap<String, Vec<f64>>;

/// Opaque anomaly detector: batch of samples -> number of anomalies found.
pub trait FaultDetector: Send {
    fn detect(&self, sensor: &str, batch: &[f64]) -> u32;
}

/// Counts samples whose magnitude exceeds a fixed limit
#[derive(Debug, Clone, Copy)]
pub struct ExceedanceDetector {
    pub limit: f64,
}

impl FaultDetector for ExceedanceDetector {
    fn detect(&self, _sensor: &str, batch: &[f64]) -> u32 {
        batch.iter().filter(|s| s.abs() > self.limit).count() as u32
    }
}

struct FaultState {
    detector: Box<dyn FaultDetector>,
    threshold: f64,
    batch_size: usize,
    batches: BTreeMap<String, Vec<f64>>,
}

impl FaultState {
    fn clear(&mut self) {
        for batch in self.batches.values_mut() {
            batch.clear();
        }
    }

    fn is_full(&self) -> bool {
        self.batches.values().all(|b| b.len() >= self.batch_size)
    }
}

pub struct Machine {
    name: String,
    /// sensor name -> type tag
    sensors: BTreeMap<String, String>,
    fault: Option<FaultState>,
}

impl Machine {
    pub fn new(config: &MachineConfig) -> Self {
        let sensors = config
            .sensors
            .iter()
            .map(|(name, sensor)| (name.clone(), sensor.kind.clone()))
            .collect();
        let mut machine = Self { name: config.name.clone(), sensors, fault: None };
        if let Some(fault) = &config.fault {
            let detector = ExceedanceDetector { limit: fault.limit };
            machine = machine.with_detector(Box::new(detector), fault.threshold, fault.batch_size);
        }
        machine
    }

    /// Turns fault detection on with a custom detector.
    pub fn with_detector(mut self, detector: Box<dyn FaultDetector>, threshold: f64, batch_size: usize) -> Self {
        let batches = self.sensors.keys().map(|name| (name.clone(), Vec::with_capacity(batch_size))).collect();
        self.fault = Some(FaultState { detector, threshold, batch_size: batch_size.max(1), batches });
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn sensor_types(&self) -> &BTreeMap<String, String> {
        &self.sensors
    }

    pub fn is_fault_detectable(&self) -> bool {
        self.fault.is_some()
    }

    /// Events produced by one device chunk, in emission order.
    pub fn data_update(&mut self, chunk: &DeviceChunk) -> Vec<MachineEvent> {
        let mut data = SensorData::new();
        for (sensor, samples) in chunk {
            if let Some(kind) = self.sensors.get(sensor) {
                data.insert(sensor.clone(), SensorBatch::new(kind.clone(), samples.clone()));
            }
        }
        if data.is_empty() {
            return Vec::new();
        }

        let fault = self.fault_detect(&data);
        let mut events = vec![MachineEvent::DataUpdate(data)];
        events.extend(fault);
        events
    }

    fn fault_detect(&mut self, data: &SensorData) -> Option<MachineEvent> {
        let fault = self.fault.as_mut()?;
        for (sensor, batch) in data {
            if let Some(pending) = fault.batches.get_mut(sensor) {
                let room = fault.batch_size.saturating_sub(pending.len());
                pending.extend(batch.data.iter().take(room));
            }
        }
        if !fault.is_full() {
            return None;
        }

        let score: u32 = fault
            .batches
            .iter()
            .map(|(sensor, batch)| fault.detector.detect(sensor, batch))
            .sum();
        fault.clear();
        debug!(machine = %self.name, score, "fault detection pass");
        Some(MachineEvent::FaultDetect(FaultReport { score: score as f64, threshold: fault.threshold }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{FaultConfig, SensorConfig};

    fn config(fault: Option<FaultConfig>) -> MachineConfig {
        let mut sensors = BTreeMap::new();
        sensors.insert("temp".into(), SensorConfig { kind: "TEMP".into() });
        sensors.insert("vib".into(), SensorConfig { kind: "VIB".into() });
        MachineConfig { name: "M1".into(), sensors, fault }
    }

    fn chunk(entries: &[(&str, &[f64])]) -> DeviceChunk {
        entries.iter().map(|(name, data)| (name.to_string(), data.to_vec())).collect()
    }

    #[test]
    fn unknown_sensors_are_filtered() {
        let mut machine = Machine::new(&config(None));
        let events = machine.data_update(&chunk(&[("temp", &[1.0]), ("pressure", &[9.0])]));
        assert_eq!(events.len(), 1);
        match &events[0] {
            MachineEvent::DataUpdate(data) => {
                assert_eq!(data.len(), 1);
                assert_eq!(data["temp"], SensorBatch::new("TEMP", vec![1.0]));
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(machine.data_update(&chunk(&[("pressure", &[1.0])])).is_empty());
    }

    #[test]
    fn fault_report_once_every_batch_is_full() {
        let fault = FaultConfig { threshold: 2.0, batch_size: 3, limit: 5.0 };
        let mut machine = Machine::new(&config(Some(fault)));
        assert!(machine.is_fault_detectable());

        // temp plein, vib pas encore
        let events = machine.data_update(&chunk(&[("temp", &[6.0, 1.0, 7.0, 8.0]), ("vib", &[1.0])]));
        assert_eq!(events.len(), 1);

        let events = machine.data_update(&chunk(&[("vib", &[-9.0, 0.0])]));
        assert_eq!(events.len(), 2);
        // temp : 6 et 7 dépassent (8 hors batch), vib : -9
        assert_eq!(events[1], MachineEvent::FaultDetect(FaultReport { score: 3.0, threshold: 2.0 }));

        // batches vidés après le passage
        let events = machine.data_update(&chunk(&[("temp", &[9.0, 9.0, 9.0])]));
        assert_eq!(events.len(), 1);
    }

    struct Fixed(u32);

    impl FaultDetector for Fixed {
        fn detect(&self, _sensor: &str, _batch: &[f64]) -> u32 {
            self.0
        }
    }

    #[test]
    fn custom_detector_scores_are_summed() {
        let mut machine = Machine::new(&config(None)).with_detector(Box::new(Fixed(2)), 1.0, 1);
        let events = machine.data_update(&chunk(&[("temp", &[0.0]), ("vib", &[0.0])]));
        assert_eq!(events[1], MachineEvent::FaultDetect(FaultReport { score: 4.0, threshold: 1.0 }));
    }
}
