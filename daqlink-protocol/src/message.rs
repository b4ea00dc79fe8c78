use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Event name of the handshake frame that opens every connection.
pub const HANDSHAKE_EVENT: &str = "name";
pub const DATA_UPDATE_EVENT: &str = "DataUpdate";
pub const FAULT_DETECT_EVENT: &str = "FaultDetect";

/// Samples captured for one sensor since the previous update.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SensorBatch {
    /// Sensor type tag (e.g. "VIB", "TEMP"), selects the value transform server side
    #[serde(rename = "type")]
    pub kind: String,
    pub data: Vec<f64>,
}

impl SensorBatch {
    pub fn new(kind: impl Into<String>, data: Vec<f64>) -> Self {
        Self { kind: kind.into(), data }
    }
}

/// sensor name -> batch
pub type SensorData = BTreeMap<String, SensorBatch>;

/// Result of one anomaly-detection pass on the machine.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FaultReport {
    pub score: f64,
    pub threshold: f64,
}

impl FaultReport {
    pub fn is_anomaly(&self) -> bool {
        self.score > self.threshold
    }
}

/// Telemetry event produced by a machine after the handshake.
#[derive(Debug, Clone, PartialEq)]
pub enum MachineEvent {
    DataUpdate(SensorData),
    FaultDetect(FaultReport),
}

impl MachineEvent {
    pub fn name(&self) -> &'static str {
        match self {
            MachineEvent::DataUpdate(_) => DATA_UPDATE_EVENT,
            MachineEvent::FaultDetect(_) => FAULT_DETECT_EVENT,
        }
    }
}

/// One frame on the wire: `{"event": <name>, "payload": <value>}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "payload")]
pub enum Message {
    /// Handshake carrying the machine identity
    #[serde(rename = "name")]
    Name(String),
    DataUpdate(SensorData),
    FaultDetect(FaultReport),
}

impl Message {
    pub fn event_name(&self) -> &'static str {
        match self {
            Message::Name(_) => HANDSHAKE_EVENT,
            Message::DataUpdate(_) => DATA_UPDATE_EVENT,
            Message::FaultDetect(_) => FAULT_DETECT_EVENT,
        }
    }

    /// Telemetry content of the frame, `None` for the handshake.
    pub fn into_event(self) -> Option<MachineEvent> {
        match self {
            Message::Name(_) => None,
            Message::DataUpdate(data) => Some(MachineEvent::DataUpdate(data)),
            Message::FaultDetect(report) => Some(MachineEvent::FaultDetect(report)),
        }
    }
}

impl From<MachineEvent> for Message {
    fn from(event: MachineEvent) -> Self {
        match event {
            MachineEvent::DataUpdate(data) => Message::DataUpdate(data),
            MachineEvent::FaultDetect(report) => Message::FaultDetect(report),
        }
    }
}
