use crate::clock::timestamp_serde;
use daqlink_protocol::FaultReport;
use serde::{Deserialize, Serialize};
use time::PrimitiveDateTime;

/// Granularité d'une série persistée
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Granularity {
    Hour,
    Day,
    Month,
    Year,
}

impl Granularity {
    pub const ALL: [Granularity; 4] =
        [Granularity::Hour, Granularity::Day, Granularity::Month, Granularity::Year];

    pub fn suffix(self) -> &'static str {
        match self {
            Granularity::Hour => "_hour_avg",
            Granularity::Day => "_day_avg",
            Granularity::Month => "_month_avg",
            Granularity::Year => "_year_avg",
        }
    }

    /// Nom de série `<sensor>_<granularité>_avg`
    pub fn series(self, sensor: &str) -> String {
        format!("{sensor}{}", self.suffix())
    }

    /// Granularité dont on dérive celle-ci (jour <- heure, mois <- jour, an <- mois).
    pub fn source(self) -> Option<Granularity> {
        match self {
            Granularity::Hour => None,
            Granularity::Day => Some(Granularity::Hour),
            Granularity::Month => Some(Granularity::Day),
            Granularity::Year => Some(Granularity::Month),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RollupRecord {
    #[serde(with = "timestamp_serde")]
    pub time: PrimitiveDateTime,
    pub value: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AnomalyRecord {
    #[serde(with = "timestamp_serde")]
    pub time: PrimitiveDateTime,
    pub score: f64,
    pub threshold: f64,
}

/// Moyenne minute diffusée en live, `data = null` si la minute était vide
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MinuteAverage {
    pub sensor_name: String,
    pub data: Option<f64>,
    #[serde(with = "timestamp_serde")]
    pub time: PrimitiveDateTime,
}

/// Message poussé aux viewers WebSocket
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "lowercase")]
pub enum ViewerEvent {
    /// contenu du buffer de rejeu d'un capteur
    Initialize(Vec<MinuteAverage>),
    Update(MinuteAverage),
    Anomaly(FaultReport),
}

// vues REST

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MachineList {
    pub machine_list: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatRow {
    /// nom de série, ex: `temp_hour_avg`
    pub name: String,
    #[serde(with = "timestamp_serde")]
    pub time: PrimitiveDateTime,
    pub data: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnomalyRow {
    pub name: String,
    #[serde(with = "timestamp_serde")]
    pub time: PrimitiveDateTime,
    pub score: f64,
    pub threshold: f64,
}
