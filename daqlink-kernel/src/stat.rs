use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum AggregationError {
    #[error("no samples accumulated for {0}")]
    NoSamples(String),
}

/// Transformation appliquée aux échantillons avant sommation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum StatMode {
    /// valeur absolue (vibrations: signal centré sur zéro)
    Abs,
    /// valeur telle quelle
    Real,
}

impl StatMode {
    fn apply(self, value: f64) -> f64 {
        match self {
            StatMode::Abs => value.abs(),
            StatMode::Real => value,
        }
    }
}

/// Table type de capteur -> mode, avec repli REAL pour les types inconnus.
#[derive(Debug, Clone)]
pub struct StatModes {
    modes: HashMap<String, StatMode>,
}

impl StatModes {
    pub fn new(modes: HashMap<String, StatMode>) -> Self {
        Self { modes }
    }

    pub fn mode_for(&self, sensor_type: &str) -> StatMode {
        match self.modes.get(sensor_type) {
            Some(mode) => *mode,
            None => {
                tracing::warn!(sensor_type, "unknown sensor type, using REAL mode");
                StatMode::Real
            }
        }
    }
}

impl Default for StatModes {
    fn default() -> Self {
        Self::new(default_modes())
    }
}

pub fn default_modes() -> HashMap<String, StatMode> {
    HashMap::from([
        ("VIB".to_string(), StatMode::Abs),
        ("TEMP".to_string(), StatMode::Real),
    ])
}

/// Accumulateur somme/compte d'un capteur sur une fenêtre.
#[derive(Debug, Clone)]
pub struct Stat {
    mode: StatMode,
    sum: f64,
    count: usize,
}

impl Stat {
    pub fn new(mode: StatMode) -> Self {
        Self { mode, sum: 0.0, count: 0 }
    }

    pub fn add(&mut self, samples: &[f64]) {
        let mode = self.mode;
        self.sum += samples.iter().map(|v| mode.apply(*v)).sum::<f64>();
        self.count += samples.len();
    }

    pub fn sum(&self) -> f64 {
        self.sum
    }

    pub fn count(&self) -> usize {
        self.count
    }

    pub fn mode(&self) -> StatMode {
        self.mode
    }

    /// Moyenne courante sans réinitialiser, `None` si vide.
    pub fn average(&self) -> Option<f64> {
        (self.count > 0).then(|| self.sum / self.count as f64)
    }

    pub fn reset(&mut self) {
        self.sum = 0.0;
        self.count = 0;
    }

    /// Rend la moyenne et remet à zéro. Une fenêtre vide est réinitialisée aussi.
    pub fn take_average(&mut self, sensor: &str) -> Result<f64, AggregationError> {
        let avg = self.average();
        self.reset();
        avg.ok_or_else(|| AggregationError::NoSamples(sensor.to_string()))
    }
}
