use super::{check_machine, check_series, Persistence, PersistenceError};
use crate::models::{AnomalyRecord, Granularity, RollupRecord};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use time::{Date, PrimitiveDateTime};

#[derive(Debug, Default)]
struct MachineTables {
    series: BTreeMap<String, Vec<RollupRecord>>,
    anomalies: Vec<AnomalyRecord>,
}

/// Stockage volatil, même sémantique que SqliteStore
#[derive(Debug, Default)]
pub struct MemoryStore {
    machines: Mutex<HashMap<String, MachineTables>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn sorted_by_time<T: Copy>(rows: impl Iterator<Item = T>, time: impl Fn(&T) -> PrimitiveDateTime) -> Vec<T> {
    let mut rows: Vec<T> = rows.collect();
    rows.sort_by_key(|r| time(r));
    rows
}

#[async_trait]
impl Persistence for MemoryStore {
    async fn ensure_table(&self, machine: &str, series: &str) -> Result<(), PersistenceError> {
        check_machine(machine)?;
        check_series(series)?;
        self.machines
            .lock()
            .entry(machine.to_string())
            .or_default()
            .series
            .entry(series.to_string())
            .or_default();
        Ok(())
    }

    async fn insert(&self, machine: &str, series: &str, record: RollupRecord) -> Result<(), PersistenceError> {
        let mut machines = self.machines.lock();
        let rows = machines
            .get_mut(machine)
            .and_then(|m| m.series.get_mut(series))
            .ok_or_else(|| PersistenceError::UnknownSeries {
                machine: machine.to_string(),
                series: series.to_string(),
            })?;
        rows.push(record);
        Ok(())
    }

    async fn query_range(
        &self,
        machine: &str,
        series: &str,
        start: Date,
        end: Date,
    ) -> Result<Vec<RollupRecord>, PersistenceError> {
        let machines = self.machines.lock();
        let Some(rows) = machines.get(machine).and_then(|m| m.series.get(series)) else {
            return Ok(Vec::new());
        };
        let hits = rows.iter().copied().filter(|r| (start..=end).contains(&r.time.date()));
        Ok(sorted_by_time(hits, |r| r.time))
    }

    async fn average(
        &self,
        machine: &str,
        series: &str,
        start: PrimitiveDateTime,
        end: PrimitiveDateTime,
    ) -> Result<Option<f64>, PersistenceError> {
        let machines = self.machines.lock();
        let Some(rows) = machines.get(machine).and_then(|m| m.series.get(series)) else {
            return Ok(None);
        };
        let (sum, count) = rows
            .iter()
            .filter(|r| start <= r.time && r.time < end)
            .fold((0.0, 0usize), |(sum, count), r| (sum + r.value, count + 1));
        Ok((count > 0).then(|| sum / count as f64))
    }

    async fn insert_anomaly(&self, machine: &str, record: AnomalyRecord) -> Result<(), PersistenceError> {
        check_machine(machine)?;
        self.machines
            .lock()
            .entry(machine.to_string())
            .or_default()
            .anomalies
            .push(record);
        Ok(())
    }

    async fn query_anomalies(
        &self,
        machine: &str,
        start: Date,
        end: Date,
    ) -> Result<Vec<AnomalyRecord>, PersistenceError> {
        let machines = self.machines.lock();
        let Some(tables) = machines.get(machine) else {
            return Ok(Vec::new());
        };
        let hits = tables
            .anomalies
            .iter()
            .copied()
            .filter(|r| (start..=end).contains(&r.time.date()));
        Ok(sorted_by_time(hits, |r| r.time))
    }

    async fn list_machines(&self) -> Result<Vec<String>, PersistenceError> {
        let mut names: Vec<String> = self.machines.lock().keys().cloned().collect();
        names.sort();
        Ok(names)
    }

    async fn list_series(&self, machine: &str, granularity: Granularity) -> Result<Vec<String>, PersistenceError> {
        let machines = self.machines.lock();
        Ok(machines
            .get(machine)
            .map(|m| {
                m.series
                    .keys()
                    .filter(|s| s.ends_with(granularity.suffix()))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }
}
