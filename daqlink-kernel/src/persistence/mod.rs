/**
 * PERSISTENCE - Stockage des agrégats et des anomalies par machine
 *
 * RÔLE :
 * Interface unique consommée par les moteurs d'agrégation (écriture) et par
 * l'API /stat (lecture). Deux implémentations :
 * - SqliteStore = un fichier `<dir>/<machine>.db`, une table par série
 * - MemoryStore = tout en RAM, pour les tests et les runs éphémères
 *
 * CONVENTIONS :
 * - série = `<capteur>_<hour|day|month|year>_avg`, le nom `anomaly` est réservé
 * - plages de dates inclusives (`start <= DATE(time) <= end`)
 * - moyennes sur intervalle semi-ouvert `[start, end)`
 * - lecture d'une machine inconnue = liste vide, jamais de création de fichier
 */

pub mod memory;
pub mod sqlite;

use crate::config::{StorageBackend, StorageConf};
use crate::models::{AnomalyRecord, Granularity, RollupRecord};
use async_trait::async_trait;
use std::sync::Arc;
use time::{Date, PrimitiveDateTime};

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

/// Table des anomalies, réservée dans chaque base machine
pub const ANOMALY_TABLE: &str = "anomaly";

#[derive(Debug, thiserror::Error)]
pub enum PersistenceError {
    #[error("invalid name: {0}")]
    InvalidName(String),
    #[error("unknown series {series} for machine {machine}")]
    UnknownSeries { machine: String, series: String },
    #[error("bad timestamp in store: {0}")]
    BadTimestamp(String),
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("storage task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

#[async_trait]
pub trait Persistence: Send + Sync {
    /// Crée la série si absente (idempotent)
    async fn ensure_table(&self, machine: &str, series: &str) -> Result<(), PersistenceError>;

    async fn insert(&self, machine: &str, series: &str, record: RollupRecord) -> Result<(), PersistenceError>;

    /// Lignes dont la date est dans `[start, end]`, triées par temps croissant
    async fn query_range(
        &self,
        machine: &str,
        series: &str,
        start: Date,
        end: Date,
    ) -> Result<Vec<RollupRecord>, PersistenceError>;

    /// Moyenne des valeurs dans `[start, end)`, `None` sans ligne
    async fn average(
        &self,
        machine: &str,
        series: &str,
        start: PrimitiveDateTime,
        end: PrimitiveDateTime,
    ) -> Result<Option<f64>, PersistenceError>;

    async fn insert_anomaly(&self, machine: &str, record: AnomalyRecord) -> Result<(), PersistenceError>;

    async fn query_anomalies(
        &self,
        machine: &str,
        start: Date,
        end: Date,
    ) -> Result<Vec<AnomalyRecord>, PersistenceError>;

    /// Machines ayant un stockage, triées par nom
    async fn list_machines(&self) -> Result<Vec<String>, PersistenceError>;

    /// Séries d'une granularité pour une machine, triées par nom
    async fn list_series(&self, machine: &str, granularity: Granularity) -> Result<Vec<String>, PersistenceError>;
}

pub type SharedStore = Arc<dyn Persistence>;

pub fn open_store(conf: &StorageConf) -> Result<SharedStore, PersistenceError> {
    match conf.backend {
        StorageBackend::Sqlite => Ok(Arc::new(SqliteStore::open(&conf.path)?)),
        StorageBackend::Memory => Ok(Arc::new(MemoryStore::new())),
    }
}

/// Noms de machine utilisables comme nom de fichier.
pub fn check_machine(machine: &str) -> Result<(), PersistenceError> {
    let bad = machine.is_empty()
        || machine == "."
        || machine == ".."
        || machine.chars().any(|c| matches!(c, '/' | '\\' | '\0'));
    if bad {
        return Err(PersistenceError::InvalidName(machine.to_string()));
    }
    Ok(())
}

/// Refuse la table réservée et les noms non quotables.
pub fn check_series(series: &str) -> Result<(), PersistenceError> {
    let reserved = series == ANOMALY_TABLE
        || Granularity::ALL
            .iter()
            .any(|g| series.strip_suffix(g.suffix()) == Some(ANOMALY_TABLE));
    if series.is_empty() || reserved || series.contains(['"', '\0']) {
        return Err(PersistenceError::InvalidName(series.to_string()));
    }
    Ok(())
}
