use super::{check_machine, check_series, Persistence, PersistenceError, ANOMALY_TABLE};
use crate::clock::{format_timestamp, parse_timestamp, DATE_FORMAT};
use crate::models::{AnomalyRecord, Granularity, RollupRecord};
use async_trait::async_trait;
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use time::{Date, PrimitiveDateTime};

type SharedConn = Arc<Mutex<Connection>>;

/// Une base SQLite par machine dans `dir`.
/// Toutes les requêtes passent par `spawn_blocking`.
#[derive(Clone)]
pub struct SqliteStore {
    dir: PathBuf,
    conns: Arc<Mutex<HashMap<String, SharedConn>>>,
}

fn quote(name: &str) -> String {
    format!("\"{name}\"")
}

fn date_text(date: Date) -> String {
    date.format(DATE_FORMAT).unwrap_or_else(|_| date.to_string())
}

fn read_time(text: String) -> Result<PrimitiveDateTime, PersistenceError> {
    parse_timestamp(&text).map_err(|_| PersistenceError::BadTimestamp(text))
}

fn init_db(conn: &Connection) -> Result<(), PersistenceError> {
    conn.pragma_update(None, "journal_mode", "WAL")?;
    conn.pragma_update(None, "synchronous", "NORMAL")?;
    conn.execute_batch(&format!(
        "CREATE TABLE IF NOT EXISTS {} (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            time TIMESTAMP NOT NULL,
            threshold REAL NOT NULL,
            score REAL NOT NULL
        );",
        quote(ANOMALY_TABLE)
    ))?;
    Ok(())
}

fn table_exists(conn: &Connection, table: &str) -> Result<bool, PersistenceError> {
    let found: Option<i64> = conn
        .query_row(
            "SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1",
            params![table],
            |row| row.get(0),
        )
        .optional()?;
    Ok(found.is_some())
}

impl SqliteStore {
    pub fn open(dir: impl AsRef<Path>) -> Result<Self, PersistenceError> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir)?;
        Ok(Self { dir, conns: Arc::new(Mutex::new(HashMap::new())) })
    }

    pub fn db_path(&self, machine: &str) -> PathBuf {
        self.dir.join(format!("{machine}.db"))
    }

    fn connection(&self, machine: &str) -> Result<SharedConn, PersistenceError> {
        let mut conns = self.conns.lock();
        if let Some(conn) = conns.get(machine) {
            return Ok(conn.clone());
        }
        let conn = Connection::open(self.db_path(machine))?;
        init_db(&conn)?;
        let conn = Arc::new(Mutex::new(conn));
        conns.insert(machine.to_string(), conn.clone());
        Ok(conn)
    }

    /// Exécute `f` sur la base de `machine` hors du runtime.
    /// Sans `create`, une machine sans fichier donne `None` au lieu de créer la base.
    async fn run<T, F>(&self, machine: &str, create: bool, f: F) -> Result<Option<T>, PersistenceError>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T, PersistenceError> + Send + 'static,
    {
        check_machine(machine)?;
        let store = self.clone();
        let machine = machine.to_string();
        tokio::task::spawn_blocking(move || {
            if !create && !store.db_path(&machine).exists() {
                return Ok(None);
            }
            let conn = store.connection(&machine)?;
            let guard = conn.lock();
            f(&*guard).map(Some)
        })
        .await?
    }
}

#[async_trait]
impl Persistence for SqliteStore {
    async fn ensure_table(&self, machine: &str, series: &str) -> Result<(), PersistenceError> {
        check_series(series)?;
        let table = quote(series);
        self.run(machine, true, move |conn| {
            conn.execute_batch(&format!(
                "CREATE TABLE IF NOT EXISTS {table} (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    time TIMESTAMP NOT NULL,
                    data REAL NOT NULL
                );"
            ))?;
            Ok(())
        })
        .await?;
        Ok(())
    }

    async fn insert(&self, machine: &str, series: &str, record: RollupRecord) -> Result<(), PersistenceError> {
        check_series(series)?;
        let (machine_name, series_name) = (machine.to_string(), series.to_string());
        self.run(machine, true, move |conn| {
            if !table_exists(conn, &series_name)? {
                return Err(PersistenceError::UnknownSeries { machine: machine_name, series: series_name });
            }
            conn.execute(
                &format!("INSERT INTO {}(time, data) VALUES (?1, ?2)", quote(&series_name)),
                params![format_timestamp(record.time), record.value],
            )?;
            Ok(())
        })
        .await?;
        Ok(())
    }

    async fn query_range(
        &self,
        machine: &str,
        series: &str,
        start: Date,
        end: Date,
    ) -> Result<Vec<RollupRecord>, PersistenceError> {
        check_series(series)?;
        let series = series.to_string();
        let rows = self
            .run(machine, false, move |conn| {
                if !table_exists(conn, &series)? {
                    return Ok(Vec::new());
                }
                let mut stmt = conn.prepare(&format!(
                    "SELECT time, data FROM {} WHERE ?1 <= DATE(time) AND DATE(time) <= ?2 ORDER BY time",
                    quote(&series)
                ))?;
                let raw = stmt
                    .query_map(params![date_text(start), date_text(end)], |row| {
                        Ok((row.get::<_, String>(0)?, row.get::<_, f64>(1)?))
                    })?
                    .collect::<Result<Vec<_>, _>>()?;
                raw.into_iter()
                    .map(|(time, value)| Ok(RollupRecord { time: read_time(time)?, value }))
                    .collect::<Result<Vec<_>, PersistenceError>>()
            })
            .await?;
        Ok(rows.unwrap_or_default())
    }

    async fn average(
        &self,
        machine: &str,
        series: &str,
        start: PrimitiveDateTime,
        end: PrimitiveDateTime,
    ) -> Result<Option<f64>, PersistenceError> {
        check_series(series)?;
        let series = series.to_string();
        let avg = self
            .run(machine, false, move |conn| {
                if !table_exists(conn, &series)? {
                    return Ok(None);
                }
                let avg: Option<f64> = conn.query_row(
                    &format!("SELECT AVG(data) FROM {} WHERE ?1 <= time AND time < ?2", quote(&series)),
                    params![format_timestamp(start), format_timestamp(end)],
                    |row| row.get(0),
                )?;
                Ok(avg)
            })
            .await?;
        Ok(avg.flatten())
    }

    async fn insert_anomaly(&self, machine: &str, record: AnomalyRecord) -> Result<(), PersistenceError> {
        self.run(machine, true, move |conn| {
            conn.execute(
                &format!("INSERT INTO {}(time, threshold, score) VALUES (?1, ?2, ?3)", quote(ANOMALY_TABLE)),
                params![format_timestamp(record.time), record.threshold, record.score],
            )?;
            Ok(())
        })
        .await?;
        Ok(())
    }

    async fn query_anomalies(
        &self,
        machine: &str,
        start: Date,
        end: Date,
    ) -> Result<Vec<AnomalyRecord>, PersistenceError> {
        let rows = self
            .run(machine, false, move |conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT time, threshold, score FROM {} WHERE ?1 <= DATE(time) AND DATE(time) <= ?2 ORDER BY time",
                    quote(ANOMALY_TABLE)
                ))?;
                let raw = stmt
                    .query_map(params![date_text(start), date_text(end)], |row| {
                        Ok((row.get::<_, String>(0)?, row.get::<_, f64>(1)?, row.get::<_, f64>(2)?))
                    })?
                    .collect::<Result<Vec<_>, _>>()?;
                raw.into_iter()
                    .map(|(time, threshold, score)| Ok(AnomalyRecord { time: read_time(time)?, score, threshold }))
                    .collect::<Result<Vec<_>, PersistenceError>>()
            })
            .await?;
        Ok(rows.unwrap_or_default())
    }

    async fn list_machines(&self) -> Result<Vec<String>, PersistenceError> {
        let dir = self.dir.clone();
        tokio::task::spawn_blocking(move || {
            let mut names = Vec::new();
            for entry in std::fs::read_dir(&dir)? {
                let path = entry?.path();
                if path.is_file() && path.extension().is_some_and(|ext| ext == "db") {
                    if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                        names.push(stem.to_string());
                    }
                }
            }
            names.sort();
            Ok(names)
        })
        .await?
    }

    async fn list_series(&self, machine: &str, granularity: Granularity) -> Result<Vec<String>, PersistenceError> {
        let suffix = granularity.suffix();
        let series = self
            .run(machine, false, move |conn| {
                let mut stmt =
                    conn.prepare("SELECT name FROM sqlite_master WHERE type = 'table' ORDER BY name")?;
                let names = stmt
                    .query_map([], |row| row.get::<_, String>(0))?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(names.into_iter().filter(|n| n.ends_with(suffix)).collect::<Vec<_>>())
            })
            .await?;
        Ok(series.unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::{date, datetime};

    #[tokio::test]
    async fn one_file_per_machine() {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteStore::open(dir.path()).unwrap();
        store.ensure_table("M1", "temp_hour_avg").await.unwrap();
        store.ensure_table("M2", "vib_hour_avg").await.unwrap();
        assert!(dir.path().join("M1.db").exists());
        assert_eq!(store.list_machines().await.unwrap(), vec!["M1", "M2"]);
    }

    #[tokio::test]
    async fn reads_never_create_a_database() {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteStore::open(dir.path()).unwrap();
        let rows = store
            .query_range("ghost", "temp_hour_avg", date!(2025-01-01), date!(2025-12-31))
            .await
            .unwrap();
        assert!(rows.is_empty());
        assert!(store.query_anomalies("ghost", date!(2025-01-01), date!(2025-01-01)).await.unwrap().is_empty());
        assert!(!dir.path().join("ghost.db").exists());
    }

    #[tokio::test]
    async fn rollup_rows_round_trip_through_sql() {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteStore::open(dir.path()).unwrap();
        store.ensure_table("M1", "temp_hour_avg").await.unwrap();
        store.ensure_table("M1", "temp_day_avg").await.unwrap();
        for (ts, v) in [
            (datetime!(2025-01-01 23:00:00), 20.0),
            (datetime!(2025-01-01 00:00:00), 10.0),
            (datetime!(2025-01-02 00:00:00), 99.0),
        ] {
            store.insert("M1", "temp_hour_avg", RollupRecord { time: ts, value: v }).await.unwrap();
        }

        let day = store
            .query_range("M1", "temp_hour_avg", date!(2025-01-01), date!(2025-01-01))
            .await
            .unwrap();
        assert_eq!(day.len(), 2);
        assert_eq!(day[0].time, datetime!(2025-01-01 00:00:00));

        let avg = store
            .average("M1", "temp_hour_avg", datetime!(2025-01-01 00:00:00), datetime!(2025-01-02 00:00:00))
            .await
            .unwrap();
        assert_eq!(avg, Some(15.0));
        let empty = store
            .average("M1", "temp_day_avg", datetime!(2025-01-01 00:00:00), datetime!(2025-01-02 00:00:00))
            .await
            .unwrap();
        assert_eq!(empty, None);

        assert_eq!(
            store.list_series("M1", Granularity::Hour).await.unwrap(),
            vec!["temp_hour_avg"]
        );
    }

    #[tokio::test]
    async fn anomalies_and_reserved_names() {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteStore::open(dir.path()).unwrap();
        let record = AnomalyRecord { time: datetime!(2025-03-01 12:30:00), score: 5.0, threshold: 3.0 };
        store.insert_anomaly("M1", record).await.unwrap();
        let found = store.query_anomalies("M1", date!(2025-03-01), date!(2025-03-01)).await.unwrap();
        assert_eq!(found, vec![record]);

        assert!(matches!(
            store.ensure_table("M1", "anomaly").await,
            Err(PersistenceError::InvalidName(_))
        ));
        assert!(matches!(
            store.insert("M1", "temp_hour_avg", RollupRecord { time: record.time, value: 1.0 }).await,
            Err(PersistenceError::UnknownSeries { .. })
        ));
    }

    #[tokio::test]
    async fn odd_sensor_names_are_quoted() {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteStore::open(dir.path()).unwrap();
        store.ensure_table("M1", "spindle 1-x_hour_avg").await.unwrap();
        store
            .insert("M1", "spindle 1-x_hour_avg", RollupRecord { time: datetime!(2025-01-01 01:00:00), value: 2.0 })
            .await
            .unwrap();
        let rows = store
            .query_range("M1", "spindle 1-x_hour_avg", date!(2025-01-01), date!(2025-01-01))
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
    }
}
