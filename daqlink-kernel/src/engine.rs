/**
 * MOTEUR D'AGRÉGATION - État statistique d'une machine
 *
 * RÔLE : transformer le flux DataUpdate/FaultDetect d'une machine en
 * moyennes minute (live), agrégats heure/jour/mois/année (persistés) et
 * anomalies (persistées + notifiées).
 *
 * FONCTIONNEMENT (à chaque DataUpdate, avant d'ajouter les échantillons) :
 * 1. minute franchie  -> moyenne minute de chaque capteur vers le canal
 * 2. heure franchie   -> moyenne horaire persistée, horodatée au début de l'heure écoulée
 * 3. jour franchi     -> moyenne des lignes horaires du jour écoulé
 * 4. mois / année     -> idem à partir des lignes jour / mois
 * Chaque niveau n'est testé que si le précédent a basculé. Pas de rattrapage :
 * sans événement, rien n'est calculé.
 *
 * Une erreur (moyenne vide, stockage) est loggée, jamais propagée : un
 * capteur refusé par le stockage reste diffusé en live, seuls ses agrégats
 * ne sont pas écrits.
 */

use crate::channels::ChannelRegistry;
use crate::clock::{
    day_start, hour_start, month_start, next_month_start, next_year_start, year_start, BoundaryTracker, Crossed,
};
use crate::models::{AnomalyRecord, Granularity, MinuteAverage, RollupRecord, ViewerEvent};
use crate::notify::NotificationSink;
use crate::persistence::{Persistence, PersistenceError};
use crate::stat::{Stat, StatModes};
use daqlink_protocol::{FaultReport, MachineEvent, SensorData};
use std::collections::{BTreeMap, BTreeSet};
use time::{Duration, PrimitiveDateTime};
use tracing::{debug, error, info, warn};

/// Dépendances empruntées au coordinateur le temps d'un événement
pub struct EngineContext<'a> {
    pub store: &'a dyn Persistence,
    pub channels: &'a mut ChannelRegistry,
    pub notifier: &'a mut NotificationSink,
    pub modes: &'a StatModes,
    pub topic: &'a str,
}

/// Fenêtres minute et heure d'un capteur, alimentées à l'identique
#[derive(Debug, Clone)]
pub struct SensorStats {
    pub minute: Stat,
    pub hour: Stat,
}

pub struct AggregationEngine {
    machine: String,
    tracker: BoundaryTracker,
    sensors: BTreeMap<String, SensorStats>,
    /// capteurs dont le stockage refuse les séries (nom réservé...), live seulement
    unpersisted: BTreeSet<String>,
}

impl AggregationEngine {
    pub fn new(machine: impl Into<String>, now: PrimitiveDateTime) -> Self {
        Self {
            machine: machine.into(),
            tracker: BoundaryTracker::new(now),
            sensors: BTreeMap::new(),
            unpersisted: BTreeSet::new(),
        }
    }

    pub fn machine(&self) -> &str {
        &self.machine
    }

    pub fn sensor(&self, name: &str) -> Option<&SensorStats> {
        self.sensors.get(name)
    }

    pub fn is_persisted(&self, sensor: &str) -> bool {
        self.sensors.contains_key(sensor) && !self.unpersisted.contains(sensor)
    }

    pub async fn handle(&mut self, event: MachineEvent, now: PrimitiveDateTime, ctx: &mut EngineContext<'_>) {
        match event {
            MachineEvent::DataUpdate(data) => self.on_data_update(data, now, ctx).await,
            MachineEvent::FaultDetect(report) => self.on_fault_detect(report, now, ctx).await,
        }
    }

    async fn on_data_update(&mut self, data: SensorData, now: PrimitiveDateTime, ctx: &mut EngineContext<'_>) {
        let prev = self.tracker.last();
        let crossed = self.tracker.observe(now);
        if crossed != Crossed::default() {
            self.roll(crossed, prev, now, ctx).await;
        }

        for (sensor, batch) in data {
            if !self.sensors.contains_key(&sensor) {
                self.track_sensor(&sensor, &batch.kind, ctx).await;
            }
            if let Some(stats) = self.sensors.get_mut(&sensor) {
                stats.minute.add(&batch.data);
                stats.hour.add(&batch.data);
            }
        }
    }

    /// Premier échantillon d'un capteur : tables (si le stockage accepte le nom) + accumulateurs.
    async fn track_sensor(&mut self, sensor: &str, kind: &str, ctx: &mut EngineContext<'_>) {
        for granularity in Granularity::ALL {
            match ctx.store.ensure_table(&self.machine, &granularity.series(sensor)).await {
                Ok(()) => {}
                Err(PersistenceError::InvalidName(name)) => {
                    warn!(machine = %self.machine, sensor, series = %name, "name refused by storage, live only");
                    self.unpersisted.insert(sensor.to_string());
                    break;
                }
                Err(e) => error!(machine = %self.machine, sensor, error = %e, "failed to create series"),
            }
        }
        let mode = ctx.modes.mode_for(kind);
        info!(machine = %self.machine, sensor, kind, ?mode, "new sensor");
        self.sensors.insert(
            sensor.to_string(),
            SensorStats { minute: Stat::new(mode), hour: Stat::new(mode) },
        );
    }

    async fn roll(&mut self, crossed: Crossed, prev: PrimitiveDateTime, now: PrimitiveDateTime, ctx: &mut EngineContext<'_>) {
        if crossed.minute {
            self.emit_minute(now, ctx);
        }
        if crossed.hour {
            self.save_hour(hour_start(prev), ctx.store).await;
        }
        let day = prev.date();
        if crossed.day {
            let start = day_start(day);
            self.save_derived(Granularity::Day, start, start + Duration::days(1), ctx.store).await;
        }
        if crossed.month {
            let start = day_start(month_start(day));
            self.save_derived(Granularity::Month, start, day_start(next_month_start(day)), ctx.store).await;
        }
        if crossed.year {
            let start = day_start(year_start(day));
            self.save_derived(Granularity::Year, start, day_start(next_year_start(day)), ctx.store).await;
        }
    }

    fn emit_minute(&mut self, now: PrimitiveDateTime, ctx: &mut EngineContext<'_>) {
        for (sensor, stats) in self.sensors.iter_mut() {
            let data = match stats.minute.take_average(sensor) {
                Ok(avg) => Some(avg),
                Err(e) => {
                    warn!(machine = %self.machine, error = %e, "empty minute window");
                    None
                }
            };
            let event = ViewerEvent::Update(MinuteAverage { sensor_name: sensor.clone(), data, time: now });
            let reached = ctx.channels.publish(&self.machine, event);
            debug!(machine = %self.machine, %sensor, ?data, reached, "minute average");
        }
    }

    async fn save_hour(&mut self, hour: PrimitiveDateTime, store: &dyn Persistence) {
        for (sensor, stats) in self.sensors.iter_mut() {
            let avg = match stats.hour.take_average(sensor) {
                Ok(avg) => avg,
                Err(e) => {
                    warn!(machine = %self.machine, error = %e, "hour average undefined, not persisted");
                    continue;
                }
            };
            if self.unpersisted.contains(sensor) {
                continue;
            }
            let series = Granularity::Hour.series(sensor);
            let record = RollupRecord { time: hour, value: avg };
            if let Err(e) = store.insert(&self.machine, &series, record).await {
                error!(machine = %self.machine, %series, error = %e, "failed to persist rollup");
            }
        }
    }

    /// Agrégat jour/mois/année = moyenne des lignes de la granularité inférieure sur `[start, end)`.
    async fn save_derived(
        &self,
        granularity: Granularity,
        start: PrimitiveDateTime,
        end: PrimitiveDateTime,
        store: &dyn Persistence,
    ) {
        let Some(source) = granularity.source() else { return };
        for sensor in self.sensors.keys().filter(|s| !self.unpersisted.contains(*s)) {
            let from = source.series(sensor);
            let avg = match store.average(&self.machine, &from, start, end).await {
                Ok(Some(avg)) => avg,
                Ok(None) => {
                    warn!(machine = %self.machine, series = %from, ?granularity, "no rows to roll up, skipped");
                    continue;
                }
                Err(e) => {
                    error!(machine = %self.machine, series = %from, error = %e, "rollup query failed");
                    continue;
                }
            };
            let series = granularity.series(sensor);
            if let Err(e) = store.insert(&self.machine, &series, RollupRecord { time: start, value: avg }).await {
                error!(machine = %self.machine, %series, error = %e, "failed to persist rollup");
            }
        }
    }

    async fn on_fault_detect(&mut self, report: FaultReport, now: PrimitiveDateTime, ctx: &mut EngineContext<'_>) {
        ctx.channels.publish(&self.machine, ViewerEvent::Anomaly(report));
        if !report.is_anomaly() {
            return;
        }
        info!(machine = %self.machine, score = report.score, threshold = report.threshold, "anomaly detected");
        let record = AnomalyRecord { time: now, score: report.score, threshold: report.threshold };
        if let Err(e) = ctx.store.insert_anomaly(&self.machine, record).await {
            error!(machine = %self.machine, error = %e, "failed to persist anomaly");
        }
        ctx.notifier.notify(
            ctx.topic,
            &format!("{} anomaly detected", self.machine),
            &format!("score {} / threshold {}", report.score, report.threshold),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channels::{viewer_queue, ViewerRx};
    use crate::clock::ManualClock;
    use crate::notify::Notification;
    use crate::persistence::MemoryStore;
    use async_trait::async_trait;
    use daqlink_protocol::SensorBatch;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use time::Date;
    use time::macros::{date, datetime};
    use tokio::sync::mpsc;

    struct Harness {
        store: Box<dyn Persistence>,
        channels: ChannelRegistry,
        notifier: NotificationSink,
        notes: mpsc::Receiver<Notification>,
        modes: StatModes,
        viewer: ViewerRx,
    }

    impl Harness {
        fn new(machine: &str) -> Self {
            Self::with_store(machine, Box::new(MemoryStore::new()))
        }

        fn with_store(machine: &str, store: Box<dyn Persistence>) -> Self {
            let clock = ManualClock::new(datetime!(2025-01-01 00:00:00));
            let (tx, notes) = mpsc::channel(8);
            let mut channels = ChannelRegistry::new(60);
            channels.register(machine);
            let (vtx, viewer) = viewer_queue();
            channels.attach(machine, vtx).unwrap();
            Self {
                store,
                channels,
                notifier: NotificationSink::with_queue(tx, Arc::new(clock), Duration::seconds(60)),
                notes,
                modes: StatModes::default(),
                viewer,
            }
        }

        async fn feed(&mut self, engine: &mut AggregationEngine, event: MachineEvent, now: PrimitiveDateTime) {
            let mut ctx = EngineContext {
                store: self.store.as_ref(),
                channels: &mut self.channels,
                notifier: &mut self.notifier,
                modes: &self.modes,
                topic: "anomaly",
            };
            engine.handle(event, now, &mut ctx).await;
        }
    }

    fn update(sensor: &str, kind: &str, data: &[f64]) -> MachineEvent {
        let mut map = SensorData::new();
        map.insert(sensor.into(), SensorBatch::new(kind, data.to_vec()));
        MachineEvent::DataUpdate(map)
    }

    fn minute_values(rx: &mut ViewerRx) -> Vec<Option<f64>> {
        let mut out = Vec::new();
        while let Ok(event) = rx.try_recv() {
            if let ViewerEvent::Update(avg) = event {
                out.push(avg.data);
            }
        }
        out
    }

    #[tokio::test]
    async fn minute_boundary_broadcasts_and_hour_keeps_accumulating() {
        let mut h = Harness::new("M1");
        let mut engine = AggregationEngine::new("M1", datetime!(2025-01-01 10:00:00));
        h.feed(&mut engine, update("temp", "TEMP", &[10.0, 20.0]), datetime!(2025-01-01 10:00:10)).await;
        h.feed(&mut engine, update("temp", "TEMP", &[]), datetime!(2025-01-01 10:01:00)).await;

        assert_eq!(minute_values(&mut h.viewer), vec![Some(15.0)]);
        let stats = engine.sensor("temp").unwrap();
        assert_eq!(stats.hour.sum(), 30.0);
        assert_eq!(stats.hour.count(), 2);
        assert_eq!(stats.minute.count(), 0);
    }

    #[tokio::test]
    async fn empty_minute_emits_null_sentinel() {
        let mut h = Harness::new("M1");
        let mut engine = AggregationEngine::new("M1", datetime!(2025-01-01 10:00:00));
        h.feed(&mut engine, update("temp", "TEMP", &[1.0]), datetime!(2025-01-01 10:00:01)).await;
        h.feed(&mut engine, update("temp", "TEMP", &[]), datetime!(2025-01-01 10:01:01)).await;
        h.feed(&mut engine, update("temp", "TEMP", &[4.0]), datetime!(2025-01-01 10:02:01)).await;
        h.feed(&mut engine, update("temp", "TEMP", &[]), datetime!(2025-01-01 10:03:01)).await;
        assert_eq!(minute_values(&mut h.viewer), vec![Some(1.0), None, Some(4.0)]);
    }

    #[tokio::test]
    async fn new_sensor_gets_four_series_and_typed_mode() {
        let mut h = Harness::new("M1");
        let mut engine = AggregationEngine::new("M1", datetime!(2025-01-01 10:00:00));
        h.feed(&mut engine, update("spindle", "VIB", &[-2.0, 2.0]), datetime!(2025-01-01 10:00:01)).await;
        for g in Granularity::ALL {
            assert_eq!(h.store.list_series("M1", g).await.unwrap(), vec![g.series("spindle")]);
        }
        assert_eq!(engine.sensor("spindle").unwrap().hour.sum(), 4.0);
    }

    #[tokio::test]
    async fn reserved_sensor_name_is_live_only() {
        let mut h = Harness::new("M1");
        let mut engine = AggregationEngine::new("M1", datetime!(2025-01-01 10:00:00));
        h.feed(&mut engine, update("anomaly", "TEMP", &[1.0]), datetime!(2025-01-01 10:00:01)).await;
        h.feed(&mut engine, update("anomaly", "TEMP", &[3.0]), datetime!(2025-01-01 10:01:01)).await;
        h.feed(&mut engine, update("anomaly", "TEMP", &[]), datetime!(2025-01-01 11:00:01)).await;

        assert_eq!(minute_values(&mut h.viewer), vec![Some(1.0), Some(3.0)]);
        assert!(engine.sensor("anomaly").is_some());
        assert!(!engine.is_persisted("anomaly"));
        for g in Granularity::ALL {
            assert!(h.store.list_series("M1", g).await.unwrap().is_empty());
        }
    }

    #[tokio::test]
    async fn machine_name_refused_by_storage_still_streams_live() {
        let mut h = Harness::new("line/3");
        let mut engine = AggregationEngine::new("line/3", datetime!(2025-01-01 10:00:00));
        h.feed(&mut engine, update("temp", "TEMP", &[10.0]), datetime!(2025-01-01 10:00:05)).await;
        h.feed(&mut engine, update("temp", "TEMP", &[20.0]), datetime!(2025-01-01 10:01:05)).await;
        h.feed(&mut engine, update("temp", "TEMP", &[]), datetime!(2025-01-01 11:00:05)).await;

        assert_eq!(minute_values(&mut h.viewer), vec![Some(10.0), Some(20.0)]);
        assert!(!engine.is_persisted("temp"));
        assert!(h.store.list_machines().await.unwrap().is_empty());
    }

    /// Stockage en panne : chaque appel échoue avec une erreur d'E/S.
    #[derive(Default)]
    struct FailingStore {
        calls: AtomicUsize,
    }

    impl FailingStore {
        fn fail<T>(&self) -> Result<T, PersistenceError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(PersistenceError::Io(std::io::Error::other("disk unavailable")))
        }
    }

    #[async_trait]
    impl Persistence for FailingStore {
        async fn ensure_table(&self, _: &str, _: &str) -> Result<(), PersistenceError> {
            self.fail()
        }
        async fn insert(&self, _: &str, _: &str, _: RollupRecord) -> Result<(), PersistenceError> {
            self.fail()
        }
        async fn query_range(&self, _: &str, _: &str, _: Date, _: Date) -> Result<Vec<RollupRecord>, PersistenceError> {
            self.fail()
        }
        async fn average(
            &self,
            _: &str,
            _: &str,
            _: PrimitiveDateTime,
            _: PrimitiveDateTime,
        ) -> Result<Option<f64>, PersistenceError> {
            self.fail()
        }
        async fn insert_anomaly(&self, _: &str, _: AnomalyRecord) -> Result<(), PersistenceError> {
            self.fail()
        }
        async fn query_anomalies(&self, _: &str, _: Date, _: Date) -> Result<Vec<AnomalyRecord>, PersistenceError> {
            self.fail()
        }
        async fn list_machines(&self) -> Result<Vec<String>, PersistenceError> {
            self.fail()
        }
        async fn list_series(&self, _: &str, _: Granularity) -> Result<Vec<String>, PersistenceError> {
            self.fail()
        }
    }

    #[tokio::test]
    async fn storage_failures_leave_live_view_and_accumulators_intact() {
        let mut h = Harness::with_store("M1", Box::new(FailingStore::default()));
        let mut engine = AggregationEngine::new("M1", datetime!(2024-12-31 23:00:00));
        h.feed(&mut engine, update("temp", "TEMP", &[10.0]), datetime!(2024-12-31 23:58:10)).await;
        h.feed(&mut engine, update("temp", "TEMP", &[20.0, 40.0]), datetime!(2024-12-31 23:59:10)).await;
        // heure, jour, mois et année basculent ensemble : insert et average échouent
        h.feed(&mut engine, update("temp", "TEMP", &[5.0]), datetime!(2025-01-01 00:00:10)).await;

        assert_eq!(minute_values(&mut h.viewer), vec![Some(10.0), Some(30.0)]);
        assert!(engine.is_persisted("temp"));
        let stats = engine.sensor("temp").unwrap();
        assert_eq!(stats.minute.count(), 1);
        assert_eq!(stats.hour.count(), 1);
        assert_eq!(stats.hour.sum(), 5.0);

        let report = FaultReport { score: 9.0, threshold: 1.0 };
        h.feed(&mut engine, MachineEvent::FaultDetect(report), datetime!(2025-01-01 00:00:20)).await;
        assert_eq!(h.viewer.try_recv().unwrap(), ViewerEvent::Anomaly(report));
        assert!(h.notes.try_recv().is_ok());
    }

    #[tokio::test]
    async fn hour_rollup_is_stamped_at_start_of_completed_hour() {
        let mut h = Harness::new("M1");
        let mut engine = AggregationEngine::new("M1", datetime!(2025-01-01 10:00:00));
        h.feed(&mut engine, update("temp", "TEMP", &[10.0, 20.0]), datetime!(2025-01-01 10:15:00)).await;
        h.feed(&mut engine, update("temp", "TEMP", &[30.0]), datetime!(2025-01-01 10:45:00)).await;
        h.feed(&mut engine, update("temp", "TEMP", &[100.0]), datetime!(2025-01-01 11:02:00)).await;

        let rows = h
            .store
            .query_range("M1", "temp_hour_avg", date!(2025-01-01), date!(2025-01-01))
            .await
            .unwrap();
        assert_eq!(rows, vec![RollupRecord { time: datetime!(2025-01-01 10:00:00), value: 20.0 }]);
        assert_eq!(engine.sensor("temp").unwrap().hour.count(), 1);
    }

    #[tokio::test]
    async fn cascade_through_new_year() {
        let mut h = Harness::new("M1");
        let mut engine = AggregationEngine::new("M1", datetime!(2024-12-31 22:00:00));
        // une heure complète de données la veille du réveillon
        h.feed(&mut engine, update("temp", "TEMP", &[8.0]), datetime!(2024-12-31 22:30:00)).await;
        h.feed(&mut engine, update("temp", "TEMP", &[12.0]), datetime!(2024-12-31 23:10:00)).await;
        h.feed(&mut engine, update("temp", "TEMP", &[0.0]), datetime!(2025-01-01 00:00:30)).await;

        let hour = h.store.query_range("M1", "temp_hour_avg", date!(2024-12-31), date!(2024-12-31)).await.unwrap();
        assert_eq!(hour.len(), 2);
        let day = h.store.query_range("M1", "temp_day_avg", date!(2024-12-31), date!(2024-12-31)).await.unwrap();
        assert_eq!(day, vec![RollupRecord { time: datetime!(2024-12-31 00:00:00), value: 10.0 }]);
        let month = h.store.query_range("M1", "temp_month_avg", date!(2024-12-01), date!(2024-12-01)).await.unwrap();
        assert_eq!(month, vec![RollupRecord { time: datetime!(2024-12-01 00:00:00), value: 10.0 }]);
        let year = h.store.query_range("M1", "temp_year_avg", date!(2024-01-01), date!(2024-01-01)).await.unwrap();
        assert_eq!(year, vec![RollupRecord { time: datetime!(2024-01-01 00:00:00), value: 10.0 }]);
    }

    #[tokio::test]
    async fn empty_hour_is_not_persisted() {
        let mut h = Harness::new("M1");
        let mut engine = AggregationEngine::new("M1", datetime!(2025-01-01 09:00:00));
        h.feed(&mut engine, update("temp", "TEMP", &[5.0]), datetime!(2025-01-01 09:10:00)).await;
        h.feed(&mut engine, update("temp", "TEMP", &[]), datetime!(2025-01-01 10:10:00)).await;
        h.feed(&mut engine, update("temp", "TEMP", &[]), datetime!(2025-01-01 11:10:00)).await;
        let rows = h.store.query_range("M1", "temp_hour_avg", date!(2025-01-01), date!(2025-01-01)).await.unwrap();
        assert_eq!(rows.len(), 1);
    }

    #[tokio::test]
    async fn fault_above_threshold_is_persisted_and_notified() {
        let mut h = Harness::new("M1");
        let mut engine = AggregationEngine::new("M1", datetime!(2025-01-01 10:00:00));
        let now = datetime!(2025-01-01 10:00:05);
        h.feed(&mut engine, MachineEvent::FaultDetect(FaultReport { score: 5.0, threshold: 3.0 }), now).await;

        let stored = h.store.query_anomalies("M1", date!(2025-01-01), date!(2025-01-01)).await.unwrap();
        assert_eq!(stored, vec![AnomalyRecord { time: now, score: 5.0, threshold: 3.0 }]);
        let note = h.notes.try_recv().unwrap();
        assert_eq!(note.topic, "anomaly");
        assert!(note.title.starts_with("M1"));
        assert!(matches!(h.viewer.try_recv().unwrap(), ViewerEvent::Anomaly(_)));
    }

    #[tokio::test]
    async fn fault_below_threshold_is_broadcast_only() {
        let mut h = Harness::new("M1");
        let mut engine = AggregationEngine::new("M1", datetime!(2025-01-01 10:00:00));
        let report = FaultReport { score: 2.0, threshold: 3.0 };
        h.feed(&mut engine, MachineEvent::FaultDetect(report), datetime!(2025-01-01 10:00:05)).await;

        assert_eq!(h.viewer.try_recv().unwrap(), ViewerEvent::Anomaly(report));
        assert!(h.store.query_anomalies("M1", date!(2025-01-01), date!(2025-01-01)).await.unwrap().is_empty());
        assert!(h.notes.try_recv().is_err());
    }
}
