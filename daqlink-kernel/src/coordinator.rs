/**
 * COORDINATEUR - Unique propriétaire de l'état des machines
 *
 * RÔLE : consommer le relais (Connected / Event / Disconnected) et les
 * requêtes viewers (liste, attach) dans une seule tâche, sans verrou.
 *
 * FONCTIONNEMENT :
 * - moteurs d'agrégation par identité, conservés entre reconnexions
 * - registre des canaux : register au Connected, unregister au Disconnected
 * - chaque événement est traité jusqu'au bout (awaits de persistance compris)
 *   avant de lire le suivant
 * - les handlers HTTP passent par CoordinatorHandle (mpsc + oneshot)
 */

use crate::channels::{ChannelError, ChannelRegistry, ViewerTx};
use crate::clock::Clock;
use crate::engine::{AggregationEngine, EngineContext};
use crate::notify::NotificationSink;
use crate::persistence::SharedStore;
use crate::relay::{RelayMessage, RelayReceiver};
use crate::stat::StatModes;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info};
use uuid::Uuid;

const REQUEST_QUEUE: usize = 64;

pub enum ViewerRequest {
    ListMachines { reply: oneshot::Sender<Vec<String>> },
    Attach { machine: String, tx: ViewerTx, reply: oneshot::Sender<Result<Uuid, ChannelError>> },
}

#[derive(Debug, thiserror::Error)]
#[error("coordinator stopped")]
pub struct CoordinatorGone;

/// Accès des handlers HTTP au coordinateur
#[derive(Clone)]
pub struct CoordinatorHandle {
    tx: mpsc::Sender<ViewerRequest>,
    live: Arc<AtomicUsize>,
}

impl CoordinatorHandle {
    pub async fn list_machines(&self) -> Result<Vec<String>, CoordinatorGone> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(ViewerRequest::ListMachines { reply }).await.map_err(|_| CoordinatorGone)?;
        rx.await.map_err(|_| CoordinatorGone)
    }

    pub async fn attach(&self, machine: &str, viewer: ViewerTx) -> Result<Result<Uuid, ChannelError>, CoordinatorGone> {
        let (reply, rx) = oneshot::channel();
        let req = ViewerRequest::Attach { machine: machine.to_string(), tx: viewer, reply };
        self.tx.send(req).await.map_err(|_| CoordinatorGone)?;
        rx.await.map_err(|_| CoordinatorGone)
    }

    /// Nombre de canaux live (lecture sans passer par la tâche)
    pub fn live_machines(&self) -> usize {
        self.live.load(Ordering::Relaxed)
    }
}

pub struct Coordinator {
    engines: HashMap<String, AggregationEngine>,
    channels: ChannelRegistry,
    notifier: NotificationSink,
    store: SharedStore,
    modes: StatModes,
    clock: Arc<dyn Clock>,
    topic: String,
    live: Arc<AtomicUsize>,
}

impl Coordinator {
    pub fn new(
        store: SharedStore,
        notifier: NotificationSink,
        clock: Arc<dyn Clock>,
        modes: StatModes,
        replay_capacity: usize,
        topic: impl Into<String>,
    ) -> Self {
        Self {
            engines: HashMap::new(),
            channels: ChannelRegistry::new(replay_capacity),
            notifier,
            store,
            modes,
            clock,
            topic: topic.into(),
            live: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn channels(&self) -> &ChannelRegistry {
        &self.channels
    }

    pub fn engine(&self, machine: &str) -> Option<&AggregationEngine> {
        self.engines.get(machine)
    }

    pub async fn handle_relay(&mut self, msg: RelayMessage) {
        match msg {
            RelayMessage::Connected { session, machine } => {
                let created = self.channels.register(&machine);
                let now = self.clock.now();
                self.engines
                    .entry(machine.clone())
                    .or_insert_with(|| AggregationEngine::new(machine.clone(), now));
                info!(session, machine = %machine, created, "channel registered");
            }
            RelayMessage::Event { machine, event, .. } => {
                let now = self.clock.now();
                let engine = self
                    .engines
                    .entry(machine.clone())
                    .or_insert_with(|| AggregationEngine::new(machine, now));
                let mut ctx = EngineContext {
                    store: self.store.as_ref(),
                    channels: &mut self.channels,
                    notifier: &mut self.notifier,
                    modes: &self.modes,
                    topic: &self.topic,
                };
                engine.handle(event, now, &mut ctx).await;
            }
            RelayMessage::Disconnected { session, machine } => {
                let destroyed = self.channels.unregister(&machine);
                info!(session, machine = %machine, destroyed, "channel released");
            }
        }
        self.live.store(self.channels.list().len(), Ordering::Relaxed);
    }

    pub fn handle_request(&mut self, req: ViewerRequest) {
        match req {
            ViewerRequest::ListMachines { reply } => {
                let _ = reply.send(self.channels.list());
            }
            ViewerRequest::Attach { machine, tx, reply } => {
                let result = self.channels.attach(&machine, tx);
                debug!(machine = %machine, ok = result.is_ok(), "viewer attach");
                let _ = reply.send(result);
            }
        }
    }

    /// Boucle principale ; se termine quand tous les émetteurs du relais ont disparu.
    pub async fn run(mut self, mut relay: RelayReceiver, mut requests: mpsc::Receiver<ViewerRequest>) {
        let mut requests_open = true;
        loop {
            tokio::select! {
                // le relais passe en premier : une requête voit tout ce qui a été relayé avant elle
                biased;
                msg = relay.recv() => match msg {
                    Some(msg) => self.handle_relay(msg).await,
                    None => break,
                },
                req = requests.recv(), if requests_open => match req {
                    Some(req) => self.handle_request(req),
                    None => requests_open = false,
                },
            }
        }
        info!("relay closed, coordinator stopping");
    }

    pub fn spawn(self, relay: RelayReceiver) -> (CoordinatorHandle, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(REQUEST_QUEUE);
        let handle = CoordinatorHandle { tx, live: self.live.clone() };
        let task = tokio::spawn(self.run(relay, rx));
        (handle, task)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::models::ViewerEvent;
    use crate::persistence::MemoryStore;
    use crate::relay::relay;
    use daqlink_protocol::{MachineEvent, SensorBatch, SensorData};
    use time::macros::datetime;
    use time::Duration;

    fn coordinator(clock: &ManualClock) -> Coordinator {
        let (tx, _rx) = mpsc::channel(8);
        let shared: Arc<dyn Clock> = Arc::new(clock.clone());
        let notifier = NotificationSink::with_queue(tx, shared.clone(), Duration::seconds(60));
        Coordinator::new(Arc::new(MemoryStore::new()), notifier, shared, StatModes::default(), 60, "anomaly")
    }

    fn temp(value: f64) -> MachineEvent {
        let mut data = SensorData::new();
        data.insert("temp".into(), SensorBatch::new("TEMP", vec![value]));
        MachineEvent::DataUpdate(data)
    }

    #[tokio::test]
    async fn duplicate_identity_keeps_channel_until_last_session() {
        let clock = ManualClock::new(datetime!(2025-01-01 10:00:00));
        let mut coord = coordinator(&clock);
        coord.handle_relay(RelayMessage::Connected { session: 1, machine: "M1".into() }).await;
        coord.handle_relay(RelayMessage::Connected { session: 2, machine: "M1".into() }).await;
        coord.handle_relay(RelayMessage::Disconnected { session: 1, machine: "M1".into() }).await;
        assert_eq!(coord.channels().list(), vec!["M1"]);
        coord.handle_relay(RelayMessage::Disconnected { session: 2, machine: "M1".into() }).await;
        assert!(coord.channels().list().is_empty());
    }

    #[tokio::test]
    async fn engine_state_survives_reconnect() {
        let clock = ManualClock::new(datetime!(2025-01-01 10:00:00));
        let mut coord = coordinator(&clock);
        coord.handle_relay(RelayMessage::Connected { session: 1, machine: "M1".into() }).await;
        coord.handle_relay(RelayMessage::Event { session: 1, machine: "M1".into(), event: temp(10.0) }).await;
        coord.handle_relay(RelayMessage::Disconnected { session: 1, machine: "M1".into() }).await;
        coord.handle_relay(RelayMessage::Connected { session: 2, machine: "M1".into() }).await;
        coord.handle_relay(RelayMessage::Event { session: 2, machine: "M1".into(), event: temp(20.0) }).await;

        let stats = coord.engine("M1").unwrap().sensor("temp").unwrap();
        assert_eq!(stats.hour.count(), 2);
        assert_eq!(stats.hour.sum(), 30.0);
    }

    #[tokio::test]
    async fn spawned_coordinator_answers_viewers() {
        let clock = ManualClock::new(datetime!(2025-01-01 10:00:00));
        let coord = coordinator(&clock);
        let (relay_tx, relay_rx) = relay();
        let (handle, task) = coord.spawn(relay_rx);

        relay_tx.send(RelayMessage::Connected { session: 1, machine: "M1".into() }).unwrap();
        relay_tx.send(RelayMessage::Event { session: 1, machine: "M1".into(), event: temp(4.0) }).unwrap();
        assert_eq!(handle.list_machines().await.unwrap(), vec!["M1"]);
        assert_eq!(handle.live_machines(), 1);

        let (vtx, mut vrx) = crate::channels::viewer_queue();
        handle.attach("M1", vtx).await.unwrap().unwrap();
        clock.advance(Duration::minutes(1));
        relay_tx.send(RelayMessage::Event { session: 1, machine: "M1".into(), event: temp(6.0) }).unwrap();
        match vrx.recv().await.unwrap() {
            ViewerEvent::Update(avg) => assert_eq!(avg.data, Some(4.0)),
            other => panic!("unexpected {other:?}"),
        }

        let (vtx, _) = crate::channels::viewer_queue();
        assert!(handle.attach("ghost", vtx).await.unwrap().is_err());

        drop(relay_tx);
        task.await.unwrap();
        assert!(handle.list_machines().await.is_err());
    }
}
