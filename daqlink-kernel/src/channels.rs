/**
 * CHANNELS - Un canal pub/sub par machine connectée
 *
 * RÔLE : diffuser en live les moyennes minute et les anomalies d'une machine à
 * ses viewers, et rejouer l'historique récent à chaque nouveau viewer.
 *
 * FONCTIONNEMENT :
 * - créé au handshake (Connected), détruit quand la dernière session de
 *   l'identité se termine (compteur de sessions)
 * - un buffer borné par capteur (FIFO, capacité par défaut 60)
 * - attach = rejeu complet puis live ; comme le registre n'est manipulé que
 *   par le coordinateur il n'y a ni trou ni doublon entre les deux
 * - file bornée par viewer : un viewer trop lent perd les événements qui
 *   débordent mais reste abonné ; un viewer fermé est retiré au publish suivant
 */

use crate::models::{MinuteAverage, ViewerEvent};
use std::collections::{BTreeMap, HashMap, VecDeque};
use tokio::sync::mpsc;
use uuid::Uuid;

/// Événements en attente par viewer avant de perdre les suivants
pub const VIEWER_QUEUE: usize = 256;

pub type ViewerTx = mpsc::Sender<ViewerEvent>;
pub type ViewerRx = mpsc::Receiver<ViewerEvent>;

pub fn viewer_queue() -> (ViewerTx, ViewerRx) {
    mpsc::channel(VIEWER_QUEUE)
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ChannelError {
    #[error("no live channel for machine {0}")]
    UnknownMachine(String),
}

struct Viewer {
    id: Uuid,
    tx: ViewerTx,
}

struct Channel {
    sessions: usize,
    replay: BTreeMap<String, VecDeque<MinuteAverage>>,
    viewers: Vec<Viewer>,
}

impl Channel {
    fn new() -> Self {
        Self { sessions: 0, replay: BTreeMap::new(), viewers: Vec::new() }
    }

    fn broadcast(&mut self, event: &ViewerEvent) -> usize {
        let mut reached = 0;
        self.viewers.retain(|v| match v.tx.try_send(event.clone()) {
            Ok(()) => {
                reached += 1;
                true
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                tracing::warn!(viewer = %v.id, "viewer queue full, event dropped");
                true
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                tracing::debug!(viewer = %v.id, "pruning closed viewer");
                false
            }
        });
        reached
    }
}

pub struct ChannelRegistry {
    capacity: usize,
    channels: HashMap<String, Channel>,
}

impl ChannelRegistry {
    pub fn new(capacity: usize) -> Self {
        Self { capacity: capacity.max(1), channels: HashMap::new() }
    }

    /// Ouvre (ou ré-référence) le canal d'une identité. Rend `true` à la création.
    pub fn register(&mut self, machine: &str) -> bool {
        let channel = self.channels.entry(machine.to_string()).or_insert_with(Channel::new);
        channel.sessions += 1;
        channel.sessions == 1
    }

    /// Relâche une session. Rend `true` si le canal a été détruit.
    pub fn unregister(&mut self, machine: &str) -> bool {
        let Some(channel) = self.channels.get_mut(machine) else {
            tracing::warn!(machine, "unregister for unknown channel");
            return false;
        };
        channel.sessions = channel.sessions.saturating_sub(1);
        if channel.sessions == 0 {
            self.channels.remove(machine);
            return true;
        }
        false
    }

    /// Diffuse un événement ; un `Update` est d'abord ajouté au buffer de rejeu.
    /// Rend le nombre de viewers atteints.
    pub fn publish(&mut self, machine: &str, event: ViewerEvent) -> usize {
        let capacity = self.capacity;
        let Some(channel) = self.channels.get_mut(machine) else {
            tracing::debug!(machine, "publish on missing channel");
            return 0;
        };
        match &event {
            ViewerEvent::Update(avg) => {
                let buffer = channel.replay.entry(avg.sensor_name.clone()).or_default();
                buffer.push_back(avg.clone());
                while buffer.len() > capacity {
                    buffer.pop_front();
                }
            }
            ViewerEvent::Anomaly(_) => {}
            ViewerEvent::Initialize(_) => {
                tracing::debug!(machine, "initialize is viewer-only, not published");
                return 0;
            }
        }
        channel.broadcast(&event)
    }

    /// Rejoue tout le buffer au viewer (un `initialize` par capteur) puis l'abonne au live.
    pub fn attach(&mut self, machine: &str, tx: ViewerTx) -> Result<Uuid, ChannelError> {
        let channel = self
            .channels
            .get_mut(machine)
            .ok_or_else(|| ChannelError::UnknownMachine(machine.to_string()))?;
        let id = Uuid::new_v4();
        for buffer in channel.replay.values() {
            let backlog: Vec<MinuteAverage> = buffer.iter().cloned().collect();
            match tx.try_send(ViewerEvent::Initialize(backlog)) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    tracing::warn!(machine, viewer = %id, "viewer queue full during replay");
                }
                Err(mpsc::error::TrySendError::Closed(_)) => return Ok(id),
            }
        }
        channel.viewers.push(Viewer { id, tx });
        Ok(id)
    }

    /// Identités live, triées
    pub fn list(&self) -> Vec<String> {
        let mut names: Vec<String> = self.channels.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn contains(&self, machine: &str) -> bool {
        self.channels.contains_key(machine)
    }

    pub fn viewer_count(&self, machine: &str) -> usize {
        self.channels.get(machine).map(|c| c.viewers.len()).unwrap_or(0)
    }
}
