//! Relay between the listener runtime and the coordinator task.
//!
//! Many writers (one per session), a single reader. Order is preserved per
//! session only. The queue is unbounded: nothing is dropped and no session
//! is ever slowed down, so memory grows if the coordinator stalls.

use daqlink_protocol::MachineEvent;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

pub type SessionId = u64;

#[derive(Debug, Clone, PartialEq)]
pub enum RelayMessage {
    Connected { session: SessionId, machine: String },
    Event { session: SessionId, machine: String, event: MachineEvent },
    Disconnected { session: SessionId, machine: String },
}

/// Compteurs exposés par /health
#[derive(Debug, Default)]
pub struct RelayCounters {
    sessions_opened: AtomicU64,
    sessions_closed: AtomicU64,
    events: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct RelaySnapshot {
    pub sessions_opened: u64,
    pub sessions_closed: u64,
    pub events: u64,
}

impl RelayCounters {
    pub fn snapshot(&self) -> RelaySnapshot {
        RelaySnapshot {
            sessions_opened: self.sessions_opened.load(Ordering::Relaxed),
            sessions_closed: self.sessions_closed.load(Ordering::Relaxed),
            events: self.events.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, thiserror::Error)]
#[error("relay closed, coordinator is gone")]
pub struct RelayClosed;

#[derive(Debug, Clone)]
pub struct RelaySender {
    tx: mpsc::UnboundedSender<RelayMessage>,
    counters: Arc<RelayCounters>,
    next_session: Arc<AtomicU64>,
}

pub type RelayReceiver = mpsc::UnboundedReceiver<RelayMessage>;

pub fn relay() -> (RelaySender, RelayReceiver) {
    let (tx, rx) = mpsc::unbounded_channel();
    let sender = RelaySender {
        tx,
        counters: Arc::new(RelayCounters::default()),
        next_session: Arc::new(AtomicU64::new(1)),
    };
    (sender, rx)
}

impl RelaySender {
    pub fn next_session_id(&self) -> SessionId {
        self.next_session.fetch_add(1, Ordering::Relaxed)
    }

    pub fn counters(&self) -> Arc<RelayCounters> {
        self.counters.clone()
    }

    pub fn send(&self, msg: RelayMessage) -> Result<(), RelayClosed> {
        let counter = match &msg {
            RelayMessage::Connected { .. } => &self.counters.sessions_opened,
            RelayMessage::Event { .. } => &self.counters.events,
            RelayMessage::Disconnected { .. } => &self.counters.sessions_closed,
        };
        self.tx.send(msg).map_err(|_| RelayClosed)?;
        counter.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}
