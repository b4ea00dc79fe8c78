//! Persistent link to the kernel
//!
//! `Disconnected -> Connecting -> Connected -> Disconnected`, forever:
//! - connect attempts are bounded by `connect_timeout`
//! - the `name` handshake is the first frame of every connection
//! - any send failure, connect failure or peer close waits `retry_interval`
//!   before the next attempt (no backoff)
//! - events handed over while not connected are dropped
//!
//! The loop stops once every `DataSender` clone is dropped.

use crate::config::ServerConfig;
use crate::resample::resample;
use daqlink_protocol::{enable_keepalive, CodecError, MachineCodec, MachineEvent, Message, SensorData};
use futures::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::codec::Framed;
use tracing::{debug, info, warn};

/// Points per sensor above which a batch is resampled before sending
pub const MAXIMUM_POINTS: usize = 30;

const OUTBOX_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Disconnected,
    Connecting,
    Connected,
}

#[derive(Debug, Clone)]
pub struct LinkConfig {
    pub name: String,
    pub addr: String,
    pub retry_interval: Duration,
    pub connect_timeout: Duration,
}

impl LinkConfig {
    pub fn new(name: impl Into<String>, server: &ServerConfig) -> Self {
        Self {
            name: name.into(),
            addr: server.addr(),
            retry_interval: server.retry_interval(),
            connect_timeout: server.connect_timeout(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum LinkError {
    #[error("connect timed out after {0:?}")]
    Timeout(Duration),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error("kernel closed the connection")]
    PeerClosed,
}

/// Wire form of an event: oversized batches are resampled to `MAXIMUM_POINTS`.
pub fn convert(event: MachineEvent) -> Message {
    match event {
        MachineEvent::DataUpdate(data) => {
            let data: SensorData = data
                .into_iter()
                .map(|(sensor, mut batch)| {
                    if batch.data.len() > MAXIMUM_POINTS {
                        batch.data = resample(&batch.data, MAXIMUM_POINTS);
                    }
                    (sensor, batch)
                })
                .collect();
            Message::DataUpdate(data)
        }
        MachineEvent::FaultDetect(report) => Message::FaultDetect(report),
    }
}

/// Handle used by the acquisition loop to push events to the kernel.
#[derive(Debug, Clone)]
pub struct DataSender {
    outbox: mpsc::Sender<Message>,
    state: watch::Receiver<LinkState>,
}

impl DataSender {
    /// Starts the connection loop in the background.
    pub fn spawn(link: LinkConfig) -> (Self, JoinHandle<()>) {
        let (outbox_tx, outbox_rx) = mpsc::channel(OUTBOX_CAPACITY);
        let (state_tx, state_rx) = watch::channel(LinkState::Disconnected);
        let task = tokio::spawn(permanent_connection(link, outbox_rx, state_tx));
        (Self { outbox: outbox_tx, state: state_rx }, task)
    }

    pub fn state(&self) -> LinkState {
        *self.state.borrow()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == LinkState::Connected
    }

    /// Waits until the link reaches `target`; false if the loop has stopped.
    pub async fn wait_for_state(&self, target: LinkState) -> bool {
        let mut state = self.state.clone();
        let reached = state.wait_for(|s| *s == target).await.is_ok();
        reached
    }

    /// Queues an event for the kernel. Returns false when it was dropped.
    pub fn event_handle(&self, event: MachineEvent) -> bool {
        if !self.is_connected() {
            debug!(event = event.name(), "not connected, event dropped");
            return false;
        }
        match self.outbox.try_send(convert(event)) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(msg)) => {
                warn!(event = msg.event_name(), "outbox full, event dropped");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }
}

enum LinkEnd {
    /// every DataSender is gone
    Shutdown,
}

async fn connect(link: &LinkConfig) -> Result<TcpStream, LinkError> {
    let stream = tokio::time::timeout(link.connect_timeout, TcpStream::connect(&link.addr))
        .await
        .map_err(|_| LinkError::Timeout(link.connect_timeout))??;
    if let Err(e) = stream.set_nodelay(true) {
        debug!(error = %e, "set_nodelay failed");
    }
    if let Err(e) = enable_keepalive(&stream) {
        warn!(error = %e, "failed to enable keepalive");
    }
    Ok(stream)
}

async fn run_link(
    stream: TcpStream,
    name: &str,
    outbox: &mut mpsc::Receiver<Message>,
    state: &watch::Sender<LinkState>,
) -> Result<LinkEnd, LinkError> {
    let mut framed = Framed::new(stream, MachineCodec);
    framed.send(Message::Name(name.to_string())).await?;
    let _ = state.send(LinkState::Connected);

    loop {
        tokio::select! {
            msg = outbox.recv() => match msg {
                Some(msg) => framed.send(msg).await?,
                None => return Ok(LinkEnd::Shutdown),
            },
            // le kernel n'envoie rien : seule la fermeture nous intéresse
            incoming = framed.next() => match incoming {
                None => return Err(LinkError::PeerClosed),
                Some(Err(e)) => return Err(e.into()),
                Some(Ok(_)) => debug!("ignoring frame from kernel"),
            },
        }
    }
}

/// Waits out the retry interval, discarding anything queued meanwhile.
/// False once the outbox is closed.
async fn idle(outbox: &mut mpsc::Receiver<Message>, period: Duration) -> bool {
    let sleep = tokio::time::sleep(period);
    tokio::pin!(sleep);
    loop {
        tokio::select! {
            _ = &mut sleep => return true,
            msg = outbox.recv() => {
                if msg.is_none() {
                    return false;
                }
            }
        }
    }
}

/// Connection loop: reconnects at a flat interval until shut down.
pub async fn permanent_connection(link: LinkConfig, mut outbox: mpsc::Receiver<Message>, state: watch::Sender<LinkState>) {
    loop {
        let _ = state.send(LinkState::Connecting);
        debug!(addr = %link.addr, "connecting to kernel");

        match connect(&link).await {
            Ok(stream) => {
                info!(machine = %link.name, addr = %link.addr, "connection made");
                match run_link(stream, &link.name, &mut outbox, &state).await {
                    Ok(LinkEnd::Shutdown) => {
                        let _ = state.send(LinkState::Disconnected);
                        info!(machine = %link.name, "data sender dropped, closing link");
                        return;
                    }
                    Err(e) => warn!(machine = %link.name, error = %e, "connection lost"),
                }
            }
            Err(e) => debug!(addr = %link.addr, error = %e, "connect failed"),
        }

        let _ = state.send(LinkState::Disconnected);
        if !idle(&mut outbox, link.retry_interval).await {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use daqlink_protocol::{FaultReport, SensorBatch};
    use tokio::net::TcpListener;
    use tokio_util::codec::FramedRead;

    fn link(addr: String) -> LinkConfig {
        LinkConfig {
            name: "M1".into(),
            addr,
            retry_interval: Duration::from_millis(50),
            connect_timeout: Duration::from_secs(2),
        }
    }

    fn update(points: usize) -> MachineEvent {
        let mut data = SensorData::new();
        data.insert("vib".into(), SensorBatch::new("VIB", (0..points).map(|i| i as f64).collect()));
        data.insert("temp".into(), SensorBatch::new("TEMP", vec![21.0; 5]));
        MachineEvent::DataUpdate(data)
    }

    async fn next_message(frames: &mut FramedRead<TcpStream, MachineCodec>) -> Message {
        tokio::time::timeout(Duration::from_secs(5), frames.next())
            .await
            .expect("timed out")
            .expect("stream ended")
            .expect("framing error")
            .expect("bad frame")
    }

    #[test]
    fn convert_resamples_only_long_batches() {
        match convert(update(100)) {
            Message::DataUpdate(data) => {
                assert_eq!(data["vib"].data.len(), MAXIMUM_POINTS);
                assert_eq!(data["vib"].kind, "VIB");
                assert_eq!(data["temp"].data, vec![21.0; 5]);
            }
            other => panic!("unexpected {other:?}"),
        }
        let fault = FaultReport { score: 5.0, threshold: 3.0 };
        assert_eq!(convert(MachineEvent::FaultDetect(fault)), Message::FaultDetect(fault));
    }

    #[tokio::test]
    async fn handshake_comes_first() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let (sender, _task) = DataSender::spawn(link(listener.local_addr().unwrap().to_string()));

        let (stream, _) = listener.accept().await.unwrap();
        let mut frames = FramedRead::new(stream, MachineCodec);
        assert_eq!(next_message(&mut frames).await, Message::Name("M1".into()));

        assert!(sender.wait_for_state(LinkState::Connected).await);
        assert!(sender.event_handle(update(40)));
        match next_message(&mut frames).await {
            Message::DataUpdate(data) => assert_eq!(data["vib"].data.len(), MAXIMUM_POINTS),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn events_are_dropped_while_disconnected() {
        // port libre : on lie puis on relâche
        let addr = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap().to_string()
        };
        let (sender, _task) = DataSender::spawn(link(addr));
        assert!(!sender.event_handle(update(1)));
        assert_ne!(sender.state(), LinkState::Connected);
    }

    #[tokio::test]
    async fn reconnects_after_peer_close() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let (sender, _task) = DataSender::spawn(link(listener.local_addr().unwrap().to_string()));

        let (stream, _) = listener.accept().await.unwrap();
        let mut frames = FramedRead::new(stream, MachineCodec);
        assert_eq!(next_message(&mut frames).await, Message::Name("M1".into()));
        drop(frames);

        let (stream, _) = tokio::time::timeout(Duration::from_secs(5), listener.accept())
            .await
            .expect("no reconnection")
            .unwrap();
        let mut frames = FramedRead::new(stream, MachineCodec);
        assert_eq!(next_message(&mut frames).await, Message::Name("M1".into()));
        assert!(sender.wait_for_state(LinkState::Connected).await);
    }

    #[tokio::test]
    async fn loop_stops_when_sender_is_dropped() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let (sender, task) = DataSender::spawn(link(listener.local_addr().unwrap().to_string()));
        let (_stream, _) = listener.accept().await.unwrap();
        assert!(sender.wait_for_state(LinkState::Connected).await);
        drop(sender);
        tokio::time::timeout(Duration::from_secs(5), task).await.expect("loop still running").unwrap();
    }
}
