/*!
Recording Server - faux kernel pour tester les producteurs

Accepte les connexions, décode chaque frame et l'enregistre avec le numéro
de connexion. `drop_connections` coupe toutes les sessions ouvertes pour
tester la reconnexion.
*/

use anyhow::Result;
use daqlink_protocol::{MachineCodec, Message};
use futures::StreamExt;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::codec::FramedRead;

#[derive(Debug, Clone, PartialEq)]
pub struct RecordedFrame {
    /// rang de la connexion, à partir de 0
    pub connection: usize,
    pub message: Message,
}

pub struct RecordingServer {
    addr: SocketAddr,
    frames: Arc<Mutex<Vec<RecordedFrame>>>,
    rx: mpsc::UnboundedReceiver<RecordedFrame>,
    accepted: Arc<Mutex<usize>>,
    generation: Arc<watch::Sender<u64>>,
    task: JoinHandle<()>,
}

impl RecordingServer {
    pub async fn bind() -> Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let frames = Arc::new(Mutex::new(Vec::new()));
        let accepted = Arc::new(Mutex::new(0usize));
        let (tx, rx) = mpsc::unbounded_channel();
        let generation = Arc::new(watch::channel(0u64).0);

        let task = tokio::spawn(accept_loop(listener, frames.clone(), accepted.clone(), tx, generation.clone()));
        log::info!("[MOCK] recording server on {}", addr);
        Ok(Self { addr, frames, rx, accepted, generation, task })
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Connexions acceptées depuis le démarrage
    pub fn connections(&self) -> usize {
        *self.accepted.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Toutes les frames reçues, dans l'ordre d'arrivée
    pub fn frames(&self) -> Vec<RecordedFrame> {
        self.frames.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Prochaine frame reçue, ou erreur après `timeout`
    pub async fn next_frame(&mut self, timeout: Duration) -> Result<RecordedFrame> {
        crate::test_utils::recv_within(&mut self.rx, timeout).await
    }

    /// Coupe toutes les connexions en cours
    pub fn drop_connections(&self) {
        self.generation.send_modify(|g| *g += 1);
    }
}

impl Drop for RecordingServer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn accept_loop(
    listener: TcpListener,
    frames: Arc<Mutex<Vec<RecordedFrame>>>,
    accepted: Arc<Mutex<usize>>,
    tx: mpsc::UnboundedSender<RecordedFrame>,
    generation: Arc<watch::Sender<u64>>,
) {
    while let Ok((stream, peer)) = listener.accept().await {
        let connection = {
            let mut count = accepted.lock().unwrap_or_else(|e| e.into_inner());
            *count += 1;
            *count - 1
        };
        log::debug!("[MOCK] connection {} from {}", connection, peer);

        let frames = frames.clone();
        let tx = tx.clone();
        let mut kick = generation.subscribe();
        tokio::spawn(async move {
            let mut reader = FramedRead::new(stream, MachineCodec);
            loop {
                tokio::select! {
                    _ = kick.changed() => break,
                    frame = reader.next() => match frame {
                        Some(Ok(Ok(message))) => {
                            let recorded = RecordedFrame { connection, message };
                            frames.lock().unwrap_or_else(|e| e.into_inner()).push(recorded.clone());
                            let _ = tx.send(recorded);
                        }
                        Some(Ok(Err(e))) => log::warn!("[MOCK] bad frame on connection {}: {}", connection, e),
                        Some(Err(_)) | None => break,
                    },
                }
            }
            log::debug!("[MOCK] connection {} closed", connection);
        });
    }
}
