/**
 * LISTENER MACHINES - Sessions TCP entrantes
 *
 * RÔLE : accepter les connexions des machines, valider le handshake `name`,
 * décoder les frames et les pousser dans le relais vers le coordinateur.
 *
 * FONCTIONNEMENT :
 * - tourne sur son propre thread OS avec son runtime Tokio (spawn_dedicated)
 * - une tâche par session, chacune avec son buffer de décodage
 * - keepalive TCP sur chaque socket acceptée, aucun timeout de lecture
 *
 * RÈGLES DE SESSION :
 * - 1re frame != `name` (ou illisible) -> violation, fermeture sans enregistrement
 * - frame illisible après handshake -> ignorée, connexion gardée
 * - `name` répété -> ignoré avec warning
 * - frame trop grande -> fermeture
 * - EOF / reset / coupure en milieu de frame -> déconnexion normale
 * - toute session enregistrée émet Disconnected avant de se terminer
 */

use crate::relay::{RelayMessage, RelaySender, SessionId};
use daqlink_protocol::{enable_keepalive, CodecError, MachineCodec, Message};
use futures::StreamExt;
use std::net::SocketAddr;
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tokio_util::codec::FramedRead;
use tracing::{debug, error, info, warn};

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("first frame must be `name`, got `{0}`")]
    ExpectedHandshake(&'static str),
    #[error("undecodable handshake frame: {0}")]
    BadHandshake(#[source] CodecError),
    #[error("empty machine name")]
    EmptyName,
}

/// Raison de fin d'une session
#[derive(Debug)]
pub enum SessionEnd {
    /// EOF, reset ou coupure en milieu de frame
    PeerClosed,
    /// frame hors limites, flux irrécupérable
    Framing(CodecError),
    Violation(ProtocolError),
    /// coordinateur arrêté
    RelayClosed,
}

type Frames = FramedRead<TcpStream, MachineCodec>;

async fn handshake(frames: &mut Frames) -> Result<String, SessionEnd> {
    match frames.next().await {
        None => Err(SessionEnd::PeerClosed),
        Some(Err(CodecError::Io(_))) => Err(SessionEnd::PeerClosed),
        Some(Err(e)) => Err(SessionEnd::Framing(e)),
        Some(Ok(Err(e))) => Err(SessionEnd::Violation(ProtocolError::BadHandshake(e))),
        Some(Ok(Ok(Message::Name(name)))) => {
            if name.trim().is_empty() {
                Err(SessionEnd::Violation(ProtocolError::EmptyName))
            } else {
                Ok(name)
            }
        }
        Some(Ok(Ok(other))) => Err(SessionEnd::Violation(ProtocolError::ExpectedHandshake(other.event_name()))),
    }
}

/// Boucle de lecture d'une session jusqu'à sa fin.
pub async fn run_session(stream: TcpStream, session: SessionId, relay: RelaySender) -> SessionEnd {
    let peer = stream.peer_addr().ok();
    let mut frames = FramedRead::new(stream, MachineCodec);

    let machine = match handshake(&mut frames).await {
        Ok(name) => name,
        Err(end) => {
            warn!(session, ?peer, ?end, "session closed before registration");
            return end;
        }
    };
    info!(session, ?peer, machine = %machine, "machine connected");
    if relay.send(RelayMessage::Connected { session, machine: machine.clone() }).is_err() {
        return SessionEnd::RelayClosed;
    }

    let end = loop {
        match frames.next().await {
            None => break SessionEnd::PeerClosed,
            Some(Err(CodecError::Io(e))) => {
                debug!(session, machine = %machine, error = %e, "transport closed");
                break SessionEnd::PeerClosed;
            }
            Some(Err(e)) => break SessionEnd::Framing(e),
            Some(Ok(Err(e))) => {
                warn!(session, machine = %machine, error = %e, "dropping malformed frame");
            }
            Some(Ok(Ok(msg))) => match msg.into_event() {
                None => warn!(session, machine = %machine, "repeated handshake ignored"),
                Some(event) => {
                    let msg = RelayMessage::Event { session, machine: machine.clone(), event };
                    if relay.send(msg).is_err() {
                        break SessionEnd::RelayClosed;
                    }
                }
            },
        }
    };

    match &end {
        SessionEnd::PeerClosed => info!(session, machine = %machine, "machine disconnected"),
        other => warn!(session, machine = %machine, end = ?other, "session terminated"),
    }
    let _ = relay.send(RelayMessage::Disconnected { session, machine });
    end
}

pub struct MachineListener {
    listener: TcpListener,
    relay: RelaySender,
}

impl MachineListener {
    pub async fn bind(addr: impl ToSocketAddrs, relay: RelaySender) -> std::io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self { listener, relay })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Boucle d'accept ; s'arrête quand le coordinateur a disparu.
    pub async fn run(self) {
        loop {
            let (stream, peer) = match self.listener.accept().await {
                Ok(conn) => conn,
                Err(e) => {
                    warn!(error = %e, "accept failed");
                    continue;
                }
            };
            if self.relay.is_closed() {
                info!("relay closed, listener stopping");
                break;
            }
            if let Err(e) = stream.set_nodelay(true) {
                debug!(?peer, error = %e, "set_nodelay failed");
            }
            if let Err(e) = enable_keepalive(&stream) {
                warn!(?peer, error = %e, "failed to enable keepalive");
            }
            let session = self.relay.next_session_id();
            debug!(session, ?peer, "connection accepted");
            tokio::spawn(run_session(stream, session, self.relay.clone()));
        }
    }
}

pub struct ListenerHandle {
    pub local_addr: SocketAddr,
    pub thread: std::thread::JoinHandle<()>,
}

/// Lance le listener sur un thread dédié avec son propre runtime multi-thread.
/// Rend une fois la socket liée (ou l'erreur de bind).
pub fn spawn_dedicated(addr: String, worker_threads: usize, relay: RelaySender) -> std::io::Result<ListenerHandle> {
    let (ready_tx, ready_rx) = std::sync::mpsc::channel::<std::io::Result<SocketAddr>>();
    let thread = std::thread::Builder::new()
        .name("daqlink-listener".into())
        .spawn(move || {
            let rt = match tokio::runtime::Builder::new_multi_thread()
                .worker_threads(worker_threads.max(1))
                .thread_name("daqlink-listener-worker")
                .enable_all()
                .build()
            {
                Ok(rt) => rt,
                Err(e) => {
                    let _ = ready_tx.send(Err(e));
                    return;
                }
            };
            rt.block_on(async move {
                let listener = match MachineListener::bind(addr.as_str(), relay).await {
                    Ok(l) => l,
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                match listener.local_addr() {
                    Ok(local) => {
                        let _ = ready_tx.send(Ok(local));
                    }
                    Err(e) => {
                        error!(error = %e, "listener has no local address");
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                }
                listener.run().await;
            });
        })?;

    let local_addr = ready_rx
        .recv()
        .map_err(|_| std::io::Error::other("listener thread exited before binding"))??;
    info!(%local_addr, "machine listener ready");
    Ok(ListenerHandle { local_addr, thread })
}
