/*!
Mock Machine - producteur TCP pour tester le kernel sans agent réel

Parle le protocole filaire (préfixe de longueur + JSON) et garde la trace
de tout ce qu'il a envoyé.
*/

use anyhow::{Context, Result};
use daqlink_protocol::{MachineCodec, Message};
use futures::SinkExt;
use std::net::SocketAddr;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio_util::codec::Framed;

pub struct MockMachine {
    framed: Framed<TcpStream, MachineCodec>,
    sent: Vec<Message>,
}

impl MockMachine {
    /// Connexion brute, sans handshake
    pub async fn connect(addr: SocketAddr) -> Result<Self> {
        let stream = TcpStream::connect(addr)
            .await
            .with_context(|| format!("mock machine failed to connect to {addr}"))?;
        stream.set_nodelay(true)?;
        Ok(Self { framed: Framed::new(stream, MachineCodec), sent: Vec::new() })
    }

    /// Connexion + handshake `name`
    pub async fn connect_as(addr: SocketAddr, name: &str) -> Result<Self> {
        let mut machine = Self::connect(addr).await?;
        machine.send(Message::Name(name.to_string())).await?;
        log::info!("[MOCK] machine {} connected to {}", name, addr);
        Ok(machine)
    }

    pub async fn send(&mut self, message: Message) -> Result<()> {
        self.framed.send(message.clone()).await?;
        log::debug!("[MOCK] sent {}", message.event_name());
        self.sent.push(message);
        Ok(())
    }

    pub async fn send_all(&mut self, messages: impl IntoIterator<Item = Message>) -> Result<()> {
        for message in messages {
            self.send(message).await?;
        }
        Ok(())
    }

    /// Octets arbitraires (frames corrompues ou tronquées)
    pub async fn send_raw(&mut self, bytes: &[u8]) -> Result<()> {
        SinkExt::<Message>::flush(&mut self.framed).await?;
        let stream = self.framed.get_mut();
        stream.write_all(bytes).await?;
        stream.flush().await?;
        log::debug!("[MOCK] sent {} raw bytes", bytes.len());
        Ok(())
    }

    /// Messages typés envoyés jusqu'ici
    pub fn sent(&self) -> &[Message] {
        &self.sent
    }

    /// Vrai si le kernel a fermé la connexion (lecture EOF ou erreur)
    pub async fn is_closed_by_peer(&mut self) -> bool {
        use tokio::io::AsyncReadExt;
        let mut buf = [0u8; 1];
        matches!(self.framed.get_mut().read(&mut buf).await, Ok(0) | Err(_))
    }

    /// Fermeture propre côté machine
    pub async fn close(mut self) -> Result<()> {
        SinkExt::<Message>::flush(&mut self.framed).await?;
        self.framed.get_mut().shutdown().await?;
        Ok(())
    }
}
