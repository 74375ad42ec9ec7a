use std::fmt;
use std::net::SocketAddr;

use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::codec::Framed;
use tracing::{debug, warn};

use super::codec::ControlCodec;
use super::packet::Packet;
use crate::error::IpuError;

/// Depth of the per-connection packet queues.
const CHANNEL_DEPTH: usize = 100;

pub type ConnectionSender = mpsc::Sender<Packet>;

/// A framed TCP connection driven by a background reader and writer task.
#[derive(Debug)]
pub struct Connection {
    // User -> Network
    tx: ConnectionSender,
    // Network -> User
    rx: mpsc::Receiver<Packet>,
    peer: Option<SocketAddr>,
}

impl Connection {
    pub fn new(stream: TcpStream) -> Self {
        let peer = stream.peer_addr().ok();
        let (mut net_writer, mut net_reader) = Framed::new(stream, ControlCodec).split();

        let (user_tx, mut network_rx) = mpsc::channel::<Packet>(CHANNEL_DEPTH);
        let (network_tx, user_rx) = mpsc::channel(CHANNEL_DEPTH);

        // Writer task: User -> Network
        tokio::spawn(async move {
            while let Some(packet) = network_rx.recv().await {
                if let Err(e) = net_writer.send(packet).await {
                    warn!(?peer, error = %e, "network write error");
                    break;
                }
            }
            debug!(?peer, "writer finished");
        });

        // Reader task: Network -> User
        tokio::spawn(async move {
            while let Some(result) = net_reader.next().await {
                match result {
                    Ok(packet) => {
                        if network_tx.send(packet).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        warn!(?peer, error = %e, "network read error");
                        break;
                    }
                }
            }
            debug!(?peer, "reader finished");
        });

        Self {
            tx: user_tx,
            rx: user_rx,
            peer,
        }
    }

    pub async fn connect(info: &ConnectionInfo) -> Result<Self, IpuError> {
        let stream = TcpStream::connect((info.host(), info.port())).await?;
        stream.set_nodelay(true)?;
        Ok(Self::new(stream))
    }

    pub async fn send(&self, packet: Packet) -> Result<(), IpuError> {
        Ok(self.tx.send(packet).await?)
    }

    /// Next packet from the peer; `None` once the connection is gone.
    pub async fn recv(&mut self) -> Option<Packet> {
        self.rx.recv().await
    }

    pub fn sender(&self) -> ConnectionSender {
        self.tx.clone()
    }

    pub fn peer(&self) -> Option<SocketAddr> {
        self.peer
    }

    pub fn into_split(self) -> (ConnectionSender, mpsc::Receiver<Packet>) {
        (self.tx, self.rx)
    }
}

/// Where to reach a daemon.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionInfo {
    host: String,
    port: u16,
}

impl ConnectionInfo {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }
}

impl fmt::Display for ConnectionInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

impl From<SocketAddr> for ConnectionInfo {
    fn from(addr: SocketAddr) -> Self {
        Self::new(addr.ip().to_string(), addr.port())
    }
}
