//! Transport implementations.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::{debug, warn};

use orbit_core::NodeId;
use orbit_proto::NodeDescriptor;

use crate::channel::{Channel, DEFAULT_SESSION_DEPTH, MAX_FRAME_SIZE};
use crate::NetError;

/// How long a dial may take before it is abandoned.
pub const DIAL_TIMEOUT: Duration = Duration::from_secs(20);

/// Opens sessions to storage nodes and satellites.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Dials a node, returning a fresh session.
    async fn dial(&self, node: &NodeDescriptor) -> Result<Channel, NetError>;
}

/// In-process transport: nodes register an acceptor under their id and
/// dialing hands them the server half of a new session.
#[derive(Clone, Default)]
pub struct LocalTransport {
    registry: Arc<Mutex<HashMap<NodeId, mpsc::UnboundedSender<Channel>>>>,
}

impl LocalTransport {
    /// Creates an empty transport.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a listener for `id`, returning its session acceptor.
    pub fn listen(&self, id: NodeId) -> mpsc::UnboundedReceiver<Channel> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.registry.lock().insert(id, tx);
        rx
    }

    /// Removes the listener for `id`; subsequent dials fail.
    pub fn unlisten(&self, id: &NodeId) {
        self.registry.lock().remove(id);
    }
}

#[async_trait]
impl Transport for LocalTransport {
    async fn dial(&self, node: &NodeDescriptor) -> Result<Channel, NetError> {
        let acceptor = self
            .registry
            .lock()
            .get(&node.id)
            .cloned()
            .ok_or_else(|| NetError::DialFailed(format!("node {} not listening", node.id)))?;

        let (client, server) = Channel::pair(DEFAULT_SESSION_DEPTH);
        acceptor
            .send(server)
            .map_err(|_| NetError::DialFailed(format!("node {} stopped listening", node.id)))?;
        Ok(client)
    }
}

/// TCP transport with 4-byte little-endian length framing.
#[derive(Clone, Default)]
pub struct TcpTransport;

impl TcpTransport {
    /// Creates the transport.
    pub fn new() -> Self {
        Self
    }

    /// Binds a listener and returns its address plus a session acceptor.
    pub async fn listen(addr: SocketAddr) -> Result<(SocketAddr, mpsc::Receiver<Channel>), NetError> {
        let listener = TcpListener::bind(addr).await?;
        let local = listener.local_addr()?;
        let (tx, rx) = mpsc::channel(DEFAULT_SESSION_DEPTH);

        tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, peer)) => {
                        debug!(%peer, "accepted session");
                        let channel = pump(stream);
                        if tx.send(channel).await.is_err() {
                            break;
                        }
                    }
                    Err(err) => {
                        warn!(error = %err, "accept failed");
                        break;
                    }
                }
            }
        });

        Ok((local, rx))
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn dial(&self, node: &NodeDescriptor) -> Result<Channel, NetError> {
        let stream = timeout(DIAL_TIMEOUT, TcpStream::connect(&node.address.address))
            .await
            .map_err(|_| NetError::DialTimeout)?
            .map_err(|e| NetError::DialFailed(e.to_string()))?;
        Ok(pump(stream))
    }
}

/// Spawns read/write pump tasks converting a TCP stream into a frame channel.
fn pump(stream: TcpStream) -> Channel {
    let (mut read_half, mut write_half) = stream.into_split();
    let (in_tx, in_rx) = mpsc::channel::<Bytes>(DEFAULT_SESSION_DEPTH);
    let (out_tx, mut out_rx) = mpsc::channel::<Bytes>(DEFAULT_SESSION_DEPTH);

    tokio::spawn(async move {
        loop {
            let mut len_bytes = [0u8; 4];
            if read_half.read_exact(&mut len_bytes).await.is_err() {
                break;
            }
            let len = u32::from_le_bytes(len_bytes) as usize;
            if len > MAX_FRAME_SIZE {
                warn!(len, "dropping oversized frame");
                break;
            }
            let mut frame = vec![0u8; len];
            if read_half.read_exact(&mut frame).await.is_err() {
                break;
            }
            if in_tx.send(Bytes::from(frame)).await.is_err() {
                break;
            }
        }
    });

    tokio::spawn(async move {
        while let Some(frame) = out_rx.recv().await {
            let len = (frame.len() as u32).to_le_bytes();
            if write_half.write_all(&len).await.is_err() {
                break;
            }
            if write_half.write_all(&frame).await.is_err() {
                break;
            }
            if write_half.flush().await.is_err() {
                break;
            }
        }
    });

    Channel::from_halves(out_tx, in_rx)
}

#[cfg(test)]
mod tests {
    use super::*;
    use orbit_proto::NodeAddress;

    fn descriptor(id: NodeId, address: &str) -> NodeDescriptor {
        NodeDescriptor::new(id, NodeAddress::new(address))
    }

    #[tokio::test]
    async fn test_local_transport_roundtrip() {
        let transport = LocalTransport::new();
        let id = NodeId::random();
        let mut acceptor = transport.listen(id);

        let node = descriptor(id, "local");
        let client = transport.dial(&node).await.unwrap();
        let mut server = acceptor.recv().await.unwrap();

        client.send(Bytes::from_static(b"hi")).await.unwrap();
        assert_eq!(server.recv().await.unwrap(), Bytes::from_static(b"hi"));
    }

    #[tokio::test]
    async fn test_local_transport_unknown_node() {
        let transport = LocalTransport::new();
        let node = descriptor(NodeId::random(), "local");
        assert!(matches!(
            transport.dial(&node).await,
            Err(NetError::DialFailed(_))
        ));
    }

    #[tokio::test]
    async fn test_local_transport_unlisten() {
        let transport = LocalTransport::new();
        let id = NodeId::random();
        let _acceptor = transport.listen(id);
        transport.unlisten(&id);
        assert!(transport.dial(&descriptor(id, "local")).await.is_err());
    }

    #[tokio::test]
    async fn test_tcp_transport_roundtrip() {
        let (addr, mut acceptor) = TcpTransport::listen("127.0.0.1:0".parse().unwrap())
            .await
            .unwrap();

        let transport = TcpTransport::new();
        let node = descriptor(NodeId::random(), &addr.to_string());
        let client = transport.dial(&node).await.unwrap();
        let mut server = acceptor.recv().await.unwrap();

        client.send(Bytes::from_static(b"over tcp")).await.unwrap();
        assert_eq!(server.recv().await.unwrap(), Bytes::from_static(b"over tcp"));

        server.send(Bytes::from_static(b"reply")).await.unwrap();
        let mut client = client;
        assert_eq!(client.recv().await.unwrap(), Bytes::from_static(b"reply"));
    }

    #[tokio::test]
    async fn test_tcp_dial_refused() {
        let transport = TcpTransport::new();
        // Port 1 is essentially never listening.
        let node = descriptor(NodeId::random(), "127.0.0.1:1");
        assert!(transport.dial(&node).await.is_err());
    }
}
