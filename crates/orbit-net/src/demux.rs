//! Service demultiplexing for daemons serving several protocols on one
//! listener.
//!
//! The dialing side sends a one-frame service tag right after connecting;
//! the accepting side reads it and hands the session to the registered
//! service.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;
use tracing::warn;

use orbit_proto::NodeDescriptor;

use crate::channel::{Channel, DEFAULT_SESSION_DEPTH};
use crate::transport::Transport;
use crate::NetError;

/// Well-known service tags.
pub mod tags {
    /// Piece store sessions.
    pub const PIECES: &str = "pieces";
    /// Pointer RPC sessions.
    pub const POINTERS: &str = "pointers";
    /// Kademlia sessions.
    pub const DHT: &str = "dht";
    /// Bandwidth settlement sessions.
    pub const AGREEMENTS: &str = "agreements";
}

/// Transport wrapper that prefixes every session with a service tag.
pub struct TaggedTransport {
    inner: Arc<dyn Transport>,
    tag: &'static str,
}

impl TaggedTransport {
    /// Wraps a transport for one service.
    pub fn new(inner: Arc<dyn Transport>, tag: &'static str) -> Self {
        Self { inner, tag }
    }
}

#[async_trait]
impl Transport for TaggedTransport {
    async fn dial(&self, node: &NodeDescriptor) -> Result<Channel, NetError> {
        let channel = self.inner.dial(node).await?;
        channel.send(Bytes::from_static(self.tag.as_bytes())).await?;
        Ok(channel)
    }
}

/// Routes accepted sessions to services by their tag frame.
pub struct Demux {
    services: HashMap<String, mpsc::Sender<Channel>>,
}

impl Demux {
    /// Creates an empty demux.
    pub fn new() -> Self {
        Self {
            services: HashMap::new(),
        }
    }

    /// Registers a service, returning its session acceptor.
    pub fn register(&mut self, tag: &str) -> mpsc::Receiver<Channel> {
        let (tx, rx) = mpsc::channel(DEFAULT_SESSION_DEPTH);
        self.services.insert(tag.to_string(), tx);
        rx
    }

    /// Routes sessions until the listener closes.
    pub async fn run(self, mut acceptor: mpsc::Receiver<Channel>) {
        let services = Arc::new(self.services);
        while let Some(mut channel) = acceptor.recv().await {
            let services = services.clone();
            tokio::spawn(async move {
                let Some(tag_frame) = channel.recv().await else {
                    return;
                };
                let Ok(tag) = std::str::from_utf8(&tag_frame) else {
                    warn!("non-UTF-8 service tag");
                    return;
                };
                match services.get(tag) {
                    Some(service) => {
                        let _ = service.send(channel).await;
                    }
                    None => warn!(tag, "session for unknown service"),
                }
            });
        }
    }
}

impl Default for Demux {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::LocalTransport;
    use orbit_core::NodeId;
    use orbit_proto::NodeAddress;

    #[tokio::test]
    async fn test_sessions_route_by_tag() {
        let transport = LocalTransport::new();
        let id = NodeId::random();
        let node = NodeDescriptor::new(id, NodeAddress::new("local"));

        let raw_acceptor = transport.listen(id);
        let mut demux = Demux::new();
        let mut pieces = demux.register(tags::PIECES);
        let mut dht = demux.register(tags::DHT);

        // Bridge the unbounded listener into the demux.
        let (bridge_tx, bridge_rx) = mpsc::channel(16);
        tokio::spawn(async move {
            let mut raw_acceptor = raw_acceptor;
            while let Some(channel) = raw_acceptor.recv().await {
                if bridge_tx.send(channel).await.is_err() {
                    break;
                }
            }
        });
        tokio::spawn(demux.run(bridge_rx));

        let inner: Arc<dyn Transport> = Arc::new(transport);
        let piece_dialer = TaggedTransport::new(inner.clone(), tags::PIECES);
        let dht_dialer = TaggedTransport::new(inner, tags::DHT);

        let piece_session = piece_dialer.dial(&node).await.unwrap();
        piece_session.send(Bytes::from_static(b"piece data")).await.unwrap();
        let mut accepted = pieces.recv().await.unwrap();
        assert_eq!(accepted.recv().await.unwrap(), Bytes::from_static(b"piece data"));

        let dht_session = dht_dialer.dial(&node).await.unwrap();
        dht_session.send(Bytes::from_static(b"query")).await.unwrap();
        let mut accepted = dht.recv().await.unwrap();
        assert_eq!(accepted.recv().await.unwrap(), Bytes::from_static(b"query"));
    }
}
