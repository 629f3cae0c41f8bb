//! DHT service: RPC handling, lookups, and the overlay feed.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use tokio::sync::{mpsc, watch};
use tracing::{debug, warn};

use orbit_core::{CanonicalDecode, CanonicalEncode, DecodeError, NodeId};
use orbit_net::{Channel, ConnectionPool, Transport};
use orbit_overlay::{NodeSource, OverlayError};
use orbit_proto::NodeDescriptor;

use crate::lookup::{find_node, LookupConfig, NodeQuery};
use crate::routing::{RoutingTable, RoutingTableConfig};
use crate::{DhtError, DEFAULT_ALPHA};

/// Wire messages between DHT peers.
#[derive(Debug, Clone, PartialEq)]
pub enum NodeMessage {
    /// Liveness probe.
    Ping {
        /// The probing node.
        sender: NodeDescriptor,
    },
    /// Liveness response.
    Pong,
    /// Asks for nodes close to a target.
    Query {
        /// The querying node.
        sender: NodeDescriptor,
        /// Lookup target.
        target: NodeId,
    },
    /// Neighbors close to the queried target.
    QueryResponse {
        /// Up to k nodes, closest first.
        nodes: Vec<NodeDescriptor>,
    },
}

impl NodeMessage {
    const PING: u32 = 0;
    const PONG: u32 = 1;
    const QUERY: u32 = 2;
    const QUERY_RESPONSE: u32 = 3;
}

impl CanonicalEncode for NodeMessage {
    fn encode(&self, buf: &mut BytesMut) {
        match self {
            NodeMessage::Ping { sender } => {
                Self::PING.encode(buf);
                sender.encode(buf);
            }
            NodeMessage::Pong => Self::PONG.encode(buf),
            NodeMessage::Query { sender, target } => {
                Self::QUERY.encode(buf);
                sender.encode(buf);
                target.encode(buf);
            }
            NodeMessage::QueryResponse { nodes } => {
                Self::QUERY_RESPONSE.encode(buf);
                nodes.encode(buf);
            }
        }
    }
}

impl CanonicalDecode for NodeMessage {
    fn decode(buf: &mut Bytes) -> Result<Self, DecodeError> {
        match u32::decode(buf)? {
            Self::PING => Ok(NodeMessage::Ping {
                sender: NodeDescriptor::decode(buf)?,
            }),
            Self::PONG => Ok(NodeMessage::Pong),
            Self::QUERY => Ok(NodeMessage::Query {
                sender: NodeDescriptor::decode(buf)?,
                target: NodeId::decode(buf)?,
            }),
            Self::QUERY_RESPONSE => Ok(NodeMessage::QueryResponse {
                nodes: Vec::<NodeDescriptor>::decode(buf)?,
            }),
            tag => Err(DecodeError::InvalidEnumTag(tag)),
        }
    }
}

/// DHT configuration.
#[derive(Debug, Clone)]
pub struct DhtConfig {
    /// Routing table parameters.
    pub routing: RoutingTableConfig,
    /// Lookup parallelism (alpha).
    pub alpha: usize,
}

impl Default for DhtConfig {
    fn default() -> Self {
        Self {
            routing: RoutingTableConfig::default(),
            alpha: DEFAULT_ALPHA,
        }
    }
}

/// Shared lookup context; doubles as the per-peer query client.
///
/// Peer sessions are pooled: the first exchange dials, later exchanges
/// reuse the session; a failed exchange drops the pooled entry so the next
/// one starts fresh.
struct QueryCtx {
    local: NodeDescriptor,
    routing: RoutingTable,
    pool: ConnectionPool,
}

impl QueryCtx {
    async fn exchange(
        &self,
        node: &NodeDescriptor,
        message: &NodeMessage,
    ) -> Result<NodeMessage, DhtError> {
        let session = self.pool.dial(node).await?;
        let mut channel = session.lock().await;
        channel.send_msg(message).await?;
        match channel.recv_msg::<NodeMessage>().await? {
            Some(response) => Ok(response),
            None => Err(DhtError::QueryFailed("peer closed the session".into())),
        }
    }
}

#[async_trait]
impl NodeQuery for QueryCtx {
    async fn query(
        &self,
        node: &NodeDescriptor,
        target: NodeId,
    ) -> Result<Vec<NodeDescriptor>, DhtError> {
        let request = NodeMessage::Query {
            sender: self.local.clone(),
            target,
        };
        let outcome = match self.exchange(node, &request).await {
            Ok(NodeMessage::QueryResponse { nodes }) => Ok(nodes),
            Ok(other) => Err(DhtError::BadMessage(format!(
                "unexpected query response: {other:?}"
            ))),
            Err(err) => Err(err),
        };

        match &outcome {
            Ok(nodes) => {
                self.routing.touch(&node.id);
                for descriptor in nodes {
                    if descriptor.id != self.local.id {
                        self.routing.insert(descriptor.clone());
                    }
                }
            }
            Err(_) => {
                self.pool.disconnect(&node.id);
                self.routing.record_failure(&node.id);
            }
        }
        outcome
    }
}

/// The Kademlia service for one participant.
pub struct DhtService {
    config: DhtConfig,
    ctx: Arc<QueryCtx>,
}

impl DhtService {
    /// Creates a service for `local`.
    pub fn new(local: NodeDescriptor, config: DhtConfig, transport: Arc<dyn Transport>) -> Self {
        let routing = RoutingTable::new(local.id, config.routing.clone());
        Self {
            config,
            ctx: Arc::new(QueryCtx {
                local,
                routing,
                pool: ConnectionPool::new(transport),
            }),
        }
    }

    /// The local descriptor.
    pub fn local(&self) -> &NodeDescriptor {
        &self.ctx.local
    }

    /// The routing table.
    pub fn routing_table(&self) -> &RoutingTable {
        &self.ctx.routing
    }

    fn lookup_config(&self) -> LookupConfig {
        LookupConfig {
            alpha: self.config.alpha,
            k: self.config.routing.bucket_size,
        }
    }

    /// Serves peer sessions until the acceptor closes.
    pub async fn serve(self: Arc<Self>, mut acceptor: mpsc::UnboundedReceiver<Channel>) {
        while let Some(channel) = acceptor.recv().await {
            let service = self.clone();
            tokio::spawn(async move {
                service.handle_session(channel).await;
            });
        }
    }

    async fn handle_session(&self, mut channel: Channel) {
        loop {
            match channel.recv_msg::<NodeMessage>().await {
                Ok(Some(message)) => {
                    if let Some(response) = self.handle_message(message) {
                        if channel.send_msg(&response).await.is_err() {
                            return;
                        }
                    }
                }
                Ok(None) => return,
                Err(err) => {
                    warn!(error = %err, "undecodable peer message");
                    return;
                }
            }
        }
    }

    /// Handles one peer message, producing the response if one is due.
    pub fn handle_message(&self, message: NodeMessage) -> Option<NodeMessage> {
        match message {
            NodeMessage::Ping { sender } => {
                self.observe(sender);
                Some(NodeMessage::Pong)
            }
            NodeMessage::Query { sender, target } => {
                self.observe(sender);
                let nodes = self
                    .ctx
                    .routing
                    .closest(&target, self.config.routing.bucket_size);
                Some(NodeMessage::QueryResponse { nodes })
            }
            NodeMessage::Pong | NodeMessage::QueryResponse { .. } => None,
        }
    }

    fn observe(&self, sender: NodeDescriptor) {
        if sender.id != self.ctx.local.id {
            self.ctx.routing.insert(sender);
        }
    }

    /// Periodic routing upkeep: evicts stale peers, promoting replacement
    /// cache candidates.
    pub fn maintenance(&self) {
        let evicted = self.ctx.routing.evict_stale();
        if !evicted.is_empty() {
            debug!(count = evicted.len(), "evicted stale peers");
        }
    }

    /// Pings a peer, returning whether it responded.
    pub async fn ping(&self, node: &NodeDescriptor) -> bool {
        let request = NodeMessage::Ping {
            sender: self.ctx.local.clone(),
        };
        match self.ctx.exchange(node, &request).await {
            Ok(NodeMessage::Pong) => {
                self.ctx.routing.touch(&node.id);
                true
            }
            _ => {
                self.ctx.pool.disconnect(&node.id);
                self.ctx.routing.record_failure(&node.id);
                false
            }
        }
    }

    /// Joins the network through `seeds` by looking up the local id.
    pub async fn bootstrap(&self, seeds: &[NodeDescriptor]) -> usize {
        for seed in seeds {
            if seed.id != self.ctx.local.id {
                self.ctx.routing.insert(seed.clone());
            }
        }
        let found = self.find_node(self.ctx.local.id).await;
        debug!(found = found.len(), "bootstrap lookup finished");
        self.ctx.routing.len()
    }

    /// Runs an iterative lookup from the routing table's closest seeds.
    pub async fn find_node(&self, target: NodeId) -> Vec<NodeDescriptor> {
        let (_cancel_tx, cancel_rx) = watch::channel(false);
        self.find_node_with_cancel(target, cancel_rx).await
    }

    /// Lookup with caller-controlled cancellation.
    pub async fn find_node_with_cancel(
        &self,
        target: NodeId,
        cancel: watch::Receiver<bool>,
    ) -> Vec<NodeDescriptor> {
        let seeds = self
            .ctx
            .routing
            .closest(&target, self.config.routing.bucket_size);
        find_node(
            target,
            seeds,
            self.ctx.clone() as Arc<dyn NodeQuery>,
            self.lookup_config(),
            cancel,
        )
        .await
    }
}

#[async_trait]
impl NodeSource for DhtService {
    fn seen(&self) -> Vec<NodeDescriptor> {
        self.ctx.routing.all_nodes()
    }

    async fn refresh(&self, target: NodeId) -> Result<Vec<NodeDescriptor>, OverlayError> {
        Ok(self.find_node(target).await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use orbit_net::LocalTransport;
    use orbit_proto::NodeAddress;

    fn spawn_node(transport: &LocalTransport, config: DhtConfig) -> Arc<DhtService> {
        let id = NodeId::random();
        let local = NodeDescriptor::new(id, NodeAddress::new("local"));
        let service = Arc::new(DhtService::new(
            local,
            config,
            Arc::new(transport.clone()),
        ));
        let acceptor = transport.listen(id);
        tokio::spawn(service.clone().serve(acceptor));
        service
    }

    #[tokio::test]
    async fn test_ping() {
        let transport = LocalTransport::new();
        let a = spawn_node(&transport, DhtConfig::default());
        let b = spawn_node(&transport, DhtConfig::default());

        assert!(a.ping(b.local()).await);
        assert!(a.routing_table().get(&b.local().id).is_some());
        assert!(b.routing_table().get(&a.local().id).is_some());
    }

    #[tokio::test]
    async fn test_ping_dead_node_records_failure() {
        let transport = LocalTransport::new();
        let a = spawn_node(&transport, DhtConfig::default());
        let ghost = NodeDescriptor::new(NodeId::random(), NodeAddress::new("local"));

        assert!(!a.ping(&ghost).await);
    }

    #[tokio::test]
    async fn test_query_returns_closest() {
        let transport = LocalTransport::new();
        let a = spawn_node(&transport, DhtConfig::default());
        let b = spawn_node(&transport, DhtConfig::default());

        // Teach b about some nodes.
        for _ in 0..5 {
            b.routing_table().insert(NodeDescriptor::new(
                NodeId::random(),
                NodeAddress::new("local"),
            ));
        }

        let response = b.handle_message(NodeMessage::Query {
            sender: a.local().clone(),
            target: NodeId::random(),
        });
        match response {
            Some(NodeMessage::QueryResponse { nodes }) => {
                assert!(!nodes.is_empty());
            }
            other => panic!("unexpected response: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_bootstrap_discovers_peers() {
        let transport = LocalTransport::new();
        let hub = spawn_node(&transport, DhtConfig::default());

        // A few nodes only the hub knows about.
        let mut peers = Vec::new();
        for _ in 0..4 {
            let peer = spawn_node(&transport, DhtConfig::default());
            hub.routing_table().insert(peer.local().clone());
            peers.push(peer);
        }

        let newcomer = spawn_node(&transport, DhtConfig::default());
        let known = newcomer.bootstrap(&[hub.local().clone()]).await;

        // The newcomer learned about the hub and its peers.
        assert!(known > 1, "knew only {known} nodes after bootstrap");
        for peer in &peers {
            assert!(
                newcomer.routing_table().get(&peer.local().id).is_some(),
                "peer {} not discovered",
                peer.local().id
            );
        }
    }

    #[tokio::test]
    async fn test_message_roundtrip() {
        let descriptor = NodeDescriptor::new(NodeId::random(), NodeAddress::new("x"));
        let messages = vec![
            NodeMessage::Ping {
                sender: descriptor.clone(),
            },
            NodeMessage::Pong,
            NodeMessage::Query {
                sender: descriptor.clone(),
                target: NodeId::random(),
            },
            NodeMessage::QueryResponse {
                nodes: vec![descriptor],
            },
        ];
        for message in messages {
            let decoded = NodeMessage::from_bytes(&message.to_vec()).unwrap();
            assert_eq!(message, decoded);
        }
    }
}
