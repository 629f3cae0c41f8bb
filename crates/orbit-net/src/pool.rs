//! Per-node connection pool.
//!
//! Control-plane clients share one session per node: the first caller dials,
//! later callers reuse. Streaming piece sessions dial their own channels and
//! do not go through the pool.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{Mutex as AsyncMutex, OnceCell};
use tracing::debug;

use orbit_core::NodeId;
use orbit_proto::NodeDescriptor;

use crate::transport::Transport;
use crate::{Channel, NetError};

/// A pooled session; callers serialize request/response exchanges on it.
pub type SharedChannel = Arc<AsyncMutex<Channel>>;

struct Entry {
    cell: OnceCell<SharedChannel>,
}

/// In-memory pool of node sessions.
pub struct ConnectionPool {
    transport: Arc<dyn Transport>,
    items: Mutex<HashMap<NodeId, Arc<Entry>>>,
}

impl ConnectionPool {
    /// Creates a pool over the given transport.
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            transport,
            items: Mutex::new(HashMap::new()),
        }
    }

    /// Returns the shared session for `node`, dialing it exactly once.
    ///
    /// Concurrent callers wait for the single in-flight dial. A failed dial
    /// leaves the entry empty, so the next caller retries.
    pub async fn dial(&self, node: &NodeDescriptor) -> Result<SharedChannel, NetError> {
        let entry = {
            let mut items = self.items.lock();
            items
                .entry(node.id)
                .or_insert_with(|| {
                    Arc::new(Entry {
                        cell: OnceCell::new(),
                    })
                })
                .clone()
        };

        let channel = entry
            .cell
            .get_or_try_init(|| async {
                debug!(node_id = %node.id, "dialing node");
                let channel = self.transport.dial(node).await?;
                Ok::<_, NetError>(Arc::new(AsyncMutex::new(channel)))
            })
            .await?;

        Ok(channel.clone())
    }

    /// Closes and removes the session for `id`; a later dial starts fresh.
    pub fn disconnect(&self, id: &NodeId) {
        if self.items.lock().remove(id).is_some() {
            debug!(node_id = %id, "disconnected node");
        }
    }

    /// Closes every pooled session.
    pub fn disconnect_all(&self) {
        self.items.lock().clear();
    }

    /// Number of pooled entries.
    pub fn len(&self) -> usize {
        self.items.lock().len()
    }

    /// Returns true when the pool holds no entries.
    pub fn is_empty(&self) -> bool {
        self.items.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::LocalTransport;
    use bytes::Bytes;
    use orbit_proto::NodeAddress;

    #[tokio::test]
    async fn test_pool_shares_one_session() {
        let transport = LocalTransport::new();
        let id = NodeId::random();
        let mut acceptor = transport.listen(id);
        let node = NodeDescriptor::new(id, NodeAddress::new("local"));

        let pool = ConnectionPool::new(Arc::new(transport));
        let a = pool.dial(&node).await.unwrap();
        let b = pool.dial(&node).await.unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(pool.len(), 1);

        // Only one server-side session was created.
        let _session = acceptor.recv().await.unwrap();
        assert!(acceptor.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_disconnect_then_redial_creates_fresh_session() {
        let transport = LocalTransport::new();
        let id = NodeId::random();
        let mut acceptor = transport.listen(id);
        let node = NodeDescriptor::new(id, NodeAddress::new("local"));

        let pool = ConnectionPool::new(Arc::new(transport));
        let first = pool.dial(&node).await.unwrap();
        let mut first_server = acceptor.recv().await.unwrap();

        pool.disconnect(&id);
        assert!(pool.is_empty());
        drop(first);
        // The server observes the old session closing.
        assert!(first_server.recv().await.is_none());

        let second = pool.dial(&node).await.unwrap();
        let mut second_server = acceptor.recv().await.unwrap();
        second
            .lock()
            .await
            .send(Bytes::from_static(b"fresh"))
            .await
            .unwrap();
        assert_eq!(
            second_server.recv().await.unwrap(),
            Bytes::from_static(b"fresh")
        );
    }

    #[tokio::test]
    async fn test_failed_dial_retries() {
        let transport = LocalTransport::new();
        let id = NodeId::random();
        let node = NodeDescriptor::new(id, NodeAddress::new("local"));

        let pool = ConnectionPool::new(Arc::new(transport.clone()));
        assert!(pool.dial(&node).await.is_err());

        // Node comes online; the pool entry retries instead of caching the
        // failure.
        let _acceptor = transport.listen(id);
        assert!(pool.dial(&node).await.is_ok());
    }
}
