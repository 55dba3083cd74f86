//! Cluster node handle
//!
//! Wraps the connection to one endpoint. The connection is opened lazily and
//! replaced transparently when it dies, so a caller never sends on a dead
//! transport. A node starts unowned and is claimed by at most one bucket.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use tracing::{debug, info};

use super::control_plane::ControlPlane;
use super::node_connection::{ConnectionFactory, NodeConnection};
use crate::cluster::node::{Endpoint, NodeAdapter};
use crate::ops::{HelloFeature, Operation, OperationResponse};
use crate::utils::{ClientError, Result};

pub struct ClusterNode {
    endpoint: Endpoint,
    factory: Arc<ConnectionFactory>,
    connection: tokio::sync::Mutex<Option<Arc<NodeConnection>>>,
    adapter: RwLock<Option<NodeAdapter>>,
    owner: Mutex<Option<String>>,
    closed: AtomicBool,
}

impl ClusterNode {
    /// Node without a connection; the first use connects
    pub fn lazy(endpoint: Endpoint, factory: Arc<ConnectionFactory>) -> Self {
        Self {
            endpoint,
            factory,
            connection: tokio::sync::Mutex::new(None),
            adapter: RwLock::new(None),
            owner: Mutex::new(None),
            closed: AtomicBool::new(false),
        }
    }

    /// Connect now, optionally selecting (and claiming for) a bucket
    pub async fn connect(
        endpoint: Endpoint,
        factory: Arc<ConnectionFactory>,
        bucket: Option<&str>,
    ) -> Result<Self> {
        let conn = factory.connect(&endpoint, bucket).await?;
        let node = Self::lazy(endpoint, factory);
        *node.connection.lock().await = Some(conn);
        if let Some(bucket) = bucket {
            node.claim(bucket);
        }
        Ok(node)
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub fn adapter(&self) -> Option<NodeAdapter> {
        self.adapter.read().clone()
    }

    pub fn set_adapter(&self, adapter: NodeAdapter) {
        *self.adapter.write() = Some(adapter);
    }

    pub fn owner(&self) -> Option<String> {
        self.owner.lock().clone()
    }

    /// Claim this node for a bucket. Succeeds if unowned or already owned by
    /// the same bucket; ownership never moves between buckets.
    pub fn claim(&self, bucket: &str) -> bool {
        let mut owner = self.owner.lock();
        match owner.as_deref() {
            None => {
                *owner = Some(bucket.to_string());
                true
            }
            Some(current) => current == bucket,
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Current connection is open and alive
    pub async fn is_connected(&self) -> bool {
        self.connection
            .lock()
            .await
            .as_ref()
            .is_some_and(|c| !c.is_dead())
    }

    /// Return a live connection, reconnecting if the current one died
    pub async fn ensure_live(&self) -> Result<Arc<NodeConnection>> {
        if self.is_closed() {
            return Err(ClientError::Closed);
        }

        let mut slot = self.connection.lock().await;
        if let Some(conn) = slot.as_ref() {
            if !conn.is_dead() {
                return Ok(conn.clone());
            }
            info!("Reconnecting to {}", self.endpoint);
        }

        let bucket = self.owner();
        let conn = self.factory.connect(&self.endpoint, bucket.as_deref()).await?;
        // close() may have run while we were connecting
        if self.is_closed() {
            conn.close().await;
            return Err(ClientError::Closed);
        }
        *slot = Some(conn.clone());
        Ok(conn)
    }

    /// Select `bucket` on the live connection and claim the node for it
    pub async fn select_bucket(&self, bucket: &str) -> Result<()> {
        if let Some(current) = self.owner() {
            if current != bucket {
                return Err(ClientError::InvalidArgument(format!(
                    "node {} already belongs to bucket {}",
                    self.endpoint, current
                )));
            }
        }
        let conn = self.ensure_live().await?;
        if conn.bucket().as_deref() != Some(bucket) {
            conn.select(bucket).await?;
        }
        self.claim(bucket);
        Ok(())
    }

    /// Collections negotiated on the current connection
    pub async fn supports_collections(&self) -> Result<bool> {
        Ok(self.ensure_live().await?.supports(HelloFeature::Collections))
    }

    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(conn) = self.connection.lock().await.take() {
            conn.close().await;
        }
        debug!("Closed node {}", self.endpoint);
    }
}

impl std::fmt::Debug for ClusterNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClusterNode")
            .field("endpoint", &self.endpoint)
            .field("owner", &self.owner())
            .field("closed", &self.is_closed())
            .finish()
    }
}

#[async_trait]
impl ControlPlane for ClusterNode {
    async fn execute(&self, op: &mut Operation) -> Result<OperationResponse> {
        let conn = self.ensure_live().await?;
        conn.execute(op).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::sasl::Credentials;
    use crate::client::ControlPlaneExt;
    use crate::test_util::{MockBucket, MockKvServer};
    use std::time::Duration;

    fn factory() -> Arc<ConnectionFactory> {
        Arc::new(ConnectionFactory {
            connect_timeout: Duration::from_secs(2),
            op_timeout: Duration::from_secs(2),
            tls: None,
            credentials: Credentials::new("admin", "password"),
            user_agent: "test".to_string(),
        })
    }

    #[test]
    fn test_claim_once() {
        let node = ClusterNode::lazy(Endpoint::new("h", 1), factory());
        assert!(node.owner().is_none());
        assert!(node.claim("a"));
        assert!(node.claim("a"));
        assert!(!node.claim("b"));
        assert_eq!(node.owner().as_deref(), Some("a"));
    }

    #[tokio::test]
    async fn test_dead_connection_replaced_before_send() {
        let server = MockKvServer::start().await;
        server.add_bucket("default", MockBucket::vbucket(1, 16));

        let node = ClusterNode::connect(server.endpoint(), factory(), Some("default"))
            .await
            .unwrap();
        node.noop().await.unwrap();
        assert_eq!(server.connections_accepted(), 1);

        server.drop_connections();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!node.is_connected().await);

        // reconnects (re-selecting the owner's bucket) and succeeds
        let mut op = Operation::upsert("k", b"1".to_vec(), 0);
        node.execute(&mut op).await.unwrap();
        assert_eq!(server.connections_accepted(), 2);
        assert!(node.is_connected().await);
    }

    #[tokio::test]
    async fn test_lazy_node_connects_on_first_use() {
        let server = MockKvServer::start().await;
        let node = ClusterNode::lazy(server.endpoint(), factory());
        assert_eq!(server.connections_accepted(), 0);
        node.noop().await.unwrap();
        assert_eq!(server.connections_accepted(), 1);
    }

    #[tokio::test]
    async fn test_closed_node_rejects_use() {
        let server = MockKvServer::start().await;
        let node = ClusterNode::connect(server.endpoint(), factory(), None)
            .await
            .unwrap();
        node.close().await;
        assert!(matches!(node.noop().await, Err(ClientError::Closed)));
    }

    #[tokio::test]
    async fn test_select_bucket_claims() {
        let server = MockKvServer::start().await;
        server.add_bucket("travel", MockBucket::vbucket(1, 16));
        let node = ClusterNode::connect(server.endpoint(), factory(), None)
            .await
            .unwrap();
        node.select_bucket("travel").await.unwrap();
        assert_eq!(node.owner().as_deref(), Some("travel"));
        assert!(node.select_bucket("other").await.is_err());
    }
}
