//! Buckets
//!
//! A bucket owns the nodes serving it and routes each operation through the
//! key mapper of its current config. Config updates build a new routing
//! table off to the side and swap it in with one pointer store, so dispatch
//! never waits on a refresh.

pub mod scope;

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use futures::future::join_all;
use parking_lot::RwLock;
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::client::{ClusterNode, ConnectionFactory, ControlPlane, ControlPlaneExt};
use crate::cluster::key_mapper::{KeyMapper, MappedTarget};
use crate::cluster::node::Endpoint;
use crate::cluster::topology::{BucketConfig, NodeLocator};
use crate::cluster::topology_manager::{ConfigContext, ConfigSource};
use crate::ops::{OpKind, Operation, OperationResponse};
use crate::services::ServiceType;
use crate::utils::{ClientError, ClusterError, Result};

pub use scope::{
    Collection, CollectionManifest, ManifestCollection, ManifestScope, Scope, DEFAULT_COLLECTION,
    DEFAULT_SCOPE,
};

/// Bucket variant, taken from the config's node locator
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BucketKind {
    /// vbucket-partitioned, replicated, with scopes and collections
    Couchbase,
    /// single-tier, ketama-hashed
    Memcached,
}

impl BucketKind {
    pub fn from_locator(locator: NodeLocator) -> Self {
        match locator {
            NodeLocator::Vbucket => BucketKind::Couchbase,
            NodeLocator::Ketama => BucketKind::Memcached,
        }
    }

    pub fn is_partitioned(self) -> bool {
        self == BucketKind::Couchbase
    }
}

impl fmt::Display for BucketKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BucketKind::Couchbase => write!(f, "couchbase"),
            BucketKind::Memcached => write!(f, "memcached"),
        }
    }
}

/// Lifecycle: `Created -> Bootstrapping -> Ready -> Disposed`.
/// `Disposed` is terminal and reachable from any state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BucketState {
    Created,
    Bootstrapping,
    Ready,
    Disposed,
}

/// Everything needed to route under one config revision
pub struct RoutingTable {
    config: Arc<BucketConfig>,
    mapper: KeyMapper,
    nodes: HashMap<Endpoint, Arc<ClusterNode>>,
}

impl RoutingTable {
    pub fn config(&self) -> &Arc<BucketConfig> {
        &self.config
    }

    pub fn revision(&self) -> u64 {
        self.config.rev()
    }

    pub fn map_key(&self, key: &[u8]) -> MappedTarget {
        self.mapper.map_key(key)
    }

    pub fn node(&self, endpoint: &Endpoint) -> Option<&Arc<ClusterNode>> {
        self.nodes.get(endpoint)
    }

    pub fn endpoints(&self) -> Vec<Endpoint> {
        let mut endpoints: Vec<Endpoint> = self.nodes.keys().cloned().collect();
        endpoints.sort_by(|a, b| (&a.host, a.port).cmp(&(&b.host, b.port)));
        endpoints
    }
}

struct BucketInner {
    name: String,
    kind: BucketKind,
    use_tls: bool,
    state: RwLock<BucketState>,
    routing: RwLock<Option<Arc<RoutingTable>>>,
    update_lock: tokio::sync::Mutex<()>,
    manifest: RwLock<Arc<CollectionManifest>>,
    factory: Arc<ConnectionFactory>,
    context: Arc<ConfigContext>,
    shutdown: CancellationToken,
}

/// Handle to an open bucket; clones share the same state
#[derive(Clone)]
pub struct Bucket {
    inner: Arc<BucketInner>,
}

impl Bucket {
    pub fn new(
        name: &str,
        kind: BucketKind,
        factory: Arc<ConnectionFactory>,
        context: Arc<ConfigContext>,
    ) -> Self {
        let shutdown = context.shutdown_token();
        Self {
            inner: Arc::new(BucketInner {
                name: name.to_string(),
                kind,
                use_tls: factory.uses_tls(),
                state: RwLock::new(BucketState::Created),
                routing: RwLock::new(None),
                update_lock: tokio::sync::Mutex::new(()),
                manifest: RwLock::new(Arc::new(CollectionManifest::default_only())),
                factory,
                context,
                shutdown,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn kind(&self) -> BucketKind {
        self.inner.kind
    }

    pub fn state(&self) -> BucketState {
        *self.inner.state.read()
    }

    fn set_state(&self, next: BucketState) -> bool {
        let mut state = self.inner.state.write();
        if *state == BucketState::Disposed {
            return false;
        }
        debug!("Bucket '{}': {:?} -> {:?}", self.inner.name, *state, next);
        *state = next;
        true
    }

    /// Current routing table, if the bucket can take operations
    pub fn routing(&self) -> Result<Arc<RoutingTable>> {
        match self.state() {
            BucketState::Disposed => return Err(ClientError::Closed),
            BucketState::Ready => {}
            _ => return Err(ClientError::BucketNotReady(self.inner.name.clone())),
        }
        self.inner
            .routing
            .read()
            .clone()
            .ok_or_else(|| ClientError::BucketNotReady(self.inner.name.clone()))
    }

    pub fn config(&self) -> Option<Arc<BucketConfig>> {
        self.inner.routing.read().as_ref().map(|t| t.config.clone())
    }

    pub fn revision(&self) -> Option<u64> {
        self.config().map(|c| c.rev())
    }

    pub fn num_replicas(&self) -> usize {
        self.config().map_or(0, |c| c.num_replicas())
    }

    /// Endpoints of the nodes currently serving this bucket
    pub fn node_endpoints(&self) -> Vec<Endpoint> {
        self.inner
            .routing
            .read()
            .as_ref()
            .map(|t| t.endpoints())
            .unwrap_or_default()
    }

    /// Cancelled when this bucket is disposed or propagation stops
    pub fn shutdown_token(&self) -> CancellationToken {
        self.inner.shutdown.clone()
    }

    pub fn manifest(&self) -> Arc<CollectionManifest> {
        self.inner.manifest.read().clone()
    }

    /// Install the first config: claim `seed`, load the collections manifest
    /// and open a node for every data node of `config`
    pub async fn bootstrap(&self, seed: Arc<ClusterNode>, config: BucketConfig) -> Result<()> {
        if config.name() != self.inner.name {
            return Err(ClientError::InvalidArgument(format!(
                "config for '{}' offered to bucket '{}'",
                config.name(),
                self.inner.name
            )));
        }
        if config.node_locator().map(BucketKind::from_locator) != Some(self.inner.kind) {
            return Err(ClientError::InvalidArgument(format!(
                "bucket '{}' is not a {} bucket",
                self.inner.name, self.inner.kind
            )));
        }
        if !self.set_state(BucketState::Bootstrapping) {
            return Err(ClientError::Closed);
        }
        if let Err(e) = self.install(seed, config).await {
            warn!("Bootstrap of '{}' failed: {}", self.inner.name, e);
            self.dispose().await;
            return Err(e);
        }
        Ok(())
    }

    async fn install(&self, seed: Arc<ClusterNode>, config: BucketConfig) -> Result<()> {
        if !seed.claim(&self.inner.name) {
            return Err(ClientError::InvalidArgument(format!(
                "node {} belongs to another bucket",
                seed.endpoint()
            )));
        }

        let _guard = self.inner.update_lock.lock().await;
        let config = Arc::new(config);
        let existing = HashMap::from([(seed.endpoint().clone(), seed.clone())]);
        let (table, added) = self.build_table(config.clone(), &existing)?;

        let manifest = self.load_manifest(&seed, &config).await;
        *self.inner.manifest.write() = Arc::new(manifest);

        if table.node(seed.endpoint()).is_none() {
            debug!(
                "Seed {} is not a data node of '{}', releasing it",
                seed.endpoint(),
                self.inner.name
            );
            seed.close().await;
        }

        warm_up(&added).await;
        *self.inner.routing.write() = Some(Arc::new(table));
        if !self.set_state(BucketState::Ready) {
            return Err(ClientError::Closed);
        }

        self.inner.context.publish(config.clone());
        self.spawn_update_task();
        info!(
            "Bucket '{}' ({}) ready at rev {} with {} nodes",
            self.inner.name,
            self.inner.kind,
            config.rev(),
            self.node_endpoints().len()
        );
        Ok(())
    }

    async fn load_manifest(&self, seed: &ClusterNode, config: &BucketConfig) -> CollectionManifest {
        if !self.inner.kind.is_partitioned() || !config.has_bucket_capability("collections") {
            return CollectionManifest::default_only();
        }
        match seed.supports_collections().await {
            Ok(true) => {}
            _ => return CollectionManifest::default_only(),
        }

        let fetched = match seed.get_collections_manifest().await {
            Ok(raw) => CollectionManifest::parse(&raw).map_err(ClientError::from),
            Err(e) => Err(e),
        };
        fetched.unwrap_or_else(|e| {
            warn!(
                "Collections manifest for '{}' unavailable, using the default scope only: {}",
                self.inner.name, e
            );
            CollectionManifest::default_only()
        })
    }

    /// Re-fetch the collections manifest from any live node
    pub async fn refresh_manifest(&self) -> Result<Arc<CollectionManifest>> {
        let table = self.routing()?;
        if !self.inner.kind.is_partitioned() {
            return Ok(self.manifest());
        }
        let mut failures = Vec::new();
        for node in table.nodes.values() {
            match node.get_collections_manifest().await {
                Ok(raw) => {
                    let manifest = Arc::new(CollectionManifest::parse(&raw)?);
                    *self.inner.manifest.write() = manifest.clone();
                    return Ok(manifest);
                }
                Err(e) => failures.push(format!("{}: {}", node.endpoint(), e)),
            }
        }
        Err(ClusterError::RefreshFailed(failures.join("; ")).into())
    }

    fn build_table(
        &self,
        config: Arc<BucketConfig>,
        existing: &HashMap<Endpoint, Arc<ClusterNode>>,
    ) -> Result<(RoutingTable, Vec<Arc<ClusterNode>>)> {
        let use_tls = self.inner.use_tls;
        let mapper = KeyMapper::from_config(&config, use_tls)?;

        let mut endpoints: Vec<Endpoint> = config.kv_endpoints(use_tls);
        // legacy configs may list servers missing from nodesExt
        for endpoint in config.server_endpoints(use_tls)? {
            if !endpoints.contains(&endpoint) {
                endpoints.push(endpoint);
            }
        }

        let mut nodes = HashMap::new();
        let mut added = Vec::new();
        for endpoint in endpoints {
            let node = match existing.get(&endpoint) {
                Some(node) => node.clone(),
                None => {
                    let node = Arc::new(ClusterNode::lazy(
                        endpoint.clone(),
                        self.inner.factory.clone(),
                    ));
                    added.push(node.clone());
                    node
                }
            };
            if !node.claim(&self.inner.name) {
                warn!(
                    "Node {} belongs to bucket {:?}, not routing '{}' through it",
                    endpoint,
                    node.owner(),
                    self.inner.name
                );
                continue;
            }
            if let Some(adapter) = config
                .data_nodes()
                .find(|n| n.kv_endpoint(use_tls).as_ref() == Some(&endpoint))
            {
                node.set_adapter(adapter.clone());
            }
            nodes.insert(endpoint, node);
        }

        Ok((RoutingTable { config, mapper, nodes }, added))
    }

    /// Apply a newer config: rebuild the mapper, open nodes for new
    /// endpoints, prune departed ones. Returns false if the config was not
    /// newer than the one in effect.
    pub async fn config_updated(&self, config: Arc<BucketConfig>) -> Result<bool> {
        if config.name() != self.inner.name {
            return Ok(false);
        }
        let _guard = self.inner.update_lock.lock().await;
        if self.state() != BucketState::Ready {
            return Ok(false);
        }

        let current = self.routing()?;
        if config.rev() <= current.revision() {
            if config.rev() == current.revision() && *config != **current.config() {
                warn!(
                    "Config for '{}' changed content without a revision bump (rev {})",
                    self.inner.name,
                    config.rev()
                );
            }
            return Ok(false);
        }
        if config.node_locator().map(BucketKind::from_locator) != Some(self.inner.kind) {
            warn!(
                "Ignoring rev {} for '{}': node locator no longer matches a {} bucket",
                config.rev(),
                self.inner.name,
                self.inner.kind
            );
            return Ok(false);
        }

        let (table, added) = self.build_table(config.clone(), &current.nodes)?;
        let departed: Vec<Arc<ClusterNode>> = current
            .nodes
            .iter()
            .filter(|(endpoint, _)| table.node(endpoint).is_none())
            .map(|(_, node)| node.clone())
            .collect();

        *self.inner.routing.write() = Some(Arc::new(table));
        info!(
            "Bucket '{}' moved to rev {} ({} nodes added, {} removed)",
            self.inner.name,
            config.rev(),
            added.len(),
            departed.len()
        );

        for node in departed {
            if node.owner().as_deref() == Some(self.inner.name.as_str()) {
                info!("Pruning node {} from '{}'", node.endpoint(), self.inner.name);
                node.close().await;
            }
        }
        warm_up(&added).await;
        Ok(true)
    }

    fn spawn_update_task(&self) {
        let mut updates = self.inner.context.subscribe();
        let weak: Weak<BucketInner> = Arc::downgrade(&self.inner);
        let token = self.inner.shutdown.clone();
        let name = self.inner.name.clone();

        tokio::spawn(async move {
            loop {
                let config = tokio::select! {
                    _ = token.cancelled() => break,
                    received = updates.recv() => match received {
                        Ok(config) => config,
                        Err(RecvError::Lagged(skipped)) => {
                            debug!("Bucket '{}' skipped {} config updates", name, skipped);
                            match weak.upgrade().and_then(|inner| inner.context.latest(&name)) {
                                Some(config) => config,
                                None => continue,
                            }
                        }
                        Err(RecvError::Closed) => break,
                    },
                };
                if config.name() != name {
                    continue;
                }
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                if let Err(e) = (Bucket { inner }).config_updated(config).await {
                    warn!("Applying config to '{}' failed: {}", name, e);
                }
            }
            debug!("Update task for '{}' finished", name);
        });
    }

    /// Route `op` to the active node for its key
    pub async fn send(&self, op: &mut Operation) -> Result<OperationResponse> {
        let table = self.routing()?;
        let target = table.map_key(op.key());
        let endpoint = target.primary.ok_or_else(|| {
            ClusterError::NodeUnavailable(format!(
                "no active node for vbucket {:?} at rev {}",
                target.vbucket_id,
                table.revision()
            ))
        })?;
        self.dispatch(&table, &endpoint, target.vbucket_id, op).await
    }

    /// Route a replica read to replica `index` (0 is the first replica)
    pub async fn send_to_replica(&self, op: &mut Operation, index: usize) -> Result<OperationResponse> {
        if !self.inner.kind.is_partitioned() {
            return Err(ClientError::NotSupported(format!(
                "bucket '{}' has no replicas",
                self.inner.name
            )));
        }
        if !matches!(op.kind(), OpKind::GetReplica) {
            return Err(ClientError::InvalidArgument(format!(
                "{:?} cannot be sent to a replica",
                op.opcode()
            )));
        }

        let table = self.routing()?;
        let target = table.map_key(op.key());
        let endpoint = target.replicas.get(index).cloned().ok_or_else(|| {
            ClientError::InvalidArgument(format!(
                "replica {} not available for vbucket {:?}",
                index, target.vbucket_id
            ))
        })?;
        self.dispatch(&table, &endpoint, target.vbucket_id, op).await
    }

    async fn dispatch(
        &self,
        table: &RoutingTable,
        endpoint: &Endpoint,
        vbucket_id: Option<u16>,
        op: &mut Operation,
    ) -> Result<OperationResponse> {
        let node = table
            .node(endpoint)
            .cloned()
            .ok_or_else(|| ClusterError::NodeUnavailable(endpoint.to_string()))?;
        op.set_vbucket_id(vbucket_id);
        op.set_routing_revision(table.revision());

        let result = node.execute(op).await;
        if let Err(e) = &result {
            if e.stale_revision().is_some() {
                if let Some(body) = op.take_routing_update() {
                    self.apply_routing_update(&body, &endpoint.host).await;
                }
            }
        }
        result
    }

    /// Publish the config a NotMyVBucket response carried
    async fn apply_routing_update(&self, body: &[u8], source_host: &str) {
        let raw = String::from_utf8_lossy(body);
        let config = match BucketConfig::parse(&raw, source_host) {
            Ok(config) if config.name() == self.inner.name => Arc::new(config),
            Ok(other) => {
                debug!("NotMyVBucket carried config for '{}', ignoring", other.name());
                return;
            }
            Err(e) => {
                debug!("NotMyVBucket from {} carried no usable config: {}", source_host, e);
                return;
            }
        };
        self.inner.context.publish(config.clone());
        if let Err(e) = self.config_updated(config).await {
            warn!("Routing update for '{}' failed: {}", self.inner.name, e);
        }
    }

    /// Scope by name; single-tier buckets only have the default scope
    pub fn scope(&self, name: &str) -> Result<Scope> {
        if !self.inner.kind.is_partitioned() && name != DEFAULT_SCOPE {
            return Err(ClientError::NotSupported(format!(
                "memcached bucket '{}' only has the default scope",
                self.inner.name
            )));
        }
        if self.state() == BucketState::Disposed {
            return Err(ClientError::Closed);
        }
        if self.manifest().scope(name).is_none() {
            return Err(ClientError::ScopeNotFound(name.to_string()));
        }
        Ok(Scope::new(self.clone(), name))
    }

    pub fn default_scope(&self) -> Result<Scope> {
        self.scope(DEFAULT_SCOPE)
    }

    pub fn default_collection(&self) -> Result<Collection> {
        self.default_scope()?.default_collection()
    }

    /// Service URIs from this bucket's current config
    pub fn service_uris(&self, service: ServiceType) -> Result<Vec<String>> {
        if service == ServiceType::Views && !self.inner.kind.is_partitioned() {
            return Err(ClientError::NotSupported(format!(
                "memcached bucket '{}' has no views",
                self.inner.name
            )));
        }
        let table = self.routing()?;
        Ok(table.config.service_uris(service, self.inner.use_tls))
    }

    pub fn view_uris(&self) -> Result<Vec<String>> {
        self.service_uris(ServiceType::Views)
    }

    /// Config source polling this bucket's own nodes over KV
    pub fn kv_config_source(&self) -> Arc<dyn ConfigSource> {
        Arc::new(KvConfigSource {
            bucket: Arc::downgrade(&self.inner),
        })
    }

    /// Stop updates and close every node this bucket owns
    pub async fn dispose(&self) {
        {
            let mut state = self.inner.state.write();
            if *state == BucketState::Disposed {
                return;
            }
            *state = BucketState::Disposed;
        }
        self.inner.shutdown.cancel();
        self.inner.context.forget(&self.inner.name);

        let table = self.inner.routing.write().take();
        if let Some(table) = table {
            for node in table.nodes.values() {
                if node.owner().as_deref() == Some(self.inner.name.as_str()) {
                    node.close().await;
                }
            }
        }
        info!("Bucket '{}' disposed", self.inner.name);
    }
}

impl fmt::Debug for Bucket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Bucket")
            .field("name", &self.inner.name)
            .field("kind", &self.inner.kind)
            .field("state", &self.state())
            .field("revision", &self.revision())
            .finish()
    }
}

/// Connect new nodes up front; failures leave them to reconnect on first use
async fn warm_up(nodes: &[Arc<ClusterNode>]) {
    let results = join_all(nodes.iter().map(|n| n.ensure_live())).await;
    for (node, result) in nodes.iter().zip(results) {
        if let Err(e) = result {
            warn!("Could not connect to {} yet: {}", node.endpoint(), e);
        }
    }
}

struct KvConfigSource {
    bucket: Weak<BucketInner>,
}

#[async_trait]
impl ConfigSource for KvConfigSource {
    fn describe(&self) -> String {
        "KV".to_string()
    }

    async fn fetch(&self, bucket: &str) -> Result<BucketConfig> {
        let inner = self.bucket.upgrade().ok_or(ClientError::Closed)?;
        let table = (Bucket { inner }).routing()?;

        let mut failures = Vec::new();
        for node in table.nodes.values() {
            match node.get_cluster_config().await {
                Ok(Some(raw)) => {
                    return Ok(BucketConfig::parse(
                        &String::from_utf8_lossy(&raw),
                        &node.endpoint().host,
                    )?)
                }
                Ok(None) => failures.push(format!("{}: no config", node.endpoint())),
                Err(e) => failures.push(format!("{}: {}", node.endpoint(), e)),
            }
        }
        Err(ClusterError::RefreshFailed(format!(
            "no node returned a config for '{}': {}",
            bucket,
            failures.join("; ")
        ))
        .into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::Credentials;
    use crate::ops::OpCode;
    use crate::test_util::{ketama_config_json, vbucket_config_json, MockBucket, MockKvServer};
    use crate::utils::KvError;
    use std::time::Duration;

    fn factory() -> Arc<ConnectionFactory> {
        Arc::new(ConnectionFactory {
            connect_timeout: Duration::from_millis(500),
            op_timeout: Duration::from_secs(2),
            tls: None,
            credentials: Credentials::new("admin", "password"),
            user_agent: "test".to_string(),
        })
    }

    async fn open(server: &MockKvServer, name: &str) -> Bucket {
        let factory = factory();
        let seed = Arc::new(
            ClusterNode::connect(server.endpoint(), factory.clone(), Some(name))
                .await
                .unwrap(),
        );
        let raw = seed.get_cluster_config().await.unwrap().unwrap();
        let config = BucketConfig::parse(std::str::from_utf8(&raw).unwrap(), "127.0.0.1").unwrap();
        let kind = BucketKind::from_locator(config.node_locator().unwrap());
        let bucket = Bucket::new(name, kind, factory, Arc::new(ConfigContext::new()));
        assert_eq!(bucket.state(), BucketState::Created);
        bucket.bootstrap(seed, config).await.unwrap();
        bucket
    }

    #[tokio::test]
    async fn test_bootstrap_and_round_trip() {
        let server = MockKvServer::start().await;
        server.add_bucket("default", MockBucket::vbucket(3, 64));
        let bucket = open(&server, "default").await;

        assert_eq!(bucket.state(), BucketState::Ready);
        assert_eq!(bucket.kind(), BucketKind::Couchbase);
        assert_eq!(bucket.revision(), Some(3));
        assert_eq!(bucket.node_endpoints(), vec![server.endpoint()]);

        let collection = bucket.default_collection().unwrap();
        let stored = collection.upsert("airline_10", b"{\"id\":10}".to_vec(), 0).await.unwrap();
        let fetched = collection.get("airline_10").await.unwrap();
        assert_eq!(&fetched.value[..], b"{\"id\":10}");
        assert_eq!(fetched.cas, stored.cas);

        let err = collection.insert("airline_10", b"{}".to_vec(), 0).await.unwrap_err();
        assert!(matches!(err, ClientError::Kv(KvError::DocumentExists)));
        let err = collection
            .replace("airline_10", b"{}".to_vec(), 0, stored.cas + 1)
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::Kv(KvError::CasMismatch | KvError::DocumentExists)));

        collection.remove("airline_10", 0).await.unwrap();
        assert!(!collection.exists("airline_10").await.unwrap());
    }

    #[tokio::test]
    async fn test_older_revision_is_ignored() {
        let server = MockKvServer::start().await;
        server.add_bucket("default", MockBucket::vbucket(7, 16));
        let bucket = open(&server, "default").await;
        let port = server.port();

        let older = vbucket_config_json(5, "default", &[("127.0.0.1", port, 8091)], 16);
        let older = Arc::new(BucketConfig::parse(&older, "127.0.0.1").unwrap());
        assert!(!bucket.config_updated(older).await.unwrap());
        assert_eq!(bucket.revision(), Some(7));
    }

    #[tokio::test]
    async fn test_update_adds_and_prunes_nodes() {
        let server = MockKvServer::start().await;
        let other = MockKvServer::start().await;
        server.add_bucket("default", MockBucket::vbucket(1, 16));
        other.add_bucket("default", MockBucket::vbucket(1, 16));
        let bucket = open(&server, "default").await;

        let both = [
            ("127.0.0.1", server.port(), 8091),
            ("127.0.0.1", other.port(), 8091),
        ];
        let grown = vbucket_config_json(2, "default", &both, 16);
        let grown = Arc::new(BucketConfig::parse(&grown, "127.0.0.1").unwrap());
        assert!(bucket.config_updated(grown).await.unwrap());
        assert_eq!(bucket.node_endpoints().len(), 2);
        assert_eq!(other.connections_accepted(), 1);

        let shrunk = vbucket_config_json(3, "default", &both[..1], 16);
        let shrunk = Arc::new(BucketConfig::parse(&shrunk, "127.0.0.1").unwrap());
        let removed = bucket
            .routing()
            .unwrap()
            .node(&other.endpoint())
            .cloned()
            .unwrap();
        assert!(bucket.config_updated(shrunk).await.unwrap());
        assert_eq!(bucket.node_endpoints(), vec![server.endpoint()]);
        assert!(removed.is_closed());
    }

    #[tokio::test]
    async fn test_not_my_vbucket_publishes_carried_config() {
        let server = MockKvServer::start().await;
        server.add_bucket("default", MockBucket::vbucket(7, 16));
        let bucket = open(&server, "default").await;

        let newer = vbucket_config_json(12, "default", &[("$HOST", server.port(), 8091)], 16);
        server.set_not_my_vbucket("default", newer);

        let collection = bucket.default_collection().unwrap();
        let err = collection.get("k").await.unwrap_err();
        assert_eq!(err.stale_revision(), Some(7));
        assert_eq!(bucket.revision(), Some(12));

        // routed under the new revision, the next attempt reaches the document store
        let err = collection.get("k").await.unwrap_err();
        assert!(matches!(err, ClientError::Kv(KvError::DocumentNotFound)));
    }

    #[tokio::test]
    async fn test_replica_read_goes_to_replica_node() {
        let first = MockKvServer::start().await;
        let second = MockKvServer::start().await;
        let nodes = [
            ("127.0.0.1", first.port(), 8091),
            ("127.0.0.1", second.port(), 8091),
        ];
        let raw = vbucket_config_json(1, "default", &nodes, 16);
        first.add_bucket("default", MockBucket::raw(raw.clone()));
        second.add_bucket("default", MockBucket::raw(raw));
        let bucket = open(&first, "default").await;
        assert_eq!(bucket.num_replicas(), 1);

        let table = bucket.routing().unwrap();
        let target = table.map_key(b"hotel_1");
        let replica = target.replicas[0].clone();
        let replica_server = if replica == first.endpoint() { &first } else { &second };

        let mut op = Operation::get_replica("hotel_1");
        let err = bucket.send_to_replica(&mut op, 0).await.unwrap_err();
        assert!(matches!(err, ClientError::Kv(KvError::DocumentNotFound)));
        assert_eq!(replica_server.op_count(OpCode::GetReplica), 1);

        let mut op = Operation::get_replica("hotel_1");
        assert!(matches!(
            bucket.send_to_replica(&mut op, 1).await,
            Err(ClientError::InvalidArgument(_))
        ));
        let mut op = Operation::get("hotel_1");
        assert!(bucket.send_to_replica(&mut op, 0).await.is_err());
    }

    #[tokio::test]
    async fn test_memcached_bucket_rejects_scopes_locally() {
        let server = MockKvServer::start().await;
        server.add_bucket("cache", MockBucket::ketama(4));
        let bucket = open(&server, "cache").await;
        assert_eq!(bucket.kind(), BucketKind::Memcached);

        let before = server.op_count(OpCode::Get);
        assert!(matches!(bucket.scope("inventory"), Err(ClientError::NotSupported(_))));
        assert!(matches!(bucket.view_uris(), Err(ClientError::NotSupported(_))));
        assert_eq!(server.op_count(OpCode::Get), before);

        let collection = bucket.default_collection().unwrap();
        collection.upsert("session", b"abc".to_vec(), 30).await.unwrap();
        assert_eq!(&collection.get("session").await.unwrap().value[..], b"abc");
        assert!(matches!(
            collection.get_any_replica("session").await,
            Err(ClientError::NotSupported(_))
        ));
    }

    #[tokio::test]
    async fn test_collections_resolved_from_manifest() {
        let server = MockKvServer::start().await;
        let manifest = r#"{"uid": "2", "scopes": [
            {"name": "_default", "uid": "0", "collections": [{"name": "_default", "uid": "0"}]},
            {"name": "inventory", "uid": "8", "collections": [{"name": "airline", "uid": "9"}]}
        ]}"#;
        server.add_bucket("travel", MockBucket::vbucket(1, 16).with_manifest(manifest));
        let bucket = open(&server, "travel").await;

        let airline = bucket.scope("inventory").unwrap().collection("airline").unwrap();
        assert_eq!(airline.id(), 9);
        airline.upsert("a1", b"1".to_vec(), 0).await.unwrap();
        assert!(airline.exists("a1").await.unwrap());
        // same key, different collection
        assert!(!bucket.default_collection().unwrap().exists("a1").await.unwrap());

        assert!(matches!(bucket.scope("tenants"), Err(ClientError::ScopeNotFound(_))));
        assert!(matches!(
            bucket.scope("inventory").unwrap().collection("route"),
            Err(ClientError::CollectionNotFound { .. })
        ));
        assert_eq!(bucket.refresh_manifest().await.unwrap().uid, 2);
    }

    #[tokio::test]
    async fn test_kv_source_and_dispose() {
        let server = MockKvServer::start().await;
        server.add_bucket("default", MockBucket::vbucket(1, 16));
        let bucket = open(&server, "default").await;

        let newer = vbucket_config_json(6, "default", &[("$HOST", server.port(), 8091)], 16);
        server.set_bucket_config("default", newer);
        let source = bucket.kv_config_source();
        assert_eq!(source.fetch("default").await.unwrap().rev(), 6);

        let node = bucket
            .routing()
            .unwrap()
            .node(&server.endpoint())
            .cloned()
            .unwrap();
        bucket.dispose().await;
        assert_eq!(bucket.state(), BucketState::Disposed);
        assert!(node.is_closed());
        let mut op = Operation::get("k");
        assert!(matches!(bucket.send(&mut op).await, Err(ClientError::Closed)));
        assert!(source.fetch("default").await.is_err());
    }

    #[tokio::test]
    async fn test_applying_older_then_newer_matches_newer_alone() {
        let first = MockKvServer::start().await;
        let second = MockKvServer::start().await;
        for server in [&first, &second] {
            server.add_bucket("default", MockBucket::vbucket(1, 16));
            server.add_bucket("mirror", MockBucket::vbucket(1, 16));
        }
        let forward = [
            ("127.0.0.1", first.port(), 8091),
            ("127.0.0.1", second.port(), 8091),
        ];
        let reversed = [forward[1], forward[0]];
        let parse = |raw: String| Arc::new(BucketConfig::parse(&raw, "127.0.0.1").unwrap());

        let stepped = open(&first, "default").await;
        assert!(stepped
            .config_updated(parse(vbucket_config_json(2, "default", &forward, 16)))
            .await
            .unwrap());
        assert!(stepped
            .config_updated(parse(vbucket_config_json(3, "default", &reversed, 16)))
            .await
            .unwrap());

        first.set_bucket_config("mirror", vbucket_config_json(3, "mirror", &reversed, 16));
        let direct = open(&first, "mirror").await;

        assert_eq!(stepped.revision(), direct.revision());
        assert_eq!(stepped.node_endpoints(), direct.node_endpoints());
        let (stepped_table, direct_table) = (stepped.routing().unwrap(), direct.routing().unwrap());
        for i in 0..64 {
            let key = format!("key_{}", i);
            assert_eq!(
                stepped_table.map_key(key.as_bytes()),
                direct_table.map_key(key.as_bytes()),
                "{}",
                key
            );
        }
    }

    #[tokio::test]
    async fn test_unreachable_node_does_not_block_bootstrap() {
        let server = MockKvServer::start().await;
        let dead_port = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let nodes = [
            ("127.0.0.1", dead_port, 8091),
            ("127.0.0.1", server.port(), 8091),
        ];
        server.add_bucket("default", MockBucket::raw(vbucket_config_json(1, "default", &nodes, 16)));

        let bucket = open(&server, "default").await;
        assert_eq!(bucket.state(), BucketState::Ready);
        assert_eq!(bucket.node_endpoints().len(), 2);

        let table = bucket.routing().unwrap();
        let dead = Endpoint::new("127.0.0.1", dead_port);
        let key_on = |endpoint: &Endpoint| {
            (0..256)
                .map(|i| format!("doc_{}", i))
                .find(|k| table.map_key(k.as_bytes()).primary.as_ref() == Some(endpoint))
                .unwrap()
        };
        let live_key = key_on(&server.endpoint());
        let dead_key = key_on(&dead);

        let collection = bucket.default_collection().unwrap();
        collection.upsert(&live_key, b"1".to_vec(), 0).await.unwrap();
        assert!(matches!(
            collection.upsert(&dead_key, b"1".to_vec(), 0).await,
            Err(ClientError::Connection(_))
        ));
    }

    #[tokio::test]
    async fn test_failed_bootstrap_leaves_bucket_disposed() {
        let server = MockKvServer::start().await;
        server.add_bucket("default", MockBucket::vbucket(1, 16));
        let factory = factory();
        let seed = Arc::new(
            ClusterNode::connect(server.endpoint(), factory.clone(), None)
                .await
                .unwrap(),
        );
        assert!(seed.claim("other"));

        let raw = vbucket_config_json(1, "default", &[("127.0.0.1", server.port(), 8091)], 16);
        let config = BucketConfig::parse(&raw, "127.0.0.1").unwrap();
        let bucket = Bucket::new("default", BucketKind::Couchbase, factory, Arc::new(ConfigContext::new()));
        assert!(bucket.bootstrap(seed, config).await.is_err());
        assert_eq!(bucket.state(), BucketState::Disposed);
        assert!(matches!(bucket.routing(), Err(ClientError::Closed)));
    }

    #[tokio::test]
    async fn test_bootstrap_rejects_mismatched_kind() {
        let server = MockKvServer::start().await;
        server.add_bucket("cache", MockBucket::ketama(1));
        let factory = factory();
        let seed = Arc::new(
            ClusterNode::connect(server.endpoint(), factory.clone(), Some("cache"))
                .await
                .unwrap(),
        );
        let raw = ketama_config_json(1, "cache", &[("127.0.0.1", server.port(), 8091)]);
        let config = BucketConfig::parse(&raw, "127.0.0.1").unwrap();
        let bucket = Bucket::new("cache", BucketKind::Couchbase, factory, Arc::new(ConfigContext::new()));
        assert!(bucket.bootstrap(seed, config).await.is_err());
        assert_eq!(bucket.state(), BucketState::Created);
    }
}
