//! Cluster entry point
//!
//! `Cluster::connect` validates options and bootstraps against the seed list,
//! preferring the cluster-level config (GCCP). Buckets are opened on first
//! access behind a bootstrap gate and cached until the cluster closes.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::bucket::{Bucket, BucketKind, BucketState};
use crate::client::{ClusterNode, ConnectionFactory, ControlPlaneExt};
use crate::cluster::http_config::{HttpClusterMap, StreamingConfigListener};
use crate::cluster::node::Endpoint;
use crate::cluster::topology::{BucketConfig, ClusterCapabilities};
use crate::cluster::topology_manager::{ConfigContext, ConfigSource, CLUSTER_CONFIG_KEY};
use crate::config::ClusterOptions;
use crate::services::ServiceType;
use crate::utils::{ClientError, ClusterError, Result};

pub struct Cluster {
    options: ClusterOptions,
    factory: Arc<ConnectionFactory>,
    context: Arc<ConfigContext>,
    buckets: RwLock<HashMap<String, Bucket>>,
    /// Connections not (yet) owned by any bucket
    pool: Mutex<Vec<Arc<ClusterNode>>>,
    bootstrap_gate: tokio::sync::Mutex<()>,
    closed: AtomicBool,
}

impl Cluster {
    /// Validate `options` and bootstrap against the seed list
    pub async fn connect(options: ClusterOptions) -> Result<Self> {
        options.validate().map_err(ClientError::InvalidConfiguration)?;
        let factory = Arc::new(ConnectionFactory::from_options(&options)?);

        let cluster = Self {
            options,
            factory,
            context: Arc::new(ConfigContext::new()),
            buckets: RwLock::new(HashMap::new()),
            pool: Mutex::new(Vec::new()),
            bootstrap_gate: tokio::sync::Mutex::new(()),
            closed: AtomicBool::new(false),
        };
        cluster.bootstrap().await?;
        Ok(cluster)
    }

    /// Connect to the first reachable seed and fetch the cluster config
    async fn bootstrap(&self) -> Result<()> {
        let mut failures = Vec::new();

        for seed in self.options.seed_endpoints() {
            let node = match ClusterNode::connect(seed.clone(), self.factory.clone(), None).await {
                Ok(node) => Arc::new(node),
                Err(e) if e.is_auth_failure() => {
                    self.close_pool().await;
                    return Err(e);
                }
                Err(e) => {
                    warn!("Seed {} unavailable: {}", seed, e);
                    failures.push(format!("{}: {}", seed, e));
                    continue;
                }
            };

            match node.get_cluster_config().await {
                Ok(Some(raw)) => match BucketConfig::parse(&String::from_utf8_lossy(&raw), &seed.host) {
                    Ok(config) => {
                        self.register_cluster_nodes(node, &config);
                        info!(
                            "Bootstrapped from cluster config rev {} via {}",
                            config.rev(),
                            seed
                        );
                        self.context.publish(config);
                        return Ok(());
                    }
                    Err(e) => {
                        node.close().await;
                        failures.push(format!("{}: {}", seed, e));
                    }
                },
                Ok(None) => {
                    info!(
                        "{} serves no cluster-level config; buckets will bootstrap individually",
                        seed
                    );
                    self.pool.lock().push(node);
                    return Ok(());
                }
                Err(e) => {
                    node.close().await;
                    failures.push(format!("{}: {}", seed, e));
                }
            }
        }

        Err(ClientError::BootstrapFailed {
            target: "cluster".to_string(),
            failures,
        })
    }

    /// Pool the seed plus a lazy node for every other data node
    fn register_cluster_nodes(&self, seed: Arc<ClusterNode>, config: &BucketConfig) {
        let use_tls = self.factory.uses_tls();
        let mut pool = self.pool.lock();
        for adapter in config.data_nodes() {
            let Some(endpoint) = adapter.kv_endpoint(use_tls) else {
                continue;
            };
            if endpoint == *seed.endpoint() {
                seed.set_adapter(adapter.clone());
                continue;
            }
            if pool.iter().any(|n| *n.endpoint() == endpoint) {
                continue;
            }
            let node = Arc::new(ClusterNode::lazy(endpoint, self.factory.clone()));
            node.set_adapter(adapter.clone());
            pool.push(node);
        }
        pool.insert(0, seed);
    }

    pub fn options(&self) -> &ClusterOptions {
        &self.options
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            return Err(ClientError::Closed);
        }
        Ok(())
    }

    /// Every config accepted from now on, for any bucket
    pub fn config_updates(&self) -> broadcast::Receiver<Arc<BucketConfig>> {
        self.context.subscribe()
    }

    /// Endpoints of the unowned connection pool
    pub fn pooled_endpoints(&self) -> Vec<Endpoint> {
        self.pool.lock().iter().map(|n| n.endpoint().clone()).collect()
    }

    pub fn bucket_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.buckets.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Open bucket by name; a disposed entry is evicted so the next
    /// `bucket()` call reopens it
    fn cached(&self, name: &str) -> Option<Bucket> {
        let bucket = self.buckets.read().get(name).cloned()?;
        if bucket.state() != BucketState::Disposed {
            return Some(bucket);
        }
        let mut buckets = self.buckets.write();
        if buckets.get(name).is_some_and(|b| b.state() == BucketState::Disposed) {
            debug!("Evicting disposed bucket '{}'", name);
            buckets.remove(name);
        }
        None
    }

    /// Dispose `name` and drop it from the cache. Returns false if it was not open.
    pub async fn close_bucket(&self, name: &str) -> bool {
        let removed = self.buckets.write().remove(name);
        match removed {
            Some(bucket) => {
                bucket.dispose().await;
                true
            }
            None => false,
        }
    }

    /// Open `name`, or return it if it is already open
    pub async fn bucket(&self, name: &str) -> Result<Bucket> {
        self.ensure_open()?;
        if let Some(bucket) = self.cached(name) {
            return Ok(bucket);
        }

        let _gate = self.bootstrap_gate.lock().await;
        if let Some(bucket) = self.cached(name) {
            return Ok(bucket);
        }
        self.ensure_open()?;

        let seeds = self.options.seed_endpoints();
        let mut failures = Vec::new();
        let mut missing = 0;

        for seed in &seeds {
            match self.open_bucket(seed, name).await {
                Ok(bucket) => {
                    if let Err(e) = self.start_propagation(&bucket) {
                        warn!("Config updates for '{}' unavailable: {}", name, e);
                    }
                    self.buckets.write().insert(name.to_string(), bucket.clone());
                    return Ok(bucket);
                }
                Err(e) if e.is_auth_failure() => return Err(e),
                Err(e) => {
                    warn!("Opening '{}' via {} failed: {}", name, seed, e);
                    if e.is_bucket_missing() {
                        missing += 1;
                    }
                    failures.push(format!("{}: {}", seed, e));
                }
            }
        }

        if missing > 0 && missing == seeds.len() {
            return Err(ClientError::BucketNotFound(name.to_string()));
        }
        Err(ClientError::BootstrapFailed {
            target: name.to_string(),
            failures,
        })
    }

    fn take_pooled(&self, endpoint: &Endpoint) -> Option<Arc<ClusterNode>> {
        let mut pool = self.pool.lock();
        let index = pool
            .iter()
            .position(|n| n.endpoint() == endpoint && n.owner().is_none() && !n.is_closed())?;
        Some(pool.remove(index))
    }

    /// Return an unclaimed node to the pool, or close it
    async fn release(&self, node: Arc<ClusterNode>, pooled: bool) {
        if pooled && node.owner().is_none() && !node.is_closed() {
            self.pool.lock().push(node);
        } else {
            node.close().await;
        }
    }

    async fn open_bucket(&self, seed: &Endpoint, name: &str) -> Result<Bucket> {
        let (node, pooled) = match self.take_pooled(seed) {
            Some(node) => (node, true),
            None => {
                let node = ClusterNode::connect(seed.clone(), self.factory.clone(), None).await?;
                (Arc::new(node), false)
            }
        };

        if let Err(e) = node.select_bucket(name).await {
            self.release(node, pooled).await;
            return Err(e);
        }

        let config = match self.fetch_bucket_config(&node, seed, name).await {
            Ok(config) => config,
            Err(e) => {
                node.close().await;
                return Err(e);
            }
        };
        let Some(locator) = config.node_locator() else {
            node.close().await;
            return Err(ClusterError::ParseFailed(format!("config of '{}' names no node locator", name)).into());
        };
        let kind = BucketKind::from_locator(locator);

        let bucket = Bucket::new(name, kind, self.factory.clone(), self.context.clone());
        if let Err(e) = bucket.bootstrap(node.clone(), config).await {
            bucket.dispose().await;
            node.close().await;
            return Err(e);
        }

        let confirmed = bucket
            .config()
            .and_then(|c| c.node_locator())
            .map(BucketKind::from_locator);
        if bucket.state() != BucketState::Ready || confirmed != Some(kind) {
            bucket.dispose().await;
            return Err(ClientError::BucketNotReady(name.to_string()));
        }
        Ok(bucket)
    }

    /// Bucket config over KV, falling back to the seed's management port
    async fn fetch_bucket_config(&self, node: &ClusterNode, seed: &Endpoint, name: &str) -> Result<BucketConfig> {
        match node.get_cluster_config().await {
            Ok(Some(raw)) => {
                let config = BucketConfig::parse(&String::from_utf8_lossy(&raw), &seed.host)?;
                if config.is_bucket_config() {
                    return Ok(config);
                }
                debug!("{} returned a cluster config for '{}', trying HTTP", seed, name);
            }
            Ok(None) => debug!("{} has no KV config for '{}', trying HTTP", seed, name),
            Err(e) => debug!("KV config fetch for '{}' from {} failed: {}", name, seed, e),
        }

        let mgmt = Endpoint::new(seed.host.clone(), self.options.effective_mgmt_port());
        HttpClusterMap::new(vec![mgmt], &self.options)?.fetch(name).await
    }

    fn mgmt_servers(&self, bucket: &Bucket) -> Vec<Endpoint> {
        let use_tls = self.factory.uses_tls();
        let servers: Vec<Endpoint> = bucket
            .config()
            .map(|c| c.nodes().iter().filter_map(|n| n.mgmt_endpoint(use_tls)).collect())
            .unwrap_or_default();
        if servers.is_empty() {
            self.options.seed_mgmt_endpoints()
        } else {
            servers
        }
    }

    /// Streaming when enabled, otherwise polling (KV for partitioned
    /// buckets, HTTP for single-tier ones)
    fn start_propagation(&self, bucket: &Bucket) -> Result<()> {
        let name = bucket.name();
        if self.options.enable_config_streaming {
            StreamingConfigListener::new(name, self.mgmt_servers(bucket), &self.options)?
                .spawn(&self.context, bucket.shutdown_token());
        } else if self.options.enable_config_polling {
            let source: Arc<dyn ConfigSource> = if bucket.kind().is_partitioned() {
                bucket.kv_config_source()
            } else {
                Arc::new(HttpClusterMap::new(self.mgmt_servers(bucket), &self.options)?)
            };
            self.context.start_polling(
                name,
                source,
                self.options.config_poll_interval(),
                bucket.shutdown_token(),
            );
        }
        Ok(())
    }

    /// Newest cluster-level config, or the config of an open (or the first
    /// configured) bucket when the cluster serves none
    async fn current_config(&self) -> Result<Arc<BucketConfig>> {
        self.ensure_open()?;
        if let Some(config) = self.context.latest(CLUSTER_CONFIG_KEY) {
            return Ok(config);
        }
        let open = self.buckets.read().values().find_map(|b| b.config());
        if let Some(config) = open {
            return Ok(config);
        }

        let first = self.options.buckets.first().cloned().ok_or_else(|| {
            ClientError::NotSupported(
                "cluster config unavailable and no bucket configured to bootstrap from".to_string(),
            )
        })?;
        let bucket = self.bucket(&first).await?;
        bucket
            .config()
            .ok_or_else(|| ClientError::BucketNotReady(first))
    }

    /// Endpoints of `service` across the cluster
    pub async fn service_uris(&self, service: ServiceType) -> Result<Vec<String>> {
        let config = self.current_config().await?;
        Ok(config.service_uris(service, self.factory.uses_tls()))
    }

    pub async fn capabilities(&self) -> Result<ClusterCapabilities> {
        Ok(self.current_config().await?.cluster_capabilities().clone())
    }

    async fn close_pool(&self) {
        let nodes: Vec<Arc<ClusterNode>> = std::mem::take(&mut *self.pool.lock());
        for node in nodes {
            node.close().await;
        }
    }

    /// Stop propagation, dispose every bucket, then close pooled nodes
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.context.stop().await;
        let buckets: Vec<Bucket> = self.buckets.write().drain().map(|(_, b)| b).collect();
        for bucket in buckets {
            bucket.dispose().await;
        }
        self.close_pool().await;
        info!("Cluster closed");
    }
}
