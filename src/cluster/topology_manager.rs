//! Config propagation
//!
//! `ConfigContext` holds the newest accepted config per bucket and fans
//! accepted configs out to subscribers. Background sources (KV polling, HTTP
//! polling, HTTP streaming) publish into it. A config is only accepted when
//! its revision is strictly greater than the one held for that bucket.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::topology::BucketConfig;
use crate::utils::Result;

/// Key under which cluster-level (bucketless) configs are held
pub const CLUSTER_CONFIG_KEY: &str = "";

const UPDATE_CHANNEL_CAPACITY: usize = 64;

/// Something that can fetch the current config of a bucket
#[async_trait]
pub trait ConfigSource: Send + Sync {
    /// Short name for log lines
    fn describe(&self) -> String;

    async fn fetch(&self, bucket: &str) -> Result<BucketConfig>;

    /// Called after a fetched config was accepted
    fn config_accepted(&self, _config: &BucketConfig) {}
}

pub struct ConfigContext {
    latest: RwLock<HashMap<String, Arc<BucketConfig>>>,
    updates: broadcast::Sender<Arc<BucketConfig>>,
    shutdown: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Default for ConfigContext {
    fn default() -> Self {
        Self::new()
    }
}

impl ConfigContext {
    pub fn new() -> Self {
        let (updates, _) = broadcast::channel(UPDATE_CHANNEL_CAPACITY);
        Self {
            latest: RwLock::new(HashMap::new()),
            updates,
            shutdown: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Receive every config accepted from now on
    pub fn subscribe(&self) -> broadcast::Receiver<Arc<BucketConfig>> {
        self.updates.subscribe()
    }

    pub fn latest(&self, bucket: &str) -> Option<Arc<BucketConfig>> {
        self.latest.read().get(bucket).cloned()
    }

    pub fn revision(&self, bucket: &str) -> Option<u64> {
        self.latest(bucket).map(|c| c.rev())
    }

    /// Token cancelled by [`stop`](Self::stop)
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.child_token()
    }

    pub fn is_stopped(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Offer a config. Returns true if it was newer than the one held for its
    /// bucket and has been fanned out.
    pub fn publish(&self, config: impl Into<Arc<BucketConfig>>) -> bool {
        let config = config.into();
        if self.is_stopped() {
            return false;
        }

        {
            let mut latest = self.latest.write();
            if let Some(held) = latest.get(config.name()) {
                if config.rev() < held.rev() {
                    debug!(
                        "Ignoring config rev {} for '{}', holding rev {}",
                        config.rev(),
                        config.name(),
                        held.rev()
                    );
                    return false;
                }
                if config.rev() == held.rev() {
                    if **held != *config {
                        warn!(
                            "Config for '{}' changed content without a revision bump (rev {})",
                            config.name(),
                            config.rev()
                        );
                    }
                    return false;
                }
            }
            latest.insert(config.name().to_string(), config.clone());
        }

        info!("Accepted config rev {} for '{}'", config.rev(), config.name());
        // no subscribers is fine
        let _ = self.updates.send(config);
        true
    }

    /// Parse a raw config document from `source_host` and publish it
    pub fn publish_raw(&self, raw: &str, source_host: &str) -> Result<bool> {
        let config = BucketConfig::parse(raw, source_host)?;
        Ok(self.publish(config))
    }

    /// Drop the config held for `bucket`
    pub fn forget(&self, bucket: &str) {
        self.latest.write().remove(bucket);
    }

    /// Run `task` in the background until `token` is cancelled. Pass a token
    /// derived from [`shutdown_token`](Self::shutdown_token) so
    /// [`stop`](Self::stop) still ends it.
    pub fn spawn<F>(&self, token: CancellationToken, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let handle = tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {}
                _ = task => {}
            }
        });
        let mut tasks = self.tasks.lock();
        tasks.retain(|t| !t.is_finished());
        tasks.push(handle);
    }

    /// Poll `source` for `bucket` every `interval` until `scope` is cancelled
    pub fn start_polling(
        self: &Arc<Self>,
        bucket: &str,
        source: Arc<dyn ConfigSource>,
        interval: Duration,
        scope: CancellationToken,
    ) {
        info!(
            "Polling config for '{}' every {:?} via {}",
            bucket,
            interval,
            source.describe()
        );
        self.spawn(
            scope,
            poll_loop(Arc::downgrade(self), bucket.to_string(), source, interval),
        );
    }

    /// Number of background tasks still running
    pub fn active_tasks(&self) -> usize {
        self.tasks.lock().iter().filter(|t| !t.is_finished()).count()
    }

    /// Cancel every background task and wait for them to finish
    pub async fn stop(&self) {
        self.shutdown.cancel();
        let tasks: Vec<JoinHandle<()>> = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            if let Err(e) = task.await {
                debug!("Config task ended abnormally: {}", e);
            }
        }
        debug!("Config propagation stopped");
    }
}

async fn poll_loop(
    context: Weak<ConfigContext>,
    bucket: String,
    source: Arc<dyn ConfigSource>,
    interval: Duration,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // the first tick completes immediately; the bootstrap config is fresh
    ticker.tick().await;

    loop {
        ticker.tick().await;
        let result = source.fetch(&bucket).await;
        let Some(context) = context.upgrade() else {
            break;
        };
        match result {
            Ok(config) => {
                let config = Arc::new(config);
                if context.publish(config.clone()) {
                    source.config_accepted(&config);
                }
            }
            Err(e) => warn!(
                "Config poll for '{}' via {} failed: {}",
                bucket,
                source.describe(),
                e
            ),
        }
    }
}
