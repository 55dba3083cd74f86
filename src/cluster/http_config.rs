//! Config over the management HTTP port
//!
//! `HttpClusterMap` fetches one config document per request from
//! `/pools/default/b/{bucket}`. `StreamingConfigListener` holds a long-lived
//! request on `/pools/default/bs/{bucket}` and publishes every document the
//! server pushes, moving to the next server when a stream ends.

use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use parking_lot::RwLock;
use reqwest::StatusCode;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::node::Endpoint;
use super::topology::BucketConfig;
use super::topology_manager::{ConfigContext, ConfigSource};
use crate::client::Credentials;
use crate::config::{ClusterOptions, TlsConfig};
use crate::utils::{ClientError, ClusterError, Result};

/// Longest config document a stream may send before its newline
pub const MAX_STREAMED_DOCUMENT_LEN: usize = 16 * 1024 * 1024;

fn build_http_client(tls: &TlsConfig, timeout: Option<Duration>) -> Result<reqwest::Client> {
    let mut builder = reqwest::Client::builder().danger_accept_invalid_certs(tls.skip_verify);
    if let Some(timeout) = timeout {
        builder = builder.timeout(timeout);
    }
    if let Some(path) = &tls.ca_cert {
        let pem = std::fs::read(path).map_err(|e| {
            ClientError::InvalidConfiguration(format!("cannot read CA file {}: {}", path.display(), e))
        })?;
        let cert = reqwest::Certificate::from_pem(&pem)
            .map_err(|e| ClientError::InvalidConfiguration(format!("invalid CA file: {}", e)))?;
        builder = builder.add_root_certificate(cert);
    }
    builder
        .build()
        .map_err(|e| ClientError::InvalidConfiguration(format!("HTTP client: {}", e)))
}

fn config_url(server: &Endpoint, use_tls: bool, path: &str) -> String {
    let scheme = if use_tls { "https" } else { "http" };
    format!("{}://{}{}", scheme, server, path)
}

fn fetch_error(server: &Endpoint, reason: impl ToString) -> ClientError {
    ClusterError::FetchFailed {
        server: server.to_string(),
        reason: reason.to_string(),
    }
    .into()
}

/// Polling config source over the terse bucket endpoint
pub struct HttpClusterMap {
    client: reqwest::Client,
    servers: RwLock<Vec<Endpoint>>,
    use_tls: bool,
    credentials: Credentials,
}

impl HttpClusterMap {
    pub fn new(servers: Vec<Endpoint>, options: &ClusterOptions) -> Result<Self> {
        Ok(Self {
            client: build_http_client(&options.tls, Some(options.http_timeout()))?,
            servers: RwLock::new(servers),
            use_tls: options.use_ssl,
            credentials: options.credentials(),
        })
    }

    /// Map over the seed list's management endpoints
    pub fn from_options(options: &ClusterOptions) -> Result<Self> {
        Self::new(options.seed_mgmt_endpoints(), options)
    }

    pub fn servers(&self) -> Vec<Endpoint> {
        self.servers.read().clone()
    }

    /// Follow the management endpoints of a newer config
    pub fn update_servers(&self, config: &BucketConfig) {
        let servers: Vec<Endpoint> = config
            .nodes()
            .iter()
            .filter_map(|n| n.mgmt_endpoint(self.use_tls))
            .collect();
        if !servers.is_empty() {
            *self.servers.write() = servers;
        }
    }

    /// Fetch `bucket`'s config from one server
    pub async fn fetch_from(&self, server: &Endpoint, bucket: &str) -> Result<BucketConfig> {
        let url = config_url(server, self.use_tls, &format!("/pools/default/b/{}", bucket));
        debug!("GET {}", url);
        let response = self
            .client
            .get(&url)
            .basic_auth(&self.credentials.username, Some(&self.credentials.password))
            .send()
            .await
            .map_err(|e| fetch_error(server, e))?;

        match response.status() {
            StatusCode::NOT_FOUND => {
                return Err(ClusterError::BucketNotFound(bucket.to_string()).into())
            }
            StatusCode::UNAUTHORIZED => {
                return Err(ClientError::AuthenticationFailed(format!(
                    "{} rejected the credentials",
                    server
                )))
            }
            status if !status.is_success() => return Err(fetch_error(server, status)),
            _ => {}
        }

        let body = response.text().await.map_err(|e| fetch_error(server, e))?;
        Ok(BucketConfig::parse(&body, &server.host)?)
    }
}

#[async_trait]
impl ConfigSource for HttpClusterMap {
    fn describe(&self) -> String {
        "HTTP".to_string()
    }

    fn config_accepted(&self, config: &BucketConfig) {
        self.update_servers(config);
    }

    /// Try every server in order; the first good document wins
    async fn fetch(&self, bucket: &str) -> Result<BucketConfig> {
        let servers = self.servers();
        let mut failures = Vec::new();
        let mut missing = 0;

        for server in &servers {
            match self.fetch_from(server, bucket).await {
                Ok(config) => return Ok(config),
                Err(e) => {
                    debug!("Config fetch for '{}' from {} failed: {}", bucket, server, e);
                    if e.is_bucket_missing() {
                        missing += 1;
                    }
                    failures.push(format!("{}: {}", server, e));
                }
            }
        }

        if missing > 0 && missing == servers.len() {
            return Err(ClusterError::BucketNotFound(bucket.to_string()).into());
        }
        Err(ClusterError::RefreshFailed(failures.join("; ")).into())
    }
}

/// Streaming config listener for one bucket
pub struct StreamingConfigListener {
    client: reqwest::Client,
    servers: Vec<Endpoint>,
    use_tls: bool,
    credentials: Credentials,
    bucket: String,
    max_document_len: usize,
}

impl StreamingConfigListener {
    pub fn new(bucket: &str, servers: Vec<Endpoint>, options: &ClusterOptions) -> Result<Self> {
        Ok(Self {
            // streams stay open indefinitely
            client: build_http_client(&options.tls, None)?,
            servers,
            use_tls: options.use_ssl,
            credentials: options.credentials(),
            bucket: bucket.to_string(),
            max_document_len: MAX_STREAMED_DOCUMENT_LEN,
        })
    }

    pub fn with_max_document_len(mut self, max: usize) -> Self {
        self.max_document_len = max;
        self
    }

    /// Run in the background of `context` until `token` is cancelled
    pub fn spawn(self, context: &Arc<ConfigContext>, token: CancellationToken) {
        info!("Streaming config for '{}'", self.bucket);
        let weak = Arc::downgrade(context);
        context.spawn(token, self.run(weak));
    }

    /// Listen on each server in a shuffled order, moving on whenever a
    /// stream fails or ends. Returns once every server has been tried.
    pub async fn run(self, context: Weak<ConfigContext>) {
        let mut servers = self.servers.clone();
        fastrand::shuffle(&mut servers);

        for server in &servers {
            match self.listen(server, &context).await {
                Ok(published) => debug!(
                    "Config stream from {} for '{}' ended after {} documents",
                    server, self.bucket, published
                ),
                Err(e) => warn!("Config stream from {} for '{}' failed: {}", server, self.bucket, e),
            }
            if context.upgrade().map_or(true, |c| c.is_stopped()) {
                return;
            }
        }
        warn!(
            "Config streaming for '{}' stopped: all {} servers exhausted",
            self.bucket,
            servers.len()
        );
    }

    async fn listen(&self, server: &Endpoint, context: &Weak<ConfigContext>) -> Result<usize> {
        let url = config_url(server, self.use_tls, &format!("/pools/default/bs/{}", self.bucket));
        let response = self
            .client
            .get(&url)
            .basic_auth(&self.credentials.username, Some(&self.credentials.password))
            .send()
            .await
            .map_err(|e| fetch_error(server, e))?;
        if !response.status().is_success() {
            return Err(fetch_error(server, response.status()));
        }
        debug!("Listening for config on {}", url);

        let mut published = 0;
        let mut buffer: Vec<u8> = Vec::new();
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| fetch_error(server, e))?;
            buffer.extend_from_slice(&chunk);
            while let Some(pos) = buffer.iter().position(|b| *b == b'\n') {
                self.check_document_len(server, pos)?;
                let line: Vec<u8> = buffer.drain(..=pos).collect();
                published += publish_line(&line, server, context)?;
            }
            self.check_document_len(server, buffer.len())?;
        }
        published += publish_line(&buffer, server, context)?;
        Ok(published)
    }

    fn check_document_len(&self, server: &Endpoint, len: usize) -> Result<()> {
        if len > self.max_document_len {
            return Err(fetch_error(
                server,
                format!(
                    "streamed document exceeds {} bytes without a newline",
                    self.max_document_len
                ),
            ));
        }
        Ok(())
    }
}

/// Publish one line of a config stream; blank separator lines are skipped
fn publish_line(line: &[u8], server: &Endpoint, context: &Weak<ConfigContext>) -> Result<usize> {
    let text = String::from_utf8_lossy(line);
    let text = text.trim();
    if text.is_empty() {
        return Ok(0);
    }
    let Some(context) = context.upgrade() else {
        return Err(ClientError::Closed);
    };
    match context.publish_raw(text, &server.host) {
        Ok(_) => Ok(1),
        Err(e) => {
            warn!("Discarding streamed config from {}: {}", server, e);
            Ok(0)
        }
    }
}
