//! Cluster connection options

use std::time::Duration;

use serde::Deserialize;

use super::cli::{CliArgs, ConfigMode};
use super::tls_config::TlsConfig;
use crate::client::sasl::Credentials;
use crate::cluster::node::Endpoint;

pub const DEFAULT_KV_PORT: u16 = 11210;
pub const DEFAULT_KV_TLS_PORT: u16 = 11207;
pub const DEFAULT_MGMT_PORT: u16 = 8091;
pub const DEFAULT_MGMT_TLS_PORT: u16 = 18091;

/// Options for [`Cluster::connect`](crate::Cluster::connect)
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ClusterOptions {
    // Seeds and credentials
    /// Seed hosts, `host` or `host:kv_port`, tried in order
    pub servers: Vec<String>,
    pub username: String,
    pub password: String,
    /// Buckets the application intends to open; the first is used when
    /// cluster-level config is unavailable
    pub buckets: Vec<String>,

    // Transport
    pub use_ssl: bool,
    pub tls: TlsConfig,
    pub kv_port: u16,
    pub kv_tls_port: u16,
    pub mgmt_port: u16,
    pub mgmt_tls_port: u16,
    pub user_agent: String,

    // Timeouts
    pub connect_timeout_ms: u64,
    pub kv_timeout_ms: u64,
    pub http_timeout_ms: u64,

    // Config propagation
    pub enable_config_polling: bool,
    pub config_poll_interval_ms: u64,
    pub enable_config_streaming: bool,
}

impl Default for ClusterOptions {
    fn default() -> Self {
        Self {
            servers: Vec::new(),
            username: String::new(),
            password: String::new(),
            buckets: Vec::new(),
            use_ssl: false,
            tls: TlsConfig::default(),
            kv_port: DEFAULT_KV_PORT,
            kv_tls_port: DEFAULT_KV_TLS_PORT,
            mgmt_port: DEFAULT_MGMT_PORT,
            mgmt_tls_port: DEFAULT_MGMT_TLS_PORT,
            user_agent: format!("couchbase-core/{}", env!("CARGO_PKG_VERSION")),
            connect_timeout_ms: 10_000,
            kv_timeout_ms: 2_500,
            http_timeout_ms: 10_000,
            enable_config_polling: true,
            config_poll_interval_ms: 2_500,
            enable_config_streaming: false,
        }
    }
}

impl ClusterOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_servers<I, S>(mut self, servers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.servers = servers.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_credentials(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.username = username.into();
        self.password = password.into();
        self
    }

    pub fn with_bucket(mut self, bucket: impl Into<String>) -> Self {
        self.buckets.push(bucket.into());
        self
    }

    pub fn with_tls(mut self, tls: TlsConfig) -> Self {
        self.use_ssl = true;
        self.tls = tls;
        self
    }

    pub fn with_ports(mut self, kv_port: u16, mgmt_port: u16) -> Self {
        self.kv_port = kv_port;
        self.mgmt_port = mgmt_port;
        self
    }

    pub fn with_kv_timeout(mut self, timeout: Duration) -> Self {
        self.kv_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_config_polling(mut self, enabled: bool, interval: Duration) -> Self {
        self.enable_config_polling = enabled;
        self.config_poll_interval_ms = interval.as_millis() as u64;
        self
    }

    pub fn with_config_streaming(mut self, enabled: bool) -> Self {
        self.enable_config_streaming = enabled;
        self
    }

    /// Build options from command-line arguments
    pub fn from_cli(args: &CliArgs) -> Result<Self, String> {
        args.validate()?;

        let mut options = Self::new()
            .with_servers(args.hosts.iter().cloned())
            .with_credentials(args.username.clone(), args.password.clone().unwrap_or_default())
            .with_bucket(args.bucket.clone());
        options.connect_timeout_ms = args.connect_timeout_ms;
        options.kv_timeout_ms = args.kv_timeout_ms;
        options.enable_config_polling = args.config_mode == ConfigMode::Poll;
        options.config_poll_interval_ms = args.poll_interval_ms;
        options.enable_config_streaming = args.config_mode == ConfigMode::Stream;

        if args.tls {
            options = options.with_tls(TlsConfig {
                skip_verify: args.tls_skip_verify,
                ca_cert: args.tls_ca_cert.clone(),
                client_cert: args.tls_cert.clone(),
                client_key: args.tls_key.clone(),
                sni: args.tls_sni.clone(),
            });
        }
        if let Some(port) = args.kv_port {
            if args.tls {
                options.kv_tls_port = port;
            } else {
                options.kv_port = port;
            }
        }
        if let Some(port) = args.mgmt_port {
            if args.tls {
                options.mgmt_tls_port = port;
            } else {
                options.mgmt_port = port;
            }
        }

        options.validate()?;
        Ok(options)
    }

    /// Check required fields; performs no I/O
    pub fn validate(&self) -> Result<(), String> {
        if self.servers.is_empty() {
            return Err("at least one server is required".to_string());
        }
        if let Some(bad) = self
            .servers
            .iter()
            .find(|s| Endpoint::parse(s, self.effective_kv_port()).is_none())
        {
            return Err(format!("invalid server address '{}'", bad));
        }
        if self.username.is_empty() {
            return Err("username is required".to_string());
        }
        if self.password.is_empty() {
            return Err("password is required".to_string());
        }
        if self.kv_timeout_ms == 0 || self.connect_timeout_ms == 0 {
            return Err("timeouts must be greater than zero".to_string());
        }
        if self.enable_config_polling && self.config_poll_interval_ms == 0 {
            return Err("config poll interval must be greater than zero".to_string());
        }
        if self.use_ssl {
            self.tls.validate()?;
        }
        Ok(())
    }

    pub fn credentials(&self) -> Credentials {
        Credentials::new(self.username.clone(), self.password.clone())
    }

    pub fn effective_kv_port(&self) -> u16 {
        if self.use_ssl {
            self.kv_tls_port
        } else {
            self.kv_port
        }
    }

    pub fn effective_mgmt_port(&self) -> u16 {
        if self.use_ssl {
            self.mgmt_tls_port
        } else {
            self.mgmt_port
        }
    }

    /// KV endpoints of the seed list, in order
    pub fn seed_endpoints(&self) -> Vec<Endpoint> {
        let port = self.effective_kv_port();
        self.servers
            .iter()
            .filter_map(|s| Endpoint::parse(s, port))
            .collect()
    }

    /// Management endpoints of the seed list (HTTP config fallback)
    pub fn seed_mgmt_endpoints(&self) -> Vec<Endpoint> {
        let port = self.effective_mgmt_port();
        self.seed_endpoints()
            .into_iter()
            .map(|e| Endpoint::new(e.host, port))
            .collect()
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn kv_timeout(&self) -> Duration {
        Duration::from_millis(self.kv_timeout_ms)
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_millis(self.http_timeout_ms)
    }

    pub fn config_poll_interval(&self) -> Duration {
        Duration::from_millis(self.config_poll_interval_ms)
    }
}
