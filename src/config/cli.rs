//! Command-line argument parsing for `cbkv`

use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};

/// Key-value client for Couchbase clusters
#[derive(Parser, Debug, Clone)]
#[command(name = "cbkv")]
#[command(version, about, long_about = None)]
pub struct CliArgs {
    // ===== Connection Options =====
    /// Seed host, `host` or `host:port` (repeat for several seeds)
    #[arg(short = 'H', long = "host", default_value = "127.0.0.1", action = clap::ArgAction::Append)]
    pub hosts: Vec<String>,

    /// Username
    #[arg(short = 'u', long = "user", env = "CB_USERNAME", default_value = "Administrator")]
    pub username: String,

    /// Password
    #[arg(short = 'p', long = "password", env = "CB_PASSWORD")]
    pub password: Option<String>,

    /// Bucket to open
    #[arg(short = 'b', long = "bucket", default_value = "default")]
    pub bucket: String,

    /// Scope within the bucket
    #[arg(long = "scope", default_value = "_default")]
    pub scope: String,

    /// Collection within the scope
    #[arg(long = "collection", default_value = "_default")]
    pub collection: String,

    /// KV port used for seeds given without one
    #[arg(long = "kv-port")]
    pub kv_port: Option<u16>,

    /// Management (HTTP) port
    #[arg(long = "mgmt-port")]
    pub mgmt_port: Option<u16>,

    // ===== TLS Options =====
    /// Enable TLS connection
    #[arg(long = "tls")]
    pub tls: bool,

    /// Skip TLS certificate verification (insecure)
    #[arg(long = "tls-skip-verify")]
    pub tls_skip_verify: bool,

    /// CA certificate file for TLS
    #[arg(long = "tls-ca-cert")]
    pub tls_ca_cert: Option<PathBuf>,

    /// Client certificate file for TLS
    #[arg(long = "tls-cert")]
    pub tls_cert: Option<PathBuf>,

    /// Client private key file for TLS
    #[arg(long = "tls-key")]
    pub tls_key: Option<PathBuf>,

    /// Server Name Indication for TLS
    #[arg(long = "tls-sni")]
    pub tls_sni: Option<String>,

    // ===== Config propagation =====
    /// How bucket config changes are picked up
    #[arg(long = "config-mode", value_enum, default_value_t = ConfigMode::Poll)]
    pub config_mode: ConfigMode,

    /// Config poll interval in milliseconds
    #[arg(long = "poll-interval", default_value_t = 2500)]
    pub poll_interval_ms: u64,

    // ===== Timing Options =====
    /// Connection timeout in milliseconds
    #[arg(long = "connect-timeout", default_value_t = 10000)]
    pub connect_timeout_ms: u64,

    /// Per-operation timeout in milliseconds
    #[arg(long = "kv-timeout", default_value_t = 2500)]
    pub kv_timeout_ms: u64,

    // ===== Output Options =====
    /// Quiet mode (errors only)
    #[arg(short = 'q', long = "quiet")]
    pub quiet: bool,

    /// Verbose output
    #[arg(short = 'v', long = "verbose")]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Fetch a document
    Get {
        key: String,
        /// Fall back to replicas when the active copy is unavailable
        #[arg(long = "replica")]
        replica: bool,
    },
    /// Store a document, creating or replacing it
    Upsert {
        key: String,
        value: String,
        /// Expiry in seconds (0 = never)
        #[arg(long = "expiry", default_value_t = 0)]
        expiry: u32,
    },
    /// Delete a document
    Remove { key: String },
    /// Print the node and vbucket a key maps to
    Locate { key: String },
    /// List service endpoints
    Services,
    /// Print every config revision the bucket applies, until interrupted
    Watch,
}

/// Config propagation mechanism
#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConfigMode {
    /// Periodic fetch (KV for couchbase buckets, HTTP for memcached)
    #[default]
    Poll,
    /// Long-lived HTTP streaming connection
    Stream,
    /// No updates after bootstrap
    Off,
}

impl CliArgs {
    pub fn validate(&self) -> Result<(), String> {
        if self.password.as_deref().map_or(true, str::is_empty) {
            return Err("a password is required (--password or CB_PASSWORD)".to_string());
        }
        if self.tls_cert.is_some() != self.tls_key.is_some() {
            return Err("--tls-cert and --tls-key must be given together".to_string());
        }
        if self.config_mode == ConfigMode::Poll && self.poll_interval_ms == 0 {
            return Err("--poll-interval must be greater than zero".to_string());
        }
        Ok(())
    }
}
