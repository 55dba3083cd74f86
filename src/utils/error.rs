//! Error types for the client core

use std::io;
use thiserror::Error;

use crate::ops::Status;

/// Top-level client error
#[derive(Error, Debug)]
pub enum ClientError {
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    #[error("Bucket not found: {0}")]
    BucketNotFound(String),

    #[error("Scope not found: {0}")]
    ScopeNotFound(String),

    #[error("Collection not found: {scope}.{collection}")]
    CollectionNotFound { scope: String, collection: String },

    #[error("Not supported: {0}")]
    NotSupported(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Bootstrap of {target} failed: {}", .failures.join("; "))]
    BootstrapFailed {
        target: String,
        failures: Vec<String>,
    },

    #[error("Bucket {0} is not ready")]
    BucketNotReady(String),

    #[error("Client has been closed")]
    Closed,

    #[error("Connection error: {0}")]
    Connection(#[from] ConnectionError),

    #[error("Key-value error: {0}")]
    Kv(#[from] KvError),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Cluster error: {0}")]
    Cluster(#[from] ClusterError),
}

impl ClientError {
    /// Whether this error (at any layer) is an authentication failure.
    ///
    /// Authentication failures abort bootstrap instead of moving on to the
    /// next candidate server.
    pub fn is_auth_failure(&self) -> bool {
        matches!(
            self,
            ClientError::AuthenticationFailed(_)
                | ClientError::Connection(ConnectionError::AuthFailed(_))
                | ClientError::Kv(KvError::AuthenticationFailed)
        )
    }

    /// Whether the server reported that the bucket does not exist
    pub fn is_bucket_missing(&self) -> bool {
        matches!(
            self,
            ClientError::BucketNotFound(_)
                | ClientError::Connection(ConnectionError::SelectBucketFailed { .. })
                | ClientError::Cluster(ClusterError::BucketNotFound(_))
        )
    }

    /// Revision the operation was routed with, if the server rejected it as stale
    pub fn stale_revision(&self) -> Option<u64> {
        match self {
            ClientError::Kv(KvError::StaleRouting { revision }) => Some(*revision),
            _ => None,
        }
    }
}

/// Connection-related errors
#[derive(Error, Debug)]
pub enum ConnectionError {
    #[error("Failed to connect to {host}:{port}: {source}")]
    ConnectFailed {
        host: String,
        port: u16,
        source: io::Error,
    },

    #[error("Feature negotiation failed: {0}")]
    Negotiation(String),

    #[error("Authentication failed: {0}")]
    AuthFailed(String),

    #[error("Failed to select bucket {bucket}: {reason}")]
    SelectBucketFailed { bucket: String, reason: String },

    #[error("TLS handshake failed: {0}")]
    TlsFailed(String),

    #[error("Connection closed")]
    Closed,

    #[error("Operation timed out after {0}ms")]
    Timeout(u64),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// Per-operation failures reported by the data service
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum KvError {
    #[error("Document not found")]
    DocumentNotFound,

    #[error("Document already exists")]
    DocumentExists,

    #[error("CAS mismatch")]
    CasMismatch,

    #[error("Document is locked")]
    DocumentLocked,

    #[error("Value too large")]
    ValueTooLarge,

    #[error("Temporary failure ({0:?}), retry later")]
    TemporaryFailure(Status),

    #[error("Operation routed with stale config revision {revision}")]
    StaleRouting { revision: u64 },

    #[error("Authentication failed")]
    AuthenticationFailed,

    #[error("Access denied")]
    AccessDenied,

    #[error("No bucket selected or bucket missing")]
    NoBucket,

    #[error("Unknown collection")]
    UnknownCollection,

    #[error("Unknown scope")]
    UnknownScope,

    #[error("Operation not supported by the server: {0:?}")]
    NotSupported(Status),

    #[error("Invalid arguments")]
    InvalidArguments,

    #[error("Server error 0x{status:04x} {name}: {description}")]
    Server {
        status: u16,
        name: String,
        description: String,
    },
}

/// Binary protocol errors
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("Invalid magic byte: 0x{0:02x}")]
    InvalidMagic(u8),

    #[error("Malformed frame: {0}")]
    Malformed(String),

    #[error("Frame body of {0} bytes exceeds the maximum")]
    FrameTooLarge(usize),

    #[error("Unexpected response: expected {expected}, got {actual}")]
    UnexpectedResponse { expected: String, actual: String },

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// Topology and config-propagation errors
#[derive(Error, Debug)]
pub enum ClusterError {
    #[error("Failed to parse cluster config: {0}")]
    ParseFailed(String),

    #[error("Config has no usable nodes")]
    NoNodes,

    #[error("Bucket {0} does not exist on the cluster")]
    BucketNotFound(String),

    #[error("Failed to fetch config from {server}: {reason}")]
    FetchFailed { server: String, reason: String },

    #[error("No node available for endpoint {0}")]
    NodeUnavailable(String),

    #[error("Config refresh failed: {0}")]
    RefreshFailed(String),
}

impl From<serde_json::Error> for ClusterError {
    fn from(err: serde_json::Error) -> Self {
        ClusterError::ParseFailed(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, ClientError>;
