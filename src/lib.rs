//! couchbase-core library
//!
//! Topology-aware client core for Couchbase Server: cluster and bucket
//! config propagation, pipelined binary-protocol connections, vbucket and
//! ketama key routing, and scopes/collections on top.

pub mod bootstrap;
pub mod bucket;
pub mod client;
pub mod cluster;
pub mod config;
pub mod ops;
pub mod services;
pub mod utils;

#[cfg(test)]
pub(crate) mod test_util;

pub use bootstrap::Cluster;
pub use bucket::{Bucket, BucketKind, BucketState, Collection, Scope};
pub use config::{ClusterOptions, TlsConfig};
pub use ops::{DataFormat, Operation, OperationResponse};
pub use services::ServiceType;
pub use utils::{ClientError, Result};
