//! Cluster topology
//!
//! Config documents and node descriptors, key mapping strategies, and the
//! propagation machinery that keeps every bucket on the newest revision.

pub mod http_config;
pub mod key_mapper;
pub mod node;
pub mod topology;
pub mod topology_manager;

pub use http_config::{HttpClusterMap, StreamingConfigListener};
pub use key_mapper::{KeyMapper, KetamaMapper, MappedTarget, VBucketMapper};
pub use node::{Endpoint, NodeAdapter, ServicePorts};
pub use topology::{BucketConfig, ClusterCapabilities, NodeLocator, VBucketServerMap};
pub use topology_manager::{ConfigContext, ConfigSource, CLUSTER_CONFIG_KEY};
