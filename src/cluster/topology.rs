//! Topology snapshots
//!
//! A [`BucketConfig`] is one immutable revision of the cluster map as served
//! by the data service (`GetClusterConfig`) or the management REST API. The
//! server writes `$HOST` wherever it means "the address you reached me on";
//! parsing substitutes the responding host before decoding.

use std::collections::HashMap;

use serde::Deserialize;

use super::node::{Endpoint, NodeAdapter, RawNode, RawNodeExt};
use crate::services::ServiceType;
use crate::utils::ClusterError;

/// Placeholder the server uses for its own address
pub const HOST_PLACEHOLDER: &str = "$HOST";

/// Key distribution strategy named by the config
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeLocator {
    Vbucket,
    Ketama,
}

/// `vBucketServerMap` section of a partitioned bucket config
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VBucketServerMap {
    #[serde(default)]
    pub hash_algorithm: String,
    #[serde(default)]
    pub num_replicas: usize,
    #[serde(default)]
    pub server_list: Vec<String>,
    #[serde(default, rename = "vBucketMap")]
    pub vbucket_map: Vec<Vec<i32>>,
}

/// Cluster-wide capability flags, grouped by service
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(transparent)]
pub struct ClusterCapabilities(HashMap<String, Vec<String>>);

impl ClusterCapabilities {
    pub fn supports(&self, category: &str, capability: &str) -> bool {
        self.0
            .get(category)
            .is_some_and(|caps| caps.iter().any(|c| c == capability))
    }

    pub fn enhanced_prepared_statements(&self) -> bool {
        self.supports("n1ql", "enhancedPreparedStatements")
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawBucketConfig {
    #[serde(default)]
    rev: u64,
    #[serde(default)]
    name: String,
    #[serde(default)]
    uuid: Option<String>,
    #[serde(default)]
    node_locator: Option<NodeLocator>,
    #[serde(default)]
    nodes: Vec<RawNode>,
    #[serde(default)]
    nodes_ext: Vec<RawNodeExt>,
    #[serde(default, rename = "vBucketServerMap")]
    vbucket_server_map: Option<VBucketServerMap>,
    #[serde(default)]
    bucket_capabilities: Vec<String>,
    #[serde(default)]
    cluster_capabilities: ClusterCapabilities,
}

/// One immutable revision of a bucket (or cluster-level) config
#[derive(Debug, Clone, PartialEq)]
pub struct BucketConfig {
    rev: u64,
    name: String,
    uuid: Option<String>,
    node_locator: Option<NodeLocator>,
    nodes: Vec<NodeAdapter>,
    vbucket_server_map: Option<VBucketServerMap>,
    bucket_capabilities: Vec<String>,
    cluster_capabilities: ClusterCapabilities,
}

impl BucketConfig {
    /// Parse a config document received from `source_host`
    pub fn parse(raw: &str, source_host: &str) -> Result<Self, ClusterError> {
        let host = if source_host.contains(':') {
            format!("[{}]", source_host)
        } else {
            source_host.to_string()
        };
        let substituted = raw.replace(HOST_PLACEHOLDER, &host);
        let parsed: RawBucketConfig = serde_json::from_str(&substituted)?;

        let nodes: Vec<NodeAdapter> = if parsed.nodes_ext.is_empty() {
            parsed.nodes.iter().filter_map(NodeAdapter::from_legacy).collect()
        } else {
            parsed
                .nodes_ext
                .iter()
                .map(|n| NodeAdapter::from_ext(n, source_host))
                .collect()
        };
        if nodes.is_empty() {
            return Err(ClusterError::NoNodes);
        }

        if parsed.node_locator == Some(NodeLocator::Vbucket) {
            match &parsed.vbucket_server_map {
                Some(map) if !map.vbucket_map.is_empty() => {}
                _ => {
                    return Err(ClusterError::ParseFailed(format!(
                        "bucket {} uses vbucket locator but has no vBucketMap",
                        parsed.name
                    )))
                }
            }
        }

        Ok(Self {
            rev: parsed.rev,
            name: parsed.name,
            uuid: parsed.uuid,
            node_locator: parsed.node_locator,
            nodes,
            vbucket_server_map: parsed.vbucket_server_map,
            bucket_capabilities: parsed.bucket_capabilities,
            cluster_capabilities: parsed.cluster_capabilities,
        })
    }

    pub fn rev(&self) -> u64 {
        self.rev
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn uuid(&self) -> Option<&str> {
        self.uuid.as_deref()
    }

    pub fn node_locator(&self) -> Option<NodeLocator> {
        self.node_locator
    }

    /// A config without a locator describes the cluster, not a bucket
    pub fn is_bucket_config(&self) -> bool {
        self.node_locator.is_some() && !self.name.is_empty()
    }

    pub fn nodes(&self) -> &[NodeAdapter] {
        &self.nodes
    }

    pub fn data_nodes(&self) -> impl Iterator<Item = &NodeAdapter> {
        self.nodes.iter().filter(|n| n.is_data_node())
    }

    /// KV endpoints of every data node
    pub fn kv_endpoints(&self, use_tls: bool) -> Vec<Endpoint> {
        self.data_nodes()
            .filter_map(|n| n.kv_endpoint(use_tls))
            .collect()
    }

    pub fn vbucket_server_map(&self) -> Option<&VBucketServerMap> {
        self.vbucket_server_map.as_ref()
    }

    pub fn num_vbuckets(&self) -> usize {
        self.vbucket_server_map
            .as_ref()
            .map_or(0, |m| m.vbucket_map.len())
    }

    pub fn num_replicas(&self) -> usize {
        self.vbucket_server_map.as_ref().map_or(0, |m| m.num_replicas)
    }

    /// `serverList` resolved to connectable endpoints, index-aligned with the
    /// entries of the vbucket map. Under TLS each entry is translated to the
    /// matching node's secure KV port.
    pub fn server_endpoints(&self, use_tls: bool) -> Result<Vec<Endpoint>, ClusterError> {
        let Some(map) = &self.vbucket_server_map else {
            return Ok(Vec::new());
        };

        map.server_list
            .iter()
            .map(|entry| {
                let plain = Endpoint::parse(entry, 11210).ok_or_else(|| {
                    ClusterError::ParseFailed(format!("invalid serverList entry {:?}", entry))
                })?;
                if !use_tls {
                    return Ok(plain);
                }
                Ok(self
                    .nodes
                    .iter()
                    .find(|n| n.hostname == plain.host && n.ports.kv == Some(plain.port))
                    .and_then(|n| n.kv_endpoint(true))
                    .unwrap_or(plain))
            })
            .collect()
    }

    pub fn bucket_capabilities(&self) -> &[String] {
        &self.bucket_capabilities
    }

    pub fn has_bucket_capability(&self, capability: &str) -> bool {
        self.bucket_capabilities.iter().any(|c| c == capability)
    }

    pub fn cluster_capabilities(&self) -> &ClusterCapabilities {
        &self.cluster_capabilities
    }

    /// Service URIs of every node running `service`
    pub fn service_uris(&self, service: ServiceType, use_tls: bool) -> Vec<String> {
        self.nodes
            .iter()
            .filter_map(|n| n.service_uri(service, use_tls))
            .collect()
    }
}
