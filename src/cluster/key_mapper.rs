//! Key-to-node mapping strategies
//!
//! Partitioned buckets hash keys onto a fixed set of vbuckets with CRC32;
//! single-tier buckets place nodes on a ketama ring built from MD5 digests.
//! Mappers are built from one config revision and never mutated.

use std::collections::BTreeMap;

use super::node::Endpoint;
use super::topology::{BucketConfig, NodeLocator};
use crate::utils::ClusterError;

/// Ring points per node: 40 digests x 4 points each
const KETAMA_DIGESTS_PER_NODE: usize = 40;

/// Where a key lives
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MappedTarget {
    /// Partition id (vbucket buckets only)
    pub vbucket_id: Option<u16>,
    /// Active node; `None` if the partition is currently unassigned
    pub primary: Option<Endpoint>,
    pub replicas: Vec<Endpoint>,
}

/// Strategy object built from one config revision
#[derive(Debug, Clone)]
pub enum KeyMapper {
    VBucket(VBucketMapper),
    Ketama(KetamaMapper),
}

impl KeyMapper {
    pub fn from_config(config: &BucketConfig, use_tls: bool) -> Result<Self, ClusterError> {
        match config.node_locator() {
            Some(NodeLocator::Vbucket) => Ok(KeyMapper::VBucket(VBucketMapper::new(config, use_tls)?)),
            Some(NodeLocator::Ketama) => Ok(KeyMapper::Ketama(KetamaMapper::new(config, use_tls)?)),
            None => Err(ClusterError::ParseFailed(
                "config has no node locator".to_string(),
            )),
        }
    }

    pub fn map_key(&self, key: &[u8]) -> MappedTarget {
        match self {
            KeyMapper::VBucket(m) => m.map_key(key),
            KeyMapper::Ketama(m) => MappedTarget {
                vbucket_id: None,
                primary: m.node_for_key(key).cloned(),
                replicas: Vec::new(),
            },
        }
    }
}

/// CRC32 mapper over the vbucket map
#[derive(Debug, Clone)]
pub struct VBucketMapper {
    servers: Vec<Endpoint>,
    vbuckets: Vec<Vec<i32>>,
}

impl VBucketMapper {
    pub fn new(config: &BucketConfig, use_tls: bool) -> Result<Self, ClusterError> {
        let map = config.vbucket_server_map().ok_or_else(|| {
            ClusterError::ParseFailed(format!("bucket {} has no vBucketServerMap", config.name()))
        })?;
        if map.vbucket_map.is_empty() || map.vbucket_map.len() > u16::MAX as usize + 1 {
            return Err(ClusterError::ParseFailed(format!(
                "invalid vbucket count {}",
                map.vbucket_map.len()
            )));
        }
        Ok(Self {
            servers: config.server_endpoints(use_tls)?,
            vbuckets: map.vbucket_map.clone(),
        })
    }

    pub fn num_vbuckets(&self) -> usize {
        self.vbuckets.len()
    }

    /// Partition id for a key
    pub fn vbucket_for_key(&self, key: &[u8]) -> u16 {
        let hash = (crc32(key) >> 16) & 0x7fff;
        (hash as usize % self.vbuckets.len()) as u16
    }

    fn server(&self, index: i32) -> Option<&Endpoint> {
        usize::try_from(index).ok().and_then(|i| self.servers.get(i))
    }

    pub fn map_key(&self, key: &[u8]) -> MappedTarget {
        let vbucket_id = self.vbucket_for_key(key);
        let chain = &self.vbuckets[vbucket_id as usize];
        let primary = chain.first().and_then(|&i| self.server(i)).cloned();
        let replicas = chain
            .iter()
            .skip(1)
            .filter_map(|&i| self.server(i))
            .cloned()
            .collect();

        MappedTarget {
            vbucket_id: Some(vbucket_id),
            primary,
            replicas,
        }
    }
}

/// Consistent-hash ring for single-tier buckets
#[derive(Debug, Clone)]
pub struct KetamaMapper {
    ring: BTreeMap<u32, Endpoint>,
}

impl KetamaMapper {
    pub fn new(config: &BucketConfig, use_tls: bool) -> Result<Self, ClusterError> {
        // ring positions always derive from the plain KV endpoint so that
        // every client agrees on placement whatever transport it uses
        let nodes: Vec<(Endpoint, Endpoint)> = config
            .data_nodes()
            .filter_map(|n| Some((n.kv_endpoint(false)?, n.kv_endpoint(use_tls)?)))
            .collect();
        if nodes.is_empty() {
            return Err(ClusterError::NoNodes);
        }
        Ok(Self::from_nodes(nodes))
    }

    /// Build from `(hash identity, connect target)` pairs
    pub fn from_nodes(nodes: impl IntoIterator<Item = (Endpoint, Endpoint)>) -> Self {
        let mut ring = BTreeMap::new();
        for (identity, target) in nodes {
            for i in 0..KETAMA_DIGESTS_PER_NODE {
                let digest = md5::compute(format!("{}:{}-{}", identity.host, identity.port, i));
                for chunk in digest.chunks_exact(4) {
                    let point = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
                    ring.entry(point).or_insert_with(|| target.clone());
                }
            }
        }
        Self { ring }
    }

    pub fn len(&self) -> usize {
        self.ring.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ring.is_empty()
    }

    pub fn hash_key(key: &[u8]) -> u32 {
        let digest = md5::compute(key);
        u32::from_le_bytes([digest[0], digest[1], digest[2], digest[3]])
    }

    /// First ring point at or after the key's hash, wrapping to the start
    pub fn node_for_key(&self, key: &[u8]) -> Option<&Endpoint> {
        let hash = Self::hash_key(key);
        self.ring
            .range(hash..)
            .next()
            .or_else(|| self.ring.iter().next())
            .map(|(_, endpoint)| endpoint)
    }
}

/// CRC32 (IEEE 802.3, reflected) used for vbucket hashing
pub fn crc32(data: &[u8]) -> u32 {
    let mut crc: u32 = 0xffff_ffff;
    for &byte in data {
        crc ^= byte as u32;
        for _ in 0..8 {
            if crc & 1 != 0 {
                crc = (crc >> 1) ^ 0xedb8_8320;
            } else {
                crc >>= 1;
            }
        }
    }
    !crc
}
