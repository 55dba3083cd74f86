//! Scopes, collections and the collections manifest

use bytes::Bytes;
use serde::{Deserialize, Deserializer};

use super::Bucket;
use crate::ops::{Operation, OperationResponse};
use crate::utils::{ClientError, ClusterError, KvError, Result};

pub const DEFAULT_SCOPE: &str = "_default";
pub const DEFAULT_COLLECTION: &str = "_default";

fn hex_id<'de, D: Deserializer<'de>>(deserializer: D) -> std::result::Result<u64, D::Error> {
    let raw = String::deserialize(deserializer)?;
    u64::from_str_radix(&raw, 16).map_err(serde::de::Error::custom)
}

fn hex_cid<'de, D: Deserializer<'de>>(deserializer: D) -> std::result::Result<u32, D::Error> {
    let raw = String::deserialize(deserializer)?;
    u32::from_str_radix(&raw, 16).map_err(serde::de::Error::custom)
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ManifestCollection {
    pub name: String,
    #[serde(deserialize_with = "hex_cid")]
    pub uid: u32,
    #[serde(default, rename = "maxTTL")]
    pub max_ttl: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ManifestScope {
    pub name: String,
    #[serde(deserialize_with = "hex_cid")]
    pub uid: u32,
    #[serde(default)]
    pub collections: Vec<ManifestCollection>,
}

/// Scopes and collections of one bucket; ids are hex strings on the wire
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct CollectionManifest {
    #[serde(deserialize_with = "hex_id")]
    pub uid: u64,
    #[serde(default)]
    pub scopes: Vec<ManifestScope>,
}

impl CollectionManifest {
    pub fn parse(raw: &[u8]) -> std::result::Result<Self, ClusterError> {
        Ok(serde_json::from_slice(raw)?)
    }

    /// Manifest of a bucket without collections: the default scope holding
    /// the default collection
    pub fn default_only() -> Self {
        Self {
            uid: 0,
            scopes: vec![ManifestScope {
                name: DEFAULT_SCOPE.to_string(),
                uid: 0,
                collections: vec![ManifestCollection {
                    name: DEFAULT_COLLECTION.to_string(),
                    uid: 0,
                    max_ttl: None,
                }],
            }],
        }
    }

    pub fn scope(&self, name: &str) -> Option<&ManifestScope> {
        self.scopes.iter().find(|s| s.name == name)
    }

    pub fn collection_id(&self, scope: &str, collection: &str) -> Result<u32> {
        let scope_entry = self
            .scope(scope)
            .ok_or_else(|| ClientError::ScopeNotFound(scope.to_string()))?;
        scope_entry
            .collections
            .iter()
            .find(|c| c.name == collection)
            .map(|c| c.uid)
            .ok_or_else(|| ClientError::CollectionNotFound {
                scope: scope.to_string(),
                collection: collection.to_string(),
            })
    }
}

/// Named scope of a bucket
#[derive(Debug, Clone)]
pub struct Scope {
    bucket: Bucket,
    name: String,
}

impl Scope {
    pub(super) fn new(bucket: Bucket, name: &str) -> Self {
        Self {
            bucket,
            name: name.to_string(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn bucket_name(&self) -> &str {
        self.bucket.name()
    }

    /// Resolve a collection of this scope against the bucket's manifest
    pub fn collection(&self, name: &str) -> Result<Collection> {
        let id = self.bucket.manifest().collection_id(&self.name, name)?;
        Ok(Collection {
            bucket: self.bucket.clone(),
            scope: self.name.clone(),
            name: name.to_string(),
            id,
        })
    }

    pub fn default_collection(&self) -> Result<Collection> {
        self.collection(DEFAULT_COLLECTION)
    }
}

/// Document operations against one collection
#[derive(Debug, Clone)]
pub struct Collection {
    bucket: Bucket,
    scope: String,
    name: String,
    id: u32,
}

impl Collection {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn scope_name(&self) -> &str {
        &self.scope
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    fn key(key: &str) -> Bytes {
        Bytes::copy_from_slice(key.as_bytes())
    }

    /// Send a prepared operation through this collection
    pub async fn execute(&self, op: Operation) -> Result<OperationResponse> {
        let mut op = op.with_collection_id(self.id);
        self.bucket.send(&mut op).await
    }

    pub async fn get(&self, key: &str) -> Result<OperationResponse> {
        self.execute(Operation::get(Self::key(key))).await
    }

    pub async fn get_and_touch(&self, key: &str, expiry: u32) -> Result<OperationResponse> {
        self.execute(Operation::get_and_touch(Self::key(key), expiry)).await
    }

    /// Read from the active copy, then each replica in turn; the first
    /// successful read wins
    pub async fn get_any_replica(&self, key: &str) -> Result<OperationResponse> {
        if !self.bucket.kind().is_partitioned() {
            return Err(ClientError::NotSupported(
                "replica reads need a partitioned bucket".to_string(),
            ));
        }

        let mut last_error = match self.get(key).await {
            Ok(response) => return Ok(response),
            Err(e) => e,
        };
        for index in 0..self.bucket.num_replicas() {
            let mut op = Operation::get_replica(Self::key(key)).with_collection_id(self.id);
            match self.bucket.send_to_replica(&mut op, index).await {
                Ok(response) => return Ok(response),
                Err(e) => last_error = e,
            }
        }
        Err(last_error)
    }

    pub async fn upsert(&self, key: &str, value: impl Into<Bytes>, expiry: u32) -> Result<OperationResponse> {
        self.execute(Operation::upsert(Self::key(key), value, expiry)).await
    }

    pub async fn insert(&self, key: &str, value: impl Into<Bytes>, expiry: u32) -> Result<OperationResponse> {
        self.execute(Operation::insert(Self::key(key), value, expiry)).await
    }

    /// Replace an existing document; a non-zero `cas` must match
    pub async fn replace(
        &self,
        key: &str,
        value: impl Into<Bytes>,
        expiry: u32,
        cas: u64,
    ) -> Result<OperationResponse> {
        self.execute(Operation::replace(Self::key(key), value, expiry).with_cas(cas))
            .await
    }

    pub async fn remove(&self, key: &str, cas: u64) -> Result<OperationResponse> {
        self.execute(Operation::remove(Self::key(key)).with_cas(cas)).await
    }

    pub async fn touch(&self, key: &str, expiry: u32) -> Result<OperationResponse> {
        self.execute(Operation::touch(Self::key(key), expiry)).await
    }

    /// Whether `key` exists (a miss is not an error here)
    pub async fn exists(&self, key: &str) -> Result<bool> {
        match self.get(key).await {
            Ok(_) => Ok(true),
            Err(ClientError::Kv(KvError::DocumentNotFound)) => Ok(false),
            Err(e) => Err(e),
        }
    }
}
