//! Operations: per-opcode descriptors, request encoding and response handling

use std::sync::atomic::{AtomicU32, Ordering};

use bytes::{Buf, Bytes};

use super::error_map::ErrorMap;
use super::opcode::{HelloFeature, OpCode, Status};
use crate::utils::frame::{datatype, write_leb128, Frame, MAX_BODY_LEN};
use crate::utils::{ClientError, KvError};

/// Longest document key the server accepts, collection prefix excluded
pub const MAX_KEY_LEN: usize = 250;

static NEXT_OPAQUE: AtomicU32 = AtomicU32::new(1);

/// Allocate a fresh opaque correlation id
pub fn next_opaque() -> u32 {
    NEXT_OPAQUE.fetch_add(1, Ordering::Relaxed)
}

/// Format of a document value, carried in the common flags
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataFormat {
    Json,
    Binary,
    String,
}

impl DataFormat {
    pub fn common_flags(self) -> u32 {
        match self {
            DataFormat::Json => 0x0200_0000,
            DataFormat::Binary => 0x0300_0000,
            DataFormat::String => 0x0400_0000,
        }
    }

    /// Recover the format from common flags; legacy zero flags are treated as JSON
    pub fn from_flags(flags: u32) -> Self {
        match flags >> 24 {
            3 => DataFormat::Binary,
            4 => DataFormat::String,
            _ => DataFormat::Json,
        }
    }

    fn datatype(self) -> u8 {
        match self {
            DataFormat::Json => datatype::JSON,
            _ => datatype::RAW,
        }
    }
}

/// Closed set of operation descriptors
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OpKind {
    Get,
    GetAndTouch { expiry: u32 },
    GetReplica,
    Upsert { expiry: u32 },
    Insert { expiry: u32 },
    Replace { expiry: u32 },
    Remove,
    Touch { expiry: u32 },
    Noop,
    Hello,
    GetErrorMap,
    SaslListMechs,
    SaslAuth,
    SaslStep,
    SelectBucket,
    GetClusterConfig,
    GetCollectionsManifest,
}

impl OpKind {
    pub fn opcode(&self) -> OpCode {
        match self {
            OpKind::Get => OpCode::Get,
            OpKind::GetAndTouch { .. } => OpCode::GetAndTouch,
            OpKind::GetReplica => OpCode::GetReplica,
            OpKind::Upsert { .. } => OpCode::Set,
            OpKind::Insert { .. } => OpCode::Add,
            OpKind::Replace { .. } => OpCode::Replace,
            OpKind::Remove => OpCode::Delete,
            OpKind::Touch { .. } => OpCode::Touch,
            OpKind::Noop => OpCode::Noop,
            OpKind::Hello => OpCode::Hello,
            OpKind::GetErrorMap => OpCode::GetErrorMap,
            OpKind::SaslListMechs => OpCode::SaslListMechs,
            OpKind::SaslAuth => OpCode::SaslAuth,
            OpKind::SaslStep => OpCode::SaslStep,
            OpKind::SelectBucket => OpCode::SelectBucket,
            OpKind::GetClusterConfig => OpCode::GetClusterConfig,
            OpKind::GetCollectionsManifest => OpCode::GetCollectionsManifest,
        }
    }

    /// Document operations need a key and are routed by it
    pub fn requires_key(&self) -> bool {
        matches!(
            self,
            OpKind::Get
                | OpKind::GetAndTouch { .. }
                | OpKind::GetReplica
                | OpKind::Upsert { .. }
                | OpKind::Insert { .. }
                | OpKind::Replace { .. }
                | OpKind::Remove
                | OpKind::Touch { .. }
        )
    }

    pub fn is_mutation(&self) -> bool {
        matches!(
            self,
            OpKind::Upsert { .. } | OpKind::Insert { .. } | OpKind::Replace { .. } | OpKind::Remove
        )
    }

    fn returns_flags(&self) -> bool {
        matches!(self, OpKind::Get | OpKind::GetAndTouch { .. } | OpKind::GetReplica)
    }

    fn write_extras(&self, flags: u32, out: &mut Vec<u8>) {
        match self {
            OpKind::Upsert { expiry } | OpKind::Insert { expiry } | OpKind::Replace { expiry } => {
                out.extend_from_slice(&flags.to_be_bytes());
                out.extend_from_slice(&expiry.to_be_bytes());
            }
            OpKind::GetAndTouch { expiry } | OpKind::Touch { expiry } => {
                out.extend_from_slice(&expiry.to_be_bytes());
            }
            _ => {}
        }
    }
}

/// Mutation sequence info returned when MutationSeqno was negotiated
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MutationToken {
    pub vbucket_id: u16,
    pub vbucket_uuid: u64,
    pub sequence_number: u64,
}

/// Successful (or AuthContinue) response to an operation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperationResponse {
    pub status: Status,
    pub cas: u64,
    pub flags: u32,
    pub data_type: u8,
    pub key: Bytes,
    pub value: Bytes,
    pub mutation_token: Option<MutationToken>,
}

impl OperationResponse {
    pub fn format(&self) -> DataFormat {
        DataFormat::from_flags(self.flags)
    }

    pub fn value_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.value).ok()
    }
}

/// A single request to the data service
#[derive(Debug)]
pub struct Operation {
    kind: OpKind,
    key: Bytes,
    collection_id: Option<u32>,
    content: Bytes,
    format: DataFormat,
    vbucket_id: Option<u16>,
    cas: u64,
    opaque: u32,
    attempts: u32,
    routing_revision: Option<u64>,
    last_config_revision_tried: Option<u64>,
    status: Option<Status>,
    routing_update: Option<Bytes>,
    completed: bool,
}

impl Operation {
    fn new(kind: OpKind, key: impl Into<Bytes>, content: impl Into<Bytes>) -> Self {
        Self {
            kind,
            key: key.into(),
            collection_id: None,
            content: content.into(),
            format: DataFormat::Json,
            vbucket_id: None,
            cas: 0,
            opaque: next_opaque(),
            attempts: 0,
            routing_revision: None,
            last_config_revision_tried: None,
            status: None,
            routing_update: None,
            completed: false,
        }
    }

    pub fn get(key: impl Into<Bytes>) -> Self {
        Self::new(OpKind::Get, key, Bytes::new())
    }

    pub fn get_and_touch(key: impl Into<Bytes>, expiry: u32) -> Self {
        Self::new(OpKind::GetAndTouch { expiry }, key, Bytes::new())
    }

    pub fn get_replica(key: impl Into<Bytes>) -> Self {
        Self::new(OpKind::GetReplica, key, Bytes::new())
    }

    pub fn upsert(key: impl Into<Bytes>, value: impl Into<Bytes>, expiry: u32) -> Self {
        Self::new(OpKind::Upsert { expiry }, key, value)
    }

    pub fn insert(key: impl Into<Bytes>, value: impl Into<Bytes>, expiry: u32) -> Self {
        Self::new(OpKind::Insert { expiry }, key, value)
    }

    pub fn replace(key: impl Into<Bytes>, value: impl Into<Bytes>, expiry: u32) -> Self {
        Self::new(OpKind::Replace { expiry }, key, value)
    }

    pub fn remove(key: impl Into<Bytes>) -> Self {
        Self::new(OpKind::Remove, key, Bytes::new())
    }

    pub fn touch(key: impl Into<Bytes>, expiry: u32) -> Self {
        Self::new(OpKind::Touch { expiry }, key, Bytes::new())
    }

    pub fn noop() -> Self {
        Self::new(OpKind::Noop, Bytes::new(), Bytes::new())
    }

    /// HELLO: key is the client user agent, body is the list of feature codes
    pub fn hello(user_agent: &str, features: &[HelloFeature]) -> Self {
        let mut body = Vec::with_capacity(features.len() * 2);
        for feature in features {
            body.extend_from_slice(&(*feature as u16).to_be_bytes());
        }
        Self::new(OpKind::Hello, user_agent.to_string(), body)
    }

    pub fn get_error_map(version: u16) -> Self {
        Self::new(OpKind::GetErrorMap, Bytes::new(), version.to_be_bytes().to_vec())
    }

    pub fn sasl_list_mechs() -> Self {
        Self::new(OpKind::SaslListMechs, Bytes::new(), Bytes::new())
    }

    pub fn sasl_auth(mechanism: &str, payload: impl Into<Bytes>) -> Self {
        Self::new(OpKind::SaslAuth, mechanism.to_string(), payload)
    }

    pub fn sasl_step(mechanism: &str, payload: impl Into<Bytes>) -> Self {
        Self::new(OpKind::SaslStep, mechanism.to_string(), payload)
    }

    pub fn select_bucket(name: &str) -> Self {
        Self::new(OpKind::SelectBucket, name.to_string(), Bytes::new())
    }

    pub fn get_cluster_config() -> Self {
        Self::new(OpKind::GetClusterConfig, Bytes::new(), Bytes::new())
    }

    pub fn get_collections_manifest() -> Self {
        Self::new(OpKind::GetCollectionsManifest, Bytes::new(), Bytes::new())
    }

    pub fn with_cas(mut self, cas: u64) -> Self {
        self.cas = cas;
        self
    }

    pub fn with_format(mut self, format: DataFormat) -> Self {
        self.format = format;
        self
    }

    pub fn with_collection_id(mut self, cid: u32) -> Self {
        self.collection_id = Some(cid);
        self
    }

    pub fn kind(&self) -> &OpKind {
        &self.kind
    }

    pub fn opcode(&self) -> OpCode {
        self.kind.opcode()
    }

    pub fn key(&self) -> &[u8] {
        &self.key
    }

    pub fn content(&self) -> &[u8] {
        &self.content
    }

    pub fn collection_id(&self) -> Option<u32> {
        self.collection_id
    }

    pub fn cas(&self) -> u64 {
        self.cas
    }

    pub fn opaque(&self) -> u32 {
        self.opaque
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn vbucket_id(&self) -> Option<u16> {
        self.vbucket_id
    }

    pub fn set_vbucket_id(&mut self, vbucket_id: Option<u16>) {
        self.vbucket_id = vbucket_id;
    }

    /// Record the config revision the dispatcher used to route this attempt
    pub fn set_routing_revision(&mut self, revision: u64) {
        self.routing_revision = Some(revision);
    }

    /// Config revision of the last attempt the server rejected as misrouted
    pub fn last_config_revision_tried(&self) -> Option<u64> {
        self.last_config_revision_tried
    }

    /// Status of the last completed attempt
    pub fn status(&self) -> Option<Status> {
        self.status
    }

    /// Config document the server attached to a NotMyVBucket reply
    pub fn take_routing_update(&mut self) -> Option<Bytes> {
        self.routing_update.take()
    }

    pub fn is_completed(&self) -> bool {
        self.completed
    }

    /// Copy for another attempt: same key, body, CAS, opaque and routing
    /// history, attempt counter advanced, completion slot reset.
    pub fn clone_for_retry(&self) -> Self {
        Self {
            kind: self.kind.clone(),
            key: self.key.clone(),
            collection_id: self.collection_id,
            content: self.content.clone(),
            format: self.format,
            vbucket_id: self.vbucket_id,
            cas: self.cas,
            opaque: self.opaque,
            attempts: self.attempts + 1,
            routing_revision: None,
            last_config_revision_tried: self.last_config_revision_tried,
            status: self.status,
            routing_update: None,
            completed: false,
        }
    }

    /// Serialize into a request frame.
    ///
    /// `collections` says whether the target connection negotiated collections;
    /// if so, document keys carry a LEB128 collection-id prefix.
    pub fn to_frame(&self, collections: bool) -> Result<Frame, ClientError> {
        if self.completed {
            return Err(ClientError::InvalidArgument(
                "operation already completed; clone it to retry".to_string(),
            ));
        }
        if self.kind.requires_key() && self.key.is_empty() {
            return Err(ClientError::InvalidArgument(format!(
                "{:?} requires a key",
                self.kind.opcode()
            )));
        }
        if self.kind.requires_key() && self.key.len() > MAX_KEY_LEN {
            return Err(ClientError::InvalidArgument(format!(
                "key of {} bytes exceeds the {} byte limit",
                self.key.len(),
                MAX_KEY_LEN
            )));
        }
        if self.content.len() > MAX_BODY_LEN {
            return Err(ClientError::InvalidArgument(format!(
                "value of {} bytes exceeds the {} byte limit",
                self.content.len(),
                MAX_BODY_LEN
            )));
        }

        let key = if self.kind.requires_key() {
            match (collections, self.collection_id) {
                (true, cid) => {
                    let mut prefixed = Vec::with_capacity(self.key.len() + 5);
                    write_leb128(cid.unwrap_or(0), &mut prefixed);
                    prefixed.extend_from_slice(&self.key);
                    Bytes::from(prefixed)
                }
                (false, Some(cid)) if cid != 0 => {
                    return Err(ClientError::NotSupported(
                        "node did not negotiate collections".to_string(),
                    ));
                }
                (false, _) => self.key.clone(),
            }
        } else {
            self.key.clone()
        };

        let mut extras = Vec::new();
        self.kind.write_extras(self.format.common_flags(), &mut extras);

        let mut frame = Frame::request(self.kind.opcode() as u8);
        frame.vbucket_or_status = self.vbucket_id.unwrap_or(0);
        frame.opaque = self.opaque;
        frame.cas = self.cas;
        frame.extras = Bytes::from(extras);
        frame.key = key;
        frame.value = self.content.clone();
        if self.kind.is_mutation() && !self.content.is_empty() {
            frame.data_type = self.format.datatype();
        }
        Ok(frame)
    }

    /// Complete the operation with the server's response.
    ///
    /// Success (and `AuthContinue` for SASL exchanges) yields a typed
    /// response; any other status is mapped to a [`KvError`].
    pub fn complete(
        &mut self,
        frame: Frame,
        error_map: Option<&ErrorMap>,
    ) -> Result<OperationResponse, KvError> {
        self.completed = true;
        let status = Status::from_u16(frame.status());
        self.status = Some(status);

        match status {
            Status::Success => {}
            Status::AuthContinue
                if matches!(self.kind, OpKind::SaslAuth | OpKind::SaslStep) => {}
            Status::NotMyVBucket => {
                let revision = self.routing_revision.unwrap_or(0);
                self.last_config_revision_tried = Some(revision);
                if !frame.value.is_empty() {
                    self.routing_update = Some(frame.value.clone());
                }
                return Err(KvError::StaleRouting { revision });
            }
            other => return Err(self.status_error(other, error_map)),
        }

        let mut flags = 0;
        let mut mutation_token = None;
        let mut extras = frame.extras.clone();
        if self.kind.returns_flags() && extras.len() >= 4 {
            flags = extras.get_u32();
        } else if self.kind.is_mutation() && extras.len() >= 16 {
            mutation_token = Some(MutationToken {
                vbucket_id: self.vbucket_id.unwrap_or(0),
                vbucket_uuid: extras.get_u64(),
                sequence_number: extras.get_u64(),
            });
        }

        Ok(OperationResponse {
            status,
            cas: frame.cas,
            flags,
            data_type: frame.data_type,
            key: frame.key,
            value: frame.value,
            mutation_token,
        })
    }

    fn status_error(&self, status: Status, error_map: Option<&ErrorMap>) -> KvError {
        match status {
            Status::KeyNotFound => KvError::DocumentNotFound,
            Status::KeyExists if self.cas != 0 => KvError::CasMismatch,
            Status::KeyExists => KvError::DocumentExists,
            // replace/add report ItemNotStored instead of not-found/exists
            Status::ItemNotStored => match self.kind {
                OpKind::Insert { .. } => KvError::DocumentExists,
                OpKind::Replace { .. } => KvError::DocumentNotFound,
                _ => KvError::Server {
                    status: status.code(),
                    name: "NOT_STORED".to_string(),
                    description: "Item not stored".to_string(),
                },
            },
            Status::ValueTooLarge => KvError::ValueTooLarge,
            Status::Locked => KvError::DocumentLocked,
            Status::TemporaryFailure | Status::Busy | Status::OutOfMemory => {
                KvError::TemporaryFailure(status)
            }
            Status::AuthError | Status::AuthStale => KvError::AuthenticationFailed,
            Status::AccessDenied => KvError::AccessDenied,
            Status::NoBucket => KvError::NoBucket,
            Status::UnknownCollection => KvError::UnknownCollection,
            Status::UnknownScope => KvError::UnknownScope,
            Status::UnknownCommand | Status::NotSupported => KvError::NotSupported(status),
            Status::InvalidArguments => KvError::InvalidArguments,
            other => match error_map.and_then(|m| m.get(other.code())) {
                Some(entry) if entry.requires_config_refresh() => KvError::StaleRouting {
                    revision: self.routing_revision.unwrap_or(0),
                },
                Some(entry) if entry.is_temporary() => KvError::TemporaryFailure(other),
                Some(entry) => KvError::Server {
                    status: other.code(),
                    name: entry.name.clone(),
                    description: entry.desc.clone(),
                },
                None => KvError::Server {
                    status: other.code(),
                    name: "UNKNOWN".to_string(),
                    description: format!("unmapped status {}", other),
                },
            },
        }
    }
}
