//! Opcodes, response statuses and HELLO feature codes

use std::fmt;

/// Binary protocol opcodes used by the client
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum OpCode {
    Get = 0x00,
    Set = 0x01,
    Add = 0x02,
    Replace = 0x03,
    Delete = 0x04,
    Noop = 0x0a,
    Touch = 0x1c,
    GetAndTouch = 0x1d,
    Hello = 0x1f,
    SaslListMechs = 0x20,
    SaslAuth = 0x21,
    SaslStep = 0x22,
    GetReplica = 0x83,
    SelectBucket = 0x89,
    GetClusterConfig = 0xb5,
    GetCollectionsManifest = 0xba,
    GetErrorMap = 0xfe,
}

impl OpCode {
    pub fn from_u8(b: u8) -> Option<Self> {
        Some(match b {
            0x00 => OpCode::Get,
            0x01 => OpCode::Set,
            0x02 => OpCode::Add,
            0x03 => OpCode::Replace,
            0x04 => OpCode::Delete,
            0x0a => OpCode::Noop,
            0x1c => OpCode::Touch,
            0x1d => OpCode::GetAndTouch,
            0x1f => OpCode::Hello,
            0x20 => OpCode::SaslListMechs,
            0x21 => OpCode::SaslAuth,
            0x22 => OpCode::SaslStep,
            0x83 => OpCode::GetReplica,
            0x89 => OpCode::SelectBucket,
            0xb5 => OpCode::GetClusterConfig,
            0xba => OpCode::GetCollectionsManifest,
            0xfe => OpCode::GetErrorMap,
            _ => return None,
        })
    }
}

/// Response status codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Status {
    Success,
    KeyNotFound,
    KeyExists,
    ValueTooLarge,
    InvalidArguments,
    ItemNotStored,
    NotMyVBucket,
    NoBucket,
    Locked,
    AuthStale,
    AuthError,
    AuthContinue,
    AccessDenied,
    UnknownCommand,
    OutOfMemory,
    NotSupported,
    InternalError,
    Busy,
    TemporaryFailure,
    UnknownCollection,
    UnknownScope,
    Other(u16),
}

impl Status {
    pub fn from_u16(code: u16) -> Self {
        match code {
            0x0000 => Status::Success,
            0x0001 => Status::KeyNotFound,
            0x0002 => Status::KeyExists,
            0x0003 => Status::ValueTooLarge,
            0x0004 => Status::InvalidArguments,
            0x0005 => Status::ItemNotStored,
            0x0007 => Status::NotMyVBucket,
            0x0008 => Status::NoBucket,
            0x0009 => Status::Locked,
            0x001f => Status::AuthStale,
            0x0020 => Status::AuthError,
            0x0021 => Status::AuthContinue,
            0x0024 => Status::AccessDenied,
            0x0081 => Status::UnknownCommand,
            0x0082 => Status::OutOfMemory,
            0x0083 => Status::NotSupported,
            0x0084 => Status::InternalError,
            0x0085 => Status::Busy,
            0x0086 => Status::TemporaryFailure,
            0x0088 => Status::UnknownCollection,
            0x008c => Status::UnknownScope,
            other => Status::Other(other),
        }
    }

    pub fn code(self) -> u16 {
        match self {
            Status::Success => 0x0000,
            Status::KeyNotFound => 0x0001,
            Status::KeyExists => 0x0002,
            Status::ValueTooLarge => 0x0003,
            Status::InvalidArguments => 0x0004,
            Status::ItemNotStored => 0x0005,
            Status::NotMyVBucket => 0x0007,
            Status::NoBucket => 0x0008,
            Status::Locked => 0x0009,
            Status::AuthStale => 0x001f,
            Status::AuthError => 0x0020,
            Status::AuthContinue => 0x0021,
            Status::AccessDenied => 0x0024,
            Status::UnknownCommand => 0x0081,
            Status::OutOfMemory => 0x0082,
            Status::NotSupported => 0x0083,
            Status::InternalError => 0x0084,
            Status::Busy => 0x0085,
            Status::TemporaryFailure => 0x0086,
            Status::UnknownCollection => 0x0088,
            Status::UnknownScope => 0x008c,
            Status::Other(code) => code,
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?} (0x{:04x})", self, self.code())
    }
}

/// Features negotiated through HELLO
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum HelloFeature {
    Datatype = 0x01,
    Tls = 0x02,
    TcpNoDelay = 0x03,
    MutationSeqno = 0x04,
    TcpDelay = 0x05,
    Xattr = 0x06,
    Xerror = 0x07,
    SelectBucket = 0x08,
    Snappy = 0x0a,
    Json = 0x0b,
    Duplex = 0x0c,
    ClustermapChangeNotification = 0x0d,
    UnorderedExecution = 0x0e,
    Tracing = 0x0f,
    AltRequestSupport = 0x10,
    SyncReplication = 0x11,
    Collections = 0x12,
}

impl HelloFeature {
    pub fn from_u16(code: u16) -> Option<Self> {
        Some(match code {
            0x01 => HelloFeature::Datatype,
            0x02 => HelloFeature::Tls,
            0x03 => HelloFeature::TcpNoDelay,
            0x04 => HelloFeature::MutationSeqno,
            0x05 => HelloFeature::TcpDelay,
            0x06 => HelloFeature::Xattr,
            0x07 => HelloFeature::Xerror,
            0x08 => HelloFeature::SelectBucket,
            0x0a => HelloFeature::Snappy,
            0x0b => HelloFeature::Json,
            0x0c => HelloFeature::Duplex,
            0x0d => HelloFeature::ClustermapChangeNotification,
            0x0e => HelloFeature::UnorderedExecution,
            0x0f => HelloFeature::Tracing,
            0x10 => HelloFeature::AltRequestSupport,
            0x11 => HelloFeature::SyncReplication,
            0x12 => HelloFeature::Collections,
            _ => return None,
        })
    }
}

/// Features this client asks for during HELLO.
///
/// Snappy is not requested, so values always arrive uncompressed.
pub const REQUESTED_FEATURES: &[HelloFeature] = &[
    HelloFeature::Datatype,
    HelloFeature::TcpNoDelay,
    HelloFeature::MutationSeqno,
    HelloFeature::Xattr,
    HelloFeature::Xerror,
    HelloFeature::SelectBucket,
    HelloFeature::Json,
    HelloFeature::UnorderedExecution,
    HelloFeature::Collections,
];

/// Set of features the server accepted
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerFeatures {
    features: Vec<HelloFeature>,
}

impl ServerFeatures {
    pub fn new(features: Vec<HelloFeature>) -> Self {
        Self { features }
    }

    pub fn supports(&self, feature: HelloFeature) -> bool {
        self.features.contains(&feature)
    }

    pub fn iter(&self) -> impl Iterator<Item = &HelloFeature> {
        self.features.iter()
    }
}
