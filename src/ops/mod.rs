//! Binary protocol operations

pub mod error_map;
pub mod opcode;
pub mod operation;

pub use error_map::{ErrorCode, ErrorMap, ERROR_MAP_VERSION};
pub use opcode::{HelloFeature, OpCode, ServerFeatures, Status, REQUESTED_FEATURES};
pub use operation::{
    next_opaque, DataFormat, MutationToken, OpKind, Operation, OperationResponse, MAX_KEY_LEN,
};
