//! Utility modules

pub mod error;
pub mod frame;

pub use error::{ClientError, ClusterError, ConnectionError, KvError, ProtocolError, Result};
pub use frame::{datatype, Frame, FrameCodec, Magic, HEADER_LEN};
