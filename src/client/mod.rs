//! Client connection layer

pub mod cluster_node;
pub mod control_plane;
pub mod node_connection;
pub mod sasl;

pub use cluster_node::ClusterNode;
pub use control_plane::{ControlPlane, ControlPlaneExt};
pub use node_connection::{build_tls_config, ConnectionFactory, NodeConnection, TlsSettings};
pub use sasl::{Credentials, Mechanism};
