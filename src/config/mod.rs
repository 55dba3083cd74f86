//! Configuration module

pub mod cli;
pub mod client_config;
pub mod tls_config;

pub use cli::{CliArgs, Command, ConfigMode};
pub use client_config::ClusterOptions;
pub use tls_config::TlsConfig;
