//! Server error map (GetErrorMap)
//!
//! The server describes every status code it may return, keyed by the code in
//! hex, with attributes that tell the client how to react.

use std::collections::HashMap;

use serde::Deserialize;

use crate::utils::ClusterError;

/// Error map version requested during the handshake
pub const ERROR_MAP_VERSION: u16 = 2;

/// One entry of the error map
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct ErrorCode {
    pub name: String,
    #[serde(default)]
    pub desc: String,
    #[serde(default)]
    pub attrs: Vec<String>,
}

impl ErrorCode {
    pub fn has_attr(&self, attr: &str) -> bool {
        self.attrs.iter().any(|a| a == attr)
    }

    /// The server wants the client to refresh its cluster map
    pub fn requires_config_refresh(&self) -> bool {
        self.has_attr("fetch-config")
    }

    /// The condition is transient and the operation may be retried
    pub fn is_temporary(&self) -> bool {
        self.has_attr("temp") || self.has_attr("retry-now") || self.has_attr("retry-later")
    }
}

#[derive(Debug, Deserialize)]
struct RawErrorMap {
    version: u16,
    revision: u32,
    #[serde(default)]
    errors: HashMap<String, ErrorCode>,
}

/// Parsed error map
#[derive(Debug, Clone, Default)]
pub struct ErrorMap {
    pub version: u16,
    pub revision: u32,
    errors: HashMap<u16, ErrorCode>,
}

impl ErrorMap {
    /// Parse the JSON body of a GetErrorMap response
    pub fn parse(body: &[u8]) -> Result<Self, ClusterError> {
        let raw: RawErrorMap = serde_json::from_slice(body)?;
        let mut errors = HashMap::with_capacity(raw.errors.len());
        for (code, entry) in raw.errors {
            let code = u16::from_str_radix(code.trim_start_matches("0x"), 16).map_err(|e| {
                ClusterError::ParseFailed(format!("invalid error map code {:?}: {}", code, e))
            })?;
            errors.insert(code, entry);
        }
        Ok(Self {
            version: raw.version,
            revision: raw.revision,
            errors,
        })
    }

    pub fn get(&self, status: u16) -> Option<&ErrorCode> {
        self.errors.get(&status)
    }

    pub fn len(&self) -> usize {
        self.errors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }
}
