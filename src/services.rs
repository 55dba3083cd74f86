//! Cluster services reachable over HTTP

use std::fmt;

/// HTTP services exposed by cluster nodes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ServiceType {
    Query,
    Search,
    Analytics,
    Views,
    Management,
}

impl ServiceType {
    pub const ALL: [ServiceType; 5] = [
        ServiceType::Query,
        ServiceType::Search,
        ServiceType::Analytics,
        ServiceType::Views,
        ServiceType::Management,
    ];

    /// Path appended to `scheme://host:port` for this service
    pub fn path(self) -> &'static str {
        match self {
            ServiceType::Query => "/query/service",
            ServiceType::Analytics => "/analytics/service",
            ServiceType::Search | ServiceType::Views => "/",
            ServiceType::Management => "/pools",
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            ServiceType::Query => "query",
            ServiceType::Search => "search",
            ServiceType::Analytics => "analytics",
            ServiceType::Views => "views",
            ServiceType::Management => "mgmt",
        }
    }
}

impl fmt::Display for ServiceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl std::str::FromStr for ServiceType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "query" | "n1ql" => Ok(ServiceType::Query),
            "search" | "fts" => Ok(ServiceType::Search),
            "analytics" | "cbas" => Ok(ServiceType::Analytics),
            "views" | "capi" => Ok(ServiceType::Views),
            "mgmt" | "management" => Ok(ServiceType::Management),
            other => Err(format!("unknown service '{}'", other)),
        }
    }
}
