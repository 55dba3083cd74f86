//! Node descriptors and endpoints

use std::fmt;

use serde::Deserialize;

use crate::services::ServiceType;

/// A `host:port` pair identifying one KV (or HTTP) listener
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Parse `host:port`, `[v6]:port` or a bare host (which gets `default_port`)
    pub fn parse(s: &str, default_port: u16) -> Option<Self> {
        let s = s.trim();
        if s.is_empty() {
            return None;
        }

        if let Some(rest) = s.strip_prefix('[') {
            let (host, tail) = rest.split_once(']')?;
            let port = match tail.strip_prefix(':') {
                Some(p) => p.parse().ok()?,
                None if tail.is_empty() => default_port,
                None => return None,
            };
            return Some(Self::new(host, port));
        }

        // more than one colon without brackets is a bare IPv6 address
        if s.matches(':').count() > 1 {
            return Some(Self::new(s, default_port));
        }

        match s.rsplit_once(':') {
            Some((host, port)) => Some(Self::new(host, port.parse().ok()?)),
            None => Some(Self::new(s, default_port)),
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

/// Per-service ports advertised in `nodesExt[].services`
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Deserialize)]
pub struct ServicePorts {
    #[serde(default)]
    pub kv: Option<u16>,
    #[serde(default, rename = "kvSSL")]
    pub kv_tls: Option<u16>,
    #[serde(default)]
    pub mgmt: Option<u16>,
    #[serde(default, rename = "mgmtSSL")]
    pub mgmt_tls: Option<u16>,
    #[serde(default, rename = "capi")]
    pub views: Option<u16>,
    #[serde(default, rename = "capiSSL")]
    pub views_tls: Option<u16>,
    #[serde(default, rename = "n1ql")]
    pub query: Option<u16>,
    #[serde(default, rename = "n1qlSSL")]
    pub query_tls: Option<u16>,
    #[serde(default, rename = "fts")]
    pub search: Option<u16>,
    #[serde(default, rename = "ftsSSL")]
    pub search_tls: Option<u16>,
    #[serde(default, rename = "cbas")]
    pub analytics: Option<u16>,
    #[serde(default, rename = "cbasSSL")]
    pub analytics_tls: Option<u16>,
}

/// Raw `nodesExt` entry
#[derive(Debug, Clone, Deserialize)]
pub(crate) struct RawNodeExt {
    #[serde(default)]
    pub hostname: Option<String>,
    #[serde(default)]
    pub services: ServicePorts,
}

/// Raw legacy `nodes` entry
#[derive(Debug, Clone, Deserialize)]
pub(crate) struct RawNode {
    #[serde(default)]
    pub hostname: String,
    #[serde(default, rename = "couchApiBase")]
    pub couch_api_base: Option<String>,
    #[serde(default)]
    pub ports: RawNodePorts,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub(crate) struct RawNodePorts {
    #[serde(default)]
    pub direct: Option<u16>,
}

/// Immutable description of one cluster node and the services it runs
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct NodeAdapter {
    pub hostname: String,
    pub ports: ServicePorts,
}

impl NodeAdapter {
    pub fn new(hostname: impl Into<String>, ports: ServicePorts) -> Self {
        Self {
            hostname: hostname.into(),
            ports,
        }
    }

    pub(crate) fn from_ext(raw: &RawNodeExt, source_host: &str) -> Self {
        let hostname = match raw.hostname.as_deref() {
            Some(h) if !h.is_empty() => h.trim_start_matches('[').trim_end_matches(']').to_string(),
            _ => source_host.to_string(),
        };
        Self::new(hostname, raw.services.clone())
    }

    /// Build from a legacy `nodes` entry (`hostname` is `host:mgmtport`)
    pub(crate) fn from_legacy(raw: &RawNode) -> Option<Self> {
        let mgmt = Endpoint::parse(&raw.hostname, 8091)?;
        let views = raw
            .couch_api_base
            .as_deref()
            .and_then(|base| base.split("://").nth(1))
            .and_then(|rest| rest.split('/').next())
            .and_then(|hp| Endpoint::parse(hp, 8092))
            .map(|e| e.port);

        Some(Self::new(
            mgmt.host,
            ServicePorts {
                kv: raw.ports.direct,
                mgmt: Some(mgmt.port),
                views,
                ..ServicePorts::default()
            },
        ))
    }

    /// Node runs the data (KV) service
    pub fn is_data_node(&self) -> bool {
        self.ports.kv.is_some() || self.ports.kv_tls.is_some()
    }

    pub fn kv_endpoint(&self, use_tls: bool) -> Option<Endpoint> {
        let port = if use_tls { self.ports.kv_tls } else { self.ports.kv };
        port.map(|p| Endpoint::new(self.hostname.clone(), p))
    }

    pub fn mgmt_endpoint(&self, use_tls: bool) -> Option<Endpoint> {
        let port = if use_tls {
            self.ports.mgmt_tls
        } else {
            self.ports.mgmt
        };
        port.map(|p| Endpoint::new(self.hostname.clone(), p))
    }

    pub fn service_port(&self, service: ServiceType, use_tls: bool) -> Option<u16> {
        let p = &self.ports;
        match (service, use_tls) {
            (ServiceType::Query, false) => p.query,
            (ServiceType::Query, true) => p.query_tls,
            (ServiceType::Search, false) => p.search,
            (ServiceType::Search, true) => p.search_tls,
            (ServiceType::Analytics, false) => p.analytics,
            (ServiceType::Analytics, true) => p.analytics_tls,
            (ServiceType::Views, false) => p.views,
            (ServiceType::Views, true) => p.views_tls,
            (ServiceType::Management, false) => p.mgmt,
            (ServiceType::Management, true) => p.mgmt_tls,
        }
    }

    pub fn has_service(&self, service: ServiceType) -> bool {
        self.service_port(service, false).is_some() || self.service_port(service, true).is_some()
    }

    /// `scheme://host:port/path` for a service this node runs
    pub fn service_uri(&self, service: ServiceType, use_tls: bool) -> Option<String> {
        let port = self.service_port(service, use_tls)?;
        let scheme = if use_tls { "https" } else { "http" };
        let endpoint = Endpoint::new(self.hostname.clone(), port);
        Some(format!("{}://{}{}", scheme, endpoint, service.path()))
    }
}
