//! In-process mock servers and config fixtures for tests
//!
//! `MockKvServer` speaks enough of the binary protocol for the handshake,
//! config fetches and basic document operations. `MockHttpServer` serves the
//! management config endpoints, including the streaming one.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU16, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde_json::json;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;

use crate::cluster::node::Endpoint;
use crate::config::ClusterOptions;
use crate::ops::{HelloFeature, OpCode, Status};
use crate::utils::frame::read_leb128;
use crate::utils::{Frame, FrameCodec};

pub const USERNAME: &str = "admin";
pub const PASSWORD: &str = "password";

fn nodes_ext(nodes: &[(&str, u16, u16)]) -> Vec<serde_json::Value> {
    nodes
        .iter()
        .map(|(host, kv, mgmt)| {
            json!({"hostname": host, "services": {"kv": kv, "mgmt": mgmt, "n1ql": 8093}})
        })
        .collect()
}

/// Partitioned bucket config; vbucket `i` lives on node `i % n` with one
/// replica on the next node when there is more than one
pub fn vbucket_config_json(
    rev: u64,
    name: &str,
    nodes: &[(&str, u16, u16)],
    num_vbuckets: usize,
) -> String {
    let n = nodes.len();
    let map: Vec<Vec<i32>> = (0..num_vbuckets)
        .map(|i| {
            if n > 1 {
                vec![(i % n) as i32, ((i + 1) % n) as i32]
            } else {
                vec![0, -1]
            }
        })
        .collect();
    let servers: Vec<String> = nodes
        .iter()
        .map(|(host, kv, _)| format!("{}:{}", host, kv))
        .collect();

    json!({
        "rev": rev,
        "name": name,
        "nodeLocator": "vbucket",
        "nodesExt": nodes_ext(nodes),
        "vBucketServerMap": {
            "hashAlgorithm": "CRC",
            "numReplicas": if n > 1 { 1 } else { 0 },
            "serverList": servers,
            "vBucketMap": map
        },
        "bucketCapabilities": ["collections", "xattr", "cccp"],
        "clusterCapabilities": {"n1ql": ["enhancedPreparedStatements"]}
    })
    .to_string()
}

/// Single-tier (memcached-style) bucket config
pub fn ketama_config_json(rev: u64, name: &str, nodes: &[(&str, u16, u16)]) -> String {
    json!({
        "rev": rev,
        "name": name,
        "nodeLocator": "ketama",
        "nodesExt": nodes_ext(nodes),
        "bucketCapabilities": []
    })
    .to_string()
}

/// Cluster-level config (no bucket)
pub fn cluster_config_json(rev: u64, nodes: &[(&str, u16, u16)]) -> String {
    json!({
        "rev": rev,
        "nodesExt": nodes_ext(nodes),
        "clusterCapabilities": {"n1ql": ["enhancedPreparedStatements"]}
    })
    .to_string()
}

/// Options pointing at mock servers with the mock credentials
pub fn options_for(seeds: &[Endpoint], mgmt_port: u16) -> ClusterOptions {
    ClusterOptions::new()
        .with_servers(seeds.iter().map(|e| e.to_string()))
        .with_credentials(USERNAME, PASSWORD)
        .with_ports(11210, mgmt_port)
        .with_connect_timeout(Duration::from_millis(500))
        .with_kv_timeout(Duration::from_secs(2))
        .with_config_polling(false, Duration::from_millis(100))
}

const ERROR_MAP_JSON: &str = r#"{
    "version": 2, "revision": 1,
    "errors": {
        "7": {"name": "NOT_MY_VBUCKET", "desc": "Not my vbucket", "attrs": ["fetch-config"]},
        "86": {"name": "ETMPFAIL", "desc": "Temporary failure", "attrs": ["temp", "retry-now"]}
    }
}"#;

const SUPPORTED_FEATURES: &[HelloFeature] = &[
    HelloFeature::Datatype,
    HelloFeature::TcpNoDelay,
    HelloFeature::MutationSeqno,
    HelloFeature::Xattr,
    HelloFeature::Xerror,
    HelloFeature::SelectBucket,
    HelloFeature::Json,
    HelloFeature::Collections,
];

/// How a mock bucket renders its config
#[derive(Debug, Clone)]
enum ConfigTemplate {
    VBucket { rev: u64, num_vbuckets: usize },
    Ketama { rev: u64 },
    Raw(String),
}

/// Bucket definition for [`MockKvServer::add_bucket`]
#[derive(Debug, Clone)]
pub struct MockBucket {
    template: ConfigTemplate,
    manifest: Option<String>,
}

impl MockBucket {
    /// Partitioned bucket hosted entirely on this server
    pub fn vbucket(rev: u64, num_vbuckets: usize) -> Self {
        Self {
            template: ConfigTemplate::VBucket { rev, num_vbuckets },
            manifest: None,
        }
    }

    /// Single-tier bucket hosted on this server
    pub fn ketama(rev: u64) -> Self {
        Self {
            template: ConfigTemplate::Ketama { rev },
            manifest: None,
        }
    }

    /// Serve an explicit config document
    pub fn raw(config: impl Into<String>) -> Self {
        Self {
            template: ConfigTemplate::Raw(config.into()),
            manifest: None,
        }
    }

    pub fn with_manifest(mut self, manifest: impl Into<String>) -> Self {
        self.manifest = Some(manifest.into());
        self
    }

    fn render(&self, name: &str, kv_port: u16, mgmt_port: u16) -> String {
        let node = [("$HOST", kv_port, mgmt_port)];
        match &self.template {
            ConfigTemplate::VBucket { rev, num_vbuckets } => {
                vbucket_config_json(*rev, name, &node, *num_vbuckets)
            }
            ConfigTemplate::Ketama { rev } => ketama_config_json(*rev, name, &node),
            ConfigTemplate::Raw(raw) => raw.clone(),
        }
    }
}

#[derive(Debug, Clone)]
struct MockDoc {
    value: Bytes,
    flags: u32,
    cas: u64,
}

#[derive(Debug, Default)]
struct BucketState {
    config: String,
    manifest: Option<String>,
    not_my_vbucket: Option<String>,
    docs: HashMap<Vec<u8>, MockDoc>,
}

struct MockState {
    buckets: Mutex<HashMap<String, BucketState>>,
    cluster_config: Mutex<Option<String>>,
    mgmt_port: AtomicU16,
    accepted: AtomicUsize,
    stall: AtomicBool,
    collections: AtomicBool,
    kv_config: AtomicBool,
    connections: Mutex<CancellationToken>,
    op_counts: Mutex<HashMap<u8, usize>>,
    next_cas: AtomicU64,
}

struct Session {
    authenticated: bool,
    bucket: Option<String>,
    collections: bool,
}

/// Mock data-service node on 127.0.0.1
pub struct MockKvServer {
    addr: SocketAddr,
    state: Arc<MockState>,
    shutdown: CancellationToken,
}

impl MockKvServer {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let state = Arc::new(MockState {
            buckets: Mutex::new(HashMap::new()),
            cluster_config: Mutex::new(None),
            mgmt_port: AtomicU16::new(8091),
            accepted: AtomicUsize::new(0),
            stall: AtomicBool::new(false),
            collections: AtomicBool::new(true),
            kv_config: AtomicBool::new(true),
            connections: Mutex::new(CancellationToken::new()),
            op_counts: Mutex::new(HashMap::new()),
            next_cas: AtomicU64::new(1000),
        });
        let shutdown = CancellationToken::new();

        let accept_state = state.clone();
        let accept_shutdown = shutdown.clone();
        tokio::spawn(async move {
            loop {
                let socket = tokio::select! {
                    _ = accept_shutdown.cancelled() => break,
                    accepted = listener.accept() => match accepted {
                        Ok((socket, _)) => socket,
                        Err(_) => break,
                    },
                };
                accept_state.accepted.fetch_add(1, Ordering::SeqCst);
                let conn_token = accept_state.connections.lock().child_token();
                tokio::spawn(serve_kv(
                    socket,
                    accept_state.clone(),
                    accept_shutdown.clone(),
                    conn_token,
                ));
            }
        });

        Self {
            addr,
            state,
            shutdown,
        }
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    pub fn endpoint(&self) -> Endpoint {
        Endpoint::new("127.0.0.1", self.addr.port())
    }

    /// Management port written into rendered configs
    pub fn set_mgmt_port(&self, port: u16) {
        self.state.mgmt_port.store(port, Ordering::SeqCst);
    }

    pub fn add_bucket(&self, name: &str, bucket: MockBucket) {
        let config = bucket.render(name, self.port(), self.state.mgmt_port.load(Ordering::SeqCst));
        self.state.buckets.lock().insert(
            name.to_string(),
            BucketState {
                config,
                manifest: bucket.manifest,
                ..BucketState::default()
            },
        );
    }

    pub fn set_bucket_config(&self, name: &str, config: impl Into<String>) {
        if let Some(bucket) = self.state.buckets.lock().get_mut(name) {
            bucket.config = config.into();
        }
    }

    /// Answer the next document operation on `bucket` with NotMyVBucket
    /// carrying `config`, which then becomes the bucket's config
    pub fn set_not_my_vbucket(&self, name: &str, config: impl Into<String>) {
        if let Some(bucket) = self.state.buckets.lock().get_mut(name) {
            bucket.not_my_vbucket = Some(config.into());
        }
    }

    pub fn set_cluster_config(&self, config: Option<String>) {
        *self.state.cluster_config.lock() = config;
    }

    /// Stop answering document operations (handshake still works)
    pub fn set_stall(&self, stall: bool) {
        self.state.stall.store(stall, Ordering::SeqCst);
    }

    pub fn set_collections(&self, enabled: bool) {
        self.state.collections.store(enabled, Ordering::SeqCst);
    }

    /// Answer GetClusterConfig with UnknownCommand, as servers without
    /// config-over-KV support do
    pub fn set_kv_config(&self, enabled: bool) {
        self.state.kv_config.store(enabled, Ordering::SeqCst);
    }

    /// Close every open client connection
    pub fn drop_connections(&self) {
        let mut current = self.state.connections.lock();
        current.cancel();
        *current = CancellationToken::new();
    }

    pub fn connections_accepted(&self) -> usize {
        self.state.accepted.load(Ordering::SeqCst)
    }

    pub fn op_count(&self, opcode: OpCode) -> usize {
        self.state
            .op_counts
            .lock()
            .get(&(opcode as u8))
            .copied()
            .unwrap_or(0)
    }

    pub fn stop(&self) {
        self.shutdown.cancel();
        self.drop_connections();
    }
}

impl Drop for MockKvServer {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn serve_kv(
    socket: TcpStream,
    state: Arc<MockState>,
    server: CancellationToken,
    conn: CancellationToken,
) {
    let mut framed = Framed::new(socket, FrameCodec);
    let mut session = Session {
        authenticated: false,
        bucket: None,
        collections: false,
    };
    loop {
        let request = tokio::select! {
            _ = server.cancelled() => break,
            _ = conn.cancelled() => break,
            next = framed.next() => match next {
                Some(Ok(frame)) => frame,
                _ => break,
            },
        };
        if let Some(response) = state.handle(&mut session, request) {
            if framed.send(response).await.is_err() {
                break;
            }
        }
    }
}

impl MockState {
    fn handle(&self, session: &mut Session, req: Frame) -> Option<Frame> {
        *self.op_counts.lock().entry(req.opcode).or_insert(0) += 1;
        let mut resp = Frame::response(req.opcode, Status::Success.code(), req.opaque);
        let fail = |mut resp: Frame, status: Status| {
            resp.vbucket_or_status = status.code();
            Some(resp)
        };

        let Some(opcode) = OpCode::from_u8(req.opcode) else {
            return fail(resp, Status::UnknownCommand);
        };

        match opcode {
            OpCode::Hello => {
                let collections = self.collections.load(Ordering::SeqCst);
                let mut accepted = Vec::new();
                for pair in req.value.chunks_exact(2) {
                    let code = u16::from_be_bytes([pair[0], pair[1]]);
                    let Some(feature) = HelloFeature::from_u16(code) else {
                        continue;
                    };
                    if !SUPPORTED_FEATURES.contains(&feature)
                        || (feature == HelloFeature::Collections && !collections)
                    {
                        continue;
                    }
                    if feature == HelloFeature::Collections {
                        session.collections = true;
                    }
                    accepted.extend_from_slice(&code.to_be_bytes());
                }
                resp.value = Bytes::from(accepted);
                Some(resp)
            }
            OpCode::GetErrorMap => {
                resp.value = Bytes::from_static(ERROR_MAP_JSON.as_bytes());
                Some(resp)
            }
            OpCode::SaslListMechs => {
                resp.value = Bytes::from_static(b"PLAIN");
                Some(resp)
            }
            OpCode::SaslAuth | OpCode::SaslStep => {
                let expected = format!("\0{}\0{}", USERNAME, PASSWORD);
                if &req.key[..] == b"PLAIN" && req.value[..] == *expected.as_bytes() {
                    session.authenticated = true;
                    Some(resp)
                } else {
                    fail(resp, Status::AuthError)
                }
            }
            OpCode::SelectBucket => {
                if !session.authenticated {
                    return fail(resp, Status::AccessDenied);
                }
                let name = String::from_utf8_lossy(&req.key).into_owned();
                if self.buckets.lock().contains_key(&name) {
                    session.bucket = Some(name);
                    Some(resp)
                } else {
                    fail(resp, Status::KeyNotFound)
                }
            }
            OpCode::GetClusterConfig => {
                if !self.kv_config.load(Ordering::SeqCst) {
                    return fail(resp, Status::UnknownCommand);
                }
                let config = match &session.bucket {
                    Some(b) => self.buckets.lock().get(b).map(|s| s.config.clone()),
                    None => self.cluster_config.lock().clone(),
                };
                match config {
                    Some(config) => {
                        resp.value = Bytes::from(config);
                        Some(resp)
                    }
                    None => fail(resp, Status::NoBucket),
                }
            }
            OpCode::GetCollectionsManifest => {
                let manifest = session
                    .bucket
                    .as_ref()
                    .and_then(|b| self.buckets.lock().get(b).and_then(|s| s.manifest.clone()));
                match manifest {
                    Some(m) => {
                        resp.value = Bytes::from(m);
                        Some(resp)
                    }
                    None => fail(resp, Status::UnknownCommand),
                }
            }
            OpCode::Noop => Some(resp),
            _ => self.handle_document(session, req, resp),
        }
    }

    fn handle_document(&self, session: &Session, req: Frame, mut resp: Frame) -> Option<Frame> {
        if self.stall.load(Ordering::SeqCst) {
            return None;
        }
        let status = |mut resp: Frame, status: Status| {
            resp.vbucket_or_status = status.code();
            Some(resp)
        };
        let Some(bucket_name) = session.bucket.clone() else {
            return status(resp, Status::NoBucket);
        };

        let key = if session.collections {
            // documents are namespaced by collection id
            match read_leb128(&req.key) {
                Some((cid, used)) => {
                    let mut key = cid.to_be_bytes().to_vec();
                    key.extend_from_slice(&req.key[used..]);
                    key
                }
                None => return status(resp, Status::InvalidArguments),
            }
        } else {
            req.key.to_vec()
        };

        let mut buckets = self.buckets.lock();
        let Some(bucket) = buckets.get_mut(&bucket_name) else {
            return status(resp, Status::NoBucket);
        };

        if let Some(config) = bucket.not_my_vbucket.take() {
            bucket.config = config.clone();
            resp.value = Bytes::from(config);
            return status(resp, Status::NotMyVBucket);
        }

        let cas_conflict = |doc: &MockDoc| req.cas != 0 && req.cas != doc.cas;
        let opcode = OpCode::from_u8(req.opcode)?;
        match opcode {
            OpCode::Get | OpCode::GetReplica | OpCode::GetAndTouch => match bucket.docs.get(&key) {
                Some(doc) => {
                    resp.extras = Bytes::copy_from_slice(&doc.flags.to_be_bytes());
                    resp.value = doc.value.clone();
                    resp.cas = doc.cas;
                    Some(resp)
                }
                None => status(resp, Status::KeyNotFound),
            },
            OpCode::Set | OpCode::Add | OpCode::Replace => {
                let existing = bucket.docs.get(&key);
                match (opcode, existing) {
                    (OpCode::Add, Some(_)) => return status(resp, Status::KeyExists),
                    (OpCode::Replace, None) => return status(resp, Status::KeyNotFound),
                    (_, Some(doc)) if cas_conflict(doc) => return status(resp, Status::KeyExists),
                    _ => {}
                }
                let flags = req
                    .extras
                    .get(..4)
                    .map(|b| u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
                    .unwrap_or(0);
                let cas = self.next_cas.fetch_add(1, Ordering::SeqCst);
                bucket.docs.insert(
                    key,
                    MockDoc {
                        value: req.value.clone(),
                        flags,
                        cas,
                    },
                );
                resp.cas = cas;
                Some(resp)
            }
            OpCode::Delete => match bucket.docs.get(&key) {
                None => status(resp, Status::KeyNotFound),
                Some(doc) if cas_conflict(doc) => status(resp, Status::KeyExists),
                Some(_) => {
                    bucket.docs.remove(&key);
                    resp.cas = self.next_cas.fetch_add(1, Ordering::SeqCst);
                    Some(resp)
                }
            },
            OpCode::Touch => match bucket.docs.get(&key) {
                Some(doc) => {
                    resp.cas = doc.cas;
                    Some(resp)
                }
                None => status(resp, Status::KeyNotFound),
            },
            _ => status(resp, Status::UnknownCommand),
        }
    }
}

/// Canned response for a management path
#[derive(Debug, Clone)]
pub enum HttpRoute {
    /// One JSON document
    Json(String),
    /// Newline-delimited documents, then the server closes the stream
    Stream(Vec<String>),
    /// Bare status code
    Status(u16),
}

/// Minimal HTTP/1.1 server for the management config endpoints
pub struct MockHttpServer {
    addr: SocketAddr,
    routes: Arc<Mutex<HashMap<String, HttpRoute>>>,
    hits: Arc<Mutex<HashMap<String, usize>>>,
    shutdown: CancellationToken,
}

impl MockHttpServer {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let routes: Arc<Mutex<HashMap<String, HttpRoute>>> = Arc::new(Mutex::new(HashMap::new()));
        let hits: Arc<Mutex<HashMap<String, usize>>> = Arc::new(Mutex::new(HashMap::new()));
        let shutdown = CancellationToken::new();

        let (r, h, s) = (routes.clone(), hits.clone(), shutdown.clone());
        tokio::spawn(async move {
            loop {
                let socket = tokio::select! {
                    _ = s.cancelled() => break,
                    accepted = listener.accept() => match accepted {
                        Ok((socket, _)) => socket,
                        Err(_) => break,
                    },
                };
                tokio::spawn(serve_http(socket, r.clone(), h.clone(), s.clone()));
            }
        });

        Self {
            addr,
            routes,
            hits,
            shutdown,
        }
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    pub fn endpoint(&self) -> Endpoint {
        Endpoint::new("127.0.0.1", self.addr.port())
    }

    pub fn set_route(&self, path: &str, route: HttpRoute) {
        self.routes.lock().insert(path.to_string(), route);
    }

    pub fn hits(&self, path: &str) -> usize {
        self.hits.lock().get(path).copied().unwrap_or(0)
    }
}

impl Drop for MockHttpServer {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

async fn serve_http(
    mut socket: TcpStream,
    routes: Arc<Mutex<HashMap<String, HttpRoute>>>,
    hits: Arc<Mutex<HashMap<String, usize>>>,
    shutdown: CancellationToken,
) {
    let mut request = Vec::new();
    let mut buf = [0u8; 1024];
    while !request.windows(4).any(|w| w == b"\r\n\r\n") {
        match socket.read(&mut buf).await {
            Ok(0) | Err(_) => return,
            Ok(n) => request.extend_from_slice(&buf[..n]),
        }
    }

    let head = String::from_utf8_lossy(&request);
    let path = head
        .lines()
        .next()
        .and_then(|line| line.split_whitespace().nth(1))
        .unwrap_or("/")
        .to_string();
    *hits.lock().entry(path.clone()).or_insert(0) += 1;
    let route = routes.lock().get(&path).cloned();

    match route {
        Some(HttpRoute::Json(body)) => {
            let response = format!(
                "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                body.len(),
                body
            );
            let _ = socket.write_all(response.as_bytes()).await;
        }
        Some(HttpRoute::Stream(docs)) => {
            let head = "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nConnection: close\r\n\r\n";
            if socket.write_all(head.as_bytes()).await.is_err() {
                return;
            }
            for doc in docs {
                let chunk = format!("{}\n\n\n\n", doc);
                if socket.write_all(chunk.as_bytes()).await.is_err() {
                    return;
                }
                let _ = socket.flush().await;
                tokio::select! {
                    _ = shutdown.cancelled() => return,
                    _ = tokio::time::sleep(Duration::from_millis(20)) => {}
                }
            }
        }
        Some(HttpRoute::Status(code)) => {
            let response = format!(
                "HTTP/1.1 {} Status\r\nContent-Length: 0\r\nConnection: close\r\n\r\n",
                code
            );
            let _ = socket.write_all(response.as_bytes()).await;
        }
        None => {
            let _ = socket
                .write_all(b"HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\nConnection: close\r\n\r\n")
                .await;
        }
    }
    let _ = socket.shutdown().await;
}
