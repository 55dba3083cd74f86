//! Pipelined connection to one data-service node
//!
//! Each connection splits its transport: writers share the framed write half
//! behind an async mutex, and a single reader task routes response frames to
//! waiting callers by opaque id. Responses may arrive out of order.

use std::collections::HashMap;
use std::fs::File;
use std::io::{self, BufReader};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use parking_lot::{Mutex, RwLock};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio::sync::oneshot;
use tokio_rustls::TlsConnector;
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::control_plane::{ControlPlane, ControlPlaneExt};
use super::sasl::Credentials;
use crate::cluster::node::Endpoint;
use crate::config::{ClusterOptions, TlsConfig};
use crate::ops::{
    ErrorMap, HelloFeature, Operation, OperationResponse, ServerFeatures, ERROR_MAP_VERSION,
    REQUESTED_FEATURES,
};
use crate::utils::{ConnectionError, Frame, FrameCodec, ProtocolError, Result};

/// Byte stream a connection runs over (plain TCP or TLS)
pub trait AsyncStream: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> AsyncStream for T {}

type BoxedStream = Box<dyn AsyncStream>;
type PendingMap = Mutex<HashMap<u32, oneshot::Sender<Frame>>>;

/// Removes a waiter's slot when its future completes or is dropped
struct PendingGuard<'a> {
    pending: &'a PendingMap,
    opaque: u32,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.pending.lock().remove(&self.opaque);
    }
}

/// One persistent transport to one node
pub struct NodeConnection {
    endpoint: Endpoint,
    use_tls: bool,
    writer: tokio::sync::Mutex<FramedWrite<WriteHalf<BoxedStream>, FrameCodec>>,
    pending: Arc<PendingMap>,
    dead: Arc<AtomicBool>,
    shutdown: CancellationToken,
    features: RwLock<ServerFeatures>,
    error_map: RwLock<Option<Arc<ErrorMap>>>,
    bucket: RwLock<Option<String>>,
    op_timeout: Duration,
}

impl NodeConnection {
    /// Wrap an established transport and start its reader task.
    /// No handshake is performed; see [`ConnectionFactory::connect`].
    pub fn from_stream(
        endpoint: Endpoint,
        stream: BoxedStream,
        use_tls: bool,
        op_timeout: Duration,
    ) -> Self {
        let (read_half, write_half) = tokio::io::split(stream);
        let pending: Arc<PendingMap> = Arc::new(Mutex::new(HashMap::new()));
        let dead = Arc::new(AtomicBool::new(false));
        let shutdown = CancellationToken::new();

        tokio::spawn(read_loop(
            FramedRead::new(read_half, FrameCodec),
            pending.clone(),
            dead.clone(),
            shutdown.clone(),
            endpoint.clone(),
        ));

        Self {
            endpoint,
            use_tls,
            writer: tokio::sync::Mutex::new(FramedWrite::new(write_half, FrameCodec)),
            pending,
            dead,
            shutdown,
            features: RwLock::new(ServerFeatures::default()),
            error_map: RwLock::new(None),
            bucket: RwLock::new(None),
            op_timeout,
        }
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub fn is_dead(&self) -> bool {
        self.dead.load(Ordering::SeqCst)
    }

    pub fn uses_tls(&self) -> bool {
        self.use_tls
    }

    pub fn features(&self) -> ServerFeatures {
        self.features.read().clone()
    }

    pub fn supports(&self, feature: HelloFeature) -> bool {
        self.features.read().supports(feature)
    }

    pub fn error_map(&self) -> Option<Arc<ErrorMap>> {
        self.error_map.read().clone()
    }

    /// Bucket selected on this connection, if any
    pub fn bucket(&self) -> Option<String> {
        self.bucket.read().clone()
    }

    /// Number of requests waiting for a response
    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }

    /// Select a bucket and remember it
    pub async fn select(&self, bucket: &str) -> Result<()> {
        self.select_bucket(bucket).await?;
        *self.bucket.write() = Some(bucket.to_string());
        Ok(())
    }

    /// Send a frame and wait for the response with the same opaque
    pub async fn dispatch(&self, frame: Frame) -> Result<Frame> {
        if self.is_dead() {
            return Err(ConnectionError::Closed.into());
        }

        let opaque = frame.opaque;
        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(opaque, tx);
        let _guard = PendingGuard {
            pending: &self.pending,
            opaque,
        };
        // the reader marks the connection dead before draining waiters, so a
        // slot inserted after the drain is caught here
        if self.is_dead() {
            return Err(ConnectionError::Closed.into());
        }

        {
            let mut writer = self.writer.lock().await;
            match writer.send(frame).await {
                Ok(()) => {}
                Err(ProtocolError::Io(io)) => {
                    self.mark_dead();
                    return Err(ConnectionError::Io(io).into());
                }
                // the codec rejected this frame before writing any of it
                Err(other) => return Err(other.into()),
            }
        }

        match tokio::time::timeout(self.op_timeout, rx).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) => Err(ConnectionError::Closed.into()),
            Err(_) => Err(ConnectionError::Timeout(self.op_timeout.as_millis() as u64).into()),
        }
    }

    fn mark_dead(&self) {
        if !self.dead.swap(true, Ordering::SeqCst) {
            debug!("Connection to {} marked dead", self.endpoint);
        }
        self.pending.lock().clear();
    }

    /// Close the transport; pending operations fail with `Closed`
    pub async fn close(&self) {
        self.shutdown.cancel();
        self.mark_dead();
        let mut writer = self.writer.lock().await;
        if let Err(e) = writer.get_mut().shutdown().await {
            debug!("Shutdown of {} failed: {}", self.endpoint, e);
        }
        debug!("Closed connection to {}", self.endpoint);
    }
}

impl Drop for NodeConnection {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

impl std::fmt::Debug for NodeConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeConnection")
            .field("endpoint", &self.endpoint)
            .field("dead", &self.is_dead())
            .field("bucket", &self.bucket())
            .finish()
    }
}

#[async_trait]
impl ControlPlane for NodeConnection {
    async fn execute(&self, op: &mut Operation) -> Result<OperationResponse> {
        let frame = op.to_frame(self.supports(HelloFeature::Collections))?;
        let response = self.dispatch(frame).await?;
        let error_map = self.error_map();
        Ok(op.complete(response, error_map.as_deref())?)
    }
}

async fn read_loop(
    mut reader: FramedRead<ReadHalf<BoxedStream>, FrameCodec>,
    pending: Arc<PendingMap>,
    dead: Arc<AtomicBool>,
    shutdown: CancellationToken,
    endpoint: Endpoint,
) {
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            next = reader.next() => match next {
                Some(Ok(frame)) => {
                    if !frame.magic.is_response() {
                        debug!("Ignoring server request opcode 0x{:02x} from {}", frame.opcode, endpoint);
                        continue;
                    }
                    let waiter = pending.lock().remove(&frame.opaque);
                    match waiter {
                        // the receiver may have timed out meanwhile
                        Some(tx) => { let _ = tx.send(frame); }
                        None => debug!("No waiter for opaque {} from {}", frame.opaque, endpoint),
                    }
                }
                Some(Err(e)) => {
                    warn!("Read from {} failed: {}", endpoint, e);
                    break;
                }
                None => {
                    debug!("Connection to {} closed by peer", endpoint);
                    break;
                }
            }
        }
    }

    dead.store(true, Ordering::SeqCst);
    pending.lock().clear();
}

/// Resolved TLS settings shared by every connection
#[derive(Clone)]
pub struct TlsSettings {
    pub client_config: Arc<rustls::ClientConfig>,
    pub sni: Option<String>,
}

/// Connection factory for creating connections with common config
#[derive(Clone)]
pub struct ConnectionFactory {
    pub connect_timeout: Duration,
    pub op_timeout: Duration,
    pub tls: Option<TlsSettings>,
    pub credentials: Credentials,
    pub user_agent: String,
}

impl ConnectionFactory {
    pub fn from_options(options: &ClusterOptions) -> Result<Self> {
        let tls = if options.use_ssl {
            Some(TlsSettings {
                client_config: build_tls_config(&options.tls)?,
                sni: options.tls.sni.clone(),
            })
        } else {
            None
        };

        Ok(Self {
            connect_timeout: options.connect_timeout(),
            op_timeout: options.kv_timeout(),
            tls,
            credentials: options.credentials(),
            user_agent: options.user_agent.clone(),
        })
    }

    pub fn uses_tls(&self) -> bool {
        self.tls.is_some()
    }

    /// Open a connection and run the handshake: HELLO, error map, SASL and,
    /// for bucket-scoped connections, bucket selection
    pub async fn connect(&self, endpoint: &Endpoint, bucket: Option<&str>) -> Result<Arc<NodeConnection>> {
        let stream = self.open_transport(endpoint).await?;
        let conn = Arc::new(NodeConnection::from_stream(
            endpoint.clone(),
            stream,
            self.uses_tls(),
            self.op_timeout,
        ));

        if let Err(e) = self.handshake(&conn, bucket).await {
            warn!("Handshake with {} failed: {}", endpoint, e);
            conn.close().await;
            return Err(e);
        }

        info!(
            "Connected to {}{}",
            endpoint,
            bucket.map(|b| format!(" (bucket {})", b)).unwrap_or_default()
        );
        Ok(conn)
    }

    async fn handshake(&self, conn: &NodeConnection, bucket: Option<&str>) -> Result<()> {
        let features = conn.hello(&self.user_agent, REQUESTED_FEATURES).await?;
        debug!(
            "{} accepted features {:?}",
            conn.endpoint(),
            features.iter().collect::<Vec<_>>()
        );
        *conn.features.write() = features;

        if conn.supports(HelloFeature::Xerror) {
            let map = conn.get_error_map(ERROR_MAP_VERSION).await?;
            *conn.error_map.write() = Some(Arc::new(map));
        }

        conn.authenticate(&self.credentials, self.uses_tls()).await?;

        if let Some(bucket) = bucket {
            conn.select(bucket).await?;
        }
        Ok(())
    }

    async fn open_transport(&self, endpoint: &Endpoint) -> std::result::Result<BoxedStream, ConnectionError> {
        let connect_failed = |source: io::Error| ConnectionError::ConnectFailed {
            host: endpoint.host.clone(),
            port: endpoint.port,
            source,
        };

        let tcp = tokio::time::timeout(
            self.connect_timeout,
            TcpStream::connect((endpoint.host.as_str(), endpoint.port)),
        )
        .await
        .map_err(|_| connect_failed(io::Error::new(io::ErrorKind::TimedOut, "connect timed out")))?
        .map_err(connect_failed)?;

        // Disable Nagle's algorithm
        tcp.set_nodelay(true).ok();

        let Some(tls) = &self.tls else {
            return Ok(Box::new(tcp));
        };

        let sni = tls.sni.clone().unwrap_or_else(|| endpoint.host.clone());
        let server_name = ServerName::try_from(sni)
            .map_err(|e| ConnectionError::TlsFailed(format!("invalid server name: {}", e)))?;
        let connector = TlsConnector::from(tls.client_config.clone());
        let stream = tokio::time::timeout(self.connect_timeout, connector.connect(server_name, tcp))
            .await
            .map_err(|_| ConnectionError::TlsFailed("TLS handshake timed out".to_string()))?
            .map_err(|e| ConnectionError::TlsFailed(format!("TLS handshake failed: {}", e)))?;
        Ok(Box::new(stream))
    }
}

/// Build the rustls client config for KV connections
pub fn build_tls_config(tls: &TlsConfig) -> std::result::Result<Arc<rustls::ClientConfig>, ConnectionError> {
    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let builder = rustls::ClientConfig::builder_with_provider(provider.clone())
        .with_safe_default_protocol_versions()
        .map_err(|e| ConnectionError::TlsFailed(format!("Failed to build TLS config: {}", e)))?;

    let builder = if tls.skip_verify {
        warn!("TLS certificate verification disabled - INSECURE");
        builder
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(SkipServerVerification(provider)))
    } else {
        let mut roots = rustls::RootCertStore::empty();
        if let Some(ref ca_path) = tls.ca_cert {
            let ca_file = File::open(ca_path).map_err(|e| {
                ConnectionError::TlsFailed(format!("Failed to read CA cert {:?}: {}", ca_path, e))
            })?;
            let certs = rustls_pemfile::certs(&mut BufReader::new(ca_file))
                .collect::<std::result::Result<Vec<_>, _>>()
                .map_err(|e| ConnectionError::TlsFailed(format!("Invalid CA cert: {}", e)))?;
            for cert in certs {
                roots
                    .add(cert)
                    .map_err(|e| ConnectionError::TlsFailed(format!("Invalid CA cert: {}", e)))?;
            }
        } else {
            for cert in rustls_native_certs::load_native_certs().certs {
                let _ = roots.add(cert);
            }
        }
        builder.with_root_certificates(roots)
    };

    let config = match (&tls.client_cert, &tls.client_key) {
        (Some(cert_path), Some(key_path)) => {
            let cert_file = File::open(cert_path).map_err(|e| {
                ConnectionError::TlsFailed(format!("Failed to read client cert: {}", e))
            })?;
            let certs = rustls_pemfile::certs(&mut BufReader::new(cert_file))
                .collect::<std::result::Result<Vec<_>, _>>()
                .map_err(|e| ConnectionError::TlsFailed(format!("Invalid client cert: {}", e)))?;
            let key_file = File::open(key_path).map_err(|e| {
                ConnectionError::TlsFailed(format!("Failed to read client key: {}", e))
            })?;
            let key = rustls_pemfile::private_key(&mut BufReader::new(key_file))
                .map_err(|e| ConnectionError::TlsFailed(format!("Invalid client key: {}", e)))?
                .ok_or_else(|| ConnectionError::TlsFailed(format!("No private key in {:?}", key_path)))?;
            builder
                .with_client_auth_cert(certs, key)
                .map_err(|e| ConnectionError::TlsFailed(format!("Invalid client identity: {}", e)))?
        }
        _ => builder.with_no_client_auth(),
    };

    Ok(Arc::new(config))
}

/// Certificate verifier that accepts any server certificate (INSECURE)
#[derive(Debug)]
struct SkipServerVerification(Arc<rustls::crypto::CryptoProvider>);

impl rustls::client::danger::ServerCertVerifier for SkipServerVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> std::result::Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(message, cert, dss, &self.0.signature_verification_algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(message, cert, dss, &self.0.signature_verification_algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        self.0.signature_verification_algorithms.supported_schemes()
    }
}
