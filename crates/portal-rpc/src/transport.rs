// ABOUTME: Byte-stream transport construction for plain TCP and TLS endpoints.
// ABOUTME: Connects eagerly with keepalive and buffering; never retries on its own.

use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme};
use tokio::io::{AsyncRead, AsyncWrite, BufStream};
use tokio::net::{TcpSocket, TcpStream};
use tokio_rustls::TlsConnector;

use crate::config::ConnectionConfig;
use crate::endpoint::Endpoint;
use crate::error::TransportError;

/// Any bidirectional async byte stream a transport can run over.
pub trait AsyncStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> AsyncStream for T {}

/// A connected, buffered byte stream to one endpoint.
pub struct Transport {
    stream: BufStream<Box<dyn AsyncStream>>,
    peer: String,
}

impl Transport {
    /// Wrap an already connected stream.
    pub fn from_stream<S>(stream: S, peer: impl Into<String>) -> Self
    where
        S: AsyncStream + 'static,
    {
        Self {
            stream: BufStream::new(Box::new(stream)),
            peer: peer.into(),
        }
    }

    /// Description of the remote side, for logging.
    pub fn peer(&self) -> &str {
        &self.peer
    }

    pub(crate) fn stream_mut(&mut self) -> &mut BufStream<Box<dyn AsyncStream>> {
        &mut self.stream
    }
}

impl fmt::Debug for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transport").field("peer", &self.peer).finish()
    }
}

/// Builds transports for endpoints.
#[async_trait]
pub trait TransportFactory: Send + Sync {
    /// Open a transport, returning only once the socket (and TLS) handshake
    /// has completed.
    async fn create(
        &self,
        endpoint: &Endpoint,
        config: &ConnectionConfig,
    ) -> Result<Transport, TransportError>;
}

/// The parts of a [`ConnectionConfig`] that shape a TLS client config.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct TrustSettings {
    verify: bool,
    ca_bundle: Option<PathBuf>,
}

impl From<&ConnectionConfig> for TrustSettings {
    fn from(config: &ConnectionConfig) -> Self {
        Self {
            verify: config.tls_verify,
            ca_bundle: config.tls_ca_bundle.clone(),
        }
    }
}

/// Production factory over TCP sockets, optionally wrapped in TLS.
///
/// TLS client configs are built once per distinct trust setting and shared
/// by every clone of the factory.
#[derive(Debug, Clone, Default)]
pub struct TcpTransportFactory {
    tls_configs: Arc<Mutex<HashMap<TrustSettings, Arc<ClientConfig>>>>,
}

impl TcpTransportFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cached TLS client config for `config`, building it on first use.
    async fn client_config(
        &self,
        config: &ConnectionConfig,
    ) -> Result<Arc<ClientConfig>, TransportError> {
        let settings = TrustSettings::from(config);
        let cached = self
            .tls_configs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&settings)
            .cloned();
        if let Some(client) = cached {
            return Ok(client);
        }

        let built = tls_client_config(config).await?;
        let mut configs = self
            .tls_configs
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        Ok(configs.entry(settings).or_insert(built).clone())
    }

    async fn connect(
        &self,
        endpoint: &Endpoint,
        config: &ConnectionConfig,
    ) -> Result<Transport, TransportError> {
        let tcp = connect_tcp(endpoint).await?;
        if !endpoint.secure {
            return Ok(Transport::from_stream(tcp, endpoint.to_string()));
        }

        if !config.tls_verify {
            tracing::warn!(
                endpoint = %endpoint,
                "TLS certificate verification is DISABLED for this endpoint"
            );
        }
        let client_config = self.client_config(config).await?;
        let tls = connect_tls(endpoint, client_config, tcp).await?;
        Ok(Transport::from_stream(tls, endpoint.to_string()))
    }
}

#[async_trait]
impl TransportFactory for TcpTransportFactory {
    async fn create(
        &self,
        endpoint: &Endpoint,
        config: &ConnectionConfig,
    ) -> Result<Transport, TransportError> {
        let connect = self.connect(endpoint, config);
        let transport = tokio::time::timeout(config.connect_timeout, connect)
            .await
            .map_err(|_| TransportError::Timeout {
                op: "connect",
                after: config.connect_timeout,
            })??;

        tracing::debug!(
            endpoint = %endpoint,
            use_tls = endpoint.secure,
            "transport connected"
        );

        Ok(transport)
    }
}

async fn connect_tcp(endpoint: &Endpoint) -> Result<TcpStream, TransportError> {
    let authority = endpoint.authority();
    let addrs: Vec<SocketAddr> = tokio::net::lookup_host(&authority)
        .await
        .map_err(|e| TransportError::Resolve {
            addr: authority.clone(),
            reason: e.to_string(),
        })?
        .collect();

    if addrs.is_empty() {
        return Err(TransportError::Resolve {
            addr: authority,
            reason: "no addresses returned".into(),
        });
    }

    // Try each resolved address until one accepts.
    let mut last_err = None;
    for addr in addrs {
        match connect_addr(addr).await {
            Ok(stream) => return Ok(stream),
            Err(e) => {
                tracing::trace!(%addr, error = %e, "address refused connection");
                last_err = Some(e);
            }
        }
    }

    Err(TransportError::Connect {
        addr: authority,
        source: last_err
            .unwrap_or_else(|| std::io::Error::other("no address accepted the connection")),
    })
}

async fn connect_addr(addr: SocketAddr) -> std::io::Result<TcpStream> {
    let socket = if addr.is_ipv4() {
        TcpSocket::new_v4()?
    } else {
        TcpSocket::new_v6()?
    };
    socket.set_keepalive(true)?;
    let stream = socket.connect(addr).await?;
    stream.set_nodelay(true)?;
    Ok(stream)
}

async fn connect_tls(
    endpoint: &Endpoint,
    client_config: Arc<ClientConfig>,
    tcp: TcpStream,
) -> Result<tokio_rustls::client::TlsStream<TcpStream>, TransportError> {
    let server_name = ServerName::try_from(endpoint.host.clone())
        .map_err(|_| TransportError::Tls(format!("invalid server name '{}'", endpoint.host)))?;

    TlsConnector::from(client_config)
        .connect(server_name, tcp)
        .await
        .map_err(|e| TransportError::Tls(format!("handshake with {} failed: {}", endpoint, e)))
}

fn crypto_provider() -> Arc<CryptoProvider> {
    Arc::new(rustls::crypto::ring::default_provider())
}

/// Build the rustls client configuration for a connection config.
///
/// Verification uses the CA bundle when one is set, otherwise the operating
/// system's trust store.
pub async fn tls_client_config(
    config: &ConnectionConfig,
) -> Result<Arc<ClientConfig>, TransportError> {
    let provider = crypto_provider();
    let builder = ClientConfig::builder_with_provider(provider.clone())
        .with_safe_default_protocol_versions()
        .map_err(|e| TransportError::Tls(e.to_string()))?;

    if !config.tls_verify {
        let client = builder
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(NoVerifier { provider }))
            .with_no_client_auth();
        return Ok(Arc::new(client));
    }

    let roots = match &config.tls_ca_bundle {
        Some(path) => load_ca_bundle(path).await?,
        None => load_system_roots().await?,
    };

    let client = builder.with_root_certificates(roots).with_no_client_auth();
    Ok(Arc::new(client))
}

/// Load trusted roots from a PEM file.
pub async fn load_ca_bundle(path: &Path) -> Result<RootCertStore, TransportError> {
    let bundle_err = |reason: String| TransportError::CaBundle {
        path: path.display().to_string(),
        reason,
    };

    let pem = tokio::fs::read(path)
        .await
        .map_err(|e| bundle_err(e.to_string()))?;
    let mut roots = RootCertStore::empty();
    for cert in rustls_pemfile::certs(&mut &pem[..]) {
        let cert = cert.map_err(|e| bundle_err(e.to_string()))?;
        roots.add(cert).map_err(|e| bundle_err(e.to_string()))?;
    }

    if roots.is_empty() {
        return Err(bundle_err("no certificates found".into()));
    }
    Ok(roots)
}

/// Load the operating system's trusted roots.
async fn load_system_roots() -> Result<RootCertStore, TransportError> {
    let loaded = tokio::task::spawn_blocking(rustls_native_certs::load_native_certs)
        .await
        .map_err(|e| TransportError::Tls(format!("loading system roots: {}", e)))?;
    for err in &loaded.errors {
        tracing::debug!(error = %err, "skipping unreadable system certificate source");
    }

    let mut roots = RootCertStore::empty();
    let (added, ignored) = roots.add_parsable_certificates(loaded.certs);
    if ignored > 0 {
        tracing::debug!(added, ignored, "ignored unparsable system root certificates");
    }
    if roots.is_empty() {
        return Err(TransportError::Tls(
            "no trusted root certificates found in the system store".into(),
        ));
    }
    Ok(roots)
}

/// Accepts any server certificate. Used only when `tls_verify` is off.
#[derive(Debug)]
struct NoVerifier {
    provider: Arc<CryptoProvider>,
}

impl ServerCertVerifier for NoVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}
