use careledger_common::{protocol, NetworkAddress};
use quinn::Endpoint as QuinnEndpoint;
use rustls::crypto::CryptoProvider;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

/// Name every node puts in its self-signed certificate
const SERVER_NAME: &str = "careledger.local";

const IDLE_TIMEOUT: Duration = Duration::from_secs(60);
const KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(5);
const MAX_BIDI_STREAMS: u32 = 256;

/// QUIC endpoint that both listens for peers and dials out to them
pub struct Endpoint {
    inner: QuinnEndpoint,
    local_addr: SocketAddr,
    connect_timeout: Duration,
}

impl Endpoint {
    /// Bind an endpoint with a fresh self-signed certificate
    pub async fn new(config: EndpointConfig) -> Result<Self, EndpointError> {
        let provider = Arc::new(rustls::crypto::ring::default_provider());
        let server_config = Self::server_config(provider.clone())?;
        let client_config = Self::client_config(provider)?;

        let mut endpoint = QuinnEndpoint::server(server_config, config.bind_addr)
            .map_err(|e| EndpointError::BindFailed(format!("{}: {}", config.bind_addr, e)))?;
        endpoint.set_default_client_config(client_config);

        let local_addr = endpoint.local_addr()?;

        Ok(Self {
            inner: endpoint,
            local_addr,
            connect_timeout: config.connect_timeout,
        })
    }

    fn transport_config() -> Result<quinn::TransportConfig, EndpointError> {
        let idle = quinn::IdleTimeout::try_from(IDLE_TIMEOUT)
            .map_err(|e| EndpointError::ConfigCreation(format!("idle timeout: {}", e)))?;

        let mut transport = quinn::TransportConfig::default();
        transport.max_idle_timeout(Some(idle));
        transport.keep_alive_interval(Some(KEEP_ALIVE_INTERVAL));
        transport.max_concurrent_bidi_streams(MAX_BIDI_STREAMS.into());
        // Every message rides a bidirectional stream
        transport.max_concurrent_uni_streams(0u32.into());
        Ok(transport)
    }

    fn server_config(provider: Arc<CryptoProvider>) -> Result<quinn::ServerConfig, EndpointError> {
        let cert = rcgen::generate_simple_self_signed(vec![SERVER_NAME.to_string()])
            .map_err(|e| EndpointError::CertGeneration(e.to_string()))?;

        let cert_chain = vec![rustls::pki_types::CertificateDer::from(cert.cert.der().to_vec())];
        let key = rustls::pki_types::PrivateKeyDer::try_from(cert.key_pair.serialize_der())
            .map_err(|e| EndpointError::CertGeneration(format!("invalid key: {}", e)))?;

        let crypto = rustls::ServerConfig::builder_with_provider(provider)
            .with_safe_default_protocol_versions()
            .map_err(|e| EndpointError::ConfigCreation(e.to_string()))?
            .with_no_client_auth()
            .with_single_cert(cert_chain, key)
            .map_err(|e| EndpointError::ConfigCreation(e.to_string()))?;

        let quic_crypto = quinn::crypto::rustls::QuicServerConfig::try_from(crypto)
            .map_err(|e| EndpointError::ConfigCreation(e.to_string()))?;

        let mut server_config = quinn::ServerConfig::with_crypto(Arc::new(quic_crypto));
        server_config.transport_config(Arc::new(Self::transport_config()?));
        Ok(server_config)
    }

    fn client_config(provider: Arc<CryptoProvider>) -> Result<quinn::ClientConfig, EndpointError> {
        let verifier = Arc::new(AcceptAnyServerCert(provider.clone()));

        let crypto = rustls::ClientConfig::builder_with_provider(provider)
            .with_safe_default_protocol_versions()
            .map_err(|e| EndpointError::ConfigCreation(e.to_string()))?
            .dangerous()
            .with_custom_certificate_verifier(verifier)
            .with_no_client_auth();

        let quic_crypto = quinn::crypto::rustls::QuicClientConfig::try_from(crypto)
            .map_err(|e| EndpointError::ConfigCreation(e.to_string()))?;

        let mut client_config = quinn::ClientConfig::new(Arc::new(quic_crypto));
        client_config.transport_config(Arc::new(Self::transport_config()?));
        Ok(client_config)
    }

    /// Dial a peer, giving up after the configured connect timeout
    pub async fn connect(&self, addr: SocketAddr) -> Result<super::Connection, EndpointError> {
        let connecting = self
            .inner
            .connect(addr, SERVER_NAME)
            .map_err(|e| EndpointError::ConnectionFailed(e.to_string()))?;

        let connection = tokio::time::timeout(self.connect_timeout, connecting)
            .await
            .map_err(|_| EndpointError::Timeout(addr))?
            .map_err(|e| EndpointError::ConnectionFailed(e.to_string()))?;

        Ok(super::Connection::new(connection))
    }

    /// Resolve a configured peer address and dial the first socket address it yields
    pub async fn connect_to(&self, addr: &NetworkAddress) -> Result<super::Connection, EndpointError> {
        let socket_addr = match addr {
            NetworkAddress::Socket(socket_addr) => *socket_addr,
            NetworkAddress::Domain { host, port } => tokio::net::lookup_host((host.as_str(), *port))
                .await?
                .next()
                .ok_or_else(|| EndpointError::Unresolved(addr.to_string()))?,
        };

        self.connect(socket_addr).await
    }

    /// Wait for the next inbound connection
    pub async fn accept(&self) -> Result<super::Connection, EndpointError> {
        let incoming = self.inner.accept().await.ok_or(EndpointError::Closed)?;

        let connection = incoming
            .await
            .map_err(|e| EndpointError::ConnectionFailed(e.to_string()))?;

        Ok(super::Connection::new(connection))
    }

    /// Local address, with an unspecified IP replaced by loopback
    pub fn local_addr(&self) -> SocketAddr {
        let mut addr = self.local_addr;
        if addr.ip().is_unspecified() {
            addr.set_ip(std::net::IpAddr::V4(std::net::Ipv4Addr::LOCALHOST));
        }
        addr
    }

    pub fn close(&self) {
        self.inner.close(0u32.into(), b"shutdown");
    }
}

/// Endpoint configuration
#[derive(Debug, Clone)]
pub struct EndpointConfig {
    pub bind_addr: SocketAddr,
    pub connect_timeout: Duration,
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 0)),
            connect_timeout: Duration::from_secs(protocol::CONNECTION_TIMEOUT_SECS),
        }
    }
}

impl EndpointConfig {
    pub fn with_bind_addr(bind_addr: SocketAddr) -> Self {
        Self {
            bind_addr,
            ..Self::default()
        }
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }
}

/// Nodes have no identities to pin, so any server certificate is accepted.
/// Handshake signatures are still checked with the provider's algorithms.
#[derive(Debug)]
struct AcceptAnyServerCert(Arc<CryptoProvider>);

impl rustls::client::danger::ServerCertVerifier for AcceptAnyServerCert {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::pki_types::CertificateDer<'_>,
        _intermediates: &[rustls::pki_types::CertificateDer<'_>],
        _server_name: &rustls::pki_types::ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &rustls::pki_types::CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &self.0.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &rustls::pki_types::CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.0.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        self.0.signature_verification_algorithms.supported_schemes()
    }
}

/// Endpoint errors
#[derive(Debug, thiserror::Error)]
pub enum EndpointError {
    #[error("Failed to bind to address: {0}")]
    BindFailed(String),

    #[error("Failed to generate certificate: {0}")]
    CertGeneration(String),

    #[error("Failed to create config: {0}")]
    ConfigCreation(String),

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Timed out connecting to {0}")]
    Timeout(SocketAddr),

    #[error("Could not resolve {0}")]
    Unresolved(String),

    #[error("Endpoint is closed")]
    Closed,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
