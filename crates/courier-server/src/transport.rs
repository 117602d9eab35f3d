//! Quinn-based QUIC transport.
//!
//! Clients open one bidirectional stream for frames they send; the server
//! answers and pushes on a single unidirectional stream per connection so
//! everything a client receives arrives in order.
//!
//! TLS 1.3 comes from `rustls` with ALPN [`ALPN_PROTOCOL`]. Without a
//! certificate the transport generates a self-signed one, which is only
//! suitable for local testing.

use std::{net::SocketAddr, path::PathBuf, sync::Arc};

use courier_proto::ALPN_PROTOCOL;
use quinn::{Endpoint, RecvStream, SendStream, ServerConfig};

use crate::error::ServerError;

/// Where the server certificate comes from.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum TlsSource {
    /// PEM certificate chain and private key on disk
    Files {
        /// Certificate chain
        cert: PathBuf,
        /// Private key
        key: PathBuf,
    },
    /// Generate a throwaway certificate for `localhost`
    #[default]
    SelfSigned,
}

impl TlsSource {
    /// Files if both paths are given, otherwise self-signed.
    pub fn from_paths(cert: Option<PathBuf>, key: Option<PathBuf>) -> Self {
        match (cert, key) {
            (Some(cert), Some(key)) => Self::Files { cert, key },
            _ => Self::SelfSigned,
        }
    }
}

/// QUIC endpoint accepting client connections.
pub struct QuinnTransport {
    endpoint: Endpoint,
}

impl QuinnTransport {
    /// Bind a QUIC endpoint on `address`.
    pub fn bind(address: &str, tls: &TlsSource) -> Result<Self, ServerError> {
        let addr: SocketAddr = address
            .parse()
            .map_err(|e| ServerError::Config(format!("invalid bind address '{address}': {e}")))?;

        let server_config = match tls {
            TlsSource::Files { cert, key } => load_tls_config(cert, key)?,
            TlsSource::SelfSigned => generate_self_signed_config()?,
        };

        let endpoint = Endpoint::server(server_config, addr)
            .map_err(|e| ServerError::Transport(format!("failed to create endpoint: {e}")))?;

        tracing::info!(%addr, "QUIC transport bound");
        Ok(Self { endpoint })
    }

    /// Wait for the next connection. Returns `None` once the endpoint is
    /// closed.
    pub async fn accept(&self) -> Option<Result<QuinnConnection, ServerError>> {
        let incoming = self.endpoint.accept().await?;
        Some(
            incoming
                .await
                .map(|connection| QuinnConnection { connection })
                .map_err(|e| ServerError::Transport(format!("handshake failed: {e}"))),
        )
    }

    /// Local address the transport is bound to.
    pub fn local_addr(&self) -> Result<SocketAddr, ServerError> {
        self.endpoint
            .local_addr()
            .map_err(|e| ServerError::Transport(format!("failed to get local address: {e}")))
    }

    /// Stop accepting and close every connection.
    pub fn close(&self, reason: &str) {
        self.endpoint.close(0u32.into(), reason.as_bytes());
    }
}

/// An established client connection. Clones share the connection.
#[derive(Clone)]
pub struct QuinnConnection {
    connection: quinn::Connection,
}

impl QuinnConnection {
    /// Accept the next client-opened bidirectional stream.
    pub async fn accept_bi(&self) -> Result<(SendStream, RecvStream), ServerError> {
        self.connection
            .accept_bi()
            .await
            .map_err(|e| ServerError::Transport(format!("accept_bi failed: {e}")))
    }

    /// Open the server-to-client stream.
    pub async fn open_uni(&self) -> Result<SendStream, ServerError> {
        self.connection
            .open_uni()
            .await
            .map_err(|e| ServerError::Transport(format!("open_uni failed: {e}")))
    }

    /// Remote peer address.
    pub fn remote_addr(&self) -> SocketAddr {
        self.connection.remote_address()
    }

    /// Close with application error code 0.
    pub fn close(&self, reason: &str) {
        self.connection.close(0u32.into(), reason.as_bytes());
    }
}

fn load_tls_config(cert_path: &PathBuf, key_path: &PathBuf) -> Result<ServerConfig, ServerError> {
    let cert_pem = std::fs::read(cert_path).map_err(|e| {
        ServerError::Config(format!("failed to read cert '{}': {e}", cert_path.display()))
    })?;
    let key_pem = std::fs::read(key_path).map_err(|e| {
        ServerError::Config(format!("failed to read key '{}': {e}", key_path.display()))
    })?;

    let certs = rustls_pemfile::certs(&mut &cert_pem[..])
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| ServerError::Config(format!("failed to parse certificates: {e}")))?;
    let key = rustls_pemfile::private_key(&mut &key_pem[..])
        .map_err(|e| ServerError::Config(format!("failed to parse private key: {e}")))?
        .ok_or_else(|| ServerError::Config("no private key found".to_string()))?;

    quic_config(certs, key)
}

fn generate_self_signed_config() -> Result<ServerConfig, ServerError> {
    let cert = rcgen::generate_simple_self_signed(vec!["localhost".to_string()])
        .map_err(|e| ServerError::Config(format!("failed to generate self-signed cert: {e}")))?;
    let key = rustls::pki_types::PrivatePkcs8KeyDer::from(cert.key_pair.serialize_der());

    tracing::warn!("using a self-signed certificate, not for production use");
    quic_config(vec![cert.cert.der().clone()], key.into())
}

fn quic_config(
    certs: Vec<rustls::pki_types::CertificateDer<'static>>,
    key: rustls::pki_types::PrivateKeyDer<'static>,
) -> Result<ServerConfig, ServerError> {
    let mut tls_config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| ServerError::Config(format!("invalid TLS config: {e}")))?;
    tls_config.alpn_protocols = vec![ALPN_PROTOCOL.to_vec()];

    let crypto = quinn::crypto::rustls::QuicServerConfig::try_from(tls_config)
        .map_err(|e| ServerError::Config(format!("QUIC config error: {e}")))?;
    Ok(ServerConfig::with_crypto(Arc::new(crypto)))
}
