//! PostgreSQL Connection
//!
//! Opens the socket (TCP, TLS or Unix), runs the startup handshake and then
//! serves as the `MessageChannel` for everything that follows.

use std::fmt;
use std::sync::Arc;

use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tokio_rustls::client::TlsStream;
use tokio_rustls::rustls::pki_types::{CertificateDer, ServerName};
use tokio_rustls::rustls::{ClientConfig, RootCertStore};
use tracing::{debug, info};

use super::startup::{AuthOutcome, authenticate};
use super::stream::PgStream;
use super::{PgError, PgResult};
use crate::protocol::{FrontendMessage, SaslHelper, ScramSha256};

/// Initial read buffer capacity
pub(crate) const BUFFER_CAPACITY: usize = 16 * 1024;

/// TLS settings. Without a CA the platform root store is used; a client
/// certificate is presented only when both cert and key are set.
#[derive(Clone, Default)]
pub struct TlsConfig {
    /// CA certificate(s) for server verification, PEM
    pub ca_cert_pem: Option<Vec<u8>>,
    /// Client certificate chain, PEM
    pub client_cert_pem: Option<Vec<u8>>,
    /// Client private key, PEM
    pub client_key_pem: Option<Vec<u8>>,
}

impl TlsConfig {
    /// Load PEM material from files; `None` paths stay unset.
    pub fn from_files(
        ca_path: Option<impl AsRef<std::path::Path>>,
        cert_path: Option<impl AsRef<std::path::Path>>,
        key_path: Option<impl AsRef<std::path::Path>>,
    ) -> std::io::Result<Self> {
        Ok(Self {
            ca_cert_pem: ca_path.map(std::fs::read).transpose()?,
            client_cert_pem: cert_path.map(std::fs::read).transpose()?,
            client_key_pem: key_path.map(std::fs::read).transpose()?,
        })
    }
}

/// Where and as whom to connect. Input to the startup handshake.
#[derive(Clone)]
pub struct ConnectionOptions {
    /// Hostname, or a Unix socket directory when it starts with `/`
    pub host: String,
    pub port: u16,
    pub user: String,
    pub database: String,
    pub password: Option<String>,
    pub tls: Option<TlsConfig>,
}

impl ConnectionOptions {
    pub fn new(host: &str, port: u16, user: &str, database: &str) -> Self {
        Self {
            host: host.to_string(),
            port,
            user: user.to_string(),
            database: database.to_string(),
            password: None,
            tls: None,
        }
    }

    pub fn password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }

    pub fn tls(mut self, config: TlsConfig) -> Self {
        self.tls = Some(config);
        self
    }

    fn is_unix_socket(&self) -> bool {
        self.host.starts_with('/')
    }
}

impl fmt::Debug for ConnectionOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionOptions")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("user", &self.user)
            .field("database", &self.database)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("tls", &self.tls.is_some())
            .finish()
    }
}

/// An authenticated PostgreSQL connection.
pub struct PgConnection {
    pub(crate) stream: PgStream,
    pub(crate) buffer: BytesMut,
    pub(crate) write_buf: BytesMut,
    terminated: bool,
}

impl PgConnection {
    /// Connect and authenticate, using SCRAM-SHA-256 when the server asks
    /// for SASL.
    pub async fn connect(options: &ConnectionOptions) -> PgResult<Self> {
        Self::connect_with(options, &ScramSha256::new()).await
    }

    /// Connect and authenticate with a caller-supplied SASL helper.
    pub async fn connect_with<S>(options: &ConnectionOptions, sasl: &S) -> PgResult<Self>
    where
        S: SaslHelper + ?Sized,
    {
        let stream = Self::open_stream(options).await?;
        let mut conn = Self {
            stream,
            buffer: BytesMut::with_capacity(BUFFER_CAPACITY),
            write_buf: BytesMut::with_capacity(1024),
            terminated: false,
        };

        match authenticate(options, &mut conn, sasl).await {
            AuthOutcome::Failed(reason) => Err(PgError::Auth(reason)),
            _ => Ok(conn),
        }
    }

    async fn open_stream(options: &ConnectionOptions) -> PgResult<PgStream> {
        if options.is_unix_socket() {
            return Self::open_unix(options).await;
        }

        let tcp_stream = TcpStream::connect((options.host.as_str(), options.port)).await?;
        // Disable Nagle's algorithm for lower latency
        tcp_stream.set_nodelay(true)?;
        debug!(host = %options.host, port = options.port, "tcp connected");

        match &options.tls {
            None => Ok(PgStream::Tcp(tcp_stream)),
            Some(config) => Ok(PgStream::Tls(
                Self::upgrade_tls(tcp_stream, &options.host, config).await?,
            )),
        }
    }

    #[cfg(unix)]
    async fn open_unix(options: &ConnectionOptions) -> PgResult<PgStream> {
        let path = format!(
            "{}/.s.PGSQL.{}",
            options.host.trim_end_matches('/'),
            options.port
        );
        let unix_stream = tokio::net::UnixStream::connect(&path).await?;
        debug!(%path, "unix socket connected");
        Ok(PgStream::Unix(unix_stream))
    }

    #[cfg(not(unix))]
    async fn open_unix(options: &ConnectionOptions) -> PgResult<PgStream> {
        Err(PgError::Connection(format!(
            "Unix sockets are not available on this platform: {}",
            options.host
        )))
    }

    /// SSLRequest, then a rustls handshake over the same socket.
    async fn upgrade_tls(
        mut tcp_stream: TcpStream,
        host: &str,
        config: &TlsConfig,
    ) -> PgResult<TlsStream<TcpStream>> {
        tcp_stream
            .write_all(&FrontendMessage::SslRequest.encode()?)
            .await?;

        let mut response = [0u8; 1];
        tcp_stream.read_exact(&mut response).await?;
        if response[0] != b'S' {
            return Err(PgError::Connection(
                "Server does not support TLS".to_string(),
            ));
        }

        let mut root_cert_store = RootCertStore::empty();
        match &config.ca_cert_pem {
            Some(ca_pem) => {
                for cert in rustls_pemfile::certs(&mut ca_pem.as_slice()) {
                    let cert = cert.map_err(|e| {
                        PgError::Connection(format!("Invalid CA certificate: {}", e))
                    })?;
                    root_cert_store.add(cert).map_err(|e| {
                        PgError::Connection(format!("Invalid CA certificate: {}", e))
                    })?;
                }
            }
            None => {
                for cert in rustls_native_certs::load_native_certs().certs {
                    let _ = root_cert_store.add(cert);
                }
            }
        }

        let builder = ClientConfig::builder().with_root_certificates(root_cert_store);
        let tls_config = match (&config.client_cert_pem, &config.client_key_pem) {
            (Some(cert_pem), Some(key_pem)) => {
                let client_certs = rustls_pemfile::certs(&mut cert_pem.as_slice())
                    .collect::<Result<Vec<CertificateDer<'static>>, _>>()
                    .map_err(|e| PgError::Connection(format!("Invalid client cert: {}", e)))?;
                let client_key = rustls_pemfile::private_key(&mut key_pem.as_slice())
                    .map_err(|e| PgError::Connection(format!("Invalid client key: {}", e)))?
                    .ok_or_else(|| PgError::Connection("No private key found in PEM".to_string()))?;
                builder
                    .with_client_auth_cert(client_certs, client_key)
                    .map_err(|e| PgError::Connection(format!("Invalid client cert/key: {}", e)))?
            }
            _ => builder.with_no_client_auth(),
        };

        let connector = TlsConnector::from(Arc::new(tls_config));
        let server_name = ServerName::try_from(host.to_string())
            .map_err(|_| PgError::Connection("Invalid hostname for TLS".to_string()))?;

        let tls_stream = connector
            .connect(server_name, tcp_stream)
            .await
            .map_err(|e| PgError::Connection(format!("TLS handshake failed: {}", e)))?;
        info!(%host, "tls established");
        Ok(tls_stream)
    }

    /// Gracefully close the connection by sending a Terminate message.
    pub async fn close(mut self) -> PgResult<()> {
        let terminate = FrontendMessage::Terminate.encode()?;
        self.stream.write_all(&terminate).await?;
        self.stream.flush().await?;
        self.terminated = true;
        Ok(())
    }
}

/// Best-effort Terminate when a connection is dropped without `close()`;
/// if it cannot be written the socket close still ends the session.
impl Drop for PgConnection {
    fn drop(&mut self) {
        if !self.terminated {
            let _ = self.stream.try_write(&[b'X', 0, 0, 0, 4]);
        }
    }
}
