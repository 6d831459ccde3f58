//! Channel establishment seam: how the writer loop obtains a connected,
//! encrypted byte stream.
//!
//! The production implementation is [`PinnedTlsFactory`], which validates
//! the hub against a single pinned certificate authority and never
//! consults the system trust store. [`TcpChannelFactory`] provides a
//! plaintext channel for tests and co-located hubs. Every failure is an
//! [`std::io::Error`]: the writer treats it as a connect failure and
//! routes it into the backoff path, never a fatal condition.

use std::{io, path::Path, sync::Arc};

use async_trait::async_trait;
use tokio::{
    io::{AsyncRead, AsyncWrite},
    net::TcpStream,
};
use tokio_rustls::{
    TlsConnector,
    rustls::{
        ClientConfig, RootCertStore,
        pki_types::ServerName,
    },
};
use tracing::debug;

/// Stream types usable as the hub transport.
pub trait HubStream: AsyncRead + AsyncWrite + Send + Unpin {}
impl<T> HubStream for T where T: AsyncRead + AsyncWrite + Send + Unpin {}

/// Boxed duplex stream produced by a [`ChannelFactory`].
pub type BoxedStream = Box<dyn HubStream>;

/// Collaborator seam producing one connected stream per connect attempt.
#[async_trait]
pub trait ChannelFactory: Send + Sync {
    /// Establish a fresh channel to the hub.
    ///
    /// # Errors
    ///
    /// Returns an [`io::Error`] on connect or handshake failure; the
    /// caller schedules a reconnect.
    async fn connect(&self) -> io::Result<BoxedStream>;
}

/// Plaintext TCP channel factory.
#[derive(Clone, Debug)]
pub struct TcpChannelFactory {
    host: String,
    port: u16,
}

impl TcpChannelFactory {
    /// Create a factory dialing `host:port`.
    #[must_use]
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

#[async_trait]
impl ChannelFactory for TcpChannelFactory {
    async fn connect(&self) -> io::Result<BoxedStream> {
        let stream = TcpStream::connect((self.host.as_str(), self.port)).await?;
        debug!(host = %self.host, port = self.port, "tcp channel established");
        Ok(Box::new(stream))
    }
}

/// TLS channel factory trusting exactly one pinned certificate authority.
///
/// The authority is loaded once at construction and cached in the client
/// configuration; the system trust store is never consulted. A peer chain
/// that does not validate against the pinned authority fails the
/// handshake, which the writer treats like any other connect failure.
pub struct PinnedTlsFactory {
    host: String,
    port: u16,
    server_name: ServerName<'static>,
    connector: TlsConnector,
}

impl std::fmt::Debug for PinnedTlsFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PinnedTlsFactory")
            .field("host", &self.host)
            .field("port", &self.port)
            .finish_non_exhaustive()
    }
}

impl PinnedTlsFactory {
    /// Build a factory from PEM-encoded authority certificates.
    ///
    /// # Errors
    ///
    /// Returns an [`io::Error`] if the PEM parses to no usable
    /// certificate or the host is not a valid TLS server name.
    pub fn from_pem(host: impl Into<String>, port: u16, pem: &[u8]) -> io::Result<Self> {
        let host = host.into();
        let mut roots = RootCertStore::empty();
        let mut reader = io::BufReader::new(pem);
        for cert in rustls_pemfile::certs(&mut reader) {
            roots
                .add(cert?)
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        }
        if roots.is_empty() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "no pinned authority certificate found in PEM input",
            ));
        }

        let config = ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth();
        let server_name = ServerName::try_from(host.clone())
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;

        Ok(Self {
            host,
            port,
            server_name,
            connector: TlsConnector::from(Arc::new(config)),
        })
    }

    /// Build a factory from a PEM file holding the pinned authority.
    ///
    /// # Errors
    ///
    /// Returns an [`io::Error`] if the file cannot be read or contains no
    /// usable certificate.
    pub fn from_pem_file(
        host: impl Into<String>,
        port: u16,
        path: impl AsRef<Path>,
    ) -> io::Result<Self> {
        let pem = std::fs::read(path)?;
        Self::from_pem(host, port, &pem)
    }
}

#[async_trait]
impl ChannelFactory for PinnedTlsFactory {
    async fn connect(&self) -> io::Result<BoxedStream> {
        let tcp = TcpStream::connect((self.host.as_str(), self.port)).await?;
        let tls = self.connector.connect(self.server_name.clone(), tcp).await?;
        debug!(host = %self.host, port = self.port, "pinned tls channel established");
        Ok(Box::new(tls))
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[rstest]
    fn empty_pem_is_rejected() {
        let err = PinnedTlsFactory::from_pem("hub.example", 9890, b"").unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[rstest]
    fn garbage_pem_is_rejected() {
        let err =
            PinnedTlsFactory::from_pem("hub.example", 9890, b"not a certificate").unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[rstest]
    #[tokio::test]
    async fn tcp_factory_dials_a_listener() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let factory = TcpChannelFactory::new("127.0.0.1", port);
        let (connected, accepted) =
            tokio::join!(factory.connect(), listener.accept());
        connected.unwrap();
        accepted.unwrap();
    }

    #[rstest]
    #[tokio::test]
    async fn tcp_factory_connect_failure_is_an_io_error() {
        // Bind then drop to obtain a port with no listener.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let factory = TcpChannelFactory::new("127.0.0.1", port);
        assert!(factory.connect().await.is_err());
    }
}
