//! TLS transport.
//!
//! One persistent TLS stream per session. The transport is deliberately
//! dumb: framing lives in the codec, so this only moves bytes.

use std::io;
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::rustls::{ClientConfig, RootCertStore};
use tokio_rustls::TlsConnector;

/// Byte stream the session runs over. Implemented by the TLS stream and,
/// in tests, by an in-memory duplex.
pub trait SessionStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> SessionStream for T {}

/// The session's transport: a boxed byte stream plus read scratch space.
pub struct Transport {
    stream: Box<dyn SessionStream>,
    read_buf: Vec<u8>,
}

impl Transport {
    /// Open a TLS connection to `host:port`, verifying against the webpki
    /// root set.
    pub async fn connect_tls(host: &str, port: u16) -> io::Result<Self> {
        let mut roots = RootCertStore::empty();
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        let config = ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth();
        let connector = TlsConnector::from(Arc::new(config));

        let tcp = TcpStream::connect((host, port)).await?;
        tcp.set_nodelay(true)?;
        let server_name = ServerName::try_from(host.to_string())
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
        let tls = connector.connect(server_name, tcp).await?;

        tracing::debug!(host, port, "TLS transport connected");
        Ok(Self::from_stream(tls))
    }

    /// Wrap an already-connected stream (tests, custom tunnels).
    pub fn from_stream(stream: impl SessionStream + 'static) -> Self {
        Self {
            stream: Box::new(stream),
            read_buf: vec![0u8; 16 * 1024],
        }
    }

    /// Write all of `data`.
    pub async fn send(&mut self, data: &[u8]) -> io::Result<()> {
        self.stream.write_all(data).await?;
        self.stream.flush().await
    }

    /// Read whatever is available. An empty buffer means the remote closed.
    pub async fn recv(&mut self) -> io::Result<Vec<u8>> {
        let n = self.stream.read(&mut self.read_buf).await?;
        Ok(self.read_buf[..n].to_vec())
    }
}
