use crate::error::{Result, WsError};
use crate::handshake::WsUrl;
use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tracing::debug;

/// A byte stream a session can run over
pub trait Transport: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T> Transport for T where T: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

/// Boxed transport handed from a connector to the session
pub type BoxedTransport = Box<dyn Transport>;

/// Opens the stream a WebSocket session runs over
///
/// The default [`TcpConnector`] speaks plain TCP. Secure transports are
/// layered in by implementing this trait around a TLS library and passing
/// it to the builder; the handshake and framing run unchanged on top.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Open a stream to the host and port named by `url`
    async fn connect(&self, url: &WsUrl) -> Result<BoxedTransport>;
}

/// Plain TCP connector
#[derive(Debug, Clone)]
pub struct TcpConnector {
    nodelay: bool,
}

impl TcpConnector {
    pub fn new() -> Self {
        Self { nodelay: true }
    }

    /// Toggle `TCP_NODELAY` on new sockets (on by default)
    pub fn nodelay(mut self, enabled: bool) -> Self {
        self.nodelay = enabled;
        self
    }
}

impl Default for TcpConnector {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Connector for TcpConnector {
    async fn connect(&self, url: &WsUrl) -> Result<BoxedTransport> {
        if url.tls {
            return Err(WsError::HandshakeFailed(format!(
                "{} requires a TLS connector",
                url
            )));
        }

        let stream = TcpStream::connect((url.connect_host(), url.port))
            .await
            .map_err(|e| WsError::TransportClosed(format!("connect to {}: {}", url, e)))?;
        stream.set_nodelay(self.nodelay)?;
        debug!("TCP connected to {}:{}", url.host, url.port);

        Ok(Box::new(stream))
    }
}
