//! Transports that can open virtual channels to a remote destination
//!
//! A [`Transport`] is owned by the caller. The tunnel only ever shares it
//! through an `Arc`, opens channels on it, and checks whether it is still
//! alive. Closing it is the caller's business.

use crate::error::ChannelOpenError;

/// An established connection capable of opening byte channels to
/// `(host, port)` destinations as seen from its far end.
#[async_trait::async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Bidirectional byte stream for one forwarded connection
    type Channel: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + 'static;

    /// Open a channel to `host:port`, tagged with the address of the local
    /// client that caused it.
    async fn open_channel(
        &self,
        host: &str,
        port: u16,
        originator: std::net::SocketAddr,
    ) -> Result<Self::Channel, ChannelOpenError>;

    /// Whether channels can still be opened on this transport
    fn is_active(&self) -> bool;
}

/// Transport that connects straight from this machine with plain TCP
///
/// Useful when the destination is already reachable, and as the far end in
/// tests. Liveness is a flag that [`DirectTransport::close`] turns off.
#[derive(Debug, Clone)]
pub struct DirectTransport {
    closed: tokio_util::sync::CancellationToken,
}

impl Default for DirectTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl DirectTransport {
    pub fn new() -> Self {
        Self {
            closed: tokio_util::sync::CancellationToken::new(),
        }
    }

    /// Mark the transport inactive. Already open channels are unaffected.
    pub fn close(&self) {
        self.closed.cancel();
    }

    /// Resolves once [`DirectTransport::close`] has been called
    pub async fn closed(&self) {
        self.closed.cancelled().await
    }
}

#[async_trait::async_trait]
impl Transport for DirectTransport {
    type Channel = tokio::net::TcpStream;

    async fn open_channel(
        &self,
        host: &str,
        port: u16,
        originator: std::net::SocketAddr,
    ) -> Result<Self::Channel, ChannelOpenError> {
        if !self.is_active() {
            return Err(ChannelOpenError::TransportInactive);
        }

        tracing::trace!(%originator, host, port, "opening direct channel");

        let stream = tokio::net::TcpStream::connect((host, port))
            .await
            .map_err(|source| ChannelOpenError::Unreachable {
                host: host.to_string(),
                port,
                source,
            })?;
        stream
            .set_nodelay(true)
            .map_err(|source| ChannelOpenError::Unreachable {
                host: host.to_string(),
                port,
                source,
            })?;

        Ok(stream)
    }

    fn is_active(&self) -> bool {
        !self.closed.is_cancelled()
    }
}
