//! Local listening socket that feeds relay sessions
//!
//! [`TunnelListener`] binds a local port and spawns one [`RelaySession`] per
//! accepted connection. The accept loop ends when [`TunnelListener::stop`] is
//! called or when the transport stops reporting itself active. Neither of
//! those touches sessions that are already relaying; they end on their own
//! and can be awaited with [`TunnelListener::drain`].

use std::sync::Arc;

use crate::config::TunnelConfig;
use crate::error::TunnelError;
use crate::session::RelaySession;
use crate::transport::Transport;

/// Why the accept loop ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// [`TunnelListener::stop`] was called or the listener was dropped
    Requested,
    /// The transport reported itself inactive
    TransportInactive,
}

/// A running tunnel listener
pub struct TunnelListener {
    local_addr: std::net::SocketAddr,
    shutdown: tokio_util::sync::CancellationToken,
    sessions: tokio_util::task::TaskTracker,
    accept_task: Option<tokio::task::JoinHandle<StopReason>>,
    stop_reason: Option<StopReason>,
}

impl TunnelListener {
    /// Listen on all interfaces at `local_port` and forward every connection
    /// to `remote_host:remote_port` through `transport`.
    pub async fn start<T: Transport>(
        local_port: u16,
        remote_host: impl Into<String>,
        remote_port: u16,
        transport: Arc<T>,
    ) -> Result<Self, TunnelError> {
        Self::bind(TunnelConfig::new(local_port, remote_host, remote_port), transport).await
    }

    pub async fn bind<T: Transport>(
        config: TunnelConfig,
        transport: Arc<T>,
    ) -> Result<Self, TunnelError> {
        config.validate()?;

        let listener = bind_reusable(config.local_addr())?;
        let local_addr = listener
            .local_addr()
            .map_err(|source| TunnelError::Bind {
                addr: config.local_addr(),
                source,
            })?;

        tracing::debug!(
            "Forwarding {local_addr} -> {}:{}",
            config.remote_host,
            config.remote_port
        );

        let shutdown = tokio_util::sync::CancellationToken::new();
        let sessions = tokio_util::task::TaskTracker::new();

        let accept_task = tokio::spawn(accept_loop(
            listener,
            config,
            transport,
            shutdown.clone(),
            sessions.clone(),
        ));

        Ok(Self {
            local_addr,
            shutdown,
            sessions,
            accept_task: Some(accept_task),
            stop_reason: None,
        })
    }

    /// Address the listener is bound to
    pub fn local_addr(&self) -> std::net::SocketAddr {
        self.local_addr
    }

    /// Number of sessions still relaying
    pub fn active_sessions(&self) -> usize {
        self.sessions.len()
    }

    /// Stop accepting new connections. Running sessions are left alone.
    pub fn stop(&self) {
        self.shutdown.cancel();
    }

    pub fn is_stopped(&self) -> bool {
        self.accept_task
            .as_ref()
            .is_none_or(|task| task.is_finished())
    }

    /// Wait for the accept loop to exit and the local port to be released
    pub async fn stopped(&mut self) -> StopReason {
        // Polled by reference so a cancelled wait can be resumed
        if let Some(task) = self.accept_task.as_mut() {
            let reason = match task.await {
                Ok(reason) => reason,
                Err(e) => {
                    tracing::debug!("Accept loop ended abnormally: {e}");
                    StopReason::Requested
                }
            };
            self.accept_task = None;
            self.stop_reason = Some(reason);
        }

        self.stop_reason.unwrap_or(StopReason::Requested)
    }

    /// Wait until every session spawned by this listener has finished.
    ///
    /// Only returns after the accept loop has stopped, otherwise new
    /// sessions could keep appearing.
    pub async fn drain(&mut self) {
        self.stopped().await;
        self.sessions.wait().await;
    }
}

impl Drop for TunnelListener {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// Run a tunnel until `transport` goes inactive, then wait for its sessions
/// to finish.
pub async fn forward_tunnel<T: Transport>(
    config: TunnelConfig,
    transport: Arc<T>,
) -> Result<StopReason, TunnelError> {
    let mut listener = TunnelListener::bind(config, transport).await?;
    let reason = listener.stopped().await;
    listener.drain().await;
    Ok(reason)
}

fn bind_reusable(addr: std::net::SocketAddr) -> Result<tokio::net::TcpListener, TunnelError> {
    let bind_error = |source| TunnelError::Bind { addr, source };

    let socket = if addr.is_ipv4() {
        tokio::net::TcpSocket::new_v4()
    } else {
        tokio::net::TcpSocket::new_v6()
    }
    .map_err(bind_error)?;

    socket.set_reuseaddr(true).map_err(bind_error)?;
    socket.bind(addr).map_err(bind_error)?;
    socket.listen(1024).map_err(bind_error)
}

/// Pause after a failed accept so a persistent error such as descriptor
/// exhaustion does not spin the loop
const ACCEPT_ERROR_BACKOFF: std::time::Duration = std::time::Duration::from_millis(100);

async fn back_off_after_accept_error(error: &std::io::Error) {
    tracing::warn!("Failed to accept connection: {error}");
    tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
}

async fn accept_loop<T: Transport>(
    listener: tokio::net::TcpListener,
    config: TunnelConfig,
    transport: Arc<T>,
    shutdown: tokio_util::sync::CancellationToken,
    sessions: tokio_util::task::TaskTracker,
) -> StopReason {
    let remote_host: Arc<str> = Arc::from(config.remote_host.as_str());
    let mut liveness = tokio::time::interval(config.poll_interval());
    liveness.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    let reason = loop {
        tokio::select! {
            _ = shutdown.cancelled() => break StopReason::Requested,
            _ = liveness.tick() => {
                if !transport.is_active() {
                    tracing::debug!("Transport inactive, closing tunnel on {}", config.local_port);
                    break StopReason::TransportInactive;
                }
            }
            result = listener.accept() => {
                match result {
                    Ok((stream, peer)) => {
                        tracing::trace!("New connection from {peer}");
                        let _ = stream.set_nodelay(true);
                        let session = RelaySession::new(
                            transport.clone(),
                            remote_host.clone(),
                            config.remote_port,
                            config.chunk_size,
                        );
                        sessions.spawn(async move {
                            session.run(stream, peer).await;
                        });
                    }
                    Err(e) => back_off_after_accept_error(&e).await,
                }
            }
        }
    };

    sessions.close();
    drop(listener);
    reason
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::DirectTransport;

    fn loopback(local_port: u16, remote_port: u16) -> TunnelConfig {
        TunnelConfig::new(local_port, "127.0.0.1", remote_port)
            .with_bind_addr(std::net::Ipv4Addr::LOCALHOST.into())
            .with_poll_interval(std::time::Duration::from_millis(20))
    }

    #[tokio::test]
    async fn test_bind_error_when_port_taken() {
        let taken = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = taken.local_addr().unwrap().port();

        let transport = Arc::new(DirectTransport::new());
        let result = TunnelListener::bind(loopback(port, 9), transport).await;
        match result {
            Err(e @ TunnelError::Bind { .. }) => assert!(e.is_port_in_use()),
            Err(e) => panic!("Expected bind error, got {e}"),
            Ok(_) => panic!("Expected bind error"),
        }
    }

    #[tokio::test]
    async fn test_invalid_config_is_rejected() {
        let transport = Arc::new(DirectTransport::new());
        let result = TunnelListener::bind(loopback(0, 9).with_chunk_size(0), transport).await;
        assert!(matches!(result, Err(TunnelError::Config { .. })));
    }

    #[tokio::test]
    async fn test_stop_is_requested() {
        let transport = Arc::new(DirectTransport::new());
        let mut listener = TunnelListener::bind(loopback(0, 9), transport).await.unwrap();
        assert!(!listener.is_stopped());

        listener.stop();
        assert_eq!(listener.stopped().await, StopReason::Requested);
        assert!(listener.is_stopped());
        assert_eq!(listener.active_sessions(), 0);
    }

    #[tokio::test]
    async fn test_inactive_transport_stops_listener() {
        let transport = Arc::new(DirectTransport::new());
        let mut listener = TunnelListener::bind(loopback(0, 9), transport.clone())
            .await
            .unwrap();

        transport.close();
        let reason = tokio::time::timeout(std::time::Duration::from_secs(2), listener.stopped())
            .await
            .unwrap();
        assert_eq!(reason, StopReason::TransportInactive);
    }

    #[tokio::test]
    async fn test_forward_tunnel_returns_when_transport_closes() {
        let transport = Arc::new(DirectTransport::new());
        let closer = transport.clone();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
            closer.close();
        });

        let reason = tokio::time::timeout(
            std::time::Duration::from_secs(2),
            forward_tunnel(loopback(0, 9), transport),
        )
        .await
        .unwrap()
        .unwrap();
        assert_eq!(reason, StopReason::TransportInactive);
    }

    #[tokio::test]
    async fn test_accept_error_pauses_before_retrying() {
        let error = std::io::Error::other("too many open files");
        let before = std::time::Instant::now();
        back_off_after_accept_error(&error).await;
        assert!(before.elapsed() >= ACCEPT_ERROR_BACKOFF);
    }
}
