//! One forwarded connection
//!
//! A [`RelaySession`] pairs an accepted local socket with a freshly opened
//! transport channel and copies bytes between them until either side is done.
//! Both ends are shut down and dropped when [`RelaySession::run`] returns,
//! whichever way the session ended.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::ChannelOpenError;
use crate::transport::Transport;

/// How a session ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayOutcome {
    /// The transport could not open a channel; nothing was relayed
    ChannelRejected,
    /// The local client sent EOF
    LocalClosed,
    /// The remote destination sent EOF
    RemoteClosed,
    /// Reading from or writing to the local client failed
    LocalError,
    /// Reading from or writing to the channel failed
    RemoteError,
}

/// Bytes moved in each direction
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RelayStats {
    pub sent: u64,
    pub received: u64,
}

pub struct RelaySession<T: Transport> {
    transport: std::sync::Arc<T>,
    remote_host: std::sync::Arc<str>,
    remote_port: u16,
    chunk_size: usize,
}

impl<T: Transport> RelaySession<T> {
    pub fn new(
        transport: std::sync::Arc<T>,
        remote_host: std::sync::Arc<str>,
        remote_port: u16,
        chunk_size: usize,
    ) -> Self {
        Self {
            transport,
            remote_host,
            remote_port,
            chunk_size: chunk_size.max(1),
        }
    }

    /// Open the channel for `peer` and relay until either side finishes.
    ///
    /// Never fails: channel errors and I/O errors end the session and are
    /// reported through the returned outcome.
    pub async fn run<L>(self, local: L, peer: std::net::SocketAddr) -> (RelayOutcome, RelayStats)
    where
        L: AsyncRead + AsyncWrite + Unpin,
    {
        let channel = match self
            .transport
            .open_channel(&self.remote_host, self.remote_port, peer)
            .await
        {
            Ok(channel) => channel,
            Err(e) => {
                tracing::debug!(
                    "{}",
                    open_failure_message(&self.remote_host, self.remote_port, &e)
                );
                // `local` is dropped here, the client sees the connection close
                return (RelayOutcome::ChannelRejected, RelayStats::default());
            }
        };

        tracing::debug!(
            "Tunnel open {peer} -> {}:{}",
            self.remote_host,
            self.remote_port
        );

        let (outcome, stats) = relay(local, channel, self.chunk_size).await;

        tracing::debug!(
            ?outcome,
            sent = stats.sent,
            received = stats.received,
            "Tunnel closed from {peer}"
        );

        (outcome, stats)
    }
}

/// Pump bytes between `local` and `remote` until EOF or error on either.
///
/// Each direction runs its own read/write loop so a slow writer on one side
/// never stops the other side from being read. Both streams are owned here,
/// shut down once, and dropped on return.
pub async fn relay<L, R>(local: L, remote: R, chunk_size: usize) -> (RelayOutcome, RelayStats)
where
    L: AsyncRead + AsyncWrite + Unpin,
    R: AsyncRead + AsyncWrite + Unpin,
{
    let chunk_size = chunk_size.max(1);
    let mut stats = RelayStats::default();

    let (mut local_rd, mut local_wr) = tokio::io::split(local);
    let (mut remote_rd, mut remote_wr) = tokio::io::split(remote);

    let outcome = tokio::select! {
        end = pump(&mut local_rd, &mut remote_wr, chunk_size, &mut stats.sent) => match end {
            PumpEnd::Eof => RelayOutcome::LocalClosed,
            PumpEnd::ReadFailed(e) => {
                tracing::debug!("Local read error: {e}");
                RelayOutcome::LocalError
            }
            PumpEnd::WriteFailed(e) => {
                tracing::debug!("Channel write error: {e}");
                RelayOutcome::RemoteError
            }
        },
        end = pump(&mut remote_rd, &mut local_wr, chunk_size, &mut stats.received) => match end {
            PumpEnd::Eof => RelayOutcome::RemoteClosed,
            PumpEnd::ReadFailed(e) => {
                tracing::debug!("Channel read error: {e}");
                RelayOutcome::RemoteError
            }
            PumpEnd::WriteFailed(e) => {
                tracing::debug!("Local write error: {e}");
                RelayOutcome::LocalError
            }
        },
    };

    let mut local = local_rd.unsplit(local_wr);
    let mut remote = remote_rd.unsplit(remote_wr);

    // Errors here only mean the peer is already gone
    let _ = remote.shutdown().await;
    let _ = local.shutdown().await;

    (outcome, stats)
}

enum PumpEnd {
    Eof,
    ReadFailed(std::io::Error),
    WriteFailed(std::io::Error),
}

/// Copy one direction in `chunk_size` pieces, counting bytes written into
/// `moved` as it goes so the count survives cancellation.
async fn pump<Rd, Wr>(reader: &mut Rd, writer: &mut Wr, chunk_size: usize, moved: &mut u64) -> PumpEnd
where
    Rd: AsyncRead + Unpin,
    Wr: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; chunk_size];
    loop {
        let n = match reader.read(&mut buf).await {
            Ok(0) => return PumpEnd::Eof,
            Ok(n) => n,
            Err(e) => return PumpEnd::ReadFailed(e),
        };
        if let Err(e) = writer.write_all(&buf[..n]).await {
            return PumpEnd::WriteFailed(e);
        }
        *moved += n as u64;
    }
}

fn open_failure_message(host: &str, port: u16, error: &ChannelOpenError) -> String {
    match error {
        ChannelOpenError::Rejected { reason, .. } => {
            format!("Incoming request to {host}:{port} was rejected by the SSH server: {reason}")
        }
        other => format!("Incoming request to {host}:{port} failed: {other}"),
    }
}
