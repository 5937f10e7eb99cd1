//! vast-tunnel: forward a local port to a service on a remote machine
//!
//! ```bash
//! # Through SSH, to a notebook server on the instance's loopback
//! vast-tunnel ssh root@ssh4.vast.ai --ssh-port 34567 --local-port 8888 --remote-port 8888
//!
//! # Without a secure transport, to something reachable from here
//! vast-tunnel direct --local-port 8080 --remote-host 10.0.0.5 --remote-port 80
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Args, Parser, Subcommand};
use vast_tunnel::{StopReason, Transport, TunnelConfig, TunnelListener};

#[derive(Parser)]
#[command(name = "vast-tunnel")]
#[command(about = "Forward local TCP connections through a secure transport")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Connect to destinations directly from this machine
    Direct {
        #[command(flatten)]
        tunnel: TunnelArgs,
    },
    /// Forward through an SSH connection (direct-tcpip channels)
    #[cfg(feature = "ssh")]
    Ssh {
        /// Remote machine as `host` or `user@host` (user defaults to root)
        remote: String,
        /// SSH port on the remote machine
        #[arg(long, default_value_t = 22, env = "VAST_TUNNEL_SSH_PORT")]
        ssh_port: u16,
        /// Private key to try before the defaults in ~/.ssh
        #[arg(long, short = 'i', env = "VAST_TUNNEL_IDENTITY")]
        identity: Option<PathBuf>,
        #[command(flatten)]
        tunnel: TunnelArgs,
    },
}

#[derive(Args)]
struct TunnelArgs {
    /// JSON tunnel config (defaults to the per-user config file, if present)
    #[arg(long, env = "VAST_TUNNEL_CONFIG")]
    config: Option<PathBuf>,
    /// Local address to listen on
    #[arg(long, env = "VAST_TUNNEL_BIND")]
    bind: Option<std::net::IpAddr>,
    /// Local port to listen on
    #[arg(long, env = "VAST_TUNNEL_LOCAL_PORT")]
    local_port: Option<u16>,
    /// Destination host as seen from the far end of the transport
    #[arg(long, env = "VAST_TUNNEL_REMOTE_HOST")]
    remote_host: Option<String>,
    /// Destination port
    #[arg(long, env = "VAST_TUNNEL_REMOTE_PORT")]
    remote_port: Option<u16>,
    /// Bytes relayed per read
    #[arg(long, env = "VAST_TUNNEL_CHUNK_SIZE")]
    chunk_size: Option<usize>,
    /// Milliseconds between transport liveness checks
    #[arg(long, env = "VAST_TUNNEL_POLL_INTERVAL_MS")]
    poll_interval_ms: Option<u64>,
}

impl TunnelArgs {
    fn into_config(self) -> eyre::Result<TunnelConfig> {
        let path = self
            .config
            .or_else(|| TunnelConfig::default_path().filter(|p| p.exists()));

        let mut config = match path {
            Some(path) => {
                tracing::debug!("Loading tunnel config from {}", path.display());
                TunnelConfig::from_file(&path)?
            }
            None => TunnelConfig::default(),
        };

        if let Some(bind) = self.bind {
            config.bind_addr = bind;
        }
        if let Some(local_port) = self.local_port {
            config.local_port = local_port;
        }
        if let Some(remote_host) = self.remote_host {
            config.remote_host = remote_host;
        }
        if let Some(remote_port) = self.remote_port {
            config.remote_port = remote_port;
        }
        if let Some(chunk_size) = self.chunk_size {
            config.chunk_size = chunk_size;
        }
        if let Some(poll_interval_ms) = self.poll_interval_ms {
            config.liveness_poll_interval = poll_interval_ms;
        }

        config.validate()?;
        Ok(config)
    }
}

fn init_logging() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"))
        .add_directive("russh=warn".parse().expect("static directive"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> eyre::Result<()> {
    init_logging();
    let cli = Cli::parse();

    match cli.command {
        Commands::Direct { tunnel } => {
            let config = tunnel.into_config()?;
            run(config, Arc::new(vast_tunnel::DirectTransport::new())).await
        }
        #[cfg(feature = "ssh")]
        Commands::Ssh {
            remote,
            ssh_port,
            identity,
            tunnel,
        } => {
            let config = tunnel.into_config()?;
            let mut target = vast_tunnel::SshTarget::parse(&remote, ssh_port);
            if let Some(identity) = identity {
                target = target.with_identity(identity);
            }
            let transport = vast_tunnel::SshTransport::connect(&target).await?;
            run(config, Arc::new(transport)).await
        }
    }
}

async fn run<T: Transport>(config: TunnelConfig, transport: Arc<T>) -> eyre::Result<()> {
    let remote = format!("{}:{}", config.remote_host, config.remote_port);
    let mut listener = TunnelListener::bind(config, transport).await?;

    println!("Forwarding {} -> {remote}", listener.local_addr());

    let reason = tokio::select! {
        reason = listener.stopped() => reason,
        _ = tokio::signal::ctrl_c() => {
            listener.stop();
            listener.stopped().await
        }
    };

    if reason == StopReason::TransportInactive {
        eprintln!("Transport closed, no longer accepting connections");
    }

    let pending = listener.active_sessions();
    if pending > 0 {
        tracing::info!("Waiting for {pending} open connection(s) to finish, Ctrl-C again to quit");
    }
    drain_or_interrupt(&mut listener, async {
        let _ = tokio::signal::ctrl_c().await;
    })
    .await;

    Ok(())
}

/// Wait for open sessions, unless `interrupt` fires first. Returns whether
/// every session finished.
async fn drain_or_interrupt<F>(listener: &mut TunnelListener, interrupt: F) -> bool
where
    F: std::future::Future<Output = ()>,
{
    tokio::select! {
        _ = listener.drain() => true,
        _ = interrupt => {
            tracing::warn!(
                "Interrupted, abandoning {} open connection(s)",
                listener.active_sessions()
            );
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    async fn listener_with_open_session() -> (TunnelListener, tokio::net::TcpStream) {
        let server = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = server.local_addr().unwrap().port();
        tokio::spawn(async move {
            while let Ok((mut stream, _)) = server.accept().await {
                tokio::spawn(async move {
                    let (mut read, mut write) = stream.split();
                    let _ = tokio::io::copy(&mut read, &mut write).await;
                });
            }
        });

        let config = TunnelConfig::new(0, "127.0.0.1", port)
            .with_bind_addr(std::net::Ipv4Addr::LOCALHOST.into());
        let listener = TunnelListener::bind(config, Arc::new(vast_tunnel::DirectTransport::new()))
            .await
            .unwrap();

        let mut client = tokio::net::TcpStream::connect(listener.local_addr()).await.unwrap();
        client.write_all(b"hi").await.unwrap();
        let mut buf = [0u8; 2];
        client.read_exact(&mut buf).await.unwrap();
        (listener, client)
    }

    #[tokio::test]
    async fn test_second_interrupt_abandons_idle_sessions() {
        let (mut listener, _client) = listener_with_open_session().await;
        listener.stop();

        let finished = tokio::time::timeout(
            std::time::Duration::from_secs(5),
            drain_or_interrupt(&mut listener, std::future::ready(())),
        )
        .await
        .unwrap();
        assert!(!finished);
        assert_eq!(listener.active_sessions(), 1);
    }

    #[tokio::test]
    async fn test_drain_finishes_without_interrupt() {
        let (mut listener, client) = listener_with_open_session().await;
        listener.stop();
        drop(client);

        let finished = tokio::time::timeout(
            std::time::Duration::from_secs(5),
            drain_or_interrupt(&mut listener, std::future::pending()),
        )
        .await
        .unwrap();
        assert!(finished);
        assert_eq!(listener.active_sessions(), 0);
    }
}
