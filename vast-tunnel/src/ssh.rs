//! SSH transport backed by russh
//!
//! Channels are SSH `direct-tcpip` channels, so `remote_host` is resolved by
//! the SSH server and `localhost` means the remote machine's own loopback.

use std::sync::Arc;

use crate::error::ChannelOpenError;
use crate::transport::Transport;

/// Errors while establishing the SSH connection
#[derive(Debug, thiserror::Error)]
pub enum SshError {
    #[error("Failed to resolve {host}:{port}: {source}")]
    Resolve {
        host: String,
        port: u16,
        source: std::io::Error,
    },

    #[error("SSH connection failed: {source}")]
    Connect {
        #[from]
        source: russh::Error,
    },

    #[error(
        "No key accepted for {user}@{host}; load one into the agent with `ssh-add` or pass --identity"
    )]
    Authentication { user: String, host: String },
}

/// Where and as whom to connect
#[derive(Debug, Clone)]
pub struct SshTarget {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub identity_files: Vec<std::path::PathBuf>,
}

impl SshTarget {
    /// Parse `host` or `user@host`. The user defaults to `root`, which is
    /// what rented instances expect.
    pub fn parse(remote: &str, port: u16) -> Self {
        let (user, host) = match remote.split_once('@') {
            Some((user, host)) => (user.to_string(), host.to_string()),
            None => ("root".to_string(), remote.to_string()),
        };

        Self {
            host,
            port,
            user,
            identity_files: default_identity_files(),
        }
    }

    pub fn with_identity(mut self, path: std::path::PathBuf) -> Self {
        self.identity_files.insert(0, path);
        self
    }
}

fn default_identity_files() -> Vec<std::path::PathBuf> {
    let Some(dirs) = directories::UserDirs::new() else {
        return Vec::new();
    };
    let ssh_dir = dirs.home_dir().join(".ssh");

    ["id_ed25519", "id_rsa", "id_ecdsa"]
        .iter()
        .map(|name| ssh_dir.join(name))
        .collect()
}

/// Accepts any host key, like an auto-add policy with an empty known_hosts
pub struct ClientHandler;

impl russh::client::Handler for ClientHandler {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        _server_public_key: &russh::keys::PublicKey,
    ) -> Result<bool, Self::Error> {
        Ok(true)
    }
}

pub struct SshTransport {
    handle: russh::client::Handle<ClientHandler>,
}

impl SshTransport {
    /// Wrap a handle that is already authenticated
    pub fn new(handle: russh::client::Handle<ClientHandler>) -> Self {
        Self { handle }
    }

    pub async fn connect(target: &SshTarget) -> Result<Self, SshError> {
        let addr = tokio::net::lookup_host((target.host.as_str(), target.port))
            .await
            .map_err(|source| SshError::Resolve {
                host: target.host.clone(),
                port: target.port,
                source,
            })?
            .next()
            .ok_or_else(|| SshError::Resolve {
                host: target.host.clone(),
                port: target.port,
                source: std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    "no addresses found",
                ),
            })?;

        let config = Arc::new(russh::client::Config {
            keepalive_interval: Some(std::time::Duration::from_secs(15)),
            keepalive_max: 3,
            ..Default::default()
        });

        tracing::info!("Connecting to {}@{addr}", target.user);
        let mut handle = russh::client::connect(config, addr, ClientHandler).await?;

        if try_agent_auth(&mut handle, &target.user).await {
            tracing::info!("SSH authentication successful via agent");
            return Ok(Self::new(handle));
        }

        for key_path in &target.identity_files {
            if !key_path.exists() {
                continue;
            }

            let key = match russh::keys::load_secret_key(key_path, None) {
                Ok(key) => key,
                Err(e) => {
                    tracing::debug!(key = %key_path.display(), "Failed to load key: {e}");
                    continue;
                }
            };

            let key = russh::keys::PrivateKeyWithHashAlg::new(Arc::new(key), None);
            match handle.authenticate_publickey(&target.user, key).await {
                Ok(result) if result.success() => {
                    tracing::info!(key = %key_path.display(), "SSH authentication successful");
                    return Ok(Self::new(handle));
                }
                Ok(_) => {
                    tracing::debug!(key = %key_path.display(), "Key not accepted");
                }
                Err(e) => {
                    tracing::debug!(key = %key_path.display(), "Auth attempt failed: {e}");
                }
            }
        }

        Err(SshError::Authentication {
            user: target.user.clone(),
            host: target.host.clone(),
        })
    }
}

/// Offer every identity held by the agent at `SSH_AUTH_SOCK`. Agent problems
/// are logged and fall through to key files.
#[cfg(unix)]
async fn try_agent_auth(handle: &mut russh::client::Handle<ClientHandler>, user: &str) -> bool {
    use russh::keys::agent::client::AgentClient;

    if std::env::var_os("SSH_AUTH_SOCK").is_none() {
        return false;
    }

    let identities = match AgentClient::connect_env().await {
        Ok(mut agent) => agent.request_identities().await,
        Err(e) => Err(e),
    };
    let identities = match identities {
        Ok(identities) => identities,
        Err(e) => {
            tracing::debug!("SSH agent unavailable: {e}");
            return false;
        }
    };

    for identity in identities {
        // Each attempt needs its own agent connection
        let mut agent = match AgentClient::connect_env().await {
            Ok(agent) => agent,
            Err(e) => {
                tracing::debug!("SSH agent unavailable: {e}");
                return false;
            }
        };

        match handle
            .authenticate_publickey_with(user, identity, None, &mut agent)
            .await
        {
            Ok(result) if result.success() => return true,
            Ok(_) => tracing::debug!("Agent key not accepted"),
            Err(e) => tracing::debug!("Agent auth attempt failed: {e}"),
        }
    }

    false
}

#[cfg(windows)]
async fn try_agent_auth(_handle: &mut russh::client::Handle<ClientHandler>, _user: &str) -> bool {
    false
}

#[async_trait::async_trait]
impl Transport for SshTransport {
    type Channel = russh::ChannelStream<russh::client::Msg>;

    async fn open_channel(
        &self,
        host: &str,
        port: u16,
        originator: std::net::SocketAddr,
    ) -> Result<Self::Channel, ChannelOpenError> {
        if !self.is_active() {
            return Err(ChannelOpenError::TransportInactive);
        }

        let channel = self
            .handle
            .channel_open_direct_tcpip(
                host,
                port as u32,
                originator.ip().to_string(),
                originator.port() as u32,
            )
            .await
            .map_err(|e| ChannelOpenError::Rejected {
                host: host.to_string(),
                port,
                reason: e.to_string(),
            })?;

        Ok(channel.into_stream())
    }

    fn is_active(&self) -> bool {
        !self.handle.is_closed()
    }
}
