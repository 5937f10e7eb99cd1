//! Error types for vast-tunnel

/// Errors surfaced to whoever starts a tunnel
#[derive(Debug, thiserror::Error)]
pub enum TunnelError {
    #[error("Failed to bind {addr}: {source}")]
    Bind {
        addr: std::net::SocketAddr,
        source: std::io::Error,
    },

    #[error("Invalid tunnel configuration: {source}")]
    Config {
        #[from]
        source: ConfigError,
    },
}

impl TunnelError {
    /// True when the local port was already taken by another socket
    pub fn is_port_in_use(&self) -> bool {
        matches!(
            self,
            TunnelError::Bind { source, .. } if source.kind() == std::io::ErrorKind::AddrInUse
        )
    }
}

/// Failure to open a virtual channel through a transport
///
/// These never leave the session that hit them: the session logs the error
/// and drops the local connection.
#[derive(Debug, thiserror::Error)]
pub enum ChannelOpenError {
    #[error("Transport is no longer active")]
    TransportInactive,

    #[error("Channel to {host}:{port} rejected: {reason}")]
    Rejected {
        host: String,
        port: u16,
        reason: String,
    },

    #[error("Channel to {host}:{port} failed: {source}")]
    Unreachable {
        host: String,
        port: u16,
        source: std::io::Error,
    },
}

/// Configuration loading and validation errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("chunk_size must be greater than zero")]
    ZeroChunkSize,

    #[error("liveness_poll_interval must be greater than zero")]
    ZeroPollInterval,

    #[error("remote_host must not be empty")]
    EmptyRemoteHost,

    #[error("remote_port must not be zero")]
    ZeroRemotePort,

    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: std::path::PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse config file {path}: {source}")]
    Parse {
        path: std::path::PathBuf,
        source: serde_json::Error,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_port_in_use_detection() {
        let err = TunnelError::Bind {
            addr: "127.0.0.1:8080".parse().unwrap(),
            source: std::io::Error::from(std::io::ErrorKind::AddrInUse),
        };
        assert!(err.is_port_in_use());
        assert!(err.to_string().contains("127.0.0.1:8080"));

        let err = TunnelError::Bind {
            addr: "127.0.0.1:80".parse().unwrap(),
            source: std::io::Error::from(std::io::ErrorKind::PermissionDenied),
        };
        assert!(!err.is_port_in_use());
    }

    #[test]
    fn test_config_error_converts() {
        let err: TunnelError = ConfigError::ZeroChunkSize.into();
        assert!(matches!(
            err,
            TunnelError::Config {
                source: ConfigError::ZeroChunkSize
            }
        ));
    }
}
