//! Tunnel configuration
//!
//! A [`TunnelConfig`] can be built in code, loaded from a JSON file, or
//! assembled by the CLI from flags and environment variables.
//!
//! ```json
//! {
//!   "bind_addr": "127.0.0.1",
//!   "local_port": 8888,
//!   "remote_host": "localhost",
//!   "remote_port": 8888,
//!   "chunk_size": 1024,
//!   "liveness_poll_interval": 500
//! }
//! ```

use crate::error::ConfigError;

/// Bytes read from either side per relay step
pub const DEFAULT_CHUNK_SIZE: usize = 1024;

/// How often the accept loop checks transport liveness, in milliseconds
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 500;

/// Destination host as seen from the remote machine
pub const DEFAULT_REMOTE_HOST: &str = "localhost";

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct TunnelConfig {
    /// Local address to listen on
    pub bind_addr: std::net::IpAddr,
    /// Local port to listen on (0 picks an ephemeral port)
    pub local_port: u16,
    pub remote_host: String,
    pub remote_port: u16,
    pub chunk_size: usize,
    /// Milliseconds between transport liveness checks
    pub liveness_poll_interval: u64,
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            bind_addr: std::net::IpAddr::V4(std::net::Ipv4Addr::UNSPECIFIED),
            local_port: 0,
            remote_host: DEFAULT_REMOTE_HOST.to_string(),
            remote_port: 0,
            chunk_size: DEFAULT_CHUNK_SIZE,
            liveness_poll_interval: DEFAULT_POLL_INTERVAL_MS,
        }
    }
}

impl TunnelConfig {
    pub fn new(local_port: u16, remote_host: impl Into<String>, remote_port: u16) -> Self {
        Self {
            local_port,
            remote_host: remote_host.into(),
            remote_port,
            ..Default::default()
        }
    }

    pub fn with_bind_addr(mut self, addr: std::net::IpAddr) -> Self {
        self.bind_addr = addr;
        self
    }

    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size;
        self
    }

    pub fn with_poll_interval(mut self, interval: std::time::Duration) -> Self {
        self.liveness_poll_interval = u64::try_from(interval.as_millis()).unwrap_or(u64::MAX);
        self
    }

    pub fn local_addr(&self) -> std::net::SocketAddr {
        std::net::SocketAddr::new(self.bind_addr, self.local_port)
    }

    pub fn poll_interval(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.liveness_poll_interval)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.chunk_size == 0 {
            return Err(ConfigError::ZeroChunkSize);
        }
        if self.liveness_poll_interval == 0 {
            return Err(ConfigError::ZeroPollInterval);
        }
        if self.remote_host.trim().is_empty() {
            return Err(ConfigError::EmptyRemoteHost);
        }
        if self.remote_port == 0 {
            return Err(ConfigError::ZeroRemotePort);
        }
        Ok(())
    }

    /// Load a config from a JSON file. Missing fields take their defaults.
    pub fn from_file(path: &std::path::Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;

        serde_json::from_str(&contents).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Per-user config file location, e.g. `~/.config/vast-tunnel/tunnel.json`
    pub fn default_path() -> Option<std::path::PathBuf> {
        directories::ProjectDirs::from("com", "fastn", "vast-tunnel")
            .map(|dirs| dirs.config_dir().join("tunnel.json"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_values() {
        let config = TunnelConfig::new(8888, "localhost", 8080);
        assert_eq!(config.chunk_size, 1024);
        assert_eq!(config.poll_interval(), std::time::Duration::from_millis(500));
        assert!(config.bind_addr.is_unspecified());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let config = TunnelConfig::new(0, "localhost", 22).with_chunk_size(0);
        assert!(matches!(config.validate(), Err(ConfigError::ZeroChunkSize)));

        let config = TunnelConfig::new(0, "localhost", 22)
            .with_poll_interval(std::time::Duration::from_micros(10));
        assert!(matches!(config.validate(), Err(ConfigError::ZeroPollInterval)));

        let config = TunnelConfig::new(0, "  ", 22);
        assert!(matches!(config.validate(), Err(ConfigError::EmptyRemoteHost)));

        let config = TunnelConfig::new(0, "localhost", 0);
        assert!(matches!(config.validate(), Err(ConfigError::ZeroRemotePort)));
    }

    #[test]
    fn test_huge_poll_interval_saturates() {
        let config = TunnelConfig::new(0, "localhost", 22).with_poll_interval(std::time::Duration::MAX);
        assert_eq!(config.liveness_poll_interval, u64::MAX);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_file_fills_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tunnel.json");
        std::fs::write(
            &path,
            r#"{"bind_addr": "127.0.0.1", "local_port": 9000, "remote_port": 8888}"#,
        )
        .unwrap();

        let config = TunnelConfig::from_file(&path).unwrap();
        let expected: std::net::SocketAddr = "127.0.0.1:9000".parse().unwrap();
        assert_eq!(config.local_addr(), expected);
        assert_eq!(config.remote_host, "localhost");
        assert_eq!(config.remote_port, 8888);
        assert_eq!(config.chunk_size, DEFAULT_CHUNK_SIZE);
    }

    #[test]
    fn test_from_file_errors() {
        let dir = tempfile::tempdir().unwrap();

        let missing = dir.path().join("missing.json");
        assert!(matches!(
            TunnelConfig::from_file(&missing),
            Err(ConfigError::Read { .. })
        ));

        let broken = dir.path().join("broken.json");
        std::fs::write(&broken, "{ not json").unwrap();
        let err = TunnelConfig::from_file(&broken).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
        assert!(err.to_string().contains("broken.json"));
    }
}
