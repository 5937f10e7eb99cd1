//! # vast-tunnel
//!
//! Forward local TCP connections to a service on a remote machine through
//! an already established transport, typically an SSH connection to a
//! rented GPU instance.
//!
//! ```text
//!  local client ──TCP──► TunnelListener ──► RelaySession ──channel──► remote_host:remote_port
//!                        (one per port)     (one per connection)      (as seen from the far end)
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use vast_tunnel::{DirectTransport, TunnelListener};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let transport = Arc::new(DirectTransport::new());
//!
//! // Everything that connects to local port 8888 reaches localhost:8080
//! let mut listener = TunnelListener::start(8888, "localhost", 8080, transport).await?;
//!
//! // ... later
//! listener.stop();
//! listener.drain().await;
//! # Ok(())
//! # }
//! ```
//!
//! ## Lifecycle
//!
//! The listener only borrows the transport (through an `Arc`) and checks it
//! for liveness on a fixed interval. When the transport goes inactive the
//! listener stops accepting and releases its port. Sessions that are already
//! relaying are never cut off; they end when either side closes.
//!
//! ## Transports
//!
//! - [`DirectTransport`]: plain TCP from this machine
//! - `SshTransport`: SSH `direct-tcpip` channels (cargo feature `ssh`)
//!
//! Anything implementing [`Transport`] can back a tunnel.

pub mod config;
pub mod error;
pub mod listener;
pub mod session;
#[cfg(feature = "ssh")]
pub mod ssh;
pub mod transport;

pub use config::TunnelConfig;
pub use error::{ChannelOpenError, ConfigError, TunnelError};
pub use listener::{StopReason, TunnelListener, forward_tunnel};
pub use session::{RelayOutcome, RelaySession, RelayStats};
pub use transport::{DirectTransport, Transport};

#[cfg(feature = "ssh")]
pub use ssh::{SshTarget, SshTransport};
