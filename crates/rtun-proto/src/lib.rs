//! Reverse Tunnel Protocol Definitions
//!
//! This crate defines the wire messages sent to agents over their control
//! channel, the port/protocol authorization types, and the server
//! configuration shared by the TCP and UDP services.

pub mod config;
pub mod messages;
pub mod ports;

pub use config::{AgentConfig, ConfigError, PortAuthorization, ServerConfig};
pub use messages::{AcceptMessage, SessionId, ACCEPT_EVENT};
pub use ports::{PortSet, Protocol};

use std::time::Duration;

/// Timeout used by watchdogs to detect control channel loss
pub const CONN_TIMEOUT: Duration = Duration::from_secs(3);

/// Default size of the UDP datagram read buffer
pub const DEFAULT_BUFFER_SIZE: usize = 64 * 1024;
