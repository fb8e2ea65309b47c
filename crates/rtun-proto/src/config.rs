//! Server configuration
//!
//! Loaded from a YAML file such as:
//!
//! ```yaml
//! listen: 0.0.0.0:8080
//! agents:
//!   - auth_key: secret-a
//!     ports:
//!       - { port: 9000, protocol: tcp }
//!       - { port: 5000, protocol: udp }
//! ```

use crate::ports::{PortSet, Protocol};
use crate::DEFAULT_BUFFER_SIZE;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid config: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("Agent #{0} has an empty auth_key")]
    EmptyKey(usize),

    #[error("Duplicate auth_key for agents #{first} and #{second}")]
    DuplicateKey { first: usize, second: usize },

    #[error("udp_buffer_size must be greater than zero")]
    ZeroBufferSize,
}

/// Top-level server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Address of the control-plane HTTP/WebSocket server
    #[serde(default = "default_listen")]
    pub listen: SocketAddr,

    /// Host used when binding tunnelled ports
    #[serde(default = "default_bind_host")]
    pub bind_host: IpAddr,

    /// Size of the UDP datagram read buffer
    #[serde(default = "default_buffer_size")]
    pub udp_buffer_size: usize,

    #[serde(default)]
    pub agents: Vec<AgentConfig>,
}

fn default_listen() -> SocketAddr {
    SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 8080)
}

fn default_bind_host() -> IpAddr {
    IpAddr::V4(Ipv4Addr::UNSPECIFIED)
}

fn default_buffer_size() -> usize {
    DEFAULT_BUFFER_SIZE
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            bind_host: default_bind_host(),
            udp_buffer_size: default_buffer_size(),
            agents: Vec::new(),
        }
    }
}

/// An agent credential and the ports it may bind
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    pub auth_key: String,
    #[serde(default)]
    pub ports: Vec<PortAuthorization>,
}

/// A single `(port, protocol)` grant
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortAuthorization {
    pub port: u16,
    pub protocol: Protocol,
}

impl AgentConfig {
    pub fn new(auth_key: impl Into<String>) -> Self {
        Self {
            auth_key: auth_key.into(),
            ports: Vec::new(),
        }
    }

    pub fn with_port(mut self, port: u16, protocol: Protocol) -> Self {
        self.ports.push(PortAuthorization { port, protocol });
        self
    }

    /// Ports granted for `protocol`; ports of the other protocol are excluded
    pub fn ports_for(&self, protocol: Protocol) -> PortSet {
        self.ports
            .iter()
            .filter(|grant| grant.protocol == protocol)
            .map(|grant| grant.port)
            .collect()
    }
}

impl ServerConfig {
    pub fn from_yaml_str(text: &str) -> Result<Self, ConfigError> {
        let config: ServerConfig = serde_yaml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;

        let config = Self::from_yaml_str(&text)?;
        tracing::debug!(
            "Loaded config from {} ({} agents)",
            path.display(),
            config.agents.len()
        );
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.udp_buffer_size == 0 {
            return Err(ConfigError::ZeroBufferSize);
        }

        let mut keys: HashMap<&str, usize> = HashMap::with_capacity(self.agents.len());
        for (index, agent) in self.agents.iter().enumerate() {
            if agent.auth_key.is_empty() {
                return Err(ConfigError::EmptyKey(index));
            }
            if let Some(&first) = keys.get(agent.auth_key.as_str()) {
                return Err(ConfigError::DuplicateKey {
                    first,
                    second: index,
                });
            }
            keys.insert(&agent.auth_key, index);
        }

        Ok(())
    }
}
