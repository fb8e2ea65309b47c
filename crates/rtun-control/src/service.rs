//! Authorization and binder registry
//!
//! Each protocol has a service that maps agent keys to the ports they may
//! bind, and hands out one shared binder per port.

use crate::channel::ControlChannel;
use crate::error::{AuthError, BinderError};
use crate::session::SessionStore;
use async_trait::async_trait;
use dashmap::DashMap;
use rtun_proto::{PortSet, Protocol, ServerConfig};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{debug, warn};

/// Owner of one listening port
#[async_trait]
pub trait Binder: Send + Sync {
    /// Attach `channel` and serve the port until its agent detaches or the
    /// listener closes.
    ///
    /// Called once per agent control channel. Returns when the accept/read
    /// loop ends, always with the reason as an error.
    async fn start(
        &self,
        channel: Arc<dyn ControlChannel>,
        store: Arc<SessionStore>,
    ) -> Result<(), BinderError>;

    fn protocol(&self) -> Protocol;

    /// Address the listener is bound to, while listening
    fn local_addr(&self) -> Option<SocketAddr>;

    fn attached_agents(&self) -> usize;
}

/// Protocol-specific authorization and binder lookup
pub trait Service: Send + Sync {
    fn protocol(&self) -> Protocol;

    /// Authorize `key` for `port` and return the port's binder.
    ///
    /// Authorization is checked before any binder is created.
    fn get_binder(&self, key: &str, port: u16) -> Result<Arc<dyn Binder>, AuthError>;

    /// Check that `key` may serve `port` without touching any binder
    fn authorize(&self, key: &str, port: u16) -> Result<(), AuthError>;
}

/// Immutable key -> allowed ports table for one protocol
#[derive(Debug, Clone)]
pub struct Authorities {
    protocol: Protocol,
    scopes: HashMap<String, PortSet>,
}

impl Authorities {
    /// Build the table from `config`, keeping only ports of `protocol`.
    ///
    /// Every configured key is known, even with no ports for this protocol.
    pub fn from_config(config: &ServerConfig, protocol: Protocol) -> Self {
        let scopes = config
            .agents
            .iter()
            .map(|agent| (agent.auth_key.clone(), agent.ports_for(protocol)))
            .collect();

        Self {
            protocol,
            scopes,
        }
    }

    pub fn authorize(&self, key: &str, port: u16) -> Result<(), AuthError> {
        let Some(scope) = self.scopes.get(key) else {
            warn!("Rejected unknown key for {} port {}", self.protocol, port);
            return Err(AuthError::UnauthorizedKey);
        };

        if !scope.contains(port) {
            warn!("Rejected {} port {}: out of scope", self.protocol, port);
            return Err(AuthError::InsufficientScope { port });
        }

        Ok(())
    }
}

/// Port -> binder map. Binders are created on first use and never evicted.
pub struct BinderRegistry<B> {
    bindings: DashMap<u16, Arc<B>>,
}

impl<B> BinderRegistry<B> {
    pub fn new() -> Self {
        Self {
            bindings: DashMap::new(),
        }
    }

    /// Return the binder for `port`, creating it with `create` if absent.
    ///
    /// Concurrent callers for the same port all get the same binder.
    pub fn get_or_create(&self, port: u16, create: impl FnOnce() -> B) -> Arc<B> {
        self.bindings
            .entry(port)
            .or_insert_with(|| {
                debug!("Creating binder for port {}", port);
                Arc::new(create())
            })
            .value()
            .clone()
    }

    pub fn len(&self) -> usize {
        self.bindings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }
}

impl<B> Default for BinderRegistry<B> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rtun_proto::AgentConfig;

    fn config() -> ServerConfig {
        ServerConfig {
            agents: vec![
                AgentConfig::new("key-a")
                    .with_port(9000, Protocol::Tcp)
                    .with_port(5000, Protocol::Udp),
                AgentConfig::new("key-b").with_port(5000, Protocol::Udp),
            ],
            ..ServerConfig::default()
        }
    }

    #[test]
    fn test_authorize_known_key_and_port() {
        let auths = Authorities::from_config(&config(), Protocol::Tcp);
        assert!(auths.authorize("key-a", 9000).is_ok());
    }

    #[test]
    fn test_unknown_key_even_for_valid_port() {
        let auths = Authorities::from_config(&config(), Protocol::Tcp);
        assert_eq!(
            auths.authorize("key-z", 9000),
            Err(AuthError::UnauthorizedKey)
        );
    }

    #[test]
    fn test_other_protocol_ports_excluded() {
        let tcp = Authorities::from_config(&config(), Protocol::Tcp);
        assert_eq!(
            tcp.authorize("key-a", 5000),
            Err(AuthError::InsufficientScope { port: 5000 })
        );
        // key-b has no TCP ports but is still a known key
        assert_eq!(
            tcp.authorize("key-b", 9000),
            Err(AuthError::InsufficientScope { port: 9000 })
        );

        let udp = Authorities::from_config(&config(), Protocol::Udp);
        assert!(udp.authorize("key-b", 5000).is_ok());
    }

    #[test]
    fn test_registry_returns_same_binder() {
        let registry: BinderRegistry<String> = BinderRegistry::new();
        let first = registry.get_or_create(9000, || "first".to_string());
        let second = registry.get_or_create(9000, || "second".to_string());

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(second.as_str(), "first");
        assert_eq!(registry.len(), 1);

        registry.get_or_create(9001, || "other".to_string());
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_registry_concurrent_creation() {
        let registry: Arc<BinderRegistry<usize>> = Arc::new(BinderRegistry::new());

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let registry = registry.clone();
                std::thread::spawn(move || registry.get_or_create(7, || i))
            })
            .collect();

        let binders: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        for binder in &binders {
            assert!(Arc::ptr_eq(binder, &binders[0]));
        }
    }
}
