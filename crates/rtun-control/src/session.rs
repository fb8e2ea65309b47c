//! Sessions and the session store
//!
//! A session is created for each TCP connection or new UDP peer seen by a
//! binder. Agents pick it up by id after receiving the accept notification.

use crate::error::SessionError;
use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use rtun_proto::{Protocol, SessionId};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::debug;

/// Byte channels connecting a session to the agent's data connection
pub struct AgentLink {
    /// Payloads sent by the agent, to be delivered to the public peer
    pub from_agent: mpsc::Receiver<Bytes>,
    /// Payloads from the public peer, to be delivered to the agent
    pub to_agent: mpsc::Sender<Bytes>,
}

impl AgentLink {
    /// Create a link plus the agent-side ends of its channels
    pub fn pair(capacity: usize) -> (Self, mpsc::Sender<Bytes>, mpsc::Receiver<Bytes>) {
        let (agent_tx, from_agent) = mpsc::channel(capacity);
        let (to_agent, agent_rx) = mpsc::channel(capacity);
        (
            Self {
                from_agent,
                to_agent,
            },
            agent_tx,
            agent_rx,
        )
    }
}

#[async_trait]
pub trait Session: Send + Sync {
    fn protocol(&self) -> Protocol;

    fn peer_addr(&self) -> SocketAddr;

    /// Port the agent requested when attaching, which is the port its key
    /// is authorized for. Zero for an ephemeral listener.
    fn tunnel_port(&self) -> u16;

    /// True once the listener that created the session is gone. Stale
    /// sessions can no longer reach their peer.
    fn is_stale(&self) -> bool {
        false
    }

    /// Forward bytes received from the public peer toward the agent
    fn send_to_agent(&self, payload: Bytes) -> Result<(), SessionError>;

    /// Pipe traffic between the public peer and `link` until either side
    /// closes. A session can only be relayed once.
    async fn relay(&self, link: AgentLink) -> Result<(), SessionError>;
}

/// Index key for peer lookups. The same peer may talk to several tunneled
/// ports at once, so the port is part of the key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct PeerKey {
    protocol: Protocol,
    tunnel_port: u16,
    peer: SocketAddr,
}

impl PeerKey {
    fn of(session: &dyn Session) -> Self {
        Self {
            protocol: session.protocol(),
            tunnel_port: session.tunnel_port(),
            peer: session.peer_addr(),
        }
    }
}

/// Shared store of live sessions
pub struct SessionStore {
    next_id: AtomicU64,
    sessions: DashMap<SessionId, Arc<dyn Session>>,
    peers: DashMap<PeerKey, SessionId>,
}

impl SessionStore {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            sessions: DashMap::new(),
            peers: DashMap::new(),
        }
    }

    /// Store a session and return its id
    pub fn add(&self, session: Arc<dyn Session>) -> SessionId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.peers.insert(PeerKey::of(session.as_ref()), id);
        self.sessions.insert(id, session);
        id
    }

    pub fn get(&self, id: SessionId) -> Option<Arc<dyn Session>> {
        self.sessions.get(&id).map(|entry| entry.value().clone())
    }

    /// Look up the latest session for a peer of `tunnel_port`.
    ///
    /// A stale session is removed and reported as absent, so the caller
    /// announces the peer again.
    pub fn find(
        &self,
        protocol: Protocol,
        tunnel_port: u16,
        peer: SocketAddr,
    ) -> Option<Arc<dyn Session>> {
        let key = PeerKey {
            protocol,
            tunnel_port,
            peer,
        };
        let id = *self.peers.get(&key)?;
        let session = self.get(id)?;

        if session.is_stale() {
            debug!("Dropping stale {} session {} for {}", protocol, id, peer);
            self.remove(id);
            return None;
        }
        Some(session)
    }

    pub fn remove(&self, id: SessionId) -> Option<Arc<dyn Session>> {
        let (_, session) = self.sessions.remove(&id)?;
        self.peers
            .remove_if(&PeerKey::of(session.as_ref()), |_, owner| *owner == id);
        Some(session)
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

impl Default for SessionStore {
    fn default() -> Self {
        Self::new()
    }
}
