//! Protocol message types

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;

/// Identifier assigned to a session by the session store
pub type SessionId = u64;

/// Event name carried by accept notifications
pub const ACCEPT_EVENT: &str = "accept";

/// Notification sent to an agent when a new session is created on its port.
///
/// The agent is expected to open a data channel for `session_id` and relay
/// traffic for the peer at `peer_address`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AcceptMessage {
    pub event: String,
    #[serde(rename = "sessionID")]
    pub session_id: SessionId,
    /// Remote endpoint in `host:port` form
    #[serde(rename = "peerAddress")]
    pub peer_address: String,
}

impl AcceptMessage {
    pub fn new(session_id: SessionId, peer_addr: SocketAddr) -> Self {
        Self {
            event: ACCEPT_EVENT.to_string(),
            session_id,
            peer_address: peer_addr.to_string(),
        }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn from_json(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    pub fn is_accept(&self) -> bool {
        self.event == ACCEPT_EVENT
    }
}
