//! Error types shared by binders, services and sessions

use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;

/// Failures talking to an agent's control channel
#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("Control channel closed")]
    Closed,

    #[error("Control channel did not respond within {0:?}")]
    Timeout(Duration),

    #[error("Failed to send on control channel: {0}")]
    Send(String),

    #[error("Failed to encode message: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Errors ending a binder's accept/read loop
#[derive(Debug, Error)]
pub enum BinderError {
    #[error("Failed to bind to {address}: {reason}\n\nTroubleshooting:\n  • Check if another process is using this port: lsof -i :{port}\n  • Check that the bind host is an address of this machine", port = .address.port())]
    Bind { address: SocketAddr, reason: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Listener closed: no agents attached")]
    ListenerClosed,

    #[error("Agent detached")]
    Detached,

    #[error("Failed to notify agent: {0}")]
    Notify(#[from] ChannelError),

    #[error("No agent attached to receive the session")]
    NoAgent,
}

/// Authorization failures from `Service::get_binder`
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuthError {
    #[error("unauthorized key")]
    UnauthorizedKey,

    #[error("insufficient scope: port {port} is not allowed for this key")]
    InsufficientScope { port: u16 },
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Session is already being relayed")]
    AlreadyRelayed,

    #[error("Session closed")]
    Closed,

    #[error("Agent-bound queue is full, datagram dropped")]
    QueueFull,

    #[error("Operation not supported by {0} sessions")]
    Unsupported(&'static str),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
