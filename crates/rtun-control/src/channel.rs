//! Agent control channel abstraction

use crate::error::ChannelError;
use async_trait::async_trait;
use rtun_proto::AcceptMessage;
use std::time::Duration;

/// A persistent connection from an agent, used to announce new sessions.
///
/// Pools compare channels by `Arc` identity, so implementations do not
/// need `PartialEq`.
#[async_trait]
pub trait ControlChannel: Send + Sync {
    /// Send an accept notification to the agent
    async fn send_accept(&self, message: &AcceptMessage) -> Result<(), ChannelError>;

    /// Check that the agent is still alive.
    ///
    /// Must resolve with an error once the channel is closed. Implementations
    /// should give up after `timeout`.
    async fn probe(&self, timeout: Duration) -> Result<(), ChannelError>;

    /// Short label used in logs
    fn describe(&self) -> String {
        "control-channel".to_string()
    }
}
