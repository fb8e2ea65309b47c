//! Control plane for port binding and agent multiplexing
//!
//! Agents attach control channels to a per-port binder. The binder keeps
//! a round-robin [`WsPool`] of those channels, watches each one with a
//! watchdog task, and opens its listening socket while at least one agent
//! is attached.
pub mod binding;
pub mod channel;
pub mod error;
pub mod pool;
pub mod service;
pub mod session;
pub mod watchdog;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use binding::{Attachment, Binding};
pub use channel::ControlChannel;
pub use error::{AuthError, BinderError, ChannelError, SessionError};
pub use pool::WsPool;
pub use service::{Authorities, Binder, BinderRegistry, Service};
pub use session::{AgentLink, Session, SessionStore};
pub use watchdog::spawn_watchdog;
