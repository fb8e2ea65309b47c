//! UDP tunnelling service
//!
//! One shared socket per authorized port. Each new source address becomes a
//! [`UdpSession`] announced to an attached agent; later datagrams from the
//! same address are queued on that session.
//!
//! The datagram that reveals a new peer is not forwarded. The peer's next
//! datagram is the first one the agent sees.

mod binder;
mod service;
mod session;

pub use binder::UdpBinder;
pub use service::UdpService;
pub use session::UdpSession;
