//! TCP tunnelling service
//!
//! Each authorized port gets one [`TcpBinder`]. Every client connection
//! accepted on it becomes a [`TcpSession`] that is announced to one of the
//! attached agents, round-robin.

mod binder;
mod service;
mod session;

pub use binder::TcpBinder;
pub use service::TcpService;
pub use session::TcpSession;
