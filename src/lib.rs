//! rtun server: exposes TCP/UDP ports on behalf of agents connected over
//! WebSockets.
//!
//! The binary wires [`server::router`] to a listener. The pieces are public
//! so integration tests and embedders can run the same control plane.

pub mod server;
pub mod ws_channel;

pub use server::{router, AppState};
pub use ws_channel::WebSocketChannel;
