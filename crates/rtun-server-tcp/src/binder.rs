//! TCP binder: accepts client connections on one port

use crate::session::TcpSession;
use async_trait::async_trait;
use rtun_control::{Attachment, Binder, BinderError, Binding, ControlChannel, SessionStore};
use rtun_proto::{AcceptMessage, Protocol};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing::{debug, error, warn};

pub struct TcpBinder {
    binding: Arc<Binding<TcpListener>>,
}

impl TcpBinder {
    pub fn new(bind_addr: SocketAddr) -> Self {
        Self {
            binding: Arc::new(Binding::new(bind_addr)),
        }
    }

    /// Use a custom watchdog timeout instead of the default 3 seconds
    pub fn with_probe_timeout(bind_addr: SocketAddr, probe_timeout: Duration) -> Self {
        Self {
            binding: Arc::new(Binding::new(bind_addr).with_probe_timeout(probe_timeout)),
        }
    }

    pub fn bind_addr(&self) -> SocketAddr {
        self.binding.bind_addr()
    }

    pub fn is_listening(&self) -> bool {
        self.binding.is_listening()
    }

    fn open(addr: SocketAddr) -> std::io::Result<TcpListener> {
        let listener = std::net::TcpListener::bind(addr)?;
        listener.set_nonblocking(true)?;
        TcpListener::from_std(listener)
    }

    async fn serve(
        &self,
        attachment: Attachment<TcpListener>,
        store: Arc<SessionStore>,
    ) -> Result<(), BinderError> {
        let listener = attachment.listener.clone();

        loop {
            let (stream, peer_addr) = tokio::select! {
                reason = attachment.stopped() => return Err(reason),
                accepted = listener.accept() => accepted?,
            };

            debug!(
                "Accepted TCP connection from {} on {}",
                peer_addr,
                self.binding.bind_addr()
            );

            let session = TcpSession::new(stream, self.binding.bind_addr().port(), peer_addr);
            let session_id = store.add(Arc::new(session));
            let agent = self.binding.next_channel()?;

            // The session stays in the store if the agent never hears of it
            if let Err(e) = agent
                .send_accept(&AcceptMessage::new(session_id, peer_addr))
                .await
            {
                warn!(
                    "Failed to notify {} of session {}: {}",
                    agent.describe(),
                    session_id,
                    e
                );
                return Err(e.into());
            }
        }
    }
}

#[async_trait]
impl Binder for TcpBinder {
    async fn start(
        &self,
        channel: Arc<dyn ControlChannel>,
        store: Arc<SessionStore>,
    ) -> Result<(), BinderError> {
        let attachment = self.binding.attach(channel, Self::open).await?;

        let result = self.serve(attachment, store).await;
        if let Err(BinderError::Io(ref e)) = result {
            error!("Accept loop on {} failed: {}", self.binding.bind_addr(), e);
        }
        result
    }

    fn protocol(&self) -> Protocol {
        Protocol::Tcp
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.binding
            .listener()
            .and_then(|listener| listener.local_addr().ok())
    }

    fn attached_agents(&self) -> usize {
        self.binding.attached_agents()
    }
}
