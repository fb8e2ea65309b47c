//! UDP binder: reads datagrams from one shared socket

use crate::session::UdpSession;
use async_trait::async_trait;
use bytes::Bytes;
use rtun_control::{Attachment, Binder, BinderError, Binding, ControlChannel, SessionStore};
use rtun_proto::{AcceptMessage, Protocol};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tracing::{debug, error, warn};

pub struct UdpBinder {
    binding: Arc<Binding<UdpSocket>>,
    buffer_size: usize,
}

impl UdpBinder {
    pub fn new(bind_addr: SocketAddr, buffer_size: usize) -> Self {
        Self {
            binding: Arc::new(Binding::new(bind_addr)),
            buffer_size,
        }
    }

    /// Use a custom watchdog timeout instead of the default 3 seconds
    pub fn with_probe_timeout(
        bind_addr: SocketAddr,
        buffer_size: usize,
        probe_timeout: Duration,
    ) -> Self {
        Self {
            binding: Arc::new(Binding::new(bind_addr).with_probe_timeout(probe_timeout)),
            buffer_size,
        }
    }

    pub fn bind_addr(&self) -> SocketAddr {
        self.binding.bind_addr()
    }

    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    pub fn is_listening(&self) -> bool {
        self.binding.is_listening()
    }

    fn open(addr: SocketAddr) -> std::io::Result<UdpSocket> {
        let socket = std::net::UdpSocket::bind(addr)?;
        socket.set_nonblocking(true)?;
        UdpSocket::from_std(socket)
    }

    async fn serve(
        &self,
        attachment: Attachment<UdpSocket>,
        store: Arc<SessionStore>,
    ) -> Result<(), BinderError> {
        let socket = attachment.listener.clone();
        let tunnel_port = self.binding.bind_addr().port();
        let mut buffer = vec![0u8; self.buffer_size];

        loop {
            let (n, peer_addr) = tokio::select! {
                reason = attachment.stopped() => return Err(reason),
                received = socket.recv_from(&mut buffer) => received?,
            };

            if let Some(session) = store.find(Protocol::Udp, tunnel_port, peer_addr) {
                if let Err(e) = session.send_to_agent(Bytes::copy_from_slice(&buffer[..n])) {
                    debug!("Dropped datagram from {}: {}", peer_addr, e);
                }
                continue;
            }

            let session = UdpSession::new(Arc::downgrade(&socket), tunnel_port, peer_addr);
            let session_id = store.add(Arc::new(session));
            debug!(
                "New UDP peer {} on {} as session {}, dropped first datagram ({} bytes)",
                peer_addr,
                self.binding.bind_addr(),
                session_id,
                n
            );

            let agent = self.binding.next_channel()?;
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
impl Binder for UdpBinder {
    async fn start(
        &self,
        channel: Arc<dyn ControlChannel>,
        store: Arc<SessionStore>,
    ) -> Result<(), BinderError> {
        let attachment = self.binding.attach(channel, Self::open).await?;

        let result = self.serve(attachment, store).await;
        if let Err(BinderError::Io(ref e)) = result {
            error!("Read loop on {} failed: {}", self.binding.bind_addr(), e);
        }
        result
    }

    fn protocol(&self) -> Protocol {
        Protocol::Udp
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.binding
            .listener()
            .and_then(|socket| socket.local_addr().ok())
    }

    fn attached_agents(&self) -> usize {
        self.binding.attached_agents()
    }
}
