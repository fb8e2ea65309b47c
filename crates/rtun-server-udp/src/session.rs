//! UDP session: one remote peer of a shared socket

use async_trait::async_trait;
use bytes::Bytes;
use rtun_control::{AgentLink, Session, SessionError};
use rtun_proto::Protocol;
use std::net::SocketAddr;
use std::sync::{Mutex, PoisonError, Weak};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::debug;

/// Datagrams buffered for the agent before the relay drains them
const QUEUE_CAPACITY: usize = 256;

pub struct UdpSession {
    // Weak so a closed port is not kept bound by stale sessions
    socket: Weak<UdpSocket>,
    peer_addr: SocketAddr,
    tunnel_port: u16,
    queue_tx: mpsc::Sender<Bytes>,
    queue_rx: Mutex<Option<mpsc::Receiver<Bytes>>>,
}

impl UdpSession {
    pub fn new(socket: Weak<UdpSocket>, tunnel_port: u16, peer_addr: SocketAddr) -> Self {
        let (queue_tx, queue_rx) = mpsc::channel(QUEUE_CAPACITY);
        Self {
            socket,
            peer_addr,
            tunnel_port,
            queue_tx,
            queue_rx: Mutex::new(Some(queue_rx)),
        }
    }

    fn take_queue(&self) -> Option<mpsc::Receiver<Bytes>> {
        self.queue_rx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    async fn send_to_peer(&self, data: &[u8]) -> Result<(), SessionError> {
        let socket = self.socket.upgrade().ok_or(SessionError::Closed)?;
        socket.send_to(data, self.peer_addr).await?;
        Ok(())
    }
}

#[async_trait]
impl Session for UdpSession {
    fn protocol(&self) -> Protocol {
        Protocol::Udp
    }

    fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    fn tunnel_port(&self) -> u16 {
        self.tunnel_port
    }

    fn is_stale(&self) -> bool {
        self.socket.strong_count() == 0
    }

    /// Queue a datagram from the peer. Never blocks the socket's read loop.
    fn send_to_agent(&self, payload: Bytes) -> Result<(), SessionError> {
        self.queue_tx.try_send(payload).map_err(|e| match e {
            TrySendError::Full(_) => SessionError::QueueFull,
            TrySendError::Closed(_) => SessionError::Closed,
        })
    }

    async fn relay(&self, link: AgentLink) -> Result<(), SessionError> {
        let mut queue = self.take_queue().ok_or(SessionError::AlreadyRelayed)?;
        let AgentLink {
            mut from_agent,
            to_agent,
        } = link;

        loop {
            tokio::select! {
                Some(payload) = queue.recv() => {
                    if to_agent.send(payload).await.is_err() {
                        debug!("Agent stopped reading UDP session for {}", self.peer_addr);
                        return Ok(());
                    }
                }
                reply = from_agent.recv() => match reply {
                    Some(data) => self.send_to_peer(&data).await?,
                    None => {
                        debug!("Agent closed data channel for {}", self.peer_addr);
                        return Ok(());
                    }
                },
            }
        }
    }
}
