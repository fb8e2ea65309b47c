//! TCP session: one accepted client connection

use async_trait::async_trait;
use bytes::Bytes;
use rtun_control::{AgentLink, Session, SessionError};
use rtun_proto::Protocol;
use std::net::SocketAddr;
use std::sync::{Mutex, PoisonError};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::debug;

const READ_BUFFER_SIZE: usize = 8192;

pub struct TcpSession {
    peer_addr: SocketAddr,
    tunnel_port: u16,
    // Taken by the relay
    stream: Mutex<Option<TcpStream>>,
}

impl TcpSession {
    pub fn new(stream: TcpStream, tunnel_port: u16, peer_addr: SocketAddr) -> Self {
        Self {
            peer_addr,
            tunnel_port,
            stream: Mutex::new(Some(stream)),
        }
    }

    fn take_stream(&self) -> Option<TcpStream> {
        self.stream
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }
}

#[async_trait]
impl Session for TcpSession {
    fn protocol(&self) -> Protocol {
        Protocol::Tcp
    }

    fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    fn tunnel_port(&self) -> u16 {
        self.tunnel_port
    }

    /// TCP sessions read their own connection during the relay
    fn send_to_agent(&self, _payload: Bytes) -> Result<(), SessionError> {
        Err(SessionError::Unsupported("tcp"))
    }

    async fn relay(&self, link: AgentLink) -> Result<(), SessionError> {
        let stream = self.take_stream().ok_or(SessionError::AlreadyRelayed)?;
        let (mut reader, mut writer) = stream.into_split();
        let AgentLink {
            mut from_agent,
            to_agent,
        } = link;
        let peer_addr = self.peer_addr;

        let client_to_agent = async move {
            let mut buffer = vec![0u8; READ_BUFFER_SIZE];
            loop {
                let n = reader.read(&mut buffer).await?;
                if n == 0 {
                    debug!("Client {} closed TCP connection", peer_addr);
                    break;
                }
                if to_agent
                    .send(Bytes::copy_from_slice(&buffer[..n]))
                    .await
                    .is_err()
                {
                    break;
                }
            }
            Ok::<(), SessionError>(())
        };

        let agent_to_client = async move {
            while let Some(data) = from_agent.recv().await {
                writer.write_all(&data).await?;
            }
            debug!("Agent closed data channel for {}", peer_addr);
            writer.shutdown().await?;
            Ok::<(), SessionError>(())
        };

        tokio::select! {
            result = client_to_agent => result,
            result = agent_to_client => result,
        }
    }
}
