//! Control channel over an upgraded agent WebSocket

use async_trait::async_trait;
use axum::extract::ws::{Message, WebSocket};
use bytes::Bytes;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use rtun_control::{ChannelError, ControlChannel};
use rtun_proto::AcceptMessage;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tracing::{debug, trace};

/// Server side of an agent's control connection.
///
/// Accept notifications go out as JSON text frames. A reader task counts
/// every inbound frame; a probe succeeds when that count moves after a Ping.
pub struct WebSocketChannel {
    agent: String,
    sink: Mutex<SplitSink<WebSocket, Message>>,
    activity: watch::Receiver<u64>,
}

impl WebSocketChannel {
    pub fn new(socket: WebSocket, agent: impl Into<String>) -> Arc<Self> {
        let agent = agent.into();
        let (sink, source) = socket.split();
        let (activity_tx, activity) = watch::channel(0u64);

        tokio::spawn(Self::reader_task(source, activity_tx, agent.clone()));

        Arc::new(Self {
            agent,
            sink: Mutex::new(sink),
            activity,
        })
    }

    /// Runs until the socket ends; dropping `activity` marks the channel closed
    async fn reader_task(
        mut source: SplitStream<WebSocket>,
        activity: watch::Sender<u64>,
        agent: String,
    ) {
        while let Some(result) = source.next().await {
            match result {
                Ok(Message::Close(_)) => {
                    debug!("[{}] Control channel close received", agent);
                    break;
                }
                Ok(message) => {
                    if let Message::Pong(_) = message {
                        trace!("[{}] Received pong", agent);
                    }
                    activity.send_modify(|frames| *frames = frames.wrapping_add(1));
                }
                Err(e) => {
                    debug!("[{}] Control channel read error: {}", agent, e);
                    break;
                }
            }
        }
        debug!("[{}] Control channel reader ended", agent);
    }

    pub fn is_closed(&self) -> bool {
        self.activity.has_changed().is_err()
    }

    /// Close the connection from our side. Probes fail once the agent
    /// acknowledges, which detaches the channel.
    pub async fn close(&self) {
        let mut sink = self.sink.lock().await;
        let _ = sink.send(Message::Close(None)).await;
        let _ = sink.close().await;
    }

    async fn send(&self, message: Message) -> Result<(), ChannelError> {
        if self.is_closed() {
            return Err(ChannelError::Closed);
        }
        self.sink
            .lock()
            .await
            .send(message)
            .await
            .map_err(|e| ChannelError::Send(e.to_string()))
    }
}

#[async_trait]
impl ControlChannel for WebSocketChannel {
    async fn send_accept(&self, message: &AcceptMessage) -> Result<(), ChannelError> {
        let json = message.to_json()?;
        self.send(Message::Text(json.into())).await
    }

    async fn probe(&self, timeout: Duration) -> Result<(), ChannelError> {
        let mut activity = self.activity.clone();
        let _ = activity.borrow_and_update();

        self.send(Message::Ping(Bytes::new())).await?;

        match tokio::time::timeout(timeout, activity.changed()).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(ChannelError::Closed),
            Err(_) => Err(ChannelError::Timeout(timeout)),
        }
    }

    fn describe(&self) -> String {
        format!("ws:{}", self.agent)
    }
}
