//! In-process control channel
//!
//! [`MemoryChannel`] records the accept notifications it is sent and can be
//! killed or stalled to drive watchdogs in tests.

use crate::channel::ControlChannel;
use crate::error::ChannelError;
use async_trait::async_trait;
use rtun_proto::AcceptMessage;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

pub struct MemoryChannel {
    name: String,
    alive: AtomicBool,
    stalled: AtomicBool,
    tx: mpsc::UnboundedSender<AcceptMessage>,
}

impl MemoryChannel {
    pub fn new(name: &str) -> (Arc<Self>, mpsc::UnboundedReceiver<AcceptMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let channel = Arc::new(Self {
            name: name.to_string(),
            alive: AtomicBool::new(true),
            stalled: AtomicBool::new(false),
            tx,
        });
        (channel, rx)
    }

    /// Close the channel: sends and probes fail from now on
    pub fn kill(&self) {
        self.alive.store(false, Ordering::SeqCst);
    }

    /// Make probes hang without answering
    pub fn stall(&self) {
        self.stalled.store(true, Ordering::SeqCst);
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ControlChannel for MemoryChannel {
    async fn send_accept(&self, message: &AcceptMessage) -> Result<(), ChannelError> {
        if !self.is_alive() {
            return Err(ChannelError::Closed);
        }
        self.tx
            .send(message.clone())
            .map_err(|_| ChannelError::Closed)
    }

    async fn probe(&self, _timeout: Duration) -> Result<(), ChannelError> {
        if self.stalled.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        if self.is_alive() {
            Ok(())
        } else {
            Err(ChannelError::Closed)
        }
    }

    fn describe(&self) -> String {
        format!("memory:{}", self.name)
    }
}
