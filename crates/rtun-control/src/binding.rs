//! Listener lifecycle shared by the TCP and UDP binders
//!
//! A [`Binding`] owns the listening resource of one port, the pool of
//! attached control channels, and the count of live attachments. All three
//! change under one lock:
//!
//! - the first attach while uninitialized opens the listener;
//! - each watchdog cleanup detaches one channel;
//! - the last detach drops the listener and cancels its shutdown token.
//!
//! Accept/read loops only hold an [`Attachment`]. They never close the
//! listener themselves; they stop when their agent detaches or the shutdown
//! token is cancelled. The socket closes when the last attachment of its
//! generation is dropped, and a reattach waits for that before rebinding.

use crate::channel::ControlChannel;
use crate::error::BinderError;
use crate::pool::WsPool;
use crate::watchdog::spawn_watchdog;
use rtun_proto::CONN_TIMEOUT;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Recheck interval while waiting for the previous listener to close
const RELEASE_POLL: Duration = Duration::from_millis(50);

enum ListenerState<L> {
    /// `previous` is the last closed listener, still alive while loops of
    /// its generation are winding down
    Uninitialized {
        previous: Weak<L>,
    },
    Listening {
        listener: Arc<L>,
        attached: usize,
        shutdown: CancellationToken,
    },
}

/// What an accept loop needs from an attached binding
pub struct Attachment<L> {
    pub listener: Arc<L>,
    /// Cancelled when the last agent detaches
    pub shutdown: CancellationToken,
    /// Cancelled when this attachment's agent detaches, or on shutdown
    pub detached: CancellationToken,
    // Declared last so it fires after `listener` is dropped
    _released: ReleaseGuard,
}

/// Wakes agents waiting to reopen the port
struct ReleaseGuard(Arc<Notify>);

impl Drop for ReleaseGuard {
    fn drop(&mut self) {
        self.0.notify_waiters();
    }
}

impl<L> Attachment<L> {
    /// Resolves once the loop holding this attachment should stop, with
    /// the reason to report
    pub async fn stopped(&self) -> BinderError {
        self.detached.cancelled().await;
        if self.shutdown.is_cancelled() {
            BinderError::ListenerClosed
        } else {
            BinderError::Detached
        }
    }
}

pub struct Binding<L> {
    bind_addr: SocketAddr,
    probe_timeout: Duration,
    pool: WsPool<dyn ControlChannel>,
    state: Mutex<ListenerState<L>>,
    released: Arc<Notify>,
}

impl<L: Send + Sync + 'static> Binding<L> {
    pub fn new(bind_addr: SocketAddr) -> Self {
        Self {
            bind_addr,
            probe_timeout: CONN_TIMEOUT,
            pool: WsPool::new(),
            state: Mutex::new(ListenerState::Uninitialized {
                previous: Weak::new(),
            }),
            released: Arc::new(Notify::new()),
        }
    }

    /// Override the watchdog timeout (defaults to [`CONN_TIMEOUT`])
    pub fn with_probe_timeout(mut self, probe_timeout: Duration) -> Self {
        self.probe_timeout = probe_timeout;
        self
    }

    fn lock(&self) -> MutexGuard<'_, ListenerState<L>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn bind_addr(&self) -> SocketAddr {
        self.bind_addr
    }

    pub fn pool(&self) -> &WsPool<dyn ControlChannel> {
        &self.pool
    }

    /// True while a closed listener is still held by its winding-down loops
    fn previous_alive(&self) -> bool {
        match &*self.lock() {
            ListenerState::Uninitialized { previous } => previous.strong_count() > 0,
            ListenerState::Listening { .. } => false,
        }
    }

    /// Wait until the previous generation's listener is closed, for at most
    /// [`CONN_TIMEOUT`]
    async fn wait_released(&self) {
        let deadline = Instant::now() + CONN_TIMEOUT;

        loop {
            let released = self.released.notified();
            if !self.previous_alive() {
                return;
            }
            if Instant::now() >= deadline {
                warn!(
                    "Previous listener on {} still open, binding anyway",
                    self.bind_addr
                );
                return;
            }
            let _ = tokio::time::timeout(RELEASE_POLL, released).await;
        }
    }

    /// Attach an agent channel, opening the listener if needed.
    ///
    /// `open` is only called while uninitialized, after the previous
    /// listener has closed; if it fails nothing changes. On success the
    /// channel joins the pool and a watchdog starts that detaches it once
    /// the agent is gone.
    pub async fn attach<F>(
        self: &Arc<Self>,
        channel: Arc<dyn ControlChannel>,
        open: F,
    ) -> Result<Attachment<L>, BinderError>
    where
        F: FnOnce(SocketAddr) -> std::io::Result<L>,
    {
        self.wait_released().await;

        let attachment = {
            let mut state = self.lock();

            let (listener, shutdown, attached) = match &mut *state {
                ListenerState::Listening {
                    listener,
                    attached,
                    shutdown,
                } => {
                    *attached += 1;
                    (listener.clone(), shutdown.clone(), *attached)
                }
                ListenerState::Uninitialized { .. } => {
                    let listener = open(self.bind_addr).map_err(|e| BinderError::Bind {
                        address: self.bind_addr,
                        reason: e.to_string(),
                    })?;
                    info!("Listening on {}", self.bind_addr);

                    let listener = Arc::new(listener);
                    let shutdown = CancellationToken::new();
                    *state = ListenerState::Listening {
                        listener: listener.clone(),
                        attached: 1,
                        shutdown: shutdown.clone(),
                    };
                    (listener, shutdown, 1)
                }
            };

            self.pool.add(channel.clone());
            debug!(
                "Agent {} attached to {} ({} attached)",
                channel.describe(),
                self.bind_addr,
                attached
            );

            Attachment {
                listener,
                detached: shutdown.child_token(),
                shutdown,
                _released: ReleaseGuard(self.released.clone()),
            }
        };

        let binding = Arc::clone(self);
        let watched = channel.clone();
        let detached = attachment.detached.clone();
        // Not joined: the task ends on its own when the channel dies
        spawn_watchdog(channel, self.probe_timeout, move || {
            binding.detach(&watched);
            detached.cancel();
        });

        Ok(attachment)
    }

    /// Detach an agent channel, closing the listener when none remain.
    ///
    /// Returns false if the channel was not attached, so repeated calls for
    /// the same channel are harmless.
    pub fn detach(&self, channel: &Arc<dyn ControlChannel>) -> bool {
        let mut state = self.lock();

        if !self.pool.remove(channel) {
            return false;
        }

        let closed = match &mut *state {
            ListenerState::Listening {
                listener,
                attached,
                shutdown,
            } => {
                *attached = attached.saturating_sub(1);
                if *attached == 0 {
                    shutdown.cancel();
                    Some(Arc::downgrade(listener))
                } else {
                    None
                }
            }
            ListenerState::Uninitialized { .. } => None,
        };

        if let Some(previous) = closed {
            *state = ListenerState::Uninitialized { previous };
            info!("Last agent detached, closed listener on {}", self.bind_addr);
        } else {
            debug!(
                "Agent {} detached from {}",
                channel.describe(),
                self.bind_addr
            );
        }

        true
    }

    /// Pick the next attached channel, round-robin
    pub fn next_channel(&self) -> Result<Arc<dyn ControlChannel>, BinderError> {
        self.pool.try_next().ok_or(BinderError::NoAgent)
    }

    pub fn listener(&self) -> Option<Arc<L>> {
        match &*self.lock() {
            ListenerState::Listening { listener, .. } => Some(listener.clone()),
            ListenerState::Uninitialized { .. } => None,
        }
    }

    pub fn is_listening(&self) -> bool {
        matches!(*self.lock(), ListenerState::Listening { .. })
    }

    pub fn attached_agents(&self) -> usize {
        match &*self.lock() {
            ListenerState::Listening { attached, .. } => *attached,
            ListenerState::Uninitialized { .. } => 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MemoryChannel;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const PERIOD: Duration = Duration::from_millis(20);

    fn binding() -> Arc<Binding<String>> {
        Arc::new(Binding::new("127.0.0.1:0".parse().unwrap()).with_probe_timeout(PERIOD))
    }

    async fn wait_until(mut cond: impl FnMut() -> bool) {
        for _ in 0..200 {
            if cond() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached in time");
    }

    #[tokio::test]
    async fn test_first_attach_opens_once() {
        let binding = binding();
        let opens = AtomicUsize::new(0);
        let open = |addr: SocketAddr| {
            opens.fetch_add(1, Ordering::SeqCst);
            Ok::<_, std::io::Error>(format!("listener@{}", addr))
        };

        let (a, _rx_a) = MemoryChannel::new("a");
        let (b, _rx_b) = MemoryChannel::new("b");

        let first = binding.attach(a, open).await.unwrap();
        let second = binding.attach(b, open).await.unwrap();

        assert_eq!(opens.load(Ordering::SeqCst), 1);
        assert!(Arc::ptr_eq(&first.listener, &second.listener));
        assert_eq!(binding.attached_agents(), 2);
        assert_eq!(binding.pool().len(), 2);
    }

    #[tokio::test]
    async fn test_open_failure_leaves_uninitialized() {
        let binding = binding();
        let (a, _rx) = MemoryChannel::new("a");

        let result = binding
            .attach(a, |_| {
                Err::<String, _>(std::io::Error::new(
                    std::io::ErrorKind::AddrInUse,
                    "address in use",
                ))
            })
            .await;

        assert!(matches!(result, Err(BinderError::Bind { .. })));
        assert!(!binding.is_listening());
        assert!(binding.pool().is_empty());
    }

    #[tokio::test]
    async fn test_last_detach_closes_listener() {
        let binding = binding();
        let (a, _rx_a) = MemoryChannel::new("a");
        let (b, _rx_b) = MemoryChannel::new("b");

        let attachment = binding.attach(a.clone(), |_| Ok("l".to_string())).await.unwrap();
        binding.attach(b.clone(), |_| Ok("l".to_string())).await.unwrap();

        a.kill();
        wait_until(|| binding.attached_agents() == 1).await;
        assert!(binding.is_listening());
        assert!(!attachment.shutdown.is_cancelled());
        assert!(matches!(attachment.stopped().await, BinderError::Detached));

        b.kill();
        wait_until(|| !binding.is_listening()).await;
        assert!(attachment.shutdown.is_cancelled());
        assert!(matches!(
            attachment.stopped().await,
            BinderError::ListenerClosed
        ));
        assert!(binding.pool().is_empty());
        assert!(matches!(binding.next_channel(), Err(BinderError::NoAgent)));
    }

    #[tokio::test]
    async fn test_detach_is_idempotent() {
        let binding = binding();
        let (a, _rx_a) = MemoryChannel::new("a");
        let (b, _rx_b) = MemoryChannel::new("b");
        binding.attach(a.clone(), |_| Ok("l".to_string())).await.unwrap();
        binding.attach(b, |_| Ok("l".to_string())).await.unwrap();

        let a: Arc<dyn ControlChannel> = a;
        assert!(binding.detach(&a));
        assert!(!binding.detach(&a));
        assert_eq!(binding.attached_agents(), 1);
        assert!(binding.is_listening());
    }

    #[tokio::test]
    async fn test_reattach_opens_new_generation() {
        let binding = binding();
        let (a, _rx_a) = MemoryChannel::new("a");
        let first = binding.attach(a.clone(), |_| Ok("gen-1".to_string())).await.unwrap();
        let first_shutdown = first.shutdown.clone();
        let first_detached = first.detached.clone();

        a.kill();
        wait_until(|| !binding.is_listening()).await;
        drop(first);

        let (b, _rx_b) = MemoryChannel::new("b");
        let second = binding.attach(b, |_| Ok("gen-2".to_string())).await.unwrap();

        assert!(first_shutdown.is_cancelled());
        assert!(first_detached.is_cancelled());
        assert!(!second.shutdown.is_cancelled());
        assert!(!second.detached.is_cancelled());
        assert_eq!(second.listener.as_str(), "gen-2");
    }

    #[tokio::test]
    async fn test_reattach_waits_for_previous_listener() {
        let binding = binding();
        let (a, _rx_a) = MemoryChannel::new("a");
        let first = binding.attach(a.clone(), |_| Ok("gen-1".to_string())).await.unwrap();

        a.kill();
        wait_until(|| !binding.is_listening()).await;

        // The old loop still holds its listener
        let opened = Arc::new(AtomicUsize::new(0));
        let (b, _rx_b) = MemoryChannel::new("b");
        let reattach = tokio::spawn({
            let binding = binding.clone();
            let opened = opened.clone();
            async move {
                binding
                    .attach(b, move |_| {
                        opened.fetch_add(1, Ordering::SeqCst);
                        Ok("gen-2".to_string())
                    })
                    .await
            }
        });

        tokio::time::sleep(PERIOD * 5).await;
        assert_eq!(opened.load(Ordering::SeqCst), 0);
        assert!(!reattach.is_finished());

        drop(first);
        let second = tokio::time::timeout(Duration::from_secs(1), reattach)
            .await
            .expect("reattach did not resume after the old listener closed")
            .unwrap()
            .unwrap();
        assert_eq!(opened.load(Ordering::SeqCst), 1);
        assert_eq!(second.listener.as_str(), "gen-2");
    }
}
