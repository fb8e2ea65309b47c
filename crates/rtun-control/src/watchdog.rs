//! Liveness monitoring for agent control channels
//!
//! A watchdog probes one channel every `timeout` period. The first failed or
//! expired probe runs the cleanup closure and ends the task.

use crate::channel::ControlChannel;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::debug;

/// Start watching `channel`; `cleanup` runs at most once.
///
/// The task ends right after the cleanup. Aborting the handle stops the
/// watch without running it.
pub fn spawn_watchdog<F>(
    channel: Arc<dyn ControlChannel>,
    timeout: Duration,
    cleanup: F,
) -> JoinHandle<()>
where
    F: FnOnce() + Send + 'static,
{
    tokio::spawn(async move {
        let label = channel.describe();

        loop {
            match tokio::time::timeout(timeout, channel.probe(timeout)).await {
                Ok(Ok(())) => tokio::time::sleep(timeout).await,
                Ok(Err(e)) => {
                    debug!("Probe failed for {}: {}", label, e);
                    break;
                }
                Err(_) => {
                    debug!("Probe for {} timed out after {:?}", label, timeout);
                    break;
                }
            }
        }

        cleanup();
    })
}
