//! Task scheduling substrate
//!
//! Small wrapper over tokio spawning that gives every background task a name
//! and ties it to a shared cancellation token, so process shutdown cancels
//! outstanding poll loops and backoff timers in one place. This is the
//! opaque "schedule(fn, delay)" capability the monitor components depend on.

use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::debug;

#[derive(Clone, Default)]
pub struct TaskScheduler {
    token: CancellationToken,
}

impl TaskScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Spawn a named task that is dropped when the scheduler shuts down
    pub fn spawn<F>(&self, name: &str, fut: F) -> tokio::task::JoinHandle<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let token = self.token.clone();
        let name = name.to_string();
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {
                    debug!(task = %name, "task cancelled by scheduler shutdown");
                }
                _ = fut => {}
            }
        })
    }

    /// Spawn a named task after a delay; both the delay and the task itself
    /// are cancelled by scheduler shutdown.
    pub fn spawn_after<F>(&self, name: &str, delay: Duration, fut: F) -> tokio::task::JoinHandle<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let token = self.token.clone();
        let name = name.to_string();
        // The deadline is fixed at scheduling time, not at the task's first poll
        let deadline = tokio::time::Instant::now() + delay;
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {
                    debug!(task = %name, "delayed task cancelled before firing");
                    return;
                }
                _ = tokio::time::sleep_until(deadline) => {}
            }
            tokio::select! {
                _ = token.cancelled() => {
                    debug!(task = %name, "task cancelled by scheduler shutdown");
                }
                _ = fut => {}
            }
        })
    }

    /// Cancel all scheduled and running tasks
    pub fn shutdown(&self) {
        self.token.cancel();
    }
}
