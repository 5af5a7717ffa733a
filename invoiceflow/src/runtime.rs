//! Process-level plumbing for a stage binary.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::Notify;
use tokio::task::JoinSet;
use tracing::info;

use crate::broker::consumer::{Consumer, MessageHandler};

/// Cooperative shutdown flag shared by everything in a stage process.
/// Cancellation is sticky: once cancelled, always cancelled.
#[derive(Clone, Default)]
pub struct ShutdownToken {
    inner: Arc<TokenInner>,
}

#[derive(Default)]
struct TokenInner {
    cancelled: AtomicBool,
    notify: Notify,
}

impl ShutdownToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        if !self.inner.cancelled.swap(true, Ordering::SeqCst) {
            self.inner.notify.notify_waiters();
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    /// Resolve once the token is cancelled. Safe against the wake racing
    /// the flag: the flag is rechecked after registering for notification.
    pub async fn cancelled(&self) {
        while !self.is_cancelled() {
            let notified = self.inner.notify.notified();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }
}

/// Owns the consumer tasks of one stage process and propagates the first
/// failure out of any of them.
pub struct StageRuntime {
    shutdown: ShutdownToken,
    tasks: JoinSet<anyhow::Result<()>>,
}

impl Default for StageRuntime {
    fn default() -> Self {
        Self::new()
    }
}

impl StageRuntime {
    pub fn new() -> Self {
        Self {
            shutdown: ShutdownToken::new(),
            tasks: JoinSet::new(),
        }
    }

    pub fn shutdown_token(&self) -> ShutdownToken {
        self.shutdown.clone()
    }

    pub fn spawn_consumer<H: MessageHandler>(&mut self, consumer: Consumer<H>) {
        self.tasks.spawn(async move { consumer.run().await });
    }

    /// Cancel the shutdown token when the process receives ctrl-c.
    pub fn trigger_on_ctrl_c(&self) {
        let token = self.shutdown.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("ctrl-c received, draining");
                token.cancel();
            }
        });
    }

    /// Wait for every consumer to finish. Consumers only return once the
    /// shutdown token fires or the broker setup fails outright.
    pub async fn run_until_finished(mut self) -> anyhow::Result<()> {
        while let Some(joined) = self.tasks.join_next().await {
            joined??;
        }
        Ok(())
    }
}
