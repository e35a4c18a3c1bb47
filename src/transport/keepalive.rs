//! Ping/pong keepalive monitor.
//!
//! Transports that never report a dead peer (message channels, see
//! [`TransportKind::reports_remote_close`](super::TransportKind::reports_remote_close))
//! are watched by a [`Keepalive`]: every `interval` it sends a ping and
//! waits up to `deadline` for the pong. A missed pong, or a ping that
//! cannot be sent, fires the timeout callback once and stops the monitor.
//!
//! At most one ping is outstanding at any time.

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior, interval_at, timeout};
use tracing::{trace, warn};

use crate::error::Error;
use crate::protocol::Message;

use super::Transport;

// ============================================================================
// Constants
// ============================================================================

/// Default time between pings.
pub const DEFAULT_PING_INTERVAL: Duration = Duration::from_millis(1000);

/// Default time to wait for a pong.
pub const DEFAULT_PONG_DEADLINE: Duration = Duration::from_millis(1000);

// ============================================================================
// KeepaliveConfig
// ============================================================================

/// Keepalive timing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeepaliveConfig {
    /// Time between pings.
    pub interval: Duration,
    /// Time to wait for the pong before declaring the peer dead.
    pub deadline: Duration,
}

impl Default for KeepaliveConfig {
    fn default() -> Self {
        Self {
            interval: DEFAULT_PING_INTERVAL,
            deadline: DEFAULT_PONG_DEADLINE,
        }
    }
}

impl KeepaliveConfig {
    /// Creates a config with explicit timing.
    #[inline]
    #[must_use]
    pub const fn new(interval: Duration, deadline: Duration) -> Self {
        Self { interval, deadline }
    }
}

// ============================================================================
// Keepalive
// ============================================================================

/// Running keepalive monitor. Dropping it stops the monitor.
pub struct Keepalive {
    task: JoinHandle<()>,
}

impl fmt::Debug for Keepalive {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Keepalive")
            .field("running", &self.is_running())
            .finish()
    }
}

impl Keepalive {
    /// Starts monitoring `transport`.
    ///
    /// `on_timeout` runs at most once, with
    /// [`Error::HeartbeatTimeout`] or the send error.
    ///
    /// Must be called within a tokio runtime.
    pub fn spawn(
        transport: Arc<dyn Transport>,
        config: KeepaliveConfig,
        on_timeout: impl FnOnce(Error) + Send + 'static,
    ) -> Self {
        let task = tokio::spawn(Self::run(transport, config, on_timeout));
        Self { task }
    }

    /// Returns `true` until the monitor has fired or been stopped.
    #[inline]
    #[must_use]
    pub fn is_running(&self) -> bool {
        !self.task.is_finished()
    }

    /// Stops the monitor.
    #[inline]
    pub fn stop(&self) {
        self.task.abort();
    }

    async fn run(
        transport: Arc<dyn Transport>,
        config: KeepaliveConfig,
        on_timeout: impl FnOnce(Error) + Send + 'static,
    ) {
        let (pong_tx, mut pong_rx) = mpsc::unbounded_channel();
        let _subscription = transport.subscribe(Arc::new(move |message: &Message| {
            if message.is_pong() {
                let _ = pong_tx.send(());
            }
        }));

        let mut ticker = interval_at(Instant::now() + config.interval, config.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;

            // Pongs that arrived after an earlier deadline must not satisfy this ping.
            while pong_rx.try_recv().is_ok() {}

            if let Err(e) = transport.send(Message::ping()) {
                warn!(error = %e, "Ping could not be sent");
                on_timeout(e);
                return;
            }
            trace!("Ping sent");

            match timeout(config.deadline, pong_rx.recv()).await {
                Ok(Some(())) => trace!("Pong received"),
                Ok(None) => return,
                Err(_) => {
                    let deadline_ms = config.deadline.as_millis() as u64;
                    warn!(deadline_ms, kind = %transport.kind(), "Pong not received in time");
                    on_timeout(Error::heartbeat_timeout(deadline_ms));
                    return;
                }
            }
        }
    }
}

impl Drop for Keepalive {
    fn drop(&mut self) {
        self.task.abort();
    }
}

// ============================================================================
// Tests
// ============================================================================
