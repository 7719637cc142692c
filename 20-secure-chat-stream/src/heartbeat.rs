//! Application-level liveness messages.
//!
//! The timer holds only a weak send handle and never propagates a failure:
//! a heartbeat that cannot be enqueued is logged and the next tick tries again.

use std::time::Duration;

use tokio::{task::JoinHandle, time::MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, info_span, warn};

use crate::{message::ChatMessage, session::WeakSendHandle};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HeartbeatStats {
    pub sent: u64,
    pub failed: u64,
}

/// A running heartbeat. Cancel it with [`HeartbeatTimer::cancel`] before the channel goes away.
pub struct HeartbeatTimer {
    cancel: CancellationToken,
    task: JoinHandle<HeartbeatStats>,
}

impl HeartbeatTimer {
    /// Starts ticking immediately, then every `interval`.
    pub fn start(sender: WeakSendHandle, interval: Duration) -> Self {
        let cancel = CancellationToken::new();
        let span = info_span!("heartbeat", ?interval);
        let task = tokio::spawn(run(sender, interval, cancel.clone()).instrument(span));
        Self { cancel, task }
    }

    /// Stops the timer and waits for its task to exit. No tick is enqueued after this returns.
    pub async fn cancel(mut self) -> HeartbeatStats {
        self.cancel.cancel();
        match (&mut self.task).await {
            Ok(stats) => stats,
            Err(error) => {
                warn!(?error, "heartbeat task ended abnormally");
                HeartbeatStats::default()
            }
        }
    }
}

impl Drop for HeartbeatTimer {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn run(sender: WeakSendHandle, interval: Duration, cancel: CancellationToken) -> HeartbeatStats {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut stats = HeartbeatStats::default();

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => beat(&sender, &mut stats),
        }
    }

    debug!(sent = stats.sent, failed = stats.failed, "heartbeat stopped");
    stats
}

fn beat(sender: &WeakSendHandle, stats: &mut HeartbeatStats) {
    let Some(handle) = sender.upgrade() else {
        stats.failed += 1;
        warn!("failed to send heartbeat: send path already released");
        return;
    };

    match handle.send(ChatMessage::heartbeat()) {
        Ok(()) => {
            stats.sent += 1;
            debug!("heartbeat sent");
        }
        Err(error) => {
            stats.failed += 1;
            warn!(%error, "failed to send heartbeat");
        }
    }
}
