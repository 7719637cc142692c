//! Server-side endpoint: every inbound message goes straight back out.

use futures::StreamExt;
use tracing::{debug, info, warn};

use crate::{
    error::ChatError,
    session::{Session, Termination},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EchoPolicy {
    /// Send heartbeats back as well. The peer's display filter hides them either way.
    pub echo_heartbeats: bool,
}

impl Default for EchoPolicy {
    fn default() -> Self {
        Self {
            echo_heartbeats: true,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EchoSummary {
    pub echoed: u64,
    pub heartbeats: u64,
    /// `None` when echoing stopped before the peer ended its stream.
    pub termination: Option<Termination>,
}

/// Echoes until the peer completes or fails, then half-closes this side.
pub async fn respond(session: &mut Session, policy: EchoPolicy) -> Result<EchoSummary, ChatError> {
    let mut inbound = session
        .take_inbound()
        .ok_or_else(|| ChatError::ReceiveError("receive sequence already consumed".into()))?;
    let sender = session.sender();
    let mut summary = EchoSummary::default();

    while let Some(message) = inbound.next().await {
        if message.is_heartbeat() {
            summary.heartbeats += 1;
            debug!(timestamp = message.timestamp_millis(), "received heartbeat");
            if !policy.echo_heartbeats {
                continue;
            }
        } else {
            info!(
                sender = message.sender_id(),
                content = message.content(),
                "received message"
            );
        }

        if let Err(error) = sender.send(message) {
            warn!(%error, "failed to echo message");
            break;
        }
        summary.echoed += 1;
    }

    summary.termination = inbound.termination().cloned();
    match &summary.termination {
        Some(Termination::Completed) => debug!(echoed = summary.echoed, "peer completed the stream"),
        Some(Termination::Failed(reason)) => warn!(%reason, "peer stream ended with error"),
        None => {}
    }

    if let Err(error) = sender.finish() {
        debug!(%error, "echo send path already closed");
    }
    Ok(summary)
}
