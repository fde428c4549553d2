//! One registered agent session.

use std::fmt;
use std::time::{Instant, SystemTime};

use thiserror::Error;
use tokio::sync::mpsc;

use super::protocol::ProtocolMessage;

/// Opaque handle identifying one agent control channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChannelId(pub(crate) u64);

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ch-{}", self.0)
    }
}

/// Why a message could not be handed to an agent.
#[derive(Debug, Error)]
pub enum SendError {
    #[error("control channel closed")]
    Closed,
    #[error("control channel backlog full")]
    Full,
    #[error("failed to encode message: {0}")]
    Encode(#[from] serde_json::Error),
}

/// A live tunnel: the subdomain an agent claimed and the channel it claimed it on.
///
/// Outbound frames go through a bounded queue drained by the channel's writer
/// task, so `send` never touches the socket directly.
#[derive(Debug)]
pub struct TunnelConnection {
    subdomain: String,
    channel: ChannelId,
    outbound: mpsc::Sender<String>,
    connected_at: SystemTime,
    connected_since: Instant,
}

impl TunnelConnection {
    pub fn new(subdomain: String, channel: ChannelId, outbound: mpsc::Sender<String>) -> Self {
        Self {
            subdomain,
            channel,
            outbound,
            connected_at: SystemTime::now(),
            connected_since: Instant::now(),
        }
    }

    pub fn subdomain(&self) -> &str {
        &self.subdomain
    }

    pub fn channel(&self) -> ChannelId {
        self.channel
    }

    /// Wall-clock registration time, for reporting.
    pub fn connected_at(&self) -> SystemTime {
        self.connected_at
    }

    /// Monotonic registration time, for durations.
    pub fn connected_since(&self) -> Instant {
        self.connected_since
    }

    /// Serialize `message` and queue it on the control channel.
    ///
    /// Never waits: a full backlog is reported like a closed channel, and
    /// nothing is retried.
    pub fn send(&self, message: &ProtocolMessage) -> Result<(), SendError> {
        let text = message.encode()?;
        self.outbound.try_send(text).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => SendError::Full,
            mpsc::error::TrySendError::Closed(_) => SendError::Closed,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_send_serializes_to_queue() {
        let (tx, mut rx) = mpsc::channel(4);
        let conn = TunnelConnection::new("alpha".into(), ChannelId(1), tx);
        conn.send(&ProtocolMessage::error("nope")).unwrap();
        let text = rx.recv().await.unwrap();
        assert_eq!(text, r#"{"type":"error","error":"nope"}"#);
    }

    #[test]
    fn test_send_on_closed_channel_fails() {
        let (tx, rx) = mpsc::channel(4);
        drop(rx);
        let conn = TunnelConnection::new("alpha".into(), ChannelId(1), tx);
        let err = conn.send(&ProtocolMessage::error("nope")).unwrap_err();
        assert!(matches!(err, SendError::Closed));
    }

    #[test]
    fn test_send_on_full_backlog_fails() {
        let (tx, _rx) = mpsc::channel(1);
        let conn = TunnelConnection::new("alpha".into(), ChannelId(1), tx);
        conn.send(&ProtocolMessage::error("one")).unwrap();
        let err = conn.send(&ProtocolMessage::error("two")).unwrap_err();
        assert!(matches!(err, SendError::Full));
    }

    #[test]
    fn test_channel_id_display() {
        assert_eq!(ChannelId(7).to_string(), "ch-7");
    }
}
