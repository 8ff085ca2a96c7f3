//! The transport seam between the synchronization core and a socket.
//!
//! A [`Connector`] opens one [`Channel`] per connection attempt. The channel
//! is message-oriented and ordered: text frames go out through
//! [`Channel::send`], frames and the final close notification come back
//! through [`Channel::recv`]. Once [`ChannelEvent::Closed`] has been
//! delivered the channel is dead and a new one must be opened.

use std::fmt;

use futures_util::future::BoxFuture;
use tokio::sync::mpsc;

use crate::error::Error;

/// Inbound buffer depth per channel.
pub const INBOUND_CAPACITY: usize = 256;

// ── Events ───────────────────────────────────────────────────────────

/// Something the remote side did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    /// One text frame.
    Message(String),
    /// The channel is gone. No further events follow.
    Closed(CloseReason),
}

/// Why a channel closed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// The server sent a close frame.
    Remote { code: u16, reason: String },
    /// The underlying stream failed.
    Error(String),
    /// The stream ended without a close frame.
    Ended,
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Remote { code, reason } if reason.is_empty() => {
                write!(f, "closed by server ({code})")
            }
            Self::Remote { code, reason } => write!(f, "closed by server ({code}): {reason}"),
            Self::Error(e) => write!(f, "transport error: {e}"),
            Self::Ended => f.write_str("stream ended"),
        }
    }
}

// ── Channel ──────────────────────────────────────────────────────────

/// One open connection.
///
/// Dropping the channel closes the outbound half, which the connector
/// turns into a clean close of the underlying socket.
#[derive(Debug)]
pub struct Channel {
    outbound: mpsc::UnboundedSender<String>,
    inbound: mpsc::Receiver<ChannelEvent>,
}

impl Channel {
    /// Assemble a channel from its two halves. Connectors own the other ends.
    pub fn new(
        outbound: mpsc::UnboundedSender<String>,
        inbound: mpsc::Receiver<ChannelEvent>,
    ) -> Self {
        Self { outbound, inbound }
    }

    /// Queue one text frame. Never blocks.
    pub fn send(&self, text: String) -> Result<(), Error> {
        self.outbound.send(text).map_err(|_| Error::ChannelClosed)
    }

    /// Next event from the remote side.
    ///
    /// A connector that vanished without reporting a reason is surfaced as
    /// [`CloseReason::Ended`].
    pub async fn recv(&mut self) -> ChannelEvent {
        self.inbound
            .recv()
            .await
            .unwrap_or(ChannelEvent::Closed(CloseReason::Ended))
    }

    /// Whether the outbound half can still accept frames.
    pub fn is_open(&self) -> bool {
        !self.outbound.is_closed()
    }
}

// ── Connector ────────────────────────────────────────────────────────

/// Opens channels to one server.
pub trait Connector: Send + Sync {
    /// Open a fresh channel. Each call is an independent connection.
    fn connect(&self) -> BoxFuture<'_, Result<Channel, Error>>;

    /// Human-readable description of where this connector points.
    fn endpoint(&self) -> String;
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn recv_reports_ended_when_sender_dropped() {
        let (out_tx, _out_rx) = mpsc::unbounded_channel();
        let (in_tx, in_rx) = mpsc::channel(4);
        let mut channel = Channel::new(out_tx, in_rx);

        in_tx
            .send(ChannelEvent::Message("{}".into()))
            .await
            .unwrap();
        drop(in_tx);

        assert_eq!(channel.recv().await, ChannelEvent::Message("{}".into()));
        assert_eq!(
            channel.recv().await,
            ChannelEvent::Closed(CloseReason::Ended)
        );
    }

    #[test]
    fn send_fails_once_peer_is_gone() {
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (_in_tx, in_rx) = mpsc::channel(4);
        let channel = Channel::new(out_tx, in_rx);
        drop(out_rx);

        assert!(!channel.is_open());
        assert!(matches!(
            channel.send("x".into()),
            Err(Error::ChannelClosed)
        ));
    }

    #[test]
    fn close_reason_display() {
        let remote = CloseReason::Remote {
            code: 1001,
            reason: "going away".into(),
        };
        assert_eq!(remote.to_string(), "closed by server (1001): going away");
        assert_eq!(CloseReason::Ended.to_string(), "stream ended");
    }
}
