use thiserror::Error;

/// Top-level error type for the `motionlink-api` crate.
///
/// Covers every failure mode below the synchronization core: opening the
/// channel, the channel going away, and frames that cannot be decoded.
/// `motionlink-core` maps these into user-facing diagnostics.
#[derive(Debug, Error)]
pub enum Error {
    // ── Transport ───────────────────────────────────────────────────
    /// The WebSocket handshake or an established stream failed.
    #[error("WebSocket connection failed: {0}")]
    WebSocketConnect(String),

    /// The server sent a close frame.
    #[error("WebSocket closed (code {code}): {reason}")]
    WebSocketClosed { code: u16, reason: String },

    /// URL parsing error.
    #[error("Invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    /// The channel was already closed when a frame was sent on it.
    #[error("Transport channel is closed")]
    ChannelClosed,

    // ── Protocol ────────────────────────────────────────────────────
    /// A frame could not be decoded into a known message shape.
    #[error("Deserialization error: {message}")]
    Deserialization { message: String, body: String },

    /// The frame was valid JSON but carries no recognizable type.
    #[error("Unknown message type: {kind}")]
    UnknownMessage { kind: String },
}

impl Error {
    /// Returns `true` if the failure happened at the transport level
    /// (as opposed to a single undecodable frame).
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            Self::WebSocketConnect(_) | Self::WebSocketClosed { .. } | Self::ChannelClosed
        )
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::Deserialization {
            message: err.to_string(),
            body: String::new(),
        }
    }
}
