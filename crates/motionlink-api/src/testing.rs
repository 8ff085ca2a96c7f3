//! In-memory [`Connector`] for driving a session without a socket.
//!
//! [`pair`] returns a connector and the [`MemoryServer`] that sees every
//! connection it opens. Each accepted [`MemoryPeer`] plays the server side
//! of one channel: it reads what the client sent and injects frames back.
//!
//! ```rust,ignore
//! let (connector, mut server) = motionlink_api::testing::pair();
//! // hand `connector` to a session ...
//! let mut peer = server.accept().await.unwrap();
//! assert_eq!(peer.recv_json().await.unwrap()["type"], "subscribe");
//! peer.send_json(&json!({"type": "device_list", "devices": []})).await;
//! ```

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use futures_util::future::BoxFuture;
use serde_json::Value;
use tokio::sync::mpsc;

use crate::error::Error;
use crate::transport::{Channel, ChannelEvent, CloseReason, Connector, INBOUND_CAPACITY};

#[derive(Debug, Default)]
struct Counters {
    attempts: AtomicU32,
    refuse: AtomicU32,
}

/// Create a connected connector/server pair.
pub fn pair() -> (MemoryConnector, MemoryServer) {
    let (accept_tx, accept_rx) = mpsc::unbounded_channel();
    let counters = Arc::new(Counters::default());
    (
        MemoryConnector {
            accept_tx,
            counters: Arc::clone(&counters),
        },
        MemoryServer {
            accept_rx,
            counters,
        },
    )
}

// ── Client side ──────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct MemoryConnector {
    accept_tx: mpsc::UnboundedSender<MemoryPeer>,
    counters: Arc<Counters>,
}

impl Connector for MemoryConnector {
    fn connect(&self) -> BoxFuture<'_, Result<Channel, Error>> {
        Box::pin(async move {
            self.counters.attempts.fetch_add(1, Ordering::SeqCst);

            let refused = self
                .counters
                .refuse
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if refused {
                return Err(Error::WebSocketConnect("connection refused".into()));
            }

            let (out_tx, out_rx) = mpsc::unbounded_channel();
            let (in_tx, in_rx) = mpsc::channel(INBOUND_CAPACITY);
            let peer = MemoryPeer {
                outbound: out_rx,
                inbound: in_tx,
            };
            self.accept_tx
                .send(peer)
                .map_err(|_| Error::WebSocketConnect("memory server is gone".into()))?;

            Ok(Channel::new(out_tx, in_rx))
        })
    }

    fn endpoint(&self) -> String {
        "memory://".into()
    }
}

// ── Server side ──────────────────────────────────────────────────────

#[derive(Debug)]
pub struct MemoryServer {
    accept_rx: mpsc::UnboundedReceiver<MemoryPeer>,
    counters: Arc<Counters>,
}

impl MemoryServer {
    /// Wait for the next connection. `None` once the connector is dropped.
    pub async fn accept(&mut self) -> Option<MemoryPeer> {
        self.accept_rx.recv().await
    }

    /// A connection that has already been opened, if any.
    pub fn try_accept(&mut self) -> Option<MemoryPeer> {
        self.accept_rx.try_recv().ok()
    }

    /// Fail the next `n` connection attempts.
    pub fn refuse_next(&self, n: u32) {
        self.counters.refuse.store(n, Ordering::SeqCst);
    }

    /// Total connection attempts, refused ones included.
    pub fn attempts(&self) -> u32 {
        self.counters.attempts.load(Ordering::SeqCst)
    }
}

/// Server end of one memory channel. Dropping it ends the stream.
#[derive(Debug)]
pub struct MemoryPeer {
    outbound: mpsc::UnboundedReceiver<String>,
    inbound: mpsc::Sender<ChannelEvent>,
}

impl MemoryPeer {
    /// Deliver one text frame to the client.
    pub async fn send_text(&self, text: impl Into<String>) {
        let _ = self.inbound.send(ChannelEvent::Message(text.into())).await;
    }

    pub async fn send_json(&self, value: &Value) {
        self.send_text(value.to_string()).await;
    }

    /// Next frame the client sent. `None` once the client closed its side.
    pub async fn recv(&mut self) -> Option<String> {
        self.outbound.recv().await
    }

    /// Next frame the client sent, parsed as JSON.
    pub async fn recv_json(&mut self) -> Option<Value> {
        let text = self.recv().await?;
        serde_json::from_str(&text).ok()
    }

    /// A frame that has already been sent, without waiting.
    pub fn try_recv(&mut self) -> Option<String> {
        self.outbound.try_recv().ok()
    }

    /// Drain every frame sent so far.
    pub fn drain(&mut self) -> Vec<String> {
        std::iter::from_fn(|| self.try_recv()).collect()
    }

    /// Close the channel with a reason, as a server-side drop would.
    pub async fn close(self, reason: CloseReason) {
        let _ = self.inbound.send(ChannelEvent::Closed(reason)).await;
    }

    /// Break the client's write half while leaving its read half open,
    /// like a socket whose writes start failing before the reader notices.
    pub fn fail_writes(&mut self) {
        let (_, closed) = mpsc::unbounded_channel();
        self.outbound = closed;
    }

    /// Whether the client still holds its end.
    pub fn is_client_open(&self) -> bool {
        !self.inbound.is_closed()
    }
}
