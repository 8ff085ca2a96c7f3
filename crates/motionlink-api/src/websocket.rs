//! WebSocket [`Connector`] over `tokio-tungstenite`.
//!
//! Each [`connect`](Connector::connect) performs one handshake and spawns two
//! pump tasks: a writer forwarding queued text frames to the socket, and a
//! reader turning socket frames into [`ChannelEvent`]s. Reconnection is not
//! handled here; the session's supervisor owns that policy.

use futures_util::future::BoxFuture;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use url::Url;

use crate::error::Error;
use crate::transport::{Channel, ChannelEvent, CloseReason, Connector, INBOUND_CAPACITY};

/// Connects to a single `ws://` or `wss://` endpoint.
#[derive(Debug, Clone)]
pub struct WebSocketConnector {
    url: Url,
}

impl WebSocketConnector {
    pub fn new(url: Url) -> Result<Self, Error> {
        match url.scheme() {
            "ws" | "wss" => Ok(Self { url }),
            other => Err(Error::WebSocketConnect(format!(
                "unsupported URL scheme '{other}' (expected ws or wss)"
            ))),
        }
    }

    /// Parse and validate an endpoint string.
    pub fn parse(url: &str) -> Result<Self, Error> {
        Self::new(Url::parse(url)?)
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    async fn open(&self) -> Result<Channel, Error> {
        tracing::info!(url = %self.url, "Connecting to WebSocket");

        let (ws_stream, _response) = tokio_tungstenite::connect_async(self.url.as_str())
            .await
            .map_err(|e| Error::WebSocketConnect(e.to_string()))?;

        tracing::info!("WebSocket connected");

        let (mut write, mut read) = ws_stream.split();
        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<String>();
        let (in_tx, in_rx) = mpsc::channel(INBOUND_CAPACITY);

        // Writer: drains the outbound queue; closes the socket when the
        // channel is dropped. A failed write ends the channel for both halves.
        let write_failed = in_tx.clone();
        tokio::spawn(async move {
            while let Some(text) = out_rx.recv().await {
                if let Err(e) = write.send(Message::Text(text.into())).await {
                    tracing::warn!(error = %e, "WebSocket send failed");
                    let _ = write_failed
                        .send(ChannelEvent::Closed(CloseReason::Error(e.to_string())))
                        .await;
                    return;
                }
            }
            let _ = write.close().await;
            tracing::debug!("WebSocket writer exiting");
        });

        // Reader: forwards frames until the socket or the channel goes away.
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    () = in_tx.closed() => break,
                    frame = read.next() => {
                        let event = match frame {
                            Some(Ok(msg)) => match frame_to_event(msg) {
                                Some(event) => event,
                                None => continue,
                            },
                            Some(Err(e)) => ChannelEvent::Closed(CloseReason::Error(e.to_string())),
                            None => {
                                tracing::info!("WebSocket stream ended");
                                ChannelEvent::Closed(CloseReason::Ended)
                            }
                        };
                        let terminal = matches!(event, ChannelEvent::Closed(_));
                        if in_tx.send(event).await.is_err() || terminal {
                            break;
                        }
                    }
                }
            }
            tracing::debug!("WebSocket reader exiting");
        });

        Ok(Channel::new(out_tx, in_rx))
    }
}

impl Connector for WebSocketConnector {
    fn connect(&self) -> BoxFuture<'_, Result<Channel, Error>> {
        Box::pin(self.open())
    }

    fn endpoint(&self) -> String {
        self.url.to_string()
    }
}

/// Map one socket frame to a channel event. Control frames yield `None`.
fn frame_to_event(msg: Message) -> Option<ChannelEvent> {
    match msg {
        Message::Text(text) => Some(ChannelEvent::Message(text.as_str().to_owned())),
        Message::Binary(bytes) => match String::from_utf8(bytes.to_vec()) {
            Ok(text) => Some(ChannelEvent::Message(text)),
            Err(_) => {
                tracing::debug!(len = bytes.len(), "Dropping non-UTF-8 binary frame");
                None
            }
        },
        Message::Close(frame) => {
            let reason = match frame {
                Some(cf) => {
                    tracing::info!(
                        code = %cf.code,
                        reason = %cf.reason,
                        "WebSocket close frame received"
                    );
                    CloseReason::Remote {
                        code: u16::from(cf.code),
                        reason: cf.reason.to_string(),
                    }
                }
                None => {
                    tracing::info!("WebSocket close frame received (no payload)");
                    CloseReason::Ended
                }
            };
            Some(ChannelEvent::Closed(reason))
        }
        Message::Ping(_) => {
            // tungstenite answers pings itself
            tracing::trace!("WebSocket ping");
            None
        }
        Message::Pong(_) | Message::Frame(_) => None,
    }
}
