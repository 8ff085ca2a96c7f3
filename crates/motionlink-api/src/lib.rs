// motionlink-api: wire protocol and transport channel for device-control servers

pub mod error;
pub mod protocol;
#[cfg(any(test, feature = "testing"))]
pub mod testing;
pub mod transport;
pub mod websocket;

pub use error::Error;
pub use protocol::{ClientMessage, ServerMessage, WireDevice};
pub use transport::{Channel, ChannelEvent, CloseReason, Connector};
pub use websocket::WebSocketConnector;
