// ── Runtime session configuration ──
//
// These types describe *how* a session talks to a device server and how
// patient it is. They never touch disk: the CLI (via motionlink-config)
// builds a `SessionConfig` and hands it in.

use std::time::Duration;

use url::Url;

pub use crate::supervisor::{BackoffStrategy, ReconnectConfig};

/// Configuration for one session against one server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionConfig {
    /// WebSocket endpoint (e.g., `ws://cell-4.local:9000/ws`).
    pub url: Url,
    /// How long an issued command may wait for an ack or covering broadcast.
    pub command_timeout: Duration,
    /// A device with outstanding commands and no broadcast for this long is
    /// stale. Also the minimum spacing of automatic refreshes per device.
    pub staleness_window: Duration,
    /// A device with no pending commands is only synchronized if it was
    /// updated within this window. `None` means updates never age out.
    pub freshness_window: Option<Duration>,
    /// How often the loop re-evaluates staleness.
    pub sweep_interval: Duration,
    pub reconnect: ReconnectConfig,
}

impl SessionConfig {
    pub fn new(url: Url) -> Self {
        Self {
            url,
            ..Self::default()
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            url: "ws://127.0.0.1:9000/ws"
                .parse()
                .expect("default URL is valid"),
            command_timeout: Duration::from_secs(5),
            staleness_window: Duration::from_secs(3),
            freshness_window: None,
            sweep_interval: Duration::from_secs(1),
            reconnect: ReconnectConfig::default(),
        }
    }
}
