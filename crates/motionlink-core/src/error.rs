// ── Core error types ──
//
// User-facing errors from motionlink-core. Consumers never see raw frames
// or socket errors; `From<motionlink_api::Error>` translates them. Device
// faults are not errors at all: they live on `DeviceState::last_error`.

use thiserror::Error;

use crate::command::{CommandId, CommandKind};
use crate::model::{DeviceId, ExecutionState};

/// Unified error type for the core crate.
#[derive(Debug, Clone, Error)]
pub enum CoreError {
    // ── Command outcomes ─────────────────────────────────────────────
    /// Rejected locally; nothing was sent.
    #[error("{kind} is not allowed while {device_id} is {state}")]
    Capability {
        device_id: DeviceId,
        kind: CommandKind,
        state: ExecutionState,
    },

    /// The server answered `success: false`.
    #[error("Server rejected command {command_id}: {reason}")]
    ServerRejection { command_id: CommandId, reason: String },

    /// No acknowledgement or covering broadcast arrived in time. The
    /// command may or may not have taken effect.
    #[error("Command {command_id} timed out after {timeout_ms}ms (outcome unknown)")]
    CommandTimeout { command_id: CommandId, timeout_ms: u64 },

    /// The connection the command was sent on dropped before it resolved.
    #[error("Connection lost before command {command_id} was confirmed")]
    ConnectionLost { command_id: CommandId },

    /// The session was closed while the command was outstanding.
    #[error("Session closed")]
    ConnectionClosed,

    /// The device disappeared while the command was outstanding.
    #[error("Device {device_id} was removed")]
    DeviceRemoved { device_id: DeviceId },

    // ── Request errors ───────────────────────────────────────────────
    #[error("Not connected to device server")]
    NotConnected,

    #[error("Device not found: {device_id}")]
    DeviceNotFound { device_id: DeviceId },

    #[error("Validation failed: {message}")]
    ValidationFailed { message: String },

    // ── Connection errors ────────────────────────────────────────────
    #[error("Cannot connect to device server at {url}: {reason}")]
    ConnectionFailed { url: String, reason: String },

    #[error("Timed out after {timeout_ms}ms waiting for {what}")]
    Timeout { what: String, timeout_ms: u64 },

    #[error("Protocol error: {message}")]
    Protocol { message: String },

    // ── Configuration errors ─────────────────────────────────────────
    #[error("Configuration error: {message}")]
    Config { message: String },

    // ── Internal errors ──────────────────────────────────────────────
    #[error("Internal error: {0}")]
    Internal(String),
}

impl CoreError {
    /// Whether the command definitely did not take effect.
    ///
    /// `CommandTimeout` and `ConnectionLost` are uncertain outcomes.
    pub fn is_definite_failure(&self) -> bool {
        !matches!(
            self,
            Self::CommandTimeout { .. } | Self::ConnectionLost { .. }
        )
    }
}

// ── Conversion from transport-layer errors ───────────────────────────

impl From<motionlink_api::Error> for CoreError {
    fn from(err: motionlink_api::Error) -> Self {
        match err {
            motionlink_api::Error::WebSocketConnect(reason) => CoreError::ConnectionFailed {
                url: String::new(),
                reason,
            },
            motionlink_api::Error::WebSocketClosed { code, reason } => {
                CoreError::ConnectionFailed {
                    url: String::new(),
                    reason: format!("WebSocket closed (code {code}): {reason}"),
                }
            }
            motionlink_api::Error::InvalidUrl(e) => CoreError::Config {
                message: format!("Invalid URL: {e}"),
            },
            motionlink_api::Error::ChannelClosed => CoreError::NotConnected,
            motionlink_api::Error::Deserialization { message, body: _ } => CoreError::Protocol {
                message: format!("Deserialization error: {message}"),
            },
            motionlink_api::Error::UnknownMessage { kind } => CoreError::Protocol {
                message: format!("Unknown message type: {kind}"),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeout_is_distinct_from_rejection() {
        let id = CommandId::from("c-1");
        let timeout = CoreError::CommandTimeout {
            command_id: id.clone(),
            timeout_ms: 5000,
        };
        let rejected = CoreError::ServerRejection {
            command_id: id,
            reason: "busy".into(),
        };
        assert!(!timeout.is_definite_failure());
        assert!(rejected.is_definite_failure());
        assert!(timeout.to_string().contains("outcome unknown"));
    }

    #[test]
    fn capability_message_names_state() {
        let err = CoreError::Capability {
            device_id: "r1".into(),
            kind: CommandKind::Pause,
            state: ExecutionState::Idle,
        };
        assert_eq!(err.to_string(), "pause is not allowed while r1 is idle");
    }

    #[test]
    fn transport_errors_map_to_connection_failures() {
        let err: CoreError = motionlink_api::Error::WebSocketConnect("refused".into()).into();
        assert!(matches!(
            err,
            CoreError::ConnectionFailed { ref reason, .. } if reason == "refused"
        ));
    }
}
