//! JSON wire protocol spoken with the device-control server.
//!
//! Outbound frames are produced from [`ClientMessage`]. Inbound frames are
//! decoded by [`ServerMessage::parse`], which looks at the `type` field and
//! falls back to treating any frame with a `command_id` as an acknowledgement.
//!
//! Device records arrive as [`WireDevice`]: every field is optional so the
//! same shape serves full snapshots and partial deltas. Unknown fields are
//! kept in `extra` rather than dropped.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

use crate::error::Error;

/// Longest frame body kept in a [`Error::Deserialization`].
const MAX_ERROR_BODY: usize = 512;

// ── Outbound ─────────────────────────────────────────────────────────

/// A frame the client sends to the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Register interest in device broadcasts.
    Subscribe,
    /// Ask for a full `device_list` snapshot.
    GetDevices,
    SetSpeed {
        device_id: String,
        command_id: String,
        value: u8,
    },
    Pause {
        device_id: String,
        command_id: String,
    },
    Resume {
        device_id: String,
        command_id: String,
    },
    StepForward {
        device_id: String,
        command_id: String,
    },
    StepBackward {
        device_id: String,
        command_id: String,
    },
}

impl ClientMessage {
    /// Serialize to the JSON text sent on the channel.
    pub fn encode(&self) -> Result<String, Error> {
        serde_json::to_string(self).map_err(Error::from)
    }

    /// The wire `type` tag of this frame.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Subscribe => "subscribe",
            Self::GetDevices => "get_devices",
            Self::SetSpeed { .. } => "set_speed",
            Self::Pause { .. } => "pause",
            Self::Resume { .. } => "resume",
            Self::StepForward { .. } => "step_forward",
            Self::StepBackward { .. } => "step_backward",
        }
    }

    /// Correlation id carried by device commands.
    pub fn command_id(&self) -> Option<&str> {
        match self {
            Self::Subscribe | Self::GetDevices => None,
            Self::SetSpeed { command_id, .. }
            | Self::Pause { command_id, .. }
            | Self::Resume { command_id, .. }
            | Self::StepForward { command_id, .. }
            | Self::StepBackward { command_id, .. } => Some(command_id),
        }
    }
}

// ── Device record ────────────────────────────────────────────────────

/// Execution state as reported on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WireExecutionState {
    Idle,
    Executing,
    Paused,
    Erroring,
    /// Anything the client does not recognize.
    #[serde(other)]
    Unknown,
}

/// Movement direction as reported on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WireDirection {
    Forward,
    Backward,
    #[serde(other)]
    Unknown,
}

/// A device record as the server sends it.
///
/// Absent fields mean "not reported". For `last_error` an explicit `null`
/// is distinct from absence: `Some(None)` clears a previous fault.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WireDevice {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub speed_percent: Option<f64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution_state: Option<WireExecutionState>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub direction: Option<WireDirection>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub can_pause: Option<bool>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub can_resume: Option<bool>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub can_step_forward: Option<bool>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub can_step_backward: Option<bool>,

    #[serde(
        default,
        deserialize_with = "double_option",
        skip_serializing_if = "Option::is_none"
    )]
    pub last_error: Option<Option<String>>,

    /// All remaining fields the server sends.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

// ── Inbound ──────────────────────────────────────────────────────────

/// `{type:"device_list", devices:[...]}`
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct DeviceList {
    #[serde(default)]
    pub devices: Vec<WireDevice>,
    #[serde(default, deserialize_with = "timestamp")]
    pub timestamp: Option<DateTime<Utc>>,
}

/// Shared shape of `device_state_update`, `device_added` and
/// `playback_event` frames.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct DeviceUpdate {
    #[serde(default)]
    pub device_id: Option<String>,
    #[serde(default)]
    pub state: WireDevice,
    #[serde(default)]
    pub event_type: Option<String>,
    #[serde(default, deserialize_with = "timestamp")]
    pub timestamp: Option<DateTime<Utc>>,
}

impl DeviceUpdate {
    /// The device this update targets: the envelope's `device_id`, else the
    /// embedded record's `id`.
    pub fn target(&self) -> Option<&str> {
        self.device_id.as_deref().or(self.state.id.as_deref())
    }
}

/// `{type:"device_removed", device_id}`
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct DeviceRemoved {
    pub device_id: String,
    #[serde(default, deserialize_with = "timestamp")]
    pub timestamp: Option<DateTime<Utc>>,
}

/// `{command_id, success, error?, ...updatedFields}`
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct CommandAck {
    pub command_id: String,
    #[serde(default)]
    pub success: bool,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default, deserialize_with = "timestamp")]
    pub timestamp: Option<DateTime<Utc>>,
    /// Everything else the server attached to the acknowledgement.
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

/// A decoded inbound frame.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerMessage {
    DeviceList(DeviceList),
    DeviceStateUpdate(DeviceUpdate),
    DeviceAdded(DeviceUpdate),
    PlaybackEvent(DeviceUpdate),
    DeviceRemoved(DeviceRemoved),
    CommandAck(CommandAck),
}

impl ServerMessage {
    /// Decode one text frame.
    pub fn parse(text: &str) -> Result<Self, Error> {
        let value: Value = serde_json::from_str(text).map_err(|e| Error::Deserialization {
            message: e.to_string(),
            body: truncate(text),
        })?;
        Self::from_value(value)
    }

    /// Decode an already-parsed JSON value.
    pub fn from_value(value: Value) -> Result<Self, Error> {
        let kind = value
            .get("type")
            .and_then(Value::as_str)
            .map(str::to_owned);

        match kind.as_deref() {
            Some("device_list") => decode(value).map(Self::DeviceList),
            Some("device_state_update") => decode(value).map(Self::DeviceStateUpdate),
            Some("device_added") => decode(value).map(Self::DeviceAdded),
            Some("playback_event") => decode(value).map(Self::PlaybackEvent),
            Some("device_removed") => decode(value).map(Self::DeviceRemoved),
            Some("command_ack" | "command_result") => decode(value).map(Self::CommandAck),
            // Untyped (or unknown-typed) frames with a correlation id are acks.
            _ if value.get("command_id").is_some() => decode(value).map(Self::CommandAck),
            Some(other) => Err(Error::UnknownMessage {
                kind: other.to_owned(),
            }),
            None => Err(Error::UnknownMessage {
                kind: "<untyped>".into(),
            }),
        }
    }
}

// ── Helpers ──────────────────────────────────────────────────────────

fn decode<T: DeserializeOwned>(value: Value) -> Result<T, Error> {
    let body = truncate(&value.to_string());
    serde_json::from_value(value).map_err(|e| Error::Deserialization {
        message: e.to_string(),
        body,
    })
}

fn truncate(text: &str) -> String {
    if text.len() <= MAX_ERROR_BODY {
        return text.to_owned();
    }
    let mut end = MAX_ERROR_BODY;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}…", &text[..end])
}

/// Keep `null` distinct from an absent field.
fn double_option<'de, D, T>(deserializer: D) -> Result<Option<Option<T>>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    Option::<T>::deserialize(deserializer).map(Some)
}

/// Timestamps arrive either as RFC 3339 strings or epoch milliseconds.
#[derive(Deserialize)]
#[serde(untagged)]
enum WireTimestamp {
    Rfc3339(DateTime<Utc>),
    Millis(i64),
}

fn timestamp<'de, D>(deserializer: D) -> Result<Option<DateTime<Utc>>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Option::<WireTimestamp>::deserialize(deserializer)?;
    Ok(raw.and_then(|ts| match ts {
        WireTimestamp::Rfc3339(dt) => Some(dt),
        WireTimestamp::Millis(ms) => DateTime::<Utc>::from_timestamp_millis(ms),
    }))
}

// ── Tests ────────────────────────────────────────────────────────────

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn encodes_subscribe_and_get_devices() {
        assert_eq!(
            ClientMessage::Subscribe.encode().unwrap(),
            r#"{"type":"subscribe"}"#
        );
        assert_eq!(
            ClientMessage::GetDevices.encode().unwrap(),
            r#"{"type":"get_devices"}"#
        );
    }

    #[test]
    fn encodes_set_speed_with_value() {
        let msg = ClientMessage::SetSpeed {
            device_id: "r1".into(),
            command_id: "c-1".into(),
            value: 40,
        };
        let value: Value = serde_json::from_str(&msg.encode().unwrap()).unwrap();
        assert_eq!(
            value,
            json!({"type": "set_speed", "device_id": "r1", "command_id": "c-1", "value": 40})
        );
        assert_eq!(msg.command_id(), Some("c-1"));
        assert_eq!(msg.kind(), "set_speed");
    }

    #[test]
    fn encodes_step_backward_without_value() {
        let msg = ClientMessage::StepBackward {
            device_id: "r2".into(),
            command_id: "c-9".into(),
        };
        let value: Value = serde_json::from_str(&msg.encode().unwrap()).unwrap();
        assert_eq!(
            value,
            json!({"type": "step_backward", "device_id": "r2", "command_id": "c-9"})
        );
    }

    #[test]
    fn parses_device_list() {
        let raw = json!({
            "type": "device_list",
            "timestamp": "2026-03-01T10:00:00Z",
            "devices": [{
                "id": "r1",
                "display_name": "Robot 1",
                "speed_percent": 70,
                "execution_state": "executing",
                "direction": "forward",
                "can_pause": true,
                "can_resume": false,
                "payload_kg": 4.5
            }]
        });

        let msg = ServerMessage::parse(&raw.to_string()).unwrap();
        let ServerMessage::DeviceList(list) = msg else {
            panic!("expected device list");
        };
        assert_eq!(list.devices.len(), 1);
        let dev = &list.devices[0];
        assert_eq!(dev.id.as_deref(), Some("r1"));
        assert_eq!(dev.speed_percent, Some(70.0));
        assert_eq!(dev.execution_state, Some(WireExecutionState::Executing));
        assert_eq!(dev.direction, Some(WireDirection::Forward));
        assert_eq!(dev.last_error, None);
        assert_eq!(dev.extra["payload_kg"], 4.5);
        assert_eq!(
            list.timestamp.unwrap().to_rfc3339(),
            "2026-03-01T10:00:00+00:00"
        );
    }

    #[test]
    fn parses_state_update_with_millisecond_timestamp() {
        let raw = json!({
            "type": "device_state_update",
            "device_id": "r1",
            "timestamp": 1_767_225_600_000_i64,
            "state": { "execution_state": "paused", "can_resume": true }
        });

        let msg = ServerMessage::parse(&raw.to_string()).unwrap();
        let ServerMessage::DeviceStateUpdate(update) = &msg else {
            panic!("expected state update");
        };
        assert_eq!(update.target(), Some("r1"));
        assert_eq!(update.state.can_resume, Some(true));
        assert_eq!(update.state.speed_percent, None);
        assert_eq!(
            update.timestamp.unwrap().timestamp_millis(),
            1_767_225_600_000
        );
    }

    #[test]
    fn update_target_falls_back_to_embedded_id() {
        let raw = json!({
            "type": "device_added",
            "state": { "id": "r7", "display_name": "Welder" }
        });
        let ServerMessage::DeviceAdded(update) = ServerMessage::parse(&raw.to_string()).unwrap()
        else {
            panic!("expected device_added");
        };
        assert_eq!(update.target(), Some("r7"));
        assert!(update.timestamp.is_none());
    }

    #[test]
    fn parses_playback_event_type() {
        let raw = json!({
            "type": "playback_event",
            "device_id": "r1",
            "event_type": "program_finished",
            "state": { "execution_state": "idle" }
        });
        let ServerMessage::PlaybackEvent(update) = ServerMessage::parse(&raw.to_string()).unwrap()
        else {
            panic!("expected playback event");
        };
        assert_eq!(update.event_type.as_deref(), Some("program_finished"));
        assert_eq!(update.state.execution_state, Some(WireExecutionState::Idle));
    }

    #[test]
    fn untyped_frame_with_command_id_is_an_ack() {
        let raw = json!({
            "command_id": "c-3",
            "success": false,
            "error": "device busy",
            "speed_percent": 40
        });
        let ServerMessage::CommandAck(ack) = ServerMessage::parse(&raw.to_string()).unwrap() else {
            panic!("expected ack");
        };
        assert_eq!(ack.command_id, "c-3");
        assert!(!ack.success);
        assert_eq!(ack.error.as_deref(), Some("device busy"));
        assert_eq!(ack.fields["speed_percent"], 40);
    }

    #[test]
    fn explicit_null_error_clears_fault() {
        let dev: WireDevice = serde_json::from_value(json!({"last_error": null})).unwrap();
        assert_eq!(dev.last_error, Some(None));

        let dev: WireDevice = serde_json::from_value(json!({"last_error": "E-STOP"})).unwrap();
        assert_eq!(dev.last_error, Some(Some("E-STOP".into())));
    }

    #[test]
    fn unrecognized_execution_state_maps_to_unknown() {
        let dev: WireDevice =
            serde_json::from_value(json!({"execution_state": "homing"})).unwrap();
        assert_eq!(dev.execution_state, Some(WireExecutionState::Unknown));
    }

    #[test]
    fn unknown_type_is_rejected() {
        let err = ServerMessage::parse(r#"{"type":"firmware_banner"}"#).unwrap_err();
        assert!(matches!(err, Error::UnknownMessage { ref kind } if kind == "firmware_banner"));
    }

    #[test]
    fn malformed_json_is_a_deserialization_error() {
        let err = ServerMessage::parse("not json at all").unwrap_err();
        assert!(matches!(err, Error::Deserialization { .. }));
        assert!(!err.is_transport());
    }
}
