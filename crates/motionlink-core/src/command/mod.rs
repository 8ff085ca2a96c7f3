// ── Command API ──
//
// Every device operation flows through the `Command` enum. The session's
// event loop validates it against the capability gate, assigns it to the
// manager for tracking, and sends its wire form on the current channel.

pub mod manager;
pub mod pending;

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use motionlink_api::ClientMessage;

use crate::error::CoreError;
use crate::model::DeviceId;

pub use manager::CommandManager;
pub use pending::PendingSet;

/// Maximum value accepted by `SetSpeed`.
pub const MAX_SPEED_PERCENT: u8 = 100;

/// A command envelope sent through the session's request channel.
/// Contains the command and a oneshot response channel.
pub(crate) struct CommandEnvelope {
    pub id: CommandId,
    pub command: Command,
    pub response_tx: tokio::sync::oneshot::Sender<CommandResult>,
}

/// Outcome delivered to the caller of `Session::issue`.
pub type CommandResult = Result<CommandReceipt, CoreError>;

// ── Command ──────────────────────────────────────────────────────────

/// A request to change device state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    SetSpeed { device_id: DeviceId, percent: u8 },
    Pause { device_id: DeviceId },
    Resume { device_id: DeviceId },
    StepForward { device_id: DeviceId },
    StepBackward { device_id: DeviceId },
    /// Ask the server for a fresh full snapshot.
    RefreshAll,
}

impl Command {
    pub fn kind(&self) -> CommandKind {
        match self {
            Self::SetSpeed { .. } => CommandKind::SetSpeed,
            Self::Pause { .. } => CommandKind::Pause,
            Self::Resume { .. } => CommandKind::Resume,
            Self::StepForward { .. } => CommandKind::StepForward,
            Self::StepBackward { .. } => CommandKind::StepBackward,
            Self::RefreshAll => CommandKind::RefreshAll,
        }
    }

    /// Target device. `None` for `RefreshAll`.
    pub fn device_id(&self) -> Option<&DeviceId> {
        match self {
            Self::SetSpeed { device_id, .. }
            | Self::Pause { device_id }
            | Self::Resume { device_id }
            | Self::StepForward { device_id }
            | Self::StepBackward { device_id } => Some(device_id),
            Self::RefreshAll => None,
        }
    }

    /// Local parameter checks that do not depend on device state.
    pub fn validate(&self) -> Result<(), CoreError> {
        match self {
            Self::SetSpeed { percent, .. } if *percent > MAX_SPEED_PERCENT => {
                Err(CoreError::ValidationFailed {
                    message: format!(
                        "speed must be between 0 and {MAX_SPEED_PERCENT} percent (got {percent})"
                    ),
                })
            }
            _ => Ok(()),
        }
    }

    /// Wire frame carrying this command under `id`.
    pub fn to_wire(&self, id: &CommandId) -> ClientMessage {
        let command_id = id.to_string();
        match self {
            Self::SetSpeed { device_id, percent } => ClientMessage::SetSpeed {
                device_id: device_id.to_string(),
                command_id,
                value: *percent,
            },
            Self::Pause { device_id } => ClientMessage::Pause {
                device_id: device_id.to_string(),
                command_id,
            },
            Self::Resume { device_id } => ClientMessage::Resume {
                device_id: device_id.to_string(),
                command_id,
            },
            Self::StepForward { device_id } => ClientMessage::StepForward {
                device_id: device_id.to_string(),
                command_id,
            },
            Self::StepBackward { device_id } => ClientMessage::StepBackward {
                device_id: device_id.to_string(),
                command_id,
            },
            Self::RefreshAll => ClientMessage::GetDevices,
        }
    }
}

/// Discriminant of [`Command`].
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
    strum::EnumIter,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case", ascii_case_insensitive)]
pub enum CommandKind {
    SetSpeed,
    Pause,
    Resume,
    StepForward,
    StepBackward,
    RefreshAll,
}

// ── Identity ─────────────────────────────────────────────────────────

/// Client-generated correlation id, unique per session.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CommandId(String);

impl CommandId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CommandId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for CommandId {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

impl From<String> for CommandId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Hands out `"<session>-<n>"` ids. Safe to call from any task.
#[derive(Debug)]
pub struct CommandIdAllocator {
    prefix: String,
    next: AtomicU64,
}

impl CommandIdAllocator {
    pub fn new() -> Self {
        let mut prefix = uuid::Uuid::new_v4().simple().to_string();
        prefix.truncate(8);
        Self::with_prefix(prefix)
    }

    pub fn with_prefix(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            next: AtomicU64::new(1),
        }
    }

    pub fn allocate(&self) -> CommandId {
        let n = self.next.fetch_add(1, Ordering::Relaxed);
        CommandId(format!("{}-{n}", self.prefix))
    }
}

impl Default for CommandIdAllocator {
    fn default() -> Self {
        Self::new()
    }
}

// ── Lifecycle ────────────────────────────────────────────────────────

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, strum::Display,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum DeliveryState {
    Created,
    Sent,
    Confirmed,
    Rejected,
    TimedOut,
}

impl DeliveryState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Confirmed | Self::Rejected | Self::TimedOut)
    }
}

/// How a command came to be confirmed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "by", rename_all = "snake_case")]
pub enum Confirmation {
    /// The server acknowledged the id; `fields` holds whatever it attached.
    Ack { fields: Map<String, Value> },
    /// An authoritative broadcast newer than the command covered it.
    Broadcast { at: DateTime<Utc> },
}

/// Successful outcome of one command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandReceipt {
    pub command_id: CommandId,
    pub kind: CommandKind,
    pub device_id: Option<DeviceId>,
    pub issued_at: DateTime<Utc>,
    pub confirmed_at: DateTime<Utc>,
    pub confirmation: Confirmation,
}

/// Read-only view of one outstanding command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PendingCommand {
    pub command_id: CommandId,
    pub kind: CommandKind,
    pub device_id: Option<DeviceId>,
    pub issued_at: DateTime<Utc>,
    pub delivery_state: DeliveryState,
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn allocator_ids_are_unique_and_prefixed() {
        let alloc = CommandIdAllocator::with_prefix("abc");
        assert_eq!(alloc.allocate().as_str(), "abc-1");
        assert_eq!(alloc.allocate().as_str(), "abc-2");

        let random = CommandIdAllocator::new();
        let a = random.allocate();
        let b = random.allocate();
        assert_ne!(a, b);
        assert_eq!(a.as_str().split('-').next().unwrap().len(), 8);
    }

    #[test]
    fn set_speed_wire_form() {
        let cmd = Command::SetSpeed {
            device_id: "r1".into(),
            percent: 40,
        };
        assert_eq!(
            cmd.to_wire(&CommandId::from("c-1")),
            ClientMessage::SetSpeed {
                device_id: "r1".into(),
                command_id: "c-1".into(),
                value: 40,
            }
        );
    }

    #[test]
    fn refresh_all_maps_to_get_devices() {
        assert_eq!(
            Command::RefreshAll.to_wire(&CommandId::from("c-2")),
            ClientMessage::GetDevices
        );
        assert_eq!(Command::RefreshAll.device_id(), None);
    }

    #[test]
    fn speed_above_hundred_fails_validation() {
        let cmd = Command::SetSpeed {
            device_id: "r1".into(),
            percent: 101,
        };
        assert!(matches!(
            cmd.validate(),
            Err(CoreError::ValidationFailed { .. })
        ));
        let ok = Command::SetSpeed {
            device_id: "r1".into(),
            percent: 100,
        };
        assert!(ok.validate().is_ok());
    }

    #[test]
    fn command_kind_parses_wire_names() {
        assert_eq!(
            "step_forward".parse::<CommandKind>().unwrap(),
            CommandKind::StepForward
        );
    }
}
