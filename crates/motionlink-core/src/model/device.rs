// ── Device domain types ──

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Speed assumed for a device whose first record omits it.
pub const DEFAULT_SPEED_PERCENT: u8 = 100;

// ── DeviceId ────────────────────────────────────────────────────────

/// Stable server-assigned device identity.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceId(String);

impl DeviceId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for DeviceId {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self::new(s))
    }
}

impl From<&str> for DeviceId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for DeviceId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

// ── ExecutionState ──────────────────────────────────────────────────

/// What a device is doing right now, as asserted by the server.
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
pub enum ExecutionState {
    Idle,
    Executing,
    Paused,
    Erroring,
}

impl ExecutionState {
    /// Whether moving from `self` to `next` is a legal transition.
    ///
    /// Legal: `Idle <-> Executing`, `Executing <-> Paused`, anything to
    /// `Erroring`, `Erroring -> Idle`. Staying put is always legal.
    pub fn allows_transition(self, next: Self) -> bool {
        use ExecutionState as S;
        self == next
            || matches!(
                (self, next),
                (S::Idle, S::Executing)
                    | (S::Executing, S::Idle | S::Paused)
                    | (S::Paused, S::Executing)
                    | (_, S::Erroring)
                    | (S::Erroring, S::Idle)
            )
    }
}

/// Movement direction.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Default,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case", ascii_case_insensitive)]
pub enum Direction {
    #[default]
    Forward,
    Backward,
}

// ── DeviceState ─────────────────────────────────────────────────────

/// Client-side mirror of one device's authoritative state.
///
/// `can_pause` / `can_resume` and the step facts are whatever the server
/// last asserted; they are never derived locally from `execution_state`.
/// `last_error` carries a server-reported device fault.
/// `last_authoritative_update_at` is the server's own timestamp for the
/// newest message that touched the record; it stays `None` when the server
/// sent none, so identical input always yields identical records.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceState {
    pub id: DeviceId,
    pub display_name: String,
    pub speed_percent: u8,
    pub execution_state: ExecutionState,
    pub direction: Direction,
    pub can_pause: bool,
    pub can_resume: bool,
    pub can_step_forward: bool,
    pub can_step_backward: bool,
    pub last_authoritative_update_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

impl DeviceState {
    /// A record with every field at its default.
    pub fn new(id: DeviceId) -> Self {
        Self {
            display_name: id.to_string(),
            id,
            speed_percent: DEFAULT_SPEED_PERCENT,
            execution_state: ExecutionState::Idle,
            direction: Direction::Forward,
            can_pause: false,
            can_resume: false,
            can_step_forward: true,
            can_step_backward: true,
            last_authoritative_update_at: None,
            last_error: None,
        }
    }

    pub fn is_faulted(&self) -> bool {
        self.execution_state == ExecutionState::Erroring || self.last_error.is_some()
    }
}

// ── DevicePatch ─────────────────────────────────────────────────────

/// A partial device record. `None` leaves the field untouched.
///
/// `last_error: Some(None)` clears a previously reported fault.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DevicePatch {
    pub display_name: Option<String>,
    pub speed_percent: Option<u8>,
    pub execution_state: Option<ExecutionState>,
    pub direction: Option<Direction>,
    pub can_pause: Option<bool>,
    pub can_resume: Option<bool>,
    pub can_step_forward: Option<bool>,
    pub can_step_backward: Option<bool>,
    pub last_error: Option<Option<String>>,
}

impl DevicePatch {
    /// Merge into an existing record. A server timestamp, when present,
    /// replaces the record's stamp; otherwise the previous one is kept.
    pub fn apply_to(&self, state: &mut DeviceState, at: Option<DateTime<Utc>>) {
        if let Some(name) = &self.display_name {
            state.display_name.clone_from(name);
        }
        if let Some(speed) = self.speed_percent {
            state.speed_percent = speed;
        }
        if let Some(exec) = self.execution_state {
            state.execution_state = exec;
        }
        if let Some(dir) = self.direction {
            state.direction = dir;
        }
        if let Some(v) = self.can_pause {
            state.can_pause = v;
        }
        if let Some(v) = self.can_resume {
            state.can_resume = v;
        }
        if let Some(v) = self.can_step_forward {
            state.can_step_forward = v;
        }
        if let Some(v) = self.can_step_backward {
            state.can_step_backward = v;
        }
        if let Some(err) = &self.last_error {
            state.last_error.clone_from(err);
        }
        if at.is_some() {
            state.last_authoritative_update_at = at;
        }
    }

    /// Build a complete record, defaulting whatever the patch omits.
    pub fn into_state(self, id: DeviceId, at: Option<DateTime<Utc>>) -> DeviceState {
        let mut state = DeviceState::new(id);
        self.apply_to(&mut state, at);
        state
    }
}
