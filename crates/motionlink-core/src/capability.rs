// ── Capability gate ──
//
// Pure functions deciding which commands a device accepts right now.
// Only server-asserted facts are consulted: the execution state and the
// `can_*` flags the server last sent.

use std::fmt;

use serde::Serialize;

use crate::command::{Command, CommandKind};
use crate::error::CoreError;
use crate::model::{DeviceState, ExecutionState};

/// The set of device commands currently valid for one device.
///
/// `RefreshAll` is not device-scoped and never appears here.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct AllowedCommands {
    pub set_speed: bool,
    pub pause: bool,
    pub resume: bool,
    pub step_forward: bool,
    pub step_backward: bool,
}

impl AllowedCommands {
    pub fn contains(self, kind: CommandKind) -> bool {
        match kind {
            CommandKind::SetSpeed => self.set_speed,
            CommandKind::Pause => self.pause,
            CommandKind::Resume => self.resume,
            CommandKind::StepForward => self.step_forward,
            CommandKind::StepBackward => self.step_backward,
            CommandKind::RefreshAll => false,
        }
    }

    pub fn iter(self) -> impl Iterator<Item = CommandKind> {
        [
            CommandKind::SetSpeed,
            CommandKind::Pause,
            CommandKind::Resume,
            CommandKind::StepForward,
            CommandKind::StepBackward,
        ]
        .into_iter()
        .filter(move |k| self.contains(*k))
    }

    pub fn is_empty(self) -> bool {
        self.iter().next().is_none()
    }
}

impl fmt::Display for AllowedCommands {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<String> = self.iter().map(|k| k.to_string()).collect();
        if names.is_empty() {
            f.write_str("-")
        } else {
            f.write_str(&names.join(","))
        }
    }
}

/// Derive the commands `state` currently accepts.
pub fn allowed_commands(state: &DeviceState) -> AllowedCommands {
    let exec = state.execution_state;
    let paused_resumable = exec == ExecutionState::Paused && state.can_resume;

    AllowedCommands {
        set_speed: exec != ExecutionState::Erroring,
        pause: exec == ExecutionState::Executing && state.can_pause,
        resume: paused_resumable,
        step_forward: paused_resumable && state.can_step_forward,
        step_backward: paused_resumable && state.can_step_backward,
    }
}

/// Check `command` against `state`. `RefreshAll` always passes.
pub fn validate(state: &DeviceState, command: &Command) -> Result<(), CoreError> {
    let kind = command.kind();
    if kind == CommandKind::RefreshAll || allowed_commands(state).contains(kind) {
        return Ok(());
    }
    Err(CoreError::Capability {
        device_id: state.id.clone(),
        kind,
        state: state.execution_state,
    })
}
