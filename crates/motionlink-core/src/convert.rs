// ── Wire-to-domain conversions ──
//
// Bridges `motionlink_api` wire records into canonical `model` types.
// Values the client does not understand are dropped from the patch
// (logged at debug) rather than guessed.

use motionlink_api::protocol::{WireDevice, WireDirection, WireExecutionState};

use crate::model::{DeviceId, DevicePatch, Direction, ExecutionState};

/// Clamp a wire speed into `0..=100` and round to a whole percent.
#[allow(
    clippy::as_conversions,
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss
)]
fn speed_percent(raw: f64) -> Option<u8> {
    if raw.is_nan() {
        return None;
    }
    Some(raw.round().clamp(0.0, 100.0) as u8)
}

fn execution_state(raw: WireExecutionState) -> Option<ExecutionState> {
    match raw {
        WireExecutionState::Idle => Some(ExecutionState::Idle),
        WireExecutionState::Executing => Some(ExecutionState::Executing),
        WireExecutionState::Paused => Some(ExecutionState::Paused),
        WireExecutionState::Erroring => Some(ExecutionState::Erroring),
        WireExecutionState::Unknown => None,
    }
}

fn direction(raw: WireDirection) -> Option<Direction> {
    match raw {
        WireDirection::Forward => Some(Direction::Forward),
        WireDirection::Backward => Some(Direction::Backward),
        WireDirection::Unknown => None,
    }
}

impl From<&WireDevice> for DevicePatch {
    fn from(w: &WireDevice) -> Self {
        let exec = w.execution_state.and_then(execution_state);
        if w.execution_state == Some(WireExecutionState::Unknown) {
            tracing::debug!(device_id = ?w.id, "ignoring unrecognized execution state");
        }

        Self {
            display_name: w.display_name.clone(),
            speed_percent: w.speed_percent.and_then(speed_percent),
            execution_state: exec,
            direction: w.direction.and_then(direction),
            can_pause: w.can_pause,
            can_resume: w.can_resume,
            can_step_forward: w.can_step_forward,
            can_step_backward: w.can_step_backward,
            last_error: w.last_error.clone(),
        }
    }
}

/// Device id carried by a full record, if any.
pub(crate) fn wire_device_id(w: &WireDevice) -> Option<DeviceId> {
    w.id.as_deref().filter(|id| !id.is_empty()).map(DeviceId::from)
}
