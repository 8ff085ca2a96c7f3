// ── Domain model ──
//
// Canonical device types the registry stores and observers read.
// Wire records are converted into these in `crate::convert`.

pub mod device;
pub mod event;

pub use device::{
    DEFAULT_SPEED_PERCENT, DeviceId, DevicePatch, DeviceState, Direction, ExecutionState,
};
pub use event::{Event, EventKind};
