// ── Client-side device store ──

pub mod registry;

pub use registry::{DeltaOutcome, DeviceMap, DeviceRegistry, SnapshotOutcome};
