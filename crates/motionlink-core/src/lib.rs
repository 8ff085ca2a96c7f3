//! Client-side synchronization core for device-control servers.
//!
//! Keeps a local mirror of authoritative device state consistent with a
//! server that many clients talk to at once:
//!
//! - **[`Session`]**: Central facade. [`connect()`](Session::connect)
//!   opens the channel, subscribes and spawns the event loop that owns all
//!   mutable state. [`Session::oneshot()`](Session::oneshot) connects, waits
//!   for the first snapshot, runs a closure and disconnects.
//!
//! - **[`DeviceRegistry`]**: Keyed device mirror published through a
//!   `watch` channel. A full snapshot always replaces it wholesale.
//!
//! - **[`Command`]**: Typed device operations. Each issued command gets a
//!   correlation id and resolves independently: confirmed by an ack or a
//!   covering broadcast, rejected by the server, timed out, or lost with
//!   its connection.
//!
//! - **Capability gate** ([`capability`]): Pure functions deriving which
//!   commands a device accepts right now.
//!
//! - **Reconciliation** ([`reconcile`]): Merges broadcasts, settles the
//!   pending commands they cover and derives per-device [`SyncStatus`].

pub mod capability;
pub mod command;
pub mod config;
pub mod convert;
pub mod error;
pub mod model;
pub mod reconcile;
pub mod session;
pub mod store;
pub mod stream;
pub mod supervisor;

// ── Primary re-exports ──────────────────────────────────────────────
pub use capability::{AllowedCommands, allowed_commands};
pub use command::{
    Command, CommandId, CommandKind, CommandReceipt, CommandResult, Confirmation, DeliveryState,
    PendingCommand,
};
pub use config::{BackoffStrategy, ReconnectConfig, SessionConfig};
pub use error::CoreError;
pub use reconcile::SyncStatus;
pub use session::{ConnectionInfo, ConnectionState, Session};
pub use store::{DeviceMap, DeviceRegistry};
pub use stream::DeviceStream;

pub use model::{
    DeviceId, DevicePatch, DeviceState, Direction, Event, EventKind, ExecutionState,
};
