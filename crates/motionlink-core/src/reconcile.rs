// ── Reconciliation engine ──
//
// Classifies inbound frames and dispatches them: snapshots and deltas go
// to the registry, then settle whatever pending commands they cover; acks
// go to the command manager. Also owns the bookkeeping behind per-device
// sync status and the rate limit on automatic refreshes.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use motionlink_api::ServerMessage;
use motionlink_api::protocol::{CommandAck, DeviceUpdate};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::command::{CommandManager, PendingCommand, PendingSet};
use crate::config::SessionConfig;
use crate::convert::wire_device_id;
use crate::error::CoreError;
use crate::model::{DeviceId, DevicePatch, DeviceState, Event, EventKind};
use crate::store::DeviceRegistry;

// ── Classification ───────────────────────────────────────────────────

/// Whether a delta announced a new device or updated a known one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeltaKind {
    StateUpdate,
    Added,
}

/// An inbound frame, classified for dispatch.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    FullSnapshot {
        devices: Vec<(DeviceId, DevicePatch)>,
        at: Option<DateTime<Utc>>,
    },
    DeviceDelta {
        device_id: DeviceId,
        patch: DevicePatch,
        kind: DeltaKind,
        at: Option<DateTime<Utc>>,
    },
    PlaybackEvent {
        device_id: DeviceId,
        patch: DevicePatch,
        event_type: Option<String>,
        at: Option<DateTime<Utc>>,
    },
    CommandAck(CommandAck),
    DeviceRemoved {
        device_id: DeviceId,
        at: Option<DateTime<Utc>>,
    },
}

impl Inbound {
    pub fn classify(msg: ServerMessage) -> Result<Self, CoreError> {
        Ok(match msg {
            ServerMessage::DeviceList(list) => {
                let mut devices = Vec::with_capacity(list.devices.len());
                for wire in &list.devices {
                    match wire_device_id(wire) {
                        Some(id) => devices.push((id, DevicePatch::from(wire))),
                        None => warn!("device_list entry without id skipped"),
                    }
                }
                Self::FullSnapshot {
                    devices,
                    at: list.timestamp,
                }
            }
            ServerMessage::DeviceStateUpdate(update) => {
                let (device_id, patch, at) = split_update(&update)?;
                Self::DeviceDelta {
                    device_id,
                    patch,
                    kind: DeltaKind::StateUpdate,
                    at,
                }
            }
            ServerMessage::DeviceAdded(update) => {
                let (device_id, patch, at) = split_update(&update)?;
                Self::DeviceDelta {
                    device_id,
                    patch,
                    kind: DeltaKind::Added,
                    at,
                }
            }
            ServerMessage::PlaybackEvent(update) => {
                let (device_id, patch, at) = split_update(&update)?;
                Self::PlaybackEvent {
                    device_id,
                    patch,
                    event_type: update.event_type,
                    at,
                }
            }
            ServerMessage::DeviceRemoved(removed) => Self::DeviceRemoved {
                device_id: DeviceId::from(removed.device_id),
                at: removed.timestamp,
            },
            ServerMessage::CommandAck(ack) => Self::CommandAck(ack),
        })
    }

    /// Short label for logging.
    pub fn label(&self) -> &'static str {
        match self {
            Self::FullSnapshot { .. } => "full_snapshot",
            Self::DeviceDelta { .. } => "device_delta",
            Self::PlaybackEvent { .. } => "playback_event",
            Self::CommandAck(_) => "command_ack",
            Self::DeviceRemoved { .. } => "device_removed",
        }
    }
}

fn split_update(
    update: &DeviceUpdate,
) -> Result<(DeviceId, DevicePatch, Option<DateTime<Utc>>), CoreError> {
    let id = update
        .target()
        .filter(|id| !id.is_empty())
        .ok_or_else(|| CoreError::Protocol {
            message: "device update without device_id".into(),
        })?;
    Ok((
        DeviceId::from(id),
        DevicePatch::from(&update.state),
        update.timestamp,
    ))
}

// ── Sync status ──────────────────────────────────────────────────────

/// How far a device's mirror can be trusted.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, strum::Display,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum SyncStatus {
    /// No outstanding commands and recently updated.
    Synchronized,
    /// Commands outstanding, still within their windows.
    Pending,
    /// A command outlived its timeout, the server went quiet despite
    /// outstanding commands, or a timeout left the outcome unknown.
    Stale,
}

/// The time windows sync status is judged against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncWindows {
    pub command_timeout: Duration,
    pub staleness_window: Duration,
    pub freshness_window: Option<Duration>,
}

impl From<&SessionConfig> for SyncWindows {
    fn from(cfg: &SessionConfig) -> Self {
        Self {
            command_timeout: cfg.command_timeout,
            staleness_window: cfg.staleness_window,
            freshness_window: cfg.freshness_window,
        }
    }
}

/// Derive one device's status from its bookkeeping.
pub fn derive_status(
    pending: Option<&PendingSet>,
    last_seen: Option<Instant>,
    unverified: bool,
    windows: &SyncWindows,
    now: Instant,
) -> SyncStatus {
    if unverified {
        return SyncStatus::Stale;
    }

    match pending.and_then(PendingSet::oldest_instant) {
        Some(oldest) => {
            if now.saturating_duration_since(oldest) > windows.command_timeout {
                return SyncStatus::Stale;
            }
            let reference = last_seen.map_or(oldest, |seen| seen.max(oldest));
            if now.saturating_duration_since(reference) > windows.staleness_window {
                return SyncStatus::Stale;
            }
            SyncStatus::Pending
        }
        None => match (windows.freshness_window, last_seen) {
            (Some(window), Some(seen)) if now.saturating_duration_since(seen) > window => {
                SyncStatus::Stale
            }
            (Some(_), None) => SyncStatus::Stale,
            _ => SyncStatus::Synchronized,
        },
    }
}

/// Immutable copy of everything sync status depends on, published by the
/// event loop after every step so readers can evaluate it at any instant.
#[derive(Debug, Clone)]
pub struct SyncView {
    pub windows: SyncWindows,
    pub pending: HashMap<DeviceId, PendingSet>,
    pub commands: Vec<PendingCommand>,
    pub last_seen: HashMap<DeviceId, Instant>,
    pub unverified: HashSet<DeviceId>,
    /// Whether a full snapshot has arrived on the current connection.
    pub snapshot_received: bool,
}

impl SyncView {
    pub fn empty(windows: SyncWindows) -> Self {
        Self {
            windows,
            pending: HashMap::new(),
            commands: Vec::new(),
            last_seen: HashMap::new(),
            unverified: HashSet::new(),
            snapshot_received: false,
        }
    }

    pub fn status(&self, device: &DeviceId, now: Instant) -> SyncStatus {
        derive_status(
            self.pending.get(device),
            self.last_seen.get(device).copied(),
            self.unverified.contains(device),
            &self.windows,
            now,
        )
    }
}

// ── Reconciler ───────────────────────────────────────────────────────

pub struct Reconciler {
    registry: Arc<DeviceRegistry>,
    windows: SyncWindows,
    last_seen: HashMap<DeviceId, Instant>,
    unverified: HashSet<DeviceId>,
    last_refresh: HashMap<DeviceId, Instant>,
    snapshot_received: bool,
}

impl Reconciler {
    pub fn new(registry: Arc<DeviceRegistry>, windows: SyncWindows) -> Self {
        Self {
            registry,
            windows,
            last_seen: HashMap::new(),
            unverified: HashSet::new(),
            last_refresh: HashMap::new(),
            snapshot_received: false,
        }
    }

    pub fn registry(&self) -> &Arc<DeviceRegistry> {
        &self.registry
    }

    /// Dispatch one classified frame. Returns events for observers.
    pub fn on_broadcast(
        &mut self,
        inbound: Inbound,
        commands: &mut CommandManager,
        now: Instant,
    ) -> Vec<Event> {
        debug!(kind = inbound.label(), "dispatching inbound message");
        match inbound {
            Inbound::FullSnapshot { devices, at } => {
                self.on_snapshot(devices, at, commands, now);
                Vec::new()
            }
            Inbound::DeviceDelta {
                device_id,
                patch,
                kind,
                at,
            } => {
                self.on_delta(&device_id, &patch, at, commands, now);
                match kind {
                    DeltaKind::Added => vec![Event {
                        device_id,
                        timestamp: at.unwrap_or_else(Utc::now),
                        kind: EventKind::Added,
                    }],
                    DeltaKind::StateUpdate => Vec::new(),
                }
            }
            Inbound::PlaybackEvent {
                device_id,
                patch,
                event_type,
                at,
            } => {
                self.on_delta(&device_id, &patch, at, commands, now);
                vec![Event {
                    device_id,
                    timestamp: at.unwrap_or_else(Utc::now),
                    kind: EventKind::Playback {
                        event_type: event_type.unwrap_or_else(|| "state_changed".into()),
                    },
                }]
            }
            Inbound::CommandAck(ack) => {
                commands.acknowledge(&ack);
                Vec::new()
            }
            Inbound::DeviceRemoved { device_id, at } => {
                self.on_removed(&device_id, commands);
                vec![Event {
                    device_id,
                    timestamp: at.unwrap_or_else(Utc::now),
                    kind: EventKind::Removed,
                }]
            }
        }
    }

    fn on_snapshot(
        &mut self,
        devices: Vec<(DeviceId, DevicePatch)>,
        at: Option<DateTime<Utc>>,
        commands: &mut CommandManager,
        now: Instant,
    ) {
        let states: Vec<DeviceState> = devices
            .into_iter()
            .map(|(id, patch)| patch.into_state(id, at))
            .collect();
        let present: Vec<DeviceId> = states.iter().map(|s| s.id.clone()).collect();

        let outcome = self.registry.apply_snapshot(states);

        // A fresh snapshot supersedes every command issued before it.
        for id in &present {
            commands.settle_covered(id, None);
            self.last_seen.insert(id.clone(), now);
            self.unverified.remove(id);
        }
        commands.settle_refreshes(at);

        for id in &outcome.removed {
            self.forget(id, commands);
        }

        self.snapshot_received = true;
        debug!(
            devices = present.len(),
            added = outcome.added.len(),
            removed = outcome.removed.len(),
            "applied full snapshot"
        );
    }

    fn on_delta(
        &mut self,
        device_id: &DeviceId,
        patch: &DevicePatch,
        at: Option<DateTime<Utc>>,
        commands: &mut CommandManager,
        now: Instant,
    ) {
        let outcome = self.registry.apply_delta(device_id, patch, at);
        let settled = commands.settle_covered(device_id, at);
        self.last_seen.insert(device_id.clone(), now);
        self.unverified.remove(device_id);
        debug!(
            device_id = %device_id,
            created = outcome.created,
            settled,
            "applied device delta"
        );
    }

    fn on_removed(&mut self, device_id: &DeviceId, commands: &mut CommandManager) {
        if self.registry.remove(device_id).is_none() {
            debug!(device_id = %device_id, "removal of unknown device");
        }
        self.forget(device_id, commands);
    }

    fn forget(&mut self, device_id: &DeviceId, commands: &mut CommandManager) {
        commands.fail_device(device_id, &CoreError::DeviceRemoved {
            device_id: device_id.clone(),
        });
        self.last_seen.remove(device_id);
        self.unverified.remove(device_id);
        self.last_refresh.remove(device_id);
    }

    /// A command for `device_id` timed out: its real state is unknown
    /// until the next broadcast for it.
    pub fn on_timeout(&mut self, device_id: DeviceId) {
        self.unverified.insert(device_id);
    }

    pub fn status(
        &self,
        device: &DeviceId,
        commands: &CommandManager,
        now: Instant,
    ) -> Option<SyncStatus> {
        if !self.registry.contains(device) {
            return None;
        }
        Some(derive_status(
            commands.pending_set(device),
            self.last_seen.get(device).copied(),
            self.unverified.contains(device),
            &self.windows,
            now,
        ))
    }

    /// Stale devices whose last automatic refresh is at least one staleness
    /// window old. Marks them as refreshed now.
    pub fn due_refreshes(&mut self, commands: &CommandManager, now: Instant) -> Vec<DeviceId> {
        let mut due = Vec::new();
        for id in self.registry.snapshot().keys() {
            if self.status(id, commands, now) != Some(SyncStatus::Stale) {
                continue;
            }
            let window = self.windows.staleness_window;
            let recent = self
                .last_refresh
                .get(id)
                .is_some_and(|at| now.saturating_duration_since(*at) < window);
            if !recent {
                self.last_refresh.insert(id.clone(), now);
                due.push(id.clone());
            }
        }
        due
    }

    pub fn snapshot_received(&self) -> bool {
        self.snapshot_received
    }

    /// Drop all bookkeeping and the registry contents.
    pub fn reset(&mut self) {
        self.registry.clear();
        self.last_seen.clear();
        self.unverified.clear();
        self.last_refresh.clear();
        self.snapshot_received = false;
    }

    pub fn view(&self, commands: &CommandManager) -> SyncView {
        SyncView {
            windows: self.windows,
            pending: commands.pending_sets().clone(),
            commands: commands.snapshot(),
            last_seen: self.last_seen.clone(),
            unverified: self.unverified.clone(),
            snapshot_received: self.snapshot_received,
        }
    }
}
