// ── Command lifecycle manager ──
//
// Tracks every issued command from creation to a terminal state. Owned by
// the session's event loop, so none of this needs locking. Each command
// is retired by its id: an ack, a covering broadcast, its timer, or the
// loss of the connection it was sent on.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use chrono::{DateTime, Utc};
use motionlink_api::ClientMessage;
use motionlink_api::protocol::CommandAck;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tokio_util::time::{DelayQueue, delay_queue};
use tracing::{debug, warn};

use super::{
    Command, CommandEnvelope, CommandId, CommandKind, CommandReceipt, CommandResult,
    Confirmation, DeliveryState, PendingCommand, PendingSet,
};
use crate::capability;
use crate::error::CoreError;
use crate::model::DeviceId;
use crate::store::DeviceRegistry;

/// Terminal states remembered after a command is retired.
const SETTLED_HISTORY: usize = 64;

struct Tracked {
    kind: CommandKind,
    device_id: Option<DeviceId>,
    issued_at: DateTime<Utc>,
    issued_instant: Instant,
    state: DeliveryState,
    responder: oneshot::Sender<CommandResult>,
    timer: delay_queue::Key,
}

impl Tracked {
    fn receipt(&self, id: CommandId, confirmation: Confirmation) -> CommandReceipt {
        CommandReceipt {
            command_id: id,
            kind: self.kind,
            device_id: self.device_id.clone(),
            issued_at: self.issued_at,
            confirmed_at: Utc::now(),
            confirmation,
        }
    }
}

pub struct CommandManager {
    timeout: Duration,
    tracked: HashMap<CommandId, Tracked>,
    pending: HashMap<DeviceId, PendingSet>,
    /// Outstanding `RefreshAll` ids; they have no device pending set.
    refreshes: Vec<CommandId>,
    timers: DelayQueue<CommandId>,
    /// Recently retired commands and the state they ended in, oldest first.
    settled: VecDeque<(CommandId, DeliveryState)>,
}

impl CommandManager {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            tracked: HashMap::new(),
            pending: HashMap::new(),
            refreshes: Vec::new(),
            timers: DelayQueue::new(),
            settled: VecDeque::with_capacity(SETTLED_HISTORY),
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    // ── Issue ────────────────────────────────────────────────────────

    /// Validate and start tracking a command.
    ///
    /// Returns the frame to send, or `None` if the command was rejected
    /// locally (the caller has already been answered, nothing is tracked).
    pub(crate) fn prepare(
        &mut self,
        envelope: CommandEnvelope,
        registry: &DeviceRegistry,
    ) -> Option<ClientMessage> {
        let CommandEnvelope {
            id,
            command,
            response_tx,
        } = envelope;

        if let Err(e) = check(&command, registry) {
            debug!(command_id = %id, error = %e, "command rejected locally");
            let _ = response_tx.send(Err(e));
            return None;
        }

        let wire = command.to_wire(&id);
        let issued_at = Utc::now();
        let issued_instant = Instant::now();
        let device_id = command.device_id().cloned();

        match &device_id {
            Some(device) => self.pending.entry(device.clone()).or_default().insert(
                id.clone(),
                issued_at,
                issued_instant,
            ),
            None => self.refreshes.push(id.clone()),
        }

        let timer = self.timers.insert(id.clone(), self.timeout);
        self.tracked.insert(
            id.clone(),
            Tracked {
                kind: command.kind(),
                device_id,
                issued_at,
                issued_instant,
                state: DeliveryState::Created,
                responder: response_tx,
                timer,
            },
        );

        debug!(command_id = %id, kind = %command.kind(), "command created");
        Some(wire)
    }

    /// The frame for `id` went out on the channel.
    pub fn mark_sent(&mut self, id: &CommandId) {
        if let Some(t) = self.tracked.get_mut(id) {
            t.state = DeliveryState::Sent;
        }
    }

    // ── Resolution ───────────────────────────────────────────────────

    /// Route a server acknowledgement. Returns `false` for unknown ids
    /// (already settled, or from before a reconnect).
    pub fn acknowledge(&mut self, ack: &CommandAck) -> bool {
        let id = CommandId::from(ack.command_id.as_str());
        let Some(tracked) = self.take(&id, false) else {
            match self.settled_state(&id) {
                Some(state) => debug!(command_id = %id, %state, "ack for settled command"),
                None => debug!(command_id = %id, "ack for unknown command"),
            }
            return false;
        };

        if ack.success {
            debug!(command_id = %id, "command confirmed by ack");
            self.record(id.clone(), DeliveryState::Confirmed);
            let confirmation = Confirmation::Ack {
                fields: ack.fields.clone(),
            };
            let receipt = tracked.receipt(id, confirmation);
            let _ = tracked.responder.send(Ok(receipt));
        } else {
            let reason = ack
                .error
                .clone()
                .unwrap_or_else(|| "rejected by server".into());
            debug!(command_id = %id, %reason, "command rejected by server");
            self.record(id.clone(), DeliveryState::Rejected);
            let _ = tracked.responder.send(Err(CoreError::ServerRejection {
                command_id: id,
                reason,
            }));
        }
        true
    }

    /// Confirm every pending command for `device` issued before `at`.
    /// `None` means the broadcast is maximally fresh and covers them all.
    pub fn settle_covered(&mut self, device: &DeviceId, at: Option<DateTime<Utc>>) -> usize {
        let covered = match self.pending.get(device) {
            Some(set) => set.covered_by(at),
            None => return 0,
        };
        let broadcast_at = at.unwrap_or_else(Utc::now);
        for id in &covered {
            self.confirm_by_broadcast(id, broadcast_at);
        }
        covered.len()
    }

    /// Confirm every outstanding `RefreshAll`.
    pub fn settle_refreshes(&mut self, at: Option<DateTime<Utc>>) -> usize {
        let ids = std::mem::take(&mut self.refreshes);
        let broadcast_at = at.unwrap_or_else(Utc::now);
        for id in &ids {
            self.confirm_by_broadcast(id, broadcast_at);
        }
        ids.len()
    }

    fn confirm_by_broadcast(&mut self, id: &CommandId, at: DateTime<Utc>) {
        if let Some(tracked) = self.take(id, false) {
            debug!(command_id = %id, "command confirmed by broadcast");
            self.record(id.clone(), DeliveryState::Confirmed);
            let receipt = tracked.receipt(id.clone(), Confirmation::Broadcast { at });
            let _ = tracked.responder.send(Ok(receipt));
        }
    }

    /// Fail one command. Returns `false` if it was not outstanding.
    pub fn fail(&mut self, id: &CommandId, error: CoreError) -> bool {
        match self.take(id, false) {
            Some(tracked) => {
                let _ = tracked.responder.send(Err(error));
                true
            }
            None => false,
        }
    }

    /// Fail every command pending for `device`.
    pub fn fail_device(&mut self, device: &DeviceId, error: &CoreError) -> usize {
        let ids: Vec<CommandId> = match self.pending.get(device) {
            Some(set) => set.ids().cloned().collect(),
            None => return 0,
        };
        for id in &ids {
            if let Some(tracked) = self.take(id, false) {
                let _ = tracked.responder.send(Err(error.clone()));
            }
        }
        ids.len()
    }

    /// Fail everything and cancel every timer.
    pub fn fail_all(&mut self, make_error: impl Fn(&CommandId) -> CoreError) -> usize {
        let count = self.tracked.len();
        for (id, tracked) in self.tracked.drain() {
            let _ = tracked.responder.send(Err(make_error(&id)));
        }
        self.pending.clear();
        self.refreshes.clear();
        self.timers.clear();
        count
    }

    // ── Timers ───────────────────────────────────────────────────────

    pub fn has_timers(&self) -> bool {
        !self.timers.is_empty()
    }

    /// Wait for the next command timer to fire.
    ///
    /// Resolves to `None` immediately when no timers are running, so only
    /// poll this while [`has_timers`](Self::has_timers) is true.
    pub async fn next_expired(&mut self) -> Option<CommandId> {
        std::future::poll_fn(|cx| self.timers.poll_expired(cx))
            .await
            .map(delay_queue::Expired::into_inner)
    }

    /// Time out a command whose timer fired. Returns its device, if any.
    pub fn expire(&mut self, id: &CommandId) -> Option<DeviceId> {
        let tracked = self.take(id, true)?;
        let timeout_ms = u64::try_from(self.timeout.as_millis()).unwrap_or(u64::MAX);
        warn!(
            command_id = %id,
            kind = %tracked.kind,
            timeout_ms,
            state = %DeliveryState::TimedOut,
            "command timed out"
        );
        self.record(id.clone(), DeliveryState::TimedOut);
        let device = tracked.device_id.clone();
        let _ = tracked.responder.send(Err(CoreError::CommandTimeout {
            command_id: id.clone(),
            timeout_ms,
        }));
        device
    }

    // ── Queries ──────────────────────────────────────────────────────

    pub fn pending_set(&self, device: &DeviceId) -> Option<&PendingSet> {
        self.pending.get(device)
    }

    pub fn pending_sets(&self) -> &HashMap<DeviceId, PendingSet> {
        &self.pending
    }

    pub fn len(&self) -> usize {
        self.tracked.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tracked.is_empty()
    }

    /// Current state of an outstanding command, or the terminal state of
    /// a recently retired one.
    pub fn delivery_state(&self, id: &CommandId) -> Option<DeliveryState> {
        self.tracked
            .get(id)
            .map(|t| t.state)
            .or_else(|| self.settled_state(id))
    }

    fn settled_state(&self, id: &CommandId) -> Option<DeliveryState> {
        self.settled
            .iter()
            .rev()
            .find(|(settled, _)| settled == id)
            .map(|(_, state)| *state)
    }

    fn record(&mut self, id: CommandId, state: DeliveryState) {
        debug_assert!(state.is_terminal());
        if self.settled.len() == SETTLED_HISTORY {
            self.settled.pop_front();
        }
        self.settled.push_back((id, state));
    }

    /// Every outstanding command, oldest first.
    pub fn snapshot(&self) -> Vec<PendingCommand> {
        let mut out: Vec<(Instant, PendingCommand)> = self
            .tracked
            .iter()
            .map(|(id, t)| {
                (
                    t.issued_instant,
                    PendingCommand {
                        command_id: id.clone(),
                        kind: t.kind,
                        device_id: t.device_id.clone(),
                        issued_at: t.issued_at,
                        delivery_state: t.state,
                    },
                )
            })
            .collect();
        out.sort_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.command_id.cmp(&b.1.command_id)));
        out.into_iter().map(|(_, p)| p).collect()
    }

    /// Stop tracking `id`, cancelling its timer unless it already fired.
    fn take(&mut self, id: &CommandId, expired: bool) -> Option<Tracked> {
        let tracked = self.tracked.remove(id)?;
        if !expired {
            self.timers.try_remove(&tracked.timer);
        }
        match &tracked.device_id {
            Some(device) => {
                if let Some(set) = self.pending.get_mut(device) {
                    set.remove(id);
                    if set.is_empty() {
                        self.pending.remove(device);
                    }
                }
            }
            None => self.refreshes.retain(|r| r != id),
        }
        Some(tracked)
    }
}

/// Local checks: parameters, device existence, capability.
fn check(command: &Command, registry: &DeviceRegistry) -> Result<(), CoreError> {
    command.validate()?;
    let Some(device_id) = command.device_id() else {
        return Ok(());
    };
    let state = registry
        .get(device_id)
        .ok_or_else(|| CoreError::DeviceNotFound {
            device_id: device_id.clone(),
        })?;
    capability::validate(&state, command)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::model::{DeviceState, ExecutionState};
    use serde_json::json;

    fn registry_with(id: &str, exec: ExecutionState) -> DeviceRegistry {
        let reg = DeviceRegistry::new();
        let mut s = DeviceState::new(id.into());
        s.execution_state = exec;
        s.can_pause = exec == ExecutionState::Executing;
        s.can_resume = exec == ExecutionState::Paused;
        reg.apply_snapshot(vec![s]);
        reg
    }

    fn envelope(
        id: &str,
        command: Command,
    ) -> (CommandEnvelope, oneshot::Receiver<CommandResult>) {
        let (tx, rx) = oneshot::channel();
        (
            CommandEnvelope {
                id: id.into(),
                command,
                response_tx: tx,
            },
            rx,
        )
    }

    fn ack(value: serde_json::Value) -> CommandAck {
        serde_json::from_value(value).unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn capability_failure_answers_immediately() {
        let reg = registry_with("r1", ExecutionState::Idle);
        let mut mgr = CommandManager::new(Duration::from_secs(5));
        let (env, mut rx) = envelope("c-1", Command::Pause {
            device_id: "r1".into(),
        });

        assert!(mgr.prepare(env, &reg).is_none());
        assert!(mgr.is_empty());
        assert!(!mgr.has_timers());
        assert!(matches!(
            rx.try_recv().unwrap(),
            Err(CoreError::Capability { .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn unknown_device_is_not_found() {
        let reg = DeviceRegistry::new();
        let mut mgr = CommandManager::new(Duration::from_secs(5));
        let (env, mut rx) = envelope("c-1", Command::SetSpeed {
            device_id: "ghost".into(),
            percent: 10,
        });
        assert!(mgr.prepare(env, &reg).is_none());
        assert!(matches!(
            rx.try_recv().unwrap(),
            Err(CoreError::DeviceNotFound { .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn ack_confirms_and_clears_pending() {
        let reg = registry_with("r1", ExecutionState::Executing);
        let mut mgr = CommandManager::new(Duration::from_secs(5));
        let (env, mut rx) = envelope("c-1", Command::SetSpeed {
            device_id: "r1".into(),
            percent: 40,
        });

        let wire = mgr.prepare(env, &reg).unwrap();
        assert_eq!(wire.command_id(), Some("c-1"));
        assert_eq!(mgr.delivery_state(&"c-1".into()), Some(DeliveryState::Created));
        mgr.mark_sent(&"c-1".into());
        assert_eq!(mgr.delivery_state(&"c-1".into()), Some(DeliveryState::Sent));
        assert_eq!(mgr.pending_set(&"r1".into()).unwrap().len(), 1);

        assert!(mgr.acknowledge(&ack(json!({
            "command_id": "c-1",
            "success": true,
            "speed_percent": 40
        }))));

        let receipt = rx.try_recv().unwrap().unwrap();
        assert_eq!(receipt.kind, CommandKind::SetSpeed);
        assert!(matches!(
            receipt.confirmation,
            Confirmation::Ack { ref fields } if fields["speed_percent"] == 40
        ));
        assert!(mgr.pending_set(&"r1".into()).is_none());
        assert!(!mgr.has_timers());
        assert_eq!(mgr.delivery_state(&"c-1".into()), Some(DeliveryState::Confirmed));
    }

    #[tokio::test(start_paused = true)]
    async fn negative_ack_is_server_rejection() {
        let reg = registry_with("r1", ExecutionState::Executing);
        let mut mgr = CommandManager::new(Duration::from_secs(5));
        let (env, mut rx) = envelope("c-1", Command::Pause {
            device_id: "r1".into(),
        });
        mgr.prepare(env, &reg).unwrap();

        mgr.acknowledge(&ack(json!({
            "command_id": "c-1",
            "success": false,
            "error": "interlock open"
        })));

        let err = rx.try_recv().unwrap().unwrap_err();
        assert!(matches!(
            err,
            CoreError::ServerRejection { ref reason, .. } if reason == "interlock open"
        ));
        assert_eq!(mgr.delivery_state(&"c-1".into()), Some(DeliveryState::Rejected));
    }

    #[tokio::test(start_paused = true)]
    async fn duplicate_ack_is_ignored() {
        let reg = registry_with("r1", ExecutionState::Executing);
        let mut mgr = CommandManager::new(Duration::from_secs(5));
        let (env, _rx) = envelope("c-1", Command::Pause {
            device_id: "r1".into(),
        });
        mgr.prepare(env, &reg).unwrap();

        assert!(mgr.acknowledge(&ack(json!({"command_id": "c-1", "success": true}))));
        assert!(!mgr.acknowledge(&ack(json!({"command_id": "c-1", "success": true}))));
    }

    #[tokio::test(start_paused = true)]
    async fn timer_expires_command() {
        let reg = registry_with("r1", ExecutionState::Executing);
        let mut mgr = CommandManager::new(Duration::from_secs(5));
        let (env, mut rx) = envelope("c-1", Command::SetSpeed {
            device_id: "r1".into(),
            percent: 40,
        });
        mgr.prepare(env, &reg).unwrap();

        let expired = mgr.next_expired().await.unwrap();
        assert_eq!(expired, CommandId::from("c-1"));
        assert_eq!(mgr.expire(&expired), Some(DeviceId::from("r1")));

        assert!(matches!(
            rx.try_recv().unwrap(),
            Err(CoreError::CommandTimeout { timeout_ms: 5000, .. })
        ));
        assert!(mgr.is_empty());
        assert!(mgr.pending_sets().is_empty());
        assert_eq!(mgr.delivery_state(&expired), Some(DeliveryState::TimedOut));
    }

    #[tokio::test(start_paused = true)]
    async fn settled_history_is_bounded() {
        let reg = registry_with("r1", ExecutionState::Executing);
        let mut mgr = CommandManager::new(Duration::from_secs(5));
        for n in 0..=SETTLED_HISTORY {
            let id = format!("c-{n}");
            let (env, _rx) = envelope(&id, Command::Pause {
                device_id: "r1".into(),
            });
            mgr.prepare(env, &reg).unwrap();
            assert!(mgr.acknowledge(&ack(json!({"command_id": id, "success": true}))));
        }

        assert_eq!(mgr.delivery_state(&"c-0".into()), None);
        let last = CommandId::from(format!("c-{SETTLED_HISTORY}"));
        assert_eq!(mgr.delivery_state(&last), Some(DeliveryState::Confirmed));
    }

    #[tokio::test(start_paused = true)]
    async fn broadcast_settles_only_older_commands() {
        let reg = registry_with("r1", ExecutionState::Executing);
        let mut mgr = CommandManager::new(Duration::from_secs(5));

        let (env, mut first) = envelope("c-1", Command::SetSpeed {
            device_id: "r1".into(),
            percent: 40,
        });
        mgr.prepare(env, &reg).unwrap();
        let between = Utc::now();
        std::thread::sleep(std::time::Duration::from_millis(5));
        let (env, mut second) = envelope("c-2", Command::SetSpeed {
            device_id: "r1".into(),
            percent: 50,
        });
        mgr.prepare(env, &reg).unwrap();

        // c-1 was issued at or before `between`; only strictly older entries settle.
        let at = between + chrono::Duration::milliseconds(1);
        let settled = mgr.settle_covered(&"r1".into(), Some(at));
        assert_eq!(settled, 1);
        assert!(matches!(
            first.try_recv().unwrap().unwrap().confirmation,
            Confirmation::Broadcast { .. }
        ));
        assert!(second.try_recv().is_err());
        assert!(mgr.pending_set(&"r1".into()).unwrap().contains(&"c-2".into()));
    }

    #[tokio::test(start_paused = true)]
    async fn refresh_all_is_tracked_without_device() {
        let reg = DeviceRegistry::new();
        let mut mgr = CommandManager::new(Duration::from_secs(5));
        let (env, mut rx) = envelope("c-1", Command::RefreshAll);

        let wire = mgr.prepare(env, &reg).unwrap();
        assert_eq!(wire, ClientMessage::GetDevices);
        assert!(mgr.pending_sets().is_empty());
        assert_eq!(mgr.len(), 1);

        assert_eq!(mgr.settle_refreshes(None), 1);
        assert!(rx.try_recv().unwrap().is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn fail_all_drains_everything() {
        let reg = registry_with("r1", ExecutionState::Paused);
        let mut mgr = CommandManager::new(Duration::from_secs(5));
        let (env, mut rx) = envelope("c-1", Command::StepForward {
            device_id: "r1".into(),
        });
        mgr.prepare(env, &reg).unwrap();

        let failed = mgr.fail_all(|id| CoreError::ConnectionLost {
            command_id: id.clone(),
        });
        assert_eq!(failed, 1);
        assert!(mgr.is_empty());
        assert!(!mgr.has_timers());
        assert!(matches!(
            rx.try_recv().unwrap(),
            Err(CoreError::ConnectionLost { .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn fail_device_leaves_other_devices() {
        let reg = DeviceRegistry::new();
        reg.apply_snapshot(vec![
            DeviceState::new("r1".into()),
            DeviceState::new("r2".into()),
        ]);
        let mut mgr = CommandManager::new(Duration::from_secs(5));
        let (env, mut rx1) = envelope("c-1", Command::SetSpeed {
            device_id: "r1".into(),
            percent: 10,
        });
        mgr.prepare(env, &reg).unwrap();
        let (env, mut rx2) = envelope("c-2", Command::SetSpeed {
            device_id: "r2".into(),
            percent: 10,
        });
        mgr.prepare(env, &reg).unwrap();

        let removed = DeviceId::from("r1");
        mgr.fail_device(&removed, &CoreError::DeviceRemoved {
            device_id: removed.clone(),
        });

        assert!(matches!(
            rx1.try_recv().unwrap(),
            Err(CoreError::DeviceRemoved { .. })
        ));
        assert!(rx2.try_recv().is_err());
        assert_eq!(mgr.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn snapshot_lists_oldest_first() {
        let reg = registry_with("r1", ExecutionState::Executing);
        let mut mgr = CommandManager::new(Duration::from_secs(5));
        let (env, _a) = envelope("c-1", Command::SetSpeed {
            device_id: "r1".into(),
            percent: 10,
        });
        mgr.prepare(env, &reg).unwrap();
        tokio::time::advance(Duration::from_millis(10)).await;
        let (env, _b) = envelope("c-2", Command::Pause {
            device_id: "r1".into(),
        });
        mgr.prepare(env, &reg).unwrap();

        let ids: Vec<_> = mgr.snapshot().into_iter().map(|p| p.command_id).collect();
        assert_eq!(ids, vec![CommandId::from("c-1"), CommandId::from("c-2")]);
    }
}
