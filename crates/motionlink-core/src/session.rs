// ── Session ──
//
// Full lifecycle management for one logical connection to a device
// server. A single spawned event loop owns the channel, the command
// manager and the reconciler, so every registry write and every pending
// set mutation happens in receipt order without locking.

use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use motionlink_api::{
    Channel, ChannelEvent, ClientMessage, CloseReason, Connector, ServerMessage,
    WebSocketConnector,
};
use serde::Serialize;
use tokio::sync::{Mutex, broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior, Sleep};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::capability::{self, AllowedCommands};
use crate::command::{
    Command, CommandEnvelope, CommandIdAllocator, CommandManager, CommandResult, PendingCommand,
};
use crate::config::SessionConfig;
use crate::error::CoreError;
use crate::model::{DeviceId, DeviceState, Event};
use crate::reconcile::{Inbound, Reconciler, SyncStatus, SyncView, SyncWindows};
use crate::store::{DeviceMap, DeviceRegistry};
use crate::stream::DeviceStream;
use crate::supervisor::ReconnectScheduler;

const EVENT_CHANNEL_SIZE: usize = 256;
const COMMAND_CHANNEL_SIZE: usize = 64;

// ── ConnectionState ──────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, strum::Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Connection metadata published to observers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConnectionInfo {
    pub state: ConnectionState,
    pub last_connected_at: Option<DateTime<Utc>>,
    /// Reconnect attempts since the last successful connect.
    pub reconnect_attempt: u32,
}

impl Default for ConnectionInfo {
    fn default() -> Self {
        Self {
            state: ConnectionState::Disconnected,
            last_connected_at: None,
            reconnect_attempt: 0,
        }
    }
}

// ── Session ──────────────────────────────────────────────────────────

/// The main entry point for consumers.
///
/// Cheaply cloneable via `Arc<SessionInner>`. Independent sessions share
/// nothing but the wire protocol.
#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

struct SessionInner {
    config: SessionConfig,
    connector: Arc<dyn Connector>,
    registry: Arc<DeviceRegistry>,
    connection: watch::Sender<ConnectionInfo>,
    sync: watch::Sender<Arc<SyncView>>,
    event_tx: broadcast::Sender<Arc<Event>>,
    command_tx: Mutex<mpsc::Sender<CommandEnvelope>>,
    command_rx: Mutex<Option<mpsc::Receiver<CommandEnvelope>>>,
    ids: CommandIdAllocator,
    cancel: CancellationToken,
    /// Child token for the current connection. Cancelled on disconnect,
    /// replaced on connect.
    cancel_child: Mutex<CancellationToken>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Session {
    /// Create a session that talks WebSocket to `config.url`. Does NOT
    /// connect; call [`connect()`](Self::connect).
    pub fn new(config: SessionConfig) -> Result<Self, CoreError> {
        let connector = WebSocketConnector::new(config.url.clone())?;
        Ok(Self::with_connector(config, Arc::new(connector)))
    }

    /// Create a session over any transport.
    pub fn with_connector(config: SessionConfig, connector: Arc<dyn Connector>) -> Self {
        let windows = SyncWindows::from(&config);
        let (connection, _) = watch::channel(ConnectionInfo::default());
        let (sync, _) = watch::channel(Arc::new(SyncView::empty(windows)));
        let (event_tx, _) = broadcast::channel(EVENT_CHANNEL_SIZE);
        let (command_tx, command_rx) = mpsc::channel(COMMAND_CHANNEL_SIZE);
        let cancel = CancellationToken::new();
        let cancel_child = cancel.child_token();

        Self {
            inner: Arc::new(SessionInner {
                config,
                connector,
                registry: Arc::new(DeviceRegistry::new()),
                connection,
                sync,
                event_tx,
                command_tx: Mutex::new(command_tx),
                command_rx: Mutex::new(Some(command_rx)),
                ids: CommandIdAllocator::new(),
                cancel,
                cancel_child: Mutex::new(cancel_child),
                task: Mutex::new(None),
            }),
        }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.inner.config
    }

    // ── Connection lifecycle ─────────────────────────────────────────

    /// Open the channel, subscribe, request a full snapshot and start the
    /// event loop. Fails if the first open fails; later drops are handled
    /// by reconnecting in the background.
    pub async fn connect(&self) -> Result<(), CoreError> {
        {
            let task = self.inner.task.lock().await;
            if task.as_ref().is_some_and(|t| !t.is_finished()) {
                debug!("connect called on a running session");
                return Ok(());
            }
        }
        if self.inner.command_rx.lock().await.is_none() {
            // A previous loop gave up on its own; reset before starting over.
            self.disconnect().await;
        }

        self.set_state(ConnectionState::Connecting, 0);
        let endpoint = self.inner.connector.endpoint();

        let channel = match open_channel(self.inner.connector.as_ref()).await {
            Ok(channel) => channel,
            Err(e) => {
                self.set_state(ConnectionState::Disconnected, 0);
                return Err(CoreError::ConnectionFailed {
                    url: endpoint,
                    reason: e.to_string(),
                });
            }
        };

        let child = self.inner.cancel.child_token();
        *self.inner.cancel_child.lock().await = child.clone();

        let Some(requests) = self.inner.command_rx.lock().await.take() else {
            return Err(CoreError::Internal("command receiver already taken".into()));
        };

        self.inner.mark_connected();
        info!(endpoint = %endpoint, "connected to device server");

        let event_loop = EventLoop::new(Arc::clone(&self.inner), channel, child);
        *self.inner.task.lock().await = Some(tokio::spawn(event_loop.run(requests)));
        Ok(())
    }

    /// Close the session. Cancels the reconnect timer and every command
    /// timer, and fails outstanding commands with `ConnectionClosed`.
    pub async fn disconnect(&self) {
        // Cancel the child token (not the parent, so the session can reconnect).
        self.inner.cancel_child.lock().await.cancel();

        if let Some(handle) = self.inner.task.lock().await.take() {
            if let Err(e) = handle.await {
                warn!(error = %e, "event loop task ended abnormally");
            }
        }

        // The previous receiver was consumed by the event loop.
        {
            let (tx, rx) = mpsc::channel(COMMAND_CHANNEL_SIZE);
            *self.inner.command_tx.lock().await = tx;
            *self.inner.command_rx.lock().await = Some(rx);
        }

        self.set_state(ConnectionState::Disconnected, 0);
        debug!("disconnected");
    }

    /// Wait until the first full snapshot of the current connection has
    /// been applied.
    pub async fn wait_for_snapshot(&self, timeout: Duration) -> Result<DeviceMap, CoreError> {
        let mut rx = self.inner.sync.subscribe();
        match tokio::time::timeout(timeout, rx.wait_for(|view| view.snapshot_received)).await {
            Ok(Ok(_)) => Ok(self.inner.registry.snapshot()),
            Ok(Err(_)) => Err(CoreError::ConnectionClosed),
            Err(_) => Err(CoreError::Timeout {
                what: "initial device snapshot".into(),
                timeout_ms: duration_ms(timeout),
            }),
        }
    }

    // ── Commands ─────────────────────────────────────────────────────

    /// Issue a command. Resolves once the server confirms or rejects it,
    /// its timeout fires, or its connection is lost.
    pub async fn issue(&self, command: Command) -> CommandResult {
        if self.inner.connection.borrow().state != ConnectionState::Connected {
            return Err(CoreError::NotConnected);
        }

        let id = self.inner.ids.allocate();
        let (tx, rx) = oneshot::channel();
        let command_tx = self.inner.command_tx.lock().await.clone();

        command_tx
            .send(CommandEnvelope {
                id,
                command,
                response_tx: tx,
            })
            .await
            .map_err(|_| CoreError::NotConnected)?;

        rx.await.map_err(|_| CoreError::ConnectionClosed)?
    }

    pub async fn set_speed(&self, device_id: impl Into<DeviceId>, percent: u8) -> CommandResult {
        self.issue(Command::SetSpeed {
            device_id: device_id.into(),
            percent,
        })
        .await
    }

    pub async fn pause(&self, device_id: impl Into<DeviceId>) -> CommandResult {
        self.issue(Command::Pause {
            device_id: device_id.into(),
        })
        .await
    }

    pub async fn resume(&self, device_id: impl Into<DeviceId>) -> CommandResult {
        self.issue(Command::Resume {
            device_id: device_id.into(),
        })
        .await
    }

    pub async fn step_forward(&self, device_id: impl Into<DeviceId>) -> CommandResult {
        self.issue(Command::StepForward {
            device_id: device_id.into(),
        })
        .await
    }

    pub async fn step_backward(&self, device_id: impl Into<DeviceId>) -> CommandResult {
        self.issue(Command::StepBackward {
            device_id: device_id.into(),
        })
        .await
    }

    /// Request a full snapshot and wait for it.
    pub async fn refresh_all(&self) -> CommandResult {
        self.issue(Command::RefreshAll).await
    }

    // ── One-shot convenience ─────────────────────────────────────────

    /// One-shot: connect, wait for the first snapshot, run closure,
    /// disconnect.
    pub async fn oneshot<F, Fut, T, E>(config: SessionConfig, f: F) -> Result<T, E>
    where
        F: FnOnce(Session) -> Fut,
        Fut: std::future::Future<Output = Result<T, E>>,
        E: From<CoreError>,
    {
        let mut cfg = config;
        cfg.reconnect.enabled = false;
        let wait = cfg.command_timeout;

        let session = Session::new(cfg)?;
        session.connect().await?;
        let result = match session.wait_for_snapshot(wait).await {
            Ok(_) => f(session.clone()).await,
            Err(e) => Err(E::from(e)),
        };
        session.disconnect().await;
        result
    }

    // ── State observation ────────────────────────────────────────────

    pub fn connection_state(&self) -> watch::Receiver<ConnectionInfo> {
        self.inner.connection.subscribe()
    }

    pub fn connection_info(&self) -> ConnectionInfo {
        self.inner.connection.borrow().clone()
    }

    /// Playback, added and removed events.
    pub fn events(&self) -> broadcast::Receiver<Arc<Event>> {
        self.inner.event_tx.subscribe()
    }

    pub fn devices(&self) -> DeviceStream {
        DeviceStream::new(self.inner.registry.subscribe())
    }

    pub fn snapshot(&self) -> DeviceMap {
        self.inner.registry.snapshot()
    }

    pub fn device(&self, id: &DeviceId) -> Option<Arc<DeviceState>> {
        self.inner.registry.get(id)
    }

    /// `None` if the device is unknown.
    pub fn sync_status(&self, id: &DeviceId) -> Option<SyncStatus> {
        if !self.inner.registry.contains(id) {
            return None;
        }
        Some(self.inner.sync.borrow().status(id, Instant::now()))
    }

    /// Status of every known device, in registry order.
    pub fn sync_statuses(&self) -> Vec<(DeviceId, SyncStatus)> {
        let view = self.inner.sync.borrow().clone();
        let now = Instant::now();
        self.inner
            .registry
            .snapshot()
            .keys()
            .map(|id| (id.clone(), view.status(id, now)))
            .collect()
    }

    /// Outstanding commands, oldest first.
    pub fn pending(&self) -> Vec<PendingCommand> {
        self.inner.sync.borrow().commands.clone()
    }

    pub fn allowed_commands(&self, id: &DeviceId) -> Option<AllowedCommands> {
        self.inner
            .registry
            .get(id)
            .map(|state| capability::allowed_commands(&state))
    }

    /// Illegal transitions accepted from the server so far.
    pub fn anomaly_count(&self) -> u64 {
        self.inner.registry.anomaly_count()
    }

    fn set_state(&self, state: ConnectionState, attempt: u32) {
        self.inner.set_state(state, attempt);
    }
}

impl SessionInner {
    fn set_state(&self, state: ConnectionState, attempt: u32) {
        self.connection.send_modify(|info| {
            info.state = state;
            info.reconnect_attempt = attempt;
        });
    }

    fn mark_connected(&self) {
        self.connection.send_modify(|info| {
            info.state = ConnectionState::Connected;
            info.last_connected_at = Some(Utc::now());
            info.reconnect_attempt = 0;
        });
    }
}

// ── Event loop ───────────────────────────────────────────────────────

/// Open a channel and send the subscribe handshake on it.
async fn open_channel(connector: &dyn Connector) -> Result<Channel, CoreError> {
    let channel = connector.connect().await?;
    channel.send(ClientMessage::Subscribe.encode()?)?;
    channel.send(ClientMessage::GetDevices.encode()?)?;
    Ok(channel)
}

async fn next_event(channel: Option<&mut Channel>) -> ChannelEvent {
    match channel {
        Some(channel) => channel.recv().await,
        None => std::future::pending().await,
    }
}

/// What the loop should do after handling one step.
enum Flow {
    Continue,
    Stop,
}

struct EventLoop {
    inner: Arc<SessionInner>,
    reconciler: Reconciler,
    commands: CommandManager,
    supervisor: ReconnectScheduler,
    channel: Option<Channel>,
    cancel: CancellationToken,
}

impl EventLoop {
    fn new(inner: Arc<SessionInner>, channel: Channel, cancel: CancellationToken) -> Self {
        let config = &inner.config;
        let reconciler = Reconciler::new(Arc::clone(&inner.registry), SyncWindows::from(config));
        let commands = CommandManager::new(config.command_timeout);
        let supervisor = ReconnectScheduler::new(config.reconnect.clone());
        Self {
            inner,
            reconciler,
            commands,
            supervisor,
            channel: Some(channel),
            cancel,
        }
    }

    async fn run(mut self, mut requests: mpsc::Receiver<CommandEnvelope>) {
        let mut sweep = tokio::time::interval(self.inner.config.sweep_interval);
        sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let reconnect = tokio::time::sleep(Duration::ZERO);
        tokio::pin!(reconnect);

        self.publish();
        loop {
            let flow = tokio::select! {
                biased;
                () = self.cancel.cancelled() => Flow::Stop,
                event = next_event(self.channel.as_mut()) => {
                    self.on_channel_event(event, reconnect.as_mut())
                }
                Some(envelope) = requests.recv() => {
                    self.on_request(envelope, reconnect.as_mut())
                }
                Some(id) = self.commands.next_expired(), if self.commands.has_timers() => {
                    if let Some(device) = self.commands.expire(&id) {
                        self.reconciler.on_timeout(device);
                    }
                    Flow::Continue
                }
                () = &mut reconnect, if self.supervisor.is_scheduled() => {
                    self.on_reconnect_timer(reconnect.as_mut()).await
                }
                _ = sweep.tick() => self.on_sweep(reconnect.as_mut()),
            };
            self.publish();
            if matches!(flow, Flow::Stop) {
                break;
            }
        }

        self.shutdown();
    }

    fn on_channel_event(&mut self, event: ChannelEvent, reconnect: Pin<&mut Sleep>) -> Flow {
        match event {
            ChannelEvent::Message(text) => {
                self.on_message(&text);
                Flow::Continue
            }
            ChannelEvent::Closed(reason) => self.on_connection_lost(&reason, reconnect),
        }
    }

    fn on_message(&mut self, text: &str) {
        let decoded = ServerMessage::parse(text)
            .map_err(CoreError::from)
            .and_then(Inbound::classify);
        let inbound = match decoded {
            Ok(inbound) => inbound,
            Err(e) => {
                warn!(error = %e, "dropping undecodable frame");
                return;
            }
        };

        let events = self
            .reconciler
            .on_broadcast(inbound, &mut self.commands, Instant::now());
        for event in events {
            // No receivers is fine.
            let _ = self.inner.event_tx.send(Arc::new(event));
        }
    }

    fn on_request(&mut self, envelope: CommandEnvelope, reconnect: Pin<&mut Sleep>) -> Flow {
        let Some(channel) = self.channel.as_ref() else {
            let _ = envelope.response_tx.send(Err(CoreError::NotConnected));
            return Flow::Continue;
        };

        let id = envelope.id.clone();
        let Some(frame) = self.commands.prepare(envelope, &self.inner.registry) else {
            return Flow::Continue;
        };

        let text = match frame.encode() {
            Ok(text) => text,
            Err(e) => {
                warn!(command_id = %id, error = %e, "command could not be encoded");
                self.commands.fail(&id, CoreError::from(e));
                return Flow::Continue;
            }
        };
        match channel.send(text) {
            Ok(()) => {
                self.commands.mark_sent(&id);
                debug!(command_id = %id, kind = frame.kind(), "command sent");
                Flow::Continue
            }
            // The write half is gone: the connection is dead even if the
            // read half has not noticed yet.
            Err(e) => {
                warn!(command_id = %id, error = %e, "command could not be sent");
                self.on_connection_lost(&CloseReason::Error(e.to_string()), reconnect)
            }
        }
    }

    fn on_connection_lost(&mut self, reason: &CloseReason, reconnect: Pin<&mut Sleep>) -> Flow {
        warn!(%reason, "connection lost");
        self.channel = None;

        // Identifiers and state may change server-side while we are away.
        let failed = self.commands.fail_all(|id| CoreError::ConnectionLost {
            command_id: id.clone(),
        });
        self.reconciler.reset();
        if failed > 0 {
            debug!(failed, "failed commands of the dropped connection");
        }

        self.schedule_reconnect(reconnect)
    }

    fn schedule_reconnect(&mut self, reconnect: Pin<&mut Sleep>) -> Flow {
        match self.supervisor.on_disconnect() {
            Some(delay) => {
                let attempt = self.supervisor.attempt().saturating_add(1);
                info!(attempt, delay_ms = duration_ms(delay), "scheduling reconnect");
                reconnect.reset(Instant::now() + delay);
                self.inner
                    .set_state(ConnectionState::Connecting, self.supervisor.attempt());
                Flow::Continue
            }
            None if self.supervisor.is_scheduled() => Flow::Continue,
            None => {
                error!("not reconnecting, session is now disconnected");
                Flow::Stop
            }
        }
    }

    async fn on_reconnect_timer(&mut self, reconnect: Pin<&mut Sleep>) -> Flow {
        let attempt = self.supervisor.on_timer_fired();
        self.inner.set_state(ConnectionState::Connecting, attempt);
        info!(attempt, "reconnecting");

        let result = tokio::select! {
            biased;
            () = self.cancel.cancelled() => return Flow::Stop,
            result = open_channel(self.inner.connector.as_ref()) => result,
        };

        match result {
            Ok(channel) => {
                self.channel = Some(channel);
                self.supervisor.on_connected();
                self.inner.mark_connected();
                info!(attempt, "reconnected");
                Flow::Continue
            }
            Err(e) => {
                warn!(attempt, error = %e, "reconnect attempt failed");
                self.schedule_reconnect(reconnect)
            }
        }
    }

    fn on_sweep(&mut self, reconnect: Pin<&mut Sleep>) -> Flow {
        let Some(channel) = self.channel.as_ref() else {
            return Flow::Continue;
        };
        let due = self.reconciler.due_refreshes(&self.commands, Instant::now());
        if due.is_empty() {
            return Flow::Continue;
        }
        info!(devices = ?due, "requesting snapshot for stale devices");
        let sent = ClientMessage::GetDevices
            .encode()
            .and_then(|text| channel.send(text));
        match sent {
            Ok(()) => Flow::Continue,
            Err(e) => {
                warn!(error = %e, "stale refresh could not be sent");
                self.on_connection_lost(&CloseReason::Error(e.to_string()), reconnect)
            }
        }
    }

    fn shutdown(&mut self) {
        self.supervisor.close();
        self.channel = None;
        let failed = self.commands.fail_all(|_| CoreError::ConnectionClosed);
        self.reconciler.reset();
        self.publish();
        self.inner.set_state(ConnectionState::Disconnected, 0);
        debug!(failed, "event loop stopped");
    }

    fn publish(&self) {
        self.inner
            .sync
            .send_replace(Arc::new(self.reconciler.view(&self.commands)));
    }
}

fn duration_ms(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use motionlink_api::testing;

    fn config() -> SessionConfig {
        SessionConfig::default()
    }

    #[tokio::test]
    async fn issue_before_connect_is_not_connected() {
        let (connector, _server) = testing::pair();
        let session = Session::with_connector(config(), Arc::new(connector));
        assert!(matches!(
            session.pause("r1").await,
            Err(CoreError::NotConnected)
        ));
    }

    #[tokio::test]
    async fn failed_first_connect_reports_connection_failed() {
        let (connector, server) = testing::pair();
        server.refuse_next(1);
        let session = Session::with_connector(config(), Arc::new(connector));

        let err = session.connect().await.unwrap_err();
        assert!(matches!(err, CoreError::ConnectionFailed { .. }));
        assert_eq!(
            session.connection_info().state,
            ConnectionState::Disconnected
        );
    }

    #[tokio::test]
    async fn connect_sends_subscribe_then_get_devices() {
        let (connector, mut server) = testing::pair();
        let session = Session::with_connector(config(), Arc::new(connector));
        session.connect().await.unwrap();

        let mut peer = server.accept().await.unwrap();
        assert_eq!(peer.recv_json().await.unwrap()["type"], "subscribe");
        assert_eq!(peer.recv_json().await.unwrap()["type"], "get_devices");
        assert_eq!(session.connection_info().state, ConnectionState::Connected);
        assert!(session.connection_info().last_connected_at.is_some());

        session.disconnect().await;
        assert_eq!(
            session.connection_info().state,
            ConnectionState::Disconnected
        );
    }
}
