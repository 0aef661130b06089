//! Session lifecycle for the stats daemon handle.
//!
//! All session state lives in one [`Session`] owned by a blocking actor
//! thread. Readiness signals, death notices, alarm firings, relayed events
//! and API calls are queued as [`SessionCommand`]s and applied one at a
//! time, so no two state transitions ever interleave and every reader sees
//! either the old or the new handle, never a half-built one.
//!
//! Each connection gets a generation number. The death recipient installed
//! for a connection carries its generation, so a notice from a watch that
//! was already replaced is recognized and ignored.

use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

use companion_core::clock::ElapsedClock;
use companion_core::platform::{
    AlarmFacility, BroadcastRegistrar, CallStats, DependentManager, ListenerKind, MetricSink,
    PackageSource,
};
use companion_core::{
    AlarmKind, AlarmRequest, DaemonHandle, DaemonLocator, DeletedConfigRecord, ElapsedMillis,
    Identity, LivenessWatch, PlatformError, RemoteError,
};
use companion_inventory::{InventoryTransmitter, TransmitHandle};

use crate::alarm::{forward_firing, AlarmMultiplexer, ForwardOutcome};
use crate::error::CompanionError;
use crate::guard::{CrashStormGuard, DumpReport, GuardOutcome};
use crate::privilege::{as_system, IdentityContext, IdentityScope};
use crate::relay::{self, RelayAction, RelayEvent};

/// Everything the session drives but does not own.
#[derive(Clone)]
pub struct Collaborators {
    pub locator: Arc<dyn DaemonLocator>,
    pub packages: Arc<dyn PackageSource>,
    pub alarms: Arc<dyn AlarmFacility>,
    pub registrar: Arc<dyn BroadcastRegistrar>,
    pub metrics: Arc<dyn MetricSink>,
    pub dependent: Arc<dyn DependentManager>,
    pub call_stats: Vec<Arc<dyn CallStats>>,
    pub clock: Arc<dyn ElapsedClock>,
    pub identity: Arc<dyn IdentityContext>,
}

struct Connection {
    daemon: DaemonHandle,
    generation: u64,
    // Dropping detaches the liveness watch.
    _watch: Box<dyn LivenessWatch>,
}

enum SessionState {
    Disconnected,
    Connected(Connection),
}

#[derive(Debug, Error)]
pub enum HandshakeError {
    #[error("ready call failed: {0}")]
    Ready(#[source] RemoteError),

    #[error("liveness watch failed: {0}")]
    Watch(#[source] RemoteError),

    #[error("registering {kind} listener failed: {source}")]
    Listener {
        kind: ListenerKind,
        #[source]
        source: PlatformError,
    },

    #[error("inventory handoff failed: {0}")]
    Inventory(#[source] RemoteError),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ReadyOutcome {
    Connected { generation: u64 },
    AlreadyConnected { generation: u64 },
    DaemonNotFound,
    HandshakeFailed { reason: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SnapshotOutcome {
    Started,
    NoDaemon,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum RelayOutcome {
    /// The daemon acknowledged the notification.
    Delivered,
    /// Handled locally as a metric.
    Emitted,
    Ignored { reason: &'static str },
    /// The session-scoped listener for this event is not registered.
    NotListening { listener: ListenerKind },
    NoDaemon,
    /// Nothing to send (the package is gone locally).
    Dropped,
    /// The daemon call failed and the session was torn down.
    DaemonLost { reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionStatus {
    pub connected: bool,
    pub generation: u64,
    pub listeners: Vec<ListenerKind>,
    pub pending_alarms: Vec<AlarmRequest>,
    pub recorded_deaths: usize,
    pub deleted_configs: Vec<DeletedConfigRecord>,
    pub inventory_in_flight: usize,
}

pub enum SessionCommand {
    StatsdReady {
        caller: Identity,
        announce: bool,
        respond_to: oneshot::Sender<ReadyOutcome>,
    },
    TriggerUidSnapshot {
        caller: Identity,
        respond_to: oneshot::Sender<SnapshotOutcome>,
    },
    SetAlarm {
        caller: Identity,
        kind: AlarmKind,
        fire_at: ElapsedMillis,
        respond_to: oneshot::Sender<()>,
    },
    CancelAlarm {
        caller: Identity,
        kind: AlarmKind,
        respond_to: oneshot::Sender<bool>,
    },
    AlarmFired {
        kind: AlarmKind,
        fire_at: ElapsedMillis,
    },
    DaemonDied {
        generation: u64,
    },
    Relay {
        event: RelayEvent,
        respond_to: Option<oneshot::Sender<RelayOutcome>>,
    },
    Dump {
        respond_to: oneshot::Sender<DumpReport>,
    },
    Status {
        respond_to: oneshot::Sender<SessionStatus>,
    },
    Shutdown,
}

pub struct Session {
    deps: Collaborators,
    alarms: AlarmMultiplexer,
    guard: CrashStormGuard,
    transmitter: InventoryTransmitter,
    events: SessionHandle,
    state: SessionState,
    generation: u64,
    counted_death: Option<u64>,
    transmissions: Vec<TransmitHandle>,
}

impl Session {
    /// `events` is the queue death recipients post into; normally the handle
    /// paired with the receiver this session will run on.
    pub fn new(deps: Collaborators, guard: CrashStormGuard, events: SessionHandle) -> Self {
        Self {
            alarms: AlarmMultiplexer::new(deps.alarms.clone()),
            transmitter: InventoryTransmitter::new(deps.packages.clone()),
            deps,
            guard,
            events,
            state: SessionState::Disconnected,
            generation: 0,
            counted_death: None,
            transmissions: Vec::new(),
        }
    }

    /// Apply queued commands until [`SessionCommand::Shutdown`].
    pub fn run(mut self, mut commands: mpsc::UnboundedReceiver<SessionCommand>) {
        while let Some(command) = commands.blocking_recv() {
            if !self.handle(command) {
                break;
            }
        }
        self.forget_everything("liaison shutting down");
        tracing::info!("session actor stopped");
    }

    /// Apply one command. Returns `false` on shutdown.
    pub fn handle(&mut self, command: SessionCommand) -> bool {
        match command {
            SessionCommand::StatsdReady {
                caller,
                announce,
                respond_to,
            } => {
                let identity = self.deps.identity.clone();
                let _caller = IdentityScope::assume(identity.as_ref(), caller);
                let outcome = self.statsd_ready();
                if announce {
                    as_system(identity.as_ref(), || {
                        self.deps.registrar.announce_daemon_started()
                    });
                }
                let _ = respond_to.send(outcome);
            }
            SessionCommand::TriggerUidSnapshot { caller, respond_to } => {
                let identity = self.deps.identity.clone();
                let _caller = IdentityScope::assume(identity.as_ref(), caller);
                let _ = respond_to.send(self.trigger_uid_snapshot());
            }
            SessionCommand::SetAlarm {
                caller,
                kind,
                fire_at,
                respond_to,
            } => {
                let identity = self.deps.identity.clone();
                let _caller = IdentityScope::assume(identity.as_ref(), caller);
                self.set_alarm(kind, fire_at);
                let _ = respond_to.send(());
            }
            SessionCommand::CancelAlarm {
                caller,
                kind,
                respond_to,
            } => {
                let identity = self.deps.identity.clone();
                let _caller = IdentityScope::assume(identity.as_ref(), caller);
                let _ = respond_to.send(self.cancel_alarm(kind));
            }
            SessionCommand::AlarmFired { kind, fire_at } => {
                self.alarm_fired(kind, fire_at);
            }
            SessionCommand::DaemonDied { generation } => {
                self.daemon_died(generation);
            }
            SessionCommand::Relay { event, respond_to } => {
                let outcome = self.relay(event);
                if let Some(respond_to) = respond_to {
                    let _ = respond_to.send(outcome);
                }
            }
            SessionCommand::Dump { respond_to } => {
                let _ = respond_to.send(self.dump());
            }
            SessionCommand::Status { respond_to } => {
                let _ = respond_to.send(self.status());
            }
            SessionCommand::Shutdown => return false,
        }
        true
    }

    fn daemon(&self) -> Option<DaemonHandle> {
        match &self.state {
            SessionState::Connected(connection) => Some(connection.daemon.clone()),
            SessionState::Disconnected => None,
        }
    }

    pub fn is_connected(&self) -> bool {
        matches!(self.state, SessionState::Connected(_))
    }

    // -----------------------------------------------------------------------
    // Connect
    // -----------------------------------------------------------------------

    /// The daemon announced readiness (or the liaison just started): fetch
    /// the handle and run the handshake.
    pub fn statsd_ready(&mut self) -> ReadyOutcome {
        if let SessionState::Connected(connection) = &self.state {
            tracing::error!(
                generation = connection.generation,
                "stats daemon reported ready but a handle is already held"
            );
            return ReadyOutcome::AlreadyConnected {
                generation: connection.generation,
            };
        }

        let Some(daemon) = self.deps.locator.fetch() else {
            tracing::info!("stats daemon not published yet; waiting for its ready signal");
            return ReadyOutcome::DaemonNotFound;
        };

        self.generation += 1;
        let generation = self.generation;
        self.deps.dependent.daemon_ready(&daemon);

        match self.handshake(&daemon, generation) {
            Ok(watch) => {
                self.state = SessionState::Connected(Connection {
                    daemon,
                    generation,
                    _watch: watch,
                });
                tracing::info!(generation, "connected to stats daemon");
                ReadyOutcome::Connected { generation }
            }
            Err(err) => {
                tracing::error!(generation, error = %err, "handshake with stats daemon failed");
                self.forget_everything("handshake failed");
                ReadyOutcome::HandshakeFailed {
                    reason: err.to_string(),
                }
            }
        }
    }

    fn handshake(
        &mut self,
        daemon: &DaemonHandle,
        generation: u64,
    ) -> Result<Box<dyn LivenessWatch>, HandshakeError> {
        let identity = self.deps.identity.clone();
        let _system = IdentityScope::clear_calling_identity(identity.as_ref());

        daemon.stats_companion_ready().map_err(HandshakeError::Ready)?;

        let events = self.events.clone();
        let watch = daemon
            .link_to_death(Box::new(move || events.daemon_died(generation)))
            .map_err(HandshakeError::Watch)?;

        for kind in ListenerKind::ALL {
            self.deps
                .registrar
                .register(kind)
                .map_err(|source| HandshakeError::Listener { kind, source })?;
        }

        self.send_inventory(daemon)
            .map_err(HandshakeError::Inventory)?;
        Ok(watch)
    }

    /// Open a fresh inventory channel and start streaming into it. A local
    /// failure to start the worker is logged; only the daemon call fails.
    fn send_inventory(&mut self, daemon: &DaemonHandle) -> Result<(), RemoteError> {
        let identity = self.deps.identity.clone();
        let _system = IdentityScope::clear_calling_identity(identity.as_ref());

        let sink = daemon.inform_all_uid_data()?;
        self.transmissions.retain(|handle| !handle.is_finished());
        match self.transmitter.transmit(sink) {
            Ok(handle) => self.transmissions.push(handle),
            Err(err) => tracing::error!(error = %err, "could not start inventory transmission"),
        }
        Ok(())
    }

    pub fn trigger_uid_snapshot(&mut self) -> SnapshotOutcome {
        let Some(daemon) = self.daemon() else {
            tracing::warn!("uid snapshot requested without a stats daemon");
            return SnapshotOutcome::NoDaemon;
        };
        match self.send_inventory(&daemon) {
            Ok(()) => SnapshotOutcome::Started,
            Err(err) => {
                tracing::error!(error = %err, "failed to trigger uid snapshot");
                SnapshotOutcome::Failed
            }
        }
    }

    // -----------------------------------------------------------------------
    // Disconnect
    // -----------------------------------------------------------------------

    /// Drop the handle and everything scoped to it. Safe to repeat.
    pub fn forget_everything(&mut self, reason: &'static str) {
        let previous = std::mem::replace(&mut self.state, SessionState::Disconnected);
        if let SessionState::Connected(connection) = &previous {
            tracing::info!(
                generation = connection.generation,
                reason,
                "forgetting stats daemon"
            );
        }
        drop(previous);

        for kind in ListenerKind::ALL {
            self.deps.registrar.unregister(kind);
        }

        let identity = self.deps.identity.clone();
        as_system(identity.as_ref(), || {
            self.alarms.cancel(AlarmKind::Anomaly);
            self.alarms.cancel(AlarmKind::Pulling);
        });

        for stats in &self.deps.call_stats {
            tracing::debug!(stats = stats.name(), "resetting call stats");
            stats.reset();
        }
        self.deps.dependent.daemon_not_ready();
    }

    /// A liveness watch fired. Counted once per connection generation.
    pub fn daemon_died(&mut self, generation: u64) {
        if generation != self.generation || self.counted_death == Some(generation) {
            tracing::debug!(
                generation,
                current = self.generation,
                "ignoring stale death notice"
            );
            return;
        }
        self.counted_death = Some(generation);

        tracing::info!(generation, "stats daemon died; erasing session state");
        self.forget_everything("daemon died");

        match self.guard.record_death(self.deps.clock.now_millis()) {
            GuardOutcome::Recorded { deaths } => {
                tracing::debug!(deaths, "recorded stats daemon death");
            }
            GuardOutcome::Mitigated { deleted } => {
                tracing::warn!(deleted = ?deleted, "crash storm mitigated");
            }
        }
    }

    // -----------------------------------------------------------------------
    // Alarms
    // -----------------------------------------------------------------------

    pub fn set_alarm(&mut self, kind: AlarmKind, fire_at: ElapsedMillis) {
        let identity = self.deps.identity.clone();
        as_system(identity.as_ref(), || self.alarms.set(kind, fire_at));
    }

    pub fn cancel_alarm(&mut self, kind: AlarmKind) -> bool {
        let identity = self.deps.identity.clone();
        as_system(identity.as_ref(), || self.alarms.cancel(kind))
    }

    /// Returns `None` when the firing was superseded and not forwarded.
    pub fn alarm_fired(&mut self, kind: AlarmKind, fire_at: ElapsedMillis) -> Option<ForwardOutcome> {
        if !self.alarms.take_fired(kind, fire_at) {
            tracing::debug!(kind = %kind, fire_at, "dropping superseded alarm firing");
            return None;
        }
        let daemon = self.daemon();
        Some(forward_firing(kind, daemon.as_ref()))
    }

    // -----------------------------------------------------------------------
    // Relay
    // -----------------------------------------------------------------------

    pub fn relay(&mut self, event: RelayEvent) -> RelayOutcome {
        if let Some(listener) = event.listener() {
            if !self.deps.registrar.is_registered(listener) {
                tracing::debug!(listener = %listener, "event for unregistered listener dropped");
                return RelayOutcome::NotListening { listener };
            }
        }

        let action = relay::plan(event);
        if relay::emit_metric(&action, self.deps.metrics.as_ref()) {
            return RelayOutcome::Emitted;
        }
        if let RelayAction::Ignore { reason } = action {
            tracing::debug!(reason, "event ignored");
            return RelayOutcome::Ignored { reason };
        }

        let Some(daemon) = self.daemon() else {
            tracing::warn!("no stats daemon to relay event to");
            return RelayOutcome::NoDaemon;
        };

        let result = match action {
            RelayAction::Package { package, uid } => {
                relay::inform_package(&daemon, self.deps.packages.as_ref(), &package, uid)
            }
            RelayAction::PackageRemoved { package, uid } => daemon
                .inform_one_package_removed(&package, uid)
                .map(|()| true),
            RelayAction::Inventory { user } => {
                tracing::info!(user = %user, "user set changed; resending inventory");
                self.send_inventory(&daemon).map(|()| true)
            }
            RelayAction::Shutdown => {
                tracing::info!("informing stats daemon of device shutdown");
                daemon.inform_device_shutdown().map(|()| true)
            }
            RelayAction::Thermal(_)
            | RelayAction::Connectivity { .. }
            | RelayAction::Ignore { .. } => Ok(false),
        };

        match result {
            Ok(true) => RelayOutcome::Delivered,
            Ok(false) => RelayOutcome::Dropped,
            Err(err) => {
                tracing::warn!(error = %err, "failed to relay event to stats daemon");
                self.forget_everything("relay call failed");
                RelayOutcome::DaemonLost {
                    reason: err.to_string(),
                }
            }
        }
    }

    // -----------------------------------------------------------------------
    // Diagnostics
    // -----------------------------------------------------------------------

    pub fn dump(&self) -> DumpReport {
        let boot_time = Utc::now() - chrono::Duration::milliseconds(self.deps.clock.now_millis());
        self.guard.dump(boot_time)
    }

    pub fn status(&mut self) -> SessionStatus {
        self.transmissions.retain(|handle| !handle.is_finished());
        let (connected, generation) = match &self.state {
            SessionState::Connected(connection) => (true, connection.generation),
            SessionState::Disconnected => (false, self.generation),
        };
        SessionStatus {
            connected,
            generation,
            listeners: ListenerKind::ALL
                .into_iter()
                .filter(|kind| self.deps.registrar.is_registered(*kind))
                .collect(),
            pending_alarms: self.alarms.pending(),
            recorded_deaths: self.guard.death_count(),
            deleted_configs: self.guard.deleted(),
            inventory_in_flight: self.transmissions.len(),
        }
    }
}

/// Sending side of the session queue.
#[derive(Clone)]
pub struct SessionHandle {
    commands: mpsc::UnboundedSender<SessionCommand>,
}

impl SessionHandle {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<SessionCommand>) {
        let (commands, rx) = mpsc::unbounded_channel();
        (Self { commands }, rx)
    }

    async fn request<T>(
        &self,
        what: &'static str,
        build: impl FnOnce(oneshot::Sender<T>) -> SessionCommand,
    ) -> Result<T, CompanionError> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(build(tx))
            .map_err(|_| CompanionError::ChannelClosed("session queue"))?;
        rx.await.map_err(|_| CompanionError::ChannelClosed(what))
    }

    pub async fn statsd_ready(
        &self,
        caller: Identity,
        announce: bool,
    ) -> Result<ReadyOutcome, CompanionError> {
        self.request("statsd ready response", |respond_to| {
            SessionCommand::StatsdReady {
                caller,
                announce,
                respond_to,
            }
        })
        .await
    }

    pub async fn trigger_uid_snapshot(
        &self,
        caller: Identity,
    ) -> Result<SnapshotOutcome, CompanionError> {
        self.request("uid snapshot response", |respond_to| {
            SessionCommand::TriggerUidSnapshot { caller, respond_to }
        })
        .await
    }

    pub async fn set_alarm(
        &self,
        caller: Identity,
        kind: AlarmKind,
        fire_at: ElapsedMillis,
    ) -> Result<(), CompanionError> {
        self.request("set alarm response", |respond_to| SessionCommand::SetAlarm {
            caller,
            kind,
            fire_at,
            respond_to,
        })
        .await
    }

    pub async fn cancel_alarm(
        &self,
        caller: Identity,
        kind: AlarmKind,
    ) -> Result<bool, CompanionError> {
        self.request("cancel alarm response", |respond_to| {
            SessionCommand::CancelAlarm {
                caller,
                kind,
                respond_to,
            }
        })
        .await
    }

    pub async fn relay(&self, event: RelayEvent) -> Result<RelayOutcome, CompanionError> {
        self.request("relay response", |respond_to| SessionCommand::Relay {
            event,
            respond_to: Some(respond_to),
        })
        .await
    }

    pub async fn dump(&self) -> Result<DumpReport, CompanionError> {
        self.request("dump response", |respond_to| SessionCommand::Dump {
            respond_to,
        })
        .await
    }

    pub async fn status(&self) -> Result<SessionStatus, CompanionError> {
        self.request("status response", |respond_to| SessionCommand::Status {
            respond_to,
        })
        .await
    }

    /// Post a timer firing. Called from the timer facility.
    pub fn alarm_fired(&self, kind: AlarmKind, fire_at: ElapsedMillis) {
        if self
            .commands
            .send(SessionCommand::AlarmFired { kind, fire_at })
            .is_err()
        {
            tracing::debug!(kind = %kind, "alarm fired after session stopped");
        }
    }

    /// Post a death notice. Called from liveness watches on any thread.
    pub fn daemon_died(&self, generation: u64) {
        if self
            .commands
            .send(SessionCommand::DaemonDied { generation })
            .is_err()
        {
            tracing::debug!(generation, "death notice after session stopped");
        }
    }

    pub fn shutdown(&self) {
        let _ = self.commands.send(SessionCommand::Shutdown);
    }
}

/// Run `session` on the blocking pool until it shuts down.
pub fn spawn_session(
    session: Session,
    commands: mpsc::UnboundedReceiver<SessionCommand>,
) -> tokio::task::JoinHandle<()> {
    tokio::task::spawn_blocking(move || session.run(commands))
}
