//! Alarm multiplexing on behalf of the stats daemon.
//!
//! The daemon owns no timers. It asks the liaison for at most one pending
//! wake-up per [`AlarmKind`]; the liaison arms the host timer facility and
//! forwards each firing back to whichever daemon handle is current at that
//! moment. Firings while disconnected are dropped: the daemon re-arms after
//! it reconnects.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use companion_core::platform::AlarmFacility;
use companion_core::{
    AlarmKind, AlarmRequest, DaemonHandle, ElapsedClock, ElapsedMillis, RemoteError,
};

/// Invoked by the timer facility with the kind and the deadline it was armed for.
pub type AlarmCallback = Arc<dyn Fn(AlarmKind, ElapsedMillis) + Send + Sync>;

/// Result of forwarding one firing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForwardOutcome {
    Delivered,
    /// No daemon handle held; the firing was dropped.
    NoDaemon,
    /// The daemon did not acknowledge. Does not tear the session down.
    Failed,
}

/// Per-kind bookkeeping in front of the host timer facility.
pub struct AlarmMultiplexer {
    facility: Arc<dyn AlarmFacility>,
    pending: BTreeMap<AlarmKind, ElapsedMillis>,
}

impl AlarmMultiplexer {
    pub fn new(facility: Arc<dyn AlarmFacility>) -> Self {
        Self {
            facility,
            pending: BTreeMap::new(),
        }
    }

    /// Register or replace the wake-up for `kind`.
    pub fn set(&mut self, kind: AlarmKind, fire_at: ElapsedMillis) {
        tracing::debug!(kind = %kind, fire_at, "setting alarm");
        self.facility.set_exact(kind, fire_at);
        self.pending.insert(kind, fire_at);
    }

    /// Remove the wake-up for `kind`. Returns whether one was pending.
    pub fn cancel(&mut self, kind: AlarmKind) -> bool {
        tracing::debug!(kind = %kind, "cancelling alarm");
        self.facility.cancel(kind);
        self.pending.remove(&kind).is_some()
    }

    /// Consume a firing. Returns `false` for a firing that was superseded by
    /// a later set or cancel while it was in flight.
    pub fn take_fired(&mut self, kind: AlarmKind, fire_at: ElapsedMillis) -> bool {
        match self.pending.get(&kind) {
            Some(armed) if *armed == fire_at => {
                self.pending.remove(&kind);
                true
            }
            _ => false,
        }
    }

    pub fn pending(&self) -> Vec<AlarmRequest> {
        self.pending
            .iter()
            .map(|(kind, fire_at)| AlarmRequest {
                kind: *kind,
                fire_at_elapsed_millis: *fire_at,
            })
            .collect()
    }
}

/// Forward a firing to the daemon with a two-way call, so the host keeps the
/// wake lock until the daemon has taken the event.
pub fn forward_firing(kind: AlarmKind, daemon: Option<&DaemonHandle>) -> ForwardOutcome {
    if kind == AlarmKind::Anomaly {
        tracing::info!("anomaly alarm fired");
    }
    let Some(daemon) = daemon else {
        tracing::warn!(kind = %kind, "no stats daemon to inform of alarm firing");
        return ForwardOutcome::NoDaemon;
    };

    let result: Result<(), RemoteError> = match kind {
        AlarmKind::Anomaly => daemon.inform_anomaly_alarm_fired(),
        AlarmKind::Periodic => daemon.inform_alarm_for_subscriber_triggering_fired(),
        AlarmKind::Pulling => daemon.inform_poll_alarm_fired(),
    };
    match result {
        Ok(()) => ForwardOutcome::Delivered,
        Err(err) => {
            tracing::warn!(kind = %kind, error = %err, "failed to inform stats daemon of alarm firing");
            ForwardOutcome::Failed
        }
    }
}

/// Longest delay handed to a tokio timer; keeps `Instant` arithmetic in range.
const MAX_ARM_DELAY: Duration = Duration::from_secs(10 * 365 * 24 * 3600);

/// Host timer facility built on tokio timers.
///
/// Deadlines are readings of the elapsed clock, converted to a tokio
/// deadline relative to the clock's current reading. The monotonic clock
/// does not advance during suspend, so alarms due while the device sleeps
/// fire once it is running again.
pub struct TokioAlarmFacility {
    runtime: Handle,
    clock: Arc<dyn ElapsedClock>,
    on_fire: AlarmCallback,
    timers: Mutex<HashMap<AlarmKind, JoinHandle<()>>>,
}

impl TokioAlarmFacility {
    pub fn new(runtime: Handle, clock: Arc<dyn ElapsedClock>, on_fire: AlarmCallback) -> Self {
        Self {
            runtime,
            clock,
            on_fire,
            timers: Mutex::new(HashMap::new()),
        }
    }

    fn deadline(&self, fire_at: ElapsedMillis) -> Instant {
        // Deadlines already in the past fire immediately.
        let remaining = u64::try_from(fire_at.saturating_sub(self.clock.now_millis())).unwrap_or(0);
        Instant::now() + Duration::from_millis(remaining).min(MAX_ARM_DELAY)
    }

    fn timers(&self) -> MutexGuard<'_, HashMap<AlarmKind, JoinHandle<()>>> {
        self.timers.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl AlarmFacility for TokioAlarmFacility {
    fn set_exact(&self, kind: AlarmKind, fire_at: ElapsedMillis) {
        let deadline = self.deadline(fire_at);
        let on_fire = self.on_fire.clone();
        let task = self.runtime.spawn(async move {
            tokio::time::sleep_until(deadline).await;
            on_fire(kind, fire_at);
        });
        if let Some(previous) = self.timers().insert(kind, task) {
            previous.abort();
        }
    }

    fn cancel(&self, kind: AlarmKind) {
        if let Some(task) = self.timers().remove(&kind) {
            task.abort();
        }
    }
}

impl Drop for TokioAlarmFacility {
    fn drop(&mut self) {
        for (_, task) in self.timers().drain() {
            task.abort();
        }
    }
}
