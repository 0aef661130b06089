//! The liaison's API front door.
//!
//! Every entry point checks the caller's permission before anything is
//! queued for the session, so a rejected call has no side effects.

use std::fmt;
use std::sync::Arc;

use serde::Serialize;

use companion_core::{AlarmKind, ElapsedMillis, Identity};

use crate::error::CompanionError;
use crate::guard::DumpReport;
use crate::relay::RelayEvent;
use crate::session::{ReadyOutcome, RelayOutcome, SessionHandle, SessionStatus, SnapshotOutcome};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Permission {
    /// Alarm management, readiness, snapshots and event delivery.
    Companion,
    /// Diagnostic dump and status.
    Dump,
}

impl fmt::Display for Permission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Permission::Companion => write!(f, "companion"),
            Permission::Dump => write!(f, "dump"),
        }
    }
}

pub trait PermissionChecker: Send + Sync {
    fn check(&self, identity: Identity, permission: Permission) -> bool;
}

#[derive(Clone)]
pub struct CompanionService {
    session: SessionHandle,
    permissions: Arc<dyn PermissionChecker>,
}

impl CompanionService {
    pub fn new(session: SessionHandle, permissions: Arc<dyn PermissionChecker>) -> Self {
        Self {
            session,
            permissions,
        }
    }

    fn enforce(&self, caller: Identity, permission: Permission) -> Result<(), CompanionError> {
        if self.permissions.check(caller, permission) {
            return Ok(());
        }
        tracing::warn!(caller = %caller, permission = %permission, "permission denied");
        Err(CompanionError::PermissionDenied {
            identity: caller,
            permission,
        })
    }

    pub async fn set_alarm(
        &self,
        caller: Identity,
        kind: AlarmKind,
        fire_at: ElapsedMillis,
    ) -> Result<(), CompanionError> {
        self.enforce(caller, Permission::Companion)?;
        self.session.set_alarm(caller, kind, fire_at).await
    }

    /// Returns whether an alarm of `kind` was pending.
    pub async fn cancel_alarm(
        &self,
        caller: Identity,
        kind: AlarmKind,
    ) -> Result<bool, CompanionError> {
        self.enforce(caller, Permission::Companion)?;
        self.session.cancel_alarm(caller, kind).await
    }

    pub async fn set_anomaly_alarm(
        &self,
        caller: Identity,
        fire_at: ElapsedMillis,
    ) -> Result<(), CompanionError> {
        self.set_alarm(caller, AlarmKind::Anomaly, fire_at).await
    }

    pub async fn cancel_anomaly_alarm(&self, caller: Identity) -> Result<bool, CompanionError> {
        self.cancel_alarm(caller, AlarmKind::Anomaly).await
    }

    pub async fn set_alarm_for_subscriber_triggering(
        &self,
        caller: Identity,
        fire_at: ElapsedMillis,
    ) -> Result<(), CompanionError> {
        self.set_alarm(caller, AlarmKind::Periodic, fire_at).await
    }

    pub async fn cancel_alarm_for_subscriber_triggering(
        &self,
        caller: Identity,
    ) -> Result<bool, CompanionError> {
        self.cancel_alarm(caller, AlarmKind::Periodic).await
    }

    pub async fn set_pulling_alarm(
        &self,
        caller: Identity,
        fire_at: ElapsedMillis,
    ) -> Result<(), CompanionError> {
        self.set_alarm(caller, AlarmKind::Pulling, fire_at).await
    }

    pub async fn cancel_pulling_alarm(&self, caller: Identity) -> Result<bool, CompanionError> {
        self.cancel_alarm(caller, AlarmKind::Pulling).await
    }

    /// The daemon announces it has started and wants a handshake.
    pub async fn statsd_ready(&self, caller: Identity) -> Result<ReadyOutcome, CompanionError> {
        self.enforce(caller, Permission::Companion)?;
        self.session.statsd_ready(caller, true).await
    }

    /// Handshake attempt at liaison startup, in case the daemon is already up.
    pub async fn system_ready(&self) -> Result<ReadyOutcome, CompanionError> {
        self.session.statsd_ready(Identity::System, false).await
    }

    pub async fn trigger_uid_snapshot(
        &self,
        caller: Identity,
    ) -> Result<SnapshotOutcome, CompanionError> {
        self.enforce(caller, Permission::Companion)?;
        self.session.trigger_uid_snapshot(caller).await
    }

    pub async fn broadcast(
        &self,
        caller: Identity,
        event: RelayEvent,
    ) -> Result<RelayOutcome, CompanionError> {
        self.enforce(caller, Permission::Companion)?;
        self.session.relay(event).await
    }

    pub async fn dump(&self, caller: Identity) -> Result<DumpReport, CompanionError> {
        self.enforce(caller, Permission::Dump)?;
        self.session.dump().await
    }

    pub async fn status(&self, caller: Identity) -> Result<SessionStatus, CompanionError> {
        self.enforce(caller, Permission::Dump)?;
        self.session.status().await
    }
}
