//! Host OS facilities the liaison drives.
//!
//! Each trait is a narrow seam around something the liaison does not own:
//! package enumeration, the timer facility, broadcast registration, metric
//! emission and the collaborators that care about daemon readiness.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::PlatformError;
use crate::remote::DaemonHandle;
use crate::types::{AlarmKind, ElapsedMillis, PackageInfo, UserId};

/// Installed-package enumeration across device users.
pub trait PackageSource: Send + Sync {
    /// All user profiles, including ones still being initialized.
    fn users(&self) -> Result<Vec<UserId>, PlatformError>;

    /// Packages visible to `user`, including uninstalled and any-user variants.
    fn installed_packages(&self, user: UserId) -> Result<Vec<PackageInfo>, PlatformError>;

    /// Look up a single package across all users.
    fn package_info(&self, package: &str) -> Result<Option<PackageInfo>, PlatformError>;

    /// The package that installed `package`. `Ok(None)` when unknown.
    fn installer_of(&self, package: &str) -> Result<Option<String>, PlatformError>;
}

/// Single-shot timer facility on the elapsed clock.
///
/// Setting a kind replaces any pending timer of that kind. Timers anchored to
/// the elapsed clock never wake a suspended device.
pub trait AlarmFacility: Send + Sync {
    fn set_exact(&self, kind: AlarmKind, fire_at: ElapsedMillis);

    /// Remove the pending timer of `kind`; a no-op when none is pending.
    fn cancel(&self, kind: AlarmKind);
}

/// Session-scoped broadcast listeners.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ListenerKind {
    /// Package added / removed / replaced.
    AppUpdate,
    /// User initialized / removed.
    UserUpdate,
    /// Reboot / shutdown.
    Shutdown,
}

impl ListenerKind {
    pub const ALL: [ListenerKind; 3] = [
        ListenerKind::AppUpdate,
        ListenerKind::UserUpdate,
        ListenerKind::Shutdown,
    ];
}

impl fmt::Display for ListenerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ListenerKind::AppUpdate => write!(f, "app_update"),
            ListenerKind::UserUpdate => write!(f, "user_update"),
            ListenerKind::Shutdown => write!(f, "shutdown"),
        }
    }
}

/// Broadcast listener registration.
pub trait BroadcastRegistrar: Send + Sync {
    fn register(&self, kind: ListenerKind) -> Result<(), PlatformError>;

    /// Returns whether the listener was registered. Must tolerate repeats.
    fn unregister(&self, kind: ListenerKind) -> bool;

    fn is_registered(&self, kind: ListenerKind) -> bool;

    /// Tell interested parties the stats daemon announced itself.
    fn announce_daemon_started(&self);
}

/// A throttling notification from the thermal subsystem.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThermalSample {
    pub sensor_type: i32,
    pub sensor_name: String,
    pub value: f32,
    pub status: i32,
}

impl ThermalSample {
    /// Temperature in tenths of a degree, truncated toward zero.
    pub fn deci_value(&self) -> i32 {
        (self.value * 10.0) as i32
    }
}

/// Locally emitted metrics that do not involve the daemon.
pub trait MetricSink: Send + Sync {
    fn thermal_throttling(&self, sample: &ThermalSample);
    fn connectivity_changed(&self, net_id: u32, connected: bool);
}

/// A collaborator that must learn when the daemon handle comes and goes.
pub trait DependentManager: Send + Sync {
    fn daemon_ready(&self, handle: &DaemonHandle);
    fn daemon_not_ready(&self);
}

/// Call statistics that are reset whenever the daemon goes away.
pub trait CallStats: Send + Sync {
    fn name(&self) -> &str;
    fn reset(&self);
}
