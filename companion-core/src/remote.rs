//! The stats daemon as seen from the liaison.
//!
//! All calls are synchronous two-way IPC bounded by an OS-enforced timeout.
//! A returned [`RemoteError`] means the daemon should be presumed unreachable
//! for that call; whether that tears the session down is the caller's choice.

use std::io::Write;
use std::sync::Arc;

use crate::error::RemoteError;

/// Process-wide reference to the connected daemon.
pub type DaemonHandle = Arc<dyn StatsDaemon>;

/// One-shot callback fired when the daemon process terminates.
pub type DeathRecipient = Box<dyn FnOnce() + Send + 'static>;

/// Write end of the bulk inventory channel. Dropping it closes the channel.
pub type InventorySink = Box<dyn Write + Send + 'static>;

/// An installed liveness subscription. Dropping it detaches the watch; a
/// detached watch may still fire, so recipients must tolerate late delivery.
pub trait LivenessWatch: Send {}

pub trait StatsDaemon: Send + Sync {
    /// Handshake: confirm the liaison is ready to serve the daemon.
    fn stats_companion_ready(&self) -> Result<(), RemoteError>;

    /// Install a liveness watch that runs `recipient` once on daemon death.
    fn link_to_death(
        &self,
        recipient: DeathRecipient,
    ) -> Result<Box<dyn LivenessWatch>, RemoteError>;

    fn inform_anomaly_alarm_fired(&self) -> Result<(), RemoteError>;
    fn inform_poll_alarm_fired(&self) -> Result<(), RemoteError>;
    fn inform_alarm_for_subscriber_triggering_fired(&self) -> Result<(), RemoteError>;

    /// Hand the daemon the read end of a fresh byte channel and return the
    /// write end.
    fn inform_all_uid_data(&self) -> Result<InventorySink, RemoteError>;

    fn inform_one_package(
        &self,
        package: &str,
        uid: i32,
        version_code: i64,
        version_name: &str,
        installer: &str,
    ) -> Result<(), RemoteError>;

    fn inform_one_package_removed(&self, package: &str, uid: i32) -> Result<(), RemoteError>;

    fn inform_device_shutdown(&self) -> Result<(), RemoteError>;
}

/// Service lookup for the daemon. `None` when it is not (yet) published.
pub trait DaemonLocator: Send + Sync {
    fn fetch(&self) -> Option<DaemonHandle>;
}
