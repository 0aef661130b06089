//! In-memory collaborators for unit tests.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::os::unix::net::UnixStream;
use std::sync::{Arc, Mutex};

use companion_core::platform::{
    AlarmFacility, BroadcastRegistrar, CallStats, DependentManager, ListenerKind, MetricSink,
    PackageSource, ThermalSample,
};
use companion_core::{
    AlarmKind, DaemonHandle, DaemonLocator, DeathRecipient, ElapsedMillis, Identity,
    InventorySink, LivenessWatch, PackageInfo, PlatformError, RemoteError, StatsDaemon, UserId,
};

use crate::host::ListenerTable;
use crate::privilege::{IdentityContext, ThreadIdentity};

struct FakeWatch;

impl LivenessWatch for FakeWatch {}

/// Stats daemon that records every call and can be told to fail or die.
#[derive(Default)]
pub struct RecordingDaemon {
    calls: Mutex<Vec<String>>,
    failing: Mutex<HashSet<&'static str>>,
    recipients: Mutex<Vec<DeathRecipient>>,
    uid_streams: Mutex<Vec<UnixStream>>,
}

impl RecordingDaemon {
    fn record(&self, call: &'static str, detail: Option<String>) -> Result<(), RemoteError> {
        let entry = match detail {
            Some(detail) => format!("{call} {detail}"),
            None => call.to_string(),
        };
        self.calls.lock().unwrap().push(entry);
        if self.failing.lock().unwrap().contains(call) {
            return Err(RemoteError::Protocol {
                call,
                message: "injected failure".to_string(),
            });
        }
        Ok(())
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn fail_call(&self, call: &'static str) {
        self.failing.lock().unwrap().insert(call);
    }

    /// Fire every installed death recipient. Returns how many fired.
    pub fn kill(&self) -> usize {
        let recipients: Vec<_> = self.recipients.lock().unwrap().drain(..).collect();
        let count = recipients.len();
        for recipient in recipients {
            recipient();
        }
        count
    }

    /// Read ends of every inventory channel handed over so far.
    pub fn take_uid_streams(&self) -> Vec<UnixStream> {
        self.uid_streams.lock().unwrap().drain(..).collect()
    }
}

impl StatsDaemon for RecordingDaemon {
    fn stats_companion_ready(&self) -> Result<(), RemoteError> {
        self.record("stats_companion_ready", None)
    }

    fn link_to_death(
        &self,
        recipient: DeathRecipient,
    ) -> Result<Box<dyn LivenessWatch>, RemoteError> {
        self.record("link_to_death", None)?;
        self.recipients.lock().unwrap().push(recipient);
        Ok(Box::new(FakeWatch))
    }

    fn inform_anomaly_alarm_fired(&self) -> Result<(), RemoteError> {
        self.record("inform_anomaly_alarm_fired", None)
    }

    fn inform_poll_alarm_fired(&self) -> Result<(), RemoteError> {
        self.record("inform_poll_alarm_fired", None)
    }

    fn inform_alarm_for_subscriber_triggering_fired(&self) -> Result<(), RemoteError> {
        self.record("inform_alarm_for_subscriber_triggering_fired", None)
    }

    fn inform_all_uid_data(&self) -> Result<InventorySink, RemoteError> {
        self.record("inform_all_uid_data", None)?;
        let (reader, writer) = UnixStream::pair().map_err(|source| RemoteError::Io {
            call: "inform_all_uid_data",
            source,
        })?;
        self.uid_streams.lock().unwrap().push(reader);
        Ok(Box::new(writer))
    }

    fn inform_one_package(
        &self,
        package: &str,
        uid: i32,
        version_code: i64,
        version_name: &str,
        installer: &str,
    ) -> Result<(), RemoteError> {
        self.record(
            "inform_one_package",
            Some(format!(
                "{package} {uid} {version_code} '{version_name}' '{installer}'"
            )),
        )
    }

    fn inform_one_package_removed(&self, package: &str, uid: i32) -> Result<(), RemoteError> {
        self.record("inform_one_package_removed", Some(format!("{package} {uid}")))
    }

    fn inform_device_shutdown(&self) -> Result<(), RemoteError> {
        self.record("inform_device_shutdown", None)
    }
}

/// Locator returning whatever daemon is currently published.
#[derive(Default)]
pub struct FakeLocator {
    published: Mutex<Option<DaemonHandle>>,
}

impl FakeLocator {
    pub fn publish(&self, daemon: DaemonHandle) {
        *self.published.lock().unwrap() = Some(daemon);
    }

    pub fn withdraw(&self) {
        *self.published.lock().unwrap() = None;
    }
}

impl DaemonLocator for FakeLocator {
    fn fetch(&self) -> Option<DaemonHandle> {
        self.published.lock().unwrap().clone()
    }
}

/// Timer facility that only records, noting the identity of each call.
#[derive(Default)]
pub struct RecordingFacility {
    sets: Mutex<Vec<(AlarmKind, ElapsedMillis)>>,
    cancels: Mutex<Vec<AlarmKind>>,
    identities: Mutex<Vec<Identity>>,
}

impl RecordingFacility {
    pub fn sets(&self) -> Vec<(AlarmKind, ElapsedMillis)> {
        self.sets.lock().unwrap().clone()
    }

    pub fn cancels(&self) -> Vec<AlarmKind> {
        self.cancels.lock().unwrap().clone()
    }

    pub fn identities(&self) -> Vec<Identity> {
        self.identities.lock().unwrap().clone()
    }
}

impl AlarmFacility for RecordingFacility {
    fn set_exact(&self, kind: AlarmKind, fire_at: ElapsedMillis) {
        self.identities.lock().unwrap().push(ThreadIdentity.current());
        self.sets.lock().unwrap().push((kind, fire_at));
    }

    fn cancel(&self, kind: AlarmKind) {
        self.identities.lock().unwrap().push(ThreadIdentity.current());
        self.cancels.lock().unwrap().push(kind);
    }
}

/// Package source backed by in-memory tables.
#[derive(Default)]
pub struct FakePackages {
    by_user: BTreeMap<u32, Vec<PackageInfo>>,
    installers: HashMap<String, String>,
}

impl FakePackages {
    pub fn add(
        &mut self,
        user: u32,
        package: &str,
        uid: Option<i32>,
        version_code: i64,
        version_name: Option<&str>,
    ) {
        self.by_user.entry(user).or_default().push(PackageInfo {
            package_name: package.to_string(),
            uid,
            version_code,
            version_name: version_name.map(str::to_string),
        });
    }

    pub fn set_installer(&mut self, package: &str, installer: &str) {
        self.installers
            .insert(package.to_string(), installer.to_string());
    }

    /// `users` profiles with `per_user` packages each.
    pub fn grid(users: u32, per_user: usize) -> Self {
        let mut packages = Self::default();
        for user in 0..users {
            for index in 0..per_user {
                let name = format!("com.example.app{index}");
                let uid = (user as i32) * 100_000 + 10_000 + index as i32;
                packages.add(user, &name, Some(uid), index as i64, Some("1.0"));
                packages.set_installer(&name, "com.android.vending");
            }
        }
        packages
    }
}

impl PackageSource for FakePackages {
    fn users(&self) -> Result<Vec<UserId>, PlatformError> {
        Ok(self.by_user.keys().copied().map(UserId).collect())
    }

    fn installed_packages(&self, user: UserId) -> Result<Vec<PackageInfo>, PlatformError> {
        Ok(self.by_user.get(&user.0).cloned().unwrap_or_default())
    }

    fn package_info(&self, package: &str) -> Result<Option<PackageInfo>, PlatformError> {
        Ok(self
            .by_user
            .values()
            .flatten()
            .find(|info| info.package_name == package)
            .cloned())
    }

    fn installer_of(&self, package: &str) -> Result<Option<String>, PlatformError> {
        Ok(self.installers.get(package).cloned())
    }
}

/// Registrar that can be told to refuse one listener kind.
#[derive(Default)]
pub struct FlakyRegistrar {
    table: ListenerTable,
    refuse: Mutex<Option<ListenerKind>>,
}

impl FlakyRegistrar {
    pub fn refuse(&self, kind: ListenerKind) {
        *self.refuse.lock().unwrap() = Some(kind);
    }

    pub fn registered(&self) -> Vec<ListenerKind> {
        self.table.registered()
    }

    pub fn announcements(&self) -> usize {
        self.table.announcements()
    }
}

impl BroadcastRegistrar for FlakyRegistrar {
    fn register(&self, kind: ListenerKind) -> Result<(), PlatformError> {
        if *self.refuse.lock().unwrap() == Some(kind) {
            return Err(PlatformError::Unavailable(format!("{kind} refused")));
        }
        self.table.register(kind)
    }

    fn unregister(&self, kind: ListenerKind) -> bool {
        self.table.unregister(kind)
    }

    fn is_registered(&self, kind: ListenerKind) -> bool {
        self.table.is_registered(kind)
    }

    fn announce_daemon_started(&self) {
        self.table.announce_daemon_started();
    }
}

#[derive(Default)]
pub struct RecordingMetrics {
    lines: Mutex<Vec<String>>,
}

impl RecordingMetrics {
    pub fn lines(&self) -> Vec<String> {
        self.lines.lock().unwrap().clone()
    }
}

impl MetricSink for RecordingMetrics {
    fn thermal_throttling(&self, sample: &ThermalSample) {
        self.lines.lock().unwrap().push(format!(
            "thermal {} {} {} {}",
            sample.sensor_type,
            sample.sensor_name,
            sample.deci_value(),
            sample.status
        ));
    }

    fn connectivity_changed(&self, net_id: u32, connected: bool) {
        let state = if connected { "connected" } else { "disconnected" };
        self.lines
            .lock()
            .unwrap()
            .push(format!("connectivity {net_id} {state}"));
    }
}

#[derive(Default)]
pub struct RecordingDependent {
    events: Mutex<Vec<&'static str>>,
}

impl RecordingDependent {
    pub fn events(&self) -> Vec<&'static str> {
        self.events.lock().unwrap().clone()
    }
}

impl DependentManager for RecordingDependent {
    fn daemon_ready(&self, _handle: &DaemonHandle) {
        self.events.lock().unwrap().push("ready");
    }

    fn daemon_not_ready(&self) {
        self.events.lock().unwrap().push("not_ready");
    }
}

#[derive(Default)]
pub struct RecordingStats {
    resets: Mutex<usize>,
}

impl RecordingStats {
    pub fn resets(&self) -> usize {
        *self.resets.lock().unwrap()
    }
}

impl CallStats for RecordingStats {
    fn name(&self) -> &str {
        "recording"
    }

    fn reset(&self) {
        *self.resets.lock().unwrap() += 1;
    }
}

/// Shorthand for sharing a recording daemon as a trait object.
pub fn handle(daemon: &Arc<RecordingDaemon>) -> DaemonHandle {
    daemon.clone()
}
