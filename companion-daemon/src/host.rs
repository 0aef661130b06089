//! Concrete host facilities for a standalone liaison.
//!
//! The package inventory is read from a YAML file that the host keeps
//! current; listener registration, readiness and call statistics are kept
//! in memory; metrics go out as structured tracing events.

use std::collections::BTreeSet;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use serde::Deserialize;

use companion_core::config::PermissionConfig;
use companion_core::platform::{
    BroadcastRegistrar, CallStats, DependentManager, ListenerKind, MetricSink, PackageSource,
    ThermalSample,
};
use companion_core::{DaemonHandle, Identity, PackageInfo, PlatformError, UserId};

use crate::service::{Permission, PermissionChecker};

pub const METRICS_TARGET: &str = "companion::metrics";

// ---------------------------------------------------------------------------
// Broadcast listeners
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
pub struct ListenerTable {
    registered: Mutex<BTreeSet<ListenerKind>>,
    announcements: AtomicUsize,
}

impl ListenerTable {
    fn table(&self) -> MutexGuard<'_, BTreeSet<ListenerKind>> {
        self.registered
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub fn registered(&self) -> Vec<ListenerKind> {
        self.table().iter().copied().collect()
    }

    /// How many daemon-started announcements went out.
    pub fn announcements(&self) -> usize {
        self.announcements.load(Ordering::Relaxed)
    }
}

impl BroadcastRegistrar for ListenerTable {
    fn register(&self, kind: ListenerKind) -> Result<(), PlatformError> {
        if !self.table().insert(kind) {
            tracing::debug!(listener = %kind, "listener already registered");
        }
        Ok(())
    }

    fn unregister(&self, kind: ListenerKind) -> bool {
        self.table().remove(&kind)
    }

    fn is_registered(&self, kind: ListenerKind) -> bool {
        self.table().contains(&kind)
    }

    fn announce_daemon_started(&self) {
        self.announcements.fetch_add(1, Ordering::Relaxed);
        tracing::info!("stats daemon started");
    }
}

// ---------------------------------------------------------------------------
// Metrics, readiness, call statistics
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Clone, Copy)]
pub struct TracingMetricSink;

impl MetricSink for TracingMetricSink {
    fn thermal_throttling(&self, sample: &ThermalSample) {
        tracing::info!(
            target: METRICS_TARGET,
            metric = "thermal_throttling",
            sensor_type = sample.sensor_type,
            sensor_name = %sample.sensor_name,
            deci_celsius = sample.deci_value(),
            status = sample.status,
        );
    }

    fn connectivity_changed(&self, net_id: u32, connected: bool) {
        tracing::info!(
            target: METRICS_TARGET,
            metric = "connectivity_state_changed",
            net_id,
            connected,
        );
    }
}

/// Tracks whether the daemon handle is currently available to dependents.
#[derive(Debug, Default)]
pub struct ReadinessTracker {
    ready: AtomicBool,
    transitions: AtomicU64,
}

impl ReadinessTracker {
    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    pub fn transitions(&self) -> u64 {
        self.transitions.load(Ordering::Relaxed)
    }

    fn set(&self, ready: bool) {
        if self.ready.swap(ready, Ordering::AcqRel) != ready {
            self.transitions.fetch_add(1, Ordering::Relaxed);
        }
    }
}

impl DependentManager for ReadinessTracker {
    fn daemon_ready(&self, _handle: &DaemonHandle) {
        self.set(true);
    }

    fn daemon_not_ready(&self) {
        self.set(false);
    }
}

/// Counts control requests served while the daemon is connected.
#[derive(Debug)]
pub struct RequestCounter {
    name: &'static str,
    count: AtomicU64,
}

impl RequestCounter {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            count: AtomicU64::new(0),
        }
    }

    pub fn record(&self) {
        self.count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }
}

impl CallStats for RequestCounter {
    fn name(&self) -> &str {
        self.name
    }

    fn reset(&self) {
        self.count.store(0, Ordering::Relaxed);
    }
}

// ---------------------------------------------------------------------------
// Package inventory file
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct InventoryFile {
    users: Vec<UserId>,
    packages: Vec<PackageEntry>,
}

#[derive(Debug, Deserialize)]
struct PackageEntry {
    user: UserId,
    #[serde(flatten)]
    info: PackageInfo,
    #[serde(default)]
    installer: Option<String>,
}

/// Package source backed by a YAML inventory, re-read on every query.
///
/// ```yaml
/// users: [0, 10]
/// packages:
///   - user: 0
///     package_name: com.example.mail
///     uid: 10001
///     version_code: 12
///     version_name: "12.0"
///     installer: com.android.vending
/// ```
#[derive(Debug, Clone)]
pub struct FilePackageSource {
    path: PathBuf,
}

impl FilePackageSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn load(&self) -> Result<InventoryFile, PlatformError> {
        let contents = match fs::read_to_string(&self.path) {
            Ok(contents) => contents,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(InventoryFile::default()),
            Err(source) => {
                return Err(PlatformError::Io {
                    path: self.path.clone(),
                    source,
                })
            }
        };
        if contents.trim().is_empty() {
            return Ok(InventoryFile::default());
        }
        serde_yaml::from_str(&contents).map_err(|source| PlatformError::Parse {
            path: self.path.clone(),
            source,
        })
    }
}

impl PackageSource for FilePackageSource {
    fn users(&self) -> Result<Vec<UserId>, PlatformError> {
        let file = self.load()?;
        let mut users: BTreeSet<UserId> = file.users.into_iter().collect();
        users.extend(file.packages.iter().map(|entry| entry.user));
        Ok(users.into_iter().collect())
    }

    fn installed_packages(&self, user: UserId) -> Result<Vec<PackageInfo>, PlatformError> {
        Ok(self
            .load()?
            .packages
            .into_iter()
            .filter(|entry| entry.user == user)
            .map(|entry| entry.info)
            .collect())
    }

    fn package_info(&self, package: &str) -> Result<Option<PackageInfo>, PlatformError> {
        Ok(self
            .load()?
            .packages
            .into_iter()
            .find(|entry| entry.info.package_name == package)
            .map(|entry| entry.info))
    }

    fn installer_of(&self, package: &str) -> Result<Option<String>, PlatformError> {
        self.load()?
            .packages
            .into_iter()
            .find(|entry| entry.info.package_name == package)
            .map(|entry| entry.installer)
            .ok_or_else(|| PlatformError::UnknownPackage(package.to_string()))
    }
}

// ---------------------------------------------------------------------------
// Permissions
// ---------------------------------------------------------------------------

/// Uid allowlists per permission. An empty list leaves the permission open;
/// the liaison's own identity always passes.
#[derive(Debug, Clone, Default)]
pub struct UidAllowlist {
    companion: Vec<u32>,
    dump: Vec<u32>,
}

impl UidAllowlist {
    pub fn from_config(config: &PermissionConfig) -> Self {
        Self {
            companion: config.companion.clone(),
            dump: config.dump.clone(),
        }
    }
}

impl PermissionChecker for UidAllowlist {
    fn check(&self, identity: Identity, permission: Permission) -> bool {
        let allowed = match permission {
            Permission::Companion => &self.companion,
            Permission::Dump => &self.dump,
        };
        match identity {
            Identity::System => true,
            _ if allowed.is_empty() => true,
            Identity::Caller { uid: Some(uid) } => allowed.contains(&uid),
            Identity::Caller { uid: None } | Identity::Unset => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const INVENTORY: &str = r#"
users: [0, 10]
packages:
  - user: 0
    package_name: com.example.mail
    uid: 10001
    version_code: 12
    version_name: "12.0"
    installer: com.android.vending
  - user: 10
    package_name: com.example.mail
    uid: 1010001
    version_code: 12
  - user: 0
    package_name: android.overlay
"#;

    fn source(contents: &str) -> (TempDir, FilePackageSource) {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("packages.yaml");
        fs::write(&path, contents).unwrap();
        (dir, FilePackageSource::new(path))
    }

    #[test]
    fn inventory_file_is_split_by_user() {
        let (_dir, packages) = source(INVENTORY);

        assert_eq!(packages.users().unwrap(), vec![UserId(0), UserId(10)]);
        let owner = packages.installed_packages(UserId(0)).unwrap();
        assert_eq!(owner.len(), 2);
        assert_eq!(owner[1].uid, None);
        let work = packages.installed_packages(UserId(10)).unwrap();
        assert_eq!(work[0].uid, Some(1_010_001));
    }

    #[test]
    fn installer_lookup_distinguishes_unknown_packages() {
        let (_dir, packages) = source(INVENTORY);

        assert_eq!(
            packages.installer_of("com.example.mail").unwrap().as_deref(),
            Some("com.android.vending")
        );
        assert_eq!(packages.installer_of("android.overlay").unwrap(), None);
        assert!(matches!(
            packages.installer_of("com.missing"),
            Err(PlatformError::UnknownPackage(_))
        ));
    }

    #[test]
    fn missing_inventory_is_empty() {
        let dir = TempDir::new().unwrap();
        let packages = FilePackageSource::new(dir.path().join("absent.yaml"));
        assert!(packages.users().unwrap().is_empty());
        assert_eq!(packages.package_info("com.example.mail").unwrap(), None);
    }

    #[test]
    fn malformed_inventory_is_a_parse_error() {
        let (_dir, packages) = source("users: {not: [a list");
        assert!(matches!(
            packages.users(),
            Err(PlatformError::Parse { .. })
        ));
    }

    #[test]
    fn listener_table_tolerates_repeats() {
        let table = ListenerTable::default();
        table.register(ListenerKind::Shutdown).unwrap();
        table.register(ListenerKind::Shutdown).unwrap();
        assert_eq!(table.registered(), vec![ListenerKind::Shutdown]);
        assert!(table.unregister(ListenerKind::Shutdown));
        assert!(!table.unregister(ListenerKind::Shutdown));
    }

    #[test]
    fn readiness_counts_transitions_not_calls() {
        let tracker = ReadinessTracker::default();
        tracker.daemon_not_ready();
        tracker.daemon_not_ready();
        assert_eq!(tracker.transitions(), 0);
        assert!(!tracker.is_ready());
    }

    #[test]
    fn request_counter_resets() {
        let counter = RequestCounter::new("control_requests");
        counter.record();
        counter.record();
        assert_eq!(counter.count(), 2);
        counter.reset();
        assert_eq!(counter.count(), 0);
        assert_eq!(counter.name(), "control_requests");
    }

    #[test]
    fn allowlist_is_open_when_empty() {
        let open = UidAllowlist::default();
        assert!(open.check(Identity::caller(None), Permission::Dump));

        let locked = UidAllowlist::from_config(&PermissionConfig {
            companion: vec![1066],
            dump: vec![],
        });
        assert!(locked.check(Identity::caller(Some(1066)), Permission::Companion));
        assert!(!locked.check(Identity::caller(Some(2000)), Permission::Companion));
        assert!(!locked.check(Identity::caller(None), Permission::Companion));
        assert!(locked.check(Identity::System, Permission::Companion));
        assert!(locked.check(Identity::caller(Some(2000)), Permission::Dump));
    }
}
