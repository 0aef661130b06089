//! Event relay: host broadcasts translated into daemon notifications.
//!
//! [`plan`] is a pure translation from an event to what should happen;
//! the session executes the plan against whichever daemon handle it holds.

use serde::{Deserialize, Serialize};

use companion_core::platform::{ListenerKind, MetricSink, PackageSource, ThermalSample};
use companion_core::{DaemonHandle, RemoteError, UserId};

/// A host event as delivered to the liaison.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum RelayEvent {
    PackageAdded {
        package: String,
        uid: i32,
        #[serde(default)]
        replacing: bool,
    },
    PackageRemoved {
        package: String,
        uid: i32,
        #[serde(default)]
        replacing: bool,
    },
    PackageReplaced {
        package: String,
        uid: i32,
    },
    UserInitialized {
        user: UserId,
    },
    UserRemoved {
        user: UserId,
    },
    Reboot,
    Shutdown {
        #[serde(default)]
        foreground: bool,
    },
    ThermalThrottling(ThermalSample),
    NetworkAvailable {
        net_id: u32,
    },
    NetworkLost {
        net_id: u32,
    },
}

impl RelayEvent {
    /// The session-scoped listener that receives this event. `None` for
    /// always-on listeners (thermal, connectivity).
    pub fn listener(&self) -> Option<ListenerKind> {
        match self {
            RelayEvent::PackageAdded { .. }
            | RelayEvent::PackageRemoved { .. }
            | RelayEvent::PackageReplaced { .. } => Some(ListenerKind::AppUpdate),
            RelayEvent::UserInitialized { .. } | RelayEvent::UserRemoved { .. } => {
                Some(ListenerKind::UserUpdate)
            }
            RelayEvent::Reboot | RelayEvent::Shutdown { .. } => Some(ListenerKind::Shutdown),
            RelayEvent::ThermalThrottling(_)
            | RelayEvent::NetworkAvailable { .. }
            | RelayEvent::NetworkLost { .. } => None,
        }
    }
}

/// What the session should do for an event.
#[derive(Debug, Clone, PartialEq)]
pub enum RelayAction {
    /// Send the package's current metadata.
    Package { package: String, uid: i32 },
    PackageRemoved { package: String, uid: i32 },
    /// Re-send the whole inventory; a new user has a copy of every app.
    Inventory { user: UserId },
    Shutdown,
    Thermal(ThermalSample),
    Connectivity { net_id: u32, connected: bool },
    Ignore { reason: &'static str },
}

pub fn plan(event: RelayEvent) -> RelayAction {
    match event {
        // An update arrives as remove+add flagged "replacing", then a replace.
        // Only the replace is relayed.
        RelayEvent::PackageAdded {
            replacing: true, ..
        }
        | RelayEvent::PackageRemoved {
            replacing: true, ..
        } => RelayAction::Ignore {
            reason: "replacing; the replace broadcast follows",
        },
        RelayEvent::PackageAdded { package, uid, .. }
        | RelayEvent::PackageReplaced { package, uid } => RelayAction::Package { package, uid },
        RelayEvent::PackageRemoved { package, uid, .. } => {
            RelayAction::PackageRemoved { package, uid }
        }
        RelayEvent::UserInitialized { user } | RelayEvent::UserRemoved { user } => {
            RelayAction::Inventory { user }
        }
        RelayEvent::Reboot => RelayAction::Shutdown,
        RelayEvent::Shutdown { foreground: true } => RelayAction::Shutdown,
        RelayEvent::Shutdown { foreground: false } => RelayAction::Ignore {
            reason: "background shutdown delivery",
        },
        RelayEvent::ThermalThrottling(sample) => RelayAction::Thermal(sample),
        RelayEvent::NetworkAvailable { net_id } => RelayAction::Connectivity {
            net_id,
            connected: true,
        },
        RelayEvent::NetworkLost { net_id } => RelayAction::Connectivity {
            net_id,
            connected: false,
        },
    }
}

/// Emit a local metric. Returns `false` for actions that are not metrics.
pub fn emit_metric(action: &RelayAction, metrics: &dyn MetricSink) -> bool {
    match action {
        RelayAction::Thermal(sample) => {
            metrics.thermal_throttling(sample);
            true
        }
        RelayAction::Connectivity { net_id, connected } => {
            metrics.connectivity_changed(*net_id, *connected);
            true
        }
        _ => false,
    }
}

/// Tell the daemon about one package. Returns `Ok(false)` when the package
/// cannot be found locally and nothing was sent.
pub fn inform_package(
    daemon: &DaemonHandle,
    packages: &dyn PackageSource,
    package: &str,
    uid: i32,
) -> Result<bool, RemoteError> {
    let info = match packages.package_info(package) {
        Ok(Some(info)) => info,
        Ok(None) => {
            tracing::warn!(package, "updated package not found; not informing stats daemon");
            return Ok(false);
        }
        Err(err) => {
            tracing::warn!(package, error = %err, "package lookup failed; not informing stats daemon");
            return Ok(false);
        }
    };
    let installer = packages
        .installer_of(package)
        .unwrap_or_else(|err| {
            tracing::debug!(package, error = %err, "installer lookup failed");
            None
        })
        .unwrap_or_default();

    daemon.inform_one_package(
        package,
        uid,
        info.version_code,
        info.version_name.as_deref().unwrap_or(""),
        &installer,
    )?;
    Ok(true)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::testing::{FakePackages, RecordingDaemon, RecordingMetrics};

    fn added(replacing: bool) -> RelayEvent {
        RelayEvent::PackageAdded {
            package: "com.example.mail".to_string(),
            uid: 10_001,
            replacing,
        }
    }

    #[test]
    fn replacing_add_and_remove_are_ignored() {
        assert!(matches!(plan(added(true)), RelayAction::Ignore { .. }));
        assert!(matches!(
            plan(RelayEvent::PackageRemoved {
                package: "com.example.mail".into(),
                uid: 10_001,
                replacing: true
            }),
            RelayAction::Ignore { .. }
        ));
    }

    #[test]
    fn plain_add_and_replace_send_package_metadata() {
        let expected = RelayAction::Package {
            package: "com.example.mail".to_string(),
            uid: 10_001,
        };
        assert_eq!(plan(added(false)), expected);
        assert_eq!(
            plan(RelayEvent::PackageReplaced {
                package: "com.example.mail".into(),
                uid: 10_001
            }),
            expected
        );
    }

    #[test]
    fn shutdown_relays_only_for_reboot_or_foreground() {
        assert_eq!(plan(RelayEvent::Reboot), RelayAction::Shutdown);
        assert_eq!(
            plan(RelayEvent::Shutdown { foreground: true }),
            RelayAction::Shutdown
        );
        assert!(matches!(
            plan(RelayEvent::Shutdown { foreground: false }),
            RelayAction::Ignore { .. }
        ));
    }

    #[test]
    fn user_changes_resend_inventory() {
        assert_eq!(
            plan(RelayEvent::UserInitialized { user: UserId(11) }),
            RelayAction::Inventory { user: UserId(11) }
        );
        assert_eq!(
            RelayEvent::UserRemoved { user: UserId(11) }.listener(),
            Some(ListenerKind::UserUpdate)
        );
    }

    #[test]
    fn thermal_and_connectivity_become_metrics() {
        let metrics = RecordingMetrics::default();
        let action = plan(RelayEvent::ThermalThrottling(ThermalSample {
            sensor_type: 3,
            sensor_name: "battery".into(),
            value: 41.26,
            status: 2,
        }));
        assert!(emit_metric(&action, &metrics));
        assert!(emit_metric(&plan(RelayEvent::NetworkLost { net_id: 100 }), &metrics));
        assert_eq!(
            metrics.lines(),
            vec!["thermal 3 battery 412 2", "connectivity 100 disconnected"]
        );
        assert_eq!(RelayEvent::NetworkLost { net_id: 100 }.listener(), None);
    }

    #[test]
    fn package_metadata_substitutes_empty_strings() {
        let daemon = Arc::new(RecordingDaemon::default());
        let handle: DaemonHandle = daemon.clone();
        let mut packages = FakePackages::default();
        packages.add(0, "com.example.mail", Some(10_001), 12, None);

        assert!(inform_package(&handle, &packages, "com.example.mail", 10_001).unwrap());
        assert_eq!(
            daemon.calls(),
            vec!["inform_one_package com.example.mail 10001 12 '' ''"]
        );
    }

    #[test]
    fn unknown_package_is_dropped_locally() {
        let daemon = Arc::new(RecordingDaemon::default());
        let handle: DaemonHandle = daemon.clone();
        let packages = FakePackages::default();

        assert!(!inform_package(&handle, &packages, "com.gone", 10_009).unwrap());
        assert!(daemon.calls().is_empty());
    }

    #[test]
    fn events_deserialize_from_tagged_json() {
        let event: RelayEvent =
            serde_json::from_str(r#"{"event":"package_removed","package":"com.x","uid":10050}"#)
                .unwrap();
        assert_eq!(
            event,
            RelayEvent::PackageRemoved {
                package: "com.x".into(),
                uid: 10_050,
                replacing: false
            }
        );
        let thermal: RelayEvent = serde_json::from_str(
            r#"{"event":"thermal_throttling","sensor_type":0,"sensor_name":"cpu","value":80.5,"status":3}"#,
        )
        .unwrap();
        assert_eq!(thermal.listener(), None);
    }
}
