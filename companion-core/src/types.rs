//! Domain types shared by the liaison components.
//!
//! Timestamps on the elapsed clock are plain `i64` milliseconds
//! ([`ElapsedMillis`]); wall-clock time only appears in the diagnostic dump.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Milliseconds on the elapsed (monotonic, suspend-excluding) clock.
pub type ElapsedMillis = i64;

// ---------------------------------------------------------------------------
// Newtypes
// ---------------------------------------------------------------------------

/// A device user profile identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct UserId(pub u32);

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<u32> for UserId {
    fn from(id: u32) -> Self {
        Self(id)
    }
}

// ---------------------------------------------------------------------------
// Alarms
// ---------------------------------------------------------------------------

/// The three timer classes the stats daemon may request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlarmKind {
    /// Anomaly detection deadline.
    Anomaly,
    /// Periodic subscriber triggering.
    Periodic,
    /// Next scheduled pull.
    Pulling,
}

impl AlarmKind {
    pub const ALL: [AlarmKind; 3] = [AlarmKind::Anomaly, AlarmKind::Periodic, AlarmKind::Pulling];

    /// Tag handed to the timer facility, used in its own diagnostics.
    pub fn tag(self) -> &'static str {
        match self {
            AlarmKind::Anomaly => "companion.anomaly",
            AlarmKind::Periodic => "companion.periodic",
            AlarmKind::Pulling => "companion.pull",
        }
    }
}

impl fmt::Display for AlarmKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AlarmKind::Anomaly => write!(f, "anomaly"),
            AlarmKind::Periodic => write!(f, "periodic"),
            AlarmKind::Pulling => write!(f, "pulling"),
        }
    }
}

impl FromStr for AlarmKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "anomaly" => Ok(AlarmKind::Anomaly),
            "periodic" | "subscriber" => Ok(AlarmKind::Periodic),
            "pulling" | "pull" => Ok(AlarmKind::Pulling),
            other => Err(format!(
                "unknown alarm kind '{other}'; expected: anomaly, periodic, pulling"
            )),
        }
    }
}

/// A pending single-shot wake-up. At most one exists per kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AlarmRequest {
    pub kind: AlarmKind,
    pub fire_at_elapsed_millis: ElapsedMillis,
}

// ---------------------------------------------------------------------------
// Packages and inventory
// ---------------------------------------------------------------------------

/// Package metadata as reported by the host package source.
///
/// `uid` is `None` when the package has no application metadata; such
/// packages are skipped by inventory enumeration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackageInfo {
    pub package_name: String,
    #[serde(default)]
    pub uid: Option<i32>,
    #[serde(default)]
    pub version_code: i64,
    #[serde(default)]
    pub version_name: Option<String>,
}

/// One record of the bulk inventory stream. Transient: built, encoded, dropped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppInventoryRecord {
    pub uid: i32,
    pub version_code: i64,
    pub version_name: String,
    pub package_name: String,
    /// Empty when the installer could not be resolved; never absent.
    pub installer_package_name: String,
}

impl AppInventoryRecord {
    /// Build a record from package metadata. Returns `None` when the package
    /// carries no application metadata.
    pub fn from_package(info: &PackageInfo, installer: Option<String>) -> Option<Self> {
        let uid = info.uid?;
        Some(Self {
            uid,
            version_code: info.version_code,
            version_name: info.version_name.clone().unwrap_or_default(),
            package_name: info.package_name.clone(),
            installer_package_name: installer.unwrap_or_default(),
        })
    }
}

// ---------------------------------------------------------------------------
// Crash-storm bookkeeping
// ---------------------------------------------------------------------------

/// A configuration file removed to break a daemon crash loop.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeletedConfigRecord {
    pub timestamp: ElapsedMillis,
    pub file_name: String,
}

// ---------------------------------------------------------------------------
// Identity
// ---------------------------------------------------------------------------

/// The identity on whose behalf an OS call is made.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase", tag = "type")]
pub enum Identity {
    /// The liaison's own privileged identity.
    System,
    /// An external caller, identified by its uid when known.
    Caller { uid: Option<u32> },
    /// No identity has been assumed on this thread.
    #[default]
    Unset,
}

impl Identity {
    pub fn caller(uid: Option<u32>) -> Self {
        Identity::Caller { uid }
    }

    pub fn uid(&self) -> Option<u32> {
        match self {
            Identity::Caller { uid } => *uid,
            _ => None,
        }
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Identity::System => write!(f, "system"),
            Identity::Caller { uid: Some(uid) } => write!(f, "uid {uid}"),
            Identity::Caller { uid: None } => write!(f, "unknown caller"),
            Identity::Unset => write!(f, "unset"),
        }
    }
}
