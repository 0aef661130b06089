//! Liaison configuration.
//!
//! # Storage layout
//!
//! ```text
//! ~/.companion/
//!   config.yaml        (optional; every key optional)
//!   stats-service/     (persisted daemon configs, pruned by the crash-storm guard)
//!   statsd.sock        (stats daemon endpoint)
//!   packages.yaml      (package inventory source)
//! ```
//!
//! # API pattern
//!
//! - `load_at(home)`: explicit home; used in tests with `TempDir`
//! - `load()`: derives home from `dirs::home_dir()`, delegates to `load_at`

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::error::{config_io_err, ConfigError};

pub const CONFIG_FILE: &str = "config.yaml";
pub const DEFAULT_IPC_TIMEOUT_MS: u64 = 2000;
pub const DEFAULT_DEATH_THRESHOLD: usize = 10;
pub const DEFAULT_DEATH_RETENTION_HOURS: u64 = 24;
pub const DEFAULT_DELETED_RETENTION_DAYS: u64 = 7;

/// `<home>/.companion`
pub fn companion_root(home: &Path) -> PathBuf {
    home.join(".companion")
}

/// `<home>/.companion/config.yaml`: pure, no I/O.
pub fn config_path_at(home: &Path) -> PathBuf {
    companion_root(home).join(CONFIG_FILE)
}

/// Uid allowlists per permission. An empty list leaves the permission open.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct PermissionConfig {
    pub companion: Vec<u32>,
    pub dump: Vec<u32>,
}

/// On-disk shape. Every key is optional.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct ConfigFile {
    config_dir: Option<PathBuf>,
    daemon_socket: Option<PathBuf>,
    package_inventory: Option<PathBuf>,
    ipc_timeout_ms: Option<u64>,
    death_threshold: Option<usize>,
    death_retention_hours: Option<u64>,
    deleted_retention_days: Option<u64>,
    permissions: PermissionConfig,
}

/// Resolved configuration with defaults applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompanionConfig {
    pub config_dir: PathBuf,
    pub daemon_socket: PathBuf,
    pub package_inventory: PathBuf,
    pub ipc_timeout: Duration,
    pub death_threshold: usize,
    pub death_retention: Duration,
    pub deleted_retention: Duration,
    pub permissions: PermissionConfig,
}

impl CompanionConfig {
    /// Defaults rooted at `home`.
    pub fn defaults_at(home: &Path) -> Self {
        let root = companion_root(home);
        Self {
            config_dir: root.join("stats-service"),
            daemon_socket: root.join("statsd.sock"),
            package_inventory: root.join("packages.yaml"),
            ipc_timeout: Duration::from_millis(DEFAULT_IPC_TIMEOUT_MS),
            death_threshold: DEFAULT_DEATH_THRESHOLD,
            death_retention: Duration::from_secs(DEFAULT_DEATH_RETENTION_HOURS * 60 * 60),
            deleted_retention: Duration::from_secs(DEFAULT_DELETED_RETENTION_DAYS * 24 * 60 * 60),
            permissions: PermissionConfig::default(),
        }
    }

    fn apply(mut self, file: ConfigFile) -> Result<Self, ConfigError> {
        if let Some(dir) = file.config_dir {
            self.config_dir = dir;
        }
        if let Some(socket) = file.daemon_socket {
            self.daemon_socket = socket;
        }
        if let Some(inventory) = file.package_inventory {
            self.package_inventory = inventory;
        }
        if let Some(ms) = file.ipc_timeout_ms {
            if ms == 0 {
                return Err(ConfigError::Invalid {
                    key: "ipc_timeout_ms",
                    reason: "must be greater than zero".to_string(),
                });
            }
            self.ipc_timeout = Duration::from_millis(ms);
        }
        if let Some(threshold) = file.death_threshold {
            if threshold == 0 {
                return Err(ConfigError::Invalid {
                    key: "death_threshold",
                    reason: "must be at least 1".to_string(),
                });
            }
            self.death_threshold = threshold;
        }
        if let Some(hours) = file.death_retention_hours {
            self.death_retention = Duration::from_secs(hours * 60 * 60);
        }
        if let Some(days) = file.deleted_retention_days {
            self.deleted_retention = Duration::from_secs(days * 24 * 60 * 60);
        }
        self.permissions = file.permissions;
        Ok(self)
    }
}

/// Load `<home>/.companion/config.yaml`, falling back to defaults when absent.
///
/// Returns `ConfigError::Parse` (with path + line context) if malformed YAML.
pub fn load_at(home: &Path) -> Result<CompanionConfig, ConfigError> {
    let defaults = CompanionConfig::defaults_at(home);
    let path = config_path_at(home);
    if !path.exists() {
        return Ok(defaults);
    }
    let contents = std::fs::read_to_string(&path).map_err(|e| config_io_err(&path, e))?;
    if contents.trim().is_empty() {
        return Ok(defaults);
    }
    let file: ConfigFile =
        serde_yaml::from_str(&contents).map_err(|e| ConfigError::Parse { path, source: e })?;
    defaults.apply(file)
}

/// `load_at` convenience wrapper.
pub fn load() -> Result<CompanionConfig, ConfigError> {
    load_at(&home()?)
}

fn home() -> Result<PathBuf, ConfigError> {
    dirs::home_dir().ok_or(ConfigError::HomeNotFound)
}
