//! Companion core library: domain types, collaborator seams, config, errors.
//!
//! Public API surface:
//! - [`types`]: alarm kinds, inventory records, identities
//! - [`clock`]: the elapsed (monotonic) clock
//! - [`platform`]: traits for the host OS facilities the liaison drives
//! - [`remote`]: traits for the stats daemon handle and its liveness watch
//! - [`config`]: YAML configuration
//! - [`error`]: [`ConfigError`], [`PlatformError`], [`RemoteError`]

pub mod clock;
pub mod config;
pub mod error;
pub mod platform;
pub mod remote;
pub mod types;

pub use clock::{read_monotonic_millis, ElapsedClock, ManualClock, MonotonicClock};
pub use config::CompanionConfig;
pub use error::{ConfigError, PlatformError, RemoteError};
pub use remote::{
    DaemonHandle, DaemonLocator, DeathRecipient, InventorySink, LivenessWatch, StatsDaemon,
};
pub use types::{
    AlarmKind, AlarmRequest, AppInventoryRecord, DeletedConfigRecord, ElapsedMillis, Identity,
    PackageInfo, UserId,
};
