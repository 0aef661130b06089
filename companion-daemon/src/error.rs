use std::path::PathBuf;

use thiserror::Error;

use companion_core::types::Identity;

use crate::service::Permission;

/// Error surface for the liaison runtime, control protocol, and API front door.
#[derive(Debug, Error)]
pub enum CompanionError {
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("config error: {0}")]
    Config(#[from] companion_core::ConfigError),

    #[error("platform error: {0}")]
    Platform(#[from] companion_core::PlatformError),

    #[error("stats daemon error: {0}")]
    Remote(#[from] companion_core::RemoteError),

    #[error("inventory error: {0}")]
    Inventory(#[from] companion_inventory::InventoryError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("channel closed: {0}")]
    ChannelClosed(&'static str),

    #[error("{identity} lacks the {permission} permission")]
    PermissionDenied {
        identity: Identity,
        permission: Permission,
    },

    #[error("companion protocol error: {0}")]
    Protocol(String),

    #[error("companion is not running (socket missing: {socket})")]
    NotRunning { socket: PathBuf },
}

pub(crate) fn io_err(path: impl Into<PathBuf>, source: std::io::Error) -> CompanionError {
    CompanionError::Io {
        path: path.into(),
        source,
    }
}
