//! Error types for companion-inventory.

use thiserror::Error;

use companion_core::PlatformError;

/// All errors that can arise while producing or consuming an inventory stream.
#[derive(Debug, Error)]
pub enum InventoryError {
    /// Enumerating users or packages failed.
    #[error("platform error: {0}")]
    Platform(#[from] PlatformError),

    /// An I/O error on the inventory channel, annotated with what was happening.
    #[error("I/O error while {context}: {source}")]
    Io {
        context: &'static str,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to spawn inventory worker: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("inventory worker panicked")]
    WorkerPanicked,

    #[error("inventory record decode error: {0}")]
    Decode(#[from] prost::DecodeError),

    /// The stream ended in the middle of a record.
    #[error("inventory stream truncated mid-record")]
    Truncated,

    #[error("malformed inventory stream: {0}")]
    Malformed(String),
}

/// Convenience constructor for [`InventoryError::Io`].
pub(crate) fn io_err(context: &'static str, source: std::io::Error) -> InventoryError {
    InventoryError::Io { context, source }
}
