//! Error types for companion-core.

use std::path::PathBuf;

use thiserror::Error;

/// Errors loading the liaison configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// YAML parse error on load: includes file path and line context from serde_yaml.
    #[error("failed to parse config at {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    /// `dirs::home_dir()` returned `None`.
    #[error("cannot determine home directory; set $HOME or equivalent")]
    HomeNotFound,

    #[error("invalid config value for {key}: {reason}")]
    Invalid { key: &'static str, reason: String },
}

/// Failures reported by host OS collaborators (package source, registrar).
#[derive(Debug, Error)]
pub enum PlatformError {
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("unknown package '{0}'")]
    UnknownPackage(String),

    #[error("{0}")]
    Unavailable(String),
}

/// Failures talking to the stats daemon. Every variant means the daemon is
/// presumed unreachable for the purpose of the call that produced it.
#[derive(Debug, Error)]
pub enum RemoteError {
    #[error("stats daemon unreachable at {endpoint}")]
    Unreachable { endpoint: String },

    #[error("stats daemon call '{call}' timed out")]
    Timeout { call: &'static str },

    #[error("I/O error talking to stats daemon ({call}): {source}")]
    Io {
        call: &'static str,
        #[source]
        source: std::io::Error,
    },

    #[error("stats daemon rejected '{call}': {message}")]
    Protocol { call: &'static str, message: String },
}

impl RemoteError {
    /// Classify an I/O failure from `call`, folding timeouts and refused
    /// connections into their dedicated variants.
    pub fn from_io(call: &'static str, endpoint: &str, source: std::io::Error) -> Self {
        match source.kind() {
            std::io::ErrorKind::TimedOut | std::io::ErrorKind::WouldBlock => {
                RemoteError::Timeout { call }
            }
            std::io::ErrorKind::NotFound
            | std::io::ErrorKind::ConnectionRefused
            | std::io::ErrorKind::ConnectionReset => RemoteError::Unreachable {
                endpoint: endpoint.to_string(),
            },
            _ => RemoteError::Io { call, source },
        }
    }
}

pub(crate) fn config_io_err(path: impl Into<PathBuf>, source: std::io::Error) -> ConfigError {
    ConfigError::Io {
        path: path.into(),
        source,
    }
}
