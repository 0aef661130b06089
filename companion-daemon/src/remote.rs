//! Stats daemon client over a local socket.
//!
//! Each call opens a connection, writes one JSON line (`{"call": ...}`) and
//! waits for a one-line `{"ok": bool, "error": ...}` acknowledgment, bounded
//! by the configured IPC timeout. Two calls keep their connection after the
//! acknowledgment:
//!
//! - `link_to_death`: the daemon holds the connection for its lifetime;
//!   end-of-stream means it died.
//! - `inform_all_uid_data`: the connection becomes the inventory channel;
//!   the liaison writes records and closes it.

use std::io::{BufRead, BufReader, ErrorKind, Read, Write};
use std::net::Shutdown;
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use companion_core::{
    DaemonHandle, DaemonLocator, DeathRecipient, InventorySink, LivenessWatch, RemoteError,
    StatsDaemon,
};

pub const LIVENESS_THREAD_NAME: &str = "companion.liveness";

/// One request line on the daemon socket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "call", rename_all = "snake_case")]
pub enum DaemonCall {
    StatsCompanionReady,
    LinkToDeath,
    InformAnomalyAlarmFired,
    InformPollAlarmFired,
    InformAlarmForSubscriberTriggeringFired,
    InformAllUidData,
    InformOnePackage {
        package: String,
        uid: i32,
        version_code: i64,
        version_name: String,
        installer: String,
    },
    InformOnePackageRemoved {
        package: String,
        uid: i32,
    },
    InformDeviceShutdown,
}

impl DaemonCall {
    pub fn name(&self) -> &'static str {
        match self {
            DaemonCall::StatsCompanionReady => "stats_companion_ready",
            DaemonCall::LinkToDeath => "link_to_death",
            DaemonCall::InformAnomalyAlarmFired => "inform_anomaly_alarm_fired",
            DaemonCall::InformPollAlarmFired => "inform_poll_alarm_fired",
            DaemonCall::InformAlarmForSubscriberTriggeringFired => {
                "inform_alarm_for_subscriber_triggering_fired"
            }
            DaemonCall::InformAllUidData => "inform_all_uid_data",
            DaemonCall::InformOnePackage { .. } => "inform_one_package",
            DaemonCall::InformOnePackageRemoved { .. } => "inform_one_package_removed",
            DaemonCall::InformDeviceShutdown => "inform_device_shutdown",
        }
    }
}

/// One acknowledgment line from the daemon.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DaemonAck {
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl DaemonAck {
    pub fn ok() -> Self {
        Self {
            ok: true,
            error: None,
        }
    }

    pub fn rejected(message: impl Into<String>) -> Self {
        Self {
            ok: false,
            error: Some(message.into()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SocketDaemon {
    socket: PathBuf,
    timeout: Duration,
}

impl SocketDaemon {
    pub fn new(socket: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            socket: socket.into(),
            timeout,
        }
    }

    fn endpoint(&self) -> String {
        self.socket.display().to_string()
    }

    fn connect(&self, call: &'static str) -> Result<UnixStream, RemoteError> {
        let io = |e| RemoteError::from_io(call, &self.endpoint(), e);
        let stream = UnixStream::connect(&self.socket).map_err(io)?;
        stream.set_read_timeout(Some(self.timeout)).map_err(io)?;
        stream.set_write_timeout(Some(self.timeout)).map_err(io)?;
        Ok(stream)
    }

    /// Send `call` and wait for its acknowledgment. The connection is
    /// returned still open.
    fn exchange(&self, call: &DaemonCall) -> Result<UnixStream, RemoteError> {
        let name = call.name();
        let io = |e| RemoteError::from_io(name, &self.endpoint(), e);

        let mut stream = self.connect(name)?;
        let mut payload = serde_json::to_vec(call).map_err(|e| RemoteError::Protocol {
            call: name,
            message: e.to_string(),
        })?;
        payload.push(b'\n');
        stream.write_all(&payload).map_err(io)?;
        stream.flush().map_err(io)?;

        let mut reader = BufReader::new(stream.try_clone().map_err(io)?);
        let mut line = String::new();
        if reader.read_line(&mut line).map_err(io)? == 0 {
            return Err(RemoteError::Unreachable {
                endpoint: self.endpoint(),
            });
        }
        let ack: DaemonAck =
            serde_json::from_str(line.trim_end()).map_err(|e| RemoteError::Protocol {
                call: name,
                message: format!("malformed acknowledgment: {e}"),
            })?;
        if !ack.ok {
            return Err(RemoteError::Protocol {
                call: name,
                message: ack.error.unwrap_or_else(|| "rejected".to_string()),
            });
        }
        Ok(stream)
    }

    fn call(&self, call: DaemonCall) -> Result<(), RemoteError> {
        self.exchange(&call).map(drop)
    }
}

struct SocketWatch {
    stream: UnixStream,
    detached: Arc<AtomicBool>,
}

impl LivenessWatch for SocketWatch {}

impl Drop for SocketWatch {
    fn drop(&mut self) {
        self.detached.store(true, Ordering::Release);
        let _ = self.stream.shutdown(Shutdown::Both);
    }
}

/// Block until the peer closes `stream` (or it is shut down locally).
fn wait_for_eof(mut stream: UnixStream) {
    let mut buf = [0u8; 64];
    loop {
        match stream.read(&mut buf) {
            Ok(0) => return,
            Ok(_) => continue,
            Err(err) if err.kind() == ErrorKind::Interrupted => continue,
            Err(err) => {
                tracing::debug!(error = %err, "liveness connection failed");
                return;
            }
        }
    }
}

impl StatsDaemon for SocketDaemon {
    fn stats_companion_ready(&self) -> Result<(), RemoteError> {
        self.call(DaemonCall::StatsCompanionReady)
    }

    fn link_to_death(
        &self,
        recipient: DeathRecipient,
    ) -> Result<Box<dyn LivenessWatch>, RemoteError> {
        let call = "link_to_death";
        let io = |e| RemoteError::Io { call, source: e };

        let stream = self.exchange(&DaemonCall::LinkToDeath)?;
        stream.set_read_timeout(None).map_err(io)?;
        let watcher = stream.try_clone().map_err(io)?;
        let detached = Arc::new(AtomicBool::new(false));
        let watcher_detached = detached.clone();
        thread::Builder::new()
            .name(LIVENESS_THREAD_NAME.to_string())
            .spawn(move || {
                wait_for_eof(watcher);
                // A local detach closes the connection too; that is not a death.
                if !watcher_detached.load(Ordering::Acquire) {
                    recipient();
                }
            })
            .map_err(io)?;
        Ok(Box::new(SocketWatch { stream, detached }))
    }

    fn inform_anomaly_alarm_fired(&self) -> Result<(), RemoteError> {
        self.call(DaemonCall::InformAnomalyAlarmFired)
    }

    fn inform_poll_alarm_fired(&self) -> Result<(), RemoteError> {
        self.call(DaemonCall::InformPollAlarmFired)
    }

    fn inform_alarm_for_subscriber_triggering_fired(&self) -> Result<(), RemoteError> {
        self.call(DaemonCall::InformAlarmForSubscriberTriggeringFired)
    }

    fn inform_all_uid_data(&self) -> Result<InventorySink, RemoteError> {
        let call = "inform_all_uid_data";
        let stream = self.exchange(&DaemonCall::InformAllUidData)?;
        // The daemon drains the inventory at its own pace; the per-call
        // timeout only covers the acknowledgment.
        stream
            .set_write_timeout(None)
            .map_err(|e| RemoteError::Io { call, source: e })?;
        // Only the write half is used from here on.
        let _ = stream.shutdown(Shutdown::Read);
        Ok(Box::new(stream))
    }

    fn inform_one_package(
        &self,
        package: &str,
        uid: i32,
        version_code: i64,
        version_name: &str,
        installer: &str,
    ) -> Result<(), RemoteError> {
        self.call(DaemonCall::InformOnePackage {
            package: package.to_string(),
            uid,
            version_code,
            version_name: version_name.to_string(),
            installer: installer.to_string(),
        })
    }

    fn inform_one_package_removed(&self, package: &str, uid: i32) -> Result<(), RemoteError> {
        self.call(DaemonCall::InformOnePackageRemoved {
            package: package.to_string(),
            uid,
        })
    }

    fn inform_device_shutdown(&self) -> Result<(), RemoteError> {
        self.call(DaemonCall::InformDeviceShutdown)
    }
}

/// Publishes a [`SocketDaemon`] when something is listening on the socket.
#[derive(Debug, Clone)]
pub struct SocketLocator {
    socket: PathBuf,
    timeout: Duration,
}

impl SocketLocator {
    pub fn new(socket: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            socket: socket.into(),
            timeout,
        }
    }

    pub fn socket(&self) -> &Path {
        &self.socket
    }
}

impl DaemonLocator for SocketLocator {
    // The lookup connection sends nothing and closes straight away; the
    // daemon treats a connection closed before any call as a no-op.
    fn fetch(&self) -> Option<DaemonHandle> {
        match UnixStream::connect(&self.socket) {
            Ok(_) => Some(Arc::new(SocketDaemon::new(&self.socket, self.timeout))),
            Err(err) => {
                tracing::debug!(socket = %self.socket.display(), error = %err, "stats daemon not reachable");
                None
            }
        }
    }
}
