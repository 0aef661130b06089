use std::io::{BufRead, BufReader, Write};
use std::os::unix::net::UnixStream;
use std::path::Path;
use std::thread::sleep;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use companion_core::{AlarmKind, ElapsedMillis};

use crate::error::{io_err, CompanionError};
use crate::paths::socket_path;
use crate::relay::RelayEvent;

/// JSON newline-delimited request on the control socket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompanionRequest {
    pub cmd: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<AlarmKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp_ms: Option<ElapsedMillis>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event: Option<RelayEvent>,
}

impl CompanionRequest {
    pub fn command(cmd: &str) -> Self {
        Self {
            cmd: cmd.to_string(),
            kind: None,
            timestamp_ms: None,
            event: None,
        }
    }
}

/// JSON newline-delimited response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompanionResponse {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl CompanionResponse {
    pub fn ok(data: Value) -> Self {
        Self {
            ok: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            ok: false,
            data: None,
            error: Some(message.into()),
        }
    }
}

/// Send one JSON request to the control socket and return one response.
pub fn send_request(
    home: &Path,
    request: &CompanionRequest,
) -> Result<CompanionResponse, CompanionError> {
    let socket = socket_path(home);
    if !socket.exists() {
        return Err(CompanionError::NotRunning { socket });
    }

    let mut stream = UnixStream::connect(&socket).map_err(|err| {
        if matches!(
            err.kind(),
            std::io::ErrorKind::NotFound
                | std::io::ErrorKind::ConnectionRefused
                | std::io::ErrorKind::ConnectionReset
        ) {
            CompanionError::NotRunning {
                socket: socket.clone(),
            }
        } else {
            io_err(&socket, err)
        }
    })?;

    let payload = serde_json::to_string(request)?;
    stream
        .write_all(payload.as_bytes())
        .map_err(|e| io_err(&socket, e))?;
    stream.write_all(b"\n").map_err(|e| io_err(&socket, e))?;
    stream.flush().map_err(|e| io_err(&socket, e))?;

    let mut reader = BufReader::new(stream);
    let mut line = String::new();
    let read = reader
        .read_line(&mut line)
        .map_err(|e| io_err(&socket, e))?;
    if read == 0 {
        return Err(CompanionError::Protocol(
            "companion closed connection before responding".to_string(),
        ));
    }

    let response: CompanionResponse = serde_json::from_str(line.trim_end())?;
    Ok(response)
}

pub fn request_status(home: &Path) -> Result<Value, CompanionError> {
    let request = CompanionRequest::command("status");

    let mut last_not_running: Option<CompanionError> = None;
    for attempt in 0..5 {
        match send_request(home, &request) {
            Ok(response) => return response_into_data(response),
            Err(err @ CompanionError::NotRunning { .. }) => {
                last_not_running = Some(err);
                if attempt < 4 {
                    sleep(Duration::from_millis(100));
                    continue;
                }
            }
            Err(err) => return Err(err),
        }
    }

    Err(last_not_running.unwrap_or_else(|| {
        CompanionError::Protocol("companion status retry loop exited unexpectedly".to_string())
    }))
}

pub fn request_stop(home: &Path) -> Result<(), CompanionError> {
    let response = send_request(home, &CompanionRequest::command("stop"))?;
    response_into_data(response).map(|_| ())
}

/// Signal that the stats daemon is up and should be connected to.
pub fn request_ready(home: &Path) -> Result<Value, CompanionError> {
    send_request(home, &CompanionRequest::command("statsd_ready")).and_then(response_into_data)
}

pub fn request_snapshot(home: &Path) -> Result<Value, CompanionError> {
    send_request(home, &CompanionRequest::command("trigger_uid_snapshot"))
        .and_then(response_into_data)
}

pub fn request_set_alarm(
    home: &Path,
    kind: AlarmKind,
    timestamp_ms: ElapsedMillis,
) -> Result<Value, CompanionError> {
    let request = CompanionRequest {
        kind: Some(kind),
        timestamp_ms: Some(timestamp_ms),
        ..CompanionRequest::command("set_alarm")
    };
    send_request(home, &request).and_then(response_into_data)
}

pub fn request_cancel_alarm(home: &Path, kind: AlarmKind) -> Result<Value, CompanionError> {
    let request = CompanionRequest {
        kind: Some(kind),
        ..CompanionRequest::command("cancel_alarm")
    };
    send_request(home, &request).and_then(response_into_data)
}

pub fn request_broadcast(home: &Path, event: RelayEvent) -> Result<Value, CompanionError> {
    let request = CompanionRequest {
        event: Some(event),
        ..CompanionRequest::command("broadcast")
    };
    send_request(home, &request).and_then(response_into_data)
}

/// The rendered diagnostic dump.
pub fn request_dump(home: &Path) -> Result<String, CompanionError> {
    let data = send_request(home, &CompanionRequest::command("dump")).and_then(response_into_data)?;
    data.get("text")
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| CompanionError::Protocol("dump response missing text".to_string()))
}

fn response_into_data(response: CompanionResponse) -> Result<Value, CompanionError> {
    if response.ok {
        Ok(response.data.unwrap_or(Value::Null))
    } else {
        Err(CompanionError::Protocol(
            response
                .error
                .unwrap_or_else(|| "unknown companion error".to_string()),
        ))
    }
}
