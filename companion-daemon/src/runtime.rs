use std::fs;
use std::io::ErrorKind;
use std::os::unix::net::UnixStream as StdUnixStream;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::unix::OwnedWriteHalf;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::broadcast;

use companion_core::{config, CompanionConfig, Identity, MonotonicClock};

use crate::alarm::{AlarmCallback, TokioAlarmFacility};
use crate::error::{io_err, CompanionError};
use crate::guard::CrashStormGuard;
use crate::host::{
    FilePackageSource, ListenerTable, ReadinessTracker, RequestCounter, TracingMetricSink,
    UidAllowlist,
};
use crate::paths::{companion_root, pid_path, run_dir, socket_path};
use crate::privilege::ThreadIdentity;
use crate::protocol::{CompanionRequest, CompanionResponse};
use crate::remote::SocketLocator;
use crate::service::CompanionService;
use crate::session::{spawn_session, Collaborators, Session, SessionHandle};

/// Env var selecting the log format: `json` for one JSON object per line.
pub const LOG_FORMAT_ENV: &str = "COMPANION_LOG_FORMAT";

/// Shared state for control connections.
struct Liaison {
    home: PathBuf,
    config: CompanionConfig,
    service: CompanionService,
    listeners: Arc<ListenerTable>,
    readiness: Arc<ReadinessTracker>,
    requests: Arc<RequestCounter>,
    started_at_unix: u64,
}

/// Start the liaison and block the current thread until it exits.
pub fn start_blocking(home: &Path) -> Result<(), CompanionError> {
    init_tracing();
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|e| io_err("tokio-runtime", e))?;
    runtime.block_on(run(home.to_path_buf()))
}

/// Run the liaison: session actor, control socket, signal handling.
pub async fn run(home: PathBuf) -> Result<(), CompanionError> {
    let config = config::load_at(&home)?;
    ensure_runtime_dirs(&home, &config)?;

    let clock = Arc::new(MonotonicClock::system()?);
    let (session, commands) = SessionHandle::channel();

    let on_fire: AlarmCallback = {
        let session = session.clone();
        Arc::new(move |kind, fire_at| session.alarm_fired(kind, fire_at))
    };
    let alarms = Arc::new(TokioAlarmFacility::new(
        tokio::runtime::Handle::current(),
        clock.clone(),
        on_fire,
    ));
    let listeners = Arc::new(ListenerTable::default());
    let readiness = Arc::new(ReadinessTracker::default());
    let requests = Arc::new(RequestCounter::new("control_requests"));

    let deps = Collaborators {
        locator: Arc::new(SocketLocator::new(&config.daemon_socket, config.ipc_timeout)),
        packages: Arc::new(FilePackageSource::new(&config.package_inventory)),
        alarms,
        registrar: listeners.clone(),
        metrics: Arc::new(TracingMetricSink),
        dependent: readiness.clone(),
        call_stats: vec![requests.clone()],
        clock,
        identity: Arc::new(ThreadIdentity),
    };
    let guard = CrashStormGuard::from_config(&config);
    let session_task = spawn_session(Session::new(deps, guard, session.clone()), commands);

    let service = CompanionService::new(
        session.clone(),
        Arc::new(UidAllowlist::from_config(&config.permissions)),
    );
    let liaison = Arc::new(Liaison {
        home: home.clone(),
        config,
        service,
        listeners,
        readiness,
        requests,
        started_at_unix: unix_seconds_now(),
    });

    match liaison.service.system_ready().await {
        Ok(outcome) => tracing::info!(outcome = ?outcome, "startup handshake attempted"),
        Err(err) => tracing::warn!(error = %err, "startup handshake could not run"),
    }

    let (shutdown_tx, _) = broadcast::channel::<()>(16);

    let socket_handle = {
        let shutdown = shutdown_tx.clone();
        let liaison = liaison.clone();
        tokio::spawn(async move {
            let result =
                socket_server_task(liaison, shutdown.clone(), shutdown.subscribe()).await;
            let _ = shutdown.send(());
            result
        })
    };

    let signal_handle = {
        let shutdown = shutdown_tx.clone();
        tokio::spawn(async move {
            let mut shutdown_rx = shutdown.subscribe();
            tokio::select! {
                _ = shutdown_rx.recv() => Ok(()),
                signal = tokio::signal::ctrl_c() => {
                    match signal {
                        Ok(()) => {
                            tracing::info!("received ctrl-c, shutting down companion");
                            let _ = shutdown.send(());
                            Ok(())
                        }
                        Err(err) => Err(CompanionError::Protocol(format!("ctrl-c handler failed: {err}"))),
                    }
                }
            }
        })
    };

    let (socket_result, signal_result) = tokio::join!(socket_handle, signal_handle);

    session.shutdown();
    let session_result = session_task.await;
    remove_pid_file(&home);

    handle_join("socket_server", socket_result)?;
    handle_join("signal_handler", signal_result)?;
    session_result
        .map_err(|err| CompanionError::Protocol(format!("session task join failure: {err}")))
}

async fn socket_server_task(
    liaison: Arc<Liaison>,
    shutdown_tx: broadcast::Sender<()>,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<(), CompanionError> {
    let socket = socket_path(&liaison.home);
    prepare_socket_for_bind(&socket)?;

    let listener = UnixListener::bind(&socket).map_err(|e| io_err(&socket, e))?;
    set_socket_permissions(&socket)?;
    tracing::info!(socket = %socket.display(), "control socket listening");

    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => break,
            accepted = listener.accept() => {
                let (stream, _) = accepted.map_err(|e| io_err(&socket, e))?;
                let liaison = liaison.clone();
                let shutdown_tx = shutdown_tx.clone();
                tokio::spawn(async move {
                    if let Err(err) = handle_socket_client(stream, liaison, shutdown_tx).await {
                        tracing::error!(error = %err, "control client error");
                    }
                });
            }
        }
    }

    if socket.exists() {
        let _ = fs::remove_file(&socket);
    }
    Ok(())
}

fn peer_identity(stream: &UnixStream) -> Identity {
    match stream.peer_cred() {
        Ok(cred) => Identity::caller(Some(cred.uid())),
        Err(err) => {
            tracing::warn!(error = %err, "could not read control peer credentials");
            Identity::caller(None)
        }
    }
}

async fn handle_socket_client(
    stream: UnixStream,
    liaison: Arc<Liaison>,
    shutdown_tx: broadcast::Sender<()>,
) -> Result<(), CompanionError> {
    let caller = peer_identity(&stream);
    let (reader, mut writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();

    while let Some(line) = lines
        .next_line()
        .await
        .map_err(|e| io_err("companion socket read", e))?
    {
        if line.trim().is_empty() {
            continue;
        }

        let request: Result<CompanionRequest, _> = serde_json::from_str(&line);
        let request = match request {
            Ok(request) => request,
            Err(err) => {
                write_response(
                    &mut writer,
                    &CompanionResponse::error(format!("invalid request JSON: {err}")),
                )
                .await?;
                continue;
            }
        };

        liaison.requests.record();
        let cmd = request.cmd.clone();
        tracing::debug!(cmd = %cmd, caller = %caller, "control request");

        let response = if cmd == "stop" {
            let _ = shutdown_tx.send(());
            CompanionResponse::ok(json!({ "stopping": true }))
        } else {
            match dispatch(&liaison, caller, request).await {
                Ok(data) => CompanionResponse::ok(data),
                Err(err) => CompanionResponse::error(err.to_string()),
            }
        };
        write_response(&mut writer, &response).await?;
        if cmd == "stop" {
            break;
        }
    }
    Ok(())
}

async fn dispatch(
    liaison: &Liaison,
    caller: Identity,
    request: CompanionRequest,
) -> Result<Value, CompanionError> {
    let service = &liaison.service;
    match request.cmd.as_str() {
        "statsd_ready" => Ok(json!(service.statsd_ready(caller).await?)),
        "trigger_uid_snapshot" => Ok(json!({
            "snapshot": service.trigger_uid_snapshot(caller).await?
        })),
        "set_alarm" => {
            let (Some(kind), Some(timestamp_ms)) = (request.kind, request.timestamp_ms) else {
                return Err(CompanionError::Protocol(
                    "set_alarm requires kind and timestamp_ms".to_string(),
                ));
            };
            service.set_alarm(caller, kind, timestamp_ms).await?;
            Ok(json!({ "kind": kind, "timestamp_ms": timestamp_ms }))
        }
        "cancel_alarm" => {
            let Some(kind) = request.kind else {
                return Err(CompanionError::Protocol(
                    "cancel_alarm requires kind".to_string(),
                ));
            };
            let was_pending = service.cancel_alarm(caller, kind).await?;
            Ok(json!({ "kind": kind, "was_pending": was_pending }))
        }
        "broadcast" => {
            let Some(event) = request.event else {
                return Err(CompanionError::Protocol(
                    "broadcast requires event".to_string(),
                ));
            };
            Ok(json!(service.broadcast(caller, event).await?))
        }
        "dump" => {
            let report = service.dump(caller).await?;
            Ok(json!({ "text": report.to_string(), "report": report }))
        }
        "status" => {
            let session = service.status(caller).await?;
            Ok(build_status_payload(liaison, json!(session)))
        }
        other => Err(CompanionError::Protocol(format!("unknown command '{other}'"))),
    }
}

fn build_status_payload(liaison: &Liaison, session: Value) -> Value {
    json!({
        "running": true,
        "started_at_unix": liaison.started_at_unix,
        "socket": socket_path(&liaison.home).display().to_string(),
        "daemon_socket": liaison.config.daemon_socket.display().to_string(),
        "config_dir": liaison.config.config_dir.display().to_string(),
        "daemon_ready": liaison.readiness.is_ready(),
        "readiness_transitions": liaison.readiness.transitions(),
        "control_requests": liaison.requests.count(),
        "daemon_started_announcements": liaison.listeners.announcements(),
        "session": session,
    })
}

fn prepare_socket_for_bind(socket: &Path) -> Result<(), CompanionError> {
    if !socket.exists() {
        return Ok(());
    }

    match StdUnixStream::connect(socket) {
        Ok(_) => {
            return Err(CompanionError::Protocol(format!(
                "companion socket already in use: {}",
                socket.display()
            )));
        }
        Err(err) => {
            tracing::warn!(
                socket = %socket.display(),
                error = %err,
                "removing stale companion socket before bind",
            );
        }
    }

    match fs::remove_file(socket) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
        Err(err) => Err(io_err(socket, err)),
    }
}

fn ensure_runtime_dirs(home: &Path, config: &CompanionConfig) -> Result<(), CompanionError> {
    for dir in [companion_root(home), run_dir(home), config.config_dir.clone()] {
        if !dir.exists() {
            fs::create_dir_all(&dir).map_err(|e| io_err(&dir, e))?;
        }
    }
    let pid = pid_path(home);
    fs::write(&pid, format!("{}\n", std::process::id())).map_err(|e| io_err(&pid, e))
}

fn remove_pid_file(home: &Path) {
    let pid = pid_path(home);
    if let Err(err) = fs::remove_file(&pid) {
        if err.kind() != ErrorKind::NotFound {
            tracing::warn!(path = %pid.display(), error = %err, "failed to remove pid file");
        }
    }
}

async fn write_response(
    writer: &mut OwnedWriteHalf,
    response: &CompanionResponse,
) -> Result<(), CompanionError> {
    let payload = serde_json::to_string(response)?;
    writer
        .write_all(payload.as_bytes())
        .await
        .map_err(|e| io_err("companion socket write", e))?;
    writer
        .write_all(b"\n")
        .await
        .map_err(|e| io_err("companion socket write", e))?;
    writer
        .flush()
        .await
        .map_err(|e| io_err("companion socket flush", e))?;
    Ok(())
}

fn handle_join(
    task: &str,
    result: Result<Result<(), CompanionError>, tokio::task::JoinError>,
) -> Result<(), CompanionError> {
    match result {
        Ok(inner) => inner,
        Err(err) => Err(CompanionError::Protocol(format!(
            "{task} task join failure: {err}"
        ))),
    }
}

fn unix_seconds_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

fn init_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let json = std::env::var(LOG_FORMAT_ENV)
        .map(|format| format.eq_ignore_ascii_case("json"))
        .unwrap_or(false);
    let _ = if json {
        fmt().json().with_env_filter(filter).try_init()
    } else {
        fmt().with_env_filter(filter).with_target(false).try_init()
    };
}

#[cfg(unix)]
fn set_socket_permissions(path: &Path) -> Result<(), CompanionError> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o600)).map_err(|e| io_err(path, e))
}

#[cfg(not(unix))]
fn set_socket_permissions(_path: &Path) -> Result<(), CompanionError> {
    Ok(())
}
