#![allow(dead_code)]

use std::fs;
use std::io::{BufRead, BufReader, Write};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use companion_core::AppInventoryRecord;
use companion_daemon::remote::{DaemonAck, DaemonCall};
use companion_inventory::InventoryReader;
use serde_json::Value;

pub const INVENTORY: &str = r#"
users: [0, 10]
packages:
  - user: 0
    package_name: com.example.mail
    uid: 10001
    version_code: 12
    version_name: "12.0"
    installer: com.android.vending
  - user: 0
    package_name: com.example.maps
    uid: 10002
    version_code: 7
  - user: 0
    package_name: com.example.camera
    uid: 10003
    version_code: 1
  - user: 10
    package_name: com.example.mail
    uid: 1010001
    version_code: 12
  - user: 10
    package_name: com.example.maps
    uid: 1010002
    version_code: 7
  - user: 10
    package_name: com.example.camera
    uid: 1010003
    version_code: 1
"#;

#[derive(Default)]
struct Shared {
    calls: Mutex<Vec<String>>,
    records: Mutex<Vec<AppInventoryRecord>>,
    watches: Mutex<Vec<UnixStream>>,
}

/// A stats daemon stand-in listening on a Unix socket.
pub struct FakeStatsd {
    socket: PathBuf,
    shared: Arc<Shared>,
    stopping: Arc<AtomicBool>,
    acceptor: Option<JoinHandle<()>>,
}

impl FakeStatsd {
    pub fn start(socket: &Path) -> Self {
        let listener = UnixListener::bind(socket).unwrap();
        let shared = Arc::new(Shared::default());
        let stopping = Arc::new(AtomicBool::new(false));

        let acceptor = {
            let shared = shared.clone();
            let stopping = stopping.clone();
            thread::spawn(move || {
                for stream in listener.incoming() {
                    if stopping.load(Ordering::Acquire) {
                        break;
                    }
                    let Ok(stream) = stream else { continue };
                    let shared = shared.clone();
                    thread::spawn(move || serve(stream, &shared));
                }
            })
        };

        Self {
            socket: socket.to_path_buf(),
            shared,
            stopping,
            acceptor: Some(acceptor),
        }
    }

    pub fn calls(&self) -> Vec<String> {
        self.shared.calls.lock().unwrap().clone()
    }

    pub fn records(&self) -> Vec<AppInventoryRecord> {
        self.shared.records.lock().unwrap().clone()
    }

    /// Close every liveness connection, as a crashing daemon would.
    pub fn kill_watches(&self) -> usize {
        let watches: Vec<_> = self.shared.watches.lock().unwrap().drain(..).collect();
        watches.len()
    }
}

impl Drop for FakeStatsd {
    fn drop(&mut self) {
        self.stopping.store(true, Ordering::Release);
        let _ = UnixStream::connect(&self.socket);
        if let Some(acceptor) = self.acceptor.take() {
            let _ = acceptor.join();
        }
        let _ = fs::remove_file(&self.socket);
    }
}

fn serve(stream: UnixStream, shared: &Shared) {
    let mut reader = BufReader::new(stream.try_clone().unwrap());
    let mut line = String::new();
    if reader.read_line(&mut line).unwrap_or(0) == 0 {
        // Reachability probe.
        return;
    }
    let call: DaemonCall = serde_json::from_str(line.trim_end()).unwrap();
    let entry = match &call {
        DaemonCall::InformOnePackageRemoved { package, uid } => {
            format!("{} {package} {uid}", call.name())
        }
        DaemonCall::InformOnePackage { package, uid, .. } => {
            format!("{} {package} {uid}", call.name())
        }
        _ => call.name().to_string(),
    };
    shared.calls.lock().unwrap().push(entry);

    let mut writer = stream;
    let mut ack = serde_json::to_vec(&DaemonAck::ok()).unwrap();
    ack.push(b'\n');
    writer.write_all(&ack).unwrap();

    match call {
        DaemonCall::LinkToDeath => shared.watches.lock().unwrap().push(writer),
        DaemonCall::InformAllUidData => {
            for record in InventoryReader::new(reader) {
                shared.records.lock().unwrap().push(record.unwrap());
            }
        }
        _ => {}
    }
}

pub fn write_home(home: &Path, config: &str) -> PathBuf {
    let root = home.join(".companion");
    fs::create_dir_all(&root).unwrap();
    fs::write(root.join("packages.yaml"), INVENTORY).unwrap();
    if !config.is_empty() {
        fs::write(root.join("config.yaml"), config).unwrap();
    }
    root
}

/// Poll the running liaison until `accept` holds for its status.
pub async fn wait_for_status(home: &Path, accept: impl Fn(&Value) -> bool) -> Value {
    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        let home = home.to_path_buf();
        let status = tokio::task::spawn_blocking(move || companion_daemon::request_status(&home))
            .await
            .unwrap();
        if let Ok(status) = status {
            if accept(&status) {
                return status;
            }
        }
        assert!(Instant::now() < deadline, "liaison never reached the expected state");
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

pub async fn wait_until(what: &str, check: impl Fn() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while !check() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

/// Run a blocking control request off the async runtime.
pub async fn control<T, F>(home: &Path, request: F) -> T
where
    T: Send + 'static,
    F: FnOnce(&Path) -> T + Send + 'static,
{
    let home = home.to_path_buf();
    tokio::task::spawn_blocking(move || request(&home))
        .await
        .unwrap()
}
