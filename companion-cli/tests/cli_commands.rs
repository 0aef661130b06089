use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::thread::sleep;
use std::time::{Duration, Instant};

use assert_cmd::prelude::*;
use predicates::prelude::*;
use predicates::str::contains;
use tempfile::TempDir;

fn companion_bin_path() -> PathBuf {
    PathBuf::from(assert_cmd::cargo::cargo_bin!("companion"))
}

fn companion_cmd(home: &Path) -> Command {
    let mut cmd = Command::new(companion_bin_path());
    cmd.env("HOME", home).env("NO_COLOR", "1");
    cmd
}

struct LiaisonProcess {
    home: PathBuf,
    child: Child,
}

impl LiaisonProcess {
    fn start(home: &Path) -> Self {
        let child = companion_cmd(home)
            .args(["daemon", "start"])
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .expect("spawn companion daemon");
        Self {
            home: home.to_path_buf(),
            child,
        }
    }

    fn stop(&mut self) {
        let _ = companion_cmd(&self.home).args(["daemon", "stop"]).status();

        let deadline = Instant::now() + Duration::from_secs(2);
        while Instant::now() < deadline {
            if let Ok(Some(_)) = self.child.try_wait() {
                return;
            }
            sleep(Duration::from_millis(50));
        }

        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

impl Drop for LiaisonProcess {
    fn drop(&mut self) {
        self.stop();
    }
}

fn liaison_running(home: &Path) -> bool {
    let Ok(output) = companion_cmd(home).args(["daemon", "status"]).output() else {
        return false;
    };
    if !output.status.success() {
        return false;
    }
    serde_json::from_slice::<serde_json::Value>(&output.stdout)
        .ok()
        .and_then(|value| value.get("running").and_then(|v| v.as_bool()))
        .unwrap_or(false)
}

fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        sleep(Duration::from_millis(100));
    }
    false
}

#[test]
fn daemon_status_without_liaison_reports_not_running() {
    let home = TempDir::new().expect("home");

    let output = companion_cmd(home.path())
        .args(["daemon", "status"])
        .output()
        .expect("run status");
    assert!(output.status.success());

    let value: serde_json::Value = serde_json::from_slice(&output.stdout).expect("status JSON");
    assert_eq!(value["running"], serde_json::json!(false));
    assert!(value["socket"]
        .as_str()
        .unwrap()
        .ends_with(".companion/companion.sock"));
}

#[test]
fn stop_without_liaison_is_not_an_error() {
    let home = TempDir::new().expect("home");
    companion_cmd(home.path())
        .args(["daemon", "stop"])
        .assert()
        .success()
        .stdout(contains("companion is not running"));
}

#[test]
fn unknown_alarm_kind_is_rejected_before_connecting() {
    let home = TempDir::new().expect("home");
    companion_cmd(home.path())
        .args(["alarm", "set", "hourly", "1000"])
        .assert()
        .failure()
        .stderr(contains("unknown alarm kind 'hourly'"));
}

#[test]
fn malformed_event_json_is_rejected() {
    let home = TempDir::new().expect("home");
    companion_cmd(home.path())
        .args(["event", "{not json"])
        .assert()
        .failure()
        .stderr(contains("invalid event JSON"));
}

#[test]
fn control_commands_fail_when_liaison_is_down() {
    let home = TempDir::new().expect("home");
    companion_cmd(home.path())
        .arg("dump")
        .assert()
        .failure()
        .stderr(contains("companion is not running"));
    companion_cmd(home.path())
        .arg("status")
        .assert()
        .success()
        .stdout(contains("companion is not running"));
}

#[test]
fn alarms_round_trip_through_a_running_liaison() {
    let home = TempDir::new().expect("home");
    let mut liaison = LiaisonProcess::start(home.path());
    assert!(
        wait_until(Duration::from_secs(10), || liaison_running(home.path())),
        "liaison did not report running state in time",
    );

    companion_cmd(home.path())
        .args(["alarm", "set", "periodic", "999999999999"])
        .assert()
        .success()
        .stdout(contains("periodic alarm set for 999999999999 ms since boot"));

    companion_cmd(home.path())
        .arg("status")
        .assert()
        .success()
        .stdout(contains("stats daemon disconnected").and(contains("periodic")));

    companion_cmd(home.path())
        .args(["alarm", "cancel", "periodic"])
        .assert()
        .success()
        .stdout(contains("periodic alarm cancelled"));
    companion_cmd(home.path())
        .args(["alarm", "cancel", "periodic"])
        .assert()
        .success()
        .stdout(contains("no periodic alarm was pending"));

    companion_cmd(home.path())
        .arg("ready")
        .assert()
        .success()
        .stdout(contains("stats daemon not found"));

    companion_cmd(home.path())
        .args(["event", r#"{"event":"reboot"}"#])
        .assert()
        .success()
        .stdout(contains("not_listening"));

    companion_cmd(home.path())
        .arg("dump")
        .assert()
        .success()
        .stdout(contains("Number of configuration files deleted: 0"));

    liaison.stop();
    assert!(!liaison_running(home.path()));
}
