use std::path::{Path, PathBuf};

pub use companion_core::config::companion_root;

pub const COMPANION_SOCKET: &str = "companion.sock";
pub const COMPANION_PID: &str = "companion.pid";

pub fn socket_path(home: &Path) -> PathBuf {
    companion_root(home).join(COMPANION_SOCKET)
}

pub fn run_dir(home: &Path) -> PathBuf {
    companion_root(home).join("run")
}

pub fn pid_path(home: &Path) -> PathBuf {
    run_dir(home).join(COMPANION_PID)
}
