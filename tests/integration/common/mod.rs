#![allow(dead_code)]

use std::{
    fs,
    path::{Path, PathBuf},
    thread,
    time::{Duration, Instant},
};

use warden::{
    config::{Config, load_config},
    constants::PID_FILE_NAME,
    pidfile::PidFile,
};

/// Writes `warden.yaml` into `dir` with logs kept under `dir/logs`.
pub fn write_config(dir: &Path, body: &str) -> PathBuf {
    let path = dir.join("warden.yaml");
    let content = format!("version: \"1\"\nlogs_dir: logs\n{body}");
    fs::write(&path, content).expect("failed to write config");
    path
}

pub fn load(path: &Path) -> Config {
    load_config(Some(path.to_str().expect("utf-8 path"))).expect("config loads")
}

/// YAML block for a long-running service without a health check.
pub fn sleeper(id: &str, port: u16) -> String {
    format!("  {id}:\n    port: {port}\n    command: \"sleep 30\"\n")
}

/// YAML block for a long-running service polled on a local HTTP stub.
pub fn sleeper_with_health(id: &str, port: u16, health_port: u16, timeout: &str, attempts: u32) -> String {
    format!(
        "  {id}:\n    port: {port}\n    command: \"sleep 30\"\n    health_check:\n      url: \"http://127.0.0.1:{health_port}/health\"\n      timeout: \"{timeout}\"\n      max_attempts: {attempts}\n      warmup: \"0ms\"\n"
    )
}

pub fn pid_file(dir: &Path) -> PidFile {
    PidFile::load(dir.join("logs").join(PID_FILE_NAME)).expect("pid file readable")
}

pub async fn wait_until<F>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    check()
}

pub fn wait_until_blocking<F>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if check() {
            return true;
        }
        thread::sleep(Duration::from_millis(100));
    }
    check()
}
