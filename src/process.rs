//! OS-level process and port primitives shared by the spawner, the conflict resolver and the
//! monitor.
use std::{
    net::{Ipv4Addr, SocketAddr},
    time::{Duration, Instant},
};

use nix::{
    errno::Errno,
    sys::signal::{self, Signal},
    unistd::Pid,
};
use sysinfo::System;
use tracing::{debug, warn};

use crate::constants::{PORT_PROBE_TIMEOUT, PROCESS_CHECK_INTERVAL};

#[cfg(target_os = "linux")]
use std::{fs, path::Path};

/// Observed state of an OS process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    Running,
    Zombie,
    Missing,
}

/// Returns the state of `pid`, treating zombies as distinct from live processes.
pub fn process_state(pid: u32) -> ProcessState {
    #[cfg(target_os = "linux")]
    {
        let proc_path = format!("/proc/{pid}");
        if !Path::new(&proc_path).exists() {
            return ProcessState::Missing;
        }

        if let Some(state) = read_proc_state(pid)
            && matches!(state, 'Z' | 'X')
        {
            return ProcessState::Zombie;
        }

        ProcessState::Running
    }

    #[cfg(not(target_os = "linux"))]
    {
        match signal::kill(Pid::from_raw(pid as i32), None) {
            Ok(_) => ProcessState::Running,
            Err(Errno::ESRCH) => ProcessState::Missing,
            Err(_) => ProcessState::Running,
        }
    }
}

#[cfg(target_os = "linux")]
fn read_proc_state(pid: u32) -> Option<char> {
    let contents = fs::read_to_string(format!("/proc/{pid}/stat")).ok()?;
    // The command name is wrapped in parentheses and may contain spaces.
    let after_comm = &contents[contents.rfind(')')? + 1..];
    after_comm.split_whitespace().next()?.chars().next()
}

/// Whether `pid` refers to a live, non-zombie process.
pub fn is_alive(pid: u32) -> bool {
    pid != 0 && process_state(pid) == ProcessState::Running
}

/// Sends `sig` to the process group led by `pid` (when it has its own group) and to `pid`.
///
/// Returns `Ok(false)` when the process no longer exists.
pub fn signal_tree(pid: u32, sig: Signal) -> Result<bool, Errno> {
    let target = Pid::from_raw(pid as i32);
    let supervisor_pgid = unsafe { libc::getpgid(0) };
    let child_pgid = unsafe { libc::getpgid(target.as_raw()) };

    if child_pgid >= 0 && child_pgid != supervisor_pgid {
        match signal::killpg(Pid::from_raw(child_pgid), sig) {
            Ok(()) => debug!("Sent {sig} to process group {child_pgid}"),
            Err(Errno::ESRCH) => {}
            Err(Errno::EPERM) => {
                warn!(
                    "Insufficient permissions to signal process group {child_pgid}. Falling back to direct signal"
                );
            }
            Err(err) => return Err(err),
        }
    }

    match signal::kill(target, sig) {
        Ok(()) => Ok(true),
        Err(Errno::ESRCH) => Ok(false),
        Err(err) => Err(err),
    }
}

/// Polls until `pid` is gone or `timeout` elapses. Returns whether it exited.
pub async fn wait_for_exit(pid: u32, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if !is_alive(pid) {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(PROCESS_CHECK_INTERVAL).await;
    }
}

/// Terminates an arbitrary pid: `graceful` signal, wait up to `grace`, then SIGKILL.
///
/// With `force` the graceful phase is skipped. Returns whether the process is gone.
pub async fn terminate_pid(
    pid: u32,
    graceful: Signal,
    grace: Duration,
    force: bool,
) -> Result<bool, Errno> {
    if !is_alive(pid) {
        return Ok(true);
    }

    if !force {
        if !signal_tree(pid, graceful)? {
            return Ok(true);
        }
        if wait_for_exit(pid, grace).await {
            return Ok(true);
        }
        warn!("Process {pid} did not exit after {graceful}; sending SIGKILL");
    }

    if !signal_tree(pid, Signal::SIGKILL)? {
        return Ok(true);
    }
    Ok(wait_for_exit(pid, grace.max(PROCESS_CHECK_INTERVAL * 10)).await)
}

/// Whether something accepts TCP connections on `port` on the loopback interface.
pub async fn port_bound(port: u16) -> bool {
    let addr = SocketAddr::from((Ipv4Addr::LOCALHOST, port));
    matches!(
        tokio::time::timeout(PORT_PROBE_TIMEOUT, tokio::net::TcpStream::connect(addr)).await,
        Ok(Ok(_))
    )
}

/// Point-in-time host memory figures.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MemorySnapshot {
    pub total_bytes: u64,
    pub available_bytes: u64,
}

impl MemorySnapshot {
    /// Reads current memory figures from the OS.
    pub fn capture() -> Self {
        let mut system = System::new();
        system.refresh_memory();
        Self {
            total_bytes: system.total_memory(),
            available_bytes: system.available_memory(),
        }
    }

    /// Fraction of memory still available, in `[0, 1]`.
    pub fn available_ratio(&self) -> f64 {
        if self.total_bytes == 0 {
            return 1.0;
        }
        (self.available_bytes as f64 / self.total_bytes as f64).clamp(0.0, 1.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;
    use std::process::Command;

    #[test]
    fn current_process_is_alive() {
        assert!(is_alive(std::process::id()));
        assert!(!is_alive(0));
    }

    #[tokio::test]
    async fn port_probe_detects_listener() {
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
        let port = listener.local_addr().unwrap().port();
        assert!(port_bound(port).await);
        drop(listener);
        assert!(!port_bound(port).await);
    }

    #[tokio::test]
    async fn terminate_pid_stops_a_sleeping_process() {
        let mut child = Command::new("sleep").arg("30").spawn().unwrap();
        let pid = child.id();
        let reaper = std::thread::spawn(move || child.wait());

        let gone = terminate_pid(pid, Signal::SIGTERM, Duration::from_secs(3), false)
            .await
            .unwrap();
        assert!(gone);
        let status = reaper.join().unwrap().unwrap();
        assert!(!status.success());
    }

    #[test]
    fn memory_ratio_is_bounded() {
        let snapshot = MemorySnapshot {
            total_bytes: 0,
            available_bytes: 10,
        };
        assert_eq!(snapshot.available_ratio(), 1.0);

        let snapshot = MemorySnapshot {
            total_bytes: 100,
            available_bytes: 25,
        };
        assert!((snapshot.available_ratio() - 0.25).abs() < f64::EPSILON);
    }
}
