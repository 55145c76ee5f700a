//! Pre-start detection and termination of stale or colliding processes and ports.
use std::process::Command;

use async_trait::async_trait;
use nix::{
    sys::signal::Signal,
    unistd::{Pid, getpgid},
};
use regex::Regex;
use sysinfo::{ProcessRefreshKind, ProcessesToUpdate, System};
use tokio::task;
use tracing::{debug, info, warn};

use crate::{
    config::ServiceDescriptor,
    constants::{CONFLICT_TERM_WAIT, KILL_REAP_TIMEOUT, PORT_SETTLE_DELAY},
    process::{self, signal_tree, terminate_pid, wait_for_exit},
};

/// A process as seen in the host process table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessInfo {
    pub pid: u32,
    pub command_line: String,
}

/// Read access to host ports and processes.
///
/// Implementations must not block the event loop.
#[async_trait(?Send)]
pub trait HostProbe {
    /// Whether something listens on the port.
    async fn port_in_use(&self, port: u16) -> bool;

    /// Pids of processes holding a listening socket on the port.
    async fn port_owners(&self, port: u16) -> Vec<u32>;

    /// Snapshot of running processes with their command lines.
    async fn processes(&self) -> Vec<ProcessInfo>;
}

/// [`HostProbe`] backed by the real operating system.
///
/// Process table scans and `lsof` run on the blocking pool.
#[derive(Debug, Default, Clone, Copy)]
pub struct OsProbe;

#[async_trait(?Send)]
impl HostProbe for OsProbe {
    async fn port_in_use(&self, port: u16) -> bool {
        process::port_bound(port).await
    }

    async fn port_owners(&self, port: u16) -> Vec<u32> {
        task::spawn_blocking(move || listening_pids(port))
            .await
            .unwrap_or_else(|err| {
                warn!("Port owner lookup for {port} failed: {err}");
                Vec::new()
            })
    }

    async fn processes(&self) -> Vec<ProcessInfo> {
        task::spawn_blocking(process_table)
            .await
            .unwrap_or_else(|err| {
                warn!("Process table scan failed: {err}");
                Vec::new()
            })
    }
}

fn listening_pids(port: u16) -> Vec<u32> {
    #[cfg(target_os = "linux")]
    {
        let owners = linux::listening_pids(port);
        if !owners.is_empty() {
            return owners;
        }
    }
    lsof_listening_pids(port)
}

fn process_table() -> Vec<ProcessInfo> {
    let mut system = System::new();
    system.refresh_processes_specifics(
        ProcessesToUpdate::All,
        true,
        ProcessRefreshKind::everything(),
    );

    system
        .processes()
        .iter()
        .map(|(pid, proc_)| ProcessInfo {
            pid: pid.as_u32(),
            command_line: proc_
                .cmd()
                .iter()
                .map(|part| part.to_string_lossy())
                .collect::<Vec<_>>()
                .join(" "),
        })
        .filter(|info| !info.command_line.is_empty())
        .collect()
}

fn lsof_listening_pids(port: u16) -> Vec<u32> {
    let output = match Command::new("lsof")
        .args(["-nP", "-t", &format!("-iTCP:{port}"), "-sTCP:LISTEN"])
        .output()
    {
        Ok(output) => output,
        Err(err) => {
            debug!("lsof unavailable while resolving port {port}: {err}");
            return Vec::new();
        }
    };

    let mut pids: Vec<u32> = String::from_utf8_lossy(&output.stdout)
        .lines()
        .filter_map(|line| line.trim().parse().ok())
        .collect();
    pids.sort_unstable();
    pids.dedup();
    pids
}

#[cfg(target_os = "linux")]
mod linux {
    use std::fs;

    const TCP_LISTEN: &str = "0A";

    /// Socket inodes listening on `port` in a `/proc/net/tcp{,6}` table.
    pub(super) fn listening_inodes(table: &str, port: u16) -> Vec<u64> {
        table
            .lines()
            .skip(1)
            .filter_map(|line| {
                let fields: Vec<&str> = line.split_whitespace().collect();
                let local = fields.get(1)?;
                let state = fields.get(3)?;
                let inode = fields.get(9)?;
                let (_, port_hex) = local.rsplit_once(':')?;
                let local_port = u16::from_str_radix(port_hex, 16).ok()?;
                (local_port == port && *state == TCP_LISTEN)
                    .then(|| inode.parse().ok())
                    .flatten()
            })
            .filter(|inode| *inode != 0)
            .collect()
    }

    pub(super) fn listening_pids(port: u16) -> Vec<u32> {
        let mut inodes = Vec::new();
        for table in ["/proc/net/tcp", "/proc/net/tcp6"] {
            if let Ok(contents) = fs::read_to_string(table) {
                inodes.extend(listening_inodes(&contents, port));
            }
        }
        if inodes.is_empty() {
            return Vec::new();
        }

        let targets: Vec<String> = inodes.iter().map(|i| format!("socket:[{i}]")).collect();
        let Ok(entries) = fs::read_dir("/proc") else {
            return Vec::new();
        };

        let mut pids = Vec::new();
        for entry in entries.flatten() {
            let Some(pid) = entry.file_name().to_str().and_then(|s| s.parse::<u32>().ok()) else {
                continue;
            };
            let Ok(fds) = fs::read_dir(entry.path().join("fd")) else {
                continue;
            };
            let owns_socket = fds.flatten().any(|fd| {
                fs::read_link(fd.path())
                    .map(|link| targets.iter().any(|t| link.as_os_str() == t.as_str()))
                    .unwrap_or(false)
            });
            if owns_socket {
                pids.push(pid);
            }
        }
        pids
    }
}

/// Clears ports and processes that would collide with a service about to start.
pub struct ConflictResolver {
    probe: Box<dyn HostProbe>,
}

impl Default for ConflictResolver {
    fn default() -> Self {
        Self::new(Box::new(OsProbe))
    }
}

impl ConflictResolver {
    pub fn new(probe: Box<dyn HostProbe>) -> Self {
        Self { probe }
    }

    pub fn probe(&self) -> &dyn HostProbe {
        self.probe.as_ref()
    }

    /// This process, its parent, a kept pid, or anything in a kept pid's process group.
    fn protected(pid: u32, keep: &[u32]) -> bool {
        if pid == std::process::id()
            || pid == std::os::unix::process::parent_id()
            || keep.contains(&pid)
        {
            return true;
        }
        getpgid(Some(Pid::from_raw(pid as i32)))
            .is_ok_and(|group| keep.contains(&(group.as_raw() as u32)))
    }

    /// Terminates conflicting processes and frees the descriptor's port.
    ///
    /// `keep` lists pids that must survive, typically every process the caller already
    /// supervises. Their process groups are spared too. Returns whether the port and pattern
    /// space are clear.
    pub async fn clear(&self, descriptor: &ServiceDescriptor, keep: &[u32]) -> bool {
        let process_clear = self.clear_process_conflicts(descriptor, keep).await;
        let port_clear = self.clear_port(descriptor, keep).await;
        process_clear && port_clear
    }

    async fn clear_process_conflicts(&self, descriptor: &ServiceDescriptor, keep: &[u32]) -> bool {
        let patterns: Vec<Regex> = descriptor
            .conflict_patterns
            .iter()
            .filter_map(|pattern| match Regex::new(pattern) {
                Ok(regex) => Some(regex),
                Err(err) => {
                    warn!("Skipping invalid conflict pattern `{pattern}`: {err}");
                    None
                }
            })
            .collect();
        if patterns.is_empty() {
            return true;
        }

        let conflicts: Vec<ProcessInfo> = self
            .probe
            .processes()
            .await
            .into_iter()
            .filter(|info| patterns.iter().any(|p| p.is_match(&info.command_line)))
            .filter(|info| {
                let spared = Self::protected(info.pid, keep);
                if spared {
                    debug!(
                        "Sparing supervised process {} matching a conflict pattern of '{}'",
                        info.pid, descriptor.id
                    );
                }
                !spared
            })
            .collect();

        let mut cleared = true;
        for conflict in conflicts {
            info!(
                "Terminating conflicting process {} for '{}': {}",
                conflict.pid, descriptor.id, conflict.command_line
            );
            match terminate_pid(conflict.pid, Signal::SIGINT, CONFLICT_TERM_WAIT, false).await {
                Ok(true) => debug!("Conflicting process {} is gone", conflict.pid),
                Ok(false) => {
                    warn!("Conflicting process {} survived termination", conflict.pid);
                    cleared = false;
                }
                Err(err) => {
                    warn!("Unable to terminate conflicting process {}: {err}", conflict.pid);
                    cleared = false;
                }
            }
        }
        cleared
    }

    async fn clear_port(&self, descriptor: &ServiceDescriptor, keep: &[u32]) -> bool {
        let port = descriptor.port;
        if !self.probe.port_in_use(port).await {
            return true;
        }

        let owners: Vec<u32> = self
            .probe
            .port_owners(port)
            .await
            .into_iter()
            .filter(|pid| !Self::protected(*pid, keep))
            .collect();
        if owners.is_empty() {
            warn!(
                "Port {port} for '{}' is in use but no owning process could be found",
                descriptor.id
            );
            return false;
        }

        for pid in &owners {
            info!("Port {port} held by pid {pid}; terminating it for '{}'", descriptor.id);
            if let Err(err) = signal_tree(*pid, Signal::SIGTERM) {
                warn!("Failed to signal pid {pid}: {err}");
            }
        }
        tokio::time::sleep(PORT_SETTLE_DELAY).await;

        if self.probe.port_in_use(port).await {
            for pid in &owners {
                warn!("Pid {pid} still holds port {port}; sending SIGKILL");
                if let Err(err) = signal_tree(*pid, Signal::SIGKILL) {
                    warn!("Failed to kill pid {pid}: {err}");
                }
                wait_for_exit(*pid, KILL_REAP_TIMEOUT).await;
            }
        }

        let cleared = !self.probe.port_in_use(port).await;
        if cleared {
            info!("✔ Port {port} is free for '{}'", descriptor.id);
        } else {
            warn!("Port {port} for '{}' is still in use", descriptor.id);
        }
        cleared
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{process::is_alive, test_utils::descriptor};
    use std::{
        io::{BufRead, BufReader},
        os::unix::process::CommandExt,
        process::{Child, Command, Stdio},
        thread::JoinHandle,
    };
    use tempfile::tempdir;

    /// Pretends `occupant` holds the port for as long as it is alive.
    struct FakeProbe {
        occupant: Option<u32>,
        listed: Vec<ProcessInfo>,
    }

    #[async_trait(?Send)]
    impl HostProbe for FakeProbe {
        async fn port_in_use(&self, _port: u16) -> bool {
            self.occupant.is_some_and(is_alive)
        }

        async fn port_owners(&self, _port: u16) -> Vec<u32> {
            self.occupant.filter(|pid| is_alive(*pid)).into_iter().collect()
        }

        async fn processes(&self) -> Vec<ProcessInfo> {
            self.listed
                .iter()
                .filter(|info| is_alive(info.pid))
                .cloned()
                .collect()
        }
    }

    fn sleeper() -> (u32, JoinHandle<std::io::Result<std::process::ExitStatus>>) {
        let mut child: Child = Command::new("sleep").arg("30").spawn().unwrap();
        let pid = child.id();
        (pid, std::thread::spawn(move || child.wait()))
    }

    #[tokio::test]
    async fn occupied_port_is_freed_before_start() {
        let dir = tempdir().unwrap();
        let (occupant, reaper) = sleeper();
        let resolver = ConflictResolver::new(Box::new(FakeProbe {
            occupant: Some(occupant),
            listed: Vec::new(),
        }));

        let desc = descriptor("api", 8000, "uvicorn app:main --port 8000", dir.path());
        assert!(resolver.probe().port_in_use(8000).await);
        assert!(resolver.clear(&desc, &[]).await);
        assert!(!is_alive(occupant));
        assert!(!reaper.join().unwrap().unwrap().success());
    }

    #[tokio::test]
    async fn matching_processes_are_terminated_except_the_kept_one() {
        let dir = tempdir().unwrap();
        let (stale, stale_reaper) = sleeper();
        let (current, current_reaper) = sleeper();
        let (unrelated, unrelated_reaper) = sleeper();

        let resolver = ConflictResolver::new(Box::new(FakeProbe {
            occupant: None,
            listed: vec![
                ProcessInfo {
                    pid: stale,
                    command_line: "python -m uvicorn app:main --port 8000".into(),
                },
                ProcessInfo {
                    pid: current,
                    command_line: "python -m uvicorn app:main --port 8000".into(),
                },
                ProcessInfo {
                    pid: unrelated,
                    command_line: "python worker.py".into(),
                },
            ],
        }));

        let mut desc = descriptor("api", 8000, "uvicorn app:main", dir.path());
        desc.conflict_patterns = vec![r"uvicorn\s+app:main".into()];

        assert!(resolver.clear(&desc, &[current]).await);
        assert!(!is_alive(stale));
        assert!(is_alive(current));
        assert!(is_alive(unrelated));
        stale_reaper.join().unwrap().unwrap();

        for pid in [current, unrelated] {
            let _ = nix::sys::signal::kill(Pid::from_raw(pid as i32), Signal::SIGKILL);
        }
        current_reaper.join().unwrap().unwrap();
        unrelated_reaper.join().unwrap().unwrap();
    }

    #[tokio::test]
    async fn descendants_of_a_kept_group_leader_are_spared() {
        let dir = tempdir().unwrap();
        let mut leader = Command::new("sh")
            .args(["-c", "sleep 30 & echo $!; wait"])
            .stdout(Stdio::piped())
            .process_group(0)
            .spawn()
            .unwrap();
        let mut line = String::new();
        BufReader::new(leader.stdout.take().unwrap())
            .read_line(&mut line)
            .unwrap();
        let grandchild: u32 = line.trim().parse().unwrap();

        let resolver = ConflictResolver::new(Box::new(FakeProbe {
            occupant: None,
            listed: vec![ProcessInfo {
                pid: grandchild,
                command_line: "sleep 30".into(),
            }],
        }));
        let mut desc = descriptor("api", 8000, "serve", dir.path());
        desc.conflict_patterns = vec!["^sleep ".into()];

        assert!(resolver.clear(&desc, &[leader.id()]).await);
        assert!(is_alive(grandchild));

        let _ = nix::sys::signal::killpg(Pid::from_raw(leader.id() as i32), Signal::SIGKILL);
        leader.wait().unwrap();
    }

    #[tokio::test]
    async fn port_without_known_owner_is_not_cleared() {
        struct Busy;

        #[async_trait(?Send)]
        impl HostProbe for Busy {
            async fn port_in_use(&self, _port: u16) -> bool {
                true
            }
            async fn port_owners(&self, _port: u16) -> Vec<u32> {
                vec![std::process::id()]
            }
            async fn processes(&self) -> Vec<ProcessInfo> {
                Vec::new()
            }
        }

        let dir = tempdir().unwrap();
        let resolver = ConflictResolver::new(Box::new(Busy));
        let desc = descriptor("api", 8000, "serve", dir.path());
        assert!(!resolver.clear(&desc, &[]).await);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn proc_net_tcp_listeners_are_parsed() {
        let table = "\
  sl  local_address rem_address   st tx_queue rx_queue tr tm->when retrnsmt   uid  timeout inode
   0: 00000000:1F40 00000000:0000 0A 00000000:00000000 00:00000000 00000000  1000        0 424242 1 0000000000000000 100 0 0 10 0
   1: 0100007F:1F40 0100007F:9C40 01 00000000:00000000 00:00000000 00000000  1000        0 515151 1 0000000000000000 20 4 30 10 -1
   2: 00000000:0016 00000000:0000 0A 00000000:00000000 00:00000000 00000000     0        0 777 1 0000000000000000 100 0 0 10 0
";
        assert_eq!(linux::listening_inodes(table, 8000), vec![424242]);
        assert_eq!(linux::listening_inodes(table, 22), vec![777]);
        assert!(linux::listening_inodes(table, 9000).is_empty());
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn real_listener_is_attributed_to_this_process() {
        let listener = std::net::TcpListener::bind(("127.0.0.1", 0)).unwrap();
        let port = listener.local_addr().unwrap().port();
        assert!(OsProbe.port_in_use(port).await);
        assert!(OsProbe.port_owners(port).await.contains(&std::process::id()));
    }
}
