//! Periodic liveness probes for started services.
use std::{
    cell::{Cell, RefCell},
    collections::HashMap,
    fmt,
    time::Duration,
};

use tokio::{sync::mpsc, task::JoinHandle, time::MissedTickBehavior};
use tracing::{debug, warn};

use crate::process::{is_alive, port_bound};

/// Why a monitored service was declared dead.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeathReason {
    ProcessGone,
    PortUnbound,
}

impl fmt::Display for DeathReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeathReason::ProcessGone => write!(f, "process no longer exists"),
            DeathReason::PortUnbound => write!(f, "port is no longer bound"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MonitorEvent {
    Died {
        service: String,
        pid: u32,
        /// Attachment generation; stale generations must be ignored.
        generation: u64,
        reason: DeathReason,
    },
}

struct Probe {
    generation: u64,
    task: JoinHandle<()>,
}

/// Runs one probe task per attached service and reports deaths over a channel.
///
/// A probe checks that the pid exists and, once the port has been seen bound, that it stays
/// bound. The first failed check emits a single [`MonitorEvent::Died`] and ends the probe.
pub struct ProcessMonitor {
    interval: Duration,
    events: mpsc::UnboundedSender<MonitorEvent>,
    probes: RefCell<HashMap<String, Probe>>,
    next_generation: Cell<u64>,
}

impl ProcessMonitor {
    pub fn new(interval: Duration, events: mpsc::UnboundedSender<MonitorEvent>) -> Self {
        Self {
            interval,
            events,
            probes: RefCell::new(HashMap::new()),
            next_generation: Cell::new(1),
        }
    }

    /// Starts probing `pid` and `port` for `service`, replacing any previous probe.
    pub fn attach(&self, service: &str, pid: u32, port: u16) -> u64 {
        self.detach(service);

        let generation = self.next_generation.get();
        self.next_generation.set(generation + 1);

        let interval = self.interval;
        let events = self.events.clone();
        let name = service.to_string();
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await;

            let mut port_seen = false;
            loop {
                ticker.tick().await;

                let reason = if !is_alive(pid) {
                    Some(DeathReason::ProcessGone)
                } else if port_bound(port).await {
                    port_seen = true;
                    None
                } else if port_seen {
                    Some(DeathReason::PortUnbound)
                } else {
                    None
                };

                if let Some(reason) = reason {
                    warn!("Service '{name}' (pid {pid}) declared dead: {reason}");
                    let _ = events.send(MonitorEvent::Died {
                        service: name,
                        pid,
                        generation,
                        reason,
                    });
                    break;
                }
            }
        });

        debug!("Monitoring '{service}' (pid {pid}, port {port}) every {interval:?}");
        self.probes
            .borrow_mut()
            .insert(service.to_string(), Probe { generation, task });
        generation
    }

    /// Cancels the probe for `service`, if any.
    pub fn detach(&self, service: &str) {
        if let Some(probe) = self.probes.borrow_mut().remove(service) {
            probe.task.abort();
            debug!("Stopped monitoring '{service}'");
        }
    }

    pub fn detach_all(&self) {
        for (_, probe) in self.probes.borrow_mut().drain() {
            probe.task.abort();
        }
    }

    /// Whether `generation` is the live attachment for `service`.
    pub fn is_current(&self, service: &str, generation: u64) -> bool {
        self.probes
            .borrow()
            .get(service)
            .is_some_and(|probe| probe.generation == generation)
    }

    /// Forgets a finished probe after its death event was consumed.
    pub fn retire(&self, service: &str, generation: u64) {
        let mut probes = self.probes.borrow_mut();
        if probes
            .get(service)
            .is_some_and(|probe| probe.generation == generation)
        {
            probes.remove(service);
        }
    }

    pub fn is_attached(&self, service: &str) -> bool {
        self.probes.borrow().contains_key(service)
    }
}

impl Drop for ProcessMonitor {
    fn drop(&mut self) {
        self.detach_all();
    }
}
