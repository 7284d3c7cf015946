//! The registry is the authoritative table of services and their runtime state.
//!
//! Locking rules:
//! 1. The table lock is only held to insert, remove or look up services. Never while a service lock is held.
//! 1. The pid table lock may be taken while holding a service lock, but never the other way around.
//! 1. At most one service lock is held at a time by any thread.

use super::dependency_resolving::{self, DependencyGraph, DeclaredDependencies};
use super::locking;
use super::*;
use crate::errors::{Result, SupervisorError};
use crate::event_loop::{Event, EventQueue};

use log::{error, info, trace};
use nix::unistd::Pid;
use std::collections::{HashMap, HashSet, VecDeque};
use std::os::unix::io::{AsRawFd, RawFd};
use std::os::unix::net::{UnixDatagram, UnixListener};
use std::path::PathBuf;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, RwLock};
use std::time::{Duration, Instant, SystemTime};

#[derive(Clone, Copy, Eq, PartialEq, Debug)]
pub enum Direction {
    Start,
    Stop,
}

/// Filedescriptors a service owns for its whole lifetime in the registry
#[derive(Default, Debug)]
pub struct ServiceSockets {
    pub notify_path: Option<PathBuf>,
    pub notify: Option<UnixDatagram>,
    pub listeners: Vec<(PathBuf, UnixListener)>,
}

#[derive(Clone, Default, Debug, PartialEq, Eq)]
pub struct ServiceStats {
    pub starts: u64,
    pub restarts: u64,
    pub failures: u64,
    pub watchdog_misses: u64,
}

#[derive(Debug)]
pub struct ServiceRuntime {
    pub state: ServiceState,
    pub pid: Option<Pid>,
    pub last_exit: Option<ChildTermination>,
    pub started_at: Option<SystemTime>,
    pub stopped_at: Option<SystemTime>,
    pub state_since: Instant,
    pub running_since: Option<Instant>,

    pub restart_attempts: u32,
    pub restart_history: VecDeque<Instant>,
    pub restart_at: Option<Instant>,

    pub last_ping: Option<Instant>,
    pub watchdog_fired: bool,

    pub pending_op: Option<Operation>,
    pub start_deadline: Option<Instant>,
    pub stop_deadline: Option<Instant>,
    /// SIGKILL was needed to stop the current process
    pub forced_kill: bool,
    /// The process is being killed because it did not come up in time. Ends in FAILED instead of STOPPED.
    pub start_timed_out: bool,
    /// Bumped every time an operation claims the service, so a preempted operation can tell
    pub op_seq: u64,
    /// Set by `Registry::remove` under the service lock, no operation may claim the service after that
    pub removed: bool,

    pub status_text: Option<String>,
    pub stats: ServiceStats,
}

impl ServiceRuntime {
    fn new() -> Self {
        ServiceRuntime {
            state: ServiceState::Stopped,
            pid: None,
            last_exit: None,
            started_at: None,
            stopped_at: None,
            state_since: Instant::now(),
            running_since: None,
            restart_attempts: 0,
            restart_history: VecDeque::new(),
            restart_at: None,
            last_ping: None,
            watchdog_fired: false,
            pending_op: None,
            start_deadline: None,
            stop_deadline: None,
            forced_kill: false,
            start_timed_out: false,
            op_seq: 0,
            removed: false,
            status_text: None,
            stats: ServiceStats::default(),
        }
    }

    pub fn pid_invariant_holds(&self) -> bool {
        self.pid.is_some() == self.state.has_process()
    }

    /// Forget everything that belonged to the previous process
    pub fn clear_process(&mut self) {
        self.pid = None;
        self.start_deadline = None;
        self.stop_deadline = None;
        self.last_ping = None;
        self.watchdog_fired = false;
    }
}

pub struct Service {
    pub id: ServiceId,
    pub name: String,
    config: RwLock<Arc<ServiceConfig>>,
    runtime: Mutex<ServiceRuntime>,
    changed: Condvar,
    pub sockets: ServiceSockets,
}

impl Service {
    pub fn config(&self) -> Arc<ServiceConfig> {
        locking::read(&self.config).clone()
    }

    pub(crate) fn replace_config(&self, config: ServiceConfig) {
        *locking::write(&self.config) = Arc::new(config);
    }

    pub fn lock_runtime(&self) -> MutexGuard<'_, ServiceRuntime> {
        locking::lock(&self.runtime)
    }

    /// Wait until something about this service changed or the timeout elapsed
    pub fn wait_changed<'a>(
        &self,
        guard: MutexGuard<'a, ServiceRuntime>,
        timeout: Duration,
    ) -> MutexGuard<'a, ServiceRuntime> {
        locking::wait_timeout(&self.changed, guard, timeout)
    }

    pub fn notify_waiters(&self) {
        self.changed.notify_all();
    }

    pub fn state(&self) -> ServiceState {
        self.lock_runtime().state
    }

    pub fn pid(&self) -> Option<Pid> {
        self.lock_runtime().pid
    }

    pub fn notify_fd(&self) -> Option<RawFd> {
        self.sockets.notify.as_ref().map(|sock| sock.as_raw_fd())
    }

    pub fn listener_fds(&self) -> Vec<RawFd> {
        self.sockets
            .listeners
            .iter()
            .map(|(_, listener)| listener.as_raw_fd())
            .collect()
    }

    pub fn listener_names(&self) -> Vec<String> {
        self.sockets
            .listeners
            .iter()
            .map(|(path, _)| {
                path.file_name()
                    .map(|name| name.to_string_lossy().into_owned())
                    .unwrap_or_else(|| self.name.clone())
            })
            .collect()
    }
}

#[derive(Default)]
pub struct PidTable {
    owners: HashMap<Pid, ServiceId>,
    /// Processes found running at startup that are not our children
    adopted: HashSet<Pid>,
    /// Exits reaped before anyone claimed the pid
    unclaimed: HashMap<Pid, (ChildTermination, Instant)>,
}

struct Slot {
    generation: u32,
    service: Option<Arc<Service>>,
}

#[derive(Default)]
struct Table {
    slots: Vec<Slot>,
    free: Vec<u32>,
    by_name: HashMap<String, ServiceId>,
}

pub struct Registry {
    table: RwLock<Table>,
    pids: Mutex<PidTable>,
    events: Arc<EventQueue>,
}

fn validate_name(name: &str) -> Result<()> {
    if name.is_empty()
        || name.contains('/')
        || name.chars().any(|c| c.is_whitespace() || c.is_control())
    {
        return Err(SupervisorError::InvalidArgument(format!(
            "Not a valid service name: {:?}",
            name
        )));
    }
    Ok(())
}

impl Registry {
    pub fn new(events: Arc<EventQueue>) -> Self {
        Registry {
            table: RwLock::new(Table::default()),
            pids: Mutex::new(PidTable::default()),
            events,
        }
    }

    pub fn events(&self) -> &Arc<EventQueue> {
        &self.events
    }

    pub fn lookup(&self, name: &str) -> Result<ServiceId> {
        locking::read(&self.table)
            .by_name
            .get(name)
            .copied()
            .ok_or_else(|| SupervisorError::NotFound(name.to_owned()))
    }

    pub fn get(&self, id: ServiceId) -> Result<Arc<Service>> {
        let table = locking::read(&self.table);
        match table.slots.get(id.index as usize) {
            Some(Slot {
                generation,
                service: Some(service),
            }) if *generation == id.generation => Ok(service.clone()),
            _ => Err(SupervisorError::NotFound(format!("{}", id))),
        }
    }

    pub fn get_by_name(&self, name: &str) -> Result<Arc<Service>> {
        self.get(self.lookup(name)?)
    }

    pub fn create(&self, name: &str, config: ServiceConfig) -> Result<ServiceId> {
        self.create_with_sockets(name, config, ServiceSockets::default())
    }

    pub fn create_with_sockets(
        &self,
        name: &str,
        mut config: ServiceConfig,
        sockets: ServiceSockets,
    ) -> Result<ServiceId> {
        validate_name(name)?;
        config.dedup_dependencies();
        let mut table = locking::write(&self.table);
        if table.by_name.contains_key(name) {
            return Err(SupervisorError::AlreadyExists(name.to_owned()));
        }
        let index = match table.free.pop() {
            Some(index) => index,
            None => {
                table.slots.push(Slot {
                    generation: 0,
                    service: None,
                });
                (table.slots.len() - 1) as u32
            }
        };
        let slot = &mut table.slots[index as usize];
        let id = ServiceId {
            index,
            generation: slot.generation,
        };
        slot.service = Some(Arc::new(Service {
            id,
            name: name.to_owned(),
            config: RwLock::new(Arc::new(config)),
            runtime: Mutex::new(ServiceRuntime::new()),
            changed: Condvar::new(),
            sockets,
        }));
        table.by_name.insert(name.to_owned(), id);
        trace!("Created service {} as {}", name, id);
        Ok(id)
    }

    /// Remove an inactive service. The handle and all copies of it become invalid.
    pub fn remove(&self, id: ServiceId) -> Result<Arc<Service>> {
        let service = self.get(id)?;
        {
            let mut rt = service.lock_runtime();
            if !rt.state.is_inactive() || rt.pending_op.is_some() {
                return Err(SupervisorError::InvalidState {
                    name: service.name.clone(),
                    state: rt.state.to_string(),
                    operation: "be removed",
                });
            }
            if rt.removed {
                return Err(SupervisorError::NotFound(format!("{}", id)));
            }
            // starts check this flag when claiming, so nothing gets spawned between here and the table update
            rt.removed = true;
        }
        let mut table = locking::write(&self.table);
        let slot = &mut table.slots[id.index as usize];
        if slot.generation != id.generation || slot.service.is_none() {
            return Err(SupervisorError::NotFound(format!("{}", id)));
        }
        slot.service = None;
        slot.generation = slot.generation.wrapping_add(1);
        table.free.push(id.index);
        table.by_name.remove(&service.name);
        trace!("Removed service {} ({})", service.name, id);
        Ok(service)
    }

    pub fn ids(&self) -> Vec<ServiceId> {
        let mut ids: Vec<_> = locking::read(&self.table).by_name.values().copied().collect();
        ids.sort();
        ids
    }

    pub fn services(&self) -> Vec<Arc<Service>> {
        let table = locking::read(&self.table);
        let mut services: Vec<_> = table
            .slots
            .iter()
            .filter_map(|slot| slot.service.clone())
            .collect();
        services.sort_by(|a, b| a.name.cmp(&b.name));
        services
    }

    pub fn len(&self) -> usize {
        locking::read(&self.table).by_name.len()
    }

    /// Snapshot of everybody's declared relationships
    pub fn dependency_graph(&self) -> DependencyGraph {
        let mut graph = DependencyGraph::default();
        for service in self.services() {
            let conf = service.config();
            graph.insert(&service.name, DeclaredDependencies::from_config(&conf));
        }
        graph
    }

    pub fn for_each_in_dependency_order(&self, direction: Direction) -> Result<Vec<ServiceId>> {
        let graph = self.dependency_graph();
        let order = dependency_resolving::full_start_order(&graph)?;
        let mut ids = order
            .iter()
            .map(|name| self.lookup(name))
            .collect::<Result<Vec<_>>>()?;
        if direction == Direction::Stop {
            ids.reverse();
        }
        Ok(ids)
    }

    /// Move a locked service into the next state.
    ///
    /// The caller must already have set the pid if `next` carries a process. A transition the state machine
    /// does not allow is logged and forces the service into FAILED, killing its process if it had one.
    pub fn transition(
        &self,
        service: &Service,
        rt: &mut ServiceRuntime,
        next: ServiceState,
    ) -> bool {
        let from = rt.state;
        if from == next {
            return true;
        }
        if !from.can_transition_to(next) {
            error!(
                "service={} event=INVALID_TRANSITION from={} to={}",
                service.name, from, next
            );
            if let Some(pid) = rt.pid {
                crate::services::signal_process_group(pid, nix::sys::signal::Signal::SIGKILL);
            }
            if from != ServiceState::Failed {
                rt.state = ServiceState::Failed;
                rt.state_since = Instant::now();
                rt.running_since = None;
                rt.stats.failures += 1;
                rt.clear_process();
                self.emit_status_change(service, from, ServiceState::Failed);
            }
            return false;
        }
        if !next.has_process() {
            rt.clear_process();
        }
        rt.state = next;
        rt.state_since = Instant::now();
        if next == ServiceState::Running && from != ServiceState::Reloading {
            rt.running_since = Some(Instant::now());
        } else if !next.is_running() {
            rt.running_since = None;
        }
        debug_assert!(rt.pid_invariant_holds());
        self.emit_status_change(service, from, next);
        true
    }

    fn emit_status_change(&self, service: &Service, from: ServiceState, to: ServiceState) {
        info!(
            "service={} event=STATUS_CHANGE from={} to={}",
            service.name, from, to
        );
        self.events.push(Event::StatusChange {
            id: service.id,
            from,
            to,
        });
        service.notify_waiters();
    }

    /// Atomic guarded transition. Returns false without side effects if the service is not in `expected`.
    pub fn compare_and_set_state(
        &self,
        id: ServiceId,
        expected: ServiceState,
        next: ServiceState,
    ) -> Result<bool> {
        let service = self.get(id)?;
        let mut rt = service.lock_runtime();
        if rt.state != expected {
            return Ok(false);
        }
        if next.has_process() && rt.pid.is_none() {
            return Ok(false);
        }
        if !expected.can_transition_to(next) {
            return Ok(false);
        }
        Ok(self.transition(&service, &mut rt, next))
    }

    /// Register a freshly forked pid. Returns the exit status if the process was already reaped,
    /// the caller has to feed it back into the event loop.
    pub fn register_pid(&self, pid: Pid, id: ServiceId) -> Option<ChildTermination> {
        let mut pids = locking::lock(&self.pids);
        pids.owners.insert(pid, id);
        pids.unclaimed.remove(&pid).map(|(termination, _)| termination)
    }

    pub fn register_adopted_pid(&self, pid: Pid, id: ServiceId) {
        let mut pids = locking::lock(&self.pids);
        pids.owners.insert(pid, id);
        pids.adopted.insert(pid);
    }

    pub fn take_pid_owner(&self, pid: Pid) -> Option<ServiceId> {
        let mut pids = locking::lock(&self.pids);
        pids.adopted.remove(&pid);
        pids.owners.remove(&pid)
    }

    pub fn park_exit(&self, pid: Pid, termination: ChildTermination) {
        locking::lock(&self.pids)
            .unclaimed
            .insert(pid, (termination, Instant::now()));
    }

    /// Forget parked exits nobody claimed. With reaping of orphans enabled these are mostly grandchildren.
    pub fn purge_parked_exits(&self, max_age: Duration) {
        let mut pids = locking::lock(&self.pids);
        let now = Instant::now();
        pids.unclaimed
            .retain(|_, (_, parked)| now.duration_since(*parked) < max_age);
    }

    pub fn tracked_pids(&self) -> Vec<(Pid, bool)> {
        let pids = locking::lock(&self.pids);
        pids.owners
            .keys()
            .map(|pid| (*pid, pids.adopted.contains(pid)))
            .collect()
    }

    pub fn is_tracked(&self, pid: Pid) -> bool {
        locking::lock(&self.pids).owners.contains_key(&pid)
    }
}
