//! The process supervisor: starting, stopping, restarting and reloading services and reacting to
//! their processes exiting.
//!
//! Operations run on the caller's thread (usually a worker of the pool). They claim the service under
//! its lock, do the blocking parts without holding it and wait for the outcome on the service's condvar.
//! Exits are fed in by the event loop through `on_child_exit`, deadlines are checked by `tick`.

use super::kill_service::{signal_main_process, signal_process_group};
use super::restart_policy::{self, Decision, ExitClass};
use super::start_service as spawner;
use crate::errors::{Result, SupervisorError};
use crate::event_loop::Event;
use crate::platform::proc_scan;
use crate::runtime_info::RuntimeInfo;
use crate::units::dependency_resolving;
use crate::units::*;

use log::{debug, error, info, trace, warn};
use nix::sys::signal::Signal;
use nix::unistd::Pid;
use std::path::Path;
use std::sync::{Arc, MutexGuard};
use std::time::{Duration, Instant, SystemTime};

/// Extra time granted to waiters on top of the deadlines the tick enforces
const WAIT_SLACK: Duration = Duration::from_secs(1);
/// Exits nobody claimed within this time are forgotten
const PARKED_EXIT_MAX_AGE: Duration = Duration::from_secs(30);

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum StopOutcome {
    AlreadyStopped,
    Graceful,
    /// The process had to be killed with SIGKILL
    Forced,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum StartMode {
    /// Operator initiated start, begins a new supervision episode
    Fresh,
    /// Part of a restart, the restart budget carries over
    Continue,
}

fn invalid_state(service: &Service, state: ServiceState, operation: &'static str) -> SupervisorError {
    SupervisorError::InvalidState {
        name: service.name.clone(),
        state: state.to_string(),
        operation,
    }
}

/// Wait on the service's condvar while `cond` holds. Returns true if the deadline passed first.
fn wait_while<'a>(
    service: &Service,
    mut rt: MutexGuard<'a, ServiceRuntime>,
    deadline: Instant,
    mut cond: impl FnMut(&ServiceRuntime) -> bool,
) -> (MutexGuard<'a, ServiceRuntime>, bool) {
    while cond(&rt) {
        let now = Instant::now();
        if now >= deadline {
            return (rt, true);
        }
        rt = service.wait_changed(rt, deadline - now);
    }
    (rt, false)
}

/// Translate the state a start ended in into the result of the start
fn start_outcome(service: &Service, conf: &ServiceConfig, rt: &ServiceRuntime) -> Result<()> {
    match rt.state {
        ServiceState::Running | ServiceState::Reloading => Ok(()),
        ServiceState::Stopped
            if conf.service_type == ServiceType::Oneshot
                && rt.last_exit.map(|exit| exit.success()).unwrap_or(false) =>
        {
            Ok(())
        }
        ServiceState::Failed | ServiceState::Stopping if rt.start_timed_out => {
            Err(SupervisorError::Timeout(format!(
                "{} did not become ready within {:?}",
                service.name, conf.start_timeout
            )))
        }
        state => Err(SupervisorError::SystemFailure(format!(
            "{} ended in {} during startup (last exit: {})",
            service.name,
            state,
            rt.last_exit
                .map(|exit| exit.to_string())
                .unwrap_or_else(|| "none".to_owned())
        ))),
    }
}

pub fn start_service(run_info: &RuntimeInfo, id: ServiceId) -> Result<()> {
    start_service_with(run_info, id, StartMode::Fresh)
}

pub fn start_service_with(run_info: &RuntimeInfo, id: ServiceId, mode: StartMode) -> Result<()> {
    let service = run_info.registry.get(id)?;
    let conf = service.config();
    if conf.masked {
        return Err(SupervisorError::PermissionDenied(format!(
            "{} is masked",
            service.name
        )));
    }

    let (seq, starts_before) = {
        let mut rt = service.lock_runtime();
        if rt.removed {
            return Err(SupervisorError::NotFound(service.name.clone()));
        }
        match rt.state {
            ServiceState::Running | ServiceState::Reloading => return Ok(()),
            ServiceState::Maintenance | ServiceState::Stopping => {
                return Err(invalid_state(&service, rt.state, "start"));
            }
            ServiceState::Starting => {
                return wait_for_other_start(run_info, &service, &conf, rt);
            }
            ServiceState::Stopped | ServiceState::Failed | ServiceState::Restarting => {}
        }
        if rt.pending_op == Some(Operation::Start) {
            return wait_for_other_start(run_info, &service, &conf, rt);
        }
        rt.op_seq += 1;
        rt.pending_op = Some(Operation::Start);
        if rt.state == ServiceState::Restarting {
            rt.restart_at = None;
        } else if mode == StartMode::Fresh {
            rt.restart_attempts = 0;
            rt.restart_history.clear();
        }
        (rt.op_seq, rt.stats.starts)
    };
    info!("service={} event=START_REQUESTED", service.name);

    let result = start_claimed(run_info, &service, &conf, seq);

    let mut rt = service.lock_runtime();
    if rt.op_seq == seq {
        // a restart that never got to spawn fails the service. If the process ran and exited,
        // the exit handling already decided what happens next.
        let spawned = rt.stats.starts != starts_before;
        if result.is_err() && rt.state == ServiceState::Restarting && !spawned {
            rt.stats.failures += 1;
            run_info
                .registry
                .transition(&service, &mut rt, ServiceState::Failed);
        }
        rt.pending_op = None;
    }
    service.notify_waiters();
    if let Err(e) = &result {
        warn!(
            "service={} event=START_FAILED error={}",
            service.name, e
        );
    }
    result
}

fn wait_for_other_start(
    run_info: &RuntimeInfo,
    service: &Service,
    conf: &ServiceConfig,
    rt: MutexGuard<'_, ServiceRuntime>,
) -> Result<()> {
    trace!("Start of {} already in progress, waiting for it", service.name);
    let deadline =
        Instant::now() + conf.start_timeout + run_info.config.kill_timeout + WAIT_SLACK;
    let (rt, timed_out) = wait_while(service, rt, deadline, |rt| {
        rt.pending_op == Some(Operation::Start)
            || rt.state == ServiceState::Starting
            || (rt.state == ServiceState::Stopping && rt.start_timed_out)
    });
    if timed_out {
        return Err(SupervisorError::Timeout(format!(
            "waiting for the start of {}",
            service.name
        )));
    }
    start_outcome(service, conf, &rt)
}

fn start_dependencies(run_info: &RuntimeInfo, service: &Service) -> Result<()> {
    let graph = run_info.registry.dependency_graph();
    let order = dependency_resolving::start_order(&graph, &service.name)?;
    let hard = dependency_resolving::hard_closure(&graph, &service.name);

    for dep_name in order.iter().filter(|name| **name != service.name) {
        let is_hard = hard.contains(dep_name);
        let dep = match run_info.registry.get_by_name(dep_name) {
            Ok(dep) => dep,
            Err(e) if is_hard => {
                return Err(SupervisorError::DependencyFailure {
                    name: service.name.clone(),
                    dependency: format!("{} ({})", dep_name, e),
                })
            }
            Err(_) => continue,
        };
        let dep_conf = dep.config();
        let state = dep.state();
        if state.is_running() {
            continue;
        }
        if dep_conf.masked
            || state == ServiceState::Failed
            || state == ServiceState::Maintenance
        {
            if is_hard {
                return Err(SupervisorError::DependencyFailure {
                    name: service.name.clone(),
                    dependency: dep_name.clone(),
                });
            }
            debug!(
                "Skipping wanted service {} of {} in state {}",
                dep_name, service.name, state
            );
            continue;
        }
        match start_service_with(run_info, dep.id, StartMode::Fresh) {
            Ok(()) => {}
            Err(e) if is_hard => {
                error!(
                    "service={} event=DEPENDENCY_FAILED dependency={} error={}",
                    service.name, dep_name, e
                );
                return Err(SupervisorError::DependencyFailure {
                    name: service.name.clone(),
                    dependency: dep_name.clone(),
                });
            }
            Err(e) => warn!(
                "Wanted service {} of {} did not start: {}",
                dep_name, service.name, e
            ),
        }
    }
    Ok(())
}

fn resolve_conflicts(run_info: &RuntimeInfo, service: &Service) -> Result<()> {
    let graph = run_info.registry.dependency_graph();
    for name in dependency_resolving::conflicts_of(&graph, &service.name) {
        let other = match run_info.registry.get_by_name(&name) {
            Ok(other) => other,
            Err(_) => continue,
        };
        if other.state().is_inactive() {
            continue;
        }
        info!(
            "service={} event=CONFLICT_STOP conflict={}",
            service.name, name
        );
        let unresolved = || SupervisorError::ConflictUnresolved {
            name: service.name.clone(),
            conflict: name.clone(),
        };
        match stop_service(run_info, other.id) {
            Ok(StopOutcome::Forced) => return Err(unresolved()),
            Ok(_) => {}
            Err(e) => {
                warn!("Stopping conflicting service {} failed: {}", name, e);
                return Err(unresolved());
            }
        }
    }
    Ok(())
}

fn start_claimed(
    run_info: &RuntimeInfo,
    service: &Arc<Service>,
    conf: &ServiceConfig,
    seq: u64,
) -> Result<()> {
    start_dependencies(run_info, service)?;
    resolve_conflicts(run_info, service)?;

    let mut plan = spawner::prepare_spawn(service, conf, run_info.pre_exec_hooks())?;

    let mut rt = service.lock_runtime();
    if rt.op_seq != seq || rt.removed {
        return Err(invalid_state(service, rt.state, "start"));
    }
    match rt.state {
        ServiceState::Stopped | ServiceState::Failed | ServiceState::Restarting => {}
        state => return Err(invalid_state(service, state, "start")),
    }

    let pid = spawner::spawn(&mut plan)?;
    let now = Instant::now();
    rt.pid = Some(pid);
    rt.start_timed_out = false;
    rt.forced_kill = false;
    rt.started_at = Some(SystemTime::now());
    rt.start_deadline = Some(now + conf.start_timeout);
    if conf.watchdog_interval.is_some() {
        rt.last_ping = Some(now);
    }
    rt.stats.starts += 1;
    run_info
        .registry
        .transition(service, &mut rt, ServiceState::Starting);
    info!(
        "service={} event=SPAWNED pid={} exec={}",
        service.name, pid, conf.exec
    );
    if let Some(termination) = run_info.registry.register_pid(pid, service.id) {
        run_info.push_event(Event::ChildExited { pid, termination });
    }
    run_info.push_event(Event::Reap);

    if conf.service_type == ServiceType::Simple {
        rt.start_deadline = None;
        run_info
            .registry
            .transition(service, &mut rt, ServiceState::Running);
        return Ok(());
    }

    let deadline = now + conf.start_timeout + run_info.config.kill_timeout + WAIT_SLACK;
    let (rt, timed_out) = wait_while(service, rt, deadline, |rt| {
        rt.op_seq == seq
            && (rt.state == ServiceState::Starting
                || (rt.state == ServiceState::Stopping && rt.start_timed_out))
    });
    if timed_out {
        return Err(SupervisorError::Timeout(format!(
            "{} did not settle after its start timeout",
            service.name
        )));
    }
    if rt.op_seq != seq {
        return Err(invalid_state(service, rt.state, "start"));
    }
    start_outcome(service, conf, &rt)
}

/// Stop a service and everything that hard-depends on it
pub fn stop_service(run_info: &RuntimeInfo, id: ServiceId) -> Result<StopOutcome> {
    let service = run_info.registry.get(id)?;
    {
        let mut rt = service.lock_runtime();
        if rt.state.is_inactive() {
            if rt.pending_op == Some(Operation::Start) {
                // preempt a start that is still busy with dependencies
                rt.op_seq += 1;
                rt.pending_op = None;
                service.notify_waiters();
            }
            trace!("{} is already {}", service.name, rt.state);
            return Ok(StopOutcome::AlreadyStopped);
        }
    }
    info!("service={} event=STOP_REQUESTED", service.name);

    let graph = run_info.registry.dependency_graph();
    let order = dependency_resolving::stop_order(&graph, &service.name)?;
    for name in order.iter().filter(|name| **name != service.name) {
        let dependent = match run_info.registry.get_by_name(name) {
            Ok(dependent) => dependent,
            Err(_) => continue,
        };
        if dependent.state().is_inactive() {
            continue;
        }
        info!(
            "service={} event=CASCADE_STOP dependency={}",
            name, service.name
        );
        if let Err(e) = stop_single(run_info, &dependent) {
            warn!("Stopping dependent {} failed: {}", name, e);
        }
    }
    stop_single(run_info, &service)
}

/// Stop one service without looking at its dependents
fn stop_single(run_info: &RuntimeInfo, service: &Service) -> Result<StopOutcome> {
    let conf = service.config();
    let mut rt = service.lock_runtime();
    match rt.state {
        ServiceState::Stopped | ServiceState::Failed | ServiceState::Maintenance => {
            return Ok(StopOutcome::AlreadyStopped)
        }
        ServiceState::Restarting => {
            rt.op_seq += 1;
            rt.pending_op = None;
            rt.restart_at = None;
            run_info
                .registry
                .transition(service, &mut rt, ServiceState::Stopped);
            info!("service={} event=RESTART_CANCELLED", service.name);
            return Ok(StopOutcome::Graceful);
        }
        ServiceState::Stopping => {
            trace!("{} is already stopping, waiting", service.name);
        }
        ServiceState::Starting | ServiceState::Running | ServiceState::Reloading => {
            rt.op_seq += 1;
            rt.pending_op = Some(Operation::Stop);
            rt.forced_kill = false;
            rt.start_deadline = None;
            rt.stop_deadline = Some(Instant::now() + conf.stop_timeout);
            let pid = rt.pid;
            run_info
                .registry
                .transition(service, &mut rt, ServiceState::Stopping);
            if let Some(pid) = pid {
                signal_process_group(pid, Signal::SIGTERM);
            }
        }
    }

    let seq = rt.op_seq;
    let deadline =
        Instant::now() + conf.stop_timeout + run_info.config.kill_timeout + WAIT_SLACK;
    let (mut rt, timed_out) = wait_while(service, rt, deadline, |rt| {
        rt.state == ServiceState::Stopping
    });
    if timed_out {
        return Err(SupervisorError::Timeout(format!(
            "{} did not stop",
            service.name
        )));
    }
    if rt.op_seq == seq && rt.pending_op == Some(Operation::Stop) {
        rt.pending_op = None;
    }
    if rt.forced_kill {
        Ok(StopOutcome::Forced)
    } else {
        Ok(StopOutcome::Graceful)
    }
}

/// Stop and start again. Dependents that had to be stopped are started again afterwards.
pub fn restart_service(run_info: &RuntimeInfo, id: ServiceId) -> Result<()> {
    let service = run_info.registry.get(id)?;
    let state = service.state();
    if state == ServiceState::Maintenance {
        return Err(invalid_state(&service, state, "restart"));
    }
    info!("service={} event=RESTART_REQUESTED", service.name);

    let graph = run_info.registry.dependency_graph();
    let active_dependents: Vec<ServiceId> = dependency_resolving::stop_order(&graph, &service.name)?
        .iter()
        .filter(|name| **name != service.name)
        .filter_map(|name| run_info.registry.get_by_name(name).ok())
        .filter(|dependent| !dependent.state().is_inactive())
        .map(|dependent| dependent.id)
        .collect();

    stop_service(run_info, id)?;
    start_service_with(run_info, id, StartMode::Continue)?;

    for dependent in active_dependents.iter().rev() {
        if let Err(e) = start_service_with(run_info, *dependent, StartMode::Continue) {
            warn!("Starting dependent {} again failed: {}", dependent, e);
        }
    }
    Ok(())
}

pub fn reload_service(run_info: &RuntimeInfo, id: ServiceId) -> Result<()> {
    let service = run_info.registry.get(id)?;
    let conf = service.config();
    let mut rt = service.lock_runtime();
    let pid = match (rt.state, rt.pid) {
        (ServiceState::Running, Some(pid)) => pid,
        (state, _) => return Err(invalid_state(&service, state, "reload")),
    };
    rt.op_seq += 1;
    let seq = rt.op_seq;
    rt.pending_op = Some(Operation::Reload);
    run_info
        .registry
        .transition(&service, &mut rt, ServiceState::Reloading);
    info!(
        "service={} event=RELOAD signal={}",
        service.name, conf.reload_signal
    );

    let mut result = Ok(());
    if let Err(e) = signal_main_process(pid, conf.reload_signal) {
        run_info
            .registry
            .transition(&service, &mut rt, ServiceState::Running);
        result = Err(SupervisorError::from_errno("sending reload signal", e));
    } else if conf.service_type == ServiceType::Notify {
        let deadline = Instant::now() + conf.reload_timeout;
        let (guard, timed_out) = wait_while(&service, rt, deadline, |rt| {
            rt.op_seq == seq && rt.state == ServiceState::Reloading
        });
        rt = guard;
        if timed_out {
            warn!(
                "service={} event=RELOAD_TIMEOUT timeout={:?}",
                service.name, conf.reload_timeout
            );
            run_info
                .registry
                .transition(&service, &mut rt, ServiceState::Running);
            result = Err(SupervisorError::Timeout(format!(
                "{} did not finish reloading",
                service.name
            )));
        }
    } else {
        run_info
            .registry
            .transition(&service, &mut rt, ServiceState::Running);
    }
    if rt.op_seq == seq {
        rt.pending_op = None;
    }
    result
}

/// React to a reaped process of a service. Called by the event loop.
pub fn on_child_exit(run_info: &RuntimeInfo, id: ServiceId, pid: Pid, termination: ChildTermination) {
    let service = match run_info.registry.get(id) {
        Ok(service) => service,
        Err(_) => {
            trace!("Exit of {} belongs to a removed service", pid);
            return;
        }
    };
    let conf = service.config();
    let registry = &run_info.registry;

    let settled = {
        let mut rt = service.lock_runtime();
        if rt.pid != Some(pid) {
            trace!("Ignoring exit of {}, not the current process of {}", pid, service.name);
            return;
        }
        rt.last_exit = Some(termination);
        rt.stopped_at = Some(SystemTime::now());
        info!(
            "service={} event=CHILD_EXITED pid={} status={}",
            service.name, pid, termination
        );

        match rt.state {
            ServiceState::Stopping => {
                let next = if rt.start_timed_out {
                    rt.stats.failures += 1;
                    ServiceState::Failed
                } else {
                    ServiceState::Stopped
                };
                registry.transition(&service, &mut rt, next);
                return;
            }
            ServiceState::Starting
                if conf.service_type == ServiceType::Oneshot && termination.success() =>
            {
                registry.transition(&service, &mut rt, ServiceState::Stopped);
                return;
            }
            ServiceState::Starting | ServiceState::Running | ServiceState::Reloading => {}
            state => {
                error!(
                    "service={} event=UNEXPECTED_EXIT state={} pid={}",
                    service.name, state, pid
                );
                rt.clear_process();
                return;
            }
        }

        let class = ExitClass::classify(termination, rt.watchdog_fired);
        if class != ExitClass::Clean {
            rt.stats.failures += 1;
        }
        match restart_policy::decide(conf.restart, class) {
            Decision::Restart => {
                let now = Instant::now();
                let config = &run_info.config;
                if restart_policy::record_restart(
                    &mut rt.restart_history,
                    now,
                    config.restart_window,
                    config.restart_max,
                ) {
                    let delay = restart_policy::backoff(
                        conf.restart_delay,
                        rt.restart_attempts,
                        config.backoff_cap,
                    );
                    rt.restart_attempts += 1;
                    rt.stats.restarts += 1;
                    rt.restart_at = Some(now + delay);
                    registry.transition(&service, &mut rt, ServiceState::Restarting);
                    info!(
                        "service={} event=RESTART_SCHEDULED delay_ms={} attempt={}",
                        service.name,
                        delay.as_millis(),
                        rt.restart_attempts
                    );
                    None
                } else {
                    error!(
                        "service={} event=RESTART_LIMIT restarts={} window={:?}",
                        service.name, config.restart_max, config.restart_window
                    );
                    registry.transition(&service, &mut rt, ServiceState::Failed);
                    if conf.critical {
                        run_info.push_event(Event::EmergencyShutdown(format!(
                            "critical service {} exhausted its restart budget",
                            service.name
                        )));
                    }
                    Some(ServiceState::Failed)
                }
            }
            Decision::Settle(next) => {
                registry.transition(&service, &mut rt, next);
                Some(next)
            }
        }
    };

    if settled.is_some() {
        let graph = registry.dependency_graph();
        for name in dependency_resolving::hard_dependents(&graph, &service.name) {
            if let Ok(dependent) = registry.get_by_name(&name) {
                if !dependent.state().is_inactive() {
                    info!(
                        "service={} event=CASCADE_STOP dependency={}",
                        name, service.name
                    );
                    run_info.push_event(Event::Stop(dependent.id));
                }
            }
        }
    }
}

/// Periodic sweep over all services: start and stop deadlines, due restarts, the stability window
/// and watchdogs. Returns the services whose restart is due.
pub fn tick(run_info: &RuntimeInfo) -> Vec<ServiceId> {
    let now = Instant::now();
    let config = &run_info.config;
    let registry = &run_info.registry;
    let mut due = Vec::new();

    for service in registry.services() {
        let conf = service.config();
        let mut rt = service.lock_runtime();
        match rt.state {
            ServiceState::Starting => {
                if rt.start_deadline.map(|d| now >= d).unwrap_or(false) {
                    warn!(
                        "service={} event=START_TIMEOUT timeout={:?}",
                        service.name, conf.start_timeout
                    );
                    rt.start_deadline = None;
                    rt.start_timed_out = true;
                    rt.forced_kill = true;
                    rt.stop_deadline = Some(now + config.kill_timeout);
                    let pid = rt.pid;
                    registry.transition(&service, &mut rt, ServiceState::Stopping);
                    if let Some(pid) = pid {
                        signal_process_group(pid, Signal::SIGKILL);
                    }
                }
            }
            ServiceState::Stopping => {
                if rt.stop_deadline.map(|d| now >= d).unwrap_or(false) {
                    if rt.forced_kill {
                        error!(
                            "service={} event=KILL_TIMEOUT pid={:?}",
                            service.name, rt.pid
                        );
                        rt.stop_deadline = None;
                    } else {
                        warn!(
                            "service={} event=STOP_TIMEOUT timeout={:?}",
                            service.name, conf.stop_timeout
                        );
                        rt.forced_kill = true;
                        rt.stop_deadline = Some(now + config.kill_timeout);
                        if let Some(pid) = rt.pid {
                            signal_process_group(pid, Signal::SIGKILL);
                        }
                    }
                }
            }
            ServiceState::Restarting => {
                if rt.pending_op.is_none() && rt.restart_at.map(|at| now >= at).unwrap_or(false) {
                    rt.restart_at = None;
                    due.push(service.id);
                }
            }
            ServiceState::Running => {
                if let Some(since) = rt.running_since {
                    if rt.restart_attempts > 0 && now.duration_since(since) >= config.stability_window {
                        debug!(
                            "{} ran for {:?}, resetting its restart counter",
                            service.name, config.stability_window
                        );
                        rt.restart_attempts = 0;
                        rt.restart_history.clear();
                    }
                }
                if let (Some(interval), Some(last_ping)) = (conf.watchdog_interval, rt.last_ping) {
                    if !rt.watchdog_fired && now.duration_since(last_ping) > interval {
                        rt.watchdog_fired = true;
                        rt.stats.watchdog_misses += 1;
                        warn!(
                            "service={} event=WATCHDOG_TRIGGER last_ping_ms_ago={}",
                            service.name,
                            now.duration_since(last_ping).as_millis()
                        );
                        run_info.push_event(Event::WatchdogTrigger(service.id));
                    }
                }
            }
            _ => {}
        }
    }
    registry.purge_parked_exits(PARKED_EXIT_MAX_AGE);
    due
}

/// Kill a service whose watchdog fired. The exit is then classified as a watchdog failure.
pub fn handle_watchdog_trigger(run_info: &RuntimeInfo, id: ServiceId) {
    let service = match run_info.registry.get(id) {
        Ok(service) => service,
        Err(_) => return,
    };
    let rt = service.lock_runtime();
    if rt.state.is_running() && rt.watchdog_fired {
        if let Some(pid) = rt.pid {
            error!(
                "service={} event=WATCHDOG_KILL pid={}",
                service.name, pid
            );
            signal_process_group(pid, Signal::SIGKILL);
        }
    }
}

pub fn ping_watchdog(run_info: &RuntimeInfo, id: ServiceId) -> Result<()> {
    let service = run_info.registry.get(id)?;
    let mut rt = service.lock_runtime();
    if !rt.state.has_process() {
        return Err(invalid_state(&service, rt.state, "receive watchdog pings"));
    }
    rt.last_ping = Some(Instant::now());
    Ok(())
}

pub fn set_maintenance(run_info: &RuntimeInfo, id: ServiceId, on: bool) -> Result<()> {
    let service = run_info.registry.get(id)?;
    let mut rt = service.lock_runtime();
    if rt.pending_op.is_some() {
        return Err(invalid_state(&service, rt.state, "change maintenance mode"));
    }
    match (on, rt.state) {
        (true, ServiceState::Maintenance) | (false, ServiceState::Stopped) => Ok(()),
        (true, ServiceState::Stopped) | (true, ServiceState::Failed) => {
            rt.restart_at = None;
            run_info
                .registry
                .transition(&service, &mut rt, ServiceState::Maintenance);
            Ok(())
        }
        (false, ServiceState::Maintenance) => {
            run_info
                .registry
                .transition(&service, &mut rt, ServiceState::Stopped);
            Ok(())
        }
        (true, state) => Err(invalid_state(&service, state, "enter maintenance")),
        (false, state) => Err(invalid_state(&service, state, "leave maintenance")),
    }
}

fn update_config(
    run_info: &RuntimeInfo,
    id: ServiceId,
    update: impl FnOnce(&mut ServiceConfig),
) -> Result<()> {
    let service = run_info.registry.get(id)?;
    let mut conf = (*service.config()).clone();
    update(&mut conf);
    service.replace_config(conf);
    Ok(())
}

pub fn set_enabled(run_info: &RuntimeInfo, id: ServiceId, enabled: bool) -> Result<()> {
    update_config(run_info, id, |conf| conf.enabled = enabled)
}

pub fn set_masked(run_info: &RuntimeInfo, id: ServiceId, masked: bool) -> Result<()> {
    update_config(run_info, id, |conf| conf.masked = masked)
}

/// Take over a process that was started by a previous instance of the supervisor
pub fn adopt(run_info: &RuntimeInfo, id: ServiceId, pid: Pid) -> Result<()> {
    let service = run_info.registry.get(id)?;
    let conf = service.config();
    let mut rt = service.lock_runtime();
    if rt.state != ServiceState::Stopped {
        return Err(invalid_state(&service, rt.state, "adopt a process"));
    }
    rt.pid = Some(pid);
    rt.started_at = Some(SystemTime::now());
    if conf.watchdog_interval.is_some() {
        rt.last_ping = Some(Instant::now());
    }
    run_info.registry.register_adopted_pid(pid, service.id);
    run_info
        .registry
        .transition(&service, &mut rt, ServiceState::Running);
    info!("service={} event=ADOPTED pid={}", service.name, pid);
    Ok(())
}

/// Adopt every process under `proc_root` that carries the marker of a loaded service.
/// Returns the number of adopted processes.
pub fn adopt_marked_processes(run_info: &RuntimeInfo, proc_root: &Path) -> usize {
    let mut adopted = 0;
    for (pid, name) in proc_scan::find_marked_processes(proc_root) {
        let id = match run_info.registry.lookup(&name) {
            Ok(id) => id,
            Err(_) => {
                warn!("Found process {} of unknown service {}", pid, name);
                continue;
            }
        };
        match adopt(run_info, id, pid) {
            Ok(()) => adopted += 1,
            Err(e) => warn!("Could not adopt process {} of {}: {}", pid, name, e),
        }
    }
    adopted
}
