//! The event loop. One thread waits on every fd neoinit cares about and turns readiness into events.
//! Blocking work (starting, stopping, control connections) is handed to the worker pool, the loop itself
//! only reaps children, records what happened and schedules.

use super::readiness::{Interest, Readiness};
use super::signals::SignalPipes;
use super::Event;
use crate::control;
use crate::errors::Result;
use crate::runtime_info::{ArcRuntimeInfo, ExitReason, RuntimeInfo};
use crate::services::{self, StartMode};
use crate::units::{ChildTermination, ServiceId, ServiceState};

use log::{debug, error, info, trace, warn};
use nix::errno::Errno;
use nix::sys::epoll::EpollEvent;
use nix::sys::time::TimeSpec;
use nix::sys::timerfd::{ClockId, Expiration, TimerFd, TimerFlags, TimerSetTimeFlags};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::Pid;
use std::collections::HashMap;
use std::os::unix::io::{AsRawFd, RawFd};
use std::os::unix::net::{UnixListener, UnixStream};
use std::time::Duration;
use threadpool::ThreadPool;

/// Control clients that send nothing for this long are dropped
const CONTROL_READ_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum Source {
    Waker,
    Cancel,
    ChildSignal,
    TermSignal,
    Tick,
    ControlListener,
    ControlClient,
    Notify(ServiceId),
    Activation(ServiceId),
}

type Operation = fn(&RuntimeInfo, ServiceId) -> Result<()>;

pub struct EventLoop {
    run_info: ArcRuntimeInfo,
    readiness: Readiness,
    sources: HashMap<RawFd, Source>,
    signals: SignalPipes,
    tick: TimerFd,
    control: Option<UnixListener>,
    clients: HashMap<RawFd, UnixStream>,
    pool: ThreadPool,
    shutting_down: bool,
}

impl EventLoop {
    pub fn new(run_info: ArcRuntimeInfo, control: Option<UnixListener>) -> std::result::Result<Self, String> {
        let tick = TimerFd::new(
            ClockId::CLOCK_MONOTONIC,
            TimerFlags::TFD_NONBLOCK | TimerFlags::TFD_CLOEXEC,
        )
        .map_err(|e| format!("Error creating tick timer: {}", e))?;
        tick.set(
            Expiration::Interval(TimeSpec::from(run_info.config.tick_interval)),
            TimerSetTimeFlags::empty(),
        )
        .map_err(|e| format!("Error arming tick timer: {}", e))?;

        let pool = ThreadPool::new(run_info.config.worker_threads.max(1));
        let mut event_loop = EventLoop {
            readiness: Readiness::new()?,
            sources: HashMap::new(),
            signals: SignalPipes::new()?,
            tick,
            control,
            clients: HashMap::new(),
            pool,
            shutting_down: false,
            run_info,
        };

        let fixed = vec![
            (event_loop.run_info.events.wake_fd(), Source::Waker),
            (event_loop.run_info.cancel.wake_fd(), Source::Cancel),
            (event_loop.signals.child_fd(), Source::ChildSignal),
            (event_loop.signals.term_fd(), Source::TermSignal),
            (event_loop.tick.as_raw_fd(), Source::Tick),
        ];
        for (fd, source) in fixed {
            event_loop
                .register(fd, source, Interest::Read)
                .map_err(|e| format!("Error registering {:?}: {}", source, e))?;
        }
        if let Some(listener) = &event_loop.control {
            listener
                .set_nonblocking(true)
                .map_err(|e| format!("Error setting control socket nonblocking: {}", e))?;
            let fd = listener.as_raw_fd();
            event_loop
                .register(fd, Source::ControlListener, Interest::Read)
                .map_err(|e| format!("Error registering control socket: {}", e))?;
        }
        for id in event_loop.run_info.registry.ids() {
            event_loop.register_service(id);
        }
        Ok(event_loop)
    }

    fn register(&mut self, fd: RawFd, source: Source, interest: Interest) -> std::result::Result<(), Errno> {
        if self.sources.get(&fd) == Some(&source) {
            // services loaded before the loop existed announce themselves again
            return Ok(());
        }
        self.readiness.add(fd, interest)?;
        self.sources.insert(fd, source);
        Ok(())
    }

    fn unregister(&mut self, fd: RawFd) {
        self.sources.remove(&fd);
        if let Err(e) = self.readiness.remove(fd) {
            warn!("Error removing fd {} from the wait set: {}", fd, e);
        }
    }

    fn register_service(&mut self, id: ServiceId) {
        let service = match self.run_info.registry.get(id) {
            Ok(service) => service,
            Err(_) => return,
        };
        if let Some(fd) = service.notify_fd() {
            if let Err(e) = self.register(fd, Source::Notify(id), Interest::Read) {
                error!("Error watching notification socket of {}: {}", service.name, e);
            }
        }
        let conf = service.config();
        if !conf.socket_activated {
            return;
        }
        let interest = if service.state() == ServiceState::Stopped {
            Interest::ReadOnce
        } else {
            Interest::Disarmed
        };
        for fd in service.listener_fds() {
            if let Err(e) = self.register(fd, Source::Activation(id), interest) {
                error!("Error watching activation socket of {}: {}", service.name, e);
            }
        }
    }

    fn rearm_activation(&self, id: ServiceId) {
        let service = match self.run_info.registry.get(id) {
            Ok(service) => service,
            Err(_) => return,
        };
        if !service.config().socket_activated {
            return;
        }
        for fd in service.listener_fds() {
            match self.readiness.modify(fd, Interest::ReadOnce) {
                Ok(()) => trace!("Rearmed activation socket {} of {}", fd, service.name),
                Err(e) => warn!("Could not rearm activation socket of {}: {}", service.name, e),
            }
        }
    }

    /// Run until the cancellation token fires
    pub fn run(mut self) {
        let mut buf = vec![EpollEvent::empty(); 64];
        info!("Event loop running");
        while !self.run_info.cancel.is_cancelled() {
            let ready = match self.readiness.wait(&mut buf, -1) {
                Ok(ready) => ready,
                Err(e) => {
                    error!("Error while waiting for events: {}", e);
                    continue;
                }
            };
            for fd in ready {
                if let Some(source) = self.sources.get(&fd).copied() {
                    self.dispatch(fd, source);
                }
            }
            self.process_events();
        }
        info!("Event loop stopped");
    }

    fn dispatch(&mut self, fd: RawFd, source: Source) {
        match source {
            Source::Waker => {}
            Source::Cancel => trace!("Cancellation requested"),
            Source::ChildSignal => {
                self.signals.drain_child();
                self.reap();
            }
            Source::TermSignal => {
                self.signals.drain_term();
                info!("Received termination signal");
                self.run_info.push_event(Event::Shutdown);
            }
            Source::Tick => {
                let mut expirations = [0u8; 8];
                let _ = nix::unistd::read(fd, &mut expirations);
                // adopted processes are not our children, they do not cause SIGCHLD
                self.reap();
                for id in services::tick(&self.run_info) {
                    if self.shutting_down {
                        debug!("Not restarting {} while shutting down", id);
                        continue;
                    }
                    self.run_on_worker("RESTART_DUE", id, |run_info, id| {
                        services::start_service_with(run_info, id, StartMode::Continue)
                    });
                }
            }
            Source::ControlListener => self.accept_control_clients(),
            Source::ControlClient => {
                self.unregister(fd);
                if let Some(stream) = self.clients.remove(&fd) {
                    let run_info = self.run_info.clone();
                    self.pool
                        .execute(move || control::serve_connection(stream, &run_info));
                }
            }
            Source::Notify(id) => services::notifications::handle_notifications(&self.run_info, id),
            Source::Activation(id) => {
                debug!("Connection on activation socket {} of {}", fd, id);
                self.run_info.push_event(Event::SocketActivation(id));
            }
        }
    }

    fn accept_control_clients(&mut self) {
        loop {
            let accepted = match &self.control {
                Some(listener) => listener.accept(),
                None => return,
            };
            match accepted {
                Ok((stream, _)) => {
                    let setup = stream
                        .set_nonblocking(false)
                        .and_then(|_| stream.set_read_timeout(Some(CONTROL_READ_TIMEOUT)));
                    if let Err(e) = setup {
                        warn!("Dropping control connection: {}", e);
                        continue;
                    }
                    let fd = stream.as_raw_fd();
                    match self.register(fd, Source::ControlClient, Interest::ReadOnce) {
                        Ok(()) => {
                            self.clients.insert(fd, stream);
                        }
                        Err(e) => warn!("Dropping control connection: {}", e),
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => return,
                Err(e) => {
                    error!("Error accepting control connection: {}", e);
                    return;
                }
            }
        }
    }

    fn run_on_worker(&self, what: &'static str, id: ServiceId, operation: Operation) {
        let run_info = self.run_info.clone();
        self.pool.execute(move || {
            if let Err(e) = operation(&run_info, id) {
                let name = run_info
                    .registry
                    .get(id)
                    .map(|service| service.name.clone())
                    .unwrap_or_else(|_| id.to_string());
                warn!("service={} event={} error={}", name, what, e);
            }
        });
    }

    fn child_exited(&self, pid: Pid, termination: ChildTermination) {
        let registry = &self.run_info.registry;
        match registry.take_pid_owner(pid) {
            Some(id) => services::on_child_exit(&self.run_info, id, pid, termination),
            None => {
                trace!("Parking exit of unknown pid {}: {}", pid, termination);
                registry.park_exit(pid, termination);
            }
        }
    }

    fn reap(&self) {
        let registry = &self.run_info.registry;
        for (pid, adopted) in registry.tracked_pids() {
            match waitpid(pid, Some(WaitPidFlag::WNOHANG)) {
                Ok(WaitStatus::Exited(pid, code)) => {
                    self.child_exited(pid, ChildTermination::Exit(code))
                }
                Ok(WaitStatus::Signaled(pid, signal, _dumped_core)) => {
                    self.child_exited(pid, ChildTermination::Signal(signal))
                }
                Ok(_) => {}
                Err(Errno::ECHILD) => {
                    if !services::process_exists(pid) {
                        if !adopted {
                            warn!("Process {} was reaped by someone else", pid);
                        }
                        self.child_exited(pid, ChildTermination::Vanished);
                    }
                }
                Err(e) => trace!("Error while waiting for {}: {}", pid, e),
            }
        }

        if !self.run_info.config.reap_orphans {
            return;
        }
        loop {
            match waitpid(Pid::from_raw(-1), Some(WaitPidFlag::WNOHANG)) {
                Ok(WaitStatus::Exited(pid, code)) => {
                    self.child_exited(pid, ChildTermination::Exit(code))
                }
                Ok(WaitStatus::Signaled(pid, signal, _dumped_core)) => {
                    self.child_exited(pid, ChildTermination::Signal(signal))
                }
                Ok(WaitStatus::StillAlive) => break,
                Ok(_) => {}
                Err(Errno::ECHILD) => break,
                Err(e) => {
                    trace!("Error while reaping: {}", e);
                    break;
                }
            }
        }
    }

    fn begin_shutdown(&mut self, reason: ExitReason) {
        self.run_info.set_exit_reason(reason);
        if self.shutting_down {
            return;
        }
        self.shutting_down = true;
        let run_info = self.run_info.clone();
        let spawned = std::thread::Builder::new()
            .name("shutdown".into())
            .spawn(move || crate::shutdown::shutdown(&run_info));
        if let Err(e) = spawned {
            error!("Could not spawn shutdown thread: {}", e);
            self.run_info.cancel.cancel();
        }
    }

    fn service_is_startable(&self, id: ServiceId) -> bool {
        match self.run_info.registry.get(id) {
            Ok(service) => {
                let conf = service.config();
                let state = service.state();
                conf.enabled
                    && !conf.masked
                    && (state == ServiceState::Stopped || state == ServiceState::Failed)
            }
            Err(_) => false,
        }
    }

    fn process_events(&mut self) {
        for event in self.run_info.events.drain() {
            trace!("Processing event {}", event.name());
            match event {
                Event::Start(id) => {
                    if self.shutting_down {
                        continue;
                    }
                    if self.service_is_startable(id) {
                        self.run_on_worker("START", id, services::start_service);
                    } else {
                        debug!("Not starting {}, it is disabled, masked or active", id);
                    }
                }
                Event::Stop(id) => self.run_on_worker("STOP", id, |run_info, id| {
                    services::stop_service(run_info, id).map(|_| ())
                }),
                Event::Restart(id) => {
                    if !self.shutting_down {
                        self.run_on_worker("RESTART", id, services::restart_service);
                    }
                }
                Event::Reload(id) => self.run_on_worker("RELOAD", id, services::reload_service),
                Event::StatusChange { id, from, to } => {
                    trace!("{} went from {} to {}", id, from, to);
                    if to == ServiceState::Stopped && !self.shutting_down {
                        self.rearm_activation(id);
                    }
                }
                Event::WatchdogTrigger(id) => services::handle_watchdog_trigger(&self.run_info, id),
                Event::SocketActivation(id) => {
                    if self.shutting_down {
                        continue;
                    }
                    if self.service_is_startable(id) {
                        info!("service={} event=SOCKET_ACTIVATION", id);
                        self.run_on_worker("SOCKET_ACTIVATION", id, services::start_service);
                    } else {
                        debug!("Ignoring activation of {}", id);
                    }
                }
                Event::ChildExited { pid, termination } => self.child_exited(pid, termination),
                Event::Reap => self.reap(),
                Event::ServiceAdded(id) => self.register_service(id),
                Event::ServiceRemoved { name, fds } => {
                    for fd in fds {
                        let stale = match self.sources.get(&fd) {
                            Some(Source::Notify(id)) | Some(Source::Activation(id)) => {
                                self.run_info.registry.get(*id).is_err()
                            }
                            _ => false,
                        };
                        if stale {
                            self.unregister(fd);
                        }
                    }
                    debug!("Forgot sockets of removed service {}", name);
                }
                Event::EmergencyShutdown(reason) => {
                    error!("event=EMERGENCY_SHUTDOWN reason={}", reason);
                    self.begin_shutdown(ExitReason::Emergency);
                }
                Event::Shutdown => {
                    info!("event=SHUTDOWN");
                    self.begin_shutdown(ExitReason::Graceful);
                }
            }
        }
    }
}
