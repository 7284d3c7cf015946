//! Typed events flowing into the event loop. Anyone can push, only the loop drains.

use crate::platform::EventFd;
use crate::units::{ChildTermination, ServiceId, ServiceState};

use std::collections::VecDeque;
use std::os::unix::io::RawFd;
use std::sync::Mutex;

#[derive(Clone, Debug, PartialEq)]
pub enum Event {
    Start(ServiceId),
    Stop(ServiceId),
    Restart(ServiceId),
    Reload(ServiceId),
    StatusChange {
        id: ServiceId,
        from: ServiceState,
        to: ServiceState,
    },
    WatchdogTrigger(ServiceId),
    SocketActivation(ServiceId),
    ChildExited {
        pid: nix::unistd::Pid,
        termination: ChildTermination,
    },
    /// Look for exited children even if no SIGCHLD was seen
    Reap,
    ServiceAdded(ServiceId),
    ServiceRemoved {
        name: String,
        fds: Vec<RawFd>,
    },
    EmergencyShutdown(String),
    Shutdown,
}

impl Event {
    pub fn name(&self) -> &'static str {
        match self {
            Event::Start(_) => "START",
            Event::Stop(_) => "STOP",
            Event::Restart(_) => "RESTART",
            Event::Reload(_) => "RELOAD",
            Event::StatusChange { .. } => "STATUS_CHANGE",
            Event::WatchdogTrigger(_) => "WATCHDOG_TRIGGER",
            Event::SocketActivation(_) => "SOCKET_ACTIVATION",
            Event::ChildExited { .. } => "CHILD_EXITED",
            Event::Reap => "REAP",
            Event::ServiceAdded(_) => "SERVICE_ADDED",
            Event::ServiceRemoved { .. } => "SERVICE_REMOVED",
            Event::EmergencyShutdown(_) => "EMERGENCY_SHUTDOWN",
            Event::Shutdown => "SHUTDOWN",
        }
    }
}

/// Unbounded queue with a pollable wakeup. Pushing never blocks on the consumer.
pub struct EventQueue {
    queue: Mutex<VecDeque<Event>>,
    waker: EventFd,
}

impl EventQueue {
    pub fn new() -> Result<EventQueue, String> {
        Ok(EventQueue {
            queue: Mutex::new(VecDeque::new()),
            waker: EventFd::new()?,
        })
    }

    pub fn push(&self, event: Event) {
        {
            let mut queue = match self.queue.lock() {
                Ok(queue) => queue,
                Err(poisoned) => poisoned.into_inner(),
            };
            queue.push_back(event);
        }
        self.waker.notify();
    }

    pub fn drain(&self) -> Vec<Event> {
        self.waker.reset();
        let mut queue = match self.queue.lock() {
            Ok(queue) => queue,
            Err(poisoned) => poisoned.into_inner(),
        };
        queue.drain(..).collect()
    }

    pub fn len(&self) -> usize {
        match self.queue.lock() {
            Ok(queue) => queue.len(),
            Err(poisoned) => poisoned.into_inner().len(),
        }
    }

    pub fn wake_fd(&self) -> RawFd {
        self.waker.read_end()
    }
}
