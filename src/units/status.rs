use serde::Serialize;
use std::fmt;

#[derive(Clone, Copy, Eq, PartialEq, Hash, Debug, Serialize)]
pub enum ServiceState {
    Stopped,
    Starting,
    Running,
    Reloading,
    Stopping,
    Restarting,
    Failed,
    Maintenance,
}

impl ServiceState {
    /// Exactly these states carry a main pid
    pub fn has_process(&self) -> bool {
        match self {
            ServiceState::Starting
            | ServiceState::Running
            | ServiceState::Stopping
            | ServiceState::Reloading => true,
            _ => false,
        }
    }

    pub fn is_inactive(&self) -> bool {
        match self {
            ServiceState::Stopped | ServiceState::Failed | ServiceState::Maintenance => true,
            _ => false,
        }
    }

    pub fn is_running(&self) -> bool {
        match self {
            ServiceState::Running | ServiceState::Reloading => true,
            _ => false,
        }
    }

    pub fn can_transition_to(&self, next: ServiceState) -> bool {
        use ServiceState::*;
        if next == Failed {
            // unrecoverable errors can hit a service in any state except maintenance
            return *self != Maintenance && *self != Failed;
        }
        match (self, next) {
            (Stopped, Starting) | (Stopped, Maintenance) => true,
            (Failed, Starting) | (Failed, Maintenance) => true,
            // adopting an already running process after a restart of the supervisor
            (Stopped, Running) => true,
            (Starting, Running) | (Starting, Stopping) | (Starting, Stopped) => true,
            (Starting, Restarting) => true,
            (Running, Stopping) | (Running, Reloading) | (Running, Restarting) => true,
            (Running, Stopped) => true,
            (Reloading, Running) | (Reloading, Stopping) | (Reloading, Restarting) => true,
            (Reloading, Stopped) => true,
            (Stopping, Stopped) => true,
            (Restarting, Starting) | (Restarting, Stopped) => true,
            (Maintenance, Stopped) => true,
            _ => false,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ServiceState::Stopped => "STOPPED",
            ServiceState::Starting => "STARTING",
            ServiceState::Running => "RUNNING",
            ServiceState::Reloading => "RELOADING",
            ServiceState::Stopping => "STOPPING",
            ServiceState::Restarting => "RESTARTING",
            ServiceState::Failed => "FAILED",
            ServiceState::Maintenance => "MAINTENANCE",
        }
    }
}

impl fmt::Display for ServiceState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a child process ended
#[derive(Clone, Copy, Eq, PartialEq, Debug)]
pub enum ChildTermination {
    Signal(nix::sys::signal::Signal),
    Exit(i32),
    /// An adopted process that is not our child disappeared. Its status can not be collected.
    Vanished,
}

impl ChildTermination {
    pub fn success(&self) -> bool {
        *self == ChildTermination::Exit(0)
    }
}

impl fmt::Display for ChildTermination {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ChildTermination::Signal(sig) => write!(f, "signal {}", sig),
            ChildTermination::Exit(code) => write!(f, "exit code {}", code),
            ChildTermination::Vanished => write!(f, "vanished"),
        }
    }
}

#[derive(Clone, Copy, Eq, PartialEq, Debug)]
pub enum Operation {
    Start,
    Stop,
    Reload,
}
