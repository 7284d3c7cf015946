//! The RuntimeInfo encapsulates all information neoinit needs to do its job: the registry of services,
//! the event queue, the config, and the cancellation token of the event loop.
//! In the lifetime of neoinit there will only ever be one RuntimeInfo which is passed around as an ArcRuntimeInfo.

use crate::config::Config;
use crate::event_loop::{CancellationToken, Event, EventQueue};
use crate::services::PreExecHook;
use crate::units::{locking, Registry};

use std::sync::{Arc, Mutex, RwLock};

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ExitReason {
    Graceful,
    /// A critical service exhausted its restart budget
    Emergency,
}

/// Exit status of the supervisor after an emergency shutdown
pub const EMERGENCY_EXIT_CODE: i32 = 3;

impl ExitReason {
    pub fn exit_code(&self) -> i32 {
        match self {
            ExitReason::Graceful => 0,
            ExitReason::Emergency => EMERGENCY_EXIT_CODE,
        }
    }
}

/// This will be passed through to all the different threads as a central state struct
pub struct RuntimeInfo {
    pub registry: Registry,
    pub events: Arc<EventQueue>,
    pub config: Config,
    pub cancel: CancellationToken,
    hooks: RwLock<Vec<Arc<dyn PreExecHook>>>,
    exit_reason: Mutex<Option<ExitReason>>,
}

pub type ArcRuntimeInfo = Arc<RuntimeInfo>;

impl RuntimeInfo {
    pub fn new(config: Config) -> Result<ArcRuntimeInfo, String> {
        let events = Arc::new(EventQueue::new()?);
        Ok(Arc::new(RuntimeInfo {
            registry: Registry::new(events.clone()),
            events,
            config,
            cancel: CancellationToken::new()?,
            hooks: RwLock::new(Vec::new()),
            exit_reason: Mutex::new(None),
        }))
    }

    pub fn push_event(&self, event: Event) {
        self.events.push(event);
    }

    /// Hooks run in every service's child process right before the exec
    pub fn add_pre_exec_hook(&self, hook: Arc<dyn PreExecHook>) {
        locking::write(&self.hooks).push(hook);
    }

    pub fn pre_exec_hooks(&self) -> Vec<Arc<dyn PreExecHook>> {
        locking::read(&self.hooks).clone()
    }

    /// The first reason set wins, an emergency can not be downgraded by a later graceful shutdown
    pub fn set_exit_reason(&self, reason: ExitReason) {
        let mut current = locking::lock(&self.exit_reason);
        match *current {
            Some(ExitReason::Emergency) => {}
            _ => *current = Some(reason),
        }
    }

    pub fn exit_reason(&self) -> Option<ExitReason> {
        *locking::lock(&self.exit_reason)
    }
}
