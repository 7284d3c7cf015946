//! All the different parts of supervising service processes.
//! 1. Preparing and forking (start_service, fork_child)
//! 1. Signaling the process group (kill_service)
//! 1. The state machine driving start/stop/restart/reload (supervisor)
//! 1. Deciding about restarts (restart_policy)
//! 1. Messages from the services (notifications)

mod fork_child;
mod kill_service;
pub mod notifications;
mod pre_exec;
pub mod restart_policy;
mod start_service;
mod supervisor;

pub use kill_service::{process_exists, signal_main_process, signal_process_group};
pub use pre_exec::{PreExecHook, UmaskHook};
pub use start_service::LISTEN_FDS_START;
pub use supervisor::*;

/// Exit status of a child that failed before the exec, e.g. in a pre-exec hook
pub const CHILD_SETUP_FAILED_EXIT: i32 = 125;
/// Exit status of a child whose exec failed
pub const CHILD_EXEC_FAILED_EXIT: i32 = 127;
