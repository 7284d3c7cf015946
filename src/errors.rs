//! The error taxonomy every supervision operation reports with.
//!
//! Configuration and dependency errors are returned synchronously and are never retried.
//! Failures of running processes are not errors in this sense, they only show up as state changes.

use nix::errno::Errno;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SupervisorError {
    #[error("Service not found: {0}")]
    NotFound(String),
    #[error("Service already exists: {0}")]
    AlreadyExists(String),
    #[error("Service {name} is {state} and cannot {operation}")]
    InvalidState {
        name: String,
        state: String,
        operation: &'static str,
    },
    #[error("Dependency cycle: {}", .0.join(" -> "))]
    DependencyCycle(Vec<String>),
    #[error("Dependency {dependency} of {name} could not be started")]
    DependencyFailure { name: String, dependency: String },
    #[error("Conflicting service {conflict} of {name} did not stop in time")]
    ConflictUnresolved { name: String, conflict: String },
    #[error("Timeout while {0}")]
    Timeout(String),
    #[error("Resources exhausted: {0}")]
    ResourceExhausted(String),
    #[error("Permission denied: {0}")]
    PermissionDenied(String),
    #[error("System call failed: {0}")]
    SystemFailure(String),
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
}

pub type Result<T> = std::result::Result<T, SupervisorError>;

impl SupervisorError {
    /// Stable numeric code, used as the jsonrpc error code on the control socket
    pub fn code(&self) -> i64 {
        match self {
            SupervisorError::NotFound(_) => 1,
            SupervisorError::AlreadyExists(_) => 2,
            SupervisorError::InvalidState { .. } => 3,
            SupervisorError::DependencyCycle(_) => 4,
            SupervisorError::DependencyFailure { .. } => 5,
            SupervisorError::ConflictUnresolved { .. } => 6,
            SupervisorError::Timeout(_) => 7,
            SupervisorError::ResourceExhausted(_) => 8,
            SupervisorError::PermissionDenied(_) => 9,
            SupervisorError::SystemFailure(_) => 10,
            SupervisorError::InvalidConfig(_) => 11,
            SupervisorError::InvalidArgument(_) => 12,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            SupervisorError::NotFound(_) => "NotFound",
            SupervisorError::AlreadyExists(_) => "AlreadyExists",
            SupervisorError::InvalidState { .. } => "InvalidState",
            SupervisorError::DependencyCycle(_) => "DependencyCycle",
            SupervisorError::DependencyFailure { .. } => "DependencyFailure",
            SupervisorError::ConflictUnresolved { .. } => "ConflictUnresolved",
            SupervisorError::Timeout(_) => "Timeout",
            SupervisorError::ResourceExhausted(_) => "ResourceExhausted",
            SupervisorError::PermissionDenied(_) => "PermissionDenied",
            SupervisorError::SystemFailure(_) => "SystemFailure",
            SupervisorError::InvalidConfig(_) => "InvalidConfig",
            SupervisorError::InvalidArgument(_) => "InvalidArgument",
        }
    }

    pub fn from_errno(context: &str, errno: Errno) -> Self {
        let msg = format!("{}: {}", context, errno);
        match errno {
            Errno::EAGAIN | Errno::ENOMEM | Errno::EMFILE | Errno::ENFILE => {
                SupervisorError::ResourceExhausted(msg)
            }
            Errno::EPERM | Errno::EACCES => SupervisorError::PermissionDenied(msg),
            _ => SupervisorError::SystemFailure(msg),
        }
    }

    pub fn from_io(context: &str, err: &std::io::Error) -> Self {
        match err.raw_os_error() {
            Some(raw) => Self::from_errno(context, Errno::from_i32(raw)),
            None => SupervisorError::SystemFailure(format!("{}: {}", context, err)),
        }
    }
}

impl From<Errno> for SupervisorError {
    fn from(errno: Errno) -> Self {
        Self::from_errno("syscall", errno)
    }
}

impl From<std::io::Error> for SupervisorError {
    fn from(err: std::io::Error) -> Self {
        Self::from_io("io", &err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errno_mapping() {
        assert_eq!(
            SupervisorError::from(Errno::EAGAIN).kind(),
            "ResourceExhausted"
        );
        assert_eq!(
            SupervisorError::from(Errno::ENOMEM).kind(),
            "ResourceExhausted"
        );
        assert_eq!(SupervisorError::from(Errno::EPERM).kind(), "PermissionDenied");
        assert_eq!(SupervisorError::from(Errno::EBADF).kind(), "SystemFailure");
    }

    #[test]
    fn cycle_display() {
        let err = SupervisorError::DependencyCycle(vec!["a".into(), "b".into(), "a".into()]);
        assert_eq!(format!("{}", err), "Dependency cycle: a -> b -> a");
    }
}
