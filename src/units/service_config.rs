use crate::errors::{Result, SupervisorError};

use nix::sys::signal::Signal;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_RESTART_DELAY: Duration = Duration::from_secs(1);
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(90);

#[derive(Clone, Copy, Eq, PartialEq, Debug, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ServiceType {
    Simple,
    Notify,
    Oneshot,
}

impl Default for ServiceType {
    fn default() -> Self {
        ServiceType::Simple
    }
}

#[derive(Clone, Copy, Eq, PartialEq, Debug, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum RestartPolicy {
    Never,
    OnFailure,
    Always,
    OnWatchdog,
    OnAbnormal,
}

impl Default for RestartPolicy {
    fn default() -> Self {
        RestartPolicy::Never
    }
}

#[derive(Clone, Eq, PartialEq, Debug)]
pub struct Commandline {
    pub cmd: String,
    pub args: Vec<String>,
}

impl Commandline {
    pub fn parse(line: &str) -> Result<Commandline> {
        let mut words = shlex::split(line).ok_or_else(|| {
            SupervisorError::InvalidConfig(format!("Malformed quoting in exec line: {}", line))
        })?;
        if words.is_empty() {
            return Err(SupervisorError::InvalidConfig("Exec line is empty".into()));
        }
        let cmd = words.remove(0);
        Ok(Commandline { cmd, args: words })
    }

    /// Resolve the program to an absolute path. Relative names are looked up in PATH.
    pub fn resolve_program(&self) -> Result<PathBuf> {
        if self.cmd.contains('/') {
            Ok(PathBuf::from(&self.cmd))
        } else {
            which::which(&self.cmd).map_err(|e| {
                SupervisorError::SystemFailure(format!(
                    "Could not find executable {}: {}",
                    self.cmd, e
                ))
            })
        }
    }
}

impl std::fmt::Display for Commandline {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.write_str(&self.cmd)?;
        for arg in &self.args {
            write!(f, " {}", arg)?;
        }
        Ok(())
    }
}

/// Limits applied in the child right before the exec
#[derive(Clone, Default, Eq, PartialEq, Debug, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct ResourceLimits {
    /// address space limit in bytes
    pub memory: Option<u64>,
    pub open_files: Option<u64>,
    pub tasks: Option<u64>,
    pub nice: Option<i32>,
    pub cpu_affinity: Vec<usize>,
}

impl ResourceLimits {
    pub fn is_empty(&self) -> bool {
        self == &ResourceLimits::default()
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct ServiceConfig {
    pub exec: Commandline,
    pub service_type: ServiceType,

    pub requires: Vec<String>,
    pub wants: Vec<String>,
    pub conflicts: Vec<String>,
    pub before: Vec<String>,
    pub after: Vec<String>,

    pub working_directory: Option<PathBuf>,
    pub environment: Vec<(String, String)>,
    pub user: Option<String>,
    pub group: Option<String>,
    pub stdout: Option<PathBuf>,
    pub stderr: Option<PathBuf>,
    pub limits: ResourceLimits,

    pub restart: RestartPolicy,
    pub restart_delay: Duration,
    pub start_timeout: Duration,
    pub stop_timeout: Duration,
    pub reload_timeout: Duration,
    pub watchdog_interval: Option<Duration>,
    pub reload_signal: Signal,

    pub sockets: Vec<PathBuf>,
    pub socket_activated: bool,

    pub enabled: bool,
    pub masked: bool,
    pub critical: bool,
}

impl ServiceConfig {
    pub fn new(exec: Commandline) -> Self {
        ServiceConfig {
            exec,
            service_type: ServiceType::Simple,
            requires: Vec::new(),
            wants: Vec::new(),
            conflicts: Vec::new(),
            before: Vec::new(),
            after: Vec::new(),
            working_directory: None,
            environment: Vec::new(),
            user: None,
            group: None,
            stdout: None,
            stderr: None,
            limits: ResourceLimits::default(),
            restart: RestartPolicy::Never,
            restart_delay: DEFAULT_RESTART_DELAY,
            start_timeout: DEFAULT_TIMEOUT,
            stop_timeout: DEFAULT_TIMEOUT,
            reload_timeout: DEFAULT_TIMEOUT,
            watchdog_interval: None,
            reload_signal: Signal::SIGHUP,
            sockets: Vec::new(),
            socket_activated: false,
            enabled: true,
            masked: false,
            critical: false,
        }
    }

    /// Every name this service references in its dependency declarations
    pub fn referenced_names(&self) -> impl Iterator<Item = &String> {
        self.requires
            .iter()
            .chain(self.wants.iter())
            .chain(self.conflicts.iter())
            .chain(self.before.iter())
            .chain(self.after.iter())
    }

    pub fn dedup_dependencies(&mut self) {
        for list in &mut [
            &mut self.requires,
            &mut self.wants,
            &mut self.conflicts,
            &mut self.before,
            &mut self.after,
        ] {
            list.sort();
            list.dedup();
        }
    }
}

pub fn parse_environment_entry(entry: &str) -> Result<(String, String)> {
    match entry.find('=') {
        Some(pos) if pos > 0 => Ok((entry[..pos].to_owned(), entry[pos + 1..].to_owned())),
        _ => Err(SupervisorError::InvalidConfig(format!(
            "Environment entry must be KEY=VALUE, got: {}",
            entry
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn commandline_quoting() {
        let cmd = Commandline::parse("/bin/sh -c 'echo hello world'").unwrap();
        assert_eq!(cmd.cmd, "/bin/sh");
        assert_eq!(cmd.args, vec!["-c".to_owned(), "echo hello world".to_owned()]);

        assert!(Commandline::parse("").is_err());
        assert!(Commandline::parse("/bin/sh -c 'unterminated").is_err());
    }

    #[test]
    fn environment_entries() {
        assert_eq!(
            parse_environment_entry("A=b=c").unwrap(),
            ("A".to_owned(), "b=c".to_owned())
        );
        assert!(parse_environment_entry("=x").is_err());
        assert!(parse_environment_entry("novalue").is_err());
    }
}
