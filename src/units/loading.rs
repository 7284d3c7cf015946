//! Loading unit files into the registry.
//!
//! A unit file is a toml file named `<service name>.toml`:
//! ```toml
//! [service]
//! exec = "/usr/bin/daemon --foreground"
//! type = "notify"
//! requires = ["network"]
//! restart = "on-failure"
//! watchdog_interval_ms = 5000
//!
//! [limits]
//! open_files = 1024
//! ```

use super::dependency_resolving::{self, DeclaredDependencies};
use super::*;
use crate::errors::{Result, SupervisorError};
use crate::event_loop::Event;

use log::{trace, warn};
use serde::Deserialize;
use std::os::unix::net::{UnixDatagram, UnixListener};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct UnitFile {
    service: ServiceSection,
    #[serde(default)]
    limits: ResourceLimits,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ServiceSection {
    exec: String,
    #[serde(default, rename = "type")]
    service_type: ServiceType,
    #[serde(default)]
    requires: Vec<String>,
    #[serde(default)]
    wants: Vec<String>,
    #[serde(default)]
    conflicts: Vec<String>,
    #[serde(default)]
    before: Vec<String>,
    #[serde(default)]
    after: Vec<String>,
    working_directory: Option<PathBuf>,
    #[serde(default)]
    environment: Vec<String>,
    user: Option<String>,
    group: Option<String>,
    stdout: Option<PathBuf>,
    stderr: Option<PathBuf>,
    #[serde(default)]
    restart: RestartPolicy,
    restart_delay_ms: Option<u64>,
    start_timeout_ms: Option<u64>,
    stop_timeout_ms: Option<u64>,
    reload_timeout_ms: Option<u64>,
    watchdog_interval_ms: Option<u64>,
    reload_signal: Option<String>,
    #[serde(default)]
    sockets: Vec<PathBuf>,
    #[serde(default)]
    socket_activated: bool,
    enabled: Option<bool>,
    #[serde(default)]
    masked: bool,
    #[serde(default)]
    critical: bool,
}

fn millis_or(value: Option<u64>, default: Duration) -> Duration {
    value.map(Duration::from_millis).unwrap_or(default)
}

impl std::convert::TryFrom<UnitFile> for ServiceConfig {
    type Error = SupervisorError;

    fn try_from(file: UnitFile) -> Result<ServiceConfig> {
        let srvc = file.service;
        let mut conf = ServiceConfig::new(Commandline::parse(&srvc.exec)?);
        conf.service_type = srvc.service_type;
        conf.requires = srvc.requires;
        conf.wants = srvc.wants;
        conf.conflicts = srvc.conflicts;
        conf.before = srvc.before;
        conf.after = srvc.after;
        conf.working_directory = srvc.working_directory;
        conf.environment = srvc
            .environment
            .iter()
            .map(|entry| parse_environment_entry(entry))
            .collect::<Result<Vec<_>>>()?;
        conf.user = srvc.user;
        conf.group = srvc.group;
        conf.stdout = srvc.stdout;
        conf.stderr = srvc.stderr;
        conf.limits = file.limits;
        conf.restart = srvc.restart;
        conf.restart_delay = millis_or(srvc.restart_delay_ms, DEFAULT_RESTART_DELAY);
        conf.start_timeout = millis_or(srvc.start_timeout_ms, DEFAULT_TIMEOUT);
        conf.stop_timeout = millis_or(srvc.stop_timeout_ms, DEFAULT_TIMEOUT);
        conf.reload_timeout = millis_or(srvc.reload_timeout_ms, DEFAULT_TIMEOUT);
        conf.watchdog_interval = match srvc.watchdog_interval_ms {
            Some(0) => {
                return Err(SupervisorError::InvalidConfig(
                    "watchdog_interval_ms must not be zero".into(),
                ))
            }
            other => other.map(Duration::from_millis),
        };
        if let Some(signal) = srvc.reload_signal {
            conf.reload_signal = nix::sys::signal::Signal::from_str(&signal).map_err(|_| {
                SupervisorError::InvalidConfig(format!("Unknown reload signal: {}", signal))
            })?;
        }
        if srvc.socket_activated && srvc.sockets.is_empty() {
            return Err(SupervisorError::InvalidConfig(
                "socket_activated is set but no sockets are configured".into(),
            ));
        }
        conf.sockets = srvc.sockets;
        conf.socket_activated = srvc.socket_activated;
        conf.enabled = srvc.enabled.unwrap_or(true);
        conf.masked = srvc.masked;
        conf.critical = srvc.critical;
        conf.dedup_dependencies();
        Ok(conf)
    }
}

pub fn parse_unit(content: &str, path: &Path) -> Result<ServiceConfig> {
    use std::convert::TryInto;
    let file: UnitFile = toml::from_str(content).map_err(|e| {
        SupervisorError::InvalidConfig(format!("Error while parsing {:?}: {}", path, e))
    })?;
    file.try_into()
}

fn service_name_from_path(path: &Path) -> Result<String> {
    path.file_stem()
        .and_then(|stem| stem.to_str())
        .map(|stem| stem.to_owned())
        .ok_or_else(|| SupervisorError::InvalidArgument(format!("Bad unit file name: {:?}", path)))
}

pub fn read_unit_file(path: &Path) -> Result<(String, ServiceConfig)> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| SupervisorError::from_io(&format!("reading {:?}", path), &e))?;
    let name = service_name_from_path(path)?;
    let conf = parse_unit(&content, path)?;
    Ok((name, conf))
}

/// Parse every `*.toml` file in the given directories. Fails on the first broken file.
pub fn parse_all_units(dirs: &[PathBuf]) -> Result<Vec<(String, ServiceConfig)>> {
    let mut units: Vec<(String, ServiceConfig)> = Vec::new();
    for dir in dirs {
        if !dir.exists() {
            warn!("Unit directory {:?} does not exist", dir);
            continue;
        }
        let entries = std::fs::read_dir(dir)
            .map_err(|e| SupervisorError::from_io(&format!("listing {:?}", dir), &e))?;
        let mut paths: Vec<PathBuf> = entries
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|path| path.is_file() && path.extension().map_or(false, |ext| ext == "toml"))
            .collect();
        paths.sort();
        for path in paths {
            let (name, conf) = read_unit_file(&path)?;
            if units.iter().any(|(other, _)| *other == name) {
                return Err(SupervisorError::InvalidConfig(format!(
                    "Service {} is defined more than once (last seen in {:?})",
                    name, path
                )));
            }
            trace!("Service found: {} in {:?}", name, path);
            units.push((name, conf));
        }
    }
    Ok(units)
}

pub fn notify_socket_path(notifications_dir: &Path, name: &str) -> PathBuf {
    notifications_dir.join(format!("{}.notify_socket", name))
}

fn remove_stale_socket(path: &Path) -> Result<()> {
    if path.exists() {
        std::fs::remove_file(path)
            .map_err(|e| SupervisorError::from_io(&format!("removing {:?}", path), &e))?;
    }
    Ok(())
}

fn open_service_sockets(
    notifications_dir: &Path,
    name: &str,
    conf: &ServiceConfig,
) -> Result<ServiceSockets> {
    std::fs::create_dir_all(notifications_dir)
        .map_err(|e| SupervisorError::from_io(&format!("creating {:?}", notifications_dir), &e))?;
    let notify_path = notify_socket_path(notifications_dir, name);
    remove_stale_socket(&notify_path)?;
    let notify = UnixDatagram::bind(&notify_path)
        .map_err(|e| SupervisorError::from_io(&format!("binding {:?}", notify_path), &e))?;
    notify
        .set_nonblocking(true)
        .map_err(|e| SupervisorError::from_io("setting notify socket nonblocking", &e))?;

    let mut listeners = Vec::new();
    for path in &conf.sockets {
        remove_stale_socket(path)?;
        let listener = UnixListener::bind(path)
            .map_err(|e| SupervisorError::from_io(&format!("binding {:?}", path), &e))?;
        listeners.push((path.clone(), listener));
    }

    Ok(ServiceSockets {
        notify_path: Some(notify_path),
        notify: Some(notify),
        listeners,
    })
}

/// Create a service with its sockets. Dependencies are not checked here.
pub fn insert_service(
    registry: &Registry,
    notifications_dir: &Path,
    name: &str,
    conf: ServiceConfig,
) -> Result<ServiceId> {
    if registry.lookup(name).is_ok() {
        return Err(SupervisorError::AlreadyExists(name.to_owned()));
    }
    let sockets = open_service_sockets(notifications_dir, name, &conf)?;
    let id = registry.create_with_sockets(name, conf, sockets)?;
    registry.events().push(Event::ServiceAdded(id));
    Ok(id)
}

/// Validate a set of services as a whole and insert all of them
pub fn load_services(
    registry: &Registry,
    notifications_dir: &Path,
    units: Vec<(String, ServiceConfig)>,
) -> Result<Vec<ServiceId>> {
    let mut graph = registry.dependency_graph();
    for (name, conf) in &units {
        if graph.contains(name) {
            return Err(SupervisorError::AlreadyExists(name.clone()));
        }
        graph.insert(name, DeclaredDependencies::from_config(conf));
    }
    dependency_resolving::validate(&graph)?;

    let mut ids = Vec::new();
    for (name, conf) in units {
        ids.push(insert_service(registry, notifications_dir, &name, conf)?);
    }
    Ok(ids)
}

/// Load a single unit file into a running registry
pub fn load_unit_file(
    registry: &Registry,
    notifications_dir: &Path,
    path: &Path,
) -> Result<ServiceId> {
    let (name, conf) = read_unit_file(path)?;
    let mut ids = load_services(registry, notifications_dir, vec![(name, conf)])?;
    ids.pop()
        .ok_or_else(|| SupervisorError::SystemFailure("service vanished while loading".into()))
}

/// Replace the declared config of a service. On any error nothing changes.
/// A running service keeps running, the new config applies from the next start on.
pub fn apply_config(registry: &Registry, id: ServiceId, mut conf: ServiceConfig) -> Result<()> {
    let service = registry.get(id)?;
    conf.dedup_dependencies();
    if conf.sockets != service.config().sockets {
        return Err(SupervisorError::InvalidConfig(
            "sockets of a loaded service can not be changed".into(),
        ));
    }
    let graph = registry
        .dependency_graph()
        .with_replaced(&service.name, DeclaredDependencies::from_config(&conf));
    dependency_resolving::validate(&graph)?;
    service.replace_config(conf);
    trace!("Applied new config to {}", service.name);
    Ok(())
}

/// Remove an inactive service nobody depends on
pub fn remove_service(registry: &Registry, id: ServiceId) -> Result<()> {
    let service = registry.get(id)?;
    dependency_resolving::validate_without(&registry.dependency_graph(), &service.name)?;
    let service = registry.remove(id)?;

    let mut fds = service.listener_fds();
    if let Some(fd) = service.notify_fd() {
        fds.push(fd);
    }
    registry.events().push(Event::ServiceRemoved {
        name: service.name.clone(),
        fds,
    });
    let paths = service
        .sockets
        .notify_path
        .iter()
        .chain(service.sockets.listeners.iter().map(|(path, _)| path));
    for path in paths {
        if let Err(e) = std::fs::remove_file(path) {
            warn!(
                "Could not remove socket {:?} of removed service {}: {}",
                path, service.name, e
            );
        }
    }
    Ok(())
}
