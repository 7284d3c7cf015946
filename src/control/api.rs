//! One synchronous entry point per control command. These run on the caller's thread and only return
//! once the operation finished. Unknown services are `NotFound` without side effects.

use crate::errors::Result;
use crate::event_loop::Event;
use crate::runtime_info::RuntimeInfo;
use crate::services::{self, StopOutcome};
use crate::units::{self, Service, ServiceState};

use chrono::{DateTime, Local};
use serde::Serialize;
use std::path::Path;
use std::time::{Instant, SystemTime};

#[derive(Serialize, Debug, Clone)]
pub struct StatusSnapshot {
    pub name: String,
    pub state: ServiceState,
    pub pid: Option<i32>,
    pub last_exit: Option<String>,
    pub started_at: Option<String>,
    pub stopped_at: Option<String>,
    pub seconds_in_state: u64,
    pub restart_attempts: u32,
    pub starts: u64,
    pub restarts: u64,
    pub failures: u64,
    pub watchdog_misses: u64,
    pub status_text: Option<String>,
    pub enabled: bool,
    pub masked: bool,
}

fn format_time(time: SystemTime) -> String {
    DateTime::<Local>::from(time).to_rfc3339()
}

fn snapshot(service: &Service) -> StatusSnapshot {
    let conf = service.config();
    let rt = service.lock_runtime();
    StatusSnapshot {
        name: service.name.clone(),
        state: rt.state,
        pid: rt.pid.map(|pid| pid.as_raw()),
        last_exit: rt.last_exit.map(|exit| exit.to_string()),
        started_at: rt.started_at.map(format_time),
        stopped_at: rt.stopped_at.map(format_time),
        seconds_in_state: Instant::now().duration_since(rt.state_since).as_secs(),
        restart_attempts: rt.restart_attempts,
        starts: rt.stats.starts,
        restarts: rt.stats.restarts,
        failures: rt.stats.failures,
        watchdog_misses: rt.stats.watchdog_misses,
        status_text: rt.status_text.clone(),
        enabled: conf.enabled,
        masked: conf.masked,
    }
}

pub fn start(run_info: &RuntimeInfo, name: &str) -> Result<()> {
    let id = run_info.registry.lookup(name)?;
    services::start_service(run_info, id)
}

pub fn stop(run_info: &RuntimeInfo, name: &str) -> Result<StopOutcome> {
    let id = run_info.registry.lookup(name)?;
    services::stop_service(run_info, id)
}

pub fn restart(run_info: &RuntimeInfo, name: &str) -> Result<()> {
    let id = run_info.registry.lookup(name)?;
    services::restart_service(run_info, id)
}

pub fn reload(run_info: &RuntimeInfo, name: &str) -> Result<()> {
    let id = run_info.registry.lookup(name)?;
    services::reload_service(run_info, id)
}

pub fn enable(run_info: &RuntimeInfo, name: &str) -> Result<()> {
    let id = run_info.registry.lookup(name)?;
    services::set_enabled(run_info, id, true)
}

pub fn disable(run_info: &RuntimeInfo, name: &str) -> Result<()> {
    let id = run_info.registry.lookup(name)?;
    services::set_enabled(run_info, id, false)
}

pub fn mask(run_info: &RuntimeInfo, name: &str) -> Result<()> {
    let id = run_info.registry.lookup(name)?;
    services::set_masked(run_info, id, true)
}

pub fn unmask(run_info: &RuntimeInfo, name: &str) -> Result<()> {
    let id = run_info.registry.lookup(name)?;
    services::set_masked(run_info, id, false)
}

pub fn ping(run_info: &RuntimeInfo, name: &str) -> Result<()> {
    let id = run_info.registry.lookup(name)?;
    services::ping_watchdog(run_info, id)
}

pub fn maintenance(run_info: &RuntimeInfo, name: &str, on: bool) -> Result<()> {
    let id = run_info.registry.lookup(name)?;
    services::set_maintenance(run_info, id, on)
}

pub fn status(run_info: &RuntimeInfo, name: &str) -> Result<StatusSnapshot> {
    let service = run_info.registry.get_by_name(name)?;
    Ok(snapshot(&service))
}

pub fn list(run_info: &RuntimeInfo) -> Vec<StatusSnapshot> {
    run_info
        .registry
        .services()
        .iter()
        .map(|service| snapshot(service))
        .collect()
}

/// Load a unit file into the running registry. Returns the name of the new service.
pub fn load(run_info: &RuntimeInfo, path: &Path) -> Result<String> {
    let id = units::load_unit_file(
        &run_info.registry,
        &run_info.config.notifications_dir,
        path,
    )?;
    let service = run_info.registry.get(id)?;
    Ok(service.name.clone())
}

pub fn unload(run_info: &RuntimeInfo, name: &str) -> Result<()> {
    let id = run_info.registry.lookup(name)?;
    units::remove_service(&run_info.registry, id)
}

pub fn shutdown(run_info: &RuntimeInfo) {
    run_info.push_event(Event::Shutdown);
}
