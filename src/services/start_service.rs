//! Parent side of starting a service process: everything the child needs is prepared here,
//! before the fork, so the child only has to do async-signal-safe work.

use super::fork_child;
use super::PreExecHook;
use crate::errors::{Result, SupervisorError};
use crate::platform::{self, proc_scan::SERVICE_MARKER_VAR, Credentials};
use crate::units::{ResourceLimits, Service, ServiceConfig};

use nix::unistd::{ForkResult, Gid, Group, Pid, Uid, User};
use std::ffi::CString;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::io::RawFd;
use std::sync::Arc;

/// Passed sockets start at this fd, 0,1,2 are stdin,stdout,stderr
pub const LISTEN_FDS_START: RawFd = 3;
pub const MAX_LISTEN_FDS: usize = 64;
pub(super) const LISTEN_PID_PREFIX: &[u8] = b"LISTEN_PID=";

const MANAGED_VARS: &[&str] = &[
    "NOTIFY_SOCKET",
    "LISTEN_FDS",
    "LISTEN_PID",
    "LISTEN_FDNAMES",
    "WATCHDOG_USEC",
    "WATCHDOG_PID",
    SERVICE_MARKER_VAR,
];

pub struct SpawnPlan {
    pub(super) program: CString,
    _argv: Vec<CString>,
    pub(super) argv_ptrs: Vec<*const libc::c_char>,
    _envp: Vec<CString>,
    pub(super) envp_ptrs: Vec<*const libc::c_char>,
    /// LISTEN_PID has to contain the pid of the child, it is filled in after the fork
    pub(super) listen_pid_buf: Option<(usize, Box<[u8; 32]>)>,
    pub(super) working_directory: Option<CString>,
    pub(super) devnull: CString,
    pub(super) stdout: Option<CString>,
    pub(super) stderr: Option<CString>,
    pub(super) listen_fds: Vec<RawFd>,
    pub(super) limits: ResourceLimits,
    #[cfg(target_os = "linux")]
    pub(super) cpu_set: Option<nix::sched::CpuSet>,
    pub(super) credentials: Option<Credentials>,
    pub(super) hooks: Vec<Arc<dyn PreExecHook>>,
}

fn cstring(what: &str, value: &[u8]) -> Result<CString> {
    CString::new(value)
        .map_err(|_| SupervisorError::InvalidConfig(format!("{} contains a nul byte", what)))
}

fn resolve_credentials(conf: &ServiceConfig) -> Result<Option<Credentials>> {
    if conf.user.is_none() && conf.group.is_none() {
        return Ok(None);
    }
    let user = match &conf.user {
        Some(name) => Some(
            User::from_name(name)
                .map_err(|e| SupervisorError::from_errno("looking up user", e))?
                .ok_or_else(|| SupervisorError::InvalidConfig(format!("Unknown user: {}", name)))?,
        ),
        None => None,
    };
    let gid = match &conf.group {
        Some(name) => {
            Group::from_name(name)
                .map_err(|e| SupervisorError::from_errno("looking up group", e))?
                .ok_or_else(|| SupervisorError::InvalidConfig(format!("Unknown group: {}", name)))?
                .gid
        }
        None => user
            .as_ref()
            .map(|u| u.gid)
            .unwrap_or_else(nix::unistd::getgid),
    };
    let uid: Uid = user
        .as_ref()
        .map(|u| u.uid)
        .unwrap_or_else(nix::unistd::getuid);

    if !nix::unistd::getuid().is_root() {
        if uid == nix::unistd::getuid() && gid == nix::unistd::getgid() {
            return Ok(None);
        }
        return Err(SupervisorError::PermissionDenied(format!(
            "only root can run services as uid {} gid {}",
            uid, gid
        )));
    }

    let supp_gids: Vec<Gid> = match &user {
        Some(user) => {
            let name = cstring("user name", user.name.as_bytes())?;
            nix::unistd::getgrouplist(&name, gid)
                .map_err(|e| SupervisorError::from_errno("getgrouplist", e))?
        }
        None => vec![gid],
    };
    Ok(Some(Credentials {
        uid,
        gid,
        supp_gids,
        can_set_groups: platform::can_drop_groups().map_err(SupervisorError::SystemFailure)?,
    }))
}

#[cfg(target_os = "linux")]
fn make_cpu_set(limits: &ResourceLimits) -> Result<Option<nix::sched::CpuSet>> {
    if limits.cpu_affinity.is_empty() {
        return Ok(None);
    }
    let mut set = nix::sched::CpuSet::new();
    for cpu in &limits.cpu_affinity {
        set.set(*cpu)
            .map_err(|_| SupervisorError::InvalidConfig(format!("Invalid cpu: {}", cpu)))?;
    }
    Ok(Some(set))
}

fn build_environment(service: &Service, conf: &ServiceConfig) -> Vec<(String, String)> {
    let mut vars: Vec<(String, String)> = std::env::vars()
        .filter(|(key, _)| !MANAGED_VARS.contains(&key.as_str()))
        .collect();
    for (key, value) in &conf.environment {
        vars.retain(|(existing, _)| existing != key);
        vars.push((key.clone(), value.clone()));
    }
    if let Some(path) = &service.sockets.notify_path {
        vars.push((
            "NOTIFY_SOCKET".to_owned(),
            path.to_string_lossy().into_owned(),
        ));
    }
    vars.push((SERVICE_MARKER_VAR.to_owned(), service.name.clone()));
    if let Some(interval) = conf.watchdog_interval {
        vars.push((
            "WATCHDOG_USEC".to_owned(),
            format!("{}", interval.as_micros()),
        ));
    }
    let listen_fds = service.listener_fds();
    if !listen_fds.is_empty() {
        vars.push(("LISTEN_FDS".to_owned(), format!("{}", listen_fds.len())));
        vars.push((
            "LISTEN_FDNAMES".to_owned(),
            service.listener_names().join(":"),
        ));
    }
    vars
}

pub fn prepare_spawn(
    service: &Service,
    conf: &ServiceConfig,
    hooks: Vec<Arc<dyn PreExecHook>>,
) -> Result<SpawnPlan> {
    let program_path = conf.exec.resolve_program()?;
    let program = cstring("program", program_path.as_os_str().as_bytes())?;

    let exec_name = program_path
        .file_name()
        .map(|name| name.as_bytes().to_vec())
        .unwrap_or_else(|| conf.exec.cmd.as_bytes().to_vec());
    let mut argv = vec![cstring("program", &exec_name)?];
    for word in &conf.exec.args {
        argv.push(cstring("argument", word.as_bytes())?);
    }
    let mut argv_ptrs: Vec<*const libc::c_char> = argv.iter().map(|arg| arg.as_ptr()).collect();
    argv_ptrs.push(std::ptr::null());

    let envp = build_environment(service, conf)
        .into_iter()
        .map(|(key, value)| cstring("environment", format!("{}={}", key, value).as_bytes()))
        .collect::<Result<Vec<_>>>()?;
    let mut envp_ptrs: Vec<*const libc::c_char> = envp.iter().map(|var| var.as_ptr()).collect();

    let listen_fds = service.listener_fds();
    if listen_fds.len() > MAX_LISTEN_FDS {
        return Err(SupervisorError::InvalidConfig(format!(
            "At most {} sockets can be passed to a service",
            MAX_LISTEN_FDS
        )));
    }
    let listen_pid_buf = if listen_fds.is_empty() {
        None
    } else {
        let mut buf = Box::new([0u8; 32]);
        buf[..LISTEN_PID_PREFIX.len()].copy_from_slice(LISTEN_PID_PREFIX);
        envp_ptrs.push(buf.as_ptr() as *const libc::c_char);
        Some((envp_ptrs.len() - 1, buf))
    };
    envp_ptrs.push(std::ptr::null());

    let path_cstring = |what: &str, path: &std::path::Path| cstring(what, path.as_os_str().as_bytes());
    Ok(SpawnPlan {
        program,
        _argv: argv,
        argv_ptrs,
        _envp: envp,
        envp_ptrs,
        listen_pid_buf,
        working_directory: conf
            .working_directory
            .as_ref()
            .map(|dir| path_cstring("working directory", dir))
            .transpose()?,
        devnull: cstring("devnull", b"/dev/null")?,
        stdout: conf
            .stdout
            .as_ref()
            .map(|path| path_cstring("stdout", path))
            .transpose()?,
        stderr: conf
            .stderr
            .as_ref()
            .map(|path| path_cstring("stderr", path))
            .transpose()?,
        listen_fds,
        limits: conf.limits.clone(),
        #[cfg(target_os = "linux")]
        cpu_set: make_cpu_set(&conf.limits)?,
        credentials: resolve_credentials(conf)?,
        hooks,
    })
}

/// Fork and exec the planned process. Returns the pid of the child in the parent.
pub fn spawn(plan: &mut SpawnPlan) -> Result<Pid> {
    match unsafe { nix::unistd::fork() } {
        Ok(ForkResult::Parent { child }) => Ok(child),
        Ok(ForkResult::Child) => fork_child::after_fork_child(plan),
        Err(e) => Err(SupervisorError::from_errno("fork", e)),
    }
}
