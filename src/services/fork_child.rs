//! Child side of starting a service process.
//!
//! DO NOT USE THE LOGGER HERE. It aquires a global lock which might be held at the time of forking
//! But since this is the only thread that is in the child process the lock will never be released!
//! The same goes for allocations, the allocator might be locked. Everything is prepared in the SpawnPlan.

use super::start_service::{SpawnPlan, LISTEN_FDS_START, LISTEN_PID_PREFIX, MAX_LISTEN_FDS};
use super::{CHILD_EXEC_FAILED_EXIT, CHILD_SETUP_FAILED_EXIT};

use std::ffi::CString;
use std::os::unix::io::RawFd;

fn abort_child(code: i32) -> ! {
    unsafe { libc::_exit(code) }
}

fn reset_signals() {
    unsafe {
        let mut set: libc::sigset_t = std::mem::zeroed();
        libc::sigemptyset(&mut set);
        libc::pthread_sigmask(libc::SIG_SETMASK, &set, std::ptr::null_mut());
        // the rust runtime ignores SIGPIPE and ignored signals survive the exec
        libc::signal(libc::SIGPIPE, libc::SIG_DFL);
    }
}

fn open_fd(path: &CString, flags: libc::c_int) -> Result<RawFd, ()> {
    let fd = unsafe { libc::open(path.as_ptr(), flags | libc::O_CLOEXEC, 0o644 as libc::c_uint) };
    if fd < 0 {
        Err(())
    } else {
        Ok(fd)
    }
}

fn setup_stdio(plan: &SpawnPlan) -> Result<(), ()> {
    let append = libc::O_WRONLY | libc::O_CREAT | libc::O_APPEND;
    let stdin = open_fd(&plan.devnull, libc::O_RDONLY)?;
    let stdout = match &plan.stdout {
        Some(path) => open_fd(path, append)?,
        None => open_fd(&plan.devnull, libc::O_WRONLY)?,
    };
    let stderr = match &plan.stderr {
        Some(path) => open_fd(path, append)?,
        None => open_fd(&plan.devnull, libc::O_WRONLY)?,
    };
    for (fd, target) in &[(stdin, 0), (stdout, 1), (stderr, 2)] {
        if *fd != *target && unsafe { libc::dup2(*fd, *target) } < 0 {
            return Err(());
        }
    }
    for fd in &[stdin, stdout, stderr] {
        if *fd > 2 {
            unsafe { libc::close(*fd) };
        }
    }
    Ok(())
}

/// Move the sockets to 3, 4, ... First everything is moved out of the way so no socket
/// gets clobbered while the others are moved into place.
fn dup_listen_fds(fds: &[RawFd]) -> Result<(), ()> {
    let count = fds.len();
    if count > MAX_LISTEN_FDS {
        return Err(());
    }
    let mut temps = [0 as RawFd; MAX_LISTEN_FDS];
    for (idx, fd) in fds.iter().enumerate() {
        let temp =
            unsafe { libc::fcntl(*fd, libc::F_DUPFD_CLOEXEC, LISTEN_FDS_START + count as RawFd) };
        if temp < 0 {
            return Err(());
        }
        temps[idx] = temp;
    }
    for (idx, temp) in temps[..count].iter().enumerate() {
        // the new fd does not inherit FD_CLOEXEC
        if unsafe { libc::dup2(*temp, LISTEN_FDS_START + idx as RawFd) } < 0 {
            return Err(());
        }
        unsafe { libc::close(*temp) };
    }
    Ok(())
}

/// Writes `LISTEN_PID=<pid>\0` into the buffer without allocating
pub(super) fn format_listen_pid(buf: &mut [u8; 32], pid: i32) {
    buf[..LISTEN_PID_PREFIX.len()].copy_from_slice(LISTEN_PID_PREFIX);
    let mut digits = [0u8; 12];
    let mut len = 0;
    let mut rest = pid.max(0) as u32;
    loop {
        digits[len] = b'0' + (rest % 10) as u8;
        rest /= 10;
        len += 1;
        if rest == 0 {
            break;
        }
    }
    let mut pos = LISTEN_PID_PREFIX.len();
    for digit in digits[..len].iter().rev() {
        buf[pos] = *digit;
        pos += 1;
    }
    buf[pos] = 0;
}

fn apply_limits(plan: &SpawnPlan) -> Result<(), ()> {
    let set_limit = |resource, value: u64| {
        let lim = libc::rlimit {
            rlim_cur: value as libc::rlim_t,
            rlim_max: value as libc::rlim_t,
        };
        if unsafe { libc::setrlimit(resource, &lim) } < 0 {
            Err(())
        } else {
            Ok(())
        }
    };
    if let Some(bytes) = plan.limits.memory {
        set_limit(libc::RLIMIT_AS, bytes)?;
    }
    if let Some(files) = plan.limits.open_files {
        set_limit(libc::RLIMIT_NOFILE, files)?;
    }
    if let Some(tasks) = plan.limits.tasks {
        set_limit(libc::RLIMIT_NPROC, tasks)?;
    }
    if let Some(nice) = plan.limits.nice {
        if unsafe { libc::setpriority(libc::PRIO_PROCESS, 0, nice) } < 0 {
            return Err(());
        }
    }
    #[cfg(target_os = "linux")]
    {
        if let Some(set) = &plan.cpu_set {
            nix::sched::sched_setaffinity(nix::unistd::Pid::from_raw(0), set).map_err(|_| ())?;
        }
    }
    Ok(())
}

pub fn after_fork_child(plan: &mut SpawnPlan) -> ! {
    reset_signals();

    // new session, this process becomes leader of its own process group
    if unsafe { libc::setsid() } < 0 {
        abort_child(CHILD_SETUP_FAILED_EXIT);
    }

    if setup_stdio(plan).is_err() {
        abort_child(CHILD_SETUP_FAILED_EXIT);
    }

    if dup_listen_fds(&plan.listen_fds).is_err() {
        abort_child(CHILD_SETUP_FAILED_EXIT);
    }
    if let Some((slot, buf)) = plan.listen_pid_buf.as_mut() {
        format_listen_pid(buf, unsafe { libc::getpid() });
        plan.envp_ptrs[*slot] = buf.as_ptr() as *const libc::c_char;
    }

    if let Some(dir) = &plan.working_directory {
        if unsafe { libc::chdir(dir.as_ptr()) } < 0 {
            abort_child(CHILD_SETUP_FAILED_EXIT);
        }
    }

    if apply_limits(plan).is_err() {
        abort_child(CHILD_SETUP_FAILED_EXIT);
    }

    for hook in &plan.hooks {
        if hook.run().is_err() {
            abort_child(CHILD_SETUP_FAILED_EXIT);
        }
    }

    if let Some(creds) = &plan.credentials {
        if crate::platform::drop_privileges(creds).is_err() {
            abort_child(CHILD_SETUP_FAILED_EXIT);
        }
    }

    unsafe {
        libc::execve(
            plan.program.as_ptr(),
            plan.argv_ptrs.as_ptr(),
            plan.envp_ptrs.as_ptr(),
        );
    }
    abort_child(CHILD_EXEC_FAILED_EXIT)
}
