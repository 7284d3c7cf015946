//! Orphans of the service process trees are reparented to the subreaper instead of process 1,
//! so neoinit can reap them without running as process 1.

#[cfg(target_os = "linux")]
pub fn become_subreaper(set: bool) -> Result<(), String> {
    let flag: libc::c_ulong = if set { 1 } else { 0 };
    let res = unsafe { libc::prctl(libc::PR_SET_CHILD_SUBREAPER, flag) };
    if res < 0 {
        Err(format!(
            "Couldnt set subreaper for neoinit: {}",
            nix::errno::Errno::last()
        ))
    } else {
        Ok(())
    }
}

#[cfg(any(
    target_os = "freebsd",
    target_os = "openbsd",
    target_os = "netbsd",
    target_os = "dragonfly"
))]
mod procctl {
    const PROC_REAP_ACQUIRE: libc::c_int = 2;
    const PROC_REAP_RELEASE: libc::c_int = 3;

    extern "C" {
        fn procctl(
            idtype: libc::c_int,
            id: libc::c_int,
            cmd: libc::c_int,
            args: *const std::ffi::c_void,
        ) -> libc::c_int;
    }

    pub fn become_subreaper(set: bool) -> Result<(), String> {
        let cmd = if set {
            PROC_REAP_ACQUIRE
        } else {
            PROC_REAP_RELEASE
        };
        let res = unsafe { procctl(libc::P_PID as i32, libc::getpid(), cmd, std::ptr::null()) };
        if res < 0 {
            Err(format!(
                "procctl reaper {} failed: {}",
                if set { "acquire" } else { "release" },
                nix::errno::Errno::last()
            ))
        } else {
            Ok(())
        }
    }
}

#[cfg(any(
    target_os = "freebsd",
    target_os = "openbsd",
    target_os = "netbsd",
    target_os = "dragonfly"
))]
pub use procctl::become_subreaper;
