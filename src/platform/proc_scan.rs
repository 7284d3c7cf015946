//! Find service processes that are still running from an earlier incarnation of the supervisor.
//! Every service gets `NEOINIT_SERVICE=<name>` in its environment, that is what we look for.

use log::trace;
use nix::unistd::Pid;
use std::path::Path;

pub const SERVICE_MARKER_VAR: &str = "NEOINIT_SERVICE";

fn marker_in_environ(environ: &[u8]) -> Option<String> {
    let prefix = format!("{}=", SERVICE_MARKER_VAR);
    environ
        .split(|b| *b == 0)
        .find(|entry| entry.starts_with(prefix.as_bytes()))
        .map(|entry| String::from_utf8_lossy(&entry[prefix.len()..]).into_owned())
}

/// Session id from the contents of /proc/<pid>/stat. The command name may contain anything, so
/// parsing starts after its closing parenthesis.
fn session_of(stat: &str) -> Option<i32> {
    let rest = &stat[stat.rfind(')')? + 1..];
    // state ppid pgrp session
    rest.split_whitespace().nth(3)?.parse().ok()
}

/// All (pid, service name) pairs found below `proc_root`. Only session leaders count, children of a
/// service inherit the marker too. Unreadable entries are skipped.
pub fn find_marked_processes(proc_root: &Path) -> Vec<(Pid, String)> {
    let entries = match std::fs::read_dir(proc_root) {
        Ok(entries) => entries,
        Err(e) => {
            trace!("Could not scan {:?}: {}", proc_root, e);
            return Vec::new();
        }
    };
    let own_pid = nix::unistd::getpid();
    let mut found = Vec::new();
    for entry in entries.filter_map(|entry| entry.ok()) {
        let pid = match entry
            .file_name()
            .to_str()
            .and_then(|name| name.parse::<i32>().ok())
        {
            Some(pid) => Pid::from_raw(pid),
            None => continue,
        };
        if pid == own_pid {
            continue;
        }
        let environ = match std::fs::read(entry.path().join("environ")) {
            Ok(environ) => environ,
            Err(_) => continue,
        };
        let name = match marker_in_environ(&environ) {
            Some(name) => name,
            None => continue,
        };
        let leads_session = std::fs::read_to_string(entry.path().join("stat"))
            .ok()
            .and_then(|stat| session_of(&stat))
            .map(|sid| sid == pid.as_raw())
            .unwrap_or(false);
        if leads_session {
            found.push((pid, name));
        }
    }
    found.sort();
    found
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finds_marker() {
        let dir = tempfile::tempdir().unwrap();
        let proc_dir = dir.path().join("4242");
        std::fs::create_dir(&proc_dir).unwrap();
        std::fs::write(
            proc_dir.join("environ"),
            b"PATH=/bin\0NEOINIT_SERVICE=webserver\0HOME=/\0",
        )
        .unwrap();
        std::fs::write(proc_dir.join("stat"), "4242 (web server) S 1 4242 4242 0 -1").unwrap();
        // forked worker of the same service
        let worker = dir.path().join("4250");
        std::fs::create_dir(&worker).unwrap();
        std::fs::write(worker.join("environ"), b"NEOINIT_SERVICE=webserver\0").unwrap();
        std::fs::write(worker.join("stat"), "4250 (worker) S 4242 4242 4242 0 -1").unwrap();
        let other = dir.path().join("4243");
        std::fs::create_dir(&other).unwrap();
        std::fs::write(other.join("environ"), b"PATH=/bin\0").unwrap();
        std::fs::create_dir(dir.path().join("self")).unwrap();

        let found = find_marked_processes(dir.path());
        assert_eq!(found, vec![(Pid::from_raw(4242), "webserver".to_owned())]);
    }

    #[test]
    fn session_from_stat() {
        assert_eq!(session_of("12 (a) b) S 1 12 12 0"), Some(12));
        assert_eq!(session_of("garbage"), None);
    }
}
