use log::{error, trace};
use nix::errno::Errno;
use nix::sys::signal::{kill, killpg, Signal};
use nix::unistd::Pid;

/// Deliver `signal` to the process group the service leads. Falls back to the main pid if the
/// group is already gone. A process that already exited is not an error.
pub fn signal_process_group(pid: Pid, signal: Signal) {
    match killpg(pid, signal) {
        Ok(()) => trace!("Sent {} to process group {}", signal, pid),
        Err(Errno::ESRCH) => match kill(pid, signal) {
            Ok(()) => trace!("Sent {} to process {}", signal, pid),
            Err(Errno::ESRCH) => trace!("Process {} already exited", pid),
            Err(e) => error!("Error sending {} to process {}: {}", signal, pid, e),
        },
        Err(e) => error!("Error sending {} to process group {}: {}", signal, pid, e),
    }
}

/// Deliver `signal` only to the main process
pub fn signal_main_process(pid: Pid, signal: Signal) -> Result<(), Errno> {
    match kill(pid, signal) {
        Ok(()) | Err(Errno::ESRCH) => Ok(()),
        Err(e) => Err(e),
    }
}

pub fn process_exists(pid: Pid) -> bool {
    match kill(pid, None) {
        Ok(()) => true,
        Err(Errno::ESRCH) => false,
        // exists but belongs to someone else
        Err(_) => true,
    }
}
