use crate::platform::EventFd;

use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};

/// Shutdown signal for the event loop. Cancelling wakes the loop through the fd in its wait set.
pub struct CancellationToken {
    cancelled: AtomicBool,
    fd: EventFd,
}

impl CancellationToken {
    pub fn new() -> Result<Self, String> {
        Ok(CancellationToken {
            cancelled: AtomicBool::new(false),
            fd: EventFd::new()?,
        })
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
        self.fd.notify();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    pub fn wake_fd(&self) -> RawFd {
        self.fd.read_end()
    }
}
