use log::{error, trace};
use std::os::unix::io::RawFd;

/// A pollable wakeup primitive. On linux this is an eventfd, elsewhere a nonblocking pipe.
#[derive(Debug)]
pub struct EventFd {
    read_end: RawFd,
    write_end: RawFd,
}

#[cfg(feature = "linux_eventfd")]
fn make_event_fd() -> Result<(RawFd, RawFd), String> {
    use nix::sys::eventfd::{eventfd, EfdFlags};
    eventfd(0, EfdFlags::EFD_CLOEXEC | EfdFlags::EFD_NONBLOCK)
        .map_err(|e| format!("Error while creating eventfd: {}", e))
        .map(|fd| (fd, fd))
}

#[cfg(not(feature = "linux_eventfd"))]
fn make_event_fd() -> Result<(RawFd, RawFd), String> {
    use nix::fcntl::OFlag;
    nix::unistd::pipe2(OFlag::O_CLOEXEC | OFlag::O_NONBLOCK)
        .map_err(|e| format!("Error creating pipe, {}", e))
}

impl EventFd {
    pub fn new() -> Result<EventFd, String> {
        let (read_end, write_end) = make_event_fd()?;
        Ok(EventFd {
            read_end,
            write_end,
        })
    }

    /// The end that becomes readable after notify()
    pub fn read_end(&self) -> RawFd {
        self.read_end
    }

    pub fn notify(&self) {
        // anything other than 0 so the counter becomes readable
        let buf = 1u64.to_ne_bytes();
        let res = unsafe {
            libc::write(
                self.write_end,
                buf.as_ptr() as *const libc::c_void,
                buf.len(),
            )
        };
        if res <= 0 {
            let errno = nix::errno::Errno::last();
            // a full counter/pipe is already readable, nothing lost
            if errno != nix::errno::Errno::EAGAIN {
                error!("Did not notify eventfd {}: err: {}", self.write_end, errno);
            }
        }
    }

    /// Consume all pending notifications
    pub fn reset(&self) {
        let mut buf = [0u8; 64];
        loop {
            let res = unsafe {
                libc::read(
                    self.read_end,
                    buf.as_mut_ptr() as *mut libc::c_void,
                    buf.len(),
                )
            };
            // eventfd reads drain the whole counter at once, pipes might need more reads
            if res <= 0 || cfg!(feature = "linux_eventfd") {
                break;
            }
        }
        trace!("reset eventfd {}", self.read_end);
    }
}

impl Drop for EventFd {
    fn drop(&mut self) {
        let _ = nix::unistd::close(self.read_end);
        if self.write_end != self.read_end {
            let _ = nix::unistd::close(self.write_end);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn notify_makes_readable() {
        let efd = EventFd::new().unwrap();
        efd.notify();
        efd.notify();
        let mut fds = [nix::poll::PollFd::new(
            efd.read_end(),
            nix::poll::PollFlags::POLLIN,
        )];
        assert_eq!(nix::poll::poll(&mut fds, 100).unwrap(), 1);
        efd.reset();
        assert_eq!(nix::poll::poll(&mut fds, 0).unwrap(), 0);
    }
}
