//! Thin wrapper around epoll. Every registered fd carries itself as the token.

use nix::errno::Errno;
use nix::sys::epoll::{
    epoll_create1, epoll_ctl, epoll_wait, EpollCreateFlags, EpollEvent, EpollFlags, EpollOp,
};
use std::os::unix::io::RawFd;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Interest {
    /// Readable, reported as long as data is pending
    Read,
    /// Readable, reported once and then disabled until rearmed
    ReadOnce,
    /// Registered but disabled until rearmed
    Disarmed,
}

impl Interest {
    fn flags(self) -> EpollFlags {
        match self {
            Interest::Read => EpollFlags::EPOLLIN,
            Interest::ReadOnce => EpollFlags::EPOLLIN | EpollFlags::EPOLLONESHOT,
            Interest::Disarmed => EpollFlags::EPOLLONESHOT,
        }
    }
}

pub struct Readiness {
    epfd: RawFd,
}

impl Readiness {
    pub fn new() -> Result<Self, String> {
        let epfd = epoll_create1(EpollCreateFlags::EPOLL_CLOEXEC)
            .map_err(|e| format!("Error while creating epoll fd: {}", e))?;
        Ok(Readiness { epfd })
    }

    pub fn add(&self, fd: RawFd, interest: Interest) -> Result<(), Errno> {
        let mut event = EpollEvent::new(interest.flags(), fd as u64);
        epoll_ctl(self.epfd, EpollOp::EpollCtlAdd, fd, &mut event)
    }

    pub fn modify(&self, fd: RawFd, interest: Interest) -> Result<(), Errno> {
        let mut event = EpollEvent::new(interest.flags(), fd as u64);
        epoll_ctl(self.epfd, EpollOp::EpollCtlMod, fd, &mut event)
    }

    /// Closed fds leave the set on their own, so a missing fd is not an error
    pub fn remove(&self, fd: RawFd) -> Result<(), Errno> {
        match epoll_ctl(self.epfd, EpollOp::EpollCtlDel, fd, None) {
            Ok(()) | Err(Errno::ENOENT) | Err(Errno::EBADF) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Wait for readiness. Returns the ready fds, an interrupted wait returns none.
    pub fn wait(&self, buf: &mut [EpollEvent], timeout_ms: isize) -> Result<Vec<RawFd>, Errno> {
        match epoll_wait(self.epfd, buf, timeout_ms) {
            Ok(n) => Ok(buf[..n].iter().map(|event| event.data() as RawFd).collect()),
            Err(Errno::EINTR) => Ok(Vec::new()),
            Err(e) => Err(e),
        }
    }
}

impl Drop for Readiness {
    fn drop(&mut self) {
        let _ = nix::unistd::close(self.epfd);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::EventFd;

    #[test]
    fn oneshot_needs_rearm() {
        let readiness = Readiness::new().unwrap();
        let fd = EventFd::new().unwrap();
        readiness.add(fd.read_end(), Interest::ReadOnce).unwrap();
        fd.notify();

        let mut buf = vec![EpollEvent::empty(); 4];
        assert_eq!(readiness.wait(&mut buf, 100).unwrap(), vec![fd.read_end()]);
        // still readable, but disabled
        assert!(readiness.wait(&mut buf, 50).unwrap().is_empty());

        readiness.modify(fd.read_end(), Interest::ReadOnce).unwrap();
        assert_eq!(readiness.wait(&mut buf, 100).unwrap(), vec![fd.read_end()]);

        readiness.remove(fd.read_end()).unwrap();
        readiness.remove(fd.read_end()).unwrap();
    }
}
