//! Handle signals send to this process from either the outside or the child processes.
//! The handlers only write to a self-pipe that the event loop polls.

use signal_hook::consts::signal::{SIGCHLD, SIGINT, SIGQUIT, SIGTERM};
use signal_hook::low_level::pipe;
use signal_hook::SigId;
use std::io::Read;
use std::os::unix::io::{AsRawFd, RawFd};
use std::os::unix::net::UnixStream;

const TERM_SIGNALS: &[libc::c_int] = &[SIGTERM, SIGINT, SIGQUIT];

pub struct SignalPipes {
    child: UnixStream,
    term: UnixStream,
    registered: Vec<SigId>,
}

fn nonblocking_pair() -> Result<(UnixStream, UnixStream), String> {
    let (read, write) =
        UnixStream::pair().map_err(|e| format!("Error creating signal pipe: {}", e))?;
    read.set_nonblocking(true)
        .and_then(|_| write.set_nonblocking(true))
        .map_err(|e| format!("Error setting signal pipe nonblocking: {}", e))?;
    Ok((read, write))
}

impl SignalPipes {
    pub fn new() -> Result<Self, String> {
        let mut registered = Vec::new();
        let (child, child_write) = nonblocking_pair()?;
        registered.push(
            pipe::register(SIGCHLD, child_write)
                .map_err(|e| format!("Error registering SIGCHLD handler: {}", e))?,
        );

        let (term, term_write) = nonblocking_pair()?;
        for signal in TERM_SIGNALS {
            let write = term_write
                .try_clone()
                .map_err(|e| format!("Error cloning signal pipe: {}", e))?;
            registered.push(
                pipe::register(*signal, write)
                    .map_err(|e| format!("Error registering handler for {}: {}", signal, e))?,
            );
        }
        Ok(SignalPipes {
            child,
            term,
            registered,
        })
    }

    pub fn child_fd(&self) -> RawFd {
        self.child.as_raw_fd()
    }

    pub fn term_fd(&self) -> RawFd {
        self.term.as_raw_fd()
    }

    fn drain(mut stream: &UnixStream) {
        let mut buf = [0u8; 64];
        while let Ok(n) = stream.read(&mut buf) {
            if n == 0 {
                break;
            }
        }
    }

    pub fn drain_child(&self) {
        Self::drain(&self.child);
    }

    pub fn drain_term(&self) {
        Self::drain(&self.term);
    }
}

impl Drop for SignalPipes {
    fn drop(&mut self) {
        for id in self.registered.drain(..) {
            signal_hook::low_level::unregister(id);
        }
    }
}
