/// Extension point that runs inside the forked child right before the exec.
///
/// The child of a multithreaded process may only do async-signal-safe things:
/// no allocation, no locks, no logging. Everything a hook needs has to be prepared when it is constructed.
pub trait PreExecHook: Send + Sync {
    fn name(&self) -> &str;

    /// Returning an error aborts the child with [`super::CHILD_SETUP_FAILED_EXIT`]
    fn run(&self) -> Result<(), nix::errno::Errno>;
}

/// Sets the file creation mask of the service
pub struct UmaskHook {
    mode: libc::mode_t,
}

impl UmaskHook {
    pub fn new(mode: libc::mode_t) -> Self {
        UmaskHook { mode }
    }
}

impl PreExecHook for UmaskHook {
    fn name(&self) -> &str {
        "umask"
    }

    fn run(&self) -> Result<(), nix::errno::Errno> {
        unsafe {
            libc::umask(self.mode);
        }
        Ok(())
    }
}
