use std::fmt;

/// Handle for a service in the registry.
///
/// The index points at the slot in the registry, the generation is bumped every time the slot
/// is reused. A handle that outlived the service it pointed to will not resolve anymore.
#[derive(Clone, Copy, Eq, PartialEq, Hash, PartialOrd, Ord)]
pub struct ServiceId {
    pub(crate) index: u32,
    pub(crate) generation: u32,
}

impl ServiceId {
    pub fn index(&self) -> u32 {
        self.index
    }
    pub fn generation(&self) -> u32 {
        self.generation
    }
}

impl fmt::Debug for ServiceId {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        write!(fmt, "#{}v{}", self.index, self.generation)
    }
}

impl fmt::Display for ServiceId {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        write!(fmt, "{:?}", self)
    }
}
