//! This module should provide all platform specific code.
//!
//! subreaper should contain an implementation that sets a process as the subreaper for the current process tree
//!
//! eventfd should contain an implementation that creates an eventfd (or a similarly working) tuple of filedescriptors
//! The pipe() implementation should work (in some variation) on many platforms
//!
//! proc_scan finds processes that were started by a previous instance of the supervisor

mod drop_privileges;
mod eventfd;
pub mod proc_scan;
mod subreaper;

pub use drop_privileges::*;
pub use eventfd::*;
pub use subreaper::*;
