//! neoinit is a small service supervisor that can run as process 1.
//!
//! It focuses on the core functionality of a service manager:
//! 1. Starting services in dependency order (requires/wants, with before/after hints) and resolving conflicts
//! 1. Supervising them: restart policies with backoff and a restart budget, watchdogs, readiness notification
//! 1. Socket activation of services
//! 1. Stopping services that depend on stopped or failed services
//! 1. A control socket to start/stop/inspect services at runtime
//!
//! What is explicitly out of scope:
//! 1. Timers, mounts, devices, paths
//! 1. cgroups
//! 1. Persisting state across restarts of neoinit. Running services are re-adopted by scanning /proc.

pub mod config;
pub mod control;
pub mod entrypoints;
pub mod errors;
pub mod event_loop;
pub mod logging;
pub mod platform;
pub mod runtime_info;
pub mod services;
pub mod shutdown;
pub mod units;

#[cfg(test)]
mod tests;

pub use entrypoints::run_service_manager;
