//! This module provides the control access similar to systemctl from systemd. It speaks JSON-RPC 2.0
//! on a unix socket and has the interface defined below. Every command taking a name answers with
//! `NotFound` if no such service is loaded.
//!
//! ### start/stop/restart/reload name
//! Start, stop (recursivly stopping everything that requires it), restart or reload the service
//!
//! ### enable/disable name
//! Whether the service is started at boot and by events
//!
//! ### mask/unmask name
//! A masked service refuses every start
//!
//! ### status Option<name>
//! * If the param is a string show status of the service with that name
//! * If no param is given, show status of all services
//!
//! ### list
//! Status of all services
//!
//! ### ping name
//! Feed the watchdog of the service
//!
//! ### maintenance name on|off
//! Put a stopped or failed service into maintenance or take it out again
//!
//! ### load path / unload name
//! Load a new unit file / remove an inactive service
//!
//! ### shutdown
//! Shutdown neoinit by stopping all services and exiting
//!
//! ## Send commands
//! Use neoctl or anything that can write to the socket
//! echo '{"method": "restart", "params": "webserver"}' | socat - UNIX-CONNECT:/run/neoinit.sock

pub mod api;
mod control;
pub mod jsonrpc2;

pub use control::*;
