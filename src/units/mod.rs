//! Everything about the services themselves: their declared config, their runtime state and how they relate to each other

pub mod dependency_resolving;
mod id;
pub mod loading;
pub mod locking;
mod registry;
mod service_config;
mod status;

pub use id::*;
pub use loading::{apply_config, insert_service, load_services, load_unit_file, remove_service};
pub use registry::*;
pub use service_config::*;
pub use status::*;
