mod service_manager;

pub use service_manager::run_service_manager;
