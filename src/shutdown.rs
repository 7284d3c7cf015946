//! Shutdown sequence of neoinit. Services are stopped in reverse dependency order, then the event loop
//! is cancelled. The event loop keeps reaping while this runs on its own thread.

use crate::runtime_info::{ExitReason, RuntimeInfo};
use crate::services;
use crate::units::Direction;

use log::{error, info, trace, warn};

pub fn shutdown(run_info: &RuntimeInfo) {
    info!("Shutting down, stopping all services");
    let registry = &run_info.registry;
    let order = match registry.for_each_in_dependency_order(Direction::Stop) {
        Ok(order) => order,
        Err(e) => {
            error!("Could not determine the shutdown order, stopping in any order: {}", e);
            registry.ids()
        }
    };

    for id in order {
        match services::stop_service(run_info, id) {
            Ok(outcome) => trace!("Stopped {}: {:?}", id, outcome),
            Err(e) => error!("Error while stopping {}: {}", id, e),
        }
    }

    // anything started while the first round was running
    for service in registry.services() {
        if !service.state().is_inactive() {
            warn!("{} is still {}, stopping it again", service.name, service.state());
            if let Err(e) = services::stop_service(run_info, service.id) {
                error!("Error while stopping {}: {}", service.name, e);
            }
        }
    }

    run_info.set_exit_reason(ExitReason::Graceful);
    info!(
        "All services stopped, exiting with {:?}",
        run_info.exit_reason()
    );
    run_info.cancel.cancel();
}
