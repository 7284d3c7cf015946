use log::{error, info, trace, warn};
use std::path::Path;

use crate::config;
use crate::control;
use crate::event_loop::{Event, EventLoop};
use crate::logging;
use crate::platform;
use crate::runtime_info::{ArcRuntimeInfo, ExitReason, RuntimeInfo};
use crate::services;
use crate::units::{self, Direction};

use clap::Parser;

#[derive(Parser, Debug)]
#[clap(about = "A small service supervisor that can run as process 1")]
struct CliArgs {
    /// Directory containing neoinit.toml or neoinit.json
    #[clap(short, long, value_parser)]
    conf: Option<std::path::PathBuf>,
    /// Load and check the config and all units, then exit
    #[clap(short, long, value_parser)]
    dry_run: bool,
}

pub fn run_service_manager() -> i32 {
    let cli_args = CliArgs::try_parse().unwrap_or_else(|e| unrecoverable_error(e.to_string()));

    if let Some(path) = &cli_args.conf {
        if !path.exists() {
            unrecoverable_error("config path given that does not exist".to_owned());
        }
        if !path.is_dir() {
            unrecoverable_error("config path given that is not a directory".to_owned());
        }
    }

    let (log_conf, conf) = config::load_config(&cli_args.conf);

    if let Err(e) = logging::setup_logging(&log_conf) {
        unrecoverable_error(format!("Logging could not be set up: {}", e));
    }
    let mut conf = match conf {
        Ok(conf) => conf,
        Err(e) => {
            error!("Error while loading the conf: {}", e);
            unrecoverable_error(format!(
                "Reading conf did not work. See stdout or log at: {:?}",
                log_conf.log_dir
            ));
        }
    };
    if nix::unistd::getpid().as_raw() == 1 && !conf.reap_orphans {
        info!("Running as process 1, reaping all orphans");
        conf.reap_orphans = true;
    }

    let run_info = match RuntimeInfo::new(conf) {
        Ok(run_info) => run_info,
        Err(e) => unrecoverable_error(format!("Could not set up the runtime: {}", e)),
    };
    load_all_units(&run_info);

    if cli_args.dry_run {
        warn!("Exit after loading because --dry-run was passed");
        return 0;
    }

    if let Err(e) = platform::become_subreaper(true) {
        warn!("{}", e);
    }

    let adopted = services::adopt_marked_processes(&run_info, Path::new("/proc"));
    if adopted > 0 {
        info!("Adopted {} running service processes", adopted);
    }

    let control_socket = match control::open_control_socket(&run_info.config.control_socket) {
        Ok(listener) => Some(listener),
        Err(e) => {
            error!("Continuing without control socket: {}", e);
            None
        }
    };

    let event_loop = match EventLoop::new(run_info.clone(), control_socket) {
        Ok(event_loop) => event_loop,
        Err(e) => unrecoverable_error(format!("Could not set up the event loop: {}", e)),
    };

    activate_enabled_services(&run_info);
    event_loop.run();

    let _ = std::fs::remove_file(&run_info.config.control_socket);
    let reason = run_info.exit_reason().unwrap_or(ExitReason::Graceful);
    info!("neoinit checking out: {:?}", reason);
    reason.exit_code()
}

fn load_all_units(run_info: &RuntimeInfo) {
    let found = match units::loading::parse_all_units(&run_info.config.unit_dirs) {
        Ok(found) => found,
        Err(e) => unrecoverable_error(format!("Loading unit files failed: {}", e)),
    };
    trace!("Finished parsing {} units", found.len());
    if let Err(e) = units::load_services(
        &run_info.registry,
        &run_info.config.notifications_dir,
        found,
    ) {
        error!("Units did not pass the sanity checks: {}", e);
        unrecoverable_error(format!("Unit dependencies did not pass sanity check: {}", e));
    }
    info!("Loaded {} services", run_info.registry.len());
}

/// Queue a start for every enabled service. Socket activated services wait for their first connection.
fn activate_enabled_services(run_info: &ArcRuntimeInfo) {
    let order = match run_info
        .registry
        .for_each_in_dependency_order(Direction::Start)
    {
        Ok(order) => order,
        Err(e) => {
            error!("Could not determine the boot order: {}", e);
            return;
        }
    };
    for id in order {
        if let Ok(service) = run_info.registry.get(id) {
            let conf = service.config();
            if conf.enabled && !conf.masked && !conf.socket_activated {
                run_info.push_event(Event::Start(id));
            }
        }
    }
}

fn find_shell_path() -> Option<std::path::PathBuf> {
    ["/bin/sh", "/sbin/sh", "/usr/bin/sh"]
        .iter()
        .map(std::path::PathBuf::from)
        .find(|path| path.exists())
}

/// As process 1 exiting would panic the kernel, so give the operator a shell first
fn unrecoverable_error(error: String) -> ! {
    if nix::unistd::getpid().as_raw() != 1 {
        eprintln!("Unrecoverable error: {}", error);
        std::process::exit(1);
    }
    eprintln!("Unrecoverable error: {}", error);
    let dur = match find_shell_path() {
        Some(shell_path) => match std::process::Command::new(shell_path).spawn() {
            Ok(mut child) => match child.wait() {
                Ok(_) => std::time::Duration::from_secs(10),
                Err(e) => {
                    eprintln!("Error while waiting on the shell: {}", e);
                    std::time::Duration::from_secs(1_000_000)
                }
            },
            Err(e) => {
                eprintln!("Error while starting the shell: {}", e);
                std::time::Duration::from_secs(1_000_000)
            }
        },
        None => {
            eprintln!("Cannot find a shell for emergency");
            std::time::Duration::from_secs(10)
        }
    };
    eprintln!("Will exit after sleeping: {:?}", dur);
    std::thread::sleep(dur);
    std::process::exit(1);
}
