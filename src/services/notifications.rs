//! Handling of messages services send on their notification socket (READY=1, WATCHDOG=1, ...)

use crate::event_loop::Event;
use crate::runtime_info::RuntimeInfo;
use crate::units::{Service, ServiceId, ServiceState, ServiceType};

use log::{debug, error, info, trace, warn};
use std::time::Instant;

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Notification {
    Ready,
    Reloading,
    Stopping,
    Watchdog,
    WatchdogTrigger,
    Status(String),
    Unknown(String),
}

/// Split a datagram into its `KEY=VALUE` lines
pub fn parse_message(msg: &str) -> Vec<Notification> {
    msg.split('\n')
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(|line| match line {
            "READY=1" => Notification::Ready,
            "RELOADING=1" => Notification::Reloading,
            "STOPPING=1" => Notification::Stopping,
            "WATCHDOG=1" => Notification::Watchdog,
            "WATCHDOG=trigger" => Notification::WatchdogTrigger,
            _ => match line.strip_prefix("STATUS=") {
                Some(text) => Notification::Status(text.to_owned()),
                None => Notification::Unknown(line.to_owned()),
            },
        })
        .collect()
}

fn apply_notification(run_info: &RuntimeInfo, service: &Service, notification: Notification) {
    let registry = &run_info.registry;
    let conf = service.config();
    let mut rt = service.lock_runtime();
    match notification {
        Notification::Ready => match rt.state {
            ServiceState::Starting if conf.service_type == ServiceType::Notify => {
                rt.start_deadline = None;
                if conf.watchdog_interval.is_some() {
                    rt.last_ping = Some(Instant::now());
                }
                info!("service={} event=READY", service.name);
                registry.transition(service, &mut rt, ServiceState::Running);
            }
            ServiceState::Reloading => {
                info!("service={} event=RELOADED", service.name);
                registry.transition(service, &mut rt, ServiceState::Running);
            }
            state => trace!("Ignoring READY=1 from {} in state {}", service.name, state),
        },
        Notification::Reloading => {
            if rt.state == ServiceState::Running {
                registry.transition(service, &mut rt, ServiceState::Reloading);
            }
        }
        Notification::Stopping => {
            debug!("{} announced that it is stopping", service.name);
        }
        Notification::Watchdog => {
            if rt.state.has_process() {
                rt.last_ping = Some(Instant::now());
            }
        }
        Notification::WatchdogTrigger => {
            if rt.state.is_running() && !rt.watchdog_fired {
                rt.watchdog_fired = true;
                rt.stats.watchdog_misses += 1;
                warn!(
                    "service={} event=WATCHDOG_TRIGGER requested by the service",
                    service.name
                );
                run_info.push_event(Event::WatchdogTrigger(service.id));
            }
        }
        Notification::Status(text) => {
            trace!("Status of {}: {}", service.name, text);
            rt.status_text = Some(text);
        }
        Notification::Unknown(line) => {
            trace!("Unknown notification from {}: {}", service.name, line);
        }
    }
}

/// Read everything that is queued on the notification socket of a service
pub fn handle_notifications(run_info: &RuntimeInfo, id: ServiceId) {
    let service = match run_info.registry.get(id) {
        Ok(service) => service,
        Err(_) => return,
    };
    let socket = match &service.sockets.notify {
        Some(socket) => socket,
        None => return,
    };
    let mut buf = [0u8; 4096];
    loop {
        match socket.recv(&mut buf) {
            Ok(len) => {
                let msg = String::from_utf8_lossy(&buf[..len]);
                for notification in parse_message(&msg) {
                    apply_notification(run_info, &service, notification);
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
            Err(e) => {
                error!(
                    "Error while reading from notification socket of {}: {}",
                    service.name, e
                );
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_multi_line_messages() {
        let parsed = parse_message("READY=1\nSTATUS=Processing requests\nWATCHDOG=1\nMAINPID=42\n");
        assert_eq!(
            parsed,
            vec![
                Notification::Ready,
                Notification::Status("Processing requests".to_owned()),
                Notification::Watchdog,
                Notification::Unknown("MAINPID=42".to_owned()),
            ]
        );
        assert_eq!(parse_message("WATCHDOG=trigger"), vec![Notification::WatchdogTrigger]);
        assert!(parse_message("\n\n").is_empty());
    }
}
