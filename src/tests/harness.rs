use crate::config::Config;
use crate::event_loop::EventLoop;
use crate::runtime_info::{ArcRuntimeInfo, RuntimeInfo};
use crate::services::signal_process_group;
use crate::units::{self, Commandline, ServiceConfig, ServiceId, ServiceRuntime, ServiceState};

use nix::sys::signal::Signal;
use std::time::{Duration, Instant};

pub fn test_config(dir: &std::path::Path) -> Config {
    Config {
        unit_dirs: vec![dir.join("units")],
        notifications_dir: dir.join("notify"),
        control_socket: dir.join("control.sock"),
        tick_interval: Duration::from_millis(10),
        stability_window: Duration::from_secs(30),
        restart_max: 3,
        restart_window: Duration::from_secs(60),
        backoff_cap: Duration::from_secs(1),
        kill_timeout: Duration::from_secs(2),
        worker_threads: 4,
        reap_orphans: false,
    }
}

pub fn shell(script: &str) -> ServiceConfig {
    ServiceConfig::new(Commandline {
        cmd: "/bin/sh".into(),
        args: vec!["-c".into(), script.into()],
    })
}

/// A running event loop with its own notification dir. Everything is torn down on drop.
pub struct Supervisor {
    pub run_info: ArcRuntimeInfo,
    pub dir: tempfile::TempDir,
    handle: Option<std::thread::JoinHandle<()>>,
}

impl Supervisor {
    pub fn new() -> Self {
        Self::with_config(|_| {})
    }

    pub fn with_config(adjust: impl FnOnce(&mut Config)) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let mut config = test_config(dir.path());
        adjust(&mut config);
        let run_info = RuntimeInfo::new(config).unwrap();
        let (ready_tx, ready_rx) = std::sync::mpsc::channel();
        let loop_info = run_info.clone();
        let handle = std::thread::spawn(move || {
            let event_loop = EventLoop::new(loop_info, None).unwrap();
            ready_tx.send(()).unwrap();
            event_loop.run();
        });
        ready_rx.recv().unwrap();
        Supervisor {
            run_info,
            dir,
            handle: Some(handle),
        }
    }

    pub fn add(&self, name: &str, conf: ServiceConfig) -> ServiceId {
        units::insert_service(
            &self.run_info.registry,
            &self.run_info.config.notifications_dir,
            name,
            conf,
        )
        .unwrap()
    }

    pub fn state(&self, id: ServiceId) -> ServiceState {
        self.run_info.registry.get(id).unwrap().state()
    }

    pub fn inspect<T>(&self, id: ServiceId, f: impl FnOnce(&ServiceRuntime) -> T) -> T {
        let service = self.run_info.registry.get(id).unwrap();
        let rt = service.lock_runtime();
        f(&rt)
    }

    /// Poll until `cond` holds for the runtime of the service
    pub fn wait_until(
        &self,
        id: ServiceId,
        timeout: Duration,
        cond: impl Fn(&ServiceRuntime) -> bool,
    ) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if self.inspect(id, &cond) {
                return true;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        self.inspect(id, &cond)
    }

    /// Poll until the service reaches `state`
    pub fn wait_for(&self, id: ServiceId, state: ServiceState, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if self.state(id) == state {
                return true;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        self.state(id) == state
    }
}

impl Drop for Supervisor {
    fn drop(&mut self) {
        self.run_info.cancel.cancel();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
        for service in self.run_info.registry.services() {
            if let Some(pid) = service.pid() {
                signal_process_group(pid, Signal::SIGKILL);
                let _ = nix::sys::wait::waitpid(pid, None);
            }
        }
    }
}
