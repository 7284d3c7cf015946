//! A small service to try neoinit with. It speaks the notification protocol and serves the sockets
//! it was handed.
//!
//! 1. Sends READY=1 once it is listening
//! 1. Pings the watchdog at half the interval from WATCHDOG_USEC
//! 1. Echoes a greeting to everyone connecting to one of the sockets from LISTEN_FDS
//! 1. Sends RELOADING=1 and READY=1 on SIGHUP

use std::io::Write;
use std::os::unix::io::FromRawFd;
use std::os::unix::net::{UnixDatagram, UnixListener};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

const LISTEN_FDS_START: i32 = 3;

fn notify(msg: &str) {
    let path = match std::env::var("NOTIFY_SOCKET") {
        Ok(path) => path,
        Err(_) => return,
    };
    let sent = UnixDatagram::unbound().and_then(|sock| sock.send_to(msg.as_bytes(), &path));
    if let Err(e) = sent {
        eprintln!("Could not notify {}: {}", path, e);
    }
}

fn env_number<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|value| value.parse().ok())
}

fn take_listeners() -> Vec<UnixListener> {
    let pid_matches = env_number::<i32>("LISTEN_PID") == Some(nix::unistd::getpid().as_raw());
    let count: i32 = env_number("LISTEN_FDS").unwrap_or(0);
    if !pid_matches || count <= 0 {
        return Vec::new();
    }
    (LISTEN_FDS_START..LISTEN_FDS_START + count)
        .map(|fd| unsafe { UnixListener::from_raw_fd(fd) })
        .collect()
}

fn serve(listener: UnixListener, name: String) {
    for stream in listener.incoming() {
        match stream {
            Ok(mut stream) => {
                if let Err(e) = writeln!(stream, "hello from {}", name) {
                    eprintln!("Error answering a client: {}", e);
                }
            }
            Err(err) => {
                eprintln!("Error while accepting new connections: {}", err);
                break;
            }
        }
    }
}

fn main() {
    let name = std::env::var("NEOINIT_SERVICE").unwrap_or_else(|_| "testservice".to_owned());
    let listeners = take_listeners();
    println!("{} started with {} sockets", name, listeners.len());
    for listener in listeners {
        let name = name.clone();
        std::thread::spawn(move || serve(listener, name));
    }

    let hangup = Arc::new(AtomicBool::new(false));
    if let Err(e) = signal_hook::flag::register(signal_hook::consts::SIGHUP, hangup.clone()) {
        eprintln!("Could not handle SIGHUP: {}", e);
    }

    notify("READY=1\nSTATUS=serving");

    let ping_every = env_number::<u64>("WATCHDOG_USEC").map(|usec| Duration::from_micros(usec / 2));
    let step = ping_every.unwrap_or(Duration::from_secs(1));
    loop {
        std::thread::sleep(step);
        if hangup.swap(false, Ordering::SeqCst) {
            notify("RELOADING=1");
            println!("{} reloading", name);
            notify("READY=1");
        }
        if ping_every.is_some() {
            notify("WATCHDOG=1");
        }
    }
}
