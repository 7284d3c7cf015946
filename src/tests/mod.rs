mod harness;
mod ordering;
mod registry;

use harness::{shell, Supervisor};
use crate::control;
use crate::runtime_info::ExitReason;
use crate::units::{self, RestartPolicy, ServiceState, ServiceType};

use serde_json::{json, Value};
use std::io::{Read, Write};
use std::time::Duration;

#[test]
fn test_service_parsing() {
    let unit = r#"
    [service]
    exec = "/path/to/startbin arg1 'arg 2' arg3"
    type = "notify"
    requires = ["db", "network", "db"]
    wants = ["cache"]
    conflicts = ["legacy"]
    before = ["web"]
    after = ["network"]
    working_directory = "/srv"
    environment = ["MODE=production", "EMPTY="]
    restart = "on-failure"
    restart_delay_ms = 250
    start_timeout_ms = 5000
    watchdog_interval_ms = 1000
    reload_signal = "SIGUSR1"
    enabled = false
    critical = true

    [limits]
    open_files = 1024
    nice = 5
    cpu_affinity = [0]
    "#;

    let conf = units::loading::parse_unit(unit, std::path::Path::new("/path/to/app.toml")).unwrap();

    assert_eq!(conf.exec.cmd, "/path/to/startbin");
    assert_eq!(
        conf.exec.args,
        vec!["arg1".to_owned(), "arg 2".to_owned(), "arg3".to_owned()]
    );
    assert_eq!(conf.service_type, ServiceType::Notify);
    // deduplicated and sorted
    assert_eq!(conf.requires, vec!["db".to_owned(), "network".to_owned()]);
    assert_eq!(conf.wants, vec!["cache".to_owned()]);
    assert_eq!(conf.conflicts, vec!["legacy".to_owned()]);
    assert_eq!(conf.before, vec!["web".to_owned()]);
    assert_eq!(conf.after, vec!["network".to_owned()]);
    assert_eq!(
        conf.working_directory,
        Some(std::path::PathBuf::from("/srv"))
    );
    assert_eq!(
        conf.environment,
        vec![
            ("MODE".to_owned(), "production".to_owned()),
            ("EMPTY".to_owned(), "".to_owned())
        ]
    );
    assert_eq!(conf.restart, RestartPolicy::OnFailure);
    assert_eq!(conf.restart_delay, Duration::from_millis(250));
    assert_eq!(conf.start_timeout, Duration::from_secs(5));
    assert_eq!(conf.stop_timeout, units::DEFAULT_TIMEOUT);
    assert_eq!(conf.watchdog_interval, Some(Duration::from_secs(1)));
    assert_eq!(conf.reload_signal, nix::sys::signal::Signal::SIGUSR1);
    assert!(!conf.enabled);
    assert!(conf.critical);
    assert!(!conf.masked);
    assert_eq!(conf.limits.open_files, Some(1024));
    assert_eq!(conf.limits.nice, Some(5));
    assert_eq!(conf.limits.cpu_affinity, vec![0]);
}

#[test]
fn test_broken_units() {
    let path = std::path::Path::new("/path/to/broken.toml");
    let broken = vec![
        // no exec
        "[service]\ntype = \"simple\"\n",
        "[service]\nexec = \"\"\n",
        "[service]\nexec = \"/bin/true\"\ntype = \"forking\"\n",
        "[service]\nexec = \"/bin/true\"\nunknown_key = 1\n",
        "[service]\nexec = \"/bin/true\"\nenvironment = [\"NOVALUE\"]\n",
        "[service]\nexec = \"/bin/true\"\nwatchdog_interval_ms = 0\n",
        "[service]\nexec = \"/bin/true\"\nreload_signal = \"SIGNOPE\"\n",
        "[service]\nexec = \"/bin/true\"\nsocket_activated = true\n",
    ];
    for unit in broken {
        assert!(
            units::loading::parse_unit(unit, path).is_err(),
            "should not parse: {}",
            unit
        );
    }
}

#[test]
fn test_loading_unit_dir() {
    let dir = tempfile::tempdir().unwrap();
    let unit_dir = dir.path().join("units");
    std::fs::create_dir_all(&unit_dir).unwrap();
    std::fs::write(
        unit_dir.join("db.toml"),
        "[service]\nexec = \"/bin/sleep 30\"\n",
    )
    .unwrap();
    std::fs::write(
        unit_dir.join("app.toml"),
        "[service]\nexec = \"/bin/sleep 30\"\nrequires = [\"db\"]\n",
    )
    .unwrap();
    std::fs::write(unit_dir.join("README"), "not a unit").unwrap();

    let found = units::loading::parse_all_units(&[unit_dir.clone()]).unwrap();
    let names: Vec<&str> = found.iter().map(|(name, _)| name.as_str()).collect();
    assert_eq!(names, vec!["app", "db"]);

    let run_info =
        crate::runtime_info::RuntimeInfo::new(harness::test_config(dir.path())).unwrap();
    let ids = units::load_services(&run_info.registry, &run_info.config.notifications_dir, found)
        .unwrap();
    assert_eq!(ids.len(), 2);
    let app = run_info.registry.get_by_name("app").unwrap();
    assert!(app.sockets.notify_path.as_ref().unwrap().exists());

    // db is required by app
    let db = run_info.registry.lookup("db").unwrap();
    assert!(units::remove_service(&run_info.registry, db).is_err());
    units::remove_service(&run_info.registry, app.id).unwrap();
    assert!(!app.sockets.notify_path.as_ref().unwrap().exists());
    units::remove_service(&run_info.registry, db).unwrap();
    assert_eq!(run_info.registry.len(), 0);
}

#[test]
fn test_removed_service_cleans_up_its_sockets() {
    let dir = tempfile::tempdir().unwrap();
    let run_info =
        crate::runtime_info::RuntimeInfo::new(harness::test_config(dir.path())).unwrap();
    let socket_path = dir.path().join("api.sock");
    let mut conf = shell("sleep 30");
    conf.sockets = vec![socket_path.clone()];
    let id = units::insert_service(
        &run_info.registry,
        &run_info.config.notifications_dir,
        "api",
        conf,
    )
    .unwrap();
    let service = run_info.registry.get(id).unwrap();
    let notify_path = service.sockets.notify_path.clone().unwrap();
    assert!(socket_path.exists());
    assert!(notify_path.exists());
    run_info.events.drain();

    units::remove_service(&run_info.registry, id).unwrap();
    assert!(!socket_path.exists());
    assert!(!notify_path.exists());
    assert!(service.lock_runtime().removed);
    // the loop gets to deregister the fds of the notify socket and the listener
    let removed: Vec<_> = run_info
        .events
        .drain()
        .into_iter()
        .filter_map(|event| match event {
            crate::event_loop::Event::ServiceRemoved { name, fds } => Some((name, fds.len())),
            _ => None,
        })
        .collect();
    assert_eq!(removed, vec![("api".to_owned(), 2)]);

    // removing twice through an old handle finds nothing
    assert!(units::remove_service(&run_info.registry, id).is_err());
}

#[test]
fn test_loading_rejects_missing_requirement() {
    let dir = tempfile::tempdir().unwrap();
    let run_info =
        crate::runtime_info::RuntimeInfo::new(harness::test_config(dir.path())).unwrap();
    let mut app = shell("sleep 30");
    app.requires = vec!["db".into()];
    assert!(units::load_services(
        &run_info.registry,
        &run_info.config.notifications_dir,
        vec![("app".to_owned(), app)]
    )
    .is_err());
    assert_eq!(run_info.registry.len(), 0);
}

#[test]
fn test_apply_config() {
    let dir = tempfile::tempdir().unwrap();
    let run_info =
        crate::runtime_info::RuntimeInfo::new(harness::test_config(dir.path())).unwrap();
    let registry = &run_info.registry;
    let notify_dir = &run_info.config.notifications_dir;
    let a = units::insert_service(registry, notify_dir, "a", shell("sleep 30")).unwrap();
    let mut b = shell("sleep 30");
    b.requires = vec!["a".into()];
    units::insert_service(registry, notify_dir, "b", b).unwrap();

    // a requiring b would close a cycle, nothing may change
    let mut cyclic = shell("sleep 1");
    cyclic.requires = vec!["b".into()];
    assert!(units::apply_config(registry, a, cyclic).is_err());
    assert_eq!(registry.get(a).unwrap().config().exec.args[1], "sleep 30");

    units::apply_config(registry, a, shell("sleep 1")).unwrap();
    assert_eq!(registry.get(a).unwrap().config().exec.args[1], "sleep 1");
}

fn control_roundtrip(sup: &Supervisor, calls: &[Value]) -> Vec<Value> {
    let (mut client, server) = std::os::unix::net::UnixStream::pair().unwrap();
    let run_info = sup.run_info.clone();
    let handle = std::thread::spawn(move || control::serve_connection(server, &run_info));
    for call in calls {
        client
            .write_all(serde_json::to_string(call).unwrap().as_bytes())
            .unwrap();
    }
    client.shutdown(std::net::Shutdown::Write).unwrap();
    let mut answer = Vec::new();
    client.read_to_end(&mut answer).unwrap();
    handle.join().unwrap();
    serde_json::Deserializer::from_slice(&answer)
        .into_iter::<Value>()
        .map(|value| value.unwrap())
        .collect()
}

#[test]
fn test_control_socket() {
    let sup = Supervisor::new();
    sup.add("web", shell("sleep 30"));

    let responses = control_roundtrip(
        &sup,
        &[
            json!({"jsonrpc": "2.0", "method": "start", "params": "web", "id": 1}),
            json!({"jsonrpc": "2.0", "method": "status", "params": ["web"], "id": 2}),
            json!({"jsonrpc": "2.0", "method": "status", "params": "nope", "id": 3}),
            json!({"jsonrpc": "2.0", "method": "fly", "id": 4}),
            json!({"jsonrpc": "2.0", "method": "maintenance", "params": ["web", "on"], "id": 5}),
            json!({"jsonrpc": "2.0", "method": "stop", "params": "web", "id": 6}),
            json!({"jsonrpc": "2.0", "method": "list", "id": 7}),
        ],
    );
    assert_eq!(responses.len(), 7);

    assert_eq!(responses[0]["result"], json!("ok"));
    assert_eq!(responses[1]["id"], json!(2));
    assert_eq!(responses[1]["result"]["state"], json!("Running"));
    assert!(responses[1]["result"]["pid"].is_number());

    assert_eq!(responses[2]["error"]["data"]["kind"], json!("NotFound"));
    assert_eq!(
        responses[3]["error"]["code"],
        json!(control::jsonrpc2::METHOD_NOT_FOUND_ERROR)
    );
    assert_eq!(responses[3]["error"]["data"]["kind"], json!("InvalidArgument"));
    assert_eq!(responses[4]["error"]["data"]["kind"], json!("InvalidState"));
    assert_eq!(responses[5]["result"], json!("Graceful"));

    let list = responses[6]["result"].as_array().unwrap();
    assert_eq!(list.len(), 1);
    assert_eq!(list[0]["name"], json!("web"));
    assert_eq!(list[0]["state"], json!("Stopped"));
    assert_eq!(list[0]["starts"], json!(1));
}

#[test]
fn test_control_load_and_unload() {
    let sup = Supervisor::new();
    let unit_path = sup.dir.path().join("extra.toml");
    std::fs::write(&unit_path, "[service]\nexec = \"/bin/sleep 30\"\n").unwrap();

    let responses = control_roundtrip(
        &sup,
        &[
            json!({"jsonrpc": "2.0", "method": "load", "params": unit_path.to_str().unwrap(), "id": 1}),
            json!({"jsonrpc": "2.0", "method": "load", "params": unit_path.to_str().unwrap(), "id": 2}),
            json!({"jsonrpc": "2.0", "method": "unload", "params": "extra", "id": 3}),
        ],
    );
    assert_eq!(responses[0]["result"], json!("extra"));
    assert_eq!(responses[1]["error"]["data"]["kind"], json!("AlreadyExists"));
    assert_eq!(responses[2]["result"], json!("ok"));
    assert!(sup.run_info.registry.lookup("extra").is_err());
}

#[test]
fn test_socket_activation() {
    let sup = Supervisor::new();
    let socket_path = sup.dir.path().join("activated.sock");
    let mut conf = shell("sleep 30");
    conf.sockets = vec![socket_path.clone()];
    conf.socket_activated = true;
    let id = sup.add("activated", conf);

    std::thread::sleep(Duration::from_millis(50));
    assert_eq!(sup.state(id), ServiceState::Stopped);

    let _client = std::os::unix::net::UnixStream::connect(&socket_path).unwrap();
    assert!(sup.wait_for(id, ServiceState::Running, Duration::from_secs(5)));
}

#[test]
fn test_graceful_shutdown() {
    let sup = Supervisor::new();
    let db = sup.add("db", shell("sleep 30"));
    let mut app = shell("sleep 30");
    app.requires = vec!["db".into()];
    let app = sup.add("app", app);
    crate::services::start_service(&sup.run_info, app).unwrap();

    control::api::shutdown(&sup.run_info);
    let deadline = std::time::Instant::now() + Duration::from_secs(10);
    while !sup.run_info.cancel.is_cancelled() && std::time::Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(10));
    }
    assert!(sup.run_info.cancel.is_cancelled());
    assert_eq!(sup.state(app), ServiceState::Stopped);
    assert_eq!(sup.state(db), ServiceState::Stopped);
    assert_eq!(sup.run_info.exit_reason(), Some(ExitReason::Graceful));
}

#[test]
fn test_critical_service_exhausting_budget() {
    let sup = Supervisor::new();
    let bystander = sup.add("bystander", shell("sleep 30"));
    let mut conf = shell("exit 1");
    conf.restart = RestartPolicy::Always;
    conf.restart_delay = Duration::from_millis(10);
    conf.critical = true;
    let critical = sup.add("critical", conf);

    crate::services::start_service(&sup.run_info, bystander).unwrap();
    crate::services::start_service(&sup.run_info, critical).unwrap();

    let deadline = std::time::Instant::now() + Duration::from_secs(10);
    while !sup.run_info.cancel.is_cancelled() && std::time::Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(10));
    }
    assert!(sup.run_info.cancel.is_cancelled());
    assert_eq!(sup.state(critical), ServiceState::Failed);
    assert_eq!(sup.state(bystander), ServiceState::Stopped);
    assert_eq!(sup.run_info.exit_reason(), Some(ExitReason::Emergency));
    assert_eq!(ExitReason::Emergency.exit_code(), crate::runtime_info::EMERGENCY_EXIT_CODE);
}
