use super::harness::shell;
use crate::errors::SupervisorError;
use crate::event_loop::{Event, EventQueue};
use crate::units::{ChildTermination, Direction, Operation, Registry, ServiceState};

use nix::unistd::Pid;
use std::sync::Arc;

fn registry() -> Registry {
    Registry::new(Arc::new(EventQueue::new().unwrap()))
}

#[test]
fn test_handles_go_stale() {
    let registry = registry();
    let first = registry.create("first", shell("true")).unwrap();
    assert_eq!(registry.lookup("first").unwrap(), first);

    registry.remove(first).unwrap();
    assert!(matches!(
        registry.get(first),
        Err(SupervisorError::NotFound(_))
    ));
    assert!(registry.lookup("first").is_err());

    // the slot is reused with a new generation, the old handle still does not resolve
    let second = registry.create("second", shell("true")).unwrap();
    assert_eq!(second.index(), first.index());
    assert_ne!(second.generation(), first.generation());
    assert!(registry.get(first).is_err());
    assert_eq!(registry.get(second).unwrap().name, "second");
}

#[test]
fn test_names() {
    let registry = registry();
    registry.create("web", shell("true")).unwrap();
    assert!(matches!(
        registry.create("web", shell("true")),
        Err(SupervisorError::AlreadyExists(_))
    ));
    for bad in &["", "a/b", "with space", "tab\there"] {
        assert!(matches!(
            registry.create(bad, shell("true")),
            Err(SupervisorError::InvalidArgument(_))
        ));
    }
    assert_eq!(registry.len(), 1);
}

#[test]
fn test_compare_and_set() {
    let registry = registry();
    let id = registry.create("svc", shell("true")).unwrap();

    // states with a process need a pid first
    assert!(!registry
        .compare_and_set_state(id, ServiceState::Stopped, ServiceState::Starting)
        .unwrap());
    // wrong expectation
    assert!(!registry
        .compare_and_set_state(id, ServiceState::Failed, ServiceState::Maintenance)
        .unwrap());
    assert!(registry
        .compare_and_set_state(id, ServiceState::Stopped, ServiceState::Maintenance)
        .unwrap());
    assert_eq!(registry.get(id).unwrap().state(), ServiceState::Maintenance);
    // not an edge of the state machine
    assert!(!registry
        .compare_and_set_state(id, ServiceState::Maintenance, ServiceState::Failed)
        .unwrap());
    assert_eq!(registry.get(id).unwrap().state(), ServiceState::Maintenance);

    let events = registry.events().drain();
    assert!(events.contains(&Event::StatusChange {
        id,
        from: ServiceState::Stopped,
        to: ServiceState::Maintenance,
    }));
}

#[test]
fn test_invalid_transition_fails_service() {
    let registry = registry();
    let id = registry.create("svc", shell("true")).unwrap();
    let service = registry.get(id).unwrap();
    let mut rt = service.lock_runtime();

    assert!(!registry.transition(&service, &mut rt, ServiceState::Stopping));
    assert_eq!(rt.state, ServiceState::Failed);
    assert_eq!(rt.stats.failures, 1);
    assert!(rt.pid_invariant_holds());
}

#[test]
fn test_active_service_can_not_be_removed() {
    let registry = registry();
    let id = registry.create("svc", shell("true")).unwrap();
    let service = registry.get(id).unwrap();
    {
        let mut rt = service.lock_runtime();
        rt.pid = Some(nix::unistd::getpid());
        assert!(registry.transition(&service, &mut rt, ServiceState::Running));
        assert!(rt.pid_invariant_holds());
    }
    assert!(matches!(
        registry.remove(id),
        Err(SupervisorError::InvalidState { .. })
    ));
    {
        let mut rt = service.lock_runtime();
        assert!(registry.transition(&service, &mut rt, ServiceState::Stopped));
        assert!(rt.pid.is_none());
    }
    registry.remove(id).unwrap();
}

#[test]
fn test_remove_and_start_claim_exclude_each_other() {
    let registry = registry();
    let id = registry.create("svc", shell("true")).unwrap();
    let service = registry.get(id).unwrap();

    // a start that already claimed the service blocks the removal
    service.lock_runtime().pending_op = Some(Operation::Start);
    assert!(matches!(
        registry.remove(id),
        Err(SupervisorError::InvalidState { .. })
    ));
    assert!(!service.lock_runtime().removed);
    assert_eq!(registry.lookup("svc").unwrap(), id);

    // once removed, the service is marked so late claims are refused
    service.lock_runtime().pending_op = None;
    registry.remove(id).unwrap();
    assert!(service.lock_runtime().removed);
    assert!(matches!(
        registry.remove(id),
        Err(SupervisorError::NotFound(_))
    ));
}

#[test]
fn test_pid_table() {
    let registry = registry();
    let id = registry.create("svc", shell("true")).unwrap();
    let early = Pid::from_raw(4242);
    let normal = Pid::from_raw(4343);

    // exit reaped before the pid was registered
    registry.park_exit(early, ChildTermination::Exit(1));
    assert_eq!(
        registry.register_pid(early, id),
        Some(ChildTermination::Exit(1))
    );
    assert_eq!(registry.register_pid(normal, id), None);
    assert!(registry.is_tracked(normal));

    assert_eq!(registry.take_pid_owner(normal), Some(id));
    assert_eq!(registry.take_pid_owner(normal), None);
    assert!(!registry.is_tracked(normal));

    registry.park_exit(normal, ChildTermination::Exit(0));
    registry.purge_parked_exits(std::time::Duration::from_secs(0));
    assert_eq!(registry.register_pid(normal, id), None);
}

#[test]
fn test_dependency_order_of_registry() {
    let registry = registry();
    let mut app = shell("true");
    app.requires = vec!["db".into()];
    let app = registry.create("app", app).unwrap();
    let db = registry.create("db", shell("true")).unwrap();

    assert_eq!(
        registry.for_each_in_dependency_order(Direction::Start).unwrap(),
        vec![db, app]
    );
    assert_eq!(
        registry.for_each_in_dependency_order(Direction::Stop).unwrap(),
        vec![app, db]
    );
}
