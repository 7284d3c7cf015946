use crate::errors::SupervisorError;
use crate::units::dependency_resolving::*;

fn node(requires: &[&str], wants: &[&str]) -> DeclaredDependencies {
    DeclaredDependencies {
        requires: requires.iter().map(|s| s.to_string()).collect(),
        wants: wants.iter().map(|s| s.to_string()).collect(),
        ..Default::default()
    }
}

fn graph(nodes: Vec<(&str, DeclaredDependencies)>) -> DependencyGraph {
    let mut graph = DependencyGraph::default();
    for (name, deps) in nodes {
        graph.insert(name, deps);
    }
    graph
}

fn position(order: &[String], name: &str) -> usize {
    order.iter().position(|n| n == name).unwrap()
}

#[test]
fn test_start_order() {
    let graph = graph(vec![
        ("network", node(&[], &[])),
        ("db", node(&["network"], &[])),
        ("cache", node(&[], &[])),
        ("app", node(&["db"], &["cache", "not-loaded"])),
        ("unrelated", node(&[], &[])),
    ]);

    let order = start_order(&graph, "app").unwrap();
    assert_eq!(order.len(), 4);
    assert_eq!(order.last().unwrap(), "app");
    assert!(position(&order, "network") < position(&order, "db"));
    assert!(!order.contains(&"unrelated".to_owned()));
    assert!(!order.contains(&"not-loaded".to_owned()));

    assert!(matches!(
        start_order(&graph, "missing"),
        Err(SupervisorError::NotFound(_))
    ));
}

#[test]
fn test_ordering_hints() {
    let mut logger = node(&[], &[]);
    logger.before = vec!["db".into()];
    let mut db = node(&[], &[]);
    db.after = vec!["migrations".into()];
    let graph = graph(vec![
        ("migrations", node(&[], &[])),
        ("db", db),
        ("logger", logger),
        ("app", node(&["db"], &["logger", "migrations"])),
    ]);

    let order = start_order(&graph, "app").unwrap();
    assert!(position(&order, "logger") < position(&order, "db"));
    assert!(position(&order, "migrations") < position(&order, "db"));
    assert_eq!(order.last().unwrap(), "app");

    // hints alone never pull services into the order
    let order = start_order(&graph, "db").unwrap();
    assert_eq!(order, vec!["db".to_owned()]);
}

#[test]
fn test_stop_order() {
    let graph = graph(vec![
        ("network", node(&[], &[])),
        ("db", node(&["network"], &[])),
        ("app", node(&["db"], &[])),
        ("web", node(&["app", "network"], &[])),
        ("metrics", node(&[], &["network"])),
    ]);

    let order = stop_order(&graph, "network").unwrap();
    assert_eq!(order.last().unwrap(), "network");
    assert!(position(&order, "web") < position(&order, "app"));
    assert!(position(&order, "app") < position(&order, "db"));
    // soft dependents are left alone
    assert!(!order.contains(&"metrics".to_owned()));

    let mut dependents = hard_dependents(&graph, "network");
    dependents.sort();
    assert_eq!(dependents, vec!["db".to_owned(), "web".to_owned()]);

    let closure = hard_closure(&graph, "web");
    assert_eq!(closure.len(), 3);
    assert!(closure.contains("network"));
}

#[test]
fn test_circle() {
    let graph = graph(vec![
        ("a", node(&["c"], &[])),
        ("b", node(&["a"], &[])),
        ("c", node(&["b"], &[])),
    ]);

    let cycles = find_hard_cycles(&graph);
    assert_eq!(cycles.len(), 1);
    let cycle = &cycles[0];
    // closed path: first and last are the same service
    assert_eq!(cycle.len(), 4);
    assert_eq!(cycle.first(), cycle.last());
    for name in &["a", "b", "c"] {
        assert!(cycle.contains(&name.to_string()));
    }

    assert!(matches!(
        validate(&graph),
        Err(SupervisorError::DependencyCycle(_))
    ));
    assert!(matches!(
        start_order(&graph, "a"),
        Err(SupervisorError::DependencyCycle(_))
    ));
}

#[test]
fn test_soft_circle() {
    let graph = graph(vec![
        ("a", node(&[], &["b"])),
        ("b", node(&[], &["a"])),
        ("c", node(&["a"], &[])),
    ]);

    // a cycle through wants is fine to load and boot, but a targeted start refuses it
    validate(&graph).unwrap();
    let full = full_start_order(&graph).unwrap();
    assert_eq!(full.len(), 3);
    assert!(position(&full, "a") < position(&full, "c"));
    assert!(matches!(
        start_order(&graph, "c"),
        Err(SupervisorError::DependencyCycle(_))
    ));
}

#[test]
fn test_conflicts() {
    let mut new = node(&[], &[]);
    new.conflicts = vec!["old".into()];
    let graph = graph(vec![
        ("old", node(&[], &[])),
        ("new", new.clone()),
        ("other", node(&[], &[])),
    ]);
    assert_eq!(conflicts_of(&graph, "new"), vec!["old".to_owned()]);
    assert_eq!(conflicts_of(&graph, "old"), vec!["new".to_owned()]);
    assert!(conflicts_of(&graph, "other").is_empty());
    validate(&graph).unwrap();

    // requiring something you conflict with can never work
    let mut broken = new;
    broken.requires = vec!["mid".into()];
    let graph = graph_with(&graph, "new", broken);
    let graph = graph_with(&graph, "mid", node(&["old"], &[]));
    assert!(matches!(
        validate(&graph),
        Err(SupervisorError::InvalidConfig(_))
    ));
}

fn graph_with(graph: &DependencyGraph, name: &str, deps: DeclaredDependencies) -> DependencyGraph {
    graph.with_replaced(name, deps)
}

#[test]
fn test_missing_requirement() {
    let graph = graph(vec![("app", node(&["db"], &[]))]);
    assert!(matches!(
        validate(&graph),
        Err(SupervisorError::InvalidConfig(_))
    ));
}

#[test]
fn test_remove_required_service() {
    let graph = graph(vec![
        ("db", node(&[], &[])),
        ("app", node(&["db"], &["cache"])),
        ("cache", node(&[], &[])),
    ]);
    assert!(validate_without(&graph, "db").is_err());
    validate_without(&graph, "cache").unwrap();
    validate_without(&graph, "app").unwrap();
}
