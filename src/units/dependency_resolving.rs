//! Start and stop ordering from the declared relationships between services.
//!
//! All functions here are pure queries over a snapshot of the declared dependencies,
//! they never touch runtime state.

use super::ServiceConfig;
use crate::errors::{Result, SupervisorError};

use log::{trace, warn};
use std::collections::{BTreeMap, BTreeSet, HashMap};

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DeclaredDependencies {
    pub requires: Vec<String>,
    pub wants: Vec<String>,
    pub conflicts: Vec<String>,
    pub before: Vec<String>,
    pub after: Vec<String>,
}

impl DeclaredDependencies {
    pub fn from_config(conf: &ServiceConfig) -> Self {
        DeclaredDependencies {
            requires: conf.requires.clone(),
            wants: conf.wants.clone(),
            conflicts: conf.conflicts.clone(),
            before: conf.before.clone(),
            after: conf.after.clone(),
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct DependencyGraph {
    nodes: BTreeMap<String, DeclaredDependencies>,
}

impl DependencyGraph {
    pub fn insert(&mut self, name: &str, deps: DeclaredDependencies) {
        self.nodes.insert(name.to_owned(), deps);
    }

    pub fn get(&self, name: &str) -> Option<&DeclaredDependencies> {
        self.nodes.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.nodes.contains_key(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &String> {
        self.nodes.keys()
    }

    /// Same graph but with `name` declaring `deps`. Used to validate a config before applying it.
    pub fn with_replaced(&self, name: &str, deps: DeclaredDependencies) -> Self {
        let mut graph = self.clone();
        graph.insert(name, deps);
        graph
    }

    fn without(&self, name: &str) -> Self {
        let mut graph = self.clone();
        graph.nodes.remove(name);
        graph
    }

    /// name -> everyone that hard-requires name
    fn reverse_hard_index(&self) -> HashMap<&str, Vec<&str>> {
        let mut index: HashMap<&str, Vec<&str>> = HashMap::new();
        for (name, deps) in &self.nodes {
            for required in &deps.requires {
                index.entry(required.as_str()).or_default().push(name.as_str());
            }
        }
        index
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Mark {
    OnStack,
    Done,
}

/// Depth first post-order over requires+wants edges. A node that is revisited while still on the
/// stack is a cycle. With `strict` unset cycles are only logged and the closing edge is skipped.
fn dependency_post_order(
    graph: &DependencyGraph,
    roots: &[String],
    strict: bool,
) -> Result<Vec<String>> {
    let mut marks: HashMap<String, Mark> = HashMap::new();
    let mut stack: Vec<String> = Vec::new();
    let mut order = Vec::new();

    fn visit(
        graph: &DependencyGraph,
        name: &str,
        strict: bool,
        marks: &mut HashMap<String, Mark>,
        stack: &mut Vec<String>,
        order: &mut Vec<String>,
    ) -> Result<()> {
        match marks.get(name) {
            Some(Mark::Done) => return Ok(()),
            Some(Mark::OnStack) => {
                let start = stack.iter().position(|n| n == name).unwrap_or(0);
                let mut cycle: Vec<String> = stack[start..].to_vec();
                cycle.push(name.to_owned());
                if strict {
                    return Err(SupervisorError::DependencyCycle(cycle));
                }
                warn!("Ignoring dependency cycle: {}", cycle.join(" -> "));
                return Ok(());
            }
            None => {}
        }
        let deps = match graph.get(name) {
            Some(deps) => deps,
            None => return Ok(()),
        };
        marks.insert(name.to_owned(), Mark::OnStack);
        stack.push(name.to_owned());
        for required in &deps.requires {
            if !graph.contains(required) {
                return Err(SupervisorError::InvalidConfig(format!(
                    "{} requires {} which is not loaded",
                    name, required
                )));
            }
            visit(graph, required, strict, marks, stack, order)?;
        }
        for wanted in &deps.wants {
            if graph.contains(wanted) {
                visit(graph, wanted, strict, marks, stack, order)?;
            } else {
                trace!("{} wants {} which is not loaded, ignoring", name, wanted);
            }
        }
        stack.pop();
        marks.insert(name.to_owned(), Mark::Done);
        order.push(name.to_owned());
        Ok(())
    }

    for root in roots {
        visit(graph, root, strict, &mut marks, &mut stack, &mut order)?;
    }
    Ok(order)
}

/// Reorder `base` so that ordering hints between its members are honored too.
/// Falls back to `base` if the hints contradict each other.
fn apply_ordering_hints(graph: &DependencyGraph, base: Vec<String>) -> Vec<String> {
    let position: HashMap<&str, usize> = base
        .iter()
        .enumerate()
        .map(|(idx, name)| (name.as_str(), idx))
        .collect();

    // predecessors[x] = members that have to start before x
    let mut predecessors: Vec<BTreeSet<usize>> = vec![BTreeSet::new(); base.len()];
    for (idx, name) in base.iter().enumerate() {
        let deps = match graph.get(name) {
            Some(deps) => deps,
            None => continue,
        };
        for earlier in deps
            .requires
            .iter()
            .chain(deps.wants.iter())
            .chain(deps.after.iter())
        {
            if let Some(other) = position.get(earlier.as_str()) {
                if *other != idx {
                    predecessors[idx].insert(*other);
                }
            }
        }
        for later in &deps.before {
            if let Some(other) = position.get(later.as_str()) {
                if *other != idx {
                    predecessors[*other].insert(idx);
                }
            }
        }
    }

    // Kahn's algorithm, ties broken by the position in the dependency order
    let mut placed = vec![false; base.len()];
    let mut order = Vec::with_capacity(base.len());
    while order.len() < base.len() {
        let next = (0..base.len())
            .find(|idx| !placed[*idx] && predecessors[*idx].iter().all(|pred| placed[*pred]));
        match next {
            Some(idx) => {
                placed[idx] = true;
                order.push(base[idx].clone());
            }
            None => {
                warn!(
                    "Ordering hints between {} contradict each other, ignoring them",
                    base.join(", ")
                );
                return base;
            }
        }
    }
    order
}

/// Everything `target` needs started (requires and wants, transitively) followed by `target` itself
pub fn start_order(graph: &DependencyGraph, target: &str) -> Result<Vec<String>> {
    if !graph.contains(target) {
        return Err(SupervisorError::NotFound(target.to_owned()));
    }
    let base = dependency_post_order(graph, &[target.to_owned()], true)?;
    let mut order = apply_ordering_hints(graph, base);
    // hints must not move anything behind the target
    if let Some(pos) = order.iter().position(|name| name == target) {
        let name = order.remove(pos);
        order.push(name);
    }
    Ok(order)
}

/// Start order for the whole graph. Used for booting, reversed for shutting down.
pub fn full_start_order(graph: &DependencyGraph) -> Result<Vec<String>> {
    let roots: Vec<String> = graph.names().cloned().collect();
    let base = dependency_post_order(graph, &roots, false)?;
    Ok(apply_ordering_hints(graph, base))
}

/// Everything that transitively hard-depends on `target`, in an order that is safe to stop them in,
/// followed by `target` itself
pub fn stop_order(graph: &DependencyGraph, target: &str) -> Result<Vec<String>> {
    if !graph.contains(target) {
        return Err(SupervisorError::NotFound(target.to_owned()));
    }
    let index = graph.reverse_hard_index();
    let mut members: BTreeSet<&str> = BTreeSet::new();
    let mut todo = vec![target];
    while let Some(name) = todo.pop() {
        if !members.insert(name) {
            continue;
        }
        if let Some(dependents) = index.get(name) {
            todo.extend(dependents.iter());
        }
    }

    // post-order over requires restricted to the members gives dependencies first
    let mut done: BTreeSet<&str> = BTreeSet::new();
    let mut order: Vec<String> = Vec::new();
    fn visit<'a>(
        graph: &'a DependencyGraph,
        name: &'a str,
        members: &BTreeSet<&'a str>,
        done: &mut BTreeSet<&'a str>,
        order: &mut Vec<String>,
    ) {
        if !done.insert(name) {
            return;
        }
        if let Some(deps) = graph.get(name) {
            for required in &deps.requires {
                if members.contains(required.as_str()) {
                    visit(graph, required.as_str(), members, done, order);
                }
            }
        }
        order.push(name.to_owned());
    }
    for name in &members {
        visit(graph, *name, &members, &mut done, &mut order);
    }
    order.reverse();
    // target is required by all others so it is already last, this only guards against hard cycles
    if let Some(pos) = order.iter().position(|name| name == target) {
        let name = order.remove(pos);
        order.push(name);
    }
    Ok(order)
}

/// Services that directly hard-require `target`
pub fn hard_dependents(graph: &DependencyGraph, target: &str) -> Vec<String> {
    graph
        .nodes
        .iter()
        .filter(|(_, deps)| deps.requires.iter().any(|r| r == target))
        .map(|(name, _)| name.clone())
        .collect()
}

/// Transitive requires of `target`, not including `target`
pub fn hard_closure(graph: &DependencyGraph, target: &str) -> BTreeSet<String> {
    let mut closure = BTreeSet::new();
    let mut todo: Vec<&str> = graph
        .get(target)
        .map(|deps| deps.requires.iter().map(String::as_str).collect())
        .unwrap_or_default();
    while let Some(name) = todo.pop() {
        if name == target || !closure.insert(name.to_owned()) {
            continue;
        }
        if let Some(deps) = graph.get(name) {
            todo.extend(deps.requires.iter().map(String::as_str));
        }
    }
    closure
}

/// Conflicts are symmetric: declared on either side they apply to both
pub fn conflicts_of(graph: &DependencyGraph, target: &str) -> Vec<String> {
    let mut conflicts: BTreeSet<String> = graph
        .get(target)
        .map(|deps| deps.conflicts.iter().cloned().collect())
        .unwrap_or_default();
    for (name, deps) in &graph.nodes {
        if deps.conflicts.iter().any(|c| c == target) {
            conflicts.insert(name.clone());
        }
    }
    conflicts.remove(target);
    conflicts.into_iter().collect()
}

/// Find cycles that only use hard edges
pub fn find_hard_cycles(graph: &DependencyGraph) -> Vec<Vec<String>> {
    let mut marks: HashMap<&str, Mark> = HashMap::new();
    let mut stack: Vec<&str> = Vec::new();
    let mut cycles = Vec::new();

    fn search_backedge<'a>(
        graph: &'a DependencyGraph,
        name: &'a str,
        marks: &mut HashMap<&'a str, Mark>,
        stack: &mut Vec<&'a str>,
        cycles: &mut Vec<Vec<String>>,
    ) {
        match marks.get(name) {
            Some(Mark::Done) => return,
            Some(Mark::OnStack) => {
                let start = stack.iter().position(|n| *n == name).unwrap_or(0);
                let mut cycle: Vec<String> = stack[start..].iter().map(|n| n.to_string()).collect();
                cycle.push(name.to_owned());
                cycles.push(cycle);
                return;
            }
            None => {}
        }
        let deps = match graph.get(name) {
            Some(deps) => deps,
            None => return,
        };
        marks.insert(name, Mark::OnStack);
        stack.push(name);
        for required in &deps.requires {
            search_backedge(graph, required.as_str(), marks, stack, cycles);
        }
        stack.pop();
        marks.insert(name, Mark::Done);
    }

    for name in graph.names() {
        search_backedge(graph, name.as_str(), &mut marks, &mut stack, &mut cycles);
    }
    cycles
}

/// Checks run once per load and before any config replacement
pub fn validate(graph: &DependencyGraph) -> Result<()> {
    for (name, deps) in &graph.nodes {
        for required in &deps.requires {
            if !graph.contains(required) {
                return Err(SupervisorError::InvalidConfig(format!(
                    "{} requires {} which is not loaded",
                    name, required
                )));
            }
        }
    }

    if let Some(cycle) = find_hard_cycles(graph).into_iter().next() {
        return Err(SupervisorError::DependencyCycle(cycle));
    }

    for (name, deps) in &graph.nodes {
        if deps.conflicts.iter().any(|c| c == name) {
            return Err(SupervisorError::InvalidConfig(format!(
                "{} conflicts with itself",
                name
            )));
        }
        let closure = hard_closure(graph, name);
        for conflict in conflicts_of(graph, name) {
            if closure.contains(&conflict) {
                return Err(SupervisorError::InvalidConfig(format!(
                    "{} conflicts with {} but also requires it",
                    name, conflict
                )));
            }
        }
    }
    Ok(())
}

/// Validate the graph as it would look after removing `name`
pub fn validate_without(graph: &DependencyGraph, name: &str) -> Result<()> {
    let dependents = hard_dependents(graph, name);
    if !dependents.is_empty() {
        return Err(SupervisorError::InvalidConfig(format!(
            "{} is required by {}",
            name,
            dependents.join(", ")
        )));
    }
    validate(&graph.without(name))
}
