//! Dependency graph resolution for accessories.
//!
//! The graph is built fresh from the accessory list on every call and never
//! kept around. Nodes are accessory identifiers; an edge `A -> B` means `A`
//! depends on `B`, so `B` has to be running before `A` starts.
//!
//! Ordering is Kahn's algorithm with one rule on top: when several accessories
//! are ready at once, the one declared first goes first. Two runs over the
//! same configuration therefore always produce the same order.

use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};

use crate::error::{OrchestratorError, Result};
use crate::topology::AccessorySpec;

/// A resolved execution order over accessory identifiers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionOrder {
    forward: Vec<String>,
    dependencies: HashMap<String, Vec<String>>,
}

impl ExecutionOrder {
    /// Returns the start-up order: dependencies before dependents.
    pub fn forward(&self) -> &[String] {
        &self.forward
    }

    /// Returns the teardown order, the exact reverse of [`forward`](Self::forward).
    pub fn reverse(&self) -> Vec<String> {
        self.forward.iter().rev().cloned().collect()
    }

    /// Returns the direct dependencies of an accessory.
    pub fn dependencies_of(&self, id: &str) -> &[String] {
        self.dependencies.get(id).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Returns true if the order contains no accessories.
    pub fn is_empty(&self) -> bool {
        self.forward.is_empty()
    }

    /// Returns the named accessories plus everything they transitively depend
    /// on, in forward order.
    pub fn closure(&self, names: &[String]) -> Result<Vec<String>> {
        let selected = self.walk(names, |id| self.dependencies_of(id).to_vec())?;
        Ok(self.filter_forward(&selected))
    }

    /// Returns the named accessories plus everything that transitively depends
    /// on them, in forward order.
    pub fn dependents_closure(&self, names: &[String]) -> Result<Vec<String>> {
        let mut dependents: HashMap<&str, Vec<String>> = HashMap::new();
        for (id, deps) in &self.dependencies {
            for dep in deps {
                dependents.entry(dep.as_str()).or_default().push(id.clone());
            }
        }
        let selected = self.walk(names, |id| dependents.get(id).cloned().unwrap_or_default())?;
        Ok(self.filter_forward(&selected))
    }

    fn walk<F>(&self, names: &[String], next: F) -> Result<HashSet<String>>
    where
        F: Fn(&str) -> Vec<String>,
    {
        let mut seen = HashSet::new();
        let mut queue = VecDeque::new();

        for name in names {
            if !self.dependencies.contains_key(name) {
                return Err(OrchestratorError::unknown_accessory(name));
            }
            queue.push_back(name.clone());
        }

        while let Some(id) = queue.pop_front() {
            if seen.insert(id.clone()) {
                queue.extend(next(&id));
            }
        }

        Ok(seen)
    }

    fn filter_forward(&self, selected: &HashSet<String>) -> Vec<String> {
        self.forward
            .iter()
            .filter(|id| selected.contains(*id))
            .cloned()
            .collect()
    }
}

/// Resolves the start-up order of the given accessories.
///
/// # Errors
///
/// - [`OrchestratorError::UnknownDependency`] if an accessory references an
///   identifier that is not declared. The first offending reference in
///   declaration order is reported.
/// - [`OrchestratorError::Cycle`] with the full cycle path if the graph is
///   not acyclic. No partial order is returned.
pub fn resolve(accessories: &[AccessorySpec]) -> Result<ExecutionOrder> {
    let index: HashMap<&str, usize> = accessories
        .iter()
        .enumerate()
        .map(|(i, a)| (a.id.as_str(), i))
        .collect();

    // deps[i] are the nodes i depends on, dependents[j] the nodes waiting on j.
    let mut deps: Vec<Vec<usize>> = Vec::with_capacity(accessories.len());
    let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); accessories.len()];

    for (i, accessory) in accessories.iter().enumerate() {
        let mut node_deps = Vec::with_capacity(accessory.depends_on.len());
        for dep in &accessory.depends_on {
            let j = *index
                .get(dep.as_str())
                .ok_or_else(|| OrchestratorError::unknown_dependency(dep, &accessory.id))?;
            if !node_deps.contains(&j) {
                node_deps.push(j);
                dependents[j].push(i);
            }
        }
        deps.push(node_deps);
    }

    let mut remaining: Vec<usize> = deps.iter().map(Vec::len).collect();
    let mut ready: BTreeSet<usize> = (0..accessories.len())
        .filter(|&i| remaining[i] == 0)
        .collect();
    let mut order = Vec::with_capacity(accessories.len());

    while let Some(i) = ready.pop_first() {
        order.push(i);
        for &d in &dependents[i] {
            remaining[d] -= 1;
            if remaining[d] == 0 {
                ready.insert(d);
            }
        }
    }

    if order.len() < accessories.len() {
        let path = find_cycle(&deps, &remaining)
            .into_iter()
            .map(|i| accessories[i].id.clone())
            .collect();
        return Err(OrchestratorError::cycle(path));
    }

    Ok(ExecutionOrder {
        forward: order.iter().map(|&i| accessories[i].id.clone()).collect(),
        dependencies: accessories
            .iter()
            .map(|a| (a.id.clone(), a.depends_on.clone()))
            .collect(),
    })
}

/// Follows unresolved dependencies from the first stuck node until a node
/// repeats. Every stuck node has at least one stuck dependency, so the walk
/// always closes a cycle.
fn find_cycle(deps: &[Vec<usize>], remaining: &[usize]) -> Vec<usize> {
    let stuck = |i: usize| remaining[i] > 0;

    let Some(start) = (0..deps.len()).find(|&i| stuck(i)) else {
        return Vec::new();
    };

    let mut path = vec![start];
    let mut position: HashMap<usize, usize> = HashMap::from([(start, 0)]);
    let mut current = start;

    loop {
        let Some(&next) = deps[current].iter().find(|&&j| stuck(j)) else {
            return path;
        };
        if let Some(&at) = position.get(&next) {
            let mut cycle = path.split_off(at);
            cycle.push(next);
            return cycle;
        }
        position.insert(next, path.len());
        path.push(next);
        current = next;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;

    fn accessory(id: &str, deps: &[&str]) -> AccessorySpec {
        deps.iter()
            .fold(AccessorySpec::builder(id).image("busybox"), |b, d| {
                b.depends_on(*d)
            })
            .build()
            .unwrap()
    }

    fn ids(order: &[String]) -> Vec<&str> {
        order.iter().map(String::as_str).collect()
    }

    #[test]
    fn test_declaration_order_breaks_ties() {
        let accessories = vec![
            accessory("db", &[]),
            accessory("cache", &[]),
            accessory("api", &["db", "cache"]),
        ];
        let order = resolve(&accessories).unwrap();

        assert_eq!(ids(order.forward()), vec!["db", "cache", "api"]);
        assert_eq!(order.reverse(), vec!["api", "cache", "db"]);
    }

    #[test]
    fn test_dependency_declared_after_dependent() {
        let accessories = vec![
            accessory("api", &["db"]),
            accessory("worker", &[]),
            accessory("db", &[]),
        ];
        let order = resolve(&accessories).unwrap();

        assert_eq!(ids(order.forward()), vec!["worker", "db", "api"]);
    }

    #[test]
    fn test_unknown_dependency() {
        let accessories = vec![accessory("db", &[]), accessory("api", &["db", "ghost"])];
        let err = resolve(&accessories).unwrap_err();

        assert_eq!(err, OrchestratorError::unknown_dependency("ghost", "api"));
    }

    #[test]
    fn test_cycle_reports_full_path() {
        let accessories = vec![
            accessory("web", &["a"]),
            accessory("a", &["b"]),
            accessory("b", &["c"]),
            accessory("c", &["a"]),
        ];
        let err = resolve(&accessories).unwrap_err();

        match err {
            OrchestratorError::Cycle { path } => {
                assert_eq!(ids(&path), vec!["a", "b", "c", "a"]);
            }
            other => panic!("expected cycle, got {other:?}"),
        }
    }

    #[test]
    fn test_two_node_cycle() {
        let accessories = vec![accessory("a", &["b"]), accessory("b", &["a"])];
        let err = resolve(&accessories).unwrap_err();

        assert_eq!(err.to_string(), "dependency cycle detected: a -> b -> a");
    }

    #[test]
    fn test_empty_graph() {
        let order = resolve(&[]).unwrap();
        assert!(order.is_empty());
        assert!(order.reverse().is_empty());
    }

    #[test]
    fn test_closure_pulls_in_dependencies() {
        let accessories = vec![
            accessory("db", &[]),
            accessory("cache", &[]),
            accessory("search", &[]),
            accessory("api", &["db", "cache"]),
        ];
        let order = resolve(&accessories).unwrap();

        let closure = order.closure(&["api".to_string()]).unwrap();
        assert_eq!(ids(&closure), vec!["db", "cache", "api"]);

        let closure = order.closure(&["search".to_string()]).unwrap();
        assert_eq!(ids(&closure), vec!["search"]);

        let err = order.closure(&["queue".to_string()]).unwrap_err();
        assert_eq!(err, OrchestratorError::unknown_accessory("queue"));
    }

    #[test]
    fn test_dependents_closure() {
        let accessories = vec![
            accessory("db", &[]),
            accessory("cache", &[]),
            accessory("api", &["db"]),
            accessory("worker", &["api"]),
        ];
        let order = resolve(&accessories).unwrap();

        let closure = order.dependents_closure(&["db".to_string()]).unwrap();
        assert_eq!(ids(&closure), vec!["db", "api", "worker"]);
        assert_eq!(order.dependencies_of("api"), &["db".to_string()]);
    }

    /// A random DAG: node `i` may depend only on nodes with a lower number,
    /// declared in a shuffled order.
    fn arb_dag() -> impl Strategy<Value = Vec<AccessorySpec>> {
        (1usize..12)
            .prop_flat_map(|n| {
                (
                    proptest::collection::vec(proptest::collection::vec(any::<bool>(), n), n),
                    Just((0..n).collect::<Vec<_>>()).prop_shuffle(),
                )
            })
            .prop_map(|(edges, declared)| {
                declared
                    .into_iter()
                    .map(|i| {
                        let deps: Vec<String> = (0..i)
                            .filter(|&j| edges[i][j])
                            .map(|j| format!("n{j}"))
                            .collect();
                        let deps: Vec<&str> = deps.iter().map(String::as_str).collect();
                        accessory(&format!("n{i}"), &deps)
                    })
                    .collect()
            })
    }

    proptest! {
        #[test]
        fn prop_dependencies_come_first(accessories in arb_dag()) {
            let order = resolve(&accessories).unwrap();
            let position: HashMap<&str, usize> = order
                .forward()
                .iter()
                .enumerate()
                .map(|(i, id)| (id.as_str(), i))
                .collect();

            prop_assert_eq!(position.len(), accessories.len());
            for accessory in &accessories {
                for dep in &accessory.depends_on {
                    prop_assert!(position[dep.as_str()] < position[accessory.id.as_str()]);
                }
            }
        }

        #[test]
        fn prop_reverse_is_exact(accessories in arb_dag()) {
            let order = resolve(&accessories).unwrap();
            let mut reversed = order.reverse();
            reversed.reverse();
            prop_assert_eq!(reversed.as_slice(), order.forward());
        }

        #[test]
        fn prop_resolution_is_deterministic(accessories in arb_dag()) {
            prop_assert_eq!(resolve(&accessories).unwrap(), resolve(&accessories).unwrap());
        }

        #[test]
        fn prop_cycles_never_resolve(len in 2usize..8, extra in 0usize..4) {
            // A ring n0 -> n1 -> ... -> n0 plus some independent nodes.
            let mut accessories: Vec<AccessorySpec> = (0..extra)
                .map(|i| accessory(&format!("free{i}"), &[]))
                .collect();
            for i in 0..len {
                let dep = format!("n{}", (i + 1) % len);
                accessories.push(accessory(&format!("n{i}"), &[dep.as_str()]));
            }

            match resolve(&accessories) {
                Err(OrchestratorError::Cycle { path }) => {
                    prop_assert_eq!(path.len(), len + 1);
                    prop_assert_eq!(path.first(), path.last());
                }
                other => prop_assert!(false, "expected cycle, got {:?}", other),
            }
        }
    }
}
