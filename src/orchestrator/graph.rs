//! Task dependency graph.
//!
//! Maintains forward (task → dependencies) and reverse (task → dependents)
//! adjacency so completion updates touch only a task's dependents. All
//! traversals iterate in sorted id order so results are reproducible.

use std::collections::{BTreeSet, HashMap, HashSet};

use crate::error::{NexusError, NexusResult};

/// Dependency graph over task ids.
#[derive(Debug, Default, Clone)]
pub struct DependencyGraph {
    dependencies: HashMap<String, BTreeSet<String>>,
    dependents: HashMap<String, BTreeSet<String>>,
}

impl DependencyGraph {
    /// Empty graph.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of tasks in the graph.
    pub fn len(&self) -> usize {
        self.dependencies.len()
    }

    /// Whether the graph holds no tasks.
    pub fn is_empty(&self) -> bool {
        self.dependencies.is_empty()
    }

    /// Whether `task_id` is present.
    pub fn contains(&self, task_id: &str) -> bool {
        self.dependencies.contains_key(task_id)
    }

    /// All task ids, sorted.
    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.dependencies.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Insert a task with its dependency list.
    pub fn add_task(&mut self, task_id: &str, dependencies: &[String]) {
        let deps: BTreeSet<String> = dependencies.iter().cloned().collect();
        for dep in &deps {
            self.dependents
                .entry(dep.clone())
                .or_default()
                .insert(task_id.to_string());
        }
        self.dependencies.insert(task_id.to_string(), deps);
    }

    /// Remove a task and every edge touching it.
    pub fn remove_task(&mut self, task_id: &str) {
        self.dependencies.remove(task_id);
        self.dependents.remove(task_id);
        for deps in self.dependencies.values_mut() {
            deps.remove(task_id);
        }
        for deps in self.dependents.values_mut() {
            deps.remove(task_id);
        }
    }

    /// Direct dependencies of a task.
    pub fn dependencies(&self, task_id: &str) -> BTreeSet<String> {
        self.dependencies.get(task_id).cloned().unwrap_or_default()
    }

    /// Direct dependents of a task.
    pub fn dependents(&self, task_id: &str) -> BTreeSet<String> {
        self.dependents.get(task_id).cloned().unwrap_or_default()
    }

    /// Every task reachable through the dependency edges.
    pub fn transitive_dependencies(&self, task_id: &str) -> HashSet<String> {
        self.walk(task_id, &self.dependencies)
    }

    /// Every task that transitively depends on this one.
    pub fn transitive_dependents(&self, task_id: &str) -> HashSet<String> {
        self.walk(task_id, &self.dependents)
    }

    fn walk(&self, start: &str, edges: &HashMap<String, BTreeSet<String>>) -> HashSet<String> {
        let mut seen = HashSet::new();
        let mut frontier: Vec<&str> = edges
            .get(start)
            .map(|set| set.iter().map(String::as_str).collect())
            .unwrap_or_default();
        while let Some(id) = frontier.pop() {
            if seen.insert(id.to_string()) {
                if let Some(next) = edges.get(id) {
                    frontier.extend(next.iter().map(String::as_str));
                }
            }
        }
        seen
    }

    /// Find a dependency cycle with a three-coloured DFS.
    ///
    /// Returns the path of ids from the cycle entry back to itself, e.g.
    /// `[a, b, a]`, or `None` when the graph is acyclic.
    pub fn detect_cycles(&self) -> Option<Vec<String>> {
        #[derive(Clone, Copy, PartialEq)]
        enum Colour {
            White,
            Grey,
            Black,
        }

        fn dfs(
            graph: &DependencyGraph,
            task_id: &str,
            colour: &mut HashMap<String, Colour>,
            path: &mut Vec<String>,
        ) -> Option<Vec<String>> {
            colour.insert(task_id.to_string(), Colour::Grey);
            path.push(task_id.to_string());

            for dep in graph.dependencies(task_id) {
                match colour.get(dep.as_str()) {
                    // Edge into a task that was never added: ignored here,
                    // closure validation happens at plan creation.
                    None => continue,
                    Some(Colour::Grey) => {
                        let entry = path.iter().position(|id| *id == dep)?;
                        let mut cycle: Vec<String> = path[entry..].to_vec();
                        cycle.push(dep);
                        return Some(cycle);
                    }
                    Some(Colour::White) => {
                        if let Some(cycle) = dfs(graph, &dep, colour, path) {
                            return Some(cycle);
                        }
                    }
                    Some(Colour::Black) => {}
                }
            }

            path.pop();
            colour.insert(task_id.to_string(), Colour::Black);
            None
        }

        let mut colour: HashMap<String, Colour> = self
            .dependencies
            .keys()
            .map(|id| (id.clone(), Colour::White))
            .collect();

        for task_id in self.ids() {
            if colour.get(&task_id) == Some(&Colour::White) {
                let mut path = Vec::new();
                if let Some(cycle) = dfs(self, &task_id, &mut colour, &mut path) {
                    return Some(cycle);
                }
            }
        }
        None
    }

    /// Kahn's algorithm. Fails with `CycleDetected` when nodes remain.
    pub fn topological_sort(&self) -> NexusResult<Vec<String>> {
        let mut in_degree: HashMap<&str, usize> = self
            .dependencies
            .iter()
            .map(|(id, deps)| {
                let present = deps.iter().filter(|d| self.contains(d)).count();
                (id.as_str(), present)
            })
            .collect();

        let mut queue: Vec<&str> = in_degree
            .iter()
            .filter(|(_, degree)| **degree == 0)
            .map(|(id, _)| *id)
            .collect();
        queue.sort();

        let mut order = Vec::with_capacity(self.len());
        let mut cursor = 0;
        while cursor < queue.len() {
            let task_id = queue[cursor];
            cursor += 1;
            order.push(task_id.to_string());

            if let Some(dependents) = self.dependents.get(task_id) {
                for dependent in dependents {
                    if let Some(degree) = in_degree.get_mut(dependent.as_str()) {
                        *degree -= 1;
                        if *degree == 0 {
                            queue.push(dependent.as_str());
                        }
                    }
                }
            }
        }

        if order.len() != self.len() {
            let path = self.detect_cycles().unwrap_or_default();
            return Err(NexusError::CycleDetected { path });
        }
        Ok(order)
    }

    /// Longest dependency chain measured in node count.
    ///
    /// Memoised per vertex; equal-length alternatives resolve to the
    /// lexicographically smallest id so results are reproducible.
    pub fn critical_path(&self) -> Vec<String> {
        fn longest<'a>(
            graph: &'a DependencyGraph,
            task_id: &str,
            memo: &mut HashMap<String, Vec<String>>,
        ) -> Vec<String> {
            if let Some(path) = memo.get(task_id) {
                return path.clone();
            }

            let mut best: Vec<String> = Vec::new();
            for dep in graph.dependencies(task_id) {
                if !graph.contains(&dep) {
                    continue;
                }
                let candidate = longest(graph, &dep, memo);
                if candidate.len() > best.len() {
                    best = candidate;
                }
            }
            best.push(task_id.to_string());
            memo.insert(task_id.to_string(), best.clone());
            best
        }

        let mut memo = HashMap::new();
        let mut critical: Vec<String> = Vec::new();
        for task_id in self.ids() {
            let path = longest(self, &task_id, &mut memo);
            if path.len() > critical.len() {
                critical = path;
            }
        }
        critical
    }

    /// Greedy layering: phase 0 holds tasks with no pending dependencies,
    /// each later phase holds tasks whose dependencies all sit in earlier
    /// phases.
    pub fn phases(&self) -> Vec<Vec<String>> {
        let mut phases: Vec<Vec<String>> = Vec::new();
        let mut placed: HashSet<String> = HashSet::new();
        let mut remaining: BTreeSet<String> = self.dependencies.keys().cloned().collect();

        while !remaining.is_empty() {
            let ready: Vec<String> = remaining
                .iter()
                .filter(|id| {
                    self.dependencies(id)
                        .iter()
                        .all(|dep| placed.contains(dep) || !self.contains(dep))
                })
                .cloned()
                .collect();
            if ready.is_empty() {
                // Only a cycle stalls layering; leave the remainder out.
                break;
            }
            for id in &ready {
                placed.insert(id.clone());
                remaining.remove(id);
            }
            phases.push(ready);
        }
        phases
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn diamond() -> DependencyGraph {
        let mut graph = DependencyGraph::new();
        graph.add_task("a", &[]);
        graph.add_task("b", &["a".to_string()]);
        graph.add_task("c", &["a".to_string()]);
        graph.add_task("d", &["b".to_string(), "c".to_string()]);
        graph
    }

    #[test]
    fn phases_layer_the_diamond() {
        let graph = diamond();
        assert_eq!(
            graph.phases(),
            vec![
                vec!["a".to_string()],
                vec!["b".to_string(), "c".to_string()],
                vec!["d".to_string()],
            ]
        );
    }

    #[test]
    fn topological_sort_respects_edges() {
        let graph = diamond();
        let order = graph.topological_sort().unwrap();
        let position = |id: &str| order.iter().position(|x| x == id).unwrap();
        assert!(position("a") < position("b"));
        assert!(position("a") < position("c"));
        assert!(position("b") < position("d"));
        assert!(position("c") < position("d"));
    }

    #[test]
    fn cycle_is_detected_with_its_path() {
        let mut graph = DependencyGraph::new();
        graph.add_task("a", &["b".to_string()]);
        graph.add_task("b", &["a".to_string()]);

        let cycle = graph.detect_cycles().expect("cycle expected");
        assert_eq!(cycle.len(), 3);
        assert_eq!(cycle.first(), cycle.last());
        assert!(cycle.contains(&"a".to_string()));
        assert!(cycle.contains(&"b".to_string()));

        match graph.topological_sort() {
            Err(NexusError::CycleDetected { path }) => assert_eq!(path.len(), 3),
            other => panic!("expected cycle error, got {other:?}"),
        }
    }

    #[test]
    fn sort_raises_iff_cycles_exist() {
        let acyclic = diamond();
        assert!(acyclic.detect_cycles().is_none());
        assert!(acyclic.topological_sort().is_ok());
    }

    #[test]
    fn critical_path_is_the_longest_chain() {
        let mut graph = diamond();
        graph.add_task("e", &["d".to_string()]);
        let path = graph.critical_path();
        assert_eq!(path.len(), 4);
        assert_eq!(path[0], "a");
        assert_eq!(path[3], "e");
        // The b/c tie resolves to the lexicographically smaller id.
        assert_eq!(path[1], "b");
    }

    #[test]
    fn transitive_dependents_cover_descendants() {
        let graph = diamond();
        let downstream = graph.transitive_dependents("a");
        assert_eq!(downstream.len(), 3);
        assert!(downstream.contains("d"));

        let upstream = graph.transitive_dependencies("d");
        assert_eq!(upstream.len(), 3);
        assert!(upstream.contains("a"));
    }

    #[test]
    fn removal_cleans_both_directions() {
        let mut graph = diamond();
        graph.remove_task("b");
        assert!(!graph.contains("b"));
        assert!(!graph.dependencies("d").contains("b"));
        assert!(!graph.dependents("a").contains("b"));
    }

    #[test]
    fn empty_graph_behaves() {
        let graph = DependencyGraph::new();
        assert!(graph.is_empty());
        assert!(graph.phases().is_empty());
        assert!(graph.topological_sort().unwrap().is_empty());
        assert!(graph.critical_path().is_empty());
    }
}
