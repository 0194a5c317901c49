//! Incremental ready-set over cached in-degrees

use std::collections::{HashMap, HashSet, VecDeque};

use tracing::debug;

use super::graph::TaskGraph;

/// Drains a validated graph in dependency order
///
/// Each task's count of unsatisfied dependencies is computed once; completing
/// a task decrements only its dependents, so draining is O(V+E) overall.
#[derive(Debug, Clone)]
pub struct Frontier {
    in_degree: HashMap<String, usize>,
    dependents: HashMap<String, Vec<String>>,
    ready: VecDeque<String>,
    blocked: HashSet<String>,
}

impl Frontier {
    pub(crate) fn new(graph: &TaskGraph) -> Self {
        let mut in_degree = HashMap::new();
        let mut ready = VecDeque::new();
        for task in graph.tasks() {
            let unique: HashSet<&String> = task.dependencies.iter().collect();
            if unique.is_empty() {
                ready.push_back(task.task_id.clone());
            }
            in_degree.insert(task.task_id.clone(), unique.len());
        }
        debug!(tasks = in_degree.len(), ready = ready.len(), "Frontier::new: called");
        Self {
            in_degree,
            dependents: graph.dependents(),
            ready,
            blocked: HashSet::new(),
        }
    }

    /// Pop the next runnable task (FIFO)
    pub fn next_ready(&mut self) -> Option<String> {
        self.ready.pop_front()
    }

    pub fn has_ready(&self) -> bool {
        !self.ready.is_empty()
    }

    /// Record a completion; returns the tasks that just became ready
    pub fn complete(&mut self, task_id: &str) -> Vec<String> {
        debug!(%task_id, "Frontier::complete: called");
        let mut newly_ready = Vec::new();
        for dependent in self.dependents.get(task_id).cloned().unwrap_or_default() {
            if self.blocked.contains(&dependent) {
                continue;
            }
            if let Some(count) = self.in_degree.get_mut(&dependent) {
                *count = count.saturating_sub(1);
                if *count == 0 {
                    self.ready.push_back(dependent.clone());
                    newly_ready.push(dependent);
                }
            }
        }
        newly_ready
    }

    /// Record that a task will never complete; returns every transitive
    /// dependent that can now never run
    pub fn block(&mut self, task_id: &str) -> Vec<String> {
        debug!(%task_id, "Frontier::block: called");
        let mut skipped = Vec::new();
        let mut queue: VecDeque<String> = VecDeque::from([task_id.to_string()]);
        while let Some(current) = queue.pop_front() {
            for dependent in self.dependents.get(&current).cloned().unwrap_or_default() {
                if self.blocked.insert(dependent.clone()) {
                    self.ready.retain(|id| id != &dependent);
                    skipped.push(dependent.clone());
                    queue.push_back(dependent);
                }
            }
        }
        skipped
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::Task;

    fn graph() -> TaskGraph {
        // A -> B -> D, A -> C, E independent
        let mut g = TaskGraph::new();
        g.add_task(Task::new("A", "edit")).unwrap();
        g.add_task(Task::new("B", "edit").with_deps(["A"])).unwrap();
        g.add_task(Task::new("C", "edit").with_deps(["A"])).unwrap();
        g.add_task(Task::new("D", "edit").with_deps(["B", "C"])).unwrap();
        g.add_task(Task::new("E", "edit")).unwrap();
        g
    }

    #[test]
    fn test_drains_in_dependency_order() {
        let g = graph();
        let mut frontier = g.frontier().unwrap();
        let mut order = Vec::new();
        while let Some(id) = frontier.next_ready() {
            frontier.complete(&id);
            order.push(id);
        }
        assert_eq!(order, vec!["A", "E", "B", "C", "D"]);
    }

    #[test]
    fn test_complete_reports_newly_ready() {
        let g = graph();
        let mut frontier = g.frontier().unwrap();
        assert_eq!(frontier.complete("A"), vec!["B".to_string(), "C".to_string()]);
        assert!(frontier.complete("B").is_empty());
        assert_eq!(frontier.complete("C"), vec!["D".to_string()]);
    }

    #[test]
    fn test_block_skips_transitive_dependents() {
        let g = graph();
        let mut frontier = g.frontier().unwrap();
        assert_eq!(frontier.next_ready().as_deref(), Some("A"));
        let skipped = frontier.block("A");
        assert_eq!(skipped, vec!["B".to_string(), "C".to_string(), "D".to_string()]);
        assert_eq!(frontier.next_ready().as_deref(), Some("E"));
        assert!(frontier.next_ready().is_none());
    }

    #[test]
    fn test_invalid_graph_has_no_frontier() {
        let mut g = TaskGraph::new();
        g.add_task(Task::new("B", "edit").with_deps(["A"])).unwrap();
        assert!(g.frontier().is_err());
    }
}
