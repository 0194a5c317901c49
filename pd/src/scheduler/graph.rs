//! Task graph: validation, cycle detection and ordering

use std::collections::{HashMap, HashSet, VecDeque};

use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use crate::domain::{Lifecycle, Task, TaskGraphDocument, TaskStatus, TransitionError};

use super::frontier::Frontier;

/// Graph-level errors; every one of these is fatal for the whole run
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GraphError {
    #[error("Duplicate task id: {0}")]
    DuplicateTask(String),

    #[error("Task {task} depends on missing task {missing}")]
    MissingDependency { task: String, missing: String },

    #[error("Dependency cycle detected: {}", .0.join(" -> "))]
    Cycle(Vec<String>),

    #[error("Unknown task: {0}")]
    UnknownTask(String),

    #[error(transparent)]
    Transition(#[from] TransitionError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mark {
    Unvisited,
    InProgress,
    Done,
}

/// The tasks of one run, kept in insertion order
#[derive(Debug, Clone, Default)]
pub struct TaskGraph {
    tasks: Vec<Task>,
    index: HashMap<String, usize>,
}

impl TaskGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a graph from the planning layer's document
    pub fn from_document(doc: TaskGraphDocument) -> Result<Self, GraphError> {
        debug!(tasks = doc.tasks.len(), "TaskGraph::from_document: called");
        let mut graph = Self::new();
        for task in doc.tasks {
            graph.add_task(task)?;
        }
        Ok(graph)
    }

    /// Add a task; ids must be unique
    pub fn add_task(&mut self, task: Task) -> Result<(), GraphError> {
        debug!(task_id = %task.task_id, deps = ?task.dependencies, "TaskGraph::add_task: called");
        if self.index.contains_key(&task.task_id) {
            return Err(GraphError::DuplicateTask(task.task_id));
        }
        self.index.insert(task.task_id.clone(), self.tasks.len());
        self.tasks.push(task);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn get(&self, task_id: &str) -> Option<&Task> {
        self.index.get(task_id).map(|&i| &self.tasks[i])
    }

    /// Tasks in insertion order
    pub fn tasks(&self) -> &[Task] {
        &self.tasks
    }

    /// Dependency edges as indices, dropping duplicates and unknown ids
    fn dependency_indices(&self) -> Vec<Vec<usize>> {
        self.tasks
            .iter()
            .map(|task| {
                let mut seen = HashSet::new();
                task.dependencies
                    .iter()
                    .filter_map(|dep| self.index.get(dep).copied())
                    .filter(|i| seen.insert(*i))
                    .collect()
            })
            .collect()
    }

    /// Reverse edges: for each task, the tasks that depend on it
    pub(crate) fn dependents(&self) -> HashMap<String, Vec<String>> {
        let mut dependents: HashMap<String, Vec<String>> = HashMap::new();
        for (i, deps) in self.dependency_indices().into_iter().enumerate() {
            for dep in deps {
                dependents
                    .entry(self.tasks[dep].task_id.clone())
                    .or_default()
                    .push(self.tasks[i].task_id.clone());
            }
        }
        dependents
    }

    /// Check that every dependency exists, then that there are no cycles
    pub fn validate(&self) -> Result<(), GraphError> {
        debug!(tasks = self.tasks.len(), "TaskGraph::validate: called");
        for task in &self.tasks {
            for dep in &task.dependencies {
                if !self.index.contains_key(dep) {
                    warn!(task_id = %task.task_id, missing = %dep, "Missing dependency");
                    return Err(GraphError::MissingDependency {
                        task: task.task_id.clone(),
                        missing: dep.clone(),
                    });
                }
            }
        }
        if let Some(cycle) = self.detect_cycles() {
            warn!(?cycle, "Dependency cycle");
            return Err(GraphError::Cycle(cycle));
        }
        Ok(())
    }

    /// Find one dependency cycle, returned as a closed path (`[a, b, a]`)
    ///
    /// Iterative three-color DFS: a node is in progress while it is on the
    /// explicit stack, so reaching an in-progress node closes a cycle.
    pub fn detect_cycles(&self) -> Option<Vec<String>> {
        let adjacency = self.dependency_indices();
        let mut marks = vec![Mark::Unvisited; self.tasks.len()];

        for start in 0..self.tasks.len() {
            if marks[start] != Mark::Unvisited {
                continue;
            }
            marks[start] = Mark::InProgress;
            // (node, next edge to explore)
            let mut stack: Vec<(usize, usize)> = vec![(start, 0)];

            while let Some(frame) = stack.last_mut() {
                let node = frame.0;
                if frame.1 >= adjacency[node].len() {
                    marks[node] = Mark::Done;
                    stack.pop();
                    continue;
                }
                let next = adjacency[node][frame.1];
                frame.1 += 1;
                match marks[next] {
                    Mark::Unvisited => {
                        marks[next] = Mark::InProgress;
                        stack.push((next, 0));
                    }
                    Mark::InProgress => {
                        let pos = stack.iter().position(|(n, _)| *n == next).unwrap_or(0);
                        let mut cycle: Vec<String> =
                            stack[pos..].iter().map(|(n, _)| self.tasks[*n].task_id.clone()).collect();
                        cycle.push(self.tasks[next].task_id.clone());
                        debug!(?cycle, "TaskGraph::detect_cycles: found cycle");
                        return Some(cycle);
                    }
                    Mark::Done => {}
                }
            }
        }
        None
    }

    /// Every task id, each after all of its dependencies
    ///
    /// Kahn's algorithm over cached in-degrees; ties resolve in insertion
    /// order. Fails without ordering anything if the graph is invalid.
    pub fn topological_order(&self) -> Result<Vec<String>, GraphError> {
        debug!("TaskGraph::topological_order: called");
        self.validate()?;

        let adjacency = self.dependency_indices();
        let mut in_degree: Vec<usize> = adjacency.iter().map(Vec::len).collect();
        let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); self.tasks.len()];
        for (i, deps) in adjacency.iter().enumerate() {
            for &dep in deps {
                dependents[dep].push(i);
            }
        }

        let mut queue: VecDeque<usize> = (0..self.tasks.len()).filter(|&i| in_degree[i] == 0).collect();
        let mut order = Vec::with_capacity(self.tasks.len());
        while let Some(i) = queue.pop_front() {
            order.push(self.tasks[i].task_id.clone());
            for &dependent in &dependents[i] {
                in_degree[dependent] -= 1;
                if in_degree[dependent] == 0 {
                    queue.push_back(dependent);
                }
            }
        }
        Ok(order)
    }

    /// Task ids whose dependencies are all in `completed`, in insertion order
    ///
    /// Tasks already completed, running or finished are not ready.
    pub fn ready_tasks(&self, completed: &HashSet<String>) -> Vec<String> {
        self.tasks
            .iter()
            .filter(|t| !completed.contains(&t.task_id))
            .filter(|t| matches!(t.status, TaskStatus::Pending | TaskStatus::Ready))
            .filter(|t| t.dependencies.iter().all(|d| completed.contains(d)))
            .map(|t| t.task_id.clone())
            .collect()
    }

    /// Validated transition of one task's status
    pub fn transition(&mut self, task_id: &str, target: TaskStatus) -> Result<(), GraphError> {
        let i = *self
            .index
            .get(task_id)
            .ok_or_else(|| GraphError::UnknownTask(task_id.to_string()))?;
        let task = &mut self.tasks[i];
        task.status.check_transition(task_id, target)?;
        info!(task_id, from = %task.status, to = %target, "Task state transition");
        task.set_status(target);
        Ok(())
    }

    /// Validate and build the incremental frontier for execution
    pub fn frontier(&self) -> Result<Frontier, GraphError> {
        self.validate()?;
        Ok(Frontier::new(self))
    }

    /// Content hash of the plan: ids, kinds, dependencies and metadata, order-insensitive
    ///
    /// Two planning attempts that produced the same graph share a signature.
    pub fn signature(&self) -> String {
        let mut lines: Vec<String> = self
            .tasks
            .iter()
            .map(|t| {
                let mut deps = t.dependencies.clone();
                deps.sort();
                format!("{}\t{}\t{}\t{}", t.task_id, t.task_kind, deps.join(","), t.metadata)
            })
            .collect();
        lines.sort();
        let digest = format!("{:x}", Sha256::digest(lines.join("\n").as_bytes()));
        digest[..16].to_string()
    }

    /// Count tasks per status
    pub fn status_counts(&self) -> HashMap<TaskStatus, usize> {
        let mut counts = HashMap::new();
        for task in &self.tasks {
            *counts.entry(task.status).or_insert(0) += 1;
        }
        counts
    }
}
