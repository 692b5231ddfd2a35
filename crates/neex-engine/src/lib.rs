//! The task graph: one node per `(package, task)` pair, edges resolved from
//! the pipeline's `dependsOn` declarations, executed by a streaming walk
//! that starts every task the moment its last dependency settles.

mod builder;
mod dot;
mod execute;
mod task_id;

use std::collections::{HashMap, HashSet};

use petgraph::{graph::NodeIndex, Graph};

pub use builder::EngineBuilder;
pub use execute::{ExecuteError, ExecutionOptions, Message, StopExecution};
pub use task_id::TaskId;

/// Behavior of one task name, as the pipeline configures it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskDefinition {
    /// Sibling task names (`lint`) or upstream markers (`^build`).
    pub depends_on: Vec<String>,
    /// Globs narrowing the fingerprint's source set; `None` hashes the
    /// whole package tree.
    pub inputs: Option<Vec<String>>,
    /// Package-relative paths captured into the artifact.
    pub outputs: Vec<String>,
    pub cache: bool,
    /// Persistent tasks never cache and are expected to outlive the run.
    pub persistent: bool,
}

impl Default for TaskDefinition {
    fn default() -> Self {
        Self {
            depends_on: Vec::new(),
            inputs: None,
            outputs: Vec::new(),
            cache: true,
            persistent: false,
        }
    }
}

impl TaskDefinition {
    /// Caching applies only to tasks that both allow it and terminate.
    pub fn cacheable(&self) -> bool {
        self.cache && !self.persistent
    }
}

/// Marker for an engine still accepting nodes and edges.
#[derive(Debug, Default)]
pub struct Building;
/// Marker for a sealed engine ready to execute.
#[derive(Debug, Default)]
pub struct Built;

#[derive(Debug)]
pub struct Engine<S = Built> {
    marker: std::marker::PhantomData<S>,
    task_graph: Graph<TaskId, ()>,
    task_lookup: HashMap<TaskId, NodeIndex>,
    task_definitions: HashMap<TaskId, TaskDefinition>,
}

impl Engine<Building> {
    pub fn new() -> Self {
        Self {
            marker: std::marker::PhantomData,
            task_graph: Graph::new(),
            task_lookup: HashMap::new(),
            task_definitions: HashMap::new(),
        }
    }

    pub fn get_index(&mut self, task_id: &TaskId) -> NodeIndex {
        match self.task_lookup.get(task_id) {
            Some(ix) => *ix,
            None => {
                let ix = self.task_graph.add_node(task_id.clone());
                self.task_lookup.insert(task_id.clone(), ix);
                ix
            }
        }
    }

    /// Record that `task` must wait for `dependency`.
    pub fn add_dependency(&mut self, task: &TaskId, dependency: &TaskId) {
        let from = self.get_index(task);
        let to = self.get_index(dependency);
        self.task_graph.update_edge(from, to, ());
    }

    pub fn add_definition(&mut self, task_id: TaskId, definition: TaskDefinition) {
        self.task_definitions.insert(task_id, definition);
    }

    /// Seal the graph; no mutation after this point.
    pub fn seal(self) -> Engine<Built> {
        let Self {
            task_graph,
            task_lookup,
            task_definitions,
            ..
        } = self;
        Engine {
            marker: std::marker::PhantomData,
            task_graph,
            task_lookup,
            task_definitions,
        }
    }
}

impl Default for Engine<Building> {
    fn default() -> Self {
        Self::new()
    }
}

impl Engine<Built> {
    pub fn task_count(&self) -> usize {
        self.task_graph.node_count()
    }

    pub fn is_empty(&self) -> bool {
        self.task_graph.node_count() == 0
    }

    pub fn task_ids(&self) -> impl Iterator<Item = &TaskId> {
        self.task_graph.node_weights()
    }

    pub fn task_definition(&self, task_id: &TaskId) -> Option<&TaskDefinition> {
        self.task_definitions.get(task_id)
    }

    /// Direct dependencies of a task.
    pub fn dependencies(&self, task_id: &TaskId) -> HashSet<&TaskId> {
        self.neighbors(task_id, petgraph::Direction::Outgoing)
    }

    /// Tasks that directly wait on `task_id`.
    pub fn dependents(&self, task_id: &TaskId) -> HashSet<&TaskId> {
        self.neighbors(task_id, petgraph::Direction::Incoming)
    }

    /// Task ids on a dependency cycle, which the walk will never emit.
    pub fn cyclic_tasks(&self) -> Vec<&TaskId> {
        neex_graph_utils::cycles(&self.task_graph)
            .into_iter()
            .flatten()
            .map(|ix| &self.task_graph[ix])
            .collect()
    }

    fn neighbors(&self, task_id: &TaskId, direction: petgraph::Direction) -> HashSet<&TaskId> {
        let Some(ix) = self.task_lookup.get(task_id) else {
            return HashSet::new();
        };
        self.task_graph
            .neighbors_directed(*ix, direction)
            .map(|ix| &self.task_graph[ix])
            .collect()
    }
}
