use std::collections::{HashMap, HashSet, VecDeque};

use neex_repository::PackageGraph;
use tracing::warn;

use crate::{Building, Built, Engine, TaskDefinition, TaskId};

/// Marker prefix meaning "the same task in every internal dependency".
pub const UPSTREAM_MARKER: char = '^';

/// Resolves requested task names against the package graph and the
/// pipeline into a sealed task graph.
///
/// Dependencies pull tasks in even when they were not requested: running
/// `test` with `test.dependsOn = ["^build"]` schedules the upstream builds
/// it needs.
pub struct EngineBuilder<'a> {
    package_graph: &'a PackageGraph,
    pipeline: &'a HashMap<String, TaskDefinition>,
    package_filter: Option<HashSet<String>>,
}

impl<'a> EngineBuilder<'a> {
    pub fn new(
        package_graph: &'a PackageGraph,
        pipeline: &'a HashMap<String, TaskDefinition>,
    ) -> Self {
        Self {
            package_graph,
            pipeline,
            package_filter: None,
        }
    }

    /// Restrict the entry tasks to the given packages (affected and watch
    /// runs). Dependencies outside the filter are still scheduled.
    pub fn with_packages(mut self, packages: HashSet<String>) -> Self {
        self.package_filter = Some(packages);
        self
    }

    pub fn build(self, task_names: &[String]) -> Engine<Built> {
        let mut engine: Engine<Building> = Engine::new();
        let mut queue: VecDeque<TaskId> = VecDeque::new();
        let mut seen: HashSet<TaskId> = HashSet::new();

        for task_name in task_names {
            for package in self.package_graph.packages_with_task(task_name) {
                if let Some(filter) = &self.package_filter {
                    if !filter.contains(&package.name) {
                        continue;
                    }
                }
                let task_id = TaskId::new(package.name.clone(), task_name.clone());
                if seen.insert(task_id.clone()) {
                    queue.push_back(task_id);
                }
            }
        }

        while let Some(task_id) = queue.pop_front() {
            engine.get_index(&task_id);
            let definition = self
                .pipeline
                .get(task_id.task())
                .cloned()
                .unwrap_or_default();

            for depends_on in &definition.depends_on {
                match depends_on.strip_prefix(UPSTREAM_MARKER) {
                    // ^task: the same task in every internal dependency
                    // that declares it
                    Some(upstream_task) => {
                        for dep_name in self.package_graph.dependencies(task_id.package()) {
                            let declares = self
                                .package_graph
                                .package_info(dep_name)
                                .is_some_and(|dep| dep.script(upstream_task).is_some());
                            if !declares {
                                continue;
                            }
                            let dep_id = TaskId::new(dep_name.clone(), upstream_task);
                            engine.add_dependency(&task_id, &dep_id);
                            if seen.insert(dep_id.clone()) {
                                queue.push_back(dep_id);
                            }
                        }
                    }
                    // plain task: the sibling task in the same package,
                    // when the package declares it
                    None => {
                        let declares = self
                            .package_graph
                            .package_info(task_id.package())
                            .is_some_and(|pkg| pkg.script(depends_on).is_some());
                        if !declares {
                            continue;
                        }
                        let dep_id = TaskId::new(task_id.package(), depends_on.clone());
                        engine.add_dependency(&task_id, &dep_id);
                        if seen.insert(dep_id.clone()) {
                            queue.push_back(dep_id);
                        }
                    }
                }
            }

            engine.add_definition(task_id, definition);
        }

        let engine = engine.seal();
        for task in engine.cyclic_tasks() {
            warn!("task {task} is part of a dependency cycle and will be skipped");
        }
        engine
    }
}
