//! Assembles one invocation: configuration, workspace, caches, hashing,
//! and the visitor that executes the task graph.

mod cache;
pub mod scope;
pub mod summary;
pub mod watch;

use std::{
    collections::HashSet,
    sync::Arc,
    time::Instant,
};

use camino::{Utf8Path, Utf8PathBuf};
use neex_cache::{RemoteCache, RemoteCacheConfig};
use neex_engine::EngineBuilder;
use neex_hash::{FileHasher, IncrementalTracker};
use neex_process::ProcessManager;
use neex_repository::{PackageGraph, PackageJson};
use tracing::{debug, warn};

pub use cache::{RunCache, TaskCache};
pub use summary::RunSummary;

use crate::{
    cli::Args,
    config::{self, Pipeline},
    events::EventSender,
    opts::RunOpts,
    task_graph::Visitor,
    task_hash::TaskHasher,
    Error,
};

pub(crate) fn remote_config_path(repo_root: &Utf8Path) -> Utf8PathBuf {
    repo_root.join(".neex/remote-cache.json")
}

/// Everything a command needs to execute tasks. Built once per
/// invocation; watch mode reuses it across rebuilds.
pub struct Run {
    repo_root: Utf8PathBuf,
    opts: RunOpts,
    pipeline: Pipeline,
    package_graph: Arc<PackageGraph>,
    run_cache: Arc<RunCache>,
    task_hasher: Arc<TaskHasher>,
    tracker: Arc<IncrementalTracker>,
    manager: ProcessManager,
    events: EventSender,
}

impl Run {
    pub fn build(repo_root: Utf8PathBuf, args: &Args, events: EventSender) -> Result<Self, Error> {
        let root_manifest = PackageJson::load_root(&repo_root.join("package.json"))?;
        let pipeline = Pipeline::load(&repo_root, &root_manifest)?;
        let package_graph =
            Arc::new(PackageGraph::builder(&repo_root, &root_manifest).build()?);
        let stats = package_graph.load_stats();
        debug!(
            "workspace: {} packages, manager {}, graph nodes {} cached / {} re-parsed",
            package_graph.len(),
            package_graph.manager(),
            stats.cached,
            stats.updated
        );

        let opts = RunOpts::resolve(args, pipeline.performance);

        let remote = RemoteCacheConfig::load(&remote_config_path(&repo_root))
            .and_then(|config| match RemoteCache::new(config) {
                Ok(remote) => Some(remote),
                Err(e) => {
                    warn!("remote cache disabled: {e}");
                    None
                }
            });
        let run_cache = Arc::new(RunCache::new(&repo_root, remote, opts.force));

        let tracker = Arc::new(IncrementalTracker::new(repo_root.join(".neex/state.json")));
        let task_hasher = Arc::new(TaskHasher::new(Arc::new(FileHasher::new(
            tracker.clone(),
        ))));

        Ok(Self {
            repo_root,
            opts,
            pipeline,
            package_graph,
            run_cache,
            task_hasher,
            tracker,
            manager: ProcessManager::new(),
            events,
        })
    }

    pub fn repo_root(&self) -> &Utf8Path {
        &self.repo_root
    }

    pub fn opts(&self) -> &RunOpts {
        &self.opts
    }

    pub fn package_graph(&self) -> &Arc<PackageGraph> {
        &self.package_graph
    }

    pub fn manager(&self) -> &ProcessManager {
        &self.manager
    }

    pub fn events_sender(&self) -> &EventSender {
        &self.events
    }

    /// Expand wildcard task patterns against every script name declared in
    /// the workspace.
    pub fn expand_tasks(&self, requested: &[String]) -> Vec<String> {
        let script_names = self
            .package_graph
            .packages()
            .flat_map(|package| package.scripts.keys().cloned())
            .collect::<HashSet<_>>();
        config::expand_task_patterns(requested, script_names.into_iter())
    }

    fn build_engine(
        &self,
        tasks: &[String],
        package_filter: Option<HashSet<String>>,
    ) -> Arc<neex_engine::Engine> {
        let mut builder = EngineBuilder::new(&self.package_graph, &self.pipeline.tasks);
        if let Some(filter) = package_filter {
            builder = builder.with_packages(filter);
        }
        Arc::new(builder.build(tasks))
    }

    /// Build the task graph for `tasks` (optionally narrowed to a package
    /// set) and execute it.
    pub async fn run_tasks(
        &self,
        tasks: &[String],
        package_filter: Option<HashSet<String>>,
        stop_on_error: bool,
    ) -> Result<RunSummary, Error> {
        let started = Instant::now();

        let engine = self.build_engine(tasks, package_filter);
        if engine.is_empty() {
            debug!("no packages declare {tasks:?}; nothing to do");
            return Ok(RunSummary::default());
        }

        let visitor = Visitor::new(
            self.package_graph.clone(),
            self.run_cache.clone(),
            self.task_hasher.clone(),
            self.manager.clone(),
            self.events.clone(),
            self.opts.clone(),
            stop_on_error,
        );
        let results = visitor.visit(engine).await?;

        Ok(RunSummary {
            results,
            total_ms: started.elapsed().as_millis() as u64,
        })
    }

    /// Write the incremental tracker state back to disk. Called once at
    /// the end of an invocation.
    pub fn flush_tracker(&self) {
        if let Err(e) = self.tracker.flush() {
            warn!("could not persist incremental state: {e}");
        }
    }

    /// Render the task graph as DOT without executing anything.
    pub fn print_graph(
        &self,
        tasks: &[String],
        package_filter: Option<HashSet<String>>,
        mut writer: impl std::io::Write,
    ) -> Result<(), Error> {
        let engine = self.build_engine(tasks, package_filter);
        engine.dot_graph(&mut writer)?;
        Ok(())
    }

    /// Resolve every task the way a real run would (command, fingerprint,
    /// cache state) but execute nothing.
    pub async fn dry_run(
        &self,
        tasks: &[String],
        package_filter: Option<HashSet<String>>,
    ) -> Result<Vec<DryRunTask>, Error> {
        let engine = self.build_engine(tasks, package_filter);
        let mut task_ids: Vec<_> = engine.task_ids().cloned().collect();
        task_ids.sort();

        let mut rows = Vec::with_capacity(task_ids.len());
        for task_id in task_ids {
            let Some(package) = self.package_graph.package_info(task_id.package()) else {
                continue;
            };
            let Some(command) = package.script(task_id.task()) else {
                continue;
            };
            let definition = engine.task_definition(&task_id).cloned().unwrap_or_default();
            let fingerprint = if definition.cacheable() {
                Some(
                    self.task_hasher
                        .fingerprint(&self.package_graph, &task_id, &definition, command)
                        .await,
                )
            } else {
                None
            };
            let cached = match &fingerprint {
                Some(fingerprint) => {
                    self.run_cache.artifact_cache().exists(fingerprint).await
                }
                None => false,
            };
            rows.push(DryRunTask {
                task_id,
                command: command.to_string(),
                fingerprint,
                cached,
            });
        }
        Ok(rows)
    }
}

/// One row of `--dry-run` output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DryRunTask {
    pub task_id: neex_engine::TaskId,
    pub command: String,
    pub fingerprint: Option<String>,
    pub cached: bool,
}
