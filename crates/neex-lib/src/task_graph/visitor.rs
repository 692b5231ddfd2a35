//! The visitor pumps tasks out of the engine's streaming walk, resolves
//! each one against the workspace (command, fingerprint, cache), and
//! spawns its execution.

use std::{
    collections::HashSet,
    sync::{Arc, Mutex},
};

use futures::{stream::FuturesUnordered, StreamExt};
use neex_engine::{Engine, ExecutionOptions, Message, TaskId};
use neex_process::ProcessManager;
use neex_repository::PackageGraph;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::exec::{ExecContext, TaintedTasks};
use crate::{
    events::EventSender,
    opts::RunOpts,
    run::{
        summary::{TaskOutcome, TaskResult},
        RunCache,
    },
    task_hash::TaskHasher,
    Error,
};

pub struct Visitor {
    package_graph: Arc<PackageGraph>,
    run_cache: Arc<RunCache>,
    task_hasher: Arc<TaskHasher>,
    manager: ProcessManager,
    events: EventSender,
    opts: RunOpts,
    stop_on_error: bool,
}

impl Visitor {
    pub fn new(
        package_graph: Arc<PackageGraph>,
        run_cache: Arc<RunCache>,
        task_hasher: Arc<TaskHasher>,
        manager: ProcessManager,
        events: EventSender,
        opts: RunOpts,
        stop_on_error: bool,
    ) -> Self {
        Self {
            package_graph,
            run_cache,
            task_hasher,
            manager,
            events,
            opts,
            stop_on_error,
        }
    }

    /// Execute every task in the engine. The returned list contains one
    /// result per task node; tasks the walk never reached come back as
    /// `Skipped`.
    pub async fn visit(&self, engine: Arc<Engine>) -> Result<Vec<TaskResult>, Error> {
        // A run containing persistent tasks must start them all and must
        // not let one failure bring the others down.
        let has_persistent = engine
            .task_ids()
            .any(|id| engine.task_definition(id).is_some_and(|def| def.persistent));
        let stop_on_error = self.stop_on_error && !has_persistent;
        let options = ExecutionOptions::new(has_persistent, self.opts.max_parallel);

        let (node_tx, mut node_rx) = mpsc::channel(self.opts.max_parallel.max(1));
        let engine_handle = tokio::spawn(engine.clone().execute(options, node_tx));

        let mut running: FuturesUnordered<tokio::task::JoinHandle<TaskResult>> =
            FuturesUnordered::new();
        let mut results = Vec::with_capacity(engine.task_count());
        // Tasks that failed or were cancelled; anything depending on one of
        // them is skipped instead of spawned.
        let tainted: TaintedTasks = Arc::new(Mutex::new(HashSet::new()));

        while let Some(message) = node_rx.recv().await {
            let Message { info, callback } = message;

            let has_tainted_dependency = {
                let tainted = tainted.lock().expect("tainted lock");
                engine
                    .dependencies(&info)
                    .iter()
                    .any(|dep| tainted.contains(*dep))
            };
            if has_tainted_dependency {
                debug!("skipping {info}: a dependency failed");
                // a skipped task taints its own dependents transitively
                tainted.lock().expect("tainted lock").insert(info.clone());
                results.push(TaskResult {
                    task_id: info,
                    outcome: TaskOutcome::Skipped,
                    server: None,
                });
                callback.send(Ok(())).ok();
                continue;
            }

            match self
                .exec_context(&engine, &info, stop_on_error, tainted.clone())
                .await
            {
                Some(exec) => {
                    running.push(tokio::spawn(exec.execute(callback)));
                }
                None => {
                    // nothing to run; unblock dependents
                    callback.send(Ok(())).ok();
                }
            }
        }

        engine_handle.await.expect("engine task panicked")?;
        while let Some(joined) = running.next().await {
            match joined {
                Ok(result) => results.push(result),
                Err(e) => return Err(Error::Runner(format!("task execution panicked: {e}"))),
            }
        }

        // Whatever the walk never emitted (failed dependencies, cycles,
        // cancellation) is reported as skipped.
        let finished: HashSet<&TaskId> = results.iter().map(|r| &r.task_id).collect();
        let skipped: Vec<TaskId> = engine
            .task_ids()
            .filter(|id| !finished.contains(id))
            .cloned()
            .collect();
        for task_id in skipped {
            debug!("{task_id} was never scheduled, reporting as skipped");
            results.push(TaskResult {
                task_id,
                outcome: TaskOutcome::Skipped,
                server: None,
            });
        }

        Ok(results)
    }

    /// Resolve one task into an execution context. `None` when the
    /// package or script has vanished since graph construction.
    async fn exec_context(
        &self,
        engine: &Engine,
        task_id: &TaskId,
        stop_on_error: bool,
        tainted: TaintedTasks,
    ) -> Option<ExecContext> {
        let Some(package) = self.package_graph.package_info(task_id.package()) else {
            warn!("package {} disappeared from the graph", task_id.package());
            return None;
        };
        let Some(command) = package.script(task_id.task()) else {
            warn!("{task_id} has no script anymore");
            return None;
        };
        let definition = engine.task_definition(task_id).cloned().unwrap_or_default();

        // Fingerprint only cacheable tasks; persistent and cache=false
        // tasks always execute.
        let fingerprint = if definition.cacheable() {
            Some(
                self.task_hasher
                    .fingerprint(&self.package_graph, task_id, &definition, command)
                    .await,
            )
        } else {
            None
        };

        let package_rel_dir = package
            .dir
            .strip_prefix(self.package_graph.repo_root())
            .unwrap_or(&package.dir);
        let outputs = definition
            .outputs
            .iter()
            .map(|output| package_rel_dir.join(output))
            .collect();

        Some(ExecContext {
            task_id: task_id.clone(),
            command: command.to_string(),
            cwd: package.dir.clone(),
            task_cache: self.run_cache.task_cache(fingerprint, outputs),
            manager: self.manager.clone(),
            events: self.events.clone(),
            color: self.opts.color,
            stop_on_error,
            tainted,
        })
    }
}
